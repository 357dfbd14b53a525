//! 32-bit (non-PAE) page table walk plus a small direct-mapped TLB.
//!
//! Supports 4 KiB pages and 4 MiB pages (when `CR4.PSE=1` and `PDE.PS=1`).

use aero_mem::MemoryBus;

use crate::state::{Cr0, Cr4};

const PTE_P: u32 = 1 << 0;
const PTE_RW: u32 = 1 << 1;
const PTE_US: u32 = 1 << 2;
const PTE_A: u32 = 1 << 5;
const PTE_D: u32 = 1 << 6;
const PDE_PS: u32 = 1 << 7;

const CR3_PD_MASK: u32 = 0xFFFF_F000;
const ADDR_MASK_4K: u32 = 0xFFFF_F000;
const ADDR_MASK_4M: u32 = 0xFFC0_0000;
const OFFSET_MASK_4K: u32 = 0x0000_0FFF;
const OFFSET_MASK_4M: u32 = 0x003F_FFFF;

pub(crate) const PF_ERR_PRESENT: u32 = 1 << 0;
pub(crate) const PF_ERR_WRITE: u32 = 1 << 1;
pub(crate) const PF_ERR_USER: u32 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting linear address, loaded into CR2.
    pub linear: u32,
    pub error_code: u32,
}

impl PageFault {
    fn new(linear: u32, present: bool, access: AccessType, user: bool) -> Self {
        let mut error_code = 0;
        if present {
            error_code |= PF_ERR_PRESENT;
        }
        if access == AccessType::Write {
            error_code |= PF_ERR_WRITE;
        }
        if user {
            error_code |= PF_ERR_USER;
        }
        Self { linear, error_code }
    }
}

/// Result of a successful walk, with the permissions of the whole path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Translation {
    pub physical_page: u32,
    pub user: bool,
    pub writable: bool,
    pub dirty: bool,
}

fn check_access(
    linear: u32,
    access: AccessType,
    user: bool,
    wp: bool,
    entry_user: bool,
    entry_writable: bool,
) -> Result<(), PageFault> {
    if user && !entry_user {
        return Err(PageFault::new(linear, true, access, user));
    }
    if access == AccessType::Write && !entry_writable && (user || wp) {
        return Err(PageFault::new(linear, true, access, user));
    }
    Ok(())
}

/// Walks the page tables rooted at `cr3`, updating accessed/dirty bits on
/// success.
pub(crate) fn walk(
    bus: &mut MemoryBus,
    linear: u32,
    access: AccessType,
    user: bool,
    cr0: Cr0,
    cr3: u32,
    cr4: Cr4,
) -> Result<Translation, PageFault> {
    let is_write = access == AccessType::Write;
    let wp = cr0.contains(Cr0::WP);

    let pde_addr = u64::from((cr3 & CR3_PD_MASK) | ((linear >> 22) << 2));
    let pde = bus.read_u32(pde_addr);
    if pde & PTE_P == 0 {
        return Err(PageFault::new(linear, false, access, user));
    }

    let pde_rw = pde & PTE_RW != 0;
    let pde_us = pde & PTE_US != 0;

    if pde & PDE_PS != 0 && cr4.contains(Cr4::PSE) {
        check_access(linear, access, user, wp, pde_us, pde_rw)?;

        let mut new_pde = pde | PTE_A;
        if is_write {
            new_pde |= PTE_D;
        }
        if new_pde != pde {
            bus.write_u32(pde_addr, new_pde);
        }

        let physical = (pde & ADDR_MASK_4M) | (linear & OFFSET_MASK_4M);
        return Ok(Translation {
            physical_page: physical & ADDR_MASK_4K,
            user: pde_us,
            writable: pde_rw,
            dirty: new_pde & PTE_D != 0,
        });
    }

    let pte_addr = u64::from((pde & ADDR_MASK_4K) | (((linear >> 12) & 0x3FF) << 2));
    let pte = bus.read_u32(pte_addr);
    if pte & PTE_P == 0 {
        return Err(PageFault::new(linear, false, access, user));
    }

    let eff_us = pde_us && pte & PTE_US != 0;
    let eff_rw = pde_rw && pte & PTE_RW != 0;
    check_access(linear, access, user, wp, eff_us, eff_rw)?;

    if pde & PTE_A == 0 {
        bus.write_u32(pde_addr, pde | PTE_A);
    }
    let mut new_pte = pte | PTE_A;
    if is_write {
        new_pte |= PTE_D;
    }
    if new_pte != pte {
        bus.write_u32(pte_addr, new_pte);
    }

    Ok(Translation {
        physical_page: pte & ADDR_MASK_4K,
        user: eff_us,
        writable: eff_rw,
        dirty: new_pte & PTE_D != 0,
    })
}

const TLB_ENTRIES: usize = 64;

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    linear_page: u32,
    translation: Translation,
}

/// Direct-mapped translation cache indexed by linear page number.
#[derive(Debug, Clone)]
pub struct Tlb {
    entries: [Option<TlbEntry>; TLB_ENTRIES],
}

impl Default for Tlb {
    fn default() -> Self {
        Self {
            entries: [None; TLB_ENTRIES],
        }
    }
}

impl Tlb {
    fn slot(linear: u32) -> usize {
        ((linear >> 12) as usize) % TLB_ENTRIES
    }

    /// Returns the physical address for `linear` if a cached entry allows the
    /// access without another walk. Writes to clean pages always miss so the
    /// walk can set the dirty bit.
    pub(crate) fn lookup(&self, linear: u32, access: AccessType, user: bool, wp: bool) -> Option<u32> {
        let entry = self.entries[Self::slot(linear)]?;
        if entry.linear_page != linear & ADDR_MASK_4K {
            return None;
        }
        let t = entry.translation;
        if user && !t.user {
            return None;
        }
        if access == AccessType::Write && (!t.dirty || (!t.writable && (user || wp))) {
            return None;
        }
        Some(t.physical_page | (linear & OFFSET_MASK_4K))
    }

    pub(crate) fn insert(&mut self, linear: u32, translation: Translation) {
        self.entries[Self::slot(linear)] = Some(TlbEntry {
            linear_page: linear & ADDR_MASK_4K,
            translation,
        });
    }

    pub fn flush(&mut self) {
        self.entries = [None; TLB_ENTRIES];
    }

    pub fn flush_page(&mut self, linear: u32) {
        let slot = &mut self.entries[Self::slot(linear)];
        if slot.is_some_and(|e| e.linear_page == linear & ADDR_MASK_4K) {
            *slot = None;
        }
    }
}
