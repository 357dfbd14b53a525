//! Descriptor table reads and segment register loads.

use tracing::trace;

use crate::cpu::Cpu;
use crate::descriptors::{Descriptor, DescriptorTable, Selector};
use crate::exceptions::{fault_code, gp, Exception, ExecResult};
use crate::state::{SegmentCache, Segment};

impl Cpu {
    /// Reads entry `index` of `table`. Returns `None` when the entry lies
    /// outside the table limit (or the LDT is null); callers turn that into
    /// the appropriate fault.
    pub fn read_descriptor_entry(&mut self, table: DescriptorTable, index: u16) -> ExecResult<Option<Descriptor>> {
        let (base, limit) = match table {
            DescriptorTable::Global => (self.state.gdtr.base, u32::from(self.state.gdtr.limit)),
            DescriptorTable::Interrupt => (self.state.idtr.base, u32::from(self.state.idtr.limit)),
            DescriptorTable::Local => {
                if Selector(self.state.ldtr.selector).is_null() {
                    return Ok(None);
                }
                (self.state.ldtr.base, self.state.ldtr.limit)
            }
        };
        let offset = u32::from(index) * 8;
        if offset + 7 > limit {
            return Ok(None);
        }
        let raw = self.read_system::<u64>(base.wrapping_add(offset))?;
        Ok(Some(Descriptor::new(raw)))
    }

    pub(crate) fn descriptor_address(&self, selector: Selector) -> u32 {
        let base = match selector.table() {
            DescriptorTable::Local => self.state.ldtr.base,
            _ => self.state.gdtr.base,
        };
        base.wrapping_add(u32::from(selector.index()) * 8)
    }

    /// Reads the descriptor for a non-null selector, raising #GP(selector)
    /// when it is out of bounds.
    pub(crate) fn read_selector_descriptor(&mut self, selector: Selector) -> ExecResult<Descriptor> {
        match self.read_descriptor_entry(selector.table(), selector.index())? {
            Some(descriptor) => Ok(descriptor),
            None => {
                trace!(selector = selector.0, "descriptor outside table limit");
                gp(selector.error_code())
            }
        }
    }

    /// Like [`Cpu::read_selector_descriptor`] but reports out-of-bounds as
    /// `None`, for LAR/LSL/VERR/VERW which set ZF instead of faulting.
    pub(crate) fn try_read_selector_descriptor(&mut self, selector: Selector) -> ExecResult<Option<Descriptor>> {
        if selector.is_null() {
            return Ok(None);
        }
        self.read_descriptor_entry(selector.table(), selector.index())
    }

    /// Sets the accessed bit of a segment descriptor in memory.
    pub(crate) fn mark_descriptor_accessed(&mut self, selector: Selector, descriptor: &Descriptor) -> ExecResult<()> {
        if descriptor.access() & crate::state::access::ACCESSED != 0 {
            return Ok(());
        }
        let address = self.descriptor_address(selector).wrapping_add(5);
        self.write_system::<u8>(address, descriptor.with_accessed().access())
    }

    /// Loads a data or stack segment register (not CS) following the rules
    /// of the current mode.
    pub fn load_segment(&mut self, seg: Segment, selector: u16) -> ExecResult<()> {
        debug_assert_ne!(seg, Segment::CS);

        if !self.state.protected_mode() {
            let reg = self.state.segment_mut(seg);
            reg.selector = selector;
            reg.cache.base = u32::from(selector) << 4;
            return Ok(());
        }
        if self.state.v86_mode() {
            let reg = self.state.segment_mut(seg);
            reg.selector = selector;
            reg.cache = SegmentCache::real_mode(u32::from(selector) << 4, 3);
            return Ok(());
        }

        let sel = Selector(selector);
        let cpl = self.state.cpl;

        if sel.is_null() {
            if seg == Segment::SS {
                return gp(0);
            }
            let reg = self.state.segment_mut(seg);
            reg.selector = selector;
            reg.cache = SegmentCache::unusable();
            return Ok(());
        }

        let descriptor = self.read_selector_descriptor(sel)?;

        if seg == Segment::SS {
            if sel.rpl() != cpl || !descriptor.is_writable_data() || descriptor.dpl() != cpl {
                trace!(selector, "invalid stack segment");
                return gp(sel.error_code());
            }
            if !descriptor.present() {
                return fault_code(Exception::StackFault, sel.error_code());
            }
        } else {
            if !descriptor.is_readable() {
                return gp(sel.error_code());
            }
            if !descriptor.is_conforming_code() && sel.rpl().max(cpl) > descriptor.dpl() {
                trace!(selector, cpl, "data segment privilege check failed");
                return gp(sel.error_code());
            }
            if !descriptor.present() {
                return fault_code(Exception::SegmentNotPresent, sel.error_code());
            }
        }

        self.mark_descriptor_accessed(sel, &descriptor)?;
        let reg = self.state.segment_mut(seg);
        reg.selector = selector;
        reg.cache = descriptor.with_accessed().to_segment_cache();
        Ok(())
    }

    /// Installs a code segment that has already passed the privilege checks
    /// of the control transfer loading it, and updates CPL.
    pub(crate) fn install_code_segment(&mut self, selector: u16, descriptor: &Descriptor, cpl: u8) -> ExecResult<()> {
        let sel = Selector(selector);
        self.mark_descriptor_accessed(sel, descriptor)?;
        let cs = self.state.segment_mut(Segment::CS);
        cs.selector = (selector & !3) | u16::from(cpl);
        cs.cache = descriptor.with_accessed().to_segment_cache();
        self.state.cpl = cpl;
        Ok(())
    }

    /// Loads CS in real or virtual-8086 mode.
    pub(crate) fn load_real_mode_cs(&mut self, selector: u16) {
        let v86 = self.state.v86_mode();
        let cs = self.state.segment_mut(Segment::CS);
        cs.selector = selector;
        cs.cache.base = u32::from(selector) << 4;
        if v86 {
            cs.cache = SegmentCache::real_mode(u32::from(selector) << 4, 3);
        }
    }

    /// After a return to an outer privilege level, data segments the new CPL
    /// may not use are nulled.
    pub(crate) fn null_inaccessible_data_segments(&mut self) {
        let cpl = self.state.cpl;
        for seg in [Segment::ES, Segment::DS, Segment::FS, Segment::GS] {
            let reg = self.state.segment_mut(seg);
            let cache = reg.cache;
            let conforming = cache.conforming();
            if (cache.is_data() || !conforming) && cache.dpl() < cpl {
                reg.selector = 0;
                reg.cache = SegmentCache::unusable();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use aero_mem::{MemoryBus, MemoryBusConfig};

    use super::*;
    use crate::config::CpuModel;
    use crate::exceptions::{CpuException, Unwind};
    use crate::state::{Cr0, TableRegister};

    const GDT: u32 = 0x1000;

    fn protected_cpu() -> Cpu {
        let bus = MemoryBus::new(MemoryBusConfig {
            address_bits: 32,
            ram_size: 0x10_0000,
        })
        .unwrap();
        let mut cpu = Cpu::new(CpuModel::I486, bus);
        cpu.bus.write_u64(u64::from(GDT) + 8, 0x00CF_9A00_0000_FFFF); // code
        cpu.bus.write_u64(u64::from(GDT) + 16, 0x00CF_9200_0000_FFFF); // data
        cpu.bus.write_u64(u64::from(GDT) + 24, 0x00CF_F200_0000_FFFF); // data dpl3
        cpu.bus.write_u64(u64::from(GDT) + 32, 0x00CF_1200_0000_FFFF); // not present
        cpu.state.gdtr = TableRegister {
            base: GDT,
            limit: 39,
        };
        cpu.state.cr0 |= Cr0::PE;
        cpu
    }

    #[test]
    fn loads_data_segment_and_sets_accessed() {
        let mut cpu = protected_cpu();
        cpu.load_segment(Segment::DS, 0x10).unwrap();
        let ds = cpu.state.segment(Segment::DS);
        assert_eq!(ds.cache.limit, 0xFFFF_FFFF);
        assert!(ds.cache.big());
        assert_eq!(cpu.bus.read_u8(u64::from(GDT) + 16 + 5), 0x93);
    }

    #[test]
    fn null_selector_rules() {
        let mut cpu = protected_cpu();
        cpu.load_segment(Segment::ES, 0).unwrap();
        assert!(!cpu.state.segment(Segment::ES).cache.present());
        assert_eq!(
            cpu.load_segment(Segment::SS, 0),
            Err(Unwind::Fault(CpuException::with_code(Exception::GeneralProtection, 0)))
        );
    }

    #[test]
    fn stack_segment_must_match_cpl() {
        let mut cpu = protected_cpu();
        assert_eq!(
            cpu.load_segment(Segment::SS, 0x1B),
            Err(Unwind::Fault(CpuException::with_code(Exception::GeneralProtection, 0x18)))
        );
        cpu.load_segment(Segment::SS, 0x10).unwrap();
    }

    #[test]
    fn not_present_and_out_of_bounds() {
        let mut cpu = protected_cpu();
        assert_eq!(
            cpu.load_segment(Segment::DS, 0x20),
            Err(Unwind::Fault(CpuException::with_code(Exception::SegmentNotPresent, 0x20)))
        );
        assert_eq!(
            cpu.load_segment(Segment::DS, 0x28),
            Err(Unwind::Fault(CpuException::with_code(Exception::GeneralProtection, 0x28)))
        );
        assert_eq!(
            cpu.read_descriptor_entry(DescriptorTable::Local, 1),
            Ok(None)
        );
    }
}
