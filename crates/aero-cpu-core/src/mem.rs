//! Linear and segmented memory access on top of the physical bus.
//!
//! All checks (segment rights and limits, paging) complete before the first
//! byte reaches the bus, so a faulting access never leaves a partial write
//! behind.

use aero_mem::BusValue;
use tracing::trace;

use crate::cpu::Cpu;
use crate::exceptions::{fault_code, Exception, ExecResult};
use crate::paging::{walk, AccessType};
use crate::state::Segment;

const PAGE_SIZE: u32 = 0x1000;

impl Cpu {
    /// Translates a linear address. `supervisor` forces a CPL 0 access, as
    /// used for descriptor tables and the TSS.
    pub(crate) fn translate(&mut self, linear: u32, access: AccessType, supervisor: bool) -> ExecResult<u32> {
        if !self.state.paging() {
            return Ok(linear);
        }
        let user = !supervisor && self.state.cpl == 3;
        let wp = self.state.cr0.contains(crate::state::Cr0::WP);
        if let Some(physical) = self.tlb.lookup(linear, access, user, wp) {
            return Ok(physical);
        }

        match walk(
            &mut self.bus,
            linear,
            access,
            user,
            self.state.cr0,
            self.state.cr3,
            self.state.cr4,
        ) {
            Ok(translation) => {
                self.tlb.insert(linear, translation);
                Ok(translation.physical_page | (linear & (PAGE_SIZE - 1)))
            }
            Err(pf) => {
                trace!(linear = format_args!("{:#x}", pf.linear), code = pf.error_code, "page fault");
                self.state.cr2 = pf.linear;
                fault_code(Exception::PageFault, pf.error_code)
            }
        }
    }

    /// Physical addresses of the (at most two) pages touched by an access.
    fn translate_span(
        &mut self,
        linear: u32,
        size: usize,
        access: AccessType,
        supervisor: bool,
    ) -> ExecResult<(u64, Option<(usize, u64)>)> {
        let first = self.translate(linear, access, supervisor)?;
        if !self.state.paging() {
            return Ok((u64::from(first), None));
        }
        let in_page = (PAGE_SIZE - (linear & (PAGE_SIZE - 1))) as usize;
        if size <= in_page {
            return Ok((u64::from(first), None));
        }
        let second = self.translate(linear.wrapping_add(in_page as u32), access, supervisor)?;
        Ok((u64::from(first), Some((in_page, u64::from(second)))))
    }

    pub(crate) fn read_linear<T: BusValue>(
        &mut self,
        linear: u32,
        access: AccessType,
        supervisor: bool,
    ) -> ExecResult<T> {
        match self.translate_span(linear, T::SIZE, access, supervisor)? {
            (physical, None) => Ok(self.bus.read_memory(physical)),
            (first, Some((split, second))) => {
                let mut raw = 0u64;
                for i in 0..T::SIZE {
                    let address = if i < split {
                        first + i as u64
                    } else {
                        second + (i - split) as u64
                    };
                    raw |= u64::from(self.bus.read_u8(address)) << (i * 8);
                }
                Ok(T::from_u64(raw))
            }
        }
    }

    pub(crate) fn write_linear<T: BusValue>(&mut self, linear: u32, value: T, supervisor: bool) -> ExecResult<()> {
        match self.translate_span(linear, T::SIZE, AccessType::Write, supervisor)? {
            (physical, None) => self.bus.write_memory(physical, value),
            (first, Some((split, second))) => {
                let raw = value.to_u64();
                for i in 0..T::SIZE {
                    let address = if i < split {
                        first + i as u64
                    } else {
                        second + (i - split) as u64
                    };
                    self.bus.write_u8(address, (raw >> (i * 8)) as u8);
                }
            }
        }
        Ok(())
    }

    /// Supervisor read of a system structure (GDT, LDT, IDT, TSS).
    pub(crate) fn read_system<T: BusValue>(&mut self, linear: u32) -> ExecResult<T> {
        self.read_linear(linear, AccessType::Read, true)
    }

    pub(crate) fn write_system<T: BusValue>(&mut self, linear: u32, value: T) -> ExecResult<()> {
        self.write_linear(linear, value, true)
    }

    fn segment_fault<T>(seg: Segment) -> ExecResult<T> {
        let exception = if seg == Segment::SS {
            Exception::StackFault
        } else {
            Exception::GeneralProtection
        };
        fault_code(exception, 0)
    }

    /// Validates an access through `seg` and returns its linear address.
    pub(crate) fn segment_linear(&self, seg: Segment, offset: u32, size: u32, write: bool) -> ExecResult<u32> {
        let cache = &self.state.segment(seg).cache;
        if self.state.protected_mode() && !self.state.v86_mode() {
            let allowed = cache.present() && if write { cache.writable() } else { cache.readable() };
            if !allowed {
                trace!(?seg, offset, write, "segment rights violation");
                return Self::segment_fault(seg);
            }
        }
        if !cache.contains(offset, size) {
            trace!(?seg, offset, size, limit = cache.limit, "segment limit violation");
            return Self::segment_fault(seg);
        }
        Ok(cache.base.wrapping_add(offset))
    }

    pub(crate) fn read_mem<T: BusValue>(&mut self, seg: Segment, offset: u32) -> ExecResult<T> {
        let linear = self.segment_linear(seg, offset, T::SIZE as u32, false)?;
        self.read_linear(linear, AccessType::Read, false)
    }

    pub(crate) fn write_mem<T: BusValue>(&mut self, seg: Segment, offset: u32, value: T) -> ExecResult<()> {
        let linear = self.segment_linear(seg, offset, T::SIZE as u32, true)?;
        self.write_linear(linear, value, false)
    }

    /// Checks that a write of `size` bytes at `seg:offset` would succeed
    /// without performing it.
    pub(crate) fn probe_write(&mut self, seg: Segment, offset: u32, size: u32) -> ExecResult<()> {
        let linear = self.segment_linear(seg, offset, size, true)?;
        self.translate_span(linear, size as usize, AccessType::Write, false)
            .map(|_| ())
    }

    /// Reads `size` bytes (1, 2 or 4) zero-extended.
    pub(crate) fn read_mem_sized(&mut self, seg: Segment, offset: u32, size: u32) -> ExecResult<u32> {
        match size {
            1 => self.read_mem::<u8>(seg, offset).map(u32::from),
            2 => self.read_mem::<u16>(seg, offset).map(u32::from),
            _ => self.read_mem::<u32>(seg, offset),
        }
    }

    pub(crate) fn write_mem_sized(&mut self, seg: Segment, offset: u32, size: u32, value: u32) -> ExecResult<()> {
        match size {
            1 => self.write_mem::<u8>(seg, offset, value as u8),
            2 => self.write_mem::<u16>(seg, offset, value as u16),
            _ => self.write_mem::<u32>(seg, offset, value),
        }
    }

    /// Reads code bytes at CS:`offset`.
    pub(crate) fn fetch_code_u8(&mut self, offset: u32) -> ExecResult<u8> {
        let cs = &self.state.segment(Segment::CS).cache;
        if !cs.contains(offset, 1) {
            return fault_code(Exception::GeneralProtection, 0);
        }
        let linear = cs.base.wrapping_add(offset);
        self.read_linear(linear, AccessType::Execute, false)
    }

    /// Physical address of CS:`offset`, translated for execution.
    pub(crate) fn code_physical_address(&mut self, offset: u32) -> ExecResult<u32> {
        let cs = &self.state.segment(Segment::CS).cache;
        if !cs.contains(offset, 1) {
            return fault_code(Exception::GeneralProtection, 0);
        }
        let linear = cs.base.wrapping_add(offset);
        self.translate(linear, AccessType::Execute, false)
    }

    /// Offset mask of the stack pointer (SS.B selects SP or ESP).
    #[inline]
    pub(crate) fn stack_mask(&self) -> u32 {
        if self.state.stack_32() {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }

    /// Pushes `value` as `size` bytes (2 or 4).
    pub(crate) fn push(&mut self, value: u32, size: u32) -> ExecResult<()> {
        let sp = self.state.stack_pointer().wrapping_sub(size) & self.stack_mask();
        self.write_mem_sized(Segment::SS, sp, size, value)?;
        self.state.set_stack_pointer(sp);
        Ok(())
    }

    pub(crate) fn pop(&mut self, size: u32) -> ExecResult<u32> {
        let sp = self.state.stack_pointer();
        let value = self.read_mem_sized(Segment::SS, sp, size)?;
        self.state
            .set_stack_pointer(sp.wrapping_add(size) & self.stack_mask());
        Ok(value)
    }

    /// Reads the stack `offset` bytes above the stack pointer without popping.
    pub(crate) fn peek_stack(&mut self, offset: u32, size: u32) -> ExecResult<u32> {
        let sp = self.state.stack_pointer().wrapping_add(offset) & self.stack_mask();
        self.read_mem_sized(Segment::SS, sp, size)
    }

    pub(crate) fn push16(&mut self, value: u16) -> ExecResult<()> {
        self.push(u32::from(value), 2)
    }

    pub(crate) fn pop16(&mut self) -> ExecResult<u16> {
        self.pop(2).map(|v| v as u16)
    }
}
