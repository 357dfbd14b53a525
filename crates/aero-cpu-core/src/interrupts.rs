//! Interrupt/exception delivery through the IVT (real mode) or IDT
//! (protected and virtual-8086 mode), privilege-changing stack switches,
//! double-fault promotion and IRET.
//!
//! Delivery itself is fallible: a fault raised while building the frame is
//! returned as [`Unwind::Fault`] and [`Cpu::raise_exception`] decides whether
//! it becomes the next exception, a double fault, or a triple fault.

use tracing::{debug, trace, warn};

use crate::cpu::Cpu;
use crate::descriptors::{DescriptorTable, Selector, SystemType};
use crate::exceptions::{fault_code, gp, CpuException, CpuExit, Exception, ExecResult, Unwind};
use crate::state::{gpr, Cr4, EFlags, Segment, SegmentCache};

/// External interrupt controller interface (PIC/APIC model of the embedder).
pub trait InterruptController {
    /// Acknowledges the highest priority pending request and returns its
    /// vector. Called only while the IRQ line is asserted and IF=1.
    fn acknowledge(&mut self) -> Option<u8>;
}

/// Interrupt-related state that is not architecturally visible.
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingEvents {
    pub irq_line: bool,
    pub nmi_pending: bool,
    /// Set from NMI delivery until the next IRET.
    pub nmi_blocked: bool,
    /// Set by STI (IF 0->1) and loads of SS: the next boundary skips the
    /// interrupt check.
    pub interrupt_shadow: bool,
    pub halted: bool,
    pub shutdown: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterruptSource {
    /// A CPU exception (fault, trap or abort).
    Exception,
    /// `INT n`, `INT3` or `INTO`: subject to the gate DPL check.
    Software,
    /// NMI or an interrupt acknowledged from the controller.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

impl ExceptionClass {
    fn of(exception: Exception) -> Self {
        match exception {
            Exception::PageFault => Self::PageFault,
            Exception::DoubleFault => Self::DoubleFault,
            Exception::DivideError
            | Exception::InvalidTss
            | Exception::SegmentNotPresent
            | Exception::StackFault
            | Exception::GeneralProtection => Self::Contributory,
            _ => Self::Benign,
        }
    }
}

fn should_double_fault(first: Exception, second: Exception) -> bool {
    use ExceptionClass as C;
    matches!(
        (C::of(first), C::of(second)),
        (C::Contributory, C::Contributory) | (C::PageFault, C::Contributory | C::PageFault)
    )
}

/// Builds a frame on a stack that may not be the current one yet. Nothing is
/// committed to SS/ESP until [`StackWriter::commit`].
pub(crate) struct StackWriter {
    selector: u16,
    cache: SegmentCache,
    sp: u32,
    fault_code: u32,
    supervisor: bool,
}

impl StackWriter {
    pub(crate) fn current(cpu: &Cpu) -> Self {
        let ss = cpu.state.segment(Segment::SS);
        Self {
            selector: ss.selector,
            cache: ss.cache,
            sp: cpu.state.stack_pointer(),
            fault_code: 0,
            supervisor: false,
        }
    }

    pub(crate) fn switched(selector: u16, cache: SegmentCache, sp: u32, cpl: u8) -> Self {
        Self {
            selector,
            cache,
            sp,
            fault_code: Selector(selector).error_code(),
            supervisor: cpl < 3,
        }
    }

    pub(crate) fn push(&mut self, cpu: &mut Cpu, value: u32, size: u32) -> ExecResult<()> {
        let mask = if self.cache.big() { u32::MAX } else { 0xFFFF };
        let sp = self.sp.wrapping_sub(size) & mask;
        if !self.cache.contains(sp, size) {
            return fault_code(Exception::StackFault, self.fault_code);
        }
        let linear = self.cache.base.wrapping_add(sp);
        if size == 2 {
            cpu.write_linear::<u16>(linear, value as u16, self.supervisor)?;
        } else {
            cpu.write_linear::<u32>(linear, value, self.supervisor)?;
        }
        self.sp = sp;
        Ok(())
    }

    pub(crate) fn commit(self, cpu: &mut Cpu) {
        let ss = cpu.state.segment_mut(Segment::SS);
        ss.selector = self.selector;
        ss.cache = self.cache;
        cpu.state.set_stack_pointer(self.sp);
    }
}

impl Cpu {
    /// Inner-privilege stack pointer for `cpl` from the current TSS.
    pub(crate) fn tss_stack(&mut self, cpl: u8) -> ExecResult<(u16, u32)> {
        let task = self.state.task;
        let is_32 = SystemType::from_bits(task.access).is_some_and(SystemType::is_32bit);
        let ts = Selector(task.selector).error_code();
        if is_32 {
            let offset = 4 + 8 * u32::from(cpl);
            if !task.contains(offset, 8) {
                return fault_code(Exception::InvalidTss, ts);
            }
            let esp = self.read_system::<u32>(task.base.wrapping_add(offset))?;
            let ss = self.read_system::<u16>(task.base.wrapping_add(offset + 4))?;
            Ok((ss, esp))
        } else {
            let offset = 2 + 4 * u32::from(cpl);
            if !task.contains(offset, 4) {
                return fault_code(Exception::InvalidTss, ts);
            }
            let sp = self.read_system::<u16>(task.base.wrapping_add(offset))?;
            let ss = self.read_system::<u16>(task.base.wrapping_add(offset + 2))?;
            Ok((ss, u32::from(sp)))
        }
    }

    /// Validates the stack segment read from the TSS for a switch to `cpl`.
    pub(crate) fn load_inner_stack(&mut self, selector: u16, cpl: u8) -> ExecResult<SegmentCache> {
        let sel = Selector(selector);
        if sel.is_null() {
            return fault_code(Exception::InvalidTss, 0);
        }
        let Some(descriptor) = self.read_descriptor_entry(sel.table(), sel.index())? else {
            return fault_code(Exception::InvalidTss, sel.error_code());
        };
        if sel.rpl() != cpl || descriptor.dpl() != cpl || !descriptor.is_writable_data() {
            return fault_code(Exception::InvalidTss, sel.error_code());
        }
        if !descriptor.present() {
            return fault_code(Exception::StackFault, sel.error_code());
        }
        self.mark_descriptor_accessed(sel, &descriptor)?;
        Ok(descriptor.with_accessed().to_segment_cache())
    }

    /// Validates the outer stack segment popped by RET far or IRET.
    pub(crate) fn load_outer_stack(&mut self, selector: u16, rpl: u8) -> ExecResult<SegmentCache> {
        let sel = Selector(selector);
        if sel.is_null() {
            return gp(0);
        }
        let descriptor = self.read_selector_descriptor(sel)?;
        if sel.rpl() != rpl || descriptor.dpl() != rpl || !descriptor.is_writable_data() {
            return gp(sel.error_code());
        }
        if !descriptor.present() {
            return fault_code(Exception::StackFault, sel.error_code());
        }
        self.mark_descriptor_accessed(sel, &descriptor)?;
        Ok(descriptor.with_accessed().to_segment_cache())
    }

    /// Vectors through the IVT or IDT. EIP must already hold the return
    /// address (the faulting instruction for faults, the next one for traps
    /// and interrupts).
    pub(crate) fn deliver_interrupt(
        &mut self,
        vector: u8,
        error_code: Option<u32>,
        source: InterruptSource,
    ) -> ExecResult<()> {
        trace!(vector, ?error_code, ?source, eip = self.state.eip, "delivering interrupt");
        if self.state.protected_mode() {
            self.deliver_protected(vector, error_code, source)
        } else {
            self.deliver_real(vector)
        }
    }

    fn deliver_real(&mut self, vector: u8) -> ExecResult<()> {
        let entry = u32::from(vector) * 4;
        if !self.state.idtr.contains(entry, 4) {
            return gp(0);
        }
        let base = self.state.idtr.base;
        let offset = self.read_system::<u16>(base.wrapping_add(entry))?;
        let segment = self.read_system::<u16>(base.wrapping_add(entry + 2))?;

        let flags = self.state.eflags_raw() as u16;
        let cs = self.state.selector(Segment::CS);
        let ip = self.state.eip as u16;
        self.push16(flags)?;
        self.push16(cs)?;
        self.push16(ip)?;

        self.state.eflags.remove(EFlags::IF | EFlags::TF | EFlags::AC | EFlags::RF);
        self.load_real_mode_cs(segment);
        self.state.eip = u32::from(offset);
        Ok(())
    }

    fn deliver_protected(&mut self, vector: u8, error_code: Option<u32>, source: InterruptSource) -> ExecResult<()> {
        let ext = u32::from(source != InterruptSource::Software);
        let idt_code = u32::from(vector) * 8 + 2 + ext;

        let Some(gate) = self.read_descriptor_entry(DescriptorTable::Interrupt, u16::from(vector))? else {
            return gp(idt_code);
        };
        let kind = match gate.system_type() {
            Some(
                kind @ (SystemType::InterruptGate16
                | SystemType::InterruptGate32
                | SystemType::TrapGate16
                | SystemType::TrapGate32),
            ) if !gate.is_segment() => kind,
            Some(SystemType::TaskGate) if !gate.is_segment() => {
                debug!(vector, "task gates are not supported");
                return gp(idt_code);
            }
            _ => return gp(idt_code),
        };

        let cpl = self.state.cpl;
        if source == InterruptSource::Software && gate.dpl() < cpl {
            return gp(idt_code);
        }
        if !gate.present() {
            return fault_code(Exception::SegmentNotPresent, idt_code);
        }

        let target = Selector(gate.gate_selector());
        if target.is_null() {
            return gp(ext);
        }
        let Some(code) = self.read_descriptor_entry(target.table(), target.index())? else {
            return gp(target.error_code() | ext);
        };
        if !code.is_code() || code.dpl() > cpl {
            return gp(target.error_code() | ext);
        }
        if !code.present() {
            return fault_code(Exception::SegmentNotPresent, target.error_code() | ext);
        }

        let v86 = self.state.v86_mode();
        let inner = !code.is_conforming_code() && code.dpl() < cpl;
        if v86 && (!inner || code.dpl() != 0) {
            return gp(target.error_code());
        }
        let new_cpl = if inner { code.dpl() } else { cpl };

        let gate_32 = kind.is_32bit();
        let size = if gate_32 { 4 } else { 2 };
        let offset = if gate_32 {
            gate.gate_offset()
        } else {
            gate.gate_offset() & 0xFFFF
        };
        if offset > code.limit() {
            return gp(0);
        }

        let flags = self.state.eflags_raw();
        let old_cs = u32::from(self.state.selector(Segment::CS));
        let old_eip = self.state.eip;

        let mut stack = if inner {
            let (ss, esp) = self.tss_stack(new_cpl)?;
            let cache = self.load_inner_stack(ss, new_cpl)?;
            let old_ss = u32::from(self.state.selector(Segment::SS));
            let old_esp = self.state.esp();
            let mut stack = StackWriter::switched(ss, cache, esp, new_cpl);
            if v86 {
                for seg in [Segment::GS, Segment::FS, Segment::DS, Segment::ES] {
                    let selector = u32::from(self.state.selector(seg));
                    stack.push(self, selector, size)?;
                }
            }
            stack.push(self, old_ss, size)?;
            stack.push(self, old_esp, size)?;
            stack
        } else {
            StackWriter::current(self)
        };
        stack.push(self, flags, size)?;
        stack.push(self, old_cs, size)?;
        stack.push(self, old_eip, size)?;
        if let Some(code) = error_code {
            stack.push(self, code, size)?;
        }

        self.install_code_segment(target.0, &code, new_cpl)?;
        stack.commit(self);
        if v86 {
            for seg in [Segment::ES, Segment::DS, Segment::FS, Segment::GS] {
                let reg = self.state.segment_mut(seg);
                reg.selector = 0;
                reg.cache = SegmentCache::unusable();
            }
        }

        let mut cleared = EFlags::TF | EFlags::NT | EFlags::RF | EFlags::VM;
        if matches!(kind, SystemType::InterruptGate16 | SystemType::InterruptGate32) {
            cleared |= EFlags::IF;
        }
        self.state.eflags.remove(cleared);
        self.state.eip = offset;
        Ok(())
    }

    /// Delivers an exception raised by the instruction at EIP, promoting to
    /// #DF when delivery itself faults and shutting down on a triple fault.
    pub(crate) fn raise_exception(&mut self, exception: CpuException) -> Result<(), CpuExit> {
        let esp = self.state.esp();
        let mut current = exception;
        loop {
            let error_code = current
                .exception
                .pushes_error_code()
                .then(|| current.error_code.unwrap_or(0));
            debug!(
                exception = ?current.exception,
                ?error_code,
                cs = self.state.selector(Segment::CS),
                eip = self.state.eip,
                "raising exception"
            );
            match self.deliver_interrupt(current.exception.vector(), error_code, InterruptSource::Exception) {
                Ok(()) | Err(Unwind::Abort) => return Ok(()),
                Err(Unwind::Fault(next)) => {
                    self.state.set_reg32(gpr::ESP, esp);
                    if current.exception == Exception::DoubleFault {
                        warn!(second = ?next.exception, "triple fault, entering shutdown");
                        self.events.shutdown = true;
                        return Err(CpuExit::TripleFault);
                    }
                    current = if should_double_fault(current.exception, next.exception) {
                        CpuException::with_code(Exception::DoubleFault, 0)
                    } else {
                        next
                    };
                }
            }
        }
    }

    fn deliver_external(&mut self, vector: u8) -> Result<(), CpuExit> {
        self.events.halted = false;
        let esp = self.state.esp();
        match self.deliver_interrupt(vector, None, InterruptSource::External) {
            Ok(()) | Err(Unwind::Abort) => Ok(()),
            Err(Unwind::Fault(exception)) => {
                self.state.set_reg32(gpr::ESP, esp);
                self.raise_exception(exception)
            }
        }
    }

    /// Checks for a deliverable NMI or maskable interrupt at an instruction
    /// boundary. Returns whether one was delivered.
    pub(crate) fn service_interrupts(&mut self) -> Result<bool, CpuExit> {
        if std::mem::take(&mut self.events.interrupt_shadow) {
            return Ok(false);
        }
        if self.events.nmi_pending && !self.events.nmi_blocked {
            self.events.nmi_pending = false;
            self.events.nmi_blocked = true;
            self.deliver_external(Exception::NonMaskableInterrupt.vector())?;
            return Ok(true);
        }
        if !self.events.irq_line || !self.state.flag(EFlags::IF) {
            return Ok(false);
        }
        let Some(vector) = self
            .interrupt_controller
            .as_mut()
            .and_then(|controller| controller.acknowledge())
        else {
            return Ok(false);
        };
        self.deliver_external(vector)?;
        Ok(true)
    }

    /// `INT n`, `INT3` and `INTO`. EIP points at the next instruction.
    pub(crate) fn software_interrupt(&mut self, vector: u8) -> ExecResult<()> {
        if self.state.v86_mode() && self.state.iopl() < 3 {
            return gp(0);
        }
        self.deliver_interrupt(vector, None, InterruptSource::Software)
    }

    /// ICEBP: a #DB trap without the gate DPL check.
    pub(crate) fn debug_trap(&mut self) -> ExecResult<()> {
        self.deliver_interrupt(Exception::Debug.vector(), None, InterruptSource::External)
    }

    /// IRET/IRETD. `size` is the operand size in bytes.
    pub(crate) fn iret(&mut self, size: u32) -> ExecResult<()> {
        if !self.state.protected_mode() {
            self.iret_real(size)?;
        } else if self.state.v86_mode() {
            self.iret_v86(size)?;
        } else {
            self.iret_protected(size)?;
        }
        self.events.nmi_blocked = false;
        Ok(())
    }

    fn iret_real(&mut self, size: u32) -> ExecResult<()> {
        let eip = self.peek_stack(0, size)?;
        let cs = self.peek_stack(size, size)? as u16;
        let flags = self.peek_stack(2 * size, size)?;
        if eip > 0xFFFF {
            return gp(0);
        }
        let sp = self.state.stack_pointer().wrapping_add(3 * size) & self.stack_mask();
        self.state.set_stack_pointer(sp);
        self.load_real_mode_cs(cs);
        self.state.eip = eip;

        let keep = if size == 2 {
            !0xFFFF
        } else {
            (EFlags::VM | EFlags::VIF | EFlags::VIP).bits()
        };
        let old = self.state.eflags_raw();
        self.state.set_eflags_raw((old & keep) | (flags & !keep));
        Ok(())
    }

    fn iret_v86(&mut self, size: u32) -> ExecResult<()> {
        let iopl = self.state.iopl();
        let vme = self.state.cr4.contains(Cr4::VME);
        if iopl < 3 && !(vme && size == 2) {
            return gp(0);
        }
        let eip = self.peek_stack(0, size)?;
        let cs = self.peek_stack(size, size)? as u16;
        let flags = self.peek_stack(2 * size, size)?;
        if eip > 0xFFFF {
            return gp(0);
        }

        let old = self.state.eflags_raw();
        let new_flags = if iopl == 3 {
            let mut keep = (EFlags::VM | EFlags::IOPL | EFlags::VIF | EFlags::VIP).bits();
            if size == 2 {
                keep |= !0xFFFF;
            }
            (old & keep) | (flags & !keep)
        } else {
            let popped = EFlags::from_bits_retain(flags);
            if popped.contains(EFlags::TF) || (popped.contains(EFlags::IF) && self.state.flag(EFlags::VIP)) {
                return gp(0);
            }
            let keep = !0xFFFF | (EFlags::IF | EFlags::IOPL).bits();
            let mut merged = EFlags::from_bits_retain((old & keep) | (flags & !keep));
            merged.set(EFlags::VIF, popped.contains(EFlags::IF));
            merged.bits()
        };

        let sp = self.state.stack_pointer().wrapping_add(3 * size) & self.stack_mask();
        self.state.set_stack_pointer(sp);
        self.load_real_mode_cs(cs);
        self.state.eip = eip;
        self.state.set_eflags_raw(new_flags);
        Ok(())
    }

    fn iret_protected(&mut self, size: u32) -> ExecResult<()> {
        if self.state.flag(EFlags::NT) {
            debug!(tr = self.state.task.selector, "nested task return is not supported");
            return fault_code(Exception::InvalidTss, Selector(self.state.task.selector).error_code());
        }

        let eip = self.peek_stack(0, size)?;
        let cs = self.peek_stack(size, size)? as u16;
        let flags = self.peek_stack(2 * size, size)?;
        let cpl = self.state.cpl;

        if size == 4 && flags & EFlags::VM.bits() != 0 && cpl == 0 {
            return self.iret_to_v86(eip, cs, flags);
        }

        let sel = Selector(cs);
        if sel.is_null() {
            return gp(0);
        }
        let descriptor = self.read_selector_descriptor(sel)?;
        let rpl = sel.rpl();
        if !descriptor.is_code() || rpl < cpl {
            return gp(sel.error_code());
        }
        if descriptor.is_conforming_code() {
            if descriptor.dpl() > rpl {
                return gp(sel.error_code());
            }
        } else if descriptor.dpl() != rpl {
            return gp(sel.error_code());
        }
        if !descriptor.present() {
            return fault_code(Exception::SegmentNotPresent, sel.error_code());
        }
        let eip = if size == 2 { eip & 0xFFFF } else { eip };
        if eip > descriptor.limit() {
            return gp(0);
        }

        // Flag writability depends on the privilege level before the return.
        let mut changeable = EFlags::STATUS | EFlags::TF | EFlags::DF | EFlags::NT | EFlags::AC | EFlags::ID;
        if cpl == 0 {
            changeable |= EFlags::IOPL;
            if size == 4 {
                changeable |= EFlags::VIF | EFlags::VIP;
            }
        }
        if cpl <= self.state.iopl() {
            changeable |= EFlags::IF;
        }
        let mut changeable = changeable.bits() | EFlags::RF.bits();
        if size == 2 {
            changeable &= 0xFFFF;
        }
        let old = self.state.eflags_raw();
        let new_flags = (old & !changeable) | (flags & changeable);

        if rpl == cpl {
            self.install_code_segment(cs, &descriptor, rpl)?;
            let sp = self.state.stack_pointer().wrapping_add(3 * size) & self.stack_mask();
            self.state.set_stack_pointer(sp);
        } else {
            let new_esp = self.peek_stack(3 * size, size)?;
            let new_ss = self.peek_stack(4 * size, size)? as u16;
            let ss_cache = self.load_outer_stack(new_ss, rpl)?;
            self.install_code_segment(cs, &descriptor, rpl)?;
            let ss = self.state.segment_mut(Segment::SS);
            ss.selector = new_ss;
            ss.cache = ss_cache;
            self.state.set_stack_pointer(new_esp);
            self.null_inaccessible_data_segments();
        }
        self.state.eip = eip;
        self.state.set_eflags_raw(new_flags);
        Ok(())
    }

    fn iret_to_v86(&mut self, eip: u32, cs: u16, flags: u32) -> ExecResult<()> {
        let mut frame = [0u32; 6];
        for (i, slot) in frame.iter_mut().enumerate() {
            *slot = self.peek_stack(12 + 4 * i as u32, 4)?;
        }
        let [esp, ss, es, ds, fs, gs] = frame;

        self.state.set_eflags_raw(flags);
        self.state.cpl = 3;
        self.load_real_mode_cs(cs);
        for (seg, selector) in [
            (Segment::SS, ss),
            (Segment::ES, es),
            (Segment::DS, ds),
            (Segment::FS, fs),
            (Segment::GS, gs),
        ] {
            self.load_segment(seg, selector as u16)?;
        }
        self.state.set_reg32(gpr::ESP, esp);
        self.state.eip = eip & 0xFFFF;
        debug!(cs, eip, "entering virtual-8086 mode");
        Ok(())
    }
}
