use aero_mem::MemoryBus;
use tracing::debug;

use crate::config::CpuModel;
use crate::interrupts::{InterruptController, PendingEvents};
use crate::paging::Tlb;
use crate::state::{CpuState, Segment};

/// The emulated processor: architectural state, the bus it drives and the
/// bookkeeping needed between instructions.
pub struct Cpu {
    pub state: CpuState,
    pub bus: MemoryBus,
    model: CpuModel,
    pub(crate) tlb: Tlb,
    pub(crate) events: PendingEvents,
    pub(crate) interrupt_controller: Option<Box<dyn InterruptController>>,
    pub(crate) cycles: u64,
    /// Added to `cycles` to form the time-stamp counter (WRMSR to the TSC).
    pub(crate) tsc_offset: u64,
    /// Set when cached translations can no longer be trusted (paging or
    /// protection mode changes). Consumed by the execution dispatcher.
    pub(crate) flush_requested: bool,
    /// EIP/ESP at the start of the current instruction, restored when it
    /// faults.
    pub(crate) current_eip: u32,
    pub(crate) current_esp: u32,
}

impl Cpu {
    pub fn new(model: CpuModel, bus: MemoryBus) -> Self {
        let state = CpuState::new(model.supported_flags());
        let eip = state.eip;
        let esp = state.esp();
        Self {
            state,
            bus,
            model,
            tlb: Tlb::default(),
            events: PendingEvents::default(),
            interrupt_controller: None,
            cycles: 0,
            tsc_offset: 0,
            flush_requested: false,
            current_eip: eip,
            current_esp: esp,
        }
    }

    /// Returns to the power-on state. Memory contents are left untouched.
    pub fn reset(&mut self) {
        debug!(model = ?self.model, "cpu reset");
        self.state = CpuState::new(self.model.supported_flags());
        self.tlb.flush();
        self.events = PendingEvents::default();
        self.flush_requested = true;
        self.current_eip = self.state.eip;
        self.current_esp = self.state.esp();
    }

    pub fn model(&self) -> CpuModel {
        self.model
    }

    pub fn state(&self) -> &CpuState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }

    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut MemoryBus {
        &mut self.bus
    }

    /// Approximate number of cycles executed since construction.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn time_stamp_counter(&self) -> u64 {
        self.cycles.wrapping_add(self.tsc_offset)
    }

    pub fn set_interrupt_controller(&mut self, controller: Box<dyn InterruptController>) {
        self.interrupt_controller = Some(controller);
    }

    /// Level of the maskable interrupt input. While asserted and IF=1, the CPU
    /// acknowledges a vector from the interrupt controller at the next
    /// instruction boundary.
    pub fn set_irq_line(&mut self, asserted: bool) {
        self.events.irq_line = asserted;
    }

    /// Latches a non-maskable interrupt (edge triggered).
    pub fn raise_nmi(&mut self) {
        self.events.nmi_pending = true;
    }

    pub fn is_halted(&self) -> bool {
        self.events.halted
    }

    /// True after a triple fault, until [`Cpu::reset`].
    pub fn is_shutdown(&self) -> bool {
        self.events.shutdown
    }

    /// Jumps to `selector:offset` in real mode. Convenient for loading boot
    /// code at a known address.
    pub fn set_real_mode_entry(&mut self, selector: u16, offset: u16) {
        let cs = self.state.segment_mut(Segment::CS);
        cs.selector = selector;
        cs.cache.base = u32::from(selector) << 4;
        self.state.eip = u32::from(offset);
        self.events.halted = false;
    }

    /// Whether an NMI or an unmasked interrupt request is waiting for the
    /// next instruction boundary.
    pub(crate) fn has_pending_event(&self) -> bool {
        (self.events.nmi_pending && !self.events.nmi_blocked)
            || (self.events.irq_line && self.state.flag(crate::state::EFlags::IF))
    }

    pub(crate) fn request_code_cache_flush(&mut self) {
        self.flush_requested = true;
    }

    pub(crate) fn take_flush_request(&mut self) -> bool {
        std::mem::take(&mut self.flush_requested)
    }

    /// Records the rollback point for the instruction about to execute.
    #[inline]
    pub(crate) fn begin_instruction(&mut self) {
        self.current_eip = self.state.eip;
        self.current_esp = self.state.esp();
    }

    /// Restores EIP/ESP of the faulting instruction.
    #[inline]
    pub(crate) fn rollback_instruction(&mut self) {
        self.state.eip = self.current_eip;
        self.state.set_reg32(crate::state::gpr::ESP, self.current_esp);
    }

    /// Points EIP back at the current instruction without unwinding it.
    #[inline]
    pub(crate) fn restart_instruction(&mut self) {
        self.state.eip = self.current_eip;
    }

    #[inline]
    pub(crate) fn add_cycles(&mut self, cycles: u64) {
        self.cycles = self.cycles.wrapping_add(cycles);
    }
}
