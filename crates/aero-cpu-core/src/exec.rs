//! The execution loop around a [`Cpu`] and its backend.
//!
//! Each [`ExecDispatcher::step`] is one dispatch boundary: pending code cache
//! flushes are applied, NMIs and maskable interrupts are sampled, and then the
//! backend runs the next instruction or block.

use aero_mem::MemoryBus;
use tracing::{debug, info};

use crate::backend::{
    Backend, CachedInterpreter, CodeCacheStats, CodeGenerator, InvalidationQueue, Interpreter, Recompiler,
};
use crate::config::{BackendKind, CpuConfig, CpuConfigError};
use crate::cpu::Cpu;
use crate::exceptions::CpuExit;
use crate::interp::InstructionOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// An NMI or external interrupt was delivered instead of running code.
    InterruptDelivered,
    /// The CPU is halted and nothing woke it.
    Halted,
    Shutdown(CpuExit),
    Executed {
        instructions: u32,
        outcome: InstructionOutcome,
    },
}

/// Why [`ExecDispatcher::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The cycle budget was used up.
    BudgetExhausted,
    Halted,
    Shutdown(CpuExit),
}

pub struct ExecDispatcher {
    cpu: Cpu,
    backend: Box<dyn Backend>,
    invalidations: InvalidationQueue,
    config: CpuConfig,
}

impl ExecDispatcher {
    /// Builds a CPU on `bus` with the configured backend. The recompiler
    /// backend needs [`ExecDispatcher::with_code_generator`] instead.
    pub fn new(config: CpuConfig, bus: MemoryBus) -> Result<Self, CpuConfigError> {
        if config.backend == BackendKind::Recompiler {
            return Err(CpuConfigError::MissingCodeGenerator);
        }
        Self::build(config, bus, None)
    }

    pub fn with_code_generator(
        config: CpuConfig,
        bus: MemoryBus,
        generator: Box<dyn CodeGenerator>,
    ) -> Result<Self, CpuConfigError> {
        Self::build(config, bus, Some(generator))
    }

    fn build(
        config: CpuConfig,
        mut bus: MemoryBus,
        generator: Option<Box<dyn CodeGenerator>>,
    ) -> Result<Self, CpuConfigError> {
        config.validate()?;
        let invalidations = InvalidationQueue::new();
        let sink = invalidations.clone();
        bus.set_code_invalidation_callback(Box::new(move |page| sink.push(page)))
            .map_err(|_| CpuConfigError::BusAlreadyAttached)?;

        let backend = make_backend(&config, config.backend, generator)?;
        info!(model = ?config.model, backend = ?config.backend, "cpu created");
        Ok(Self {
            cpu: Cpu::new(config.model, bus),
            backend,
            invalidations,
            config,
        })
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Switches to the interpreter or cached interpreter backend. Cached
    /// translations of the previous backend are dropped.
    pub fn set_backend(&mut self, kind: BackendKind) -> Result<(), CpuConfigError> {
        let backend = make_backend(&self.config, kind, None)?;
        self.replace_backend(backend);
        Ok(())
    }

    pub fn set_code_generator(&mut self, generator: Box<dyn CodeGenerator>) {
        let backend = Box::new(Recompiler::new(
            generator,
            self.config.code_buffer_size,
            self.config.max_block_instructions,
        ));
        self.replace_backend(backend);
    }

    fn replace_backend(&mut self, backend: Box<dyn Backend>) {
        debug!(from = ?self.backend.kind(), to = ?backend.kind(), "switching backend");
        self.backend.flush(&mut self.cpu);
        self.invalidations.clear();
        self.backend = backend;
        self.config.backend = self.backend.kind();
    }

    /// Drops every cached translation.
    pub fn flush_code_cache(&mut self) {
        self.backend.flush(&mut self.cpu);
        self.invalidations.clear();
    }

    pub fn stats(&self) -> CodeCacheStats {
        self.backend.stats()
    }

    pub fn reset(&mut self) {
        self.cpu.reset();
    }

    pub fn step(&mut self) -> StepOutcome {
        if self.cpu.is_shutdown() {
            return StepOutcome::Shutdown(CpuExit::TripleFault);
        }
        if self.cpu.take_flush_request() {
            debug!("execution mode changed, flushing code cache");
            self.flush_code_cache();
        }
        match self.cpu.service_interrupts() {
            Ok(true) => return StepOutcome::InterruptDelivered,
            Ok(false) => {}
            Err(exit) => return StepOutcome::Shutdown(exit),
        }
        if self.cpu.is_halted() {
            self.cpu.add_cycles(1);
            return StepOutcome::Halted;
        }

        let exit = self.backend.execute(&mut self.cpu, &self.invalidations);
        match exit.outcome {
            InstructionOutcome::Shutdown(exit) => StepOutcome::Shutdown(exit),
            outcome => StepOutcome::Executed {
                instructions: exit.instructions,
                outcome,
            },
        }
    }

    /// Runs until at least `cycles` cycles have elapsed, the CPU halts with
    /// nothing to wake it, or it shuts down.
    pub fn run(&mut self, cycles: u64) -> RunExit {
        let target = self.cpu.cycles().saturating_add(cycles);
        while self.cpu.cycles() < target {
            match self.step() {
                StepOutcome::Halted => return RunExit::Halted,
                StepOutcome::Shutdown(exit) => return RunExit::Shutdown(exit),
                StepOutcome::InterruptDelivered | StepOutcome::Executed { .. } => {}
            }
        }
        RunExit::BudgetExhausted
    }
}

fn make_backend(
    config: &CpuConfig,
    kind: BackendKind,
    generator: Option<Box<dyn CodeGenerator>>,
) -> Result<Box<dyn Backend>, CpuConfigError> {
    Ok(match kind {
        BackendKind::Interpreter => Box::new(Interpreter::new()),
        BackendKind::CachedInterpreter => Box::new(CachedInterpreter::new(config.max_block_instructions)),
        BackendKind::Recompiler => {
            let generator = generator.ok_or(CpuConfigError::MissingCodeGenerator)?;
            Box::new(Recompiler::new(
                generator,
                config.code_buffer_size,
                config.max_block_instructions,
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use aero_mem::MemoryBusConfig;
    use pretty_assertions::assert_eq;

    use super::*;

    fn bus() -> MemoryBus {
        MemoryBus::new(MemoryBusConfig {
            address_bits: 32,
            ram_size: 0x10_0000,
        })
        .unwrap()
    }

    fn dispatcher(backend: BackendKind) -> ExecDispatcher {
        let config = CpuConfig {
            backend,
            ..CpuConfig::default()
        };
        let mut dispatcher = ExecDispatcher::new(config, bus()).unwrap();
        dispatcher.cpu_mut().set_real_mode_entry(0x0100, 0);
        dispatcher
    }

    #[test]
    fn recompiler_without_generator_is_rejected() {
        let config = CpuConfig {
            backend: BackendKind::Recompiler,
            ..CpuConfig::default()
        };
        assert_eq!(
            ExecDispatcher::new(config, bus()).err(),
            Some(CpuConfigError::MissingCodeGenerator)
        );
    }

    #[test]
    fn bus_with_a_callback_is_rejected() {
        let mut bus = bus();
        bus.set_code_invalidation_callback(Box::new(|_| {})).unwrap();
        assert_eq!(
            ExecDispatcher::new(CpuConfig::default(), bus).err(),
            Some(CpuConfigError::BusAlreadyAttached)
        );
    }

    #[test]
    fn backends_agree_on_results() {
        // mov cx, 10 ; l: add ax, cx ; loop l ; hlt
        let code = [0xB9, 0x0A, 0x00, 0x01, 0xC8, 0xE2, 0xFC, 0xF4];
        for kind in [BackendKind::Interpreter, BackendKind::CachedInterpreter] {
            let mut dispatcher = dispatcher(kind);
            dispatcher.cpu_mut().bus.write_bytes(0x1000, &code);
            assert_eq!(dispatcher.run(10_000), RunExit::Halted, "{kind:?}");
            assert_eq!(dispatcher.cpu().state.ax(), 55, "{kind:?}");
            assert_eq!(dispatcher.cpu().state.cx(), 0, "{kind:?}");
        }
    }

    #[test]
    fn mode_change_flushes_the_cache() {
        let mut dispatcher = dispatcher(BackendKind::CachedInterpreter);
        // nop ; jmp $
        dispatcher.cpu_mut().bus.write_bytes(0x1000, &[0x90, 0xEB, 0xFE]);
        dispatcher.step();
        assert_eq!(dispatcher.stats().compiled, 1);

        dispatcher.cpu_mut().request_code_cache_flush();
        dispatcher.step();
        assert_eq!(dispatcher.stats().flushes, 1);
        assert_eq!(dispatcher.stats().compiled, 2);
    }

    #[test]
    fn switching_backend_clears_code_pages() {
        let mut dispatcher = dispatcher(BackendKind::CachedInterpreter);
        dispatcher.cpu_mut().bus.write_bytes(0x1000, &[0x90, 0xF4]);
        dispatcher.step();
        assert!(dispatcher.cpu().bus.is_cached_code_page(0x1000));

        dispatcher.set_backend(BackendKind::Interpreter).unwrap();
        assert_eq!(dispatcher.backend_kind(), BackendKind::Interpreter);
        assert!(!dispatcher.cpu().bus.is_cached_code_page(0x1000));
        assert_eq!(
            dispatcher.set_backend(BackendKind::Recompiler),
            Err(CpuConfigError::MissingCodeGenerator)
        );
    }
}
