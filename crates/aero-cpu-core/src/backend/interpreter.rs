use crate::config::BackendKind;
use crate::cpu::Cpu;

use super::{Backend, BlockExit, InvalidationQueue};

/// Fetches, decodes and executes one instruction per call. Keeps no state, so
/// bus invalidations are simply discarded.
#[derive(Debug, Default)]
pub struct Interpreter;

impl Interpreter {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for Interpreter {
    fn kind(&self) -> BackendKind {
        BackendKind::Interpreter
    }

    fn execute(&mut self, cpu: &mut Cpu, invalidations: &InvalidationQueue) -> BlockExit {
        let exit = BlockExit::single(cpu.step_instruction());
        invalidations.clear();
        exit
    }

    fn flush(&mut self, cpu: &mut Cpu) {
        cpu.bus.clear_cached_code_pages();
    }
}
