//! Execution backends.
//!
//! A backend turns the instruction stream at CS:EIP into work on the [`Cpu`].
//! The plain [`Interpreter`] decodes every instruction each time it runs. The
//! [`CachedInterpreter`] and [`Recompiler`] keep translation blocks in a
//! [`CodeCache`] keyed by [`BlockKey`], and rely on the bus' code invalidation
//! callback (delivered through an [`InvalidationQueue`]) to drop blocks whose
//! source bytes change.

mod cached_interpreter;
mod code_cache;
mod interpreter;
mod recompiler;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::config::BackendKind;
use crate::cpu::Cpu;
use crate::decode::Instruction;
use crate::exceptions::ExecResult;
use crate::interp::InstructionOutcome;
use crate::state::{CpuState, Segment};

pub use cached_interpreter::CachedInterpreter;
pub use code_cache::{Block, BlockFlags, BlockId, CodeCache, CodeCacheStats, Lookup};
pub use interpreter::Interpreter;
pub use recompiler::{BlockSource, CodeBuffer, CodeGenerator, CodeHandle, CompileError, Recompiler};

/// Identifies a translation block: the physical address of its first byte
/// plus the execution-mode bits that change how those bytes decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey(u64);

impl BlockKey {
    const CS_32: u64 = 1 << 32;
    const CS_GRANULARITY: u64 = 1 << 33;
    const SS_32: u64 = 1 << 34;
    const V86: u64 = 1 << 35;

    pub fn new(eip_physical: u32, cs_32: bool, cs_granularity: bool, ss_32: bool, v86: bool) -> Self {
        let mut bits = u64::from(eip_physical);
        if cs_32 {
            bits |= Self::CS_32;
        }
        if cs_granularity {
            bits |= Self::CS_GRANULARITY;
        }
        if ss_32 {
            bits |= Self::SS_32;
        }
        if v86 {
            bits |= Self::V86;
        }
        Self(bits)
    }

    /// Key for code at `eip_physical` under the execution mode in `state`.
    pub fn for_state(state: &CpuState, eip_physical: u32) -> Self {
        let cs = &state.segment(Segment::CS).cache;
        Self::new(
            eip_physical,
            cs.big(),
            cs.granularity(),
            state.stack_32(),
            state.v86_mode(),
        )
    }

    pub fn eip_physical(self) -> u32 {
        self.0 as u32
    }

    pub fn cs_32(self) -> bool {
        self.0 & Self::CS_32 != 0
    }

    pub fn cs_granularity(self) -> bool {
        self.0 & Self::CS_GRANULARITY != 0
    }

    pub fn ss_32(self) -> bool {
        self.0 & Self::SS_32 != 0
    }

    pub fn v86(self) -> bool {
        self.0 & Self::V86 != 0
    }

    pub fn bits(self) -> u64 {
        self.0
    }
}

/// Key of the code at the current CS:EIP. Fails if EIP is outside the code
/// segment or its page is not executable.
pub(crate) fn current_block_key(cpu: &mut Cpu) -> ExecResult<BlockKey> {
    let physical = cpu.code_physical_address(cpu.state.eip)?;
    Ok(BlockKey::for_state(&cpu.state, physical))
}

/// Page-aligned physical addresses reported by the bus' code invalidation
/// callback, waiting to be applied to a code cache.
#[derive(Debug, Clone, Default)]
pub struct InvalidationQueue(Rc<RefCell<VecDeque<u64>>>);

impl InvalidationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, page: u64) {
        self.0.borrow_mut().push_back(page);
    }

    pub fn pop(&self) -> Option<u64> {
        self.0.borrow_mut().pop_front()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

/// What one call to [`Backend::execute`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockExit {
    /// Instructions that ran, including one that faulted.
    pub instructions: u32,
    /// Outcome of the last instruction that ran.
    pub outcome: InstructionOutcome,
    /// Every instruction of the block retired in order and control left
    /// through the block's exit.
    pub completed: bool,
}

impl BlockExit {
    pub(crate) fn single(outcome: InstructionOutcome) -> Self {
        Self {
            instructions: 1,
            outcome,
            completed: outcome == InstructionOutcome::Retired,
        }
    }

    /// Adds the exit of a block chained after this one.
    pub(crate) fn chain(&mut self, next: BlockExit) {
        self.instructions += next.instructions;
        self.outcome = next.outcome;
        self.completed = next.completed;
    }
}

pub trait Backend {
    fn kind(&self) -> BackendKind;

    /// Runs the next unit of work at CS:EIP: a single instruction or one or
    /// more translation blocks. Interrupts are not serviced here.
    fn execute(&mut self, cpu: &mut Cpu, invalidations: &InvalidationQueue) -> BlockExit;

    /// Drops every cached translation.
    fn flush(&mut self, cpu: &mut Cpu);

    fn stats(&self) -> CodeCacheStats {
        CodeCacheStats::default()
    }
}

/// Runs decoded instructions starting at the current CS:EIP without any
/// caching. Stops early when an instruction does not retire, when control
/// leaves the expected instruction sequence, or when `keep_going` returns
/// false after an instruction.
pub fn interpret_block(
    cpu: &mut Cpu,
    instructions: &[Instruction],
    mut keep_going: impl FnMut(&mut Cpu) -> bool,
) -> BlockExit {
    let code_32 = cpu.state.code_32();
    let cs_base = cpu.state.segment(Segment::CS).cache.base;
    let mut expected = cpu.state.eip;
    let mut exit = BlockExit {
        instructions: 0,
        outcome: InstructionOutcome::Retired,
        completed: false,
    };

    for (index, inst) in instructions.iter().enumerate() {
        if index > 0 && (cpu.state.eip != expected || cpu.state.segment(Segment::CS).cache.base != cs_base) {
            return exit;
        }
        let next = expected.wrapping_add(u32::from(inst.length));
        expected = if code_32 { next } else { next & 0xFFFF };

        exit.outcome = cpu.execute_instruction(inst);
        exit.instructions += 1;
        if exit.outcome != InstructionOutcome::Retired || cpu.is_halted() {
            return exit;
        }
        if !keep_going(cpu) {
            return exit;
        }
    }
    exit.completed = true;
    exit
}
