//! Backend that hands cached blocks to an external code generator.
//!
//! Generated code is bump-allocated from a fixed-size [`CodeBuffer`]. Space
//! is never reclaimed per block: when a block does not fit, it runs uncached
//! once, and the next dispatch flushes the whole cache and resets the buffer.

use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::BackendKind;
use crate::cpu::Cpu;
use crate::decode::{Instruction, Operation};

use super::cached_interpreter::{apply_invalidations, prepare_block, Prepared, MAX_CHAINED_BLOCKS};
use super::code_cache::{BlockId, CodeCache, CodeCacheStats};
use super::{interpret_block, Backend, BlockExit, BlockKey, InvalidationQueue};

/// Location of a block's generated code inside a [`CodeBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeHandle {
    offset: usize,
    len: usize,
}

impl CodeHandle {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("code buffer exhausted: {requested} bytes requested, {available} available")]
    OutOfSpace { requested: usize, available: usize },
    #[error("cannot generate code for {0:?}")]
    Unsupported(Operation),
}

#[derive(Debug)]
pub struct CodeBuffer {
    storage: Vec<u8>,
    capacity: usize,
}

impl CodeBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.storage.len()
    }

    pub fn free_space(&self) -> usize {
        self.capacity - self.storage.len()
    }

    /// Reserves `len` zeroed bytes.
    pub fn allocate(&mut self, len: usize) -> Result<CodeHandle, CompileError> {
        if len > self.free_space() {
            return Err(CompileError::OutOfSpace {
                requested: len,
                available: self.free_space(),
            });
        }
        let offset = self.storage.len();
        self.storage.resize(offset + len, 0);
        Ok(CodeHandle { offset, len })
    }

    pub fn code(&self, handle: CodeHandle) -> &[u8] {
        &self.storage[handle.offset..handle.offset + handle.len]
    }

    pub fn code_mut(&mut self, handle: CodeHandle) -> &mut [u8] {
        &mut self.storage[handle.offset..handle.offset + handle.len]
    }

    /// Discards all generated code. Handles issued before are invalid.
    pub fn reset(&mut self) {
        self.storage.clear();
    }
}

/// Guest code handed to a [`CodeGenerator`].
#[derive(Debug, Clone, Copy)]
pub struct BlockSource<'a> {
    pub key: BlockKey,
    pub entry_eip: u32,
    pub instructions: &'a [Instruction],
}

pub trait CodeGenerator {
    /// Upper bound on the bytes `compile` will allocate for `source`.
    fn estimate_size(&self, source: &BlockSource<'_>) -> usize {
        128 * source.instructions.len() + 64
    }

    fn compile(&mut self, source: &BlockSource<'_>, buffer: &mut CodeBuffer) -> Result<CodeHandle, CompileError>;

    /// Runs generated code. The CPU is positioned at the block's entry.
    fn execute(&mut self, code: &[u8], cpu: &mut Cpu) -> BlockExit;
}

pub struct Recompiler {
    cache: CodeCache,
    buffer: CodeBuffer,
    generator: Box<dyn CodeGenerator>,
    out_of_space: bool,
}

impl Recompiler {
    pub fn new(generator: Box<dyn CodeGenerator>, code_buffer_size: usize, max_block_instructions: usize) -> Self {
        Self {
            cache: CodeCache::new(max_block_instructions),
            buffer: CodeBuffer::new(code_buffer_size),
            generator,
            out_of_space: false,
        }
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn code_buffer(&self) -> &CodeBuffer {
        &self.buffer
    }

    /// Generates code for a freshly inserted block. On failure the block is
    /// dropped again and its instructions are returned for one uncached run.
    fn compile(&mut self, id: BlockId) -> Result<(), Option<Rc<[Instruction]>>> {
        let Some(block) = self.cache.get(id) else {
            return Err(None);
        };
        let instructions = Rc::clone(&block.instructions);
        let source = BlockSource {
            key: block.key,
            entry_eip: block.entry_eip,
            instructions: &instructions,
        };

        let estimate = self.generator.estimate_size(&source);
        let result = if estimate > self.buffer.free_space() {
            Err(CompileError::OutOfSpace {
                requested: estimate,
                available: self.buffer.free_space(),
            })
        } else {
            self.generator.compile(&source, &mut self.buffer)
        };

        match result {
            Ok(handle) => {
                self.cache.set_code(id, handle);
                Ok(())
            }
            Err(error) => {
                if matches!(error, CompileError::OutOfSpace { .. }) {
                    self.out_of_space = true;
                }
                debug!(%error, key = format_args!("{:#x}", source.key.bits()), "block compilation failed");
                self.cache.flush_block(id);
                self.cache.note_uncached();
                Err(Some(instructions))
            }
        }
    }

    fn run_block(&mut self, cpu: &mut Cpu, id: BlockId, invalidations: &InvalidationQueue) -> BlockExit {
        let Some(handle) = self.cache.get(id).and_then(|block| block.code) else {
            return BlockExit::single(cpu.step_instruction());
        };
        self.cache.begin_block(id);
        let mut exit = self.generator.execute(self.buffer.code(handle), cpu);
        apply_invalidations(&mut self.cache, invalidations);
        if self.cache.end_block() {
            exit.completed = false;
        }
        self.reset_buffer_if_unused();
        exit
    }

    fn reset_buffer_if_unused(&mut self) {
        if self.cache.is_empty() && self.buffer.used() > 0 {
            debug!(used = self.buffer.used(), "resetting code buffer");
            self.buffer.reset();
        }
    }
}

impl Backend for Recompiler {
    fn kind(&self) -> BackendKind {
        BackendKind::Recompiler
    }

    fn execute(&mut self, cpu: &mut Cpu, invalidations: &InvalidationQueue) -> BlockExit {
        apply_invalidations(&mut self.cache, invalidations);
        if std::mem::take(&mut self.out_of_space) {
            warn!(
                used = self.buffer.used(),
                capacity = self.buffer.capacity(),
                "out of code space, flushing all blocks"
            );
            self.flush(cpu);
        }

        let id = match prepare_block(&mut self.cache, cpu) {
            Prepared::Cached(id) => id,
            Prepared::Uncached(block) => return interpret_block(cpu, &block.instructions, |_| true),
            Prepared::Unavailable => return BlockExit::single(cpu.step_instruction()),
        };
        let needs_code = self.cache.get(id).is_some_and(|block| block.code.is_none());
        if needs_code {
            match self.compile(id) {
                Ok(()) => {}
                Err(Some(instructions)) => return interpret_block(cpu, &instructions, |_| true),
                Err(None) => return BlockExit::single(cpu.step_instruction()),
            }
        }

        let mut id = id;
        let mut exit = self.run_block(cpu, id, invalidations);
        let mut chained = 0;
        while exit.completed && chained < MAX_CHAINED_BLOCKS {
            let Some(next) = self.cache.next_linked(cpu, id) else {
                self.cache.link_to_current(cpu, id);
                break;
            };
            exit.chain(self.run_block(cpu, next, invalidations));
            id = next;
            chained += 1;
        }
        exit
    }

    fn flush(&mut self, cpu: &mut Cpu) {
        self.cache.flush(&mut cpu.bus);
        self.reset_buffer_if_unused();
    }

    fn stats(&self) -> CodeCacheStats {
        self.cache.stats()
    }
}
