use std::rc::Rc;

use crate::config::BackendKind;
use crate::cpu::Cpu;

use super::code_cache::{Block, BlockId, CodeCache, CodeCacheStats, Lookup};
use super::{interpret_block, Backend, BlockExit, InvalidationQueue};

/// Upper bound on blocks run through links in one `execute` call, so the
/// dispatcher still gets control back regularly.
pub(super) const MAX_CHAINED_BLOCKS: u32 = 64;

/// Where the code at CS:EIP will come from.
pub(super) enum Prepared {
    Cached(BlockId),
    /// Decoded but not cacheable (MMIO or unmapped backing).
    Uncached(Block),
    /// Nothing decodable; a single step delivers the fault.
    Unavailable,
}

/// Looks up, revalidates or decodes the block at the current CS:EIP.
pub(super) fn prepare_block(cache: &mut CodeCache, cpu: &mut Cpu) -> Prepared {
    let inserted = match cache.lookup(cpu) {
        Lookup::Hit(id) => return Prepared::Cached(id),
        Lookup::Unmapped => return Prepared::Unavailable,
        Lookup::Stale(id) => match cache.recompile(cpu, id) {
            Some(inserted) => inserted,
            None => return Prepared::Unavailable,
        },
        Lookup::Miss(key) => match cache.decode_block(cpu, key) {
            Some(block) => cache.insert(&mut cpu.bus, block),
            None => return Prepared::Unavailable,
        },
    };
    match inserted {
        Ok(id) => Prepared::Cached(id),
        Err(block) => {
            cache.note_uncached();
            Prepared::Uncached(block)
        }
    }
}

pub(super) fn apply_invalidations(cache: &mut CodeCache, invalidations: &InvalidationQueue) {
    while let Some(page) = invalidations.pop() {
        cache.invalidate_page(page);
    }
}

/// Runs the decoded instructions of cached blocks.
#[derive(Debug)]
pub struct CachedInterpreter {
    cache: CodeCache,
}

impl CachedInterpreter {
    pub fn new(max_block_instructions: usize) -> Self {
        Self {
            cache: CodeCache::new(max_block_instructions),
        }
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    fn run_block(&mut self, cpu: &mut Cpu, id: BlockId, invalidations: &InvalidationQueue) -> BlockExit {
        let Some(instructions) = self.cache.get(id).map(|block| Rc::clone(&block.instructions)) else {
            return BlockExit::single(cpu.step_instruction());
        };
        self.cache.begin_block(id);
        let cache = &mut self.cache;
        // Bytes after a modified instruction may no longer be what was
        // decoded, so an invalidated block stops at the next boundary.
        let mut exit = interpret_block(cpu, &instructions, |_| {
            apply_invalidations(cache, invalidations);
            !cache.is_destroy_pending(id)
        });
        apply_invalidations(&mut self.cache, invalidations);
        if self.cache.end_block() {
            exit.completed = false;
        }
        exit
    }
}

impl Backend for CachedInterpreter {
    fn kind(&self) -> BackendKind {
        BackendKind::CachedInterpreter
    }

    fn execute(&mut self, cpu: &mut Cpu, invalidations: &InvalidationQueue) -> BlockExit {
        apply_invalidations(&mut self.cache, invalidations);

        let mut id = match prepare_block(&mut self.cache, cpu) {
            Prepared::Cached(id) => id,
            Prepared::Uncached(block) => return interpret_block(cpu, &block.instructions, |_| true),
            Prepared::Unavailable => return BlockExit::single(cpu.step_instruction()),
        };

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
    }

    fn stats(&self) -> CodeCacheStats {
        self.cache.stats()
    }
}
