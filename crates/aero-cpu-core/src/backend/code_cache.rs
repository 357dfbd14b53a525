//! Translation blocks and the bookkeeping around them.
//!
//! Blocks live in an arena addressed by [`BlockId`] (slot index plus a
//! generation counter), so links between blocks are weak: a link to a
//! destroyed block simply fails to resolve. The cache owns the only
//! physical-page → block index, which is how bus writes fan out to the blocks
//! they affect.
//!
//! A block that is destroyed while it is the one executing (self-modifying
//! code, or a flush requested from inside it) is only marked
//! [`BlockFlags::DESTROY_PENDING`]; [`CodeCache::end_block`] frees it once the
//! backend has returned from it.

use std::collections::HashMap;
use std::rc::Rc;

use aero_mem::{MemoryBus, PAGE_MASK, PAGE_SIZE};
use bitflags::bitflags;
use tracing::{debug, trace, warn};

use crate::cpu::Cpu;
use crate::decode::{decode, Instruction, OperandMode, Operation};
use crate::paging::AccessType;
use crate::state::Segment;

use super::recompiler::CodeHandle;
use super::{current_block_key, BlockKey};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u8 {
        /// The block has a single statically known exit and may be chained
        /// to the block at that address.
        const LINKABLE = 1 << 0;
        /// The last instruction extends into the following page.
        const CROSSES_PAGE = 1 << 1;
        /// A write hit one of the block's pages.
        const INVALIDATED = 1 << 2;
        /// Destroyed while executing; freed by [`CodeCache::end_block`].
        const DESTROY_PENDING = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub key: BlockKey,
    /// CS offset the block was decoded from.
    pub entry_eip: u32,
    pub instructions: Rc<[Instruction]>,
    /// Bytes of guest code covered by the block.
    pub code_length: u32,
    /// Hash of the guest bytes at decode time.
    pub code_hash: u64,
    /// Physical address of the bytes past the first page, for blocks that
    /// cross a page boundary.
    pub next_page: Option<u64>,
    /// CS offset control reaches when the block runs to completion, if it is
    /// known statically.
    pub exit_eip: Option<u32>,
    pub cycles: u32,
    pub flags: BlockFlags,
    /// Generated code, for backends that compile blocks.
    pub code: Option<CodeHandle>,
    successor: Option<BlockId>,
    predecessors: Vec<BlockId>,
}

impl Block {
    /// Physical pages holding the block's bytes.
    pub fn pages(&self) -> impl Iterator<Item = u64> {
        let first = u64::from(self.key.eip_physical()) & PAGE_MASK;
        std::iter::once(first).chain(self.next_page.map(|page| page & PAGE_MASK))
    }

    fn first_page_length(&self) -> usize {
        let offset = u64::from(self.key.eip_physical()) & !PAGE_MASK;
        (self.code_length as usize).min((PAGE_SIZE - offset) as usize)
    }

    /// Hash of the block's source bytes as they are in memory now.
    fn live_hash(&self, bus: &MemoryBus) -> u64 {
        hash_source(bus, self.key.eip_physical(), self.first_page_length(), self.code_length, self.next_page)
    }
}

fn hash_source(bus: &MemoryBus, start: u32, first_len: usize, total_len: u32, next_page: Option<u64>) -> u64 {
    let head = bus.code_hash(u64::from(start), first_len);
    match next_page {
        Some(page) => {
            let tail = bus.code_hash(page, total_len as usize - first_len);
            head.rotate_left(17) ^ tail
        }
        None => head,
    }
}

/// Counters describing what the cache has been doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeCacheStats {
    pub lookups: u64,
    pub hits: u64,
    pub compiled: u64,
    /// Blocks whose source changed and were decoded again.
    pub recompiled: u64,
    /// Blocks that could not be cached and ran through the uncached path.
    pub uncached: u64,
    pub invalidated: u64,
    pub destroyed: u64,
    /// Destructions deferred because the block was executing.
    pub deferred: u64,
    pub flushes: u64,
    pub links: u64,
    pub chained: u64,
}

/// Result of looking up the block for the current CS:EIP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Hit(BlockId),
    /// A block exists under the key but its source bytes changed.
    Stale(BlockId),
    Miss(BlockKey),
    /// The current EIP cannot be translated (fetch would fault).
    Unmapped,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    block: Option<Block>,
}

#[derive(Debug)]
pub struct CodeCache {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_key: HashMap<BlockKey, BlockId>,
    by_page: HashMap<u64, Vec<BlockId>>,
    current: Option<BlockId>,
    live: usize,
    max_block_instructions: usize,
    stats: CodeCacheStats,
}

impl CodeCache {
    pub fn new(max_block_instructions: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_key: HashMap::new(),
            by_page: HashMap::new(),
            current: None,
            live: 0,
            max_block_instructions: max_block_instructions.max(1),
            stats: CodeCacheStats::default(),
        }
    }

    /// Number of blocks alive, including one waiting for deferred
    /// destruction.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn stats(&self) -> CodeCacheStats {
        self.stats
    }

    pub(crate) fn note_uncached(&mut self) {
        self.stats.uncached += 1;
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.block.as_ref())
    }

    fn get_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.block.as_mut())
    }

    pub fn contains_key(&self, key: BlockKey) -> bool {
        self.by_key.contains_key(&key)
    }

    pub fn blocks_in_page(&self, page: u64) -> usize {
        self.by_page.get(&(page & PAGE_MASK)).map_or(0, Vec::len)
    }

    /// Finds the block for the current CS:EIP and checks its source bytes
    /// against memory.
    pub fn lookup(&mut self, cpu: &mut Cpu) -> Lookup {
        self.stats.lookups += 1;
        let cr2 = cpu.state.cr2;
        let Ok(key) = current_block_key(cpu) else {
            cpu.state.cr2 = cr2;
            return Lookup::Unmapped;
        };
        let Some(&id) = self.by_key.get(&key) else {
            return Lookup::Miss(key);
        };
        let Some(block) = self.get(id) else {
            return Lookup::Miss(key);
        };

        if let Some(recorded) = block.next_page {
            match next_page_physical(cpu) {
                Some(page) if page == recorded => {}
                _ => return Lookup::Stale(id),
            }
        }
        if block.live_hash(&cpu.bus) != block.code_hash {
            trace!(key = format_args!("{:#x}", key.bits()), "block source changed");
            return Lookup::Stale(id);
        }
        self.stats.hits += 1;
        Lookup::Hit(id)
    }

    /// Decodes a block at the current CS:EIP. Returns `None` when not even the
    /// first instruction can be fetched.
    pub fn decode_block(&self, cpu: &mut Cpu, key: BlockKey) -> Option<Block> {
        let code_32 = cpu.state.code_32();
        let mask = if code_32 { u32::MAX } else { 0xFFFF };
        let cs_base = cpu.state.segment(Segment::CS).cache.base;
        let entry_eip = cpu.state.eip;
        let entry_page = cs_base.wrapping_add(entry_eip) & PAGE_MASK as u32;
        let model = cpu.model();
        // Fetches past the first page may fault; that only ends the block and
        // must not leave a stale CR2 behind.
        let cr2 = cpu.state.cr2;

        let mut instructions = Vec::new();
        let mut eip = entry_eip;
        let mut code_length = 0u32;
        let mut next_page = None;
        let mut flags = BlockFlags::empty();
        let mut exit_eip = None;

        while instructions.len() < self.max_block_instructions {
            let start = eip;
            let inst = match decode(
                |offset| cpu.fetch_code_u8(start.wrapping_add(offset) & mask),
                code_32,
                model,
            ) {
                Ok(inst) => inst,
                Err(_) => {
                    cpu.state.cr2 = cr2;
                    break;
                }
            };
            instructions.push(inst);
            code_length += u32::from(inst.length);
            eip = start.wrapping_add(u32::from(inst.length)) & mask;

            let last = cs_base.wrapping_add(start.wrapping_add(u32::from(inst.length) - 1) & mask);
            if last & PAGE_MASK as u32 != entry_page {
                flags |= BlockFlags::CROSSES_PAGE;
                next_page = cpu
                    .translate(last & PAGE_MASK as u32, AccessType::Execute, false)
                    .ok()
                    .map(u64::from);
                cpu.state.cr2 = cr2;
            }

            if inst.operation.ends_block() {
                if inst.operation == Operation::Jmp && inst.operand(0).mode == OperandMode::Relative {
                    flags |= BlockFlags::LINKABLE;
                    exit_eip = Some(eip.wrapping_add(inst.data.immediate) & inst.operand(0).size.mask());
                }
                break;
            }
            if flags.contains(BlockFlags::CROSSES_PAGE) || eip < start {
                break;
            }
        }

        if instructions.is_empty() || (flags.contains(BlockFlags::CROSSES_PAGE) && next_page.is_none()) {
            return None;
        }
        if exit_eip.is_none() && !instructions.last().is_some_and(|inst| inst.operation.ends_block()) {
            // Ran into the length limit or a page boundary: falls through.
            flags |= BlockFlags::LINKABLE;
            exit_eip = Some(eip);
        }

        let start = key.eip_physical();
        let first_len = (code_length as usize).min((PAGE_SIZE - (u64::from(start) & !PAGE_MASK)) as usize);
        let code_hash = hash_source(&cpu.bus, start, first_len, code_length, next_page);
        Some(Block {
            key,
            entry_eip,
            cycles: instructions.len() as u32,
            instructions: instructions.into(),
            code_length,
            code_hash,
            next_page,
            exit_eip,
            flags,
            code: None,
            successor: None,
            predecessors: Vec::new(),
        })
    }

    /// Adds a block and flags its pages as code on the bus. Blocks on pages
    /// the bus cannot track (MMIO, unmapped) are refused and returned.
    pub fn insert(&mut self, bus: &mut MemoryBus, block: Block) -> Result<BlockId, Block> {
        if !block.pages().all(|page| bus.is_ram_page(page)) {
            return Err(block);
        }
        for page in block.pages() {
            bus.mark_page_as_code(page);
        }

        let key = block.key;
        let pages: Vec<u64> = block.pages().collect();
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.block = Some(block);
                BlockId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    block: Some(block),
                });
                BlockId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        if let Some(previous) = self.by_key.insert(key, id) {
            debug!(key = format_args!("{:#x}", key.bits()), "replacing block with duplicate key");
            self.flush_block(previous);
        }
        for page in pages {
            self.by_page.entry(page).or_default().push(id);
        }
        self.live += 1;
        self.stats.compiled += 1;
        Ok(id)
    }

    /// Replaces a stale block with a freshly decoded one. The old slot is
    /// released first so the new block reuses it.
    pub fn recompile(&mut self, cpu: &mut Cpu, stale: BlockId) -> Option<Result<BlockId, Block>> {
        let key = self.get(stale)?.key;
        self.flush_block(stale);
        self.stats.recompiled += 1;
        let block = self.decode_block(cpu, key)?;
        Some(self.insert(&mut cpu.bus, block))
    }

    pub(crate) fn set_code(&mut self, id: BlockId, code: CodeHandle) {
        if let Some(block) = self.get_mut(id) {
            block.code = Some(code);
        }
    }

    /// Marks `id` as the executing block.
    pub fn begin_block(&mut self, id: BlockId) {
        self.current = Some(id);
    }

    /// Clears the executing block, destroying it if that was deferred. Returns
    /// whether it was destroyed.
    pub fn end_block(&mut self) -> bool {
        let Some(id) = self.current.take() else {
            return false;
        };
        let pending = self
            .get(id)
            .filter(|block| block.flags.contains(BlockFlags::DESTROY_PENDING))
            .map(|block| block.key);
        let Some(key) = pending else {
            return false;
        };
        warn!(key = format_args!("{:#x}", key.bits()), "current block invalidated while executing");
        self.destroy(id);
        true
    }

    pub fn current_block(&self) -> Option<BlockId> {
        self.current
    }

    pub fn is_destroy_pending(&self, id: BlockId) -> bool {
        self.get(id)
            .map_or(true, |block| block.flags.contains(BlockFlags::DESTROY_PENDING))
    }

    /// Invalidates every block with bytes in the page containing `page`.
    pub fn invalidate_page(&mut self, page: u64) {
        let Some(ids) = self.by_page.remove(&(page & PAGE_MASK)) else {
            return;
        };
        trace!(page = format_args!("{page:#x}"), blocks = ids.len(), "invalidating code page");
        for id in ids {
            if let Some(block) = self.get_mut(id) {
                block.flags |= BlockFlags::INVALIDATED;
                self.stats.invalidated += 1;
                self.flush_block(id);
            }
        }
    }

    /// Removes a block from the lookup structures and destroys it, or defers
    /// the destruction if it is executing.
    pub fn flush_block(&mut self, id: BlockId) {
        let Some(block) = self.get(id) else {
            return;
        };
        if block.flags.contains(BlockFlags::DESTROY_PENDING) {
            return;
        }
        let key = block.key;
        let pages: Vec<u64> = block.pages().collect();

        self.unlink(id);
        if self.by_key.get(&key) == Some(&id) {
            self.by_key.remove(&key);
        }
        for page in pages {
            if let Some(ids) = self.by_page.get_mut(&page) {
                ids.retain(|&other| other != id);
                if ids.is_empty() {
                    self.by_page.remove(&page);
                }
            }
        }

        if self.current == Some(id) {
            if let Some(block) = self.get_mut(id) {
                block.flags |= BlockFlags::DESTROY_PENDING;
            }
            self.stats.deferred += 1;
        } else {
            self.destroy(id);
        }
    }

    /// Drops every block. An executing block is kept until
    /// [`CodeCache::end_block`].
    pub fn flush(&mut self, bus: &mut MemoryBus) {
        debug!(blocks = self.live, "flushing code cache");
        let ids: Vec<BlockId> = self.by_key.values().copied().collect();
        for id in ids {
            self.flush_block(id);
        }
        bus.clear_cached_code_pages();
        self.stats.flushes += 1;
    }

    fn destroy(&mut self, id: BlockId) {
        let slot = &mut self.slots[id.index as usize];
        if slot.generation != id.generation || slot.block.take().is_none() {
            return;
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        self.stats.destroyed += 1;
    }

    /// Chains `from`'s static exit to `to`.
    pub fn link(&mut self, from: BlockId, to: BlockId) -> bool {
        let linkable = self
            .get(from)
            .is_some_and(|block| block.flags.contains(BlockFlags::LINKABLE) && block.successor.is_none());
        if !linkable || self.is_destroy_pending(from) || self.is_destroy_pending(to) {
            return false;
        }
        if let Some(block) = self.get_mut(from) {
            block.successor = Some(to);
        }
        if let Some(block) = self.get_mut(to) {
            block.predecessors.push(from);
        }
        self.stats.links += 1;
        true
    }

    /// Severs all links into and out of `id`.
    fn unlink(&mut self, id: BlockId) {
        let Some(block) = self.get_mut(id) else {
            return;
        };
        let successor = block.successor.take();
        let predecessors = std::mem::take(&mut block.predecessors);

        if let Some(next) = successor {
            if let Some(next) = self.get_mut(next) {
                next.predecessors.retain(|&other| other != id);
            }
        }
        for previous in predecessors {
            if let Some(previous) = self.get_mut(previous) {
                if previous.successor == Some(id) {
                    previous.successor = None;
                }
            }
        }
    }

    pub fn successor(&self, id: BlockId) -> Option<BlockId> {
        let next = self.get(id)?.successor?;
        self.get(next).map(|_| next)
    }

    pub fn predecessors(&self, id: BlockId) -> &[BlockId] {
        self.get(id).map_or(&[], |block| &block.predecessors)
    }

    /// Whether control, having run `id` to completion, may continue directly
    /// into its linked successor. Returns the successor if so.
    pub fn next_linked(&mut self, cpu: &mut Cpu, id: BlockId) -> Option<BlockId> {
        let block = self.get(id)?;
        if cpu.state.eip != block.exit_eip? {
            return None;
        }
        let next = self.successor(id)?;
        if cpu.has_pending_event() || cpu.is_halted() || cpu.flush_requested {
            return None;
        }
        let key = self.get(next)?.key;
        let cr2 = cpu.state.cr2;
        match current_block_key(cpu) {
            Ok(current) if current == key => {
                self.stats.chained += 1;
                Some(next)
            }
            Ok(_) => None,
            Err(_) => {
                cpu.state.cr2 = cr2;
                None
            }
        }
    }

    /// Links `from` to the block at the current CS:EIP after `from` ran to
    /// its static exit.
    pub fn link_to_current(&mut self, cpu: &mut Cpu, from: BlockId) -> bool {
        let Some(block) = self.get(from) else {
            return false;
        };
        if block.successor.is_some() || block.exit_eip != Some(cpu.state.eip) {
            return false;
        }
        let cr2 = cpu.state.cr2;
        let Ok(key) = current_block_key(cpu) else {
            cpu.state.cr2 = cr2;
            return false;
        };
        match self.find(key) {
            Some(to) => self.link(from, to),
            None => false,
        }
    }

    /// Block registered under `key`, if any.
    pub fn find(&self, key: BlockKey) -> Option<BlockId> {
        self.by_key.get(&key).copied()
    }
}

/// Physical address of the page after the one holding the current CS:EIP.
fn next_page_physical(cpu: &mut Cpu) -> Option<u64> {
    let cs_base = cpu.state.segment(Segment::CS).cache.base;
    let linear = cs_base.wrapping_add(cpu.state.eip);
    let next = (linear & PAGE_MASK as u32).wrapping_add(PAGE_SIZE as u32);
    let cr2 = cpu.state.cr2;
    let physical = cpu.translate(next, AccessType::Execute, false).ok();
    cpu.state.cr2 = cr2;
    physical.map(u64::from)
}
