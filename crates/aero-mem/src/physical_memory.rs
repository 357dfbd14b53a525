use thiserror::Error;

use crate::page::{PAGE_OFFSET_MASK, PAGE_SIZE};

const CHUNK_SIZE: usize = PAGE_SIZE as usize;

type Chunk = Box<[u8; CHUNK_SIZE]>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhysicalMemoryError {
    #[error("memory size 0x{size:x} is not a multiple of the 0x{chunk_size:x}-byte chunk size")]
    UnalignedSize { size: u64, chunk_size: usize },
    #[error("memory size 0x{size:x} exceeds the supported maximum 0x{max:x}")]
    TooLarge { size: u64, max: u64 },
    #[error("access out of bounds: addr=0x{addr:x} len={len} size=0x{size:x}")]
    OutOfBounds { addr: u64, len: usize, size: u64 },
}

/// Backing store for guest RAM and ROM images.
///
/// Storage is split into page-sized chunks that are allocated on first write, so
/// a large configured RAM size costs nothing until the guest touches it. Reads of
/// never-written chunks observe zeroes.
#[derive(Default)]
pub struct PhysicalMemory {
    chunks: Vec<Option<Chunk>>,
}

impl PhysicalMemory {
    /// Largest store the bus can address (4 GiB of RAM plus ROM images).
    pub const MAX_SIZE: u64 = 1 << 33;

    pub fn new(size: u64) -> Result<Self, PhysicalMemoryError> {
        let mut mem = Self::default();
        mem.grow(size)?;
        Ok(mem)
    }

    /// Appends `size` bytes of zeroed storage, returning the index of the first new chunk.
    pub fn grow(&mut self, size: u64) -> Result<u32, PhysicalMemoryError> {
        if (size & PAGE_OFFSET_MASK) != 0 {
            return Err(PhysicalMemoryError::UnalignedSize {
                size,
                chunk_size: CHUNK_SIZE,
            });
        }
        let new_len = self.len() + size;
        if new_len > Self::MAX_SIZE {
            return Err(PhysicalMemoryError::TooLarge {
                size: new_len,
                max: Self::MAX_SIZE,
            });
        }

        let first = self.chunks.len() as u32;
        let count = (size / PAGE_SIZE) as usize;
        self.chunks.resize_with(self.chunks.len() + count, || None);
        Ok(first)
    }

    pub fn len(&self) -> u64 {
        self.chunks.len() as u64 * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn allocated_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    /// Returns a chunk's contents, or `None` if it has never been written.
    #[inline]
    pub(crate) fn chunk(&self, index: u32) -> Option<&[u8; CHUNK_SIZE]> {
        self.chunks.get(index as usize)?.as_deref()
    }

    /// Returns a chunk for writing, allocating it on first use.
    #[inline]
    pub(crate) fn chunk_mut(&mut self, index: u32) -> &mut [u8; CHUNK_SIZE] {
        self.chunks[index as usize].get_or_insert_with(|| Box::new([0u8; CHUNK_SIZE]))
    }

    pub fn read_bytes(&self, addr: u64, dst: &mut [u8]) -> Result<(), PhysicalMemoryError> {
        self.check_range(addr, dst.len())?;
        let mut pos = 0usize;
        while pos < dst.len() {
            let cur = addr + pos as u64;
            let index = (cur / PAGE_SIZE) as u32;
            let offset = (cur & PAGE_OFFSET_MASK) as usize;
            let len = (CHUNK_SIZE - offset).min(dst.len() - pos);
            match self.chunk(index) {
                Some(chunk) => dst[pos..pos + len].copy_from_slice(&chunk[offset..offset + len]),
                None => dst[pos..pos + len].fill(0),
            }
            pos += len;
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, addr: u64, src: &[u8]) -> Result<(), PhysicalMemoryError> {
        self.check_range(addr, src.len())?;
        let mut pos = 0usize;
        while pos < src.len() {
            let cur = addr + pos as u64;
            let index = (cur / PAGE_SIZE) as u32;
            let offset = (cur & PAGE_OFFSET_MASK) as usize;
            let len = (CHUNK_SIZE - offset).min(src.len() - pos);
            self.chunk_mut(index)[offset..offset + len].copy_from_slice(&src[pos..pos + len]);
            pos += len;
        }
        Ok(())
    }

    fn check_range(&self, addr: u64, len: usize) -> Result<(), PhysicalMemoryError> {
        let size = self.len();
        match addr.checked_add(len as u64) {
            Some(end) if end <= size => Ok(()),
            _ => Err(PhysicalMemoryError::OutOfBounds { addr, len, size }),
        }
    }
}
