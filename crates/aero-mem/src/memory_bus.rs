use std::ops::RangeInclusive;

use thiserror::Error;
use tracing::{debug, trace};

use crate::io_port_bus::IoPortBus;
use crate::mmio::MmioHandler;
use crate::page::{page_number, page_offset, PageType, PhysicalPage, NO_INDEX, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use crate::physical_memory::{PhysicalMemory, PhysicalMemoryError};

/// Called with the page-aligned physical address of a page that carried cached
/// code and has just been modified or remapped.
pub type CodeInvalidationCallback = Box<dyn FnMut(u64)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBusConfig {
    /// Width of the physical address bus. Addresses are masked to this many bits
    /// before every access (20 for an 8086-style machine, 24 for a 286/386SX,
    /// 32 for everything newer).
    pub address_bits: u32,
    /// Bytes of RAM mapped at physical address zero.
    pub ram_size: u64,
}

impl Default for MemoryBusConfig {
    fn default() -> Self {
        Self {
            address_bits: 32,
            ram_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryBusError {
    #[error("unsupported physical address width {0} (expected 20..=32)")]
    InvalidAddressWidth(u32),
    #[error("0x{0:x} is not page aligned")]
    Unaligned(u64),
    #[error("range 0x{start:x}+0x{len:x} is outside the 0x{limit:x}-byte physical address space")]
    OutOfRange { start: u64, len: u64, limit: u64 },
    #[error("MMIO range 0x{start:x}..=0x{end:x} overlaps an existing MMIO region")]
    MmioOverlap { start: u64, end: u64 },
    #[error("invalid MMIO range 0x{start:x}..=0x{end:x}")]
    InvalidMmioRange { start: u64, end: u64 },
    #[error("a code invalidation callback is already registered")]
    CallbackAlreadyRegistered,
    #[error(transparent)]
    Memory(#[from] PhysicalMemoryError),
}

/// A value that can be moved across the bus in a single access.
pub trait BusValue: Copy {
    const SIZE: usize;
    const ALL_ONES: Self;

    fn from_le_slice(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut [u8]);
    fn from_u64(value: u64) -> Self;
    fn to_u64(self) -> u64;
    fn read_mmio(handler: &mut dyn MmioHandler, address: u64) -> Self;
    fn write_mmio(self, handler: &mut dyn MmioHandler, address: u64);
}

macro_rules! impl_bus_value {
    ($ty:ty, $read:ident, $write:ident) => {
        impl BusValue for $ty {
            const SIZE: usize = core::mem::size_of::<$ty>();
            const ALL_ONES: Self = <$ty>::MAX;

            #[inline]
            fn from_le_slice(bytes: &[u8]) -> Self {
                let mut buf = [0u8; core::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                <$ty>::from_le_bytes(buf)
            }

            #[inline]
            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn from_u64(value: u64) -> Self {
                value as $ty
            }

            #[inline]
            fn to_u64(self) -> u64 {
                self as u64
            }

            #[inline]
            fn read_mmio(handler: &mut dyn MmioHandler, address: u64) -> Self {
                handler.$read(address)
            }

            #[inline]
            fn write_mmio(self, handler: &mut dyn MmioHandler, address: u64) {
                handler.$write(address, self)
            }
        }
    };
}

impl_bus_value!(u8, read_u8, write_u8);
impl_bus_value!(u16, read_u16, write_u16);
impl_bus_value!(u32, read_u32, write_u32);
impl_bus_value!(u64, read_u64, write_u64);

struct MmioRegion {
    start: u64,
    end: u64,
    handler: Box<dyn MmioHandler>,
}

impl MmioRegion {
    #[inline]
    fn covers(&self, address: u64, size: usize) -> bool {
        address >= self.start && address + size as u64 - 1 <= self.end
    }
}

/// The guest physical address space.
///
/// Every physical page is routed to exactly one of: RAM (read and/or write), an
/// MMIO handler, or nothing. Accesses never fail; unmapped reads return all-ones
/// and unmapped writes are dropped. Faults are the CPU's business.
pub struct MemoryBus {
    address_mask: u64,
    pages: Vec<PhysicalPage>,
    memory: PhysicalMemory,
    mmio: Vec<MmioRegion>,
    io: IoPortBus,
    code_invalidation: Option<CodeInvalidationCallback>,
}

impl MemoryBus {
    pub fn new(config: MemoryBusConfig) -> Result<Self, MemoryBusError> {
        if !(20..=32).contains(&config.address_bits) {
            return Err(MemoryBusError::InvalidAddressWidth(config.address_bits));
        }
        let limit = 1u64 << config.address_bits;
        if config.ram_size & !PAGE_MASK != 0 {
            return Err(MemoryBusError::Unaligned(config.ram_size));
        }
        if config.ram_size > limit {
            return Err(MemoryBusError::OutOfRange {
                start: 0,
                len: config.ram_size,
                limit,
            });
        }

        let mut bus = Self {
            address_mask: limit - 1,
            pages: vec![PhysicalPage::default(); (limit >> PAGE_SHIFT) as usize],
            memory: PhysicalMemory::default(),
            mmio: Vec::new(),
            io: IoPortBus::new(),
            code_invalidation: None,
        };
        if config.ram_size != 0 {
            bus.map_ram(0, config.ram_size)?;
        }
        Ok(bus)
    }

    pub fn address_mask(&self) -> u64 {
        self.address_mask
    }

    pub fn address_space_size(&self) -> u64 {
        self.address_mask + 1
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Direct view of the backing store, bypassing routing and code tracking.
    pub fn ram(&self) -> &PhysicalMemory {
        &self.memory
    }

    /// Mutable view of the backing store. Writes through this view do not fire
    /// the code invalidation callback.
    pub fn ram_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.memory
    }

    pub fn io(&self) -> &IoPortBus {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut IoPortBus {
        &mut self.io
    }

    /// Registers the callback fired when a page holding cached code changes.
    /// Only one callback may be registered over the bus' lifetime.
    pub fn set_code_invalidation_callback(
        &mut self,
        callback: CodeInvalidationCallback,
    ) -> Result<(), MemoryBusError> {
        if self.code_invalidation.is_some() {
            return Err(MemoryBusError::CallbackAlreadyRegistered);
        }
        self.code_invalidation = Some(callback);
        Ok(())
    }

    fn check_page_range(&self, start: u64, len: u64) -> Result<(), MemoryBusError> {
        if start & !PAGE_MASK != 0 {
            return Err(MemoryBusError::Unaligned(start));
        }
        if len & !PAGE_MASK != 0 {
            return Err(MemoryBusError::Unaligned(len));
        }
        let limit = self.address_space_size();
        match start.checked_add(len) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(MemoryBusError::OutOfRange { start, len, limit }),
        }
    }

    /// Allocates `len` bytes of fresh, zeroed RAM and maps it read/write at `start`.
    pub fn map_ram(&mut self, start: u64, len: u64) -> Result<(), MemoryBusError> {
        self.check_page_range(start, len)?;
        let first_chunk = self.memory.grow(len)?;
        self.install_chunks(start, len, first_chunk, PageType::READABLE_RAM | PageType::WRITABLE_RAM);
        debug!(start = format_args!("{start:#x}"), len = format_args!("{len:#x}"), "mapped RAM");
        Ok(())
    }

    /// Maps a read-only image at `start`. The mapping is rounded up to whole
    /// pages; bytes past the end of the image read as 0xFF. Writes are dropped.
    pub fn map_rom(&mut self, start: u64, image: &[u8]) -> Result<(), MemoryBusError> {
        let len = (image.len() as u64 + PAGE_SIZE - 1) & PAGE_MASK;
        self.check_page_range(start, len)?;
        let first_chunk = self.memory.grow(len)?;
        let backing_start = u64::from(first_chunk) << PAGE_SHIFT;
        self.memory.write_bytes(backing_start, image)?;
        let padding = vec![0xFFu8; (len - image.len() as u64) as usize];
        self.memory
            .write_bytes(backing_start + image.len() as u64, &padding)?;
        self.install_chunks(start, len, first_chunk, PageType::READABLE_RAM);
        debug!(start = format_args!("{start:#x}"), len = image.len(), "mapped ROM");
        Ok(())
    }

    fn install_chunks(&mut self, start: u64, len: u64, first_chunk: u32, ty: PageType) {
        let first_page = page_number(start);
        for i in 0..(len >> PAGE_SHIFT) as usize {
            self.invalidate_if_cached(first_page + i);
            let page = &mut self.pages[first_page + i];
            page.ty = ty;
            page.ram_chunk = first_chunk + i as u32;
        }
    }

    /// Removes every mapping in `start..start + len`.
    pub fn unmap(&mut self, start: u64, len: u64) -> Result<(), MemoryBusError> {
        self.check_page_range(start, len)?;
        let first_page = page_number(start);
        for i in 0..(len >> PAGE_SHIFT) as usize {
            self.invalidate_if_cached(first_page + i);
            self.pages[first_page + i] = PhysicalPage::default();
        }
        Ok(())
    }

    /// Routes the inclusive physical range to `handler`.
    ///
    /// Pages touched by the range stop being served from RAM. Accesses that are
    /// not fully inside the range (including the parts of a partially covered
    /// page outside it) behave as unmapped.
    pub fn register_mmio(
        &mut self,
        range: RangeInclusive<u64>,
        handler: Box<dyn MmioHandler>,
    ) -> Result<(), MemoryBusError> {
        let (start, end) = (*range.start(), *range.end());
        if end < start || end > self.address_mask {
            return Err(MemoryBusError::InvalidMmioRange { start, end });
        }
        if self.mmio.iter().any(|r| start <= r.end && r.start <= end) {
            return Err(MemoryBusError::MmioOverlap { start, end });
        }

        let index = self.mmio.len() as u32;
        self.mmio.push(MmioRegion { start, end, handler });
        for page_index in page_number(start)..=page_number(end) {
            self.invalidate_if_cached(page_index);
            let page = &mut self.pages[page_index];
            page.ty = PageType::empty();
            page.ram_chunk = NO_INDEX;
            page.mmio = index;
        }
        debug!(
            start = format_args!("{start:#x}"),
            end = format_args!("{end:#x}"),
            "registered MMIO region"
        );
        Ok(())
    }

    pub fn page_type(&self, address: u64) -> PageType {
        self.pages[page_number(address & self.address_mask)].ty
    }

    pub fn is_ram_page(&self, address: u64) -> bool {
        self.pages[page_number(address & self.address_mask)].is_ram()
    }

    /// Flags the page containing `address` as holding cached code. Returns false
    /// (and does nothing) for pages that are not RAM, since writes to those cannot
    /// be tracked.
    pub fn mark_page_as_code(&mut self, address: u64) -> bool {
        let page = &mut self.pages[page_number(address & self.address_mask)];
        if !page.is_ram() {
            return false;
        }
        page.ty.insert(PageType::CACHED_CODE);
        true
    }

    pub fn unmark_page_as_code(&mut self, address: u64) {
        self.pages[page_number(address & self.address_mask)]
            .ty
            .remove(PageType::CACHED_CODE);
    }

    pub fn is_cached_code_page(&self, address: u64) -> bool {
        self.page_type(address).contains(PageType::CACHED_CODE)
    }

    pub fn clear_cached_code_pages(&mut self) {
        for page in &mut self.pages {
            page.ty.remove(PageType::CACHED_CODE);
        }
    }

    fn invalidate_if_cached(&mut self, page_index: usize) {
        if self.pages[page_index].ty.contains(PageType::CACHED_CODE) {
            self.invalidate_code_page(page_index);
        }
    }

    fn invalidate_code_page(&mut self, page_index: usize) {
        self.pages[page_index].ty.remove(PageType::CACHED_CODE);
        let address = (page_index as u64) << PAGE_SHIFT;
        trace!(page = format_args!("{address:#x}"), "cached code page modified");
        if let Some(callback) = self.code_invalidation.as_mut() {
            callback(address);
        }
    }

    /// Reads a byte without side effects: RAM pages return their contents,
    /// everything else reads as 0xFF. MMIO handlers are never invoked.
    pub fn peek_u8(&self, address: u64) -> u8 {
        let address = address & self.address_mask;
        let page = &self.pages[page_number(address)];
        if page.ty.contains(PageType::READABLE_RAM) && page.ram_chunk != NO_INDEX {
            return self
                .memory
                .chunk(page.ram_chunk)
                .map_or(0, |chunk| chunk[page_offset(address)]);
        }
        0xFF
    }

    /// 64-bit FNV-1a hash of `len` bytes starting at `address`, computed from
    /// side-effect free reads. Used to detect stale translations.
    pub fn code_hash(&self, address: u64, len: usize) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        (0..len as u64).fold(FNV_OFFSET, |hash, i| {
            (hash ^ u64::from(self.peek_u8(address.wrapping_add(i)))).wrapping_mul(FNV_PRIME)
        })
    }

    pub fn read_memory<T: BusValue>(&mut self, address: u64) -> T {
        let address = address & self.address_mask;
        let offset = page_offset(address);
        if offset + T::SIZE > PAGE_SIZE as usize {
            return self.read_split(address);
        }

        let page = self.pages[page_number(address)];
        if page.ty.contains(PageType::READABLE_RAM) && page.ram_chunk != NO_INDEX {
            return match self.memory.chunk(page.ram_chunk) {
                Some(chunk) => T::from_le_slice(&chunk[offset..offset + T::SIZE]),
                None => T::from_u64(0),
            };
        }

        if page.mmio != NO_INDEX {
            let region = &mut self.mmio[page.mmio as usize];
            if region.covers(address, T::SIZE) {
                return T::read_mmio(region.handler.as_mut(), address);
            }
        }

        trace!(address = format_args!("{address:#x}"), size = T::SIZE, "unmapped read");
        T::ALL_ONES
    }

    fn read_split<T: BusValue>(&mut self, address: u64) -> T {
        let value = (0..T::SIZE).fold(0u64, |acc, i| {
            let byte: u8 = self.read_memory(address + i as u64);
            acc | (u64::from(byte) << (i * 8))
        });
        T::from_u64(value)
    }

    pub fn write_memory<T: BusValue>(&mut self, address: u64, value: T) {
        let address = address & self.address_mask;
        let offset = page_offset(address);
        if offset + T::SIZE > PAGE_SIZE as usize {
            self.write_split(address, value);
            return;
        }

        let page_index = page_number(address);
        let page = self.pages[page_index];
        if page.ty.contains(PageType::WRITABLE_RAM) && page.ram_chunk != NO_INDEX {
            if page.ty.contains(PageType::CACHED_CODE) {
                let current = self
                    .memory
                    .chunk(page.ram_chunk)
                    .map_or(0, |chunk| T::from_le_slice(&chunk[offset..offset + T::SIZE]).to_u64());
                if current == value.to_u64() {
                    return;
                }
                self.invalidate_code_page(page_index);
            }
            value.write_le(&mut self.memory.chunk_mut(page.ram_chunk)[offset..offset + T::SIZE]);
            return;
        }

        if page.mmio != NO_INDEX {
            let region = &mut self.mmio[page.mmio as usize];
            if region.covers(address, T::SIZE) {
                value.write_mmio(region.handler.as_mut(), address);
                return;
            }
        }

        trace!(address = format_args!("{address:#x}"), size = T::SIZE, "dropped write");
    }

    fn write_split<T: BusValue>(&mut self, address: u64, value: T) {
        let raw = value.to_u64();
        for i in 0..T::SIZE {
            self.write_memory::<u8>(address + i as u64, (raw >> (i * 8)) as u8);
        }
    }

    pub fn read_u8(&mut self, address: u64) -> u8 {
        self.read_memory(address)
    }

    pub fn read_u16(&mut self, address: u64) -> u16 {
        self.read_memory(address)
    }

    pub fn read_u32(&mut self, address: u64) -> u32 {
        self.read_memory(address)
    }

    pub fn read_u64(&mut self, address: u64) -> u64 {
        self.read_memory(address)
    }

    pub fn write_u8(&mut self, address: u64, value: u8) {
        self.write_memory(address, value)
    }

    pub fn write_u16(&mut self, address: u64, value: u16) {
        self.write_memory(address, value)
    }

    pub fn write_u32(&mut self, address: u64, value: u32) {
        self.write_memory(address, value)
    }

    pub fn write_u64(&mut self, address: u64, value: u64) {
        self.write_memory(address, value)
    }

    pub fn read_bytes(&mut self, address: u64, dst: &mut [u8]) {
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = self.read_memory(address + i as u64);
        }
    }

    /// Bulk write routed exactly like individual byte writes, so cached-code
    /// pages are invalidated when their contents change.
    pub fn write_bytes(&mut self, address: u64, src: &[u8]) {
        for (i, byte) in src.iter().enumerate() {
            self.write_memory(address + i as u64, *byte);
        }
    }

    pub fn read_io_port_u8(&mut self, port: u16) -> u8 {
        self.io.read_u8(port)
    }

    pub fn read_io_port_u16(&mut self, port: u16) -> u16 {
        self.io.read_u16(port)
    }

    pub fn read_io_port_u32(&mut self, port: u16) -> u32 {
        self.io.read_u32(port)
    }

    pub fn write_io_port_u8(&mut self, port: u16, value: u8) {
        self.io.write_u8(port, value)
    }

    pub fn write_io_port_u16(&mut self, port: u16, value: u16) {
        self.io.write_u16(port, value)
    }

    pub fn write_io_port_u32(&mut self, port: u16, value: u32) {
        self.io.write_u32(port, value)
    }
}
