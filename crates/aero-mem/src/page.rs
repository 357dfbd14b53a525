use bitflags::bitflags;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;
pub const PAGE_MASK: u64 = !PAGE_OFFSET_MASK;

bitflags! {
    /// How accesses to a physical page are routed.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PageType: u8 {
        /// Reads are served from the page's RAM chunk.
        const READABLE_RAM = 1 << 0;
        /// Writes land in the page's RAM chunk.
        const WRITABLE_RAM = 1 << 1;
        /// Translated code references this page.
        const CACHED_CODE = 1 << 2;
    }
}

pub(crate) const NO_INDEX: u32 = u32::MAX;

/// Per-page routing record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PhysicalPage {
    pub ty: PageType,
    /// Index of the backing chunk in [`crate::PhysicalMemory`], or `NO_INDEX`.
    pub ram_chunk: u32,
    /// Index into the bus' MMIO region table, or `NO_INDEX`.
    pub mmio: u32,
}

impl Default for PhysicalPage {
    fn default() -> Self {
        Self {
            ty: PageType::empty(),
            ram_chunk: NO_INDEX,
            mmio: NO_INDEX,
        }
    }
}

impl PhysicalPage {
    #[inline]
    pub fn is_ram(&self) -> bool {
        self.ram_chunk != NO_INDEX
            && self
                .ty
                .intersects(PageType::READABLE_RAM | PageType::WRITABLE_RAM)
    }
}

#[inline]
pub(crate) fn page_number(address: u64) -> usize {
    (address >> PAGE_SHIFT) as usize
}

#[inline]
pub(crate) fn page_offset(address: u64) -> usize {
    (address & PAGE_OFFSET_MASK) as usize
}
