//! Segment and gate descriptor encodings.

use crate::state::{access, SegmentCache};

/// Which descriptor table an entry is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorTable {
    Global,
    Local,
    Interrupt,
}

/// A segment selector: index, table indicator and requested privilege level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selector(pub u16);

impl Selector {
    #[inline]
    pub fn index(self) -> u16 {
        self.0 >> 3
    }

    #[inline]
    pub fn rpl(self) -> u8 {
        (self.0 & 3) as u8
    }

    #[inline]
    pub fn table(self) -> DescriptorTable {
        if self.0 & 4 != 0 {
            DescriptorTable::Local
        } else {
            DescriptorTable::Global
        }
    }

    /// Null selectors (index 0 in the GDT, any RPL).
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 & !3 == 0
    }

    /// Error code pushed for faults caused by this selector.
    #[inline]
    pub fn error_code(self) -> u32 {
        u32::from(self.0 & !3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemType {
    AvailableTss16 = 1,
    Ldt = 2,
    BusyTss16 = 3,
    CallGate16 = 4,
    TaskGate = 5,
    InterruptGate16 = 6,
    TrapGate16 = 7,
    AvailableTss32 = 9,
    BusyTss32 = 11,
    CallGate32 = 12,
    InterruptGate32 = 14,
    TrapGate32 = 15,
}

impl SystemType {
    pub fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits & 0xF {
            1 => Self::AvailableTss16,
            2 => Self::Ldt,
            3 => Self::BusyTss16,
            4 => Self::CallGate16,
            5 => Self::TaskGate,
            6 => Self::InterruptGate16,
            7 => Self::TrapGate16,
            9 => Self::AvailableTss32,
            11 => Self::BusyTss32,
            12 => Self::CallGate32,
            14 => Self::InterruptGate32,
            15 => Self::TrapGate32,
            _ => return None,
        })
    }

    /// Gates and TSSes whose type has bit 3 set use 32-bit offsets and stacks.
    pub fn is_32bit(self) -> bool {
        (self as u8) & 8 != 0
    }

    pub fn is_tss(self) -> bool {
        matches!(
            self,
            Self::AvailableTss16 | Self::BusyTss16 | Self::AvailableTss32 | Self::BusyTss32
        )
    }
}

/// An 8-byte descriptor as stored in the GDT, LDT or IDT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    pub raw: u64,
}

impl Descriptor {
    pub const fn new(raw: u64) -> Self {
        Self { raw }
    }

    pub fn base(&self) -> u32 {
        (((self.raw >> 16) & 0x00FF_FFFF) | ((self.raw >> 32) & 0xFF00_0000)) as u32
    }

    /// The 20-bit limit field as encoded.
    pub fn raw_limit(&self) -> u32 {
        ((self.raw & 0xFFFF) | ((self.raw >> 32) & 0x000F_0000)) as u32
    }

    /// Byte-granular limit after applying the granularity bit.
    pub fn limit(&self) -> u32 {
        let raw = self.raw_limit();
        if self.flags() & crate::state::seg_flags::GRANULARITY != 0 {
            (raw << 12) | 0xFFF
        } else {
            raw
        }
    }

    pub fn access(&self) -> u8 {
        (self.raw >> 40) as u8
    }

    pub fn flags(&self) -> u8 {
        ((self.raw >> 52) & 0xF) as u8
    }

    pub fn present(&self) -> bool {
        self.access() & access::PRESENT != 0
    }

    pub fn dpl(&self) -> u8 {
        (self.access() >> access::DPL_SHIFT) & 3
    }

    /// Code or data segment, as opposed to a system descriptor.
    pub fn is_segment(&self) -> bool {
        self.access() & access::S != 0
    }

    pub fn is_code(&self) -> bool {
        self.is_segment() && self.access() & access::EXECUTABLE != 0
    }

    pub fn is_data(&self) -> bool {
        self.is_segment() && self.access() & access::EXECUTABLE == 0
    }

    pub fn is_conforming_code(&self) -> bool {
        self.is_code() && self.access() & access::DC != 0
    }

    pub fn is_readable(&self) -> bool {
        self.is_data() || (self.is_code() && self.access() & access::RW != 0)
    }

    pub fn is_writable_data(&self) -> bool {
        self.is_data() && self.access() & access::RW != 0
    }

    pub fn system_type(&self) -> Option<SystemType> {
        if self.is_segment() {
            None
        } else {
            SystemType::from_bits(self.access())
        }
    }

    pub fn gate_selector(&self) -> u16 {
        (self.raw >> 16) as u16
    }

    pub fn gate_offset(&self) -> u32 {
        ((self.raw & 0xFFFF) | ((self.raw >> 32) & 0xFFFF_0000)) as u32
    }

    pub fn gate_parameter_count(&self) -> u8 {
        ((self.raw >> 32) & 0x1F) as u8
    }

    pub fn with_accessed(&self) -> Self {
        Self::new(self.raw | (u64::from(access::ACCESSED) << 40))
    }

    pub fn to_segment_cache(&self) -> SegmentCache {
        SegmentCache {
            base: self.base(),
            limit: self.limit(),
            access: self.access(),
            flags: self.flags(),
        }
    }
}
