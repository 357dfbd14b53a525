//! Architectural register state.
//!
//! General purpose registers are stored once as 32-bit values; the 16- and
//! 8-bit views are computed by the accessors, so a write through any width is
//! visible through every alias.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EFlags: u32 {
        const CF = 1 << 0;
        /// Reserved, always reads as 1.
        const FIXED = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const IOPL = 3 << 12;
        const NT = 1 << 14;
        const RF = 1 << 16;
        const VM = 1 << 17;
        const AC = 1 << 18;
        const VIF = 1 << 19;
        const VIP = 1 << 20;
        const ID = 1 << 21;
    }
}

impl EFlags {
    /// The six arithmetic status flags.
    pub const STATUS: EFlags = EFlags::CF
        .union(EFlags::PF)
        .union(EFlags::AF)
        .union(EFlags::ZF)
        .union(EFlags::SF)
        .union(EFlags::OF);

    pub const IOPL_SHIFT: u32 = 12;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Cr0: u32 {
        const PE = 1 << 0;
        const MP = 1 << 1;
        const EM = 1 << 2;
        const TS = 1 << 3;
        const ET = 1 << 4;
        const NE = 1 << 5;
        const WP = 1 << 16;
        const AM = 1 << 18;
        const NW = 1 << 29;
        const CD = 1 << 30;
        const PG = 1 << 31;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Cr4: u32 {
        const VME = 1 << 0;
        const PVI = 1 << 1;
        const TSD = 1 << 2;
        const DE = 1 << 3;
        const PSE = 1 << 4;
        const PAE = 1 << 5;
        const MCE = 1 << 6;
        const PGE = 1 << 7;
        const PCE = 1 << 8;
    }
}

/// General purpose register indices, in ModRM encoding order.
pub mod gpr {
    pub const EAX: usize = 0;
    pub const ECX: usize = 1;
    pub const EDX: usize = 2;
    pub const EBX: usize = 3;
    pub const ESP: usize = 4;
    pub const EBP: usize = 5;
    pub const ESI: usize = 6;
    pub const EDI: usize = 7;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    ES = 0,
    CS = 1,
    SS = 2,
    DS = 3,
    FS = 4,
    GS = 5,
}

impl Segment {
    pub const ALL: [Segment; 6] = [
        Segment::ES,
        Segment::CS,
        Segment::SS,
        Segment::DS,
        Segment::FS,
        Segment::GS,
    ];

    /// Maps the 3-bit segment register encoding used by ModRM and the
    /// PUSH/POP opcodes.
    pub fn from_encoding(encoding: u8) -> Option<Self> {
        Self::ALL.get(encoding as usize).copied()
    }
}

/// Segment descriptor access byte bits.
pub mod access {
    pub const ACCESSED: u8 = 1 << 0;
    /// Readable (code) or writable (data).
    pub const RW: u8 = 1 << 1;
    /// Conforming (code) or expand-down (data).
    pub const DC: u8 = 1 << 2;
    pub const EXECUTABLE: u8 = 1 << 3;
    /// Code/data segment (as opposed to a system descriptor).
    pub const S: u8 = 1 << 4;
    pub const DPL_SHIFT: u8 = 5;
    pub const PRESENT: u8 = 1 << 7;
}

/// Descriptor flag nibble (bits 52..56 of a descriptor).
pub mod seg_flags {
    pub const AVL: u8 = 1 << 0;
    pub const BIG: u8 = 1 << 2;
    pub const GRANULARITY: u8 = 1 << 3;
}

/// Hidden part of a segment register, loaded from a descriptor (or synthesized
/// in real and virtual-8086 mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentCache {
    pub base: u32,
    /// Byte-granular limit.
    pub limit: u32,
    pub access: u8,
    pub flags: u8,
}

impl SegmentCache {
    /// A cache that faults every access, as left behind by a null selector load.
    pub const fn unusable() -> Self {
        Self {
            base: 0,
            limit: 0,
            access: 0,
            flags: 0,
        }
    }

    /// Real-mode style 64 KiB read/write data segment.
    pub const fn real_mode(base: u32, dpl: u8) -> Self {
        Self {
            base,
            limit: 0xFFFF,
            access: access::PRESENT | (dpl << access::DPL_SHIFT) | access::S | access::RW | access::ACCESSED,
            flags: 0,
        }
    }

    #[inline]
    pub fn present(&self) -> bool {
        self.access & access::PRESENT != 0
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.access >> access::DPL_SHIFT) & 3
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.access & (access::S | access::EXECUTABLE) == access::S | access::EXECUTABLE
    }

    #[inline]
    pub fn is_data(&self) -> bool {
        self.access & (access::S | access::EXECUTABLE) == access::S
    }

    pub fn readable(&self) -> bool {
        self.is_data() || (self.is_code() && self.access & access::RW != 0)
    }

    pub fn writable(&self) -> bool {
        self.is_data() && self.access & access::RW != 0
    }

    pub fn expand_down(&self) -> bool {
        self.is_data() && self.access & access::DC != 0
    }

    pub fn conforming(&self) -> bool {
        self.is_code() && self.access & access::DC != 0
    }

    /// D/B bit: 32-bit default operand size for code, 32-bit stack pointer for
    /// stacks, 4 GiB upper bound for expand-down data.
    #[inline]
    pub fn big(&self) -> bool {
        self.flags & seg_flags::BIG != 0
    }

    pub fn granularity(&self) -> bool {
        self.flags & seg_flags::GRANULARITY != 0
    }

    /// Whether `size` bytes at `offset` are inside the segment limit.
    pub fn contains(&self, offset: u32, size: u32) -> bool {
        let last = offset.wrapping_add(size - 1);
        if self.expand_down() {
            let upper = if self.big() { u32::MAX } else { 0xFFFF };
            offset > self.limit && last >= offset && last <= upper
        } else {
            last >= offset && last <= self.limit
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRegister {
    pub selector: u16,
    pub cache: SegmentCache,
}

/// GDTR / IDTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableRegister {
    pub base: u32,
    pub limit: u16,
}

impl TableRegister {
    pub fn contains(&self, offset: u32, len: u32) -> bool {
        offset
            .checked_add(len - 1)
            .is_some_and(|last| last <= u32::from(self.limit))
    }
}

/// LDTR / TR: a selector plus the base, limit and type loaded from its
/// system descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemSegment {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub access: u8,
}

impl SystemSegment {
    pub fn contains(&self, offset: u32, len: u32) -> bool {
        offset
            .checked_add(len - 1)
            .is_some_and(|last| last <= self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuState {
    pub gpr: [u32; 8],
    pub eip: u32,
    pub eflags: EFlags,
    pub segments: [SegmentRegister; 6],
    pub cr0: Cr0,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: Cr4,
    pub dr: [u32; 8],
    /// Test registers; only TR3..TR7 are accessible.
    pub tr: [u32; 8],
    pub gdtr: TableRegister,
    pub idtr: TableRegister,
    pub ldtr: SystemSegment,
    pub task: SystemSegment,
    pub cpl: u8,
    /// EFLAGS bits the emulated model implements.
    pub(crate) flag_mask: EFlags,
}

impl CpuState {
    /// Power-on state: real mode, CS:IP = F000:FFF0 with the CS base at the
    /// top of the 4 GiB space.
    pub fn new(flag_mask: EFlags) -> Self {
        let data = SegmentRegister {
            selector: 0,
            cache: SegmentCache::real_mode(0, 0),
        };
        let mut segments = [data; 6];
        segments[Segment::CS as usize] = SegmentRegister {
            selector: 0xF000,
            cache: SegmentCache {
                base: 0xFFFF_0000,
                limit: 0xFFFF,
                access: access::PRESENT | access::S | access::EXECUTABLE | access::RW | access::ACCESSED,
                flags: 0,
            },
        };

        Self {
            gpr: [0; 8],
            eip: 0xFFF0,
            eflags: EFlags::FIXED,
            segments,
            cr0: Cr0::ET,
            cr2: 0,
            cr3: 0,
            cr4: Cr4::empty(),
            dr: [0, 0, 0, 0, 0, 0, 0xFFFF_0FF0, 0x0000_0400],
            tr: [0; 8],
            gdtr: TableRegister::default(),
            idtr: TableRegister {
                base: 0,
                limit: 0x3FF,
            },
            ldtr: SystemSegment::default(),
            task: SystemSegment::default(),
            cpl: 0,
            flag_mask: flag_mask | EFlags::FIXED,
        }
    }

    #[inline]
    pub fn reg32(&self, index: usize) -> u32 {
        self.gpr[index]
    }

    #[inline]
    pub fn set_reg32(&mut self, index: usize, value: u32) {
        self.gpr[index] = value;
    }

    #[inline]
    pub fn reg16(&self, index: usize) -> u16 {
        self.gpr[index] as u16
    }

    #[inline]
    pub fn set_reg16(&mut self, index: usize, value: u16) {
        self.gpr[index] = (self.gpr[index] & 0xFFFF_0000) | u32::from(value);
    }

    /// 8-bit register by encoding: 0..=3 are AL/CL/DL/BL, 4..=7 are AH/CH/DH/BH.
    #[inline]
    pub fn reg8(&self, encoding: usize) -> u8 {
        if encoding < 4 {
            self.gpr[encoding] as u8
        } else {
            (self.gpr[encoding - 4] >> 8) as u8
        }
    }

    #[inline]
    pub fn set_reg8(&mut self, encoding: usize, value: u8) {
        if encoding < 4 {
            self.gpr[encoding] = (self.gpr[encoding] & !0xFF) | u32::from(value);
        } else {
            let r = &mut self.gpr[encoding - 4];
            *r = (*r & !0xFF00) | (u32::from(value) << 8);
        }
    }

    pub fn eax(&self) -> u32 {
        self.gpr[gpr::EAX]
    }

    pub fn ecx(&self) -> u32 {
        self.gpr[gpr::ECX]
    }

    pub fn edx(&self) -> u32 {
        self.gpr[gpr::EDX]
    }

    pub fn ebx(&self) -> u32 {
        self.gpr[gpr::EBX]
    }

    pub fn esp(&self) -> u32 {
        self.gpr[gpr::ESP]
    }

    pub fn ebp(&self) -> u32 {
        self.gpr[gpr::EBP]
    }

    pub fn esi(&self) -> u32 {
        self.gpr[gpr::ESI]
    }

    pub fn edi(&self) -> u32 {
        self.gpr[gpr::EDI]
    }

    pub fn al(&self) -> u8 {
        self.reg8(0)
    }

    pub fn set_al(&mut self, value: u8) {
        self.set_reg8(0, value)
    }

    pub fn ah(&self) -> u8 {
        self.reg8(4)
    }

    pub fn set_ah(&mut self, value: u8) {
        self.set_reg8(4, value)
    }

    pub fn ax(&self) -> u16 {
        self.reg16(gpr::EAX)
    }

    pub fn set_ax(&mut self, value: u16) {
        self.set_reg16(gpr::EAX, value)
    }

    pub fn cx(&self) -> u16 {
        self.reg16(gpr::ECX)
    }

    pub fn dx(&self) -> u16 {
        self.reg16(gpr::EDX)
    }

    pub fn set_dx(&mut self, value: u16) {
        self.set_reg16(gpr::EDX, value)
    }

    pub fn sp(&self) -> u16 {
        self.reg16(gpr::ESP)
    }

    pub fn ip(&self) -> u16 {
        self.eip as u16
    }

    #[inline]
    pub fn segment(&self, seg: Segment) -> &SegmentRegister {
        &self.segments[seg as usize]
    }

    #[inline]
    pub fn segment_mut(&mut self, seg: Segment) -> &mut SegmentRegister {
        &mut self.segments[seg as usize]
    }

    #[inline]
    pub fn selector(&self, seg: Segment) -> u16 {
        self.segments[seg as usize].selector
    }

    #[inline]
    pub fn flag(&self, flag: EFlags) -> bool {
        self.eflags.contains(flag)
    }

    #[inline]
    pub fn set_flag(&mut self, flag: EFlags, value: bool) {
        self.eflags.set(flag, value);
    }

    pub fn eflags_raw(&self) -> u32 {
        self.eflags.bits()
    }

    /// Replaces EFLAGS with `value`, dropping bits the model does not
    /// implement and forcing the reserved bit 1.
    pub fn set_eflags_raw(&mut self, value: u32) {
        self.eflags = EFlags::from_bits_retain(value) & self.flag_mask | EFlags::FIXED;
    }

    pub fn iopl(&self) -> u8 {
        ((self.eflags.bits() >> EFlags::IOPL_SHIFT) & 3) as u8
    }

    #[inline]
    pub fn protected_mode(&self) -> bool {
        self.cr0.contains(Cr0::PE)
    }

    #[inline]
    pub fn v86_mode(&self) -> bool {
        self.eflags.contains(EFlags::VM)
    }

    /// Real mode or virtual-8086 mode: segment bases are `selector << 4`.
    #[inline]
    pub fn real_or_v86(&self) -> bool {
        !self.protected_mode() || self.v86_mode()
    }

    #[inline]
    pub fn paging(&self) -> bool {
        self.cr0.contains(Cr0::PG)
    }

    /// Default operand/address size of the current code segment.
    #[inline]
    pub fn code_32(&self) -> bool {
        self.segments[Segment::CS as usize].cache.big()
    }

    /// Whether the stack pointer is ESP (true) or SP.
    #[inline]
    pub fn stack_32(&self) -> bool {
        self.segments[Segment::SS as usize].cache.big()
    }

    pub fn stack_pointer(&self) -> u32 {
        if self.stack_32() {
            self.gpr[gpr::ESP]
        } else {
            u32::from(self.reg16(gpr::ESP))
        }
    }

    pub fn set_stack_pointer(&mut self, value: u32) {
        if self.stack_32() {
            self.gpr[gpr::ESP] = value;
        } else {
            self.set_reg16(gpr::ESP, value as u16);
        }
    }
}
