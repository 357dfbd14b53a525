//! Instruction decoding.
//!
//! [`decode`] turns the byte stream at CS:EIP into an [`Instruction`]: the
//! operation, up to three operands with resolved sizes, and the
//! [`InstructionData`] (prefixes, ModRM/SIB, displacement and immediates) that
//! operand access works from. Operand and address sizes, the effective segment
//! and model gating are all resolved here so execution never re-inspects
//! prefix bytes.

mod opcodes;

use crate::config::CpuModel;
use crate::exceptions::ExecResult;
use crate::state::{gpr, CpuState, EFlags, Segment};

pub use opcodes::decode;

/// Maximum x86 instruction length (architectural limit).
pub const MAX_INSTRUCTION_LENGTH: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandSize {
    Size8,
    Size16,
    Size32,
    Size64,
}

impl OperandSize {
    #[inline]
    pub const fn bytes(self) -> u32 {
        match self {
            Self::Size8 => 1,
            Self::Size16 => 2,
            Self::Size32 => 4,
            Self::Size64 => 8,
        }
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.bytes() * 8
    }

    /// Mask of the value bits (saturating to 32 bits for `Size64`).
    #[inline]
    pub const fn mask(self) -> u32 {
        match self {
            Self::Size8 => 0xFF,
            Self::Size16 => 0xFFFF,
            Self::Size32 | Self::Size64 => 0xFFFF_FFFF,
        }
    }

    #[inline]
    pub const fn sign_bit(self) -> u32 {
        match self {
            Self::Size8 => 0x80,
            Self::Size16 => 0x8000,
            Self::Size32 | Self::Size64 => 0x8000_0000,
        }
    }

    /// Sign-extends the low bits of `value` to 32 bits.
    #[inline]
    pub const fn sign_extend(self, value: u32) -> u32 {
        match self {
            Self::Size8 => value as u8 as i8 as i32 as u32,
            Self::Size16 => value as u16 as i16 as i32 as u32,
            Self::Size32 | Self::Size64 => value,
        }
    }
}

/// Where an operand lives. Interpreted by the operand accessors in
/// [`crate::operands`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandMode {
    None,
    /// A general purpose register by encoding. For 8-bit operands the encoding
    /// selects AL..BH.
    Register(u8),
    SegmentRegister(Segment),
    /// Direct memory offset (`moffs`), taken from the displacement.
    Memory,
    ModRmReg,
    ModRmRm,
    ModRmSegmentReg,
    ModRmControlReg,
    ModRmDebugReg,
    ModRmTestReg,
    Immediate,
    Immediate2,
    /// Branch displacement relative to the next instruction.
    Relative,
    /// `ptr16:16` / `ptr16:32` immediate: offset in the immediate, selector in
    /// immediate2.
    FarAddress,
    Constant(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand {
    pub mode: OperandMode,
    pub size: OperandSize,
}

impl Operand {
    pub const NONE: Operand = Operand {
        mode: OperandMode::None,
        size: OperandSize::Size8,
    };

    pub const fn new(mode: OperandMode, size: OperandSize) -> Self {
        Self { mode, size }
    }

    pub fn is_none(&self) -> bool {
        self.mode == OperandMode::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RepPrefix {
    #[default]
    None,
    /// `F3`: REP / REPE.
    Repe,
    /// `F2`: REPNE.
    Repne,
}

/// Branch and condition predicates used by Jcc, SETcc, CMOVcc and LOOPcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpCondition {
    Always,
    Overflow,
    NotOverflow,
    Below,
    AboveOrEqual,
    Equal,
    NotEqual,
    BelowOrEqual,
    Above,
    Sign,
    NotSign,
    Parity,
    NotParity,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Greater,
}

impl JumpCondition {
    /// Condition encoded in the low nibble of `70..7F`, `0F 80..8F`,
    /// `0F 90..9F` and `0F 40..4F`.
    pub const fn from_cc(cc: u8) -> Self {
        match cc & 0xF {
            0x0 => Self::Overflow,
            0x1 => Self::NotOverflow,
            0x2 => Self::Below,
            0x3 => Self::AboveOrEqual,
            0x4 => Self::Equal,
            0x5 => Self::NotEqual,
            0x6 => Self::BelowOrEqual,
            0x7 => Self::Above,
            0x8 => Self::Sign,
            0x9 => Self::NotSign,
            0xA => Self::Parity,
            0xB => Self::NotParity,
            0xC => Self::Less,
            0xD => Self::GreaterOrEqual,
            0xE => Self::LessOrEqual,
            _ => Self::Greater,
        }
    }

    pub fn test(self, flags: EFlags) -> bool {
        let cf = flags.contains(EFlags::CF);
        let zf = flags.contains(EFlags::ZF);
        let sf = flags.contains(EFlags::SF);
        let of = flags.contains(EFlags::OF);
        let pf = flags.contains(EFlags::PF);
        match self {
            Self::Always => true,
            Self::Overflow => of,
            Self::NotOverflow => !of,
            Self::Below => cf,
            Self::AboveOrEqual => !cf,
            Self::Equal => zf,
            Self::NotEqual => !zf,
            Self::BelowOrEqual => cf || zf,
            Self::Above => !cf && !zf,
            Self::Sign => sf,
            Self::NotSign => !sf,
            Self::Parity => pf,
            Self::NotParity => !pf,
            Self::Less => sf != of,
            Self::GreaterOrEqual => sf == of,
            Self::LessOrEqual => zf || sf != of,
            Self::Greater => !zf && sf == of,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    // Arithmetic and logic.
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
    Inc,
    Dec,
    Neg,
    Not,
    Mul,
    Imul,
    Div,
    Idiv,
    // Shifts and rotates.
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
    Shld,
    Shrd,
    // Bit operations.
    Bt,
    Bts,
    Btr,
    Btc,
    Bsf,
    Bsr,
    // BCD.
    Daa,
    Das,
    Aaa,
    Aas,
    Aam,
    Aad,
    // Data movement.
    Mov,
    Movzx,
    Movsx,
    MovSegment,
    Xchg,
    Lea,
    /// LDS/LES/LFS/LGS/LSS.
    LoadFarPointer(Segment),
    Cbw,
    Cwd,
    Xlat,
    Bswap,
    Lahf,
    Sahf,
    Salc,
    Cmovcc(JumpCondition),
    Setcc(JumpCondition),
    Xadd,
    Cmpxchg,
    Cmpxchg8b,
    // Stack.
    Push,
    Pop,
    Pusha,
    Popa,
    Pushf,
    Popf,
    Enter,
    Leave,
    // Control transfer.
    Jmp,
    JmpFar,
    Call,
    CallFar,
    Ret,
    RetFar,
    Iret,
    Int,
    Int3,
    Into,
    Jcc(JumpCondition),
    Loop(JumpCondition),
    Jcxz,
    Bound,
    // Flags.
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
    Cli,
    Sti,
    // I/O and strings.
    In,
    Out,
    Movs,
    Cmps,
    Scas,
    Lods,
    Stos,
    Ins,
    Outs,
    // System.
    Hlt,
    Lgdt,
    Lidt,
    Sgdt,
    Sidt,
    Lldt,
    Sldt,
    Ltr,
    Str,
    Lmsw,
    Smsw,
    Invlpg,
    Arpl,
    Verr,
    Verw,
    Lar,
    Lsl,
    Clts,
    Invd,
    Wbinvd,
    MovToCr,
    MovFromCr,
    MovToDr,
    MovFromDr,
    MovToTr,
    MovFromTr,
    Cpuid,
    Rdtsc,
    Rdmsr,
    Wrmsr,
    Ud,
    // Miscellaneous.
    Nop,
    Wait,
    /// x87 escape (`D8..DF`).
    Escape,
    Icebp,
}

impl Operation {
    /// Instructions after which a translation block must stop: control
    /// transfers, instructions that change the execution mode or the
    /// interrupt window, and instructions that always fault.
    pub fn ends_block(self) -> bool {
        matches!(
            self,
            Operation::Jmp
                | Operation::JmpFar
                | Operation::Call
                | Operation::CallFar
                | Operation::Ret
                | Operation::RetFar
                | Operation::Iret
                | Operation::Int
                | Operation::Int3
                | Operation::Into
                | Operation::Jcc(_)
                | Operation::Loop(_)
                | Operation::Jcxz
                | Operation::Bound
                | Operation::Cli
                | Operation::Sti
                | Operation::Popf
                | Operation::MovSegment
                | Operation::LoadFarPointer(Segment::SS)
                | Operation::Hlt
                | Operation::Lgdt
                | Operation::Lidt
                | Operation::Lldt
                | Operation::Ltr
                | Operation::Lmsw
                | Operation::Clts
                | Operation::Invlpg
                | Operation::MovToCr
                | Operation::MovToDr
                | Operation::Wrmsr
                | Operation::Ud
                | Operation::Icebp
        )
    }

    pub fn is_string(self) -> bool {
        matches!(
            self,
            Operation::Movs
                | Operation::Cmps
                | Operation::Scas
                | Operation::Lods
                | Operation::Stos
                | Operation::Ins
                | Operation::Outs
        )
    }

    fn lockable(self) -> bool {
        matches!(
            self,
            Operation::Add
                | Operation::Or
                | Operation::Adc
                | Operation::Sbb
                | Operation::And
                | Operation::Sub
                | Operation::Xor
                | Operation::Inc
                | Operation::Dec
                | Operation::Neg
                | Operation::Not
                | Operation::Bts
                | Operation::Btr
                | Operation::Btc
                | Operation::Xchg
                | Operation::Xadd
                | Operation::Cmpxchg
                | Operation::Cmpxchg8b
        )
    }
}

/// Prefix, ModRM/SIB, displacement and immediate fields of a decoded
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstructionData {
    pub modrm: u8,
    pub sib: u8,
    pub has_modrm: bool,
    pub has_sib: bool,
    pub displacement: u32,
    pub immediate: u32,
    pub immediate2: u32,
    /// Effective segment for memory operands (override or default).
    pub segment: Segment,
    pub segment_override: bool,
    pub operand_size_32: bool,
    pub address_size_32: bool,
    pub rep: RepPrefix,
    pub lock: bool,
}

impl Default for InstructionData {
    fn default() -> Self {
        Self {
            modrm: 0,
            sib: 0,
            has_modrm: false,
            has_sib: false,
            displacement: 0,
            immediate: 0,
            immediate2: 0,
            segment: Segment::DS,
            segment_override: false,
            operand_size_32: false,
            address_size_32: false,
            rep: RepPrefix::None,
            lock: false,
        }
    }
}

impl InstructionData {
    #[inline]
    pub fn modrm_mod(&self) -> u8 {
        self.modrm >> 6
    }

    #[inline]
    pub fn modrm_reg(&self) -> u8 {
        (self.modrm >> 3) & 7
    }

    #[inline]
    pub fn modrm_rm(&self) -> u8 {
        self.modrm & 7
    }

    /// True when the r/m field names a register rather than memory.
    #[inline]
    pub fn modrm_rm_is_register(&self) -> bool {
        self.modrm_mod() == 3
    }

    /// Computes the offset of the ModRM memory operand from the current
    /// register file. Pure, so it may be called any number of times per
    /// instruction.
    pub fn effective_address(&self, state: &CpuState) -> u32 {
        if self.address_size_32 {
            self.effective_address_32(state)
        } else {
            self.effective_address_16(state)
        }
    }

    fn effective_address_16(&self, state: &CpuState) -> u32 {
        let r = |i: usize| state.reg16(i);
        let base = match self.modrm_rm() {
            0 => r(gpr::EBX).wrapping_add(r(gpr::ESI)),
            1 => r(gpr::EBX).wrapping_add(r(gpr::EDI)),
            2 => r(gpr::EBP).wrapping_add(r(gpr::ESI)),
            3 => r(gpr::EBP).wrapping_add(r(gpr::EDI)),
            4 => r(gpr::ESI),
            5 => r(gpr::EDI),
            6 if self.modrm_mod() == 0 => 0,
            6 => r(gpr::EBP),
            _ => r(gpr::EBX),
        };
        u32::from(base.wrapping_add(self.displacement as u16))
    }

    fn effective_address_32(&self, state: &CpuState) -> u32 {
        let rm = self.modrm_rm();
        let base = if rm == 4 {
            let base = usize::from(self.sib & 7);
            let index = usize::from((self.sib >> 3) & 7);
            let scale = self.sib >> 6;
            let base_value = if base == gpr::EBP && self.modrm_mod() == 0 {
                0
            } else {
                state.reg32(base)
            };
            let index_value = if index == gpr::ESP {
                0
            } else {
                state.reg32(index) << scale
            };
            base_value.wrapping_add(index_value)
        } else if rm == 5 && self.modrm_mod() == 0 {
            0
        } else {
            state.reg32(usize::from(rm))
        };
        base.wrapping_add(self.displacement)
    }

    /// Mask applied to offsets for the current address size.
    #[inline]
    pub fn address_mask(&self) -> u32 {
        if self.address_size_32 {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub operation: Operation,
    pub operands: [Operand; 3],
    /// Effective operand size of the instruction (8 for byte forms).
    pub operand_size: OperandSize,
    pub data: InstructionData,
    pub length: u8,
}

impl Instruction {
    #[inline]
    pub fn operand(&self, index: usize) -> Operand {
        self.operands[index]
    }
}

/// Decodes one instruction from a byte slice. Bytes past the end of the slice
/// raise #GP(0), which matches running off the end of a code segment.
pub fn decode_bytes(bytes: &[u8], code_32: bool, model: CpuModel) -> ExecResult<Instruction> {
    decode(
        |offset| {
            bytes
                .get(offset as usize)
                .copied()
                .map_or_else(|| crate::exceptions::gp(0), Ok)
        },
        code_32,
        model,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EFlags;

    fn state() -> CpuState {
        CpuState::new(EFlags::all())
    }

    #[test]
    fn condition_table() {
        let flags = EFlags::SF;
        assert!(JumpCondition::Less.test(flags));
        assert!(!JumpCondition::GreaterOrEqual.test(flags));
        assert!(JumpCondition::LessOrEqual.test(flags));
        assert!(JumpCondition::Above.test(EFlags::empty()));
        assert!(!JumpCondition::Above.test(EFlags::ZF));
        assert!(JumpCondition::Greater.test(EFlags::SF | EFlags::OF));
        assert_eq!(JumpCondition::from_cc(0x74 & 0xF), JumpCondition::Equal);
    }

    #[test]
    fn sixteen_bit_addressing_wraps() {
        let mut s = state();
        s.set_reg32(gpr::EBX, 0xFFFF);
        s.set_reg32(gpr::ESI, 0x0002);
        let data = InstructionData {
            modrm: 0b01_000_000,
            has_modrm: true,
            displacement: 0x10,
            ..InstructionData::default()
        };
        assert_eq!(data.effective_address(&s), 0x0011);
    }

    #[test]
    fn sib_without_base_uses_displacement() {
        let mut s = state();
        s.set_reg32(gpr::ECX, 0x100);
        s.set_reg32(gpr::EBP, 0x5555);
        // [ECX*4 + disp32], mod=00 base=101.
        let data = InstructionData {
            modrm: 0b00_000_100,
            sib: 0b10_001_101,
            has_modrm: true,
            has_sib: true,
            displacement: 0x1000,
            address_size_32: true,
            ..InstructionData::default()
        };
        assert_eq!(data.effective_address(&s), 0x1400);
    }
}
