use super::{
    Instruction, InstructionData, JumpCondition, Operand, OperandMode, OperandSize, Operation,
    RepPrefix, MAX_INSTRUCTION_LENGTH,
};
use crate::config::CpuModel;
use crate::exceptions::{gp, ud, ExecResult};
use crate::state::Segment;

/// Operand forms as written in the opcode tables, before size resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arg {
    None,
    Eb,
    Ev,
    Ew,
    /// r/m that is operand-size wide for registers but 16 bits for memory
    /// (MOV Ev,Sw / SLDT / STR / SMSW).
    EvW,
    Gb,
    Gv,
    Gw,
    Sw,
    Cd,
    Dd,
    Td,
    /// r/m register of MOV CR/DR/TR (mod is ignored).
    Rd,
    Ib,
    /// imm8 sign-extended to the operand size.
    IbV,
    Iw,
    Iz,
    /// Second imm8 (ENTER nesting level).
    Ib2,
    Jb,
    Jz,
    Ap,
    /// Memory only, operand-size wide (LEA, BOUND, LGDT family, far pointers).
    M,
    Mb,
    Mq,
    Ob,
    Ov,
    Zb(u8),
    Zv(u8),
    Zw(u8),
    Zd(u8),
    Seg(Segment),
    One,
    Cl,
}

impl Arg {
    fn uses_modrm(self) -> bool {
        matches!(
            self,
            Arg::Eb
                | Arg::Ev
                | Arg::Ew
                | Arg::EvW
                | Arg::Gb
                | Arg::Gv
                | Arg::Gw
                | Arg::Sw
                | Arg::M
                | Arg::Mb
                | Arg::Mq
        )
    }

    fn memory_only(self) -> bool {
        matches!(self, Arg::M | Arg::Mb | Arg::Mq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Byte,
    Operand,
    Word,
    Dword,
}

struct Entry {
    op: Operation,
    args: [Arg; 3],
    width: Width,
}

fn entry(op: Operation, width: Width, args: &[Arg]) -> Entry {
    let mut out = [Arg::None; 3];
    out[..args.len()].copy_from_slice(args);
    Entry {
        op,
        args: out,
        width,
    }
}

fn b(op: Operation, args: &[Arg]) -> Entry {
    entry(op, Width::Byte, args)
}

fn v(op: Operation, args: &[Arg]) -> Entry {
    entry(op, Width::Operand, args)
}

fn w(op: Operation, args: &[Arg]) -> Entry {
    entry(op, Width::Word, args)
}

fn d(op: Operation, args: &[Arg]) -> Entry {
    entry(op, Width::Dword, args)
}

const ALU_OPS: [Operation; 8] = [
    Operation::Add,
    Operation::Or,
    Operation::Adc,
    Operation::Sbb,
    Operation::And,
    Operation::Sub,
    Operation::Xor,
    Operation::Cmp,
];

const SHIFT_OPS: [Operation; 8] = [
    Operation::Rol,
    Operation::Ror,
    Operation::Rcl,
    Operation::Rcr,
    Operation::Shl,
    Operation::Shr,
    Operation::Shl,
    Operation::Sar,
];

struct Decoder<F> {
    fetch: F,
    pos: u32,
    model: CpuModel,
    data: InstructionData,
}

impl<F> Decoder<F>
where
    F: FnMut(u32) -> ExecResult<u8>,
{
    fn byte(&mut self) -> ExecResult<u8> {
        if self.pos >= MAX_INSTRUCTION_LENGTH {
            return gp(0);
        }
        let byte = (self.fetch)(self.pos)?;
        self.pos += 1;
        Ok(byte)
    }

    fn word(&mut self) -> ExecResult<u16> {
        let lo = self.byte()?;
        let hi = self.byte()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn dword(&mut self) -> ExecResult<u32> {
        let lo = self.word()?;
        let hi = self.word()?;
        Ok(u32::from(lo) | (u32::from(hi) << 16))
    }

    /// Immediate of the current operand size, zero-extended.
    fn iz(&mut self) -> ExecResult<u32> {
        if self.data.operand_size_32 {
            self.dword()
        } else {
            self.word().map(u32::from)
        }
    }

    fn require(&self, available: bool) -> ExecResult<()> {
        if available {
            Ok(())
        } else {
            ud()
        }
    }

    fn i486(&self) -> ExecResult<()> {
        self.require(self.model.has_i486_instructions())
    }

    fn pentium(&self) -> ExecResult<()> {
        self.require(self.model.has_pentium_instructions())
    }

    /// Fetches the ModRM byte (once) along with any SIB byte and displacement,
    /// and applies the SS default for stack-based addressing.
    fn modrm(&mut self) -> ExecResult<u8> {
        if !self.data.has_modrm {
            let modrm = self.byte()?;
            self.data.modrm = modrm;
            self.data.has_modrm = true;
            if modrm >> 6 != 3 {
                self.memory_operand()?;
            }
        }
        Ok(self.data.modrm)
    }

    /// ModRM of MOV to/from CR/DR/TR: always a register form, no SIB or
    /// displacement follows.
    fn register_modrm(&mut self) -> ExecResult<u8> {
        let modrm = self.byte()? | 0xC0;
        self.data.modrm = modrm;
        self.data.has_modrm = true;
        Ok(modrm)
    }

    fn modrm_reg(&mut self) -> ExecResult<u8> {
        Ok((self.modrm()? >> 3) & 7)
    }

    fn memory_operand(&mut self) -> ExecResult<()> {
        let md = self.data.modrm_mod();
        let rm = self.data.modrm_rm();
        let mut stack = false;

        if self.data.address_size_32 {
            let mut no_base = false;
            if rm == 4 {
                self.data.sib = self.byte()?;
                self.data.has_sib = true;
                match self.data.sib & 7 {
                    4 => stack = true,
                    5 if md == 0 => no_base = true,
                    5 => stack = true,
                    _ => {}
                }
            } else if rm == 5 {
                if md == 0 {
                    no_base = true;
                } else {
                    stack = true;
                }
            }

            self.data.displacement = match md {
                0 if no_base => self.dword()?,
                1 => self.byte()? as i8 as i32 as u32,
                2 => self.dword()?,
                _ => 0,
            };
        } else {
            if md == 0 && rm == 6 {
                self.data.displacement = u32::from(self.word()?);
            } else {
                stack = matches!(rm, 2 | 3 | 6);
                self.data.displacement = match md {
                    1 => self.byte()? as i8 as i32 as u32,
                    2 => u32::from(self.word()?),
                    _ => 0,
                };
            }
        }

        if stack && !self.data.segment_override {
            self.data.segment = Segment::SS;
        }
        Ok(())
    }

    fn one_byte(&mut self, opcode: u8) -> ExecResult<Entry> {
        use Arg::*;
        use Operation as Op;

        Ok(match opcode {
            0x00..=0x3F if opcode & 7 < 6 => {
                let op = ALU_OPS[usize::from(opcode >> 3)];
                match opcode & 7 {
                    0 => b(op, &[Eb, Gb]),
                    1 => v(op, &[Ev, Gv]),
                    2 => b(op, &[Gb, Eb]),
                    3 => v(op, &[Gv, Ev]),
                    4 => b(op, &[Zb(0), Ib]),
                    _ => v(op, &[Zv(0), Iz]),
                }
            }
            0x06 => v(Op::Push, &[Seg(Segment::ES)]),
            0x07 => v(Op::Pop, &[Seg(Segment::ES)]),
            0x0E => v(Op::Push, &[Seg(Segment::CS)]),
            0x16 => v(Op::Push, &[Seg(Segment::SS)]),
            0x17 => v(Op::Pop, &[Seg(Segment::SS)]),
            0x1E => v(Op::Push, &[Seg(Segment::DS)]),
            0x1F => v(Op::Pop, &[Seg(Segment::DS)]),
            0x27 => b(Op::Daa, &[]),
            0x2F => b(Op::Das, &[]),
            0x37 => b(Op::Aaa, &[]),
            0x3F => b(Op::Aas, &[]),
            0x40..=0x47 => v(Op::Inc, &[Zv(opcode & 7)]),
            0x48..=0x4F => v(Op::Dec, &[Zv(opcode & 7)]),
            0x50..=0x57 => v(Op::Push, &[Zv(opcode & 7)]),
            0x58..=0x5F => v(Op::Pop, &[Zv(opcode & 7)]),
            0x60 => v(Op::Pusha, &[]),
            0x61 => v(Op::Popa, &[]),
            0x62 => v(Op::Bound, &[Gv, M]),
            0x63 => w(Op::Arpl, &[Ew, Gw]),
            0x68 => v(Op::Push, &[Iz]),
            0x69 => v(Op::Imul, &[Gv, Ev, Iz]),
            0x6A => v(Op::Push, &[IbV]),
            0x6B => v(Op::Imul, &[Gv, Ev, IbV]),
            0x6C => b(Op::Ins, &[]),
            0x6D => v(Op::Ins, &[]),
            0x6E => b(Op::Outs, &[]),
            0x6F => v(Op::Outs, &[]),
            0x70..=0x7F => v(Op::Jcc(JumpCondition::from_cc(opcode)), &[Jb]),
            0x80 | 0x82 => b(ALU_OPS[usize::from(self.modrm_reg()?)], &[Eb, Ib]),
            0x81 => v(ALU_OPS[usize::from(self.modrm_reg()?)], &[Ev, Iz]),
            0x83 => v(ALU_OPS[usize::from(self.modrm_reg()?)], &[Ev, IbV]),
            0x84 => b(Op::Test, &[Eb, Gb]),
            0x85 => v(Op::Test, &[Ev, Gv]),
            0x86 => b(Op::Xchg, &[Eb, Gb]),
            0x87 => v(Op::Xchg, &[Ev, Gv]),
            0x88 => b(Op::Mov, &[Eb, Gb]),
            0x89 => v(Op::Mov, &[Ev, Gv]),
            0x8A => b(Op::Mov, &[Gb, Eb]),
            0x8B => v(Op::Mov, &[Gv, Ev]),
            0x8C => v(Op::MovSegment, &[EvW, Sw]),
            0x8D => v(Op::Lea, &[Gv, M]),
            0x8E => {
                // MOV CS, r/m is undefined.
                let reg = self.modrm_reg()?;
                self.require(reg != 1)?;
                w(Op::MovSegment, &[Sw, Ew])
            }
            0x8F => {
                let reg = self.modrm_reg()?;
                self.require(reg == 0)?;
                v(Op::Pop, &[Ev])
            }
            0x90 => b(Op::Nop, &[]),
            0x91..=0x97 => v(Op::Xchg, &[Zv(0), Zv(opcode & 7)]),
            0x98 => v(Op::Cbw, &[]),
            0x99 => v(Op::Cwd, &[]),
            0x9A => v(Op::CallFar, &[Ap]),
            0x9B => b(Op::Wait, &[]),
            0x9C => v(Op::Pushf, &[]),
            0x9D => v(Op::Popf, &[]),
            0x9E => b(Op::Sahf, &[]),
            0x9F => b(Op::Lahf, &[]),
            0xA0 => b(Op::Mov, &[Zb(0), Ob]),
            0xA1 => v(Op::Mov, &[Zv(0), Ov]),
            0xA2 => b(Op::Mov, &[Ob, Zb(0)]),
            0xA3 => v(Op::Mov, &[Ov, Zv(0)]),
            0xA4 => b(Op::Movs, &[]),
            0xA5 => v(Op::Movs, &[]),
            0xA6 => b(Op::Cmps, &[]),
            0xA7 => v(Op::Cmps, &[]),
            0xA8 => b(Op::Test, &[Zb(0), Ib]),
            0xA9 => v(Op::Test, &[Zv(0), Iz]),
            0xAA => b(Op::Stos, &[]),
            0xAB => v(Op::Stos, &[]),
            0xAC => b(Op::Lods, &[]),
            0xAD => v(Op::Lods, &[]),
            0xAE => b(Op::Scas, &[]),
            0xAF => v(Op::Scas, &[]),
            0xB0..=0xB7 => b(Op::Mov, &[Zb(opcode & 7), Ib]),
            0xB8..=0xBF => v(Op::Mov, &[Zv(opcode & 7), Iz]),
            0xC0 => b(SHIFT_OPS[usize::from(self.modrm_reg()?)], &[Eb, Ib]),
            0xC1 => v(SHIFT_OPS[usize::from(self.modrm_reg()?)], &[Ev, Ib]),
            0xC2 => v(Op::Ret, &[Iw]),
            0xC3 => v(Op::Ret, &[]),
            0xC4 => v(Op::LoadFarPointer(Segment::ES), &[Gv, M]),
            0xC5 => v(Op::LoadFarPointer(Segment::DS), &[Gv, M]),
            0xC6 => {
                let reg = self.modrm_reg()?;
                self.require(reg == 0)?;
                b(Op::Mov, &[Eb, Ib])
            }
            0xC7 => {
                let reg = self.modrm_reg()?;
                self.require(reg == 0)?;
                v(Op::Mov, &[Ev, Iz])
            }
            0xC8 => v(Op::Enter, &[Iw, Ib2]),
            0xC9 => v(Op::Leave, &[]),
            0xCA => v(Op::RetFar, &[Iw]),
            0xCB => v(Op::RetFar, &[]),
            0xCC => b(Op::Int3, &[]),
            0xCD => b(Op::Int, &[Ib]),
            0xCE => b(Op::Into, &[]),
            0xCF => v(Op::Iret, &[]),
            0xD0 => b(SHIFT_OPS[usize::from(self.modrm_reg()?)], &[Eb, One]),
            0xD1 => v(SHIFT_OPS[usize::from(self.modrm_reg()?)], &[Ev, One]),
            0xD2 => b(SHIFT_OPS[usize::from(self.modrm_reg()?)], &[Eb, Cl]),
            0xD3 => v(SHIFT_OPS[usize::from(self.modrm_reg()?)], &[Ev, Cl]),
            0xD4 => b(Op::Aam, &[Ib]),
            0xD5 => b(Op::Aad, &[Ib]),
            0xD6 => b(Op::Salc, &[]),
            0xD7 => b(Op::Xlat, &[]),
            0xD8..=0xDF => v(Op::Escape, &[Ev]),
            0xE0 => v(Op::Loop(JumpCondition::NotEqual), &[Jb]),
            0xE1 => v(Op::Loop(JumpCondition::Equal), &[Jb]),
            0xE2 => v(Op::Loop(JumpCondition::Always), &[Jb]),
            0xE3 => v(Op::Jcxz, &[Jb]),
            0xE4 => b(Op::In, &[Zb(0), Ib]),
            0xE5 => v(Op::In, &[Zv(0), Ib]),
            0xE6 => b(Op::Out, &[Ib, Zb(0)]),
            0xE7 => v(Op::Out, &[Ib, Zv(0)]),
            0xE8 => v(Op::Call, &[Jz]),
            0xE9 => v(Op::Jmp, &[Jz]),
            0xEA => v(Op::JmpFar, &[Ap]),
            0xEB => v(Op::Jmp, &[Jb]),
            0xEC => b(Op::In, &[Zb(0), Zw(2)]),
            0xED => v(Op::In, &[Zv(0), Zw(2)]),
            0xEE => b(Op::Out, &[Zw(2), Zb(0)]),
            0xEF => v(Op::Out, &[Zw(2), Zv(0)]),
            0xF1 => b(Op::Icebp, &[]),
            0xF4 => b(Op::Hlt, &[]),
            0xF5 => b(Op::Cmc, &[]),
            0xF6 | 0xF7 => {
                let (ev, iz) = if opcode == 0xF6 { (Eb, Ib) } else { (Ev, Iz) };
                let width = if opcode == 0xF6 { Width::Byte } else { Width::Operand };
                match self.modrm_reg()? {
                    0 | 1 => entry(Op::Test, width, &[ev, iz]),
                    2 => entry(Op::Not, width, &[ev]),
                    3 => entry(Op::Neg, width, &[ev]),
                    4 => entry(Op::Mul, width, &[ev]),
                    5 => entry(Op::Imul, width, &[ev]),
                    6 => entry(Op::Div, width, &[ev]),
                    _ => entry(Op::Idiv, width, &[ev]),
                }
            }
            0xF8 => b(Op::Clc, &[]),
            0xF9 => b(Op::Stc, &[]),
            0xFA => b(Op::Cli, &[]),
            0xFB => b(Op::Sti, &[]),
            0xFC => b(Op::Cld, &[]),
            0xFD => b(Op::Std, &[]),
            0xFE => match self.modrm_reg()? {
                0 => b(Op::Inc, &[Eb]),
                1 => b(Op::Dec, &[Eb]),
                _ => return ud(),
            },
            0xFF => match self.modrm_reg()? {
                0 => v(Op::Inc, &[Ev]),
                1 => v(Op::Dec, &[Ev]),
                2 => v(Op::Call, &[Ev]),
                3 => v(Op::CallFar, &[M]),
                4 => v(Op::Jmp, &[Ev]),
                5 => v(Op::JmpFar, &[M]),
                6 => v(Op::Push, &[Ev]),
                _ => return ud(),
            },
            _ => return ud(),
        })
    }

    fn two_byte(&mut self, opcode: u8) -> ExecResult<Entry> {
        use Arg::*;
        use Operation as Op;

        Ok(match opcode {
            0x00 => match self.modrm_reg()? {
                0 => v(Op::Sldt, &[EvW]),
                1 => v(Op::Str, &[EvW]),
                2 => w(Op::Lldt, &[Ew]),
                3 => w(Op::Ltr, &[Ew]),
                4 => w(Op::Verr, &[Ew]),
                5 => w(Op::Verw, &[Ew]),
                _ => return ud(),
            },
            0x01 => match self.modrm_reg()? {
                0 => v(Op::Sgdt, &[M]),
                1 => v(Op::Sidt, &[M]),
                2 => v(Op::Lgdt, &[M]),
                3 => v(Op::Lidt, &[M]),
                4 => v(Op::Smsw, &[EvW]),
                6 => w(Op::Lmsw, &[Ew]),
                7 => {
                    self.i486()?;
                    b(Op::Invlpg, &[Mb])
                }
                _ => return ud(),
            },
            0x02 => v(Op::Lar, &[Gv, Ew]),
            0x03 => v(Op::Lsl, &[Gv, Ew]),
            0x06 => b(Op::Clts, &[]),
            0x08 => {
                self.i486()?;
                b(Op::Invd, &[])
            }
            0x09 => {
                self.i486()?;
                b(Op::Wbinvd, &[])
            }
            0x0B => b(Op::Ud, &[]),
            0x20 | 0x21 | 0x22 | 0x23 | 0x24 | 0x26 => {
                self.register_modrm()?;
                match opcode {
                    0x20 => d(Op::MovFromCr, &[Rd, Cd]),
                    0x21 => d(Op::MovFromDr, &[Rd, Dd]),
                    0x22 => d(Op::MovToCr, &[Cd, Rd]),
                    0x23 => d(Op::MovToDr, &[Dd, Rd]),
                    0x24 => d(Op::MovFromTr, &[Rd, Td]),
                    _ => d(Op::MovToTr, &[Td, Rd]),
                }
            }
            0x30 => {
                self.pentium()?;
                b(Op::Wrmsr, &[])
            }
            0x31 => {
                self.pentium()?;
                b(Op::Rdtsc, &[])
            }
            0x32 => {
                self.pentium()?;
                b(Op::Rdmsr, &[])
            }
            0x40..=0x4F => {
                self.pentium()?;
                v(Op::Cmovcc(JumpCondition::from_cc(opcode)), &[Gv, Ev])
            }
            0x80..=0x8F => v(Op::Jcc(JumpCondition::from_cc(opcode)), &[Jz]),
            0x90..=0x9F => b(Op::Setcc(JumpCondition::from_cc(opcode)), &[Eb]),
            0xA0 => v(Op::Push, &[Seg(Segment::FS)]),
            0xA1 => v(Op::Pop, &[Seg(Segment::FS)]),
            0xA2 => {
                self.pentium()?;
                b(Op::Cpuid, &[])
            }
            0xA3 => v(Op::Bt, &[Ev, Gv]),
            0xA4 => v(Op::Shld, &[Ev, Gv, Ib]),
            0xA5 => v(Op::Shld, &[Ev, Gv, Cl]),
            0xA8 => v(Op::Push, &[Seg(Segment::GS)]),
            0xA9 => v(Op::Pop, &[Seg(Segment::GS)]),
            0xAB => v(Op::Bts, &[Ev, Gv]),
            0xAC => v(Op::Shrd, &[Ev, Gv, Ib]),
            0xAD => v(Op::Shrd, &[Ev, Gv, Cl]),
            0xAF => v(Op::Imul, &[Gv, Ev]),
            0xB0 => {
                self.i486()?;
                b(Op::Cmpxchg, &[Eb, Gb])
            }
            0xB1 => {
                self.i486()?;
                v(Op::Cmpxchg, &[Ev, Gv])
            }
            0xB2 => v(Op::LoadFarPointer(Segment::SS), &[Gv, M]),
            0xB3 => v(Op::Btr, &[Ev, Gv]),
            0xB4 => v(Op::LoadFarPointer(Segment::FS), &[Gv, M]),
            0xB5 => v(Op::LoadFarPointer(Segment::GS), &[Gv, M]),
            0xB6 => v(Op::Movzx, &[Gv, Eb]),
            0xB7 => v(Op::Movzx, &[Gv, Ew]),
            0xBA => match self.modrm_reg()? {
                4 => v(Op::Bt, &[Ev, Ib]),
                5 => v(Op::Bts, &[Ev, Ib]),
                6 => v(Op::Btr, &[Ev, Ib]),
                7 => v(Op::Btc, &[Ev, Ib]),
                _ => return ud(),
            },
            0xBB => v(Op::Btc, &[Ev, Gv]),
            0xBC => v(Op::Bsf, &[Gv, Ev]),
            0xBD => v(Op::Bsr, &[Gv, Ev]),
            0xBE => v(Op::Movsx, &[Gv, Eb]),
            0xBF => v(Op::Movsx, &[Gv, Ew]),
            0xC0 => {
                self.i486()?;
                b(Op::Xadd, &[Eb, Gb])
            }
            0xC1 => {
                self.i486()?;
                v(Op::Xadd, &[Ev, Gv])
            }
            0xC7 => {
                self.pentium()?;
                let reg = self.modrm_reg()?;
                self.require(reg == 1)?;
                entry(Op::Cmpxchg8b, Width::Operand, &[Mq])
            }
            0xC8..=0xCF => {
                self.i486()?;
                d(Op::Bswap, &[Zd(opcode & 7)])
            }
            _ => return ud(),
        })
    }

    fn resolve(&mut self, arg: Arg, size_v: OperandSize) -> ExecResult<Operand> {
        use Arg::*;
        use OperandMode as M_;
        use OperandSize::*;

        let mem = !self.data.modrm_rm_is_register();
        Ok(match arg {
            None => Operand::NONE,
            Eb => Operand::new(M_::ModRmRm, Size8),
            Ev => Operand::new(M_::ModRmRm, size_v),
            Ew => Operand::new(M_::ModRmRm, Size16),
            EvW => Operand::new(M_::ModRmRm, if mem { Size16 } else { size_v }),
            Gb => Operand::new(M_::ModRmReg, Size8),
            Gv => Operand::new(M_::ModRmReg, size_v),
            Gw => Operand::new(M_::ModRmReg, Size16),
            Sw => {
                if self.data.modrm_reg() >= 6 {
                    return ud();
                }
                Operand::new(M_::ModRmSegmentReg, Size16)
            }
            Cd => Operand::new(M_::ModRmControlReg, Size32),
            Dd => Operand::new(M_::ModRmDebugReg, Size32),
            Td => Operand::new(M_::ModRmTestReg, Size32),
            Rd => Operand::new(M_::ModRmRm, Size32),
            Ib => {
                self.data.immediate = u32::from(self.byte()?);
                Operand::new(M_::Immediate, Size8)
            }
            IbV => {
                self.data.immediate = self.byte()? as i8 as i32 as u32;
                Operand::new(M_::Immediate, size_v)
            }
            Iw => {
                self.data.immediate = u32::from(self.word()?);
                Operand::new(M_::Immediate, Size16)
            }
            Iz => {
                self.data.immediate = self.iz()?;
                Operand::new(M_::Immediate, size_v)
            }
            Ib2 => {
                self.data.immediate2 = u32::from(self.byte()?);
                Operand::new(M_::Immediate2, Size8)
            }
            Jb => {
                self.data.immediate = self.byte()? as i8 as i32 as u32;
                Operand::new(M_::Relative, size_v)
            }
            Jz => {
                self.data.immediate = if self.data.operand_size_32 {
                    self.dword()?
                } else {
                    self.word()? as i16 as i32 as u32
                };
                Operand::new(M_::Relative, size_v)
            }
            Ap => {
                self.data.immediate = self.iz()?;
                self.data.immediate2 = u32::from(self.word()?);
                Operand::new(M_::FarAddress, size_v)
            }
            M => Operand::new(M_::ModRmRm, size_v),
            Mb => Operand::new(M_::ModRmRm, Size8),
            Mq => Operand::new(M_::ModRmRm, Size64),
            Ob | Ov => {
                self.data.displacement = if self.data.address_size_32 {
                    self.dword()?
                } else {
                    u32::from(self.word()?)
                };
                Operand::new(M_::Memory, if arg == Ob { Size8 } else { size_v })
            }
            Zb(reg) => Operand::new(M_::Register(reg), Size8),
            Zv(reg) => Operand::new(M_::Register(reg), size_v),
            Zw(reg) => Operand::new(M_::Register(reg), Size16),
            Zd(reg) => Operand::new(M_::Register(reg), Size32),
            Seg(seg) => Operand::new(M_::SegmentRegister(seg), Size16),
            One => Operand::new(M_::Constant(1), Size8),
            Cl => Operand::new(M_::Register(1), Size8),
        })
    }
}

/// Decodes one instruction. `fetch(n)` returns the byte `n` bytes past the
/// start of the instruction; faults it raises propagate unchanged.
pub fn decode<F>(fetch: F, code_32: bool, model: CpuModel) -> ExecResult<Instruction>
where
    F: FnMut(u32) -> ExecResult<u8>,
{
    let mut decoder = Decoder {
        fetch,
        pos: 0,
        model,
        data: InstructionData {
            operand_size_32: code_32,
            address_size_32: code_32,
            ..InstructionData::default()
        },
    };

    let opcode = loop {
        let byte = decoder.byte()?;
        let segment = match byte {
            0x26 => Segment::ES,
            0x2E => Segment::CS,
            0x36 => Segment::SS,
            0x3E => Segment::DS,
            0x64 => Segment::FS,
            0x65 => Segment::GS,
            0x66 => {
                decoder.data.operand_size_32 = !code_32;
                continue;
            }
            0x67 => {
                decoder.data.address_size_32 = !code_32;
                continue;
            }
            0xF0 => {
                decoder.data.lock = true;
                continue;
            }
            0xF2 => {
                decoder.data.rep = RepPrefix::Repne;
                continue;
            }
            0xF3 => {
                decoder.data.rep = RepPrefix::Repe;
                continue;
            }
            _ => break byte,
        };
        decoder.data.segment = segment;
        decoder.data.segment_override = true;
    };

    let entry = if opcode == 0x0F {
        let second = decoder.byte()?;
        decoder.two_byte(second)?
    } else {
        decoder.one_byte(opcode)?
    };

    if entry.args.iter().any(|a| a.uses_modrm()) {
        decoder.modrm()?;
    }
    if entry.args.iter().any(|a| a.memory_only()) && decoder.data.modrm_rm_is_register() {
        return ud();
    }

    let size_v = if decoder.data.operand_size_32 {
        OperandSize::Size32
    } else {
        OperandSize::Size16
    };
    let mut operands = [Operand::NONE; 3];
    for (slot, arg) in operands.iter_mut().zip(entry.args) {
        *slot = decoder.resolve(arg, size_v)?;
    }

    if decoder.data.lock {
        let destination_is_memory =
            operands[0].mode == OperandMode::ModRmRm && !decoder.data.modrm_rm_is_register();
        if !entry.op.lockable() || !destination_is_memory {
            return ud();
        }
    }

    let operand_size = match entry.width {
        Width::Byte => OperandSize::Size8,
        Width::Operand => size_v,
        Width::Word => OperandSize::Size16,
        Width::Dword => OperandSize::Size32,
    };

    Ok(Instruction {
        operation: entry.op,
        operands,
        operand_size,
        data: decoder.data,
        length: decoder.pos as u8,
    })
}
