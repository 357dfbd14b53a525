use crate::cpu::Cpu;
use crate::decode::{Instruction, OperandSize, Operation};
use crate::exceptions::{fault, Exception, ExecResult};
use crate::state::{gpr, EFlags};

use super::alu::{
    add_with_flags, dec_with_flags, inc_with_flags, logic_with_flags, set_szp, sub_with_flags,
};

/// ADD/OR/ADC/SBB/AND/SUB/XOR/CMP/TEST.
pub(super) fn binary(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    let dst = inst.operand(0);
    let src = inst.operand(1);
    let size = dst.size;
    let a = cpu.read_operand(inst, dst)?;
    let b = cpu.read_operand(inst, src)? & size.mask();

    let flags = &mut cpu.state.eflags;
    let carry = flags.contains(EFlags::CF);
    let result = match inst.operation {
        Operation::Add => add_with_flags(flags, a, b, false, size),
        Operation::Adc => add_with_flags(flags, a, b, carry, size),
        Operation::Sub | Operation::Cmp => sub_with_flags(flags, a, b, false, size),
        Operation::Sbb => sub_with_flags(flags, a, b, carry, size),
        Operation::And | Operation::Test => logic_with_flags(flags, a & b, size),
        Operation::Or => logic_with_flags(flags, a | b, size),
        _ => logic_with_flags(flags, a ^ b, size),
    };

    if !matches!(inst.operation, Operation::Cmp | Operation::Test) {
        cpu.write_operand(inst, dst, result)?;
    }
    Ok(())
}

/// INC/DEC/NEG/NOT.
pub(super) fn unary(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    let dst = inst.operand(0);
    let size = dst.size;
    let value = cpu.read_operand(inst, dst)?;
    let flags = &mut cpu.state.eflags;
    let result = match inst.operation {
        Operation::Inc => inc_with_flags(flags, value, size),
        Operation::Dec => dec_with_flags(flags, value, size),
        Operation::Neg => {
            let result = sub_with_flags(flags, 0, value, false, size);
            flags.set(EFlags::CF, value & size.mask() != 0);
            result
        }
        _ => !value & size.mask(),
    };
    cpu.write_operand(inst, dst, result)
}

fn set_multiply_flags(cpu: &mut Cpu, low: u32, size: OperandSize, overflow: bool) {
    let flags = &mut cpu.state.eflags;
    flags.set(EFlags::CF, overflow);
    flags.set(EFlags::OF, overflow);
    flags.remove(EFlags::AF);
    set_szp(flags, low, size);
}

/// MUL and the one-, two- and three-operand forms of IMUL.
pub(super) fn multiply(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    cpu.add_cycles(if inst.operand_size == OperandSize::Size8 { 4 } else { 9 });

    if !inst.operand(1).is_none() {
        // IMUL r, r/m[, imm]: truncated product in the destination.
        let size = inst.operand(0).size;
        let (a, b) = if inst.operand(2).is_none() {
            (inst.operand(0), inst.operand(1))
        } else {
            (inst.operand(1), inst.operand(2))
        };
        let a = i64::from(cpu.read_operand_signed(inst, a)? as i32);
        let b = i64::from(size.sign_extend(cpu.read_operand(inst, b)?) as i32);
        let product = a * b;
        let low = product as u32 & size.mask();
        let overflow = i64::from(size.sign_extend(low) as i32) != product;
        set_multiply_flags(cpu, low, size, overflow);
        return cpu.write_operand(inst, inst.operand(0), low);
    }

    let src = inst.operand(0);
    let size = src.size;
    let signed = inst.operation == Operation::Imul;
    let value = cpu.read_operand(inst, src)?;

    match size {
        OperandSize::Size8 => {
            let product = if signed {
                (i16::from(cpu.state.al() as i8) * i16::from(value as u8 as i8)) as u16
            } else {
                u16::from(cpu.state.al()) * (value as u16)
            };
            cpu.state.set_ax(product);
            let overflow = if signed {
                i16::from(product as u8 as i8) != product as i16
            } else {
                product >> 8 != 0
            };
            set_multiply_flags(cpu, u32::from(product), size, overflow);
        }
        OperandSize::Size16 => {
            let product = if signed {
                (i32::from(cpu.state.ax() as i16) * i32::from(value as u16 as i16)) as u32
            } else {
                u32::from(cpu.state.ax()) * (value & 0xFFFF)
            };
            cpu.state.set_ax(product as u16);
            cpu.state.set_dx((product >> 16) as u16);
            let overflow = if signed {
                i32::from(product as u16 as i16) != product as i32
            } else {
                product >> 16 != 0
            };
            set_multiply_flags(cpu, product, size, overflow);
        }
        OperandSize::Size32 | OperandSize::Size64 => {
            let product = if signed {
                (i64::from(cpu.state.eax() as i32) * i64::from(value as i32)) as u64
            } else {
                u64::from(cpu.state.eax()) * u64::from(value)
            };
            cpu.state.set_reg32(gpr::EAX, product as u32);
            cpu.state.set_reg32(gpr::EDX, (product >> 32) as u32);
            let overflow = if signed {
                i64::from(product as u32 as i32) != product as i64
            } else {
                product >> 32 != 0
            };
            set_multiply_flags(cpu, product as u32, OperandSize::Size32, overflow);
        }
    }
    Ok(())
}

/// DIV/IDIV. A zero divisor or a quotient that does not fit raises #DE
/// before any register is written.
pub(super) fn divide(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    let src = inst.operand(0);
    let size = src.size;
    let signed = inst.operation == Operation::Idiv;
    let divisor = cpu.read_operand(inst, src)?;
    cpu.add_cycles(if size == OperandSize::Size8 { 16 } else { 24 });

    if divisor & size.mask() == 0 {
        return fault(Exception::DivideError);
    }

    let bits = size.bits().min(32);
    let dividend: u64 = match size {
        OperandSize::Size8 => u64::from(cpu.state.ax()),
        OperandSize::Size16 => (u64::from(cpu.state.dx()) << 16) | u64::from(cpu.state.ax()),
        _ => (u64::from(cpu.state.edx()) << 32) | u64::from(cpu.state.eax()),
    };

    let (quotient, remainder) = if signed {
        // Sign-extend the double-width dividend.
        let shift = 64 - 2 * bits;
        let dividend = ((dividend << shift) as i64) >> shift;
        let divisor = i64::from(size.sign_extend(divisor) as i32);
        let Some(quotient) = dividend.checked_div(divisor) else {
            return fault(Exception::DivideError);
        };
        let remainder = dividend % divisor;
        let max = (1i64 << (bits - 1)) - 1;
        let min = -(1i64 << (bits - 1));
        if quotient > max || quotient < min {
            return fault(Exception::DivideError);
        }
        (quotient as u32, remainder as u32)
    } else {
        let divisor = u64::from(divisor & size.mask());
        let quotient = dividend / divisor;
        if quotient > u64::from(size.mask()) {
            return fault(Exception::DivideError);
        }
        (quotient as u32, (dividend % divisor) as u32)
    };

    let mask = size.mask();
    match size {
        OperandSize::Size8 => {
            cpu.state.set_al(quotient as u8);
            cpu.state.set_ah(remainder as u8);
        }
        OperandSize::Size16 => {
            cpu.state.set_ax((quotient & mask) as u16);
            cpu.state.set_dx((remainder & mask) as u16);
        }
        _ => {
            cpu.state.set_reg32(gpr::EAX, quotient);
            cpu.state.set_reg32(gpr::EDX, remainder);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::interp::test_util::{real_mode_cpu, run};
    use crate::interp::InstructionOutcome;
    use crate::state::{gpr, EFlags, Segment};

    #[test]
    fn add_al_7f_plus_1() {
        let mut cpu = real_mode_cpu();
        // mov al, 0x7f ; add al, 1
        run(&mut cpu, &[0xB0, 0x7F, 0x04, 0x01]);
        assert_eq!(cpu.state.al(), 0x80);
        let flags = cpu.state.eflags;
        assert!(flags.contains(EFlags::OF | EFlags::SF | EFlags::AF));
        assert!(!flags.intersects(EFlags::ZF | EFlags::CF | EFlags::PF));
    }

    #[test]
    fn sub_with_memory_destination() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_u16(0x0200, 0x0010);
        // sub word [0x200], 0x11
        run(&mut cpu, &[0x83, 0x2E, 0x00, 0x02, 0x11]);
        assert_eq!(cpu.bus.read_u16(0x0200), 0xFFFF);
        assert!(cpu.state.flag(EFlags::CF));
    }

    #[test]
    fn neg_sets_carry_unless_zero() {
        let mut cpu = real_mode_cpu();
        // mov bl, 5 ; neg bl
        run(&mut cpu, &[0xB3, 0x05, 0xF6, 0xDB]);
        assert_eq!(cpu.state.reg8(3), 0xFB);
        assert!(cpu.state.flag(EFlags::CF));
        // xor bl, bl ; neg bl
        run(&mut cpu, &[0x30, 0xDB, 0xF6, 0xDB]);
        assert!(!cpu.state.flag(EFlags::CF));
        assert!(cpu.state.flag(EFlags::ZF));
    }

    #[test]
    fn mul_sets_carry_from_high_half() {
        let mut cpu = real_mode_cpu();
        // mov ax, 0x100 ; mov cx, 0x100 ; mul cx
        run(&mut cpu, &[0xB8, 0x00, 0x01, 0xB9, 0x00, 0x01, 0xF7, 0xE1]);
        assert_eq!(cpu.state.ax(), 0);
        assert_eq!(cpu.state.dx(), 1);
        assert!(cpu.state.flag(EFlags::CF) && cpu.state.flag(EFlags::OF));
    }

    #[test]
    fn imul_three_operand_truncates() {
        let mut cpu = real_mode_cpu();
        // mov bx, -3 ; imul ax, bx, 7
        run(&mut cpu, &[0xBB, 0xFD, 0xFF, 0x6B, 0xC3, 0x07]);
        assert_eq!(cpu.state.ax(), (-21i16) as u16);
        assert!(!cpu.state.flag(EFlags::OF));
    }

    fn install_de_handler(cpu: &mut crate::cpu::Cpu) {
        cpu.bus.write_u16(2, 0x0200);
    }

    #[test]
    fn divide_by_zero_leaves_registers_untouched() {
        let mut cpu = real_mode_cpu();
        install_de_handler(&mut cpu);
        cpu.state.set_reg32(gpr::EAX, 0x1234);
        cpu.state.set_reg32(gpr::EDX, 0x5678);
        // div cx (cx = 0)
        assert_eq!(run(&mut cpu, &[0xF7, 0xF1]), InstructionOutcome::Faulted);
        assert_eq!(cpu.state.eax(), 0x1234);
        assert_eq!(cpu.state.edx(), 0x5678);
        assert_eq!(cpu.state.selector(Segment::CS), 0x0200);
        // The return address is the DIV itself.
        assert_eq!(cpu.bus.read_u16(0x8000 - 6), 0);
    }

    #[test]
    fn zero_divisor_faults_at_every_width() {
        // nop ; {div,idiv} {bl,bx,ebx}
        let cases: [(&str, &[u8]); 6] = [
            ("div bl", &[0x90, 0xF6, 0xF3]),
            ("idiv bl", &[0x90, 0xF6, 0xFB]),
            ("div bx", &[0x90, 0xF7, 0xF3]),
            ("idiv bx", &[0x90, 0xF7, 0xFB]),
            ("div ebx", &[0x90, 0x66, 0xF7, 0xF3]),
            ("idiv ebx", &[0x90, 0x66, 0xF7, 0xFB]),
        ];
        for (name, code) in cases {
            let mut cpu = real_mode_cpu();
            install_de_handler(&mut cpu);
            cpu.state.set_reg32(gpr::EAX, 0x1234_5678);
            cpu.state.set_reg32(gpr::EDX, 0x9ABC_DEF0);
            cpu.state.set_reg32(gpr::EBX, 0);

            assert_eq!(run(&mut cpu, code), InstructionOutcome::Faulted, "{name}");
            assert_eq!(cpu.state.eax(), 0x1234_5678, "{name}");
            assert_eq!(cpu.state.edx(), 0x9ABC_DEF0, "{name}");
            assert_eq!(cpu.state.selector(Segment::CS), 0x0200, "{name}");
            // The frame points at the divide, past the nop.
            assert_eq!(cpu.bus.read_u16(0x8000 - 6), 1, "{name}");
            assert_eq!(cpu.bus.read_u16(0x8000 - 4), 0x0100, "{name}");
        }
    }

    #[test]
    fn quotient_overflow_faults() {
        let mut cpu = real_mode_cpu();
        install_de_handler(&mut cpu);
        // mov ax, 0x1000 ; mov bl, 2 ; div bl  -> quotient 0x800 does not fit
        assert_eq!(run(&mut cpu, &[0xB8, 0x00, 0x10, 0xB3, 0x02, 0xF6, 0xF3]), InstructionOutcome::Faulted);
        assert_eq!(cpu.state.ax(), 0x1000);
    }

    #[test]
    fn idiv_rounds_toward_zero() {
        let mut cpu = real_mode_cpu();
        // mov ax, -7 ; cwd ; mov cx, 2 ; idiv cx
        run(&mut cpu, &[0xB8, 0xF9, 0xFF, 0x99, 0xB9, 0x02, 0x00, 0xF7, 0xF9]);
        assert_eq!(cpu.state.ax() as i16, -3);
        assert_eq!(cpu.state.dx() as i16, -1);
    }

    #[test]
    fn idiv_most_negative_by_minus_one_faults() {
        let mut cpu = real_mode_cpu();
        install_de_handler(&mut cpu);
        cpu.state.set_reg32(gpr::EAX, 0);
        cpu.state.set_reg32(gpr::EDX, 0x8000_0000);
        cpu.state.set_reg32(gpr::ECX, 0xFFFF_FFFF);
        // idiv ecx
        assert_eq!(run(&mut cpu, &[0x66, 0xF7, 0xF9]), InstructionOutcome::Faulted);
        assert_eq!(cpu.state.edx(), 0x8000_0000);
    }
}
