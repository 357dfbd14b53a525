//! Decimal adjust instructions.

use crate::cpu::Cpu;
use crate::decode::{Instruction, OperandSize, Operation};
use crate::exceptions::{fault, Exception, ExecResult};
use crate::state::EFlags;

use super::alu::set_szp;

pub(super) fn execute(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    let al = cpu.state.al();
    let flags = cpu.state.eflags;
    let low_digit_adjust = al & 0x0F > 9 || flags.contains(EFlags::AF);

    match inst.operation {
        Operation::Daa | Operation::Das => {
            let carry_in = flags.contains(EFlags::CF);
            let subtract = inst.operation == Operation::Das;
            let mut result = al;
            let mut carry = false;
            let mut aux = false;
            if low_digit_adjust {
                let (adjusted, overflow) = if subtract {
                    result.overflowing_sub(6)
                } else {
                    result.overflowing_add(6)
                };
                result = adjusted;
                carry = carry_in || overflow;
                aux = true;
            }
            if al > 0x99 || carry_in {
                result = if subtract {
                    result.wrapping_sub(0x60)
                } else {
                    result.wrapping_add(0x60)
                };
                carry = true;
            }
            cpu.state.set_al(result);
            let flags = &mut cpu.state.eflags;
            flags.set(EFlags::CF, carry);
            flags.set(EFlags::AF, aux);
            flags.remove(EFlags::OF);
            set_szp(flags, u32::from(result), OperandSize::Size8);
        }
        Operation::Aaa | Operation::Aas => {
            if low_digit_adjust {
                let ax = cpu.state.ax();
                let ax = if inst.operation == Operation::Aaa {
                    ax.wrapping_add(0x106)
                } else {
                    ax.wrapping_sub(6).wrapping_sub(0x100)
                };
                cpu.state.set_ax(ax);
            }
            cpu.state.set_al(cpu.state.al() & 0x0F);
            let flags = &mut cpu.state.eflags;
            flags.set(EFlags::AF, low_digit_adjust);
            flags.set(EFlags::CF, low_digit_adjust);
        }
        Operation::Aam => {
            let base = inst.data.immediate as u8;
            if base == 0 {
                return fault(Exception::DivideError);
            }
            cpu.state.set_ah(al / base);
            cpu.state.set_al(al % base);
            let flags = &mut cpu.state.eflags;
            flags.remove(EFlags::CF | EFlags::OF | EFlags::AF);
            set_szp(flags, u32::from(al % base), OperandSize::Size8);
            cpu.add_cycles(15);
        }
        _ => {
            let base = inst.data.immediate as u8;
            let result = al.wrapping_add(cpu.state.ah().wrapping_mul(base));
            cpu.state.set_ax(u16::from(result));
            let flags = &mut cpu.state.eflags;
            flags.remove(EFlags::CF | EFlags::OF | EFlags::AF);
            set_szp(flags, u32::from(result), OperandSize::Size8);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::interp::test_util::{real_mode_cpu, run};
    use crate::interp::InstructionOutcome;
    use crate::state::EFlags;

    #[test]
    fn daa_after_packed_add() {
        let mut cpu = real_mode_cpu();
        // mov al, 0x38 ; add al, 0x45 ; daa
        run(&mut cpu, &[0xB0, 0x38, 0x04, 0x45, 0x27]);
        assert_eq!(cpu.state.al(), 0x83);
        assert!(!cpu.state.flag(EFlags::CF));

        // mov al, 0x99 ; add al, 0x01 ; daa
        run(&mut cpu, &[0xB0, 0x99, 0x04, 0x01, 0x27]);
        assert_eq!(cpu.state.al(), 0x00);
        assert!(cpu.state.flag(EFlags::CF));
        assert!(cpu.state.flag(EFlags::ZF));
    }

    #[test]
    fn das_after_packed_sub() {
        let mut cpu = real_mode_cpu();
        // mov al, 0x42 ; sub al, 0x15 ; das
        run(&mut cpu, &[0xB0, 0x42, 0x2C, 0x15, 0x2F]);
        assert_eq!(cpu.state.al(), 0x27);
        assert!(!cpu.state.flag(EFlags::CF));
    }

    #[test]
    fn aaa_carries_into_ah() {
        let mut cpu = real_mode_cpu();
        // mov ax, 0x0009 ; add al, 3 ; aaa
        run(&mut cpu, &[0xB8, 0x09, 0x00, 0x04, 0x03, 0x37]);
        assert_eq!(cpu.state.ax(), 0x0102);
        assert!(cpu.state.flag(EFlags::CF));
    }

    #[test]
    fn aam_and_aad() {
        let mut cpu = real_mode_cpu();
        // mov al, 79 ; aam
        run(&mut cpu, &[0xB0, 79, 0xD4, 0x0A]);
        assert_eq!(cpu.state.ax(), 0x0709);
        // aad
        run(&mut cpu, &[0xD5, 0x0A]);
        assert_eq!(cpu.state.ax(), 79);
    }

    #[test]
    fn aam_zero_base_is_divide_error() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_u16(2, 0x0200);
        assert_eq!(run(&mut cpu, &[0xD4, 0x00]), InstructionOutcome::Faulted);
    }
}
