//! Data movement, conversions and the atomic read-modify-write group.

use crate::cpu::Cpu;
use crate::decode::{Instruction, OperandMode, OperandSize, Operation};
use crate::exceptions::ExecResult;
use crate::state::{gpr, EFlags, Segment};

use super::alu::{add_with_flags, sub_with_flags};

const LAHF_MASK: u32 = 0xD5;

pub(super) fn execute(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    let dst = inst.operand(0);
    let src = inst.operand(1);

    match inst.operation {
        Operation::Mov | Operation::Movzx => {
            let value = cpu.read_operand(inst, src)?;
            cpu.write_operand(inst, dst, value)?;
        }
        Operation::Movsx => {
            let value = cpu.read_operand_signed(inst, src)?;
            cpu.write_operand(inst, dst, value)?;
        }
        Operation::MovSegment => {
            let value = cpu.read_operand(inst, src)?;
            cpu.write_operand(inst, dst, value)?;
            if dst.mode == OperandMode::ModRmSegmentReg && inst.data.modrm_reg() == Segment::SS as u8 {
                cpu.events.interrupt_shadow = true;
            }
        }
        Operation::Xchg => {
            let a = cpu.read_operand(inst, dst)?;
            let b = cpu.read_operand(inst, src)?;
            cpu.write_operand(inst, dst, b)?;
            cpu.write_operand(inst, src, a)?;
        }
        Operation::Lea => {
            let offset = inst.data.effective_address(&cpu.state);
            cpu.write_operand(inst, dst, offset)?;
        }
        Operation::LoadFarPointer(seg) => {
            let (offset, selector) = cpu.read_far_pointer(inst, src)?;
            cpu.load_segment(seg, selector)?;
            cpu.write_operand(inst, dst, offset)?;
        }
        Operation::Cbw => {
            if inst.operand_size == OperandSize::Size32 {
                let value = cpu.state.ax() as i16 as i32 as u32;
                cpu.state.set_reg32(gpr::EAX, value);
            } else {
                let value = cpu.state.al() as i8 as i16 as u16;
                cpu.state.set_ax(value);
            }
        }
        Operation::Cwd => {
            if inst.operand_size == OperandSize::Size32 {
                let high = if cpu.state.eax() & 0x8000_0000 != 0 { u32::MAX } else { 0 };
                cpu.state.set_reg32(gpr::EDX, high);
            } else {
                let high = if cpu.state.ax() & 0x8000 != 0 { 0xFFFF } else { 0 };
                cpu.state.set_dx(high);
            }
        }
        Operation::Xlat => {
            let base = if inst.data.address_size_32 {
                cpu.state.ebx()
            } else {
                u32::from(cpu.state.reg16(gpr::EBX))
            };
            let offset = base.wrapping_add(u32::from(cpu.state.al())) & inst.data.address_mask();
            let value = cpu.read_mem::<u8>(inst.data.segment, offset)?;
            cpu.state.set_al(value);
        }
        Operation::Bswap => {
            let value = cpu.read_operand(inst, dst)?;
            cpu.write_operand(inst, dst, value.swap_bytes())?;
        }
        Operation::Lahf => {
            let value = (cpu.state.eflags_raw() & LAHF_MASK) | EFlags::FIXED.bits();
            cpu.state.set_ah(value as u8);
        }
        Operation::Sahf => {
            let old = cpu.state.eflags_raw();
            let value = (old & !LAHF_MASK) | (u32::from(cpu.state.ah()) & LAHF_MASK);
            cpu.state.set_eflags_raw(value);
        }
        Operation::Salc => {
            let value = if cpu.state.flag(EFlags::CF) { 0xFF } else { 0 };
            cpu.state.set_al(value);
        }
        Operation::Cmovcc(condition) => {
            // The source is read (and may fault) whether or not the move happens.
            let value = cpu.read_operand(inst, src)?;
            if condition.test(cpu.state.eflags) {
                cpu.write_operand(inst, dst, value)?;
            }
        }
        Operation::Setcc(condition) => {
            let value = u32::from(condition.test(cpu.state.eflags));
            cpu.write_operand(inst, dst, value)?;
        }
        Operation::Xadd => {
            let a = cpu.read_operand(inst, dst)?;
            let b = cpu.read_operand(inst, src)?;
            let sum = add_with_flags(&mut cpu.state.eflags, a, b, false, dst.size);
            if inst.data.modrm_rm_is_register() {
                cpu.write_operand(inst, src, a)?;
                cpu.write_operand(inst, dst, sum)?;
            } else {
                cpu.write_operand(inst, dst, sum)?;
                cpu.write_operand(inst, src, a)?;
            }
        }
        Operation::Cmpxchg => {
            let size = dst.size;
            let accumulator = cpu.read_register_operand(gpr::EAX as u8, size);
            let current = cpu.read_operand(inst, dst)?;
            sub_with_flags(&mut cpu.state.eflags, accumulator, current, false, size);
            if accumulator == current {
                let value = cpu.read_operand(inst, src)?;
                cpu.write_operand(inst, dst, value)?;
            } else {
                // The destination is written back unchanged, as the locked
                // bus cycle does.
                cpu.write_operand(inst, dst, current)?;
                cpu.write_register_operand(gpr::EAX as u8, size, current);
            }
        }
        Operation::Cmpxchg8b => {
            let mem = cpu.memory_operand(inst, dst);
            let current = cpu.read_mem::<u64>(mem.segment, mem.offset)?;
            let expected = (u64::from(cpu.state.edx()) << 32) | u64::from(cpu.state.eax());
            if current == expected {
                let value = (u64::from(cpu.state.ecx()) << 32) | u64::from(cpu.state.ebx());
                cpu.write_mem::<u64>(mem.segment, mem.offset, value)?;
                cpu.state.eflags.insert(EFlags::ZF);
            } else {
                cpu.write_mem::<u64>(mem.segment, mem.offset, current)?;
                cpu.state.set_reg32(gpr::EAX, current as u32);
                cpu.state.set_reg32(gpr::EDX, (current >> 32) as u32);
                cpu.state.eflags.remove(EFlags::ZF);
            }
        }
        _ => unreachable!("{:?} is not a data operation", inst.operation),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::interp::test_util::{real_mode_cpu, run};
    use crate::state::{gpr, EFlags, Segment};

    #[test]
    fn lea_truncates_to_operand_size() {
        let mut cpu = real_mode_cpu();
        cpu.state.set_reg32(gpr::EBX, 0xFFF0);
        // lea ax, [bx+0x20]
        run(&mut cpu, &[0x8D, 0x47, 0x20]);
        assert_eq!(cpu.state.ax(), 0x0010);
    }

    #[test]
    fn lds_loads_segment_and_offset() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_u16(0x0300, 0x1234);
        cpu.bus.write_u16(0x0302, 0x2000);
        // lds si, [0x300]
        run(&mut cpu, &[0xC5, 0x36, 0x00, 0x03]);
        assert_eq!(cpu.state.reg16(gpr::ESI), 0x1234);
        assert_eq!(cpu.state.selector(Segment::DS), 0x2000);
        assert_eq!(cpu.state.segment(Segment::DS).cache.base, 0x20000);
    }

    #[test]
    fn xlat_uses_segment_override() {
        let mut cpu = real_mode_cpu();
        cpu.state.set_reg32(gpr::EBX, 0x10);
        cpu.bus.write_u8(0x1000 + 0x13, 0xAB);
        // mov al, 3 ; cs xlat
        run(&mut cpu, &[0xB0, 0x03, 0x2E, 0xD7]);
        assert_eq!(cpu.state.al(), 0xAB);
    }

    #[test]
    fn sign_extension_family() {
        let mut cpu = real_mode_cpu();
        // mov al, 0x80 ; cbw ; cwd ; movsx ecx, al ; movzx edx, al
        run(
            &mut cpu,
            &[0xB0, 0x80, 0x98, 0x99, 0x66, 0x0F, 0xBE, 0xC8, 0x66, 0x0F, 0xB6, 0xD0],
        );
        assert_eq!(cpu.state.ax(), 0xFF80);
        assert_eq!(cpu.state.ecx(), 0xFFFF_FF80);
        assert_eq!(cpu.state.edx(), 0x0000_0080);
    }

    #[test]
    fn cmpxchg_success_and_failure() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_u16(0x0300, 5);
        cpu.state.set_reg32(gpr::EAX, 5);
        cpu.state.set_reg32(gpr::ECX, 9);
        // cmpxchg [0x300], cx
        run(&mut cpu, &[0x0F, 0xB1, 0x0E, 0x00, 0x03]);
        assert_eq!(cpu.bus.read_u16(0x0300), 9);
        assert!(cpu.state.flag(EFlags::ZF));

        run(&mut cpu, &[0x0F, 0xB1, 0x0E, 0x00, 0x03]);
        assert_eq!(cpu.state.ax(), 9);
        assert!(!cpu.state.flag(EFlags::ZF));
    }

    #[test]
    fn xadd_exchanges_and_adds() {
        let mut cpu = real_mode_cpu();
        cpu.state.set_reg32(gpr::EAX, 2);
        cpu.state.set_reg32(gpr::EBX, 3);
        // xadd ax, bx
        run(&mut cpu, &[0x0F, 0xC1, 0xD8]);
        assert_eq!(cpu.state.ax(), 5);
        assert_eq!(cpu.state.reg16(gpr::EBX), 2);
    }

    #[test]
    fn cmpxchg8b_compares_edx_eax() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_u64(0x0300, 0x1111_2222_3333_4444);
        cpu.state.set_reg32(gpr::EDX, 0x1111_2222);
        cpu.state.set_reg32(gpr::EAX, 0x3333_4444);
        cpu.state.set_reg32(gpr::ECX, 0xAAAA_BBBB);
        cpu.state.set_reg32(gpr::EBX, 0xCCCC_DDDD);
        // cmpxchg8b [0x300]
        run(&mut cpu, &[0x0F, 0xC7, 0x0E, 0x00, 0x03]);
        assert_eq!(cpu.bus.read_u64(0x0300), 0xAAAA_BBBB_CCCC_DDDD);
        assert!(cpu.state.flag(EFlags::ZF));
    }

    #[test]
    fn lahf_sahf_round_trip() {
        let mut cpu = real_mode_cpu();
        cpu.state.eflags |= EFlags::CF | EFlags::ZF | EFlags::OF;
        // lahf ; clc ; sahf
        run(&mut cpu, &[0x9F, 0xF8, 0x9E]);
        assert!(cpu.state.flag(EFlags::CF));
        assert!(cpu.state.flag(EFlags::ZF));
        assert!(cpu.state.flag(EFlags::OF));
        assert_eq!(cpu.state.ah() & 0x02, 0x02);
    }
}
