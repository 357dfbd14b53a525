use crate::cpu::Cpu;
use crate::decode::{Instruction, OperandMode, Operation};
use crate::exceptions::ExecResult;
use crate::state::EFlags;

/// BT/BTS/BTR/BTC. With a register bit offset and a memory base, the offset
/// is signed and may address outside the operand.
pub(super) fn bit_test(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    let base = inst.operand(0);
    let size = base.size;
    let bits = size.bits();
    let offset = cpu.read_operand(inst, inst.operand(1))?;

    let memory_base = base.mode == OperandMode::ModRmRm && !inst.data.modrm_rm_is_register();
    let register_offset = inst.operand(1).mode != OperandMode::Immediate;

    let apply = |value: u32, bit: u32, flags: &mut EFlags| -> Option<u32> {
        let mask = 1u32 << bit;
        flags.set(EFlags::CF, value & mask != 0);
        match inst.operation {
            Operation::Bts => Some(value | mask),
            Operation::Btr => Some(value & !mask),
            Operation::Btc => Some(value ^ mask),
            _ => None,
        }
    };

    if memory_base && register_offset {
        let signed = size.sign_extend(offset) as i32;
        let displacement = signed.div_euclid(bits as i32) * size.bytes() as i32;
        let bit = signed.rem_euclid(bits as i32) as u32;
        let mem = cpu.memory_operand(inst, base);
        let address = mem.offset.wrapping_add(displacement as u32) & inst.data.address_mask();
        let value = cpu.read_mem_sized(mem.segment, address, size.bytes())?;
        if let Some(updated) = apply(value, bit, &mut cpu.state.eflags) {
            cpu.write_mem_sized(mem.segment, address, size.bytes(), updated)?;
        }
        return Ok(());
    }

    let bit = offset & (bits - 1);
    let value = cpu.read_operand(inst, base)?;
    if let Some(updated) = apply(value, bit, &mut cpu.state.eflags) {
        cpu.write_operand(inst, base, updated)?;
    }
    Ok(())
}

/// BSF/BSR: ZF=1 and the destination unchanged for a zero source.
pub(super) fn bit_scan(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    let source = cpu.read_operand(inst, inst.operand(1))?;
    if source == 0 {
        cpu.state.eflags.insert(EFlags::ZF);
        return Ok(());
    }
    cpu.state.eflags.remove(EFlags::ZF);
    let index = if inst.operation == Operation::Bsf {
        source.trailing_zeros()
    } else {
        31 - source.leading_zeros()
    };
    cpu.add_cycles(u64::from(index) / 8);
    cpu.write_operand(inst, inst.operand(0), index)
}
