//! Shifts and rotates. Counts are masked to 5 bits; a masked count of zero
//! leaves the destination and all flags untouched. Shifts clear AF; rotates
//! leave it alone.

use crate::cpu::Cpu;
use crate::decode::{Instruction, OperandSize, Operation};
use crate::exceptions::ExecResult;
use crate::state::EFlags;

use super::alu::set_szp;

#[inline]
fn msb(value: u32, size: OperandSize) -> bool {
    value & size.sign_bit() != 0
}

pub(super) fn shift(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    let dst = inst.operand(0);
    let size = dst.size;
    let count = cpu.read_operand(inst, inst.operand(1))? & 0x1F;
    if count == 0 {
        return Ok(());
    }
    let value = cpu.read_operand(inst, dst)?;
    let width = size.bits();
    let mask = size.mask();
    let flags = &mut cpu.state.eflags;

    let result = match inst.operation {
        Operation::Shl => {
            let shifted = u64::from(value) << count;
            let result = shifted as u32 & mask;
            let carry = (shifted >> width) & 1 != 0;
            flags.set(EFlags::CF, carry);
            flags.set(EFlags::OF, count == 1 && (msb(result, size) != carry));
            flags.remove(EFlags::AF);
            set_szp(flags, result, size);
            result
        }
        Operation::Shr => {
            let carry = (value >> (count - 1)) & 1 != 0;
            let result = value >> count;
            flags.set(EFlags::CF, carry);
            flags.set(EFlags::OF, count == 1 && msb(value, size));
            flags.remove(EFlags::AF);
            set_szp(flags, result, size);
            result
        }
        Operation::Sar => {
            let signed = size.sign_extend(value) as i32;
            flags.set(EFlags::CF, (signed >> (count - 1)) & 1 != 0);
            let result = (signed >> count) as u32 & mask;
            flags.remove(EFlags::OF | EFlags::AF);
            set_szp(flags, result, size);
            result
        }
        Operation::Rol => {
            let rotate = count & (width - 1);
            let result = if rotate == 0 {
                value
            } else {
                ((value << rotate) | (value >> (width - rotate))) & mask
            };
            let carry = result & 1 != 0;
            flags.set(EFlags::CF, carry);
            flags.set(EFlags::OF, carry != msb(result, size));
            if rotate == 0 {
                return Ok(());
            }
            result
        }
        Operation::Ror => {
            let rotate = count & (width - 1);
            let result = if rotate == 0 {
                value
            } else {
                ((value >> rotate) | (value << (width - rotate))) & mask
            };
            let top = msb(result, size);
            flags.set(EFlags::CF, top);
            flags.set(EFlags::OF, top != (result & (size.sign_bit() >> 1) != 0));
            if rotate == 0 {
                return Ok(());
            }
            result
        }
        Operation::Rcl => {
            let mut result = value;
            let mut carry = flags.contains(EFlags::CF);
            for _ in 0..count {
                let out = msb(result, size);
                result = ((result << 1) | u32::from(carry)) & mask;
                carry = out;
            }
            flags.set(EFlags::CF, carry);
            flags.set(EFlags::OF, msb(result, size) != carry);
            result
        }
        _ => {
            let mut result = value;
            let mut carry = flags.contains(EFlags::CF);
            for _ in 0..count {
                let out = result & 1 != 0;
                result = (result >> 1) | (u32::from(carry) << (width - 1));
                carry = out;
            }
            flags.set(EFlags::CF, carry);
            flags.set(
                EFlags::OF,
                msb(result, size) != (result & (size.sign_bit() >> 1) != 0),
            );
            result
        }
    };
    cpu.add_cycles(u64::from(count) / 4);
    cpu.write_operand(inst, dst, result)
}

/// SHLD/SHRD. Counts beyond the operand width (16-bit forms only) shift
/// through the concatenated register pair.
pub(super) fn double_shift(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    let dst = inst.operand(0);
    let size = dst.size;
    let count = cpu.read_operand(inst, inst.operand(2))? & 0x1F;
    if count == 0 {
        return Ok(());
    }
    let value = cpu.read_operand(inst, dst)?;
    let fill = cpu.read_operand(inst, inst.operand(1))?;
    let width = size.bits();
    let mask = size.mask();

    let (result, carry) = if inst.operation == Operation::Shld {
        let pair = (u64::from(value) << width) | u64::from(fill);
        let shifted = pair << count;
        let result = (shifted >> width) as u32 & mask;
        let carry = (pair >> (2 * width - count)) & 1 != 0;
        (result, carry)
    } else {
        let pair = (u64::from(fill) << width) | u64::from(value);
        let result = (pair >> count) as u32 & mask;
        let carry = (pair >> (count - 1)) & 1 != 0;
        (result, carry)
    };

    let flags = &mut cpu.state.eflags;
    flags.set(EFlags::CF, carry);
    flags.set(EFlags::OF, count == 1 && msb(result, size) != msb(value, size));
    flags.remove(EFlags::AF);
    set_szp(flags, result, size);
    cpu.write_operand(inst, dst, result)
}
