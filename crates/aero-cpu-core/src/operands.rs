//! Operand access: maps an [`Operand`] of a decoded instruction onto the
//! register file or a segmented memory location.

use crate::cpu::Cpu;
use crate::decode::{Instruction, Operand, OperandMode, OperandSize};
use crate::exceptions::{ud, ExecResult};
use crate::state::Segment;

/// Resolved location of a ModRM or moffs memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MemoryOperand {
    pub segment: Segment,
    pub offset: u32,
}

impl Cpu {
    pub(crate) fn read_register_operand(&self, reg: u8, size: OperandSize) -> u32 {
        let reg = usize::from(reg);
        match size {
            OperandSize::Size8 => u32::from(self.state.reg8(reg)),
            OperandSize::Size16 => u32::from(self.state.reg16(reg)),
            OperandSize::Size32 | OperandSize::Size64 => self.state.reg32(reg),
        }
    }

    pub(crate) fn write_register_operand(&mut self, reg: u8, size: OperandSize, value: u32) {
        let reg = usize::from(reg);
        match size {
            OperandSize::Size8 => self.state.set_reg8(reg, value as u8),
            OperandSize::Size16 => self.state.set_reg16(reg, value as u16),
            OperandSize::Size32 | OperandSize::Size64 => self.state.set_reg32(reg, value),
        }
    }

    /// Memory location of a ModRM r/m or moffs operand. Idempotent.
    pub(crate) fn memory_operand(&self, inst: &Instruction, operand: Operand) -> MemoryOperand {
        let offset = match operand.mode {
            OperandMode::Memory => inst.data.displacement & inst.data.address_mask(),
            _ => inst.data.effective_address(&self.state),
        };
        MemoryOperand {
            segment: inst.data.segment,
            offset,
        }
    }

    /// Reads an operand zero-extended to 32 bits.
    pub(crate) fn read_operand(&mut self, inst: &Instruction, operand: Operand) -> ExecResult<u32> {
        let size = operand.size;
        Ok(match operand.mode {
            OperandMode::None => 0,
            OperandMode::Register(reg) => self.read_register_operand(reg, size),
            OperandMode::SegmentRegister(seg) => u32::from(self.state.selector(seg)),
            OperandMode::ModRmReg => self.read_register_operand(inst.data.modrm_reg(), size),
            OperandMode::ModRmRm if inst.data.modrm_rm_is_register() => {
                self.read_register_operand(inst.data.modrm_rm(), size)
            }
            OperandMode::ModRmRm | OperandMode::Memory => {
                let mem = self.memory_operand(inst, operand);
                self.read_mem_sized(mem.segment, mem.offset, size.bytes().min(4))?
            }
            OperandMode::ModRmSegmentReg => {
                let seg = Segment::from_encoding(inst.data.modrm_reg()).map_or_else(ud, Ok)?;
                u32::from(self.state.selector(seg))
            }
            OperandMode::ModRmControlReg => match inst.data.modrm_reg() {
                0 => self.state.cr0.bits(),
                2 => self.state.cr2,
                3 => self.state.cr3,
                4 => self.state.cr4.bits(),
                _ => return ud(),
            },
            OperandMode::ModRmDebugReg => self.state.dr[usize::from(inst.data.modrm_reg())],
            OperandMode::ModRmTestReg => self.state.tr[usize::from(inst.data.modrm_reg())],
            OperandMode::Immediate => inst.data.immediate & size.mask(),
            OperandMode::Immediate2 => inst.data.immediate2 & size.mask(),
            OperandMode::Relative => self.relative_target(inst, operand),
            OperandMode::FarAddress => inst.data.immediate,
            OperandMode::Constant(value) => value,
        })
    }

    /// Reads an operand sign-extended from its width to 32 bits.
    pub(crate) fn read_operand_signed(&mut self, inst: &Instruction, operand: Operand) -> ExecResult<u32> {
        let value = self.read_operand(inst, operand)?;
        Ok(operand.size.sign_extend(value))
    }

    pub(crate) fn write_operand(&mut self, inst: &Instruction, operand: Operand, value: u32) -> ExecResult<()> {
        let size = operand.size;
        match operand.mode {
            OperandMode::Register(reg) => self.write_register_operand(reg, size, value),
            OperandMode::ModRmReg => self.write_register_operand(inst.data.modrm_reg(), size, value),
            OperandMode::ModRmRm if inst.data.modrm_rm_is_register() => {
                self.write_register_operand(inst.data.modrm_rm(), size, value)
            }
            OperandMode::ModRmRm | OperandMode::Memory => {
                let mem = self.memory_operand(inst, operand);
                self.write_mem_sized(mem.segment, mem.offset, size.bytes().min(4), value)?;
            }
            OperandMode::SegmentRegister(seg) => self.load_segment(seg, value as u16)?,
            OperandMode::ModRmSegmentReg => {
                let seg = Segment::from_encoding(inst.data.modrm_reg()).map_or_else(ud, Ok)?;
                self.load_segment(seg, value as u16)?;
            }
            OperandMode::ModRmDebugReg => self.state.dr[usize::from(inst.data.modrm_reg())] = value,
            OperandMode::ModRmTestReg => self.state.tr[usize::from(inst.data.modrm_reg())] = value,
            OperandMode::ModRmControlReg
            | OperandMode::None
            | OperandMode::Immediate
            | OperandMode::Immediate2
            | OperandMode::Relative
            | OperandMode::FarAddress
            | OperandMode::Constant(_) => {
                unreachable!("operand {:?} of {:?} is not writable", operand.mode, inst.operation)
            }
        }
        Ok(())
    }

    /// Target of a relative branch: next EIP plus displacement, truncated to
    /// the operand size.
    pub(crate) fn relative_target(&self, inst: &Instruction, operand: Operand) -> u32 {
        self.state.eip.wrapping_add(inst.data.immediate) & operand.size.mask()
    }

    /// Reads a `m16:16` / `m16:32` far pointer operand: (offset, selector).
    pub(crate) fn read_far_pointer(&mut self, inst: &Instruction, operand: Operand) -> ExecResult<(u32, u16)> {
        let mem = self.memory_operand(inst, operand);
        let width = operand.size.bytes();
        let offset = self.read_mem_sized(mem.segment, mem.offset, width)?;
        let selector = self.read_mem::<u16>(mem.segment, mem.offset.wrapping_add(width))?;
        Ok((offset, selector))
    }
}
