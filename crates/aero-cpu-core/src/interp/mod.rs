//! The interpreter: semantics of every decoded [`Operation`].
//!
//! Instruction handlers run with EIP already advanced past the instruction.
//! They report faults through [`ExecResult`]; [`Cpu::execute_instruction`]
//! rolls EIP/ESP back and vectors the exception.

mod alu;
mod arith;
mod bcd;
mod bits;
mod control;
mod data;
mod io;
mod shift;
mod stack;
mod string;
mod system;

use tracing::trace;

use crate::cpu::Cpu;
use crate::decode::{decode, Instruction, Operation};
use crate::exceptions::{CpuExit, ExecResult, Unwind};
use crate::state::EFlags;

pub(crate) use alu::parity;

/// Result of running one instruction at the dispatch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionOutcome {
    /// The instruction completed (possibly by delivering a trap such as
    /// `INT n`).
    Retired,
    /// The instruction faulted; the exception has been delivered.
    Faulted,
    /// A triple fault put the CPU into shutdown.
    Shutdown(CpuExit),
}

fn execute(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    use Operation as Op;
    match inst.operation {
        Op::Add | Op::Or | Op::Adc | Op::Sbb | Op::And | Op::Sub | Op::Xor | Op::Cmp | Op::Test => {
            arith::binary(cpu, inst)
        }
        Op::Inc | Op::Dec | Op::Neg | Op::Not => arith::unary(cpu, inst),
        Op::Mul | Op::Imul => arith::multiply(cpu, inst),
        Op::Div | Op::Idiv => arith::divide(cpu, inst),

        Op::Rol | Op::Ror | Op::Rcl | Op::Rcr | Op::Shl | Op::Shr | Op::Sar => shift::shift(cpu, inst),
        Op::Shld | Op::Shrd => shift::double_shift(cpu, inst),

        Op::Bt | Op::Bts | Op::Btr | Op::Btc => bits::bit_test(cpu, inst),
        Op::Bsf | Op::Bsr => bits::bit_scan(cpu, inst),

        Op::Daa | Op::Das | Op::Aaa | Op::Aas | Op::Aam | Op::Aad => bcd::execute(cpu, inst),

        Op::Mov
        | Op::Movzx
        | Op::Movsx
        | Op::MovSegment
        | Op::Xchg
        | Op::Lea
        | Op::LoadFarPointer(_)
        | Op::Cbw
        | Op::Cwd
        | Op::Xlat
        | Op::Bswap
        | Op::Lahf
        | Op::Sahf
        | Op::Salc
        | Op::Cmovcc(_)
        | Op::Setcc(_)
        | Op::Xadd
        | Op::Cmpxchg
        | Op::Cmpxchg8b => data::execute(cpu, inst),

        Op::Push | Op::Pop | Op::Pusha | Op::Popa | Op::Pushf | Op::Popf | Op::Enter | Op::Leave => {
            stack::execute(cpu, inst)
        }

        Op::Jmp
        | Op::JmpFar
        | Op::Call
        | Op::CallFar
        | Op::Ret
        | Op::RetFar
        | Op::Iret
        | Op::Int
        | Op::Int3
        | Op::Into
        | Op::Jcc(_)
        | Op::Loop(_)
        | Op::Jcxz
        | Op::Bound => control::execute(cpu, inst),

        Op::Clc => {
            cpu.state.eflags.remove(EFlags::CF);
            Ok(())
        }
        Op::Stc => {
            cpu.state.eflags.insert(EFlags::CF);
            Ok(())
        }
        Op::Cmc => {
            cpu.state.eflags.toggle(EFlags::CF);
            Ok(())
        }
        Op::Cld => {
            cpu.state.eflags.remove(EFlags::DF);
            Ok(())
        }
        Op::Std => {
            cpu.state.eflags.insert(EFlags::DF);
            Ok(())
        }

        Op::Movs | Op::Cmps | Op::Scas | Op::Lods | Op::Stos | Op::Ins | Op::Outs => string::execute(cpu, inst),
        Op::In | Op::Out => io::execute(cpu, inst),

        Op::Nop => Ok(()),
        _ => system::execute(cpu, inst),
    }
}

impl Cpu {
    /// Decodes the instruction at CS:EIP.
    pub fn fetch_instruction(&mut self) -> ExecResult<Instruction> {
        let eip = self.state.eip;
        let code_32 = self.state.code_32();
        let model = self.model();
        let mask = if code_32 { u32::MAX } else { 0xFFFF };
        decode(
            |offset| self.fetch_code_u8(eip.wrapping_add(offset) & mask),
            code_32,
            model,
        )
    }

    /// Runs `inst`, which must have been decoded at the current CS:EIP, and
    /// delivers any exception it raises.
    pub fn execute_instruction(&mut self, inst: &Instruction) -> InstructionOutcome {
        self.begin_instruction();
        let single_step = self.state.flag(EFlags::TF);
        let next = self.state.eip.wrapping_add(u32::from(inst.length));
        self.state.eip = if self.state.code_32() { next } else { next & 0xFFFF };
        self.add_cycles(1);

        match execute(self, inst) {
            Ok(()) => {
                self.state.eflags.remove(EFlags::RF);
                if single_step && !self.is_halted() {
                    if let Err(Unwind::Fault(exception)) = self.debug_trap() {
                        return self.fault(exception);
                    }
                }
                InstructionOutcome::Retired
            }
            Err(Unwind::Fault(exception)) => {
                trace!(operation = ?inst.operation, ?exception, "instruction faulted");
                self.rollback_instruction();
                self.fault(exception)
            }
            Err(Unwind::Abort) => InstructionOutcome::Retired,
        }
    }

    fn fault(&mut self, exception: crate::exceptions::CpuException) -> InstructionOutcome {
        match self.raise_exception(exception) {
            Ok(()) => InstructionOutcome::Faulted,
            Err(exit) => InstructionOutcome::Shutdown(exit),
        }
    }

    /// Fetches, decodes and executes one instruction.
    pub fn step_instruction(&mut self) -> InstructionOutcome {
        match self.fetch_instruction() {
            Ok(inst) => self.execute_instruction(&inst),
            Err(Unwind::Fault(exception)) => {
                self.begin_instruction();
                self.add_cycles(1);
                self.fault(exception)
            }
            Err(Unwind::Abort) => InstructionOutcome::Retired,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use aero_mem::{MemoryBus, MemoryBusConfig};

    use crate::config::CpuModel;
    use crate::cpu::Cpu;
    use crate::decode::decode_bytes;

    use super::InstructionOutcome;

    pub(crate) const CODE: u32 = 0x1000;

    /// A real-mode CPU with CS=0100 (base 0x1000), SS:SP = 0:8000.
    pub(crate) fn real_mode_cpu() -> Cpu {
        let bus = MemoryBus::new(MemoryBusConfig {
            address_bits: 32,
            ram_size: 0x10_0000,
        })
        .unwrap();
        let mut cpu = Cpu::new(CpuModel::Pentium, bus);
        cpu.set_real_mode_entry(0x0100, 0);
        cpu.state.set_reg32(crate::state::gpr::ESP, 0x8000);
        cpu
    }

    /// Executes `code` one instruction at a time from CS:0 until EIP leaves
    /// it, CS changes or an instruction faults.
    pub(crate) fn run(cpu: &mut Cpu, code: &[u8]) -> InstructionOutcome {
        cpu.bus.write_bytes(u64::from(CODE), code);
        cpu.state.eip = 0;
        let cs = cpu.state.selector(crate::state::Segment::CS);
        let mut outcome = InstructionOutcome::Retired;
        while (cpu.state.eip as usize) < code.len()
            && outcome == InstructionOutcome::Retired
            && cpu.state.selector(crate::state::Segment::CS) == cs
        {
            let inst = decode_bytes(&code[cpu.state.eip as usize..], false, cpu.model()).unwrap();
            outcome = cpu.execute_instruction(&inst);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::state::{gpr, Segment};

    #[test]
    fn step_runs_from_cs_ip() {
        let mut cpu = real_mode_cpu();
        // mov ax, 0x1234 ; inc ax
        cpu.bus.write_bytes(u64::from(CODE), &[0xB8, 0x34, 0x12, 0x40]);
        assert_eq!(cpu.step_instruction(), InstructionOutcome::Retired);
        assert_eq!(cpu.step_instruction(), InstructionOutcome::Retired);
        assert_eq!(cpu.state.ax(), 0x1235);
        assert_eq!(cpu.state.eip, 4);
        assert_eq!(cpu.cycles(), 2);
    }

    #[test]
    fn faulting_instruction_restores_eip_and_esp() {
        let mut cpu = real_mode_cpu();
        // IVT entry 6 -> 0200:0000
        cpu.bus.write_u16(6 * 4 + 2, 0x0200);
        // push ax ; ud2
        let outcome = run(&mut cpu, &[0x50, 0x0F, 0x0B]);
        assert_eq!(outcome, InstructionOutcome::Faulted);
        assert_eq!(cpu.state.selector(Segment::CS), 0x0200);
        // FLAGS, CS, IP of the UD2 itself on top of the pushed AX.
        assert_eq!(cpu.state.reg16(gpr::ESP), 0x8000 - 2 - 6);
        assert_eq!(cpu.bus.read_u16(0x8000 - 8), 0x0001);
    }

    #[test]
    fn single_step_traps_after_instruction() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_u16(4 + 2, 0x0300);
        cpu.state.eflags |= EFlags::TF;
        assert_eq!(run(&mut cpu, &[0x90]), InstructionOutcome::Retired);
        assert_eq!(cpu.state.selector(Segment::CS), 0x0300);
        // The trap frame points after the NOP.
        assert_eq!(cpu.bus.read_u16(0x8000 - 6), 0x0001);
    }
}
