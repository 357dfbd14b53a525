//! String instructions and the shared REP driver.

use crate::cpu::Cpu;
use crate::decode::{Instruction, Operation, RepPrefix};
use crate::exceptions::ExecResult;
use crate::state::{gpr, EFlags, Segment};

use super::alu::sub_with_flags;
use super::io::{check_io_permission, port_read, port_write};

/// Iterations a REP string instruction runs per dispatch.
const REP_BATCH: u32 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RepMode {
    None,
    Rep,
    Repe,
    Repne,
}

fn effective_rep_mode(op: Operation, rep: RepPrefix) -> RepMode {
    let conditional = matches!(op, Operation::Cmps | Operation::Scas);
    match rep {
        RepPrefix::None => RepMode::None,
        RepPrefix::Repe if conditional => RepMode::Repe,
        RepPrefix::Repne if conditional => RepMode::Repne,
        RepPrefix::Repe | RepPrefix::Repne => RepMode::Rep,
    }
}

/// Index register access under the instruction's address size.
struct Indexes {
    address_32: bool,
    step: u32,
}

impl Indexes {
    fn new(cpu: &Cpu, inst: &Instruction) -> Self {
        let width = inst.operand_size.bytes();
        Self {
            address_32: inst.data.address_size_32,
            step: if cpu.state.flag(EFlags::DF) {
                width.wrapping_neg()
            } else {
                width
            },
        }
    }

    fn read(&self, cpu: &Cpu, reg: usize) -> u32 {
        if self.address_32 {
            cpu.state.reg32(reg)
        } else {
            u32::from(cpu.state.reg16(reg))
        }
    }

    fn write(&self, cpu: &mut Cpu, reg: usize, value: u32) {
        if self.address_32 {
            cpu.state.set_reg32(reg, value);
        } else {
            cpu.state.set_reg16(reg, value as u16);
        }
    }

    fn advance(&self, cpu: &mut Cpu, reg: usize) {
        let value = self.read(cpu, reg).wrapping_add(self.step);
        self.write(cpu, reg, value);
    }
}

pub(super) fn execute(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    let mode = effective_rep_mode(inst.operation, inst.data.rep);
    let indexes = Indexes::new(cpu, inst);

    if matches!(inst.operation, Operation::Ins | Operation::Outs) {
        let port = cpu.state.dx();
        check_io_permission(cpu, port, inst.operand_size.bytes())?;
    }

    if mode == RepMode::None {
        return body(cpu, inst, &indexes);
    }

    // The count is tested before each iteration, so a zero count runs the
    // body no times at all.
    for _ in 0..REP_BATCH {
        let count = indexes.read(cpu, gpr::ECX);
        if count == 0 {
            return Ok(());
        }
        body(cpu, inst, &indexes)?;
        indexes.write(cpu, gpr::ECX, count.wrapping_sub(1));
        cpu.add_cycles(1);

        let zf = cpu.state.flag(EFlags::ZF);
        match mode {
            RepMode::Repe if !zf => return Ok(()),
            RepMode::Repne if zf => return Ok(()),
            _ => {}
        }
    }

    // Leave EIP on the instruction so the remaining iterations run on a
    // later dispatch, after pending interrupts and the cycle budget.
    if indexes.read(cpu, gpr::ECX) != 0 {
        cpu.restart_instruction();
    }
    Ok(())
}

/// One iteration. Registers only move once every memory and port access of
/// the iteration has succeeded.
fn body(cpu: &mut Cpu, inst: &Instruction, indexes: &Indexes) -> ExecResult<()> {
    let size = inst.operand_size;
    let width = size.bytes();
    let source = inst.data.segment;
    match inst.operation {
        Operation::Movs => {
            let si = indexes.read(cpu, gpr::ESI);
            let di = indexes.read(cpu, gpr::EDI);
            let value = cpu.read_mem_sized(source, si, width)?;
            cpu.write_mem_sized(Segment::ES, di, width, value)?;
            indexes.advance(cpu, gpr::ESI);
            indexes.advance(cpu, gpr::EDI);
        }
        Operation::Stos => {
            let di = indexes.read(cpu, gpr::EDI);
            let value = cpu.read_register_operand(gpr::EAX as u8, size);
            cpu.write_mem_sized(Segment::ES, di, width, value)?;
            indexes.advance(cpu, gpr::EDI);
        }
        Operation::Lods => {
            let si = indexes.read(cpu, gpr::ESI);
            let value = cpu.read_mem_sized(source, si, width)?;
            cpu.write_register_operand(gpr::EAX as u8, size, value);
            indexes.advance(cpu, gpr::ESI);
        }
        Operation::Cmps => {
            let si = indexes.read(cpu, gpr::ESI);
            let di = indexes.read(cpu, gpr::EDI);
            let a = cpu.read_mem_sized(source, si, width)?;
            let b = cpu.read_mem_sized(Segment::ES, di, width)?;
            sub_with_flags(&mut cpu.state.eflags, a, b, false, size);
            indexes.advance(cpu, gpr::ESI);
            indexes.advance(cpu, gpr::EDI);
        }
        Operation::Scas => {
            let di = indexes.read(cpu, gpr::EDI);
            let a = cpu.read_register_operand(gpr::EAX as u8, size);
            let b = cpu.read_mem_sized(Segment::ES, di, width)?;
            sub_with_flags(&mut cpu.state.eflags, a, b, false, size);
            indexes.advance(cpu, gpr::EDI);
        }
        Operation::Ins => {
            let di = indexes.read(cpu, gpr::EDI);
            // The destination is checked first so a faulting store does not
            // consume a port read.
            cpu.probe_write(Segment::ES, di, width)?;
            let port = cpu.state.dx();
            let value = port_read(cpu, port, width);
            cpu.write_mem_sized(Segment::ES, di, width, value)?;
            indexes.advance(cpu, gpr::EDI);
        }
        Operation::Outs => {
            let si = indexes.read(cpu, gpr::ESI);
            let value = cpu.read_mem_sized(source, si, width)?;
            let port = cpu.state.dx();
            port_write(cpu, port, width, value);
            indexes.advance(cpu, gpr::ESI);
        }
        _ => unreachable!("{:?} is not a string operation", inst.operation),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::REP_BATCH;
    use crate::interp::test_util::{real_mode_cpu, run, CODE};
    use crate::interp::InstructionOutcome;
    use crate::state::{gpr, EFlags};

    fn set_indexes(cpu: &mut crate::cpu::Cpu, si: u32, di: u32, cx: u32) {
        cpu.state.set_reg32(gpr::ESI, si);
        cpu.state.set_reg32(gpr::EDI, di);
        cpu.state.set_reg32(gpr::ECX, cx);
    }

    #[test]
    fn rep_movsb_copies_forward() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_bytes(0x0300, b"hello");
        set_indexes(&mut cpu, 0x0300, 0x0400, 5);
        // rep movsb
        run(&mut cpu, &[0xF3, 0xA4]);
        let mut copied = [0u8; 5];
        cpu.bus.read_bytes(0x0400, &mut copied);
        assert_eq!(&copied, b"hello");
        assert_eq!(cpu.state.cx(), 0);
        assert_eq!(cpu.state.reg16(gpr::ESI), 0x0305);
        assert_eq!(cpu.state.reg16(gpr::EDI), 0x0405);
    }

    #[test]
    fn rep_with_zero_count_does_nothing() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_u8(0x0300, 0x55);
        set_indexes(&mut cpu, 0x0300, 0x0400, 0);
        let before = cpu.cycles();
        // rep movsb
        run(&mut cpu, &[0xF3, 0xA4]);
        assert_eq!(cpu.bus.read_u8(0x0400), 0);
        assert_eq!(cpu.state.reg16(gpr::ESI), 0x0300);
        assert_eq!(cpu.cycles() - before, 1);
    }

    #[test]
    fn single_movsw_ignores_count() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_u16(0x0300, 0xBEEF);
        set_indexes(&mut cpu, 0x0300, 0x0400, 0);
        // movsw
        run(&mut cpu, &[0xA5]);
        assert_eq!(cpu.bus.read_u16(0x0400), 0xBEEF);
        assert_eq!(cpu.state.reg16(gpr::EDI), 0x0402);
    }

    #[test]
    fn std_reverses_direction() {
        let mut cpu = real_mode_cpu();
        cpu.state.set_reg32(gpr::EAX, 0x1234);
        set_indexes(&mut cpu, 0, 0x0404, 3);
        // std ; rep stosw
        run(&mut cpu, &[0xFD, 0xF3, 0xAB]);
        assert_eq!(cpu.bus.read_u16(0x0404), 0x1234);
        assert_eq!(cpu.bus.read_u16(0x0400), 0x1234);
        assert_eq!(cpu.state.reg16(gpr::EDI), 0x03FE);
    }

    #[test]
    fn repe_cmpsb_stops_at_first_mismatch() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_bytes(0x0300, b"abcXe");
        cpu.bus.write_bytes(0x0400, b"abcde");
        set_indexes(&mut cpu, 0x0300, 0x0400, 5);
        // repe cmpsb
        run(&mut cpu, &[0xF3, 0xA6]);
        assert_eq!(cpu.state.cx(), 1);
        assert_eq!(cpu.state.reg16(gpr::ESI), 0x0304);
        assert!(!cpu.state.flag(EFlags::ZF));
    }

    #[test]
    fn repne_scasb_finds_terminator() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_bytes(0x0400, b"abc\0def");
        set_indexes(&mut cpu, 0, 0x0400, 0xFFFF);
        // xor al, al ; repne scasb
        run(&mut cpu, &[0x30, 0xC0, 0xF2, 0xAE]);
        assert_eq!(cpu.state.reg16(gpr::EDI), 0x0404);
        assert_eq!(cpu.state.cx(), 0xFFFF - 4);
        assert!(cpu.state.flag(EFlags::ZF));
    }

    #[test]
    fn segment_override_applies_to_source_only() {
        let mut cpu = real_mode_cpu();
        // CS base is 0x1000: the source comes from CS:0x0010.
        cpu.bus.write_u8(0x1010, 0x77);
        set_indexes(&mut cpu, 0x0010, 0x0400, 0);
        // cs movsb
        run(&mut cpu, &[0x2E, 0xA4]);
        assert_eq!(cpu.bus.read_u8(0x0400), 0x77);
    }

    #[test]
    fn long_rep_stops_between_batches_and_resumes() {
        let mut cpu = real_mode_cpu();
        cpu.state.set_reg32(gpr::EAX, 0xAB);
        set_indexes(&mut cpu, 0, 0x2000, REP_BATCH + 10);
        // rep stosb
        cpu.bus.write_bytes(u64::from(CODE), &[0xF3, 0xAA]);
        cpu.state.eip = 0;

        assert_eq!(cpu.step_instruction(), InstructionOutcome::Retired);
        assert_eq!(cpu.state.eip, 0);
        assert_eq!(cpu.state.cx(), 10);
        assert_eq!(cpu.state.reg16(gpr::EDI), 0x2000 + REP_BATCH as u16);

        assert_eq!(cpu.step_instruction(), InstructionOutcome::Retired);
        assert_eq!(cpu.state.eip, 2);
        assert_eq!(cpu.state.cx(), 0);
        assert_eq!(cpu.bus.read_u8(0x2000 + u64::from(REP_BATCH) + 9), 0xAB);
        assert_eq!(cpu.bus.read_u8(0x2000 + u64::from(REP_BATCH) + 10), 0);
    }

    #[test]
    fn rep_ending_on_a_batch_boundary_completes() {
        let mut cpu = real_mode_cpu();
        set_indexes(&mut cpu, 0, 0x2000, REP_BATCH);
        // rep stosb
        cpu.bus.write_bytes(u64::from(CODE), &[0xF3, 0xAA]);
        cpu.state.eip = 0;
        assert_eq!(cpu.step_instruction(), InstructionOutcome::Retired);
        assert_eq!(cpu.state.eip, 2);
        assert_eq!(cpu.state.cx(), 0);
    }

    #[test]
    fn lodsd_with_address_size_override() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_u32(0x0300, 0xCAFE_BABE);
        set_indexes(&mut cpu, 0x0300, 0, 0);
        // lodsd (66 67 AD)
        run(&mut cpu, &[0x66, 0x67, 0xAD]);
        assert_eq!(cpu.state.eax(), 0xCAFE_BABE);
        assert_eq!(cpu.state.esi(), 0x0304);
    }
}
