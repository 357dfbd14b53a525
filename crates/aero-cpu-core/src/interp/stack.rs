use crate::cpu::Cpu;
use crate::decode::{Instruction, OperandMode, Operation};
use crate::exceptions::{gp, ExecResult};
use crate::state::{gpr, Cr4, EFlags, Segment};

pub(super) fn execute(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    let size = inst.operand_size.bytes();
    match inst.operation {
        Operation::Push => {
            let value = cpu.read_operand(inst, inst.operand(0))?;
            cpu.push(value, size)
        }
        Operation::Pop => {
            let value = cpu.pop(size)?;
            let dst = inst.operand(0);
            cpu.write_operand(inst, dst, value)?;
            if dst.mode == OperandMode::SegmentRegister(Segment::SS) {
                cpu.events.interrupt_shadow = true;
            }
            Ok(())
        }
        Operation::Pusha => pusha(cpu, size),
        Operation::Popa => popa(cpu, size),
        Operation::Pushf => pushf(cpu, size),
        Operation::Popf => popf(cpu, size),
        Operation::Enter => enter(cpu, inst, size),
        _ => leave(cpu, size),
    }
}

fn pusha(cpu: &mut Cpu, size: u32) -> ExecResult<()> {
    // Stores are checked up front so a fault cannot leave half a frame.
    let sp = cpu.state.stack_pointer().wrapping_sub(8 * size) & cpu.stack_mask();
    cpu.probe_write(Segment::SS, sp, 8 * size)?;
    let original_sp = cpu.state.reg32(gpr::ESP);
    for reg in gpr::EAX..=gpr::EDI {
        let value = if reg == gpr::ESP {
            original_sp
        } else {
            cpu.state.reg32(reg)
        };
        cpu.push(value, size)?;
    }
    Ok(())
}

fn popa(cpu: &mut Cpu, size: u32) -> ExecResult<()> {
    let mut values = [0u32; 8];
    for (i, slot) in values.iter_mut().enumerate() {
        *slot = cpu.peek_stack(i as u32 * size, size)?;
    }
    for (i, value) in values.into_iter().enumerate() {
        let reg = gpr::EDI - i;
        if reg == gpr::ESP {
            continue;
        }
        if size == 4 {
            cpu.state.set_reg32(reg, value);
        } else {
            cpu.state.set_reg16(reg, value as u16);
        }
    }
    let sp = cpu.state.stack_pointer().wrapping_add(8 * size) & cpu.stack_mask();
    cpu.state.set_stack_pointer(sp);
    Ok(())
}

fn pushf(cpu: &mut Cpu, size: u32) -> ExecResult<()> {
    let flags = cpu.state.eflags_raw();
    if cpu.state.v86_mode() && cpu.state.iopl() < 3 {
        if !cpu.state.cr4.contains(Cr4::VME) || size != 2 {
            return gp(0);
        }
        let mut image = EFlags::from_bits_retain(flags & 0xFFFF);
        image.set(EFlags::IF, cpu.state.flag(EFlags::VIF));
        image.insert(EFlags::IOPL);
        return cpu.push(image.bits(), 2);
    }
    let image = flags & !(EFlags::VM | EFlags::RF).bits();
    cpu.push(image, size)
}

fn popf(cpu: &mut Cpu, size: u32) -> ExecResult<()> {
    let old = cpu.state.eflags_raw();
    let iopl = cpu.state.iopl();
    let cpl = cpu.state.cpl;

    if cpu.state.v86_mode() && iopl < 3 {
        if !cpu.state.cr4.contains(Cr4::VME) || size != 2 {
            return gp(0);
        }
        let popped = EFlags::from_bits_retain(cpu.peek_stack(0, 2)?);
        if popped.contains(EFlags::TF) || (popped.contains(EFlags::IF) && cpu.state.flag(EFlags::VIP)) {
            return gp(0);
        }
        cpu.pop(2)?;
        let keep = !0xFFFF | (EFlags::IF | EFlags::IOPL).bits();
        let mut merged = EFlags::from_bits_retain((old & keep) | (popped.bits() & !keep));
        merged.set(EFlags::VIF, popped.contains(EFlags::IF));
        cpu.state.set_eflags_raw(merged.bits());
        return Ok(());
    }

    let popped = cpu.pop(size)?;
    let mut changeable = EFlags::STATUS | EFlags::TF | EFlags::DF | EFlags::NT | EFlags::AC | EFlags::ID;
    let v86 = cpu.state.v86_mode();
    let protected = cpu.state.protected_mode() && !v86;
    if !v86 && (!protected || cpl == 0) {
        changeable |= EFlags::IOPL;
    }
    if v86 || !protected || cpl <= iopl {
        changeable |= EFlags::IF;
    }
    let mut changeable = changeable.bits();
    if size == 2 {
        changeable &= 0xFFFF;
    }
    let value = ((old & !changeable) | (popped & changeable)) & !EFlags::RF.bits();
    cpu.state.set_eflags_raw(value);
    Ok(())
}

fn enter(cpu: &mut Cpu, inst: &Instruction, size: u32) -> ExecResult<()> {
    let allocation = inst.data.immediate & 0xFFFF;
    let level = inst.data.immediate2 & 0x1F;
    let mask = cpu.stack_mask();

    let bp = cpu.state.reg32(gpr::EBP);
    cpu.push(bp, size)?;
    let frame = cpu.state.stack_pointer();

    if level > 0 {
        let mut display = bp & mask;
        for _ in 1..level {
            display = display.wrapping_sub(size) & mask;
            let value = cpu.read_mem_sized(Segment::SS, display, size)?;
            cpu.push(value, size)?;
        }
        cpu.push(frame, size)?;
    }
    cpu.add_cycles(u64::from(level) * 4);

    let sp = cpu.state.stack_pointer().wrapping_sub(allocation) & mask;
    if size == 4 {
        cpu.state.set_reg32(gpr::EBP, frame);
    } else {
        cpu.state.set_reg16(gpr::EBP, frame as u16);
    }
    cpu.state.set_stack_pointer(sp);
    Ok(())
}

fn leave(cpu: &mut Cpu, size: u32) -> ExecResult<()> {
    let mask = cpu.stack_mask();
    let bp = cpu.state.reg32(gpr::EBP) & mask;
    let saved = cpu.read_mem_sized(Segment::SS, bp, size)?;
    cpu.state.set_stack_pointer(bp.wrapping_add(size) & mask);
    if size == 4 {
        cpu.state.set_reg32(gpr::EBP, saved);
    } else {
        cpu.state.set_reg16(gpr::EBP, saved as u16);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::interp::test_util::{real_mode_cpu, run};
    use crate::state::{gpr, EFlags, Segment};

    #[test]
    fn pusha_pushes_original_sp_and_popa_skips_it() {
        let mut cpu = real_mode_cpu();
        for (reg, value) in (0..8).zip([1u32, 2, 3, 4, 0, 6, 7, 8]) {
            if reg != gpr::ESP {
                cpu.state.set_reg32(reg, value);
            }
        }
        // pusha
        run(&mut cpu, &[0x60]);
        assert_eq!(cpu.state.reg16(gpr::ESP), 0x8000 - 16);
        assert_eq!(cpu.bus.read_u16(0x8000 - 10), 0x8000);

        cpu.bus.write_u16(0x8000 - 10, 0x1234);
        cpu.state.set_reg32(gpr::EAX, 0);
        // popa
        run(&mut cpu, &[0x61]);
        assert_eq!(cpu.state.reg16(gpr::ESP), 0x8000);
        assert_eq!(cpu.state.ax(), 1);
        assert_eq!(cpu.state.reg16(gpr::EDI), 8);
    }

    #[test]
    fn pop_memory_uses_incremented_sp() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_u16(0x8000, 0xBEEF);
        cpu.state.set_reg32(gpr::EBP, 0);
        // pop word [esp]: 67 8F 04 24 with 32-bit addressing via SIB
        run(&mut cpu, &[0x67, 0x8F, 0x04, 0x24]);
        assert_eq!(cpu.state.reg16(gpr::ESP), 0x8002);
        assert_eq!(cpu.bus.read_u16(0x8002), 0xBEEF);
    }

    #[test]
    fn pushf_popf_in_real_mode() {
        let mut cpu = real_mode_cpu();
        cpu.state.eflags |= EFlags::CF;
        // pushf ; pop ax ; or ax, 0x0040 ; push ax ; popf
        run(&mut cpu, &[0x9C, 0x58, 0x0D, 0x40, 0x00, 0x50, 0x9D]);
        assert!(cpu.state.flag(EFlags::CF));
        assert!(cpu.state.flag(EFlags::ZF));
    }

    #[test]
    fn enter_and_leave_build_and_drop_a_frame() {
        let mut cpu = real_mode_cpu();
        cpu.state.set_reg32(gpr::EBP, 0x7000);
        cpu.bus.write_u16(0x7000 - 2, 0xAAAA);
        // enter 0x10, 2
        run(&mut cpu, &[0xC8, 0x10, 0x00, 0x02]);
        // [BP] old BP, [BP-2] copied display entry, [BP-4] new frame pointer.
        assert_eq!(cpu.state.reg16(gpr::EBP), 0x7FFE);
        assert_eq!(cpu.bus.read_u16(0x7FFE), 0x7000);
        assert_eq!(cpu.bus.read_u16(0x7FFC), 0xAAAA);
        assert_eq!(cpu.bus.read_u16(0x7FFA), 0x7FFE);
        assert_eq!(cpu.state.reg16(gpr::ESP), 0x7FFA - 0x10);

        // leave
        run(&mut cpu, &[0xC9]);
        assert_eq!(cpu.state.reg16(gpr::EBP), 0x7000);
        assert_eq!(cpu.state.reg16(gpr::ESP), 0x8000);
    }

    #[test]
    fn pop_ss_inhibits_interrupts() {
        let mut cpu = real_mode_cpu();
        run(&mut cpu, &[0x17]);
        assert!(cpu.events.interrupt_shadow);
        assert_eq!(cpu.state.selector(Segment::SS), 0);
    }
}
