//! Port I/O and the TSS I/O permission bitmap.

use crate::cpu::Cpu;
use crate::decode::{Instruction, Operation};
use crate::descriptors::SystemType;
use crate::exceptions::{gp, ExecResult};

/// Offset of the I/O map base field in a 32-bit TSS.
const IO_MAP_BASE: u32 = 0x66;

pub(super) fn execute(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    let size = inst.operand_size.bytes();
    if inst.operation == Operation::In {
        let port = cpu.read_operand(inst, inst.operand(1))? as u16;
        check_io_permission(cpu, port, size)?;
        let value = port_read(cpu, port, size);
        cpu.write_operand(inst, inst.operand(0), value)
    } else {
        let port = cpu.read_operand(inst, inst.operand(0))? as u16;
        check_io_permission(cpu, port, size)?;
        let value = cpu.read_operand(inst, inst.operand(1))?;
        port_write(cpu, port, size, value);
        Ok(())
    }
}

/// Port access is unrestricted in real mode and when CPL <= IOPL outside
/// virtual-8086 mode. Otherwise every bit covering the access in the TSS
/// bitmap must be clear.
pub(super) fn check_io_permission(cpu: &mut Cpu, port: u16, size: u32) -> ExecResult<()> {
    let state = &cpu.state;
    if !state.protected_mode() || (!state.v86_mode() && state.cpl <= state.iopl()) {
        return Ok(());
    }

    let task = state.task;
    if !SystemType::from_bits(task.access).is_some_and(|kind| kind.is_tss() && kind.is_32bit())
        || !task.contains(IO_MAP_BASE, 2)
    {
        return gp(0);
    }
    let map_base = u32::from(cpu.read_system::<u16>(task.base.wrapping_add(IO_MAP_BASE))?);
    let offset = map_base + u32::from(port / 8);
    if !task.contains(offset, 2) {
        return gp(0);
    }
    let bits = cpu.read_system::<u16>(task.base.wrapping_add(offset))?;
    let mask = ((1u16 << size) - 1) << (port & 7);
    if bits & mask != 0 {
        return gp(0);
    }
    Ok(())
}

pub(super) fn port_read(cpu: &mut Cpu, port: u16, size: u32) -> u32 {
    match size {
        1 => u32::from(cpu.bus.read_io_port_u8(port)),
        2 => u32::from(cpu.bus.read_io_port_u16(port)),
        _ => cpu.bus.read_io_port_u32(port),
    }
}

pub(super) fn port_write(cpu: &mut Cpu, port: u16, size: u32, value: u32) {
    match size {
        1 => cpu.bus.write_io_port_u8(port, value as u8),
        2 => cpu.bus.write_io_port_u16(port, value as u16),
        _ => cpu.bus.write_io_port_u32(port, value),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use aero_mem::PortIoDevice;
    use pretty_assertions::assert_eq;

    use crate::interp::test_util::{real_mode_cpu, run};
    use crate::state::{gpr, Cr0, EFlags, SystemSegment};

    struct Latch(Rc<RefCell<Vec<(u16, u8, u32)>>>);

    impl PortIoDevice for Latch {
        fn read(&mut self, port: u16, _size: u8) -> u32 {
            u32::from(port) | 0xAB00
        }

        fn write(&mut self, port: u16, size: u8, value: u32) {
            self.0.borrow_mut().push((port, size, value));
        }
    }

    #[test]
    fn in_and_out_reach_the_port_bus() {
        let mut cpu = real_mode_cpu();
        let log = Rc::new(RefCell::new(Vec::new()));
        cpu.bus.io_mut().register_range(0x60, 0x10, Box::new(Latch(log.clone())));
        cpu.state.set_reg32(gpr::EDX, 0x64);
        // in ax, dx ; out 0x61, al
        run(&mut cpu, &[0xED, 0xE6, 0x61]);
        assert_eq!(cpu.state.ax(), 0xAB64);
        assert_eq!(*log.borrow(), vec![(0x61, 1, 0x64)]);
    }

    #[test]
    fn unclaimed_port_reads_all_ones() {
        let mut cpu = real_mode_cpu();
        // in al, 0x80
        run(&mut cpu, &[0xE4, 0x80]);
        assert_eq!(cpu.state.al(), 0xFF);
    }

    #[test]
    fn v86_port_access_consults_the_bitmap() {
        let mut cpu = real_mode_cpu();
        // A 32-bit TSS at 0x5000 whose bitmap starts at 0x68 and denies port 0x21.
        cpu.state.task = SystemSegment {
            selector: 0x28,
            base: 0x5000,
            limit: 0x68 + 0x2000,
            access: 0x8B,
        };
        cpu.bus.write_u16(0x5066, 0x68);
        cpu.bus.write_u8(0x5068 + 4, 0x02);

        assert!(super::check_io_permission(&mut cpu, 0x21, 1).is_ok());

        cpu.state.cr0.insert(Cr0::PE);
        cpu.state.eflags.insert(EFlags::VM);
        assert!(super::check_io_permission(&mut cpu, 0x20, 1).is_ok());
        assert!(super::check_io_permission(&mut cpu, 0x21, 1).is_err());
        // A word access at 0x20 touches the denied port too.
        assert!(super::check_io_permission(&mut cpu, 0x20, 2).is_err());
    }

    #[test]
    fn protected_mode_without_tss_faults() {
        let mut cpu = real_mode_cpu();
        cpu.state.cr0.insert(Cr0::PE);
        cpu.state.eflags.insert(EFlags::VM);
        assert!(super::check_io_permission(&mut cpu, 0x80, 1).is_err());
    }
}
