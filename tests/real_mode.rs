mod harness;

use std::cell::Cell;
use std::rc::Rc;

use aero_cpu_core::interrupts::InterruptController;
use aero_cpu_core::state::{gpr, EFlags, Segment};
use aero_mem::PortIoDevice;
use anyhow::Result;
use harness::{Machine, BACKENDS};
use pretty_assertions::assert_eq;

#[test]
fn add_sets_overflow_sign_and_adjust_flags() -> Result<()> {
    for backend in BACKENDS {
        // mov al, 0x7f ; add al, 1 ; hlt
        let mut m = Machine::real_mode(backend, &[0xB0, 0x7F, 0x04, 0x01, 0xF4])?;
        m.run_until_halt(100)?;

        let state = &m.cpu().state;
        assert_eq!(state.al(), 0x80);
        assert!(state.flag(EFlags::OF));
        assert!(state.flag(EFlags::SF));
        assert!(state.flag(EFlags::AF));
        assert!(!state.flag(EFlags::CF));
        assert!(!state.flag(EFlags::ZF));
        assert!(!state.flag(EFlags::PF));
    }
    Ok(())
}

#[test]
fn divide_by_zero_vectors_without_touching_operands() -> Result<()> {
    for backend in BACKENDS {
        // mov ax, 0x1234 ; mov dx, 0x5678 ; xor bx, bx ; div bx ; hlt
        let code = [0xB8, 0x34, 0x12, 0xBA, 0x78, 0x56, 0x31, 0xDB, 0xF7, 0xF3, 0xF4];
        let mut m = Machine::real_mode(backend, &code)?;
        m.set_vector(0, 0x0100, 0x0200);
        m.load(harness::CODE + 0x200, &[0xF4]);
        m.run_until_halt(100)?;

        let cpu = m.cpu_mut();
        assert_eq!(cpu.state.ax(), 0x1234);
        assert_eq!(cpu.state.dx(), 0x5678);
        assert_eq!(cpu.state.ip(), 0x201);
        assert_eq!(cpu.state.sp(), 0x7FFA);
        // The frame points back at the faulting DIV.
        assert_eq!(cpu.bus.read_u16(0x7FFA), 8);
        assert_eq!(cpu.bus.read_u16(0x7FFC), 0x0100);
    }
    Ok(())
}

#[test]
fn idiv_quotient_overflow_raises_divide_error() -> Result<()> {
    // mov ax, 0x8000 ; cwd ; mov bx, 0xffff ; idiv bx ; hlt
    let code = [0xB8, 0x00, 0x80, 0x99, 0xBB, 0xFF, 0xFF, 0xF7, 0xFB, 0xF4];
    let mut m = Machine::real_mode(aero_cpu_core::BackendKind::CachedInterpreter, &code)?;
    m.set_vector(0, 0x0100, 0x0200);
    m.load(harness::CODE + 0x200, &[0xF4]);
    m.run_until_halt(100)?;

    let cpu = m.cpu_mut();
    assert_eq!(cpu.state.ax(), 0x8000);
    assert_eq!(cpu.state.dx(), 0xFFFF);
    assert_eq!(cpu.bus.read_u16(0x7FFA), 7);
    Ok(())
}

#[test]
fn rep_movsb_with_zero_count_does_nothing() -> Result<()> {
    for backend in BACKENDS {
        // mov si, 0x2000 ; mov di, 0x3000 ; xor cx, cx ; rep movsb ; mov cx, 3 ; rep movsb ; hlt
        let code = [
            0xBE, 0x00, 0x20, 0xBF, 0x00, 0x30, 0x31, 0xC9, 0xF3, 0xA4, 0xF4, 0xB9, 0x03, 0x00, 0xF3, 0xA4, 0xF4,
        ];
        let mut m = Machine::real_mode(backend, &code)?;
        m.load(0x2000, &[0xAA, 0xBB, 0xCC]);
        m.run_until_halt(100)?;

        let state = &m.cpu().state;
        assert_eq!(state.reg16(gpr::ESI), 0x2000);
        assert_eq!(state.reg16(gpr::EDI), 0x3000);
        assert_eq!(m.cpu_mut().bus.read_u8(0x3000), 0);

        // Resume after the first HLT.
        m.cpu_mut().set_real_mode_entry(0x0100, 11);
        m.run_until_halt(100)?;
        let cpu = m.cpu_mut();
        assert_eq!(cpu.state.cx(), 0);
        assert_eq!(cpu.state.reg16(gpr::ESI), 0x2003);
        assert_eq!(cpu.state.reg16(gpr::EDI), 0x3003);
        let mut copied = [0u8; 3];
        cpu.bus.read_bytes(0x3000, &mut copied);
        assert_eq!(copied, [0xAA, 0xBB, 0xCC]);
    }
    Ok(())
}

#[test]
fn sib_with_ebp_base_defaults_to_the_stack_segment() -> Result<()> {
    // mov ax, 0x0200 ; mov ss, ax ; mov ebp, 0x10 ; mov ax, [ebp+0] (SIB form) ; hlt
    let code = [
        0xB8, 0x00, 0x02, 0x8E, 0xD0, 0x66, 0xBD, 0x10, 0x00, 0x00, 0x00, 0x67, 0x8B, 0x44, 0x25, 0x00, 0xF4,
    ];
    let mut m = Machine::real_mode(aero_cpu_core::BackendKind::CachedInterpreter, &code)?;
    m.cpu_mut().bus.write_u16(0x0010, 0xFFFF);
    m.cpu_mut().bus.write_u16(0x2010, 0x1234);
    m.run_until_halt(100)?;

    assert_eq!(m.cpu().state.selector(Segment::SS), 0x0200);
    assert_eq!(m.cpu().state.ax(), 0x1234);
    Ok(())
}

/// Latches the last byte written and reads it back incremented.
struct Latch(Rc<Cell<u8>>);

impl PortIoDevice for Latch {
    fn read(&mut self, _port: u16, _size: u8) -> u32 {
        u32::from(self.0.get().wrapping_add(1))
    }

    fn write(&mut self, _port: u16, _size: u8, value: u32) {
        self.0.set(value as u8);
    }
}

#[test]
fn port_io_reaches_registered_devices() -> Result<()> {
    // mov al, 0x41 ; out 0x60, al ; in al, 0x60 ; mov bh, al ; in al, 0x70 ; hlt
    let code = [0xB0, 0x41, 0xE6, 0x60, 0xE4, 0x60, 0x88, 0xC7, 0xE4, 0x70, 0xF4];
    let mut m = Machine::real_mode(aero_cpu_core::BackendKind::Interpreter, &code)?;
    let latched = Rc::new(Cell::new(0));
    m.cpu_mut().bus.io_mut().register_range(0x60, 1, Box::new(Latch(latched.clone())));
    m.run_until_halt(100)?;

    assert_eq!(latched.get(), 0x41);
    // bh holds the device read, al the unmapped port.
    assert_eq!(m.cpu().state.reg8(7), 0x42);
    assert_eq!(m.cpu().state.al(), 0xFF);
    Ok(())
}

struct OneShot(Option<u8>);

impl InterruptController for OneShot {
    fn acknowledge(&mut self) -> Option<u8> {
        self.0.take()
    }
}

#[test]
fn external_interrupt_wakes_a_halted_cpu() -> Result<()> {
    for backend in BACKENDS {
        // sti ; hlt ; mov di, 1 ; hlt
        let mut m = Machine::real_mode(backend, &[0xFB, 0xF4, 0xBF, 0x01, 0x00, 0xF4])?;
        m.set_vector(0x20, 0x0100, 0x0300);
        // inc si ; iret
        m.load(harness::CODE + 0x300, &[0x46, 0xCF]);
        m.run_until_halt(100)?;
        assert!(m.cpu().is_halted());
        assert_eq!(m.cpu().state.ip(), 2);

        m.cpu_mut().set_interrupt_controller(Box::new(OneShot(Some(0x20))));
        m.cpu_mut().set_irq_line(true);
        m.run_until_halt(100)?;

        let state = &m.cpu().state;
        assert_eq!(state.reg16(gpr::ESI), 1);
        assert_eq!(state.reg16(gpr::EDI), 1);
        assert_eq!(state.sp(), 0x8000);
        assert!(state.flag(EFlags::IF));
    }
    Ok(())
}

#[test]
fn unmapped_memory_reads_all_ones() -> Result<()> {
    let mut m = Machine::real_mode(aero_cpu_core::BackendKind::Interpreter, &[0xF4])?;
    let bus = &mut m.cpu_mut().bus;
    bus.write_u32(0x8_0000, 0xDEAD_BEEF);
    assert_eq!(bus.read_u32(0x8_0000), 0xDEAD_BEEF);
    assert_eq!(bus.read_u32(0x20_0000), 0xFFFF_FFFF);
    bus.write_u8(0x20_0000, 0);
    assert_eq!(bus.read_u8(0x20_0000), 0xFF);
    Ok(())
}
