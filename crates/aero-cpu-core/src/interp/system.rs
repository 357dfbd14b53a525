//! Privileged and system instructions.

use tracing::debug;

use crate::cpu::Cpu;
use crate::decode::{Instruction, OperandSize, Operation};
use crate::descriptors::{Selector, SystemType};
use crate::exceptions::{fault, fault_code, gp, ud, Exception, ExecResult};
use crate::state::{Cr0, Cr4, EFlags, SystemSegment, TableRegister};

const MSR_TSC: u32 = 0x10;

/// CR0 bits software can load.
const CR0_WRITABLE: Cr0 = Cr0::PE
    .union(Cr0::MP)
    .union(Cr0::EM)
    .union(Cr0::TS)
    .union(Cr0::NE)
    .union(Cr0::WP)
    .union(Cr0::AM)
    .union(Cr0::NW)
    .union(Cr0::CD)
    .union(Cr0::PG);

const CR4_SUPPORTED: Cr4 = Cr4::VME
    .union(Cr4::PVI)
    .union(Cr4::TSD)
    .union(Cr4::DE)
    .union(Cr4::PSE)
    .union(Cr4::MCE);

pub(super) fn execute(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    use Operation as Op;
    match inst.operation {
        Op::Cli => cli(cpu),
        Op::Sti => sti(cpu),
        Op::Hlt => {
            require_cpl0(cpu)?;
            cpu.events.halted = true;
            Ok(())
        }
        Op::Lgdt | Op::Lidt => load_table_register(cpu, inst),
        Op::Sgdt | Op::Sidt => store_table_register(cpu, inst),
        Op::Lldt => lldt(cpu, inst),
        Op::Ltr => ltr(cpu, inst),
        Op::Sldt => {
            require_protected(cpu)?;
            let selector = u32::from(cpu.state.ldtr.selector);
            cpu.write_operand(inst, inst.operand(0), selector)
        }
        Op::Str => {
            require_protected(cpu)?;
            let selector = u32::from(cpu.state.task.selector);
            cpu.write_operand(inst, inst.operand(0), selector)
        }
        Op::Lmsw => {
            require_cpl0(cpu)?;
            let value = cpu.read_operand(inst, inst.operand(0))?;
            // LMSW can set PE but never clear it.
            let low = Cr0::PE | Cr0::MP | Cr0::EM | Cr0::TS;
            let mut cr0 = (cpu.state.cr0 - (low - Cr0::PE)) | (Cr0::from_bits_truncate(value) & low);
            if cpu.state.cr0.contains(Cr0::PE) {
                cr0.insert(Cr0::PE);
            }
            write_cr0(cpu, cr0.bits())
        }
        Op::Smsw => {
            let value = cpu.state.cr0.bits();
            cpu.write_operand(inst, inst.operand(0), value)
        }
        Op::Invlpg => {
            require_cpl0(cpu)?;
            let mem = cpu.memory_operand(inst, inst.operand(0));
            let linear = cpu.state.segment(mem.segment).cache.base.wrapping_add(mem.offset);
            cpu.tlb.flush_page(linear);
            Ok(())
        }
        Op::Arpl => arpl(cpu, inst),
        Op::Verr | Op::Verw => verify(cpu, inst),
        Op::Lar | Op::Lsl => load_access_or_limit(cpu, inst),
        Op::Clts => {
            require_cpl0(cpu)?;
            cpu.state.cr0.remove(Cr0::TS);
            Ok(())
        }
        Op::Invd | Op::Wbinvd => require_cpl0(cpu),
        Op::MovToCr | Op::MovFromCr => move_control_register(cpu, inst),
        Op::MovToDr | Op::MovFromDr => {
            require_cpl0(cpu)?;
            let index = inst.data.modrm_reg();
            if matches!(index, 4 | 5) && cpu.state.cr4.contains(Cr4::DE) {
                return ud();
            }
            let index = usize::from(if index == 4 || index == 5 { index + 2 } else { index });
            if inst.operation == Op::MovToDr {
                let value = cpu.read_operand(inst, inst.operand(1))?;
                cpu.state.dr[index] = value;
            } else {
                let value = cpu.state.dr[index];
                cpu.write_operand(inst, inst.operand(0), value)?;
            }
            Ok(())
        }
        Op::MovToTr | Op::MovFromTr => {
            require_cpl0(cpu)?;
            if inst.data.modrm_reg() < 3 {
                return ud();
            }
            let value = cpu.read_operand(inst, inst.operand(1))?;
            cpu.write_operand(inst, inst.operand(0), value)
        }
        Op::Cpuid => {
            cpuid(cpu);
            Ok(())
        }
        Op::Rdtsc => {
            if cpu.state.cr4.contains(Cr4::TSD) && cpu.state.protected_mode() && current_privilege(cpu) > 0 {
                return gp(0);
            }
            let tsc = cpu.time_stamp_counter();
            set_edx_eax(cpu, tsc);
            Ok(())
        }
        Op::Rdmsr => {
            require_cpl0(cpu)?;
            match cpu.state.ecx() {
                MSR_TSC => {
                    let tsc = cpu.time_stamp_counter();
                    set_edx_eax(cpu, tsc);
                    Ok(())
                }
                msr => {
                    debug!(msr = format_args!("{msr:#x}"), "rdmsr of unimplemented MSR");
                    gp(0)
                }
            }
        }
        Op::Wrmsr => {
            require_cpl0(cpu)?;
            let value = (u64::from(cpu.state.edx()) << 32) | u64::from(cpu.state.eax());
            match cpu.state.ecx() {
                MSR_TSC => {
                    cpu.tsc_offset = value.wrapping_sub(cpu.cycles);
                    Ok(())
                }
                msr => {
                    debug!(msr = format_args!("{msr:#x}"), "wrmsr of unimplemented MSR");
                    gp(0)
                }
            }
        }
        Op::Escape => {
            // No coprocessor: the escape decodes its operands and does nothing.
            if cpu.state.cr0.intersects(Cr0::EM | Cr0::TS) {
                return fault(Exception::DeviceNotAvailable);
            }
            Ok(())
        }
        Op::Wait => {
            if cpu.state.cr0.contains(Cr0::TS | Cr0::MP) {
                return fault(Exception::DeviceNotAvailable);
            }
            Ok(())
        }
        Op::Icebp => cpu.debug_trap(),
        Op::Ud => ud(),
        other => {
            debug!(operation = ?other, "unhandled operation");
            ud()
        }
    }
}

/// CPL as seen by privilege checks: 3 in virtual-8086 mode, 0 in real mode.
fn current_privilege(cpu: &Cpu) -> u8 {
    if !cpu.state.protected_mode() {
        0
    } else if cpu.state.v86_mode() {
        3
    } else {
        cpu.state.cpl
    }
}

fn require_cpl0(cpu: &Cpu) -> ExecResult<()> {
    if current_privilege(cpu) != 0 {
        return gp(0);
    }
    Ok(())
}

/// Descriptor-table instructions that only exist in protected mode.
fn require_protected(cpu: &Cpu) -> ExecResult<()> {
    if cpu.state.real_or_v86() {
        return ud();
    }
    Ok(())
}

fn set_edx_eax(cpu: &mut Cpu, value: u64) {
    cpu.state.set_reg32(crate::state::gpr::EAX, value as u32);
    cpu.state.set_reg32(crate::state::gpr::EDX, (value >> 32) as u32);
}

fn cli(cpu: &mut Cpu) -> ExecResult<()> {
    set_interrupt_flag(cpu, false)
}

fn sti(cpu: &mut Cpu) -> ExecResult<()> {
    let was_enabled = cpu.state.flag(EFlags::IF);
    set_interrupt_flag(cpu, true)?;
    // Interrupts stay blocked until after the next instruction.
    if !was_enabled && cpu.state.flag(EFlags::IF) {
        cpu.events.interrupt_shadow = true;
    }
    Ok(())
}

/// CLI/STI: IF directly when IOPL allows it, otherwise VIF under VME (in
/// virtual-8086 mode) or PVI (at CPL 3).
fn set_interrupt_flag(cpu: &mut Cpu, enable: bool) -> ExecResult<()> {
    let state = &cpu.state;
    let iopl = state.iopl();
    let direct = !state.protected_mode()
        || if state.v86_mode() {
            iopl == 3
        } else {
            state.cpl <= iopl
        };
    if direct {
        cpu.state.set_flag(EFlags::IF, enable);
        return Ok(());
    }

    let virtual_flag = if state.v86_mode() {
        state.cr4.contains(Cr4::VME)
    } else {
        state.cpl == 3 && state.cr4.contains(Cr4::PVI)
    };
    if !virtual_flag || (enable && state.flag(EFlags::VIP)) {
        return gp(0);
    }
    cpu.state.set_flag(EFlags::VIF, enable);
    Ok(())
}

fn load_table_register(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    require_cpl0(cpu)?;
    let mem = cpu.memory_operand(inst, inst.operand(0));
    let limit = cpu.read_mem::<u16>(mem.segment, mem.offset)?;
    let base_offset = mem.offset.wrapping_add(2) & inst.data.address_mask();
    let mut base = cpu.read_mem::<u32>(mem.segment, base_offset)?;
    if inst.operand_size == OperandSize::Size16 {
        base &= 0x00FF_FFFF;
    }
    let table = TableRegister { base, limit };
    if inst.operation == Operation::Lgdt {
        cpu.state.gdtr = table;
    } else {
        cpu.state.idtr = table;
    }
    Ok(())
}

fn store_table_register(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    let table = if inst.operation == Operation::Sgdt {
        cpu.state.gdtr
    } else {
        cpu.state.idtr
    };
    let mut base = table.base;
    if inst.operand_size == OperandSize::Size16 {
        base &= 0x00FF_FFFF;
    }
    let mem = cpu.memory_operand(inst, inst.operand(0));
    let base_offset = mem.offset.wrapping_add(2) & inst.data.address_mask();
    cpu.probe_write(mem.segment, base_offset, 4)?;
    cpu.write_mem::<u16>(mem.segment, mem.offset, table.limit)?;
    cpu.write_mem::<u32>(mem.segment, base_offset, base)
}

fn lldt(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    require_protected(cpu)?;
    require_cpl0(cpu)?;
    let selector = cpu.read_operand(inst, inst.operand(0))? as u16;
    let sel = Selector(selector);
    if sel.is_null() {
        cpu.state.ldtr = SystemSegment {
            selector,
            ..SystemSegment::default()
        };
        return Ok(());
    }
    if sel.table() != crate::descriptors::DescriptorTable::Global {
        return gp(sel.error_code());
    }
    let descriptor = cpu.read_selector_descriptor(sel)?;
    if descriptor.system_type() != Some(SystemType::Ldt) {
        return gp(sel.error_code());
    }
    if !descriptor.present() {
        return fault_code(Exception::SegmentNotPresent, sel.error_code());
    }
    cpu.state.ldtr = SystemSegment {
        selector,
        base: descriptor.base(),
        limit: descriptor.limit(),
        access: descriptor.access(),
    };
    Ok(())
}

fn ltr(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    require_protected(cpu)?;
    require_cpl0(cpu)?;
    let selector = cpu.read_operand(inst, inst.operand(0))? as u16;
    let sel = Selector(selector);
    if sel.is_null() {
        return gp(0);
    }
    if sel.table() != crate::descriptors::DescriptorTable::Global {
        return gp(sel.error_code());
    }
    let descriptor = cpu.read_selector_descriptor(sel)?;
    if !matches!(
        descriptor.system_type(),
        Some(SystemType::AvailableTss16 | SystemType::AvailableTss32)
    ) {
        return gp(sel.error_code());
    }
    if !descriptor.present() {
        return fault_code(Exception::SegmentNotPresent, sel.error_code());
    }
    // Mark the TSS busy.
    let busy = descriptor.access() | 0x02;
    let address = cpu.descriptor_address(sel).wrapping_add(5);
    cpu.write_system::<u8>(address, busy)?;
    cpu.state.task = SystemSegment {
        selector,
        base: descriptor.base(),
        limit: descriptor.limit(),
        access: busy,
    };
    Ok(())
}

fn arpl(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    require_protected(cpu)?;
    let dst = cpu.read_operand(inst, inst.operand(0))?;
    let src = cpu.read_operand(inst, inst.operand(1))?;
    if dst & 3 < src & 3 {
        cpu.write_operand(inst, inst.operand(0), (dst & !3) | (src & 3))?;
        cpu.state.eflags.insert(EFlags::ZF);
    } else {
        cpu.state.eflags.remove(EFlags::ZF);
    }
    Ok(())
}

/// Whether a descriptor is visible at the current CPL through `sel`.
fn privilege_allows(cpu: &Cpu, sel: Selector, dpl: u8) -> bool {
    dpl >= cpu.state.cpl.max(sel.rpl())
}

fn verify(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    require_protected(cpu)?;
    let sel = Selector(cpu.read_operand(inst, inst.operand(0))? as u16);
    let accessible = match cpu.try_read_selector_descriptor(sel)? {
        Some(descriptor) if descriptor.is_segment() => {
            let privileged = descriptor.is_conforming_code() || privilege_allows(cpu, sel, descriptor.dpl());
            let usable = if inst.operation == Operation::Verr {
                descriptor.is_readable()
            } else {
                descriptor.is_writable_data()
            };
            privileged && usable
        }
        _ => false,
    };
    cpu.state.set_flag(EFlags::ZF, accessible);
    Ok(())
}

fn load_access_or_limit(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    require_protected(cpu)?;
    let sel = Selector(cpu.read_operand(inst, inst.operand(1))? as u16);
    let lar = inst.operation == Operation::Lar;

    let result = cpu.try_read_selector_descriptor(sel)?.filter(|descriptor| {
        let type_ok = match descriptor.system_type() {
            None => descriptor.is_segment(),
            Some(kind) => {
                kind.is_tss()
                    || kind == SystemType::Ldt
                    || (lar && matches!(kind, SystemType::CallGate16 | SystemType::CallGate32 | SystemType::TaskGate))
            }
        };
        type_ok && (descriptor.is_conforming_code() || privilege_allows(cpu, sel, descriptor.dpl()))
    });

    let Some(descriptor) = result else {
        cpu.state.eflags.remove(EFlags::ZF);
        return Ok(());
    };
    let value = if lar {
        let rights = (descriptor.raw >> 32) as u32;
        if inst.operand_size == OperandSize::Size32 {
            rights & 0x00F0_FF00
        } else {
            rights & 0xFF00
        }
    } else {
        descriptor.limit()
    };
    cpu.write_operand(inst, inst.operand(0), value)?;
    cpu.state.eflags.insert(EFlags::ZF);
    Ok(())
}

fn move_control_register(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    require_cpl0(cpu)?;
    let index = inst.data.modrm_reg();
    if index == 4 && !cpu.model().has_pentium_instructions() {
        return ud();
    }
    if inst.operation == Operation::MovFromCr {
        let value = cpu.read_operand(inst, inst.operand(1))?;
        return cpu.write_operand(inst, inst.operand(0), value);
    }

    let value = cpu.read_operand(inst, inst.operand(1))?;
    match index {
        0 => write_cr0(cpu, value),
        2 => {
            cpu.state.cr2 = value;
            Ok(())
        }
        3 => {
            cpu.state.cr3 = value & 0xFFFF_F018;
            cpu.tlb.flush();
            Ok(())
        }
        4 => {
            let cr4 = Cr4::from_bits_retain(value);
            if !CR4_SUPPORTED.contains(cr4) {
                return gp(0);
            }
            if cr4 != cpu.state.cr4 {
                cpu.state.cr4 = cr4;
                cpu.tlb.flush();
                cpu.request_code_cache_flush();
            }
            Ok(())
        }
        _ => ud(),
    }
}

fn write_cr0(cpu: &mut Cpu, value: u32) -> ExecResult<()> {
    let mut cr0 = Cr0::from_bits_truncate(value) & CR0_WRITABLE;
    if cr0.contains(Cr0::PG) && !cr0.contains(Cr0::PE) {
        return gp(0);
    }
    if cr0.contains(Cr0::NW) && !cr0.contains(Cr0::CD) {
        return gp(0);
    }
    if cpu.model().has_i486_instructions() {
        cr0.insert(Cr0::ET);
    } else {
        cr0.remove(Cr0::NE | Cr0::WP | Cr0::AM | Cr0::NW | Cr0::CD);
        cr0.set(Cr0::ET, cpu.state.cr0.contains(Cr0::ET));
    }

    let changed = cr0 ^ cpu.state.cr0;
    cpu.state.cr0 = cr0;
    if changed.intersects(Cr0::PE | Cr0::PG | Cr0::WP) {
        debug!(cr0 = format_args!("{:#x}", cr0.bits()), "protection or paging mode changed");
        cpu.tlb.flush();
        cpu.request_code_cache_flush();
    }
    if changed.contains(Cr0::PE) && !cr0.contains(Cr0::PE) {
        cpu.state.cpl = 0;
    }
    Ok(())
}

fn cpuid(cpu: &mut Cpu) {
    use crate::state::gpr;

    let (eax, ebx, ecx, edx) = match cpu.state.eax() {
        0 => (1, 0x756E_6547, 0x6C65_746E, 0x4965_6E69),
        1 => {
            // VME, DE, PSE, TSC, MSR and CX8; no FPU.
            let features = (1 << 1) | (1 << 2) | (1 << 3) | (1 << 4) | (1 << 5) | (1 << 8);
            (cpu.model().cpuid_signature(), 0, 0, features)
        }
        _ => (0, 0, 0, 0),
    };
    cpu.state.set_reg32(gpr::EAX, eax);
    cpu.state.set_reg32(gpr::EBX, ebx);
    cpu.state.set_reg32(gpr::ECX, ecx);
    cpu.state.set_reg32(gpr::EDX, edx);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::interp::test_util::{real_mode_cpu, run};
    use crate::interp::InstructionOutcome;
    use crate::state::{gpr, Cr0, EFlags};

    #[test]
    fn lgdt_and_sgdt_round_trip() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_u16(0x0300, 0x0027);
        cpu.bus.write_u32(0x0302, 0x1234_5678);
        // o32 lgdt [0x300] ; sgdt [0x310]
        run(
            &mut cpu,
            &[0x66, 0x0F, 0x01, 0x16, 0x00, 0x03, 0x0F, 0x01, 0x06, 0x10, 0x03],
        );
        assert_eq!(cpu.state.gdtr.base, 0x1234_5678);
        assert_eq!(cpu.state.gdtr.limit, 0x27);
        assert_eq!(cpu.bus.read_u16(0x0310), 0x0027);
        // 16-bit SGDT stores a 24-bit base.
        assert_eq!(cpu.bus.read_u32(0x0312), 0x0034_5678);
    }

    #[test]
    fn lidt_with_16bit_operand_truncates_base() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_u16(0x0300, 0x03FF);
        cpu.bus.write_u32(0x0302, 0xAB01_0000);
        // lidt [0x300]
        run(&mut cpu, &[0x0F, 0x01, 0x1E, 0x00, 0x03]);
        assert_eq!(cpu.state.idtr.base, 0x0001_0000);
    }

    #[test]
    fn lmsw_cannot_clear_pe() {
        let mut cpu = real_mode_cpu();
        cpu.state.set_reg32(gpr::EAX, 0x0001);
        // lmsw ax
        run(&mut cpu, &[0x0F, 0x01, 0xF0]);
        assert!(cpu.state.cr0.contains(Cr0::PE));
        assert!(cpu.take_flush_request());

        cpu.state.set_reg32(gpr::EAX, 0x0000);
        cpu.state.eip = 0;
        let inst = crate::decode::decode_bytes(&[0x0F, 0x01, 0xF0], false, cpu.model()).unwrap();
        cpu.execute_instruction(&inst);
        assert!(cpu.state.cr0.contains(Cr0::PE));
    }

    #[test]
    fn smsw_reports_low_cr0() {
        let mut cpu = real_mode_cpu();
        cpu.state.cr0.insert(Cr0::TS);
        // smsw ax
        run(&mut cpu, &[0x0F, 0x01, 0xE0]);
        assert_eq!(cpu.state.ax() & 0x8, 0x8);
    }

    #[test]
    fn sti_opens_an_interrupt_shadow() {
        let mut cpu = real_mode_cpu();
        // sti
        run(&mut cpu, &[0xFB]);
        assert!(cpu.state.flag(EFlags::IF));
        assert!(cpu.events.interrupt_shadow);

        cpu.events.interrupt_shadow = false;
        run(&mut cpu, &[0xFB]);
        assert!(!cpu.events.interrupt_shadow);
    }

    #[test]
    fn cli_in_v86_with_vme_clears_vif() {
        let mut cpu = real_mode_cpu();
        cpu.state.cr0.insert(Cr0::PE);
        cpu.state.cr4.insert(crate::state::Cr4::VME);
        cpu.state.eflags.insert(EFlags::VM | EFlags::IF | EFlags::VIF);
        super::cli(&mut cpu).unwrap();
        assert!(cpu.state.flag(EFlags::IF));
        assert!(!cpu.state.flag(EFlags::VIF));

        cpu.state.eflags.insert(EFlags::VIP);
        assert!(super::sti(&mut cpu).is_err());
    }

    #[test]
    fn cpuid_reports_vendor_and_signature() {
        let mut cpu = real_mode_cpu();
        // cpuid
        run(&mut cpu, &[0x0F, 0xA2]);
        assert_eq!(cpu.state.ebx(), 0x756E_6547);
        cpu.state.set_reg32(gpr::EAX, 1);
        run(&mut cpu, &[0x0F, 0xA2]);
        assert_eq!(cpu.state.eax(), 0x0543);
        assert_ne!(cpu.state.edx() & (1 << 8), 0);
    }

    #[test]
    fn tsc_msr_offsets_rdtsc() {
        let mut cpu = real_mode_cpu();
        cpu.state.set_reg32(gpr::ECX, 0x10);
        cpu.state.set_reg32(gpr::EDX, 1);
        cpu.state.set_reg32(gpr::EAX, 0);
        // wrmsr ; rdtsc
        run(&mut cpu, &[0x0F, 0x30, 0x0F, 0x31]);
        assert_eq!(cpu.state.edx(), 1);
        assert_eq!(cpu.state.eax(), 1);
    }

    #[test]
    fn unknown_msr_faults() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_u16(13 * 4 + 2, 0x0200);
        cpu.state.set_reg32(gpr::ECX, 0x1B);
        assert_eq!(run(&mut cpu, &[0x0F, 0x32]), InstructionOutcome::Faulted);
    }

    #[test]
    fn escape_raises_nm_when_emulating() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_u16(7 * 4 + 2, 0x0200);
        // fld st(0)
        assert_eq!(run(&mut cpu, &[0xD9, 0xC0]), InstructionOutcome::Retired);
        cpu.state.cr0.insert(Cr0::EM);
        assert_eq!(run(&mut cpu, &[0xD9, 0xC0]), InstructionOutcome::Faulted);
    }

    #[test]
    fn mov_cr0_enters_protected_mode_and_requests_flush() {
        let mut cpu = real_mode_cpu();
        cpu.state.set_reg32(gpr::EAX, 1);
        // mov cr0, eax
        run(&mut cpu, &[0x0F, 0x22, 0xC0]);
        assert!(cpu.state.protected_mode());
        assert!(cpu.state.cr0.contains(Cr0::ET));
        assert!(cpu.take_flush_request());
    }

    #[test]
    fn hlt_halts() {
        let mut cpu = real_mode_cpu();
        run(&mut cpu, &[0xF4]);
        assert!(cpu.is_halted());
    }

    #[test]
    fn sldt_is_undefined_in_real_mode() {
        let mut cpu = real_mode_cpu();
        cpu.bus.write_u16(6 * 4 + 2, 0x0200);
        // sldt ax
        assert_eq!(run(&mut cpu, &[0x0F, 0x00, 0xC0]), InstructionOutcome::Faulted);
    }
}
