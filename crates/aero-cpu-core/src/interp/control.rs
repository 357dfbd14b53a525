//! Near and far control transfers, software interrupts and BOUND.

use tracing::debug;

use crate::cpu::Cpu;
use crate::decode::{Instruction, OperandMode, Operation};
use crate::descriptors::{Descriptor, Selector, SystemType};
use crate::exceptions::{fault, fault_code, gp, Exception, ExecResult};
use crate::interrupts::StackWriter;
use crate::state::{gpr, EFlags, Segment};

pub(super) fn execute(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    let size = inst.operand_size.bytes();
    match inst.operation {
        Operation::Jmp => {
            let target = cpu.read_operand(inst, inst.operand(0))? & inst.operand_size.mask();
            jump_near(cpu, target)
        }
        Operation::Call => {
            let target = cpu.read_operand(inst, inst.operand(0))? & inst.operand_size.mask();
            check_cs_limit(cpu, target)?;
            let eip = cpu.state.eip;
            cpu.push(eip, size)?;
            cpu.state.eip = target;
            Ok(())
        }
        Operation::Ret => {
            let target = cpu.peek_stack(0, size)?;
            check_cs_limit(cpu, target)?;
            let release = size + (inst.data.immediate & 0xFFFF);
            let sp = cpu.state.stack_pointer().wrapping_add(release) & cpu.stack_mask();
            cpu.state.set_stack_pointer(sp);
            cpu.state.eip = target;
            Ok(())
        }
        Operation::Jcc(condition) => {
            if condition.test(cpu.state.eflags) {
                let target = cpu.read_operand(inst, inst.operand(0))?;
                jump_near(cpu, target)?;
            }
            Ok(())
        }
        Operation::Loop(condition) => {
            let count = if inst.data.address_size_32 {
                let count = cpu.state.ecx().wrapping_sub(1);
                cpu.state.set_reg32(gpr::ECX, count);
                count
            } else {
                let count = cpu.state.cx().wrapping_sub(1);
                cpu.state.set_reg16(gpr::ECX, count);
                u32::from(count)
            };
            if count != 0 && condition.test(cpu.state.eflags) {
                let target = cpu.read_operand(inst, inst.operand(0))?;
                jump_near(cpu, target)?;
            }
            Ok(())
        }
        Operation::Jcxz => {
            let count = cpu.state.ecx() & inst.data.address_mask();
            if count == 0 {
                let target = cpu.read_operand(inst, inst.operand(0))?;
                jump_near(cpu, target)?;
            }
            Ok(())
        }
        Operation::JmpFar | Operation::CallFar => {
            let (offset, selector) = far_target(cpu, inst)?;
            if inst.operation == Operation::JmpFar {
                jump_far(cpu, selector, offset)
            } else {
                call_far(cpu, selector, offset, size)
            }
        }
        Operation::RetFar => return_far(cpu, size, inst.data.immediate & 0xFFFF),
        Operation::Iret => cpu.iret(size),
        Operation::Int => cpu.software_interrupt(inst.data.immediate as u8),
        Operation::Int3 => cpu.software_interrupt(Exception::Breakpoint.vector()),
        Operation::Into => {
            if cpu.state.flag(EFlags::OF) {
                cpu.software_interrupt(Exception::Overflow.vector())?;
            }
            Ok(())
        }
        _ => bound(cpu, inst),
    }
}

fn check_cs_limit(cpu: &Cpu, target: u32) -> ExecResult<()> {
    if target > cpu.state.segment(Segment::CS).cache.limit {
        return gp(0);
    }
    Ok(())
}

fn jump_near(cpu: &mut Cpu, target: u32) -> ExecResult<()> {
    check_cs_limit(cpu, target)?;
    cpu.state.eip = target;
    Ok(())
}

fn far_target(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<(u32, u16)> {
    let operand = inst.operand(0);
    if operand.mode == OperandMode::FarAddress {
        Ok((inst.data.immediate, inst.data.immediate2 as u16))
    } else {
        cpu.read_far_pointer(inst, operand)
    }
}

fn bound(cpu: &mut Cpu, inst: &Instruction) -> ExecResult<()> {
    let size = inst.operand_size;
    let index = cpu.read_operand_signed(inst, inst.operand(0))? as i32;
    let mem = cpu.memory_operand(inst, inst.operand(1));
    let lower = size.sign_extend(cpu.read_mem_sized(mem.segment, mem.offset, size.bytes())?) as i32;
    let upper_offset = mem.offset.wrapping_add(size.bytes()) & inst.data.address_mask();
    let upper = size.sign_extend(cpu.read_mem_sized(mem.segment, upper_offset, size.bytes())?) as i32;
    if index < lower || index > upper {
        return fault(Exception::BoundRangeExceeded);
    }
    Ok(())
}

/// Checks a code segment descriptor as the target of a direct far JMP or
/// CALL (no privilege change).
fn check_direct_code_target(cpu: &Cpu, sel: Selector, descriptor: &Descriptor) -> ExecResult<()> {
    let cpl = cpu.state.cpl;
    let allowed = if descriptor.is_conforming_code() {
        descriptor.dpl() <= cpl
    } else {
        sel.rpl() <= cpl && descriptor.dpl() == cpl
    };
    if !allowed {
        return gp(sel.error_code());
    }
    if !descriptor.present() {
        return fault_code(Exception::SegmentNotPresent, sel.error_code());
    }
    Ok(())
}

/// Resolves a call gate: checks the gate and returns the target code
/// selector/descriptor and entry offset.
fn resolve_call_gate(cpu: &mut Cpu, sel: Selector, gate: &Descriptor) -> ExecResult<(Selector, Descriptor, u32)> {
    let cpl = cpu.state.cpl;
    if gate.dpl() < cpl || gate.dpl() < sel.rpl() {
        return gp(sel.error_code());
    }
    if !gate.present() {
        return fault_code(Exception::SegmentNotPresent, sel.error_code());
    }
    let target = Selector(gate.gate_selector());
    if target.is_null() {
        return gp(0);
    }
    let code = cpu.read_selector_descriptor(target)?;
    if !code.is_code() || code.dpl() > cpl {
        return gp(target.error_code());
    }
    if !code.present() {
        return fault_code(Exception::SegmentNotPresent, target.error_code());
    }
    let offset = if gate.system_type().is_some_and(SystemType::is_32bit) {
        gate.gate_offset()
    } else {
        gate.gate_offset() & 0xFFFF
    };
    if offset > code.limit() {
        return gp(0);
    }
    Ok((target, code, offset))
}

fn jump_far(cpu: &mut Cpu, selector: u16, offset: u32) -> ExecResult<()> {
    if cpu.state.real_or_v86() {
        check_cs_limit(cpu, offset)?;
        cpu.load_real_mode_cs(selector);
        cpu.state.eip = offset;
        return Ok(());
    }

    let sel = Selector(selector);
    if sel.is_null() {
        return gp(0);
    }
    let descriptor = cpu.read_selector_descriptor(sel)?;
    let cpl = cpu.state.cpl;

    if descriptor.is_code() {
        check_direct_code_target(cpu, sel, &descriptor)?;
        if offset > descriptor.limit() {
            return gp(0);
        }
        cpu.install_code_segment(selector, &descriptor, cpl)?;
        cpu.state.eip = offset;
        return Ok(());
    }

    match descriptor.system_type() {
        Some(SystemType::CallGate16 | SystemType::CallGate32) if !descriptor.is_segment() => {
            let (target, code, entry) = resolve_call_gate(cpu, sel, &descriptor)?;
            // JMP through a gate never changes privilege.
            if !code.is_conforming_code() && code.dpl() != cpl {
                return gp(target.error_code());
            }
            cpu.install_code_segment(target.0, &code, cpl)?;
            cpu.state.eip = entry;
            Ok(())
        }
        Some(kind) if !descriptor.is_segment() && (kind.is_tss() || kind == SystemType::TaskGate) => {
            debug!(selector, "task switches are not supported");
            gp(sel.error_code())
        }
        _ => gp(sel.error_code()),
    }
}

fn call_far(cpu: &mut Cpu, selector: u16, offset: u32, size: u32) -> ExecResult<()> {
    let return_cs = u32::from(cpu.state.selector(Segment::CS));
    let return_eip = cpu.state.eip;

    if cpu.state.real_or_v86() {
        cpu.push(return_cs, size)?;
        cpu.push(return_eip, size)?;
        cpu.load_real_mode_cs(selector);
        cpu.state.eip = offset;
        return Ok(());
    }

    let sel = Selector(selector);
    if sel.is_null() {
        return gp(0);
    }
    let descriptor = cpu.read_selector_descriptor(sel)?;
    let cpl = cpu.state.cpl;

    if descriptor.is_code() {
        check_direct_code_target(cpu, sel, &descriptor)?;
        if offset > descriptor.limit() {
            return gp(0);
        }
        let mut stack = StackWriter::current(cpu);
        stack.push(cpu, return_cs, size)?;
        stack.push(cpu, return_eip, size)?;
        cpu.install_code_segment(selector, &descriptor, cpl)?;
        stack.commit(cpu);
        cpu.state.eip = offset;
        return Ok(());
    }

    match descriptor.system_type() {
        Some(kind @ (SystemType::CallGate16 | SystemType::CallGate32)) if !descriptor.is_segment() => {
            let (target, code, entry) = resolve_call_gate(cpu, sel, &descriptor)?;
            let gate_size = if kind.is_32bit() { 4 } else { 2 };

            if !code.is_conforming_code() && code.dpl() < cpl {
                let new_cpl = code.dpl();
                let (ss, esp) = cpu.tss_stack(new_cpl)?;
                let cache = cpu.load_inner_stack(ss, new_cpl)?;

                // Parameters are copied from the caller's stack, deepest first.
                let count = u32::from(descriptor.gate_parameter_count());
                let mut parameters = Vec::with_capacity(count as usize);
                for i in (0..count).rev() {
                    parameters.push(cpu.peek_stack(i * gate_size, gate_size)?);
                }

                let old_ss = u32::from(cpu.state.selector(Segment::SS));
                let old_esp = cpu.state.esp();
                let mut stack = StackWriter::switched(ss, cache, esp, new_cpl);
                stack.push(cpu, old_ss, gate_size)?;
                stack.push(cpu, old_esp, gate_size)?;
                for value in parameters {
                    stack.push(cpu, value, gate_size)?;
                }
                stack.push(cpu, return_cs, gate_size)?;
                stack.push(cpu, return_eip, gate_size)?;

                cpu.install_code_segment(target.0, &code, new_cpl)?;
                stack.commit(cpu);
                debug!(gate = selector, cpl = new_cpl, "call gate to inner privilege");
            } else {
                let mut stack = StackWriter::current(cpu);
                stack.push(cpu, return_cs, gate_size)?;
                stack.push(cpu, return_eip, gate_size)?;
                cpu.install_code_segment(target.0, &code, cpl)?;
                stack.commit(cpu);
            }
            cpu.state.eip = entry;
            Ok(())
        }
        Some(kind) if !descriptor.is_segment() && (kind.is_tss() || kind == SystemType::TaskGate) => {
            debug!(selector, "task switches are not supported");
            gp(sel.error_code())
        }
        _ => gp(sel.error_code()),
    }
}

fn return_far(cpu: &mut Cpu, size: u32, release: u32) -> ExecResult<()> {
    let eip = cpu.peek_stack(0, size)?;
    let selector = cpu.peek_stack(size, size)? as u16;

    if cpu.state.real_or_v86() {
        if eip > 0xFFFF {
            return gp(0);
        }
        let sp = cpu.state.stack_pointer().wrapping_add(2 * size + release) & cpu.stack_mask();
        cpu.state.set_stack_pointer(sp);
        cpu.load_real_mode_cs(selector);
        cpu.state.eip = eip;
        return Ok(());
    }

    let sel = Selector(selector);
    if sel.is_null() {
        return gp(0);
    }
    let descriptor = cpu.read_selector_descriptor(sel)?;
    let cpl = cpu.state.cpl;
    let rpl = sel.rpl();
    if !descriptor.is_code() || rpl < cpl {
        return gp(sel.error_code());
    }
    let dpl_ok = if descriptor.is_conforming_code() {
        descriptor.dpl() <= rpl
    } else {
        descriptor.dpl() == rpl
    };
    if !dpl_ok {
        return gp(sel.error_code());
    }
    if !descriptor.present() {
        return fault_code(Exception::SegmentNotPresent, sel.error_code());
    }
    if eip > descriptor.limit() {
        return gp(0);
    }

    if rpl == cpl {
        cpu.install_code_segment(selector, &descriptor, cpl)?;
        let sp = cpu.state.stack_pointer().wrapping_add(2 * size + release) & cpu.stack_mask();
        cpu.state.set_stack_pointer(sp);
        cpu.state.eip = eip;
        return Ok(());
    }

    // Return to an outer privilege level: the caller's SS:ESP sit above the
    // released parameters.
    let new_esp = cpu.peek_stack(2 * size + release, size)?;
    let new_ss = cpu.peek_stack(3 * size + release, size)? as u16;
    let ss_cache = cpu.load_outer_stack(new_ss, rpl)?;
    cpu.install_code_segment(selector, &descriptor, rpl)?;
    let ss = cpu.state.segment_mut(Segment::SS);
    ss.selector = new_ss;
    ss.cache = ss_cache;
    let mask = cpu.stack_mask();
    cpu.state.set_stack_pointer(new_esp.wrapping_add(release) & mask);
    cpu.state.eip = eip;
    cpu.null_inaccessible_data_segments();
    debug!(cs = selector, cpl = rpl, "far return to outer privilege");
    Ok(())
}
