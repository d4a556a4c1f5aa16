/*
    Marty386
    x86 instruction emulation core

    Copyright 2025 The Marty386 Authors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    ---------------------------------------------------------------------------

    cpu_386::interpreter::system.rs

    Flag, I/O and system instructions.

*/

use crate::{
    cpu_386::{
        context::CpuContext,
        instruction::Instruction,
        interpreter::{check_io_permission, check_iopl, operands::*, require_cpl0, require_protected_mode},
        opcodes::{OperandMode, Operation},
    },
    cpu_common::*,
};

const CR4_TSD: u32 = 1 << 2;

/// Flags visible to LAHF and SAHF: SF, ZF, AF, PF and CF.
const LAHF_MASK: u32 = 0xD5;

pub fn cli<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult {
    check_iopl(cpu)?;
    cpu.registers_mut().clear_flag(Flag::Interrupt);
    Ok(())
}

pub fn sti<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult {
    check_iopl(cpu)?;
    cpu.registers_mut().set_flag(Flag::Interrupt);
    Ok(())
}

pub fn lahf<C: CpuContext + ?Sized>(cpu: &mut C) {
    let regs = cpu.registers_mut();
    let value = (regs.eflags() & LAHF_MASK) as u8 | CPU_FLAG_RESERVED1 as u8;
    regs.set8(Register8::AH, value);
}

pub fn sahf<C: CpuContext + ?Sized>(cpu: &mut C) {
    let regs = cpu.registers_mut();
    let value = regs.get8(Register8::AH) as u32;
    regs.set_eflags_masked(value, LAHF_MASK);
}

/// The port of an IN or OUT: an 8-bit immediate or DX.
fn port_number(instr: &Instruction, regs: &Registers, index: usize) -> u16 {
    match instr.operands[index].mode {
        OperandMode::Immediate => (instr.immediate & 0xFF) as u16,
        _ => regs.get16(Register16::DX),
    }
}

pub fn port_in<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let port = port_number(instr, cpu.registers(), 1);
    let size = instr.operands[0].size;
    check_io_permission(cpu, port, size.bytes())?;
    match size {
        OperandSize::Size8 => {
            let value = cpu.read_io_port_byte(port)?;
            cpu.registers_mut().set8(Register8::AL, value);
        }
        OperandSize::Size16 => {
            let value = cpu.read_io_port_word(port)?;
            cpu.registers_mut().set16(Register16::AX, value);
        }
        _ => {
            let value = cpu.read_io_port_dword(port)?;
            cpu.registers_mut().set32(Register32::EAX, value);
        }
    }
    Ok(())
}

pub fn port_out<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let port = port_number(instr, cpu.registers(), 0);
    let size = instr.operands[1].size;
    check_io_permission(cpu, port, size.bytes())?;
    let regs = cpu.registers();
    match size {
        OperandSize::Size8 => {
            let value = regs.get8(Register8::AL);
            cpu.write_io_port_byte(port, value)
        }
        OperandSize::Size16 => {
            let value = regs.get16(Register16::AX);
            cpu.write_io_port_word(port, value)
        }
        _ => {
            let value = regs.get32(Register32::EAX);
            cpu.write_io_port_dword(port, value)
        }
    }
}

pub fn hlt<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult {
    require_cpl0(cpu)?;
    cpu.set_halted(true);
    Ok(())
}

/// A coprocessor escape with no coprocessor attached.
pub fn esc<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult {
    let cr0 = cpu.registers().cr0;
    if cr0 & (CR0_EM | CR0_TS) != 0 {
        return Err(cpu.raise_exception(Interrupt::CoprocessorNotAvailable, 0));
    }
    Ok(())
}

pub fn clts<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult {
    require_cpl0(cpu)?;
    cpu.registers_mut().cr0 &= !CR0_TS;
    Ok(())
}

/// LGDT and LIDT. With a 16-bit operand size only 24 bits of the base are loaded.
pub fn load_descriptor_table<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    require_cpl0(cpu)?;
    let address = require_memory(cpu, instr, 0)?;
    let limit = cpu.read_memory_word(address.segment, address.offset)?;
    let base_address = offset_address(instr, address, 2);
    let mut base = cpu.read_memory_dword(base_address.segment, base_address.offset)?;
    if instr.operand_size != OperandSize::Size32 {
        base &= 0x00FF_FFFF;
    }
    let table = DescriptorTablePointer { base, limit };
    let regs = cpu.registers_mut();
    match instr.operation {
        Operation::Lgdt => regs.gdtr = table,
        _ => regs.idtr = table,
    }
    Ok(())
}

/// SGDT and SIDT. The 286 stores 0xFF in the unused top byte of the base.
pub fn store_descriptor_table<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let address = require_memory(cpu, instr, 0)?;
    let regs = cpu.registers();
    let table = match instr.operation {
        Operation::Sgdt => regs.gdtr,
        _ => regs.idtr,
    };
    let base = match (instr.operand_size, cpu.model()) {
        (OperandSize::Size32, _) => table.base,
        (_, CpuModel::Intel80286) => table.base | 0xFF00_0000,
        _ => table.base & 0x00FF_FFFF,
    };
    cpu.write_memory_word(address.segment, address.offset, table.limit)?;
    let base_address = offset_address(instr, address, 2);
    cpu.write_memory_dword(base_address.segment, base_address.offset, base)
}

/// Store a selector-sized system value. Register destinations take the full
/// operand size, zero extended; memory destinations are always 16 bits.
fn store_selector<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction, value: u32) -> CpuResult {
    if instr.modrm_rm_register && instr.operand_size == OperandSize::Size32 {
        cpu.registers_mut().set_reg32(instr.modrm_rm(), value);
        Ok(())
    }
    else {
        write_operand(cpu, instr, 0, value as u16)
    }
}

pub fn lldt<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    require_protected_mode(cpu)?;
    require_cpl0(cpu)?;
    let selector: u16 = read_operand(cpu, instr, 0)?;
    cpu.load_ldt(selector)
}

pub fn sldt<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    require_protected_mode(cpu)?;
    let ldtr = cpu.registers().ldtr as u32;
    store_selector(cpu, instr, ldtr)
}

pub fn ltr<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    require_protected_mode(cpu)?;
    require_cpl0(cpu)?;
    let selector: u16 = read_operand(cpu, instr, 0)?;
    cpu.load_task_register(selector)
}

pub fn store_task_register<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    require_protected_mode(cpu)?;
    let task_register = cpu.registers().task_register as u32;
    store_selector(cpu, instr, task_register)
}

/// LMSW loads the low four bits of CR0. It can set PE but never clear it.
pub fn lmsw<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    require_cpl0(cpu)?;
    let value: u16 = read_operand(cpu, instr, 0)?;
    let cr0 = cpu.registers().cr0;
    let new_cr0 = (cr0 & !0x0F) | (value as u32 & 0x0F) | (cr0 & CR0_PE);
    cpu.set_control_register(0, new_cr0)
}

pub fn smsw<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let cr0 = cpu.registers().cr0;
    store_selector(cpu, instr, cr0)
}

/// A descriptor is visible to VERR, VERW, LAR and LSL if it is present in its
/// table and, unless it is conforming code, DPL >= max(CPL, RPL).
fn visible_descriptor<C: CpuContext + ?Sized>(cpu: &mut C, selector: u16) -> CpuResult<Option<(u64, SegmentCache)>> {
    if selector & 0xFFFC == 0 {
        return Ok(None);
    }
    let Some(raw) = cpu.lookup_descriptor(selector)?
    else {
        return Ok(None);
    };
    let cache = SegmentCache::from_descriptor(raw);
    let rpl = (selector & 3) as u8;
    if !cache.is_conforming() && cache.dpl() < cpu.cpl().max(rpl) {
        return Ok(None);
    }
    Ok(Some((raw, cache)))
}

pub fn verify_segment<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction, write: bool) -> CpuResult {
    require_protected_mode(cpu)?;
    let selector: u16 = read_operand(cpu, instr, 0)?;
    let accessible = match visible_descriptor(cpu, selector)? {
        Some((_, cache)) if !cache.is_system() => match write {
            true => cache.is_writable(),
            false => cache.is_readable(),
        },
        _ => false,
    };
    cpu.registers_mut().set_flag_state(Flag::Zero, accessible);
    Ok(())
}

pub fn load_access_rights<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    require_protected_mode(cpu)?;
    let selector: u16 = read_operand(cpu, instr, 1)?;
    let descriptor = match visible_descriptor(cpu, selector)? {
        Some((raw, cache)) if !cache.is_system() || matches!(cache.descriptor_type(), 1..=5 | 9 | 0xB | 0xC) => {
            Some(raw)
        }
        _ => None,
    };
    if let Some(raw) = descriptor {
        let rights = (raw >> 32) as u32;
        match instr.operand_size {
            OperandSize::Size32 => write_operand(cpu, instr, 0, rights & 0x00F0_FF00)?,
            _ => write_operand(cpu, instr, 0, (rights & 0xFF00) as u16)?,
        }
    }
    cpu.registers_mut().set_flag_state(Flag::Zero, descriptor.is_some());
    Ok(())
}

pub fn load_segment_limit<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    require_protected_mode(cpu)?;
    let selector: u16 = read_operand(cpu, instr, 1)?;
    let limit = match visible_descriptor(cpu, selector)? {
        Some((_, cache)) if !cache.is_system() || matches!(cache.descriptor_type(), 1..=3 | 9 | 0xB) => {
            Some(cache.limit)
        }
        _ => None,
    };
    if let Some(limit) = limit {
        match instr.operand_size {
            OperandSize::Size32 => write_operand(cpu, instr, 0, limit)?,
            _ => write_operand(cpu, instr, 0, limit as u16)?,
        }
    }
    cpu.registers_mut().set_flag_state(Flag::Zero, limit.is_some());
    Ok(())
}

/// ARPL raises the destination selector's RPL to the source's.
pub fn arpl<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    require_protected_mode(cpu)?;
    let dst: u16 = read_operand(cpu, instr, 0)?;
    let src: u16 = read_operand(cpu, instr, 1)?;
    let adjust = (dst & 3) < (src & 3);
    if adjust {
        write_operand(cpu, instr, 0, (dst & !3) | (src & 3))?;
    }
    cpu.registers_mut().set_flag_state(Flag::Zero, adjust);
    Ok(())
}

/// MOV to or from CR0-CR4. The general register is always named by ModRM.rm.
pub fn mov_control_register<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    require_cpl0(cpu)?;
    if instr.operands[0].mode == OperandMode::ModRmControlReg {
        let value = cpu.registers().reg32(instr.modrm_rm());
        cpu.set_control_register(instr.modrm_reg(), value)
    }
    else {
        let value: u32 = read_operand(cpu, instr, 1)?;
        cpu.registers_mut().set_reg32(instr.modrm_rm(), value);
        Ok(())
    }
}

/// MOV to or from the debug and test registers.
pub fn mov_debug_register<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    require_cpl0(cpu)?;
    let index = instr.modrm_reg() as usize;
    match instr.operands[0].mode {
        OperandMode::ModRmDebugReg => {
            let value = cpu.registers().reg32(instr.modrm_rm());
            cpu.registers_mut().dr[index] = value;
        }
        OperandMode::ModRmTestReg => {
            let value = cpu.registers().reg32(instr.modrm_rm());
            cpu.registers_mut().tr[index] = value;
        }
        _ => {
            let value: u32 = read_operand(cpu, instr, 1)?;
            cpu.registers_mut().set_reg32(instr.modrm_rm(), value);
        }
    }
    Ok(())
}

/// INVD and WBINVD. There is no cache to flush.
pub fn invalidate_cache<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult {
    require_cpl0(cpu)
}

pub fn invlpg<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    require_cpl0(cpu)?;
    let address = require_memory(cpu, instr, 0)?;
    let linear = cpu.registers().segment_base(address.segment).wrapping_add(address.offset);
    cpu.invalidate_tlb_entry(linear);
    Ok(())
}

pub fn cpuid<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult {
    if !cpu.model().has_cpuid() {
        return Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0));
    }
    let has_fpu = cpu.has_fpu();
    let regs = cpu.registers_mut();
    let (eax, ebx, ecx, edx) = match regs.get32(Register32::EAX) {
        0 => (
            1,
            u32::from_le_bytes(*b"Genu"),
            u32::from_le_bytes(*b"ntel"),
            u32::from_le_bytes(*b"ineI"),
        ),
        // Family 4, model 8 (486DX4)
        1 => (0x0480, 0, 0, has_fpu as u32),
        _ => (0, 0, 0, 0),
    };
    regs.set32(Register32::EAX, eax);
    regs.set32(Register32::EBX, ebx);
    regs.set32(Register32::ECX, ecx);
    regs.set32(Register32::EDX, edx);
    Ok(())
}

pub fn rdtsc<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult {
    let regs = cpu.registers();
    if regs.cr4 & CR4_TSD != 0 && regs.in_protected_mode() && cpu.cpl() > 0 {
        return Err(cpu.raise_exception(Interrupt::GeneralProtectionFault, 0));
    }
    let tsc = cpu.read_tsc();
    let regs = cpu.registers_mut();
    regs.set32(Register32::EAX, tsc as u32);
    regs.set32(Register32::EDX, (tsc >> 32) as u32);
    Ok(())
}
