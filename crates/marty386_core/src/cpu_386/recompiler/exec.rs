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

    cpu_386::recompiler::exec.rs

    HostOp executor.

    Runs a compiled Block against a CpuContext, with the host registers held
    in a local array.

*/

use crate::{
    cpu_386::{
        context::CpuContext,
        interpreter,
        recompiler::{
            codegen::{Block, CpuField, GuestReg, HostOp, RegWidth},
            regcache::MAX_HOST_REGISTERS,
        },
    },
    cpu_common::*,
};

fn load_guest(regs: &Registers, guest: GuestReg) -> u32 {
    match guest.width {
        RegWidth::Byte => regs.reg8(guest.index) as u32,
        RegWidth::Word => regs.reg16(guest.index) as u32,
        RegWidth::Dword => regs.reg32(guest.index),
    }
}

fn store_guest(regs: &mut Registers, guest: GuestReg, value: u32) {
    match guest.width {
        RegWidth::Byte => regs.set_reg8(guest.index, value as u8),
        RegWidth::Word => regs.set_reg16(guest.index, value as u16),
        RegWidth::Dword => regs.set_reg32(guest.index, value),
    }
}

/// Run a block from its first instruction.
///
/// Stops at the first interpreter call that does not return Okay. Faults propagate as Err with
/// the register file as the interpreter left it.
pub fn execute_block<C: CpuContext + ?Sized>(
    cpu: &mut C,
    block: &Block,
    rep_mode: RepMode,
) -> CpuResult<ExecutionResult> {
    let mut host = [0u32; MAX_HOST_REGISTERS];
    let regs = cpu.registers_mut();
    regs.eip = block.start_eip;
    regs.current_eip = block.start_eip;

    for op in &block.ops {
        match *op {
            HostOp::LoadGuest { dst, guest } => host[dst.0 as usize] = load_guest(cpu.registers(), guest),
            HostOp::StoreGuest { src, guest } => store_guest(cpu.registers_mut(), guest, host[src.0 as usize]),
            HostOp::StoreGuestConstant { guest, value } => store_guest(cpu.registers_mut(), guest, value),
            HostOp::Move { dst, src } => host[dst.0 as usize] = host[src.0 as usize],
            HostOp::MaterializeConstant { dst, value } => host[dst.0 as usize] = value,
            HostOp::Add { dst, src, shift } => {
                let addend = host[src.0 as usize] << shift;
                host[dst.0 as usize] = host[dst.0 as usize].wrapping_add(addend);
            }
            HostOp::AddConstant { dst, value } => host[dst.0 as usize] = host[dst.0 as usize].wrapping_add(value),
            HostOp::And { dst, mask } => host[dst.0 as usize] &= mask,
            HostOp::AddCpuField {
                field: CpuField::Cycles,
                value,
            } => cpu.add_cycles(value),
            HostOp::AddCpuField { field, value } => {
                let regs = cpu.registers_mut();
                let mask = regs.code_address_size().mask();
                if field == CpuField::Eip {
                    regs.eip = regs.eip.wrapping_add(value) & mask;
                }
                else {
                    regs.current_eip = regs.current_eip.wrapping_add(value) & mask;
                }
            }
            HostOp::CallInterpreter { index, cycles } => {
                let Some(instr) = block.instructions.get(index)
                else {
                    log::error!("Block at {:08X} calls missing instruction #{}", block.start_eip, index);
                    return Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0));
                };
                let result = interpreter::execute_instruction(cpu, instr, rep_mode)?;
                cpu.add_cycles(cycles);
                if result != ExecutionResult::Okay {
                    return Ok(result);
                }
            }
        }
    }
    Ok(ExecutionResult::Okay)
}
