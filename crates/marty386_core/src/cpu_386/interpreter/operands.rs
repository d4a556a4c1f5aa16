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

    cpu_386::interpreter::operands.rs

    Operand access for decoded instructions.

*/

use crate::{
    cpu_386::{
        context::{read_memory, write_memory, CpuContext},
        instruction::Instruction,
        modrm,
        opcodes::OperandMode,
    },
    cpu_common::*,
};

/// Where a memory operand lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryAddress {
    pub segment: Segment,
    pub offset: u32,
}

/// Resolve the segment and offset of a memory operand. Returns None for register,
/// immediate and other non-memory operands.
pub fn operand_address<C: CpuContext + ?Sized>(cpu: &C, instr: &Instruction, index: usize) -> Option<MemoryAddress> {
    let operand = &instr.operands[index];
    let regs = cpu.registers();
    match operand.mode {
        OperandMode::ModRmRm if !instr.modrm_rm_register => Some(MemoryAddress {
            segment: instr.segment,
            offset: modrm::effective_address(regs, instr),
        }),
        OperandMode::Memory => Some(MemoryAddress {
            segment: instr.segment,
            offset: instr.displacement & instr.address_mask(),
        }),
        OperandMode::RegisterIndirect => Some(string_address(regs, instr, operand.data)),
        _ => None,
    }
}

/// DS:ESI (overridable) for register 6, ES:EDI for register 7.
#[inline(always)]
pub fn string_address(regs: &Registers, instr: &Instruction, register: u8) -> MemoryAddress {
    let segment = if register == Register32::EDI as u8 {
        Segment::ES
    }
    else {
        instr.segment
    };
    MemoryAddress {
        segment,
        offset: regs.address_reg(register, instr.address_size),
    }
}

/// Read an operand as width T. 8-bit immediates read at a wider width are sign extended.
pub fn read_operand<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, instr: &Instruction, index: usize) -> CpuResult<T> {
    let operand = instr.operands[index];
    let regs = cpu.registers();
    let value = match operand.mode {
        OperandMode::Register => regs.reg::<T>(operand.data),
        OperandMode::ModRmReg => regs.reg::<T>(instr.modrm_reg()),
        OperandMode::ModRmRm if instr.modrm_rm_register => regs.reg::<T>(instr.modrm_rm()),
        OperandMode::SegmentRegister => T::from_u32(regs.segment_selectors[operand.data as usize % SEGMENT_COUNT] as u32),
        OperandMode::ModRmSegmentReg => {
            let index = instr.modrm_reg() as usize;
            if index >= SEGMENT_COUNT {
                return Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0));
            }
            T::from_u32(regs.segment_selectors[index] as u32)
        }
        OperandMode::Immediate => match operand.size {
            OperandSize::Size8 if T::BITS > 8 => T::from_u32(instr.immediate as u8 as i8 as i32 as u32),
            _ => T::from_u32(instr.immediate),
        },
        OperandMode::Immediate2 => T::from_u32(instr.immediate2),
        OperandMode::Constant => T::from_u32(operand.data as u32),
        OperandMode::ModRmControlReg => T::from_u32(match instr.modrm_reg() {
            0 => regs.cr0,
            2 => regs.cr2,
            3 => regs.cr3,
            4 => regs.cr4,
            _ => return Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0)),
        }),
        OperandMode::ModRmDebugReg => T::from_u32(regs.dr[instr.modrm_reg() as usize]),
        OperandMode::ModRmTestReg => T::from_u32(regs.tr[instr.modrm_reg() as usize]),
        OperandMode::ModRmRm | OperandMode::Memory | OperandMode::RegisterIndirect => {
            let address = operand_address(cpu, instr, index).unwrap_or(MemoryAddress {
                segment: instr.segment,
                offset: 0,
            });
            return read_memory(cpu, address.segment, address.offset);
        }
        OperandMode::None | OperandMode::Relative | OperandMode::FarAddress | OperandMode::FpuRegister => {
            log::error!("read of unreadable operand {:?} in {}", operand.mode, instr);
            return Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0));
        }
    };
    Ok(value)
}

/// Write an operand as width T.
pub fn write_operand<C: CpuContext + ?Sized, T: Word>(
    cpu: &mut C,
    instr: &Instruction,
    index: usize,
    value: T,
) -> CpuResult {
    let operand = instr.operands[index];
    match operand.mode {
        OperandMode::Register => cpu.registers_mut().set_reg(operand.data, value),
        OperandMode::ModRmReg => cpu.registers_mut().set_reg(instr.modrm_reg(), value),
        OperandMode::ModRmRm if instr.modrm_rm_register => cpu.registers_mut().set_reg(instr.modrm_rm(), value),
        OperandMode::ModRmRm | OperandMode::Memory | OperandMode::RegisterIndirect => {
            let address = operand_address(cpu, instr, index).unwrap_or(MemoryAddress {
                segment: instr.segment,
                offset: 0,
            });
            return write_memory(cpu, address.segment, address.offset, value);
        }
        _ => {
            log::error!("write to unwritable operand {:?} in {}", operand.mode, instr);
            return Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0));
        }
    }
    Ok(())
}

/// Read the far pointer (offset, then selector) addressed by a memory operand.
pub fn read_far_pointer<C: CpuContext + ?Sized>(
    cpu: &mut C,
    instr: &Instruction,
    index: usize,
) -> CpuResult<(u16, u32)> {
    let Some(address) = operand_address(cpu, instr, index)
    else {
        // A register operand is invalid here
        return Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0));
    };
    let (offset, selector_offset) = match instr.operand_size {
        OperandSize::Size32 => (cpu.read_memory_dword(address.segment, address.offset)?, 4),
        _ => (cpu.read_memory_word(address.segment, address.offset)? as u32, 2),
    };
    let selector = cpu.read_memory_word(address.segment, address.offset.wrapping_add(selector_offset))?;
    Ok((selector, offset))
}

/// The memory operand's address, raising #UD when the operand is a register.
pub fn require_memory<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction, index: usize) -> CpuResult<MemoryAddress> {
    match operand_address(cpu, instr, index) {
        Some(address) => Ok(address),
        None => Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0)),
    }
}

/// Offset `offset` bytes into a memory operand, wrapping at the address size.
#[inline]
pub fn offset_address(instr: &Instruction, address: MemoryAddress, offset: u32) -> MemoryAddress {
    MemoryAddress {
        segment: address.segment,
        offset: address.offset.wrapping_add(offset) & instr.address_mask(),
    }
}
