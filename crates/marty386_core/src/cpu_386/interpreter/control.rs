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

    cpu_386::interpreter::control.rs

    Control transfer instructions.

    Relative branches are taken from EIP, which already points at the next
    instruction. Far transfers are delegated to the context, which owns
    descriptor checks and privilege changes.

*/

use crate::{
    cpu_386::{
        context::{adjust_stack_pointer, peek_sized, push_sized, read_memory, CpuContext},
        instruction::Instruction,
        interpreter::{branch_target, operands::*},
        opcodes::OperandMode,
    },
    cpu_common::{alu::Word, *},
};

/// Check a near target against the CS limit. Faults happen before any state changes.
pub(crate) fn check_code_limit<C: CpuContext + ?Sized>(cpu: &mut C, target: u32) -> CpuResult {
    if target > cpu.registers().segment_cache[Segment::CS as usize].limit {
        return Err(cpu.raise_exception(Interrupt::GeneralProtectionFault, 0));
    }
    Ok(())
}

/// Resolve the target of a near JMP or CALL.
fn near_target<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult<u32> {
    let target = match instr.operands[0].mode {
        OperandMode::Relative => {
            let eip = cpu.registers().eip;
            branch_target(instr, eip.wrapping_add(instr.displacement))
        }
        _ => match instr.operand_size {
            OperandSize::Size32 => read_operand::<C, u32>(cpu, instr, 0)?,
            _ => read_operand::<C, u16>(cpu, instr, 0)? as u32,
        },
    };
    check_code_limit(cpu, target)?;
    Ok(target)
}

fn far_target<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult<(u16, u32)> {
    match instr.operands[0].mode {
        OperandMode::FarAddress => Ok((instr.immediate as u16, instr.displacement)),
        _ => read_far_pointer(cpu, instr, 0),
    }
}

pub fn jmp_near<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let target = near_target(cpu, instr)?;
    cpu.branch_to(target);
    Ok(())
}

pub fn jmp_far<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let (selector, offset) = far_target(cpu, instr)?;
    cpu.far_jump(selector, offset, instr.operand_size)
}

pub fn call_near<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let target = near_target(cpu, instr)?;
    let return_eip = cpu.registers().eip;
    push_sized(cpu, instr.operand_size, return_eip)?;
    cpu.branch_to(target);
    Ok(())
}

pub fn call_far<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let (selector, offset) = far_target(cpu, instr)?;
    cpu.far_call(selector, offset, instr.operand_size)
}

/// Bytes of parameters released by RET imm16.
fn release_bytes(instr: &Instruction) -> u32 {
    match instr.operands[0].mode {
        OperandMode::Immediate => instr.immediate & 0xFFFF,
        _ => 0,
    }
}

pub fn ret_near<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let target = peek_sized(cpu, instr.operand_size, 0)?;
    check_code_limit(cpu, target)?;
    adjust_stack_pointer(cpu, instr.operand_size.bytes() + release_bytes(instr));
    cpu.branch_to(target);
    Ok(())
}

pub fn ret_far<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    cpu.far_return(instr.operand_size, release_bytes(instr))
}

pub fn jcc<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let regs = cpu.registers();
    let taken = match instr.condition {
        JumpCondition::CXZero => regs.count(instr.address_size) == 0,
        condition => condition.test_flags(regs.eflags()),
    };
    if taken {
        jmp_near(cpu, instr)?;
    }
    Ok(())
}

/// LOOP, LOOPE and LOOPNE. The count register width follows the address size.
pub fn loop_cc<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let regs = cpu.registers();
    let old_count = regs.count(instr.address_size);
    let count = old_count.wrapping_sub(1) & instr.address_mask();
    let zero = regs.get_flag(Flag::Zero);
    let taken = count != 0
        && match instr.condition {
            JumpCondition::Equal => zero,
            JumpCondition::NotEqual => !zero,
            _ => true,
        };
    cpu.registers_mut().set_count(instr.address_size, count);
    if taken {
        if let Err(abort) = jmp_near(cpu, instr) {
            cpu.registers_mut().set_count(instr.address_size, old_count);
            return Err(abort);
        }
    }
    Ok(())
}

/// INT n and INT3. INT n is IOPL-sensitive in virtual-8086 mode; INT3 is not.
pub fn interrupt<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let vector: u8 = read_operand(cpu, instr, 0)?;
    let regs = cpu.registers();
    if instr.operands[0].mode == OperandMode::Immediate && regs.in_v86_mode() && regs.iopl() < 3 {
        return Err(cpu.raise_exception(Interrupt::GeneralProtectionFault, 0));
    }
    cpu.software_interrupt(vector)
}

pub fn interrupt_on_overflow<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult {
    if cpu.registers().get_flag(Flag::Overflow) {
        return cpu.software_interrupt(Interrupt::Overflow.vector());
    }
    Ok(())
}

pub fn iret<C: CpuContext + ?Sized>(cpu: &mut C, operand_size: OperandSize) -> CpuResult {
    let regs = cpu.registers();
    if regs.in_v86_mode() && regs.iopl() < 3 {
        return Err(cpu.raise_exception(Interrupt::GeneralProtectionFault, 0));
    }
    cpu.interrupt_return(operand_size)
}

/// BOUND. The index and both bounds are signed.
pub fn bound<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let index = read_operand::<C, T>(cpu, instr, 0)?.sign_extend() as i32;
    let address = require_memory(cpu, instr, 1)?;
    let lower = read_memory::<C, T>(cpu, address.segment, address.offset)?.sign_extend() as i32;
    let upper_address = offset_address(instr, address, T::BITS / 8);
    let upper = read_memory::<C, T>(cpu, upper_address.segment, upper_address.offset)?.sign_extend() as i32;
    if index < lower || index > upper {
        return Err(cpu.raise_exception(Interrupt::Bounds, 0));
    }
    Ok(())
}
