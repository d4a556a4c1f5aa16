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

    cpu_386::interpreter::arith.rs

    Arithmetic, logic, BCD and data movement instructions.

*/

use crate::{
    cpu_386::{
        context::{read_memory, CpuContext},
        instruction::Instruction,
        interpreter::operands::*,
        opcodes::OperandMode,
    },
    cpu_common::{alu::*, *},
};

#[inline(always)]
fn set_flags<C: CpuContext + ?Sized>(cpu: &mut C, flags: u32) {
    cpu.registers_mut().set_eflags_raw(flags);
}

pub fn alu<C: CpuContext + ?Sized, T: AluWord>(cpu: &mut C, instr: &Instruction, op: AluOp) -> CpuResult {
    let lhs: T = read_operand(cpu, instr, 0)?;
    let rhs: T = read_operand(cpu, instr, 1)?;
    let (result, flags) = alu_op(op, cpu.registers().eflags(), lhs, rhs);
    if op.writes_result() {
        write_operand(cpu, instr, 0, result)?;
    }
    set_flags(cpu, flags);
    Ok(())
}

pub fn test_and<C: CpuContext + ?Sized, T: AluWord>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let lhs: T = read_operand(cpu, instr, 0)?;
    let rhs: T = read_operand(cpu, instr, 1)?;
    let flags = logic_flags(cpu.registers().eflags(), T::from_u32(lhs.to_u32() & rhs.to_u32()));
    set_flags(cpu, flags);
    Ok(())
}

pub fn inc_dec<C: CpuContext + ?Sized, T: AluWord>(cpu: &mut C, instr: &Instruction, decrement: bool) -> CpuResult {
    let value: T = read_operand(cpu, instr, 0)?;
    let (result, flags) = alu_inc_dec(cpu.registers().eflags(), value, decrement);
    write_operand(cpu, instr, 0, result)?;
    set_flags(cpu, flags);
    Ok(())
}

pub fn neg<C: CpuContext + ?Sized, T: AluWord>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let value: T = read_operand(cpu, instr, 0)?;
    let (result, flags) = alu_neg(cpu.registers().eflags(), value);
    write_operand(cpu, instr, 0, result)?;
    set_flags(cpu, flags);
    Ok(())
}

pub fn not<C: CpuContext + ?Sized, T: AluWord>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let value: T = read_operand(cpu, instr, 0)?;
    write_operand(cpu, instr, 0, T::from_u32(!value.to_u32()))
}

/// XADD: the source register receives the old destination, the destination the sum.
pub fn xadd<C: CpuContext + ?Sized, T: AluWord>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let dst: T = read_operand(cpu, instr, 0)?;
    let src: T = read_operand(cpu, instr, 1)?;
    let (sum, flags) = alu_op(AluOp::Add, cpu.registers().eflags(), dst, src);
    write_operand(cpu, instr, 1, dst)?;
    write_operand(cpu, instr, 0, sum)?;
    set_flags(cpu, flags);
    Ok(())
}

/// CMPXCHG. The destination is written in both outcomes, as the 486 does.
pub fn cmpxchg<C: CpuContext + ?Sized, T: AluWord>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let dst: T = read_operand(cpu, instr, 0)?;
    let accumulator: T = cpu.registers().reg(Register32::EAX as u8);
    let (_, flags) = alu_op(AluOp::Cmp, cpu.registers().eflags(), accumulator, dst);
    if accumulator == dst {
        let src: T = read_operand(cpu, instr, 1)?;
        write_operand(cpu, instr, 0, src)?;
    }
    else {
        write_operand(cpu, instr, 0, dst)?;
        cpu.registers_mut().set_reg(Register32::EAX as u8, dst);
    }
    set_flags(cpu, flags);
    Ok(())
}

pub fn mov<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let value: T = read_operand(cpu, instr, 1)?;
    write_operand(cpu, instr, 0, value)
}

/// MOVZX and MOVSX. T is the source width.
pub fn movzx<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, instr: &Instruction, sign_extend: bool) -> CpuResult {
    let value: T = read_operand(cpu, instr, 1)?;
    let extended = match sign_extend {
        true => value.sign_extend(),
        false => value.to_u32(),
    };
    match instr.operands[0].size {
        OperandSize::Size16 => write_operand(cpu, instr, 0, extended as u16),
        _ => write_operand(cpu, instr, 0, extended),
    }
}

pub fn xchg<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let a: T = read_operand(cpu, instr, 0)?;
    let b: T = read_operand(cpu, instr, 1)?;
    write_operand(cpu, instr, 0, b)?;
    write_operand(cpu, instr, 1, a)
}

pub fn cmov<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    // The source is read whether or not the move happens
    let value: T = read_operand(cpu, instr, 1)?;
    if instr.condition.test_flags(cpu.registers().eflags()) {
        write_operand(cpu, instr, 0, value)?;
    }
    Ok(())
}

pub fn xlat<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let regs = cpu.registers();
    let offset = regs
        .address_reg(Register32::EBX as u8, instr.address_size)
        .wrapping_add(regs.get8(Register8::AL) as u32)
        & instr.address_mask();
    let value: u8 = read_memory(cpu, instr.segment, offset)?;
    cpu.registers_mut().set8(Register8::AL, value);
    Ok(())
}

pub fn lea<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let address = require_memory(cpu, instr, 1)?;
    match instr.operands[0].size {
        OperandSize::Size16 => write_operand(cpu, instr, 0, address.offset as u16),
        _ => write_operand(cpu, instr, 0, address.offset),
    }
}

/// LDS, LES, LSS, LFS and LGS.
pub fn load_far_pointer<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let segment = Segment::from_index(instr.operands[0].data).unwrap_or(Segment::DS);
    let (selector, offset) = read_far_pointer(cpu, instr, 2)?;
    cpu.load_segment_register(segment, selector)?;
    match instr.operand_size {
        OperandSize::Size32 => write_operand(cpu, instr, 1, offset),
        _ => write_operand(cpu, instr, 1, offset as u16),
    }
}

/// MOV to or from a segment register.
pub fn mov_sreg<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    if instr.operands[0].mode == OperandMode::ModRmSegmentReg {
        let segment = match Segment::from_index(instr.modrm_reg()) {
            Some(Segment::CS) | None => return Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0)),
            Some(segment) => segment,
        };
        let selector: u16 = read_operand(cpu, instr, 1)?;
        cpu.load_segment_register(segment, selector)
    }
    else {
        let selector: u16 = read_operand(cpu, instr, 1)?;
        // Register destinations are zero extended at 32-bit operand size
        if instr.modrm_rm_register && instr.operand_size == OperandSize::Size32 {
            write_operand(cpu, instr, 0, selector as u32)
        }
        else {
            write_operand(cpu, instr, 0, selector)
        }
    }
}

/// CBW / CWDE
pub fn cbw<C: CpuContext + ?Sized>(cpu: &mut C, operand_size: OperandSize) {
    let regs = cpu.registers_mut();
    match operand_size {
        OperandSize::Size32 => {
            let ax = regs.get16(Register16::AX);
            regs.set32(Register32::EAX, ax.sign_extend());
        }
        _ => {
            let al = regs.get8(Register8::AL);
            regs.set16(Register16::AX, al.sign_extend() as u16);
        }
    }
}

/// CWD / CDQ
pub fn cwd<C: CpuContext + ?Sized>(cpu: &mut C, operand_size: OperandSize) {
    let regs = cpu.registers_mut();
    match operand_size {
        OperandSize::Size32 => {
            let high = if regs.get32(Register32::EAX) & 0x8000_0000 != 0 { 0xFFFF_FFFF } else { 0 };
            regs.set32(Register32::EDX, high);
        }
        _ => {
            let high = if regs.get16(Register16::AX) & 0x8000 != 0 { 0xFFFF } else { 0 };
            regs.set16(Register16::DX, high);
        }
    }
}

/* ---------------------------------- BCD ---------------------------------- */

fn bcd_result<C: CpuContext + ?Sized>(cpu: &mut C, al: u8, carry: bool, aux_carry: bool) {
    let regs = cpu.registers_mut();
    regs.set8(Register8::AL, al);
    let flags = (regs.eflags() & !(CPU_FLAG_CARRY | CPU_FLAG_AUX_CARRY | CPU_FLAG_SIGN | CPU_FLAG_ZERO | CPU_FLAG_PARITY))
        | szp_flags(al)
        | if carry { CPU_FLAG_CARRY } else { 0 }
        | if aux_carry { CPU_FLAG_AUX_CARRY } else { 0 };
    regs.set_eflags_raw(flags);
}

pub fn daa<C: CpuContext + ?Sized>(cpu: &mut C) {
    let regs = cpu.registers();
    let old_al = regs.get8(Register8::AL);
    let old_carry = regs.get_flag(Flag::Carry);
    let mut al = old_al;
    let mut carry = false;
    let mut aux_carry = false;

    if (old_al & 0x0F) > 9 || regs.get_flag(Flag::AuxCarry) {
        let (sum, overflow) = al.overflowing_add(6);
        al = sum;
        carry = old_carry || overflow;
        aux_carry = true;
    }
    if old_al > 0x99 || old_carry {
        al = al.wrapping_add(0x60);
        carry = true;
    }
    bcd_result(cpu, al, carry, aux_carry);
}

pub fn das<C: CpuContext + ?Sized>(cpu: &mut C) {
    let regs = cpu.registers();
    let old_al = regs.get8(Register8::AL);
    let old_carry = regs.get_flag(Flag::Carry);
    let mut al = old_al;
    let mut carry = false;
    let mut aux_carry = false;

    if (old_al & 0x0F) > 9 || regs.get_flag(Flag::AuxCarry) {
        let (difference, borrow) = al.overflowing_sub(6);
        al = difference;
        carry = old_carry || borrow;
        aux_carry = true;
    }
    if old_al > 0x99 || old_carry {
        al = al.wrapping_sub(0x60);
        carry = true;
    }
    bcd_result(cpu, al, carry, aux_carry);
}

pub fn aaa<C: CpuContext + ?Sized>(cpu: &mut C) {
    let regs = cpu.registers_mut();
    let adjust = (regs.get8(Register8::AL) & 0x0F) > 9 || regs.get_flag(Flag::AuxCarry);
    if adjust {
        let ax = regs.get16(Register16::AX).wrapping_add(0x106);
        regs.set16(Register16::AX, ax);
    }
    let al = regs.get8(Register8::AL) & 0x0F;
    regs.set8(Register8::AL, al);
    regs.set_flag_state(Flag::AuxCarry, adjust);
    regs.set_flag_state(Flag::Carry, adjust);
}

pub fn aas<C: CpuContext + ?Sized>(cpu: &mut C) {
    let regs = cpu.registers_mut();
    let adjust = (regs.get8(Register8::AL) & 0x0F) > 9 || regs.get_flag(Flag::AuxCarry);
    if adjust {
        let al = regs.get8(Register8::AL).wrapping_sub(6);
        let ah = regs.get8(Register8::AH).wrapping_sub(1);
        regs.set8(Register8::AL, al);
        regs.set8(Register8::AH, ah);
    }
    let al = regs.get8(Register8::AL) & 0x0F;
    regs.set8(Register8::AL, al);
    regs.set_flag_state(Flag::AuxCarry, adjust);
    regs.set_flag_state(Flag::Carry, adjust);
}

pub fn aam<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let base = instr.immediate as u8;
    if base == 0 {
        return Err(cpu.raise_exception(Interrupt::DivideError, 0));
    }
    let regs = cpu.registers_mut();
    let al = regs.get8(Register8::AL);
    regs.set8(Register8::AH, al / base);
    regs.set8(Register8::AL, al % base);
    let flags = logic_flags(regs.eflags(), al % base);
    regs.set_eflags_raw(flags);
    Ok(())
}

pub fn aad<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) {
    let base = instr.immediate as u8;
    let regs = cpu.registers_mut();
    let al = regs
        .get8(Register8::AL)
        .wrapping_add(regs.get8(Register8::AH).wrapping_mul(base));
    regs.set16(Register16::AX, al as u16);
    let flags = logic_flags(regs.eflags(), al);
    regs.set_eflags_raw(flags);
}

/// Undocumented: AL = CF ? 0xFF : 0.
pub fn salc<C: CpuContext + ?Sized>(cpu: &mut C) {
    let regs = cpu.registers_mut();
    let value = if regs.get_flag(Flag::Carry) { 0xFF } else { 0 };
    regs.set8(Register8::AL, value);
}
