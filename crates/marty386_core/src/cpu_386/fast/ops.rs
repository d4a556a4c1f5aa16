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

    cpu_386::fast::ops.rs

    Specialized opcode handlers for the fast path.

    Handlers are generic over the operand width, and where the opcode names
    them, over the ALU operation and the register. Each instantiation decodes
    its own operands straight from the instruction stream.

*/

use crate::{
    cpu_386::{
        context::{adjust_stack_pointer, peek_sized, pop, push, push_sized, CpuContext},
        fast::{ea::*, FastState},
        interpreter::{
            check_io_permission,
            control::check_code_limit,
            muldiv::{divide_accumulator, multiply_accumulator, multiply_truncated},
            string::{read_port, write_port},
        },
    },
    cpu_common::{alu::*, *},
};

/// An ALU operation selected at compile time.
pub trait AluKind {
    const OP: AluOp;
}

macro_rules! alu_kinds {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            pub struct $name;
            impl AluKind for $name {
                const OP: AluOp = AluOp::$op;
            }
        )*
    };
}

alu_kinds!(
    AddKind => Add,
    OrKind => Or,
    AdcKind => Adc,
    SbbKind => Sbb,
    AndKind => And,
    SubKind => Sub,
    XorKind => Xor,
    CmpKind => Cmp,
);

/// Call `func::<C, .., K>` with the ALU kind named by a ModRM reg field or opcode bits.
macro_rules! alu_dispatch {
    ($index:expr, $func:ident::<$($g:ty),*>($($arg:expr),*)) => {
        match $index & 0x07 {
            0 => $func::<$($g,)* AddKind>($($arg),*),
            1 => $func::<$($g,)* OrKind>($($arg),*),
            2 => $func::<$($g,)* AdcKind>($($arg),*),
            3 => $func::<$($g,)* SbbKind>($($arg),*),
            4 => $func::<$($g,)* AndKind>($($arg),*),
            5 => $func::<$($g,)* SubKind>($($arg),*),
            6 => $func::<$($g,)* XorKind>($($arg),*),
            _ => $func::<$($g,)* CmpKind>($($arg),*),
        }
    };
}
pub(crate) use alu_dispatch;

#[inline(always)]
fn alu_apply<C: CpuContext + ?Sized, T: AluWord, K: AluKind>(cpu: &C, lhs: T, rhs: T) -> (T, u32) {
    alu_op(K::OP, cpu.registers().eflags(), lhs, rhs)
}

#[inline(always)]
fn set_flags<C: CpuContext + ?Sized>(cpu: &mut C, flags: u32) {
    cpu.registers_mut().set_eflags_raw(flags);
}

/// ALU r/m, reg (opcode bit 1 clear) or ALU reg, r/m (bit 1 set).
pub fn alu_modrm<C: CpuContext + ?Sized, T: AluWord, K: AluKind>(cpu: &mut C, st: &FastState, to_reg: bool) -> CpuResult {
    let modrm = fetch_modrm(cpu, st)?;
    let reg: T = cpu.registers().reg(modrm.reg);
    let rm: T = read_rm(cpu, modrm.rm)?;
    if to_reg {
        let (result, flags) = alu_apply::<C, T, K>(cpu, reg, rm);
        if K::OP.writes_result() {
            cpu.registers_mut().set_reg(modrm.reg, result);
        }
        set_flags(cpu, flags);
    }
    else {
        let (result, flags) = alu_apply::<C, T, K>(cpu, rm, reg);
        if K::OP.writes_result() {
            write_rm(cpu, modrm.rm, result)?;
        }
        set_flags(cpu, flags);
    }
    Ok(())
}

/// ALU AL/AX/EAX, imm.
pub fn alu_accumulator<C: CpuContext + ?Sized, T: AluWord, K: AluKind>(cpu: &mut C) -> CpuResult {
    let imm: T = fetch_imm(cpu)?;
    let acc: T = cpu.registers().reg(Register32::EAX as u8);
    let (result, flags) = alu_apply::<C, T, K>(cpu, acc, imm);
    if K::OP.writes_result() {
        cpu.registers_mut().set_reg(Register32::EAX as u8, result);
    }
    set_flags(cpu, flags);
    Ok(())
}

/// Group 1 with the immediate already fetched.
pub fn alu_rm_imm<C: CpuContext + ?Sized, T: AluWord, K: AluKind>(cpu: &mut C, rm: FastRm, imm: T) -> CpuResult {
    let value: T = read_rm(cpu, rm)?;
    let (result, flags) = alu_apply::<C, T, K>(cpu, value, imm);
    if K::OP.writes_result() {
        write_rm(cpu, rm, result)?;
    }
    set_flags(cpu, flags);
    Ok(())
}

/// Group 1: 0x80 and 0x82 with imm8, 0x81 with a full immediate, 0x83 with a
/// sign-extended imm8.
pub fn group1<C: CpuContext + ?Sized, T: AluWord>(cpu: &mut C, st: &FastState, sign_extended: bool) -> CpuResult {
    let modrm = fetch_modrm(cpu, st)?;
    let imm: T = match sign_extended {
        true => fetch_simm8(cpu)?,
        false => fetch_imm(cpu)?,
    };
    alu_dispatch!(modrm.reg, alu_rm_imm::<C, T>(cpu, modrm.rm, imm))
}

pub fn test_modrm<C: CpuContext + ?Sized, T: AluWord>(cpu: &mut C, st: &FastState) -> CpuResult {
    let modrm = fetch_modrm(cpu, st)?;
    let reg: T = cpu.registers().reg(modrm.reg);
    let rm: T = read_rm(cpu, modrm.rm)?;
    let (_, flags) = alu_apply::<C, T, AndKind>(cpu, rm, reg);
    set_flags(cpu, flags);
    Ok(())
}

pub fn test_accumulator<C: CpuContext + ?Sized, T: AluWord>(cpu: &mut C) -> CpuResult {
    let imm: T = fetch_imm(cpu)?;
    let acc: T = cpu.registers().reg(Register32::EAX as u8);
    let (_, flags) = alu_apply::<C, T, AndKind>(cpu, acc, imm);
    set_flags(cpu, flags);
    Ok(())
}

pub fn inc_dec_reg<C: CpuContext + ?Sized, T: AluWord, const REG: u8>(cpu: &mut C, decrement: bool) {
    let regs = cpu.registers_mut();
    let value: T = regs.reg(REG);
    let (result, flags) = alu_inc_dec(regs.eflags(), value, decrement);
    regs.set_reg(REG, result);
    regs.set_eflags_raw(flags);
}

fn inc_dec_rm<C: CpuContext + ?Sized, T: AluWord>(cpu: &mut C, rm: FastRm, decrement: bool) -> CpuResult {
    let value: T = read_rm(cpu, rm)?;
    let (result, flags) = alu_inc_dec(cpu.registers().eflags(), value, decrement);
    write_rm(cpu, rm, result)?;
    set_flags(cpu, flags);
    Ok(())
}

pub fn push_reg<C: CpuContext + ?Sized, T: Word, const REG: u8>(cpu: &mut C) -> CpuResult {
    // PUSH ESP stores the value from before the push
    let value: T = cpu.registers().reg(REG);
    push(cpu, value)
}

pub fn pop_reg<C: CpuContext + ?Sized, T: Word, const REG: u8>(cpu: &mut C) -> CpuResult {
    let value: T = pop(cpu)?;
    cpu.registers_mut().set_reg(REG, value);
    Ok(())
}

pub fn push_segment<C: CpuContext + ?Sized>(cpu: &mut C, st: &FastState, segment: Segment) -> CpuResult {
    let selector = cpu.registers().selector(segment);
    push_sized(cpu, st.operand_size, selector as u32)
}

/// POP into a segment register. The stack only moves once the load succeeds.
pub fn pop_segment<C: CpuContext + ?Sized>(cpu: &mut C, st: &FastState, segment: Segment) -> CpuResult {
    let selector = peek_sized(cpu, st.operand_size, 0)? as u16;
    cpu.load_segment_register(segment, selector)?;
    adjust_stack_pointer(cpu, st.operand_size.bytes());
    Ok(())
}

pub fn push_imm<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, sign_extended: bool) -> CpuResult {
    let value: T = match sign_extended {
        true => fetch_simm8(cpu)?,
        false => fetch_imm(cpu)?,
    };
    push(cpu, value)
}

pub fn mov_modrm<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, st: &FastState, to_reg: bool) -> CpuResult {
    let modrm = fetch_modrm(cpu, st)?;
    if to_reg {
        let value: T = read_rm(cpu, modrm.rm)?;
        cpu.registers_mut().set_reg(modrm.reg, value);
        Ok(())
    }
    else {
        let value: T = cpu.registers().reg(modrm.reg);
        write_rm(cpu, modrm.rm, value)
    }
}

pub fn mov_reg_imm<C: CpuContext + ?Sized, T: Word, const REG: u8>(cpu: &mut C) -> CpuResult {
    let imm: T = fetch_imm(cpu)?;
    cpu.registers_mut().set_reg(REG, imm);
    Ok(())
}

/// MOV r/m, imm. Returns false if the reg field is not 0.
pub fn mov_rm_imm<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, st: &FastState) -> CpuResult<bool> {
    let modrm = fetch_modrm(cpu, st)?;
    if modrm.reg != 0 {
        return Ok(false);
    }
    let imm: T = fetch_imm(cpu)?;
    write_rm(cpu, modrm.rm, imm)?;
    Ok(true)
}

/// MOV between the accumulator and a direct memory offset.
pub fn mov_moffs<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, st: &FastState, to_memory: bool) -> CpuResult {
    let offset = match st.address_size {
        AddressSize::Addr32 => fetch_u32(cpu)?,
        AddressSize::Addr16 => fetch_u16(cpu)? as u32,
    };
    let rm = FastRm::Memory(st.segment_override.unwrap_or(Segment::DS), offset);
    if to_memory {
        let value: T = cpu.registers().reg(Register32::EAX as u8);
        write_rm(cpu, rm, value)
    }
    else {
        let value: T = read_rm(cpu, rm)?;
        cpu.registers_mut().set_reg(Register32::EAX as u8, value);
        Ok(())
    }
}

/// XCHG r/m, reg. The memory write happens before the register changes.
pub fn xchg_modrm<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, st: &FastState) -> CpuResult {
    let modrm = fetch_modrm(cpu, st)?;
    let reg: T = cpu.registers().reg(modrm.reg);
    let rm: T = read_rm(cpu, modrm.rm)?;
    write_rm(cpu, modrm.rm, reg)?;
    cpu.registers_mut().set_reg(modrm.reg, rm);
    Ok(())
}

pub fn xchg_accumulator<C: CpuContext + ?Sized, T: Word, const REG: u8>(cpu: &mut C) {
    let regs = cpu.registers_mut();
    let acc: T = regs.reg(Register32::EAX as u8);
    let other: T = regs.reg(REG);
    regs.set_reg(Register32::EAX as u8, other);
    regs.set_reg(REG, acc);
}

/// LEA. Returns false for a register operand.
pub fn lea<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, st: &FastState) -> CpuResult<bool> {
    let modrm = fetch_modrm(cpu, st)?;
    let FastRm::Memory(_, offset) = modrm.rm
    else {
        return Ok(false);
    };
    let offset = offset & st.address_size.mask();
    cpu.registers_mut().set_reg(modrm.reg, T::from_u32(offset));
    Ok(true)
}

/// MOVZX and MOVSX from width S into a register of the operand size.
pub fn movx<C: CpuContext + ?Sized, S: Word>(cpu: &mut C, st: &FastState, sign_extend: bool) -> CpuResult {
    let modrm = fetch_modrm(cpu, st)?;
    let value: S = read_rm(cpu, modrm.rm)?;
    let wide = match sign_extend {
        true => value.sign_extend(),
        false => value.to_u32(),
    };
    let regs = cpu.registers_mut();
    match st.operand_size {
        OperandSize::Size32 => regs.set_reg32(modrm.reg, wide),
        _ => regs.set_reg16(modrm.reg, wide as u16),
    }
    Ok(())
}

/// IMUL reg, r/m.
pub fn imul_modrm<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, st: &FastState) -> CpuResult {
    let modrm = fetch_modrm(cpu, st)?;
    let lhs: T = cpu.registers().reg(modrm.reg);
    let rhs: T = read_rm(cpu, modrm.rm)?;
    let product = multiply_truncated(cpu, lhs, rhs);
    cpu.registers_mut().set_reg(modrm.reg, product);
    Ok(())
}

pub fn set_cc<C: CpuContext + ?Sized>(cpu: &mut C, st: &FastState, condition: JumpCondition) -> CpuResult {
    let modrm = fetch_modrm(cpu, st)?;
    let value = condition.test_flags(cpu.registers().eflags()) as u8;
    write_rm(cpu, modrm.rm, value)
}

/// Group 2 shifts and rotates. The count comes from an imm8, CL or is 1.
/// Returns false for the undefined /6 form.
pub fn group2<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, st: &FastState, count: ShiftCount) -> CpuResult<bool> {
    let modrm = fetch_modrm(cpu, st)?;
    if modrm.reg == 6 {
        return Ok(false);
    }
    let count = match count {
        ShiftCount::One => 1,
        ShiftCount::Cl => cpu.registers().get8(Register8::CL),
        ShiftCount::Immediate => fetch_u8(cpu)?,
    };
    let value: T = read_rm(cpu, modrm.rm)?;
    if let Some((result, flags)) = shift_op(ShiftOp::from_index(modrm.reg), cpu.registers().eflags(), value, count) {
        write_rm(cpu, modrm.rm, result)?;
        set_flags(cpu, flags);
    }
    Ok(true)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShiftCount {
    One,
    Cl,
    Immediate,
}

/// Group 3: TEST, NOT, NEG, MUL, IMUL, DIV and IDIV. Returns false for the undefined /1 form.
pub fn group3<C: CpuContext + ?Sized, T: AluWord>(cpu: &mut C, st: &FastState) -> CpuResult<bool> {
    let modrm = fetch_modrm(cpu, st)?;
    match modrm.reg {
        1 => return Ok(false),
        0 => {
            let imm: T = fetch_imm(cpu)?;
            let value: T = read_rm(cpu, modrm.rm)?;
            let (_, flags) = alu_apply::<C, T, AndKind>(cpu, value, imm);
            set_flags(cpu, flags);
        }
        2 => {
            let value: T = read_rm(cpu, modrm.rm)?;
            write_rm(cpu, modrm.rm, T::from_u32(!value.to_u32()))?;
        }
        3 => {
            let value: T = read_rm(cpu, modrm.rm)?;
            let (result, flags) = alu_neg(cpu.registers().eflags(), value);
            write_rm(cpu, modrm.rm, result)?;
            set_flags(cpu, flags);
        }
        4 | 5 => {
            let value: T = read_rm(cpu, modrm.rm)?;
            multiply_accumulator(cpu, value, modrm.reg == 5);
        }
        _ => {
            let value: T = read_rm(cpu, modrm.rm)?;
            divide_accumulator(cpu, value, modrm.reg == 7)?;
        }
    }
    Ok(true)
}

/// Group 4 and 5 forms handled here. Returns false for the far forms.
pub fn group5<C: CpuContext + ?Sized, T: AluWord>(cpu: &mut C, st: &FastState, byte_form: bool) -> CpuResult<bool> {
    let modrm = fetch_modrm(cpu, st)?;
    match (modrm.reg, byte_form) {
        (0, true) => inc_dec_rm::<C, u8>(cpu, modrm.rm, false)?,
        (1, true) => inc_dec_rm::<C, u8>(cpu, modrm.rm, true)?,
        (0, false) => inc_dec_rm::<C, T>(cpu, modrm.rm, false)?,
        (1, false) => inc_dec_rm::<C, T>(cpu, modrm.rm, true)?,
        (2, false) => {
            let target = read_rm::<C, T>(cpu, modrm.rm)?.to_u32();
            call_near(cpu, st, target)?;
        }
        (4, false) => {
            let target = read_rm::<C, T>(cpu, modrm.rm)?.to_u32();
            check_code_limit(cpu, target)?;
            cpu.branch_to(target);
        }
        (6, false) => {
            let value: T = read_rm(cpu, modrm.rm)?;
            push(cpu, value)?;
        }
        _ => return Ok(false),
    }
    Ok(true)
}

/// The target of a relative branch, masked to the operand size.
#[inline(always)]
fn relative_target<C: CpuContext + ?Sized>(cpu: &C, st: &FastState, displacement: u32) -> u32 {
    let target = cpu.registers().eip.wrapping_add(displacement);
    match st.operand_size {
        OperandSize::Size32 => target,
        _ => target & 0xFFFF,
    }
}

pub fn jump_relative<C: CpuContext + ?Sized>(cpu: &mut C, st: &FastState, displacement: u32) -> CpuResult {
    let target = relative_target(cpu, st, displacement);
    check_code_limit(cpu, target)?;
    cpu.branch_to(target);
    Ok(())
}

pub fn jcc<C: CpuContext + ?Sized>(cpu: &mut C, st: &FastState, condition: JumpCondition, displacement: u32) -> CpuResult {
    if condition.test_flags(cpu.registers().eflags()) {
        jump_relative(cpu, st, displacement)?;
    }
    Ok(())
}

fn call_near<C: CpuContext + ?Sized>(cpu: &mut C, st: &FastState, target: u32) -> CpuResult {
    check_code_limit(cpu, target)?;
    let return_eip = cpu.registers().eip;
    push_sized(cpu, st.operand_size, return_eip)?;
    cpu.branch_to(target);
    Ok(())
}

pub fn call_relative<C: CpuContext + ?Sized>(cpu: &mut C, st: &FastState) -> CpuResult {
    let displacement = fetch_rel(cpu, st.operand_size)?;
    let target = relative_target(cpu, st, displacement);
    call_near(cpu, st, target)
}

pub fn ret_near<C: CpuContext + ?Sized>(cpu: &mut C, st: &FastState, release: u32) -> CpuResult {
    let target = peek_sized(cpu, st.operand_size, 0)?;
    check_code_limit(cpu, target)?;
    adjust_stack_pointer(cpu, st.operand_size.bytes() + release);
    cpu.branch_to(target);
    Ok(())
}

/// LOOPNE (0xE0), LOOPE (0xE1), LOOP (0xE2) and JCXZ (0xE3).
pub fn loop_jcxz<C: CpuContext + ?Sized>(cpu: &mut C, st: &FastState, opcode: u8) -> CpuResult {
    let displacement = fetch_u8(cpu)? as i8 as i32 as u32;
    let asz = st.address_size;
    let regs = cpu.registers();
    let old_count = regs.count(asz);
    if opcode == 0xE3 {
        if old_count == 0 {
            jump_relative(cpu, st, displacement)?;
        }
        return Ok(());
    }
    let count = old_count.wrapping_sub(1) & asz.mask();
    let zero = regs.get_flag(Flag::Zero);
    let taken = count != 0
        && match opcode {
            0xE0 => !zero,
            0xE1 => zero,
            _ => true,
        };
    cpu.registers_mut().set_count(asz, count);
    if taken {
        if let Err(abort) = jump_relative(cpu, st, displacement) {
            cpu.registers_mut().set_count(asz, old_count);
            return Err(abort);
        }
    }
    Ok(())
}

/// IN from an imm8 port or DX into the accumulator.
pub fn port_in<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, port: u16) -> CpuResult {
    check_io_permission(cpu, port, T::BITS / 8)?;
    let value: T = read_port(cpu, port)?;
    cpu.registers_mut().set_reg(Register32::EAX as u8, value);
    Ok(())
}

pub fn port_out<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, port: u16) -> CpuResult {
    check_io_permission(cpu, port, T::BITS / 8)?;
    let value: T = cpu.registers().reg(Register32::EAX as u8);
    write_port(cpu, port, value)
}
