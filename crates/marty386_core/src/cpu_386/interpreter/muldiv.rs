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

    cpu_386::interpreter::muldiv.rs

    Multiply and divide.

    The one-operand forms work on the accumulator pair for their width: AX for
    bytes, DX:AX for words and EDX:EAX for dwords. Divide faults leave the
    accumulator untouched.

*/

use crate::{
    cpu_386::{context::CpuContext, instruction::Instruction, interpreter::operands::*},
    cpu_common::{alu::*, *},
};

/// Read the double-width dividend for a divide of width T.
fn read_accumulator_pair<C: CpuContext + ?Sized, T: Word>(cpu: &C) -> u64 {
    let regs = cpu.registers();
    match T::BITS {
        8 => regs.get16(Register16::AX) as u64,
        16 => ((regs.get16(Register16::DX) as u64) << 16) | regs.get16(Register16::AX) as u64,
        _ => ((regs.get32(Register32::EDX) as u64) << 32) | regs.get32(Register32::EAX) as u64,
    }
}

/// Store the low and high halves of a product, or quotient and remainder.
fn write_accumulator_pair<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, low: u32, high: u32) {
    let regs = cpu.registers_mut();
    match T::BITS {
        8 => {
            regs.set8(Register8::AL, low as u8);
            regs.set8(Register8::AH, high as u8);
        }
        _ => {
            regs.set_reg(Register32::EAX as u8, T::from_u32(low));
            regs.set_reg(Register32::EDX as u8, T::from_u32(high));
        }
    }
}

fn multiply_flags<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, low: u32, overflow: bool) {
    let regs = cpu.registers_mut();
    let mut flags = (regs.eflags() & !CPU_FLAGS_STATUS) | szp_flags(T::from_u32(low));
    if overflow {
        flags |= CPU_FLAG_CARRY | CPU_FLAG_OVERFLOW;
    }
    regs.set_eflags_raw(flags);
}

pub fn mul<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let src: T = read_operand(cpu, instr, 0)?;
    multiply_accumulator(cpu, src, false);
    Ok(())
}

/// One-operand IMUL, producing a double-width result.
pub fn imul_accumulator<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let src: T = read_operand(cpu, instr, 0)?;
    multiply_accumulator(cpu, src, true);
    Ok(())
}

/// MUL or IMUL of the accumulator by `src`. Shared with the fast path.
pub fn multiply_accumulator<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, src: T, signed: bool) {
    let acc: T = cpu.registers().reg(Register32::EAX as u8);
    let (low, high, overflow) = if signed {
        let product = acc.sign_extend() as i32 as i64 * src.sign_extend() as i32 as i64;
        let low = (product as u32) & T::MASK;
        let overflow = T::from_u32(low).sign_extend() as i32 as i64 != product;
        (low, ((product >> T::BITS) as u32) & T::MASK, overflow)
    }
    else {
        let product = acc.to_u32() as u64 * src.to_u32() as u64;
        let high = ((product >> T::BITS) as u32) & T::MASK;
        ((product as u32) & T::MASK, high, high != 0)
    };
    write_accumulator_pair::<C, T>(cpu, low, high);
    multiply_flags::<C, T>(cpu, low, overflow);
}

/// Truncating signed multiply for the two and three operand IMUL forms. Returns the
/// product and sets the flags.
pub fn multiply_truncated<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, lhs: T, rhs: T) -> T {
    let product = lhs.sign_extend() as i32 as i64 * rhs.sign_extend() as i32 as i64;
    let low = (product as u32) & T::MASK;
    let overflow = T::from_u32(low).sign_extend() as i32 as i64 != product;
    multiply_flags::<C, T>(cpu, low, overflow);
    T::from_u32(low)
}

/// Two and three operand IMUL. The product is truncated to the destination width.
pub fn imul<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let (lhs, rhs): (T, T) = match instr.operand_count() {
        2 => (read_operand(cpu, instr, 0)?, read_operand(cpu, instr, 1)?),
        _ => (read_operand(cpu, instr, 1)?, read_operand(cpu, instr, 2)?),
    };
    // The destination is always a register
    let product = multiply_truncated(cpu, lhs, rhs);
    write_operand(cpu, instr, 0, product)
}

pub fn div<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let divisor: T = read_operand(cpu, instr, 0)?;
    divide_accumulator(cpu, divisor, false)
}

pub fn idiv<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let divisor: T = read_operand(cpu, instr, 0)?;
    divide_accumulator(cpu, divisor, true)
}

/// DIV or IDIV of the accumulator pair by `divisor`. Raises #DE, with the accumulator
/// unchanged, on a zero divisor or a quotient that does not fit. Shared with the fast path.
pub fn divide_accumulator<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, divisor: T, signed: bool) -> CpuResult {
    let pair = read_accumulator_pair::<C, T>(cpu);
    let result = if signed {
        let divisor = divisor.sign_extend() as i32 as i64;
        let dividend = match T::BITS {
            8 => pair as u16 as i16 as i64,
            16 => pair as u32 as i32 as i64,
            _ => pair as i64,
        };
        let limit = T::SIGN as i64;
        match (dividend.checked_div(divisor), dividend.checked_rem(divisor)) {
            (Some(quotient), Some(remainder)) if quotient < limit && quotient >= -limit => {
                Some((quotient as u32 & T::MASK, remainder as u32 & T::MASK))
            }
            _ => None,
        }
    }
    else {
        let divisor = divisor.to_u32() as u64;
        match pair.checked_div(divisor) {
            Some(quotient) if quotient <= T::MASK as u64 => Some((quotient as u32, (pair % divisor) as u32)),
            _ => None,
        }
    };
    let Some((quotient, remainder)) = result
    else {
        return Err(cpu.raise_exception(Interrupt::DivideError, 0));
    };
    write_accumulator_pair::<C, T>(cpu, quotient, remainder);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_386::{decode_slice, FlatCpu};

    fn run(cpu: &mut FlatCpu, bytes: &[u8]) -> CpuResult {
        let instr = decode_slice(bytes, AddressSize::Addr16, OperandSize::Size16).unwrap();
        match instr.operation {
            crate::cpu_386::Operation::Mul => mul::<_, u16>(cpu, &instr),
            crate::cpu_386::Operation::Imul => imul_accumulator::<_, u16>(cpu, &instr),
            crate::cpu_386::Operation::Div => div::<_, u16>(cpu, &instr),
            _ => idiv::<_, u16>(cpu, &instr),
        }
    }

    #[test]
    fn test_mul_word() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.regs.set16(Register16::AX, 0x1234);
        cpu.regs.set16(Register16::BX, 0x0100);
        // mul bx
        run(&mut cpu, &[0xF7, 0xE3]).unwrap();
        assert_eq!(cpu.regs.get16(Register16::AX), 0x3400);
        assert_eq!(cpu.regs.get16(Register16::DX), 0x0012);
        assert!(cpu.regs.get_flag(Flag::Carry));
        assert!(cpu.regs.get_flag(Flag::Overflow));
    }

    #[test]
    fn test_imul_sign() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.regs.set16(Register16::AX, 0xFFFF);
        cpu.regs.set16(Register16::BX, 0x0002);
        // imul bx: -1 * 2 fits in a word
        run(&mut cpu, &[0xF7, 0xEB]).unwrap();
        assert_eq!(cpu.regs.get16(Register16::AX), 0xFFFE);
        assert_eq!(cpu.regs.get16(Register16::DX), 0xFFFF);
        assert!(!cpu.regs.get_flag(Flag::Carry));
    }

    #[test]
    fn test_div_overflow_leaves_accumulator() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.regs.set16(Register16::DX, 0x0001);
        cpu.regs.set16(Register16::AX, 0x0000);
        cpu.regs.set16(Register16::BX, 0x0001);
        // div bx
        assert!(run(&mut cpu, &[0xF7, 0xF3]).is_err());
        assert_eq!(cpu.regs.get16(Register16::AX), 0x0000);
        assert_eq!(cpu.regs.get16(Register16::DX), 0x0001);
        assert_eq!(cpu.exceptions.last(), Some(&(Interrupt::DivideError, 0)));

        cpu.regs.set16(Register16::BX, 0x0002);
        run(&mut cpu, &[0xF7, 0xF3]).unwrap();
        assert_eq!(cpu.regs.get16(Register16::AX), 0x8000);
        assert_eq!(cpu.regs.get16(Register16::DX), 0x0000);
    }

    #[test]
    fn test_idiv_limits() {
        let mut cpu = FlatCpu::real_mode(&[]);
        // -32768 / -1 overflows a signed word
        cpu.regs.set16(Register16::DX, 0xFFFF);
        cpu.regs.set16(Register16::AX, 0x8000);
        cpu.regs.set16(Register16::BX, 0xFFFF);
        assert!(run(&mut cpu, &[0xF7, 0xFB]).is_err());

        // -7 / 2 = -3 remainder -1
        cpu.regs.set16(Register16::DX, 0xFFFF);
        cpu.regs.set16(Register16::AX, 0xFFF9);
        cpu.regs.set16(Register16::BX, 0x0002);
        run(&mut cpu, &[0xF7, 0xFB]).unwrap();
        assert_eq!(cpu.regs.get16(Register16::AX), 0xFFFD);
        assert_eq!(cpu.regs.get16(Register16::DX), 0xFFFF);
    }
}
