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

    cpu_386::interpreter::bitwise.rs

    Shifts, rotates and bit instructions.

*/

use crate::{
    cpu_386::{
        context::{read_memory, write_memory, CpuContext},
        instruction::Instruction,
        interpreter::operands::*,
        opcodes::OperandMode,
    },
    cpu_common::{alu::*, *},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BitOp {
    Test,
    Set,
    Reset,
    Complement,
}

pub fn shift<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, instr: &Instruction, op: ShiftOp) -> CpuResult {
    let value: T = read_operand(cpu, instr, 0)?;
    let count: u8 = read_operand(cpu, instr, 1)?;
    if let Some((result, flags)) = shift_op(op, cpu.registers().eflags(), value, count) {
        write_operand(cpu, instr, 0, result)?;
        cpu.registers_mut().set_eflags_raw(flags);
    }
    Ok(())
}

/// SHLD and SHRD. The count is the third operand, an immediate or CL.
pub fn shift_double<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, instr: &Instruction, left: bool) -> CpuResult {
    let value: T = read_operand(cpu, instr, 0)?;
    let fill: T = read_operand(cpu, instr, 1)?;
    let count: u8 = read_operand(cpu, instr, 2)?;
    if let Some((result, flags)) = double_shift(left, cpu.registers().eflags(), value, fill, count) {
        write_operand(cpu, instr, 0, result)?;
        cpu.registers_mut().set_eflags_raw(flags);
    }
    Ok(())
}

/// BT, BTS, BTR and BTC.
///
/// With a register bit offset and a memory operand the offset is signed and may
/// address outside the operand. Immediate offsets are taken modulo the operand width.
pub fn bit_test<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, instr: &Instruction, op: BitOp) -> CpuResult {
    let offset: T = read_operand(cpu, instr, 1)?;
    let memory = operand_address(cpu, instr, 0);

    let (address, bit) = match memory {
        Some(address) if instr.operands[1].mode != OperandMode::Immediate => {
            let signed = offset.sign_extend() as i32;
            let step = (signed >> T::BITS.trailing_zeros()).wrapping_mul((T::BITS / 8) as i32);
            (
                Some(offset_address(instr, address, step as u32)),
                (signed as u32) & (T::BITS - 1),
            )
        }
        address => (address, offset.to_u32() & (T::BITS - 1)),
    };

    let value: T = match address {
        Some(address) => read_memory(cpu, address.segment, address.offset)?,
        None => read_operand(cpu, instr, 0)?,
    };
    let mask = 1u32 << bit;
    let set = value.to_u32() & mask != 0;
    let result = match op {
        BitOp::Test => None,
        BitOp::Set => Some(value.to_u32() | mask),
        BitOp::Reset => Some(value.to_u32() & !mask),
        BitOp::Complement => Some(value.to_u32() ^ mask),
    };
    if let Some(result) = result {
        match address {
            Some(address) => write_memory(cpu, address.segment, address.offset, T::from_u32(result))?,
            None => write_operand(cpu, instr, 0, T::from_u32(result))?,
        }
    }
    cpu.registers_mut().set_flag_state(Flag::Carry, set);
    Ok(())
}

/// BSF and BSR. A zero source sets ZF and leaves the destination unchanged.
pub fn bit_scan<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, instr: &Instruction, reverse: bool) -> CpuResult {
    let source: T = read_operand(cpu, instr, 1)?;
    let value = source.to_u32();
    if value == 0 {
        cpu.registers_mut().set_flag(Flag::Zero);
        return Ok(());
    }
    let index = match reverse {
        true => 31 - value.leading_zeros(),
        false => value.trailing_zeros(),
    };
    write_operand(cpu, instr, 0, T::from_u32(index))?;
    cpu.registers_mut().clear_flag(Flag::Zero);
    Ok(())
}

pub fn set_cc<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let value = instr.condition.test_flags(cpu.registers().eflags()) as u8;
    write_operand(cpu, instr, 0, value)
}

pub fn bswap<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) {
    let index = instr.operands[0].data;
    let regs = cpu.registers_mut();
    let value = regs.reg32(index).swap_bytes();
    regs.set_reg32(index, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_386::{decode_slice, FlatCpu};

    fn decode16(bytes: &[u8]) -> Instruction {
        decode_slice(bytes, AddressSize::Addr16, OperandSize::Size16).unwrap()
    }

    #[test]
    fn test_bt_memory_negative_offset() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.write_physical(0x1FF, 0x80);
        cpu.regs.set16(Register16::BX, 0x200);
        // -1 selects bit 15 of the word below [bx]
        cpu.regs.set16(Register16::AX, 0xFFFF);
        // bts [bx], ax
        let instr = decode16(&[0x0F, 0xAB, 0x07]);
        bit_test::<_, u16>(&mut cpu, &instr, BitOp::Set).unwrap();
        assert!(cpu.regs.get_flag(Flag::Carry));

        cpu.regs.set16(Register16::AX, 0x0010);
        bit_test::<_, u16>(&mut cpu, &instr, BitOp::Set).unwrap();
        assert!(!cpu.regs.get_flag(Flag::Carry));
        assert_eq!(cpu.read_physical(0x202), 0x01);
    }

    #[test]
    fn test_bt_immediate_wraps() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.regs.set16(Register16::CX, 0x0002);
        // bt cx, 17 tests bit 1
        let instr = decode16(&[0x0F, 0xBA, 0xE1, 0x11]);
        bit_test::<_, u16>(&mut cpu, &instr, BitOp::Test).unwrap();
        assert!(cpu.regs.get_flag(Flag::Carry));
    }

    #[test]
    fn test_bit_scan() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.regs.set16(Register16::BX, 0x0000);
        cpu.regs.set16(Register16::AX, 0x1234);
        // bsf ax, bx with a zero source
        let instr = decode16(&[0x0F, 0xBC, 0xC3]);
        bit_scan::<_, u16>(&mut cpu, &instr, false).unwrap();
        assert!(cpu.regs.get_flag(Flag::Zero));
        assert_eq!(cpu.regs.get16(Register16::AX), 0x1234);

        cpu.regs.set16(Register16::BX, 0x0110);
        bit_scan::<_, u16>(&mut cpu, &instr, false).unwrap();
        assert_eq!(cpu.regs.get16(Register16::AX), 4);
        // bsr ax, bx
        let instr = decode16(&[0x0F, 0xBD, 0xC3]);
        bit_scan::<_, u16>(&mut cpu, &instr, true).unwrap();
        assert_eq!(cpu.regs.get16(Register16::AX), 8);
        assert!(!cpu.regs.get_flag(Flag::Zero));
    }

    #[test]
    fn test_shld() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.regs.set16(Register16::AX, 0x1234);
        cpu.regs.set16(Register16::BX, 0xABCD);
        // shld ax, bx, 4
        let instr = decode16(&[0x0F, 0xA4, 0xD8, 0x04]);
        shift_double::<_, u16>(&mut cpu, &instr, true).unwrap();
        assert_eq!(cpu.regs.get16(Register16::AX), 0x234A);
    }
}
