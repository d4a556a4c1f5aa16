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

    cpu_386::interpreter::stack.rs

    Stack instructions.

    Multi-step stack operations restore ESP when a later step faults, so the
    instruction can be restarted from its first byte.

*/

use crate::{
    cpu_386::{
        context::{adjust_stack_pointer, peek_sized, pop_sized, push_sized, CpuContext},
        instruction::Instruction,
        interpreter::operands::*,
    },
    cpu_common::*,
};

fn save_stack<C: CpuContext + ?Sized>(cpu: &C) -> (u32, u32) {
    let regs = cpu.registers();
    (regs.get32(Register32::ESP), regs.get32(Register32::EBP))
}

fn restore_stack<C: CpuContext + ?Sized>(cpu: &mut C, saved: (u32, u32)) {
    let regs = cpu.registers_mut();
    regs.set32(Register32::ESP, saved.0);
    regs.set32(Register32::EBP, saved.1);
}

/// PUSH of a register, segment register, immediate or memory operand.
///
/// The value is read before ESP moves, so PUSH ESP stores the old stack pointer.
pub fn push_operand<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let value = match instr.operand_size {
        OperandSize::Size32 => read_operand::<C, u32>(cpu, instr, 0)?,
        _ => read_operand::<C, u16>(cpu, instr, 0)? as u32,
    };
    push_sized(cpu, instr.operand_size, value)
}

/// POP to a register or memory operand. ESP is incremented before a memory
/// destination's address is calculated.
pub fn pop_operand<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let saved = save_stack(cpu);
    let value = pop_sized(cpu, instr.operand_size)?;
    let result = match instr.operand_size {
        OperandSize::Size32 => write_operand(cpu, instr, 0, value),
        _ => write_operand(cpu, instr, 0, value as u16),
    };
    if result.is_err() {
        restore_stack(cpu, saved);
    }
    result
}

pub fn pop_segment<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let Some(segment) = Segment::from_index(instr.operands[0].data)
    else {
        return Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0));
    };
    let selector = peek_sized(cpu, instr.operand_size, 0)? as u16;
    cpu.load_segment_register(segment, selector)?;
    adjust_stack_pointer(cpu, instr.operand_size.bytes());
    Ok(())
}

pub fn pusha<C: CpuContext + ?Sized>(cpu: &mut C, operand_size: OperandSize) -> CpuResult {
    let saved = save_stack(cpu);
    // ESP is pushed as it was before the first push
    let values: [u32; 8] = std::array::from_fn(|i| cpu.registers().reg32(i as u8));
    let mut result = Ok(());
    for value in values {
        result = push_sized(cpu, operand_size, value);
        if result.is_err() {
            restore_stack(cpu, saved);
            break;
        }
    }
    result
}

/// POPA reads every slot before writing any register. The saved ESP is discarded.
pub fn popa<C: CpuContext + ?Sized>(cpu: &mut C, operand_size: OperandSize) -> CpuResult {
    let slot = operand_size.bytes();
    let mut values = [0u32; 8];
    for (i, value) in values.iter_mut().enumerate() {
        *value = peek_sized(cpu, operand_size, slot * i as u32)?;
    }
    let regs = cpu.registers_mut();
    for (i, value) in values.iter().enumerate() {
        let index = 7 - i as u8;
        if index == Register32::ESP as u8 {
            continue;
        }
        match operand_size {
            OperandSize::Size32 => regs.set_reg32(index, *value),
            _ => regs.set_reg16(index, *value as u16),
        }
    }
    adjust_stack_pointer(cpu, slot * 8);
    Ok(())
}

/// PUSHF faults in virtual-8086 mode unless IOPL is 3.
pub fn pushf<C: CpuContext + ?Sized>(cpu: &mut C, operand_size: OperandSize) -> CpuResult {
    let regs = cpu.registers();
    if regs.in_v86_mode() && regs.iopl() < 3 {
        return Err(cpu.raise_exception(Interrupt::GeneralProtectionFault, 0));
    }
    let flags = regs.eflags() & !(CPU_FLAG_V86 | CPU_FLAG_RESUME);
    push_sized(cpu, operand_size, flags)
}

/// POPF. IOPL is only writable at CPL 0 and IF only when CPL <= IOPL; those bits
/// are silently preserved otherwise.
pub fn popf<C: CpuContext + ?Sized>(cpu: &mut C, operand_size: OperandSize) -> CpuResult {
    let regs = cpu.registers();
    if regs.in_v86_mode() && regs.iopl() < 3 {
        return Err(cpu.raise_exception(Interrupt::GeneralProtectionFault, 0));
    }
    let mut mask = cpu.model().eflags_mask() & !(CPU_FLAG_V86 | CPU_FLAG_RESUME);
    if regs.in_protected_mode() {
        let cpl = if regs.in_v86_mode() { 3 } else { cpu.cpl() };
        if cpl > 0 {
            mask &= !CPU_FLAG_IOPL;
        }
        if cpl > regs.iopl() {
            mask &= !CPU_FLAG_INT_ENABLE;
        }
    }
    if operand_size != OperandSize::Size32 {
        mask &= 0xFFFF;
    }
    let value = pop_sized(cpu, operand_size)?;
    cpu.registers_mut().set_eflags_masked(value, mask);
    Ok(())
}

/// ENTER imm16, imm8. Nesting levels above 31 are taken modulo 32.
pub fn enter<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let saved = save_stack(cpu);
    let result = enter_frame(cpu, instr);
    if result.is_err() {
        restore_stack(cpu, saved);
    }
    result
}

fn enter_frame<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    let size = instr.operand_size;
    let slot = size.bytes();
    let frame_size = instr.immediate & 0xFFFF;
    let level = instr.immediate2 & 0x1F;
    let stack_size = cpu.registers().stack_address_size();

    let ebp = cpu.registers().get32(Register32::EBP);
    push_sized(cpu, size, ebp)?;
    let frame_pointer = cpu.registers().address_reg(Register32::ESP as u8, stack_size);

    if level > 0 {
        let mut link = cpu.registers().address_reg(Register32::EBP as u8, stack_size);
        for _ in 1..level {
            link = link.wrapping_sub(slot) & stack_size.mask();
            let value = match size {
                OperandSize::Size32 => cpu.read_memory_dword(Segment::SS, link)?,
                _ => cpu.read_memory_word(Segment::SS, link)? as u32,
            };
            push_sized(cpu, size, value)?;
        }
        push_sized(cpu, size, frame_pointer)?;
    }

    let regs = cpu.registers_mut();
    match size {
        OperandSize::Size32 => regs.set32(Register32::EBP, frame_pointer),
        _ => regs.set16(Register16::BP, frame_pointer as u16),
    }
    let esp = regs.address_reg(Register32::ESP as u8, stack_size);
    regs.set_address_reg(Register32::ESP as u8, stack_size, esp.wrapping_sub(frame_size));
    Ok(())
}

pub fn leave<C: CpuContext + ?Sized>(cpu: &mut C, operand_size: OperandSize) -> CpuResult {
    let saved = save_stack(cpu);
    let regs = cpu.registers_mut();
    let stack_size = regs.stack_address_size();
    let ebp = regs.address_reg(Register32::EBP as u8, stack_size);
    regs.set_address_reg(Register32::ESP as u8, stack_size, ebp);
    match pop_sized(cpu, operand_size) {
        Ok(value) => {
            let regs = cpu.registers_mut();
            match operand_size {
                OperandSize::Size32 => regs.set32(Register32::EBP, value),
                _ => regs.set16(Register16::BP, value as u16),
            }
            Ok(())
        }
        Err(abort) => {
            restore_stack(cpu, saved);
            Err(abort)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_386::{decode_slice, FlatCpu};

    fn decode16(bytes: &[u8]) -> Instruction {
        decode_slice(bytes, AddressSize::Addr16, OperandSize::Size16).unwrap()
    }

    #[test]
    fn test_push_sp_pushes_old_value() {
        let mut cpu = FlatCpu::real_mode(&[]);
        push_operand(&mut cpu, &decode16(&[0x54])).unwrap();
        assert_eq!(cpu.regs.get16(Register16::SP), 0x7FFE);
        assert_eq!(cpu.read_physical_u16(0x7FFE), 0x8000);
    }

    #[test]
    fn test_push_imm8_sign_extends() {
        let mut cpu = FlatCpu::real_mode(&[]);
        push_operand(&mut cpu, &decode16(&[0x6A, 0xFE])).unwrap();
        assert_eq!(cpu.read_physical_u16(0x7FFE), 0xFFFE);
    }

    #[test]
    fn test_pusha_popa() {
        let mut cpu = FlatCpu::real_mode(&[]);
        for i in 0..8u8 {
            if i != Register32::ESP as u8 {
                cpu.regs.set_reg16(i, 0x1111 * (i as u16 + 1));
            }
        }
        pusha(&mut cpu, OperandSize::Size16).unwrap();
        assert_eq!(cpu.regs.get16(Register16::SP), 0x8000 - 16);
        // The pushed SP is the value before PUSHA
        assert_eq!(cpu.read_physical_u16(0x8000 - 10), 0x8000);

        for i in 0..8u8 {
            if i != Register32::ESP as u8 {
                cpu.regs.set_reg16(i, 0);
            }
        }
        popa(&mut cpu, OperandSize::Size16).unwrap();
        assert_eq!(cpu.regs.get16(Register16::SP), 0x8000);
        assert_eq!(cpu.regs.get16(Register16::AX), 0x1111);
        assert_eq!(cpu.regs.get16(Register16::DI), 0x8888);
    }

    #[test]
    fn test_enter_leave() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.regs.set16(Register16::BP, 0x9000);
        // enter 8, 0
        enter(&mut cpu, &decode16(&[0xC8, 0x08, 0x00, 0x00])).unwrap();
        assert_eq!(cpu.regs.get16(Register16::BP), 0x7FFE);
        assert_eq!(cpu.regs.get16(Register16::SP), 0x7FF6);
        leave(&mut cpu, OperandSize::Size16).unwrap();
        assert_eq!(cpu.regs.get16(Register16::SP), 0x8000);
        assert_eq!(cpu.regs.get16(Register16::BP), 0x9000);
    }

    #[test]
    fn test_enter_nested() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.regs.set16(Register16::BP, 0x7000);
        cpu.write_physical_u16(0x6FFE, 0xAAAA);
        // enter 0, 2 copies one outer frame pointer then pushes the new one
        enter(&mut cpu, &decode16(&[0xC8, 0x00, 0x00, 0x02])).unwrap();
        assert_eq!(cpu.regs.get16(Register16::BP), 0x7FFE);
        assert_eq!(cpu.regs.get16(Register16::SP), 0x7FFA);
        assert_eq!(cpu.read_physical_u16(0x7FFC), 0xAAAA);
        assert_eq!(cpu.read_physical_u16(0x7FFA), 0x7FFE);
    }

    #[test]
    fn test_popf_preserves_iopl_in_user_mode() {
        let mut cpu = FlatCpu::protected_mode(&[]);
        cpu.enter_user_mode();
        cpu.regs.set_eflags_raw(CPU_FLAG_RESERVED1);
        push_sized(&mut cpu, OperandSize::Size32, CPU_FLAG_IOPL | CPU_FLAG_INT_ENABLE | CPU_FLAG_CARRY).unwrap();
        popf(&mut cpu, OperandSize::Size32).unwrap();
        assert!(cpu.regs.get_flag(Flag::Carry));
        assert!(!cpu.regs.get_flag(Flag::Interrupt));
        assert_eq!(cpu.regs.iopl(), 0);
    }
}
