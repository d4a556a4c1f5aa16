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

    cpu_386::context.rs

    The CpuContext trait.

    A CpuContext owns the register file, FPU state, memory and ports of one
    virtual CPU. The execution tiers reach the outside world only through this
    trait. Methods that can fault return CpuResult; when they fail the context
    has already redirected control to the exception handler.

*/

use crate::{
    bytequeue::ByteQueue,
    cpu_386::fpu::FpuState,
    cpu_common::*,
};

pub trait CpuContext {
    fn registers(&self) -> &Registers;
    fn registers_mut(&mut self) -> &mut Registers;
    fn fpu(&self) -> &FpuState;
    fn fpu_mut(&mut self) -> &mut FpuState;
    fn model(&self) -> CpuModel;

    /// Without a coprocessor, escape opcodes execute as no-ops.
    fn has_fpu(&self) -> bool {
        true
    }

    fn cpl(&self) -> u8 {
        self.registers().cpl
    }

    fn read_memory_byte(&mut self, segment: Segment, offset: u32) -> CpuResult<u8>;
    fn read_memory_word(&mut self, segment: Segment, offset: u32) -> CpuResult<u16>;
    fn read_memory_dword(&mut self, segment: Segment, offset: u32) -> CpuResult<u32>;
    fn write_memory_byte(&mut self, segment: Segment, offset: u32, value: u8) -> CpuResult;
    fn write_memory_word(&mut self, segment: Segment, offset: u32, value: u16) -> CpuResult;
    fn write_memory_dword(&mut self, segment: Segment, offset: u32, value: u32) -> CpuResult;

    /// Read the byte at CS:EIP and advance EIP, wrapping at the code segment's address size.
    fn fetch_instruction_byte(&mut self) -> CpuResult<u8> {
        let eip = self.registers().eip;
        let byte = self.read_memory_byte(Segment::CS, eip)?;
        let mask = self.registers().code_address_size().mask();
        self.registers_mut().eip = eip.wrapping_add(1) & mask;
        Ok(byte)
    }

    fn read_io_port_byte(&mut self, port: u16) -> CpuResult<u8>;
    fn read_io_port_word(&mut self, port: u16) -> CpuResult<u16>;
    fn read_io_port_dword(&mut self, port: u16) -> CpuResult<u32>;
    fn write_io_port_byte(&mut self, port: u16, value: u8) -> CpuResult;
    fn write_io_port_word(&mut self, port: u16, value: u16) -> CpuResult;
    fn write_io_port_dword(&mut self, port: u16, value: u32) -> CpuResult;

    /// Consulted when CPL > IOPL in protected mode, or always in virtual-8086 mode.
    /// Contexts without a TSS permission bitmap deny access.
    fn has_io_permission(&mut self, _port: u16, _size: u32) -> CpuResult<bool> {
        Ok(false)
    }

    /// Near transfer within the current code segment.
    fn branch_to(&mut self, new_eip: u32) {
        self.registers_mut().eip = new_eip;
    }

    fn far_jump(&mut self, selector: u16, offset: u32, operand_size: OperandSize) -> CpuResult;
    fn far_call(&mut self, selector: u16, offset: u32, operand_size: OperandSize) -> CpuResult;
    /// Pop EIP and CS, then release `pop_bytes` of parameters.
    fn far_return(&mut self, operand_size: OperandSize, pop_bytes: u32) -> CpuResult;
    fn interrupt_return(&mut self, operand_size: OperandSize) -> CpuResult;
    /// INT n. EIP already points at the following instruction.
    fn software_interrupt(&mut self, vector: u8) -> CpuResult;
    /// Deliver a CPU exception and return the abort that unwinds the current instruction.
    fn raise_exception(&mut self, interrupt: Interrupt, error_code: u32) -> CpuAbort;

    fn load_segment_register(&mut self, segment: Segment, selector: u16) -> CpuResult;
    fn load_ldt(&mut self, selector: u16) -> CpuResult;
    fn load_task_register(&mut self, selector: u16) -> CpuResult;
    /// The raw 8-byte descriptor for a selector, or None if it is outside its table.
    fn lookup_descriptor(&mut self, selector: u16) -> CpuResult<Option<u64>>;

    fn set_control_register(&mut self, index: u8, value: u32) -> CpuResult {
        let regs = self.registers_mut();
        match index {
            0 => regs.cr0 = value | CR0_ET,
            2 => regs.cr2 = value,
            3 => {
                regs.cr3 = value;
                self.invalidate_tlb();
            }
            4 => regs.cr4 = value,
            _ => return Err(self.raise_exception(Interrupt::InvalidOpcode, 0)),
        }
        Ok(())
    }

    fn has_external_interrupt(&self) -> bool;
    fn halted(&self) -> bool;
    fn set_halted(&mut self, halted: bool);
    fn add_cycles(&mut self, cycles: u32);
    fn read_tsc(&self) -> u64;

    fn invalidate_tlb(&mut self) {}
    fn invalidate_tlb_entry(&mut self, _linear: u32) {}

    /// Signal an FPU error on the external IRQ13 line. Used when CR0.NE is clear.
    fn fpu_error_irq(&mut self) {}
}

/// Fetches instruction bytes from a context, advancing EIP.
///
/// A fetch that faults ends the queue; the abort is kept so the caller can propagate it
/// in place of the decode error.
pub struct ContextQueue<'a, C: CpuContext + ?Sized> {
    cpu: &'a mut C,
    count: usize,
    abort: Option<CpuAbort>,
}

impl<'a, C: CpuContext + ?Sized> ContextQueue<'a, C> {
    pub fn new(cpu: &'a mut C) -> Self {
        Self {
            cpu,
            count: 0,
            abort: None,
        }
    }

    pub fn take_abort(&mut self) -> Option<CpuAbort> {
        self.abort.take()
    }
}

impl<C: CpuContext + ?Sized> ByteQueue for ContextQueue<'_, C> {
    fn fetch_u8(&mut self) -> Option<u8> {
        if self.abort.is_some() {
            return None;
        }
        match self.cpu.fetch_instruction_byte() {
            Ok(byte) => {
                self.count += 1;
                Some(byte)
            }
            Err(abort) => {
                self.abort = Some(abort);
                None
            }
        }
    }

    fn tell(&self) -> usize {
        self.count
    }
}

/// Reads code bytes at a CS offset without touching EIP. Used to decode ahead of
/// execution, for block compilation and disassembly.
pub struct CodeQueue<'a, C: CpuContext + ?Sized> {
    cpu: &'a mut C,
    offset: u32,
    mask: u32,
    count: usize,
    abort: Option<CpuAbort>,
}

impl<'a, C: CpuContext + ?Sized> CodeQueue<'a, C> {
    pub fn new(cpu: &'a mut C, offset: u32) -> Self {
        let mask = cpu.registers().code_address_size().mask();
        Self {
            cpu,
            offset,
            mask,
            count: 0,
            abort: None,
        }
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn take_abort(&mut self) -> Option<CpuAbort> {
        self.abort.take()
    }
}

impl<C: CpuContext + ?Sized> ByteQueue for CodeQueue<'_, C> {
    fn fetch_u8(&mut self) -> Option<u8> {
        if self.abort.is_some() {
            return None;
        }
        match self.cpu.read_memory_byte(Segment::CS, self.offset) {
            Ok(byte) => {
                self.offset = self.offset.wrapping_add(1) & self.mask;
                self.count += 1;
                Some(byte)
            }
            Err(abort) => {
                self.abort = Some(abort);
                None
            }
        }
    }

    fn tell(&self) -> usize {
        self.count
    }
}

/// Read a value of width T from memory.
#[inline(always)]
pub fn read_memory<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, segment: Segment, offset: u32) -> CpuResult<T> {
    Ok(match T::BITS {
        8 => T::from_u32(cpu.read_memory_byte(segment, offset)? as u32),
        16 => T::from_u32(cpu.read_memory_word(segment, offset)? as u32),
        _ => T::from_u32(cpu.read_memory_dword(segment, offset)?),
    })
}

/// Write a value of width T to memory.
#[inline(always)]
pub fn write_memory<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, segment: Segment, offset: u32, value: T) -> CpuResult {
    match T::BITS {
        8 => cpu.write_memory_byte(segment, offset, value.to_u32() as u8),
        16 => cpu.write_memory_word(segment, offset, value.to_u32() as u16),
        _ => cpu.write_memory_dword(segment, offset, value.to_u32()),
    }
}

/// Push a value onto the stack at SS:ESP. ESP is only updated once the write succeeds.
pub fn push<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, value: T) -> CpuResult {
    let stack_size = cpu.registers().stack_address_size();
    let esp = cpu.registers().address_reg(Register32::ESP as u8, stack_size);
    let new_esp = esp.wrapping_sub(T::BITS / 8) & stack_size.mask();
    write_memory(cpu, Segment::SS, new_esp, value)?;
    cpu.registers_mut().set_address_reg(Register32::ESP as u8, stack_size, new_esp);
    Ok(())
}

/// Pop a value from SS:ESP.
pub fn pop<C: CpuContext + ?Sized, T: Word>(cpu: &mut C) -> CpuResult<T> {
    let stack_size = cpu.registers().stack_address_size();
    let esp = cpu.registers().address_reg(Register32::ESP as u8, stack_size);
    let value = read_memory(cpu, Segment::SS, esp)?;
    cpu.registers_mut()
        .set_address_reg(Register32::ESP as u8, stack_size, esp.wrapping_add(T::BITS / 8));
    Ok(value)
}

/// Push a value at the given operand size, 16 or 32 bits.
pub fn push_sized<C: CpuContext + ?Sized>(cpu: &mut C, size: OperandSize, value: u32) -> CpuResult {
    match size {
        OperandSize::Size32 => push::<C, u32>(cpu, value),
        _ => push::<C, u16>(cpu, value as u16),
    }
}

pub fn pop_sized<C: CpuContext + ?Sized>(cpu: &mut C, size: OperandSize) -> CpuResult<u32> {
    match size {
        OperandSize::Size32 => pop::<C, u32>(cpu),
        _ => Ok(pop::<C, u16>(cpu)? as u32),
    }
}

/// Read the value at SS:ESP+`offset` without popping it.
pub fn peek_sized<C: CpuContext + ?Sized>(cpu: &mut C, size: OperandSize, offset: u32) -> CpuResult<u32> {
    let stack_size = cpu.registers().stack_address_size();
    let esp = cpu.registers().address_reg(Register32::ESP as u8, stack_size);
    let address = esp.wrapping_add(offset) & stack_size.mask();
    match size {
        OperandSize::Size32 => cpu.read_memory_dword(Segment::SS, address),
        _ => Ok(cpu.read_memory_word(Segment::SS, address)? as u32),
    }
}

/// Adjust ESP by `amount` at the stack address size.
pub fn adjust_stack_pointer<C: CpuContext + ?Sized>(cpu: &mut C, amount: u32) {
    let stack_size = cpu.registers().stack_address_size();
    let esp = cpu.registers().address_reg(Register32::ESP as u8, stack_size);
    cpu.registers_mut()
        .set_address_reg(Register32::ESP as u8, stack_size, esp.wrapping_add(amount));
}
