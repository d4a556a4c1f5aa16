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

    cpu_386::interpreter::string.rs

    String instructions and REP iteration.

    The iteration loop is shared with the fast path. Each element is a
    complete step: if it faults, the count and index registers describe the
    elements already done, and EIP points back at the instruction.

    In RepMode::Single one element is processed per call and EIP is rewound
    while elements remain. In RepMode::Batch the loop runs to completion, but
    still yields at element boundaries for a pending interrupt or the trap flag.

*/

use crate::{
    cpu_386::{
        context::{read_memory, write_memory, CpuContext},
        instruction::Instruction,
        interpreter::check_io_permission,
        opcodes::Operation,
    },
    cpu_common::{alu::*, *},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Cmps,
    Scas,
    Lods,
    Stos,
    Ins,
    Outs,
}

impl StringOp {
    pub fn from_operation(operation: Operation) -> Option<StringOp> {
        Some(match operation {
            Operation::Movs => StringOp::Movs,
            Operation::Cmps => StringOp::Cmps,
            Operation::Scas => StringOp::Scas,
            Operation::Lods => StringOp::Lods,
            Operation::Stos => StringOp::Stos,
            Operation::Ins => StringOp::Ins,
            Operation::Outs => StringOp::Outs,
            _ => return None,
        })
    }

    /// CMPS and SCAS end a REPE/REPNE loop on the zero flag.
    #[inline]
    pub fn tests_zero_flag(&self) -> bool {
        matches!(self, StringOp::Cmps | StringOp::Scas)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RepPrefix {
    None,
    /// REP, or REPE for CMPS and SCAS.
    Rep,
    RepNe,
}

#[derive(Copy, Clone, Debug)]
pub struct StringParams {
    pub op: StringOp,
    /// Segment of the DS:ESI operand. ES:EDI cannot be overridden.
    pub source_segment: Segment,
    pub address_size: AddressSize,
    pub rep: RepPrefix,
    /// Offset of the instruction's first byte, for rewinding.
    pub start_eip: u32,
}

pub fn execute_string<C: CpuContext + ?Sized>(
    cpu: &mut C,
    instr: &Instruction,
    rep_mode: RepMode,
) -> CpuResult<ExecutionResult> {
    let Some(op) = StringOp::from_operation(instr.operation)
    else {
        return Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0));
    };
    let rep = match (instr.has_rep, instr.has_repne) {
        (false, _) => RepPrefix::None,
        (true, false) => RepPrefix::Rep,
        (true, true) => RepPrefix::RepNe,
    };
    let params = StringParams {
        op,
        source_segment: instr.segment,
        address_size: instr.address_size,
        rep,
        start_eip: instr.address,
    };
    // OUTS names the port first
    let width = match op {
        StringOp::Outs => instr.operands[1].size,
        _ => instr.operands[0].size,
    };
    sized!(width, run_string(cpu, &params, rep_mode))
}

/// Run a string operation of width T, honoring any REP prefix.
pub fn run_string<C: CpuContext + ?Sized, T: AluWord>(
    cpu: &mut C,
    params: &StringParams,
    rep_mode: RepMode,
) -> CpuResult<ExecutionResult> {
    if matches!(params.op, StringOp::Ins | StringOp::Outs) {
        let port = cpu.registers().get16(Register16::DX);
        check_io_permission(cpu, port, T::BITS / 8)?;
    }
    if params.rep == RepPrefix::None {
        string_step::<C, T>(cpu, params)?;
        return Ok(ExecutionResult::Okay);
    }

    let address_size = params.address_size;
    loop {
        let count = cpu.registers().count(address_size);
        if count == 0 {
            return Ok(ExecutionResult::Okay);
        }
        string_step::<C, T>(cpu, params)?;
        let count = count - 1;
        cpu.registers_mut().set_count(address_size, count);

        if params.op.tests_zero_flag() {
            let zero = cpu.registers().get_flag(Flag::Zero);
            let done = match params.rep {
                RepPrefix::RepNe => zero,
                _ => !zero,
            };
            if done {
                return Ok(ExecutionResult::Okay);
            }
        }
        if count == 0 {
            return Ok(ExecutionResult::Okay);
        }

        let yield_now = match rep_mode {
            RepMode::Single => true,
            RepMode::Batch => cpu.has_external_interrupt() || cpu.registers().get_flag(Flag::Trap),
        };
        if yield_now {
            cpu.registers_mut().eip = params.start_eip;
            return Ok(ExecutionResult::OkayRep);
        }
    }
}

pub(crate) fn read_port<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, port: u16) -> CpuResult<T> {
    Ok(match T::BITS {
        8 => T::from_u32(cpu.read_io_port_byte(port)? as u32),
        16 => T::from_u32(cpu.read_io_port_word(port)? as u32),
        _ => T::from_u32(cpu.read_io_port_dword(port)?),
    })
}

pub(crate) fn write_port<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, port: u16, value: T) -> CpuResult {
    match T::BITS {
        8 => cpu.write_io_port_byte(port, value.to_u32() as u8),
        16 => cpu.write_io_port_word(port, value.to_u32() as u16),
        _ => cpu.write_io_port_dword(port, value.to_u32()),
    }
}

/// Process one element. Index registers only move once the element is complete.
fn string_step<C: CpuContext + ?Sized, T: AluWord>(cpu: &mut C, params: &StringParams) -> CpuResult {
    let asz = params.address_size;
    let regs = cpu.registers();
    let delta = match regs.get_flag(Flag::Direction) {
        true => (T::BITS / 8).wrapping_neg(),
        false => T::BITS / 8,
    };
    let esi = regs.address_reg(Register32::ESI as u8, asz);
    let edi = regs.address_reg(Register32::EDI as u8, asz);
    let port = regs.get16(Register16::DX);
    let (advance_si, advance_di) = match params.op {
        StringOp::Movs => {
            let value: T = read_memory(cpu, params.source_segment, esi)?;
            write_memory(cpu, Segment::ES, edi, value)?;
            (true, true)
        }
        StringOp::Cmps => {
            let lhs: T = read_memory(cpu, params.source_segment, esi)?;
            let rhs: T = read_memory(cpu, Segment::ES, edi)?;
            let (_, flags) = alu_op(AluOp::Cmp, cpu.registers().eflags(), lhs, rhs);
            cpu.registers_mut().set_eflags_raw(flags);
            (true, true)
        }
        StringOp::Scas => {
            let lhs: T = cpu.registers().reg(Register32::EAX as u8);
            let rhs: T = read_memory(cpu, Segment::ES, edi)?;
            let (_, flags) = alu_op(AluOp::Cmp, cpu.registers().eflags(), lhs, rhs);
            cpu.registers_mut().set_eflags_raw(flags);
            (false, true)
        }
        StringOp::Lods => {
            let value: T = read_memory(cpu, params.source_segment, esi)?;
            cpu.registers_mut().set_reg(Register32::EAX as u8, value);
            (true, false)
        }
        StringOp::Stos => {
            let value: T = cpu.registers().reg(Register32::EAX as u8);
            write_memory(cpu, Segment::ES, edi, value)?;
            (false, true)
        }
        StringOp::Ins => {
            let value: T = read_port(cpu, port)?;
            write_memory(cpu, Segment::ES, edi, value)?;
            (false, true)
        }
        StringOp::Outs => {
            let value: T = read_memory(cpu, params.source_segment, esi)?;
            write_port(cpu, port, value)?;
            (true, false)
        }
    };

    let regs = cpu.registers_mut();
    if advance_si {
        regs.set_address_reg(Register32::ESI as u8, asz, esi.wrapping_add(delta));
    }
    if advance_di {
        regs.set_address_reg(Register32::EDI as u8, asz, edi.wrapping_add(delta));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_386::{decode_slice, FlatCpu};

    fn decode16(bytes: &[u8]) -> Instruction {
        decode_slice(bytes, AddressSize::Addr16, OperandSize::Size16).unwrap()
    }

    #[test]
    fn test_movsb_backwards() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.load(0x400, b"abc");
        cpu.regs.set_flag(Flag::Direction);
        cpu.regs.set16(Register16::SI, 0x402);
        cpu.regs.set16(Register16::DI, 0x502);
        cpu.regs.set16(Register16::CX, 3);
        // rep movsb
        let result = execute_string(&mut cpu, &decode16(&[0xF3, 0xA4]), RepMode::Batch).unwrap();
        assert_eq!(result, ExecutionResult::Okay);
        assert_eq!(cpu.read_bytes(0x500, 3), b"abc".to_vec());
        assert_eq!(cpu.regs.get16(Register16::SI), 0x3FF);
        assert_eq!(cpu.regs.get16(Register16::CX), 0);
    }

    #[test]
    fn test_repe_cmpsb_stops_on_mismatch() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.load(0x400, b"abcd");
        cpu.load(0x500, b"abXd");
        cpu.regs.set16(Register16::SI, 0x400);
        cpu.regs.set16(Register16::DI, 0x500);
        cpu.regs.set16(Register16::CX, 4);
        execute_string(&mut cpu, &decode16(&[0xF3, 0xA6]), RepMode::Batch).unwrap();
        assert_eq!(cpu.regs.get16(Register16::CX), 1);
        assert_eq!(cpu.regs.get16(Register16::SI), 0x403);
        assert!(!cpu.regs.get_flag(Flag::Zero));
    }

    #[test]
    fn test_repne_scasb_finds_byte() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.load(0x600, b"hello\0");
        cpu.regs.set16(Register16::DI, 0x600);
        cpu.regs.set16(Register16::CX, 0xFFFF);
        cpu.regs.set8(Register8::AL, 0);
        execute_string(&mut cpu, &decode16(&[0xF2, 0xAE]), RepMode::Batch).unwrap();
        assert_eq!(cpu.regs.get16(Register16::DI), 0x606);
        assert_eq!(cpu.regs.get16(Register16::CX), 0xFFFF - 6);
        assert!(cpu.regs.get_flag(Flag::Zero));
    }

    #[test]
    fn test_rep_zero_count_is_noop() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.regs.set16(Register16::DI, 0x700);
        cpu.regs.set8(Register8::AL, 0x55);
        execute_string(&mut cpu, &decode16(&[0xF3, 0xAA]), RepMode::Single).unwrap();
        assert_eq!(cpu.read_physical(0x700), 0);
        assert_eq!(cpu.regs.get16(Register16::DI), 0x700);
    }

    #[test]
    fn test_batch_yields_to_interrupt() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.regs.set16(Register16::DI, 0x700);
        cpu.regs.set16(Register16::CX, 4);
        cpu.regs.set_flag(Flag::Interrupt);
        cpu.interrupt_pending = true;
        let mut instr = decode16(&[0xF3, 0xAA]);
        instr.address = 0x100;
        cpu.regs.eip = 0x102;
        let result = execute_string(&mut cpu, &instr, RepMode::Batch).unwrap();
        assert_eq!(result, ExecutionResult::OkayRep);
        assert_eq!(cpu.regs.get16(Register16::CX), 3);
        assert_eq!(cpu.regs.eip, 0x100);
    }

    #[test]
    fn test_outsw() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.load(0x400, &[0x34, 0x12]);
        cpu.regs.set16(Register16::SI, 0x400);
        cpu.regs.set16(Register16::DX, 0x80);
        execute_string(&mut cpu, &decode16(&[0x6F]), RepMode::Batch).unwrap();
        assert_eq!(cpu.port_writes, vec![(0x80, 0x34), (0x81, 0x12)]);
        assert_eq!(cpu.regs.get16(Register16::SI), 0x402);
    }
}
