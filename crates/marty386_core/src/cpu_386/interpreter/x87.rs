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

    cpu_386::interpreter::x87.rs

    x87 floating point instructions.

    Register values are F80 extended values. Loads, stores, integer and BCD
    conversions and the basic arithmetic are exact to 64 significand bits and
    follow the rounding and precision controls; the transcendental
    instructions are computed in f64. Stack faults and unmasked numeric
    exceptions end the instruction without writing a result and leave an
    exception pending; it is reported by the next waiting x87 instruction or
    WAIT, as #MF when CR0.NE is set and on the external error line otherwise.

*/

use std::cmp::Ordering;

use crate::{
    cpu_386::{
        context::CpuContext,
        float80::{F80Class, F80},
        fpu::*,
        instruction::Instruction,
        interpreter::{operands::*, system::esc},
        opcodes::{OperandMode, Operation},
    },
    cpu_common::*,
};

/// The partial tangent and trig instructions reject operands at or beyond 2^63.
const TRIG_LIMIT_EXPONENT: u16 = 0x3FFF + 63;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Arith {
    Add,
    Mul,
    Sub,
    SubR,
    Div,
    DivR,
}

pub fn wait<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult {
    let cr0 = cpu.registers().cr0;
    if cr0 & CR0_MP != 0 && cr0 & CR0_TS != 0 {
        return Err(cpu.raise_exception(Interrupt::CoprocessorNotAvailable, 0));
    }
    if cpu.has_fpu() && cpu.fpu().pending_exception {
        signal_pending(cpu)?;
    }
    Ok(())
}

fn signal_pending<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult {
    if cpu.registers().cr0 & CR0_NE != 0 {
        return Err(cpu.raise_exception(Interrupt::FloatingPointError, 0));
    }
    cpu.fpu_mut().pending_exception = false;
    cpu.fpu_error_irq();
    Ok(())
}

/// Instructions that do not wait for, or report, a pending exception.
fn is_non_waiting(operation: Operation) -> bool {
    matches!(
        operation,
        Operation::Fninit
            | Operation::Fnclex
            | Operation::Fnstcw
            | Operation::Fnstsw
            | Operation::Fnstenv
            | Operation::Fnsave
            | Operation::Feni
            | Operation::Fdisi
            | Operation::Fsetpm
    )
}

pub fn execute_x87<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    if !cpu.has_fpu() {
        return esc(cpu);
    }
    if cpu.registers().cr0 & (CR0_EM | CR0_TS) != 0 {
        return Err(cpu.raise_exception(Interrupt::CoprocessorNotAvailable, 0));
    }
    let non_waiting = is_non_waiting(instr.operation);
    if !non_waiting {
        if cpu.fpu().pending_exception {
            signal_pending(cpu)?;
        }
        record_pointers(cpu, instr);
    }

    match execute_operation(cpu, instr) {
        // The instruction is complete; the exception stays pending
        Err(CpuAbort::FpuStackFault) | Err(CpuAbort::FpuException) => Ok(()),
        result => result,
    }
}

fn record_pointers<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) {
    let memory = memory_index(instr).and_then(|index| operand_address(cpu, instr, index));
    let regs = cpu.registers();
    let fcs = regs.selector(Segment::CS);
    let data = memory.map(|address| (address.offset, regs.selector(address.segment)));
    let fpu = cpu.fpu_mut();
    fpu.fip = instr.address;
    fpu.fcs = fcs;
    // Only the ModRM half of the opcode register is tracked
    fpu.fop = instr.modrm as u16;
    if let Some((offset, selector)) = data {
        fpu.fdp = offset;
        fpu.fds = selector;
    }
}

/// Index of the memory operand, if the instruction has one.
fn memory_index(instr: &Instruction) -> Option<usize> {
    (0..instr.operand_count()).find(|&i| instr.operands[i].mode == OperandMode::ModRmRm && !instr.modrm_rm_register)
}

fn memory_operand<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult<(MemoryAddress, OperandSize)> {
    let Some(index) = memory_index(instr)
    else {
        return Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0));
    };
    let address = require_memory(cpu, instr, index)?;
    Ok((address, instr.operands[index].size))
}

fn read_qword<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction, address: MemoryAddress) -> CpuResult<u64> {
    let low = cpu.read_memory_dword(address.segment, address.offset)?;
    let high_address = offset_address(instr, address, 4);
    let high = cpu.read_memory_dword(high_address.segment, high_address.offset)?;
    Ok(((high as u64) << 32) | low as u64)
}

fn write_qword<C: CpuContext + ?Sized>(
    cpu: &mut C,
    instr: &Instruction,
    address: MemoryAddress,
    value: u64,
) -> CpuResult {
    cpu.write_memory_dword(address.segment, address.offset, value as u32)?;
    let high_address = offset_address(instr, address, 4);
    cpu.write_memory_dword(high_address.segment, high_address.offset, (value >> 32) as u32)
}

fn read_extended<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction, address: MemoryAddress) -> CpuResult<F80> {
    let significand = read_qword(cpu, instr, address)?;
    let exponent_address = offset_address(instr, address, 8);
    let sign_exponent = cpu.read_memory_word(exponent_address.segment, exponent_address.offset)?;
    Ok(F80::from_parts(significand, sign_exponent))
}

fn write_extended<C: CpuContext + ?Sized>(
    cpu: &mut C,
    instr: &Instruction,
    address: MemoryAddress,
    value: F80,
) -> CpuResult {
    write_qword(cpu, instr, address, value.significand)?;
    let exponent_address = offset_address(instr, address, 8);
    cpu.write_memory_word(exponent_address.segment, exponent_address.offset, value.sign_exponent)
}

fn read_real<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult<F80> {
    let (address, size) = memory_operand(cpu, instr)?;
    let (value, flags) = match size {
        OperandSize::Size32 => F80::from_f32_bits(cpu.read_memory_dword(address.segment, address.offset)?),
        OperandSize::Size64 => F80::from_f64_bits(read_qword(cpu, instr, address)?),
        // Extended values load without conversion
        _ => return read_extended(cpu, instr, address),
    };
    cpu.fpu_mut().raise_exceptions(flags)?;
    Ok(value)
}

fn read_integer<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult<F80> {
    let (address, size) = memory_operand(cpu, instr)?;
    let integer = match size {
        OperandSize::Size16 => cpu.read_memory_word(address.segment, address.offset)? as i16 as i64,
        OperandSize::Size32 => cpu.read_memory_dword(address.segment, address.offset)? as i32 as i64,
        _ => read_qword(cpu, instr, address)? as i64,
    };
    Ok(F80::from_i64(integer))
}

fn write_real<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction, value: F80) -> CpuResult {
    let (address, size) = memory_operand(cpu, instr)?;
    let mode = cpu.fpu().rounding_mode();
    match size {
        OperandSize::Size32 => {
            let (single, flags) = value.to_f32_rounded(mode);
            cpu.fpu_mut().raise_exceptions(flags)?;
            cpu.write_memory_dword(address.segment, address.offset, single.to_bits())
        }
        OperandSize::Size64 => {
            let (double, flags) = value.to_f64_rounded(mode);
            cpu.fpu_mut().raise_exceptions(flags)?;
            write_qword(cpu, instr, address, double.to_bits())
        }
        _ => write_extended(cpu, instr, address, value),
    }
}

/// Round to an integer of the destination width. Out of range values and NaN store the
/// integer indefinite when the invalid exception is masked.
fn write_integer<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction, value: F80) -> CpuResult {
    let (address, size) = memory_operand(cpu, instr)?;
    let bits = match size {
        OperandSize::Size16 => 16,
        OperandSize::Size32 => 32,
        _ => 64,
    };
    let (integer, flags) = value.to_integer(cpu.fpu().rounding_mode(), bits);
    let integer = match integer {
        Some(integer) => {
            cpu.fpu_mut().raise_exceptions(flags)?;
            integer as u64
        }
        None => {
            cpu.fpu_mut().raise_exceptions(FPU_EXCEPTION_INVALID)?;
            1u64 << (bits - 1)
        }
    };
    match size {
        OperandSize::Size16 => cpu.write_memory_word(address.segment, address.offset, integer as u16),
        OperandSize::Size32 => cpu.write_memory_dword(address.segment, address.offset, integer as u32),
        _ => write_qword(cpu, instr, address, integer),
    }
}

/// The register index named by an FPU register operand, or ST(0).
fn register_operand(instr: &Instruction, index: usize) -> u8 {
    match instr.operands[index].mode {
        OperandMode::FpuRegister => instr.operands[index].data,
        _ => 0,
    }
}

/// The source of a two-operand instruction: ST(i) or a memory operand.
fn source_value<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction, integer: bool) -> CpuResult<F80> {
    let operand = instr.operands[1];
    if operand.mode == OperandMode::FpuRegister {
        cpu.fpu_mut().check_underflow(operand.data)?;
        return Ok(cpu.fpu().st(operand.data));
    }
    match integer {
        true => read_integer(cpu, instr),
        false => read_real(cpu, instr),
    }
}

fn execute_operation<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    use Operation::*;
    match instr.operation {
        Fld => {
            let value = match instr.operands[0].mode {
                OperandMode::FpuRegister => {
                    let index = instr.operands[0].data;
                    cpu.fpu_mut().check_underflow(index)?;
                    cpu.fpu().st(index)
                }
                _ => read_real(cpu, instr)?,
            };
            cpu.fpu_mut().push(value)?;
        }
        Fild => {
            let value = read_integer(cpu, instr)?;
            cpu.fpu_mut().push(value)?;
        }
        Fbld => {
            let (address, _) = memory_operand(cpu, instr)?;
            let mut bytes = [0u8; 10];
            for (i, byte) in bytes.iter_mut().enumerate() {
                let at = offset_address(instr, address, i as u32);
                *byte = cpu.read_memory_byte(at.segment, at.offset)?;
            }
            cpu.fpu_mut().check_overflow()?;
            let value = match F80::from_bcd(&bytes) {
                Some(value) => value,
                None => {
                    cpu.fpu_mut().raise_exceptions(FPU_EXCEPTION_INVALID)?;
                    F80::INDEFINITE
                }
            };
            cpu.fpu_mut().push(value)?;
        }
        Fld1 => cpu.fpu_mut().push(F80::ONE)?,
        Fldz => cpu.fpu_mut().push(F80::ZERO)?,
        Fldpi => cpu.fpu_mut().push(F80::PI)?,
        Fldl2t => cpu.fpu_mut().push(F80::LOG2_10)?,
        Fldl2e => cpu.fpu_mut().push(F80::LOG2_E)?,
        Fldlg2 => cpu.fpu_mut().push(F80::LOG10_2)?,
        Fldln2 => cpu.fpu_mut().push(F80::LN_2)?,

        Fst | Fstp => {
            cpu.fpu_mut().check_underflow(0)?;
            let value = cpu.fpu().st(0);
            match instr.operands[0].mode {
                OperandMode::FpuRegister => cpu.fpu_mut().set_st(instr.operands[0].data, value),
                _ => write_real(cpu, instr, value)?,
            }
            if instr.operation == Fstp {
                cpu.fpu_mut().pop();
            }
        }
        Fist | Fistp => {
            cpu.fpu_mut().check_underflow(0)?;
            let value = cpu.fpu().st(0);
            write_integer(cpu, instr, value)?;
            if instr.operation == Fistp {
                cpu.fpu_mut().pop();
            }
        }
        Fbstp => {
            cpu.fpu_mut().check_underflow(0)?;
            let (bytes, flags) = cpu.fpu().st(0).to_bcd(cpu.fpu().rounding_mode());
            let bytes = match bytes {
                Some(bytes) => {
                    cpu.fpu_mut().raise_exceptions(flags)?;
                    bytes
                }
                None => {
                    cpu.fpu_mut().raise_exceptions(FPU_EXCEPTION_INVALID)?;
                    // Packed BCD indefinite
                    [0, 0, 0, 0, 0, 0, 0, 0xC0, 0xFF, 0xFF]
                }
            };
            let (address, _) = memory_operand(cpu, instr)?;
            for (i, byte) in bytes.iter().enumerate() {
                let at = offset_address(instr, address, i as u32);
                cpu.write_memory_byte(at.segment, at.offset, *byte)?;
            }
            cpu.fpu_mut().pop();
        }

        Fadd | Fiadd => arithmetic(cpu, instr, Arith::Add, false)?,
        Faddp => arithmetic(cpu, instr, Arith::Add, true)?,
        Fmul | Fimul => arithmetic(cpu, instr, Arith::Mul, false)?,
        Fmulp => arithmetic(cpu, instr, Arith::Mul, true)?,
        Fsub | Fisub => arithmetic(cpu, instr, Arith::Sub, false)?,
        Fsubp => arithmetic(cpu, instr, Arith::Sub, true)?,
        Fsubr | Fisubr => arithmetic(cpu, instr, Arith::SubR, false)?,
        Fsubrp => arithmetic(cpu, instr, Arith::SubR, true)?,
        Fdiv | Fidiv => arithmetic(cpu, instr, Arith::Div, false)?,
        Fdivp => arithmetic(cpu, instr, Arith::Div, true)?,
        Fdivr | Fidivr => arithmetic(cpu, instr, Arith::DivR, false)?,
        Fdivrp => arithmetic(cpu, instr, Arith::DivR, true)?,

        Fcom | Ficom => compare_operands(cpu, instr, true, 0)?,
        Fcomp | Ficomp => compare_operands(cpu, instr, true, 1)?,
        Fcompp => compare_operands(cpu, instr, true, 2)?,
        Fucom => compare_operands(cpu, instr, false, 0)?,
        Fucomp => compare_operands(cpu, instr, false, 1)?,
        Fucompp => compare_operands(cpu, instr, false, 2)?,
        Ftst => {
            cpu.fpu_mut().check_underflow(0)?;
            let value = cpu.fpu().st(0);
            compare(cpu.fpu_mut(), value, F80::ZERO, true)?;
        }
        Fxam => examine(cpu.fpu_mut()),

        Fchs => extended_unary(cpu.fpu_mut(), |v, _, _| (v.neg(), 0))?,
        Fabs => extended_unary(cpu.fpu_mut(), |v, _, _| (v.abs(), 0))?,
        Fsqrt => extended_unary(cpu.fpu_mut(), F80::sqrt)?,
        Frndint => extended_unary(cpu.fpu_mut(), |v, mode, _| v.round_to_integer(mode))?,
        F2xm1 => transcendental(cpu.fpu_mut(), |v| (v * std::f64::consts::LN_2).exp_m1())?,
        Fsin => trig(cpu.fpu_mut(), f64::sin)?,
        Fcos => trig(cpu.fpu_mut(), f64::cos)?,
        Fptan | Fsincos => {
            let fpu = cpu.fpu_mut();
            fpu.check_underflow(0)?;
            let value = fpu.st(0);
            if beyond_trig_range(value) {
                fpu.sw.set_c2(true);
                return Ok(());
            }
            fpu.check_overflow()?;
            let x = value.to_f64();
            let (first, second) = match instr.operation {
                Fptan => (x.tan(), 1.0),
                _ => (x.sin(), x.cos()),
            };
            let second = if first.is_nan() { first } else { second };
            fpu.raise_exceptions(arithmetic_exceptions(&[x], first) | invalid_operands(&[value]))?;
            fpu.sw.set_c2(false);
            fpu.set_st(0, F80::from_f64(first));
            fpu.push(F80::from_f64(second))?;
        }
        Fpatan => binary_pop(cpu.fpu_mut(), |st0, st1| st1.atan2(st0))?,
        Fyl2x => binary_pop(cpu.fpu_mut(), |st0, st1| st1 * st0.log2())?,
        Fyl2xp1 => binary_pop(cpu.fpu_mut(), |st0, st1| st1 * st0.ln_1p() / std::f64::consts::LN_2)?,
        Fscale => {
            let fpu = cpu.fpu_mut();
            fpu.check_underflow(0)?;
            fpu.check_underflow(1)?;
            let (result, flags) = scale(fpu.st(0), fpu.st(1), fpu.rounding_mode());
            fpu.raise_exceptions(flags)?;
            fpu.set_st(0, result);
        }
        Fxtract => {
            let fpu = cpu.fpu_mut();
            fpu.check_underflow(0)?;
            fpu.check_overflow()?;
            let value = fpu.st(0);
            let (exponent, significand) = match F80::propagate_nan(value, value) {
                Some((nan, flags)) => {
                    fpu.raise_exceptions(flags)?;
                    (nan, nan)
                }
                None => match value.class() {
                    F80Class::Zero => {
                        fpu.raise_exceptions(FPU_EXCEPTION_ZERO_DIVIDE)?;
                        (F80::INFINITY.neg(), value)
                    }
                    F80Class::Infinity => (value.abs(), value),
                    class => {
                        if class == F80Class::Denormal {
                            fpu.raise_exceptions(FPU_EXCEPTION_DENORMAL)?;
                        }
                        value.extract()
                    }
                },
            };
            fpu.set_st(0, exponent);
            fpu.push(significand)?;
        }
        Fprem | Fprem1 => {
            let fpu = cpu.fpu_mut();
            fpu.check_underflow(0)?;
            fpu.check_underflow(1)?;
            let (step, flags) = fpu.st(0).partial_remainder(fpu.st(1), instr.operation == Fprem1);
            fpu.raise_exceptions(flags)?;
            fpu.set_st(0, step.value);
            fpu.sw.set_c2(!step.complete);
            fpu.sw.set_c0(step.quotient & 4 != 0);
            fpu.sw.set_c3(step.quotient & 2 != 0);
            fpu.sw.set_c1(step.quotient & 1 != 0);
        }

        Fxch => {
            let index = register_operand(instr, 0);
            let fpu = cpu.fpu_mut();
            fpu.check_underflow(0)?;
            fpu.check_underflow(index)?;
            let (a, b) = (fpu.st(0), fpu.st(index));
            fpu.set_st(0, b);
            fpu.set_st(index, a);
            fpu.sw.set_c1(false);
        }
        Ffree => {
            let fpu = cpu.fpu_mut();
            let physical = fpu.physical_index(register_operand(instr, 0));
            fpu.set_tag(physical, FPU_TAG_EMPTY);
        }
        Fincstp | Fdecstp => {
            let fpu = cpu.fpu_mut();
            let top = match instr.operation {
                Fincstp => fpu.top().wrapping_add(1),
                _ => fpu.top().wrapping_sub(1),
            };
            fpu.set_top(top);
            fpu.sw.set_c1(false);
        }
        Fnop | Feni | Fdisi | Fsetpm => {}

        Fninit => cpu.fpu_mut().reset(),
        Fnclex => cpu.fpu_mut().clear_exceptions(),
        Fldcw => {
            let word: u16 = read_operand(cpu, instr, 0)?;
            cpu.fpu_mut().cw = ControlWord::from_word(word);
        }
        Fnstcw => {
            let word = cpu.fpu().cw.to_word();
            write_operand(cpu, instr, 0, word)?;
        }
        Fnstsw => {
            let word = cpu.fpu().sw.to_word();
            write_operand(cpu, instr, 0, word)?;
        }
        Fnstenv => {
            let (address, _) = memory_operand(cpu, instr)?;
            store_environment(cpu, instr, address)?;
            // FNSTENV masks every exception once the environment is saved
            let word = cpu.fpu().cw.to_word() | FPU_EXCEPTION_MASK;
            cpu.fpu_mut().cw = ControlWord::from_word(word);
        }
        Fldenv => {
            let (address, _) = memory_operand(cpu, instr)?;
            load_environment(cpu, instr, address)?;
        }
        Fnsave => {
            let (address, _) = memory_operand(cpu, instr)?;
            let length = store_environment(cpu, instr, address)?;
            for st in 0..8u8 {
                let value = cpu.fpu().st(st);
                let at = offset_address(instr, address, length + st as u32 * 10);
                write_extended(cpu, instr, at, value)?;
            }
            cpu.fpu_mut().reset();
        }
        Frstor => {
            let (address, _) = memory_operand(cpu, instr)?;
            let mut values = [F80::ZERO; 8];
            let length = environment_length(instr);
            for (st, value) in values.iter_mut().enumerate() {
                let at = offset_address(instr, address, length + st as u32 * 10);
                *value = read_extended(cpu, instr, at)?;
            }
            load_environment(cpu, instr, address)?;
            let fpu = cpu.fpu_mut();
            for (st, value) in values.iter().enumerate() {
                let physical = fpu.physical_index(st as u8);
                fpu.regs[physical] = *value;
            }
        }

        _ => {
            log::error!("Unhandled x87 operation {:?} at {:08X}", instr.operation, instr.address);
            return Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0));
        }
    }
    Ok(())
}

fn arithmetic<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction, op: Arith, pop: bool) -> CpuResult {
    let integer = matches!(
        instr.operation,
        Operation::Fiadd
            | Operation::Fimul
            | Operation::Fisub
            | Operation::Fisubr
            | Operation::Fidiv
            | Operation::Fidivr
    );
    let destination = register_operand(instr, 0);
    let source = source_value(cpu, instr, integer)?;
    let fpu = cpu.fpu_mut();
    fpu.check_underflow(destination)?;
    let value = fpu.st(destination);
    let (mode, precision) = (fpu.rounding_mode(), fpu.precision_bits());

    let (result, flags) = match op {
        Arith::Add => value.add(source, mode, precision),
        Arith::Mul => value.mul(source, mode, precision),
        Arith::Sub => value.sub(source, mode, precision),
        Arith::SubR => source.sub(value, mode, precision),
        Arith::Div => value.div(source, mode, precision),
        Arith::DivR => source.div(value, mode, precision),
    };
    fpu.raise_exceptions(flags)?;
    fpu.set_st(destination, result);
    if pop {
        fpu.pop();
    }
    Ok(())
}

/// Set C3, C2 and C0 from comparing `a` with `b`. Ordered compares raise the invalid
/// exception for NaN operands, unordered ones only for signaling NaNs.
fn compare(fpu: &mut FpuState, a: F80, b: F80, ordered: bool) -> CpuResult {
    let order = a.compare(&b);
    let mut flags = invalid_operands(&[a, b]);
    if order.is_none() && ordered {
        flags |= FPU_EXCEPTION_INVALID;
    }
    if a.class() == F80Class::Denormal || b.class() == F80Class::Denormal {
        flags |= FPU_EXCEPTION_DENORMAL;
    }
    fpu.raise_exceptions(flags)?;
    let (c3, c2, c0) = match order {
        None => (true, true, true),
        Some(Ordering::Less) => (false, false, true),
        Some(Ordering::Equal) => (true, false, false),
        Some(Ordering::Greater) => (false, false, false),
    };
    fpu.sw.set_condition(c3, c2, false, c0);
    Ok(())
}

fn compare_operands<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction, ordered: bool, pops: u32) -> CpuResult {
    let integer = matches!(instr.operation, Operation::Ficom | Operation::Ficomp);
    let source = source_value(cpu, instr, integer)?;
    let fpu = cpu.fpu_mut();
    fpu.check_underflow(0)?;
    let value = fpu.st(0);
    compare(fpu, value, source, ordered)?;
    for _ in 0..pops {
        fpu.pop();
    }
    Ok(())
}

/// FXAM. C1 is the sign; C3, C2 and C0 classify the value.
fn examine(fpu: &mut FpuState) {
    let value = fpu.st(0);
    let (c3, c2, c0) = match fpu.is_empty(0) {
        true => (true, false, true),
        false => match value.class() {
            F80Class::Unsupported => (false, false, false),
            F80Class::Nan => (false, false, true),
            F80Class::Normal => (false, true, false),
            F80Class::Infinity => (false, true, true),
            F80Class::Zero => (true, false, false),
            F80Class::Denormal => (true, true, false),
        },
    };
    fpu.sw.set_condition(c3, c2, value.is_negative(), c0);
}

/// The invalid exception for signaling NaN and unsupported operands.
fn invalid_operands(values: &[F80]) -> u16 {
    let invalid = values
        .iter()
        .any(|v| v.is_signaling_nan() || v.class() == F80Class::Unsupported);
    match invalid {
        true => FPU_EXCEPTION_INVALID,
        false => 0,
    }
}

/// Replace ST(0) with the result of an extended precision operation.
fn extended_unary(fpu: &mut FpuState, f: impl Fn(F80, RoundingMode, u32) -> (F80, u16)) -> CpuResult {
    fpu.check_underflow(0)?;
    let (result, flags) = f(fpu.st(0), fpu.rounding_mode(), fpu.precision_bits());
    fpu.raise_exceptions(flags)?;
    fpu.set_st(0, result);
    Ok(())
}

/// Replace ST(0) with a function computed in f64.
fn transcendental(fpu: &mut FpuState, f: impl Fn(f64) -> f64) -> CpuResult {
    fpu.check_underflow(0)?;
    let value = fpu.st(0);
    let x = value.to_f64();
    let result = f(x);
    fpu.raise_exceptions(arithmetic_exceptions(&[x], result) | invalid_operands(&[value]))?;
    fpu.set_st(0, F80::from_f64(result));
    Ok(())
}

fn beyond_trig_range(value: F80) -> bool {
    !value.is_nan() && !value.is_infinite() && value.exponent() >= TRIG_LIMIT_EXPONENT
}

fn trig(fpu: &mut FpuState, f: impl Fn(f64) -> f64) -> CpuResult {
    fpu.check_underflow(0)?;
    if beyond_trig_range(fpu.st(0)) {
        fpu.sw.set_c2(true);
        return Ok(());
    }
    fpu.sw.set_c2(false);
    transcendental(fpu, f)
}

/// Compute from ST(0) and ST(1) in f64, store the result in ST(1) and pop.
fn binary_pop(fpu: &mut FpuState, f: impl Fn(f64, f64) -> f64) -> CpuResult {
    fpu.check_underflow(0)?;
    fpu.check_underflow(1)?;
    let (st0, st1) = (fpu.st(0), fpu.st(1));
    let (x, y) = (st0.to_f64(), st1.to_f64());
    let result = f(x, y);
    fpu.raise_exceptions(arithmetic_exceptions(&[x, y], result) | invalid_operands(&[st0, st1]))?;
    fpu.set_st(1, F80::from_f64(result));
    fpu.pop();
    Ok(())
}

/// FSCALE: `value` * 2^trunc(`by`).
fn scale(value: F80, by: F80, mode: RoundingMode) -> (F80, u16) {
    if let Some(result) = F80::propagate_nan(value, by) {
        return result;
    }
    if by.is_infinite() {
        return match (by.is_negative(), value.class()) {
            (false, F80Class::Zero) | (true, F80Class::Infinity) => (F80::INDEFINITE, FPU_EXCEPTION_INVALID),
            (false, _) => (F80::INFINITY.with_sign(value.is_negative()), 0),
            (true, _) => (F80::ZERO.with_sign(value.is_negative()), 0),
        };
    }
    // Out of range scale factors saturate
    let (exponent, _) = by.to_integer(RoundingMode::TowardZero, 32);
    let exponent = exponent.unwrap_or(match by.is_negative() {
        true => i32::MIN as i64,
        false => i32::MAX as i64,
    });
    value.scale(exponent as i32, mode)
}

fn environment_length(instr: &Instruction) -> u32 {
    match instr.operand_size {
        OperandSize::Size32 => 28,
        _ => 14,
    }
}

/// Store the environment: control, status and tag words and the last instruction and
/// operand pointers. Returns the length written.
fn store_environment<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction, address: MemoryAddress) -> CpuResult<u32> {
    let protected = cpu.registers().in_protected_mode() && !cpu.registers().in_v86_mode();
    let fpu = cpu.fpu();
    let mut fields = [
        fpu.cw.to_word() as u32,
        fpu.sw.to_word() as u32,
        fpu.tw as u32,
        fpu.fip,
        fpu.fcs as u32 | ((fpu.fop as u32 & 0x7FF) << 16),
        fpu.fdp,
        fpu.fds as u32,
    ];
    if !protected {
        // Real mode stores 20-bit linear pointers split across two fields
        fields[3] = fpu.fip & 0xFFFF;
        fields[4] = ((fpu.fip >> 16) << 12) | (fpu.fop as u32 & 0x7FF);
        fields[5] = fpu.fdp & 0xFFFF;
        fields[6] = (fpu.fdp >> 16) << 12;
    }
    let wide = instr.operand_size == OperandSize::Size32;
    let step = if wide { 4 } else { 2 };
    for (i, field) in fields.iter().enumerate() {
        let at = offset_address(instr, address, i as u32 * step);
        match wide {
            true => cpu.write_memory_dword(at.segment, at.offset, *field)?,
            // The 16-bit protected mode layout has no opcode field
            false => cpu.write_memory_word(at.segment, at.offset, *field as u16)?,
        }
    }
    Ok(environment_length(instr))
}

fn load_environment<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction, address: MemoryAddress) -> CpuResult {
    let protected = cpu.registers().in_protected_mode() && !cpu.registers().in_v86_mode();
    let wide = instr.operand_size == OperandSize::Size32;
    let step = if wide { 4 } else { 2 };
    let mut fields = [0u32; 7];
    for (i, field) in fields.iter_mut().enumerate() {
        let at = offset_address(instr, address, i as u32 * step);
        *field = match wide {
            true => cpu.read_memory_dword(at.segment, at.offset)?,
            false => cpu.read_memory_word(at.segment, at.offset)? as u32,
        };
    }
    let fpu = cpu.fpu_mut();
    fpu.cw = ControlWord::from_word(fields[0] as u16);
    fpu.sw = StatusWord::from_word(fields[1] as u16);
    fpu.tw = fields[2] as u16;
    if protected {
        fpu.fip = fields[3];
        fpu.fcs = fields[4] as u16;
        fpu.fop = ((fields[4] >> 16) & 0x7FF) as u16;
        fpu.fdp = fields[5];
        fpu.fds = fields[6] as u16;
    }
    else {
        fpu.fip = (fields[3] & 0xFFFF) | ((fields[4] >> 12) << 16);
        fpu.fop = (fields[4] & 0x7FF) as u16;
        fpu.fdp = (fields[5] & 0xFFFF) | ((fields[6] >> 12) << 16);
    }
    // An unmasked exception flagged in the loaded status word is pending
    fpu.pending_exception = fpu.sw.to_word() & !fpu.cw.exception_mask() & FPU_EXCEPTION_MASK != 0;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_386::{decode_slice, FlatCpu};

    fn run(cpu: &mut FlatCpu, bytes: &[u8]) -> CpuResult {
        let instr = decode_slice(bytes, AddressSize::Addr16, OperandSize::Size16).unwrap();
        execute_x87(cpu, &instr)
    }

    fn f(value: f64) -> F80 {
        F80::from_f64(value)
    }

    fn status_condition(cpu: &FlatCpu) -> (bool, bool, bool) {
        (cpu.fpu.sw.c3(), cpu.fpu.sw.c2(), cpu.fpu.sw.c0())
    }

    #[test]
    fn test_load_constants_and_add() {
        let mut cpu = FlatCpu::real_mode(&[]);
        // fld1; fldpi; faddp st(1), st
        run(&mut cpu, &[0xD9, 0xE8]).unwrap();
        run(&mut cpu, &[0xD9, 0xEB]).unwrap();
        run(&mut cpu, &[0xDE, 0xC1]).unwrap();
        assert_eq!(cpu.fpu.st(0), F80::PI.add(F80::ONE, RoundingMode::Nearest, 64).0);
        assert!((cpu.fpu.st(0).to_f64() - (1.0 + std::f64::consts::PI)).abs() < 1e-15);
        assert_eq!(cpu.fpu.top(), 7);
        assert!(cpu.fpu.is_empty(1));
    }

    #[test]
    fn test_reversed_subtract() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.fpu.push(f(10.0)).unwrap();
        cpu.fpu.push(f(3.0)).unwrap();
        // fsub st(1), st computes st(1) - st(0)
        run(&mut cpu, &[0xDC, 0xE9]).unwrap();
        assert_eq!(cpu.fpu.st(1), f(7.0));
        // fsubr st(1), st computes st(0) - st(1)
        run(&mut cpu, &[0xDC, 0xE1]).unwrap();
        assert_eq!(cpu.fpu.st(1), f(-4.0));
    }

    #[test]
    fn test_precision_control_rounds_results() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.fpu.push(f(3.0)).unwrap();
        cpu.fpu.push(F80::ONE).unwrap();
        // fdiv st, st(1) at extended precision keeps 64 bits
        run(&mut cpu, &[0xD8, 0xF1]).unwrap();
        assert_eq!(cpu.fpu.st(0).significand, 0xAAAA_AAAA_AAAA_AAAB);

        cpu.fpu.set_st(0, F80::ONE);
        cpu.fpu.cw.set_pc(0);
        run(&mut cpu, &[0xD8, 0xF1]).unwrap();
        assert_eq!(cpu.fpu.st(0).to_f64(), (1.0f32 / 3.0f32) as f64);
        assert!(cpu.fpu.sw.pe());
    }

    #[test]
    fn test_compare_flags() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.fpu.push(f(2.0)).unwrap();
        cpu.fpu.push(F80::ONE).unwrap();
        // fcom st(1): 1.0 < 2.0
        run(&mut cpu, &[0xD8, 0xD1]).unwrap();
        assert_eq!(status_condition(&cpu), (false, false, true));

        cpu.fpu.set_st(1, F80::ONE);
        run(&mut cpu, &[0xD8, 0xD1]).unwrap();
        assert_eq!(status_condition(&cpu), (true, false, false));

        cpu.fpu.set_st(1, f(0.5));
        run(&mut cpu, &[0xD8, 0xD1]).unwrap();
        assert_eq!(status_condition(&cpu), (false, false, false));

        // fucom st(1) with a quiet NaN is unordered but raises nothing
        cpu.fpu.set_st(1, f(f64::NAN));
        run(&mut cpu, &[0xDD, 0xE1]).unwrap();
        assert_eq!(status_condition(&cpu), (true, true, true));
        assert!(!cpu.fpu.sw.ie());

        // fcom st(1) with a NaN raises the invalid exception
        run(&mut cpu, &[0xD8, 0xD1]).unwrap();
        assert!(cpu.fpu.sw.ie());
    }

    #[test]
    fn test_compare_sees_low_significand_bits() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.fpu.push(F80::ONE).unwrap();
        cpu.fpu.push(F80::from_parts(0x8000_0000_0000_0001, 0x3FFF)).unwrap();
        run(&mut cpu, &[0xD8, 0xD1]).unwrap();
        assert_eq!(status_condition(&cpu), (false, false, false));
    }

    #[test]
    fn test_stack_overflow_leaves_stack() {
        let mut cpu = FlatCpu::real_mode(&[]);
        for i in 0..8 {
            cpu.fpu.push(F80::from_i64(i)).unwrap();
        }
        // fld1 into a full stack
        run(&mut cpu, &[0xD9, 0xE8]).unwrap();
        assert_eq!(cpu.fpu.st(0), f(7.0));
        assert!(cpu.fpu.sw.sf());
        assert!(cpu.fpu.sw.c1());
        assert!(!cpu.fpu.pending_exception);
    }

    #[test]
    fn test_underflow_unmasked_is_pending() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.fpu.cw.set_im(false);
        cpu.regs.cr0 |= CR0_NE;
        // fchs on an empty stack
        run(&mut cpu, &[0xD9, 0xE0]).unwrap();
        assert!(cpu.fpu.pending_exception);
        assert!(cpu.fpu.sw.es());
        // The next waiting instruction reports it
        assert!(wait(&mut cpu).is_err());
        assert_eq!(cpu.exceptions.last(), Some(&(Interrupt::FloatingPointError, 0)));
    }

    #[test]
    fn test_pending_without_ne_uses_irq() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.fpu.cw.set_im(false);
        run(&mut cpu, &[0xD9, 0xE0]).unwrap();
        wait(&mut cpu).unwrap();
        assert_eq!(cpu.fpu_irq_count, 1);
        assert!(!cpu.fpu.pending_exception);
    }

    #[test]
    fn test_integer_store() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.regs.set16(Register16::BX, 0x400);
        cpu.fpu.push(f(-2.5)).unwrap();
        // fist word [bx]: nearest even
        run(&mut cpu, &[0xDF, 0x17]).unwrap();
        assert_eq!(cpu.read_physical_u16(0x400), (-2i16) as u16);
        assert!(cpu.fpu.sw.pe());

        cpu.fpu.set_st(0, f(40000.0));
        run(&mut cpu, &[0xDF, 0x17]).unwrap();
        assert_eq!(cpu.read_physical_u16(0x400), 0x8000);
        assert!(cpu.fpu.sw.ie());
    }

    #[test]
    fn test_qword_integer_round_trip() {
        let mut cpu = FlatCpu::real_mode(&[]);
        let value = (1u64 << 53) + 1;
        cpu.write_physical_u32(0x200, value as u32);
        cpu.write_physical_u32(0x204, (value >> 32) as u32);
        // fild qword [200h]
        run(&mut cpu, &[0xDF, 0x2E, 0x00, 0x02]).unwrap();
        assert_eq!(cpu.fpu.st(0), F80::from_i64(value as i64));
        // fistp qword [208h]
        run(&mut cpu, &[0xDF, 0x3E, 0x08, 0x02]).unwrap();
        assert_eq!(cpu.read_physical_u64(0x208), value);
        assert!(!cpu.fpu.sw.pe());
        assert!(cpu.fpu.is_empty(0));
    }

    #[test]
    fn test_extended_round_trip_through_memory() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.regs.set16(Register16::BX, 0x500);
        cpu.fpu.push(f(-1234.5625)).unwrap();
        // fstp tbyte [bx]; fld tbyte [bx]
        run(&mut cpu, &[0xDB, 0x3F]).unwrap();
        assert!(cpu.fpu.is_empty(0));
        assert_eq!(cpu.read_physical_u16(0x508), 0xC009);
        run(&mut cpu, &[0xDB, 0x2F]).unwrap();
        assert_eq!(cpu.fpu.st(0), f(-1234.5625));
    }

    #[test]
    fn test_extended_keeps_every_significand_bit() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.regs.set16(Register16::BX, 0x500);
        cpu.write_physical_u32(0x500, 0xFFFF_FFFF);
        cpu.write_physical_u32(0x504, 0xFFFF_FFFF);
        cpu.write_physical_u16(0x508, 0x3FFF);
        // fld tbyte [bx]; fstp tbyte [bx+10h]
        run(&mut cpu, &[0xDB, 0x2F]).unwrap();
        assert_eq!(cpu.fpu.st(0), F80::from_parts(u64::MAX, 0x3FFF));
        run(&mut cpu, &[0xDB, 0x7F, 0x10]).unwrap();
        assert_eq!(cpu.read_bytes(0x510, 10), cpu.read_bytes(0x500, 10));
        assert_eq!(cpu.fpu.sw.to_word() & FPU_EXCEPTION_MASK, 0);
    }

    #[test]
    fn test_fprem_reports_quotient_bits() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.fpu.push(f(5.0)).unwrap();
        cpu.fpu.push(f(17.0)).unwrap();
        // fprem: 17 = 3 * 5 + 2
        run(&mut cpu, &[0xD9, 0xF8]).unwrap();
        assert_eq!(cpu.fpu.st(0), f(2.0));
        assert!(!cpu.fpu.sw.c2());
        assert_eq!((cpu.fpu.sw.c0(), cpu.fpu.sw.c3(), cpu.fpu.sw.c1()), (false, true, true));
    }

    #[test]
    fn test_fnstsw_ax() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.fpu.push(F80::ONE).unwrap();
        run(&mut cpu, &[0xDF, 0xE0]).unwrap();
        assert_eq!(cpu.regs.get16(Register16::AX), 7 << 11);
    }

    #[test]
    fn test_no_coprocessor() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.regs.cr0 |= CR0_TS;
        assert!(run(&mut cpu, &[0xD9, 0xE8]).is_err());
        assert_eq!(cpu.exceptions.last(), Some(&(Interrupt::CoprocessorNotAvailable, 0)));

        cpu.regs.cr0 &= !CR0_TS;
        cpu.fpu_present = false;
        run(&mut cpu, &[0xD9, 0xE8]).unwrap();
        assert!(cpu.fpu.is_empty(0));
    }

    #[test]
    fn test_fsave_frstor() {
        let mut cpu = FlatCpu::real_mode(&[]);
        cpu.regs.set16(Register16::BX, 0x600);
        cpu.fpu.push(f(3.0)).unwrap();
        cpu.fpu.push(f(4.0)).unwrap();
        // fnsave [bx]
        run(&mut cpu, &[0xDD, 0x37]).unwrap();
        assert_eq!(cpu.fpu.top(), 0);
        assert!(cpu.fpu.is_empty(0));
        // frstor [bx]
        run(&mut cpu, &[0xDD, 0x27]).unwrap();
        assert_eq!(cpu.fpu.st(0), f(4.0));
        assert_eq!(cpu.fpu.st(1), f(3.0));
        assert_eq!(cpu.fpu.top(), 6);
    }
}
