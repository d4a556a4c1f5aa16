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

    cpu_386::interpreter::mod.rs

    The reference interpreter.

    execute_instruction() runs one decoded Instruction against a CpuContext.
    EIP must already point past the instruction, as it does after decoding
    through a ContextQueue, and the register file's current_eip must hold the
    instruction's first byte so that faults can restart it.

*/

/// Instantiate a function generic over operand width for a runtime OperandSize.
macro_rules! sized {
    ($size:expr, $func:ident ( $($arg:expr),* $(,)? )) => {
        match $size {
            OperandSize::Size8 => $func::<_, u8>($($arg),*),
            OperandSize::Size16 => $func::<_, u16>($($arg),*),
            _ => $func::<_, u32>($($arg),*),
        }
    };
}

pub mod arith;
pub mod bitwise;
pub mod control;
pub mod muldiv;
pub mod operands;
pub mod stack;
pub mod string;
pub mod system;
pub mod x87;

use crate::{
    cpu_386::{context::CpuContext, instruction::Instruction, opcodes::Operation},
    cpu_common::*,
};

use arith::*;
use bitwise::*;
use control::*;
use muldiv::*;
use stack::*;
use system::*;

/// Execute one instruction, running REP string operations to completion.
pub fn execute<C: CpuContext + ?Sized>(cpu: &mut C, instr: &Instruction) -> CpuResult {
    execute_instruction(cpu, instr, RepMode::Batch).map(|_| ())
}

/// Execute one instruction.
///
/// Returns OkayRep when a REP string operation yielded with EIP rewound to the start of
/// the instruction, and Halt after HLT.
pub fn execute_instruction<C: CpuContext + ?Sized>(
    cpu: &mut C,
    instr: &Instruction,
    rep_mode: RepMode,
) -> CpuResult<ExecutionResult> {
    if instr.operation.is_string() {
        return string::execute_string(cpu, instr, rep_mode);
    }
    if instr.operation.is_x87() {
        x87::execute_x87(cpu, instr)?;
        return Ok(ExecutionResult::Okay);
    }

    let size = instr.operands[0].size;
    let osz = instr.operand_size;

    match instr.operation {
        Operation::Add => sized!(size, alu(cpu, instr, AluOp::Add))?,
        Operation::Or => sized!(size, alu(cpu, instr, AluOp::Or))?,
        Operation::Adc => sized!(size, alu(cpu, instr, AluOp::Adc))?,
        Operation::Sbb => sized!(size, alu(cpu, instr, AluOp::Sbb))?,
        Operation::And => sized!(size, alu(cpu, instr, AluOp::And))?,
        Operation::Sub => sized!(size, alu(cpu, instr, AluOp::Sub))?,
        Operation::Xor => sized!(size, alu(cpu, instr, AluOp::Xor))?,
        Operation::Cmp => sized!(size, alu(cpu, instr, AluOp::Cmp))?,
        Operation::Test => sized!(size, test_and(cpu, instr))?,
        Operation::Inc => sized!(size, inc_dec(cpu, instr, false))?,
        Operation::Dec => sized!(size, inc_dec(cpu, instr, true))?,
        Operation::Neg => sized!(size, neg(cpu, instr))?,
        Operation::Not => sized!(size, not(cpu, instr))?,
        Operation::Xadd => sized!(size, xadd(cpu, instr))?,
        Operation::Cmpxchg => sized!(size, cmpxchg(cpu, instr))?,

        Operation::Daa => daa(cpu),
        Operation::Das => das(cpu),
        Operation::Aaa => aaa(cpu),
        Operation::Aas => aas(cpu),
        Operation::Aam => aam(cpu, instr)?,
        Operation::Aad => aad(cpu, instr),
        Operation::Salc => salc(cpu),

        Operation::Mul => sized!(size, mul(cpu, instr))?,
        Operation::Imul => match instr.operand_count() {
            1 => sized!(size, imul_accumulator(cpu, instr))?,
            _ => sized!(size, imul(cpu, instr))?,
        },
        Operation::Div => sized!(size, div(cpu, instr))?,
        Operation::Idiv => sized!(size, idiv(cpu, instr))?,

        Operation::Rol => sized!(size, shift(cpu, instr, ShiftOp::Rol))?,
        Operation::Ror => sized!(size, shift(cpu, instr, ShiftOp::Ror))?,
        Operation::Rcl => sized!(size, shift(cpu, instr, ShiftOp::Rcl))?,
        Operation::Rcr => sized!(size, shift(cpu, instr, ShiftOp::Rcr))?,
        Operation::Shl => sized!(size, shift(cpu, instr, ShiftOp::Shl))?,
        Operation::Shr => sized!(size, shift(cpu, instr, ShiftOp::Shr))?,
        Operation::Sar => sized!(size, shift(cpu, instr, ShiftOp::Sar))?,
        Operation::Shld => sized!(size, shift_double(cpu, instr, true))?,
        Operation::Shrd => sized!(size, shift_double(cpu, instr, false))?,
        Operation::Bt => sized!(size, bit_test(cpu, instr, BitOp::Test))?,
        Operation::Bts => sized!(size, bit_test(cpu, instr, BitOp::Set))?,
        Operation::Btr => sized!(size, bit_test(cpu, instr, BitOp::Reset))?,
        Operation::Btc => sized!(size, bit_test(cpu, instr, BitOp::Complement))?,
        Operation::Bsf => sized!(size, bit_scan(cpu, instr, false))?,
        Operation::Bsr => sized!(size, bit_scan(cpu, instr, true))?,
        Operation::SetCc => set_cc(cpu, instr)?,
        Operation::Bswap => bswap(cpu, instr),

        Operation::Mov => sized!(size, mov(cpu, instr))?,
        Operation::MovSreg => mov_sreg(cpu, instr)?,
        Operation::Movzx => sized!(instr.operands[1].size, movzx(cpu, instr, false))?,
        Operation::Movsx => sized!(instr.operands[1].size, movzx(cpu, instr, true))?,
        Operation::Xchg => sized!(size, xchg(cpu, instr))?,
        Operation::Xlat => xlat(cpu, instr)?,
        Operation::Lea => lea(cpu, instr)?,
        Operation::Lxs => load_far_pointer(cpu, instr)?,
        Operation::Cbw => cbw(cpu, osz),
        Operation::Cwd => cwd(cpu, osz),
        Operation::CmovCc => sized!(size, cmov(cpu, instr))?,

        Operation::Clc => cpu.registers_mut().clear_flag(Flag::Carry),
        Operation::Stc => cpu.registers_mut().set_flag(Flag::Carry),
        Operation::Cmc => {
            let carry = cpu.registers().get_flag(Flag::Carry);
            cpu.registers_mut().set_flag_state(Flag::Carry, !carry);
        }
        Operation::Cld => cpu.registers_mut().clear_flag(Flag::Direction),
        Operation::Std => cpu.registers_mut().set_flag(Flag::Direction),
        Operation::Cli => cli(cpu)?,
        Operation::Sti => sti(cpu)?,
        Operation::Lahf => lahf(cpu),
        Operation::Sahf => sahf(cpu),
        Operation::Pushf => pushf(cpu, osz)?,
        Operation::Popf => popf(cpu, osz)?,

        Operation::Push => push_operand(cpu, instr)?,
        Operation::Pop => pop_operand(cpu, instr)?,
        Operation::PushSreg => push_operand(cpu, instr)?,
        Operation::PopSreg => pop_segment(cpu, instr)?,
        Operation::Pusha => pusha(cpu, osz)?,
        Operation::Popa => popa(cpu, osz)?,
        Operation::Enter => enter(cpu, instr)?,
        Operation::Leave => leave(cpu, osz)?,

        Operation::JmpNear => jmp_near(cpu, instr)?,
        Operation::JmpFar => jmp_far(cpu, instr)?,
        Operation::CallNear => call_near(cpu, instr)?,
        Operation::CallFar => call_far(cpu, instr)?,
        Operation::RetNear => ret_near(cpu, instr)?,
        Operation::RetFar => ret_far(cpu, instr)?,
        Operation::Jcc => jcc(cpu, instr)?,
        Operation::Loop => loop_cc(cpu, instr)?,
        Operation::Int => interrupt(cpu, instr)?,
        Operation::Into => interrupt_on_overflow(cpu)?,
        Operation::Iret => iret(cpu, osz)?,
        Operation::Bound => sized!(size, bound(cpu, instr))?,

        Operation::In => port_in(cpu, instr)?,
        Operation::Out => port_out(cpu, instr)?,

        Operation::Hlt => {
            hlt(cpu)?;
            return Ok(ExecutionResult::Halt);
        }
        Operation::Wait => x87::wait(cpu)?,
        Operation::Nop => {}
        Operation::Esc => esc(cpu)?,
        Operation::Clts => clts(cpu)?,
        Operation::Lgdt | Operation::Lidt => load_descriptor_table(cpu, instr)?,
        Operation::Sgdt | Operation::Sidt => store_descriptor_table(cpu, instr)?,
        Operation::Lldt => lldt(cpu, instr)?,
        Operation::Sldt => sldt(cpu, instr)?,
        Operation::Ltr => ltr(cpu, instr)?,
        Operation::Str => store_task_register(cpu, instr)?,
        Operation::Lmsw => lmsw(cpu, instr)?,
        Operation::Smsw => smsw(cpu, instr)?,
        Operation::Verr => verify_segment(cpu, instr, false)?,
        Operation::Verw => verify_segment(cpu, instr, true)?,
        Operation::Lar => load_access_rights(cpu, instr)?,
        Operation::Lsl => load_segment_limit(cpu, instr)?,
        Operation::Arpl => arpl(cpu, instr)?,
        Operation::MovCr => mov_control_register(cpu, instr)?,
        Operation::MovDr | Operation::MovTr => mov_debug_register(cpu, instr)?,
        Operation::Invd | Operation::Wbinvd => invalidate_cache(cpu)?,
        Operation::Invlpg => invlpg(cpu, instr)?,
        Operation::Cpuid => cpuid(cpu)?,
        Operation::Rdtsc => rdtsc(cpu)?,
        Operation::Loadall286 => {
            log::warn!("LOADALL at {:08X} is not supported", instr.address);
            return Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0));
        }

        _ => {
            log::error!("Unhandled operation {:?} at {:08X}", instr.operation, instr.address);
            return Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0));
        }
    }
    Ok(ExecutionResult::Okay)
}

/// Privileged instructions fault with #GP(0) outside ring 0.
pub(crate) fn require_cpl0<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult {
    if cpu.registers().in_protected_mode() && cpu.cpl() != 0 {
        return Err(cpu.raise_exception(Interrupt::GeneralProtectionFault, 0));
    }
    Ok(())
}

/// IOPL-sensitive instructions fault with #GP(0) when CPL > IOPL. Virtual-8086 code
/// runs at CPL 3.
pub(crate) fn check_iopl<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult {
    let regs = cpu.registers();
    let cpl = if regs.in_v86_mode() { 3 } else { cpu.cpl() };
    if regs.in_protected_mode() && cpl > regs.iopl() {
        return Err(cpu.raise_exception(Interrupt::GeneralProtectionFault, 0));
    }
    Ok(())
}

/// I/O instructions are allowed when CPL <= IOPL or the context grants the port.
pub(crate) fn check_io_permission<C: CpuContext + ?Sized>(cpu: &mut C, port: u16, size: u32) -> CpuResult {
    let regs = cpu.registers();
    let restricted = regs.in_v86_mode() || (regs.in_protected_mode() && cpu.cpl() > regs.iopl());
    if restricted && !cpu.has_io_permission(port, size)? {
        return Err(cpu.raise_exception(Interrupt::GeneralProtectionFault, 0));
    }
    Ok(())
}

/// Raise #UD outside protected mode, for instructions that only exist there.
pub(crate) fn require_protected_mode<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult {
    let regs = cpu.registers();
    if !regs.in_protected_mode() || regs.in_v86_mode() {
        return Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0));
    }
    Ok(())
}

/// Mask a branch target to the operand size.
#[inline(always)]
pub(crate) fn branch_target(instr: &Instruction, target: u32) -> u32 {
    match instr.operand_size {
        OperandSize::Size32 => target,
        _ => target & 0xFFFF,
    }
}
