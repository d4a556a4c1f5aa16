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

    cpu_386::fast::mod.rs

    The fast-path interpreter.

    execute_instruction() fetches opcode bytes straight from the context and
    dispatches on the raw opcode to handlers specialized by width, ALU
    operation and register. Nothing here builds an Instruction. Opcodes the
    fast path does not handle rewind EIP to the first prefix byte, decode
    through a ContextQueue and run the reference interpreter.

*/

pub mod ea;
pub mod ops;

use crate::{
    cpu_386::{
        context::{ContextQueue, CpuContext},
        decode::decode,
        interpreter::{
            self,
            arith::{cbw, cwd},
            stack::{popf, pushf},
            string::{run_string, RepPrefix, StringOp, StringParams},
            system::{cli, lahf, sahf, sti},
        },
    },
    cpu_common::{alu::*, *},
};

use ea::*;
use ops::*;

/// Instantiate `func::<C, u16|u32, ..>` for the operand size.
macro_rules! wide {
    ($size:expr, $func:ident::<$c:ty $(, $g:ty)*>($($arg:expr),*)) => {
        match $size {
            OperandSize::Size32 => $func::<$c, u32 $(, $g)*>($($arg),*),
            _ => $func::<$c, u16 $(, $g)*>($($arg),*),
        }
    };
}

/// Call `func::<.., REG>` with the register encoded in the low three opcode bits.
macro_rules! reg_dispatch {
    ($opcode:expr, $func:ident::<$($g:ty),*>($($arg:expr),*)) => {
        match $opcode & 0x07 {
            0 => $func::<$($g,)* 0>($($arg),*),
            1 => $func::<$($g,)* 1>($($arg),*),
            2 => $func::<$($g,)* 2>($($arg),*),
            3 => $func::<$($g,)* 3>($($arg),*),
            4 => $func::<$($g,)* 4>($($arg),*),
            5 => $func::<$($g,)* 5>($($arg),*),
            6 => $func::<$($g,)* 6>($($arg),*),
            _ => $func::<$($g,)* 7>($($arg),*),
        }
    };
}

/// Prefix state for the instruction being executed.
#[derive(Copy, Clone, Debug)]
pub struct FastState {
    /// Offset of the first prefix byte.
    pub start_eip: u32,
    pub segment_override: Option<Segment>,
    pub operand_size: OperandSize,
    pub address_size: AddressSize,
    pub rep: RepPrefix,
    pub lock: bool,
}

impl FastState {
    pub fn new(start_eip: u32, operand_size: OperandSize, address_size: AddressSize) -> Self {
        Self {
            start_eip,
            segment_override: None,
            operand_size,
            address_size,
            rep: RepPrefix::None,
            lock: false,
        }
    }

    #[inline(always)]
    fn data_segment(&self) -> Segment {
        self.segment_override.unwrap_or(Segment::DS)
    }
}

/// What the opcode handler did.
enum Dispatch {
    Done,
    Result(ExecutionResult),
    Fallback,
}

impl From<bool> for Dispatch {
    fn from(handled: bool) -> Self {
        match handled {
            true => Dispatch::Done,
            false => Dispatch::Fallback,
        }
    }
}

/// Execute one instruction at CS:EIP.
pub fn execute_instruction<C: CpuContext + ?Sized>(cpu: &mut C, rep_mode: RepMode) -> CpuResult<ExecutionResult> {
    let regs = cpu.registers_mut();
    let start_eip = regs.eip;
    regs.current_eip = start_eip;
    let default_osz = regs.code_operand_size();
    let default_asz = regs.code_address_size();
    let mut st = FastState::new(start_eip, default_osz, default_asz);

    let mut prefix_count = 0;
    let opcode = loop {
        let byte = fetch_u8(cpu)?;
        match byte {
            0x26 => st.segment_override = Some(Segment::ES),
            0x2E => st.segment_override = Some(Segment::CS),
            0x36 => st.segment_override = Some(Segment::SS),
            0x3E => st.segment_override = Some(Segment::DS),
            0x64 => st.segment_override = Some(Segment::FS),
            0x65 => st.segment_override = Some(Segment::GS),
            // Repeated size prefixes do not cancel
            0x66 => st.operand_size = default_osz.toggled(),
            0x67 => st.address_size = default_asz.toggled(),
            0xF0 => st.lock = true,
            0xF2 => st.rep = RepPrefix::RepNe,
            0xF3 => st.rep = RepPrefix::Rep,
            _ => break byte,
        }
        prefix_count += 1;
        if prefix_count >= MAX_INSTRUCTION_SIZE - 1 {
            return fallback(cpu, &st, rep_mode);
        }
    };

    if st.lock {
        // The decoder validates LOCK targets
        return fallback(cpu, &st, rep_mode);
    }
    let dispatch = match opcode {
        0x0F => execute_0f(cpu, &st)?,
        _ => execute_base(cpu, &st, opcode, rep_mode)?,
    };
    match dispatch {
        Dispatch::Done => Ok(ExecutionResult::Okay),
        Dispatch::Result(result) => Ok(result),
        Dispatch::Fallback => fallback(cpu, &st, rep_mode),
    }
}

/// Rewind to the first byte of the instruction, decode it and run the interpreter.
pub fn fallback<C: CpuContext + ?Sized>(cpu: &mut C, st: &FastState, rep_mode: RepMode) -> CpuResult<ExecutionResult> {
    let regs = cpu.registers_mut();
    regs.eip = st.start_eip;
    let operand_size = regs.code_operand_size();
    let address_size = regs.code_address_size();

    let (decoded, fetch_abort) = {
        let mut queue = ContextQueue::new(cpu);
        let decoded = decode(&mut queue, address_size, operand_size);
        (decoded, queue.take_abort())
    };
    match (decoded, fetch_abort) {
        (Ok(mut instr), _) => {
            instr.address = st.start_eip;
            interpreter::execute_instruction(cpu, &instr, rep_mode)
        }
        (Err(_), Some(abort)) => Err(abort),
        (Err(e), None) => {
            log::debug!("Invalid instruction at {:08X}: {}", st.start_eip, e);
            cpu.registers_mut().eip = st.start_eip;
            Err(cpu.raise_exception(Interrupt::InvalidOpcode, 0))
        }
    }
}

fn execute_base<C: CpuContext + ?Sized>(
    cpu: &mut C,
    st: &FastState,
    opcode: u8,
    rep_mode: RepMode,
) -> CpuResult<Dispatch> {
    let osz = st.operand_size;
    match opcode {
        // ALU r/m,reg / reg,r/m / acc,imm
        0x00..=0x3F if opcode & 0x07 < 6 => {
            let to_reg = opcode & 0x02 != 0;
            match opcode & 0x07 {
                0 | 2 => alu_dispatch!(opcode >> 3, alu_modrm::<C, u8>(cpu, st, to_reg))?,
                1 | 3 => match osz {
                    OperandSize::Size32 => alu_dispatch!(opcode >> 3, alu_modrm::<C, u32>(cpu, st, to_reg))?,
                    _ => alu_dispatch!(opcode >> 3, alu_modrm::<C, u16>(cpu, st, to_reg))?,
                },
                4 => alu_dispatch!(opcode >> 3, alu_accumulator::<C, u8>(cpu))?,
                _ => match osz {
                    OperandSize::Size32 => alu_dispatch!(opcode >> 3, alu_accumulator::<C, u32>(cpu))?,
                    _ => alu_dispatch!(opcode >> 3, alu_accumulator::<C, u16>(cpu))?,
                },
            }
        }
        0x06 => push_segment(cpu, st, Segment::ES)?,
        0x07 => pop_segment(cpu, st, Segment::ES)?,
        0x0E => push_segment(cpu, st, Segment::CS)?,
        0x16 => push_segment(cpu, st, Segment::SS)?,
        0x17 => pop_segment(cpu, st, Segment::SS)?,
        0x1E => push_segment(cpu, st, Segment::DS)?,
        0x1F => pop_segment(cpu, st, Segment::DS)?,

        0x40..=0x47 => match osz {
            OperandSize::Size32 => reg_dispatch!(opcode, inc_dec_reg::<C, u32>(cpu, false)),
            _ => reg_dispatch!(opcode, inc_dec_reg::<C, u16>(cpu, false)),
        },
        0x48..=0x4F => match osz {
            OperandSize::Size32 => reg_dispatch!(opcode, inc_dec_reg::<C, u32>(cpu, true)),
            _ => reg_dispatch!(opcode, inc_dec_reg::<C, u16>(cpu, true)),
        },
        0x50..=0x57 => match osz {
            OperandSize::Size32 => reg_dispatch!(opcode, push_reg::<C, u32>(cpu))?,
            _ => reg_dispatch!(opcode, push_reg::<C, u16>(cpu))?,
        },
        0x58..=0x5F => match osz {
            OperandSize::Size32 => reg_dispatch!(opcode, pop_reg::<C, u32>(cpu))?,
            _ => reg_dispatch!(opcode, pop_reg::<C, u16>(cpu))?,
        },
        0x68 => wide!(osz, push_imm::<C>(cpu, false))?,
        0x6A => wide!(osz, push_imm::<C>(cpu, true))?,
        0x70..=0x7F => {
            let displacement = fetch_u8(cpu)? as i8 as i32 as u32;
            jcc(cpu, st, JumpCondition::from_cc(opcode), displacement)?;
        }

        0x80 | 0x82 => group1::<C, u8>(cpu, st, false)?,
        0x81 => wide!(osz, group1::<C>(cpu, st, false))?,
        0x83 => wide!(osz, group1::<C>(cpu, st, true))?,
        0x84 => test_modrm::<C, u8>(cpu, st)?,
        0x85 => wide!(osz, test_modrm::<C>(cpu, st))?,
        0x86 => xchg_modrm::<C, u8>(cpu, st)?,
        0x87 => wide!(osz, xchg_modrm::<C>(cpu, st))?,
        0x88 => mov_modrm::<C, u8>(cpu, st, false)?,
        0x89 => wide!(osz, mov_modrm::<C>(cpu, st, false))?,
        0x8A => mov_modrm::<C, u8>(cpu, st, true)?,
        0x8B => wide!(osz, mov_modrm::<C>(cpu, st, true))?,
        0x8C => return mov_from_segment(cpu, st),
        0x8D => return Ok(wide!(osz, lea::<C>(cpu, st))?.into()),
        0x8E => return mov_to_segment(cpu, st),

        0x90 => {}
        0x91..=0x97 => match osz {
            OperandSize::Size32 => reg_dispatch!(opcode, xchg_accumulator::<C, u32>(cpu)),
            _ => reg_dispatch!(opcode, xchg_accumulator::<C, u16>(cpu)),
        },
        0x98 => cbw(cpu, osz),
        0x99 => cwd(cpu, osz),
        0x9C => pushf(cpu, osz)?,
        0x9D => popf(cpu, osz)?,
        0x9E => sahf(cpu),
        0x9F => lahf(cpu),
        0xA0 => mov_moffs::<C, u8>(cpu, st, false)?,
        0xA1 => wide!(osz, mov_moffs::<C>(cpu, st, false))?,
        0xA2 => mov_moffs::<C, u8>(cpu, st, true)?,
        0xA3 => wide!(osz, mov_moffs::<C>(cpu, st, true))?,
        0xA8 => test_accumulator::<C, u8>(cpu)?,
        0xA9 => wide!(osz, test_accumulator::<C>(cpu))?,

        0x6C..=0x6F | 0xA4..=0xA7 | 0xAA..=0xAF => return string(cpu, st, opcode, rep_mode),

        0xB0..=0xB7 => reg_dispatch!(opcode, mov_reg_imm::<C, u8>(cpu))?,
        0xB8..=0xBF => match osz {
            OperandSize::Size32 => reg_dispatch!(opcode, mov_reg_imm::<C, u32>(cpu))?,
            _ => reg_dispatch!(opcode, mov_reg_imm::<C, u16>(cpu))?,
        },

        0xC0 => return Ok(group2::<C, u8>(cpu, st, ShiftCount::Immediate)?.into()),
        0xC1 => return Ok(wide!(osz, group2::<C>(cpu, st, ShiftCount::Immediate))?.into()),
        0xD0 => return Ok(group2::<C, u8>(cpu, st, ShiftCount::One)?.into()),
        0xD1 => return Ok(wide!(osz, group2::<C>(cpu, st, ShiftCount::One))?.into()),
        0xD2 => return Ok(group2::<C, u8>(cpu, st, ShiftCount::Cl)?.into()),
        0xD3 => return Ok(wide!(osz, group2::<C>(cpu, st, ShiftCount::Cl))?.into()),
        0xC2 => {
            let release = fetch_u16(cpu)? as u32;
            ret_near(cpu, st, release)?;
        }
        0xC3 => ret_near(cpu, st, 0)?,
        0xC6 => return Ok(mov_rm_imm::<C, u8>(cpu, st)?.into()),
        0xC7 => return Ok(wide!(osz, mov_rm_imm::<C>(cpu, st))?.into()),

        0xE0..=0xE3 => loop_jcxz(cpu, st, opcode)?,
        0xE4 => {
            let port = fetch_u8(cpu)? as u16;
            port_in::<C, u8>(cpu, port)?;
        }
        0xE5 => {
            let port = fetch_u8(cpu)? as u16;
            wide!(osz, port_in::<C>(cpu, port))?;
        }
        0xE6 => {
            let port = fetch_u8(cpu)? as u16;
            port_out::<C, u8>(cpu, port)?;
        }
        0xE7 => {
            let port = fetch_u8(cpu)? as u16;
            wide!(osz, port_out::<C>(cpu, port))?;
        }
        0xEC => port_in::<C, u8>(cpu, dx(cpu))?,
        0xED => wide!(osz, port_in::<C>(cpu, dx(cpu)))?,
        0xEE => port_out::<C, u8>(cpu, dx(cpu))?,
        0xEF => wide!(osz, port_out::<C>(cpu, dx(cpu)))?,
        0xE8 => call_relative(cpu, st)?,
        0xE9 => {
            let displacement = fetch_rel(cpu, osz)?;
            jump_relative(cpu, st, displacement)?;
        }
        0xEB => {
            let displacement = fetch_u8(cpu)? as i8 as i32 as u32;
            jump_relative(cpu, st, displacement)?;
        }

        0xF5 => {
            let carry = cpu.registers().get_flag(Flag::Carry);
            cpu.registers_mut().set_flag_state(Flag::Carry, !carry);
        }
        0xF6 => return Ok(group3::<C, u8>(cpu, st)?.into()),
        0xF7 => return Ok(wide!(osz, group3::<C>(cpu, st))?.into()),
        0xF8 => cpu.registers_mut().clear_flag(Flag::Carry),
        0xF9 => cpu.registers_mut().set_flag(Flag::Carry),
        0xFA => cli(cpu)?,
        0xFB => sti(cpu)?,
        0xFC => cpu.registers_mut().clear_flag(Flag::Direction),
        0xFD => cpu.registers_mut().set_flag(Flag::Direction),
        0xFE => return Ok(group5::<C, u8>(cpu, st, true)?.into()),
        0xFF => return Ok(wide!(osz, group5::<C>(cpu, st, false))?.into()),

        // Everything else, including the x87 escapes and WAIT
        _ => return Ok(Dispatch::Fallback),
    }
    Ok(Dispatch::Done)
}

fn execute_0f<C: CpuContext + ?Sized>(cpu: &mut C, st: &FastState) -> CpuResult<Dispatch> {
    let osz = st.operand_size;
    let opcode = fetch_u8(cpu)?;
    match opcode {
        0x80..=0x8F => {
            let displacement = fetch_rel(cpu, osz)?;
            jcc(cpu, st, JumpCondition::from_cc(opcode), displacement)?;
        }
        0x90..=0x9F => set_cc(cpu, st, JumpCondition::from_cc(opcode))?,
        0xA0 => push_segment(cpu, st, Segment::FS)?,
        0xA1 => pop_segment(cpu, st, Segment::FS)?,
        0xA8 => push_segment(cpu, st, Segment::GS)?,
        0xA9 => pop_segment(cpu, st, Segment::GS)?,
        0xAF => wide!(osz, imul_modrm::<C>(cpu, st))?,
        0xB6 => movx::<C, u8>(cpu, st, false)?,
        0xB7 => movx::<C, u16>(cpu, st, false)?,
        0xBE => movx::<C, u8>(cpu, st, true)?,
        0xBF => movx::<C, u16>(cpu, st, true)?,
        _ => return Ok(Dispatch::Fallback),
    }
    Ok(Dispatch::Done)
}

#[inline(always)]
fn dx<C: CpuContext + ?Sized>(cpu: &C) -> u16 {
    cpu.registers().get16(Register16::DX)
}

/// MOV r/m16, Sreg. A register destination with a 32-bit operand size is zero extended.
fn mov_from_segment<C: CpuContext + ?Sized>(cpu: &mut C, st: &FastState) -> CpuResult<Dispatch> {
    let modrm = fetch_modrm(cpu, st)?;
    let Some(segment) = Segment::from_index(modrm.reg)
    else {
        return Ok(Dispatch::Fallback);
    };
    let selector = cpu.registers().selector(segment);
    match (modrm.rm, st.operand_size) {
        (FastRm::Register(reg), OperandSize::Size32) => cpu.registers_mut().set_reg32(reg, selector as u32),
        (rm, _) => write_rm(cpu, rm, selector)?,
    }
    Ok(Dispatch::Done)
}

/// MOV Sreg, r/m16. Loads of CS and invalid segment numbers go to the interpreter.
fn mov_to_segment<C: CpuContext + ?Sized>(cpu: &mut C, st: &FastState) -> CpuResult<Dispatch> {
    let modrm = fetch_modrm(cpu, st)?;
    let segment = match Segment::from_index(modrm.reg) {
        Some(Segment::CS) | None => return Ok(Dispatch::Fallback),
        Some(segment) => segment,
    };
    let selector: u16 = read_rm(cpu, modrm.rm)?;
    cpu.load_segment_register(segment, selector)?;
    Ok(Dispatch::Done)
}

/// String instructions, with or without a repeat prefix.
fn string<C: CpuContext + ?Sized>(cpu: &mut C, st: &FastState, opcode: u8, rep_mode: RepMode) -> CpuResult<Dispatch> {
    let op = match opcode {
        0x6C | 0x6D => StringOp::Ins,
        0x6E | 0x6F => StringOp::Outs,
        0xA4 | 0xA5 => StringOp::Movs,
        0xA6 | 0xA7 => StringOp::Cmps,
        0xAA | 0xAB => StringOp::Stos,
        0xAC | 0xAD => StringOp::Lods,
        _ => StringOp::Scas,
    };
    let params = StringParams {
        op,
        source_segment: st.data_segment(),
        address_size: st.address_size,
        rep: st.rep,
        start_eip: st.start_eip,
    };
    let result = match (opcode & 0x01, st.operand_size) {
        (0, _) => run_string::<C, u8>(cpu, &params, rep_mode)?,
        (_, OperandSize::Size32) => run_string::<C, u32>(cpu, &params, rep_mode)?,
        _ => run_string::<C, u16>(cpu, &params, rep_mode)?,
    };
    Ok(Dispatch::Result(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_386::{flat::FLAT_REAL_CODE_OFFSET, FlatCpu};

    fn run(code: &[u8]) -> FlatCpu {
        let mut cpu = FlatCpu::real_mode(code);
        let end = FLAT_REAL_CODE_OFFSET + code.len() as u32;
        while cpu.regs.eip < end {
            execute_instruction(&mut cpu, RepMode::Batch).unwrap();
        }
        cpu
    }

    #[test]
    fn test_alu_forms() {
        // mov ax, 0x1234; mov bx, 1; add ax, bx; sub al, 0x35; adc ah, 0
        let cpu = run(&[0xB8, 0x34, 0x12, 0xBB, 0x01, 0x00, 0x01, 0xD8, 0x2C, 0x35, 0x80, 0xD4, 0x00]);
        assert_eq!(cpu.regs.get16(Register16::AX), 0x1200);
        assert!(!cpu.regs.get_flag(Flag::Carry));
        assert!(!cpu.regs.get_flag(Flag::Zero));
    }

    #[test]
    fn test_group1_sign_extended() {
        // mov cx, 0x0010; sub cx, -1 (83 E9 FF)
        let cpu = run(&[0xB9, 0x10, 0x00, 0x83, 0xE9, 0xFF]);
        assert_eq!(cpu.regs.get16(Register16::CX), 0x0011);
        assert!(cpu.regs.get_flag(Flag::Carry));
    }

    #[test]
    fn test_operand_size_prefix() {
        // mov eax, 0x12345678 in real mode
        let cpu = run(&[0x66, 0xB8, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(cpu.regs.get32(Register32::EAX), 0x1234_5678);
    }

    #[test]
    fn test_double_size_prefix_does_not_cancel() {
        let cpu = run(&[0x66, 0x66, 0xB8, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(cpu.regs.get32(Register32::EAX), 0x1234_5678);
    }

    #[test]
    fn test_push_pop_registers() {
        // push 0x1234; pop dx; push sp
        let cpu = run(&[0x68, 0x34, 0x12, 0x5A, 0x54]);
        assert_eq!(cpu.regs.get16(Register16::DX), 0x1234);
        assert_eq!(cpu.read_physical_u16(0x7FFE), 0x8000);
    }

    #[test]
    fn test_call_and_return() {
        // call skips a nop, ret returns to it
        let mut cpu = FlatCpu::real_mode(&[0xE8, 0x01, 0x00, 0x90, 0xC3]);
        execute_instruction(&mut cpu, RepMode::Batch).unwrap();
        assert_eq!(cpu.regs.eip, 0x104);
        assert_eq!(cpu.read_physical_u16(0x7FFE), 0x103);
        execute_instruction(&mut cpu, RepMode::Batch).unwrap();
        assert_eq!(cpu.regs.eip, 0x103);
    }

    #[test]
    fn test_loop() {
        // mov cx, 3; inc ax; loop -3
        let mut cpu = FlatCpu::real_mode(&[0xB9, 0x03, 0x00, 0x40, 0xE2, 0xFD]);
        for _ in 0..7 {
            execute_instruction(&mut cpu, RepMode::Batch).unwrap();
        }
        assert_eq!(cpu.regs.get16(Register16::AX), 3);
        assert_eq!(cpu.regs.get16(Register16::CX), 0);
        assert_eq!(cpu.regs.eip, 0x106);
    }

    #[test]
    fn test_group3_divide_error() {
        // mov dx, 1; xor ax, ax; mov bx, 1; div bx
        let mut cpu = FlatCpu::real_mode(&[0xBA, 0x01, 0x00, 0x31, 0xC0, 0xBB, 0x01, 0x00, 0xF7, 0xF3]);
        for _ in 0..3 {
            execute_instruction(&mut cpu, RepMode::Batch).unwrap();
        }
        assert!(execute_instruction(&mut cpu, RepMode::Batch).is_err());
        assert_eq!(cpu.exceptions.last(), Some(&(Interrupt::DivideError, 0)));
        assert_eq!(cpu.regs.get16(Register16::AX), 0);
        assert_eq!(cpu.regs.get16(Register16::DX), 1);
    }

    #[test]
    fn test_rep_stosw() {
        // mov di, 0x400; mov cx, 4; mov ax, 0xABCD; rep stosw
        let cpu = run(&[0xBF, 0x00, 0x04, 0xB9, 0x04, 0x00, 0xB8, 0xCD, 0xAB, 0xF3, 0xAB]);
        assert_eq!(cpu.read_physical_u16(0x400), 0xABCD);
        assert_eq!(cpu.read_physical_u16(0x406), 0xABCD);
        assert_eq!(cpu.read_physical_u16(0x408), 0);
        assert_eq!(cpu.regs.get16(Register16::DI), 0x408);
    }

    #[test]
    fn test_movzx_movsx_setcc() {
        // mov bl, 0x80; movzx eax, bl; movsx ecx, bl; cmp bl, 0x80; sete dl
        let cpu = run(&[
            0xB3, 0x80, 0x66, 0x0F, 0xB6, 0xC3, 0x66, 0x0F, 0xBE, 0xCB, 0x80, 0xFB, 0x80, 0x0F, 0x94, 0xC2,
        ]);
        assert_eq!(cpu.regs.get32(Register32::EAX), 0x80);
        assert_eq!(cpu.regs.get32(Register32::ECX), 0xFFFF_FF80);
        assert_eq!(cpu.regs.get8(Register8::DL), 1);
    }

    #[test]
    fn test_fallback_runs_interpreter() {
        // aam 10 is not handled natively
        let mut cpu = FlatCpu::real_mode(&[0xD4, 0x0A]);
        cpu.regs.set8(Register8::AL, 47);
        execute_instruction(&mut cpu, RepMode::Batch).unwrap();
        assert_eq!(cpu.regs.get16(Register16::AX), 0x0407);
        assert_eq!(cpu.regs.eip, 0x102);
    }

    #[test]
    fn test_invalid_opcode_rewinds() {
        // A segment prefix, then an undefined 0F opcode
        let mut cpu = FlatCpu::real_mode(&[0x2E, 0x0F, 0xFF]);
        cpu.set_interrupt_vector(6, 0, 0x500);
        assert!(execute_instruction(&mut cpu, RepMode::Batch).is_err());
        assert_eq!(cpu.exceptions.last(), Some(&(Interrupt::InvalidOpcode, 0)));
        // The return address pushed for #UD is the prefix byte
        assert_eq!(cpu.read_physical_u16(0x7FFA), 0x100);
    }
}
