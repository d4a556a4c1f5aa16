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

    cpu_common::mod.rs

    Types shared by every execution tier: registers, segments, sizes,
    interrupt vectors and the EFLAGS bit definitions.

*/

#![allow(dead_code)]

pub mod alu;
pub mod error;
pub mod registers;

use std::fmt;

use serde::Deserialize;
use strum_macros::{Display, EnumString};

pub use alu::{AluOp, ShiftOp, Word};
pub use error::{CpuAbort, CpuError, CpuResult, DecodeError};
pub use registers::{DescriptorTablePointer, Registers, SegmentCache};

// EFLAGS bits
pub const CPU_FLAG_CARRY: u32 = 0b0000_0000_0000_0001;
pub const CPU_FLAG_RESERVED1: u32 = 0b0000_0000_0000_0010;
pub const CPU_FLAG_PARITY: u32 = 0b0000_0000_0000_0100;
pub const CPU_FLAG_AUX_CARRY: u32 = 0b0000_0000_0001_0000;
pub const CPU_FLAG_ZERO: u32 = 0b0000_0000_0100_0000;
pub const CPU_FLAG_SIGN: u32 = 0b0000_0000_1000_0000;
pub const CPU_FLAG_TRAP: u32 = 0b0000_0001_0000_0000;
pub const CPU_FLAG_INT_ENABLE: u32 = 0b0000_0010_0000_0000;
pub const CPU_FLAG_DIRECTION: u32 = 0b0000_0100_0000_0000;
pub const CPU_FLAG_OVERFLOW: u32 = 0b0000_1000_0000_0000;
pub const CPU_FLAG_IOPL: u32 = 0b0011_0000_0000_0000;
pub const CPU_FLAG_NESTED_TASK: u32 = 0b0100_0000_0000_0000;
pub const CPU_FLAG_RESUME: u32 = 0x0001_0000;
pub const CPU_FLAG_V86: u32 = 0x0002_0000;
pub const CPU_FLAG_ALIGNMENT_CHECK: u32 = 0x0004_0000;
pub const CPU_FLAG_ID: u32 = 0x0020_0000;

/// The six arithmetic status flags.
pub const CPU_FLAGS_STATUS: u32 =
    CPU_FLAG_CARRY | CPU_FLAG_PARITY | CPU_FLAG_AUX_CARRY | CPU_FLAG_ZERO | CPU_FLAG_SIGN | CPU_FLAG_OVERFLOW;

pub const CPU_FLAG_IOPL_SHIFT: u32 = 12;

// CR0 bits
pub const CR0_PE: u32 = 1 << 0;
pub const CR0_MP: u32 = 1 << 1;
pub const CR0_EM: u32 = 1 << 2;
pub const CR0_TS: u32 = 1 << 3;
pub const CR0_ET: u32 = 1 << 4;
pub const CR0_NE: u32 = 1 << 5;
pub const CR0_WP: u32 = 1 << 16;
pub const CR0_AM: u32 = 1 << 18;
pub const CR0_NW: u32 = 1 << 29;
pub const CR0_CD: u32 = 1 << 30;
pub const CR0_PG: u32 = 1 << 31;

pub const MAX_INSTRUCTION_SIZE: usize = 15;

// The parity flag is calculated from the lower 8 bits of an alu operation regardless
// of the operand width.  It is trivial to precalculate an 8-bit parity table.
pub const PARITY_TABLE: [bool; 256] = {
    let mut table = [false; 256];
    let mut index = 0;
    loop {
        table[index] = (index as u8).count_ones() % 2 == 0;
        index += 1;
        if index == 256 {
            break;
        }
    }
    table
};

/// Representation of a flag in the EFLAGS CPU register
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flag {
    Carry,
    Parity,
    AuxCarry,
    Zero,
    Sign,
    Trap,
    Interrupt,
    Direction,
    Overflow,
    NestedTask,
    Resume,
    V86,
    AlignmentCheck,
    Id,
}

impl Flag {
    #[inline(always)]
    pub const fn mask(self) -> u32 {
        match self {
            Flag::Carry => CPU_FLAG_CARRY,
            Flag::Parity => CPU_FLAG_PARITY,
            Flag::AuxCarry => CPU_FLAG_AUX_CARRY,
            Flag::Zero => CPU_FLAG_ZERO,
            Flag::Sign => CPU_FLAG_SIGN,
            Flag::Trap => CPU_FLAG_TRAP,
            Flag::Interrupt => CPU_FLAG_INT_ENABLE,
            Flag::Direction => CPU_FLAG_DIRECTION,
            Flag::Overflow => CPU_FLAG_OVERFLOW,
            Flag::NestedTask => CPU_FLAG_NESTED_TASK,
            Flag::Resume => CPU_FLAG_RESUME,
            Flag::V86 => CPU_FLAG_V86,
            Flag::AlignmentCheck => CPU_FLAG_ALIGNMENT_CHECK,
            Flag::Id => CPU_FLAG_ID,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq, Hash)]
pub enum CpuModel {
    Intel8086,
    Intel80286,
    Intel80386,
    #[default]
    Intel80486,
}

impl CpuModel {
    /// Mask of EFLAGS bits that exist on this model. Bits outside the mask read as fixed.
    pub fn eflags_mask(&self) -> u32 {
        match self {
            CpuModel::Intel8086 => 0x0FD5,
            CpuModel::Intel80286 => 0x7FD5,
            CpuModel::Intel80386 => 0x0003_7FD5,
            CpuModel::Intel80486 => 0x0027_7FD5,
        }
    }

    pub fn has_cpuid(&self) -> bool {
        matches!(self, CpuModel::Intel80486)
    }
}

/// Segment registers in x86 encoding order.
#[derive(Copy, Clone, Debug, Default, Display, Eq, PartialEq, Hash)]
pub enum Segment {
    ES = 0,
    CS = 1,
    SS = 2,
    #[default]
    DS = 3,
    FS = 4,
    GS = 5,
}

pub const SEGMENT_COUNT: usize = 6;

impl Segment {
    pub const ALL: [Segment; SEGMENT_COUNT] =
        [Segment::ES, Segment::CS, Segment::SS, Segment::DS, Segment::FS, Segment::GS];

    pub fn from_index(index: u8) -> Option<Segment> {
        Segment::ALL.get(index as usize).copied()
    }
}

/// An operand size. `Native` is resolved against the instruction's operand size before use.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum OperandSize {
    #[default]
    Native,
    Size8,
    Size16,
    Size32,
    Size64,
    Size80,
}

impl OperandSize {
    #[inline(always)]
    pub fn resolve(self, native: OperandSize) -> OperandSize {
        match self {
            OperandSize::Native => native,
            size => size,
        }
    }

    pub fn bytes(&self) -> u32 {
        match self {
            OperandSize::Size8 => 1,
            OperandSize::Size16 => 2,
            OperandSize::Size32 => 4,
            OperandSize::Size64 => 8,
            OperandSize::Size80 => 10,
            OperandSize::Native => 0,
        }
    }

    /// Swap between 16 and 32 bits, as the operand-size prefix does.
    pub fn toggled(self) -> OperandSize {
        match self {
            OperandSize::Size16 => OperandSize::Size32,
            _ => OperandSize::Size16,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum AddressSize {
    #[default]
    Addr16,
    Addr32,
}

impl AddressSize {
    #[inline(always)]
    pub fn mask(&self) -> u32 {
        match self {
            AddressSize::Addr16 => 0xFFFF,
            AddressSize::Addr32 => 0xFFFF_FFFF,
        }
    }

    pub fn toggled(self) -> AddressSize {
        match self {
            AddressSize::Addr16 => AddressSize::Addr32,
            AddressSize::Addr32 => AddressSize::Addr16,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Register8 {
    AL,
    CL,
    DL,
    BL,
    AH,
    CH,
    DH,
    BH,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Register16 {
    AX,
    CX,
    DX,
    BX,
    SP,
    BP,
    SI,
    DI,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Register32 {
    EAX,
    ECX,
    EDX,
    EBX,
    ESP,
    EBP,
    ESI,
    EDI,
}

pub const REGISTER8_NAMES: [&str; 8] = ["al", "cl", "dl", "bl", "ah", "ch", "dh", "bh"];
pub const REGISTER16_NAMES: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
pub const REGISTER32_NAMES: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
pub const SEGMENT_NAMES: [&str; 6] = ["es", "cs", "ss", "ds", "fs", "gs"];

/// Interrupt vectors raised by the CPU itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Interrupt {
    DivideError = 0x00,
    Debug = 0x01,
    Nmi = 0x02,
    Breakpoint = 0x03,
    Overflow = 0x04,
    Bounds = 0x05,
    InvalidOpcode = 0x06,
    CoprocessorNotAvailable = 0x07,
    DoubleFault = 0x08,
    CoprocessorSegmentOverrun = 0x09,
    InvalidTaskStateSegment = 0x0A,
    SegmentNotPresent = 0x0B,
    StackFault = 0x0C,
    GeneralProtectionFault = 0x0D,
    PageFault = 0x0E,
    FloatingPointError = 0x10,
    AlignmentCheck = 0x11,
}

impl Interrupt {
    #[inline(always)]
    pub fn vector(&self) -> u8 {
        *self as u8
    }
}

/// Condition tested by Jcc, SETcc, CMOVcc and the LOOP family.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum JumpCondition {
    #[default]
    Always,
    Overflow,
    NotOverflow,
    Below,
    AboveOrEqual,
    Equal,
    NotEqual,
    BelowOrEqual,
    Above,
    Sign,
    NotSign,
    Parity,
    NotParity,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    Greater,
    CXZero,
}

impl JumpCondition {
    /// Condition encoded in the low nibble of Jcc/SETcc/CMOVcc opcodes.
    pub const fn from_cc(cc: u8) -> JumpCondition {
        match cc & 0x0F {
            0x0 => JumpCondition::Overflow,
            0x1 => JumpCondition::NotOverflow,
            0x2 => JumpCondition::Below,
            0x3 => JumpCondition::AboveOrEqual,
            0x4 => JumpCondition::Equal,
            0x5 => JumpCondition::NotEqual,
            0x6 => JumpCondition::BelowOrEqual,
            0x7 => JumpCondition::Above,
            0x8 => JumpCondition::Sign,
            0x9 => JumpCondition::NotSign,
            0xA => JumpCondition::Parity,
            0xB => JumpCondition::NotParity,
            0xC => JumpCondition::Less,
            0xD => JumpCondition::GreaterOrEqual,
            0xE => JumpCondition::LessOrEqual,
            _ => JumpCondition::Greater,
        }
    }

    /// Evaluate the condition against an EFLAGS value. CXZero needs the count register
    /// and is evaluated by the caller.
    #[inline(always)]
    pub fn test_flags(&self, eflags: u32) -> bool {
        let cf = eflags & CPU_FLAG_CARRY != 0;
        let zf = eflags & CPU_FLAG_ZERO != 0;
        let sf = eflags & CPU_FLAG_SIGN != 0;
        let of = eflags & CPU_FLAG_OVERFLOW != 0;
        let pf = eflags & CPU_FLAG_PARITY != 0;
        match self {
            JumpCondition::Always => true,
            JumpCondition::Overflow => of,
            JumpCondition::NotOverflow => !of,
            JumpCondition::Below => cf,
            JumpCondition::AboveOrEqual => !cf,
            JumpCondition::Equal => zf,
            JumpCondition::NotEqual => !zf,
            JumpCondition::BelowOrEqual => cf || zf,
            JumpCondition::Above => !cf && !zf,
            JumpCondition::Sign => sf,
            JumpCondition::NotSign => !sf,
            JumpCondition::Parity => pf,
            JumpCondition::NotParity => !pf,
            JumpCondition::Less => sf != of,
            JumpCondition::GreaterOrEqual => sf == of,
            JumpCondition::LessOrEqual => zf || (sf != of),
            JumpCondition::Greater => !zf && (sf == of),
            JumpCondition::CXZero => false,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            JumpCondition::Always => "mp",
            JumpCondition::Overflow => "o",
            JumpCondition::NotOverflow => "no",
            JumpCondition::Below => "b",
            JumpCondition::AboveOrEqual => "ae",
            JumpCondition::Equal => "e",
            JumpCondition::NotEqual => "ne",
            JumpCondition::BelowOrEqual => "be",
            JumpCondition::Above => "a",
            JumpCondition::Sign => "s",
            JumpCondition::NotSign => "ns",
            JumpCondition::Parity => "p",
            JumpCondition::NotParity => "np",
            JumpCondition::Less => "l",
            JumpCondition::GreaterOrEqual => "ge",
            JumpCondition::LessOrEqual => "le",
            JumpCondition::Greater => "g",
            JumpCondition::CXZero => "cxz",
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq)]
pub enum TraceMode {
    #[default]
    None,
    Instruction,
}

/// Which execution tier a backend runs instructions with.
#[derive(Copy, Clone, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq)]
pub enum BackendType {
    Interpreter,
    #[default]
    FastInterpreter,
    Recompiler,
}

/// How a REP-prefixed string instruction yields to the outer dispatch loop.
#[derive(Copy, Clone, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq)]
pub enum RepMode {
    /// Run all iterations in one call unless an interrupt or trap intervenes.
    #[default]
    Batch,
    /// Run one iteration per call, rewinding EIP until the count is exhausted.
    Single,
}

#[derive(Debug, Default, PartialEq)]
pub enum ExecutionResult {
    #[default]
    Okay,
    /// A REP string instruction yielded with EIP rewound.
    OkayRep,
    /// The instruction was aborted. Control has been redirected by the context.
    Aborted(CpuAbort),
    Halt,
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionResult::Okay => write!(f, "ok"),
            ExecutionResult::OkayRep => write!(f, "ok (rep)"),
            ExecutionResult::Aborted(abort) => write!(f, "aborted: {}", abort),
            ExecutionResult::Halt => write!(f, "halted"),
        }
    }
}
