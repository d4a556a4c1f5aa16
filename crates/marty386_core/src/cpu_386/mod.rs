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

    cpu_386::mod.rs

    The 386/486 execution core.

    Instructions are decoded from a CpuContext's code segment and run by one of
    three tiers: the reference interpreter, the fast-path interpreter, which
    dispatches directly on opcode bytes, and the block recompiler.

*/

pub mod backend;
pub mod context;
pub mod decode;
pub mod fast;
pub mod flat;
pub mod float80;
pub mod fpu;
pub mod instruction;
pub mod interpreter;
pub mod modrm;
pub mod opcodes;
pub mod recompiler;

pub use backend::CpuBackend;
pub use context::{ContextQueue, CpuContext};
pub use decode::{decode, decode_slice};
pub use flat::FlatCpu;
pub use float80::F80;
pub use fpu::FpuState;
pub use instruction::Instruction;
pub use opcodes::{Operand, OperandMode, Operation};
