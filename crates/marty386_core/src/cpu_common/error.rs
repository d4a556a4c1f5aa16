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

    cpu_common::error.rs

    Error types for instruction decode and execution.

*/

use thiserror::Error;

use crate::cpu_common::{Interrupt, MAX_INSTRUCTION_SIZE};

/// Failure to decode an instruction from the byte stream.
#[derive(Copy, Clone, Debug, Error, Eq, PartialEq)]
pub enum DecodeError {
    #[error("An invalid opcode was encountered: {opcode:#04X} after {length} bytes.")]
    InvalidOpcode { opcode: u8, length: u32 },
    #[error("Instruction fetch failed after {length} bytes.")]
    FetchFailed { length: u32 },
    #[error("Instruction exceeded the maximum instruction length.")]
    TooLong,
}

impl DecodeError {
    /// Number of bytes consumed before the failure.
    pub fn length(&self) -> u32 {
        match self {
            DecodeError::InvalidOpcode { length, .. } => *length,
            DecodeError::FetchFailed { length } => *length,
            DecodeError::TooLong => MAX_INSTRUCTION_SIZE as u32,
        }
    }
}

/// An instruction stopped executing before it completed.
///
/// Register and memory writes made before the abort are not rolled back.
#[derive(Copy, Clone, Debug, Error, Eq, PartialEq)]
pub enum CpuAbort {
    /// The context has already redirected control to the exception handler.
    #[error("{0:?} exception raised with error code {1:#06X}")]
    Exception(Interrupt, u32),
    #[error("FPU stack fault")]
    FpuStackFault,
    #[error("unmasked FPU exception")]
    FpuException,
    /// The instruction must be re-executed from its first byte.
    #[error("instruction restarted")]
    Restart,
}

pub type CpuResult<T = ()> = Result<T, CpuAbort>;

#[derive(Debug, Error)]
pub enum CpuError {
    #[error("An invalid instruction was encountered at address: {address:08X}: {source}")]
    InstructionDecodeError {
        address: u32,
        #[source]
        source: DecodeError,
    },
    #[error("The CPU threw an exception: {0}")]
    ExceptionError(#[from] CpuAbort),
    #[error("The CPU was halted at address: {0:08X}.")]
    CpuHaltedError(u32),
    #[error("Recompiler error: {0}")]
    RecompilerError(#[from] crate::cpu_386::recompiler::RecompilerError),
}
