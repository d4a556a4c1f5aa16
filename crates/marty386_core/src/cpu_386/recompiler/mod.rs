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

    cpu_386::recompiler::mod.rs

    The block recompiler.

    Straight-line runs of code are decoded once, compiled to HostOp lists by
    codegen, cached by linear address and then run by the IR executor. A
    block ends after any control transfer, after any instruction that can
    change the code size or system state, or at the configured maximum
    length.

    The cache does not watch for writes to code. Drivers that load or patch
    code call invalidate_range() or flush().

*/

pub mod codegen;
pub mod exec;
pub mod regcache;

use fxhash::FxHashMap;
use thiserror::Error;

use crate::{
    coreconfig::DEFAULT_MAX_BLOCK_INSTRUCTIONS,
    cpu_386::{
        context::{CodeQueue, CpuContext},
        decode::decode,
        instruction::Instruction,
    },
    cpu_common::*,
};

pub use codegen::{Block, CodeGenerator, HostOp};
use regcache::HOST_REGISTER_COUNT;

#[derive(Debug, Error)]
pub enum RecompilerError {
    #[error("Failed to decode the first instruction of a block at {address:08X}: {source}")]
    DecodeFailed {
        address: u32,
        #[source]
        source: DecodeError,
    },
    #[error("Block contains no instructions.")]
    EmptyBlock,
    #[error("Ran out of host registers.")]
    HostRegistersExhausted,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RecompilerStats {
    pub blocks_compiled: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub native_instructions: u64,
    pub fallback_instructions: u64,
}

struct CachedBlock {
    linear: u32,
    operand_size: OperandSize,
    address_size: AddressSize,
    block: Block,
}

impl CachedBlock {
    fn overlaps(&self, linear: u32, length: u32) -> bool {
        let start = self.linear as u64;
        let end = start + self.block.length as u64;
        let other_start = linear as u64;
        let other_end = other_start + length as u64;
        start < other_end && other_start < end
    }
}

pub struct Recompiler {
    blocks: FxHashMap<u32, CachedBlock>,
    max_block_instructions: usize,
    host_registers: usize,
    stats: RecompilerStats,
}

impl Default for Recompiler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BLOCK_INSTRUCTIONS)
    }
}

impl Recompiler {
    pub fn new(max_block_instructions: usize) -> Self {
        Self {
            blocks: FxHashMap::default(),
            max_block_instructions: max_block_instructions.max(1),
            host_registers: HOST_REGISTER_COUNT,
            stats: RecompilerStats::default(),
        }
    }

    pub fn with_host_registers(mut self, host_registers: usize) -> Self {
        self.host_registers = host_registers;
        self
    }

    pub fn stats(&self) -> RecompilerStats {
        self.stats
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn flush(&mut self) {
        self.blocks.clear();
    }

    /// Drop every cached block that overlaps the given range of linear addresses.
    pub fn invalidate_range(&mut self, linear: u32, length: u32) {
        let before = self.blocks.len();
        self.blocks.retain(|_, cached| !cached.overlaps(linear, length));
        let dropped = before - self.blocks.len();
        if dropped > 0 {
            log::debug!("Recompiler: invalidated {} block(s) at {:08X}+{:X}", dropped, linear, length);
        }
    }

    /// Decode the run of instructions starting at CS:EIP. Does not move EIP.
    pub fn fetch_block<C: CpuContext + ?Sized>(&self, cpu: &mut C) -> Result<Vec<Instruction>, RecompilerError> {
        let regs = cpu.registers();
        let operand_size = regs.code_operand_size();
        let address_size = regs.code_address_size();
        let limit = regs.segment_cache[Segment::CS as usize].limit;
        let mut offset = regs.eip;

        let mut instructions = Vec::new();
        while instructions.len() < self.max_block_instructions {
            // Stay clear of the segment limit so decoding never raises a fault
            let window_end = offset as u64 + MAX_INSTRUCTION_SIZE as u64 - 1;
            if window_end > limit as u64 {
                break;
            }
            let decoded = {
                let mut queue = CodeQueue::new(cpu, offset);
                decode(&mut queue, address_size, operand_size)
            };
            match decoded {
                Ok(mut instr) => {
                    instr.address = offset;
                    offset = offset.wrapping_add(instr.length) & address_size.mask();
                    let last = codegen::ends_block(&instr);
                    instructions.push(instr);
                    if last {
                        break;
                    }
                }
                Err(source) if instructions.is_empty() => {
                    return Err(RecompilerError::DecodeFailed { address: offset, source });
                }
                // The interpreter reports the bad instruction when execution reaches it
                Err(_) => break,
            }
        }
        if instructions.is_empty() {
            return Err(RecompilerError::EmptyBlock);
        }
        Ok(instructions)
    }

    pub fn compile_block(&self, instructions: Vec<Instruction>) -> Result<Block, RecompilerError> {
        CodeGenerator::new(self.host_registers).compile_block(instructions)
    }

    /// Run the block at CS:EIP, compiling it first if it is not cached.
    ///
    /// Compilation failures are returned as CpuError::RecompilerError before anything has
    /// executed, so the caller can run the instruction through another tier instead.
    pub fn run<C: CpuContext + ?Sized>(&mut self, cpu: &mut C, rep_mode: RepMode) -> Result<ExecutionResult, CpuError> {
        let regs = cpu.registers();
        let linear = regs.segment_base(Segment::CS).wrapping_add(regs.eip);
        let operand_size = regs.code_operand_size();
        let address_size = regs.code_address_size();
        let eip = regs.eip;

        let hit = matches!(
            self.blocks.get(&linear),
            Some(cached) if cached.block.start_eip == eip
                && cached.operand_size == operand_size
                && cached.address_size == address_size
        );
        if hit {
            self.stats.cache_hits += 1;
        }
        else {
            self.stats.cache_misses += 1;
            let instructions = self.fetch_block(cpu)?;
            let block = self.compile_block(instructions)?;
            log::trace!(
                "Recompiler: compiled {} instruction(s) at {:08X}, {} native",
                block.instructions.len(),
                linear,
                block.native_count
            );
            self.stats.blocks_compiled += 1;
            self.stats.native_instructions += block.native_count as u64;
            self.stats.fallback_instructions += (block.instructions.len() - block.native_count) as u64;
            self.blocks.insert(
                linear,
                CachedBlock {
                    linear,
                    operand_size,
                    address_size,
                    block,
                },
            );
        }

        let Some(cached) = self.blocks.get(&linear)
        else {
            return Err(RecompilerError::EmptyBlock.into());
        };
        Ok(exec::execute_block(cpu, &cached.block, rep_mode)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_386::FlatCpu;

    #[test]
    fn test_block_stops_at_branch() {
        // mov ax, 1; jmp $+2; mov bx, 2
        let mut cpu = FlatCpu::real_mode(&[0xB8, 0x01, 0x00, 0xEB, 0x00, 0xBB, 0x02, 0x00]);
        let recompiler = Recompiler::default();
        let instructions = recompiler.fetch_block(&mut cpu).unwrap();
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions[1].address, 0x103);
        assert_eq!(cpu.regs.eip, 0x100);
    }

    #[test]
    fn test_block_max_length() {
        let mut cpu = FlatCpu::real_mode(&[0x90; 16]);
        let recompiler = Recompiler::new(4);
        assert_eq!(recompiler.fetch_block(&mut cpu).unwrap().len(), 4);
    }

    #[test]
    fn test_first_instruction_invalid() {
        let mut cpu = FlatCpu::real_mode(&[0x0F, 0xFF]);
        let recompiler = Recompiler::default();
        assert!(matches!(
            recompiler.fetch_block(&mut cpu),
            Err(RecompilerError::DecodeFailed { address: 0x100, .. })
        ));
        assert!(cpu.exceptions.is_empty());
    }

    #[test]
    fn test_later_invalid_instruction_ends_block() {
        let mut cpu = FlatCpu::real_mode(&[0x90, 0x90, 0x0F, 0xFF]);
        let recompiler = Recompiler::default();
        assert_eq!(recompiler.fetch_block(&mut cpu).unwrap().len(), 2);
    }

    #[test]
    fn test_run_caches_blocks() {
        // inc ax; jmp short back to the inc
        let mut cpu = FlatCpu::real_mode(&[0x40, 0xEB, 0xFD]);
        let mut recompiler = Recompiler::default();
        for _ in 0..3 {
            recompiler.run(&mut cpu, RepMode::Batch).unwrap();
        }
        assert_eq!(cpu.regs.get16(Register16::AX), 3);
        assert_eq!(cpu.regs.eip, 0x100);
        let stats = recompiler.stats();
        assert_eq!(stats.blocks_compiled, 1);
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(recompiler.block_count(), 1);
    }

    #[test]
    fn test_invalidate_range() {
        let mut cpu = FlatCpu::real_mode(&[0x90, 0x90, 0xF4]);
        let mut recompiler = Recompiler::default();
        recompiler.run(&mut cpu, RepMode::Batch).unwrap();
        assert_eq!(recompiler.block_count(), 1);
        recompiler.invalidate_range(0x0FF, 1);
        assert_eq!(recompiler.block_count(), 1);
        recompiler.invalidate_range(0x102, 1);
        assert_eq!(recompiler.block_count(), 0);
    }

    #[test]
    fn test_fault_inside_block() {
        // mov bx, 7; mov bl, 0; div bl. BL is committed before the fault
        let mut cpu = FlatCpu::real_mode(&[0xBB, 0x07, 0x00, 0xB3, 0x00, 0xF6, 0xF3]);
        let mut recompiler = Recompiler::default();
        let result = recompiler.run(&mut cpu, RepMode::Batch);
        assert!(matches!(
            result,
            Err(CpuError::ExceptionError(CpuAbort::Exception(Interrupt::DivideError, 0)))
        ));
        assert_eq!(cpu.regs.get16(Register16::BX), 0);
        assert_eq!(cpu.read_physical_u16(0x7FFA), 0x105);
    }
}
