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

    cpu_386::instruction.rs

    The decoded Instruction descriptor and its Intel-syntax Display
    implementation.

*/

use std::fmt::{self, Display, Formatter};

#[cfg(debug_assertions)]
use crate::bytequeue::InstructionBytes;
use crate::{
    cpu_386::{
        modrm::{self, ModRmMode},
        opcodes::{Operand, OperandMode, Operation},
    },
    cpu_common::*,
};

#[derive(Copy, Clone, Debug, Default)]
pub struct Instruction {
    pub operation: Operation,
    pub operands: [Operand; 3],
    pub condition: JumpCondition,
    /// Offset of the first byte within the code segment.
    pub address: u32,
    pub length: u32,
    pub operand_size: OperandSize,
    pub address_size: AddressSize,
    pub segment: Segment,
    pub has_segment_override: bool,
    pub has_lock: bool,
    pub has_rep: bool,
    pub has_repne: bool,
    pub has_modrm: bool,
    pub modrm: u8,
    pub modrm_rm_register: bool,
    pub has_sib: bool,
    pub sib: u8,
    pub immediate: u32,
    pub immediate2: u32,
    /// ModRM displacement, moffs offset, relative branch displacement or far offset,
    /// sign-extended where the encoding is signed.
    pub displacement: u32,
    #[cfg(debug_assertions)]
    pub bytes: InstructionBytes,
}

impl Instruction {
    #[inline(always)]
    pub fn modrm_mod(&self) -> u8 {
        self.modrm >> 6
    }

    #[inline(always)]
    pub fn modrm_reg(&self) -> u8 {
        (self.modrm >> 3) & 7
    }

    #[inline(always)]
    pub fn modrm_rm(&self) -> u8 {
        self.modrm & 7
    }

    /// Offset of the following instruction.
    #[inline(always)]
    pub fn next_eip(&self) -> u32 {
        self.address.wrapping_add(self.length)
    }

    #[inline(always)]
    pub fn address_mask(&self) -> u32 {
        self.address_size.mask()
    }

    #[inline(always)]
    pub fn is_rep(&self) -> bool {
        self.has_rep && self.operation.is_string()
    }

    /// True if the operand addresses memory rather than a register or constant.
    pub fn is_memory_operand(&self, index: usize) -> bool {
        match self.operands[index].mode {
            OperandMode::ModRmRm => !self.modrm_rm_register,
            OperandMode::Memory | OperandMode::RegisterIndirect => true,
            _ => false,
        }
    }

    /// Number of operands present.
    pub fn operand_count(&self) -> usize {
        self.operands.iter().take_while(|op| op.is_some()).count()
    }

    fn mnemonic(&self) -> String {
        let is_32 = self.operand_size == OperandSize::Size32;
        match self.operation {
            Operation::Jcc if self.condition == JumpCondition::CXZero => match self.address_size {
                AddressSize::Addr16 => "jcxz".to_string(),
                AddressSize::Addr32 => "jecxz".to_string(),
            },
            Operation::Jcc | Operation::SetCc | Operation::CmovCc => {
                format!("{}{}", self.operation, self.condition.suffix())
            }
            Operation::Loop => match self.condition {
                JumpCondition::Equal => "loope".to_string(),
                JumpCondition::NotEqual => "loopne".to_string(),
                _ => "loop".to_string(),
            },
            Operation::Lxs => format!("l{}", SEGMENT_NAMES[self.operands[0].data as usize % SEGMENT_COUNT]),
            Operation::Cbw if is_32 => "cwde".to_string(),
            Operation::Cwd if is_32 => "cdq".to_string(),
            Operation::Pusha | Operation::Popa | Operation::Pushf | Operation::Popf | Operation::Iret if is_32 => {
                format!("{}d", self.operation)
            }
            op if op.is_string() => {
                let suffix = match self.operands[0].size.resolve(self.operand_size) {
                    OperandSize::Size8 => "b",
                    OperandSize::Size16 => "w",
                    _ => "d",
                };
                format!("{}{}", op, suffix)
            }
            op => op.to_string(),
        }
    }

    fn prefix(&self) -> Option<&'static str> {
        if self.has_lock {
            return Some("lock");
        }
        if !self.is_rep() {
            return None;
        }
        match self.operation {
            Operation::Cmps | Operation::Scas if self.has_repne => Some("repne"),
            Operation::Cmps | Operation::Scas => Some("repe"),
            _ => Some("rep"),
        }
    }

    fn register_name(size: OperandSize, index: u8) -> &'static str {
        let index = (index & 7) as usize;
        match size {
            OperandSize::Size8 => REGISTER8_NAMES[index],
            OperandSize::Size16 => REGISTER16_NAMES[index],
            _ => REGISTER32_NAMES[index],
        }
    }

    fn ptr_prefix(size: OperandSize) -> &'static str {
        match size {
            OperandSize::Size8 => "byte ptr ",
            OperandSize::Size16 => "word ptr ",
            OperandSize::Size32 => "dword ptr ",
            OperandSize::Size64 => "qword ptr ",
            OperandSize::Size80 => "tbyte ptr ",
            OperandSize::Native => "",
        }
    }

    fn segment_name(&self) -> &'static str {
        SEGMENT_NAMES[self.segment as usize]
    }

    fn modrm_memory_string(&self) -> String {
        let entry = modrm::modrm_address(self.address_size, self.modrm);
        let names: &[&str; 8] = match self.address_size {
            AddressSize::Addr16 => &REGISTER16_NAMES,
            AddressSize::Addr32 => &REGISTER32_NAMES,
        };
        let mut terms: Vec<String> = Vec::new();
        match entry.mode {
            ModRmMode::Indirect | ModRmMode::Indexed => terms.push(names[entry.base as usize].to_string()),
            ModRmMode::BasedIndexed | ModRmMode::BasedIndexedDisplacement => {
                terms.push(names[entry.base as usize].to_string());
                terms.push(names[entry.index as usize].to_string());
            }
            ModRmMode::Sib => {
                if modrm::sib_has_base(self.modrm, self.sib) {
                    terms.push(names[modrm::sib_base(self.sib) as usize].to_string());
                }
                if modrm::sib_has_index(self.sib) {
                    let index = names[modrm::sib_index(self.sib) as usize];
                    match modrm::sib_scale(self.sib) {
                        0 => terms.push(index.to_string()),
                        scale => terms.push(format!("{}*{}", index, 1 << scale)),
                    }
                }
            }
            ModRmMode::Direct | ModRmMode::Register => {}
        }

        let has_displacement = match entry.mode {
            ModRmMode::Sib => entry.displacement_size > 0 || !modrm::sib_has_base(self.modrm, self.sib),
            _ => entry.displacement_size > 0,
        };

        let mut address = terms.join("+");
        if has_displacement {
            let disp = self.displacement & self.address_mask();
            if terms.is_empty() {
                address = format!("{:X}h", disp);
            }
            else if (self.displacement as i32) < 0 {
                address.push_str(&format!("-{:X}h", (self.displacement as i32).unsigned_abs() & self.address_mask()));
            }
            else {
                address.push_str(&format!("+{:X}h", disp));
            }
        }
        format!("{}:[{}]", self.segment_name(), address)
    }

    fn operand_to_string(&self, op: &Operand) -> String {
        let size = op.size.resolve(self.operand_size);
        match op.mode {
            OperandMode::None => String::new(),
            OperandMode::Constant => format!("{}", op.data),
            OperandMode::Register => Self::register_name(size, op.data).to_string(),
            OperandMode::SegmentRegister => SEGMENT_NAMES[op.data as usize % SEGMENT_COUNT].to_string(),
            OperandMode::FpuRegister => format!("st({})", op.data),
            OperandMode::Immediate => format!("{:X}h", self.immediate),
            OperandMode::Immediate2 => format!("{:X}h", self.immediate2),
            OperandMode::Relative => {
                let target = self.next_eip().wrapping_add(self.displacement);
                match self.operand_size {
                    OperandSize::Size32 => format!("{:08X}h", target),
                    _ => format!("{:04X}h", target & 0xFFFF),
                }
            }
            OperandMode::Memory => format!(
                "{}{}:[{:X}h]",
                Self::ptr_prefix(size),
                self.segment_name(),
                self.displacement
            ),
            OperandMode::FarAddress => format!("{:04X}h:{:X}h", self.immediate as u16, self.displacement),
            OperandMode::RegisterIndirect => {
                let names: &[&str; 8] = match self.address_size {
                    AddressSize::Addr16 => &REGISTER16_NAMES,
                    AddressSize::Addr32 => &REGISTER32_NAMES,
                };
                // Destination strings are always in ES
                let segment = if op.data == 7 { "es" } else { self.segment_name() };
                format!("{}{}:[{}]", Self::ptr_prefix(size), segment, names[op.data as usize & 7])
            }
            OperandMode::ModRmReg => Self::register_name(size, self.modrm_reg()).to_string(),
            OperandMode::ModRmRm if self.modrm_rm_register => Self::register_name(size, self.modrm_rm()).to_string(),
            OperandMode::ModRmRm => format!("{}{}", Self::ptr_prefix(size), self.modrm_memory_string()),
            OperandMode::ModRmSegmentReg => SEGMENT_NAMES
                .get(self.modrm_reg() as usize)
                .copied()
                .unwrap_or("?s")
                .to_string(),
            OperandMode::ModRmControlReg => format!("cr{}", self.modrm_reg()),
            OperandMode::ModRmDebugReg => format!("dr{}", self.modrm_reg()),
            OperandMode::ModRmTestReg => format!("tr{}", self.modrm_reg()),
        }
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut instruction_string = String::new();

        if let Some(prefix) = self.prefix() {
            instruction_string.push_str(prefix);
            instruction_string.push(' ');
        }
        instruction_string.push_str(&self.mnemonic());

        // String operations spell out their operands in the mnemonic.
        if self.operation.is_string() {
            return write!(f, "{}", instruction_string);
        }

        let operands: Vec<String> = self
            .operands
            .iter()
            .filter(|op| op.is_some())
            .map(|op| self.operand_to_string(op))
            .collect();

        if !operands.is_empty() {
            instruction_string.push(' ');
            instruction_string.push_str(&operands.join(", "));
        }
        write!(f, "{}", instruction_string)
    }
}
