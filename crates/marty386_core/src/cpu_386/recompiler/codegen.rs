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

    cpu_386::recompiler::codegen.rs

    Block code generation.

    Translates a run of decoded instructions into HostOp lists. NOP, LEA and
    register or immediate MOV are translated directly. Every other
    instruction is compiled as a call into the interpreter, preceded by a
    sync of the deferred EIP and cycle counters and a flush of the register
    cache.

    EIP, current_eip and the cycle counter are not updated per instruction.
    The generator accumulates the pending adds and emits them only where the
    register file has to be exact: before an interpreter call and at the end
    of the block.

*/

use std::fmt::{self, Display, Formatter};

use crate::{
    cpu_386::{
        instruction::Instruction,
        modrm::{self, ModRmMode},
        opcodes::{OperandMode, Operation},
        recompiler::{regcache::RegisterCache, RecompilerError},
    },
    cpu_common::*,
};

/// A host register. The IR executor keeps these in a plain array.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostReg(pub u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RegWidth {
    Byte = 0,
    Word = 1,
    Dword = 2,
}

impl RegWidth {
    pub fn from_size(size: OperandSize) -> Option<RegWidth> {
        match size {
            OperandSize::Size8 => Some(RegWidth::Byte),
            OperandSize::Size16 => Some(RegWidth::Word),
            OperandSize::Size32 => Some(RegWidth::Dword),
            _ => None,
        }
    }

    pub fn mask(&self) -> u32 {
        match self {
            RegWidth::Byte => 0xFF,
            RegWidth::Word => 0xFFFF,
            RegWidth::Dword => 0xFFFF_FFFF,
        }
    }
}

/// A guest general purpose register at a given width. Byte registers 4 to 7 are AH to BH.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GuestReg {
    pub width: RegWidth,
    pub index: u8,
}

impl GuestReg {
    pub const fn new(width: RegWidth, index: u8) -> Self {
        Self { width, index }
    }
}

impl Display for GuestReg {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let index = (self.index & 0x07) as usize;
        let name = match self.width {
            RegWidth::Byte => REGISTER8_NAMES[index],
            RegWidth::Word => REGISTER16_NAMES[index],
            RegWidth::Dword => REGISTER32_NAMES[index],
        };
        write!(f, "{}", name)
    }
}

/// Register file fields the generated code adjusts directly.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CpuField {
    Eip,
    CurrentEip,
    Cycles,
}

/// One host-level operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostOp {
    LoadGuest { dst: HostReg, guest: GuestReg },
    StoreGuest { src: HostReg, guest: GuestReg },
    StoreGuestConstant { guest: GuestReg, value: u32 },
    Move { dst: HostReg, src: HostReg },
    MaterializeConstant { dst: HostReg, value: u32 },
    /// dst += src << shift
    Add { dst: HostReg, src: HostReg, shift: u8 },
    AddConstant { dst: HostReg, value: u32 },
    And { dst: HostReg, mask: u32 },
    AddCpuField { field: CpuField, value: u32 },
    /// Run the block's instruction at `index` through the interpreter. `cycles` are added when
    /// it completes.
    CallInterpreter { index: usize, cycles: u32 },
}

impl Display for HostOp {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            HostOp::LoadGuest { dst, guest } => write!(f, "load    h{}, {}", dst.0, guest),
            HostOp::StoreGuest { src, guest } => write!(f, "store   {}, h{}", guest, src.0),
            HostOp::StoreGuestConstant { guest, value } => write!(f, "store   {}, {:X}h", guest, value),
            HostOp::Move { dst, src } => write!(f, "mov     h{}, h{}", dst.0, src.0),
            HostOp::MaterializeConstant { dst, value } => write!(f, "mov     h{}, {:X}h", dst.0, value),
            HostOp::Add { dst, src, shift: 0 } => write!(f, "add     h{}, h{}", dst.0, src.0),
            HostOp::Add { dst, src, shift } => write!(f, "add     h{}, h{}<<{}", dst.0, src.0, shift),
            HostOp::AddConstant { dst, value } => write!(f, "add     h{}, {:X}h", dst.0, value),
            HostOp::And { dst, mask } => write!(f, "and     h{}, {:X}h", dst.0, mask),
            HostOp::AddCpuField { field, value } => write!(f, "add     [{:?}], {:X}h", field, value),
            HostOp::CallInterpreter { index, .. } => write!(f, "call    interpreter #{}", index),
        }
    }
}

/// A compiled block: the instructions it was built from and the host operations that run them.
#[derive(Clone, Debug)]
pub struct Block {
    /// Offset of the first instruction in the code segment.
    pub start_eip: u32,
    pub instructions: Vec<Instruction>,
    pub ops: Vec<HostOp>,
    /// Total length in bytes of the instructions.
    pub length: u32,
    /// Instructions translated without an interpreter call.
    pub native_count: usize,
}

pub struct CodeGenerator {
    cache: RegisterCache,
    ops: Vec<HostOp>,
    delayed_eip_add: u32,
    delayed_current_eip_add: u32,
    delayed_cycles: u32,
    previous_length: u32,
    native_count: usize,
}

impl CodeGenerator {
    pub fn new(host_registers: usize) -> Self {
        Self {
            cache: RegisterCache::new(host_registers),
            ops: Vec::new(),
            delayed_eip_add: 0,
            delayed_current_eip_add: 0,
            delayed_cycles: 0,
            previous_length: 0,
            native_count: 0,
        }
    }

    /// Compile a run of instructions. The block is entered with EIP and current_eip both
    /// pointing at the first instruction.
    pub fn compile_block(mut self, instructions: Vec<Instruction>) -> Result<Block, RecompilerError> {
        let Some(first) = instructions.first()
        else {
            return Err(RecompilerError::EmptyBlock);
        };
        let start_eip = first.address;

        for (index, instr) in instructions.iter().enumerate() {
            self.begin_instruction(instr);
            if !self.compile_native(instr)? {
                self.compile_fallback(index);
            }
        }
        self.cache.flush_all(&mut self.ops, true);
        self.emit_deferred();

        let length = instructions.iter().map(|i| i.length).sum();
        Ok(Block {
            start_eip,
            instructions,
            ops: self.ops,
            length,
            native_count: self.native_count,
        })
    }

    fn begin_instruction(&mut self, instr: &Instruction) {
        self.cache.begin_instruction();
        // current_eip tracks the instruction being compiled, EIP the one after it
        self.delayed_current_eip_add = self.delayed_current_eip_add.wrapping_add(self.previous_length);
        self.delayed_eip_add = self.delayed_eip_add.wrapping_add(instr.length);
        self.previous_length = instr.length;
    }

    /// Emit the pending EIP, current_eip and cycle adds.
    fn emit_deferred(&mut self) {
        let pending = [
            (CpuField::Eip, self.delayed_eip_add),
            (CpuField::CurrentEip, self.delayed_current_eip_add),
            (CpuField::Cycles, self.delayed_cycles),
        ];
        for (field, value) in pending {
            if value != 0 {
                self.ops.push(HostOp::AddCpuField { field, value });
            }
        }
        self.delayed_eip_add = 0;
        self.delayed_current_eip_add = 0;
        self.delayed_cycles = 0;
    }

    fn compile_fallback(&mut self, index: usize) {
        self.emit_deferred();
        self.cache.flush_all(&mut self.ops, true);
        self.ops.push(HostOp::CallInterpreter { index, cycles: 1 });
        // The interpreter leaves current_eip on this instruction and EIP after it. ESP and
        // everything else are reloaded from the register file on next use.
    }

    /// Returns false if the instruction has no native translation.
    fn compile_native(&mut self, instr: &Instruction) -> Result<bool, RecompilerError> {
        if instr.has_lock {
            return Ok(false);
        }
        let handled = match instr.operation {
            Operation::Nop => true,
            Operation::Mov => self.compile_mov(instr)?,
            Operation::Lea => self.compile_lea(instr)?,
            _ => false,
        };
        if handled {
            self.delayed_cycles += 1;
            self.native_count += 1;
        }
        Ok(handled)
    }

    fn register_operand(instr: &Instruction, index: usize) -> Option<GuestReg> {
        let operand = instr.operands[index];
        let width = RegWidth::from_size(operand.size)?;
        let reg = match operand.mode {
            OperandMode::Register => operand.data,
            OperandMode::ModRmReg => instr.modrm_reg(),
            OperandMode::ModRmRm if instr.modrm_rm_register => instr.modrm_rm(),
            _ => return None,
        };
        Some(GuestReg::new(width, reg))
    }

    /// MOV reg, reg and MOV reg, imm.
    fn compile_mov(&mut self, instr: &Instruction) -> Result<bool, RecompilerError> {
        let Some(dst) = Self::register_operand(instr, 0)
        else {
            return Ok(false);
        };
        if instr.operands[1].mode == OperandMode::Immediate {
            self.cache.write_constant(&mut self.ops, dst, instr.immediate);
            return Ok(true);
        }
        let Some(src) = Self::register_operand(instr, 1)
        else {
            return Ok(false);
        };
        let entry = self.cache.entry(src);
        if entry.flags.valid() && entry.flags.constant() && !entry.flags.in_host_register() {
            let value = entry.constant;
            self.cache.write_constant(&mut self.ops, dst, value);
            return Ok(true);
        }
        let value = self.cache.read(&mut self.ops, src)?;
        let copy = self.cache.alloc_scratch(&mut self.ops)?;
        self.ops.push(HostOp::Move { dst: copy, src: value });
        self.cache.write(&mut self.ops, dst, copy);
        Ok(true)
    }

    /// LEA computes its address without touching memory.
    fn compile_lea(&mut self, instr: &Instruction) -> Result<bool, RecompilerError> {
        let Some(dst) = Self::register_operand(instr, 0)
        else {
            return Ok(false);
        };
        if instr.modrm_rm_register || dst.width == RegWidth::Byte {
            return Ok(false);
        }
        let address_width = match instr.address_size {
            AddressSize::Addr16 => RegWidth::Word,
            AddressSize::Addr32 => RegWidth::Dword,
        };
        let entry = modrm::modrm_address(instr.address_size, instr.modrm);
        let disp = instr.displacement;
        let ea = self.cache.alloc_scratch(&mut self.ops)?;

        match entry.mode {
            ModRmMode::Direct => {
                self.ops.push(HostOp::MaterializeConstant { dst: ea, value: disp });
            }
            ModRmMode::Indirect | ModRmMode::Indexed => {
                self.load_term(ea, GuestReg::new(address_width, entry.base))?;
            }
            ModRmMode::BasedIndexed | ModRmMode::BasedIndexedDisplacement => {
                self.load_term(ea, GuestReg::new(address_width, entry.base))?;
                self.add_term(ea, GuestReg::new(address_width, entry.index), 0)?;
            }
            ModRmMode::Sib => {
                let sib = instr.sib;
                if modrm::sib_has_base(instr.modrm, sib) {
                    self.load_term(ea, GuestReg::new(RegWidth::Dword, modrm::sib_base(sib)))?;
                }
                else {
                    self.ops.push(HostOp::MaterializeConstant { dst: ea, value: 0 });
                }
                if modrm::sib_has_index(sib) {
                    let index = GuestReg::new(RegWidth::Dword, modrm::sib_index(sib));
                    self.add_term(ea, index, modrm::sib_scale(sib))?;
                }
            }
            ModRmMode::Register => {
                self.cache.release_scratch(ea);
                return Ok(false);
            }
        }
        if entry.mode != ModRmMode::Direct && disp != 0 {
            self.ops.push(HostOp::AddConstant { dst: ea, value: disp });
        }
        let mask = instr.address_size.mask() & dst.width.mask();
        if mask != 0xFFFF_FFFF {
            self.ops.push(HostOp::And { dst: ea, mask });
        }
        self.cache.write(&mut self.ops, dst, ea);
        Ok(true)
    }

    /// ea = reg, folding a known constant.
    fn load_term(&mut self, ea: HostReg, reg: GuestReg) -> Result<(), RecompilerError> {
        let entry = self.cache.entry(reg);
        if entry.flags.valid() && entry.flags.constant() && !entry.flags.in_host_register() {
            self.ops.push(HostOp::MaterializeConstant {
                dst:   ea,
                value: entry.constant,
            });
            return Ok(());
        }
        let src = self.cache.read(&mut self.ops, reg)?;
        self.ops.push(HostOp::Move { dst: ea, src });
        Ok(())
    }

    /// ea += reg << shift, folding a known constant.
    fn add_term(&mut self, ea: HostReg, reg: GuestReg, shift: u8) -> Result<(), RecompilerError> {
        let entry = self.cache.entry(reg);
        if entry.flags.valid() && entry.flags.constant() && !entry.flags.in_host_register() {
            let value = entry.constant << shift;
            if value != 0 {
                self.ops.push(HostOp::AddConstant { dst: ea, value });
            }
            return Ok(());
        }
        let src = self.cache.read(&mut self.ops, reg)?;
        self.ops.push(HostOp::Add { dst: ea, src, shift });
        Ok(())
    }
}

/// True if no instruction may follow this one in the same block.
pub fn ends_block(instr: &Instruction) -> bool {
    if instr.operation.is_branch() {
        return true;
    }
    if instr.operation.is_string() && instr.has_rep {
        // REP may yield with EIP rewound
        return true;
    }
    match instr.operation {
        Operation::MovSreg => instr.operands[0].mode == OperandMode::ModRmSegmentReg,
        Operation::PopSreg
        | Operation::Lxs
        | Operation::Cli
        | Operation::Sti
        | Operation::Popf
        | Operation::Clts
        | Operation::Lgdt
        | Operation::Lidt
        | Operation::Lldt
        | Operation::Ltr
        | Operation::Lmsw
        | Operation::MovCr
        | Operation::MovDr
        | Operation::MovTr
        | Operation::Invd
        | Operation::Wbinvd
        | Operation::Invlpg
        | Operation::Loadall286
        | Operation::Esc
        | Operation::Wait => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_386::decode_slice;

    fn decode_run(code: &[u8], address_size: AddressSize, operand_size: OperandSize) -> Vec<Instruction> {
        let mut instructions = Vec::new();
        let mut offset = 0;
        while offset < code.len() {
            let mut instr = decode_slice(&code[offset..], address_size, operand_size).unwrap();
            instr.address = 0x100 + offset as u32;
            offset += instr.length as usize;
            instructions.push(instr);
        }
        instructions
    }

    fn compile(code: &[u8]) -> Block {
        let instructions = decode_run(code, AddressSize::Addr16, OperandSize::Size16);
        CodeGenerator::new(6).compile_block(instructions).unwrap()
    }

    #[test]
    fn test_empty_block() {
        assert!(matches!(
            CodeGenerator::new(6).compile_block(Vec::new()),
            Err(RecompilerError::EmptyBlock)
        ));
    }

    #[test]
    fn test_native_only_defers_everything() {
        // nop; mov ax, 1234h; mov bx, ax
        let block = compile(&[0x90, 0xB8, 0x34, 0x12, 0x89, 0xC3]);
        assert_eq!(block.native_count, 3);
        assert_eq!(block.length, 6);
        let ax = GuestReg::new(RegWidth::Word, 0);
        let bx = GuestReg::new(RegWidth::Word, 3);
        assert_eq!(
            block.ops,
            vec![
                HostOp::StoreGuestConstant { guest: ax, value: 0x1234 },
                HostOp::StoreGuestConstant { guest: bx, value: 0x1234 },
                HostOp::AddCpuField { field: CpuField::Eip, value: 6 },
                HostOp::AddCpuField { field: CpuField::CurrentEip, value: 4 },
                HostOp::AddCpuField { field: CpuField::Cycles, value: 3 },
            ]
        );
    }

    #[test]
    fn test_fallback_syncs_first() {
        // nop; inc ax
        let block = compile(&[0x90, 0x40]);
        assert_eq!(block.native_count, 1);
        assert_eq!(
            block.ops,
            vec![
                HostOp::AddCpuField { field: CpuField::Eip, value: 2 },
                HostOp::AddCpuField { field: CpuField::CurrentEip, value: 1 },
                HostOp::AddCpuField { field: CpuField::Cycles, value: 1 },
                HostOp::CallInterpreter { index: 1, cycles: 1 },
            ]
        );
    }

    #[test]
    fn test_dirty_registers_flushed_before_call() {
        // mov cx, 5; inc cx
        let block = compile(&[0xB9, 0x05, 0x00, 0x41]);
        let cx = GuestReg::new(RegWidth::Word, 1);
        let store = block
            .ops
            .iter()
            .position(|op| *op == HostOp::StoreGuestConstant { guest: cx, value: 5 });
        let call = block.ops.iter().position(|op| matches!(op, HostOp::CallInterpreter { .. }));
        assert!(store.is_some());
        assert!(store < call);
    }

    #[test]
    fn test_lea_based_indexed() {
        // lea ax, [bx+si+10h]
        let block = compile(&[0x8D, 0x40, 0x10]);
        assert_eq!(block.native_count, 1);
        assert!(block.ops.contains(&HostOp::AddConstant { dst: HostReg(0), value: 0x10 }));
        assert!(block.ops.contains(&HostOp::And { dst: HostReg(0), mask: 0xFFFF }));
        assert!(block.ops.contains(&HostOp::StoreGuest {
            src:   HostReg(0),
            guest: GuestReg::new(RegWidth::Word, 0),
        }));
    }

    #[test]
    fn test_lea_with_known_registers_folds() {
        // mov ebx, 100h; lea eax, [ebx+ebx*2+4]
        let instructions = decode_run(
            &[0xBB, 0x00, 0x01, 0x00, 0x00, 0x8D, 0x44, 0x5B, 0x04],
            AddressSize::Addr32,
            OperandSize::Size32,
        );
        let block = CodeGenerator::new(6).compile_block(instructions).unwrap();
        assert_eq!(block.native_count, 2);
        assert_eq!(block.ops[0], HostOp::MaterializeConstant { dst: HostReg(0), value: 0x100 });
        assert_eq!(block.ops[1], HostOp::AddConstant { dst: HostReg(0), value: 0x200 });
        assert_eq!(block.ops[2], HostOp::AddConstant { dst: HostReg(0), value: 4 });
    }

    #[test]
    fn test_memory_mov_falls_back() {
        // mov [bx], ax
        let block = compile(&[0x89, 0x07]);
        assert_eq!(block.native_count, 0);
        assert!(block.ops.iter().any(|op| matches!(op, HostOp::CallInterpreter { index: 0, .. })));
    }

    #[test]
    fn test_ends_block() {
        let jmp = decode_slice(&[0xEB, 0x00], AddressSize::Addr16, OperandSize::Size16).unwrap();
        let mov_ds = decode_slice(&[0x8E, 0xD8], AddressSize::Addr16, OperandSize::Size16).unwrap();
        let mov_ax_ds = decode_slice(&[0x8C, 0xD8], AddressSize::Addr16, OperandSize::Size16).unwrap();
        let rep_movsb = decode_slice(&[0xF3, 0xA4], AddressSize::Addr16, OperandSize::Size16).unwrap();
        let movsb = decode_slice(&[0xA4], AddressSize::Addr16, OperandSize::Size16).unwrap();
        assert!(ends_block(&jmp));
        assert!(ends_block(&mov_ds));
        assert!(!ends_block(&mov_ax_ds));
        assert!(ends_block(&rep_movsb));
        assert!(!ends_block(&movsb));
    }
}
