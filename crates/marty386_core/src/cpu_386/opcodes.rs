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

    cpu_386::opcodes.rs

    Opcode tables for the 386/486 decoder.

    Every table lives in a single arena built once at startup. Extension
    entries refer to their child table by TableId, so the decoder can walk from
    the base table through the 0F table, the ModRM group tables and the x87
    escape tables without pointers.

*/

#![allow(non_upper_case_globals)]

use lazy_static::lazy_static;
use strum_macros::Display;

use crate::cpu_common::{JumpCondition, OperandSize, Segment};

/// Operation performed by an instruction. Prefixes and table extensions are operations too,
/// since the decoder discovers them by table lookup.
#[derive(Copy, Clone, Debug, Default, Display, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    #[default]
    Invalid,
    Extension,
    ExtensionModRmReg,
    ExtensionModRmX87,
    SegmentPrefix,
    LockPrefix,
    RepPrefix,
    RepNePrefix,
    OperandSizePrefix,
    AddressSizePrefix,

    Aaa,
    Aad,
    Aam,
    Aas,
    Adc,
    Add,
    And,
    Arpl,
    Bound,
    Bsf,
    Bsr,
    Bswap,
    Bt,
    Btc,
    Btr,
    Bts,
    #[strum(serialize = "call")]
    CallNear,
    #[strum(serialize = "call far")]
    CallFar,
    Cbw,
    Clc,
    Cld,
    Cli,
    Clts,
    Cmc,
    #[strum(serialize = "cmov")]
    CmovCc,
    Cmp,
    Cmps,
    Cmpxchg,
    Cpuid,
    Cwd,
    Daa,
    Das,
    Dec,
    Div,
    Enter,
    Esc,
    Hlt,
    Idiv,
    Imul,
    In,
    Inc,
    Ins,
    Int,
    Into,
    Invd,
    Invlpg,
    Iret,
    #[strum(serialize = "j")]
    Jcc,
    #[strum(serialize = "jmp")]
    JmpNear,
    #[strum(serialize = "jmp far")]
    JmpFar,
    Lahf,
    Lar,
    Lea,
    Leave,
    Lgdt,
    Lidt,
    Lldt,
    Lmsw,
    #[strum(serialize = "loadall")]
    Loadall286,
    Lods,
    Loop,
    Lsl,
    Ltr,
    /// LDS, LES, LSS, LFS and LGS. The segment is the first operand.
    Lxs,
    Mov,
    #[strum(serialize = "mov")]
    MovSreg,
    #[strum(serialize = "mov")]
    MovCr,
    #[strum(serialize = "mov")]
    MovDr,
    #[strum(serialize = "mov")]
    MovTr,
    Movs,
    Movsx,
    Movzx,
    Mul,
    Neg,
    Nop,
    Not,
    Or,
    Out,
    Outs,
    Pop,
    Popa,
    Popf,
    #[strum(serialize = "pop")]
    PopSreg,
    Push,
    Pusha,
    Pushf,
    #[strum(serialize = "push")]
    PushSreg,
    Rcl,
    Rcr,
    Rdtsc,
    #[strum(serialize = "ret")]
    RetNear,
    #[strum(serialize = "retf")]
    RetFar,
    Rol,
    Ror,
    Sahf,
    Salc,
    Sar,
    Sbb,
    Scas,
    #[strum(serialize = "set")]
    SetCc,
    Sgdt,
    Shl,
    Shld,
    Shr,
    Shrd,
    Sidt,
    Sldt,
    Smsw,
    Stc,
    Std,
    Sti,
    Stos,
    Str,
    Sub,
    Test,
    Verr,
    Verw,
    Wait,
    Wbinvd,
    Xadd,
    Xchg,
    Xlat,
    Xor,

    // x87
    F2xm1,
    Fabs,
    Fadd,
    Faddp,
    Fbld,
    Fbstp,
    Fchs,
    Fcom,
    Fcomp,
    Fcompp,
    Fcos,
    Fdecstp,
    Fdisi,
    Fdiv,
    Fdivp,
    Fdivr,
    Fdivrp,
    Feni,
    Ffree,
    Fiadd,
    Ficom,
    Ficomp,
    Fidiv,
    Fidivr,
    Fild,
    Fimul,
    Fincstp,
    Fist,
    Fistp,
    Fisub,
    Fisubr,
    Fld,
    Fld1,
    Fldcw,
    Fldenv,
    Fldl2e,
    Fldl2t,
    Fldlg2,
    Fldln2,
    Fldpi,
    Fldz,
    Fmul,
    Fmulp,
    Fnclex,
    Fninit,
    Fnop,
    Fnsave,
    Fnstcw,
    Fnstenv,
    Fnstsw,
    Fpatan,
    Fprem,
    Fprem1,
    Fptan,
    Frndint,
    Frstor,
    Fscale,
    Fsetpm,
    Fsin,
    Fsincos,
    Fsqrt,
    Fst,
    Fstp,
    Fsub,
    Fsubp,
    Fsubr,
    Fsubrp,
    Ftst,
    Fucom,
    Fucomp,
    Fucompp,
    Fxam,
    Fxch,
    Fxtract,
    Fyl2x,
    Fyl2xp1,
}

impl Operation {
    pub fn is_prefix(&self) -> bool {
        matches!(
            self,
            Operation::SegmentPrefix
                | Operation::LockPrefix
                | Operation::RepPrefix
                | Operation::RepNePrefix
                | Operation::OperandSizePrefix
                | Operation::AddressSizePrefix
        )
    }

    /// x87 operations are declared last, so they sort after everything else.
    pub fn is_x87(&self) -> bool {
        *self >= Operation::F2xm1
    }

    /// String operations, which honor REP prefixes.
    pub fn is_string(&self) -> bool {
        matches!(
            self,
            Operation::Movs
                | Operation::Cmps
                | Operation::Scas
                | Operation::Lods
                | Operation::Stos
                | Operation::Ins
                | Operation::Outs
        )
    }

    /// Operations that may redirect EIP somewhere other than the next instruction.
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            Operation::CallNear
                | Operation::CallFar
                | Operation::Jcc
                | Operation::JmpNear
                | Operation::JmpFar
                | Operation::Loop
                | Operation::RetNear
                | Operation::RetFar
                | Operation::Int
                | Operation::Into
                | Operation::Iret
                | Operation::Bound
                | Operation::Hlt
        )
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum OperandMode {
    #[default]
    None,
    Constant,
    /// General register named by the template.
    Register,
    SegmentRegister,
    /// ST(n), relative to the top of the FPU stack.
    FpuRegister,
    Immediate,
    /// The second immediate of ENTER.
    Immediate2,
    /// Relative branch displacement.
    Relative,
    /// Direct memory offset (moffs), no ModRM byte.
    Memory,
    /// ptr16:16 or ptr16:32.
    FarAddress,
    /// ES:EDI or DS:ESI, used by string ops.
    RegisterIndirect,
    ModRmReg,
    ModRmRm,
    ModRmSegmentReg,
    ModRmControlReg,
    ModRmDebugReg,
    ModRmTestReg,
}

/// An operand descriptor. In a table entry this is a template; after decoding `size` has been
/// resolved against the instruction's operand size.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Operand {
    pub size: OperandSize,
    pub mode: OperandMode,
    /// Register index, segment index, FPU stack index or constant value, depending on mode.
    pub data: u8,
}

impl Operand {
    pub const NONE: Operand = Operand::new(OperandSize::Native, OperandMode::None, 0);

    pub const fn new(size: OperandSize, mode: OperandMode, data: u8) -> Self {
        Self { size, mode, data }
    }

    #[inline(always)]
    pub fn is_none(&self) -> bool {
        matches!(self.mode, OperandMode::None)
    }

    #[inline(always)]
    pub fn is_some(&self) -> bool {
        !self.is_none()
    }
}

// Operand templates, named after the Intel manual's operand notation.
mod ot {
    use super::*;
    use OperandMode as Mode;
    use OperandSize as Size;

    pub const Eb: Operand = Operand::new(Size::Size8, Mode::ModRmRm, 0);
    pub const Ew: Operand = Operand::new(Size::Size16, Mode::ModRmRm, 0);
    pub const Ev: Operand = Operand::new(Size::Native, Mode::ModRmRm, 0);
    pub const Rd: Operand = Operand::new(Size::Size32, Mode::ModRmRm, 0);
    pub const M: Operand = Operand::new(Size::Native, Mode::ModRmRm, 0);
    pub const Mp: Operand = Operand::new(Size::Native, Mode::ModRmRm, 0);
    pub const Ma: Operand = Operand::new(Size::Native, Mode::ModRmRm, 0);
    pub const Ms: Operand = Operand::new(Size::Size16, Mode::ModRmRm, 0);
    pub const Mw: Operand = Operand::new(Size::Size16, Mode::ModRmRm, 0);
    pub const Md: Operand = Operand::new(Size::Size32, Mode::ModRmRm, 0);
    pub const Mq: Operand = Operand::new(Size::Size64, Mode::ModRmRm, 0);
    pub const Mt: Operand = Operand::new(Size::Size80, Mode::ModRmRm, 0);
    pub const Gb: Operand = Operand::new(Size::Size8, Mode::ModRmReg, 0);
    pub const Gw: Operand = Operand::new(Size::Size16, Mode::ModRmReg, 0);
    pub const Gv: Operand = Operand::new(Size::Native, Mode::ModRmReg, 0);
    pub const Sw: Operand = Operand::new(Size::Size16, Mode::ModRmSegmentReg, 0);
    pub const Cd: Operand = Operand::new(Size::Size32, Mode::ModRmControlReg, 0);
    pub const Dd: Operand = Operand::new(Size::Size32, Mode::ModRmDebugReg, 0);
    pub const Td: Operand = Operand::new(Size::Size32, Mode::ModRmTestReg, 0);
    pub const Ib: Operand = Operand::new(Size::Size8, Mode::Immediate, 0);
    pub const Iw: Operand = Operand::new(Size::Size16, Mode::Immediate, 0);
    pub const Iv: Operand = Operand::new(Size::Native, Mode::Immediate, 0);
    pub const Ib2: Operand = Operand::new(Size::Size8, Mode::Immediate2, 0);
    pub const Jb: Operand = Operand::new(Size::Size8, Mode::Relative, 0);
    pub const Jv: Operand = Operand::new(Size::Native, Mode::Relative, 0);
    pub const Ob: Operand = Operand::new(Size::Size8, Mode::Memory, 0);
    pub const Ov: Operand = Operand::new(Size::Native, Mode::Memory, 0);
    pub const Ap: Operand = Operand::new(Size::Native, Mode::FarAddress, 0);
    pub const Xb: Operand = Operand::new(Size::Size8, Mode::RegisterIndirect, 6);
    pub const Xv: Operand = Operand::new(Size::Native, Mode::RegisterIndirect, 6);
    pub const Yb: Operand = Operand::new(Size::Size8, Mode::RegisterIndirect, 7);
    pub const Yv: Operand = Operand::new(Size::Native, Mode::RegisterIndirect, 7);

    pub const AL: Operand = Operand::new(Size::Size8, Mode::Register, 0);
    pub const CL: Operand = Operand::new(Size::Size8, Mode::Register, 1);
    pub const AX: Operand = Operand::new(Size::Size16, Mode::Register, 0);
    pub const DX: Operand = Operand::new(Size::Size16, Mode::Register, 2);
    pub const eAX: Operand = Operand::new(Size::Native, Mode::Register, 0);

    pub const fn r8(index: u8) -> Operand {
        Operand::new(Size::Size8, Mode::Register, index)
    }
    pub const fn r32(index: u8) -> Operand {
        Operand::new(Size::Size32, Mode::Register, index)
    }
    pub const fn rv(index: u8) -> Operand {
        Operand::new(Size::Native, Mode::Register, index)
    }
    pub const fn sreg(segment: Segment) -> Operand {
        Operand::new(Size::Size16, Mode::SegmentRegister, segment as u8)
    }
    pub const fn cb(value: u8) -> Operand {
        Operand::new(Size::Size8, Mode::Constant, value)
    }
    pub const fn st(index: u8) -> Operand {
        Operand::new(Size::Size80, Mode::FpuRegister, index)
    }
    pub const ST0: Operand = st(0);
    pub const ST1: Operand = st(1);
}

use ot::*;

/// Identifies a table within the arena.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TableId {
    Base,
    TwoByte,
    Group1,
    Group2,
    Group3Byte,
    Group3Word,
    Group4,
    Group5,
    Group6,
    Group7,
    Group8,
    X87D8,
    X87D9,
    X87DA,
    X87DB,
    X87DC,
    X87DD,
    X87DE,
    X87DF,
}

pub const TABLE_COUNT: usize = 19;
/// x87 tables hold 8 memory forms followed by 64 register forms.
pub const X87_TABLE_SIZE: usize = 8 + 64;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TableEntry {
    pub operation: Operation,
    pub operands: [Operand; 3],
    pub condition: JumpCondition,
    pub next: Option<TableId>,
}

impl TableEntry {
    pub const INVALID: TableEntry = TableEntry {
        operation: Operation::Invalid,
        operands: [Operand::NONE; 3],
        condition: JumpCondition::Always,
        next: None,
    };

    const fn op(operation: Operation, ops: &[Operand]) -> TableEntry {
        let mut operands = [Operand::NONE; 3];
        let mut i = 0;
        while i < ops.len() {
            operands[i] = ops[i];
            i += 1;
        }
        TableEntry {
            operation,
            operands,
            condition: JumpCondition::Always,
            next: None,
        }
    }

    const fn cc(operation: Operation, condition: JumpCondition, ops: &[Operand]) -> TableEntry {
        let mut entry = TableEntry::op(operation, ops);
        entry.condition = condition;
        entry
    }

    const fn ext(operation: Operation, next: TableId, ops: &[Operand]) -> TableEntry {
        let mut entry = TableEntry::op(operation, ops);
        entry.next = Some(next);
        entry
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self.operation, Operation::Invalid)
    }
}

pub struct OpcodeTables {
    tables: Vec<Vec<TableEntry>>,
}

impl OpcodeTables {
    #[inline(always)]
    pub fn table(&self, id: TableId) -> &[TableEntry] {
        &self.tables[id as usize]
    }

    #[inline(always)]
    pub fn lookup(&self, id: TableId, index: usize) -> &TableEntry {
        self.tables[id as usize].get(index).unwrap_or(&TableEntry::INVALID)
    }

    fn build() -> Self {
        let tables = vec![
            base_table(),
            two_byte_table(),
            group1_table(),
            group2_table(),
            group3_table(Ib),
            group3_table(Iv),
            group4_table(),
            group5_table(),
            group6_table(),
            group7_table(),
            group8_table(),
            x87_d8_table(),
            x87_d9_table(),
            x87_da_table(),
            x87_db_table(),
            x87_dc_table(),
            x87_dd_table(),
            x87_de_table(),
            x87_df_table(),
        ];
        debug_assert_eq!(tables.len(), TABLE_COUNT);
        Self { tables }
    }
}

lazy_static! {
    pub static ref OPCODE_TABLES: OpcodeTables = OpcodeTables::build();
}

/// Look up a first opcode byte.
#[inline(always)]
pub fn lookup_base(opcode: u8) -> &'static TableEntry {
    OPCODE_TABLES.lookup(TableId::Base, opcode as usize)
}

macro_rules! inst {
    ($t:ident, $opcode:expr, $op:ident $(, $o:expr)*) => {
        $t[$opcode] = TableEntry::op(Operation::$op, &[$($o),*]);
    };
}

macro_rules! inst_cc {
    ($t:ident, $opcode:expr, $op:ident, $cc:ident $(, $o:expr)*) => {
        $t[$opcode] = TableEntry::cc(Operation::$op, JumpCondition::$cc, &[$($o),*]);
    };
}

macro_rules! inst_ext {
    ($t:ident, $opcode:expr, $op:ident, $next:ident $(, $o:expr)*) => {
        $t[$opcode] = TableEntry::ext(Operation::$op, TableId::$next, &[$($o),*]);
    };
}

/// The six encodings shared by ADD, OR, ADC, SBB, AND, SUB, XOR and CMP.
fn alu_row(t: &mut [TableEntry], base: usize, op: Operation) {
    let forms = [[Eb, Gb], [Ev, Gv], [Gb, Eb], [Gv, Ev], [AL, Ib], [eAX, Iv]];
    for (i, form) in forms.iter().enumerate() {
        t[base + i] = TableEntry::op(op, form);
    }
}

#[rustfmt::skip]
fn base_table() -> Vec<TableEntry> {
    let mut t = vec![TableEntry::INVALID; 256];
    alu_row(&mut t, 0x00, Operation::Add);
    inst!(t, 0x06, PushSreg,   sreg(Segment::ES));
    inst!(t, 0x07, PopSreg,    sreg(Segment::ES));
    alu_row(&mut t, 0x08, Operation::Or);
    inst!(t, 0x0E, PushSreg,   sreg(Segment::CS));
    inst_ext!(t, 0x0F, Extension, TwoByte);
    alu_row(&mut t, 0x10, Operation::Adc);
    inst!(t, 0x16, PushSreg,   sreg(Segment::SS));
    inst!(t, 0x17, PopSreg,    sreg(Segment::SS));
    alu_row(&mut t, 0x18, Operation::Sbb);
    inst!(t, 0x1E, PushSreg,   sreg(Segment::DS));
    inst!(t, 0x1F, PopSreg,    sreg(Segment::DS));
    alu_row(&mut t, 0x20, Operation::And);
    inst!(t, 0x26, SegmentPrefix, sreg(Segment::ES));
    inst!(t, 0x27, Daa);
    alu_row(&mut t, 0x28, Operation::Sub);
    inst!(t, 0x2E, SegmentPrefix, sreg(Segment::CS));
    inst!(t, 0x2F, Das);
    alu_row(&mut t, 0x30, Operation::Xor);
    inst!(t, 0x36, SegmentPrefix, sreg(Segment::SS));
    inst!(t, 0x37, Aaa);
    alu_row(&mut t, 0x38, Operation::Cmp);
    inst!(t, 0x3E, SegmentPrefix, sreg(Segment::DS));
    inst!(t, 0x3F, Aas);
    for r in 0..8u8 {
        inst!(t, 0x40 + r as usize, Inc,  rv(r));
        inst!(t, 0x48 + r as usize, Dec,  rv(r));
        inst!(t, 0x50 + r as usize, Push, rv(r));
        inst!(t, 0x58 + r as usize, Pop,  rv(r));
    }
    inst!(t, 0x60, Pusha);
    inst!(t, 0x61, Popa);
    inst!(t, 0x62, Bound,      Gv, Ma);
    inst!(t, 0x63, Arpl,       Ew, Gw);
    inst!(t, 0x64, SegmentPrefix, sreg(Segment::FS));
    inst!(t, 0x65, SegmentPrefix, sreg(Segment::GS));
    inst!(t, 0x66, OperandSizePrefix);
    inst!(t, 0x67, AddressSizePrefix);
    inst!(t, 0x68, Push,       Iv);
    inst!(t, 0x69, Imul,       Gv, Ev, Iv);
    inst!(t, 0x6A, Push,       Ib);
    inst!(t, 0x6B, Imul,       Gv, Ev, Ib);
    inst!(t, 0x6C, Ins,        Yb, DX);
    inst!(t, 0x6D, Ins,        Yv, DX);
    inst!(t, 0x6E, Outs,       DX, Xb);
    inst!(t, 0x6F, Outs,       DX, Xv);
    for cc in 0..16u8 {
        t[0x70 + cc as usize] = TableEntry::cc(Operation::Jcc, JumpCondition::from_cc(cc), &[Jb]);
    }
    inst_ext!(t, 0x80, ExtensionModRmReg, Group1, Eb, Ib);
    inst_ext!(t, 0x81, ExtensionModRmReg, Group1, Ev, Iv);
    inst_ext!(t, 0x82, ExtensionModRmReg, Group1, Eb, Ib);
    inst_ext!(t, 0x83, ExtensionModRmReg, Group1, Ev, Ib);
    inst!(t, 0x84, Test,       Gb, Eb);
    inst!(t, 0x85, Test,       Gv, Ev);
    inst!(t, 0x86, Xchg,       Eb, Gb);
    inst!(t, 0x87, Xchg,       Ev, Gv);
    inst!(t, 0x88, Mov,        Eb, Gb);
    inst!(t, 0x89, Mov,        Ev, Gv);
    inst!(t, 0x8A, Mov,        Gb, Eb);
    inst!(t, 0x8B, Mov,        Gv, Ev);
    inst!(t, 0x8C, MovSreg,    Ew, Sw);
    inst!(t, 0x8D, Lea,        Gv, M);
    inst!(t, 0x8E, MovSreg,    Sw, Ew);
    inst!(t, 0x8F, Pop,        Ev);
    inst!(t, 0x90, Nop);
    for r in 1..8u8 {
        inst!(t, 0x90 + r as usize, Xchg, rv(r), eAX);
    }
    inst!(t, 0x98, Cbw);
    inst!(t, 0x99, Cwd);
    inst!(t, 0x9A, CallFar,    Ap);
    inst!(t, 0x9B, Wait);
    inst!(t, 0x9C, Pushf);
    inst!(t, 0x9D, Popf);
    inst!(t, 0x9E, Sahf);
    inst!(t, 0x9F, Lahf);
    inst!(t, 0xA0, Mov,        AL, Ob);
    inst!(t, 0xA1, Mov,        eAX, Ov);
    inst!(t, 0xA2, Mov,        Ob, AL);
    inst!(t, 0xA3, Mov,        Ov, eAX);
    inst!(t, 0xA4, Movs,       Yb, Xb);
    inst!(t, 0xA5, Movs,       Yv, Xv);
    inst!(t, 0xA6, Cmps,       Xb, Yb);
    inst!(t, 0xA7, Cmps,       Xv, Yv);
    inst!(t, 0xA8, Test,       AL, Ib);
    inst!(t, 0xA9, Test,       eAX, Iv);
    inst!(t, 0xAA, Stos,       Yb, AL);
    inst!(t, 0xAB, Stos,       Yv, eAX);
    inst!(t, 0xAC, Lods,       AL, Xb);
    inst!(t, 0xAD, Lods,       eAX, Xv);
    inst!(t, 0xAE, Scas,       AL, Yb);
    inst!(t, 0xAF, Scas,       eAX, Yv);
    for r in 0..8u8 {
        inst!(t, 0xB0 + r as usize, Mov, r8(r), Ib);
        inst!(t, 0xB8 + r as usize, Mov, rv(r), Iv);
    }
    inst_ext!(t, 0xC0, ExtensionModRmReg, Group2, Eb, Ib);
    inst_ext!(t, 0xC1, ExtensionModRmReg, Group2, Ev, Ib);
    inst!(t, 0xC2, RetNear,    Iw);
    inst!(t, 0xC3, RetNear);
    inst!(t, 0xC4, Lxs,        sreg(Segment::ES), Gv, Mp);
    inst!(t, 0xC5, Lxs,        sreg(Segment::DS), Gv, Mp);
    inst!(t, 0xC6, Mov,        Eb, Ib);
    inst!(t, 0xC7, Mov,        Ev, Iv);
    inst!(t, 0xC8, Enter,      Iw, Ib2);
    inst!(t, 0xC9, Leave);
    inst!(t, 0xCA, RetFar,     Iw);
    inst!(t, 0xCB, RetFar);
    inst!(t, 0xCC, Int,        cb(3));
    inst!(t, 0xCD, Int,        Ib);
    inst!(t, 0xCE, Into);
    inst!(t, 0xCF, Iret);
    inst_ext!(t, 0xD0, ExtensionModRmReg, Group2, Eb, cb(1));
    inst_ext!(t, 0xD1, ExtensionModRmReg, Group2, Ev, cb(1));
    inst_ext!(t, 0xD2, ExtensionModRmReg, Group2, Eb, CL);
    inst_ext!(t, 0xD3, ExtensionModRmReg, Group2, Ev, CL);
    inst!(t, 0xD4, Aam,        Ib);
    inst!(t, 0xD5, Aad,        Ib);
    inst!(t, 0xD6, Salc);
    inst!(t, 0xD7, Xlat);
    inst_ext!(t, 0xD8, ExtensionModRmX87, X87D8);
    inst_ext!(t, 0xD9, ExtensionModRmX87, X87D9);
    inst_ext!(t, 0xDA, ExtensionModRmX87, X87DA);
    inst_ext!(t, 0xDB, ExtensionModRmX87, X87DB);
    inst_ext!(t, 0xDC, ExtensionModRmX87, X87DC);
    inst_ext!(t, 0xDD, ExtensionModRmX87, X87DD);
    inst_ext!(t, 0xDE, ExtensionModRmX87, X87DE);
    inst_ext!(t, 0xDF, ExtensionModRmX87, X87DF);
    inst_cc!(t, 0xE0, Loop,    NotEqual, Jb);
    inst_cc!(t, 0xE1, Loop,    Equal, Jb);
    inst_cc!(t, 0xE2, Loop,    Always, Jb);
    inst_cc!(t, 0xE3, Jcc,     CXZero, Jb);
    inst!(t, 0xE4, In,         AL, Ib);
    inst!(t, 0xE5, In,         eAX, Ib);
    inst!(t, 0xE6, Out,        Ib, AL);
    inst!(t, 0xE7, Out,        Ib, eAX);
    inst!(t, 0xE8, CallNear,   Jv);
    inst!(t, 0xE9, JmpNear,    Jv);
    inst!(t, 0xEA, JmpFar,     Ap);
    inst!(t, 0xEB, JmpNear,    Jb);
    inst!(t, 0xEC, In,         AL, DX);
    inst!(t, 0xED, In,         eAX, DX);
    inst!(t, 0xEE, Out,        DX, AL);
    inst!(t, 0xEF, Out,        DX, eAX);
    inst!(t, 0xF0, LockPrefix);
    inst!(t, 0xF2, RepNePrefix);
    inst!(t, 0xF3, RepPrefix);
    inst!(t, 0xF4, Hlt);
    inst!(t, 0xF5, Cmc);
    inst_ext!(t, 0xF6, ExtensionModRmReg, Group3Byte, Eb);
    inst_ext!(t, 0xF7, ExtensionModRmReg, Group3Word, Ev);
    inst!(t, 0xF8, Clc);
    inst!(t, 0xF9, Stc);
    inst!(t, 0xFA, Cli);
    inst!(t, 0xFB, Sti);
    inst!(t, 0xFC, Cld);
    inst!(t, 0xFD, Std);
    inst_ext!(t, 0xFE, ExtensionModRmReg, Group4, Eb);
    inst_ext!(t, 0xFF, ExtensionModRmReg, Group5, Ev);
    t
}

#[rustfmt::skip]
fn two_byte_table() -> Vec<TableEntry> {
    let mut t = vec![TableEntry::INVALID; 256];
    inst_ext!(t, 0x00, ExtensionModRmReg, Group6);
    inst_ext!(t, 0x01, ExtensionModRmReg, Group7);
    inst!(t, 0x02, Lar,        Gv, Ew);
    inst!(t, 0x03, Lsl,        Gv, Ew);
    inst!(t, 0x05, Loadall286);
    inst!(t, 0x06, Clts);
    inst!(t, 0x08, Invd);
    inst!(t, 0x09, Wbinvd);
    inst!(t, 0x20, MovCr,      Rd, Cd);
    inst!(t, 0x21, MovDr,      Rd, Dd);
    inst!(t, 0x22, MovCr,      Cd, Rd);
    inst!(t, 0x23, MovDr,      Dd, Rd);
    inst!(t, 0x24, MovTr,      Rd, Td);
    inst!(t, 0x26, MovTr,      Td, Rd);
    inst!(t, 0x31, Rdtsc);
    for cc in 0..16u8 {
        let condition = JumpCondition::from_cc(cc);
        t[0x40 + cc as usize] = TableEntry::cc(Operation::CmovCc, condition, &[Gv, Ev]);
        t[0x80 + cc as usize] = TableEntry::cc(Operation::Jcc, condition, &[Jv]);
        t[0x90 + cc as usize] = TableEntry::cc(Operation::SetCc, condition, &[Eb]);
    }
    inst!(t, 0xA0, PushSreg,   sreg(Segment::FS));
    inst!(t, 0xA1, PopSreg,    sreg(Segment::FS));
    inst!(t, 0xA2, Cpuid);
    inst!(t, 0xA3, Bt,         Ev, Gv);
    inst!(t, 0xA4, Shld,       Ev, Gv, Ib);
    inst!(t, 0xA5, Shld,       Ev, Gv, CL);
    inst!(t, 0xA8, PushSreg,   sreg(Segment::GS));
    inst!(t, 0xA9, PopSreg,    sreg(Segment::GS));
    inst!(t, 0xAB, Bts,        Ev, Gv);
    inst!(t, 0xAC, Shrd,       Ev, Gv, Ib);
    inst!(t, 0xAD, Shrd,       Ev, Gv, CL);
    inst!(t, 0xAF, Imul,       Gv, Ev);
    inst!(t, 0xB0, Cmpxchg,    Eb, Gb);
    inst!(t, 0xB1, Cmpxchg,    Ev, Gv);
    inst!(t, 0xB2, Lxs,        sreg(Segment::SS), Gv, Mp);
    inst!(t, 0xB3, Btr,        Ev, Gv);
    inst!(t, 0xB4, Lxs,        sreg(Segment::FS), Gv, Mp);
    inst!(t, 0xB5, Lxs,        sreg(Segment::GS), Gv, Mp);
    inst!(t, 0xB6, Movzx,      Gv, Eb);
    inst!(t, 0xB7, Movzx,      Gv, Ew);
    inst_ext!(t, 0xBA, ExtensionModRmReg, Group8, Ev, Ib);
    inst!(t, 0xBB, Btc,        Ev, Gv);
    inst!(t, 0xBC, Bsf,        Gv, Ev);
    inst!(t, 0xBD, Bsr,        Gv, Ev);
    inst!(t, 0xBE, Movsx,      Gv, Eb);
    inst!(t, 0xBF, Movsx,      Gv, Ew);
    inst!(t, 0xC0, Xadd,       Eb, Gb);
    inst!(t, 0xC1, Xadd,       Ev, Gv);
    for r in 0..8u8 {
        inst!(t, 0xC8 + r as usize, Bswap, r32(r));
    }
    t
}

// Group tables inherit their operands from the first-level entry unless they override them.

#[rustfmt::skip]
fn group1_table() -> Vec<TableEntry> {
    let mut t = vec![TableEntry::INVALID; 8];
    inst!(t, 0, Add);
    inst!(t, 1, Or);
    inst!(t, 2, Adc);
    inst!(t, 3, Sbb);
    inst!(t, 4, And);
    inst!(t, 5, Sub);
    inst!(t, 6, Xor);
    inst!(t, 7, Cmp);
    t
}

#[rustfmt::skip]
fn group2_table() -> Vec<TableEntry> {
    let mut t = vec![TableEntry::INVALID; 8];
    inst!(t, 0, Rol);
    inst!(t, 1, Ror);
    inst!(t, 2, Rcl);
    inst!(t, 3, Rcr);
    inst!(t, 4, Shl);
    inst!(t, 5, Shr);
    inst!(t, 7, Sar);
    t
}

#[rustfmt::skip]
fn group3_table(test_immediate: Operand) -> Vec<TableEntry> {
    let mut t = vec![TableEntry::INVALID; 8];
    inst!(t, 0, Test,          Operand::NONE, test_immediate);
    inst!(t, 2, Not);
    inst!(t, 3, Neg);
    inst!(t, 4, Mul);
    inst!(t, 5, Imul);
    inst!(t, 6, Div);
    inst!(t, 7, Idiv);
    t
}

#[rustfmt::skip]
fn group4_table() -> Vec<TableEntry> {
    let mut t = vec![TableEntry::INVALID; 8];
    inst!(t, 0, Inc);
    inst!(t, 1, Dec);
    t
}

#[rustfmt::skip]
fn group5_table() -> Vec<TableEntry> {
    let mut t = vec![TableEntry::INVALID; 8];
    inst!(t, 0, Inc);
    inst!(t, 1, Dec);
    inst!(t, 2, CallNear);
    inst!(t, 3, CallFar,       Mp);
    inst!(t, 4, JmpNear);
    inst!(t, 5, JmpFar,        Mp);
    inst!(t, 6, Push);
    t
}

#[rustfmt::skip]
fn group6_table() -> Vec<TableEntry> {
    let mut t = vec![TableEntry::INVALID; 8];
    inst!(t, 0, Sldt,          Ew);
    inst!(t, 1, Str,           Ew);
    inst!(t, 2, Lldt,          Ew);
    inst!(t, 3, Ltr,           Ew);
    inst!(t, 4, Verr,          Ew);
    inst!(t, 5, Verw,          Ew);
    t
}

#[rustfmt::skip]
fn group7_table() -> Vec<TableEntry> {
    let mut t = vec![TableEntry::INVALID; 8];
    inst!(t, 0, Sgdt,          Ms);
    inst!(t, 1, Sidt,          Ms);
    inst!(t, 2, Lgdt,          Ms);
    inst!(t, 3, Lidt,          Ms);
    inst!(t, 4, Smsw,          Ew);
    inst!(t, 6, Lmsw,          Ew);
    inst!(t, 7, Invlpg,        M);
    t
}

#[rustfmt::skip]
fn group8_table() -> Vec<TableEntry> {
    let mut t = vec![TableEntry::INVALID; 8];
    inst!(t, 4, Bt);
    inst!(t, 5, Bts);
    inst!(t, 6, Btr);
    inst!(t, 7, Btc);
    t
}

/// Register-form operand layouts for the x87 tables.
#[derive(Copy, Clone)]
enum FpuForm {
    /// ST(i)
    StI,
    /// ST(0), ST(i)
    St0StI,
    /// ST(i), ST(0)
    StISt0,
}

/// Fill the eight register forms starting at `modrm_low`, which is modrm & 0x3F.
fn fpu_row(t: &mut [TableEntry], modrm_low: usize, op: Operation, form: FpuForm) {
    for i in 0..8u8 {
        let operands: &[Operand] = match form {
            FpuForm::StI => &[st(i)],
            FpuForm::St0StI => &[ST0, st(i)],
            FpuForm::StISt0 => &[st(i), ST0],
        };
        t[8 + modrm_low + i as usize] = TableEntry::op(op, operands);
    }
}

/// Memory forms of the arithmetic escapes D8, DA, DC and DE.
fn fpu_arith_memory(t: &mut [TableEntry], integer: bool, mem: Operand) {
    use Operation::*;
    let ops = match integer {
        false => [Fadd, Fmul, Fcom, Fcomp, Fsub, Fsubr, Fdiv, Fdivr],
        true => [Fiadd, Fimul, Ficom, Ficomp, Fisub, Fisubr, Fidiv, Fidivr],
    };
    for (reg, op) in ops.iter().enumerate() {
        t[reg] = TableEntry::op(*op, &[ST0, mem]);
    }
}

fn x87_d8_table() -> Vec<TableEntry> {
    use Operation::*;
    let mut t = vec![TableEntry::INVALID; X87_TABLE_SIZE];
    fpu_arith_memory(&mut t, false, Md);
    for (i, op) in [Fadd, Fmul, Fcom, Fcomp, Fsub, Fsubr, Fdiv, Fdivr].iter().enumerate() {
        fpu_row(&mut t, i * 8, *op, FpuForm::St0StI);
    }
    t
}

#[rustfmt::skip]
fn x87_d9_table() -> Vec<TableEntry> {
    let mut t = vec![TableEntry::INVALID; X87_TABLE_SIZE];
    inst!(t, 0, Fld,           Md);
    inst!(t, 2, Fst,           Md);
    inst!(t, 3, Fstp,          Md);
    inst!(t, 4, Fldenv,        M);
    inst!(t, 5, Fldcw,         Mw);
    inst!(t, 6, Fnstenv,       M);
    inst!(t, 7, Fnstcw,        Mw);
    fpu_row(&mut t, 0x00, Operation::Fld, FpuForm::StI);
    fpu_row(&mut t, 0x08, Operation::Fxch, FpuForm::StI);
    inst!(t, 8 + 0x10, Fnop);
    inst!(t, 8 + 0x20, Fchs);
    inst!(t, 8 + 0x21, Fabs);
    inst!(t, 8 + 0x24, Ftst);
    inst!(t, 8 + 0x25, Fxam);
    inst!(t, 8 + 0x28, Fld1);
    inst!(t, 8 + 0x29, Fldl2t);
    inst!(t, 8 + 0x2A, Fldl2e);
    inst!(t, 8 + 0x2B, Fldpi);
    inst!(t, 8 + 0x2C, Fldlg2);
    inst!(t, 8 + 0x2D, Fldln2);
    inst!(t, 8 + 0x2E, Fldz);
    inst!(t, 8 + 0x30, F2xm1);
    inst!(t, 8 + 0x31, Fyl2x);
    inst!(t, 8 + 0x32, Fptan);
    inst!(t, 8 + 0x33, Fpatan);
    inst!(t, 8 + 0x34, Fxtract);
    inst!(t, 8 + 0x35, Fprem1);
    inst!(t, 8 + 0x36, Fdecstp);
    inst!(t, 8 + 0x37, Fincstp);
    inst!(t, 8 + 0x38, Fprem);
    inst!(t, 8 + 0x39, Fyl2xp1);
    inst!(t, 8 + 0x3A, Fsqrt);
    inst!(t, 8 + 0x3B, Fsincos);
    inst!(t, 8 + 0x3C, Frndint);
    inst!(t, 8 + 0x3D, Fscale);
    inst!(t, 8 + 0x3E, Fsin);
    inst!(t, 8 + 0x3F, Fcos);
    t
}

#[rustfmt::skip]
fn x87_da_table() -> Vec<TableEntry> {
    let mut t = vec![TableEntry::INVALID; X87_TABLE_SIZE];
    fpu_arith_memory(&mut t, true, Md);
    inst!(t, 8 + 0x29, Fucompp, ST0, ST1);
    t
}

#[rustfmt::skip]
fn x87_db_table() -> Vec<TableEntry> {
    let mut t = vec![TableEntry::INVALID; X87_TABLE_SIZE];
    inst!(t, 0, Fild,          Md);
    inst!(t, 2, Fist,          Md);
    inst!(t, 3, Fistp,         Md);
    inst!(t, 5, Fld,           Mt);
    inst!(t, 7, Fstp,          Mt);
    inst!(t, 8 + 0x20, Feni);
    inst!(t, 8 + 0x21, Fdisi);
    inst!(t, 8 + 0x22, Fnclex);
    inst!(t, 8 + 0x23, Fninit);
    inst!(t, 8 + 0x24, Fsetpm);
    t
}

fn x87_dc_table() -> Vec<TableEntry> {
    use Operation::*;
    let mut t = vec![TableEntry::INVALID; X87_TABLE_SIZE];
    fpu_arith_memory(&mut t, false, Mq);
    fpu_row(&mut t, 0x00, Fadd, FpuForm::StISt0);
    fpu_row(&mut t, 0x08, Fmul, FpuForm::StISt0);
    fpu_row(&mut t, 0x10, Fcom, FpuForm::St0StI);
    fpu_row(&mut t, 0x18, Fcomp, FpuForm::St0StI);
    // The reversed forms come first when the destination is ST(i).
    fpu_row(&mut t, 0x20, Fsubr, FpuForm::StISt0);
    fpu_row(&mut t, 0x28, Fsub, FpuForm::StISt0);
    fpu_row(&mut t, 0x30, Fdivr, FpuForm::StISt0);
    fpu_row(&mut t, 0x38, Fdiv, FpuForm::StISt0);
    t
}

#[rustfmt::skip]
fn x87_dd_table() -> Vec<TableEntry> {
    let mut t = vec![TableEntry::INVALID; X87_TABLE_SIZE];
    inst!(t, 0, Fld,           Mq);
    inst!(t, 2, Fst,           Mq);
    inst!(t, 3, Fstp,          Mq);
    inst!(t, 4, Frstor,        M);
    inst!(t, 6, Fnsave,        M);
    inst!(t, 7, Fnstsw,        Mw);
    fpu_row(&mut t, 0x00, Operation::Ffree, FpuForm::StI);
    fpu_row(&mut t, 0x10, Operation::Fst, FpuForm::StI);
    fpu_row(&mut t, 0x18, Operation::Fstp, FpuForm::StI);
    fpu_row(&mut t, 0x20, Operation::Fucom, FpuForm::St0StI);
    fpu_row(&mut t, 0x28, Operation::Fucomp, FpuForm::St0StI);
    t
}

fn x87_de_table() -> Vec<TableEntry> {
    use Operation::*;
    let mut t = vec![TableEntry::INVALID; X87_TABLE_SIZE];
    fpu_arith_memory(&mut t, true, Mw);
    fpu_row(&mut t, 0x00, Faddp, FpuForm::StISt0);
    fpu_row(&mut t, 0x08, Fmulp, FpuForm::StISt0);
    t[8 + 0x19] = TableEntry::op(Fcompp, &[ST0, ST1]);
    fpu_row(&mut t, 0x20, Fsubrp, FpuForm::StISt0);
    fpu_row(&mut t, 0x28, Fsubp, FpuForm::StISt0);
    fpu_row(&mut t, 0x30, Fdivrp, FpuForm::StISt0);
    fpu_row(&mut t, 0x38, Fdivp, FpuForm::StISt0);
    t
}

#[rustfmt::skip]
fn x87_df_table() -> Vec<TableEntry> {
    let mut t = vec![TableEntry::INVALID; X87_TABLE_SIZE];
    inst!(t, 0, Fild,          Mw);
    inst!(t, 2, Fist,          Mw);
    inst!(t, 3, Fistp,         Mw);
    inst!(t, 4, Fbld,          Mt);
    inst!(t, 5, Fild,          Mq);
    inst!(t, 6, Fbstp,         Mt);
    inst!(t, 7, Fistp,         Mq);
    inst!(t, 8 + 0x20, Fnstsw, AX);
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_arena() {
        assert_eq!(OPCODE_TABLES.tables.len(), TABLE_COUNT);
        assert_eq!(OPCODE_TABLES.table(TableId::Base).len(), 256);
        assert_eq!(OPCODE_TABLES.table(TableId::TwoByte).len(), 256);
        assert_eq!(OPCODE_TABLES.table(TableId::Group5).len(), 8);
        assert_eq!(OPCODE_TABLES.table(TableId::X87DF).len(), X87_TABLE_SIZE);
    }

    #[test]
    fn test_base_entries() {
        let e = lookup_base(0x01);
        assert_eq!(e.operation, Operation::Add);
        assert_eq!(e.operands[0], Ev);
        assert_eq!(e.operands[1], Gv);

        let e = lookup_base(0x0F);
        assert_eq!(e.operation, Operation::Extension);
        assert_eq!(e.next, Some(TableId::TwoByte));

        let e = lookup_base(0x74);
        assert_eq!(e.operation, Operation::Jcc);
        assert_eq!(e.condition, JumpCondition::Equal);

        assert!(!lookup_base(0xF1).is_valid());
        assert_eq!(lookup_base(0x66).operation, Operation::OperandSizePrefix);
    }

    #[test]
    fn test_group_inheritance() {
        let e = lookup_base(0x83);
        assert_eq!(e.next, Some(TableId::Group1));
        assert_eq!(e.operands[1], Ib);
        let sub = OPCODE_TABLES.lookup(TableId::Group1, 7);
        assert_eq!(sub.operation, Operation::Cmp);
        assert!(sub.operands[0].is_none());

        // TEST in group 3 overrides only the second operand
        let test = OPCODE_TABLES.lookup(TableId::Group3Word, 0);
        assert!(test.operands[0].is_none());
        assert_eq!(test.operands[1], Iv);
        assert!(!OPCODE_TABLES.lookup(TableId::Group2, 6).is_valid());
    }

    #[test]
    fn test_x87_layout() {
        // D9 E8 is FLD1, D9 E9 is FLDL2T
        assert_eq!(OPCODE_TABLES.lookup(TableId::X87D9, 8 + 0x28).operation, Operation::Fld1);
        assert_eq!(OPCODE_TABLES.lookup(TableId::X87D9, 8 + 0x29).operation, Operation::Fldl2t);
        // DC E8+i is FSUB ST(i), ST(0)
        let e = OPCODE_TABLES.lookup(TableId::X87DC, 8 + 0x2B);
        assert_eq!(e.operation, Operation::Fsub);
        assert_eq!(e.operands[0], st(3));
        assert_eq!(e.operands[1], ST0);
        // DE /0 is FIADD m16int
        assert_eq!(OPCODE_TABLES.lookup(TableId::X87DE, 0).operands[1].size, OperandSize::Size16);
        assert_eq!(OPCODE_TABLES.lookup(TableId::X87DF, 8 + 0x20).operation, Operation::Fnstsw);
    }

    #[test]
    fn test_operation_display() {
        assert_eq!(Operation::Add.to_string(), "add");
        assert_eq!(Operation::CallNear.to_string(), "call");
        assert_eq!(Operation::RetFar.to_string(), "retf");
        assert_eq!(Operation::Fldl2e.to_string(), "fldl2e");
        assert!(Operation::Fadd.is_x87());
        assert!(!Operation::Xor.is_x87());
    }
}
