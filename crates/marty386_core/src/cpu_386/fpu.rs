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

    cpu_386::fpu.rs

    x87 register state.

    Stack registers hold the full 80-bit extended value (see float80.rs). The
    control and status words are modular-bitfield structs so they can be
    loaded and stored as raw words by FLDCW, FNSTSW, FLDENV and friends.

*/

use modular_bitfield::{
    bitfield,
    prelude::{B2, B3},
};

use crate::{
    cpu_386::float80::{F80Class, F80},
    cpu_common::{CpuAbort, CpuResult},
};

pub const FPU_CONTROL_WORD_DEFAULT: u16 = 0x037F;

pub const FPU_EXCEPTION_INVALID: u16 = 0x0001;
pub const FPU_EXCEPTION_DENORMAL: u16 = 0x0002;
pub const FPU_EXCEPTION_ZERO_DIVIDE: u16 = 0x0004;
pub const FPU_EXCEPTION_OVERFLOW: u16 = 0x0008;
pub const FPU_EXCEPTION_UNDERFLOW: u16 = 0x0010;
pub const FPU_EXCEPTION_PRECISION: u16 = 0x0020;
pub const FPU_EXCEPTION_MASK: u16 = 0x003F;

pub const FPU_TAG_VALID: u8 = 0b00;
pub const FPU_TAG_ZERO: u8 = 0b01;
pub const FPU_TAG_SPECIAL: u8 = 0b10;
pub const FPU_TAG_EMPTY: u8 = 0b11;

#[bitfield]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControlWord {
    pub im: bool,
    pub dm: bool,
    pub zm: bool,
    pub om: bool,
    pub um: bool,
    pub pm: bool,
    #[skip]
    reserved0: B2,
    /// Precision control: 00 single, 10 double, 11 extended.
    pub pc: B2,
    /// Rounding control: 00 nearest, 01 down, 10 up, 11 toward zero.
    pub rc: B2,
    pub ic: bool,
    #[skip]
    reserved1: B3,
}

#[bitfield]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusWord {
    pub ie: bool,
    pub de: bool,
    pub ze: bool,
    pub oe: bool,
    pub ue: bool,
    pub pe: bool,
    /// Stack fault
    pub sf: bool,
    /// Exception summary
    pub es: bool,
    pub c0: bool,
    pub c1: bool,
    pub c2: bool,
    pub top: B3,
    pub c3: bool,
    pub busy: bool,
}

impl ControlWord {
    pub fn from_word(word: u16) -> Self {
        ControlWord::from_bytes(word.to_le_bytes())
    }

    pub fn to_word(&self) -> u16 {
        // Reserved bit 6 reads as 1 on the 387 and later.
        u16::from_le_bytes(self.into_bytes()) | 0x0040
    }

    /// Exception mask bits, in the same layout as the status word's exception flags.
    pub fn exception_mask(&self) -> u16 {
        u16::from_le_bytes(self.into_bytes()) & FPU_EXCEPTION_MASK
    }
}

impl StatusWord {
    pub fn from_word(word: u16) -> Self {
        StatusWord::from_bytes(word.to_le_bytes())
    }

    pub fn to_word(&self) -> u16 {
        u16::from_le_bytes(self.into_bytes())
    }

    pub fn set_condition(&mut self, c3: bool, c2: bool, c1: bool, c0: bool) {
        self.set_c3(c3);
        self.set_c2(c2);
        self.set_c1(c1);
        self.set_c0(c0);
    }
}

/// Rounding modes selected by the control word's RC field.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RoundingMode {
    Nearest,
    Down,
    Up,
    TowardZero,
}

impl RoundingMode {
    pub fn from_rc(rc: u8) -> Self {
        match rc & 3 {
            0 => RoundingMode::Nearest,
            1 => RoundingMode::Down,
            2 => RoundingMode::Up,
            _ => RoundingMode::TowardZero,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FpuState {
    /// Physical registers R0-R7. ST(i) is R[(TOP + i) & 7].
    pub regs: [F80; 8],
    pub cw: ControlWord,
    pub sw: StatusWord,
    /// Two tag bits per physical register.
    pub tw: u16,
    /// Last instruction and operand pointers, as stored by FNSTENV.
    pub fip: u32,
    pub fcs: u16,
    pub fop: u16,
    pub fdp: u32,
    pub fds: u16,
    /// An unmasked exception was raised and has not been delivered yet.
    pub pending_exception: bool,
}

impl Default for FpuState {
    fn default() -> Self {
        FpuState {
            regs: [F80::ZERO; 8],
            cw: ControlWord::from_word(FPU_CONTROL_WORD_DEFAULT),
            sw: StatusWord::from_word(0),
            tw: 0xFFFF,
            fip: 0,
            fcs: 0,
            fop: 0,
            fdp: 0,
            fds: 0,
            pending_exception: false,
        }
    }
}

impl FpuState {
    pub fn new() -> Self {
        Self::default()
    }

    /// FNINIT
    pub fn reset(&mut self) {
        self.cw = ControlWord::from_word(FPU_CONTROL_WORD_DEFAULT);
        self.sw = StatusWord::from_word(0);
        self.tw = 0xFFFF;
        self.fip = 0;
        self.fcs = 0;
        self.fop = 0;
        self.fdp = 0;
        self.fds = 0;
        self.pending_exception = false;
    }

    /// FNCLEX: clear exception flags, stack fault, summary and busy.
    pub fn clear_exceptions(&mut self) {
        let word = self.sw.to_word() & !0x80FF;
        self.sw = StatusWord::from_word(word);
        self.pending_exception = false;
    }

    #[inline]
    pub fn top(&self) -> u8 {
        self.sw.top()
    }

    #[inline]
    pub fn set_top(&mut self, top: u8) {
        self.sw.set_top(top & 7);
    }

    #[inline]
    pub fn physical_index(&self, st: u8) -> usize {
        ((self.top() + st) & 7) as usize
    }

    pub fn tag(&self, physical: usize) -> u8 {
        ((self.tw >> (physical * 2)) & 3) as u8
    }

    pub fn set_tag(&mut self, physical: usize, tag: u8) {
        let shift = physical * 2;
        self.tw = (self.tw & !(3 << shift)) | (((tag & 3) as u16) << shift);
    }

    pub fn is_empty(&self, st: u8) -> bool {
        self.tag(self.physical_index(st)) == FPU_TAG_EMPTY
    }

    pub fn tag_for(value: F80) -> u8 {
        match value.class() {
            F80Class::Zero => FPU_TAG_ZERO,
            F80Class::Normal => FPU_TAG_VALID,
            _ => FPU_TAG_SPECIAL,
        }
    }

    #[inline]
    pub fn st(&self, st: u8) -> F80 {
        self.regs[self.physical_index(st)]
    }

    pub fn set_st(&mut self, st: u8, value: F80) {
        let physical = self.physical_index(st);
        self.regs[physical] = value;
        self.set_tag(physical, Self::tag_for(value));
    }

    /// Record a stack fault. C1 distinguishes overflow (1) from underflow (0).
    fn stack_fault(&mut self, overflow: bool) -> CpuAbort {
        self.sw.set_c1(overflow);
        self.sw.set_sf(true);
        self.sw.set_ie(true);
        if !self.cw.im() {
            self.sw.set_es(true);
            self.pending_exception = true;
        }
        CpuAbort::FpuStackFault
    }

    /// A push would overwrite a register that is in use.
    pub fn check_overflow(&mut self) -> CpuResult {
        let physical = ((self.top().wrapping_sub(1)) & 7) as usize;
        if self.tag(physical) != FPU_TAG_EMPTY {
            return Err(self.stack_fault(true));
        }
        Ok(())
    }

    /// ST(st) must hold a value.
    pub fn check_underflow(&mut self, st: u8) -> CpuResult {
        if self.is_empty(st) {
            return Err(self.stack_fault(false));
        }
        Ok(())
    }

    pub fn push(&mut self, value: F80) -> CpuResult {
        self.check_overflow()?;
        let top = self.top().wrapping_sub(1) & 7;
        self.set_top(top);
        self.set_st(0, value);
        Ok(())
    }

    pub fn pop(&mut self) {
        let top = self.top();
        self.set_tag(top as usize, FPU_TAG_EMPTY);
        self.set_top(top.wrapping_add(1));
    }

    /// Record exception flags in the status word. If any of them is unmasked, set the
    /// summary bit and abort the instruction.
    pub fn raise_exceptions(&mut self, flags: u16) -> CpuResult {
        let flags = flags & FPU_EXCEPTION_MASK;
        if flags == 0 {
            return Ok(());
        }
        let word = self.sw.to_word() | flags;
        self.sw = StatusWord::from_word(word);

        if flags & !self.cw.exception_mask() != 0 {
            self.sw.set_es(true);
            self.sw.set_busy(true);
            self.pending_exception = true;
            return Err(CpuAbort::FpuException);
        }
        Ok(())
    }

    pub fn rounding_mode(&self) -> RoundingMode {
        RoundingMode::from_rc(self.cw.rc())
    }

    /// Significand bits kept by arithmetic under the precision control field.
    pub fn precision_bits(&self) -> u32 {
        match self.cw.pc() {
            0 => 24,
            2 => 53,
            _ => 64,
        }
    }
}

/// Exception flags for a transcendental result computed in f64.
pub fn arithmetic_exceptions(operands: &[f64], result: f64) -> u16 {
    let mut flags = 0;
    if operands.iter().any(|v| v.is_subnormal()) {
        flags |= FPU_EXCEPTION_DENORMAL;
    }
    let any_nan = operands.iter().any(|v| v.is_nan());
    if result.is_nan() && !any_nan {
        flags |= FPU_EXCEPTION_INVALID;
    }
    if result.is_infinite() && operands.iter().all(|v| v.is_finite()) {
        flags |= FPU_EXCEPTION_OVERFLOW | FPU_EXCEPTION_PRECISION;
    }
    if result.is_subnormal() {
        flags |= FPU_EXCEPTION_UNDERFLOW;
    }
    flags
}
