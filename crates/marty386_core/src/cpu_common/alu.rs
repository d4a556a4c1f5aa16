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

    cpu_common::alu.rs

    This module implements traits for alu operations of different widths
    shared by the interpreter, the fast path and the recompiler's executor.

*/

use std::fmt::Debug;

use crate::cpu_common::*;

/* ----------------------------- Operand widths ---------------------------- */

/// An integer operand width the ALU can operate on.
pub trait Word: Copy + Clone + Debug + Default + Eq + Ord + 'static {
    const BITS: u32;
    const SIGN: u32;
    const MASK: u32;
    const SIZE: OperandSize;

    fn from_u32(value: u32) -> Self;
    fn to_u32(self) -> u32;
    /// Sign extend to 32 bits.
    fn sign_extend(self) -> u32;
}

macro_rules! impl_word {
    ($prim:ty, $signed:ty, $size:expr) => {
        impl Word for $prim {
            const BITS: u32 = <$prim>::BITS;
            const SIGN: u32 = 1 << (<$prim>::BITS - 1);
            const MASK: u32 = <$prim>::MAX as u32;
            const SIZE: OperandSize = $size;

            #[inline(always)]
            fn from_u32(value: u32) -> Self {
                value as $prim
            }
            #[inline(always)]
            fn to_u32(self) -> u32 {
                self as u32
            }
            #[inline(always)]
            fn sign_extend(self) -> u32 {
                self as $signed as i32 as u32
            }
        }
    };
}

impl_word!(u8, i8, OperandSize::Size8);
impl_word!(u16, i16, OperandSize::Size16);
impl_word!(u32, i32, OperandSize::Size32);

/// SF, ZF and PF for a result, as EFLAGS bits.
#[inline(always)]
pub fn szp_flags<T: Word>(value: T) -> u32 {
    let v = value.to_u32();
    let mut flags = 0;
    if v & T::SIGN != 0 {
        flags |= CPU_FLAG_SIGN;
    }
    if v == 0 {
        flags |= CPU_FLAG_ZERO;
    }
    if PARITY_TABLE[(v & 0xFF) as usize] {
        flags |= CPU_FLAG_PARITY;
    }
    flags
}

#[inline(always)]
fn flag_bits(carry: bool, overflow: bool, aux_carry: bool) -> u32 {
    (if carry { CPU_FLAG_CARRY } else { 0 })
        | (if overflow { CPU_FLAG_OVERFLOW } else { 0 })
        | (if aux_carry { CPU_FLAG_AUX_CARRY } else { 0 })
}

/* ----------------------- Addition & Subtraction ------------------------- */

pub trait AluNeg: Sized {
    fn alu_neg(self) -> (Self, bool, bool, bool);
}

pub trait AluSub<Rhs = Self>: Sized {
    fn alu_sub(self, rhs: Rhs) -> (Self, bool, bool, bool);
}

pub trait AluSbb<Rhs = Self>: Sized {
    fn alu_sbb(self, rhs: Rhs, carry: bool) -> (Self, bool, bool, bool);
}

pub trait AluAdd<Rhs = Self>: Sized {
    fn alu_add(self, rhs: Rhs) -> (Self, bool, bool, bool);
}

pub trait AluAdc<Rhs = Self>: Sized {
    fn alu_adc(self, rhs: Rhs, carry: bool) -> (Self, bool, bool, bool);
}

macro_rules! impl_neg {
    ($prim:ty) => {
        impl AluNeg for $prim {
            /// Negation
            ///
            /// Flags are those of Sub(0 - Self), except carry is set for any nonzero operand.
            fn alu_neg(self) -> (Self, bool, bool, bool) {
                let (result, _carry, overflow, aux_carry) = (0 as $prim).alu_sub(self);
                (result, self != 0, overflow, aux_carry)
            }
        }
    };
}

macro_rules! impl_sub {
    ($prim:ty) => {
        impl AluSub for $prim {
            /// Subtraction
            ///
            /// Carry flag is set if Unsigned overflow occurred
            /// Overflow flag is set if Signed overflow occurred
            /// AF flag is set if borrow from top nibble
            fn alu_sub(self, rhs: Self) -> (Self, bool, bool, bool) {
                self.alu_sbb(rhs, false)
            }
        }
    };
}

macro_rules! impl_sbb {
    ($prim:ty) => {
        impl AluSbb for $prim {
            /// Subtraction with borrow from carry flag
            fn alu_sbb(self, rhs: Self, carry_in: bool) -> (Self, bool, bool, bool) {
                let lhs_w = self as u64;
                let rhs_w = rhs as u64;
                // DEST := (DEST - (SRC + CF)), computed wide so the borrow lands above the operand width
                let result = lhs_w.wrapping_sub(rhs_w + carry_in as u64);
                let carry = (result >> <$prim>::BITS) & 1 != 0;
                let overflow = (lhs_w ^ rhs_w) & (lhs_w ^ result) & (1 << (<$prim>::BITS - 1)) != 0;
                let aux_carry = ((lhs_w ^ rhs_w ^ result) & 0x10) != 0;
                (result as Self, carry, overflow, aux_carry)
            }
        }
    };
}

macro_rules! impl_add {
    ($prim:ty) => {
        impl AluAdd for $prim {
            /// Addition
            ///
            /// Carry flag is set if Unsigned overflow occurred
            /// Overflow flag is set if Signed overflow occurred
            /// AF flag is set if carry out of the low nibble
            fn alu_add(self, rhs: Self) -> (Self, bool, bool, bool) {
                self.alu_adc(rhs, false)
            }
        }
    };
}

macro_rules! impl_adc {
    ($prim:ty) => {
        impl AluAdc for $prim {
            /// Addition with carry from carry flag
            fn alu_adc(self, rhs: Self, carry_in: bool) -> (Self, bool, bool, bool) {
                let lhs_w = self as u64;
                let rhs_w = rhs as u64;
                let result = lhs_w + rhs_w + carry_in as u64;
                let carry = (result >> <$prim>::BITS) & 1 != 0;
                let overflow = (lhs_w ^ result) & (rhs_w ^ result) & (1 << (<$prim>::BITS - 1)) != 0;
                let aux_carry = ((lhs_w ^ rhs_w ^ result) & 0x10) != 0;
                (result as Self, carry, overflow, aux_carry)
            }
        }
    };
}

impl_neg!(u8);
impl_neg!(u16);
impl_neg!(u32);
impl_sub!(u8);
impl_sub!(u16);
impl_sub!(u32);
impl_sbb!(u8);
impl_sbb!(u16);
impl_sbb!(u32);
impl_add!(u8);
impl_add!(u16);
impl_add!(u32);
impl_adc!(u8);
impl_adc!(u16);
impl_adc!(u32);

/// A width that implements the full set of arithmetic traits.
pub trait AluWord: Word + AluAdd + AluAdc + AluSub + AluSbb + AluNeg {}
impl AluWord for u8 {}
impl AluWord for u16 {}
impl AluWord for u32 {}

/// The eight group 1 operations, in ModRM reg field order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AluOp {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

impl AluOp {
    #[inline(always)]
    pub const fn from_index(index: u8) -> AluOp {
        match index & 0x07 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }

    /// CMP only updates flags.
    #[inline(always)]
    pub fn writes_result(&self) -> bool {
        !matches!(self, AluOp::Cmp)
    }
}

/// Perform a group 1 ALU operation. Returns the result and the new EFLAGS value.
#[inline(always)]
pub fn alu_op<T: AluWord>(op: AluOp, eflags: u32, lhs: T, rhs: T) -> (T, u32) {
    let carry_in = eflags & CPU_FLAG_CARRY != 0;
    let (result, carry, overflow, aux_carry) = match op {
        AluOp::Add => lhs.alu_add(rhs),
        AluOp::Adc => lhs.alu_adc(rhs, carry_in),
        AluOp::Sub | AluOp::Cmp => lhs.alu_sub(rhs),
        AluOp::Sbb => lhs.alu_sbb(rhs, carry_in),
        AluOp::Or => (T::from_u32(lhs.to_u32() | rhs.to_u32()), false, false, false),
        AluOp::And => (T::from_u32(lhs.to_u32() & rhs.to_u32()), false, false, false),
        AluOp::Xor => (T::from_u32(lhs.to_u32() ^ rhs.to_u32()), false, false, false),
    };
    let new_flags = (eflags & !CPU_FLAGS_STATUS) | flag_bits(carry, overflow, aux_carry) | szp_flags(result);
    (result, new_flags)
}

/// INC and DEC leave the carry flag unchanged.
#[inline(always)]
pub fn alu_inc_dec<T: AluWord>(eflags: u32, value: T, decrement: bool) -> (T, u32) {
    let (result, _carry, overflow, aux_carry) = if decrement {
        value.alu_sub(T::from_u32(1))
    }
    else {
        value.alu_add(T::from_u32(1))
    };
    let new_flags = (eflags & !(CPU_FLAGS_STATUS & !CPU_FLAG_CARRY))
        | flag_bits(false, overflow, aux_carry)
        | szp_flags(result);
    (result, new_flags)
}

#[inline(always)]
pub fn alu_neg<T: AluWord>(eflags: u32, value: T) -> (T, u32) {
    let (result, carry, overflow, aux_carry) = value.alu_neg();
    let new_flags = (eflags & !CPU_FLAGS_STATUS) | flag_bits(carry, overflow, aux_carry) | szp_flags(result);
    (result, new_flags)
}

/* ------------------------- Bitwise operations ---------------------------- */

/// The group 2 shift and rotate operations, in ModRM reg field order. Index 6 is
/// an undocumented alias of SHL.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShiftOp {
    Rol = 0,
    Ror = 1,
    Rcl = 2,
    Rcr = 3,
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

impl ShiftOp {
    #[inline(always)]
    pub const fn from_index(index: u8) -> ShiftOp {
        match index & 0x07 {
            0 => ShiftOp::Rol,
            1 => ShiftOp::Ror,
            2 => ShiftOp::Rcl,
            3 => ShiftOp::Rcr,
            4 | 6 => ShiftOp::Shl,
            5 => ShiftOp::Shr,
            _ => ShiftOp::Sar,
        }
    }
}

/// Perform a shift or rotate. The count is masked to 5 bits.
///
/// Returns None when the masked count is zero; the operand and flags are then
/// left untouched.
#[inline(always)]
pub fn shift_op<T: Word>(op: ShiftOp, eflags: u32, value: T, count: u8) -> Option<(T, u32)> {
    let count = (count & 0x1F) as u32;
    if count == 0 {
        return None;
    }
    let v = value.to_u32();
    let bits = T::BITS;
    let msb = |x: u32| (x >> (bits - 1)) & 1;

    let (result, new_flags) = match op {
        ShiftOp::Shl => {
            let wide = (v as u64) << count;
            let result = (wide as u32) & T::MASK;
            let carry = (wide >> bits) & 1 != 0;
            let overflow = count == 1 && (msb(result) != carry as u32);
            let flags = (eflags & !CPU_FLAGS_STATUS)
                | flag_bits(carry, overflow, false)
                | szp_flags(T::from_u32(result));
            (result, flags)
        }
        ShiftOp::Shr => {
            let result = v >> count;
            let carry = (v >> (count - 1)) & 1 != 0;
            let overflow = count == 1 && msb(v) != 0;
            let flags = (eflags & !(CPU_FLAGS_STATUS & !CPU_FLAG_AUX_CARRY))
                | flag_bits(carry, overflow, false)
                | szp_flags(T::from_u32(result));
            (result, flags)
        }
        ShiftOp::Sar => {
            let signed = value.sign_extend() as i32;
            let result = ((signed >> count.min(31)) as u32) & T::MASK;
            let carry = ((signed >> (count - 1).min(31)) & 1) != 0;
            let flags = (eflags & !(CPU_FLAGS_STATUS & !CPU_FLAG_AUX_CARRY))
                | flag_bits(carry, false, false)
                | szp_flags(T::from_u32(result));
            (result, flags)
        }
        ShiftOp::Rol => {
            let masked = count % bits;
            let result = if masked != 0 {
                ((v << masked) | (v >> (bits - masked))) & T::MASK
            }
            else {
                v
            };
            let carry = result & 1;
            let overflow = carry ^ msb(result);
            let flags = (eflags & !(CPU_FLAG_CARRY | CPU_FLAG_OVERFLOW)) | flag_bits(carry != 0, overflow != 0, false);
            (result, flags)
        }
        ShiftOp::Ror => {
            let masked = count % bits;
            let result = if masked != 0 {
                ((v >> masked) | (v << (bits - masked))) & T::MASK
            }
            else {
                v
            };
            let carry = msb(result);
            let overflow = msb(result) ^ ((result >> (bits - 2)) & 1);
            let flags = (eflags & !(CPU_FLAG_CARRY | CPU_FLAG_OVERFLOW)) | flag_bits(carry != 0, overflow != 0, false);
            (result, flags)
        }
        ShiftOp::Rcl => {
            let mut result = v;
            let mut carry = eflags & CPU_FLAG_CARRY;
            for _ in 0..count {
                let saved = result;
                result = ((saved << 1) | carry) & T::MASK;
                carry = msb(saved);
            }
            let overflow = msb(result) ^ carry;
            let flags = (eflags & !(CPU_FLAG_CARRY | CPU_FLAG_OVERFLOW)) | flag_bits(carry != 0, overflow != 0, false);
            (result, flags)
        }
        ShiftOp::Rcr => {
            let mut result = v;
            let mut carry = eflags & CPU_FLAG_CARRY;
            for _ in 0..count {
                let saved = result;
                result = ((saved >> 1) | (carry << (bits - 1))) & T::MASK;
                carry = saved & 1;
            }
            let overflow = msb(result) ^ ((result >> (bits - 2)) & 1);
            let flags = (eflags & !(CPU_FLAG_CARRY | CPU_FLAG_OVERFLOW)) | flag_bits(carry != 0, overflow != 0, false);
            (result, flags)
        }
    };
    Some((T::from_u32(result), new_flags))
}

/// Double precision shift (SHLD/SHRD). `fill` supplies the bits shifted in.
#[inline(always)]
pub fn double_shift<T: Word>(left: bool, eflags: u32, value: T, fill: T, count: u8) -> Option<(T, u32)> {
    let count = (count & 0x1F) as u32;
    if count == 0 {
        return None;
    }
    let bits = T::BITS;
    let v = value.to_u32() as u64;
    let f = fill.to_u32() as u64;
    let mask = T::MASK as u64;

    let (result, carry) = if left {
        // Concatenate value:fill and shift left.
        let wide = (v << bits) | f;
        let shifted = wide << count;
        let result = (shifted >> bits) & mask;
        let carry = (wide >> (2 * bits - count)) & 1;
        (result as u32, carry != 0)
    }
    else {
        // Concatenate fill:value and shift right.
        let wide = (f << bits) | v;
        let result = (wide >> count) & mask;
        let carry = (wide >> (count - 1)) & 1;
        (result as u32, carry != 0)
    };
    let overflow = ((result ^ value.to_u32()) & T::SIGN) != 0;
    let flags = (eflags & !(CPU_FLAGS_STATUS & !CPU_FLAG_AUX_CARRY))
        | flag_bits(carry, overflow, false)
        | szp_flags(T::from_u32(result));
    Some((T::from_u32(result), flags))
}

/// AND/OR/XOR/TEST style flags: CF, OF and AF cleared, SF/ZF/PF from the result.
#[inline(always)]
pub fn logic_flags<T: Word>(eflags: u32, result: T) -> u32 {
    (eflags & !CPU_FLAGS_STATUS) | szp_flags(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(f: u32) -> (bool, bool, bool, bool, bool, bool) {
        (
            f & CPU_FLAG_CARRY != 0,
            f & CPU_FLAG_OVERFLOW != 0,
            f & CPU_FLAG_AUX_CARRY != 0,
            f & CPU_FLAG_SIGN != 0,
            f & CPU_FLAG_ZERO != 0,
            f & CPU_FLAG_PARITY != 0,
        )
    }

    #[test]
    fn test_add8_signed_overflow() {
        let (result, f) = alu_op(AluOp::Add, 0, 0x7Fu8, 0x01u8);
        assert_eq!(result, 0x80);
        // CF, OF, AF, SF, ZF, PF
        assert_eq!(flags(f), (false, true, true, true, false, false));
    }

    #[test]
    fn test_add_carry_out() {
        let (result, f) = alu_op(AluOp::Add, 0, 0xFFu8, 0x01u8);
        assert_eq!(result, 0);
        assert_eq!(flags(f), (true, false, true, false, true, true));

        let (result, f) = alu_op(AluOp::Add, 0, 0xFFFFu16, 0x0001u16);
        assert_eq!(result, 0);
        assert_eq!(flags(f), (true, false, true, false, true, true));

        let (result, f) = alu_op(AluOp::Add, 0, 0xFFFF_FFFFu32, 0x0000_0001u32);
        assert_eq!(result, 0);
        assert_eq!(flags(f), (true, false, true, false, true, true));

        let (result, f) = alu_op(AluOp::Add, 0, 0x8000_0000u32, 0x8000_0000u32);
        assert_eq!(result, 0);
        assert_eq!(flags(f), (true, true, false, false, true, true));
    }

    #[test]
    fn test_adc_carry_in() {
        // 0xFF + 0xFF + 1 = 0x1FF
        let (result, f) = alu_op(AluOp::Adc, CPU_FLAG_CARRY, 0xFFu8, 0xFFu8);
        assert_eq!(result, 0xFF);
        assert_eq!(flags(f), (true, false, true, true, false, true));

        // A full-width addend plus carry must still carry out at 32 bits.
        let (result, f) = alu_op(AluOp::Adc, CPU_FLAG_CARRY, 0x0000_0000u32, 0xFFFF_FFFFu32);
        assert_eq!(result, 0);
        assert_eq!(flags(f), (true, false, true, false, true, true));

        let (result, f) = alu_op(AluOp::Adc, 0, 0x7FFFu16, 0x0000u16);
        assert_eq!(result, 0x7FFF);
        assert_eq!(flags(f), (false, false, false, false, false, true));

        let (result, f) = alu_op(AluOp::Adc, CPU_FLAG_CARRY, 0x7FFFu16, 0x0000u16);
        assert_eq!(result, 0x8000);
        assert_eq!(flags(f), (false, true, true, true, false, true));
    }

    #[test]
    fn test_sub_borrow() {
        let (result, f) = alu_op(AluOp::Sub, 0, 0x00u8, 0x01u8);
        assert_eq!(result, 0xFF);
        assert_eq!(flags(f), (true, false, true, true, false, true));

        let (result, f) = alu_op(AluOp::Sub, 0, 0x8000u16, 0x0001u16);
        assert_eq!(result, 0x7FFF);
        assert_eq!(flags(f), (false, true, true, false, false, true));

        let (result, f) = alu_op(AluOp::Sub, 0, 0x8000_0000u32, 0x0000_0001u32);
        assert_eq!(result, 0x7FFF_FFFF);
        assert_eq!(flags(f), (false, true, true, false, false, true));

        let (result, f) = alu_op(AluOp::Cmp, 0, 0x1234u16, 0x1234u16);
        assert_eq!(result, 0);
        assert_eq!(flags(f), (false, false, false, false, true, true));
    }

    #[test]
    fn test_sbb_carry_in() {
        let (result, f) = alu_op(AluOp::Sbb, CPU_FLAG_CARRY, 0x00u8, 0xFFu8);
        assert_eq!(result, 0x00);
        assert_eq!(flags(f), (true, false, true, false, true, true));

        let (result, f) = alu_op(AluOp::Sbb, CPU_FLAG_CARRY, 0x0000_0000u32, 0xFFFF_FFFFu32);
        assert_eq!(result, 0);
        assert_eq!(flags(f), (true, false, true, false, true, true));

        let (result, f) = alu_op(AluOp::Sbb, CPU_FLAG_CARRY, 0x10u8, 0x00u8);
        assert_eq!(result, 0x0F);
        assert_eq!(flags(f), (false, false, true, false, false, true));
    }

    #[test]
    fn test_logic_clears_carry_overflow() {
        let all = CPU_FLAGS_STATUS;
        let (result, f) = alu_op(AluOp::Xor, all, 0xAAu8, 0xAAu8);
        assert_eq!(result, 0);
        assert_eq!(flags(f), (false, false, false, false, true, true));
        let (result, f) = alu_op(AluOp::Or, all, 0x8000u16, 0x0001u16);
        assert_eq!(result, 0x8001);
        assert_eq!(flags(f), (false, false, false, true, false, false));
    }

    #[test]
    fn test_inc_dec_preserve_carry() {
        let (result, f) = alu_inc_dec(CPU_FLAG_CARRY, 0x7Fu8, false);
        assert_eq!(result, 0x80);
        assert_eq!(flags(f), (true, true, true, true, false, false));
        let (result, f) = alu_inc_dec(0, 0x0000u16, true);
        assert_eq!(result, 0xFFFF);
        assert_eq!(flags(f), (false, false, true, true, false, true));
    }

    #[test]
    fn test_neg() {
        let (result, f) = alu_neg(0, 0x01u8);
        assert_eq!(result, 0xFF);
        assert_eq!(flags(f).0, true);
        let (result, f) = alu_neg(CPU_FLAG_CARRY, 0x00u16);
        assert_eq!(result, 0);
        assert_eq!(flags(f).0, false);
        let (result, f) = alu_neg(0, 0x8000_0000u32);
        assert_eq!(result, 0x8000_0000);
        assert_eq!(flags(f).1, true);
    }

    #[test]
    fn test_alu_shr() {
        let (result, f) = shift_op(ShiftOp::Shr, 0, 0x80u8, 7).unwrap();
        assert_eq!(result, 1);
        assert_eq!(f & CPU_FLAG_CARRY, 0);
        let (result, f) = shift_op(ShiftOp::Shr, 0, 0x04u8, 3).unwrap();
        assert_eq!(result, 0);
        assert_eq!(f & CPU_FLAG_CARRY, CPU_FLAG_CARRY);

        let (result16, f) = shift_op(ShiftOp::Shr, 0, 0x0101u16, 1).unwrap();
        assert_eq!(result16, 0x0080);
        assert_eq!(f & CPU_FLAG_CARRY, CPU_FLAG_CARRY);
        assert!(shift_op(ShiftOp::Shr, 0, 0x0101u16, 0x20).is_none());
    }

    #[test]
    fn test_alu_shl() {
        let (result, f) = shift_op(ShiftOp::Shl, 0, 0x80u8, 1).unwrap();
        assert_eq!(result, 0);
        assert_eq!(f & (CPU_FLAG_CARRY | CPU_FLAG_OVERFLOW), CPU_FLAG_CARRY | CPU_FLAG_OVERFLOW);
        let (result, f) = shift_op(ShiftOp::Shl, 0, 0xFF00u16, 8).unwrap();
        assert_eq!(result, 0x0000);
        assert_eq!(f & CPU_FLAG_CARRY, CPU_FLAG_CARRY);
        let (result, f) = shift_op(ShiftOp::Shl, 0, 0x4000_0000u32, 1).unwrap();
        assert_eq!(result, 0x8000_0000);
        assert_eq!(f & (CPU_FLAG_CARRY | CPU_FLAG_OVERFLOW), CPU_FLAG_OVERFLOW);
    }

    #[test]
    fn test_alu_sar() {
        let (result, f) = shift_op(ShiftOp::Sar, 0, 0x80u8, 3).unwrap();
        assert_eq!(result, 0xF0);
        assert_eq!(f & CPU_FLAG_CARRY, 0);
        let (result, f) = shift_op(ShiftOp::Sar, 0, 0x8001u16, 1).unwrap();
        assert_eq!(result, 0xC000);
        assert_eq!(f & CPU_FLAG_CARRY, CPU_FLAG_CARRY);
        let (result, _) = shift_op(ShiftOp::Sar, 0, 0x8000_0000u32, 31).unwrap();
        assert_eq!(result, 0xFFFF_FFFF);
    }

    #[test]
    fn test_alu_rotates() {
        let (result, f) = shift_op(ShiftOp::Rol, 0, 0x81u8, 1).unwrap();
        assert_eq!(result, 0x03);
        assert_eq!(f & CPU_FLAG_CARRY, CPU_FLAG_CARRY);
        let (result, f) = shift_op(ShiftOp::Ror, 0, 0x01u16, 1).unwrap();
        assert_eq!(result, 0x8000);
        assert_eq!(f & CPU_FLAG_CARRY, CPU_FLAG_CARRY);

        let (result, f) = shift_op(ShiftOp::Rcr, 0, 0x01u8, 1).unwrap();
        assert_eq!(result, 0x00);
        assert_eq!(f & CPU_FLAG_CARRY, CPU_FLAG_CARRY);
        let (result, f) = shift_op(ShiftOp::Rcr, 0, 0x01u8, 3).unwrap();
        assert_eq!(result, 0x40);
        assert_eq!(f & CPU_FLAG_CARRY, 0);
        let (result, _) = shift_op(ShiftOp::Rcr, CPU_FLAG_CARRY, 0x00u8, 1).unwrap();
        assert_eq!(result, 0x80);

        // HO bit changed from 1 to 0
        let (result, f) = shift_op(ShiftOp::Rcr, 0, 0x80u8, 1).unwrap();
        assert_eq!(result, 0x40);
        assert_eq!(f & CPU_FLAG_OVERFLOW, CPU_FLAG_OVERFLOW);

        let (result, f) = shift_op(ShiftOp::Rcl, CPU_FLAG_CARRY, 0x80u8, 1).unwrap();
        assert_eq!(result, 0x01);
        assert_eq!(f & CPU_FLAG_CARRY, CPU_FLAG_CARRY);
    }

    #[test]
    fn test_double_shift() {
        let (result, f) = double_shift(true, 0, 0x1234u16, 0xABCDu16, 4).unwrap();
        assert_eq!(result, 0x234A);
        assert_eq!(f & CPU_FLAG_CARRY, CPU_FLAG_CARRY);
        let (result, f) = double_shift(false, 0, 0x1234_5678u32, 0x9ABC_DEF0u32, 8).unwrap();
        assert_eq!(result, 0xF012_3456);
        assert_eq!(f & CPU_FLAG_CARRY, 0);
    }
}
