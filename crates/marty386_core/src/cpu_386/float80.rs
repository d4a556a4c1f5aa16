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

    cpu_386::float80.rs

    80-bit extended precision values.

    F80 holds the register image exactly: a 64-bit significand with an
    explicit integer bit, and a sign/exponent word with a bias of 16383.
    Loads, stores, integer and BCD conversions, comparisons and the basic
    arithmetic operations (add, subtract, multiply, divide, square root,
    partial remainder, scale and round) are carried out on that image with
    integer arithmetic and honour the rounding and precision controls. The
    transcendental instructions go through f64.

    Every operation returns the x87 exception flags it raised; the caller
    decides whether they abort the instruction.

*/

use std::cmp::Ordering;

use crate::cpu_386::fpu::{
    RoundingMode,
    FPU_EXCEPTION_DENORMAL,
    FPU_EXCEPTION_INVALID,
    FPU_EXCEPTION_OVERFLOW,
    FPU_EXCEPTION_PRECISION,
    FPU_EXCEPTION_UNDERFLOW,
    FPU_EXCEPTION_ZERO_DIVIDE,
};

pub const EXPONENT_BIAS: i32 = 16383;
const EXPONENT_MAX: u16 = 0x7FFF;
const INTEGER_BIT: u64 = 1 << 63;
const QUIET_BIT: u64 = 1 << 62;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct F80 {
    pub significand: u64,
    pub sign_exponent: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum F80Class {
    /// Unnormals, pseudo-NaNs and pseudo-infinities. The 387 and later reject these.
    Unsupported,
    Nan,
    Infinity,
    Zero,
    Denormal,
    Normal,
}

/// A finite non-zero value. `significand` has bit 63 set and the value is
/// significand * 2^(exponent - 63).
#[derive(Copy, Clone, Debug)]
struct Unpacked {
    negative: bool,
    exponent: i32,
    significand: u64,
}

/// The outcome of one FPREM or FPREM1 step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PartialRemainder {
    pub value: F80,
    /// Low bits of the quotient, reported in C0, C3 and C1.
    pub quotient: u64,
    /// Clear when the exponent difference was too large to finish in one step (C2 set).
    pub complete: bool,
}

impl F80 {
    pub const ZERO: F80 = F80::new(false, 0, 0);
    pub const ONE: F80 = F80::new(false, 0x3FFF, INTEGER_BIT);
    pub const INFINITY: F80 = F80::new(false, EXPONENT_MAX, INTEGER_BIT);
    /// The quiet NaN produced by a masked invalid operation.
    pub const INDEFINITE: F80 = F80::new(true, EXPONENT_MAX, 0xC000_0000_0000_0000);

    pub const PI: F80 = F80::new(false, 0x4000, 0xC90F_DAA2_2168_C235);
    pub const LOG2_10: F80 = F80::new(false, 0x4000, 0xD49A_784B_CD1B_8AFE);
    pub const LOG2_E: F80 = F80::new(false, 0x3FFF, 0xB8AA_3B29_5C17_F0BC);
    pub const LOG10_2: F80 = F80::new(false, 0x3FFD, 0x9A20_9A84_FBCF_F799);
    pub const LN_2: F80 = F80::new(false, 0x3FFE, 0xB172_17F7_D1CF_79AC);

    pub const fn new(negative: bool, exponent: u16, significand: u64) -> Self {
        F80 {
            significand,
            sign_exponent: ((negative as u16) << 15) | (exponent & EXPONENT_MAX),
        }
    }

    /// From the memory image: the significand at offset 0, the sign and exponent at offset 8.
    pub fn from_parts(significand: u64, sign_exponent: u16) -> Self {
        F80 {
            significand,
            sign_exponent,
        }
    }

    #[inline]
    pub fn is_negative(&self) -> bool {
        self.sign_exponent & 0x8000 != 0
    }

    /// The biased exponent field.
    #[inline]
    pub fn exponent(&self) -> u16 {
        self.sign_exponent & EXPONENT_MAX
    }

    pub fn class(&self) -> F80Class {
        let significand = self.significand;
        match self.exponent() {
            0 if significand == 0 => F80Class::Zero,
            0 => F80Class::Denormal,
            _ if significand & INTEGER_BIT == 0 => F80Class::Unsupported,
            EXPONENT_MAX if significand << 1 == 0 => F80Class::Infinity,
            EXPONENT_MAX => F80Class::Nan,
            _ => F80Class::Normal,
        }
    }

    pub fn is_nan(&self) -> bool {
        self.class() == F80Class::Nan
    }

    pub fn is_zero(&self) -> bool {
        self.class() == F80Class::Zero
    }

    pub fn is_infinite(&self) -> bool {
        self.class() == F80Class::Infinity
    }

    pub fn is_signaling_nan(&self) -> bool {
        self.is_nan() && self.significand & QUIET_BIT == 0
    }

    fn is_finite_non_zero(&self) -> bool {
        matches!(self.class(), F80Class::Normal | F80Class::Denormal)
    }

    pub fn quieted(self) -> Self {
        F80 {
            significand: self.significand | QUIET_BIT,
            ..self
        }
    }

    pub fn neg(self) -> Self {
        F80 {
            sign_exponent: self.sign_exponent ^ 0x8000,
            ..self
        }
    }

    pub fn abs(self) -> Self {
        self.with_sign(false)
    }

    pub fn with_sign(self, negative: bool) -> Self {
        F80 {
            sign_exponent: (self.sign_exponent & EXPONENT_MAX) | ((negative as u16) << 15),
            ..self
        }
    }

    fn unpack(&self) -> Unpacked {
        let shift = self.significand.leading_zeros();
        Unpacked {
            negative: self.is_negative(),
            exponent: (self.exponent() as i32).max(1) - EXPONENT_BIAS - shift as i32,
            significand: self.significand << shift,
        }
    }

    fn denormal_flag(values: &[F80]) -> u16 {
        match values.iter().any(|v| v.class() == F80Class::Denormal) {
            true => FPU_EXCEPTION_DENORMAL,
            false => 0,
        }
    }

    /// The result of an operation with a NaN or unsupported operand, if there is one.
    pub fn propagate_nan(a: F80, b: F80) -> Option<(F80, u16)> {
        let (class_a, class_b) = (a.class(), b.class());
        if class_a == F80Class::Unsupported || class_b == F80Class::Unsupported {
            return Some((F80::INDEFINITE, FPU_EXCEPTION_INVALID));
        }
        let flags = match a.is_signaling_nan() || b.is_signaling_nan() {
            true => FPU_EXCEPTION_INVALID,
            false => 0,
        };
        let result = match (class_a, class_b) {
            // The larger significand wins
            (F80Class::Nan, F80Class::Nan) if b.significand << 1 > a.significand << 1 => b,
            (F80Class::Nan, _) => a,
            (_, F80Class::Nan) => b,
            _ => return None,
        };
        Some((result.quieted(), flags))
    }

    pub fn from_i64(value: i64) -> Self {
        F80::from_magnitude(value < 0, value.unsigned_abs())
    }

    fn from_magnitude(negative: bool, magnitude: u64) -> Self {
        if magnitude == 0 {
            return F80::ZERO.with_sign(negative);
        }
        let shift = magnitude.leading_zeros();
        F80::new(negative, (EXPONENT_BIAS + 63 - shift as i32) as u16, magnitude << shift)
    }

    pub fn from_f64(value: f64) -> Self {
        F80::from_binary(value.to_bits(), 52, 11).0
    }

    /// Load a single precision value, with the exception flags the load raises.
    pub fn from_f32_bits(bits: u32) -> (Self, u16) {
        F80::from_binary(bits as u64, 23, 8)
    }

    /// Load a double precision value, with the exception flags the load raises.
    pub fn from_f64_bits(bits: u64) -> (Self, u16) {
        F80::from_binary(bits, 52, 11)
    }

    /// Widen an IEEE binary format. Every value is exactly representable.
    fn from_binary(bits: u64, fraction_bits: u32, exponent_bits: u32) -> (Self, u16) {
        let negative = (bits >> (fraction_bits + exponent_bits)) & 1 != 0;
        let exponent_all = (1u64 << exponent_bits) - 1;
        let exponent = (bits >> fraction_bits) & exponent_all;
        let fraction = bits & ((1u64 << fraction_bits) - 1);
        let bias = (1i32 << (exponent_bits - 1)) - 1;
        let align = 63 - fraction_bits;

        if exponent == exponent_all {
            if fraction == 0 {
                return (F80::INFINITY.with_sign(negative), 0);
            }
            let nan = F80::new(negative, EXPONENT_MAX, INTEGER_BIT | (fraction << align));
            let flags = match nan.is_signaling_nan() {
                true => FPU_EXCEPTION_INVALID,
                false => 0,
            };
            return (nan.quieted(), flags);
        }
        if exponent == 0 {
            if fraction == 0 {
                return (F80::ZERO.with_sign(negative), 0);
            }
            let shift = fraction.leading_zeros();
            let biased = 1 - bias - fraction_bits as i32 - shift as i32 + 63 + EXPONENT_BIAS;
            return (
                F80::new(negative, biased as u16, fraction << shift),
                FPU_EXCEPTION_DENORMAL,
            );
        }
        let biased = exponent as i32 - bias + EXPONENT_BIAS;
        (F80::new(negative, biased as u16, INTEGER_BIT | (fraction << align)), 0)
    }

    /// Nearest f64. Exponents beyond the f64 range saturate to infinity or flush toward zero.
    pub fn to_f64(&self) -> f64 {
        f64::from_bits(self.to_binary(RoundingMode::Nearest, 52, 11).0)
    }

    pub fn to_f64_rounded(&self, mode: RoundingMode) -> (f64, u16) {
        let (bits, flags) = self.to_binary(mode, 52, 11);
        (f64::from_bits(bits), flags)
    }

    pub fn to_f32_rounded(&self, mode: RoundingMode) -> (f32, u16) {
        let (bits, flags) = self.to_binary(mode, 23, 8);
        (f32::from_bits(bits as u32), flags)
    }

    /// Narrow to an IEEE binary format.
    fn to_binary(&self, mode: RoundingMode, fraction_bits: u32, exponent_bits: u32) -> (u64, u16) {
        let sign = (self.is_negative() as u64) << (fraction_bits + exponent_bits);
        let exponent_all = (1u64 << exponent_bits) - 1;
        let infinity = exponent_all << fraction_bits;
        let quiet = 1u64 << (fraction_bits - 1);

        let class = self.class();
        match class {
            F80Class::Zero => return (sign, 0),
            F80Class::Infinity => return (sign | infinity, 0),
            F80Class::Nan => {
                let payload = (self.significand << 1) >> (64 - fraction_bits);
                let flags = match self.is_signaling_nan() {
                    true => FPU_EXCEPTION_INVALID,
                    false => 0,
                };
                return (sign | infinity | quiet | payload, flags);
            }
            F80Class::Unsupported => {
                let indefinite = (1u64 << (fraction_bits + exponent_bits)) | infinity | quiet;
                return (indefinite, FPU_EXCEPTION_INVALID);
            }
            F80Class::Denormal | F80Class::Normal => {}
        }

        let mut flags = F80::denormal_flag(&[*self]);
        let value = self.unpack();
        let bias = (1i32 << (exponent_bits - 1)) - 1;
        let biased = value.exponent + bias;

        let overflow = |flags: u16| {
            let to_infinity = match mode {
                RoundingMode::Nearest => true,
                RoundingMode::Up => !value.negative,
                RoundingMode::Down => value.negative,
                RoundingMode::TowardZero => false,
            };
            let magnitude = match to_infinity {
                true => infinity,
                false => infinity - 1,
            };
            (sign | magnitude, flags | FPU_EXCEPTION_OVERFLOW | FPU_EXCEPTION_PRECISION)
        };
        if biased >= exponent_all as i32 {
            return overflow(flags);
        }

        // Keep fraction_bits + 1 bits, and fewer once the result is denormal
        let tiny = biased < 1;
        let shift = 128 - (fraction_bits + 1) + (1 - biased).max(0) as u32;
        let (mantissa, inexact) = shift_right_round((value.significand as u128) << 64, shift, value.negative, mode);
        // A carry out of the mantissa moves into the exponent field
        let bits = match tiny {
            true => mantissa as u64,
            false => (((biased - 1) as u64) << fraction_bits) + mantissa as u64,
        };
        if inexact {
            flags |= FPU_EXCEPTION_PRECISION;
            if tiny {
                flags |= FPU_EXCEPTION_UNDERFLOW;
            }
        }
        if bits >> fraction_bits >= exponent_all {
            return overflow(flags);
        }
        (sign | bits, flags)
    }

    /// Round to a signed integer `bits` wide. None for NaN, infinity and values out of range.
    pub fn to_integer(&self, mode: RoundingMode, bits: u32) -> (Option<i64>, u16) {
        match self.class() {
            F80Class::Zero => return (Some(0), 0),
            F80Class::Denormal | F80Class::Normal => {}
            _ => return (None, 0),
        }
        let value = self.unpack();
        if value.exponent >= 64 {
            return (None, 0);
        }
        let shift = (63 - value.exponent) as u32;
        let (magnitude, inexact) = shift_right_round(value.significand as u128, shift, value.negative, mode);
        let limit = 1u128 << (bits - 1);
        let in_range = match value.negative {
            true => magnitude <= limit,
            false => magnitude < limit,
        };
        if !in_range {
            return (None, 0);
        }
        let integer = match value.negative {
            true => (magnitude as i128).wrapping_neg() as i64,
            false => magnitude as i64,
        };
        let flags = match inexact {
            true => FPU_EXCEPTION_PRECISION,
            false => 0,
        };
        (Some(integer), flags)
    }

    /// FRNDINT
    pub fn round_to_integer(&self, mode: RoundingMode) -> (F80, u16) {
        match self.class() {
            F80Class::Denormal | F80Class::Normal => {}
            F80Class::Nan | F80Class::Unsupported => return F80::propagate_nan(*self, *self).unwrap_or_default(),
            _ => return (*self, 0),
        }
        let value = self.unpack();
        if value.exponent >= 63 {
            return (*self, 0);
        }
        let shift = (63 - value.exponent) as u32;
        let (magnitude, inexact) = shift_right_round(value.significand as u128, shift, value.negative, mode);
        let mut flags = F80::denormal_flag(&[*self]);
        if inexact {
            flags |= FPU_EXCEPTION_PRECISION;
        }
        // At most 2^63, so it fits
        (F80::from_magnitude(value.negative, magnitude as u64), flags)
    }

    /// Ordering of two values. None when either is a NaN or unsupported.
    pub fn compare(&self, other: &F80) -> Option<Ordering> {
        let (class_a, class_b) = (self.class(), other.class());
        let unordered = |class| matches!(class, F80Class::Nan | F80Class::Unsupported);
        if unordered(class_a) || unordered(class_b) {
            return None;
        }
        let magnitude = |value: &F80, class| match class {
            F80Class::Zero => (i32::MIN, 0),
            F80Class::Infinity => (i32::MAX, 0),
            _ => {
                let unpacked = value.unpack();
                (unpacked.exponent, unpacked.significand)
            }
        };
        let negative_a = self.is_negative() && class_a != F80Class::Zero;
        let negative_b = other.is_negative() && class_b != F80Class::Zero;
        let (a, b) = (magnitude(self, class_a), magnitude(other, class_b));
        Some(match (negative_a, negative_b) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => a.cmp(&b),
            (true, true) => b.cmp(&a),
        })
    }

    pub fn add(self, other: F80, mode: RoundingMode, precision: u32) -> (F80, u16) {
        F80::add_signed(self, other, false, mode, precision)
    }

    pub fn sub(self, other: F80, mode: RoundingMode, precision: u32) -> (F80, u16) {
        F80::add_signed(self, other, true, mode, precision)
    }

    fn add_signed(a: F80, b: F80, subtract: bool, mode: RoundingMode, precision: u32) -> (F80, u16) {
        if let Some(result) = F80::propagate_nan(a, b) {
            return result;
        }
        let flags = F80::denormal_flag(&[a, b]);
        let negative_b = b.is_negative() ^ subtract;
        let signed_zero = |negative_a: bool| match negative_a == negative_b {
            true => negative_a,
            false => mode == RoundingMode::Down,
        };

        match (a.class(), b.class()) {
            (F80Class::Infinity, F80Class::Infinity) if a.is_negative() != negative_b => {
                (F80::INDEFINITE, FPU_EXCEPTION_INVALID)
            }
            (F80Class::Infinity, _) => (a, flags),
            (_, F80Class::Infinity) => (F80::INFINITY.with_sign(negative_b), flags),
            (F80Class::Zero, F80Class::Zero) => (F80::ZERO.with_sign(signed_zero(a.is_negative())), 0),
            (F80Class::Zero, _) => {
                let (result, rounding) = b.with_sign(negative_b).round_to_precision(mode, precision);
                (result, flags | rounding)
            }
            (_, F80Class::Zero) => {
                let (result, rounding) = a.round_to_precision(mode, precision);
                (result, flags | rounding)
            }
            _ => {
                let x = a.unpack();
                let y = Unpacked {
                    negative: negative_b,
                    ..b.unpack()
                };
                let (x, y) = match (x.exponent, x.significand) >= (y.exponent, y.significand) {
                    true => (x, y),
                    false => (y, x),
                };
                // Two bits of headroom above the significand
                let mx = (x.significand as u128) << 62;
                let my = shift_right_sticky((y.significand as u128) << 62, (x.exponent - y.exponent) as u32);
                let m = match x.negative == y.negative {
                    true => mx + my,
                    false => mx - my,
                };
                if m == 0 {
                    return (F80::ZERO.with_sign(mode == RoundingMode::Down), flags);
                }
                let (result, rounding) = round_pack(x.negative, x.exponent + 2, m, mode, precision);
                (result, flags | rounding)
            }
        }
    }

    pub fn mul(self, other: F80, mode: RoundingMode, precision: u32) -> (F80, u16) {
        if let Some(result) = F80::propagate_nan(self, other) {
            return result;
        }
        let flags = F80::denormal_flag(&[self, other]);
        let negative = self.is_negative() ^ other.is_negative();
        match (self.class(), other.class()) {
            (F80Class::Infinity, F80Class::Zero) | (F80Class::Zero, F80Class::Infinity) => {
                (F80::INDEFINITE, FPU_EXCEPTION_INVALID)
            }
            (F80Class::Infinity, _) | (_, F80Class::Infinity) => (F80::INFINITY.with_sign(negative), flags),
            (F80Class::Zero, _) | (_, F80Class::Zero) => (F80::ZERO.with_sign(negative), flags),
            _ => {
                let (x, y) = (self.unpack(), other.unpack());
                let m = x.significand as u128 * y.significand as u128;
                let (result, rounding) = round_pack(negative, x.exponent + y.exponent + 1, m, mode, precision);
                (result, flags | rounding)
            }
        }
    }

    pub fn div(self, other: F80, mode: RoundingMode, precision: u32) -> (F80, u16) {
        if let Some(result) = F80::propagate_nan(self, other) {
            return result;
        }
        let flags = F80::denormal_flag(&[self, other]);
        let negative = self.is_negative() ^ other.is_negative();
        match (self.class(), other.class()) {
            (F80Class::Infinity, F80Class::Infinity) | (F80Class::Zero, F80Class::Zero) => {
                (F80::INDEFINITE, FPU_EXCEPTION_INVALID)
            }
            (F80Class::Infinity, _) => (F80::INFINITY.with_sign(negative), flags),
            (_, F80Class::Infinity) | (F80Class::Zero, _) => (F80::ZERO.with_sign(negative), flags),
            (_, F80Class::Zero) => (F80::INFINITY.with_sign(negative), flags | FPU_EXCEPTION_ZERO_DIVIDE),
            _ => {
                let (x, y) = (self.unpack(), other.unpack());
                let divisor = y.significand as u128;
                let dividend = (x.significand as u128) << 63;
                let high = dividend / divisor;
                let low_dividend = (dividend % divisor) << 64;
                let low = low_dividend / divisor;
                let sticky = (low_dividend % divisor != 0) as u128;
                let m = (high << 64) | low | sticky;
                let (result, rounding) = round_pack(negative, x.exponent - y.exponent, m, mode, precision);
                (result, flags | rounding)
            }
        }
    }

    pub fn sqrt(self, mode: RoundingMode, precision: u32) -> (F80, u16) {
        match self.class() {
            F80Class::Nan | F80Class::Unsupported => return F80::propagate_nan(self, self).unwrap_or_default(),
            F80Class::Zero => return (self, 0),
            _ if self.is_negative() => {
                return (F80::INDEFINITE, FPU_EXCEPTION_INVALID | F80::denormal_flag(&[self]));
            }
            F80Class::Infinity => return (self, 0),
            F80Class::Denormal | F80Class::Normal => {}
        }
        let value = self.unpack();
        // An even power of two, with the radicand in [2^126, 2^128)
        let shift = match value.exponent.rem_euclid(2) {
            0 => 63,
            _ => 64,
        };
        let (root, remainder) = integer_sqrt((value.significand as u128) << shift);
        let mut m = root << 64;
        if remainder > root {
            m |= (1 << 63) | 1;
        }
        else if remainder != 0 {
            m |= 1;
        }
        let half_exponent = (value.exponent - 63 - shift) / 2;
        let (result, rounding) = round_pack(false, half_exponent + 63, m, mode, precision);
        (result, rounding | F80::denormal_flag(&[self]))
    }

    /// FSCALE: multiply by 2^by.
    pub fn scale(self, by: i32, mode: RoundingMode) -> (F80, u16) {
        match self.class() {
            F80Class::Nan | F80Class::Unsupported => F80::propagate_nan(self, self).unwrap_or_default(),
            F80Class::Denormal | F80Class::Normal => {
                let value = self.unpack();
                let exponent = value.exponent.saturating_add(by.clamp(-0x10000, 0x10000));
                let (result, rounding) =
                    round_pack(value.negative, exponent, (value.significand as u128) << 64, mode, 64);
                (result, rounding | F80::denormal_flag(&[self]))
            }
            _ => (self, 0),
        }
    }

    /// FXTRACT on a finite non-zero value: the unbiased exponent, and the significand
    /// with the exponent of 1.0.
    pub fn extract(self) -> (F80, F80) {
        let value = self.unpack();
        (
            F80::from_i64(value.exponent as i64),
            F80::new(value.negative, EXPONENT_BIAS as u16, value.significand),
        )
    }

    /// One step of FPREM (truncating quotient) or FPREM1 (nearest quotient).
    pub fn partial_remainder(self, divisor: F80, nearest: bool) -> (PartialRemainder, u16) {
        let unchanged = |value: F80| PartialRemainder {
            value,
            quotient: 0,
            complete: true,
        };
        if let Some((value, flags)) = F80::propagate_nan(self, divisor) {
            return (unchanged(value), flags);
        }
        let flags = F80::denormal_flag(&[self, divisor]);
        if self.is_infinite() || divisor.is_zero() {
            return (unchanged(F80::INDEFINITE), FPU_EXCEPTION_INVALID);
        }
        if self.is_zero() || divisor.is_infinite() {
            return (unchanged(self), flags);
        }

        let (x, y) = (self.unpack(), divisor.unpack());
        let difference = x.exponent - y.exponent;
        if difference < 0 {
            // |x| < |y|. FPREM1 still rounds the quotient up past half the divisor.
            if nearest && difference == -1 && x.significand > y.significand {
                let m = ((y.significand as u128) << 1) - x.significand as u128;
                let (value, _) = round_pack(!x.negative, x.exponent + 64, m, RoundingMode::Nearest, 64);
                let result = PartialRemainder {
                    value,
                    quotient: 1,
                    complete: true,
                };
                return (result, flags);
            }
            return (unchanged(self), flags);
        }

        // Reduce by at most 64 quotient bits per step
        let stop = match difference < 64 {
            true => 0,
            false => difference - 63,
        };
        let divisor_m = y.significand as u128;
        let mut remainder = x.significand as u128;
        let mut quotient = 0u64;
        let mut position = difference;
        loop {
            quotient <<= 1;
            if remainder >= divisor_m {
                remainder -= divisor_m;
                quotient |= 1;
            }
            if position == stop {
                break;
            }
            remainder <<= 1;
            position -= 1;
        }

        let complete = stop == 0;
        let mut negative = x.negative;
        if complete && nearest {
            let twice = remainder << 1;
            if twice > divisor_m || (twice == divisor_m && quotient & 1 != 0) {
                remainder = divisor_m - remainder;
                negative = !negative;
                quotient = quotient.wrapping_add(1);
            }
        }
        let value = match remainder {
            0 => F80::ZERO.with_sign(x.negative),
            _ => round_pack(negative, y.exponent + stop + 64, remainder, RoundingMode::Nearest, 64).0,
        };
        let result = PartialRemainder {
            value,
            quotient,
            complete,
        };
        (result, flags)
    }

    /// Round a finite value to the precision control setting.
    fn round_to_precision(self, mode: RoundingMode, precision: u32) -> (F80, u16) {
        if !self.is_finite_non_zero() || precision >= 64 {
            return (self, 0);
        }
        let value = self.unpack();
        round_pack(value.negative, value.exponent, (value.significand as u128) << 64, mode, precision)
    }

    /// Decode 18-digit packed BCD (FBLD). None if a digit is out of range.
    pub fn from_bcd(bytes: &[u8; 10]) -> Option<F80> {
        let mut magnitude: u64 = 0;
        for byte in bytes[..9].iter().rev() {
            let (high, low) = ((byte >> 4) as u64, (byte & 0x0F) as u64);
            if high > 9 || low > 9 {
                return None;
            }
            magnitude = magnitude * 100 + high * 10 + low;
        }
        Some(F80::from_magnitude(bytes[9] & 0x80 != 0, magnitude))
    }

    /// Encode to 18-digit packed BCD (FBSTP), rounding by `mode`. None if the value does not fit.
    pub fn to_bcd(&self, mode: RoundingMode) -> (Option<[u8; 10]>, u16) {
        let (integer, flags) = self.to_integer(mode, 64);
        let Some(integer) = integer
        else {
            return (None, flags);
        };
        let mut digits = integer.unsigned_abs();
        if digits >= 1_000_000_000_000_000_000 {
            return (None, flags);
        }
        let mut out = [0u8; 10];
        for byte in out[..9].iter_mut() {
            let low = (digits % 10) as u8;
            digits /= 10;
            let high = (digits % 10) as u8;
            digits /= 10;
            *byte = (high << 4) | low;
        }
        if self.is_negative() {
            out[9] = 0x80;
        }
        (Some(out), flags)
    }
}

/// Shift right, ORing every bit shifted out into bit 0.
fn shift_right_sticky(m: u128, shift: u32) -> u128 {
    match shift {
        0 => m,
        1..=127 => (m >> shift) | ((m & ((1u128 << shift) - 1) != 0) as u128),
        _ => (m != 0) as u128,
    }
}

/// Shift right by `shift` bits and round the bits shifted out. Returns the rounded value and
/// whether it is inexact.
fn shift_right_round(m: u128, shift: u32, negative: bool, mode: RoundingMode) -> (u128, bool) {
    let (kept, half, sticky) = match shift {
        0 => (m, false, false),
        1..=127 => (
            m >> shift,
            (m >> (shift - 1)) & 1 != 0,
            m & ((1u128 << (shift - 1)) - 1) != 0,
        ),
        128 => (0, m >> 127 != 0, m & (u128::MAX >> 1) != 0),
        _ => (0, false, m != 0),
    };
    let inexact = half || sticky;
    let round_up = match mode {
        RoundingMode::Nearest => half && (sticky || kept & 1 != 0),
        RoundingMode::Up => inexact && !negative,
        RoundingMode::Down => inexact && negative,
        RoundingMode::TowardZero => false,
    };
    (kept + round_up as u128, inexact)
}

/// Normalize `m * 2^(exponent - 127)` and round it to `precision` significand bits.
fn round_pack(negative: bool, exponent: i32, m: u128, mode: RoundingMode, precision: u32) -> (F80, u16) {
    let normalize = m.leading_zeros();
    let m = m << normalize;
    let biased = exponent - normalize as i32 + EXPONENT_BIAS;
    let tiny = biased < 1;

    let shift = 128 - precision + (1 - biased).max(0) as u32;
    let (mut mantissa, inexact) = shift_right_round(m, shift, negative, mode);
    let mut biased = biased.max(1);
    if mantissa >> precision != 0 {
        mantissa >>= 1;
        biased += 1;
    }

    let mut flags = 0;
    if inexact {
        flags |= FPU_EXCEPTION_PRECISION;
        if tiny {
            flags |= FPU_EXCEPTION_UNDERFLOW;
        }
    }
    if biased >= EXPONENT_MAX as i32 {
        flags |= FPU_EXCEPTION_OVERFLOW | FPU_EXCEPTION_PRECISION;
        let to_infinity = match mode {
            RoundingMode::Nearest => true,
            RoundingMode::Up => !negative,
            RoundingMode::Down => negative,
            RoundingMode::TowardZero => false,
        };
        let result = match to_infinity {
            true => F80::INFINITY.with_sign(negative),
            false => F80::new(negative, EXPONENT_MAX - 1, u64::MAX << (64 - precision)),
        };
        return (result, flags);
    }

    let significand = (mantissa as u64) << (64 - precision);
    // A denormal that rounded up into the integer bit becomes normal
    let exponent = match significand & INTEGER_BIT {
        0 => 0,
        _ => biased as u16,
    };
    (F80::new(negative, exponent, significand), flags)
}

/// Integer square root and remainder.
fn integer_sqrt(value: u128) -> (u128, u128) {
    let mut remainder = value;
    let mut root = 0u128;
    let mut bit = 1u128 << 126;
    while bit > value {
        bit >>= 2;
    }
    while bit != 0 {
        if remainder >= root + bit {
            remainder -= root + bit;
            root = (root >> 1) + bit;
        }
        else {
            root >>= 1;
        }
        bit >>= 2;
    }
    (root, remainder)
}
