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

    cpu_386::modrm.rs

    ModRM and SIB addressing-mode resolution.

    A ModRM byte is reduced to a 5-bit index of its mod and r/m fields, which
    selects an entry from one of two const tables, one per address size. Each
    entry names the addressing mode, its base and index registers, how many
    displacement bytes follow and the default segment. The effective address
    is calculated from the entry at execute time.

*/

use crate::cpu_386::instruction::Instruction;
use crate::cpu_common::{AddressSize, Registers, Segment};

pub const MODRM_MOD_MASK: u8 = 0b11_000_000;
pub const MODRM_REG_MASK: u8 = 0b00_111_000;
pub const MODRM_RM_MASK: u8 = 0b00_000_111;

const REG_EBX: u8 = 3;
const REG_ESP: u8 = 4;
const REG_EBP: u8 = 5;
const REG_ESI: u8 = 6;
const REG_EDI: u8 = 7;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ModRmMode {
    /// mod == 11, the r/m field names a register.
    Register,
    /// Displacement only.
    Direct,
    /// [base]
    Indirect,
    /// [base + disp]
    Indexed,
    /// [base + index]
    BasedIndexed,
    /// [base + index + disp]
    BasedIndexedDisplacement,
    /// A SIB byte follows the ModRM byte.
    Sib,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ModRmAddress {
    pub mode: ModRmMode,
    /// Base register, or the register operand in Register mode.
    pub base: u8,
    pub index: u8,
    pub displacement_size: u8,
    pub default_segment: Segment,
}

impl ModRmAddress {
    const fn new(mode: ModRmMode, base: u8, index: u8, displacement_size: u8, default_segment: Segment) -> Self {
        Self {
            mode,
            base,
            index,
            displacement_size,
            default_segment,
        }
    }

    const fn register(reg: u8) -> Self {
        Self::new(ModRmMode::Register, reg, 0, 0, Segment::DS)
    }
}

/// Table index for a ModRM byte: mod in bits 3-4, r/m in bits 0-2.
#[inline(always)]
pub const fn modrm_table_index(modrm: u8) -> usize {
    (((modrm & MODRM_MOD_MASK) >> 3) | (modrm & MODRM_RM_MASK)) as usize
}

pub const MODRM_TABLE_16: [ModRmAddress; 32] = {
    // Base, index (if paired) and default segment for each r/m value.
    const RM: [(u8, Option<u8>, Segment); 8] = [
        (REG_EBX, Some(REG_ESI), Segment::DS),
        (REG_EBX, Some(REG_EDI), Segment::DS),
        (REG_EBP, Some(REG_ESI), Segment::SS),
        (REG_EBP, Some(REG_EDI), Segment::SS),
        (REG_ESI, None, Segment::DS),
        (REG_EDI, None, Segment::DS),
        (REG_EBP, None, Segment::SS),
        (REG_EBX, None, Segment::DS),
    ];
    const DISP: [u8; 3] = [0, 1, 2];

    let mut table = [ModRmAddress::register(0); 32];
    let mut i = 0;
    loop {
        let md = i >> 3;
        let rm = i & 7;
        table[i] = if md == 3 {
            ModRmAddress::register(rm as u8)
        }
        else if md == 0 && rm == 6 {
            ModRmAddress::new(ModRmMode::Direct, 0, 0, 2, Segment::DS)
        }
        else {
            let (base, index, segment) = RM[rm];
            let disp = DISP[md];
            match index {
                Some(index) if disp == 0 => ModRmAddress::new(ModRmMode::BasedIndexed, base, index, 0, segment),
                Some(index) => ModRmAddress::new(ModRmMode::BasedIndexedDisplacement, base, index, disp, segment),
                None if disp == 0 => ModRmAddress::new(ModRmMode::Indirect, base, 0, 0, segment),
                None => ModRmAddress::new(ModRmMode::Indexed, base, 0, disp, segment),
            }
        };
        i += 1;
        if i == 32 {
            break;
        }
    }
    table
};

pub const MODRM_TABLE_32: [ModRmAddress; 32] = {
    const DISP: [u8; 3] = [0, 1, 4];

    let mut table = [ModRmAddress::register(0); 32];
    let mut i = 0;
    loop {
        let md = i >> 3;
        let rm = (i & 7) as u8;
        table[i] = if md == 3 {
            ModRmAddress::register(rm)
        }
        else if rm == REG_ESP {
            // The SIB byte decides the segment
            ModRmAddress::new(ModRmMode::Sib, 0, 0, DISP[md], Segment::DS)
        }
        else if md == 0 && rm == REG_EBP {
            ModRmAddress::new(ModRmMode::Direct, 0, 0, 4, Segment::DS)
        }
        else {
            let segment = if rm == REG_EBP { Segment::SS } else { Segment::DS };
            if md == 0 {
                ModRmAddress::new(ModRmMode::Indirect, rm, 0, 0, segment)
            }
            else {
                ModRmAddress::new(ModRmMode::Indexed, rm, 0, DISP[md], segment)
            }
        };
        i += 1;
        if i == 32 {
            break;
        }
    }
    table
};

#[inline(always)]
pub fn modrm_address(address_size: AddressSize, modrm: u8) -> &'static ModRmAddress {
    match address_size {
        AddressSize::Addr16 => &MODRM_TABLE_16[modrm_table_index(modrm)],
        AddressSize::Addr32 => &MODRM_TABLE_32[modrm_table_index(modrm)],
    }
}

#[inline(always)]
pub const fn sib_scale(sib: u8) -> u8 {
    sib >> 6
}

#[inline(always)]
pub const fn sib_index(sib: u8) -> u8 {
    (sib >> 3) & 7
}

#[inline(always)]
pub const fn sib_base(sib: u8) -> u8 {
    sib & 7
}

/// SIB base 5 with mod 00 means no base register and a 32-bit displacement.
#[inline(always)]
pub const fn sib_has_base(modrm: u8, sib: u8) -> bool {
    !(sib_base(sib) == REG_EBP && (modrm & MODRM_MOD_MASK) == 0)
}

/// Index register 4 (ESP) means no index.
#[inline(always)]
pub const fn sib_has_index(sib: u8) -> bool {
    sib_index(sib) != REG_ESP
}

/// Default segment for a SIB address. Stack-relative bases select SS. This includes EBP with
/// mod != 00, as on real hardware.
#[inline(always)]
pub const fn sib_default_segment(modrm: u8, sib: u8) -> Segment {
    let base = sib_base(sib);
    if sib_has_base(modrm, sib) && (base == REG_ESP || base == REG_EBP) {
        Segment::SS
    }
    else {
        Segment::DS
    }
}

/// Calculate the offset addressed by an instruction's ModRM/SIB fields.
pub fn effective_address(regs: &Registers, instr: &Instruction) -> u32 {
    let entry = modrm_address(instr.address_size, instr.modrm);
    let disp = instr.displacement;
    match instr.address_size {
        AddressSize::Addr16 => {
            let base = regs.reg16(entry.base) as u32;
            let index = regs.reg16(entry.index) as u32;
            let ea = match entry.mode {
                ModRmMode::Direct => disp,
                ModRmMode::Indirect => base,
                ModRmMode::Indexed => base.wrapping_add(disp),
                ModRmMode::BasedIndexed => base.wrapping_add(index),
                ModRmMode::BasedIndexedDisplacement => base.wrapping_add(index).wrapping_add(disp),
                ModRmMode::Register | ModRmMode::Sib => 0,
            };
            ea & 0xFFFF
        }
        AddressSize::Addr32 => match entry.mode {
            ModRmMode::Direct => disp,
            ModRmMode::Indirect => regs.reg32(entry.base),
            ModRmMode::Indexed => regs.reg32(entry.base).wrapping_add(disp),
            ModRmMode::Sib => {
                let sib = instr.sib;
                let mut ea = disp;
                if sib_has_base(instr.modrm, sib) {
                    ea = ea.wrapping_add(regs.reg32(sib_base(sib)));
                }
                if sib_has_index(sib) {
                    ea = ea.wrapping_add(regs.reg32(sib_index(sib)) << sib_scale(sib));
                }
                ea
            }
            _ => 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describe(entry: &ModRmAddress) -> String {
        format!(
            "{:?} {} {} {} {}",
            entry.mode, entry.base, entry.index, entry.displacement_size, entry.default_segment
        )
    }

    #[rustfmt::skip]
    const GOLDEN_16: [&str; 32] = [
        "BasedIndexed 3 6 0 DS", "BasedIndexed 3 7 0 DS", "BasedIndexed 5 6 0 SS", "BasedIndexed 5 7 0 SS",
        "Indirect 6 0 0 DS", "Indirect 7 0 0 DS", "Direct 0 0 2 DS", "Indirect 3 0 0 DS",
        "BasedIndexedDisplacement 3 6 1 DS", "BasedIndexedDisplacement 3 7 1 DS",
        "BasedIndexedDisplacement 5 6 1 SS", "BasedIndexedDisplacement 5 7 1 SS",
        "Indexed 6 0 1 DS", "Indexed 7 0 1 DS", "Indexed 5 0 1 SS", "Indexed 3 0 1 DS",
        "BasedIndexedDisplacement 3 6 2 DS", "BasedIndexedDisplacement 3 7 2 DS",
        "BasedIndexedDisplacement 5 6 2 SS", "BasedIndexedDisplacement 5 7 2 SS",
        "Indexed 6 0 2 DS", "Indexed 7 0 2 DS", "Indexed 5 0 2 SS", "Indexed 3 0 2 DS",
        "Register 0 0 0 DS", "Register 1 0 0 DS", "Register 2 0 0 DS", "Register 3 0 0 DS",
        "Register 4 0 0 DS", "Register 5 0 0 DS", "Register 6 0 0 DS", "Register 7 0 0 DS",
    ];

    #[rustfmt::skip]
    const GOLDEN_32: [&str; 32] = [
        "Indirect 0 0 0 DS", "Indirect 1 0 0 DS", "Indirect 2 0 0 DS", "Indirect 3 0 0 DS",
        "Sib 0 0 0 DS", "Direct 0 0 4 DS", "Indirect 6 0 0 DS", "Indirect 7 0 0 DS",
        "Indexed 0 0 1 DS", "Indexed 1 0 1 DS", "Indexed 2 0 1 DS", "Indexed 3 0 1 DS",
        "Sib 0 0 1 DS", "Indexed 5 0 1 SS", "Indexed 6 0 1 DS", "Indexed 7 0 1 DS",
        "Indexed 0 0 4 DS", "Indexed 1 0 4 DS", "Indexed 2 0 4 DS", "Indexed 3 0 4 DS",
        "Sib 0 0 4 DS", "Indexed 5 0 4 SS", "Indexed 6 0 4 DS", "Indexed 7 0 4 DS",
        "Register 0 0 0 DS", "Register 1 0 0 DS", "Register 2 0 0 DS", "Register 3 0 0 DS",
        "Register 4 0 0 DS", "Register 5 0 0 DS", "Register 6 0 0 DS", "Register 7 0 0 DS",
    ];

    #[test]
    fn test_modrm_table_16_golden() {
        for (i, golden) in GOLDEN_16.iter().enumerate() {
            assert_eq!(describe(&MODRM_TABLE_16[i]), *golden, "16-bit entry {}", i);
        }
    }

    #[test]
    fn test_modrm_table_32_golden() {
        for (i, golden) in GOLDEN_32.iter().enumerate() {
            assert_eq!(describe(&MODRM_TABLE_32[i]), *golden, "32-bit entry {}", i);
        }
    }

    #[test]
    fn test_table_index() {
        assert_eq!(modrm_table_index(0b11_010_001), 25);
        assert_eq!(modrm_table_index(0b01_111_110), 14);
        // The reg field never affects the entry
        assert_eq!(
            modrm_address(AddressSize::Addr16, 0b10_000_010),
            modrm_address(AddressSize::Addr16, 0b10_101_010)
        );
    }

    #[test]
    fn test_sib_fields() {
        let sib = 0b10_001_011;
        assert_eq!(sib_scale(sib), 2);
        assert_eq!(sib_index(sib), 1);
        assert_eq!(sib_base(sib), 3);
        assert!(sib_has_index(sib));
        assert!(!sib_has_index(0b00_100_000));
    }

    #[test]
    fn test_sib_ebp_default_segment() {
        // [EBP + disp8 + index], mod 01: EBP is a real base and defaults to SS
        assert_eq!(sib_default_segment(0b01_000_100, 0b00_001_101), Segment::SS);
        assert_eq!(sib_default_segment(0b10_000_100, 0b00_001_101), Segment::SS);
        // mod 00 with base 5 has no base register, so DS
        assert_eq!(sib_default_segment(0b00_000_100, 0b00_001_101), Segment::DS);
        assert!(!sib_has_base(0b00_000_100, 0b00_001_101));
        assert_eq!(sib_default_segment(0b00_000_100, 0b00_100_100), Segment::SS);
        assert_eq!(sib_default_segment(0b00_000_100, 0b00_000_000), Segment::DS);
    }
}
