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

    cpu_386::fast::ea.rs

    Operand fetch and effective address calculation for the fast path.

    The ModRM byte is resolved as it is fetched, without going through the
    ModRM table. The 16-bit forms are spelled out case by case and the 32-bit
    form handles the SIB byte inline.

*/

use crate::{
    cpu_386::{
        context::{read_memory, write_memory, CpuContext},
        fast::FastState,
    },
    cpu_common::{alu::Word, *},
};

/// A resolved r/m operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FastRm {
    Register(u8),
    Memory(Segment, u32),
}

#[derive(Copy, Clone, Debug)]
pub struct FastModRm {
    pub reg: u8,
    pub rm:  FastRm,
}

#[inline(always)]
pub fn fetch_u8<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult<u8> {
    cpu.fetch_instruction_byte()
}

#[inline(always)]
pub fn fetch_u16<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult<u16> {
    let lo = cpu.fetch_instruction_byte()?;
    let hi = cpu.fetch_instruction_byte()?;
    Ok(u16::from_le_bytes([lo, hi]))
}

#[inline(always)]
pub fn fetch_u32<C: CpuContext + ?Sized>(cpu: &mut C) -> CpuResult<u32> {
    let lo = fetch_u16(cpu)?;
    let hi = fetch_u16(cpu)?;
    Ok(((hi as u32) << 16) | lo as u32)
}

/// Fetch an immediate of width T.
#[inline(always)]
pub fn fetch_imm<C: CpuContext + ?Sized, T: Word>(cpu: &mut C) -> CpuResult<T> {
    Ok(match T::BITS {
        8 => T::from_u32(fetch_u8(cpu)? as u32),
        16 => T::from_u32(fetch_u16(cpu)? as u32),
        _ => T::from_u32(fetch_u32(cpu)?),
    })
}

/// Fetch an 8-bit immediate sign extended to width T.
#[inline(always)]
pub fn fetch_simm8<C: CpuContext + ?Sized, T: Word>(cpu: &mut C) -> CpuResult<T> {
    Ok(T::from_u32(fetch_u8(cpu)? as i8 as i32 as u32))
}

/// Fetch a relative displacement of the operand size, sign extended.
#[inline(always)]
pub fn fetch_rel<C: CpuContext + ?Sized>(cpu: &mut C, operand_size: OperandSize) -> CpuResult<u32> {
    match operand_size {
        OperandSize::Size32 => fetch_u32(cpu),
        _ => Ok(fetch_u16(cpu)? as i16 as i32 as u32),
    }
}

/// Fetch a ModRM byte and any SIB byte and displacement that follow it.
#[inline(always)]
pub fn fetch_modrm<C: CpuContext + ?Sized>(cpu: &mut C, st: &FastState) -> CpuResult<FastModRm> {
    let modrm = fetch_u8(cpu)?;
    let reg = (modrm >> 3) & 0x07;
    let md = modrm >> 6;
    let rm = modrm & 0x07;
    if md == 0b11 {
        return Ok(FastModRm {
            reg,
            rm: FastRm::Register(rm),
        });
    }
    let (segment, offset) = match st.address_size {
        AddressSize::Addr16 => ea16(cpu, md, rm)?,
        AddressSize::Addr32 => ea32(cpu, md, rm)?,
    };
    let segment = match st.segment_override {
        Some(segment) => segment,
        None => segment,
    };
    Ok(FastModRm {
        reg,
        rm: FastRm::Memory(segment, offset),
    })
}

fn ea16<C: CpuContext + ?Sized>(cpu: &mut C, md: u8, rm: u8) -> CpuResult<(Segment, u32)> {
    let disp = match md {
        0 if rm == 6 => return Ok((Segment::DS, fetch_u16(cpu)? as u32)),
        0 => 0,
        1 => fetch_u8(cpu)? as i8 as u16,
        _ => fetch_u16(cpu)?,
    };
    let regs = cpu.registers();
    let bx = regs.get16(Register16::BX);
    let bp = regs.get16(Register16::BP);
    let si = regs.get16(Register16::SI);
    let di = regs.get16(Register16::DI);
    let (segment, base) = match rm {
        0 => (Segment::DS, bx.wrapping_add(si)),
        1 => (Segment::DS, bx.wrapping_add(di)),
        2 => (Segment::SS, bp.wrapping_add(si)),
        3 => (Segment::SS, bp.wrapping_add(di)),
        4 => (Segment::DS, si),
        5 => (Segment::DS, di),
        6 => (Segment::SS, bp),
        _ => (Segment::DS, bx),
    };
    Ok((segment, base.wrapping_add(disp) as u32))
}

fn ea32<C: CpuContext + ?Sized>(cpu: &mut C, md: u8, rm: u8) -> CpuResult<(Segment, u32)> {
    if rm == 4 {
        let sib = fetch_u8(cpu)?;
        let base = sib & 0x07;
        let index = (sib >> 3) & 0x07;
        let scale = sib >> 6;
        let (segment, mut ea) = if base == 5 && md == 0 {
            (Segment::DS, fetch_u32(cpu)?)
        }
        else {
            // ESP and EBP bases select SS, including EBP with a displacement
            let segment = if base == 4 || base == 5 { Segment::SS } else { Segment::DS };
            (segment, cpu.registers().reg32(base))
        };
        ea = ea.wrapping_add(match md {
            1 => fetch_u8(cpu)? as i8 as i32 as u32,
            2 => fetch_u32(cpu)?,
            _ => 0,
        });
        if index != 4 {
            ea = ea.wrapping_add(cpu.registers().reg32(index) << scale);
        }
        return Ok((segment, ea));
    }
    if md == 0 && rm == 5 {
        return Ok((Segment::DS, fetch_u32(cpu)?));
    }
    let disp = match md {
        1 => fetch_u8(cpu)? as i8 as i32 as u32,
        2 => fetch_u32(cpu)?,
        _ => 0,
    };
    let segment = if rm == 5 { Segment::SS } else { Segment::DS };
    Ok((segment, cpu.registers().reg32(rm).wrapping_add(disp)))
}

#[inline(always)]
pub fn read_rm<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, rm: FastRm) -> CpuResult<T> {
    match rm {
        FastRm::Register(reg) => Ok(cpu.registers().reg(reg)),
        FastRm::Memory(segment, offset) => read_memory(cpu, segment, offset),
    }
}

#[inline(always)]
pub fn write_rm<C: CpuContext + ?Sized, T: Word>(cpu: &mut C, rm: FastRm, value: T) -> CpuResult {
    match rm {
        FastRm::Register(reg) => {
            cpu.registers_mut().set_reg(reg, value);
            Ok(())
        }
        FastRm::Memory(segment, offset) => write_memory(cpu, segment, offset, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_386::FlatCpu;

    fn state(address_size: AddressSize) -> FastState {
        FastState::new(0x100, OperandSize::Size16, address_size)
    }

    #[test]
    fn test_ea16_bp_defaults_to_ss() {
        let mut cpu = FlatCpu::real_mode(&[0x46, 0xFE]);
        cpu.regs.set16(Register16::BP, 0x1000);
        // [bp-2]
        let modrm = fetch_modrm(&mut cpu, &state(AddressSize::Addr16)).unwrap();
        assert_eq!(modrm.rm, FastRm::Memory(Segment::SS, 0x0FFE));
        assert_eq!(modrm.reg, 0);
    }

    #[test]
    fn test_ea16_wraps() {
        let mut cpu = FlatCpu::real_mode(&[0x80, 0x02, 0x00]);
        cpu.regs.set16(Register16::BX, 0xFFFF);
        cpu.regs.set16(Register16::SI, 0x0001);
        // [bx+si+2]
        let modrm = fetch_modrm(&mut cpu, &state(AddressSize::Addr16)).unwrap();
        assert_eq!(modrm.rm, FastRm::Memory(Segment::DS, 0x0002));
    }

    #[test]
    fn test_ea32_sib() {
        // [ebp+ecx*4+8], mod 01 with a real EBP base
        let mut cpu = FlatCpu::real_mode(&[0x44, 0x8D, 0x08]);
        cpu.regs.set32(Register32::EBP, 0x2000);
        cpu.regs.set32(Register32::ECX, 0x10);
        let modrm = fetch_modrm(&mut cpu, &state(AddressSize::Addr32)).unwrap();
        assert_eq!(modrm.rm, FastRm::Memory(Segment::SS, 0x2048));

        // [ecx*2+disp32], mod 00 with no base
        let mut cpu = FlatCpu::real_mode(&[0x04, 0x4D, 0x00, 0x10, 0x00, 0x00]);
        cpu.regs.set32(Register32::ECX, 0x10);
        let modrm = fetch_modrm(&mut cpu, &state(AddressSize::Addr32)).unwrap();
        assert_eq!(modrm.rm, FastRm::Memory(Segment::DS, 0x1020));
    }

    #[test]
    fn test_segment_override() {
        let mut cpu = FlatCpu::real_mode(&[0x46, 0x00]);
        let mut st = state(AddressSize::Addr16);
        st.segment_override = Some(Segment::ES);
        let modrm = fetch_modrm(&mut cpu, &st).unwrap();
        assert_eq!(modrm.rm, FastRm::Memory(Segment::ES, 0));
    }
}
