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

    cpu_common::registers.rs

    The x86 register file.

    General purpose registers are stored as eight 32-bit values. The 8 and
    16-bit views are accessors over that storage rather than aliased fields.

*/

use crate::cpu_common::*;

/// Hidden part of a segment register, loaded when the selector is loaded.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentCache {
    pub base: u32,
    pub limit: u32,
    /// Descriptor access byte.
    pub access: u8,
    /// The descriptor's D/B bit. Selects 32-bit operand and address size for CS,
    /// and 32-bit stack pointer for SS.
    pub big: bool,
}

impl SegmentCache {
    pub fn real_mode(selector: u16) -> Self {
        SegmentCache {
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            access: 0x93,
            big: false,
        }
    }

    /// Decode the hidden part from a raw 8-byte segment descriptor.
    pub fn from_descriptor(raw: u64) -> Self {
        let mut limit = ((raw & 0xFFFF) | (((raw >> 48) & 0x0F) << 16)) as u32;
        let base = (((raw >> 16) & 0x00FF_FFFF) | (((raw >> 56) & 0xFF) << 24)) as u32;
        let granular = raw & (1 << 55) != 0;
        if granular {
            limit = (limit << 12) | 0xFFF;
        }
        SegmentCache {
            base,
            limit,
            access: (raw >> 40) as u8,
            big: raw & (1 << 54) != 0,
        }
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 3
    }

    #[inline]
    pub fn present(&self) -> bool {
        self.access & 0x80 != 0
    }

    /// System descriptors (LDT, TSS, gates) have the S bit clear.
    #[inline]
    pub fn is_system(&self) -> bool {
        self.access & 0x10 == 0
    }

    /// Low four bits of the access byte.
    #[inline]
    pub fn descriptor_type(&self) -> u8 {
        self.access & 0x0F
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        !self.is_system() && self.access & 0x08 != 0
    }

    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.access & 0x04 != 0
    }

    pub fn is_readable(&self) -> bool {
        !self.is_system() && (!self.is_code() || self.access & 0x02 != 0)
    }

    pub fn is_writable(&self) -> bool {
        !self.is_system() && !self.is_code() && self.access & 0x02 != 0
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DescriptorTablePointer {
    pub base: u32,
    pub limit: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registers {
    gpr: [u32; 8],
    pub eip: u32,
    /// Offset of the first byte of the executing instruction. Faults return here.
    pub current_eip: u32,
    eflags: u32,
    pub segment_selectors: [u16; SEGMENT_COUNT],
    pub segment_cache: [SegmentCache; SEGMENT_COUNT],
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub dr: [u32; 8],
    pub tr: [u32; 8],
    pub gdtr: DescriptorTablePointer,
    pub idtr: DescriptorTablePointer,
    pub ldtr: u16,
    pub ldtr_cache: SegmentCache,
    pub task_register: u16,
    pub task_cache: SegmentCache,
    pub cpl: u8,
}

impl Default for Registers {
    fn default() -> Self {
        let mut regs = Registers {
            gpr: [0; 8],
            eip: 0xFFF0,
            current_eip: 0xFFF0,
            eflags: CPU_FLAG_RESERVED1,
            segment_selectors: [0; SEGMENT_COUNT],
            segment_cache: [SegmentCache::real_mode(0); SEGMENT_COUNT],
            cr0: CR0_ET,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr: [0; 8],
            tr: [0; 8],
            gdtr: DescriptorTablePointer::default(),
            idtr: DescriptorTablePointer { base: 0, limit: 0x3FF },
            ldtr: 0,
            ldtr_cache: SegmentCache::default(),
            task_register: 0,
            task_cache: SegmentCache::default(),
            cpl: 0,
        };
        regs.segment_selectors[Segment::CS as usize] = 0xF000;
        regs.segment_cache[Segment::CS as usize] = SegmentCache::real_mode(0xF000);
        regs
    }
}

impl Registers {
    pub fn new() -> Self {
        Self::default()
    }

    // Set one of the 8 bit registers.
    #[inline(always)]
    pub fn reg8(&self, index: u8) -> u8 {
        let index = (index & 7) as usize;
        if index < 4 {
            self.gpr[index] as u8
        }
        else {
            (self.gpr[index - 4] >> 8) as u8
        }
    }

    #[inline(always)]
    pub fn set_reg8(&mut self, index: u8, value: u8) {
        let index = (index & 7) as usize;
        if index < 4 {
            self.gpr[index] = (self.gpr[index] & 0xFFFF_FF00) | value as u32;
        }
        else {
            self.gpr[index - 4] = (self.gpr[index - 4] & 0xFFFF_00FF) | ((value as u32) << 8);
        }
    }

    #[inline(always)]
    pub fn reg16(&self, index: u8) -> u16 {
        self.gpr[(index & 7) as usize] as u16
    }

    #[inline(always)]
    pub fn set_reg16(&mut self, index: u8, value: u16) {
        let reg = &mut self.gpr[(index & 7) as usize];
        *reg = (*reg & 0xFFFF_0000) | value as u32;
    }

    #[inline(always)]
    pub fn reg32(&self, index: u8) -> u32 {
        self.gpr[(index & 7) as usize]
    }

    #[inline(always)]
    pub fn set_reg32(&mut self, index: u8, value: u32) {
        self.gpr[(index & 7) as usize] = value;
    }

    /// Read a register as a generic width.
    #[inline(always)]
    pub fn reg<T: Word>(&self, index: u8) -> T {
        match T::BITS {
            8 => T::from_u32(self.reg8(index) as u32),
            16 => T::from_u32(self.reg16(index) as u32),
            _ => T::from_u32(self.reg32(index)),
        }
    }

    #[inline(always)]
    pub fn set_reg<T: Word>(&mut self, index: u8, value: T) {
        match T::BITS {
            8 => self.set_reg8(index, value.to_u32() as u8),
            16 => self.set_reg16(index, value.to_u32() as u16),
            _ => self.set_reg32(index, value.to_u32()),
        }
    }

    #[inline(always)]
    pub fn get8(&self, reg: Register8) -> u8 {
        self.reg8(reg as u8)
    }

    #[inline(always)]
    pub fn set8(&mut self, reg: Register8, value: u8) {
        self.set_reg8(reg as u8, value)
    }

    #[inline(always)]
    pub fn get16(&self, reg: Register16) -> u16 {
        self.reg16(reg as u8)
    }

    #[inline(always)]
    pub fn set16(&mut self, reg: Register16, value: u16) {
        self.set_reg16(reg as u8, value)
    }

    #[inline(always)]
    pub fn get32(&self, reg: Register32) -> u32 {
        self.reg32(reg as u8)
    }

    #[inline(always)]
    pub fn set32(&mut self, reg: Register32, value: u32) {
        self.set_reg32(reg as u8, value)
    }

    /// The count register for string and loop instructions: CX or ECX by address size.
    #[inline(always)]
    pub fn count(&self, address_size: AddressSize) -> u32 {
        self.gpr[Register32::ECX as usize] & address_size.mask()
    }

    #[inline(always)]
    pub fn set_count(&mut self, address_size: AddressSize, value: u32) {
        match address_size {
            AddressSize::Addr16 => self.set16(Register16::CX, value as u16),
            AddressSize::Addr32 => self.set32(Register32::ECX, value),
        }
    }

    /// Write a register that is used as an address (SI, DI, SP...), truncated to the address size.
    #[inline(always)]
    pub fn set_address_reg(&mut self, index: u8, address_size: AddressSize, value: u32) {
        match address_size {
            AddressSize::Addr16 => self.set_reg16(index, value as u16),
            AddressSize::Addr32 => self.set_reg32(index, value),
        }
    }

    #[inline(always)]
    pub fn address_reg(&self, index: u8, address_size: AddressSize) -> u32 {
        self.reg32(index) & address_size.mask()
    }

    #[inline(always)]
    pub fn eflags(&self) -> u32 {
        self.eflags
    }

    /// Store EFLAGS without any masking. Reserved bit 1 always reads as set.
    #[inline(always)]
    pub fn set_eflags_raw(&mut self, eflags: u32) {
        self.eflags = eflags | CPU_FLAG_RESERVED1;
    }

    /// Replace the EFLAGS bits selected by `mask`.
    #[inline(always)]
    pub fn set_eflags_masked(&mut self, value: u32, mask: u32) {
        self.set_eflags_raw((self.eflags & !mask) | (value & mask));
    }

    #[inline(always)]
    pub fn get_flag(&self, flag: Flag) -> bool {
        self.eflags & flag.mask() != 0
    }

    #[inline(always)]
    pub fn set_flag(&mut self, flag: Flag) {
        self.eflags |= flag.mask();
    }

    #[inline(always)]
    pub fn clear_flag(&mut self, flag: Flag) {
        self.eflags &= !flag.mask();
    }

    #[inline(always)]
    pub fn set_flag_state(&mut self, flag: Flag, state: bool) {
        if state {
            self.set_flag(flag)
        }
        else {
            self.clear_flag(flag)
        }
    }

    #[inline(always)]
    pub fn iopl(&self) -> u8 {
        ((self.eflags & CPU_FLAG_IOPL) >> CPU_FLAG_IOPL_SHIFT) as u8
    }

    #[inline(always)]
    pub fn selector(&self, segment: Segment) -> u16 {
        self.segment_selectors[segment as usize]
    }

    #[inline(always)]
    pub fn segment_base(&self, segment: Segment) -> u32 {
        self.segment_cache[segment as usize].base
    }

    pub fn in_protected_mode(&self) -> bool {
        self.cr0 & CR0_PE != 0
    }

    pub fn in_v86_mode(&self) -> bool {
        self.in_protected_mode() && self.eflags & CPU_FLAG_V86 != 0
    }

    pub fn in_real_mode(&self) -> bool {
        !self.in_protected_mode()
    }

    /// Default operand size of the current code segment.
    pub fn code_operand_size(&self) -> OperandSize {
        if self.segment_cache[Segment::CS as usize].big && self.in_protected_mode() && !self.in_v86_mode() {
            OperandSize::Size32
        }
        else {
            OperandSize::Size16
        }
    }

    pub fn code_address_size(&self) -> AddressSize {
        match self.code_operand_size() {
            OperandSize::Size32 => AddressSize::Addr32,
            _ => AddressSize::Addr16,
        }
    }

    /// Width of the stack pointer, from the SS descriptor's B bit.
    pub fn stack_address_size(&self) -> AddressSize {
        if self.segment_cache[Segment::SS as usize].big && self.in_protected_mode() && !self.in_v86_mode() {
            AddressSize::Addr32
        }
        else {
            AddressSize::Addr16
        }
    }

    /// Load a selector in real or virtual-8086 mode, where the base is the selector * 16.
    pub fn load_real_mode_segment(&mut self, segment: Segment, selector: u16) {
        let index = segment as usize;
        let real_mode = self.cr0 & CR0_PE == 0;
        let v86 = self.in_v86_mode();
        self.segment_selectors[index] = selector;
        let cache = &mut self.segment_cache[index];
        cache.base = (selector as u32) << 4;
        // Limit and size are retained from the last protected mode load ("unreal mode")
        if real_mode && cache.limit == 0 {
            cache.limit = 0xFFFF;
        }
        if v86 {
            cache.limit = 0xFFFF;
            cache.big = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_views() {
        let mut regs = Registers::new();
        regs.set32(Register32::EAX, 0x1234_5678);
        assert_eq!(regs.get16(Register16::AX), 0x5678);
        assert_eq!(regs.get8(Register8::AL), 0x78);
        assert_eq!(regs.get8(Register8::AH), 0x56);

        regs.set8(Register8::AH, 0xAB);
        assert_eq!(regs.get32(Register32::EAX), 0x1234_AB78);
        regs.set16(Register16::AX, 0xCDEF);
        assert_eq!(regs.get32(Register32::EAX), 0x1234_CDEF);

        regs.set8(Register8::BH, 0x11);
        regs.set8(Register8::BL, 0x22);
        assert_eq!(regs.get16(Register16::BX), 0x1122);
        assert_eq!(regs.reg::<u16>(3), 0x1122);
    }

    #[test]
    fn test_count_register() {
        let mut regs = Registers::new();
        regs.set32(Register32::ECX, 0x0001_0005);
        assert_eq!(regs.count(AddressSize::Addr16), 5);
        assert_eq!(regs.count(AddressSize::Addr32), 0x0001_0005);
        regs.set_count(AddressSize::Addr16, 0xFFFF);
        assert_eq!(regs.get32(Register32::ECX), 0x0001_FFFF);
    }

    #[test]
    fn test_descriptor_decode() {
        // Flat 4GB 32-bit code segment, DPL 0
        let cache = SegmentCache::from_descriptor(0x00CF_9A00_0000_FFFF);
        assert_eq!(cache.base, 0);
        assert_eq!(cache.limit, 0xFFFF_FFFF);
        assert!(cache.big);
        assert!(cache.is_code());
        assert!(cache.is_readable());
        assert!(!cache.is_writable());
        assert_eq!(cache.dpl(), 0);

        // Byte granular data segment at 0x12345678, DPL 3
        let cache = SegmentCache::from_descriptor(0x1240_F234_5678_0FFF);
        assert_eq!(cache.base, 0x1234_5678);
        assert_eq!(cache.limit, 0x0FFF);
        assert!(cache.is_writable());
        assert_eq!(cache.dpl(), 3);
        assert!(cache.present());
    }

    #[test]
    fn test_flags() {
        let mut regs = Registers::new();
        regs.set_flag_state(Flag::Carry, true);
        assert!(regs.get_flag(Flag::Carry));
        regs.set_flag_state(Flag::Carry, false);
        assert!(!regs.get_flag(Flag::Carry));
        regs.set_eflags_raw(0x3000);
        assert_eq!(regs.iopl(), 3);
        assert_eq!(regs.eflags() & CPU_FLAG_RESERVED1, CPU_FLAG_RESERVED1);
    }

    #[test]
    fn test_load_real_mode_segment() {
        let mut regs = Registers::new();
        let ds = Segment::DS as usize;

        regs.segment_cache[ds].limit = 0;
        regs.load_real_mode_segment(Segment::DS, 0x1234);
        assert_eq!(regs.segment_selectors[ds], 0x1234);
        assert_eq!(regs.segment_cache[ds].base, 0x12340);
        assert_eq!(regs.segment_cache[ds].limit, 0xFFFF);

        // Unreal mode keeps a 4GB limit
        regs.segment_cache[ds].limit = 0xFFFF_FFFF;
        regs.segment_cache[ds].big = true;
        regs.load_real_mode_segment(Segment::DS, 0x2000);
        assert_eq!(regs.segment_cache[ds].base, 0x20000);
        assert_eq!(regs.segment_cache[ds].limit, 0xFFFF_FFFF);

        // Virtual-8086 mode always resets the limit and size
        regs.cr0 |= CR0_PE;
        regs.set_eflags_raw(CPU_FLAG_V86);
        regs.load_real_mode_segment(Segment::DS, 0xB800);
        assert_eq!(regs.segment_cache[ds].base, 0xB8000);
        assert_eq!(regs.segment_cache[ds].limit, 0xFFFF);
        assert!(!regs.segment_cache[ds].big);
    }
}
