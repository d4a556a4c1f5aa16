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

    cpu_386::flat.rs

    FlatCpu, a self-contained CpuContext.

    FlatCpu backs the execution tiers with a flat physical memory array and a
    simple port map. It implements real-mode segmentation and interrupt
    delivery through the IVT, and protected-mode segmentation from the GDT and
    LDT with same-privilege interrupt and trap gates. Paging, task switches and
    privilege-changing control transfers are not modeled.

*/

use fxhash::FxHashMap;

use crate::{
    coreconfig::CoreConfig,
    cpu_386::{
        context::{self, CpuContext},
        fpu::FpuState,
    },
    cpu_common::*,
};

pub const FLAT_DEFAULT_MEMORY: usize = 0x10_0000;

/// Load address of test programs in real mode (0000:0100).
pub const FLAT_REAL_CODE_OFFSET: u32 = 0x0100;
/// Load address of test programs in protected mode.
pub const FLAT_PROTECTED_CODE_OFFSET: u32 = 0x1000;
pub const FLAT_GDT_BASE: u32 = 0x0800;

pub const FLAT_SELECTOR_CODE32: u16 = 0x08;
pub const FLAT_SELECTOR_DATA32: u16 = 0x10;
pub const FLAT_SELECTOR_CODE32_USER: u16 = 0x1B;
pub const FLAT_SELECTOR_DATA32_USER: u16 = 0x23;
pub const FLAT_SELECTOR_LDT: u16 = 0x28;
pub const FLAT_SELECTOR_TSS: u16 = 0x30;

const GDT_ENTRIES: [u64; 7] = [
    0,
    // 4GB code, DPL 0
    0x00CF_9A00_0000_FFFF,
    // 4GB data, DPL 0
    0x00CF_9200_0000_FFFF,
    // 4GB code, DPL 3
    0x00CF_FA00_0000_FFFF,
    // 4GB data, DPL 3
    0x00CF_F200_0000_FFFF,
    // Empty LDT at 0x0A00
    0x0000_8200_0A00_0007,
    // 386 TSS at 0x0B00
    0x0000_8900_0B00_0067,
];

#[derive(Clone)]
pub struct FlatCpu {
    pub regs: Registers,
    pub fpu: FpuState,
    pub model: CpuModel,
    pub fpu_present: bool,
    memory: Vec<u8>,
    address_mask: u32,
    /// Values returned by port reads. Unmapped ports read as 0xFF.
    pub port_inputs: FxHashMap<u16, u8>,
    /// Every byte written to a port, in order.
    pub port_writes: Vec<(u16, u8)>,
    /// Grant I/O access when CPL > IOPL.
    pub io_permitted: bool,
    /// An external interrupt is waiting. It is only reported while IF is set.
    pub interrupt_pending: bool,
    pub halted: bool,
    pub cycles: u64,
    /// Exceptions raised, in order.
    pub exceptions: Vec<(Interrupt, u32)>,
    pub fpu_irq_count: u32,
    delivering: bool,
}

impl FlatCpu {
    /// Create a context with `memory_size` bytes of memory, rounded up to a power of two.
    pub fn new(memory_size: usize) -> Self {
        let size = memory_size.max(0x1000).next_power_of_two();
        Self {
            regs: Registers::new(),
            fpu: FpuState::new(),
            model: CpuModel::Intel80486,
            fpu_present: true,
            memory: vec![0; size],
            address_mask: (size - 1) as u32,
            port_inputs: FxHashMap::default(),
            port_writes: Vec::new(),
            io_permitted: false,
            interrupt_pending: false,
            halted: false,
            cycles: 0,
            exceptions: Vec::new(),
            fpu_irq_count: 0,
            delivering: false,
        }
    }

    /// A real-mode context with `code` loaded at 0000:0100, all segments zero and SP at 0x8000.
    pub fn real_mode(code: &[u8]) -> Self {
        let mut cpu = FlatCpu::new(FLAT_DEFAULT_MEMORY);
        for segment in Segment::ALL {
            cpu.regs.segment_selectors[segment as usize] = 0;
            cpu.regs.segment_cache[segment as usize] = SegmentCache::real_mode(0);
        }
        cpu.regs.set32(Register32::ESP, 0x8000);
        cpu.load(FLAT_REAL_CODE_OFFSET, code);
        cpu.set_entry(FLAT_REAL_CODE_OFFSET);
        cpu
    }

    /// A protected-mode context with flat 32-bit segments and `code` loaded at 0x1000.
    pub fn protected_mode(code: &[u8]) -> Self {
        let mut cpu = FlatCpu::new(FLAT_DEFAULT_MEMORY);
        for (i, entry) in GDT_ENTRIES.iter().enumerate() {
            cpu.load(FLAT_GDT_BASE + (i as u32) * 8, &entry.to_le_bytes());
        }
        cpu.regs.gdtr = DescriptorTablePointer {
            base: FLAT_GDT_BASE,
            limit: (GDT_ENTRIES.len() * 8 - 1) as u16,
        };
        cpu.regs.cr0 |= CR0_PE;
        cpu.set_flat_segments(FLAT_SELECTOR_CODE32, FLAT_SELECTOR_DATA32);
        cpu.regs.set32(Register32::ESP, 0x9000);
        cpu.load(FLAT_PROTECTED_CODE_OFFSET, code);
        cpu.set_entry(FLAT_PROTECTED_CODE_OFFSET);
        cpu
    }

    /// Drop to CPL 3 using the user segments of the protected-mode GDT.
    pub fn enter_user_mode(&mut self) {
        self.set_flat_segments(FLAT_SELECTOR_CODE32_USER, FLAT_SELECTOR_DATA32_USER);
    }

    fn set_flat_segments(&mut self, code: u16, data: u16) {
        let code_cache = SegmentCache::from_descriptor(GDT_ENTRIES[(code >> 3) as usize]);
        let data_cache = SegmentCache::from_descriptor(GDT_ENTRIES[(data >> 3) as usize]);
        for segment in Segment::ALL {
            let (selector, cache) = match segment {
                Segment::CS => (code, code_cache),
                _ => (data, data_cache),
            };
            self.regs.segment_selectors[segment as usize] = selector;
            self.regs.segment_cache[segment as usize] = cache;
        }
        self.regs.cpl = (code & 3) as u8;
    }

    /// Apply the configured cpu model and coprocessor.
    pub fn configure(&mut self, config: &impl CoreConfig) {
        self.model = config.get_cpu_model();
        self.fpu_present = config.get_fpu_enabled();
        if !self.fpu_present {
            self.fpu.reset();
        }
    }

    pub fn set_entry(&mut self, eip: u32) {
        self.regs.eip = eip;
        self.regs.current_eip = eip;
    }

    pub fn memory_size(&self) -> usize {
        self.memory.len()
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Copy bytes into physical memory.
    pub fn load(&mut self, address: u32, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.write_physical(address.wrapping_add(i as u32), *byte);
        }
    }

    pub fn read_physical(&self, address: u32) -> u8 {
        self.memory[(address & self.address_mask) as usize]
    }

    pub fn write_physical(&mut self, address: u32, value: u8) {
        self.memory[(address & self.address_mask) as usize] = value;
    }

    pub fn read_physical_u16(&self, address: u32) -> u16 {
        u16::from_le_bytes([self.read_physical(address), self.read_physical(address.wrapping_add(1))])
    }

    pub fn read_physical_u32(&self, address: u32) -> u32 {
        (self.read_physical_u16(address) as u32) | ((self.read_physical_u16(address.wrapping_add(2)) as u32) << 16)
    }

    pub fn read_physical_u64(&self, address: u32) -> u64 {
        (self.read_physical_u32(address) as u64) | ((self.read_physical_u32(address.wrapping_add(4)) as u64) << 32)
    }

    pub fn write_physical_u16(&mut self, address: u32, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.write_physical(address, lo);
        self.write_physical(address.wrapping_add(1), hi);
    }

    pub fn write_physical_u32(&mut self, address: u32, value: u32) {
        self.write_physical_u16(address, value as u16);
        self.write_physical_u16(address.wrapping_add(2), (value >> 16) as u16);
    }

    pub fn read_bytes(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len).map(|i| self.read_physical(address.wrapping_add(i as u32))).collect()
    }

    /// Install a real-mode interrupt vector.
    pub fn set_interrupt_vector(&mut self, vector: u8, segment: u16, offset: u16) {
        let address = self.regs.idtr.base + (vector as u32) * 4;
        self.write_physical_u16(address, offset);
        self.write_physical_u16(address + 2, segment);
    }

    /// Translate a segmented access, checking the segment limit.
    fn translate(&mut self, segment: Segment, offset: u32, size: u32) -> CpuResult<u32> {
        let cache = self.regs.segment_cache[segment as usize];
        if self.regs.in_protected_mode() && !self.regs.in_v86_mode() && !cache.present() {
            return Err(self.raise_exception(Interrupt::GeneralProtectionFault, 0));
        }
        let last = offset as u64 + size as u64 - 1;
        if last > cache.limit as u64 {
            let interrupt = match segment {
                Segment::SS => Interrupt::StackFault,
                _ => Interrupt::GeneralProtectionFault,
            };
            return Err(self.raise_exception(interrupt, 0));
        }
        Ok(cache.base.wrapping_add(offset))
    }

    /// Descriptor cache for a selector about to be loaded into CS.
    fn code_descriptor(&mut self, selector: u16) -> CpuResult<SegmentCache> {
        if selector & 0xFFFC == 0 {
            return Err(self.raise_exception(Interrupt::GeneralProtectionFault, 0));
        }
        let Some(raw) = self.lookup_descriptor(selector)?
        else {
            return Err(self.raise_exception(Interrupt::GeneralProtectionFault, (selector & 0xFFFC) as u32));
        };
        let cache = SegmentCache::from_descriptor(raw);
        let cpl = self.regs.cpl;
        let privilege_ok = if cache.is_conforming() {
            cache.dpl() <= cpl
        }
        else {
            cache.dpl() == cpl && (selector & 3) as u8 <= cpl
        };
        if !cache.is_code() || !privilege_ok {
            log::warn!("FlatCpu: unsupported code segment transfer to {:04X}", selector);
            return Err(self.raise_exception(Interrupt::GeneralProtectionFault, (selector & 0xFFFC) as u32));
        }
        if !cache.present() {
            return Err(self.raise_exception(Interrupt::SegmentNotPresent, (selector & 0xFFFC) as u32));
        }
        Ok(cache)
    }

    fn commit_code_segment(&mut self, selector: u16, cache: SegmentCache, eip: u32) {
        let cpl = self.regs.cpl;
        self.regs.segment_selectors[Segment::CS as usize] = (selector & 0xFFFC) | cpl as u16;
        self.regs.segment_cache[Segment::CS as usize] = cache;
        self.regs.eip = eip;
    }

    fn in_segmented_protected_mode(&self) -> bool {
        self.regs.in_protected_mode() && !self.regs.in_v86_mode()
    }

    fn deliver_interrupt(&mut self, vector: u8, error_code: Option<u32>, software: bool) -> CpuResult {
        if self.delivering {
            log::error!("FlatCpu: fault while delivering interrupt {:02X}, halting", vector);
            self.halted = true;
            return Err(CpuAbort::Exception(Interrupt::DoubleFault, 0));
        }
        self.delivering = true;
        let result = if self.in_segmented_protected_mode() {
            self.deliver_protected_mode(vector, error_code, software)
        }
        else {
            self.deliver_real_mode(vector)
        };
        self.delivering = false;
        result
    }

    fn deliver_real_mode(&mut self, vector: u8) -> CpuResult {
        let entry = self.regs.idtr.base.wrapping_add((vector as u32) * 4);
        let offset = self.read_physical_u16(entry);
        let segment = self.read_physical_u16(entry.wrapping_add(2));

        let flags = self.regs.eflags() as u16;
        let cs = self.regs.selector(Segment::CS);
        let ip = self.regs.eip as u16;
        context::push::<_, u16>(self, flags)?;
        context::push::<_, u16>(self, cs)?;
        context::push::<_, u16>(self, ip)?;

        self.regs.clear_flag(Flag::Interrupt);
        self.regs.clear_flag(Flag::Trap);
        self.regs.load_real_mode_segment(Segment::CS, segment);
        self.regs.eip = offset as u32;
        Ok(())
    }

    fn deliver_protected_mode(&mut self, vector: u8, error_code: Option<u32>, software: bool) -> CpuResult {
        let gate_offset = (vector as u32) * 8;
        if gate_offset + 7 > self.regs.idtr.limit as u32 {
            log::error!("FlatCpu: vector {:02X} outside IDT", vector);
            self.halted = true;
            return Err(CpuAbort::Exception(Interrupt::GeneralProtectionFault, gate_offset + 2));
        }
        let gate = self.read_physical_u64(self.regs.idtr.base.wrapping_add(gate_offset));
        let offset = ((gate & 0xFFFF) | ((gate >> 32) & 0xFFFF_0000)) as u32;
        let selector = (gate >> 16) as u16;
        let gate_type = ((gate >> 40) & 0x0F) as u8;
        let gate_dpl = ((gate >> 45) & 3) as u8;
        let present = gate & (1 << 47) != 0;

        if software && gate_dpl < self.regs.cpl {
            self.delivering = false;
            return Err(self.raise_exception(Interrupt::GeneralProtectionFault, gate_offset + 2));
        }
        if !present || !matches!(gate_type, 0x6 | 0x7 | 0xE | 0xF) {
            log::error!("FlatCpu: unsupported gate type {:X} for vector {:02X}", gate_type, vector);
            self.halted = true;
            return Err(CpuAbort::Exception(Interrupt::GeneralProtectionFault, gate_offset + 2));
        }

        let cache = self.code_descriptor(selector)?;
        let size = if gate_type & 0x8 != 0 {
            OperandSize::Size32
        }
        else {
            OperandSize::Size16
        };
        let flags = self.regs.eflags();
        let cs = self.regs.selector(Segment::CS) as u32;
        let eip = self.regs.eip;
        context::push_sized(self, size, flags)?;
        context::push_sized(self, size, cs)?;
        context::push_sized(self, size, eip)?;
        if let Some(code) = error_code {
            context::push_sized(self, size, code)?;
        }

        // Interrupt gates clear IF, trap gates leave it alone
        if gate_type & 1 == 0 {
            self.regs.clear_flag(Flag::Interrupt);
        }
        self.regs.clear_flag(Flag::Trap);
        self.regs.clear_flag(Flag::NestedTask);
        self.regs.clear_flag(Flag::Resume);
        let target = match size {
            OperandSize::Size32 => offset,
            _ => offset & 0xFFFF,
        };
        self.commit_code_segment(selector, cache, target);
        Ok(())
    }

    fn eflags_writable_mask(&self, operand_size: OperandSize) -> u32 {
        let mut mask = self.model.eflags_mask() & !CPU_FLAG_V86;
        if self.in_segmented_protected_mode() {
            if self.regs.cpl > 0 {
                mask &= !CPU_FLAG_IOPL;
            }
            if self.regs.cpl > self.regs.iopl() {
                mask &= !CPU_FLAG_INT_ENABLE;
            }
        }
        if operand_size != OperandSize::Size32 {
            mask &= 0xFFFF;
        }
        mask
    }
}

fn exception_has_error_code(interrupt: Interrupt) -> bool {
    matches!(
        interrupt,
        Interrupt::DoubleFault
            | Interrupt::InvalidTaskStateSegment
            | Interrupt::SegmentNotPresent
            | Interrupt::StackFault
            | Interrupt::GeneralProtectionFault
            | Interrupt::PageFault
            | Interrupt::AlignmentCheck
    )
}

impl CpuContext for FlatCpu {
    fn registers(&self) -> &Registers {
        &self.regs
    }

    fn registers_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    fn fpu(&self) -> &FpuState {
        &self.fpu
    }

    fn fpu_mut(&mut self) -> &mut FpuState {
        &mut self.fpu
    }

    fn model(&self) -> CpuModel {
        self.model
    }

    fn has_fpu(&self) -> bool {
        self.fpu_present
    }

    fn read_memory_byte(&mut self, segment: Segment, offset: u32) -> CpuResult<u8> {
        let address = self.translate(segment, offset, 1)?;
        Ok(self.read_physical(address))
    }

    fn read_memory_word(&mut self, segment: Segment, offset: u32) -> CpuResult<u16> {
        let address = self.translate(segment, offset, 2)?;
        Ok(self.read_physical_u16(address))
    }

    fn read_memory_dword(&mut self, segment: Segment, offset: u32) -> CpuResult<u32> {
        let address = self.translate(segment, offset, 4)?;
        Ok(self.read_physical_u32(address))
    }

    fn write_memory_byte(&mut self, segment: Segment, offset: u32, value: u8) -> CpuResult {
        let address = self.translate(segment, offset, 1)?;
        self.write_physical(address, value);
        Ok(())
    }

    fn write_memory_word(&mut self, segment: Segment, offset: u32, value: u16) -> CpuResult {
        let address = self.translate(segment, offset, 2)?;
        self.write_physical_u16(address, value);
        Ok(())
    }

    fn write_memory_dword(&mut self, segment: Segment, offset: u32, value: u32) -> CpuResult {
        let address = self.translate(segment, offset, 4)?;
        self.write_physical_u32(address, value);
        Ok(())
    }

    fn read_io_port_byte(&mut self, port: u16) -> CpuResult<u8> {
        Ok(self.port_inputs.get(&port).copied().unwrap_or(0xFF))
    }

    fn read_io_port_word(&mut self, port: u16) -> CpuResult<u16> {
        let lo = self.read_io_port_byte(port)?;
        let hi = self.read_io_port_byte(port.wrapping_add(1))?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn read_io_port_dword(&mut self, port: u16) -> CpuResult<u32> {
        let lo = self.read_io_port_word(port)?;
        let hi = self.read_io_port_word(port.wrapping_add(2))?;
        Ok((lo as u32) | ((hi as u32) << 16))
    }

    fn write_io_port_byte(&mut self, port: u16, value: u8) -> CpuResult {
        self.port_writes.push((port, value));
        Ok(())
    }

    fn write_io_port_word(&mut self, port: u16, value: u16) -> CpuResult {
        self.write_io_port_byte(port, value as u8)?;
        self.write_io_port_byte(port.wrapping_add(1), (value >> 8) as u8)
    }

    fn write_io_port_dword(&mut self, port: u16, value: u32) -> CpuResult {
        self.write_io_port_word(port, value as u16)?;
        self.write_io_port_word(port.wrapping_add(2), (value >> 16) as u16)
    }

    fn has_io_permission(&mut self, _port: u16, _size: u32) -> CpuResult<bool> {
        Ok(self.io_permitted)
    }

    fn far_jump(&mut self, selector: u16, offset: u32, operand_size: OperandSize) -> CpuResult {
        let offset = match operand_size {
            OperandSize::Size32 => offset,
            _ => offset & 0xFFFF,
        };
        if self.in_segmented_protected_mode() {
            let cache = self.code_descriptor(selector)?;
            self.commit_code_segment(selector, cache, offset);
        }
        else {
            self.regs.load_real_mode_segment(Segment::CS, selector);
            self.regs.eip = offset;
        }
        Ok(())
    }

    fn far_call(&mut self, selector: u16, offset: u32, operand_size: OperandSize) -> CpuResult {
        let cs = self.regs.selector(Segment::CS) as u32;
        let eip = self.regs.eip;
        if self.in_segmented_protected_mode() {
            // Validate the target before anything is pushed
            let cache = self.code_descriptor(selector)?;
            context::push_sized(self, operand_size, cs)?;
            context::push_sized(self, operand_size, eip)?;
            let offset = match operand_size {
                OperandSize::Size32 => offset,
                _ => offset & 0xFFFF,
            };
            self.commit_code_segment(selector, cache, offset);
            Ok(())
        }
        else {
            context::push_sized(self, operand_size, cs)?;
            context::push_sized(self, operand_size, eip)?;
            self.far_jump(selector, offset, operand_size)
        }
    }

    fn far_return(&mut self, operand_size: OperandSize, pop_bytes: u32) -> CpuResult {
        let step = operand_size.bytes().max(2);
        let eip = context::peek_sized(self, operand_size, 0)?;
        let selector = context::peek_sized(self, operand_size, step)? as u16;
        if self.in_segmented_protected_mode() {
            if (selector & 3) as u8 != self.regs.cpl {
                log::warn!("FlatCpu: inter-privilege return to {:04X} not supported", selector);
                return Err(self.raise_exception(Interrupt::GeneralProtectionFault, (selector & 0xFFFC) as u32));
            }
            let cache = self.code_descriptor(selector)?;
            self.commit_code_segment(selector, cache, eip);
        }
        else {
            self.regs.load_real_mode_segment(Segment::CS, selector);
            self.regs.eip = eip & 0xFFFF;
        }
        context::adjust_stack_pointer(self, step * 2 + pop_bytes);
        Ok(())
    }

    fn interrupt_return(&mut self, operand_size: OperandSize) -> CpuResult {
        let step = operand_size.bytes().max(2);
        let eip = context::peek_sized(self, operand_size, 0)?;
        let selector = context::peek_sized(self, operand_size, step)? as u16;
        let flags = context::peek_sized(self, operand_size, step * 2)?;
        let mask = self.eflags_writable_mask(operand_size);

        if self.in_segmented_protected_mode() {
            if self.regs.get_flag(Flag::NestedTask) {
                log::warn!("FlatCpu: task return not supported");
                return Err(self.raise_exception(Interrupt::InvalidTaskStateSegment, self.regs.task_register as u32));
            }
            if (selector & 3) as u8 != self.regs.cpl || flags & CPU_FLAG_V86 != 0 {
                log::warn!("FlatCpu: inter-privilege interrupt return to {:04X} not supported", selector);
                return Err(self.raise_exception(Interrupt::GeneralProtectionFault, (selector & 0xFFFC) as u32));
            }
            let cache = self.code_descriptor(selector)?;
            self.commit_code_segment(selector, cache, eip);
        }
        else {
            self.regs.load_real_mode_segment(Segment::CS, selector);
            self.regs.eip = eip & operand_size_mask(operand_size);
        }
        self.regs.set_eflags_masked(flags, mask);
        context::adjust_stack_pointer(self, step * 3);
        Ok(())
    }

    fn software_interrupt(&mut self, vector: u8) -> CpuResult {
        self.deliver_interrupt(vector, None, true)
    }

    fn raise_exception(&mut self, interrupt: Interrupt, error_code: u32) -> CpuAbort {
        log::debug!(
            "FlatCpu: exception {:?} ({:04X}) at {:04X}:{:08X}",
            interrupt,
            error_code,
            self.regs.selector(Segment::CS),
            self.regs.current_eip
        );
        self.exceptions.push((interrupt, error_code));
        // Faults return to the faulting instruction
        self.regs.eip = self.regs.current_eip;
        let code = if self.in_segmented_protected_mode() && exception_has_error_code(interrupt) {
            Some(error_code)
        }
        else {
            None
        };
        if let Err(abort) = self.deliver_interrupt(interrupt.vector(), code, false) {
            return abort;
        }
        CpuAbort::Exception(interrupt, error_code)
    }

    fn load_segment_register(&mut self, segment: Segment, selector: u16) -> CpuResult {
        if !self.in_segmented_protected_mode() {
            self.regs.load_real_mode_segment(segment, selector);
            return Ok(());
        }
        let index = segment as usize;
        if selector & 0xFFFC == 0 {
            if segment == Segment::SS || segment == Segment::CS {
                return Err(self.raise_exception(Interrupt::GeneralProtectionFault, 0));
            }
            self.regs.segment_selectors[index] = selector;
            self.regs.segment_cache[index] = SegmentCache::default();
            return Ok(());
        }
        if segment == Segment::CS {
            let cache = self.code_descriptor(selector)?;
            let eip = self.regs.eip;
            self.commit_code_segment(selector, cache, eip);
            return Ok(());
        }

        let error_code = (selector & 0xFFFC) as u32;
        let Some(raw) = self.lookup_descriptor(selector)?
        else {
            return Err(self.raise_exception(Interrupt::GeneralProtectionFault, error_code));
        };
        let cache = SegmentCache::from_descriptor(raw);
        let rpl = (selector & 3) as u8;
        let cpl = self.regs.cpl;
        let valid = match segment {
            Segment::SS => cache.is_writable() && rpl == cpl && cache.dpl() == cpl,
            _ => cache.is_readable() && (cache.is_conforming() || cache.dpl() >= cpl.max(rpl)),
        };
        if !valid {
            return Err(self.raise_exception(Interrupt::GeneralProtectionFault, error_code));
        }
        if !cache.present() {
            let interrupt = match segment {
                Segment::SS => Interrupt::StackFault,
                _ => Interrupt::SegmentNotPresent,
            };
            return Err(self.raise_exception(interrupt, error_code));
        }
        self.regs.segment_selectors[index] = selector;
        self.regs.segment_cache[index] = cache;
        Ok(())
    }

    fn load_ldt(&mut self, selector: u16) -> CpuResult {
        if selector & 0xFFFC == 0 {
            self.regs.ldtr = 0;
            self.regs.ldtr_cache = SegmentCache::default();
            return Ok(());
        }
        let error_code = (selector & 0xFFFC) as u32;
        if selector & 4 != 0 {
            return Err(self.raise_exception(Interrupt::GeneralProtectionFault, error_code));
        }
        let Some(raw) = self.lookup_descriptor(selector)?
        else {
            return Err(self.raise_exception(Interrupt::GeneralProtectionFault, error_code));
        };
        let cache = SegmentCache::from_descriptor(raw);
        if !cache.is_system() || cache.descriptor_type() != 0x2 {
            return Err(self.raise_exception(Interrupt::GeneralProtectionFault, error_code));
        }
        if !cache.present() {
            return Err(self.raise_exception(Interrupt::SegmentNotPresent, error_code));
        }
        self.regs.ldtr = selector;
        self.regs.ldtr_cache = cache;
        Ok(())
    }

    fn load_task_register(&mut self, selector: u16) -> CpuResult {
        let error_code = (selector & 0xFFFC) as u32;
        if selector & 0xFFFC == 0 || selector & 4 != 0 {
            return Err(self.raise_exception(Interrupt::GeneralProtectionFault, error_code));
        }
        let Some(raw) = self.lookup_descriptor(selector)?
        else {
            return Err(self.raise_exception(Interrupt::GeneralProtectionFault, error_code));
        };
        let cache = SegmentCache::from_descriptor(raw);
        // Available 286 or 386 TSS
        if !cache.is_system() || !matches!(cache.descriptor_type(), 0x1 | 0x9) {
            return Err(self.raise_exception(Interrupt::GeneralProtectionFault, error_code));
        }
        if !cache.present() {
            return Err(self.raise_exception(Interrupt::SegmentNotPresent, error_code));
        }
        // Mark the descriptor busy
        let address = self.regs.gdtr.base.wrapping_add((selector & 0xFFF8) as u32) + 5;
        let access = self.read_physical(address);
        self.write_physical(address, access | 0x02);
        self.regs.task_register = selector;
        self.regs.task_cache = cache;
        Ok(())
    }

    fn lookup_descriptor(&mut self, selector: u16) -> CpuResult<Option<u64>> {
        let (base, limit) = if selector & 4 != 0 {
            (self.regs.ldtr_cache.base, self.regs.ldtr_cache.limit)
        }
        else {
            (self.regs.gdtr.base, self.regs.gdtr.limit as u32)
        };
        let offset = (selector & 0xFFF8) as u32;
        if offset + 7 > limit {
            return Ok(None);
        }
        Ok(Some(self.read_physical_u64(base.wrapping_add(offset))))
    }

    fn has_external_interrupt(&self) -> bool {
        self.interrupt_pending && self.regs.get_flag(Flag::Interrupt)
    }

    fn halted(&self) -> bool {
        self.halted
    }

    fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
    }

    fn add_cycles(&mut self, cycles: u32) {
        self.cycles += cycles as u64;
    }

    fn read_tsc(&self) -> u64 {
        self.cycles
    }

    fn fpu_error_irq(&mut self) {
        self.fpu_irq_count += 1;
    }
}

fn operand_size_mask(operand_size: OperandSize) -> u32 {
    match operand_size {
        OperandSize::Size32 => 0xFFFF_FFFF,
        _ => 0xFFFF,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coreconfig::CpuConfig;

    #[test]
    fn test_configure() {
        let config = CpuConfig::from_toml("[cpu]\nmodel = \"Intel80386\"\nfpu = false\n").unwrap();
        let mut cpu = FlatCpu::real_mode(&[0x90]);
        cpu.configure(&config);
        assert_eq!(cpu.model(), CpuModel::Intel80386);
        assert!(!cpu.has_fpu());
    }

    #[test]
    fn test_real_mode_addressing() {
        let mut cpu = FlatCpu::real_mode(&[0x90]);
        cpu.regs.load_real_mode_segment(Segment::DS, 0x1234);
        cpu.write_memory_word(Segment::DS, 0x0010, 0xBEEF).unwrap();
        assert_eq!(cpu.read_physical_u16(0x12350), 0xBEEF);
        assert_eq!(cpu.read_memory_byte(Segment::DS, 0x0011).unwrap(), 0xBE);
    }

    #[test]
    fn test_limit_fault() {
        let mut cpu = FlatCpu::real_mode(&[0x90]);
        assert!(cpu.read_memory_word(Segment::DS, 0xFFFF).is_err());
        assert_eq!(cpu.exceptions, vec![(Interrupt::GeneralProtectionFault, 0)]);
        assert!(cpu.read_memory_byte(Segment::SS, 0x10000).is_err());
        assert_eq!(cpu.exceptions[1].0, Interrupt::StackFault);
    }

    #[test]
    fn test_real_mode_interrupt_delivery() {
        let mut cpu = FlatCpu::real_mode(&[0x90]);
        cpu.set_interrupt_vector(0x21, 0x2000, 0x0040);
        cpu.regs.set_flag(Flag::Interrupt);
        cpu.regs.eip = 0x0102;
        cpu.software_interrupt(0x21).unwrap();
        assert_eq!(cpu.regs.selector(Segment::CS), 0x2000);
        assert_eq!(cpu.regs.eip, 0x0040);
        assert!(!cpu.regs.get_flag(Flag::Interrupt));
        assert_eq!(cpu.regs.get16(Register16::SP), 0x8000 - 6);
        assert_eq!(cpu.read_physical_u16(0x8000 - 6), 0x0102);

        cpu.interrupt_return(OperandSize::Size16).unwrap();
        assert_eq!(cpu.regs.selector(Segment::CS), 0x0000);
        assert_eq!(cpu.regs.eip, 0x0102);
        assert!(cpu.regs.get_flag(Flag::Interrupt));
        assert_eq!(cpu.regs.get16(Register16::SP), 0x8000);
    }

    #[test]
    fn test_protected_mode_segments() {
        let mut cpu = FlatCpu::protected_mode(&[0x90]);
        assert_eq!(cpu.regs.code_operand_size(), OperandSize::Size32);
        assert_eq!(cpu.regs.stack_address_size(), AddressSize::Addr32);
        cpu.write_memory_dword(Segment::DS, 0x0010_0000 - 4, 0x1234_5678).unwrap();

        // User data segment cannot be loaded into SS at CPL 0
        assert!(cpu.load_segment_register(Segment::SS, FLAT_SELECTOR_DATA32_USER).is_err());
        assert_eq!(cpu.exceptions.last(), Some(&(Interrupt::GeneralProtectionFault, 0x20)));

        cpu.load_segment_register(Segment::ES, 0).unwrap();
        assert!(cpu.read_memory_byte(Segment::ES, 0).is_err());
    }

    #[test]
    fn test_task_register_marks_busy() {
        let mut cpu = FlatCpu::protected_mode(&[0x90]);
        cpu.load_task_register(FLAT_SELECTOR_TSS).unwrap();
        assert_eq!(cpu.regs.task_register, FLAT_SELECTOR_TSS);
        assert_eq!(cpu.regs.task_cache.base, 0x0B00);
        // Loading a busy TSS fails
        assert!(cpu.load_task_register(FLAT_SELECTOR_TSS).is_err());
        cpu.load_ldt(FLAT_SELECTOR_LDT).unwrap();
        assert_eq!(cpu.regs.ldtr_cache.base, 0x0A00);
    }
}
