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

    cpu_386::recompiler::regcache.rs

    Guest to host register cache.

    The cache remembers, per register width, where the current value of each
    guest register lives while a block is being compiled: in a host register,
    as a known constant, or only in the guest register file. Registers are
    loaded on first use and stored back when flushed. When the host register
    pool runs dry the least recently used guest value is evicted.

    Overlapping views of the same guest register (EAX, AX, AL, AH) are never
    cached at the same time. Touching one view flushes and drops the others,
    so stores always reach the register file in program order.

*/

use modular_bitfield::{bitfield, prelude::B3};

use crate::cpu_386::recompiler::{
    codegen::{GuestReg, HostOp, HostReg, RegWidth},
    RecompilerError,
};

pub const HOST_REGISTER_COUNT: usize = 6;
pub const MAX_HOST_REGISTERS: usize = 16;

#[bitfield]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CacheFlags {
    /// The entry describes the current value.
    pub valid: bool,
    /// The value is known at compile time.
    pub constant: bool,
    pub in_host_register: bool,
    /// A temporary not bound to any guest register.
    pub scratch: bool,
    /// The value has not been written back to the guest register file.
    pub dirty: bool,
    #[skip]
    unused: B3,
}

#[derive(Copy, Clone, Debug)]
pub struct CacheEntry {
    pub flags: CacheFlags,
    pub host: HostReg,
    pub constant: u32,
    last_use: u32,
}

impl CacheEntry {
    fn empty() -> Self {
        Self {
            flags: CacheFlags::new(),
            host: HostReg(0),
            constant: 0,
            last_use: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum HostSlot {
    Free,
    Guest(GuestReg),
    Scratch,
}

pub struct RegisterCache {
    entries: [[CacheEntry; 8]; 3],
    scratch: Vec<CacheEntry>,
    slots: Vec<HostSlot>,
    pinned: Vec<bool>,
    clock: u32,
}

impl Default for RegisterCache {
    fn default() -> Self {
        Self::new(HOST_REGISTER_COUNT)
    }
}

impl RegisterCache {
    pub fn new(host_registers: usize) -> Self {
        let host_registers = host_registers.clamp(1, MAX_HOST_REGISTERS);
        Self {
            entries: [[CacheEntry::empty(); 8]; 3],
            scratch: vec![CacheEntry::empty(); host_registers],
            slots: vec![HostSlot::Free; host_registers],
            pinned: vec![false; host_registers],
            clock: 0,
        }
    }

    pub fn host_register_count(&self) -> usize {
        self.slots.len()
    }

    pub fn entry(&self, guest: GuestReg) -> &CacheEntry {
        &self.entries[guest.width as usize][guest.index as usize]
    }

    fn entry_mut(&mut self, guest: GuestReg) -> &mut CacheEntry {
        &mut self.entries[guest.width as usize][guest.index as usize]
    }

    /// Host registers used by the previous instruction may be evicted again.
    pub fn begin_instruction(&mut self) {
        self.pinned.iter_mut().for_each(|p| *p = false);
    }

    fn touch(&mut self, guest: GuestReg) {
        self.clock = self.clock.wrapping_add(1);
        let clock = self.clock;
        let entry = self.entry_mut(guest);
        entry.last_use = clock;
        if entry.flags.in_host_register() {
            let host = entry.host;
            self.pinned[host.0 as usize] = true;
        }
    }

    /// Guest views overlapping `guest` with a different width.
    fn overlapping(guest: GuestReg) -> impl Iterator<Item = GuestReg> {
        let family = match guest.width {
            RegWidth::Byte => guest.index & 0x03,
            _ => guest.index,
        };
        let candidates = [
            GuestReg::new(RegWidth::Dword, family),
            GuestReg::new(RegWidth::Word, family),
            GuestReg::new(RegWidth::Byte, family),
            GuestReg::new(RegWidth::Byte, family + 4),
        ];
        candidates.into_iter().filter(move |other| {
            let has_bytes = family < 4;
            match other.width {
                RegWidth::Byte if !has_bytes => false,
                RegWidth::Byte if guest.width == RegWidth::Byte => false,
                width => width != guest.width,
            }
        })
    }

    /// Flush and drop every other cached view of the same guest register.
    fn claim(&mut self, ops: &mut Vec<HostOp>, guest: GuestReg) {
        for other in Self::overlapping(guest) {
            if self.entry(other).flags.valid() {
                self.flush(ops, other, true);
            }
        }
    }

    /// Return a host register holding the guest register's value, loading or materializing it
    /// if needed.
    pub fn read(&mut self, ops: &mut Vec<HostOp>, guest: GuestReg) -> Result<HostReg, RecompilerError> {
        self.claim(ops, guest);
        let entry = *self.entry(guest);
        if entry.flags.valid() && entry.flags.in_host_register() {
            self.touch(guest);
            return Ok(entry.host);
        }
        let host = self.allocate(ops)?;
        self.slots[host.0 as usize] = HostSlot::Guest(guest);
        let entry = self.entry_mut(guest);
        if entry.flags.valid() && entry.flags.constant() {
            ops.push(HostOp::MaterializeConstant {
                dst:   host,
                value: entry.constant,
            });
        }
        else {
            ops.push(HostOp::LoadGuest { dst: host, guest });
            entry.flags = CacheFlags::new().with_valid(true);
        }
        entry.flags.set_in_host_register(true);
        entry.host = host;
        self.touch(guest);
        Ok(host)
    }

    /// Record a compile-time constant as the guest register's new value.
    pub fn write_constant(&mut self, ops: &mut Vec<HostOp>, guest: GuestReg, value: u32) {
        self.claim(ops, guest);
        self.release_home(guest);
        let entry = self.entry_mut(guest);
        entry.flags = CacheFlags::new().with_valid(true).with_constant(true).with_dirty(true);
        entry.constant = value & guest.width.mask();
        self.touch(guest);
    }

    /// Make a scratch register the guest register's new home.
    pub fn write(&mut self, ops: &mut Vec<HostOp>, guest: GuestReg, host: HostReg) {
        self.claim(ops, guest);
        let current = *self.entry(guest);
        if !(current.flags.in_host_register() && current.host == host) {
            self.release_home(guest);
        }
        self.scratch[host.0 as usize] = CacheEntry::empty();
        self.slots[host.0 as usize] = HostSlot::Guest(guest);
        let entry = self.entry_mut(guest);
        entry.flags = CacheFlags::new()
            .with_valid(true)
            .with_in_host_register(true)
            .with_dirty(true);
        entry.host = host;
        self.touch(guest);
    }

    /// Write the guest register's value back if it is dirty, and optionally forget it.
    pub fn flush(&mut self, ops: &mut Vec<HostOp>, guest: GuestReg, invalidate: bool) {
        let entry = *self.entry(guest);
        if entry.flags.valid() && entry.flags.dirty() {
            if entry.flags.in_host_register() {
                ops.push(HostOp::StoreGuest { src: entry.host, guest });
            }
            else if entry.flags.constant() {
                ops.push(HostOp::StoreGuestConstant {
                    guest,
                    value: entry.constant,
                });
            }
            self.entry_mut(guest).flags.set_dirty(false);
        }
        if invalidate {
            self.release_home(guest);
            *self.entry_mut(guest) = CacheEntry::empty();
        }
    }

    /// Flush every cached guest register in a fixed order.
    pub fn flush_all(&mut self, ops: &mut Vec<HostOp>, invalidate: bool) {
        for width in [RegWidth::Byte, RegWidth::Word, RegWidth::Dword] {
            for index in 0..8 {
                self.flush(ops, GuestReg::new(width, index), invalidate);
            }
        }
        if invalidate {
            for host in 0..self.slots.len() {
                if self.slots[host] == HostSlot::Scratch {
                    self.release_scratch(HostReg(host as u8));
                }
            }
        }
    }

    /// Write back and drop one guest register, freeing its host register.
    pub fn evict(&mut self, ops: &mut Vec<HostOp>, guest: GuestReg) {
        log::trace!("regcache: evicting {:?}", guest);
        self.flush(ops, guest, true);
    }

    /// Take a host register for a temporary value.
    pub fn alloc_scratch(&mut self, ops: &mut Vec<HostOp>) -> Result<HostReg, RecompilerError> {
        let host = self.allocate(ops)?;
        self.slots[host.0 as usize] = HostSlot::Scratch;
        self.pinned[host.0 as usize] = true;
        self.scratch[host.0 as usize] = CacheEntry {
            flags: CacheFlags::new()
                .with_valid(true)
                .with_in_host_register(true)
                .with_scratch(true),
            host,
            constant: 0,
            last_use: self.clock,
        };
        Ok(host)
    }

    pub fn release_scratch(&mut self, host: HostReg) {
        if self.slots[host.0 as usize] == HostSlot::Scratch {
            self.slots[host.0 as usize] = HostSlot::Free;
            self.scratch[host.0 as usize] = CacheEntry::empty();
        }
    }

    fn release_home(&mut self, guest: GuestReg) {
        let entry = *self.entry(guest);
        if entry.flags.in_host_register() && self.slots[entry.host.0 as usize] == HostSlot::Guest(guest) {
            self.slots[entry.host.0 as usize] = HostSlot::Free;
        }
        self.entry_mut(guest).flags.set_in_host_register(false);
    }

    /// Find a free host register, evicting the least recently used unpinned guest value if
    /// there is none.
    fn allocate(&mut self, ops: &mut Vec<HostOp>) -> Result<HostReg, RecompilerError> {
        if let Some(free) = self.slots.iter().position(|slot| *slot == HostSlot::Free) {
            return Ok(HostReg(free as u8));
        }
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(host, _)| !self.pinned[*host])
            .filter_map(|(_, slot)| match slot {
                HostSlot::Guest(guest) => Some(*guest),
                _ => None,
            })
            .min_by_key(|guest| self.entry(*guest).last_use);
        match victim {
            Some(guest) => {
                let host = self.entry(guest).host;
                self.evict(ops, guest);
                Ok(host)
            }
            None => Err(RecompilerError::HostRegistersExhausted),
        }
    }

    /// Number of host registers currently bound to a guest register or scratch value.
    pub fn used_host_registers(&self) -> usize {
        self.slots.iter().filter(|slot| **slot != HostSlot::Free).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EAX: GuestReg = GuestReg::new(RegWidth::Dword, 0);
    const ECX: GuestReg = GuestReg::new(RegWidth::Dword, 1);
    const EDX: GuestReg = GuestReg::new(RegWidth::Dword, 2);
    const AX: GuestReg = GuestReg::new(RegWidth::Word, 0);
    const AL: GuestReg = GuestReg::new(RegWidth::Byte, 0);
    const AH: GuestReg = GuestReg::new(RegWidth::Byte, 4);

    #[test]
    fn test_read_loads_once() {
        let mut cache = RegisterCache::default();
        let mut ops = Vec::new();
        let first = cache.read(&mut ops, EAX).unwrap();
        let second = cache.read(&mut ops, EAX).unwrap();
        assert_eq!(first, second);
        assert_eq!(ops, vec![HostOp::LoadGuest { dst: first, guest: EAX }]);
        assert!(!cache.entry(EAX).flags.dirty());
    }

    #[test]
    fn test_constant_flush() {
        let mut cache = RegisterCache::default();
        let mut ops = Vec::new();
        cache.write_constant(&mut ops, AX, 0x1_2345);
        assert!(ops.is_empty());
        assert!(cache.entry(AX).flags.constant());
        cache.flush(&mut ops, AX, false);
        assert_eq!(ops, vec![HostOp::StoreGuestConstant { guest: AX, value: 0x2345 }]);
        assert!(!cache.entry(AX).flags.dirty());
        assert!(cache.entry(AX).flags.valid());
    }

    #[test]
    fn test_overlapping_views_flush_first() {
        let mut cache = RegisterCache::default();
        let mut ops = Vec::new();
        cache.write_constant(&mut ops, EAX, 0x1234_5678);
        // AL and AH don't overlap each other but both overlap EAX
        cache.write_constant(&mut ops, AL, 0x11);
        cache.write_constant(&mut ops, AH, 0x22);
        assert_eq!(ops, vec![HostOp::StoreGuestConstant { guest: EAX, value: 0x1234_5678 }]);
        assert!(!cache.entry(EAX).flags.valid());
        assert!(cache.entry(AL).flags.valid());
        assert!(cache.entry(AH).flags.valid());
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = RegisterCache::new(2);
        let mut ops = Vec::new();
        let eax = cache.read(&mut ops, EAX).unwrap();
        cache.begin_instruction();
        cache.read(&mut ops, ECX).unwrap();
        cache.begin_instruction();
        // EAX was used least recently
        let host = cache.read(&mut ops, EDX).unwrap();
        assert_eq!(host, eax);
        assert!(!cache.entry(EAX).flags.valid());
        assert!(cache.entry(ECX).flags.in_host_register());
    }

    #[test]
    fn test_dirty_eviction_stores() {
        let mut cache = RegisterCache::new(1);
        let mut ops = Vec::new();
        let t = cache.alloc_scratch(&mut ops).unwrap();
        cache.write(&mut ops, EAX, t);
        cache.begin_instruction();
        cache.read(&mut ops, ECX).unwrap();
        assert_eq!(ops[0], HostOp::StoreGuest { src: t, guest: EAX });
        assert_eq!(ops[1], HostOp::LoadGuest { dst: t, guest: ECX });
    }

    #[test]
    fn test_exhausted() {
        let mut cache = RegisterCache::new(1);
        let mut ops = Vec::new();
        cache.alloc_scratch(&mut ops).unwrap();
        assert!(matches!(
            cache.read(&mut ops, EAX),
            Err(RecompilerError::HostRegistersExhausted)
        ));
    }

    #[test]
    fn test_flush_all_invalidate() {
        let mut cache = RegisterCache::default();
        let mut ops = Vec::new();
        cache.read(&mut ops, ECX).unwrap();
        cache.write_constant(&mut ops, EDX, 7);
        cache.alloc_scratch(&mut ops).unwrap();
        ops.clear();
        cache.flush_all(&mut ops, true);
        assert_eq!(ops, vec![HostOp::StoreGuestConstant { guest: EDX, value: 7 }]);
        assert_eq!(cache.used_host_registers(), 0);
        assert!(!cache.entry(ECX).flags.valid());
    }
}
