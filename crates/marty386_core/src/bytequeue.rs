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

    bytequeue.rs

    Implements the ByteQueue trait. ByteQueue is the only interface the decoder
    uses to read instruction bytes, so the same decoder can decode from a CPU
    context's code segment or from a flat byte slice.

*/

use crate::cpu_common::MAX_INSTRUCTION_SIZE;

pub trait ByteQueue {
    /// Fetch the next byte, or None if the stream is exhausted or the fetch faulted.
    fn fetch_u8(&mut self) -> Option<u8>;

    /// Number of bytes consumed so far.
    fn tell(&self) -> usize;

    #[inline]
    fn fetch_i8(&mut self) -> Option<i8> {
        self.fetch_u8().map(|b| b as i8)
    }

    #[inline]
    fn fetch_u16(&mut self) -> Option<u16> {
        let lo = self.fetch_u8()?;
        let hi = self.fetch_u8()?;
        Some(u16::from_le_bytes([lo, hi]))
    }

    #[inline]
    fn fetch_u32(&mut self) -> Option<u32> {
        let b0 = self.fetch_u8()?;
        let b1 = self.fetch_u8()?;
        let b2 = self.fetch_u8()?;
        let b3 = self.fetch_u8()?;
        Some(u32::from_le_bytes([b0, b1, b2, b3]))
    }
}

/// A ByteQueue over a byte slice.
pub struct SliceQueue<'a> {
    data: &'a [u8],
    pos:  usize,
}

impl<'a> SliceQueue<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

impl ByteQueue for SliceQueue<'_> {
    #[inline]
    fn fetch_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos).copied()?;
        self.pos += 1;
        Some(byte)
    }

    #[inline]
    fn tell(&self) -> usize {
        self.pos
    }
}

/// Bytes fetched for the current instruction, kept for diagnostics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct InstructionBytes {
    bytes: [u8; MAX_INSTRUCTION_SIZE],
    len:   u8,
}

impl InstructionBytes {
    pub fn push(&mut self, byte: u8) {
        if (self.len as usize) < MAX_INSTRUCTION_SIZE {
            self.bytes[self.len as usize] = byte;
            self.len += 1;
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_queue_little_endian() {
        let data = [0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0xFF];
        let mut q = SliceQueue::new(&data);
        assert_eq!(q.fetch_u16(), Some(0x1234));
        assert_eq!(q.fetch_u32(), Some(0x1234_5678));
        assert_eq!(q.tell(), 6);
        assert_eq!(q.fetch_i8(), Some(-1));
        assert_eq!(q.fetch_u8(), None);
        assert_eq!(q.tell(), 7);
    }
}
