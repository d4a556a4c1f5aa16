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

    tests::decode.rs

    Decoder tests run against the public decoding interface.

*/

use marty386_core::{
    bytequeue::{ByteQueue, SliceQueue},
    cpu_386::{decode, decode_slice, Operation},
    cpu_common::*,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn decode_lengths(stream: &[u8], address_size: AddressSize, operand_size: OperandSize) -> Vec<u32> {
    let mut queue = SliceQueue::new(stream);
    let mut lengths = Vec::new();
    while queue.remaining() > 0 {
        let start = queue.tell();
        let instr = decode(&mut queue, address_size, operand_size).unwrap();
        assert_eq!(instr.length as usize, queue.tell() - start);
        lengths.push(instr.length);
    }
    lengths
}

#[test]
fn test_length_consistency_32() {
    #[rustfmt::skip]
    let stream: &[u8] = &[
        0x55,                                     // push ebp
        0x89, 0xE5,                               // mov ebp, esp
        0x8B, 0x44, 0x8D, 0x08,                   // mov eax, [ebp+ecx*4+8]
        0x8B, 0x04, 0x25, 0x00, 0x10, 0x00, 0x00, // mov eax, [00001000h]
        0x66, 0xC7, 0x00, 0x34, 0x12,             // mov word [eax], 1234h
        0x81, 0xC3, 0x78, 0x56, 0x34, 0x12,       // add ebx, 12345678h
        0x67, 0x8A, 0x07,                         // mov al, [bx]
        0x0F, 0x84, 0x00, 0x01, 0x00, 0x00,       // jz near +100h
        0x0F, 0xA4, 0xD0, 0x04,                   // shld eax, edx, 4
        0xF0, 0x0F, 0xB1, 0x0B,                   // lock cmpxchg [ebx], ecx
        0xD9, 0x05, 0x00, 0x20, 0x00, 0x00,       // fld dword [00002000h]
        0xC3,                                     // ret
    ];
    assert_eq!(
        decode_lengths(stream, AddressSize::Addr32, OperandSize::Size32),
        [1, 2, 4, 7, 5, 6, 3, 6, 4, 4, 6, 1]
    );
}

#[test]
fn test_mode_changes_lengths() {
    // b8 imm is 3 bytes in 16-bit code and 5 in 32-bit code
    let bytes = [0xB8, 0x01, 0x00, 0x00, 0x00];
    assert_eq!(decode_slice(&bytes, AddressSize::Addr16, OperandSize::Size16).unwrap().length, 3);
    assert_eq!(decode_slice(&bytes, AddressSize::Addr32, OperandSize::Size32).unwrap().length, 5);

    // 66 b8 imm flips it back
    let bytes = [0x66, 0xB8, 0x01, 0x00, 0x00, 0x00];
    assert_eq!(decode_slice(&bytes, AddressSize::Addr16, OperandSize::Size16).unwrap().length, 6);
    assert_eq!(decode_slice(&bytes, AddressSize::Addr32, OperandSize::Size32).unwrap().length, 4);
}

#[test]
fn test_repeated_operand_size_prefix() {
    let instr = decode_slice(&[0x66, 0x66, 0x01, 0xD8], AddressSize::Addr16, OperandSize::Size16).unwrap();
    assert_eq!(instr.operation, Operation::Add);
    assert_eq!(instr.operand_size, OperandSize::Size32);
    assert_eq!(instr.length, 4);
}

#[test]
fn test_random_streams_never_overrun() {
    let mut rng = StdRng::seed_from_u64(0x386);
    let mut buffer = [0u8; 32];
    for _ in 0..20_000 {
        rng.fill(&mut buffer[..]);
        let (asz, osz) = match rng.gen_bool(0.5) {
            true => (AddressSize::Addr32, OperandSize::Size32),
            false => (AddressSize::Addr16, OperandSize::Size16),
        };
        let mut queue = SliceQueue::new(&buffer);
        match decode(&mut queue, asz, osz) {
            Ok(instr) => {
                assert!(instr.length as usize <= MAX_INSTRUCTION_SIZE);
                assert_eq!(instr.length as usize, queue.tell());
            }
            Err(DecodeError::InvalidOpcode { length, .. }) => assert!(length as usize <= queue.tell()),
            Err(DecodeError::TooLong) => assert!(queue.tell() >= MAX_INSTRUCTION_SIZE),
            Err(DecodeError::FetchFailed { .. }) => panic!("32 bytes is always enough"),
        }
    }
}
