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

    cpu_386::decode.rs

    Instruction decoding.

    decode() operates on implementors of ByteQueue, so the same routine
    decodes from a CPU context's code segment or from a flat byte slice.

*/

#[cfg(debug_assertions)]
use crate::bytequeue::InstructionBytes;
use crate::{
    bytequeue::ByteQueue,
    cpu_386::{
        instruction::Instruction,
        modrm::{self, ModRmMode},
        opcodes::{OperandMode, Operation, TableEntry, TableId, OPCODE_TABLES},
    },
    cpu_common::{AddressSize, DecodeError, OperandSize, Segment, MAX_INSTRUCTION_SIZE},
};

/// Counts and bounds the bytes fetched for one instruction.
struct Fetcher<'q, Q: ByteQueue + ?Sized> {
    queue: &'q mut Q,
    length: u32,
    #[cfg(debug_assertions)]
    bytes: InstructionBytes,
}

impl<'q, Q: ByteQueue + ?Sized> Fetcher<'q, Q> {
    fn new(queue: &'q mut Q) -> Self {
        Self {
            queue,
            length: 0,
            #[cfg(debug_assertions)]
            bytes: InstructionBytes::default(),
        }
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        if self.length as usize >= MAX_INSTRUCTION_SIZE {
            return Err(DecodeError::TooLong);
        }
        let byte = self
            .queue
            .fetch_u8()
            .ok_or(DecodeError::FetchFailed { length: self.length })?;
        self.length += 1;
        #[cfg(debug_assertions)]
        self.bytes.push(byte);
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let lo = self.u16()?;
        let hi = self.u16()?;
        Ok((lo as u32) | ((hi as u32) << 16))
    }

    /// Fetch a value of the given size, sign-extending 8 and 16-bit values when `signed` is set.
    fn sized(&mut self, size: OperandSize, signed: bool) -> Result<u32, DecodeError> {
        Ok(match size {
            OperandSize::Size8 if signed => self.u8()? as i8 as i32 as u32,
            OperandSize::Size8 => self.u8()? as u32,
            OperandSize::Size16 if signed => self.u16()? as i16 as i32 as u32,
            OperandSize::Size16 => self.u16()? as u32,
            _ => self.u32()?,
        })
    }
}

/// Merge a group table entry with the first-level entry that redirected to it.
/// Operands present in the group entry take precedence.
fn merge_entries(first: &TableEntry, second: &TableEntry) -> TableEntry {
    let mut merged = *second;
    for (dst, src) in merged.operands.iter_mut().zip(first.operands.iter()) {
        if dst.is_none() {
            *dst = *src;
        }
    }
    merged
}

/// Decode one instruction. `address_size` and `operand_size` are the code segment's defaults.
/// The returned instruction's `address` is left at 0 for the caller to fill in.
pub fn decode<Q: ByteQueue + ?Sized>(
    queue: &mut Q,
    address_size: AddressSize,
    operand_size: OperandSize,
) -> Result<Instruction, DecodeError> {
    let mut fetch = Fetcher::new(queue);
    let mut instr = Instruction {
        operand_size,
        address_size,
        segment: Segment::DS,
        ..Default::default()
    };

    let mut table = TableId::Base;
    let entry = loop {
        let opcode = fetch.u8()?;
        let entry = OPCODE_TABLES.lookup(table, opcode as usize);
        match entry.operation {
            Operation::SegmentPrefix => {
                instr.segment = Segment::from_index(entry.operands[0].data).unwrap_or(Segment::DS);
                instr.has_segment_override = true;
            }
            // Size prefixes toggle relative to the segment default, so repeats have no further effect.
            Operation::OperandSizePrefix => instr.operand_size = operand_size.toggled(),
            Operation::AddressSizePrefix => instr.address_size = address_size.toggled(),
            Operation::LockPrefix => instr.has_lock = true,
            Operation::RepPrefix => {
                instr.has_rep = true;
                instr.has_repne = false;
            }
            Operation::RepNePrefix => {
                instr.has_rep = true;
                instr.has_repne = true;
            }
            Operation::Extension => match entry.next {
                Some(next) => table = next,
                None => return Err(DecodeError::InvalidOpcode { opcode, length: fetch.length }),
            },
            Operation::ExtensionModRmReg | Operation::ExtensionModRmX87 => {
                let Some(next) = entry.next
                else {
                    return Err(DecodeError::InvalidOpcode { opcode, length: fetch.length });
                };
                let modrm = fetch.u8()?;
                instr.modrm = modrm;
                instr.has_modrm = true;
                let index = if entry.operation == Operation::ExtensionModRmX87 && modrm >= 0xC0 {
                    8 + (modrm & 0x3F) as usize
                }
                else {
                    ((modrm >> 3) & 7) as usize
                };
                let second = OPCODE_TABLES.lookup(next, index);
                if !second.is_valid() {
                    return Err(DecodeError::InvalidOpcode {
                        opcode,
                        length: fetch.length,
                    });
                }
                break merge_entries(entry, second);
            }
            Operation::Invalid => {
                return Err(DecodeError::InvalidOpcode {
                    opcode,
                    length: fetch.length,
                })
            }
            _ => break *entry,
        }
    };

    instr.operation = entry.operation;
    instr.condition = entry.condition;

    // MOV to and from system registers always addresses a register, whatever the mod field says.
    let force_register = matches!(entry.operation, Operation::MovCr | Operation::MovDr | Operation::MovTr);

    for (slot, template) in entry.operands.iter().enumerate() {
        let mut operand = *template;
        operand.size = operand.size.resolve(instr.operand_size);

        match operand.mode {
            OperandMode::ModRmReg
            | OperandMode::ModRmSegmentReg
            | OperandMode::ModRmControlReg
            | OperandMode::ModRmDebugReg
            | OperandMode::ModRmTestReg => {
                if !instr.has_modrm {
                    instr.modrm = fetch.u8()?;
                    instr.has_modrm = true;
                }
            }
            OperandMode::ModRmRm => {
                if !instr.has_modrm {
                    instr.modrm = fetch.u8()?;
                    instr.has_modrm = true;
                }
                let address = modrm::modrm_address(instr.address_size, instr.modrm);
                if force_register || address.mode == ModRmMode::Register {
                    instr.modrm_rm_register = true;
                }
                else {
                    let mut displacement_size = address.displacement_size;
                    if address.mode == ModRmMode::Sib {
                        let sib = fetch.u8()?;
                        instr.sib = sib;
                        instr.has_sib = true;
                        if !modrm::sib_has_base(instr.modrm, sib) {
                            displacement_size = 4;
                        }
                        if !instr.has_segment_override {
                            instr.segment = modrm::sib_default_segment(instr.modrm, sib);
                        }
                    }
                    else if !instr.has_segment_override {
                        instr.segment = address.default_segment;
                    }

                    instr.displacement = match displacement_size {
                        1 => fetch.sized(OperandSize::Size8, true)?,
                        2 => fetch.sized(OperandSize::Size16, true)?,
                        4 => fetch.u32()?,
                        _ => 0,
                    };
                }
            }
            OperandMode::Immediate => instr.immediate = fetch.sized(operand.size, false)?,
            OperandMode::Immediate2 => instr.immediate2 = fetch.sized(operand.size, false)?,
            OperandMode::Relative => instr.displacement = fetch.sized(operand.size, true)?,
            OperandMode::Memory => {
                instr.displacement = match instr.address_size {
                    AddressSize::Addr16 => fetch.u16()? as u32,
                    AddressSize::Addr32 => fetch.u32()?,
                };
            }
            OperandMode::FarAddress => {
                instr.displacement = match instr.operand_size {
                    OperandSize::Size32 => fetch.u32()?,
                    _ => fetch.u16()? as u32,
                };
                instr.immediate = fetch.u16()? as u32;
            }
            OperandMode::None
            | OperandMode::Constant
            | OperandMode::Register
            | OperandMode::SegmentRegister
            | OperandMode::FpuRegister
            | OperandMode::RegisterIndirect => {}
        }
        instr.operands[slot] = operand;
    }

    instr.length = fetch.length;
    #[cfg(debug_assertions)]
    {
        instr.bytes = fetch.bytes;
    }
    Ok(instr)
}

/// Decode from a byte slice.
pub fn decode_slice(bytes: &[u8], address_size: AddressSize, operand_size: OperandSize) -> Result<Instruction, DecodeError> {
    let mut queue = crate::bytequeue::SliceQueue::new(bytes);
    decode(&mut queue, address_size, operand_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bytequeue::SliceQueue, cpu_386::opcodes::Operand, cpu_common::JumpCondition};

    fn decode16(bytes: &[u8]) -> Result<Instruction, DecodeError> {
        decode_slice(bytes, AddressSize::Addr16, OperandSize::Size16)
    }

    fn decode32(bytes: &[u8]) -> Result<Instruction, DecodeError> {
        decode_slice(bytes, AddressSize::Addr32, OperandSize::Size32)
    }

    #[test]
    fn test_decode_add_register() {
        let i = decode16(&[0x01, 0xD8]).unwrap();
        assert_eq!(i.operation, Operation::Add);
        assert_eq!(i.length, 2);
        assert!(i.modrm_rm_register);
        assert_eq!(i.operands[0].size, OperandSize::Size16);
        assert_eq!(i.to_string(), "add ax, bx");
    }

    #[test]
    fn test_double_operand_size_prefix() {
        let i = decode16(&[0x66, 0x66, 0xB8, 0x78, 0x56, 0x34, 0x12]).unwrap();
        assert_eq!(i.operation, Operation::Mov);
        assert_eq!(i.operand_size, OperandSize::Size32);
        assert_eq!(i.length, 7);
        assert_eq!(i.immediate, 0x1234_5678);

        let i = decode32(&[0x67, 0x67, 0x8B, 0x07]).unwrap();
        assert_eq!(i.address_size, AddressSize::Addr16);
    }

    #[test]
    fn test_group_operands_inherited() {
        let i = decode16(&[0x83, 0xC0, 0xFF]).unwrap();
        assert_eq!(i.operation, Operation::Add);
        assert_eq!(i.operands[0].mode, OperandMode::ModRmRm);
        assert_eq!(i.operands[0].size, OperandSize::Size16);
        assert_eq!(i.operands[1].size, OperandSize::Size8);
        assert_eq!(i.immediate, 0xFF);
        assert_eq!(i.length, 3);

        let i = decode16(&[0xF7, 0x06, 0x34, 0x12, 0xCD, 0xAB]).unwrap();
        assert_eq!(i.operation, Operation::Test);
        assert_eq!(i.displacement, 0x1234);
        assert_eq!(i.immediate, 0xABCD);
        assert_eq!(i.length, 6);

        let i = decode16(&[0xFF, 0x1E, 0x00, 0x10]).unwrap();
        assert_eq!(i.operation, Operation::CallFar);
        assert_eq!(i.length, 4);
    }

    #[test]
    fn test_segment_defaults() {
        // mov ax, [bp+si]
        let i = decode16(&[0x8B, 0x02]).unwrap();
        assert_eq!(i.segment, Segment::SS);
        // es: mov ax, [bp+si]
        let i = decode16(&[0x26, 0x8B, 0x02]).unwrap();
        assert_eq!(i.segment, Segment::ES);
        assert!(i.has_segment_override);
        // mov ax, [bx+10h]
        let i = decode16(&[0x8B, 0x47, 0x10]).unwrap();
        assert_eq!(i.segment, Segment::DS);
        assert_eq!(i.displacement, 0x10);
    }

    #[test]
    fn test_sib_decoding() {
        // mov eax, [ebp+8] through a SIB byte with no index
        let i = decode32(&[0x8B, 0x44, 0x25, 0x08]).unwrap();
        assert!(i.has_sib);
        assert_eq!(i.segment, Segment::SS);
        assert_eq!(i.length, 4);

        // mov eax, [disp32], SIB with no base
        let i = decode32(&[0x8B, 0x04, 0x25, 0x78, 0x56, 0x34, 0x12]).unwrap();
        assert_eq!(i.segment, Segment::DS);
        assert_eq!(i.displacement, 0x1234_5678);
        assert_eq!(i.length, 7);

        // mov eax, [esp+ecx*4-4]
        let i = decode32(&[0x8B, 0x44, 0x8C, 0xFC]).unwrap();
        assert_eq!(i.segment, Segment::SS);
        assert_eq!(i.displacement, 0xFFFF_FFFC);
        assert_eq!(i.to_string(), "mov eax, dword ptr ss:[esp+ecx*4-4h]");
    }

    #[test]
    fn test_relative_and_far() {
        let i = decode16(&[0x74, 0xFE]).unwrap();
        assert_eq!(i.condition, JumpCondition::Equal);
        assert_eq!(i.displacement, 0xFFFF_FFFE);

        let i = decode32(&[0x0F, 0x85, 0x00, 0x01, 0x00, 0x00]).unwrap();
        assert_eq!(i.operation, Operation::Jcc);
        assert_eq!(i.condition, JumpCondition::NotEqual);
        assert_eq!(i.length, 6);

        let i = decode16(&[0xEA, 0x00, 0x01, 0x00, 0xF0]).unwrap();
        assert_eq!(i.operation, Operation::JmpFar);
        assert_eq!(i.displacement, 0x0100);
        assert_eq!(i.immediate, 0xF000);
        assert_eq!(i.length, 5);
    }

    #[test]
    fn test_x87_decoding() {
        let i = decode16(&[0xD9, 0xE8]).unwrap();
        assert_eq!(i.operation, Operation::Fld1);
        assert_eq!(i.length, 2);

        let i = decode16(&[0xDC, 0x2E, 0x34, 0x12]).unwrap();
        assert_eq!(i.operation, Operation::Fsubr);
        assert_eq!(i.operands[1].size, OperandSize::Size64);
        assert_eq!(i.length, 4);

        let i = decode16(&[0xD8, 0xC3]).unwrap();
        assert_eq!(i.operation, Operation::Fadd);
        assert_eq!(i.operands[1], Operand::new(OperandSize::Size80, OperandMode::FpuRegister, 3));
    }

    #[test]
    fn test_decode_failures() {
        assert_eq!(
            decode16(&[0x0F, 0xFF]).unwrap_err(),
            DecodeError::InvalidOpcode { opcode: 0xFF, length: 2 }
        );
        assert_eq!(decode16(&[0xB8, 0x34]).unwrap_err(), DecodeError::FetchFailed { length: 2 });
        assert_eq!(
            decode16(&[0xFE, 0x38]).unwrap_err(),
            DecodeError::InvalidOpcode { opcode: 0xFE, length: 2 }
        );
        let mut long = vec![0x66; 15];
        long.push(0x90);
        assert_eq!(decode16(&long).unwrap_err(), DecodeError::TooLong);
    }

    #[test]
    fn test_decode_length_consistency() {
        #[rustfmt::skip]
        let stream: &[u8] = &[
            0x90,                               // nop
            0x01, 0xD8,                         // add ax, bx
            0x26, 0x8B, 0x87, 0x34, 0x12,       // mov ax, es:[bx+1234h]
            0x66, 0x05, 0x01, 0x00, 0x00, 0x00, // add eax, 1
            0xF3, 0xAA,                         // rep stosb
            0x0F, 0xB6, 0x06, 0x00, 0x20,       // movzx ax, byte ptr [2000h]
            0xC8, 0x10, 0x00, 0x01,             // enter 10h, 1
            0x67, 0x8B, 0x44, 0x24, 0x04,       // mov ax, [esp+4]
            0xDD, 0x06, 0x00, 0x30,             // fld qword ptr [3000h]
            0x9A, 0x00, 0x00, 0x00, 0xF0,       // call far f000:0000
            0xC2, 0x04, 0x00,                   // ret 4
        ];
        let expected = [1, 2, 5, 6, 2, 5, 4, 5, 4, 5, 3];

        let mut queue = SliceQueue::new(stream);
        let mut lengths = Vec::new();
        while queue.remaining() > 0 {
            let start = queue.tell();
            let i = decode(&mut queue, AddressSize::Addr16, OperandSize::Size16).unwrap();
            assert_eq!(i.length as usize, queue.tell() - start);
            lengths.push(i.length);
        }
        assert_eq!(lengths, expected);
    }
}
