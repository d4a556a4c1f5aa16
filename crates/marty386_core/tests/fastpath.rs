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

    tests::fastpath.rs

    Checks the fast-path tier against the reference interpreter.

*/

use marty386_core::{
    cpu_386::{flat::FLAT_REAL_CODE_OFFSET, CpuBackend, FlatCpu},
    cpu_common::*,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const GP_REGISTERS: [Register32; 8] = [
    Register32::EAX,
    Register32::ECX,
    Register32::EDX,
    Register32::EBX,
    Register32::ESP,
    Register32::EBP,
    Register32::ESI,
    Register32::EDI,
];

fn run_both(cpu: &FlatCpu, steps: usize) -> (FlatCpu, FlatCpu) {
    let mut reference = cpu.clone();
    let mut fast = cpu.clone();
    let mut interpreter = CpuBackend::with_backend(BackendType::Interpreter, RepMode::Batch);
    let mut fast_backend = CpuBackend::with_backend(BackendType::FastInterpreter, RepMode::Batch);
    for _ in 0..steps {
        let expected = interpreter.step(&mut reference).unwrap();
        let result = fast_backend.step(&mut fast).unwrap();
        assert_eq!(result, expected);
    }
    (reference, fast)
}

fn assert_same_state(reference: &FlatCpu, fast: &FlatCpu, context: &str) {
    for reg in GP_REGISTERS {
        assert_eq!(reference.regs.get32(reg), fast.regs.get32(reg), "{:?} after {}", reg, context);
    }
    assert_eq!(reference.regs.eflags(), fast.regs.eflags(), "flags after {}", context);
    assert_eq!(reference.regs.eip, fast.regs.eip, "eip after {}", context);
}

#[test]
fn test_add_ax_bx_matches_interpreter() {
    // add ax, bx
    let mut cpu = FlatCpu::real_mode(&[0x01, 0xD8]);
    cpu.regs.set16(Register16::AX, 0x1234);
    cpu.regs.set16(Register16::BX, 0x0001);
    let (reference, fast) = run_both(&cpu, 1);

    assert_eq!(fast.regs.get16(Register16::AX), 0x1235);
    assert_eq!(fast.regs.eip, FLAT_REAL_CODE_OFFSET + 2);
    assert!(!fast.regs.get_flag(Flag::Carry));
    assert!(!fast.regs.get_flag(Flag::Zero));
    assert!(!fast.regs.get_flag(Flag::Overflow));
    assert_same_state(&reference, &fast, "add ax, bx");
}

#[test]
fn test_arithmetic_matches_interpreter() {
    // add, adc, sub, sbb, cmp in their r/m,reg forms, at 8 and 16 bits
    const OPCODES: [u8; 10] = [0x00, 0x01, 0x10, 0x11, 0x28, 0x29, 0x18, 0x19, 0x38, 0x39];
    let mut rng = StdRng::seed_from_u64(0x8086);

    for _ in 0..2_000 {
        let opcode = OPCODES[rng.gen_range(0..OPCODES.len())];
        // Register direct, avoiding SP as a destination
        let modrm = 0xC0 | (rng.gen_range(0..8u8) << 3) | rng.gen_range(0..4u8);
        let prefix = rng.gen_bool(0.3);
        let code: Vec<u8> = match prefix {
            true => vec![0x66, opcode, modrm],
            false => vec![opcode, modrm],
        };

        let mut cpu = FlatCpu::real_mode(&code);
        for reg in GP_REGISTERS {
            if reg != Register32::ESP {
                cpu.regs.set32(reg, rng.gen());
            }
        }
        cpu.regs.set_flag_state(Flag::Carry, rng.gen_bool(0.5));

        let (reference, fast) = run_both(&cpu, 1);
        assert_same_state(&reference, &fast, &format!("{:02X?}", code));
    }
}

#[test]
fn test_short_program_matches_interpreter() {
    #[rustfmt::skip]
    let code = [
        0xB9, 0x05, 0x00,       // mov cx, 5
        0x31, 0xC0,             // xor ax, ax
        0x05, 0x03, 0x00,       // add ax, 3
        0x50,                   // push ax
        0xE2, 0xFA,             // loop -6
        0x5B,                   // pop bx
        0x0F, 0xB6, 0xD3,       // movzx dx, bl
        0xF6, 0xE3,             // mul bl
        0xF4,                   // hlt
    ];
    let cpu = FlatCpu::real_mode(&code);
    // 2 + 3 * 5 + 4
    let (reference, fast) = run_both(&cpu, 21);
    assert!(fast.halted);
    assert_eq!(fast.regs.get16(Register16::AX), 225);
    assert_eq!(fast.regs.get16(Register16::DX), 15);
    assert_eq!(fast.read_physical_u16(0x7FFE), 3);
    assert_same_state(&reference, &fast, "program");
}

#[test]
fn test_fault_matches_interpreter() {
    // mov cl, 0; div cl
    let mut cpu = FlatCpu::real_mode(&[0xB1, 0x00, 0xF6, 0xF1]);
    cpu.set_interrupt_vector(0, 0, 0x300);
    cpu.regs.set16(Register16::AX, 0x1234);
    let (reference, fast) = run_both(&cpu, 2);
    assert_eq!(fast.regs.eip, 0x300);
    assert_eq!(fast.read_physical_u16(0x7FFA), 0x102);
    assert_eq!(fast.exceptions, reference.exceptions);
    assert_same_state(&reference, &fast, "div cl");
}

#[test]
fn test_undefined_group_forms_raise_invalid_opcode() {
    // shl /6 in every count form, then test /1 at both widths
    let forms: [&[u8]; 8] = [
        &[0xC0, 0xF0, 0x01],
        &[0xC1, 0xF0, 0x01],
        &[0xD0, 0xF0],
        &[0xD1, 0xF0],
        &[0xD2, 0xF0],
        &[0xD3, 0xF0],
        &[0xF6, 0xC8, 0x01],
        &[0xF7, 0xC8, 0x01, 0x00],
    ];
    for code in forms {
        let mut cpu = FlatCpu::real_mode(code);
        cpu.set_interrupt_vector(6, 0, 0x300);
        cpu.regs.set16(Register16::AX, 0x8001);
        let (reference, fast) = run_both(&cpu, 1);
        assert_eq!(fast.exceptions, [(Interrupt::InvalidOpcode, 0)], "{:02X?}", code);
        assert_eq!(fast.regs.get16(Register16::AX), 0x8001, "{:02X?}", code);
        assert_eq!(fast.regs.eip, 0x300, "{:02X?}", code);
        assert_eq!(fast.read_physical_u16(0x7FFA), FLAT_REAL_CODE_OFFSET as u16);
        assert_same_state(&reference, &fast, &format!("{:02X?}", code));
    }
}

fn randomize(cpu: &mut FlatCpu, rng: &mut StdRng) {
    for reg in GP_REGISTERS {
        match reg {
            Register32::ESP => {}
            // Keep REP counts short
            Register32::ECX => cpu.regs.set32(reg, rng.gen_range(0..64)),
            _ => cpu.regs.set32(reg, rng.gen()),
        }
    }
    for flag in [
        Flag::Carry,
        Flag::Parity,
        Flag::AuxCarry,
        Flag::Zero,
        Flag::Sign,
        Flag::Direction,
        Flag::Overflow,
    ] {
        cpu.regs.set_flag_state(flag, rng.gen_bool(0.5));
    }
}

fn step_compare(cpu: &FlatCpu, context: &str) {
    let mut reference = cpu.clone();
    let mut fast = cpu.clone();
    let mut interpreter = CpuBackend::with_backend(BackendType::Interpreter, RepMode::Batch);
    let mut fast_backend = CpuBackend::with_backend(BackendType::FastInterpreter, RepMode::Batch);
    let expected = format!("{:?}", interpreter.step(&mut reference));
    let result = format!("{:?}", fast_backend.step(&mut fast));

    assert_eq!(result, expected, "result of {}", context);
    assert_same_state(&reference, &fast, context);
    for segment in Segment::ALL {
        let index = segment as usize;
        assert_eq!(
            reference.regs.segment_selectors[index], fast.regs.segment_selectors[index],
            "{:?} after {}",
            segment, context
        );
    }
    assert_eq!(reference.exceptions, fast.exceptions, "exceptions after {}", context);
    assert_eq!(reference.port_writes, fast.port_writes, "port writes after {}", context);
    assert_eq!(reference.halted, fast.halted, "halt state after {}", context);
    assert!(reference.memory() == fast.memory(), "memory after {}", context);
}

#[test]
fn test_random_streams_match_interpreter() {
    let mut rng = StdRng::seed_from_u64(0x0386_0486);

    for case in 0..3_000 {
        let mut code = [0u8; 16];
        rng.fill(&mut code[..]);
        let protected = case % 2 == 1;
        let mut cpu = match protected {
            true => FlatCpu::protected_mode(&code),
            false => FlatCpu::real_mode(&code),
        };
        randomize(&mut cpu, &mut rng);
        step_compare(&cpu, &format!("{:02X?} (protected: {})", code, protected));
    }
}
