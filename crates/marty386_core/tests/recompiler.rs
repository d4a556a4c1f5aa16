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

    tests::recompiler.rs

    Checks the block recompiler against the reference interpreter.

*/

use marty386_core::{
    cpu_386::{
        flat::{FLAT_PROTECTED_CODE_OFFSET, FLAT_REAL_CODE_OFFSET},
        CpuBackend,
        FlatCpu,
    },
    cpu_common::*,
};

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

fn run_to_halt(cpu: &mut FlatCpu, backend: &mut CpuBackend) -> u64 {
    let (steps, last) = backend.run(cpu, 1000).unwrap();
    assert_eq!(last, ExecutionResult::Halt);
    steps
}

fn assert_equivalent(code_cpu: &FlatCpu, data: (u32, usize)) -> (FlatCpu, CpuBackend) {
    let mut reference = code_cpu.clone();
    run_to_halt(
        &mut reference,
        &mut CpuBackend::with_backend(BackendType::Interpreter, RepMode::Batch),
    );

    let mut recompiled = code_cpu.clone();
    let mut backend = CpuBackend::with_backend(BackendType::Recompiler, RepMode::Batch);
    run_to_halt(&mut recompiled, &mut backend);

    for reg in GP_REGISTERS {
        assert_eq!(reference.regs.get32(reg), recompiled.regs.get32(reg), "{:?}", reg);
    }
    assert_eq!(reference.regs.eflags(), recompiled.regs.eflags());
    assert_eq!(reference.regs.eip, recompiled.regs.eip);
    assert_eq!(
        reference.read_bytes(data.0, data.1),
        recompiled.read_bytes(data.0, data.1)
    );
    (recompiled, backend)
}

#[test]
fn test_real_mode_program_matches_interpreter() {
    #[rustfmt::skip]
    let code = [
        0xB8, 0x10, 0x00,                   // mov ax, 10h
        0x89, 0xC3,                         // mov bx, ax
        0x8D, 0x70, 0x04,                   // lea si, [bx+si+4]
        0xB9, 0x03, 0x00,                   // mov cx, 3
        0x01, 0xF0,                         // add ax, si
        0x89, 0xC2,                         // mov dx, ax
        0x8D, 0xBF, 0x00, 0x10,             // lea di, [bx+1000h]
        0x89, 0x15,                         // mov [di], dx
        0xE2, 0xF4,                         // loop -12
        0x66, 0xB8, 0x78, 0x56, 0x34, 0x12, // mov eax, 12345678h
        0x66, 0x89, 0xC3,                   // mov ebx, eax
        0x66, 0x67, 0x8D, 0x4C, 0x58, 0x08, // lea ecx, [eax+ebx*2+8]
        0xF4,                               // hlt
    ];
    let cpu = FlatCpu::real_mode(&code);
    let (cpu, backend) = assert_equivalent(&cpu, (0x1000, 0x20));

    assert_eq!(cpu.regs.get16(Register16::DX), 0x4C);
    assert_eq!(cpu.read_physical_u16(0x1010), 0x4C);
    assert_eq!(cpu.regs.get32(Register32::ECX), 0x369D_0370);
    assert_eq!(cpu.regs.eip, FLAT_REAL_CODE_OFFSET + code.len() as u32);

    // Entry block, loop body twice, tail
    let stats = backend.recompiler().stats();
    assert_eq!(stats.blocks_compiled, 3);
    assert_eq!(stats.cache_hits, 1);
    assert!(stats.native_instructions > 0);
    assert!(stats.fallback_instructions > 0);
}

#[test]
fn test_protected_mode_program_matches_interpreter() {
    #[rustfmt::skip]
    let code = [
        0xBB, 0x00, 0x20, 0x00, 0x00, // mov ebx, 2000h
        0xB9, 0x03, 0x00, 0x00, 0x00, // mov ecx, 3
        0x8D, 0x44, 0x8B, 0x10,       // lea eax, [ebx+ecx*4+10h]
        0x89, 0x04, 0x8B,             // mov [ebx+ecx*4], eax
        0x41,                         // inc ecx
        0x83, 0xF9, 0x06,             // cmp ecx, 6
        0x75, 0xF3,                   // jne -13
        0xF4,                         // hlt
    ];
    let cpu = FlatCpu::protected_mode(&code);
    let (cpu, _) = assert_equivalent(&cpu, (0x2000, 0x20));

    assert_eq!(cpu.regs.get32(Register32::ECX), 6);
    assert_eq!(cpu.regs.get32(Register32::EAX), 0x2024);
    assert_eq!(cpu.read_physical_u32(0x200C), 0x201C);
    assert_eq!(cpu.read_physical_u32(0x2014), 0x2024);
    assert_eq!(cpu.regs.eip, FLAT_PROTECTED_CODE_OFFSET + code.len() as u32);
}

#[test]
fn test_rep_inside_block_yields() {
    #[rustfmt::skip]
    let code = [
        0xB9, 0x04, 0x00, // mov cx, 4
        0xBF, 0x00, 0x04, // mov di, 400h
        0xB0, 0x5A,       // mov al, 5Ah
        0xF3, 0xAA,       // rep stosb
        0xF4,             // hlt
    ];
    let mut cpu = FlatCpu::real_mode(&code);
    let mut backend = CpuBackend::with_backend(BackendType::Recompiler, RepMode::Single);

    let mut results = Vec::new();
    loop {
        let result = backend.step(&mut cpu).unwrap();
        let done = result == ExecutionResult::Halt;
        results.push(result);
        if done {
            break;
        }
    }
    assert_eq!(
        results,
        [
            ExecutionResult::OkayRep,
            ExecutionResult::OkayRep,
            ExecutionResult::OkayRep,
            ExecutionResult::Okay,
            ExecutionResult::Halt,
        ]
    );
    assert_eq!(cpu.read_bytes(0x400, 5), [0x5A, 0x5A, 0x5A, 0x5A, 0x00]);
    assert_eq!(cpu.regs.get16(Register16::CX), 0);
    assert_eq!(cpu.regs.get16(Register16::DI), 0x404);
}

#[test]
fn test_fault_in_block_is_delivered() {
    #[rustfmt::skip]
    let code = [
        0xB8, 0x00, 0x10, // mov ax, 1000h
        0xB3, 0x00,       // mov bl, 0
        0xF6, 0xF3,       // div bl
        0xF4,             // hlt
    ];
    let mut cpu = FlatCpu::real_mode(&code);
    cpu.set_interrupt_vector(0, 0, 0x300);
    cpu.load(0x300, &[0xF4]);
    let mut backend = CpuBackend::with_backend(BackendType::Recompiler, RepMode::Batch);

    assert_eq!(
        backend.step(&mut cpu).unwrap(),
        ExecutionResult::Aborted(CpuAbort::Exception(Interrupt::DivideError, 0))
    );
    // Native writes before the fault are committed
    assert_eq!(cpu.regs.get16(Register16::AX), 0x1000);
    assert_eq!(cpu.regs.get8(Register8::BL), 0);
    assert_eq!(cpu.regs.eip, 0x300);
    assert_eq!(cpu.read_physical_u16(0x7FFA), 0x105);

    assert_eq!(backend.step(&mut cpu).unwrap(), ExecutionResult::Halt);
}

#[test]
fn test_invalidated_block_is_recompiled() {
    // mov ax, 1; hlt
    let mut cpu = FlatCpu::real_mode(&[0xB8, 0x01, 0x00, 0xF4]);
    let mut backend = CpuBackend::with_backend(BackendType::Recompiler, RepMode::Batch);
    run_to_halt(&mut cpu, &mut backend);
    assert_eq!(cpu.regs.get16(Register16::AX), 1);

    // Patch the immediate and restart
    cpu.load(FLAT_REAL_CODE_OFFSET + 1, &[0x02]);
    backend.recompiler_mut().invalidate_range(FLAT_REAL_CODE_OFFSET + 1, 1);
    cpu.halted = false;
    cpu.set_entry(FLAT_REAL_CODE_OFFSET);
    run_to_halt(&mut cpu, &mut backend);
    assert_eq!(cpu.regs.get16(Register16::AX), 2);
    assert_eq!(backend.recompiler().stats().blocks_compiled, 2);
}
