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

    benches::cpu_bench.rs

    Decoder and execution tier benchmarks.

*/

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

use marty386_core::{
    bytequeue::SliceQueue,
    cpu_386::{decode, CpuBackend, FlatCpu},
    cpu_common::*,
};

const RANDOM_STREAM_SIZE: usize = 0x10000;

#[rustfmt::skip]
const LOOP_PROGRAM: [u8; 20] = [
    0x66, 0xB9, 0x00, 0x10, 0x00, 0x00, // mov ecx, 1000h
    0x31, 0xC0,                         // xor ax, ax
    0x8D, 0x40, 0x03,                   // lea ax, [bx+si+3]
    0x89, 0xC3,                         // mov bx, ax
    0x01, 0xD8,                         // add ax, bx
    0x67, 0xE2, 0xF6,                   // loop ecx, -10
    0xF4,                               // hlt
    0x90,
];

pub fn cpu_decode_bench(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0);
    let mut stream = vec![0u8; RANDOM_STREAM_SIZE];
    rng.fill(&mut stream[..]);

    c.bench_function("cpu_decode_random", |b| {
        b.iter(|| {
            let offset = rng.gen_range(0..RANDOM_STREAM_SIZE - MAX_INSTRUCTION_SIZE);
            let mut queue = SliceQueue::new(&stream[offset..]);
            _ = black_box(decode(&mut queue, AddressSize::Addr16, OperandSize::Size16));
        });
    });
}

pub fn cpu_tier_bench(c: &mut Criterion) {
    for backend in [BackendType::Interpreter, BackendType::FastInterpreter, BackendType::Recompiler] {
        c.bench_function(&format!("cpu_loop_{}", backend), |b| {
            b.iter_batched(
                || (FlatCpu::real_mode(&LOOP_PROGRAM), CpuBackend::with_backend(backend, RepMode::Batch)),
                |(mut cpu, mut backend)| {
                    _ = black_box(backend.run(&mut cpu, 100_000));
                },
                BatchSize::SmallInput,
            );
        });
    }
}

criterion_group!(cpu_benches, cpu_decode_bench, cpu_tier_bench);
criterion_main!(cpu_benches);
