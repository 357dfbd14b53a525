// Criterion microbenchmarks for the single-step interpreter.
//
// Covers decode throughput on a mixed 16-bit stream, plain ALU loops through
// `step_instruction` and REP MOVSB. Set `AERO_BENCH_PROFILE=full` for longer
// local runs.

#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use aero_cpu_core::decode::decode_bytes;
#[cfg(not(target_arch = "wasm32"))]
use aero_cpu_core::state::gpr;
#[cfg(not(target_arch = "wasm32"))]
use aero_cpu_core::{Cpu, CpuModel};
#[cfg(not(target_arch = "wasm32"))]
use aero_mem::{MemoryBus, MemoryBusConfig};
#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("AERO_BENCH_PROFILE").as_deref() {
        Ok("full") => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
        _ => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20)
            .noise_threshold(0.05),
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn real_mode_cpu(code: &[u8]) -> Cpu {
    let mut bus = MemoryBus::new(MemoryBusConfig {
        address_bits: 32,
        ram_size: 0x10_0000,
    })
    .unwrap();
    bus.write_bytes(0x1000, code);
    let mut cpu = Cpu::new(CpuModel::Pentium, bus);
    cpu.set_real_mode_entry(0x0100, 0);
    cpu.state.set_reg32(gpr::ESP, 0x8000);
    cpu
}

#[cfg(not(target_arch = "wasm32"))]
fn make_decode_stream() -> Vec<u8> {
    const PATTERNS: &[&[u8]] = &[
        // mov ax, 0x1234
        &[0xB8, 0x34, 0x12],
        // mov ax, [bp+8]
        &[0x8B, 0x46, 0x08],
        // add eax, [esp+8]
        &[0x66, 0x67, 0x03, 0x44, 0x24, 0x08],
        // rep movsb
        &[0xF3, 0xA4],
        // jz rel16
        &[0x0F, 0x84, 0x10, 0x00],
        // shld bx, ax, 4
        &[0x0F, 0xA4, 0xC3, 0x04],
        // cs: lodsb
        &[0x2E, 0xAC],
        // imul ax, bx, 5
        &[0x6B, 0xC3, 0x05],
    ];

    let mut out = Vec::with_capacity(64 * 1024);
    while out.len() < 64 * 1024 {
        for pattern in PATTERNS {
            out.extend_from_slice(pattern);
        }
    }
    out
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_decode(c: &mut Criterion) {
    let code = make_decode_stream();
    let mut pos = 0usize;

    let mut group = c.benchmark_group("interp/decode");
    group.throughput(Throughput::Elements(4096));
    group.bench_function("mixed_16bit", |b| {
        b.iter(|| {
            let mut checksum = 0u64;
            for _ in 0..4096 {
                if pos + 16 >= code.len() {
                    pos = 0;
                }
                let inst = decode_bytes(black_box(&code[pos..]), false, CpuModel::Pentium).unwrap();
                checksum = checksum.wrapping_add(u64::from(inst.length) ^ pos as u64);
                pos += usize::from(inst.length);
            }
            black_box(checksum)
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_alu_loop(c: &mut Criterion) {
    // l: add ax, bx ; xor dx, ax ; inc bx ; jmp l
    let mut cpu = real_mode_cpu(&[0x01, 0xD8, 0x31, 0xC2, 0x43, 0xEB, 0xF9]);
    const STEPS: u64 = 4096;

    let mut group = c.benchmark_group("interp/step");
    group.throughput(Throughput::Elements(STEPS));
    group.bench_function("alu_loop", |b| {
        b.iter(|| {
            for _ in 0..STEPS {
                black_box(cpu.step_instruction());
            }
            black_box(cpu.state.ax())
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_rep_movsb(c: &mut Criterion) {
    const LEN: u16 = 4096;
    // rep movsb ; jmp 0
    let mut cpu = real_mode_cpu(&[0xF3, 0xA4, 0xEB, 0xFC]);

    let mut group = c.benchmark_group("interp/string");
    group.throughput(Throughput::Bytes(u64::from(LEN)));
    group.bench_function("rep_movsb_4k", |b| {
        b.iter(|| {
            cpu.state.set_reg16(gpr::ECX, LEN);
            cpu.state.set_reg16(gpr::ESI, 0x2000);
            cpu.state.set_reg16(gpr::EDI, 0x4000);
            cpu.state.eip = 0;
            black_box(cpu.step_instruction())
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_decode, bench_alu_loop, bench_rep_movsb
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
