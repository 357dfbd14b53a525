// Criterion microbenchmarks for block dispatch through the code cache.
//
// Compares the single-step interpreter against the cached interpreter on the
// same loop, and measures the cost of a cache hit, including source
// rehashing, across a scattered working set of blocks.

#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use aero_cpu_core::{BackendKind, CpuConfig, ExecDispatcher};
#[cfg(not(target_arch = "wasm32"))]
use aero_mem::{MemoryBus, MemoryBusConfig};
#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

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

/// Deterministic generator for block placement.
#[cfg(not(target_arch = "wasm32"))]
struct SplitMix64(u64);

#[cfg(not(target_arch = "wasm32"))]
impl SplitMix64 {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn dispatcher(backend: BackendKind) -> ExecDispatcher {
    let bus = MemoryBus::new(MemoryBusConfig {
        address_bits: 32,
        ram_size: 0x10_0000,
    })
    .unwrap();
    let config = CpuConfig {
        backend,
        ..CpuConfig::default()
    };
    ExecDispatcher::new(config, bus).unwrap()
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_backends(c: &mut Criterion) {
    // l: add ax, bx ; xor dx, ax ; inc bx ; shl cx, 1 ; jmp l
    const LOOP: &[u8] = &[0x01, 0xD8, 0x31, 0xC2, 0x43, 0xD1, 0xE1, 0xEB, 0xF5];
    const CYCLES: u64 = 4096;

    let mut group = c.benchmark_group("dispatch/backend");
    group.throughput(Throughput::Elements(CYCLES));
    for kind in [BackendKind::Interpreter, BackendKind::CachedInterpreter] {
        let mut dispatcher = dispatcher(kind);
        dispatcher.cpu_mut().bus.write_bytes(0x1000, LOOP);
        dispatcher.cpu_mut().set_real_mode_entry(0x0100, 0);
        group.bench_function(BenchmarkId::from_parameter(format!("{kind:?}")), |b| {
            b.iter(|| black_box(dispatcher.run(CYCLES)))
        });
    }
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_scattered_blocks(c: &mut Criterion) {
    const SIZES: &[usize] = &[8, 64, 512];

    let mut group = c.benchmark_group("dispatch/scattered");
    for &size in SIZES {
        // Each block is `inc ax ; jmp far next`, spread over the first
        // megabyte so lookups touch many pages.
        let mut rng = SplitMix64(size as u64);
        let mut slots: Vec<u32> = Vec::with_capacity(size);
        while slots.len() < size {
            let addr = (0x1_0000 + (rng.next_u64() % 0xE_0000) as u32) & !0xF;
            if !slots.contains(&addr) {
                slots.push(addr);
            }
        }

        let mut dispatcher = dispatcher(BackendKind::CachedInterpreter);
        for (i, &addr) in slots.iter().enumerate() {
            let next = slots[(i + 1) % size];
            let segment = (next >> 4) as u16;
            let mut code = vec![0x40, 0xEA, 0x00, 0x00];
            code.extend_from_slice(&segment.to_le_bytes());
            dispatcher.cpu_mut().bus.write_bytes(u64::from(addr), &code);
        }
        dispatcher.cpu_mut().set_real_mode_entry((slots[0] >> 4) as u16, 0);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                for _ in 0..size {
                    black_box(dispatcher.step());
                }
            })
        });
    }
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_backends, bench_scattered_blocks
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
