//! Performance benchmarks for the focusstack pipeline
//!
//! Run with: cargo bench
//!
//! These benchmarks cover the compute-heavy parts of a stack: feature based
//! alignment, energy and weight maps, and the pyramid blend.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use focusstack::backend::pyramid::{collapse, gaussian_pyramid, laplacian_pyramid};
use focusstack::focus_stack::merge::{energy_map, normalize_energies, weight_maps};
use focusstack::focus_stack::{
    AlignConfig, AlignmentEngine, BalanceConfig, BalanceEngine, DepthMapConfig, DepthMapStack,
    WeightMode,
};
use focusstack::io::MemoryStore;
use focusstack::progress::NoProgress;
use focusstack::testing::synthetic_data::{contrast_patch_stack, shifted_frame, textured_frame};
use std::time::Duration;

const SIZES: [u32; 3] = [128, 256, 512];

fn bench_alignment(c: &mut Criterion) {
    let mut group = c.benchmark_group("Alignment");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(20);

    let engine = AlignmentEngine::new(AlignConfig::default()).unwrap();
    for size in SIZES {
        let reference = textured_frame(size, size, 1);
        let candidate = shifted_frame(&reference, 3, -2);
        group.throughput(Throughput::Elements((size * size) as u64));
        group.bench_with_input(BenchmarkId::new("rigid", size), &size, |b, _| {
            b.iter(|| black_box(engine.align(&reference, &candidate, 1).unwrap()))
        });
    }
    group.finish();
}

fn bench_balance(c: &mut Criterion) {
    let mut group = c.benchmark_group("Balance");
    for size in SIZES {
        let reference = textured_frame(size, size, 2);
        let candidate = textured_frame(size, size, 3);
        let mut engine = BalanceEngine::new(BalanceConfig::default()).unwrap();
        engine.establish_reference(&reference).unwrap();
        group.throughput(Throughput::Elements((size * size) as u64));
        group.bench_with_input(BenchmarkId::new("linear", size), &size, |b, _| {
            b.iter(|| black_box(engine.balance(&candidate).unwrap()))
        });
    }
    group.finish();
}

fn bench_weight_maps(c: &mut Criterion) {
    let mut group = c.benchmark_group("Weight Maps");
    let config = DepthMapConfig::default();
    for size in SIZES {
        let frames = contrast_patch_stack(size, size / 3, &[0.2, 1.0, 0.4, 0.1], 7);
        let mut energies: Vec<_> = frames
            .iter()
            .map(|f| energy_map(&f.luma_plane::<f32>(), &config))
            .collect();
        normalize_energies(&mut energies);
        for mode in [WeightMode::Max, WeightMode::Average] {
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", mode), size),
                &size,
                |b, _| b.iter(|| black_box(weight_maps(&energies, mode, config.temperature))),
            );
        }
    }
    group.finish();
}

fn bench_pyramid(c: &mut Criterion) {
    let mut group = c.benchmark_group("Pyramid");
    for size in SIZES {
        let plane = textured_frame(size, size, 4).luma_plane::<f32>();
        group.bench_with_input(BenchmarkId::new("round_trip", size), &size, |b, _| {
            b.iter(|| {
                let bands = laplacian_pyramid(&gaussian_pyramid(&plane, 5));
                black_box(collapse(&bands))
            })
        });
    }
    group.finish();
}

fn bench_composite(c: &mut Criterion) {
    let mut group = c.benchmark_group("Depth Map Composite");
    group.sample_size(10);
    let stack = DepthMapStack::new("stack", "stacked", DepthMapConfig::default()).unwrap();
    for size in [128u32, 256] {
        let mut store = MemoryStore::new();
        for (i, frame) in contrast_patch_stack(size, size / 3, &[0.2, 1.0, 0.4], 9)
            .into_iter()
            .enumerate()
        {
            store.insert(format!("{}.png", i), frame);
        }
        let names = store.names();
        group.bench_with_input(BenchmarkId::new("three_frames", size), &size, |b, _| {
            b.iter(|| black_box(stack.composite(&names, &store, &mut NoProgress).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_alignment,
    bench_balance,
    bench_weight_maps,
    bench_pyramid,
    bench_composite
);
criterion_main!(benches);
