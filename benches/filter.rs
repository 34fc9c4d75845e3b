// benches/filter.rs — pooled vs unpooled filtering cost.
//
//   cargo bench --bench filter
//
// Requires a Vulkan GPU. Criterion measures wall time including CPU
// overhead (upload, bind group creation, submit, poll) — the right metric
// here, since callers block on the result before the next frame.
//
// The pooled/unpooled gap is the whole point of the crate: identical
// pipelines, the only difference is whether device buffers are leased from
// the pool or allocated per call.

use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use median_pool::{median_filter_cpu, MedianFilter};

fn lcg_pixels(n: usize, mut seed: u32) -> Vec<u8> {
    (0..n)
        .map(|_| {
            seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
            (seed >> 24) as u8
        })
        .collect()
}

fn bench_filter(c: &mut Criterion) {
    let (w, h) = (640u32, 480u32);
    let src = lcg_pixels((w * h) as usize, 1);
    let mut dst = vec![0u8; src.len()];

    let filter = MedianFilter::new().expect("benches need a Vulkan GPU");
    let pool = filter.create_pool(w, h).expect("pool creation");

    let mut group = c.benchmark_group("median_640x480");
    // First iterations pay lazy pipeline/driver costs; warm up explicitly.
    group.warm_up_time(Duration::from_secs(2));
    group.sample_size(30);

    for k in [3u32, 9] {
        group.bench_with_input(BenchmarkId::new("pooled", k), &k, |b, &k| {
            b.iter(|| {
                filter
                    .filter_with_pool(&pool, &src, w, h, k, &mut dst)
                    .expect("pooled filter");
            })
        });
        group.bench_with_input(BenchmarkId::new("unpooled", k), &k, |b, &k| {
            b.iter(|| {
                filter.filter(&src, w, h, k, &mut dst).expect("unpooled filter");
            })
        });
        group.bench_with_input(BenchmarkId::new("cpu_reference", k), &k, |b, &k| {
            b.iter(|| {
                median_filter_cpu(&src, w, h, k, &mut dst).expect("cpu filter");
            })
        });
    }
    group.finish();

    pool.cleanup().expect("cleanup");
}

criterion_group!(benches, bench_filter);
criterion_main!(benches);
