//! Benchmarks for the per-line harvesting path
//!
//! Every output line of a measured child goes through the full harvester
//! bundle, so this is the hot loop of a chatty benchmark.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use procmeter::harvest::{Harvesters, LineHarvester};
use procmeter::subprocess::MetricAccumulator;
use std::hint::black_box;
use std::time::Duration;

fn sample_output(size: usize) -> Vec<String> {
    (0..size)
        .map(|i| match i % 50 {
            0 => format!("ITERS: {i}"),
            1 => "  Alloc rate    1,234,567 bytes per MUT second".to_string(),
            2 => "  Productivity  87.5% of total user, 86.0% of total elapsed".to_string(),
            _ => format!("iteration {i}: checksum {:x}", i * 7919),
        })
        .collect()
}

/// Single harvesters against matching and non-matching lines
fn bench_single_harvester(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_harvester");

    let cases = [
        ("selftimed_hit", LineHarvester::selftimed(), "SELFTIMED 1.25"),
        ("selftimed_miss", LineHarvester::selftimed(), "iteration 12: ok"),
        (
            "productivity_rts",
            LineHarvester::productivity(),
            "  Productivity  87.5% of total user, 86.0% of total elapsed",
        ),
        (
            "mem_footprint",
            LineHarvester::mem_footprint(),
            "     1,234,567 bytes maximum residency (3 sample(s))",
        ),
    ];

    for (name, harvester, line) in cases {
        group.bench_function(name, |b| {
            b.iter(|| black_box(harvester.harvest(black_box(line))));
        });
    }

    group.finish();
}

/// The full default bundle plus a custom tag over realistic output
fn bench_accumulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulate");
    let harvesters = Harvesters::default().with_custom(LineHarvester::custom_int("ITERS"));

    for size in &[100, 1_000, 10_000] {
        let lines = sample_output(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("stdout", size), &lines, |b, lines| {
            b.iter(|| {
                let mut acc = MetricAccumulator::default();
                for line in lines {
                    let _ = acc.observe_stdout(black_box(line), &harvesters);
                }
                black_box(acc.finish(Duration::from_secs(1)))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_single_harvester, bench_accumulate);
criterion_main!(benches);
