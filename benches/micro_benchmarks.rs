//! # Micro Benchmarks
//!
//! Fine-grained benchmarks for the small operations on the publish path.
//!
//! Run with: `cargo bench --bench micro_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use floodgate::admission::{DegradationLevel, FixedProbe};
use floodgate::ledger::RateLimitKey;
use floodgate::{
    cpu_relax, current_time_ms, BackpressureConfig, ControllerBuilder, Priority, Route,
};
use serde_json::json;
use std::sync::Arc;
use std::thread;

/// Benchmark time functions
fn bench_time_functions(c: &mut Criterion) {
    let mut group = c.benchmark_group("time_functions");

    group.bench_function("current_time_ms", |b| {
        b.iter(|| black_box(current_time_ms()));
    });

    group.bench_function("std_instant_now", |b| {
        b.iter(|| black_box(std::time::Instant::now()));
    });

    group.finish();
}

/// Benchmark CPU relaxation primitives
fn bench_cpu_primitives(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_primitives");

    group.bench_function("cpu_relax", |b| {
        b.iter(cpu_relax);
    });

    group.bench_function("spin_loop_hint", |b| {
        b.iter(std::hint::spin_loop);
    });

    group.bench_function("yield_now", |b| {
        b.iter(thread::yield_now);
    });

    group.finish();
}

/// Benchmark the sampling curve lookup at every level
fn bench_drop_probability(c: &mut Criterion) {
    let mut group = c.benchmark_group("drop_probability");
    let config = BackpressureConfig::default();

    for level in [
        DegradationLevel::None,
        DegradationLevel::Low,
        DegradationLevel::Medium,
        DegradationLevel::High,
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(level), &level, |b, &level| {
            b.iter(|| {
                black_box(config.drop_probability(black_box(level), black_box(Priority::Low)))
            });
        });
    }

    group.finish();
}

/// Benchmark subject routing
fn bench_route_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_parse");

    let subjects = [
        ("plain", "orders"),
        ("platform_credential", "instagram:acct-7"),
        ("full", "instagram:acct-7:media"),
    ];
    for (name, subject) in subjects {
        group.bench_function(name, |b| {
            b.iter(|| black_box(Route::parse(black_box(subject))));
        });
    }

    group.bench_function("key_from_route", |b| {
        let route = Route::parse("instagram:acct-7:media");
        b.iter(|| black_box(RateLimitKey::from_route(&route)));
    });

    group.finish();
}

/// Benchmark metrics snapshots with different queue depths
fn bench_metrics_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics_snapshot");

    for depth in [0usize, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            let controller = ControllerBuilder::new()
                .config(BackpressureConfig::production())
                .probe(Arc::new(FixedProbe::new(64.0, 5.0)))
                .build()
                .unwrap();
            for i in 0..depth {
                controller.publish(&format!("s{}", i % 10), json!(i), Priority::Medium);
            }
            b.iter(|| black_box(controller.metrics()));
        });
    }

    group.bench_function("summary", |b| {
        let controller = ControllerBuilder::new()
            .probe(Arc::new(FixedProbe::new(64.0, 5.0)))
            .build()
            .unwrap();
        let metrics = controller.metrics();
        b.iter(|| black_box(metrics.summary()));
    });

    group.finish();
}

criterion_group!(
    micro_benches,
    bench_time_functions,
    bench_cpu_primitives,
    bench_drop_probability,
    bench_route_parse,
    bench_metrics_snapshot
);

criterion_main!(micro_benches);
