use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use reactive_pipeline::{Engine, EngineConfig, Execution, ReactiveStreams};

fn benchmark_single_stage_throughput(c: &mut Criterion) {
    let engine = Engine::default();
    let pipeline = ReactiveStreams::of(0..10_000u64).map(|n| n + 1).count();

    let mut group = c.benchmark_group("single_stage");
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("map_10000_elements", |b| {
        b.iter(|| {
            let result = pipeline.run(&engine);
            black_box(*result.wait().expect("Run failed"));
        });
    });
    group.finish();
}

fn benchmark_multi_stage_throughput(c: &mut Criterion) {
    let engine = Engine::default();
    let pipeline = ReactiveStreams::of(0..10_000u64)
        .map(|n| n * 3)
        .filter(|n| n % 2 == 0)
        .skip(10)
        .peek(|n| {
            black_box(n);
        })
        .fold(0u64, |acc, n| acc.wrapping_add(n));

    let mut group = c.benchmark_group("multi_stage");
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("four_stages_10000_elements", |b| {
        b.iter(|| {
            let result = pipeline.run(&engine);
            black_box(*result.wait().expect("Run failed"));
        });
    });
    group.finish();
}

fn benchmark_flat_map_throughput(c: &mut Criterion) {
    let engine = Engine::default();
    let nested = ReactiveStreams::of(0..100u32)
        .flat_map(|n| ReactiveStreams::of(vec![n; 100]))
        .count();
    let iterated = ReactiveStreams::of(0..100u32)
        .flat_map_iter(|n| vec![n; 100])
        .count();

    let mut group = c.benchmark_group("flat_map");
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("nested_publishers", |b| {
        b.iter(|| black_box(*nested.run(&engine).wait().expect("Run failed")));
    });
    group.bench_function("nested_iterators", |b| {
        b.iter(|| black_box(*iterated.run(&engine).wait().expect("Run failed")));
    });
    group.finish();
}

fn benchmark_spawned_run(c: &mut Criterion) {
    let engine = Engine::new(EngineConfig::default().with_execution(Execution::Spawned))
        .expect("Invalid config");
    let pipeline = ReactiveStreams::of(0..10_000u64).map(|n| n ^ 0x5a).count();

    let mut group = c.benchmark_group("spawned");
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("map_10000_elements", |b| {
        b.iter(|| black_box(*pipeline.run(&engine).wait().expect("Run failed")));
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_single_stage_throughput,
    benchmark_multi_stage_throughput,
    benchmark_flat_map_throughput,
    benchmark_spawned_run
);
criterion_main!(benches);
