//! Benchmarks for history downsampling

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use growbox::sample::from_unix;
use growbox::{downsample_min_max, HistoryConfig, HistoryEngine, Sample};

fn generate_samples(count: usize) -> Vec<Sample> {
    (0..count)
        .map(|i| {
            let t = from_unix(i as i64 * 60).unwrap_or_default();
            let temp = 22.0 + 3.0 * (i as f64 / 240.0).sin();
            let hum = 55.0 + 10.0 * (i as f64 / 500.0).cos();
            Sample::climate(format!("CH{}-0x76", i % 2), t, Some(temp), Some(hum))
        })
        .collect()
}

fn bench_min_max(c: &mut Criterion) {
    let mut group = c.benchmark_group("min_max");

    for n in [1_440usize, 57_600] {
        let values: Vec<f64> = (0..n).map(|i| (i as f64 / 100.0).sin()).collect();
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &values, |b, values| {
            b.iter(|| black_box(downsample_min_max(values, 500, |v| *v)))
        });
    }

    group.finish();
}

fn bench_history_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("history");

    // 40 days of one-minute readings from two sensors
    let samples = generate_samples(2 * 40 * 1_440);
    let engine = HistoryEngine::new(HistoryConfig::default());

    group.throughput(Throughput::Elements(samples.len() as u64));
    group.bench_function("build_40_days", |b| {
        b.iter(|| black_box(engine.build(&samples)))
    });

    group.finish();
}

criterion_group!(benches, bench_min_max, bench_history_build);
criterion_main!(benches);
