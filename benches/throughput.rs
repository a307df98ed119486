//! Throughput benchmarks for padflow dataflow.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use padflow::buffer::Buffer;
use padflow::caps::Caps;
use padflow::core::{Core, CoreConfig};
use padflow::pad::{Pad, PadDirection, PadProbeReturn, PadProbeType};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A linked, active src/sink pair whose sink counts received bytes.
fn linked_pair() -> (Pad, Arc<AtomicU64>) {
    let bytes = Arc::new(AtomicU64::new(0));
    let b = Arc::clone(&bytes);
    let src = Pad::new("src", PadDirection::Src);
    let sink = Pad::builder("sink", PadDirection::Sink)
        .chain_function(move |_, _, buffer| {
            b.fetch_add(buffer.len() as u64, Ordering::Relaxed);
            Ok(())
        })
        .build();
    src.link(&sink).unwrap();
    src.set_active(true).unwrap();
    sink.set_active(true).unwrap();
    (src, bytes)
}

fn bench_buffer_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_creation");

    for size in [64, 4096, 64 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| black_box(Buffer::with_size(size)));
        });
    }

    group.finish();
}

fn bench_pad_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("pad_push");

    for size in [64, 1024, 64 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (src, _bytes) = linked_pair();
            let buffer = Buffer::with_size(size);
            b.iter(|| black_box(src.push(buffer.clone())));
        });
    }

    group.finish();
}

fn bench_pad_push_with_probes(c: &mut Criterion) {
    let mut group = c.benchmark_group("pad_push_probes");
    group.throughput(Throughput::Elements(1));

    for probes in [0, 1, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(probes), &probes, |b, &probes| {
            let (src, _bytes) = linked_pair();
            for _ in 0..probes {
                src.add_probe(PadProbeType::BUFFER, |_, _| PadProbeReturn::Ok);
            }
            let buffer = Buffer::with_size(64);
            b.iter(|| black_box(src.push(buffer.clone())));
        });
    }

    group.finish();
}

fn bench_caps_intersect(c: &mut Criterion) {
    let a: Caps = "video/x-raw, width=320, height=240; audio/x-raw, rate=48000"
        .parse()
        .unwrap();
    let b: Caps = "video/x-raw; audio/x-raw".parse().unwrap();
    c.bench_function("caps_intersect", |bench| {
        bench.iter(|| black_box(a.intersect(&b)));
    });
}

fn bench_launch_to_eos(c: &mut Criterion) {
    let mut group = c.benchmark_group("launch_to_eos");
    group.sample_size(20);
    let core = Core::init(CoreConfig::default());

    for (count, size) in [(1000, 64), (1000, 1024), (100, 64 * 1024)] {
        group.throughput(Throughput::Bytes((count * size) as u64));
        let description =
            format!("testsrc num-buffers={count} blocksize={size} ! identity silent=true ! nullsink");
        group.bench_with_input(
            BenchmarkId::new("count_size", format!("{count}x{size}")),
            &description,
            |b, description| {
                b.iter(|| {
                    let pipeline = core.parse_launch(description).unwrap();
                    pipeline.run(None).unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_buffer_creation,
    bench_pad_push,
    bench_pad_push_with_probes,
    bench_caps_intersect,
    bench_launch_to_eos,
);

criterion_main!(benches);
