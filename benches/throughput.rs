//! Throughput benchmarks

use comframe_core::{Dispatcher, FramerArena, LineFramer, PortKey, SessionRegistry, VirtualDriver};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

/// 1 KiB of NMEA-like lines
fn sample_stream() -> Vec<u8> {
    let line = b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n";
    line.iter().copied().cycle().take(1024).collect()
}

fn framing_benchmark(c: &mut Criterion) {
    let data = sample_stream();
    let port = PortKey::normalize("COM1");

    let mut group = c.benchmark_group("framing");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("framer_feed", |b| {
        let mut framer = LineFramer::new();
        b.iter(|| {
            let count = framer.feed(&port, black_box(&data)).count();
            black_box(count)
        })
    });

    group.bench_function("framer_push", |b| {
        let mut framer = LineFramer::new();
        b.iter(|| {
            let count = black_box(&data)
                .iter()
                .filter_map(|&byte| framer.push(byte))
                .count();
            black_box(count)
        })
    });

    group.bench_function("arena_feed_4_ports", |b| {
        let arena = FramerArena::new();
        let ports: Vec<PortKey> = (1..=4).map(|n| PortKey::normalize(&format!("COM{n}"))).collect();
        b.iter(|| {
            for (chunk, port) in data.chunks(64).zip(ports.iter().cycle()) {
                black_box(arena.feed(port, chunk));
            }
        })
    });

    group.finish();
}

fn dispatch_benchmark(c: &mut Criterion) {
    let data = sample_stream();
    let dispatcher = Dispatcher::new(
        Arc::new(VirtualDriver::new()),
        Arc::new(SessionRegistry::new()),
    );

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("handle_chunk", |b| {
        b.iter(|| black_box(dispatcher.handle_chunk("\\\\.\\COM1", black_box(&data))))
    });

    group.finish();
}

criterion_group!(benches, framing_benchmark, dispatch_benchmark);
criterion_main!(benches);
