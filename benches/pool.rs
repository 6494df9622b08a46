use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sockio::base::uri::{normalize_bind_to, parse_uri, DestinationKey};
use sockio::reactor::Reactor;
use sockio::socket::{BasicSocketPool, PoolOptions};

/// Pool bookkeeping and key normalization.
/// These are pure in-memory operations that don't require network I/O.
fn benchmark_pool_operations(c: &mut Criterion) {
    let reactor = Reactor::new();

    c.bench_function("pool_new", |b| {
        b.iter(|| black_box(BasicSocketPool::new(reactor.clone(), PoolOptions::default())))
    });

    let pool = BasicSocketPool::new(reactor.clone(), PoolOptions::default());
    c.bench_function("pool_stats", |b| {
        b.iter(|| {
            let _ = black_box(pool.socket_count());
            let _ = black_box(pool.idle_count());
            let _ = black_box(pool.pending_count("tcp://example.com:443"));
        })
    });
}

fn benchmark_uri_parsing(c: &mut Criterion) {
    c.bench_function("destination_key_tcp", |b| {
        b.iter(|| black_box(DestinationKey::parse(black_box("TCP://Example.COM:443"))))
    });

    c.bench_function("destination_key_unix", |b| {
        b.iter(|| black_box(DestinationKey::parse(black_box("unix:///run/app.sock"))))
    });

    c.bench_function("parse_uri", |b| {
        b.iter(|| black_box(parse_uri(black_box("udp://[::1]:5353"))))
    });

    c.bench_function("normalize_bind_to", |b| {
        b.iter(|| black_box(normalize_bind_to(black_box(Some("10.0.0.1")))))
    });
}

criterion_group!(benches, benchmark_pool_operations, benchmark_uri_parsing);
criterion_main!(benches);
