use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mmap_cache::{sanitize, MapHint, Registry};
use std::fs;
use std::path::PathBuf;

// Simple helper to build a unique temp path per bench
fn tmp_path(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("mmap_cache_bench_{}_{}", name, std::process::id()));
    p
}

fn bench_open_cached(c: &mut Criterion) {
    let path = tmp_path("open_cached");
    fs::write(&path, vec![1u8; 64 * 1024]).expect("write");
    let reg = Registry::new();
    let _anchor = reg.open(&path, false).expect("open");

    c.bench_function("open_cached", |b| {
        b.iter(|| black_box(reg.open(&path, false).expect("open")));
    });

    drop(_anchor);
    let _ = fs::remove_file(&path);
}

fn bench_map_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_window");
    let path = tmp_path("map_window");
    fs::write(&path, vec![7u8; 4 * 1024 * 1024]).expect("write");
    let reg = Registry::new();
    let file = reg.open(&path, false).expect("open");

    for &len in &[4_u64 * 1024, 64 * 1024, 1024 * 1024] {
        group.throughput(Throughput::Bytes(len));
        // Shared: an outstanding guard keeps the mapping alive, so this
        // measures the lookup path.
        group.bench_with_input(BenchmarkId::new("shared", len), &len, |b, &len| {
            let _held = file.map_window(MapHint::Random, 4096, len).expect("map");
            b.iter(|| black_box(file.map_window(MapHint::Random, 4096, len).expect("map")));
        });
        // Fresh: every iteration maps and unmaps.
        group.bench_with_input(BenchmarkId::new("fresh", len), &len, |b, &len| {
            b.iter(|| {
                let m = file.map_window(MapHint::Sequential, 8192, len).expect("map");
                black_box(m[0])
            });
        });
    }
    group.finish();

    drop(file);
    let _ = fs::remove_file(&path);
}

fn bench_lines(c: &mut Criterion) {
    let path = tmp_path("lines");
    let mut content = Vec::new();
    for i in 0..100_000 {
        content.extend_from_slice(format!("line number {i}\n").as_bytes());
    }
    fs::write(&path, &content).expect("write");
    let reg = Registry::new();
    let file = reg.open(&path, false).expect("open");

    let mut group = c.benchmark_group("lines");
    group.throughput(Throughput::Bytes(content.len() as u64));
    group.bench_function("count", |b| {
        b.iter(|| black_box(file.lines().expect("lines").count()));
    });
    group.finish();

    drop(file);
    let _ = fs::remove_file(&path);
}

fn bench_sanitize(c: &mut Criterion) {
    c.bench_function("sanitize", |b| {
        b.iter(|| black_box(sanitize("/usr//local/../share/./doc///mmap-cache/").expect("sanitize")));
    });
}

criterion_group!(benches, bench_open_cached, bench_map_window, bench_lines, bench_sanitize);
criterion_main!(benches);
