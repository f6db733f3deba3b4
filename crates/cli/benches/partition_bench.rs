use config::StoreConfig;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use partition::{
    ChainedReader, FileKind, KeyHasher, PartitionFilePair, PartitionReader, PartitionWriter,
    ReadBuffer, Reader,
};
use std::path::Path;
use tempfile::{tempdir, TempDir};

const N_KEYS: usize = 10_000;
const VALUE_SIZE: usize = 100;
const N_DELTAS: u32 = 4;

fn store() -> StoreConfig {
    StoreConfig::default()
}

/// Writes `keys` (value = `fill` repeated) in hash order.
fn write_pair(dir: &Path, version: u32, kind: FileKind, keys: &[Vec<u8>], fill: u8) -> PartitionFilePair {
    let cfg = store();
    let hasher = KeyHasher::new(cfg.key_hash_size).unwrap();
    let mut sorted: Vec<&Vec<u8>> = keys.iter().collect();
    sorted.sort_by(|a, b| hasher.hash(a)[..].cmp(&hasher.hash(b)[..]).then_with(|| a.cmp(b)));

    let mut w = PartitionWriter::create(dir, version, kind, &cfg).unwrap();
    let value = vec![fill; VALUE_SIZE];
    for key in sorted {
        w.write(key, &value).unwrap();
    }
    w.close().unwrap()
}

fn keys(prefix: &str, n: usize) -> Vec<Vec<u8>> {
    (0..n).map(|i| format!("{}{}", prefix, i).into_bytes()).collect()
}

fn build_base() -> (TempDir, PartitionReader) {
    let dir = tempdir().unwrap();
    let pair = write_pair(dir.path(), 1, FileKind::Base, &keys("key", N_KEYS), b'x');
    let reader = PartitionReader::open(&pair).unwrap();
    (dir, reader)
}

/// A base plus `N_DELTAS` deltas, each rewriting a tenth of the keys.
fn build_chain() -> (TempDir, ChainedReader) {
    let dir = tempdir().unwrap();
    let all = keys("key", N_KEYS);
    let base = PartitionReader::open(&write_pair(dir.path(), 1, FileKind::Base, &all, b'x')).unwrap();
    let deltas = (0..N_DELTAS)
        .map(|d| {
            let slice: Vec<Vec<u8>> = all.iter().skip(d as usize).step_by(10).cloned().collect();
            let pair = write_pair(dir.path(), d + 2, FileKind::Delta, &slice, b'a' + d as u8);
            PartitionReader::open(&pair).unwrap()
        })
        .collect();
    (dir, ChainedReader::new(base, deltas).unwrap())
}

fn partition_write_benchmark(c: &mut Criterion) {
    c.bench_function("partition_write_base_10k", |b| {
        b.iter_batched(
            || (tempdir().unwrap(), keys("key", N_KEYS)),
            |(dir, keys)| {
                write_pair(dir.path(), 1, FileKind::Base, &keys, b'x');
            },
            BatchSize::SmallInput,
        );
    });
}

fn partition_get_hit_benchmark(c: &mut Criterion) {
    c.bench_function("partition_get_hit_10k", |b| {
        b.iter_batched(
            build_base,
            |(_dir, reader)| {
                let mut buf = ReadBuffer::new();
                for i in 0..N_KEYS {
                    let key = format!("key{}", i).into_bytes();
                    assert!(reader.get(&key, &mut buf).unwrap().is_some());
                }
            },
            BatchSize::LargeInput,
        );
    });
}

fn partition_get_miss_benchmark(c: &mut Criterion) {
    c.bench_function("partition_get_miss_10k", |b| {
        b.iter_batched(
            build_base,
            |(_dir, reader)| {
                let mut buf = ReadBuffer::new();
                for i in 0..N_KEYS {
                    let key = format!("missing{}", i).into_bytes();
                    assert!(reader.get(&key, &mut buf).unwrap().is_none());
                }
            },
            BatchSize::LargeInput,
        );
    });
}

fn chained_get_benchmark(c: &mut Criterion) {
    c.bench_function("chained_get_hit_10k_4_deltas", |b| {
        b.iter_batched(
            build_chain,
            |(_dir, chain)| {
                let mut buf = ReadBuffer::new();
                for i in 0..N_KEYS {
                    let key = format!("key{}", i).into_bytes();
                    assert!(chain.get(&key, &mut buf).unwrap().is_some());
                }
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    benches,
    partition_write_benchmark,
    partition_get_hit_benchmark,
    partition_get_miss_benchmark,
    chained_get_benchmark
);
criterion_main!(benches);
