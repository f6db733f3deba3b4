
use crate::{FileKind, KeyHasher, PartitionFilePair, PartitionReader, PartitionWriter};
use config::StoreConfig;
use std::collections::BTreeMap;
use std::path::Path;

/// One build-time mutation.
#[derive(Debug, Clone)]
pub(crate) enum Op {
    Put(Vec<u8>),
    Del,
    Absent,
}

pub(crate) fn store() -> StoreConfig {
    StoreConfig {
        block_size: 256,
        ..StoreConfig::default()
    }
}

pub(crate) fn put(key: &str, value: &str) -> (Vec<u8>, Op) {
    (key.as_bytes().to_vec(), Op::Put(value.as_bytes().to_vec()))
}

pub(crate) fn del(key: &str) -> (Vec<u8>, Op) {
    (key.as_bytes().to_vec(), Op::Del)
}

pub(crate) fn absent(key: &str) -> (Vec<u8>, Op) {
    (key.as_bytes().to_vec(), Op::Absent)
}

/// Sorts `ops` into write order (hash, then key) and builds the pair.
pub(crate) fn build(
    dir: &Path,
    version: u32,
    kind: FileKind,
    store: &StoreConfig,
    ops: &[(Vec<u8>, Op)],
) -> anyhow::Result<PartitionFilePair> {
    let hasher = KeyHasher::new(store.key_hash_size)?;
    let mut sorted: Vec<&(Vec<u8>, Op)> = ops.iter().collect();
    sorted.sort_by(|a, b| {
        hasher.hash(&a.0)[..]
            .cmp(&hasher.hash(&b.0)[..])
            .then_with(|| a.0.cmp(&b.0))
    });

    let mut w = PartitionWriter::create(dir, version, kind, store)?;
    for (key, op) in sorted {
        match op {
            Op::Put(v) => w.write(key, v)?,
            Op::Del => w.delete(key)?,
            Op::Absent => w.mark_absent(key)?,
        }
    }
    Ok(w.close()?)
}

pub(crate) fn open(pair: &PartitionFilePair) -> anyhow::Result<PartitionReader> {
    Ok(PartitionReader::open(pair)?)
}

/// Applies versions in order to a plain map, the reference every chain and
/// fold is checked against.
pub(crate) fn model(
    hasher: KeyHasher,
    versions: &[&[(Vec<u8>, Op)]],
) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let mut map = BTreeMap::new();
    for ops in versions {
        for (key, op) in ops.iter() {
            match op {
                Op::Put(v) => {
                    map.insert(key.clone(), v.clone());
                }
                Op::Del => {
                    map.remove(key);
                }
                Op::Absent => {
                    let h = hasher.hash(key);
                    map.retain(|k: &Vec<u8>, _| hasher.hash(k) != h);
                }
            }
        }
    }
    map
}

/// Live contents of a base pair, read straight from its log.
pub(crate) fn contents(reader: &PartitionReader) -> anyhow::Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let mut map = BTreeMap::new();
    for rec in reader.log().records() {
        let rec = rec?;
        if let Some(v) = rec.value {
            map.insert(rec.key, v);
        }
    }
    Ok(map)
}

pub(crate) fn numbered(prefix: &str, n: usize) -> Vec<(Vec<u8>, Op)> {
    (0..n)
        .map(|i| {
            (
                format!("{}-{:04}", prefix, i).into_bytes(),
                Op::Put(format!("value-{}-{}", prefix, i).into_bytes()),
            )
        })
        .collect()
}
