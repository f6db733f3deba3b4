//! Folding: merges a base with its ordered deltas into a single new base.
//!
//! Every pair is written in ascending hash order, so each log can be
//! streamed alongside the others and merged one hash group at a time. For
//! each group the sources are replayed oldest to newest: an ABSENT marker
//! clears everything older for the hash, then each record overwrites its key.
//! Survivors are written sorted by key within the group; tombstones are
//! dropped because a base has nothing older to shadow.

use config::StoreConfig;
use keyindex::hex;
use recordlog::{Record, RecordIter};
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::path::Path;
use tracing::info;

use crate::domain::{KeyHash, KeyHasher};
use crate::layout::{FileKind, PartitionFilePair};
use crate::reader::{ChainedReader, PartitionReader};
use crate::writer::PartitionWriter;
use crate::PartitionError;

/// Result of a fold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldSummary {
    /// The new base pair, numbered with the chain's newest version.
    pub pair: PartitionFilePair,
    /// Records read from every input log.
    pub records_in: u64,
    /// Live records written to the new base.
    pub records_out: u64,
    /// Versions folded into the new base, oldest first.
    pub folded: Vec<u32>,
}

/// One input of the merge: a log stream plus its ABSENT hashes.
struct Source<'a> {
    reader: &'a PartitionReader,
    records: RecordIter<'a>,
    /// Next record and its hash.
    head: Option<(KeyHash, Record)>,
    /// Hash of the last record read, for the ordering check.
    last: Option<KeyHash>,
    absent: Peekable<Box<dyn Iterator<Item = &'a [u8]> + 'a>>,
    records_read: u64,
}

impl<'a> Source<'a> {
    fn new(reader: &'a PartitionReader) -> Result<Self, PartitionError> {
        let absent: Box<dyn Iterator<Item = &'a [u8]> + 'a> =
            Box::new(reader.index().absent_hashes());
        let mut source = Self {
            reader,
            records: reader.log().records(),
            head: None,
            last: None,
            absent: absent.peekable(),
            records_read: 0,
        };
        source.advance(&reader.hasher())?;
        Ok(source)
    }

    fn advance(&mut self, hasher: &KeyHasher) -> Result<(), PartitionError> {
        self.head = None;
        if let Some(rec) = self.records.next() {
            let rec = rec?;
            self.records_read += 1;
            let hash = hasher.hash(&rec.key);
            if let Some(prev) = &self.last {
                if *hash < **prev {
                    return Err(PartitionError::Mismatch {
                        path: self.reader.pair().log_path(),
                        reason: format!(
                            "records out of hash order: {} after {}",
                            hex(&hash),
                            hex(prev)
                        ),
                    });
                }
            }
            self.last = Some(hash);
            self.head = Some((hash, rec));
        }
        Ok(())
    }

    /// Smallest hash this source has left to contribute.
    fn min_hash(&mut self) -> Option<Vec<u8>> {
        let record = self.head.as_ref().map(|(h, _)| &h[..]);
        let absent = self.absent.peek().copied();
        match (record, absent) {
            (Some(r), Some(a)) => Some(r.min(a).to_vec()),
            (Some(r), None) => Some(r.to_vec()),
            (None, Some(a)) => Some(a.to_vec()),
            (None, None) => None,
        }
    }
}

/// Folds `base` and `deltas` (ascending versions) into a new base pair in
/// `dir`, numbered with the newest input version.
///
/// The output depends only on the logical contents of the inputs, not on
/// how they were blocked or how many deltas carried the changes.
pub fn fold<P: AsRef<Path>>(
    base: &PartitionReader,
    deltas: &[PartitionReader],
    dir: P,
    store: &StoreConfig,
) -> Result<FoldSummary, PartitionError> {
    let inputs: Vec<&PartitionReader> = std::iter::once(base).chain(deltas).collect();
    let hasher = base.hasher();
    let mut previous = None;
    for r in &inputs {
        if r.hasher() != hasher {
            return Err(PartitionError::Mismatch {
                path: r.pair().index_path(),
                reason: "hash size differs from the base".to_string(),
            });
        }
        let v = r.pair().version();
        if let Some(p) = previous {
            if v <= p {
                return Err(PartitionError::OutOfOrderDelta { previous: p, next: v });
            }
        }
        previous = Some(v);
    }
    let version = previous.unwrap_or_else(|| base.pair().version());

    let mut out_store = store.clone();
    out_store.key_hash_size = hasher.hash_size();
    let mut writer = PartitionWriter::create(dir, version, FileKind::Base, &out_store)?;

    let mut sources = inputs
        .iter()
        .map(|&r| Source::new(r))
        .collect::<Result<Vec<_>, _>>()?;

    let mut records_out = 0u64;
    loop {
        let Some(hash) = sources.iter_mut().filter_map(|s| s.min_hash()).min() else {
            break;
        };

        let mut group: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        for source in sources.iter_mut() {
            if source.absent.peek().is_some_and(|a| *a == hash.as_slice()) {
                source.absent.next();
                group.clear();
            }
            while source
                .head
                .as_ref()
                .is_some_and(|(h, _)| h[..] == hash[..])
            {
                if let Some((_, rec)) = source.head.take() {
                    group.insert(rec.key, rec.value);
                }
                source.advance(&hasher)?;
            }
        }

        for (key, value) in group {
            if let Some(value) = value {
                writer.write(&key, &value)?;
                records_out += 1;
            }
        }
    }

    let records_in: u64 = sources.iter().map(|s| s.records_read).sum();
    let folded: Vec<u32> = inputs.iter().map(|r| r.pair().version()).collect();
    let pair = writer.close()?;
    info!(
        version,
        base = base.pair().version(),
        deltas = deltas.len(),
        records_in,
        records_out,
        "folded chain into new base"
    );
    Ok(FoldSummary {
        pair,
        records_in,
        records_out,
        folded,
    })
}

impl ChainedReader {
    /// Folds this chain into a new base in `dir`. See [`fold`].
    pub fn fold_into<P: AsRef<Path>>(
        &self,
        dir: P,
        store: &StoreConfig,
    ) -> Result<FoldSummary, PartitionError> {
        fold(self.base(), self.deltas(), dir, store)
    }
}
