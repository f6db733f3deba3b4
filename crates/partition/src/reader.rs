use keyindex::{IndexLookup, IndexReader, DEFAULT_MAX_PROBES};
use recordlog::{LogLookup, LogReader, ReadBuffer};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::domain::{KeyHash, KeyHasher};
use crate::layout::{FileKind, PartitionFilePair};
use crate::PartitionError;

/// Point lookups against one served version.
pub trait Reader: Send + Sync {
    /// Returns the value stored for `key`, or `None` when the key does not
    /// exist at this version. `buf` is scratch space owned by the calling
    /// thread.
    fn get(&self, key: &[u8], buf: &mut ReadBuffer) -> Result<Option<Vec<u8>>, PartitionError>;

    /// The domain version this reader serves.
    fn version_number(&self) -> u32;

    /// Releases file handles. Idempotent; later lookups fail with
    /// [`PartitionError::Closed`].
    fn close(&self);
}

/// What a single file says about a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyState {
    Value(Vec<u8>),
    /// The key was deleted by this version.
    Tombstone,
    /// Every key with this hash was removed by this version.
    Absent,
    /// This file says nothing about the key.
    NotPresent,
    /// The key's hash run is longer than the probe bound, so this file
    /// cannot tell whether it holds the key.
    Unknown,
}

/// Reader over one published file pair.
pub struct PartitionReader {
    pair: PartitionFilePair,
    hasher: KeyHasher,
    index: IndexReader,
    log: LogReader,
    closed: AtomicBool,
}

impl std::fmt::Debug for PartitionReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionReader")
            .field("pair", &self.pair)
            .field("slots", &self.index.len())
            .field("records", &self.log.num_records())
            .finish()
    }
}

impl PartitionReader {
    /// Opens a published pair with the default probe bound.
    pub fn open(pair: &PartitionFilePair) -> Result<Self, PartitionError> {
        Self::open_with(pair, DEFAULT_MAX_PROBES)
    }

    /// Opens a published pair.
    ///
    /// # Errors
    ///
    /// [`PartitionError::Incomplete`] when either file is missing, a corrupt
    /// error from the index or log, or [`PartitionError::Mismatch`] when the
    /// index header disagrees with the pair's kind.
    pub fn open_with(pair: &PartitionFilePair, max_probes: usize) -> Result<Self, PartitionError> {
        pair.check_complete()?;
        let index = IndexReader::open(pair.index_path())?.with_max_probes(max_probes);
        let log = LogReader::open(pair.log_path())?;

        if index.is_delta() != (pair.kind() == FileKind::Delta) {
            return Err(PartitionError::Mismatch {
                path: pair.index_path(),
                reason: format!(
                    "index header says delta={}, file name says {}",
                    index.is_delta(),
                    pair.kind()
                ),
            });
        }
        let hasher = KeyHasher::new(index.hash_size())?;

        Ok(Self {
            pair: pair.clone(),
            hasher,
            index,
            log,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn pair(&self) -> &PartitionFilePair {
        &self.pair
    }

    #[must_use]
    pub fn kind(&self) -> FileKind {
        self.pair.kind()
    }

    #[must_use]
    pub fn hasher(&self) -> KeyHasher {
        self.hasher
    }

    #[must_use]
    pub fn index(&self) -> &IndexReader {
        &self.index
    }

    #[must_use]
    pub fn log(&self) -> &LogReader {
        &self.log
    }

    /// Full structural check of both files: slot order and run rules,
    /// offsets inside the log, every block checksum and record frame.
    pub fn verify(&self) -> Result<(), PartitionError> {
        self.index.verify(Some(self.log.data_end()))?;
        self.log.verify()?;
        Ok(())
    }

    /// Resolves `key` (whose hash is `hash`) against this pair alone.
    ///
    /// Every candidate block is scanned; if more than one holds the key the
    /// later one wins, matching write order.
    pub fn lookup(
        &self,
        key: &[u8],
        hash: &KeyHash,
        buf: &mut ReadBuffer,
    ) -> Result<KeyState, PartitionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PartitionError::Closed);
        }
        let offsets = match self.index.lookup(hash)? {
            IndexLookup::NotPresent => return Ok(KeyState::NotPresent),
            IndexLookup::Absent => return Ok(KeyState::Absent),
            IndexLookup::Overflow => return Ok(KeyState::Unknown),
            IndexLookup::Offsets(offsets) => offsets,
        };

        let mut state = KeyState::NotPresent;
        for offset in offsets {
            match self.log.read_at(offset, key, buf)? {
                LogLookup::Value(v) => state = KeyState::Value(v.to_vec()),
                LogLookup::Tombstone => state = KeyState::Tombstone,
                LogLookup::NotFound => {}
            }
        }
        Ok(state)
    }

    /// Lookups that hit the probe bound.
    #[must_use]
    pub fn collision_overflows(&self) -> u64 {
        self.index.collision_overflows()
    }
}

impl Reader for PartitionReader {
    fn get(&self, key: &[u8], buf: &mut ReadBuffer) -> Result<Option<Vec<u8>>, PartitionError> {
        let hash = self.hasher.hash(key);
        match self.lookup(key, &hash, buf)? {
            KeyState::Value(v) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    fn version_number(&self) -> u32 {
        self.pair.version()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.log.close();
        }
    }
}

/// A base plus the deltas layered on top of it, served as one version.
///
/// Lookups consult the deltas newest first and stop at the first one that
/// knows the key; only a miss in every delta reaches the base. A delta whose
/// hash run overflows the probe bound also stops the search, reporting the
/// key as not found rather than serving an older value it may shadow.
pub struct ChainedReader {
    base: PartitionReader,
    /// Ascending version order.
    deltas: Vec<PartitionReader>,
    hasher: KeyHasher,
    closed: AtomicBool,
}

impl std::fmt::Debug for ChainedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedReader")
            .field("base", &self.base.pair().version())
            .field(
                "deltas",
                &self.deltas.iter().map(|d| d.pair().version()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ChainedReader {
    /// Builds a chain, checking that `base` is a base, every delta is a
    /// delta, versions strictly ascend and all files share one hash size.
    pub fn new(
        base: PartitionReader,
        deltas: Vec<PartitionReader>,
    ) -> Result<Self, PartitionError> {
        if base.kind() != FileKind::Base {
            return Err(PartitionError::Mismatch {
                path: base.pair().index_path(),
                reason: "chain must start from a base".to_string(),
            });
        }
        let hasher = base.hasher();

        let mut previous = base.pair().version();
        for delta in &deltas {
            if delta.kind() != FileKind::Delta {
                return Err(PartitionError::Mismatch {
                    path: delta.pair().index_path(),
                    reason: "only deltas may follow the base".to_string(),
                });
            }
            let next = delta.pair().version();
            if next <= previous {
                return Err(PartitionError::OutOfOrderDelta { previous, next });
            }
            if delta.hasher() != hasher {
                return Err(PartitionError::Mismatch {
                    path: delta.pair().index_path(),
                    reason: format!(
                        "hash size {} differs from base's {}",
                        delta.hasher().hash_size(),
                        hasher.hash_size()
                    ),
                });
            }
            previous = next;
        }

        debug!(
            base = base.pair().version(),
            deltas = deltas.len(),
            version = previous,
            "built chained reader"
        );
        Ok(Self {
            base,
            deltas,
            hasher,
            closed: AtomicBool::new(false),
        })
    }

    /// A chain with no deltas.
    pub fn from_base(base: PartitionReader) -> Result<Self, PartitionError> {
        Self::new(base, Vec::new())
    }

    #[must_use]
    pub fn base(&self) -> &PartitionReader {
        &self.base
    }

    /// Deltas in ascending version order.
    #[must_use]
    pub fn deltas(&self) -> &[PartitionReader] {
        &self.deltas
    }

    /// Every pair in the chain, base first.
    #[must_use]
    pub fn pairs(&self) -> Vec<PartitionFilePair> {
        std::iter::once(&self.base)
            .chain(&self.deltas)
            .map(|r| r.pair().clone())
            .collect()
    }

    /// Sum of [`PartitionReader::collision_overflows`] over the chain.
    #[must_use]
    pub fn collision_overflows(&self) -> u64 {
        std::iter::once(&self.base)
            .chain(&self.deltas)
            .map(PartitionReader::collision_overflows)
            .sum()
    }
}

impl Reader for ChainedReader {
    fn get(&self, key: &[u8], buf: &mut ReadBuffer) -> Result<Option<Vec<u8>>, PartitionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PartitionError::Closed);
        }
        let hash = self.hasher.hash(key);
        for delta in self.deltas.iter().rev() {
            match delta.lookup(key, &hash, buf)? {
                KeyState::Value(v) => return Ok(Some(v)),
                KeyState::Tombstone | KeyState::Absent => return Ok(None),
                KeyState::Unknown => {
                    debug!(
                        version = delta.pair().version(),
                        "probe bound hit in delta, key not served"
                    );
                    return Ok(None);
                }
                KeyState::NotPresent => {}
            }
        }
        match self.base.lookup(key, &hash, buf)? {
            KeyState::Value(v) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    fn version_number(&self) -> u32 {
        self.deltas
            .last()
            .unwrap_or(&self.base)
            .pair()
            .version()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.base.close();
            for delta in &self.deltas {
                delta.close();
            }
        }
    }
}
