use config::StoreConfig;
use keyindex::{hex, IndexOptions, IndexWriter};
use recordlog::{LogOptions, LogWriter};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::domain::{KeyHash, KeyHasher};
use crate::layout::{sync_dir, FileExt, FileKind, PartitionFilePair};
use crate::PartitionError;

/// Streaming builder for one partition file pair.
///
/// Keys must arrive in ascending order of their truncated hash (sorting is
/// the build pipeline's job); keys sharing a hash may come in any order.
/// Each key's record goes to the log and its block offset to the index.
///
/// Both files are written under temp names. [`close`](PartitionWriter::close)
/// renames the log into place first and the index last, so a reader that
/// finds an index always finds a complete log. Dropping a writer without
/// closing it leaves nothing behind.
///
/// Any error is fatal: drop the writer and rebuild.
pub struct PartitionWriter {
    pair: PartitionFilePair,
    hasher: KeyHasher,
    index: IndexWriter,
    log: LogWriter,
    /// Hash of the previous entry and whether it was ABSENT.
    last: Option<(KeyHash, bool)>,
}

impl std::fmt::Debug for PartitionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionWriter")
            .field("pair", &self.pair)
            .field("records", &self.log.num_records_written())
            .finish()
    }
}

impl PartitionWriter {
    /// Starts building `<version>.<kind>` inside `dir`.
    pub fn create<P: AsRef<Path>>(
        dir: P,
        version: u32,
        kind: FileKind,
        store: &StoreConfig,
    ) -> Result<Self, PartitionError> {
        store
            .validate()
            .map_err(|e| PartitionError::InvalidDomain(e.to_string()))?;
        let hasher = KeyHasher::new(store.key_hash_size)?;
        fs::create_dir_all(dir.as_ref())?;

        let pair = PartitionFilePair::new(dir, version, kind);
        let log = LogWriter::create(
            pair.log_path(),
            LogOptions {
                block_size: store.block_size,
                codec: store.codec,
                level: store.level,
            },
        )?;
        let index = IndexWriter::create(
            pair.index_path(),
            IndexOptions {
                hash_size: store.key_hash_size as u8,
                offset_width: store.offset_width,
                is_delta: kind == FileKind::Delta,
            },
        )?;

        Ok(Self {
            pair,
            hasher,
            index,
            log,
            last: None,
        })
    }

    #[must_use]
    pub fn pair(&self) -> &PartitionFilePair {
        &self.pair
    }

    /// Checks ordering before anything is written, so a rejected key leaves
    /// both files untouched.
    fn admit(&self, key: &[u8], absent: bool) -> Result<KeyHash, PartitionError> {
        let hash = self.hasher.hash(key);
        if let Some((prev, prev_absent)) = &self.last {
            if *hash < **prev {
                return Err(PartitionError::OutOfOrderWrite {
                    previous: hex(prev),
                    hash: hex(&hash),
                });
            }
            if *hash == **prev && (absent || *prev_absent) {
                return Err(keyindex::IndexError::MixedAbsentRun { hash: hex(&hash) }.into());
            }
        }
        Ok(hash)
    }

    fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(), PartitionError> {
        let hash = self.admit(key, false)?;
        let offset = self.log.append(key, value)?;
        self.index.write(&hash, offset)?;
        self.last = Some((hash, false));
        Ok(())
    }

    /// Adds `key → value`.
    pub fn write(&mut self, key: &[u8], value: &[u8]) -> Result<(), PartitionError> {
        self.append(key, Some(value))
    }

    /// Records a tombstone for `key`. Deltas only.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), PartitionError> {
        if self.pair.kind() != FileKind::Delta {
            return Err(PartitionError::DeltaOnly("delete"));
        }
        self.append(key, None)
    }

    /// Marks every key sharing `key`'s hash as gone. Deltas only.
    ///
    /// Unlike a tombstone this writes no log record; the index slot alone
    /// overrides older versions for the whole hash.
    pub fn mark_absent(&mut self, key: &[u8]) -> Result<(), PartitionError> {
        if self.pair.kind() != FileKind::Delta {
            return Err(PartitionError::DeltaOnly("mark_absent"));
        }
        let hash = self.admit(key, true)?;
        self.index.write_absent(&hash)?;
        self.last = Some((hash, true));
        Ok(())
    }

    /// Bytes written to both files so far.
    #[must_use]
    pub fn num_bytes_written(&self) -> u64 {
        self.log.num_bytes_written() + self.index.bytes_written()
    }

    /// Log records written so far (values and tombstones).
    #[must_use]
    pub fn num_records_written(&self) -> u64 {
        self.log.num_records_written()
    }

    /// Seals both files and publishes the pair.
    pub fn close(self) -> Result<PartitionFilePair, PartitionError> {
        let Self {
            pair, index, log, ..
        } = self;

        let log_summary = log.finish_unpublished()?;
        let index_tmp = match index.finish_unpublished() {
            Ok(path) => path,
            Err(e) => {
                let _ = fs::remove_file(&log_summary.path);
                return Err(e.into());
            }
        };

        publish(&pair, &log_summary.path, &index_tmp)?;
        info!(
            pair = %pair,
            dir = %pair.dir().display(),
            records = log_summary.num_records,
            blocks = log_summary.num_blocks,
            bytes = log_summary.bytes_written,
            "published partition pair"
        );
        Ok(pair)
    }
}

fn publish(pair: &PartitionFilePair, log_tmp: &Path, index_tmp: &Path) -> Result<(), PartitionError> {
    let result = fs::rename(log_tmp, pair.path(FileExt::Log))
        .and_then(|()| fs::rename(index_tmp, pair.path(FileExt::Index)));
    if let Err(e) = result {
        let _ = fs::remove_file(log_tmp);
        let _ = fs::remove_file(index_tmp);
        let _ = pair.remove();
        return Err(e.into());
    }
    sync_dir(pair.dir());
    Ok(())
}
