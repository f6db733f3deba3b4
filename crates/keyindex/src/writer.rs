use std::fs::{rename, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::format::{encode_offset, IndexHeader};
use crate::{hex, IndexError};

/// Shape of the index being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOptions {
    /// Truncated key-hash size in bytes (fixed per domain).
    pub hash_size: u8,
    /// Bytes used to store each offset.
    pub offset_width: u8,
    /// Delta indexes may carry ABSENT markers; base indexes may not.
    pub is_delta: bool,
}

/// Streaming writer for an index file.
///
/// Slots are appended in ascending hash order straight into
/// `<path>.tmp`. [`finish`](IndexWriter::finish) fsyncs and renames it into
/// place; dropping an unfinished writer removes the temp file, so a crashed
/// build never leaves a half-written index under the final name.
pub struct IndexWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    file: Option<BufWriter<File>>,
    header: IndexHeader,
    /// Hash of the previous slot and whether it was ABSENT.
    last: Option<(Vec<u8>, bool)>,
    /// Reusable slot encoding buffer.
    slot_buf: Vec<u8>,
    slots_written: u64,
}

impl IndexWriter {
    /// Creates `<path>.tmp` and writes the header.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidOptions`] for an unsupported hash size or
    /// offset width, or an I/O error.
    pub fn create<P: AsRef<Path>>(path: P, options: IndexOptions) -> Result<Self, IndexError> {
        let header = IndexHeader {
            hash_size: options.hash_size,
            offset_width: options.offset_width,
            is_delta: options.is_delta,
        };
        if let Some(reason) = header.check() {
            return Err(IndexError::InvalidOptions(reason));
        }

        let path = path.as_ref().to_path_buf();
        let tmp_path = tmp_path_for(&path);
        let raw = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut file = BufWriter::new(raw);
        header.write_to(&mut file)?;

        Ok(Self {
            path,
            tmp_path,
            file: Some(file),
            header,
            last: None,
            slot_buf: vec![0u8; header.slot_width()],
            slots_written: 0,
        })
    }

    /// Appends a slot mapping `hash` to a record-log block offset.
    pub fn write(&mut self, hash: &[u8], offset: u64) -> Result<(), IndexError> {
        if offset >= self.header.absent() {
            return Err(IndexError::OffsetOverflow {
                offset,
                width: self.header.offset_width,
            });
        }
        self.push(hash, offset, false)
    }

    /// Appends an ABSENT slot for `hash` (delta indexes only).
    pub fn write_absent(&mut self, hash: &[u8]) -> Result<(), IndexError> {
        if !self.header.is_delta {
            return Err(IndexError::AbsentInBase);
        }
        let absent = self.header.absent();
        self.push(hash, absent, true)
    }

    fn push(&mut self, hash: &[u8], offset: u64, absent: bool) -> Result<(), IndexError> {
        let hash_size = usize::from(self.header.hash_size);
        if hash.len() != hash_size {
            return Err(IndexError::HashSize {
                expected: hash_size,
                actual: hash.len(),
            });
        }

        if let Some((prev, prev_absent)) = &self.last {
            match hash.cmp(prev.as_slice()) {
                std::cmp::Ordering::Less => {
                    return Err(IndexError::OutOfOrderWrite {
                        previous: hex(prev),
                        hash: hex(hash),
                    });
                }
                std::cmp::Ordering::Equal if absent || *prev_absent => {
                    return Err(IndexError::MixedAbsentRun { hash: hex(hash) });
                }
                _ => {}
            }
        }

        let file = self.file.as_mut().ok_or(IndexError::Closed)?;
        self.slot_buf[..hash_size].copy_from_slice(hash);
        encode_offset(offset, self.header.offset_width, &mut self.slot_buf[hash_size..]);
        file.write_all(&self.slot_buf)?;

        match &mut self.last {
            Some((prev, prev_absent)) => {
                prev.clear();
                prev.extend_from_slice(hash);
                *prev_absent = absent;
            }
            None => self.last = Some((hash.to_vec(), absent)),
        }
        self.slots_written += 1;
        Ok(())
    }

    /// Number of slots written so far.
    #[must_use]
    pub fn slots_written(&self) -> u64 {
        self.slots_written
    }

    /// Size of the index file so far, header included.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        crate::HEADER_BYTES + self.slots_written * self.header.slot_width() as u64
    }

    /// The final path this writer publishes to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes and fsyncs, then atomically renames the temp file to the
    /// final path. Returns the final path.
    pub fn finish(mut self) -> Result<PathBuf, IndexError> {
        self.sync()?;
        rename(&self.tmp_path, &self.path)?;
        sync_parent(&self.path);
        Ok(self.path.clone())
    }

    /// Flushes and fsyncs but leaves the data under `<path>.tmp`, for
    /// callers that publish several files together. Returns the temp path.
    pub fn finish_unpublished(mut self) -> Result<PathBuf, IndexError> {
        self.sync()?;
        Ok(self.tmp_path.clone())
    }

    fn sync(&mut self) -> Result<(), IndexError> {
        let mut file = self.file.take().ok_or(IndexError::Closed)?;
        file.flush()?;
        file.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok(())
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

/// `<path>.tmp`, next to the target so the final rename stays on one filesystem.
pub(crate) fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Fsyncs the parent directory so a completed rename survives a crash.
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
