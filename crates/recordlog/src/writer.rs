use codec::BlockCodec;
use crc32fast::Hasher as Crc32;
use std::fs::{rename, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::format::{
    encode_record, record_len, write_header, BlockHeader, Footer, BLOCK_HEADER_BYTES,
    HEADER_BYTES, MAX_KEY_BYTES, MAX_VALUE_BYTES,
};
use crate::LogError;

/// Tuning knobs for a log writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    /// Target uncompressed block size. Larger blocks compress better but
    /// cost more to decompress per lookup.
    pub block_size: usize,
    pub codec: BlockCodec,
    /// Compression level for the deflate-family codecs.
    pub level: u32,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            codec: BlockCodec::Deflate,
            level: codec::DEFAULT_LEVEL,
        }
    }
}

/// Totals reported once a log is finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSummary {
    /// Where the file ended up (final path, or the temp path when unpublished).
    pub path: PathBuf,
    pub num_records: u64,
    pub num_blocks: u64,
    /// Total file size, header and footer included.
    pub bytes_written: u64,
}

/// Streaming writer for a record log.
///
/// Records are buffered into the current block. The block is compressed and
/// written once the next record would push it past `block_size` (or once a
/// single oversized record fills it), and on [`finish`](LogWriter::finish).
/// Because blocks are laid down back to back, the offset a record's block
/// will start at is known the moment the record is buffered, so
/// [`append`](LogWriter::append) returns it immediately.
///
/// Data goes to `<path>.tmp` and is renamed into place on `finish`; dropping
/// an unfinished writer removes the temp file.
pub struct LogWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    file: Option<BufWriter<File>>,
    options: LogOptions,
    /// Uncompressed records of the current block.
    block: Vec<u8>,
    /// Reusable compression output buffer.
    compressed: Vec<u8>,
    /// Bytes already written to the file; also where the current block starts.
    position: u64,
    num_records: u64,
    num_blocks: u64,
}

impl LogWriter {
    /// Creates `<path>.tmp` and writes the header.
    pub fn create<P: AsRef<Path>>(path: P, options: LogOptions) -> Result<Self, LogError> {
        if options.block_size == 0 || options.block_size > MAX_VALUE_BYTES {
            return Err(LogError::InvalidOptions(format!(
                "block_size {} not in 1..={}",
                options.block_size, MAX_VALUE_BYTES
            )));
        }
        let path = path.as_ref().to_path_buf();
        let tmp_path = tmp_path_for(&path);
        let raw = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut file = BufWriter::new(raw);
        write_header(&mut file, options.codec.id())?;

        Ok(Self {
            path,
            tmp_path,
            file: Some(file),
            options,
            block: Vec::with_capacity(options.block_size.min(MAX_VALUE_BYTES)),
            compressed: Vec::new(),
            position: HEADER_BYTES,
            num_records: 0,
            num_blocks: 0,
        })
    }

    /// Buffers a record and returns the offset of the block that holds it.
    ///
    /// `value == None` records a tombstone. The same offset is returned for
    /// every record of a block.
    pub fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<u64, LogError> {
        if key.len() > MAX_KEY_BYTES {
            return Err(LogError::RecordTooLarge {
                what: "key",
                len: key.len(),
                max: MAX_KEY_BYTES,
            });
        }
        if let Some(v) = value {
            if v.len() > MAX_VALUE_BYTES {
                return Err(LogError::RecordTooLarge {
                    what: "value",
                    len: v.len(),
                    max: MAX_VALUE_BYTES,
                });
            }
        }

        let len = record_len(key, value);
        if !self.block.is_empty() && self.block.len() + len > self.options.block_size {
            self.flush_block()?;
        }

        let offset = self.position;
        encode_record(&mut self.block, key, value);
        self.num_records += 1;

        if self.block.len() >= self.options.block_size {
            self.flush_block()?;
        }
        Ok(offset)
    }

    /// Compresses and writes the buffered block, if any.
    fn flush_block(&mut self) -> Result<(), LogError> {
        if self.block.is_empty() {
            return Ok(());
        }
        let file = self.file.as_mut().ok_or(LogError::Closed)?;

        self.compressed.clear();
        self.options
            .codec
            .compress(&self.block, self.options.level, &mut self.compressed)?;

        let mut hasher = Crc32::new();
        hasher.update(&self.compressed);
        let header = BlockHeader {
            stored_len: self.compressed.len() as u32,
            raw_len: self.block.len() as u32,
            crc: hasher.finalize(),
        };
        header.write_to(file)?;
        file.write_all(&self.compressed)?;

        self.position += BLOCK_HEADER_BYTES + self.compressed.len() as u64;
        self.num_blocks += 1;
        self.block.clear();
        Ok(())
    }

    /// Bytes written to the file so far, excluding the buffered block.
    #[must_use]
    pub fn num_bytes_written(&self) -> u64 {
        self.position
    }

    /// Records appended so far, including buffered ones.
    #[must_use]
    pub fn num_records_written(&self) -> u64 {
        self.num_records
    }

    /// The final path this writer publishes to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes the last block, writes the footer, fsyncs and atomically
    /// renames the temp file into place.
    pub fn finish(mut self) -> Result<LogSummary, LogError> {
        let mut summary = self.seal()?;
        rename(&self.tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        summary.path = self.path.clone();
        Ok(summary)
    }

    /// Like [`finish`](LogWriter::finish) but leaves the data under
    /// `<path>.tmp` for a caller that publishes several files together.
    pub fn finish_unpublished(mut self) -> Result<LogSummary, LogError> {
        self.seal()
    }

    fn seal(&mut self) -> Result<LogSummary, LogError> {
        self.flush_block()?;
        let mut file = self.file.take().ok_or(LogError::Closed)?;

        let footer = Footer {
            num_records: self.num_records,
            num_blocks: self.num_blocks,
            data_end: self.position,
        };
        footer.write_to(&mut file)?;
        file.flush()?;
        file.into_inner().map_err(|e| e.into_error())?.sync_all()?;

        Ok(LogSummary {
            path: self.tmp_path.clone(),
            num_records: self.num_records,
            num_blocks: self.num_blocks,
            bytes_written: self.position + crate::FOOTER_BYTES,
        })
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
