use codec::BlockCodec;
use crc32fast::Hasher as Crc32;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::format::{
    decode_record, read_header, BlockHeader, Footer, BLOCK_HEADER_BYTES, FOOTER_BYTES,
    FOOTER_MAGIC, HEADER_BYTES, LOG_MAGIC, MAX_BLOCK_BYTES,
};
use crate::LogError;

/// Caller-owned scratch space for block reads.
///
/// Holds the stored (compressed) bytes and the decompressed block. Both
/// grow geometrically and are reused across calls, so a query thread that
/// keeps one buffer stops allocating once it has seen its largest block.
/// Never share one buffer between concurrent calls.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    stored: Vec<u8>,
    block: Vec<u8>,
}

impl ReadBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-sizes the decompression side for blocks of about `block_size`.
    #[must_use]
    pub fn with_capacity(block_size: usize) -> Self {
        Self {
            stored: Vec::with_capacity(block_size),
            block: Vec::with_capacity(block_size),
        }
    }

    /// Current capacity of the decompressed-block buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.block.capacity()
    }
}

/// Grows `buf` to at least `len` bytes of capacity, rounding up to a power
/// of two.
fn grow(buf: &mut Vec<u8>, len: usize) {
    if buf.capacity() < len {
        let target = len.next_power_of_two();
        buf.reserve(target - buf.len());
    }
}

/// Outcome of scanning one block for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLookup<'b> {
    /// The key's value, borrowed from the caller's [`ReadBuffer`].
    Value(&'b [u8]),
    /// The key's latest record in this log is a tombstone.
    Tombstone,
    /// The block does not contain the key.
    NotFound,
}

/// An owned record yielded by [`RecordIter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    /// `None` for a tombstone.
    pub value: Option<Vec<u8>>,
}

/// Random-access reader for a record log.
///
/// The file handle sits behind a `Mutex`; the lock is held only while the
/// block's stored bytes are read. CRC verification, decompression and the
/// key scan run outside it in the caller's buffer, so concurrent lookups
/// contend only on the positional read.
pub struct LogReader {
    path: PathBuf,
    codec: BlockCodec,
    footer: Footer,
    file: Mutex<Option<File>>,
}

impl std::fmt::Debug for LogReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReader")
            .field("path", &self.path)
            .field("codec", &self.codec)
            .field("footer", &self.footer)
            .finish()
    }
}

impl LogReader {
    /// Opens a log file and validates its header and footer.
    ///
    /// # Errors
    ///
    /// [`LogError::Corrupt`] if the file is too small, either magic is wrong,
    /// the codec id is unknown, or the footer's `data_end` does not match the
    /// file size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let mut f = File::open(&path)?;
        let filesize = f.metadata()?.len();

        let corrupt = |reason: String| LogError::Corrupt {
            path: path.clone(),
            reason,
        };

        if filesize < HEADER_BYTES + FOOTER_BYTES {
            return Err(corrupt(format!("file too small ({} bytes)", filesize)));
        }

        let (magic, codec_id) = read_header(&mut f)?;
        if magic != LOG_MAGIC {
            return Err(corrupt(format!("unknown log magic: {:#x}", magic)));
        }
        let codec = BlockCodec::from_id(codec_id)
            .ok_or_else(|| corrupt(format!("unknown codec id {}", codec_id)))?;

        f.seek(SeekFrom::End(-(FOOTER_BYTES as i64)))?;
        let (footer, footer_magic) = Footer::read_from(&mut f)?;
        if footer_magic != FOOTER_MAGIC {
            return Err(corrupt(format!("unknown footer magic: {:#x}", footer_magic)));
        }
        if footer.data_end != filesize - FOOTER_BYTES {
            return Err(corrupt(format!(
                "footer data_end {} does not match file size {}",
                footer.data_end, filesize
            )));
        }
        if footer.num_blocks == 0 && footer.data_end != HEADER_BYTES {
            return Err(corrupt("data present but footer lists no blocks".to_string()));
        }

        Ok(Self {
            path,
            codec,
            footer,
            file: Mutex::new(Some(f)),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn codec(&self) -> BlockCodec {
        self.codec
    }

    /// Number of records (tombstones included) according to the footer.
    #[must_use]
    pub fn num_records(&self) -> u64 {
        self.footer.num_records
    }

    #[must_use]
    pub fn num_blocks(&self) -> u64 {
        self.footer.num_blocks
    }

    /// Offset one past the last block. Every valid block offset is below it.
    #[must_use]
    pub fn data_end(&self) -> u64 {
        self.footer.data_end
    }

    fn corrupt(&self, reason: String) -> LogError {
        LogError::Corrupt {
            path: self.path.clone(),
            reason,
        }
    }

    /// Reads, verifies and decompresses the block at `offset` into
    /// `buf.block`. Returns the offset of the following block.
    fn load_block(&self, offset: u64, buf: &mut ReadBuffer) -> Result<u64, LogError> {
        let header_end = offset.checked_add(BLOCK_HEADER_BYTES);
        if offset < HEADER_BYTES || header_end.map_or(true, |e| e > self.footer.data_end) {
            return Err(self.corrupt(format!(
                "block offset {} outside data section [{}, {})",
                offset, HEADER_BYTES, self.footer.data_end
            )));
        }

        let (header, end) = {
            let mut guard = self.file.lock();
            let f = guard.as_mut().ok_or(LogError::Closed)?;
            f.seek(SeekFrom::Start(offset))?;
            let header = BlockHeader::read_from(f)?;

            let end = offset
                .checked_add(BLOCK_HEADER_BYTES + u64::from(header.stored_len))
                .filter(|end| *end <= self.footer.data_end)
                .ok_or_else(|| {
                    self.corrupt(format!(
                        "block at {} with {} stored bytes runs past the data section ({})",
                        offset, header.stored_len, self.footer.data_end
                    ))
                })?;
            if u64::from(header.raw_len) > MAX_BLOCK_BYTES {
                return Err(self.corrupt(format!(
                    "block at {} claims {} raw bytes",
                    offset, header.raw_len
                )));
            }

            let stored_len = header.stored_len as usize;
            grow(&mut buf.stored, stored_len);
            buf.stored.resize(stored_len, 0);
            f.read_exact(&mut buf.stored)?;
            (header, end)
        };

        let mut hasher = Crc32::new();
        hasher.update(&buf.stored);
        let actual = hasher.finalize();
        if actual != header.crc {
            return Err(self.corrupt(format!(
                "CRC32 mismatch in block at {}: expected {:#010x}, got {:#010x}",
                offset, header.crc, actual
            )));
        }

        let raw_len = header.raw_len as usize;
        grow(&mut buf.block, raw_len);
        self.codec
            .decompress(&buf.stored, raw_len, &mut buf.block)
            .map_err(|e| self.corrupt(format!("block at {} failed to decompress: {}", offset, e)))?;

        Ok(end)
    }

    /// Decompresses the block at `offset` and scans it for `key`.
    ///
    /// `offset` comes from an index lookup. If the block holds more than one
    /// record for `key`, the last one wins.
    ///
    /// # Errors
    ///
    /// [`LogError::Corrupt`] if the offset is out of range, the checksum does
    /// not match, or a record is malformed.
    pub fn read_at<'b>(
        &self,
        offset: u64,
        key: &[u8],
        buf: &'b mut ReadBuffer,
    ) -> Result<LogLookup<'b>, LogError> {
        self.load_block(offset, buf)?;
        let block: &'b [u8] = &buf.block;

        let mut pos = 0usize;
        let mut found = LogLookup::NotFound;
        while pos < block.len() {
            let rec = decode_record(block, &mut pos)
                .map_err(|reason| self.corrupt(format!("block at {}: {}", offset, reason)))?;
            if rec.key == key {
                found = match rec.value {
                    Some(v) => LogLookup::Value(v),
                    None => LogLookup::Tombstone,
                };
            }
        }
        Ok(found)
    }

    /// Sequential iterator over every record in file order.
    pub fn records(&self) -> RecordIter<'_> {
        RecordIter {
            reader: self,
            next_block: HEADER_BYTES,
            pos: 0,
            buf: ReadBuffer::new(),
            failed: false,
        }
    }

    /// Walks every block, checking checksums, record framing, and that the
    /// block and record counts match the footer.
    pub fn verify(&self) -> Result<(), LogError> {
        let mut buf = ReadBuffer::new();
        let mut offset = HEADER_BYTES;
        let mut blocks = 0u64;
        let mut records = 0u64;

        while offset < self.footer.data_end {
            let next = self.load_block(offset, &mut buf)?;
            let mut pos = 0usize;
            while pos < buf.block.len() {
                decode_record(&buf.block, &mut pos)
                    .map_err(|reason| self.corrupt(format!("block at {}: {}", offset, reason)))?;
                records += 1;
            }
            blocks += 1;
            offset = next;
        }

        if blocks != self.footer.num_blocks || records != self.footer.num_records {
            return Err(self.corrupt(format!(
                "found {} blocks / {} records, footer says {} / {}",
                blocks, records, self.footer.num_blocks, self.footer.num_records
            )));
        }
        Ok(())
    }

    /// Releases the file handle. Safe to call more than once; later reads
    /// fail with [`LogError::Closed`].
    pub fn close(&self) {
        self.file.lock().take();
    }
}

/// Iterator over all records of a log, block by block.
///
/// Stops after the first error.
pub struct RecordIter<'a> {
    reader: &'a LogReader,
    next_block: u64,
    /// Read position inside the current decompressed block.
    pos: usize,
    buf: ReadBuffer,
    failed: bool,
}

impl Iterator for RecordIter<'_> {
    type Item = Result<Record, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while self.pos >= self.buf.block.len() {
            if self.next_block >= self.reader.footer.data_end {
                return None;
            }
            match self.reader.load_block(self.next_block, &mut self.buf) {
                Ok(next) => {
                    self.next_block = next;
                    self.pos = 0;
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        match decode_record(&self.buf.block, &mut self.pos) {
            Ok(rec) => Some(Ok(Record {
                key: rec.key.to_vec(),
                value: rec.value.map(<[u8]>::to_vec),
            })),
            Err(reason) => {
                self.failed = true;
                Some(Err(self.reader.corrupt(reason)))
            }
        }
    }
}
