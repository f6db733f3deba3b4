//! # RecordLog - Compressed Record Log
//!
//! The payload half of a DeltaKV partition file pair. Records are appended
//! into blocks; each block is compressed as a unit and addressed by the byte
//! offset of its header. The key-hash index stores that block offset, never
//! the offset of an individual record.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ HEADER (8 bytes)                                               │
//! │ magic (u32 LE) "RLG1" | codec id (u8) | reserved (3 bytes)    │
//! ├───────────────────────────────────────────────────────────────┤
//! │ BLOCK                                                         │
//! │ stored_len (u32) | raw_len (u32) | crc32 (u32) | stored bytes │
//! │                                                               │
//! │ ... repeated for each block ...                                │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FOOTER (always last 28 bytes)                                  │
//! │ num_records (u64) | num_blocks (u64) | data_end (u64)         │
//! │ magic (u32 LE) "RLGF"                                         │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The CRC32 covers the stored (compressed) bytes so corruption is caught
//! before the decompressor sees it. A decompressed block is a concatenation
//! of records:
//!
//! ```text
//! [varint key_len][key][varint value_len + 1][value]
//! ```
//!
//! A value-length field of `0` marks a tombstone; no value bytes follow.
//!
//! ## Reading
//!
//! [`LogReader::read_at`] decompresses one block into a caller-owned
//! [`ReadBuffer`] and scans it for the requested key. Running off the end of
//! the block without a match is a normal [`LogLookup::NotFound`]: keys whose
//! truncated hashes collide share an index run but not necessarily a block.

mod format;
mod reader;
mod writer;

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub use format::{
    BLOCK_HEADER_BYTES, FOOTER_BYTES, FOOTER_MAGIC, HEADER_BYTES, LOG_MAGIC, MAX_KEY_BYTES,
    MAX_VALUE_BYTES,
};
pub use reader::{LogLookup, LogReader, ReadBuffer, Record, RecordIter};
pub use writer::{LogOptions, LogSummary, LogWriter};

/// Errors produced by the log writer and reader.
#[derive(Debug, Error)]
pub enum LogError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The file violates the log format and must not be served.
    #[error("corrupt log {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// A key or value exceeds the supported size.
    #[error("{what} of {len} bytes exceeds the maximum of {max}")]
    RecordTooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },

    /// The writer options are outside the supported range.
    #[error("invalid log options: {0}")]
    InvalidOptions(String),

    /// The reader was closed.
    #[error("log reader is closed")]
    Closed,
}

#[cfg(test)]
mod tests;
