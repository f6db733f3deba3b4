//! # KeyIndex - Fixed-Slot Key-Hash Index
//!
//! The index half of a DeltaKV partition file pair. It maps the truncated
//! hash of every key in a partition version to the byte offset of the
//! record-log block that holds the key's record.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ HEADER (8 bytes)                                               │
//! │                                                               │
//! │ magic (u32 LE) "KHX1" | hash_size (u8) | offset_width (u8)    │
//! │ flags (u8, bit 0 = delta) | reserved (u8)                     │
//! ├───────────────────────────────────────────────────────────────┤
//! │ SLOTS (fixed width, ascending hash order)                      │
//! │                                                               │
//! │ hash (hash_size bytes) | offset (offset_width bytes, LE)      │
//! │                                                               │
//! │ ... repeated for each key ...                                  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The all-ones offset (`2^(8 * offset_width) - 1`) is reserved as the
//! ABSENT marker: in a delta index it states that no key with that hash
//! survives, overriding whatever an older version holds.
//!
//! Several keys may share a truncated hash. Their slots are adjacent, and a
//! lookup returns every distinct block offset in the run; the record log
//! settles which block (if any) actually holds the key.
//!
//! The whole slot array is loaded into memory on open, so a lookup costs a
//! binary search and no I/O.

mod format;
mod reader;
mod writer;

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub use format::{absent_marker, IndexHeader, FLAG_DELTA, HEADER_BYTES, INDEX_MAGIC};
pub use reader::{IndexLookup, IndexReader, Slot, SlotValue, DEFAULT_MAX_PROBES};
pub use writer::{IndexOptions, IndexWriter};

/// Errors produced by the index writer and reader.
#[derive(Debug, Error)]
pub enum IndexError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The file violates the index format and must not be served.
    #[error("corrupt index {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// Slots must be written in ascending hash order.
    #[error("out-of-order write: hash {hash} follows {previous}")]
    OutOfOrderWrite { previous: String, hash: String },

    /// The offset does not fit in the configured width (or collides with
    /// the reserved ABSENT marker).
    #[error("offset {offset} does not fit in {width} bytes")]
    OffsetOverflow { offset: u64, width: u8 },

    /// The hash passed in does not have the index's hash size.
    #[error("hash has {actual} bytes, index expects {expected}")]
    HashSize { expected: usize, actual: usize },

    /// ABSENT markers are a delta-only construct.
    #[error("ABSENT markers are only valid in delta indexes")]
    AbsentInBase,

    /// A hash run may hold offsets or a single ABSENT marker, never both.
    #[error("hash {hash} mixes ABSENT and offset slots")]
    MixedAbsentRun { hash: String },

    /// The writer options are outside the supported range.
    #[error("invalid index options: {0}")]
    InvalidOptions(String),

    /// The reader was closed.
    #[error("index reader is closed")]
    Closed,
}

/// Renders a hash as lowercase hex for error messages and logs.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests;
