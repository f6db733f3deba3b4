//! # Partition - Versioned Partition Files
//!
//! Ties a [`keyindex`] file and a [`recordlog`] file together into the unit
//! DeltaKV serves: one partition of one domain version.
//!
//! ## Layout
//!
//! ```text
//! <partition_dir>/
//!   <n>.base.idx   <n>.base.log     full snapshot at version n
//!   <n>.delta.idx  <n>.delta.log    changes made by version n
//! ```
//!
//! A pair is published log first, index last, so a log without its index is
//! an incomplete pair and is never opened.
//!
//! ## Read path
//!
//! ```text
//! key ──sha256/truncate──► hash
//!                           │
//!   ChainedReader: delta_k … delta_1 (newest first) ──► base
//!                           │
//!   per file:  index.lookup(hash) ──► block offsets
//!              log.read_at(offset, key) ──► value | tombstone | miss
//! ```
//!
//! The first file that knows the key decides: a value is returned, a
//! tombstone or ABSENT marker ends the search with `None`. A miss in every
//! delta falls through to the base, so an uncompacted chain costs one
//! in-memory binary search per delta before the base is consulted.
//! [`fold`] bounds that cost by merging a chain into a new base.
//!
//! ## Module Responsibilities
//!
//! | Module         | Purpose                                               |
//! |----------------|-------------------------------------------------------|
//! | [`domain`]     | `Domain`, `DomainVersion`, partitioner, key hasher   |
//! | [`layout`]     | File naming and `PartitionFilePair`                   |
//! | [`writer`]     | `PartitionWriter`: streaming build + atomic publish   |
//! | [`reader`]     | `Reader` trait, `PartitionReader`, `ChainedReader`    |
//! | [`compaction`] | `fold()`: latest-wins merge of a chain into a base    |
//! | [`deleter`]    | `PartitionDeleter`                                    |

pub mod compaction;
pub mod deleter;
pub mod domain;
pub mod layout;
pub mod reader;
pub mod writer;

use keyindex::IndexError;
use recordlog::LogError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub use compaction::{fold, FoldSummary};
pub use deleter::PartitionDeleter;
pub use domain::{Domain, DomainVersion, FnvPartitioner, KeyHash, KeyHasher, Partitioner};
pub use layout::{FileExt, FileKind, PartitionFilePair};
pub use reader::{ChainedReader, KeyState, PartitionReader, Reader};
pub use recordlog::ReadBuffer;
pub use writer::PartitionWriter;

/// Errors produced while writing, reading or folding partition files.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Keys must be written in ascending hash order.
    #[error("out-of-order write: hash {hash} follows {previous}")]
    OutOfOrderWrite { previous: String, hash: String },

    /// Tombstones and ABSENT markers only exist in deltas.
    #[error("{0} is only valid in a delta")]
    DeltaOnly(&'static str),

    /// An index or log does not match the pair it was opened as.
    #[error("{}: {reason}", path.display())]
    Mismatch { path: PathBuf, reason: String },

    /// Deltas must extend their base in strictly ascending version order.
    #[error("delta {next} cannot follow version {previous}")]
    OutOfOrderDelta { previous: u32, next: u32 },

    /// The pair is missing one of its files.
    #[error("incomplete pair: {} is missing", path.display())]
    Incomplete { path: PathBuf },

    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    /// The reader was closed.
    #[error("partition reader is closed")]
    Closed,
}

impl PartitionError {
    /// True for errors that mean the files on disk cannot be trusted and
    /// must be discarded.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            PartitionError::Index(IndexError::Corrupt { .. })
                | PartitionError::Log(LogError::Corrupt { .. })
                | PartitionError::Mismatch { .. }
                | PartitionError::Incomplete { .. }
        )
    }
}

#[cfg(test)]
mod tests;
