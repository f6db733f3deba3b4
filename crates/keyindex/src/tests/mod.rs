mod reader_tests;

use crate::{IndexOptions, IndexWriter};
use std::path::Path;

/// Builds a 2-byte hash from a number, preserving numeric order.
pub(crate) fn h(n: u16) -> [u8; 2] {
    n.to_be_bytes()
}

pub(crate) fn options(is_delta: bool) -> IndexOptions {
    IndexOptions {
        hash_size: 2,
        offset_width: 4,
        is_delta,
    }
}

/// Writes `(hash, Some(offset) | None=ABSENT)` slots and publishes the index.
pub(crate) fn write_index(
    path: &Path,
    is_delta: bool,
    slots: &[([u8; 2], Option<u64>)],
) -> anyhow::Result<()> {
    let mut w = IndexWriter::create(path, options(is_delta))?;
    for (hash, offset) in slots {
        match offset {
            Some(o) => w.write(hash, *o)?,
            None => w.write_absent(hash)?,
        }
    }
    w.finish()?;
    Ok(())
}
