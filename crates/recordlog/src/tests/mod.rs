mod reader_tests;
mod writer_tests;

use crate::{LogOptions, LogWriter};
use codec::BlockCodec;
use std::path::Path;

pub(crate) fn opts(block_size: usize, codec: BlockCodec) -> LogOptions {
    LogOptions {
        block_size,
        codec,
        level: codec::DEFAULT_LEVEL,
    }
}

/// Appends `(key, Some(value) | None=tombstone)` records, publishes the log
/// and returns the block offset of every record.
pub(crate) fn write_log(
    path: &Path,
    options: LogOptions,
    records: &[(Vec<u8>, Option<Vec<u8>>)],
) -> anyhow::Result<Vec<u64>> {
    let mut w = LogWriter::create(path, options)?;
    let mut offsets = Vec::with_capacity(records.len());
    for (k, v) in records {
        offsets.push(w.append(k, v.as_deref())?);
    }
    w.finish()?;
    Ok(offsets)
}

pub(crate) fn numbered(n: usize, value_len: usize) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
    (0..n)
        .map(|i| {
            (
                format!("key{:05}", i).into_bytes(),
                Some(vec![b'a' + (i % 26) as u8; value_len]),
            )
        })
        .collect()
}
