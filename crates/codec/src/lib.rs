//! # Codec - Block Compression
//!
//! Pluggable compression for the fixed-size blocks of a DeltaKV record log.
//!
//! Each log file records the codec it was written with as a one-byte id in
//! its header, so a reader never needs out-of-band configuration to
//! decompress a block.
//!
//! | Codec     | Id | Backing                         |
//! |-----------|----|---------------------------------|
//! | `none`    | 0  | stored verbatim                 |
//! | `deflate` | 1  | raw DEFLATE stream (`flate2`)   |
//! | `gzip`    | 2  | gzip member (`flate2`)          |
//!
//! ## Example
//!
//! ```rust
//! use codec::BlockCodec;
//!
//! let mut stored = Vec::new();
//! BlockCodec::Deflate.compress(b"hello hello hello", 6, &mut stored).unwrap();
//!
//! let mut raw = Vec::new();
//! BlockCodec::Deflate.decompress(&stored, 17, &mut raw).unwrap();
//! assert_eq!(raw, b"hello hello hello");
//! ```

use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// Default compression level for the deflate-family codecs.
pub const DEFAULT_LEVEL: u32 = 6;

/// Highest compression level accepted by [`BlockCodec::compress`].
pub const MAX_LEVEL: u32 = 9;

/// Compression applied to each record-log block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlockCodec {
    /// Blocks are stored uncompressed.
    None,
    /// Raw DEFLATE.
    #[default]
    Deflate,
    /// Gzip framing around DEFLATE (header + CRC trailer).
    Gzip,
}

impl BlockCodec {
    /// Stable on-disk identifier.
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            BlockCodec::None => 0,
            BlockCodec::Deflate => 1,
            BlockCodec::Gzip => 2,
        }
    }

    /// Inverse of [`id`](BlockCodec::id). Returns `None` for unknown ids.
    #[must_use]
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(BlockCodec::None),
            1 => Some(BlockCodec::Deflate),
            2 => Some(BlockCodec::Gzip),
            _ => None,
        }
    }

    /// Compresses `raw` and appends the result to `out`.
    ///
    /// `level` is clamped to `0..=9`; it is ignored by [`BlockCodec::None`].
    pub fn compress(self, raw: &[u8], level: u32, out: &mut Vec<u8>) -> io::Result<()> {
        let level = Compression::new(level.min(MAX_LEVEL));
        match self {
            BlockCodec::None => {
                out.extend_from_slice(raw);
            }
            BlockCodec::Deflate => {
                let mut enc = DeflateEncoder::new(out, level);
                enc.write_all(raw)?;
                enc.finish()?;
            }
            BlockCodec::Gzip => {
                let mut enc = GzEncoder::new(out, level);
                enc.write_all(raw)?;
                enc.finish()?;
            }
        }
        Ok(())
    }

    /// Decompresses `stored` into `out`, replacing its contents.
    ///
    /// `expected_len` is the uncompressed length recorded by the writer. The
    /// output buffer is reserved up front and the call fails with
    /// [`io::ErrorKind::InvalidData`] if the stream decodes to a different
    /// length.
    pub fn decompress(self, stored: &[u8], expected_len: usize, out: &mut Vec<u8>) -> io::Result<()> {
        out.clear();
        out.reserve(expected_len);
        match self {
            BlockCodec::None => out.extend_from_slice(stored),
            BlockCodec::Deflate => {
                DeflateDecoder::new(stored)
                    .take(expected_len as u64 + 1)
                    .read_to_end(out)?;
            }
            BlockCodec::Gzip => {
                GzDecoder::new(stored)
                    .take(expected_len as u64 + 1)
                    .read_to_end(out)?;
            }
        }
        if out.len() != expected_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} block decoded to {} bytes, expected {}",
                    self,
                    out.len(),
                    expected_len
                ),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for BlockCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockCodec::None => "none",
            BlockCodec::Deflate => "deflate",
            BlockCodec::Gzip => "gzip",
        };
        f.write_str(name)
    }
}

/// Error returned when parsing an unknown codec name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCodec(pub String);

impl fmt::Display for UnknownCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown codec '{}' (expected none, deflate or gzip)", self.0)
    }
}

impl std::error::Error for UnknownCodec {}

impl FromStr for BlockCodec {
    type Err = UnknownCodec;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(BlockCodec::None),
            "deflate" | "zlib" => Ok(BlockCodec::Deflate),
            "gzip" | "gz" => Ok(BlockCodec::Gzip),
            _ => Err(UnknownCodec(s.to_string())),
        }
    }
}
