//! Index binary format constants and header read/write helpers.
//!
//! ```text
//! [magic: u32 LE "KHX1"][hash_size: u8][offset_width: u8][flags: u8][reserved: u8]
//! ```

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Result as IoResult, Write};

/// Magic number identifying index files (ASCII "KHX1").
pub const INDEX_MAGIC: u32 = 0x4B48_5831;

/// Size of the header in bytes: 4 (`magic`) + 1 + 1 + 1 + 1.
pub const HEADER_BYTES: u64 = 4 + 4;

/// Header flag set on delta indexes.
pub const FLAG_DELTA: u8 = 0x01;

const KNOWN_FLAGS: u8 = FLAG_DELTA;

/// Largest supported hash size (a full SHA-256 digest).
pub(crate) const MAX_HASH_SIZE: u8 = 32;

/// Largest supported offset width.
pub(crate) const MAX_OFFSET_WIDTH: u8 = 8;

/// Returns the reserved ABSENT value for an offset width.
#[must_use]
pub fn absent_marker(offset_width: u8) -> u64 {
    if offset_width >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * u32::from(offset_width))) - 1
    }
}

/// Parsed index header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub hash_size: u8,
    pub offset_width: u8,
    pub is_delta: bool,
}

impl IndexHeader {
    /// Width of one slot: hash bytes followed by offset bytes.
    #[must_use]
    pub fn slot_width(&self) -> usize {
        usize::from(self.hash_size) + usize::from(self.offset_width)
    }

    /// The reserved ABSENT value for this header's offset width.
    #[must_use]
    pub fn absent(&self) -> u64 {
        absent_marker(self.offset_width)
    }

    /// Returns a description of the first invalid field, if any.
    pub(crate) fn check(&self) -> Option<String> {
        if self.hash_size == 0 || self.hash_size > MAX_HASH_SIZE {
            return Some(format!("hash_size {} not in 1..={}", self.hash_size, MAX_HASH_SIZE));
        }
        if self.offset_width == 0 || self.offset_width > MAX_OFFSET_WIDTH {
            return Some(format!(
                "offset_width {} not in 1..={}",
                self.offset_width, MAX_OFFSET_WIDTH
            ));
        }
        None
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> IoResult<()> {
        w.write_u32::<LittleEndian>(INDEX_MAGIC)?;
        w.write_u8(self.hash_size)?;
        w.write_u8(self.offset_width)?;
        w.write_u8(if self.is_delta { FLAG_DELTA } else { 0 })?;
        w.write_u8(0)?;
        Ok(())
    }

    /// Reads a header, returning `Err(reason)` for structural violations.
    pub(crate) fn read_from<R: Read>(r: &mut R) -> IoResult<Result<Self, String>> {
        let magic = r.read_u32::<LittleEndian>()?;
        let hash_size = r.read_u8()?;
        let offset_width = r.read_u8()?;
        let flags = r.read_u8()?;
        let _reserved = r.read_u8()?;

        if magic != INDEX_MAGIC {
            return Ok(Err(format!("unknown index magic: {:#x}", magic)));
        }
        if flags & !KNOWN_FLAGS != 0 {
            return Ok(Err(format!("unknown header flags: {:#04x}", flags)));
        }
        let header = IndexHeader {
            hash_size,
            offset_width,
            is_delta: flags & FLAG_DELTA != 0,
        };
        Ok(match header.check() {
            Some(reason) => Err(reason),
            None => Ok(header),
        })
    }
}

/// Encodes `offset` into the first `width` bytes of `out`, little-endian.
///
/// The caller guarantees the offset fits.
pub(crate) fn encode_offset(offset: u64, width: u8, out: &mut [u8]) {
    LittleEndian::write_uint(out, offset, usize::from(width));
}

/// Decodes a `bytes.len()`-wide little-endian offset.
pub(crate) fn decode_offset(bytes: &[u8]) -> u64 {
    LittleEndian::read_uint(bytes, bytes.len())
}
