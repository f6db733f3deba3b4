//! Record log binary format: header, block header, footer and record framing.
//!
//! ```text
//! header: [magic: u32 "RLG1"][codec: u8][reserved: 3 bytes]
//! block:  [stored_len: u32][raw_len: u32][crc32: u32][stored bytes]
//! footer: [num_records: u64][num_blocks: u64][data_end: u64][magic: u32 "RLGF"]
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Result as IoResult, Write};

/// Magic number at the start of every log file (ASCII "RLG1").
pub const LOG_MAGIC: u32 = 0x524C_4731;

/// Magic number closing every log file (ASCII "RLGF").
pub const FOOTER_MAGIC: u32 = 0x524C_4746;

/// Header size: 4 (`magic`) + 1 (`codec`) + 3 (reserved).
pub const HEADER_BYTES: u64 = 4 + 1 + 3;

/// Block header size: 4 (`stored_len`) + 4 (`raw_len`) + 4 (`crc32`).
pub const BLOCK_HEADER_BYTES: u64 = 4 + 4 + 4;

/// Footer size: 8 (`num_records`) + 8 (`num_blocks`) + 8 (`data_end`) + 4 (`magic`).
pub const FOOTER_BYTES: u64 = 8 + 8 + 8 + 4;

/// Maximum key size (64 KiB). Prevents OOM on corrupt files.
pub const MAX_KEY_BYTES: usize = 64 * 1024;

/// Maximum value size (64 MiB). Prevents OOM on corrupt files.
pub const MAX_VALUE_BYTES: usize = 64 * 1024 * 1024;

/// Largest block a reader will allocate for. One maximal record plus slack
/// for the rest of the block it shares.
pub(crate) const MAX_BLOCK_BYTES: u64 = 2 * (MAX_VALUE_BYTES as u64 + MAX_KEY_BYTES as u64);

pub(crate) fn write_header<W: Write>(w: &mut W, codec_id: u8) -> IoResult<()> {
    w.write_u32::<LittleEndian>(LOG_MAGIC)?;
    w.write_u8(codec_id)?;
    w.write_all(&[0u8; 3])?;
    Ok(())
}

/// Returns `(magic, codec_id)`.
pub(crate) fn read_header<R: Read>(r: &mut R) -> IoResult<(u32, u8)> {
    let magic = r.read_u32::<LittleEndian>()?;
    let codec_id = r.read_u8()?;
    let mut reserved = [0u8; 3];
    r.read_exact(&mut reserved)?;
    Ok((magic, codec_id))
}

/// Parsed log footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub num_records: u64,
    pub num_blocks: u64,
    /// Offset one past the last block (where the footer starts).
    pub data_end: u64,
}

impl Footer {
    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> IoResult<()> {
        w.write_u64::<LittleEndian>(self.num_records)?;
        w.write_u64::<LittleEndian>(self.num_blocks)?;
        w.write_u64::<LittleEndian>(self.data_end)?;
        w.write_u32::<LittleEndian>(FOOTER_MAGIC)?;
        Ok(())
    }

    /// Returns the footer and the magic that closed it.
    pub(crate) fn read_from<R: Read>(r: &mut R) -> IoResult<(Self, u32)> {
        let num_records = r.read_u64::<LittleEndian>()?;
        let num_blocks = r.read_u64::<LittleEndian>()?;
        let data_end = r.read_u64::<LittleEndian>()?;
        let magic = r.read_u32::<LittleEndian>()?;
        Ok((
            Self {
                num_records,
                num_blocks,
                data_end,
            },
            magic,
        ))
    }
}

/// Per-block framing written ahead of the stored bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHeader {
    pub stored_len: u32,
    pub raw_len: u32,
    pub crc: u32,
}

impl BlockHeader {
    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> IoResult<()> {
        w.write_u32::<LittleEndian>(self.stored_len)?;
        w.write_u32::<LittleEndian>(self.raw_len)?;
        w.write_u32::<LittleEndian>(self.crc)?;
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> IoResult<Self> {
        Ok(Self {
            stored_len: r.read_u32::<LittleEndian>()?,
            raw_len: r.read_u32::<LittleEndian>()?,
            crc: r.read_u32::<LittleEndian>()?,
        })
    }
}

// ---- Varint (unsigned LEB128) ----

pub(crate) fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

pub(crate) fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

/// Decodes a varint at `*pos`, advancing it. `None` on truncation or a
/// varint longer than ten bytes.
pub(crate) fn get_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut result = 0u64;
    for i in 0..10 {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        result |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some(result);
        }
    }
    None
}

// ---- Records ----

/// Encoded size of a record.
pub(crate) fn record_len(key: &[u8], value: Option<&[u8]>) -> usize {
    let value_field = value.map(|v| v.len() as u64 + 1).unwrap_or(0);
    varint_len(key.len() as u64)
        + key.len()
        + varint_len(value_field)
        + value.map(<[u8]>::len).unwrap_or(0)
}

/// Appends one record to `out`. `value == None` writes a tombstone.
pub(crate) fn encode_record(out: &mut Vec<u8>, key: &[u8], value: Option<&[u8]>) {
    put_varint(out, key.len() as u64);
    out.extend_from_slice(key);
    match value {
        Some(v) => {
            put_varint(out, v.len() as u64 + 1);
            out.extend_from_slice(v);
        }
        None => put_varint(out, 0),
    }
}

/// A record borrowed from a decompressed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawRecord<'a> {
    pub key: &'a [u8],
    pub value: Option<&'a [u8]>,
}

/// Decodes the record at `*pos`, advancing it past the record.
pub(crate) fn decode_record<'a>(block: &'a [u8], pos: &mut usize) -> Result<RawRecord<'a>, String> {
    let key_len = get_varint(block, pos).ok_or("truncated key length")? as usize;
    if key_len > MAX_KEY_BYTES {
        return Err(format!("key_len {} exceeds maximum {}", key_len, MAX_KEY_BYTES));
    }
    let key = take(block, pos, key_len).ok_or("truncated key")?;

    let value_field = get_varint(block, pos).ok_or("truncated value length")?;
    let value = if value_field == 0 {
        None
    } else {
        let val_len = (value_field - 1) as usize;
        if val_len > MAX_VALUE_BYTES {
            return Err(format!("val_len {} exceeds maximum {}", val_len, MAX_VALUE_BYTES));
        }
        Some(take(block, pos, val_len).ok_or("truncated value")?)
    };
    Ok(RawRecord { key, value })
}

fn take<'a>(block: &'a [u8], pos: &mut usize, len: usize) -> Option<&'a [u8]> {
    let end = pos.checked_add(len)?;
    let slice = block.get(*pos..end)?;
    *pos = end;
    Some(slice)
}
