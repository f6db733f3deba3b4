use super::{numbered, opts, write_log};
use crate::*;
use anyhow::Result;
use codec::BlockCodec;
use std::fs;
use tempfile::tempdir;

const CODECS: [BlockCodec; 3] = [BlockCodec::None, BlockCodec::Deflate, BlockCodec::Gzip];

// -------------------- Point reads --------------------

#[test]
fn every_record_is_found_at_its_offset() -> Result<()> {
    for codec in CODECS {
        let dir = tempdir()?;
        let path = dir.path().join("1.base.log");
        let records = numbered(300, 40);
        let offsets = write_log(&path, opts(512, codec), &records)?;

        let r = LogReader::open(&path)?;
        assert_eq!(r.codec(), codec);
        let mut buf = ReadBuffer::new();
        for ((key, value), offset) in records.iter().zip(&offsets) {
            match r.read_at(*offset, key, &mut buf)? {
                LogLookup::Value(v) => assert_eq!(Some(v), value.as_deref()),
                other => panic!("{:?}: expected value, got {:?}", codec, other),
            }
        }
        r.verify()?;
    }
    Ok(())
}

#[test]
fn empty_and_large_values() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.log");
    let big: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    let records = vec![
        (b"empty".to_vec(), Some(Vec::new())),
        (b"big".to_vec(), Some(big.clone())),
        (b"after".to_vec(), Some(b"x".to_vec())),
    ];
    let offsets = write_log(&path, opts(1024, BlockCodec::Deflate), &records)?;

    let r = LogReader::open(&path)?;
    let mut buf = ReadBuffer::new();
    assert_eq!(r.read_at(offsets[0], b"empty", &mut buf)?, LogLookup::Value(b""));
    assert_eq!(r.read_at(offsets[1], b"big", &mut buf)?, LogLookup::Value(&big[..]));
    assert!(buf.capacity() >= big.len());
    assert_eq!(r.read_at(offsets[2], b"after", &mut buf)?, LogLookup::Value(b"x"));
    Ok(())
}

#[test]
fn tombstones_and_misses() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("2.delta.log");
    let records = vec![
        (b"alive".to_vec(), Some(b"1".to_vec())),
        (b"dead".to_vec(), None),
    ];
    let offsets = write_log(&path, opts(4096, BlockCodec::Gzip), &records)?;

    let r = LogReader::open(&path)?;
    let mut buf = ReadBuffer::new();
    assert_eq!(r.read_at(offsets[1], b"dead", &mut buf)?, LogLookup::Tombstone);
    // Scanning the whole block without a match is a normal miss.
    assert_eq!(r.read_at(offsets[0], b"other", &mut buf)?, LogLookup::NotFound);
    Ok(())
}

#[test]
fn records_iterates_in_write_order() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.log");
    let mut records = numbered(100, 10);
    records[50].1 = None;
    write_log(&path, opts(128, BlockCodec::Deflate), &records)?;

    let r = LogReader::open(&path)?;
    let read: Vec<Record> = r.records().collect::<Result<_, _>>()?;
    assert_eq!(read.len(), 100);
    for (rec, (key, value)) in read.iter().zip(&records) {
        assert_eq!(&rec.key, key);
        assert_eq!(&rec.value, value);
    }
    Ok(())
}

// -------------------- Corruption --------------------

#[test]
fn flipped_byte_fails_crc() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.log");
    let offsets = write_log(&path, opts(4096, BlockCodec::None), &numbered(5, 16))?;

    let mut data = fs::read(&path)?;
    let idx = (HEADER_BYTES + BLOCK_HEADER_BYTES) as usize + 3;
    data[idx] ^= 0xff;
    fs::write(&path, &data)?;

    let r = LogReader::open(&path)?;
    let mut buf = ReadBuffer::new();
    let err = r.read_at(offsets[0], b"key00000", &mut buf).unwrap_err();
    assert!(matches!(err, LogError::Corrupt { .. }), "got {:?}", err);
    assert!(r.verify().is_err());
    Ok(())
}

#[test]
fn truncated_file_is_rejected_at_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.log");
    write_log(&path, opts(4096, BlockCodec::Deflate), &numbered(20, 16))?;

    let data = fs::read(&path)?;
    fs::write(&path, &data[..data.len() - 5])?;
    assert!(matches!(LogReader::open(&path).unwrap_err(), LogError::Corrupt { .. }));
    Ok(())
}

#[test]
fn out_of_range_offset_is_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.log");
    write_log(&path, opts(4096, BlockCodec::Deflate), &numbered(3, 16))?;

    let r = LogReader::open(&path)?;
    let mut buf = ReadBuffer::new();
    assert!(r.read_at(0, b"key00000", &mut buf).is_err());
    assert!(r.read_at(r.data_end(), b"key00000", &mut buf).is_err());
    Ok(())
}

#[test]
fn offsets_near_the_integer_limit_are_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.log");
    write_log(&path, opts(4096, BlockCodec::Deflate), &numbered(3, 16))?;

    let r = LogReader::open(&path)?;
    let mut buf = ReadBuffer::new();
    for offset in [u64::MAX, u64::MAX - BLOCK_HEADER_BYTES + 1, u64::MAX / 2] {
        let err = r.read_at(offset, b"key00000", &mut buf).unwrap_err();
        assert!(matches!(err, LogError::Corrupt { .. }), "offset {}: {:?}", offset, err);
    }
    Ok(())
}

#[test]
fn oversized_stored_len_is_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.log");
    write_log(&path, opts(4096, BlockCodec::Deflate), &numbered(3, 16))?;

    let mut bytes = fs::read(&path)?;
    let at = HEADER_BYTES as usize;
    bytes[at..at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
    fs::write(&path, &bytes)?;

    let r = LogReader::open(&path)?;
    let mut buf = ReadBuffer::new();
    let err = r.read_at(HEADER_BYTES, b"key00000", &mut buf).unwrap_err();
    assert!(matches!(err, LogError::Corrupt { .. }), "{:?}", err);
    assert!(r.verify().is_err());
    Ok(())
}

#[test]
fn unknown_codec_is_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.log");
    write_log(&path, opts(4096, BlockCodec::Deflate), &numbered(3, 16))?;

    let mut data = fs::read(&path)?;
    data[4] = 42;
    fs::write(&path, &data)?;
    assert!(matches!(LogReader::open(&path).unwrap_err(), LogError::Corrupt { .. }));
    Ok(())
}

// -------------------- Lifecycle & concurrency --------------------

#[test]
fn close_is_idempotent() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.log");
    let offsets = write_log(&path, opts(4096, BlockCodec::None), &numbered(3, 4))?;

    let r = LogReader::open(&path)?;
    r.close();
    r.close();
    let mut buf = ReadBuffer::new();
    assert!(matches!(
        r.read_at(offsets[0], b"key00000", &mut buf).unwrap_err(),
        LogError::Closed
    ));
    Ok(())
}

#[test]
fn concurrent_reads_with_private_buffers() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.log");
    let records = numbered(400, 32);
    let offsets = write_log(&path, opts(256, BlockCodec::Deflate), &records)?;
    let r = LogReader::open(&path)?;

    std::thread::scope(|s| {
        for t in 0..4usize {
            let (r, records, offsets) = (&r, &records, &offsets);
            s.spawn(move || {
                let mut buf = ReadBuffer::new();
                for i in (t..records.len()).step_by(4) {
                    let got = r.read_at(offsets[i], &records[i].0, &mut buf).unwrap();
                    assert_eq!(got, LogLookup::Value(records[i].1.as_deref().unwrap()));
                }
            });
        }
    });
    Ok(())
}
