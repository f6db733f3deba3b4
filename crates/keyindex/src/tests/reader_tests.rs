use super::{h, write_index};
use crate::*;
use anyhow::Result;
use std::fs;
use tempfile::tempdir;

// -------------------- Round trip --------------------

#[test]
fn every_written_hash_returns_its_offset() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.idx");
    let slots: Vec<([u8; 2], Option<u64>)> =
        (0..500u16).map(|i| (h(i * 3), Some(u64::from(i) * 17 + 8))).collect();
    write_index(&path, false, &slots)?;

    let r = IndexReader::open(&path)?;
    assert_eq!(r.len(), 500);
    for i in 0..500u16 {
        assert_eq!(
            r.lookup(&h(i * 3))?,
            IndexLookup::Offsets(vec![u64::from(i) * 17 + 8])
        );
    }
    // Gaps between written hashes are misses.
    assert_eq!(r.lookup(&h(1))?, IndexLookup::NotPresent);
    assert_eq!(r.lookup(&h(u16::MAX))?, IndexLookup::NotPresent);
    r.verify(None)?;
    Ok(())
}

#[test]
fn collisions_return_distinct_offsets() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.idx");
    write_index(
        &path,
        false,
        &[
            (h(1), Some(8)),
            (h(7), Some(8)),
            (h(7), Some(8)),
            (h(7), Some(40)),
            (h(9), Some(40)),
        ],
    )?;

    let r = IndexReader::open(&path)?;
    assert_eq!(r.lookup(&h(7))?, IndexLookup::Offsets(vec![8, 40]));
    Ok(())
}

#[test]
fn long_collision_run_is_bounded() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.idx");
    let slots: Vec<([u8; 2], Option<u64>)> = (0..10u64).map(|i| (h(4), Some(8 + i))).collect();
    write_index(&path, false, &slots)?;

    let r = IndexReader::open(&path)?.with_max_probes(5);
    assert_eq!(r.lookup(&h(4))?, IndexLookup::Overflow);
    assert_eq!(r.collision_overflows(), 1);

    let r = IndexReader::open(&path)?.with_max_probes(10);
    match r.lookup(&h(4))? {
        IndexLookup::Offsets(o) => assert_eq!(o.len(), 10),
        other => panic!("expected offsets, got {:?}", other),
    }
    assert_eq!(r.collision_overflows(), 0);
    Ok(())
}

#[test]
fn absent_marker_round_trips() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("2.delta.idx");
    write_index(&path, true, &[(h(1), Some(8)), (h(2), None), (h(3), Some(8))])?;

    let r = IndexReader::open(&path)?;
    assert!(r.is_delta());
    assert_eq!(r.lookup(&h(2))?, IndexLookup::Absent);
    assert_eq!(r.absent_hashes().collect::<Vec<_>>(), vec![&h(2)[..]]);
    r.verify(Some(100))?;
    Ok(())
}

#[test]
fn wide_offsets_round_trip() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.idx");
    let mut w = IndexWriter::create(
        &path,
        IndexOptions {
            hash_size: 1,
            offset_width: 8,
            is_delta: false,
        },
    )?;
    w.write(&[0], u64::MAX - 1)?;
    w.finish()?;
    let r = IndexReader::open(&path)?;
    assert_eq!(r.lookup(&[0])?, IndexLookup::Offsets(vec![u64::MAX - 1]));
    Ok(())
}

// -------------------- Corruption --------------------

#[test]
fn truncated_slot_fails_fast() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.idx");
    write_index(&path, false, &[(h(1), Some(8)), (h(2), Some(9))])?;

    let data = fs::read(&path)?;
    fs::write(&path, &data[..data.len() - 1])?;

    let err = IndexReader::open(&path).unwrap_err();
    assert!(matches!(err, IndexError::Corrupt { .. }), "got {:?}", err);
    Ok(())
}

#[test]
fn bad_magic_and_tiny_files_are_corrupt() -> Result<()> {
    let dir = tempdir()?;
    let tiny = dir.path().join("tiny.idx");
    fs::write(&tiny, b"KHX")?;
    assert!(matches!(IndexReader::open(&tiny).unwrap_err(), IndexError::Corrupt { .. }));

    let bad = dir.path().join("bad.idx");
    fs::write(&bad, [0u8; 8])?;
    assert!(matches!(IndexReader::open(&bad).unwrap_err(), IndexError::Corrupt { .. }));
    Ok(())
}

#[test]
fn verify_catches_unsorted_slots() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.idx");
    write_index(&path, false, &[(h(1), Some(8)), (h(2), Some(9))])?;

    // Swap the two hashes in place: header is 8 bytes, slots are 6 bytes.
    let mut data = fs::read(&path)?;
    data[8..10].copy_from_slice(&h(2));
    data[14..16].copy_from_slice(&h(1));
    fs::write(&path, &data)?;

    let r = IndexReader::open(&path)?;
    assert!(matches!(r.verify(None).unwrap_err(), IndexError::Corrupt { .. }));
    Ok(())
}

#[test]
fn verify_catches_offsets_past_log_end() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.idx");
    write_index(&path, false, &[(h(1), Some(500))])?;
    let r = IndexReader::open(&path)?;
    assert!(r.verify(Some(100)).is_err());
    r.verify(Some(501))?;
    Ok(())
}

// -------------------- Lifecycle --------------------

#[test]
fn close_is_idempotent() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.idx");
    write_index(&path, false, &[(h(1), Some(8))])?;

    let mut r = IndexReader::open(&path)?;
    r.close();
    r.close();
    assert!(matches!(r.lookup(&h(1)).unwrap_err(), IndexError::Closed));
    Ok(())
}

#[test]
fn wrong_lookup_hash_size() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.idx");
    write_index(&path, false, &[(h(1), Some(8))])?;
    let r = IndexReader::open(&path)?;
    assert!(matches!(r.lookup(&[1]).unwrap_err(), IndexError::HashSize { .. }));
    Ok(())
}

#[test]
fn concurrent_lookups() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.idx");
    let slots: Vec<([u8; 2], Option<u64>)> =
        (0..1000u16).map(|i| (h(i), Some(u64::from(i) + 8))).collect();
    write_index(&path, false, &slots)?;
    let r = IndexReader::open(&path)?;

    std::thread::scope(|s| {
        for t in 0..4u16 {
            let r = &r;
            s.spawn(move || {
                for i in (t..1000).step_by(4) {
                    assert_eq!(
                        r.lookup(&h(i)).unwrap(),
                        IndexLookup::Offsets(vec![u64::from(i) + 8])
                    );
                }
            });
        }
    });
    Ok(())
}
