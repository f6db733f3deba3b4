use super::{numbered, opts, write_log};
use crate::*;
use anyhow::Result;
use codec::BlockCodec;
use tempfile::tempdir;

// -------------------- Block offsets --------------------

#[test]
fn records_in_one_block_share_its_offset() -> Result<()> {
    let dir = tempdir()?;
    let offsets = write_log(
        &dir.path().join("1.base.log"),
        opts(4096, BlockCodec::Deflate),
        &numbered(10, 8),
    )?;
    assert!(offsets.iter().all(|&o| o == HEADER_BYTES));
    Ok(())
}

#[test]
fn small_blocks_produce_increasing_offsets() -> Result<()> {
    let dir = tempdir()?;
    let offsets = write_log(
        &dir.path().join("1.base.log"),
        opts(64, BlockCodec::None),
        &numbered(50, 20),
    )?;
    assert_eq!(offsets[0], HEADER_BYTES);
    assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    assert!(offsets.last() > offsets.first(), "expected more than one block");
    Ok(())
}

#[test]
fn oversized_record_gets_its_own_block() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.log");
    let records = vec![
        (b"a".to_vec(), Some(b"small".to_vec())),
        (b"b".to_vec(), Some(vec![7u8; 1000])),
        (b"c".to_vec(), Some(b"small".to_vec())),
    ];
    let offsets = write_log(&path, opts(100, BlockCodec::None), &records)?;
    assert_eq!(offsets[0], HEADER_BYTES);
    assert!(offsets[1] > offsets[0]);
    assert!(offsets[2] > offsets[1]);

    let r = LogReader::open(&path)?;
    assert_eq!(r.num_blocks(), 3);
    Ok(())
}

// -------------------- Counters --------------------

#[test]
fn counters_track_records_and_bytes() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.log");
    let mut w = LogWriter::create(&path, opts(32, BlockCodec::None))?;
    assert_eq!(w.num_bytes_written(), HEADER_BYTES);
    w.append(b"k1", Some(b"value-one"))?;
    w.append(b"k2", None)?;
    w.append(b"k3", Some(b""))?;
    assert_eq!(w.num_records_written(), 3);

    let summary = w.finish()?;
    assert_eq!(summary.num_records, 3);
    assert_eq!(summary.path, path);
    assert_eq!(summary.bytes_written, std::fs::metadata(&path)?.len());
    Ok(())
}

#[test]
fn empty_log_is_valid() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.log");
    let summary = LogWriter::create(&path, LogOptions::default())?.finish()?;
    assert_eq!(summary.num_blocks, 0);
    assert_eq!(summary.bytes_written, HEADER_BYTES + FOOTER_BYTES);

    let r = LogReader::open(&path)?;
    assert_eq!(r.num_records(), 0);
    assert_eq!(r.records().count(), 0);
    r.verify()?;
    Ok(())
}

// -------------------- Validation & publishing --------------------

#[test]
fn oversized_key_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let mut w = LogWriter::create(dir.path().join("1.base.log"), LogOptions::default())?;
    let key = vec![0u8; MAX_KEY_BYTES + 1];
    assert!(matches!(
        w.append(&key, Some(b"v")).unwrap_err(),
        LogError::RecordTooLarge { what: "key", .. }
    ));
    Ok(())
}

#[test]
fn zero_block_size_is_rejected() {
    let dir = tempdir().unwrap();
    let res = LogWriter::create(dir.path().join("1.base.log"), opts(0, BlockCodec::None));
    assert!(matches!(res, Err(LogError::InvalidOptions(_))));
}

#[test]
fn unfinished_writer_removes_tmp() -> Result<()> {
    let dir = tempdir()?;
    {
        let mut w = LogWriter::create(dir.path().join("1.base.log"), LogOptions::default())?;
        w.append(b"k", Some(b"v"))?;
    }
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn finish_unpublished_returns_tmp_path() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.base.log");
    let mut w = LogWriter::create(&path, LogOptions::default())?;
    w.append(b"k", Some(b"v"))?;
    let summary = w.finish_unpublished()?;
    assert_eq!(summary.path, dir.path().join("1.base.log.tmp"));
    assert!(summary.path.exists());
    assert!(!path.exists());
    LogReader::open(&summary.path)?.verify()?;
    Ok(())
}
