use super::{config, write_pair};
use crate::local::detect;
use crate::*;
use anyhow::Result;
use partition::FileKind;
use recordlog::{BLOCK_HEADER_BYTES, HEADER_BYTES};
use std::fs;
use tempfile::tempdir;

fn marker() -> ActiveMarker {
    ActiveMarker {
        version: 4,
        base: 1,
        deltas: vec![2, 3, 4],
    }
}

// -------------------- ACTIVE marker --------------------

#[test]
fn marker_text_round_trips() -> Result<()> {
    let m = marker();
    let text = m.render();
    assert!(text.starts_with('#'));
    assert_eq!(ActiveMarker::parse(&text).map_err(anyhow::Error::msg)?, m);
    Ok(())
}

#[test]
fn marker_parse_skips_comments_and_blank_lines() {
    let text = "\n# written by hand\nversion: 3\n\nbase:3\n";
    let m = ActiveMarker::parse(text).unwrap();
    assert_eq!(m.version, 3);
    assert_eq!(m.base, 3);
    assert!(m.deltas.is_empty());
    assert_eq!(m.pairs(), vec![(3, FileKind::Base)]);
}

#[test]
fn marker_parse_rejects_inconsistent_chains() {
    for bad in [
        "base:1\n",
        "version:1\n",
        "version:2\nbase:1\n",
        "version:3\nbase:1\ndelta:3\ndelta:2\n",
        "version:2\nbase:1\ndelta:2\nextra:9\n",
        "version:x\nbase:1\n",
        "version 1\n",
    ] {
        assert!(ActiveMarker::parse(bad).is_err(), "accepted {:?}", bad);
    }
}

#[test]
fn marker_save_and_load() -> Result<()> {
    let dir = tempdir()?;
    assert_eq!(ActiveMarker::load(dir.path())?, None);

    marker().save(dir.path())?;
    assert_eq!(ActiveMarker::load(dir.path())?, Some(marker()));
    assert!(!dir.path().join("ACTIVE.tmp").exists());
    Ok(())
}

#[test]
fn malformed_marker_loads_as_none() -> Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join(ACTIVE_FILENAME), "version:banana\n")?;
    assert_eq!(ActiveMarker::load(dir.path())?, None);
    fs::write(dir.path().join(ACTIVE_FILENAME), [0xff, 0xfe, 0x00])?;
    assert_eq!(ActiveMarker::load(dir.path())?, None);
    Ok(())
}

// -------------------- Detection --------------------

#[test]
fn detect_creates_a_missing_directory() -> Result<()> {
    let root = tempdir()?;
    let dir = root.path().join("users").join("0");
    let state = detect(&dir, ".scratch", true)?;
    assert!(dir.is_dir());
    assert_eq!(state, LocalState::default());
    Ok(())
}

#[test]
fn detect_lists_complete_pairs_and_reads_active() -> Result<()> {
    let dir = tempdir()?;
    let cfg = config();
    write_pair(dir.path(), 1, FileKind::Base, &cfg.store, &[("a", Some("1"))])?;
    write_pair(dir.path(), 2, FileKind::Delta, &cfg.store, &[("a", None)])?;
    ActiveMarker {
        version: 2,
        base: 1,
        deltas: vec![2],
    }
    .save(dir.path())?;

    let state = detect(dir.path(), ".scratch", true)?;
    assert_eq!(
        state.cached.iter().copied().collect::<Vec<_>>(),
        vec![(1, FileKind::Base), (2, FileKind::Delta)]
    );
    assert_eq!(state.active.map(|m| m.version), Some(2));
    assert!(state.discarded.is_empty());
    Ok(())
}

#[test]
fn detect_discards_scratch_and_temp_files() -> Result<()> {
    let dir = tempdir()?;
    let scratch = dir.path().join(".scratch");
    fs::create_dir_all(&scratch)?;
    fs::write(scratch.join("3.delta.log"), b"half a fetch")?;
    fs::write(dir.path().join("4.base.log.tmp"), b"half a write")?;
    fs::write(dir.path().join("ACTIVE.tmp"), b"version:")?;

    let state = detect(dir.path(), ".scratch", true)?;
    assert!(state.cached.is_empty());
    assert!(!scratch.exists());
    assert_eq!(fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn detect_discards_incomplete_and_corrupt_pairs() -> Result<()> {
    let dir = tempdir()?;
    let cfg = config();
    write_pair(dir.path(), 1, FileKind::Base, &cfg.store, &[("a", Some("1"))])?;
    let half = write_pair(dir.path(), 2, FileKind::Delta, &cfg.store, &[("a", Some("2"))])?;
    fs::remove_file(half.index_path())?;
    let bad = write_pair(dir.path(), 3, FileKind::Delta, &cfg.store, &[("a", Some("3"))])?;
    let mut data = fs::read(bad.log_path())?;
    data[(HEADER_BYTES + BLOCK_HEADER_BYTES) as usize + 1] ^= 0xff;
    fs::write(bad.log_path(), &data)?;

    let state = detect(dir.path(), ".scratch", true)?;
    assert_eq!(
        state.cached.iter().copied().collect::<Vec<_>>(),
        vec![(1, FileKind::Base)]
    );
    assert_eq!(state.discarded, vec![(2, FileKind::Delta), (3, FileKind::Delta)]);
    assert!(!half.log_path().exists());
    assert!(!bad.index_path().exists() && !bad.log_path().exists());
    Ok(())
}

#[test]
fn detect_without_verification_keeps_checksum_damage() -> Result<()> {
    let dir = tempdir()?;
    let cfg = config();
    let bad = write_pair(dir.path(), 1, FileKind::Base, &cfg.store, &[("a", Some("1"))])?;
    let mut data = fs::read(bad.log_path())?;
    data[(HEADER_BYTES + BLOCK_HEADER_BYTES) as usize + 1] ^= 0xff;
    fs::write(bad.log_path(), &data)?;

    let state = detect(dir.path(), ".scratch", false)?;
    assert!(state.cached.contains(&(1, FileKind::Base)));
    Ok(())
}
