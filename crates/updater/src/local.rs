//! Local partition state: the `ACTIVE` marker and detection of cached pairs.
//!
//! ## `ACTIVE` format
//!
//! ```text
//! # DeltaKV active version
//! version:4
//! base:1
//! delta:2
//! delta:3
//! delta:4
//! ```
//!
//! Lines starting with `#` and blank lines are ignored. The file is rewritten
//! atomically (temp file, fsync, rename) and is the only thing that tells a
//! restarted server which chain to serve.

use partition::layout::parse_file_name;
use partition::{FileKind, PartitionFilePair, PartitionReader};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use tracing::{debug, warn};

use crate::plan::{IncrementalUpdatePlan, PairId};
use crate::UpdateError;

/// Name of the marker file inside a partition directory.
pub const ACTIVE_FILENAME: &str = "ACTIVE";

const ACTIVE_TMP_FILENAME: &str = "ACTIVE.tmp";

/// The chain a partition serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMarker {
    pub version: u32,
    pub base: u32,
    /// Ascending.
    pub deltas: Vec<u32>,
}

impl ActiveMarker {
    #[must_use]
    pub fn from_plan(plan: &IncrementalUpdatePlan) -> Self {
        Self {
            version: plan.target(),
            base: plan.base().number,
            deltas: plan.deltas().iter().map(|d| d.number).collect(),
        }
    }

    #[must_use]
    pub fn pairs(&self) -> Vec<PairId> {
        std::iter::once((self.base, FileKind::Base))
            .chain(self.deltas.iter().map(|&d| (d, FileKind::Delta)))
            .collect()
    }

    /// Parses marker text. Any unknown field, missing field or inconsistent
    /// chain is an error.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut version = None;
        let mut base = None;
        let mut deltas = Vec::new();

        for (line_num, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let (field, value) = trimmed
                .split_once(':')
                .ok_or_else(|| format!("line {}: expected '<field>:<value>'", line_num + 1))?;
            let number: u32 = value
                .trim()
                .parse()
                .map_err(|_| format!("line {}: bad number '{}'", line_num + 1, value))?;
            match field.trim() {
                "version" => version = Some(number),
                "base" => base = Some(number),
                "delta" => deltas.push(number),
                other => return Err(format!("line {}: unknown field '{}'", line_num + 1, other)),
            }
        }

        let version = version.ok_or("missing version")?;
        let base = base.ok_or("missing base")?;
        let mut previous = base;
        for &d in &deltas {
            if d <= previous {
                return Err(format!("delta {} does not follow {}", d, previous));
            }
            previous = d;
        }
        if previous != version {
            return Err(format!("chain ends at {} but version is {}", previous, version));
        }
        Ok(Self {
            version,
            base,
            deltas,
        })
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from("# DeltaKV active version\n");
        out.push_str(&format!("version:{}\n", self.version));
        out.push_str(&format!("base:{}\n", self.base));
        for d in &self.deltas {
            out.push_str(&format!("delta:{}\n", d));
        }
        out
    }

    /// Reads the marker in `dir`. A missing or malformed marker reads as
    /// `None`.
    pub fn load(dir: &Path) -> io::Result<Option<Self>> {
        let path = dir.join(ACTIVE_FILENAME);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(path = %path.display(), "ACTIVE marker is not text, ignoring it");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match Self::parse(&text) {
            Ok(marker) => Ok(Some(marker)),
            Err(reason) => {
                warn!(path = %path.display(), %reason, "malformed ACTIVE marker, ignoring it");
                Ok(None)
            }
        }
    }

    /// Atomically replaces the marker in `dir`.
    pub fn save(&self, dir: &Path) -> io::Result<()> {
        let tmp_path = dir.join(ACTIVE_TMP_FILENAME);
        let path = dir.join(ACTIVE_FILENAME);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(self.render().as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }
        Ok(())
    }
}

/// What detection found in a partition directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalState {
    pub active: Option<ActiveMarker>,
    /// Complete pairs that opened (and verified, when asked) cleanly.
    pub cached: BTreeSet<PairId>,
    /// Pairs deleted because they were incomplete or corrupt.
    pub discarded: Vec<PairId>,
}

/// Scans `dir`, discarding anything that must not be served.
///
/// The scratch directory and leftover temp files are removed first. Every
/// remaining pair is opened and, with `verify`, fully checksummed; pairs
/// missing a file or failing a check are deleted and reported in
/// [`LocalState::discarded`].
pub fn detect(dir: &Path, scratch_dir_name: &str, verify: bool) -> Result<LocalState, UpdateError> {
    fs::create_dir_all(dir)?;
    let scratch = dir.join(scratch_dir_name);
    if scratch.exists() {
        debug!(dir = %scratch.display(), "discarding scratch directory");
        fs::remove_dir_all(&scratch)?;
    }

    let mut seen: BTreeSet<PairId> = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".tmp") {
            debug!(file = %name, "removing leftover temp file");
            fs::remove_file(entry.path())?;
            continue;
        }
        if let Some((version, kind, _)) = parse_file_name(&name) {
            seen.insert((version, kind));
        }
    }

    let mut state = LocalState {
        active: ActiveMarker::load(dir)?,
        ..LocalState::default()
    };
    for (version, kind) in seen {
        let pair = PartitionFilePair::new(dir, version, kind);
        let checked = PartitionReader::open(&pair).and_then(|r| {
            if verify {
                r.verify()?;
            }
            Ok(())
        });
        match checked {
            Ok(()) => {
                state.cached.insert((version, kind));
            }
            Err(e) if e.is_corrupt() => {
                warn!(pair = %pair, error = %e, "discarding unusable pair");
                pair.remove()?;
                state.discarded.push((version, kind));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(state)
}
