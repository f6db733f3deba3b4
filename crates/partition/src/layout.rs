//! On-disk naming of partition file pairs.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::PartitionError;

/// Whether a pair holds a full snapshot or the changes of one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileKind {
    Base,
    Delta,
}

impl FileKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Base => "base",
            FileKind::Delta => "delta",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base" => Ok(FileKind::Base),
            "delta" => Ok(FileKind::Delta),
            other => Err(format!("unknown file kind '{}'", other)),
        }
    }
}

/// The two halves of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileExt {
    Index,
    Log,
}

impl FileExt {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FileExt::Index => "idx",
            FileExt::Log => "log",
        }
    }
}

/// `<version>.<kind>.<ext>`
#[must_use]
pub fn file_name(version: u32, kind: FileKind, ext: FileExt) -> String {
    format!("{}.{}.{}", version, kind, ext.as_str())
}

/// Parses a pair file name. Returns `None` for anything else, temp files
/// included.
#[must_use]
pub fn parse_file_name(name: &str) -> Option<(u32, FileKind, FileExt)> {
    let mut parts = name.split('.');
    let version = parts.next()?.parse::<u32>().ok()?;
    let kind = parts.next()?.parse::<FileKind>().ok()?;
    let ext = match parts.next()? {
        "idx" => FileExt::Index,
        "log" => FileExt::Log,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((version, kind, ext))
}

/// The index and log of one `(version, kind)` inside a partition directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionFilePair {
    dir: PathBuf,
    version: u32,
    kind: FileKind,
}

impl PartitionFilePair {
    pub fn new<P: AsRef<Path>>(dir: P, version: u32, kind: FileKind) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            version,
            kind,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    #[must_use]
    pub fn path(&self, ext: FileExt) -> PathBuf {
        self.dir.join(file_name(self.version, self.kind, ext))
    }

    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.path(FileExt::Index)
    }

    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.path(FileExt::Log)
    }

    /// The same pair under another directory.
    #[must_use]
    pub fn in_dir<P: AsRef<Path>>(&self, dir: P) -> Self {
        Self::new(dir, self.version, self.kind)
    }

    /// Both files are present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.index_path().is_file() && self.log_path().is_file()
    }

    /// Fails with [`PartitionError::Incomplete`] naming the first missing file.
    pub fn check_complete(&self) -> Result<(), PartitionError> {
        for path in [self.log_path(), self.index_path()] {
            if !path.is_file() {
                return Err(PartitionError::Incomplete { path });
            }
        }
        Ok(())
    }

    /// Moves both files into `dest_dir`, log first and index last, then
    /// fsyncs the destination directory. Returns the published pair.
    pub fn publish_to<P: AsRef<Path>>(&self, dest_dir: P) -> Result<Self, PartitionError> {
        self.check_complete()?;
        let dest = self.in_dir(dest_dir);
        fs::rename(self.log_path(), dest.log_path())?;
        fs::rename(self.index_path(), dest.index_path())?;
        sync_dir(dest.dir());
        Ok(dest)
    }

    /// Removes the pair, index first so that an interrupted removal leaves
    /// an incomplete pair rather than an orphaned index.
    pub fn remove(&self) -> io::Result<()> {
        remove_if_exists(&self.index_path())?;
        remove_if_exists(&self.log_path())
    }
}

impl fmt::Display for PartitionFilePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.version, self.kind)
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Fsyncs a directory so completed renames survive a crash.
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(d) = fs::File::open(dir) {
        let _ = d.sync_all();
    }
}
