use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

/// Removes a partition's local directory and everything in it.
#[derive(Debug, Clone)]
pub struct PartitionDeleter {
    dir: PathBuf,
}

impl PartitionDeleter {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Deletes the directory. Returns `false` if it did not exist.
    ///
    /// Readers still holding open files keep working until dropped.
    pub fn delete(&self) -> io::Result<bool> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                info!(dir = %self.dir.display(), "deleted partition");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
