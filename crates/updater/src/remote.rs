//! Transport between remote storage and a partition server's local disk.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Operations on remote storage. Paths are relative to the remote root.
///
/// `copy_to_local` is the only call expected to be slow; it runs on the
/// updater's worker thread, never on the query path.
pub trait RemoteFileOps: Send + Sync {
    fn exists(&self, remote: &Path) -> io::Result<bool>;

    /// Streams a remote file.
    fn open(&self, remote: &Path) -> io::Result<Box<dyn Read + Send>>;

    fn delete(&self, remote: &Path) -> io::Result<()>;

    /// Copies a remote file to `local` and fsyncs it, returning the bytes
    /// copied. The default streams through [`open`](RemoteFileOps::open).
    fn copy_to_local(&self, remote: &Path, local: &Path) -> io::Result<u64> {
        let mut src = self.open(remote)?;
        let mut dst = File::create(local)?;
        let copied = io::copy(&mut src, &mut dst)?;
        dst.sync_all()?;
        Ok(copied)
    }
}

/// `<domain>/<partition>`, the remote directory holding one partition's pairs.
#[must_use]
pub fn partition_dir(domain: &str, partition: u32) -> PathBuf {
    Path::new(domain).join(partition.to_string())
}

/// A local directory standing in for remote storage.
#[derive(Debug, Clone)]
pub struct LocalRemoteFileOps {
    root: PathBuf,
}

impl LocalRemoteFileOps {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, remote: &Path) -> io::Result<PathBuf> {
        if remote.is_absolute()
            || remote
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("remote path {} escapes the root", remote.display()),
            ));
        }
        Ok(self.root.join(remote))
    }
}

impl RemoteFileOps for LocalRemoteFileOps {
    fn exists(&self, remote: &Path) -> io::Result<bool> {
        Ok(self.resolve(remote)?.is_file())
    }

    fn open(&self, remote: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.resolve(remote)?)?))
    }

    fn delete(&self, remote: &Path) -> io::Result<()> {
        fs::remove_file(self.resolve(remote)?)
    }
}
