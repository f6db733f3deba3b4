mod local_tests;

use crate::{
    partition_dir, DirectoryCatalog, LocalRemoteFileOps, PartitionUpdater, RemoteFileOps,
    VersionCatalog,
};
use config::{Config, StoreConfig};
use parking_lot::Mutex;
use partition::{Domain, FileKind, PartitionFilePair, PartitionWriter};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use tempfile::{tempdir, TempDir};

pub(crate) const DOMAIN: &str = "users";
pub(crate) const PARTITION: u32 = 0;

pub(crate) fn config() -> Config {
    Config {
        store: StoreConfig {
            block_size: 256,
            ..StoreConfig::default()
        },
        ..Config::default()
    }
}

/// Writes a pair holding `entries` (value `None` = tombstone) into `dir`,
/// sorting them into hash order first.
pub(crate) fn write_pair(
    dir: &Path,
    version: u32,
    kind: FileKind,
    store: &StoreConfig,
    entries: &[(&str, Option<&str>)],
) -> anyhow::Result<PartitionFilePair> {
    let hasher = partition::KeyHasher::new(store.key_hash_size)?;
    let mut sorted = entries.to_vec();
    sorted.sort_by(|a, b| {
        hasher.hash(a.0.as_bytes())[..]
            .cmp(&hasher.hash(b.0.as_bytes())[..])
            .then_with(|| a.0.cmp(b.0))
    });
    let mut w = PartitionWriter::create(dir, version, kind, store)?;
    for (key, value) in sorted {
        match value {
            Some(v) => w.write(key.as_bytes(), v.as_bytes())?,
            None => w.delete(key.as_bytes())?,
        }
    }
    Ok(w.close()?)
}

/// A remote root, a local root and one domain partition between them.
pub(crate) struct Fixture {
    pub remote_root: TempDir,
    pub local_root: TempDir,
    pub domain: Domain,
    pub config: Config,
}

impl Fixture {
    pub fn new() -> anyhow::Result<Self> {
        let config = config();
        Ok(Self {
            remote_root: tempdir()?,
            local_root: tempdir()?,
            domain: Domain::new(DOMAIN, 1, config.store.key_hash_size)?,
            config,
        })
    }

    pub fn remote_dir(&self) -> PathBuf {
        self.remote_root.path().join(partition_dir(DOMAIN, PARTITION))
    }

    pub fn local_dir(&self) -> PathBuf {
        self.local_root.path().join(partition_dir(DOMAIN, PARTITION))
    }

    /// Publishes a pair to remote storage.
    pub fn publish(
        &self,
        version: u32,
        kind: FileKind,
        entries: &[(&str, Option<&str>)],
    ) -> anyhow::Result<PartitionFilePair> {
        write_pair(&self.remote_dir(), version, kind, &self.config.store, entries)
    }

    pub fn catalog(&self) -> Arc<dyn VersionCatalog> {
        Arc::new(DirectoryCatalog::new(self.remote_root.path(), DOMAIN))
    }

    pub fn local_remote(&self) -> LocalRemoteFileOps {
        LocalRemoteFileOps::new(self.remote_root.path())
    }

    pub fn updater_with(&self, remote: Arc<dyn RemoteFileOps>) -> PartitionUpdater {
        PartitionUpdater::new(
            &self.domain,
            PARTITION,
            self.local_root.path(),
            remote,
            self.catalog(),
            self.config.clone(),
        )
    }

    pub fn updater(&self) -> PartitionUpdater {
        self.updater_with(Arc::new(self.local_remote()))
    }
}

/// Records every file copied and can be told to fail on a path.
pub(crate) struct RecordingRemote {
    inner: LocalRemoteFileOps,
    pub copied: Mutex<Vec<PathBuf>>,
    pub fail_on: Mutex<Option<String>>,
}

impl RecordingRemote {
    pub fn new(inner: LocalRemoteFileOps) -> Self {
        Self {
            inner,
            copied: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
        }
    }

    /// File names copied so far, in order.
    pub fn copied_names(&self) -> Vec<String> {
        self.copied
            .lock()
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect()
    }
}

impl RemoteFileOps for RecordingRemote {
    fn exists(&self, remote: &Path) -> io::Result<bool> {
        self.inner.exists(remote)
    }

    fn open(&self, remote: &Path) -> io::Result<Box<dyn Read + Send>> {
        self.inner.open(remote)
    }

    fn delete(&self, remote: &Path) -> io::Result<()> {
        self.inner.delete(remote)
    }

    fn copy_to_local(&self, remote: &Path, local: &Path) -> io::Result<u64> {
        if let Some(pattern) = self.fail_on.lock().as_deref() {
            if remote.to_string_lossy().contains(pattern) {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected failure"));
            }
        }
        let n = self.inner.copy_to_local(remote, local)?;
        self.copied.lock().push(remote.to_path_buf());
        Ok(n)
    }
}

/// Parks the first copy until the test lets it go.
pub(crate) struct BlockingRemote {
    inner: LocalRemoteFileOps,
    blocked: AtomicBool,
    pub entered: Barrier,
    pub release: Barrier,
}

impl BlockingRemote {
    pub fn new(inner: LocalRemoteFileOps) -> Self {
        Self {
            inner,
            blocked: AtomicBool::new(false),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl RemoteFileOps for BlockingRemote {
    fn exists(&self, remote: &Path) -> io::Result<bool> {
        self.inner.exists(remote)
    }

    fn open(&self, remote: &Path) -> io::Result<Box<dyn Read + Send>> {
        self.inner.open(remote)
    }

    fn delete(&self, remote: &Path) -> io::Result<()> {
        self.inner.delete(remote)
    }

    fn copy_to_local(&self, remote: &Path, local: &Path) -> io::Result<u64> {
        if !self.blocked.swap(true, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
        self.inner.copy_to_local(remote, local)
    }
}
