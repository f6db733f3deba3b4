//! The per-partition update cycle.

use config::Config;
use parking_lot::Mutex;
use partition::layout::file_name;
use partition::{
    ChainedReader, Domain, FileExt, FileKind, FoldSummary, PartitionFilePair, PartitionReader,
    Reader,
};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::active::ActiveVersion;
use crate::local::{self, ActiveMarker};
use crate::plan::{IncrementalUpdatePlan, PairId, VersionCatalog};
use crate::remote::{partition_dir, RemoteFileOps};
use crate::UpdateError;

/// Where a partition's updater is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterState {
    Idle,
    Detecting,
    Planning,
    Fetching,
    Applying,
    Switching,
    Compacting,
    /// The last cycle failed; the previous version is still served.
    Failed,
}

impl fmt::Display for UpdaterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdaterState::Idle => "idle",
            UpdaterState::Detecting => "detecting",
            UpdaterState::Planning => "planning",
            UpdaterState::Fetching => "fetching",
            UpdaterState::Applying => "applying",
            UpdaterState::Switching => "switching",
            UpdaterState::Compacting => "compacting",
            UpdaterState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a successful [`PartitionUpdater::run_update`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Version served before the cycle.
    pub previous: Option<u32>,
    /// Version served after the cycle.
    pub version: u32,
    /// The served chain, base first.
    pub chain: Vec<PairId>,
    /// Pairs copied from remote storage, in application order.
    pub fetched: Vec<PairId>,
    pub bytes_fetched: u64,
    /// Cached pairs found corrupt or incomplete and deleted.
    pub discarded: Vec<PairId>,
    /// Cached pairs deleted because the new chain does not use them.
    pub removed: Vec<PairId>,
    /// False when the requested chain was already being served.
    pub switched: bool,
}

/// Counters kept across cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdaterStatistics {
    pub cycles_started: u64,
    pub cycles_succeeded: u64,
    pub cycles_failed: u64,
    /// Pairs fetched from remote storage.
    pub versions_fetched: u64,
    pub bytes_fetched: u64,
    pub compactions: u64,
    pub pairs_discarded: u64,
    pub last_outcome: Option<UpdateOutcome>,
    pub last_error: Option<String>,
    pub last_cycle: Option<Duration>,
}

/// Keeps one partition of a domain on the version it is asked to serve.
///
/// The local directory is `<local_root>/<domain>/<partition>` and the remote
/// one `<domain>/<partition>` under the [`RemoteFileOps`] root. Queries go
/// through [`PartitionUpdater::active`] and never wait on a cycle.
pub struct PartitionUpdater {
    domain: String,
    key_hash_size: usize,
    partition: u32,
    dir: PathBuf,
    remote_dir: PathBuf,
    remote: Arc<dyn RemoteFileOps>,
    catalog: Arc<dyn VersionCatalog>,
    config: Config,
    active: Arc<ActiveVersion>,
    cycle: Mutex<()>,
    state: Mutex<UpdaterState>,
    stats: Mutex<UpdaterStatistics>,
}

impl fmt::Debug for PartitionUpdater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionUpdater")
            .field("domain", &self.domain)
            .field("partition", &self.partition)
            .field("dir", &self.dir)
            .field("state", &self.state())
            .field("version", &self.active.version())
            .finish()
    }
}

impl PartitionUpdater {
    pub fn new<P: AsRef<Path>>(
        domain: &Domain,
        partition: u32,
        local_root: P,
        remote: Arc<dyn RemoteFileOps>,
        catalog: Arc<dyn VersionCatalog>,
        config: Config,
    ) -> Self {
        let remote_dir = partition_dir(domain.name(), partition);
        Self {
            domain: domain.name().to_string(),
            key_hash_size: domain.key_hash_size(),
            partition,
            dir: local_root.as_ref().join(&remote_dir),
            remote_dir,
            remote,
            catalog,
            config,
            active: Arc::new(ActiveVersion::new()),
            cycle: Mutex::new(()),
            state: Mutex::new(UpdaterState::Idle),
            stats: Mutex::new(UpdaterStatistics::default()),
        }
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Local partition directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The serving slot. Cloning the `Arc` lets query threads read while
    /// cycles run.
    #[must_use]
    pub fn active(&self) -> Arc<ActiveVersion> {
        Arc::clone(&self.active)
    }

    #[must_use]
    pub fn state(&self) -> UpdaterState {
        *self.state.lock()
    }

    #[must_use]
    pub fn statistics(&self) -> UpdaterStatistics {
        self.stats.lock().clone()
    }

    /// True when the served chain has at least `compaction_delta_threshold`
    /// deltas.
    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        let threshold = self.config.updater.compaction_delta_threshold;
        threshold > 0
            && self
                .active
                .current()
                .map_or(false, |chain| chain.deltas().len() >= threshold)
    }

    /// Serves the chain named by `ACTIVE`, if it is intact on disk.
    ///
    /// Meant for startup, before the first [`run_update`](Self::run_update).
    /// Returns the restored version.
    pub fn restore(&self) -> Result<Option<u32>, UpdateError> {
        self.run_cycle(|| {
            self.set_state(UpdaterState::Detecting);
            let local = self.detect()?;
            let Some(marker) = local.active else {
                debug!(dir = %self.dir.display(), "no ACTIVE marker to restore");
                return Ok(None);
            };
            if let Some(missing) = marker.pairs().iter().find(|p| !local.cached.contains(*p)) {
                warn!(
                    version = marker.version,
                    missing = ?missing,
                    "ACTIVE chain is not intact, nothing restored"
                );
                return Ok(None);
            }
            self.set_state(UpdaterState::Applying);
            let chain = self.open_chain(&marker.pairs())?;
            self.set_state(UpdaterState::Switching);
            self.active.swap(Arc::new(chain));
            info!(
                domain = %self.domain,
                partition = self.partition,
                version = marker.version,
                "restored active version"
            );
            Ok(Some(marker.version))
        })
    }

    /// Moves the partition to the newest version in the catalog.
    pub fn run_update_to_latest(&self) -> Result<UpdateOutcome, UpdateError> {
        let latest = self
            .catalog
            .latest()
            .map_err(|source| UpdateError::NetworkFetch {
                what: "version catalog".to_string(),
                source,
            })?
            .ok_or_else(|| UpdateError::NetworkFetch {
                what: "version catalog".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no published versions"),
            })?;
        self.run_update(latest.number)
    }

    /// Runs one update cycle towards `target`.
    ///
    /// # Errors
    ///
    /// [`UpdateError::UpdateInProgress`] when another cycle holds the
    /// partition; any other error fails the cycle and leaves the previously
    /// active version serving.
    pub fn run_update(&self, target: u32) -> Result<UpdateOutcome, UpdateError> {
        let outcome = self.run_cycle(|| self.update_cycle(target))?;
        self.stats.lock().last_outcome = Some(outcome.clone());
        if self.needs_compaction() {
            info!(
                domain = %self.domain,
                partition = self.partition,
                version = outcome.version,
                "delta chain reached the compaction threshold"
            );
        }
        Ok(outcome)
    }

    /// Folds the served chain into a base numbered with its version, serves
    /// that base and deletes the folded pairs.
    ///
    /// Returns `None` when nothing is served or the chain has no deltas.
    pub fn compact(&self) -> Result<Option<FoldSummary>, UpdateError> {
        self.run_cycle(|| {
            let Some(chain) = self.active.current() else {
                return Ok(None);
            };
            if chain.deltas().is_empty() {
                return Ok(None);
            }
            self.set_state(UpdaterState::Compacting);
            let scratch = self.scratch_dir()?;
            let summary = chain.fold_into(&scratch, &self.config.store)?;
            let pair = summary.pair.publish_to(&self.dir)?;
            let _ = fs::remove_dir(&scratch);

            let folded_id = (pair.version(), FileKind::Base);
            let new_chain = self.open_chain(&[folded_id])?;
            self.set_state(UpdaterState::Switching);
            let marker = ActiveMarker {
                version: pair.version(),
                base: pair.version(),
                deltas: Vec::new(),
            };
            self.switch(&marker, new_chain)?;

            for old in chain.pairs() {
                if (old.version(), old.kind()) != folded_id {
                    old.remove()?;
                }
            }
            self.stats.lock().compactions += 1;
            info!(
                domain = %self.domain,
                partition = self.partition,
                version = pair.version(),
                folded = ?summary.folded,
                records_in = summary.records_in,
                records_out = summary.records_out,
                "compacted delta chain"
            );
            Ok(Some(FoldSummary { pair, ..summary }))
        })
    }

    /// Takes the cycle lock and keeps state and statistics around `cycle`.
    fn run_cycle<T>(
        &self,
        cycle: impl FnOnce() -> Result<T, UpdateError>,
    ) -> Result<T, UpdateError> {
        let _guard = self.cycle.try_lock().ok_or(UpdateError::UpdateInProgress)?;
        self.stats.lock().cycles_started += 1;
        let started = Instant::now();

        let result = cycle();

        let elapsed = started.elapsed();
        let mut stats = self.stats.lock();
        stats.last_cycle = Some(elapsed);
        match &result {
            Ok(_) => {
                stats.cycles_succeeded += 1;
                drop(stats);
                self.set_state(UpdaterState::Idle);
            }
            Err(e) => {
                stats.cycles_failed += 1;
                stats.last_error = Some(e.to_string());
                drop(stats);
                self.set_state(UpdaterState::Failed);
                warn!(
                    domain = %self.domain,
                    partition = self.partition,
                    error = %e,
                    serving = ?self.active.version(),
                    "update cycle failed"
                );
            }
        }
        result
    }

    fn update_cycle(&self, target: u32) -> Result<UpdateOutcome, UpdateError> {
        info!(domain = %self.domain, partition = self.partition, target, "update cycle started");

        self.set_state(UpdaterState::Detecting);
        let local = self.detect()?;

        self.set_state(UpdaterState::Planning);
        let catalog = self
            .catalog
            .versions()
            .map_err(|source| UpdateError::NetworkFetch {
                what: "version catalog".to_string(),
                source,
            })?;
        let plan = IncrementalUpdatePlan::plan(&local.cached, target, &catalog)?;
        let missing = plan.missing(&local.cached);
        info!(
            target,
            base = plan.base().number,
            deltas = plan.deltas().len(),
            missing = missing.len(),
            "planned update"
        );

        self.set_state(UpdaterState::Fetching);
        let bytes_fetched = self.fetch(&missing)?;

        self.set_state(UpdaterState::Applying);
        let chain_ids = plan.pairs();
        let marker = ActiveMarker::from_plan(&plan);
        let previous = self.active.version();
        // A served chain is reused only when none of its pairs was refetched.
        let serving_plan = missing.is_empty()
            && self.active.current().map_or(false, |c| {
                c.pairs()
                    .iter()
                    .map(|p| (p.version(), p.kind()))
                    .eq(chain_ids.iter().copied())
            });

        if serving_plan {
            debug!(version = marker.version, "requested chain already served");
            if local.active.as_ref() != Some(&marker) {
                marker.save(&self.dir)?;
            }
        } else {
            let chain = self.open_chain(&chain_ids)?;
            self.set_state(UpdaterState::Switching);
            self.switch(&marker, chain)?;
        }

        let keep = plan.all_versions();
        let mut removed = Vec::new();
        for &(version, kind) in local.cached.difference(&keep) {
            PartitionFilePair::new(&self.dir, version, kind).remove()?;
            removed.push((version, kind));
        }
        if !removed.is_empty() {
            debug!(removed = ?removed, "removed unused pairs");
        }

        Ok(UpdateOutcome {
            previous,
            version: marker.version,
            chain: chain_ids,
            fetched: missing,
            bytes_fetched,
            discarded: local.discarded,
            removed,
            switched: !serving_plan,
        })
    }

    fn detect(&self) -> Result<local::LocalState, UpdateError> {
        let local = local::detect(
            &self.dir,
            &self.config.updater.scratch_dir_name,
            self.config.updater.verify_checksums,
        )?;
        if !local.discarded.is_empty() {
            self.stats.lock().pairs_discarded += local.discarded.len() as u64;
        }
        debug!(
            cached = local.cached.len(),
            discarded = local.discarded.len(),
            active = ?local.active.as_ref().map(|m| m.version),
            "detected local state"
        );
        Ok(local)
    }

    /// Copies each missing pair into scratch, verifies it and publishes it
    /// into the partition directory. Returns the bytes copied.
    fn fetch(&self, missing: &[PairId]) -> Result<u64, UpdateError> {
        if missing.is_empty() {
            return Ok(0);
        }
        let scratch = self.scratch_dir()?;
        let mut total = 0u64;
        for &(version, kind) in missing {
            let staged = PartitionFilePair::new(&scratch, version, kind);
            let remote_index = self.remote_dir.join(file_name(version, kind, FileExt::Index));
            let published = self
                .remote
                .exists(&remote_index)
                .map_err(|source| fetch_error(&remote_index, source))?;
            if !published {
                return Err(fetch_error(
                    &remote_index,
                    io::Error::new(io::ErrorKind::NotFound, "pair is not published"),
                ));
            }

            let mut bytes = 0u64;
            for ext in [FileExt::Log, FileExt::Index] {
                let remote = self.remote_dir.join(file_name(version, kind, ext));
                bytes += self
                    .remote
                    .copy_to_local(&remote, &staged.path(ext))
                    .map_err(|source| fetch_error(&remote, source))?;
            }

            {
                let reader = PartitionReader::open(&staged)?;
                reader.verify()?;
                if reader.hasher().hash_size() != self.key_hash_size {
                    return Err(UpdateError::Corrupt(format!(
                        "{}: hash size {} does not match domain's {}",
                        staged,
                        reader.hasher().hash_size(),
                        self.key_hash_size
                    )));
                }
            }
            staged.publish_to(&self.dir)?;

            total += bytes;
            let mut stats = self.stats.lock();
            stats.versions_fetched += 1;
            stats.bytes_fetched += bytes;
            drop(stats);
            info!(pair = %staged, bytes, "fetched pair");
        }
        let _ = fs::remove_dir(&scratch);
        Ok(total)
    }

    /// Opens `ids` (base first) from the partition directory.
    fn open_chain(&self, ids: &[PairId]) -> Result<ChainedReader, UpdateError> {
        let max_probes = self.config.store.max_probes;
        let open = |&(version, kind): &PairId| {
            PartitionReader::open_with(&PartitionFilePair::new(&self.dir, version, kind), max_probes)
        };
        let (base, deltas) = ids.split_first().ok_or_else(|| {
            UpdateError::Io(io::Error::new(io::ErrorKind::InvalidInput, "empty chain"))
        })?;
        let base = open(base)?;
        if base.hasher().hash_size() != self.key_hash_size {
            return Err(UpdateError::Corrupt(format!(
                "{}: hash size {} does not match domain's {}",
                base.pair(),
                base.hasher().hash_size(),
                self.key_hash_size
            )));
        }
        let deltas = deltas.iter().map(open).collect::<Result<Vec<_>, _>>()?;
        Ok(ChainedReader::new(base, deltas)?)
    }

    /// Persists `marker`, then makes `chain` visible to queries.
    fn switch(&self, marker: &ActiveMarker, chain: ChainedReader) -> Result<(), UpdateError> {
        marker.save(&self.dir)?;
        let previous = self.active.swap(Arc::new(chain));
        info!(
            domain = %self.domain,
            partition = self.partition,
            from = ?previous.map(|c| c.version_number()),
            to = marker.version,
            deltas = marker.deltas.len(),
            "switched active version"
        );
        Ok(())
    }

    fn set_state(&self, state: UpdaterState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(partition = self.partition, from = %*current, to = %state, "updater state");
            *current = state;
        }
    }

    /// A fresh, empty scratch directory.
    fn scratch_dir(&self) -> io::Result<PathBuf> {
        let scratch = self.dir.join(&self.config.updater.scratch_dir_name);
        if scratch.exists() {
            fs::remove_dir_all(&scratch)?;
        }
        fs::create_dir_all(&scratch)?;
        Ok(scratch)
    }

    /// Pairs of the served chain.
    #[must_use]
    pub fn active_pairs(&self) -> BTreeSet<PairId> {
        self.active
            .current()
            .map(|c| c.pairs().iter().map(|p| (p.version(), p.kind())).collect())
            .unwrap_or_default()
    }
}

fn fetch_error(remote: &Path, source: io::Error) -> UpdateError {
    UpdateError::NetworkFetch {
        what: remote.display().to_string(),
        source,
    }
}
