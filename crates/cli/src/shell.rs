//! Command execution for the interactive shell.
//!
//! The shell plays both sides of a DeltaKV deployment: it publishes versions
//! of a domain into the remote root and serves them from the local root
//! through one [`PartitionUpdater`] per partition.

use anyhow::{bail, Context, Result};
use config::Config;
use partition::{Domain, FileKind, PartitionDeleter, PartitionWriter, ReadBuffer, Reader};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use updater::{
    partition_dir, DirectoryCatalog, LocalRemoteFileOps, PartitionUpdater, VersionCatalog,
};

/// Where the shell keeps its data and which domain it serves.
#[derive(Debug, Clone)]
pub struct Settings {
    pub remote_root: PathBuf,
    pub local_root: PathBuf,
    pub domain: String,
    pub partitions: u32,
}

/// A change waiting for the next `PUBLISH`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Staged {
    Put(Vec<u8>),
    Delete,
    Absent,
}

/// What the REPL should do after a command.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Exit,
}

pub struct Shell {
    settings: Settings,
    domain: Domain,
    config: Config,
    catalog: Arc<DirectoryCatalog>,
    updaters: Vec<PartitionUpdater>,
    staged: BTreeMap<Vec<u8>, Staged>,
    buf: ReadBuffer,
}

impl Shell {
    /// Builds the updaters and restores whatever each partition served
    /// before the last shutdown.
    pub fn open(settings: Settings, config: Config) -> Result<Self> {
        let domain = Domain::new(
            settings.domain.clone(),
            settings.partitions,
            config.store.key_hash_size,
        )
        .context("invalid domain settings")?;
        let catalog = Arc::new(DirectoryCatalog::new(&settings.remote_root, domain.name()));
        let remote = Arc::new(LocalRemoteFileOps::new(&settings.remote_root));

        let updaters: Vec<PartitionUpdater> = (0..domain.num_partitions())
            .map(|p| {
                PartitionUpdater::new(
                    &domain,
                    p,
                    &settings.local_root,
                    remote.clone(),
                    catalog.clone(),
                    config.clone(),
                )
            })
            .collect();
        for u in &updaters {
            if let Err(e) = u.restore() {
                warn!(partition = u.partition(), error = %e, "could not restore active version");
            }
        }

        Ok(Self {
            settings,
            domain,
            config,
            catalog,
            updaters,
            staged: BTreeMap::new(),
            buf: ReadBuffer::new(),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Versions served by each partition, `None` where nothing is served.
    #[must_use]
    pub fn serving(&self) -> Vec<Option<u32>> {
        self.updaters.iter().map(|u| u.active().version()).collect()
    }

    /// Runs one input line. `None` for a blank line.
    pub fn execute(&mut self, line: &str) -> Result<Option<Reply>> {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Ok(None);
        };
        let text = match cmd.to_uppercase().as_str() {
            "PUT" => {
                let (Some(key), value) = (parts.next(), parts.collect::<Vec<_>>().join(" ")) else {
                    bail!("usage: PUT key value");
                };
                self.stage(key, Staged::Put(value.into_bytes()))
            }
            "DEL" => match parts.next() {
                Some(key) => self.stage(key, Staged::Delete),
                None => bail!("usage: DEL key"),
            },
            "ABSENT" => match parts.next() {
                Some(key) => self.stage(key, Staged::Absent),
                None => bail!("usage: ABSENT key"),
            },
            "PUBLISH" => {
                let kind = match parts.next() {
                    None => None,
                    Some(k) => Some(
                        k.to_lowercase()
                            .parse::<FileKind>()
                            .map_err(anyhow::Error::msg)
                            .context("usage: PUBLISH [base|delta]")?,
                    ),
                };
                self.publish(kind)?
            }
            "VERSIONS" => self.versions()?,
            "UPDATE" => {
                let target = match parts.next() {
                    None => None,
                    Some(n) => Some(
                        n.trim_start_matches(['v', 'V'])
                            .parse::<u32>()
                            .with_context(|| format!("bad version '{}'", n))?,
                    ),
                };
                self.update(target)?
            }
            "GET" => match parts.next() {
                Some(key) => self.get(key)?,
                None => bail!("usage: GET key"),
            },
            "COMPACT" => self.compact()?,
            "STATS" => self.stats(),
            "DROP" => self.drop_local()?,
            "EXIT" | "QUIT" => return Ok(Some(Reply::Exit)),
            other => bail!("unknown command: {}", other),
        };
        Ok(Some(Reply::Text(text)))
    }

    fn stage(&mut self, key: &str, change: Staged) -> String {
        self.staged.insert(key.as_bytes().to_vec(), change);
        format!("OK ({} staged)", self.staged.len())
    }

    /// Writes the staged changes as the next version of the domain, one pair
    /// per partition.
    fn publish(&mut self, kind: Option<FileKind>) -> Result<String> {
        let latest = self.catalog.latest().context("reading version catalog")?;
        let kind = kind.unwrap_or(match latest {
            Some(_) => FileKind::Delta,
            None => FileKind::Base,
        });
        if kind == FileKind::Base {
            if self.staged.values().any(|s| *s == Staged::Absent) {
                bail!("a base cannot carry ABSENT markers");
            }
            if self.staged.values().any(|s| *s == Staged::Delete) {
                bail!("a base cannot carry deletes");
            }
        } else if latest.is_none() {
            bail!("publish a base before any delta");
        }
        let version = latest.map_or(1, |v| v.number + 1);

        let hasher = self.domain.hasher();
        let mut by_partition: Vec<Vec<(&Vec<u8>, &Staged)>> =
            (0..self.domain.num_partitions()).map(|_| Vec::new()).collect();
        for (key, change) in &self.staged {
            by_partition[self.domain.partition_for(key) as usize].push((key, change));
        }

        let mut records = 0u64;
        for (p, mut changes) in by_partition.into_iter().enumerate() {
            changes.sort_by(|a, b| {
                hasher.hash(a.0)[..]
                    .cmp(&hasher.hash(b.0)[..])
                    .then_with(|| a.0.cmp(b.0))
            });
            let dir = self
                .settings
                .remote_root
                .join(partition_dir(self.domain.name(), p as u32));
            let mut w = PartitionWriter::create(&dir, version, kind, &self.config.store)
                .with_context(|| format!("creating partition {} of v{}", p, version))?;
            for (key, change) in changes {
                match change {
                    Staged::Put(value) => w.write(key, value)?,
                    Staged::Delete => w.delete(key)?,
                    Staged::Absent => w.mark_absent(key)?,
                }
            }
            records += w.num_records_written();
            w.close()
                .with_context(|| format!("publishing partition {} of v{}", p, version))?;
        }

        info!(version, kind = %kind, records, "published version");
        self.staged.clear();
        Ok(format!(
            "published v{} ({}, {} records across {} partitions)",
            version,
            kind,
            records,
            self.domain.num_partitions()
        ))
    }

    fn versions(&self) -> Result<String> {
        let versions = self.catalog.versions().context("reading version catalog")?;
        let mut out = String::new();
        for v in &versions {
            let _ = writeln!(out, "{}", v);
        }
        let serving: Vec<String> = self
            .serving()
            .iter()
            .enumerate()
            .map(|(p, v)| match v {
                Some(v) => format!("{}=v{}", p, v),
                None => format!("{}=-", p),
            })
            .collect();
        let _ = write!(
            out,
            "({} versions, serving {})",
            versions.len(),
            serving.join(" ")
        );
        Ok(out)
    }

    fn update(&self, target: Option<u32>) -> Result<String> {
        let mut lines = Vec::with_capacity(self.updaters.len());
        for u in &self.updaters {
            let outcome = match target {
                Some(t) => u.run_update(t),
                None => u.run_update_to_latest(),
            }
            .with_context(|| format!("partition {}", u.partition()))?;
            let line = if outcome.switched {
                format!(
                    "partition {}: v{} (fetched {} pairs, {} bytes)",
                    u.partition(),
                    outcome.version,
                    outcome.fetched.len(),
                    outcome.bytes_fetched
                )
            } else {
                format!("partition {}: v{} (unchanged)", u.partition(), outcome.version)
            };
            lines.push(line);
            if u.needs_compaction() {
                lines.push(format!("partition {}: compaction recommended", u.partition()));
            }
        }
        Ok(lines.join("\n"))
    }

    fn get(&mut self, key: &str) -> Result<String> {
        let p = self.domain.partition_for(key.as_bytes()) as usize;
        let value = self.updaters[p]
            .active()
            .get(key.as_bytes(), &mut self.buf)
            .with_context(|| format!("reading partition {}", p))?;
        Ok(match value {
            Some(v) => String::from_utf8_lossy(&v).into_owned(),
            None => "(nil)".to_string(),
        })
    }

    fn compact(&self) -> Result<String> {
        let mut lines = Vec::with_capacity(self.updaters.len());
        for u in &self.updaters {
            let summary = u
                .compact()
                .with_context(|| format!("partition {}", u.partition()))?;
            lines.push(match summary {
                Some(s) => format!(
                    "partition {}: folded {:?} into base v{} ({} -> {} records)",
                    u.partition(),
                    s.folded,
                    s.pair.version(),
                    s.records_in,
                    s.records_out
                ),
                None => format!("partition {}: nothing to compact", u.partition()),
            });
        }
        Ok(lines.join("\n"))
    }

    fn stats(&self) -> String {
        let mut out = format!(
            "domain={} partitions={} staged={}",
            self.domain.name(),
            self.domain.num_partitions(),
            self.staged.len()
        );
        for u in &self.updaters {
            let s = u.statistics();
            let chain = u.active().current();
            let _ = write!(
                out,
                "\npartition {}: state={} version={} deltas={} cycles={}/{}/{} fetched={} ({} bytes) compactions={} discarded={} collision_overflows={}",
                u.partition(),
                u.state(),
                chain
                    .as_ref()
                    .map_or("-".to_string(), |c| format!("v{}", c.version_number())),
                chain.as_ref().map_or(0, |c| c.deltas().len()),
                s.cycles_started,
                s.cycles_succeeded,
                s.cycles_failed,
                s.versions_fetched,
                s.bytes_fetched,
                s.compactions,
                s.pairs_discarded,
                chain.as_ref().map_or(0, |c| c.collision_overflows()),
            );
            if let Some(d) = s.last_cycle {
                let _ = write!(out, " last_cycle={:?}", d);
            }
            if let Some(e) = &s.last_error {
                let _ = write!(out, " last_error=\"{}\"", e);
            }
        }
        out
    }

    /// Stops serving and deletes every local partition directory.
    fn drop_local(&self) -> Result<String> {
        let mut dropped = 0;
        for u in &self.updaters {
            u.active().clear();
            if PartitionDeleter::new(u.dir())
                .delete()
                .with_context(|| format!("deleting partition {}", u.partition()))?
            {
                dropped += 1;
            }
        }
        Ok(format!("OK (dropped {} partitions)", dropped))
    }
}
