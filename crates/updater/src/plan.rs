//! Incremental update planning.
//!
//! Given the pairs cached locally, the target version and the catalog of
//! published versions, [`IncrementalUpdatePlan::plan`] picks the base and
//! the ordered deltas that reconstruct the target with the fewest fetches.
//!
//! For a delta target of base `B` the lineage is every catalog delta `d`
//! with `B < d <= target` whose parent is `B`. Any cached base inside that
//! range (`B` itself, or a base folded locally and numbered after a lineage
//! delta) can start the chain; the newest one wins because it leaves the
//! fewest deltas to apply.

use partition::layout::parse_file_name;
use partition::{DomainVersion, FileKind, PartitionFilePair};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

/// `(version, kind)` of a pair.
pub type PairId = (u32, FileKind);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("target v{target} is unreachable: {reason}")]
    Unsatisfiable { target: u32, reason: String },
}

/// Source of truth for which versions of a domain exist.
pub trait VersionCatalog: Send + Sync {
    fn versions(&self) -> io::Result<Vec<DomainVersion>>;

    fn version(&self, number: u32) -> io::Result<Option<DomainVersion>> {
        Ok(self.versions()?.into_iter().find(|v| v.number == number))
    }

    /// The newest published version, if any.
    fn latest(&self) -> io::Result<Option<DomainVersion>> {
        Ok(self.versions()?.into_iter().max_by_key(|v| v.number))
    }
}

/// A fixed, in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    versions: Vec<DomainVersion>,
}

impl StaticCatalog {
    pub fn new(versions: impl IntoIterator<Item = DomainVersion>) -> Self {
        let mut versions: Vec<_> = versions.into_iter().collect();
        versions.sort_by_key(|v| v.number);
        Self { versions }
    }
}

impl VersionCatalog for StaticCatalog {
    fn versions(&self) -> io::Result<Vec<DomainVersion>> {
        Ok(self.versions.clone())
    }
}

/// Infers a domain's versions from the pair files under
/// `<root>/<domain>/<partition>/`.
///
/// Only complete pairs count. A delta's parent is taken to be the newest
/// base published before it. When partitions disagree on a number's kind,
/// the base wins.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    domain_dir: PathBuf,
}

impl DirectoryCatalog {
    pub fn new<P: AsRef<Path>>(root: P, domain: &str) -> Self {
        Self {
            domain_dir: root.as_ref().join(domain),
        }
    }
}

impl VersionCatalog for DirectoryCatalog {
    fn versions(&self) -> io::Result<Vec<DomainVersion>> {
        let mut found: BTreeMap<u32, (FileKind, u64)> = BTreeMap::new();
        let partitions = match fs::read_dir(&self.domain_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        for partition in partitions {
            let partition = partition?;
            if !partition.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(partition.path())? {
                let entry = entry?;
                let name = entry.file_name();
                let Some((number, kind, _)) = parse_file_name(&name.to_string_lossy()) else {
                    continue;
                };
                let pair = PartitionFilePair::new(partition.path(), number, kind);
                if !pair.is_complete() {
                    continue;
                }
                let created = fs::metadata(pair.index_path())?
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                let slot = found.entry(number).or_insert((kind, created));
                if kind == FileKind::Base {
                    slot.0 = FileKind::Base;
                }
            }
        }

        let mut versions = Vec::with_capacity(found.len());
        let mut last_base = None;
        for (number, (kind, created)) in found {
            let version = match (kind, last_base) {
                (FileKind::Base, _) => {
                    last_base = Some(number);
                    DomainVersion::base(number)
                }
                (FileKind::Delta, Some(base)) => DomainVersion::delta(number, base),
                // A delta with no base before it cannot be applied to anything.
                (FileKind::Delta, None) => continue,
            };
            versions.push(version.created_at(created));
        }
        Ok(versions)
    }
}

/// A base and the deltas to layer on it, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalUpdatePlan {
    base: DomainVersion,
    deltas: Vec<DomainVersion>,
}

impl IncrementalUpdatePlan {
    /// Computes the plan that reaches `target` from the `cached` pairs.
    ///
    /// Deterministic for identical inputs.
    ///
    /// # Errors
    ///
    /// [`PlanError::Unsatisfiable`] when the catalog does not know the target,
    /// or knows neither the base its lineage starts from nor any cached
    /// folded base inside that lineage.
    pub fn plan(
        cached: &BTreeSet<PairId>,
        target: u32,
        catalog: &[DomainVersion],
    ) -> Result<Self, PlanError> {
        let unsatisfiable = |reason: String| PlanError::Unsatisfiable { target, reason };

        let target_version = catalog
            .iter()
            .find(|v| v.number == target)
            .copied()
            .ok_or_else(|| unsatisfiable("not in the catalog".to_string()))?;

        let base_number = match target_version.parent_base {
            Some(b) if target_version.is_delta => b,
            _ => {
                return Ok(Self {
                    base: target_version,
                    deltas: Vec::new(),
                })
            }
        };

        if base_number >= target {
            return Err(unsatisfiable(format!(
                "base v{} is not older than the target",
                base_number
            )));
        }

        let mut lineage: Vec<DomainVersion> = catalog
            .iter()
            .filter(|v| {
                v.is_delta
                    && v.parent_base == Some(base_number)
                    && v.number > base_number
                    && v.number <= target
            })
            .copied()
            .collect();
        lineage.sort_by_key(|v| v.number);
        lineage.dedup_by_key(|v| v.number);

        // A locally folded base numbered after a lineage delta can start the
        // chain even once the lineage base is gone from the catalog.
        let folded = lineage
            .iter()
            .rev()
            .find(|d| cached.contains(&(d.number, FileKind::Base)))
            .map(|d| DomainVersion {
                is_delta: false,
                parent_base: None,
                ..*d
            });
        let start = match folded {
            Some(f) => f,
            None => catalog
                .iter()
                .find(|v| v.number == base_number && !v.is_delta)
                .copied()
                .or_else(|| {
                    cached
                        .contains(&(base_number, FileKind::Base))
                        .then(|| DomainVersion::base(base_number))
                })
                .ok_or_else(|| {
                    unsatisfiable(format!("base v{} is not in the catalog", base_number))
                })?,
        };

        let deltas = lineage
            .into_iter()
            .filter(|d| d.number > start.number)
            .collect();
        Ok(Self {
            base: start,
            deltas,
        })
    }

    #[must_use]
    pub fn base(&self) -> &DomainVersion {
        &self.base
    }

    #[must_use]
    pub fn deltas(&self) -> &[DomainVersion] {
        &self.deltas
    }

    /// The version the plan reaches.
    #[must_use]
    pub fn target(&self) -> u32 {
        self.deltas.last().unwrap_or(&self.base).number
    }

    /// Every pair the plan needs, base first, deltas in order.
    #[must_use]
    pub fn pairs(&self) -> Vec<PairId> {
        std::iter::once((self.base.number, FileKind::Base))
            .chain(self.deltas.iter().map(|d| (d.number, FileKind::Delta)))
            .collect()
    }

    /// Pairs the plan needs that are not cached, in application order.
    #[must_use]
    pub fn missing(&self, cached: &BTreeSet<PairId>) -> Vec<PairId> {
        self.pairs()
            .into_iter()
            .filter(|id| !cached.contains(id))
            .collect()
    }

    /// The set of pairs to keep once the plan is applied.
    #[must_use]
    pub fn all_versions(&self) -> BTreeSet<PairId> {
        self.pairs().into_iter().collect()
    }
}
