//! # Updater - Incremental Partition Updates
//!
//! Moves one partition of a domain from whatever version it serves to a
//! target version, fetching only the pairs that are not already on disk.
//!
//! ## Update cycle
//!
//! ```text
//! Idle ─► Detecting ─► Planning ─► Fetching ─► Applying ─► Switching ─► Idle
//!             │            │           │           │            │
//!             └────────────┴───────────┴───────────┴────────────┴──► Failed
//! ```
//!
//! 1. **Detect**: read `ACTIVE`, list complete pairs, discard corrupt ones.
//! 2. **Plan**: [`IncrementalUpdatePlan::plan`] picks a base and deltas.
//! 3. **Fetch**: copy missing pairs into `.scratch/`, verify, publish.
//! 4. **Apply**: open a [`ChainedReader`](partition::ChainedReader).
//! 5. **Switch**: rewrite `ACTIVE`, then swap the [`ActiveVersion`] slot.
//! 6. **Clean up**: delete pairs the new chain does not use.
//!
//! Nothing a query can observe changes before step 5, so a failure at any
//! earlier step leaves the last good version serving.
//!
//! ## Module Responsibilities
//!
//! | Module      | Purpose                                               |
//! |-------------|-------------------------------------------------------|
//! | [`plan`]    | Version catalogs and `IncrementalUpdatePlan`          |
//! | [`remote`]  | `RemoteFileOps` transport and `LocalRemoteFileOps`    |
//! | [`local`]   | `ACTIVE` marker and detection of cached pairs         |
//! | [`active`]  | `ActiveVersion`: the lock-swapped serving slot        |
//! | [`updater`] | `PartitionUpdater`: the cycle, compaction, statistics |

pub mod active;
pub mod local;
pub mod plan;
pub mod remote;
pub mod updater;

use partition::PartitionError;
use std::io;
use thiserror::Error;

pub use active::ActiveVersion;
pub use local::{ActiveMarker, LocalState, ACTIVE_FILENAME};
pub use plan::{
    DirectoryCatalog, IncrementalUpdatePlan, PairId, PlanError, StaticCatalog, VersionCatalog,
};
pub use remote::{partition_dir, LocalRemoteFileOps, RemoteFileOps};
pub use updater::{PartitionUpdater, UpdateOutcome, UpdaterState, UpdaterStatistics};

/// Errors that end an update or compaction cycle.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Remote storage could not be reached or a copy failed.
    #[error("fetch of {what} failed: {source}")]
    NetworkFetch {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    PlanUnsatisfiable(#[from] PlanError),

    /// A fetched or cached file failed verification.
    #[error("corrupt partition file: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Another cycle holds this partition.
    #[error("an update is already in progress for this partition")]
    UpdateInProgress,

    #[error("delta {next} cannot follow version {previous}")]
    OutOfOrderDelta { previous: u32, next: u32 },

    #[error(transparent)]
    Partition(PartitionError),
}

impl UpdateError {
    /// True for failures worth retrying on the next scheduled cycle without
    /// any change to the inputs.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpdateError::NetworkFetch { .. } | UpdateError::UpdateInProgress
        )
    }
}

impl From<PartitionError> for UpdateError {
    fn from(e: PartitionError) -> Self {
        if e.is_corrupt() {
            return UpdateError::Corrupt(e.to_string());
        }
        match e {
            PartitionError::OutOfOrderDelta { previous, next } => {
                UpdateError::OutOfOrderDelta { previous, next }
            }
            PartitionError::Io(io) => UpdateError::Io(io),
            other => UpdateError::Partition(other),
        }
    }
}

#[cfg(test)]
mod tests;
