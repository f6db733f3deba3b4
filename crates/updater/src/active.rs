use parking_lot::RwLock;
use partition::{ChainedReader, PartitionError, ReadBuffer, Reader};
use std::sync::Arc;

/// The chain a partition is currently serving.
///
/// Queries clone the `Arc` out from under a read lock and use it without
/// holding the lock; a switch replaces it under the write lock. A query
/// therefore sees the old chain or the new one in full, never a mix, and
/// an old chain stays usable until its last query drops it.
#[derive(Debug, Default)]
pub struct ActiveVersion {
    slot: RwLock<Option<Arc<ChainedReader>>>,
}

impl ActiveVersion {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<ChainedReader>> {
        self.slot.read().clone()
    }

    /// Version number being served, if any.
    #[must_use]
    pub fn version(&self) -> Option<u32> {
        self.slot.read().as_ref().map(|c| c.version_number())
    }

    /// Installs `chain` and returns the previous one.
    pub fn swap(&self, chain: Arc<ChainedReader>) -> Option<Arc<ChainedReader>> {
        self.slot.write().replace(chain)
    }

    /// Stops serving. Returns the chain that was active.
    pub fn clear(&self) -> Option<Arc<ChainedReader>> {
        self.slot.write().take()
    }

    /// Looks `key` up in the current chain. `None` when nothing is served.
    pub fn get(&self, key: &[u8], buf: &mut ReadBuffer) -> Result<Option<Vec<u8>>, PartitionError> {
        match self.current() {
            Some(chain) => chain.get(key, buf),
            None => Ok(None),
        }
    }
}
