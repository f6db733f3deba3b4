//! Domain model: domains, versions, partitioning and key hashing.

use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::layout::FileKind;
use crate::PartitionError;

/// Largest truncated hash a domain may use (a full SHA-256 digest).
pub const MAX_HASH_SIZE: usize = 32;

/// Maps a key to one of a domain's partitions.
pub trait Partitioner: Send + Sync {
    fn partition(&self, key: &[u8], num_partitions: u32) -> u32;
}

/// FNV-1a 64 of the key, modulo the partition count.
#[derive(Debug, Clone, Copy, Default)]
pub struct FnvPartitioner;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl Partitioner for FnvPartitioner {
    fn partition(&self, key: &[u8], num_partitions: u32) -> u32 {
        (fnv1a_64(key) % u64::from(num_partitions.max(1))) as u32
    }
}

/// A truncated SHA-256 of a key. Dereferences to the hash bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct KeyHash {
    bytes: [u8; MAX_HASH_SIZE],
    len: usize,
}

impl Deref for KeyHash {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash({})", keyindex::hex(self))
    }
}

/// Computes the fixed-size key hash a domain indexes by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyHasher {
    hash_size: usize,
}

impl KeyHasher {
    pub fn new(hash_size: usize) -> Result<Self, PartitionError> {
        if hash_size == 0 || hash_size > MAX_HASH_SIZE {
            return Err(PartitionError::InvalidDomain(format!(
                "key hash size {} not in 1..={}",
                hash_size, MAX_HASH_SIZE
            )));
        }
        Ok(Self { hash_size })
    }

    #[must_use]
    pub fn hash_size(&self) -> usize {
        self.hash_size
    }

    #[must_use]
    pub fn hash(&self, key: &[u8]) -> KeyHash {
        let digest = Sha256::digest(key);
        let mut bytes = [0u8; MAX_HASH_SIZE];
        bytes.copy_from_slice(&digest);
        KeyHash {
            bytes,
            len: self.hash_size,
        }
    }
}

/// A logical keyspace split into a fixed number of partitions.
#[derive(Clone)]
pub struct Domain {
    name: String,
    num_partitions: u32,
    hasher: KeyHasher,
    partitioner: Arc<dyn Partitioner>,
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.name)
            .field("num_partitions", &self.num_partitions)
            .field("key_hash_size", &self.hasher.hash_size())
            .finish()
    }
}

impl Domain {
    /// Creates a domain partitioned with [`FnvPartitioner`].
    pub fn new(
        name: impl Into<String>,
        num_partitions: u32,
        key_hash_size: usize,
    ) -> Result<Self, PartitionError> {
        let name = name.into();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(PartitionError::InvalidDomain(format!("bad domain name '{}'", name)));
        }
        if num_partitions == 0 {
            return Err(PartitionError::InvalidDomain(
                "a domain needs at least one partition".to_string(),
            ));
        }
        Ok(Self {
            name,
            num_partitions,
            hasher: KeyHasher::new(key_hash_size)?,
            partitioner: Arc::new(FnvPartitioner),
        })
    }

    #[must_use]
    pub fn with_partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    #[must_use]
    pub fn key_hash_size(&self) -> usize {
        self.hasher.hash_size()
    }

    #[must_use]
    pub fn hasher(&self) -> KeyHasher {
        self.hasher
    }

    /// The partition `key` belongs to.
    #[must_use]
    pub fn partition_for(&self, key: &[u8]) -> u32 {
        self.partitioner.partition(key, self.num_partitions)
    }
}

/// One published version of a domain. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainVersion {
    pub number: u32,
    pub created_at_ms: u64,
    pub is_delta: bool,
    /// The base a delta extends; `None` for a base.
    pub parent_base: Option<u32>,
}

impl DomainVersion {
    #[must_use]
    pub fn base(number: u32) -> Self {
        Self {
            number,
            created_at_ms: 0,
            is_delta: false,
            parent_base: None,
        }
    }

    #[must_use]
    pub fn delta(number: u32, parent_base: u32) -> Self {
        Self {
            number,
            created_at_ms: 0,
            is_delta: true,
            parent_base: Some(parent_base),
        }
    }

    #[must_use]
    pub fn created_at(mut self, created_at_ms: u64) -> Self {
        self.created_at_ms = created_at_ms;
        self
    }

    #[must_use]
    pub fn kind(&self) -> FileKind {
        if self.is_delta {
            FileKind::Delta
        } else {
            FileKind::Base
        }
    }

    /// The base this version's lineage starts from (itself for a base).
    #[must_use]
    pub fn lineage_base(&self) -> u32 {
        self.parent_base.unwrap_or(self.number)
    }
}

impl fmt::Display for DomainVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parent_base {
            Some(b) if self.is_delta => write!(f, "v{} (delta of v{})", self.number, b),
            _ => write!(f, "v{} (base)", self.number),
        }
    }
}
