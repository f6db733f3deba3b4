//! # Config - DeltaKV Tunables
//!
//! Typed configuration shared by the writer, reader and updater crates.
//!
//! Everything has a sensible default; [`Config::from_env`] overrides
//! individual fields from `DELTAKV_*` environment variables:
//!
//! ```text
//! DELTAKV_BLOCK_KB       target uncompressed block size in KiB   (default: 64, max 65536)
//! DELTAKV_CODEC          none | deflate | gzip                   (default: deflate)
//! DELTAKV_LEVEL          compression level 0-9                   (default: 6)
//! DELTAKV_OFFSET_WIDTH   index offset width in bytes 1-8         (default: 5)
//! DELTAKV_MAX_PROBES     max same-hash slots probed per lookup   (default: 32)
//! DELTAKV_HASH_SIZE      truncated key-hash size in bytes 1-32   (default: 8)
//! DELTAKV_VERIFY         verify checksums of cached files        (default: true)
//! DELTAKV_COMPACT_AFTER  delta chain length that warrants a fold (default: 8, 0 = never)
//! ```

use codec::BlockCodec;
use std::collections::HashMap;
use thiserror::Error;

/// Largest supported truncated key hash, in bytes (a full SHA-256 digest).
pub const MAX_KEY_HASH_SIZE: usize = 32;

/// Largest record-log block the writer accepts, in bytes (64 MiB).
pub const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;

/// Largest supported index offset width, in bytes.
pub const MAX_OFFSET_WIDTH: u8 = 8;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed.
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: String, value: String },

    /// A parsed value is outside its allowed range.
    #[error("{field} out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

/// Settings that shape the on-disk files of a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Target uncompressed size of a record-log block.
    pub block_size: usize,
    /// Compression applied to each block.
    pub codec: BlockCodec,
    /// Compression level for the deflate-family codecs.
    pub level: u32,
    /// Width of each offset stored in the index, in bytes.
    pub offset_width: u8,
    /// Upper bound on same-hash slots inspected during a lookup.
    pub max_probes: usize,
    /// Size of the truncated key hash, fixed per domain.
    pub key_hash_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            codec: BlockCodec::Deflate,
            level: codec::DEFAULT_LEVEL,
            offset_width: 5,
            max_probes: 32,
            key_hash_size: 8,
        }
    }
}

/// Settings for the incremental partition updater.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterConfig {
    /// Re-check block checksums of every cached pair during detection.
    pub verify_checksums: bool,
    /// Chain length (number of deltas on top of the base) at which the
    /// updater reports that a fold is due. `0` disables the hint.
    pub compaction_delta_threshold: usize,
    /// Name of the scratch directory inside each partition directory.
    pub scratch_dir_name: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            compaction_delta_threshold: 8,
            scratch_dir_name: ".scratch".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub store: StoreConfig,
    pub updater: UpdaterConfig,
}

impl Config {
    /// Loads the configuration from `DELTAKV_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration from an explicit key/value map.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| map.get(key).cloned())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();

        if let Some(kb) = parse::<usize, _>(&lookup, "DELTAKV_BLOCK_KB")? {
            cfg.store.block_size = kb.checked_mul(1024).ok_or(ConfigError::OutOfRange {
                field: "block_size",
                reason: format!("{} KiB overflows", kb),
            })?;
        }
        if let Some(codec) = parse::<BlockCodec, _>(&lookup, "DELTAKV_CODEC")? {
            cfg.store.codec = codec;
        }
        if let Some(level) = parse(&lookup, "DELTAKV_LEVEL")? {
            cfg.store.level = level;
        }
        if let Some(width) = parse(&lookup, "DELTAKV_OFFSET_WIDTH")? {
            cfg.store.offset_width = width;
        }
        if let Some(probes) = parse(&lookup, "DELTAKV_MAX_PROBES")? {
            cfg.store.max_probes = probes;
        }
        if let Some(size) = parse(&lookup, "DELTAKV_HASH_SIZE")? {
            cfg.store.key_hash_size = size;
        }
        if let Some(verify) = parse(&lookup, "DELTAKV_VERIFY")? {
            cfg.updater.verify_checksums = verify;
        }
        if let Some(n) = parse(&lookup, "DELTAKV_COMPACT_AFTER")? {
            cfg.updater.compaction_delta_threshold = n;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks that every field is inside its supported range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()
    }
}

impl StoreConfig {
    /// Checks that every field is inside its supported range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(ConfigError::OutOfRange {
                field: "block_size",
                reason: format!("{} not in 1..={}", self.block_size, MAX_BLOCK_SIZE),
            });
        }
        if self.level > codec::MAX_LEVEL {
            return Err(ConfigError::OutOfRange {
                field: "level",
                reason: format!("{} exceeds {}", self.level, codec::MAX_LEVEL),
            });
        }
        if self.offset_width == 0 || self.offset_width > MAX_OFFSET_WIDTH {
            return Err(ConfigError::OutOfRange {
                field: "offset_width",
                reason: format!("{} not in 1..={}", self.offset_width, MAX_OFFSET_WIDTH),
            });
        }
        if self.max_probes == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_probes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.key_hash_size == 0 || self.key_hash_size > MAX_KEY_HASH_SIZE {
            return Err(ConfigError::OutOfRange {
                field: "key_hash_size",
                reason: format!("{} not in 1..={}", self.key_hash_size, MAX_KEY_HASH_SIZE),
            });
        }
        Ok(())
    }
}

/// Parses `key` from `lookup`, returning `Ok(None)` when it is unset.
fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
    }
}
