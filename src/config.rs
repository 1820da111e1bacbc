//! Engine configuration.
//!
//! Loaded from a TOML file with `[sync]`, `[eviction]`, `[vfs]` and
//! `[lock]` sections. Every key has a default, so an empty file is a
//! valid configuration. Unknown keys are rejected.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::conflict::ConflictStrategy;
use crate::error::{classify_io, Error, Result};
use crate::hasher::HashAlgorithm;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Directory holding the catalog snapshot, sync-state files and the
    /// activity log.
    pub state_dir: Option<PathBuf>,
    pub sync: SyncConfig,
    pub eviction: EvictionConfig,
    pub vfs: VfsConfig,
    pub lock: LockConfig,
}

impl Config {
    /// Parse a TOML configuration file.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| classify_io(path, e))?;
        toml::from_str(&raw).map_err(|e| Error::Corrupt(format!("{}: {e}", path.display())))
    }

    /// The directory for persistent engine state, defaulting next to the
    /// current working directory.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".overlay-mamont"))
    }
}

/// `[sync]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default, rename_all = "snake_case")]
pub struct SyncConfig {
    /// Compute checksums during sync.
    pub enable_checksum: bool,
    pub checksum_algorithm: HashAlgorithm,
    /// Re-hash source and destination after each copy.
    pub verify_after_copy: bool,
    pub conflict_strategy: ConflictStrategy,
    /// Mirror deletions from source to destination.
    pub enable_delete: bool,
    /// Seconds a burst of writes is coalesced before one sync fires.
    pub debounce_interval: u64,
    /// Seconds between automatic syncs of an idle pair.
    pub auto_interval: u64,
    /// Hash worker parallelism.
    pub parallel_ops: usize,
    /// Bytes per copy chunk.
    pub buffer_size: usize,
    pub exclude_patterns: Vec<String>,
    /// Optional cap; larger files are skipped with a structured reason.
    pub max_file_size: Option<u64>,
    /// Completed actions between durable state checkpoints.
    pub checkpoint_interval: usize,
    /// Seconds of mtime drift still treated as "same file".
    pub time_tolerance: f64,
    /// Pair a copy and a delete sharing a checksum into a rename.
    pub detect_moves: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enable_checksum: true,
            checksum_algorithm: HashAlgorithm::Md5,
            verify_after_copy: true,
            conflict_strategy: ConflictStrategy::LocalWinsWithBackup,
            enable_delete: true,
            debounce_interval: 5,
            auto_interval: 3600,
            parallel_ops: 4,
            buffer_size: 1_048_576,
            exclude_patterns: Vec::new(),
            max_file_size: None,
            checkpoint_interval: 50,
            time_tolerance: 1.0,
            detect_moves: false,
        }
    }
}

/// `[eviction]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default, rename_all = "snake_case")]
pub struct EvictionConfig {
    pub enabled: bool,
    /// Local bytes used that trigger an eviction pass.
    pub threshold: u64,
    /// Used-bytes level a pass shrinks the local store to.
    pub target_free: u64,
    /// Seconds between periodic checks.
    pub check_interval: u64,
    /// Seconds since last access before an entry becomes a candidate.
    pub min_age: u64,
    /// Candidates examined per pass.
    pub batch_size: usize,
    /// Re-hash the external copy before removing the local one.
    pub verify_before_delete: bool,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 10 * 1024 * 1024 * 1024,
            target_free: 5 * 1024 * 1024 * 1024,
            check_interval: 600,
            min_age: 3600,
            batch_size: 100,
            verify_before_delete: true,
        }
    }
}

/// `[vfs]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default, rename_all = "snake_case")]
pub struct VfsConfig {
    /// Automatic remounts after an unexpected FUSE exit.
    pub recovery_max_attempts: u32,
    /// Seconds between remount attempts.
    pub recovery_cooldown: u64,
    /// Seconds allowed for the external probe and the mount call.
    pub mount_timeout: u64,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            recovery_max_attempts: 3,
            recovery_cooldown: 3,
            mount_timeout: 30,
        }
    }
}

/// `[lock]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default, rename_all = "snake_case")]
pub struct LockConfig {
    /// Seconds a lock may be held before the watchdog reclaims it.
    pub watchdog_ttl: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { watchdog_ttl: 300 }
    }
}
