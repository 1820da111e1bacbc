//! Per-path advisory locks.
//!
//! Locks are keyed by `(sync_pair_id, virtual_path)` and carry a mode,
//! a holder identity for auditing, and an acquisition time for the
//! watchdog. `acquire` is a non-blocking compare-and-set; `release` is
//! idempotent. Sync engines hold their locks through [`SyncLockGuard`]
//! so every exit path releases them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::{SyncPairId, VirtualPath};

/// Direction of the sync a lock belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncDirection {
    LocalToExternal,
    ExternalToLocal,
}

/// Lock modes.
///
/// Compatibility: reads are compatible with everything. A sync lock
/// excludes writes on either side of the pair (the source must stay
/// stable while the destination is written) and any other sync on the
/// same path, regardless of direction. Writes exclude writes on the
/// same side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    ReadLocal,
    ReadExternal,
    WriteLocal,
    WriteExternal,
    Sync(SyncDirection),
}

impl LockMode {
    fn is_read(&self) -> bool {
        matches!(self, LockMode::ReadLocal | LockMode::ReadExternal)
    }

    fn compatible_with(&self, other: &LockMode) -> bool {
        if self.is_read() || other.is_read() {
            return true;
        }
        match (self, other) {
            (LockMode::Sync(_), _) | (_, LockMode::Sync(_)) => false,
            (LockMode::WriteLocal, LockMode::WriteLocal) => false,
            (LockMode::WriteExternal, LockMode::WriteExternal) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
struct LockRecord {
    mode: LockMode,
    holder: String,
    acquired_at: Instant,
}

type LockKey = (SyncPairId, VirtualPath);

#[derive(Default)]
pub struct LockTable {
    locks: DashMap<LockKey, Vec<LockRecord>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take a lock. Returns `false` when an incompatible lock is
    /// already held. A holder re-acquiring its own mode succeeds without
    /// stacking a second record.
    pub fn acquire(
        &self,
        pair: &SyncPairId,
        path: &VirtualPath,
        mode: LockMode,
        holder: &str,
    ) -> bool {
        let key = (pair.clone(), path.clone());
        let mut records = self.locks.entry(key).or_default();
        if records
            .iter()
            .any(|r| r.holder == holder && r.mode == mode)
        {
            return true;
        }
        if records.iter().all(|r| r.mode.compatible_with(&mode)) {
            records.push(LockRecord {
                mode,
                holder: holder.to_owned(),
                acquired_at: Instant::now(),
            });
            true
        } else {
            false
        }
    }

    /// Drop every lock `holder` has on the path. Idempotent.
    pub fn release(&self, pair: &SyncPairId, path: &VirtualPath, holder: &str) {
        let key = (pair.clone(), path.clone());
        let now_empty = match self.locks.get_mut(&key) {
            Some(mut records) => {
                records.retain(|r| r.holder != holder);
                records.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.locks.remove_if(&key, |_, records| records.is_empty());
        }
    }

    /// Direction of the sync lock currently held on the path, if any.
    pub fn sync_direction(&self, pair: &SyncPairId, path: &VirtualPath) -> Option<SyncDirection> {
        let key = (pair.clone(), path.clone());
        self.locks.get(&key).and_then(|records| {
            records.iter().find_map(|r| match r.mode {
                LockMode::Sync(direction) => Some(direction),
                _ => None,
            })
        })
    }

    /// Whether a user write through the mount would collide with a held
    /// sync lock (mapped to `EAGAIN` by the adapter).
    pub fn blocks_user_write(&self, pair: &SyncPairId, path: &VirtualPath) -> bool {
        self.sync_direction(pair, path).is_some()
    }

    /// Whether any writer or sync currently holds the path. Eviction
    /// uses this as its "file not open for writing" check.
    pub fn is_busy(&self, pair: &SyncPairId, path: &VirtualPath) -> bool {
        let key = (pair.clone(), path.clone());
        self.locks
            .get(&key)
            .map(|records| records.iter().any(|r| !r.mode.is_read()))
            .unwrap_or(false)
    }

    pub fn held_count(&self) -> usize {
        self.locks.iter().map(|r| r.value().len()).sum()
    }

    /// Force-release locks older than `ttl`, returning the audit list of
    /// `(path, holder)` pairs reclaimed.
    pub fn reclaim_stale(&self, ttl: Duration) -> Vec<(VirtualPath, String)> {
        let now = Instant::now();
        let mut reclaimed = Vec::new();
        for mut shard in self.locks.iter_mut() {
            let path = shard.key().1.clone();
            shard.value_mut().retain(|record| {
                let stale = now.duration_since(record.acquired_at) >= ttl;
                if stale {
                    warn!(
                        path = %path,
                        holder = %record.holder,
                        held_for = ?now.duration_since(record.acquired_at),
                        "watchdog reclaiming stale lock"
                    );
                    reclaimed.push((path.clone(), record.holder.clone()));
                }
                !stale
            });
        }
        self.locks.retain(|_, records| !records.is_empty());
        reclaimed
    }

    /// Spawn the watchdog task sweeping every `ttl / 4`.
    pub fn spawn_watchdog(self: &Arc<Self>, ttl: Duration) -> tokio::task::JoinHandle<()> {
        let table = Arc::clone(self);
        let sweep = (ttl / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let _ = table.reclaim_stale(ttl);
            }
        })
    }
}

/// Scoped ownership of the sync locks held during one sync run; all
/// locks are released on drop, whatever the exit path.
pub struct SyncLockGuard {
    table: Arc<LockTable>,
    pair: SyncPairId,
    holder: String,
    held: Vec<VirtualPath>,
}

impl SyncLockGuard {
    pub fn new(table: Arc<LockTable>, pair: SyncPairId, holder: impl Into<String>) -> Self {
        Self {
            table,
            pair,
            holder: holder.into(),
            held: Vec::new(),
        }
    }

    /// Try to add one path to the guard.
    pub fn try_lock(&mut self, path: &VirtualPath, direction: SyncDirection) -> bool {
        if self
            .table
            .acquire(&self.pair, path, LockMode::Sync(direction), &self.holder)
        {
            self.held.push(path.clone());
            true
        } else {
            false
        }
    }

    pub fn held(&self) -> &[VirtualPath] {
        &self.held
    }
}

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        for path in self.held.drain(..) {
            self.table.release(&self.pair, &path, &self.holder);
        }
    }
}
