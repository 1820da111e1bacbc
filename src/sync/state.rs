//! Resumable sync state.
//!
//! One JSON file per sync pair, written atomically at every checkpoint,
//! lets an interrupted sync continue from its pending actions instead
//! of starting over. Copies are atomic and idempotent, so redoing up to
//! one checkpoint interval of work after a crash is safe.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::SyncPairId;
use crate::error::{Error, Result};
use crate::plan::SyncPlan;

/// Where a sync run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Scanning,
    Checksumming,
    Diffing,
    ResolvingConflicts,
    PreparingDirectories,
    Copying,
    Deleting,
    Verifying,
    Completed,
    Cancelled,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Scanning => "scanning",
            SyncPhase::Checksumming => "checksumming",
            SyncPhase::Diffing => "diffing",
            SyncPhase::ResolvingConflicts => "resolvingConflicts",
            SyncPhase::PreparingDirectories => "preparingDirectories",
            SyncPhase::Copying => "copying",
            SyncPhase::Deleting => "deleting",
            SyncPhase::Verifying => "verifying",
            SyncPhase::Completed => "completed",
            SyncPhase::Cancelled => "cancelled",
            SyncPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedAction {
    pub relative_path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub sync_pair_id: SyncPairId,
    pub plan: SyncPlan,
    pub completed_indices: BTreeSet<usize>,
    pub pending_indices: BTreeSet<usize>,
    pub processed_bytes: u64,
    pub processed_files: u64,
    pub failed_actions: Vec<FailedAction>,
    pub phase: SyncPhase,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl SyncState {
    /// Fresh state with every action pending.
    pub fn new(sync_pair_id: SyncPairId, plan: SyncPlan) -> Self {
        let pending: BTreeSet<usize> = (0..plan.actions.len()).collect();
        let now = Utc::now();
        Self {
            sync_pair_id,
            plan,
            completed_indices: BTreeSet::new(),
            pending_indices: pending,
            processed_bytes: 0,
            processed_files: 0,
            failed_actions: Vec::new(),
            phase: SyncPhase::PreparingDirectories,
            started_at: now,
            last_updated_at: now,
        }
    }

    pub fn is_resumable(&self) -> bool {
        !self.pending_indices.is_empty()
            && !matches!(self.phase, SyncPhase::Completed | SyncPhase::Cancelled)
    }

    pub fn mark_completed(&mut self, index: usize, bytes: u64, counts_as_file: bool) {
        if self.pending_indices.remove(&index) {
            self.completed_indices.insert(index);
            self.processed_bytes += bytes;
            if counts_as_file {
                self.processed_files += 1;
            }
            self.last_updated_at = Utc::now();
        }
    }

    pub fn mark_failed(&mut self, index: usize, relative_path: &str, message: String) {
        self.pending_indices.remove(&index);
        self.failed_actions.push(FailedAction {
            relative_path: relative_path.to_owned(),
            message,
        });
        self.last_updated_at = Utc::now();
    }

    /// Drop an action from pending without completing or failing it;
    /// the next sync cycle picks the file up again.
    pub fn defer(&mut self, index: usize) {
        self.pending_indices.remove(&index);
        self.last_updated_at = Utc::now();
    }

    pub fn set_phase(&mut self, phase: SyncPhase) {
        self.phase = phase;
        self.last_updated_at = Utc::now();
    }
}

/// One state file per sync pair under a configured directory.
pub struct SyncStateStore {
    dir: PathBuf,
}

impl SyncStateStore {
    /// Non-completed, non-cancelled states older than this are purged.
    pub const EXPIRY: Duration = Duration::from_secs(7 * 24 * 3600);

    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn state_path(&self, pair: &SyncPairId) -> PathBuf {
        self.dir.join(format!("{}.json", pair.file_stem()))
    }

    /// Write-then-rename checkpoint.
    pub async fn save(&self, state: &SyncState) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.state_path(&state.sync_pair_id);
        let raw = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::Unavailable(format!("encode sync state: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load(&self, pair: &SyncPairId) -> Result<Option<SyncState>> {
        let path = self.state_path(pair);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_slice(&raw)
            .map_err(|e| Error::Corrupt(format!("sync state {}: {e}", path.display())))?;
        Ok(Some(state))
    }

    pub async fn clear(&self, pair: &SyncPairId) -> Result<()> {
        let path = self.state_path(pair);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All resumable states, least recently updated first, with expired
    /// ones purged along the way.
    pub async fn get_resumable_states(&self) -> Result<Vec<SyncState>> {
        let mut reader = match tokio::fs::read_dir(&self.dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let expiry = chrono::Duration::from_std(Self::EXPIRY).unwrap_or(chrono::Duration::days(7));
        let now = Utc::now();
        let mut states = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let state: SyncState = match serde_json::from_slice(&raw) {
                Ok(state) => state,
                Err(e) => {
                    debug!(path = %path.display(), %e, "skipping undecodable sync state");
                    continue;
                }
            };
            if now - state.last_updated_at > expiry {
                debug!(path = %path.display(), "purging expired sync state");
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            if state.is_resumable() {
                states.push(state);
            }
        }
        states.sort_by_key(|s| s.last_updated_at);
        Ok(states)
    }
}
