//! LRU eviction of cold local copies.
//!
//! Candidates are clean `both` entries whose last access is older than
//! the configured minimum age. Each candidate is re-verified on the
//! spot right before its local file is removed; any doubt skips the
//! file. Evicted files stay visible through the mount and stream from
//! the external store on demand.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::activity::{ActivityKind, ActivityLog, ActivityRecord};
use crate::catalog::{Catalog, Location, SyncPairId};
use crate::config::EvictionConfig;
use crate::control::CancelFlag;
use crate::error::Result;
use crate::hasher::Hasher;
use crate::lock_table::LockTable;
use crate::notifier::{Event, Notifier};

/// What started an eviction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionTrigger {
    Periodic,
    ThresholdCrossed,
    /// Pre-write space request for this many bytes.
    SpaceRequest(u64),
    Manual,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub freed_bytes: u64,
    pub evicted_files: u64,
    pub examined: u64,
    pub skipped: u64,
    /// Whether the pass freed everything it set out to free.
    pub reached_target: bool,
}

pub struct EvictionEngine {
    catalog: Arc<Catalog>,
    locks: Arc<LockTable>,
    notifier: Arc<Notifier>,
    activity: Arc<ActivityLog>,
    config: EvictionConfig,
    verifier: Hasher,
}

impl EvictionEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        locks: Arc<LockTable>,
        notifier: Arc<Notifier>,
        activity: Arc<ActivityLog>,
        config: EvictionConfig,
        verifier: Hasher,
    ) -> Self {
        Self {
            catalog,
            locks,
            notifier,
            activity,
            config,
            verifier,
        }
    }

    /// Whether local usage for the pair has crossed the threshold.
    pub async fn over_threshold(&self, pair: &SyncPairId) -> bool {
        self.catalog.local_bytes(pair).await > self.config.threshold
    }

    /// Run one eviction pass.
    pub async fn run(
        &self,
        pair: &SyncPairId,
        trigger: EvictionTrigger,
        cancel: &CancelFlag,
    ) -> Result<EvictionOutcome> {
        if !self.config.enabled && trigger != EvictionTrigger::Manual {
            return Ok(EvictionOutcome::default());
        }

        let current_used = self.catalog.local_bytes(pair).await;
        let to_free = match trigger {
            EvictionTrigger::SpaceRequest(bytes) => bytes,
            _ => current_used.saturating_sub(self.config.target_free),
        };
        if to_free == 0 {
            return Ok(EvictionOutcome {
                reached_target: true,
                ..Default::default()
            });
        }
        debug!(pair = %pair, ?trigger, to_free, current_used, "eviction pass starting");

        let candidates = self.catalog.evictable(pair, self.config.min_age).await;
        let mut outcome = EvictionOutcome::default();

        for candidate in candidates.into_iter().take(self.config.batch_size) {
            cancel.check()?;
            if outcome.freed_bytes >= to_free {
                break;
            }
            outcome.examined += 1;

            // Re-verify against the live catalog; the entry may have
            // been written or locked since enumeration.
            let Some(entry) = self
                .catalog
                .get(pair, &candidate.virtual_path)
                .await
            else {
                outcome.skipped += 1;
                continue;
            };
            if entry.is_dirty
                || entry.location != Location::Both
                || !entry.is_evictable(Utc::now(), self.config.min_age)
            {
                outcome.skipped += 1;
                continue;
            }
            if self.locks.is_busy(pair, &entry.virtual_path) {
                debug!(path = %entry.virtual_path, "skipping locked file");
                outcome.skipped += 1;
                continue;
            }
            let (Some(local_path), Some(external_path)) =
                (entry.local_path.clone(), entry.external_path.clone())
            else {
                outcome.skipped += 1;
                continue;
            };
            // The external copy must exist and be readable right now.
            if tokio::fs::metadata(&external_path).await.is_err() {
                warn!(path = %entry.virtual_path, "external copy missing, not evicting");
                outcome.skipped += 1;
                continue;
            }
            if self.config.verify_before_delete {
                let local_hash = self.verifier.hash_file(&local_path, cancel).await;
                let external_hash = self.verifier.hash_file(&external_path, cancel).await;
                match (local_hash, external_hash) {
                    (Ok(a), Ok(b)) if a == b => {}
                    _ => {
                        warn!(path = %entry.virtual_path, "external copy differs, not evicting");
                        outcome.skipped += 1;
                        continue;
                    }
                }
            }

            if let Err(e) = tokio::fs::remove_file(&local_path).await {
                warn!(path = %entry.virtual_path, %e, "could not remove local copy");
                outcome.skipped += 1;
                continue;
            }

            let mut evicted = entry;
            let size = evicted.size;
            evicted.mark_evicted();
            self.catalog.put(evicted).await?;

            outcome.freed_bytes += size;
            outcome.evicted_files += 1;
            self.notifier.publish(Event::EvictionProgress {
                sync_pair_id: pair.clone(),
                freed_bytes: outcome.freed_bytes,
                remaining_bytes: to_free.saturating_sub(outcome.freed_bytes),
            });
        }

        outcome.reached_target = outcome.freed_bytes >= to_free;
        info!(
            pair = %pair,
            freed = outcome.freed_bytes,
            files = outcome.evicted_files,
            skipped = outcome.skipped,
            complete = outcome.reached_target,
            "eviction pass finished"
        );
        let _ = self
            .activity
            .append(ActivityRecord::new(
                ActivityKind::EvictionCompleted,
                Some(pair.clone()),
                format!(
                    "evicted {} files, freed {} bytes{}",
                    outcome.evicted_files,
                    outcome.freed_bytes,
                    if outcome.reached_target { "" } else { " (partial)" }
                ),
            ))
            .await;
        Ok(outcome)
    }
}
