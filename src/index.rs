//! Catalog index builds.
//!
//! A full build runs when the catalog knows nothing about a pair: the
//! LOCAL tree seeds `localOnly` entries, the EXTERNAL tree merges into
//! `both` or adds `externalOnly`, streamed into the catalog in batches.
//! The incremental build diffs a fresh merged view against the catalog
//! and partitions into added/updated/removed/unchanged, preserving
//! runtime state on updated entries.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::activity::{ActivityKind, ActivityLog, ActivityRecord};
use crate::catalog::{Catalog, EntryKey, FileEntry, Location, SyncPairId, VirtualPath};
use crate::control::CancelFlag;
use crate::error::Result;
use crate::filter::PathFilter;
use crate::notifier::{Event, Notifier};
use crate::scanner::{DirectorySnapshot, FileMetadata, ScanOptions, Scanner};

/// Entries streamed to the catalog per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Mtime drift beyond which an entry counts as updated.
const UPDATE_TOLERANCE_SECS: f64 = 1.0;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexOutcome {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl IndexOutcome {
    pub fn total(&self) -> usize {
        self.added + self.updated + self.unchanged
    }
}

pub struct IndexBuilder {
    catalog: Arc<Catalog>,
    notifier: Arc<Notifier>,
    activity: Arc<ActivityLog>,
    batch_size: usize,
    exclude_patterns: Vec<String>,
}

impl IndexBuilder {
    pub fn new(
        catalog: Arc<Catalog>,
        notifier: Arc<Notifier>,
        activity: Arc<ActivityLog>,
        exclude_patterns: Vec<String>,
    ) -> Self {
        Self {
            catalog,
            notifier,
            activity,
            batch_size: DEFAULT_BATCH_SIZE,
            exclude_patterns,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Build or refresh the index for one pair.
    pub async fn build(
        &self,
        pair: &SyncPairId,
        local_dir: &Path,
        external_dir: Option<&Path>,
        cancel: &CancelFlag,
    ) -> Result<IndexOutcome> {
        let scanner = Scanner::new(
            ScanOptions::default(),
            PathFilter::new(&self.exclude_patterns)?,
        );

        self.emit_progress(pair, "local", 0, 0.0);
        let local_snap = scanner.scan(local_dir, cancel).await?;
        self.emit_progress(pair, "local", local_snap.len() as u64, 0.4);

        let external_snap = match external_dir {
            Some(dir) if tokio::fs::metadata(dir).await.is_ok() => {
                let snap = scanner.scan(dir, cancel).await?;
                self.emit_progress(pair, "external", snap.len() as u64, 0.8);
                Some(snap)
            }
            _ => None,
        };

        let desired = self.merge(pair, local_dir, &local_snap, external_dir, external_snap.as_ref());

        let outcome = if self.catalog.is_empty_for_pair(pair).await {
            self.full_build(pair, desired, cancel).await?
        } else {
            self.incremental_build(pair, desired, cancel).await?
        };

        self.emit_progress(pair, "done", outcome.total() as u64, 1.0);
        info!(
            pair = %pair,
            added = outcome.added,
            updated = outcome.updated,
            removed = outcome.removed,
            unchanged = outcome.unchanged,
            "index build complete"
        );
        let _ = self
            .activity
            .append(ActivityRecord::new(
                ActivityKind::IndexCompleted,
                Some(pair.clone()),
                format!("indexed {} entries", outcome.total()),
            ))
            .await;
        Ok(outcome)
    }

    /// Merge the two snapshots into the desired entry set, LOCAL first.
    fn merge(
        &self,
        pair: &SyncPairId,
        local_dir: &Path,
        local_snap: &DirectorySnapshot,
        external_dir: Option<&Path>,
        external_snap: Option<&DirectorySnapshot>,
    ) -> BTreeMap<VirtualPath, FileEntry> {
        let mut desired: BTreeMap<VirtualPath, FileEntry> = BTreeMap::new();

        for (rel, meta) in &local_snap.files {
            let Ok(vpath) = VirtualPath::from_relative(rel) else {
                continue;
            };
            let entry = FileEntry::new_local(
                pair.clone(),
                vpath.clone(),
                local_dir.join(rel),
                file_size(meta),
                meta.modified_time,
                meta.is_directory,
            );
            desired.insert(vpath, entry);
        }

        if let (Some(dir), Some(snap)) = (external_dir, external_snap) {
            for (rel, meta) in &snap.files {
                let Ok(vpath) = VirtualPath::from_relative(rel) else {
                    continue;
                };
                match desired.get_mut(&vpath) {
                    Some(entry) => {
                        entry.external_path = Some(dir.join(rel));
                        entry.location = Location::Both;
                    }
                    None => {
                        let entry = FileEntry::new_external(
                            pair.clone(),
                            vpath.clone(),
                            dir.join(rel),
                            file_size(meta),
                            meta.modified_time,
                            meta.is_directory,
                        );
                        desired.insert(vpath, entry);
                    }
                }
            }
        }

        desired
    }

    async fn full_build(
        &self,
        pair: &SyncPairId,
        desired: BTreeMap<VirtualPath, FileEntry>,
        cancel: &CancelFlag,
    ) -> Result<IndexOutcome> {
        let total = desired.len();
        let mut batch = Vec::with_capacity(self.batch_size.min(total.max(1)));
        let mut written = 0usize;
        for entry in desired.into_values() {
            cancel.check()?;
            batch.push(entry);
            if batch.len() >= self.batch_size {
                written += batch.len();
                self.catalog.put_batch(std::mem::take(&mut batch)).await?;
                self.emit_progress(
                    pair,
                    "catalog",
                    written as u64,
                    0.8 + 0.2 * (written as f64 / total.max(1) as f64),
                );
            }
        }
        if !batch.is_empty() {
            written += batch.len();
            self.catalog.put_batch(batch).await?;
        }
        debug!(pair = %pair, written, "full index build");
        Ok(IndexOutcome {
            added: written,
            ..Default::default()
        })
    }

    async fn incremental_build(
        &self,
        pair: &SyncPairId,
        desired: BTreeMap<VirtualPath, FileEntry>,
        cancel: &CancelFlag,
    ) -> Result<IndexOutcome> {
        let existing: BTreeMap<VirtualPath, FileEntry> = self
            .catalog
            .entries_for_pair(pair)
            .await
            .into_iter()
            .map(|e| (e.virtual_path.clone(), e))
            .collect();

        let mut outcome = IndexOutcome::default();
        let mut upserts: Vec<FileEntry> = Vec::new();

        for (vpath, mut entry) in desired.iter().map(|(k, v)| (k.clone(), v.clone())) {
            cancel.check()?;
            match existing.get(&vpath) {
                None => {
                    outcome.added += 1;
                    upserts.push(entry);
                }
                Some(previous) => {
                    if entry_changed(previous, &entry) {
                        outcome.updated += 1;
                        entry.preserve_runtime_state(previous);
                        if previous.size == entry.size
                            && mtime_close(previous, &entry)
                        {
                            entry.checksum = previous.checksum.clone();
                        }
                        upserts.push(entry);
                    } else {
                        outcome.unchanged += 1;
                    }
                }
            }
        }

        let removals: Vec<EntryKey> = existing
            .keys()
            .filter(|vpath| !desired.contains_key(*vpath))
            .map(|vpath| EntryKey::new(pair.clone(), vpath.clone()))
            .collect();
        outcome.removed = removals.len();

        for chunk in upserts.chunks(self.batch_size) {
            self.catalog.put_batch(chunk.to_vec()).await?;
        }
        self.catalog.delete_batch(&removals).await?;
        Ok(outcome)
    }

    fn emit_progress(&self, pair: &SyncPairId, phase: &str, scanned: u64, progress: f64) {
        self.notifier.publish(Event::IndexProgress {
            sync_pair_id: pair.clone(),
            phase: phase.to_owned(),
            scanned_files: scanned,
            progress,
        });
    }
}

fn file_size(meta: &FileMetadata) -> u64 {
    if meta.is_directory {
        0
    } else {
        meta.size
    }
}

/// Updated iff size or location changed, or mtime drifted beyond the
/// tolerance.
fn entry_changed(previous: &FileEntry, next: &FileEntry) -> bool {
    previous.size != next.size
        || previous.location != next.location
        || !mtime_close(previous, next)
}

fn mtime_close(a: &FileEntry, b: &FileEntry) -> bool {
    let delta = (a.modified_at - b.modified_at).num_milliseconds().abs();
    (delta as f64 / 1000.0) <= UPDATE_TOLERANCE_SECS
}
