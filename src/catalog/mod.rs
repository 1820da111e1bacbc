//! Durable mapping `(sync_pair_id, virtual_path) -> FileEntry`.
//!
//! The catalog owns its map behind a single facade; batches are applied
//! all-or-nothing and writes are counted so the snapshot is persisted
//! every [`Catalog::SAVE_EVERY`] mutations in addition to explicit
//! `force_save` calls.

mod entry;
mod store;

pub use entry::{EntryKey, FileEntry, Location, LockState, SyncPairId, VirtualPath};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use store::SnapshotStore;

pub struct Catalog {
    entries: RwLock<HashMap<EntryKey, FileEntry>>,
    store: SnapshotStore,
    unsaved_writes: AtomicUsize,
}

impl Catalog {
    /// Mutations between automatic snapshot saves.
    pub const SAVE_EVERY: usize = 256;

    /// Open the catalog, loading the previous snapshot when present.
    pub async fn open(snapshot_path: PathBuf) -> Result<Self> {
        let store = SnapshotStore::new(snapshot_path);
        let entries = store.load().await?;
        debug!(entries = entries.len(), "catalog opened");
        Ok(Self {
            entries: RwLock::new(entries),
            store,
            unsaved_writes: AtomicUsize::new(0),
        })
    }

    /// In-memory catalog for tests and rebuilds.
    pub async fn open_in(dir: &std::path::Path) -> Result<Self> {
        Self::open(dir.join("catalog.json")).await
    }

    pub async fn get(&self, pair: &SyncPairId, path: &VirtualPath) -> Option<FileEntry> {
        let key = EntryKey::new(pair.clone(), path.clone());
        self.entries.read().await.get(&key).cloned()
    }

    /// Insert or replace one entry. The stored `entry_version` is bumped
    /// past the previous incarnation so versions stay monotonic per key.
    pub async fn put(&self, entry: FileEntry) -> Result<()> {
        self.put_batch(vec![entry]).await
    }

    /// Insert or replace a batch, all-or-nothing: every entry is
    /// validated before the first one is applied.
    pub async fn put_batch(&self, batch: Vec<FileEntry>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        for entry in &batch {
            entry.validate().map_err(Error::Corrupt)?;
        }
        {
            let mut entries = self.entries.write().await;
            for mut entry in batch {
                let key = entry.key();
                let next_version = entries
                    .get(&key)
                    .map(|prev| prev.entry_version.max(entry.entry_version) + 1)
                    .unwrap_or(entry.entry_version);
                entry.entry_version = next_version;
                entries.insert(key, entry);
            }
        }
        self.note_writes(1).await
    }

    pub async fn delete(&self, key: &EntryKey) -> Result<()> {
        self.delete_batch(std::slice::from_ref(key)).await
    }

    pub async fn delete_batch(&self, keys: &[EntryKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        {
            let mut entries = self.entries.write().await;
            for key in keys {
                entries.remove(key);
            }
        }
        self.note_writes(1).await
    }

    /// Collect every entry matching `predicate`.
    pub async fn query<F>(&self, predicate: F) -> Vec<FileEntry>
    where
        F: Fn(&FileEntry) -> bool,
    {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    /// Every entry belonging to one pair.
    pub async fn entries_for_pair(&self, pair: &SyncPairId) -> Vec<FileEntry> {
        self.query(|e| &e.sync_pair_id == pair).await
    }

    pub async fn is_empty_for_pair(&self, pair: &SyncPairId) -> bool {
        self.entries
            .read()
            .await
            .values()
            .all(|e| &e.sync_pair_id != pair)
    }

    /// Files whose LOCAL side is ahead of EXTERNAL.
    pub async fn needs_sync(&self, pair: &SyncPairId) -> Vec<FileEntry> {
        self.query(|e| &e.sync_pair_id == pair && e.needs_sync()).await
    }

    /// Files with unsynced local changes.
    pub async fn dirty(&self, pair: &SyncPairId) -> Vec<FileEntry> {
        self.query(|e| &e.sync_pair_id == pair && e.is_dirty).await
    }

    /// Entries whose bytes live at `location`.
    pub async fn by_location(&self, pair: &SyncPairId, location: Location) -> Vec<FileEntry> {
        self.query(|e| &e.sync_pair_id == pair && e.location == location)
            .await
    }

    /// Entries eligible for eviction, oldest access first.
    pub async fn evictable(&self, pair: &SyncPairId, min_age_secs: u64) -> Vec<FileEntry> {
        let now = Utc::now();
        let mut candidates = self
            .query(|e| &e.sync_pair_id == pair && e.is_evictable(now, min_age_secs))
            .await;
        candidates.sort_by_key(|e| e.accessed_at);
        candidates
    }

    /// Sum of bytes currently occupying the LOCAL store for one pair.
    pub async fn local_bytes(&self, pair: &SyncPairId) -> u64 {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| {
                &e.sync_pair_id == pair && !e.is_directory && e.local_path.is_some()
            })
            .map(|e| e.size)
            .sum()
    }

    /// Update `accessed_at` in place without counting as a durable write;
    /// the value reaches the snapshot at the next checkpoint.
    pub async fn touch_accessed(&self, pair: &SyncPairId, path: &VirtualPath) {
        let key = EntryKey::new(pair.clone(), path.clone());
        if let Some(entry) = self.entries.write().await.get_mut(&key) {
            entry.touch_accessed(Utc::now());
        }
    }

    /// Persist the snapshot now.
    pub async fn force_save(&self) -> Result<()> {
        let copy = self.entries.read().await.clone();
        self.store.save(&copy).await?;
        self.unsaved_writes.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn note_writes(&self, count: usize) -> Result<()> {
        let total = self.unsaved_writes.fetch_add(count, Ordering::SeqCst) + count;
        if total >= Self::SAVE_EVERY {
            self.force_save().await?;
        }
        Ok(())
    }
}
