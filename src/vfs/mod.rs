//! Mount lifecycle and filesystem-event routing.
//!
//! One [`VfsManager`] owns the per-pair mount bookkeeping: the mount
//! protocol with its target-directory resolution rules, index gating,
//! crash recovery with a bounded remount budget, and the callbacks the
//! FUSE layer invokes for user I/O events.

mod adapter;

pub use adapter::{
    AdapterFactory, FuseAdapter, MountDelegate, NullAdapterFactory, NullFuseAdapter, VfsErrno,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use crate::activity::{ActivityKind, ActivityLog, ActivityRecord};
use crate::catalog::{Catalog, EntryKey, FileEntry, SyncPairId, VirtualPath};
use crate::config::VfsConfig;
use crate::control::CancelFlag;
use crate::error::{Error, Result};
use crate::index::IndexBuilder;
use crate::lock_table::LockTable;
use crate::notifier::{Event, Notifier};
use crate::scheduler::PairEvent;
use crate::state::{ComponentState, GlobalState, StateManager};

/// Bookkeeping for one live mount.
pub struct MountPoint {
    pub sync_pair_id: SyncPairId,
    pub local_dir: PathBuf,
    pub external_dir: Option<PathBuf>,
    pub target_dir: PathBuf,
    pub is_external_online: bool,
    pub is_read_only: bool,
    pub mounted_at: DateTime<Utc>,
    pub adapter: Arc<dyn FuseAdapter>,
    pub delegate: Arc<MountDelegate>,
}

/// Cloneable view of a mount for status reporting.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MountSummary {
    pub sync_pair_id: SyncPairId,
    pub local_dir: PathBuf,
    pub external_dir: Option<PathBuf>,
    pub target_dir: PathBuf,
    pub is_external_online: bool,
    pub is_read_only: bool,
    pub mounted_at: DateTime<Utc>,
}

pub struct VfsManager {
    catalog: Arc<Catalog>,
    locks: Arc<LockTable>,
    state: Arc<StateManager>,
    notifier: Arc<Notifier>,
    activity: Arc<ActivityLog>,
    index: Arc<IndexBuilder>,
    adapters: Arc<dyn AdapterFactory>,
    config: VfsConfig,
    mounts: RwLock<HashMap<SyncPairId, MountPoint>>,
    /// Consecutive remount failures per pair.
    recovery_failures: DashMap<SyncPairId, u32>,
    events: mpsc::UnboundedSender<PairEvent>,
}

impl VfsManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<Catalog>,
        locks: Arc<LockTable>,
        state: Arc<StateManager>,
        notifier: Arc<Notifier>,
        activity: Arc<ActivityLog>,
        index: Arc<IndexBuilder>,
        adapters: Arc<dyn AdapterFactory>,
        config: VfsConfig,
        events: mpsc::UnboundedSender<PairEvent>,
    ) -> Self {
        Self {
            catalog,
            locks,
            state,
            notifier,
            activity,
            index,
            adapters,
            config,
            mounts: RwLock::new(HashMap::new()),
            recovery_failures: DashMap::new(),
            events,
        }
    }

    fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.config.mount_timeout)
    }

    /// Establish the mount for a pair and build its index. User I/O
    /// through the mount returns `EBUSY` until the index is ready.
    pub async fn mount(
        &self,
        pair: SyncPairId,
        local_dir: PathBuf,
        external_dir: Option<PathBuf>,
        target_dir: PathBuf,
    ) -> Result<()> {
        {
            let mounts = self.mounts.read().await;
            if mounts.contains_key(&pair) || mounts.values().any(|m| m.target_dir == target_dir) {
                return Err(Error::AlreadyMounted(target_dir));
            }
        }
        let _ = self.state.transition(GlobalState::VfsMounting);
        self.state.set_component("vfs", ComponentState::Starting);

        let adapter = self.adapters.create(&pair);

        // A stale mount at the target from a previous run is unmounted
        // best-effort before anything else.
        if adapter.is_mounted() {
            warn!(target = %target_dir.display(), "unmounting stale mount");
            let _ = adapter.unmount().await;
        }

        resolve_target_dir(&local_dir, &target_dir).await?;
        tokio::fs::create_dir_all(&local_dir).await?;
        tokio::fs::create_dir_all(&target_dir).await?;

        let is_external_online = match &external_dir {
            Some(dir) => tokio::time::timeout(self.mount_timeout(), tokio::fs::metadata(dir))
                .await
                .map(|probe| probe.is_ok())
                .unwrap_or(false),
            None => false,
        };

        let delegate = Arc::new(MountDelegate::new(
            pair.clone(),
            Arc::clone(&self.catalog),
            Arc::clone(&self.locks),
        ));
        delegate.set_external_online(is_external_online);

        let volume_name = format!("overlay-{}", pair.file_stem());
        match tokio::time::timeout(
            self.mount_timeout(),
            adapter.mount(&target_dir, &volume_name, Arc::clone(&delegate)),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::MountFailed(e.to_string())),
            Err(_) => return Err(Error::Timeout(self.mount_timeout())),
        }

        {
            let mut mounts = self.mounts.write().await;
            mounts.insert(
                pair.clone(),
                MountPoint {
                    sync_pair_id: pair.clone(),
                    local_dir: local_dir.clone(),
                    external_dir: external_dir.clone(),
                    target_dir: target_dir.clone(),
                    is_external_online,
                    is_read_only: false,
                    mounted_at: Utc::now(),
                    adapter: Arc::clone(&adapter),
                    delegate: Arc::clone(&delegate),
                },
            );
        }
        info!(pair = %pair, target = %target_dir.display(), "mounted");

        // Index build gates all user access.
        let _ = self.state.transition(GlobalState::Indexing);
        self.state.set_component("index", ComponentState::Busy);
        let build = self
            .index
            .build(
                &pair,
                &local_dir,
                is_external_online.then(|| external_dir.as_deref()).flatten(),
                &CancelFlag::new(),
            )
            .await;
        if let Err(err) = build {
            let err = match err {
                Error::PermissionDenied(path) => Error::IndexPermissionDenied(path),
                other => other,
            };
            self.state.component_error("index", &err);
            return Err(err);
        }
        self.state.set_component("index", ComponentState::Ready);
        delegate.set_index_ready(true);
        adapter.set_index_ready(true);
        self.state.set_component("vfs", ComponentState::Ready);
        let _ = self.state.transition(GlobalState::Ready);
        self.notifier.publish(Event::IndexReady {
            sync_pair_id: pair.clone(),
        });
        let _ = self
            .activity
            .append(ActivityRecord::new(
                ActivityKind::MountChanged,
                Some(pair),
                format!("mounted at {}", target_dir.display()),
            ))
            .await;
        Ok(())
    }

    /// Tear the mount down, saving the catalog first.
    pub async fn unmount(&self, pair: &SyncPairId) -> Result<()> {
        let Some(point) = self.mounts.write().await.remove(pair) else {
            return Err(Error::NotFound(PathBuf::from(pair.as_str())));
        };
        self.catalog.force_save().await?;
        let _ = point.adapter.unmount().await;
        self.recovery_failures.remove(pair);
        info!(pair = %pair, "unmounted");
        let _ = self
            .activity
            .append(ActivityRecord::new(
                ActivityKind::MountChanged,
                Some(pair.clone()),
                format!("unmounted {}", point.target_dir.display()),
            ))
            .await;
        Ok(())
    }

    pub async fn unmount_all(&self) {
        let pairs: Vec<SyncPairId> = self.mounts.read().await.keys().cloned().collect();
        for pair in pairs {
            let _ = self.unmount(&pair).await;
        }
    }

    pub async fn is_mounted(&self, pair: &SyncPairId) -> bool {
        self.mounts.read().await.contains_key(pair)
    }

    pub async fn summaries(&self) -> Vec<MountSummary> {
        self.mounts
            .read()
            .await
            .values()
            .map(|m| MountSummary {
                sync_pair_id: m.sync_pair_id.clone(),
                local_dir: m.local_dir.clone(),
                external_dir: m.external_dir.clone(),
                target_dir: m.target_dir.clone(),
                is_external_online: m.is_external_online,
                is_read_only: m.is_read_only,
                mounted_at: m.mounted_at,
            })
            .collect()
    }

    pub async fn delegate(&self, pair: &SyncPairId) -> Option<Arc<MountDelegate>> {
        self.mounts
            .read()
            .await
            .get(pair)
            .map(|m| Arc::clone(&m.delegate))
    }

    /// Point the pair at a different external directory. Going online
    /// on the new path triggers a catalog rebuild.
    pub async fn update_external_path(&self, pair: &SyncPairId, new_path: PathBuf) -> Result<()> {
        let (adapter, local_dir) = {
            let mut mounts = self.mounts.write().await;
            let point = mounts
                .get_mut(pair)
                .ok_or_else(|| Error::NotFound(PathBuf::from(pair.as_str())))?;
            point.external_dir = Some(new_path.clone());
            (Arc::clone(&point.adapter), point.local_dir.clone())
        };
        adapter.update_external_dir(&new_path).await?;
        let online = tokio::fs::metadata(&new_path).await.is_ok();
        self.set_external_offline(pair, !online).await?;
        if online {
            self.index
                .build(pair, &local_dir, Some(&new_path), &CancelFlag::new())
                .await?;
        }
        Ok(())
    }

    pub async fn set_external_offline(&self, pair: &SyncPairId, offline: bool) -> Result<()> {
        let mut mounts = self.mounts.write().await;
        let point = mounts
            .get_mut(pair)
            .ok_or_else(|| Error::NotFound(PathBuf::from(pair.as_str())))?;
        point.is_external_online = !offline;
        point.delegate.set_external_online(!offline);
        point.adapter.set_external_offline(offline);
        Ok(())
    }

    pub async fn set_read_only(&self, pair: &SyncPairId, read_only: bool) -> Result<()> {
        let mut mounts = self.mounts.write().await;
        let point = mounts
            .get_mut(pair)
            .ok_or_else(|| Error::NotFound(PathBuf::from(pair.as_str())))?;
        point.is_read_only = read_only;
        point.delegate.set_read_only(read_only);
        point.adapter.set_read_only(read_only);
        Ok(())
    }

    /// FUSE process died: one remount attempt after the cooldown. Three
    /// consecutive failures drop the pair and put the engine in error.
    pub async fn fuse_did_exit_unexpectedly(&self, pair: &SyncPairId) {
        self.recover(pair, true).await;
    }

    /// Wake-from-sleep re-check; lost mounts recover without consuming
    /// the retry budget.
    pub async fn handle_wake_from_sleep(&self) {
        let lost: Vec<SyncPairId> = {
            let mounts = self.mounts.read().await;
            mounts
                .iter()
                .filter(|(_, m)| !m.adapter.is_mounted())
                .map(|(pair, _)| pair.clone())
                .collect()
        };
        for pair in lost {
            warn!(pair = %pair, "mount lost across sleep");
            self.recover(&pair, false).await;
        }
    }

    async fn recover(&self, pair: &SyncPairId, consume_budget: bool) {
        let Some(point) = self.mounts.write().await.remove(pair) else {
            return;
        };
        warn!(pair = %pair, "mount lost, attempting recovery");
        self.state.set_component("vfs", ComponentState::Starting);
        tokio::time::sleep(Duration::from_secs(self.config.recovery_cooldown)).await;

        match self
            .mount(
                pair.clone(),
                point.local_dir.clone(),
                point.external_dir.clone(),
                point.target_dir.clone(),
            )
            .await
        {
            Ok(()) => {
                if consume_budget {
                    self.recovery_failures.remove(pair);
                }
                info!(pair = %pair, "remounted after crash");
            }
            Err(err) => {
                if !consume_budget {
                    self.mounts.write().await.insert(pair.clone(), point);
                    self.report_recoverable(pair, &err);
                    return;
                }
                let failures = {
                    let mut entry = self.recovery_failures.entry(pair.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if failures >= self.config.recovery_max_attempts {
                    error!(pair = %pair, failures, "recovery budget exhausted, dropping mount");
                    self.recovery_failures.remove(pair);
                    let fatal = Error::MountFailed(format!(
                        "recovery budget exhausted for {pair}: {err}"
                    ));
                    self.state.component_error("vfs", &fatal);
                    let _ = self
                        .activity
                        .append(ActivityRecord::new(
                            ActivityKind::Error,
                            Some(pair.clone()),
                            fatal.to_string(),
                        ))
                        .await;
                } else {
                    warn!(pair = %pair, failures, %err, "remount failed, budget remains");
                    // The pair stays tracked until the budget runs out.
                    self.mounts.write().await.insert(pair.clone(), point);
                    self.report_recoverable(pair, &err);
                }
            }
        }
    }

    fn report_recoverable(&self, _pair: &SyncPairId, err: &Error) {
        self.state.set_component("vfs", ComponentState::Error);
        self.notifier.publish(Event::ComponentError {
            component: "vfs".to_owned(),
            code: err.code().to_owned(),
            message: err.to_string(),
            recoverable: true,
        });
    }

    // --- filesystem-event callbacks (inbound from the adapter) ---

    /// A write went through the mount: the entry is dirty and a sync is
    /// debounced for the pair.
    pub async fn on_file_written(&self, pair: &SyncPairId, vpath: &VirtualPath) {
        let entry = self.catalog.get(pair, vpath).await;
        match entry {
            Some(mut entry) if !entry.is_directory => {
                let (size, modified_at) = match &entry.local_path {
                    Some(path) => stat_or(path, entry.size, entry.modified_at).await,
                    None => (entry.size, Utc::now()),
                };
                entry.mark_dirty(size, modified_at);
                if let Err(e) = self.catalog.put(entry).await {
                    warn!(path = %vpath, %e, "could not record write");
                }
            }
            Some(_) => {}
            None => {
                // A write to a path the index never saw: register it.
                if let Some(local_dir) = self.local_dir_of(pair).await {
                    let local_path = vpath.join_onto(&local_dir);
                    let (size, modified_at) = stat_or(&local_path, 0, Utc::now()).await;
                    let mut entry = FileEntry::new_local(
                        pair.clone(),
                        vpath.clone(),
                        local_path,
                        size,
                        modified_at,
                        false,
                    );
                    entry.is_dirty = true;
                    if let Err(e) = self.catalog.put(entry).await {
                        warn!(path = %vpath, %e, "could not register written file");
                    }
                }
            }
        }
        self.invalidate(pair, vpath).await;
        let _ = self.events.send(PairEvent::FileWritten { pair: pair.clone() });
    }

    /// A read went through the mount: refresh the LRU clock.
    pub async fn on_file_read(&self, pair: &SyncPairId, vpath: &VirtualPath) {
        self.catalog.touch_accessed(pair, vpath).await;
    }

    pub async fn on_file_created(
        &self,
        pair: &SyncPairId,
        vpath: &VirtualPath,
        local_path: PathBuf,
        is_directory: bool,
    ) {
        let (size, modified_at) = stat_or(&local_path, 0, Utc::now()).await;
        let mut entry = FileEntry::new_local(
            pair.clone(),
            vpath.clone(),
            local_path,
            if is_directory { 0 } else { size },
            modified_at,
            is_directory,
        );
        entry.is_dirty = !is_directory;
        if let Err(e) = self.catalog.put(entry).await {
            warn!(path = %vpath, %e, "could not register created file");
        }
        self.invalidate(pair, vpath).await;
    }

    pub async fn on_file_deleted(&self, pair: &SyncPairId, vpath: &VirtualPath) {
        let key = EntryKey::new(pair.clone(), vpath.clone());
        if let Err(e) = self.catalog.delete(&key).await {
            warn!(path = %vpath, %e, "could not drop deleted entry");
        }
        self.invalidate(pair, vpath).await;
    }

    pub async fn on_file_evicted(&self, pair: &SyncPairId, vpath: &VirtualPath) {
        if let Some(mut entry) = self.catalog.get(pair, vpath).await {
            entry.mark_evicted();
            if let Err(e) = self.catalog.put(entry).await {
                warn!(path = %vpath, %e, "could not record eviction");
            }
        }
        self.invalidate(pair, vpath).await;
    }

    async fn invalidate(&self, pair: &SyncPairId, vpath: &VirtualPath) {
        if let Some(delegate) = self.delegate(pair).await {
            delegate.invalidate(vpath);
        }
    }

    async fn local_dir_of(&self, pair: &SyncPairId) -> Option<PathBuf> {
        self.mounts
            .read()
            .await
            .get(pair)
            .map(|m| m.local_dir.clone())
    }
}

async fn stat_or(
    path: &Path,
    default_size: u64,
    default_mtime: DateTime<Utc>,
) -> (u64, DateTime<Utc>) {
    match tokio::fs::metadata(path).await {
        Ok(meta) => (
            meta.len(),
            meta.modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or(default_mtime),
        ),
        Err(_) => (default_size, default_mtime),
    }
}

/// Step 3 of the mount protocol: bring the target directory into a
/// mountable state.
///
/// A symlink target is removed; a populated directory either collides
/// with an existing backing directory (`ConflictingPaths`) or becomes
/// the backing directory via rename; an empty directory is removed so
/// the mount can recreate it.
async fn resolve_target_dir(local_dir: &Path, target_dir: &Path) -> Result<()> {
    let meta = match tokio::fs::symlink_metadata(target_dir).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.file_type().is_symlink() {
        tokio::fs::remove_file(target_dir).await?;
        return Ok(());
    }
    if !meta.is_dir() {
        tokio::fs::remove_file(target_dir).await?;
        return Ok(());
    }
    let mut reader = tokio::fs::read_dir(target_dir).await?;
    let populated = reader.next_entry().await?.is_some();
    if !populated {
        tokio::fs::remove_dir(target_dir).await?;
        return Ok(());
    }
    if tokio::fs::metadata(local_dir).await.is_ok() {
        return Err(Error::ConflictingPaths {
            local: local_dir.to_path_buf(),
            target: target_dir.to_path_buf(),
        });
    }
    // The populated target becomes the backing directory.
    tokio::fs::rename(target_dir, local_dir).await?;
    Ok(())
}
