//! Engine facade.
//!
//! Owns every component, wires the background tasks together the way
//! the daemon expects, and exposes the non-blocking command surface the
//! IPC adapter calls. One engine serves any number of sync pairs; each
//! pair gets its own pause/cancel flags and drives its own sync runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::{ActivityKind, ActivityLog, ActivityRecord};
use crate::catalog::{Catalog, SyncPairId};
use crate::config::Config;
use crate::conflict::ConflictResolver;
use crate::control::{CancelFlag, PauseFlag};
use crate::copier::{Copier, CopyOptions};
use crate::error::{Error, Result};
use crate::eviction::{EvictionEngine, EvictionOutcome, EvictionTrigger};
use crate::hasher::Hasher;
use crate::index::{IndexBuilder, IndexOutcome};
use crate::ipc::{Command, CommandReply, ServiceFullState};
use crate::lock_table::LockTable;
use crate::notifier::{Event, Notifier};
use crate::plan::{ConflictInfo, ConflictResolution, ConflictType};
use crate::scheduler::{PairEvent, Scheduler, SyncDriver};
use crate::state::{ComponentState, GlobalState, Operation, StateManager};
use crate::sync::{SyncContext, SyncEngine, SyncOptions, SyncOutcome, SyncStateStore};
use crate::vfs::{AdapterFactory, VfsManager};

/// Static description of one pair.
#[derive(Debug, Clone)]
pub struct PairConfig {
    pub local_dir: PathBuf,
    pub external_dir: Option<PathBuf>,
    pub target_dir: PathBuf,
    /// Volume name of the disk carrying the external directory, matched
    /// against disk events.
    pub disk_name: Option<String>,
}

struct PairRuntime {
    config: PairConfig,
    pause: PauseFlag,
    cancel: CancelFlag,
    syncing: AtomicBool,
    last_sync: std::sync::Mutex<Option<DateTime<Utc>>>,
}

pub struct Engine {
    config: Config,
    catalog: Arc<Catalog>,
    locks: Arc<LockTable>,
    state: Arc<StateManager>,
    notifier: Arc<Notifier>,
    activity: Arc<ActivityLog>,
    index: Arc<IndexBuilder>,
    sync_states: Arc<SyncStateStore>,
    vfs: Arc<VfsManager>,
    eviction: Arc<EvictionEngine>,
    pairs: DashMap<SyncPairId, Arc<PairRuntime>>,
    events_tx: mpsc::UnboundedSender<PairEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<PairEvent>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Seconds between periodic catalog saves.
    const CATALOG_SAVE_INTERVAL: Duration = Duration::from_secs(60);

    pub async fn new(config: Config, adapters: Arc<dyn AdapterFactory>) -> Result<Arc<Self>> {
        let state_dir = config.state_dir();
        tokio::fs::create_dir_all(&state_dir).await?;

        let notifier = Arc::new(Notifier::new());
        let state = Arc::new(StateManager::new(Arc::clone(&notifier)));
        // A snapshot that fails to decode is discarded; the index
        // rebuild at the next mount repopulates the catalog.
        let catalog = match Catalog::open(state_dir.join("catalog.json")).await {
            Ok(catalog) => Arc::new(catalog),
            Err(Error::Corrupt(msg)) => {
                warn!(%msg, "catalog snapshot corrupt, starting empty");
                let path = state_dir.join("catalog.json");
                let _ = tokio::fs::remove_file(&path).await;
                Arc::new(Catalog::open(path).await?)
            }
            Err(e) => return Err(e),
        };
        let locks = Arc::new(LockTable::new());
        let activity = Arc::new(ActivityLog::new(
            state_dir.join("activities.json"),
            Arc::clone(&notifier),
        ));
        let index = Arc::new(IndexBuilder::new(
            Arc::clone(&catalog),
            Arc::clone(&notifier),
            Arc::clone(&activity),
            config.sync.exclude_patterns.clone(),
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let vfs = Arc::new(VfsManager::new(
            Arc::clone(&catalog),
            Arc::clone(&locks),
            Arc::clone(&state),
            Arc::clone(&notifier),
            Arc::clone(&activity),
            Arc::clone(&index),
            adapters,
            config.vfs.clone(),
            events_tx.clone(),
        ));
        let eviction = Arc::new(EvictionEngine::new(
            Arc::clone(&catalog),
            Arc::clone(&locks),
            Arc::clone(&notifier),
            Arc::clone(&activity),
            config.eviction.clone(),
            Hasher::new(config.sync.checksum_algorithm),
        ));
        let sync_states = Arc::new(SyncStateStore::new(state_dir.join("sync-state")));

        Ok(Arc::new(Self {
            config,
            catalog,
            locks,
            state,
            notifier,
            activity,
            index,
            sync_states,
            vfs,
            eviction,
            pairs: DashMap::new(),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            tasks: std::sync::Mutex::new(Vec::new()),
        }))
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn vfs(&self) -> &Arc<VfsManager> {
        &self.vfs
    }

    /// Spawn the background tasks: scheduler, lock watchdog, periodic
    /// catalog saves and the periodic eviction check. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let Some(events_rx) = self.events_rx.lock().expect("events lock").take() else {
            return Ok(());
        };
        self.state.transition(GlobalState::IpcReady)?;

        let driver: Arc<dyn SyncDriver> = Arc::clone(self) as Arc<dyn SyncDriver>;
        let scheduler = Arc::new(Scheduler::new(
            driver,
            Arc::clone(&self.notifier),
            Duration::from_secs(self.config.sync.debounce_interval),
        ));
        let mut tasks = scheduler.spawn(events_rx);

        tasks.push(
            self.locks
                .spawn_watchdog(Duration::from_secs(self.config.lock.watchdog_ttl)),
        );

        let catalog = Arc::clone(&self.catalog);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Self::CATALOG_SAVE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = catalog.force_save().await {
                    warn!(%e, "periodic catalog save failed");
                }
            }
        }));

        if self.config.eviction.enabled {
            let engine = Arc::clone(self);
            let check_interval = Duration::from_secs(self.config.eviction.check_interval.max(1));
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(check_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    for pair in engine.pairs() {
                        if engine.eviction.over_threshold(&pair).await {
                            let _ = engine
                                .eviction
                                .run(&pair, EvictionTrigger::ThresholdCrossed, &CancelFlag::new())
                                .await;
                        }
                    }
                }
            }));
        }

        self.tasks.lock().expect("tasks lock").extend(tasks);

        // Listing resumable states also purges the expired ones.
        if let Ok(resumable) = self.sync_states.get_resumable_states().await {
            for state in &resumable {
                info!(pair = %state.sync_pair_id, "resumable sync state found");
            }
        }
        info!("engine started");
        Ok(())
    }

    /// Register a pair and mount its overlay.
    pub async fn add_pair(&self, id: &str, config: PairConfig) -> Result<()> {
        let pair = SyncPairId::new(id);
        if self.pairs.contains_key(&pair) {
            return Err(Error::AlreadyExists(config.target_dir));
        }
        self.vfs
            .mount(
                pair.clone(),
                config.local_dir.clone(),
                config.external_dir.clone(),
                config.target_dir.clone(),
            )
            .await?;
        self.pairs.insert(
            pair,
            Arc::new(PairRuntime {
                config,
                pause: PauseFlag::new(),
                cancel: CancelFlag::new(),
                syncing: AtomicBool::new(false),
                last_sync: std::sync::Mutex::new(None),
            }),
        );
        Ok(())
    }

    fn runtime(&self, pair: &SyncPairId) -> Result<Arc<PairRuntime>> {
        self.pairs
            .get(pair)
            .map(|rt| Arc::clone(rt.value()))
            .ok_or_else(|| Error::NotFound(PathBuf::from(pair.as_str())))
    }

    /// Run one sync for the pair and wait for its outcome. The
    /// non-blocking IPC path spawns this.
    pub async fn run_sync(&self, pair: &SyncPairId) -> Result<SyncOutcome> {
        let rt = self.runtime(pair)?;
        let Some(external_dir) = rt.config.external_dir.clone() else {
            let err = Error::DiskNotConnected(pair.as_str().to_owned());
            self.state.component_error("sync", &err);
            return Err(err);
        };
        if tokio::fs::metadata(&external_dir).await.is_err() {
            let err = Error::DiskNotConnected(external_dir.display().to_string());
            self.state.component_error("sync", &err);
            return Err(err);
        }
        if rt.syncing.swap(true, Ordering::SeqCst) {
            debug!(pair = %pair, "sync already running");
            return Err(Error::Unavailable(format!("sync already running for {pair}")));
        }

        let _ = self.state.transition(GlobalState::Running);
        self.state.set_component("sync", ComponentState::Busy);
        rt.cancel.reset();

        let ctx = SyncContext {
            pair: pair.clone(),
            local_root: rt.config.local_dir.clone(),
            external_root: external_dir,
            catalog: Arc::clone(&self.catalog),
            locks: Arc::clone(&self.locks),
            state_store: Arc::clone(&self.sync_states),
            notifier: Arc::clone(&self.notifier),
            activity: Arc::clone(&self.activity),
        };
        let engine = SyncEngine::new(
            ctx,
            SyncOptions::from(&self.config.sync),
            rt.pause.clone(),
            rt.cancel.clone(),
        );
        let result = engine.sync().await;
        rt.syncing.store(false, Ordering::SeqCst);
        let _ = self.state.transition(GlobalState::Ready);

        match result {
            Ok(outcome) => {
                *rt.last_sync.lock().expect("last_sync lock") = Some(Utc::now());
                self.state.set_component("sync", ComponentState::Ready);
                Ok(outcome)
            }
            Err(err) => {
                self.state.component_error("sync", &err);
                Err(err)
            }
        }
    }

    /// Non-blocking `syncNow`.
    pub fn sync_now(self: &Arc<Self>, pair: &SyncPairId) -> Result<()> {
        self.runtime(pair)?;
        let engine = Arc::clone(self);
        let pair = pair.clone();
        tokio::spawn(async move {
            let _ = engine.run_sync(&pair).await;
        });
        Ok(())
    }

    pub fn sync_all(self: &Arc<Self>) {
        for pair in self.pairs() {
            let _ = self.sync_now(&pair);
        }
    }

    pub fn pause_sync(&self, pair: &SyncPairId) -> Result<()> {
        let rt = self.runtime(pair)?;
        rt.pause.pause();
        self.notifier.publish(Event::SyncStatusChanged {
            sync_pair_id: pair.clone(),
            status: "paused".to_owned(),
            message: None,
        });
        Ok(())
    }

    pub fn resume_sync(&self, pair: &SyncPairId) -> Result<()> {
        let rt = self.runtime(pair)?;
        rt.pause.resume();
        self.notifier.publish(Event::SyncStatusChanged {
            sync_pair_id: pair.clone(),
            status: "resumed".to_owned(),
            message: None,
        });
        Ok(())
    }

    pub fn cancel_sync(&self, pair: &SyncPairId) -> Result<()> {
        let rt = self.runtime(pair)?;
        rt.cancel.cancel();
        Ok(())
    }

    /// Rebuild the catalog for a pair, gating reads while it runs.
    pub async fn rebuild_index(&self, pair: &SyncPairId) -> Result<IndexOutcome> {
        let rt = self.runtime(pair)?;
        let delegate = self.vfs.delegate(pair).await;
        if let Some(delegate) = &delegate {
            delegate.set_index_ready(false);
        }
        let result = self
            .index
            .build(
                pair,
                &rt.config.local_dir,
                rt.config.external_dir.as_deref(),
                &CancelFlag::new(),
            )
            .await;
        if let Some(delegate) = &delegate {
            delegate.set_index_ready(true);
        }
        if result.is_ok() {
            self.notifier.publish(Event::IndexReady {
                sync_pair_id: pair.clone(),
            });
        }
        result
    }

    pub async fn trigger_eviction(&self, pair: &SyncPairId) -> Result<EvictionOutcome> {
        self.runtime(pair)?;
        self.eviction
            .run(pair, EvictionTrigger::Manual, &CancelFlag::new())
            .await
    }

    /// Pre-write space request: free at least `bytes` from the local
    /// store before a large write proceeds.
    pub async fn request_space(&self, pair: &SyncPairId, bytes: u64) -> Result<EvictionOutcome> {
        self.runtime(pair)?;
        self.eviction
            .run(pair, EvictionTrigger::SpaceRequest(bytes), &CancelFlag::new())
            .await
    }

    /// Apply an explicit resolution to a conflicted path.
    pub async fn resolve_conflict(
        &self,
        pair: &SyncPairId,
        relative_path: &str,
        resolution: ConflictResolution,
    ) -> Result<()> {
        let rt = self.runtime(pair)?;
        let Some(external_dir) = rt.config.external_dir.clone() else {
            return Err(Error::DiskNotConnected(pair.as_str().to_owned()));
        };
        let conflict = ConflictInfo {
            relative_path: relative_path.to_owned(),
            local_meta: None,
            external_meta: None,
            conflict_type: ConflictType::BothModified,
            resolution: Some(resolution),
        };
        let resolver = ConflictResolver::new(self.config.sync.conflict_strategy);
        let copier = Copier::new(
            CopyOptions {
                verify_after_copy: self.config.sync.verify_after_copy,
                buffer_size: self.config.sync.buffer_size,
                ..Default::default()
            },
            Hasher::new(self.config.sync.checksum_algorithm),
            rt.pause.clone(),
            rt.cancel.clone(),
        );
        resolver
            .execute(
                &conflict,
                resolution,
                &rt.config.local_dir,
                &external_dir,
                &copier,
            )
            .await?;
        let _ = self
            .activity
            .append(ActivityRecord::new(
                ActivityKind::ConflictResolved,
                Some(pair.clone()),
                format!("{relative_path}: {resolution:?}"),
            ))
            .await;
        Ok(())
    }

    /// Inject a platform disk event.
    pub fn on_disk_event(&self, disk_name: &str, connected: bool) {
        let event = if connected {
            PairEvent::DiskConnected {
                disk_name: disk_name.to_owned(),
            }
        } else {
            PairEvent::DiskDisconnected {
                disk_name: disk_name.to_owned(),
            }
        };
        let _ = self.events_tx.send(event);
    }

    pub async fn handle_wake_from_sleep(&self) {
        self.vfs.handle_wake_from_sleep().await;
    }

    pub async fn full_state(&self) -> ServiceFullState {
        let last_sync_times = self
            .pairs
            .iter()
            .filter_map(|kv| {
                let at = *kv.value().last_sync.lock().expect("last_sync lock");
                at.map(|at| (kv.key().as_str().to_owned(), at))
            })
            .collect::<BTreeMap<_, _>>();
        ServiceFullState {
            global_state: self.state.current(),
            component_states: self.state.components(),
            mounts: self.vfs.summaries().await,
            last_sync_times,
            activities: self.activity.list().await,
        }
    }

    /// Non-blocking command dispatch for the IPC adapter.
    pub async fn dispatch(self: &Arc<Self>, command: Command) -> CommandReply {
        if !self.state.can_perform(Operation::StatusQuery) {
            return CommandReply::Rejected {
                reason: "engine unavailable".to_owned(),
            };
        }
        let reply = match command {
            Command::GetFullState => {
                return CommandReply::FullState {
                    state: self.full_state().await,
                }
            }
            Command::ListActivities => {
                return CommandReply::Activities {
                    activities: self.activity.list().await,
                }
            }
            Command::SyncNow { sync_pair_id } => {
                self.sync_now(&SyncPairId::new(sync_pair_id)).map(|_| ())
            }
            Command::SyncAll => {
                self.sync_all();
                Ok(())
            }
            Command::PauseSync { sync_pair_id } => {
                self.pause_sync(&SyncPairId::new(sync_pair_id))
            }
            Command::ResumeSync { sync_pair_id } => {
                self.resume_sync(&SyncPairId::new(sync_pair_id))
            }
            Command::CancelSync { sync_pair_id } => {
                self.cancel_sync(&SyncPairId::new(sync_pair_id))
            }
            Command::RebuildIndex { sync_pair_id } => {
                let engine = Arc::clone(self);
                let pair = SyncPairId::new(sync_pair_id);
                match self.runtime(&pair) {
                    Ok(_) => {
                        tokio::spawn(async move {
                            let _ = engine.rebuild_index(&pair).await;
                        });
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Command::TriggerEviction { sync_pair_id } => {
                let engine = Arc::clone(self);
                let pair = SyncPairId::new(sync_pair_id);
                match self.runtime(&pair) {
                    Ok(_) => {
                        tokio::spawn(async move {
                            let _ = engine.trigger_eviction(&pair).await;
                        });
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Command::ResolveConflict {
                sync_pair_id,
                relative_path,
                resolution,
            } => {
                let engine = Arc::clone(self);
                let pair = SyncPairId::new(sync_pair_id);
                match self.runtime(&pair) {
                    Ok(_) => {
                        tokio::spawn(async move {
                            let _ = engine
                                .resolve_conflict(&pair, &relative_path, resolution)
                                .await;
                        });
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        };
        match reply {
            Ok(()) => CommandReply::Accepted,
            Err(e) => CommandReply::Rejected {
                reason: e.to_string(),
            },
        }
    }

    /// Stop background work, unmount everything and persist state.
    pub async fn shutdown(&self) {
        let _ = self.state.transition(GlobalState::Stopping);
        for kv in self.pairs.iter() {
            kv.value().cancel.cancel();
        }
        for task in self.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
        self.vfs.unmount_all().await;
        let _ = self.catalog.force_save().await;
        let _ = self.state.transition(GlobalState::Stopped);
        info!("engine stopped");
    }
}

#[async_trait]
impl SyncDriver for Engine {
    fn pairs(&self) -> Vec<SyncPairId> {
        self.pairs.iter().map(|kv| kv.key().clone()).collect()
    }

    fn pairs_on_disk(&self, disk_name: &str) -> Vec<SyncPairId> {
        self.pairs
            .iter()
            .filter(|kv| kv.value().config.disk_name.as_deref() == Some(disk_name))
            .map(|kv| kv.key().clone())
            .collect()
    }

    async fn auto_sync_due(&self, pair: &SyncPairId) -> bool {
        if !self.state.can_perform(Operation::Filesystem) {
            return false;
        }
        let Ok(rt) = self.runtime(pair) else {
            return false;
        };
        if rt.syncing.load(Ordering::SeqCst) || rt.pause.is_paused() {
            return false;
        }
        let last_sync = *rt.last_sync.lock().expect("last_sync lock");
        match last_sync {
            None => true,
            Some(at) => {
                (Utc::now() - at).num_seconds() >= self.config.sync.auto_interval as i64
            }
        }
    }

    async fn has_dirty_files(&self, pair: &SyncPairId) -> bool {
        !self.catalog.needs_sync(pair).await.is_empty()
    }

    async fn sync_pair(&self, pair: &SyncPairId) {
        if let Err(e) = self.run_sync(pair).await {
            debug!(pair = %pair, %e, "scheduled sync did not run");
        }
    }

    async fn pause_pair(&self, pair: &SyncPairId) {
        let _ = self.pause_sync(pair);
    }

    async fn resume_pair(&self, pair: &SyncPairId) {
        let _ = self.resume_sync(pair);
    }
}
