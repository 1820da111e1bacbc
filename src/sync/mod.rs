//! Sync pipeline orchestration.
//!
//! One [`SyncEngine`] drives a single run for one pair through its
//! phases: resume check, scan, optional checksum, diff, conflict
//! resolution, durable state creation, directory pre-pass, lock phase,
//! copy phase with checkpoints, delete phase, optional verify phase and
//! finalize. Per-file failures are collected and the run continues;
//! phase-level failures abort it. Pause and cancel act through the
//! shared flags, and an interrupted run resumes from its persisted
//! state.

mod progress;
mod state;

pub use progress::ProgressThrottle;
pub use state::{FailedAction, SyncPhase, SyncState, SyncStateStore};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::activity::{ActivityKind, ActivityLog, ActivityRecord};
use crate::catalog::{Catalog, EntryKey, FileEntry, Location, SyncPairId, VirtualPath};
use crate::config::SyncConfig;
use crate::conflict::{ConflictPrompt, ConflictResolver, ConflictStrategy};
use crate::control::{CancelFlag, PauseFlag};
use crate::copier::{Copier, CopyOptions};
use crate::diff::{DiffEngine, DiffOptions};
use crate::error::{Error, Result};
use crate::filter::PathFilter;
use crate::hasher::{HashAlgorithm, Hasher};
use crate::lock_table::{LockTable, SyncDirection, SyncLockGuard};
use crate::notifier::{Event, Notifier};
use crate::plan::{ConflictInfo, ConflictType, SyncAction, SyncPlan};
use crate::scanner::{DirectorySnapshot, ScanOptions, Scanner};

/// Per-run knobs, lifted from `[sync]` configuration.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub enable_checksum: bool,
    pub checksum_algorithm: HashAlgorithm,
    pub verify_after_copy: bool,
    pub conflict_strategy: ConflictStrategy,
    pub enable_delete: bool,
    pub parallel_ops: usize,
    pub buffer_size: usize,
    pub exclude_patterns: Vec<String>,
    pub max_file_size: Option<u64>,
    pub checkpoint_interval: usize,
    pub time_tolerance: f64,
    pub detect_moves: bool,
}

impl From<&SyncConfig> for SyncOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            enable_checksum: config.enable_checksum,
            checksum_algorithm: config.checksum_algorithm,
            verify_after_copy: config.verify_after_copy,
            conflict_strategy: config.conflict_strategy,
            enable_delete: config.enable_delete,
            parallel_ops: config.parallel_ops,
            buffer_size: config.buffer_size,
            exclude_patterns: config.exclude_patterns.clone(),
            max_file_size: config.max_file_size,
            checkpoint_interval: config.checkpoint_interval.max(1),
            time_tolerance: config.time_tolerance,
            detect_moves: config.detect_moves,
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        (&SyncConfig::default()).into()
    }
}

/// Final report of one sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub succeeded_actions: u64,
    pub failed_actions: Vec<FailedAction>,
    pub files_synced: u64,
    pub bytes_transferred: u64,
    pub files_verified: u64,
    pub verification_failures: u64,
    pub conflicts: Vec<ConflictInfo>,
    pub conflicts_resolved: u64,
    /// Files skipped because their sync lock could not be taken; the
    /// next cycle picks them up.
    pub deferred: Vec<String>,
    pub was_cancelled: bool,
    pub was_resumed: bool,
}

impl SyncOutcome {
    pub fn success(&self) -> bool {
        !self.was_cancelled && self.failed_actions.is_empty() && self.verification_failures == 0
    }

    fn cancelled() -> Self {
        Self {
            was_cancelled: true,
            ..Default::default()
        }
    }
}

/// Everything a sync run needs from the surrounding engine.
pub struct SyncContext {
    pub pair: SyncPairId,
    pub local_root: PathBuf,
    pub external_root: PathBuf,
    pub catalog: Arc<Catalog>,
    pub locks: Arc<LockTable>,
    pub state_store: Arc<SyncStateStore>,
    pub notifier: Arc<Notifier>,
    pub activity: Arc<ActivityLog>,
}

#[derive(Default)]
struct RunStats {
    deferred: Vec<String>,
    files_verified: u64,
    verification_failures: u64,
    conflicts_resolved: u64,
}

pub struct SyncEngine {
    ctx: SyncContext,
    options: SyncOptions,
    pause: PauseFlag,
    cancel: CancelFlag,
    prompt: Option<Arc<dyn ConflictPrompt>>,
}

impl SyncEngine {
    pub fn new(
        ctx: SyncContext,
        options: SyncOptions,
        pause: PauseFlag,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            ctx,
            options,
            pause,
            cancel,
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn ConflictPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Run a full sync for the pair. Cancellation yields a normal
    /// outcome with `was_cancelled = true`; phase-level failures come
    /// back as errors.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        match self.sync_inner().await {
            Err(Error::Cancelled) => {
                self.emit_status(SyncPhase::Cancelled, None);
                Ok(SyncOutcome::cancelled())
            }
            other => other,
        }
    }

    async fn sync_inner(&self) -> Result<SyncOutcome> {
        // Phase 1: a resumable state short-circuits into the copy phase.
        if let Some(existing) = self.ctx.state_store.load(&self.ctx.pair).await? {
            if existing.is_resumable() {
                info!(
                    pair = %self.ctx.pair,
                    pending = existing.pending_indices.len(),
                    "resuming interrupted sync"
                );
                return self.run_actions(existing, true).await;
            }
        }

        // Phase 2: scan both sides in parallel.
        self.emit_status(SyncPhase::Scanning, None);
        let filter = PathFilter::new(&self.options.exclude_patterns)?;
        let scanner = Scanner::new(
            ScanOptions {
                follow_symlinks: false,
                max_file_size: self.options.max_file_size,
                time_tolerance: self.options.time_tolerance,
            },
            filter,
        );
        let (mut local_snap, mut external_snap) = tokio::try_join!(
            scanner.scan(&self.ctx.local_root, &self.cancel),
            scanner.scan(&self.ctx.external_root, &self.cancel),
        )?;

        // Phase 3: checksums feed both the diff and the catalog baseline.
        if self.options.enable_checksum {
            self.emit_status(SyncPhase::Checksumming, None);
            self.fill_checksums(&mut local_snap).await;
            self.fill_checksums(&mut external_snap).await;
        }

        // Phase 4: diff.
        self.emit_status(SyncPhase::Diffing, None);
        let diff_engine = DiffEngine::new(DiffOptions {
            enable_delete: self.options.enable_delete,
            time_tolerance: self.options.time_tolerance,
            compare_checksums: self.options.enable_checksum,
            detect_moves: self.options.detect_moves,
        });
        let plan = diff_engine.diff(&local_snap, &external_snap);

        // Phase 5: conflict detection and resolution.
        self.emit_status(SyncPhase::ResolvingConflicts, None);
        let plan = self
            .resolve_conflicts(plan, &local_snap, &external_snap)
            .await?;

        // Phase 6: durable state with every action pending.
        let state = SyncState::new(self.ctx.pair.clone(), plan);
        self.ctx.state_store.save(&state).await?;

        self.run_actions(state, false).await
    }

    /// Phases 7..13 over a (fresh or resumed) state.
    async fn run_actions(&self, mut state: SyncState, resumed: bool) -> Result<SyncOutcome> {
        let mut stats = RunStats::default();
        let result = self.run_phases(&mut state, &mut stats).await;
        match result {
            Ok(()) => {
                self.finalize_catalog(&state).await?;
                state.set_phase(SyncPhase::Completed);
                self.ctx.state_store.clear(&self.ctx.pair).await?;
                self.emit_status(SyncPhase::Completed, None);
                self.ctx.notifier.publish(Event::SyncCompleted {
                    sync_pair_id: self.ctx.pair.clone(),
                    files_count: state.processed_files,
                    bytes_count: state.processed_bytes,
                });
                if state.plan.mutating_actions() > 0 {
                    let _ = self
                        .ctx
                        .activity
                        .append(ActivityRecord::new(
                            ActivityKind::SyncCompleted,
                            Some(self.ctx.pair.clone()),
                            format!(
                                "synced {} files ({} bytes)",
                                state.processed_files, state.processed_bytes
                            ),
                        ))
                        .await;
                }
                Ok(self.outcome(&state, stats, resumed, false))
            }
            Err(Error::Cancelled) => {
                state.set_phase(SyncPhase::Cancelled);
                let _ = self.ctx.state_store.save(&state).await;
                self.emit_status(SyncPhase::Cancelled, None);
                Ok(self.outcome(&state, stats, resumed, true))
            }
            Err(err) => {
                state.set_phase(SyncPhase::Failed);
                let _ = self.ctx.state_store.save(&state).await;
                self.emit_status(SyncPhase::Failed, Some(err.to_string()));
                Err(err)
            }
        }
    }

    async fn run_phases(&self, state: &mut SyncState, stats: &mut RunStats) -> Result<()> {
        let started = Instant::now();
        let mut throttle = ProgressThrottle::default();
        let copier = Copier::new(
            CopyOptions {
                overwrite_existing: true,
                verify_after_copy: self.options.verify_after_copy,
                preserve_times: true,
                buffer_size: self.options.buffer_size,
            },
            self.hasher(),
            self.pause.clone(),
            self.cancel.clone(),
        );
        let resolver = {
            let mut resolver = ConflictResolver::new(self.options.conflict_strategy);
            if let Some(prompt) = &self.prompt {
                resolver = resolver.with_prompt(Arc::clone(prompt));
            }
            resolver
        };

        // Phase 7: directories, parents first.
        state.set_phase(SyncPhase::PreparingDirectories);
        self.emit_status(SyncPhase::PreparingDirectories, None);
        for index in state.pending_indices.iter().copied().collect::<Vec<_>>() {
            let SyncAction::CreateDirectory {
                relative_path,
                destination,
            } = state.plan.actions[index].clone()
            else {
                continue;
            };
            self.cancel.check()?;
            match tokio::fs::create_dir_all(&destination).await {
                Ok(()) => state.mark_completed(index, 0, false),
                Err(e) => state.mark_failed(index, &relative_path, e.to_string()),
            }
        }

        // Detected moves become destination-side renames; a rename whose
        // target already exists was applied by an earlier attempt.
        for mv in state.plan.moves.clone() {
            self.cancel.check()?;
            if tokio::fs::metadata(&mv.destination_to).await.is_ok() {
                continue;
            }
            if let Err(e) = tokio::fs::rename(&mv.destination_from, &mv.destination_to).await {
                warn!(from = %mv.from_relative, to = %mv.to_relative, %e, "move failed");
                state.failed_actions.push(FailedAction {
                    relative_path: mv.from_relative.clone(),
                    message: e.to_string(),
                });
            }
        }

        // Phase 8: sync locks; unacquirable files defer to the next run.
        let holder = format!("sync:{}", self.ctx.pair);
        let mut guard = SyncLockGuard::new(
            Arc::clone(&self.ctx.locks),
            self.ctx.pair.clone(),
            holder,
        );
        for index in state.pending_indices.iter().copied().collect::<Vec<_>>() {
            if !state.plan.actions[index].is_copy_like() {
                continue;
            }
            let rel = state.plan.actions[index].relative_path().to_owned();
            match VirtualPath::from_relative(&rel) {
                Ok(vpath) => {
                    if !guard.try_lock(&vpath, SyncDirection::LocalToExternal) {
                        debug!(path = %rel, "lock unavailable, deferring");
                        state.defer(index);
                        stats.deferred.push(rel);
                    }
                }
                Err(message) => state.mark_failed(index, &rel, message),
            }
        }

        // Phase 9: copy with periodic checkpoints.
        state.set_phase(SyncPhase::Copying);
        self.emit_status(SyncPhase::Copying, None);
        let mut since_checkpoint = 0usize;
        for index in state.pending_indices.iter().copied().collect::<Vec<_>>() {
            let action = state.plan.actions[index].clone();
            match action {
                SyncAction::Copy {
                    relative_path,
                    source,
                    destination,
                    ..
                }
                | SyncAction::Update {
                    relative_path,
                    source,
                    destination,
                    ..
                } => {
                    self.emit_progress(state, Some(&relative_path), started, &mut throttle);
                    match copier.copy_file(&source, &destination).await {
                        Ok(bytes) => {
                            state.mark_completed(index, bytes, true);
                            since_checkpoint += 1;
                        }
                        Err(Error::Cancelled) => return Err(Error::Cancelled),
                        Err(e) => {
                            warn!(path = %relative_path, %e, "copy failed");
                            state.mark_failed(index, &relative_path, e.to_string());
                        }
                    }
                }
                SyncAction::ResolveConflict { conflict } => {
                    let resolution = match conflict.resolution {
                        Some(resolution) => resolution,
                        None => resolver.choose(&conflict).await,
                    };
                    match resolver
                        .execute(
                            &conflict,
                            resolution,
                            &self.ctx.local_root,
                            &self.ctx.external_root,
                            &copier,
                        )
                        .await
                    {
                        Ok(_) => {
                            state.mark_completed(index, 0, false);
                            stats.conflicts_resolved += 1;
                            since_checkpoint += 1;
                            let _ = self
                                .ctx
                                .activity
                                .append(ActivityRecord::new(
                                    ActivityKind::ConflictResolved,
                                    Some(self.ctx.pair.clone()),
                                    format!("{}: {:?}", conflict.relative_path, resolution),
                                ))
                                .await;
                        }
                        Err(Error::Cancelled) => return Err(Error::Cancelled),
                        Err(e) => {
                            state.mark_failed(index, &conflict.relative_path, e.to_string())
                        }
                    }
                }
                SyncAction::Skip { .. } => state.mark_completed(index, 0, false),
                _ => continue,
            }
            if since_checkpoint >= self.options.checkpoint_interval {
                self.ctx.state_store.save(state).await?;
                since_checkpoint = 0;
            }
        }

        // Phase 10: locks go with the guard, whatever happened above.
        drop(guard);

        // Phase 11: deletes, already ordered children first. A target
        // that is already gone counts as done so resumes stay idempotent.
        state.set_phase(SyncPhase::Deleting);
        self.emit_status(SyncPhase::Deleting, None);
        for index in state.pending_indices.iter().copied().collect::<Vec<_>>() {
            let SyncAction::Delete {
                relative_path,
                target,
                is_directory,
            } = state.plan.actions[index].clone()
            else {
                continue;
            };
            self.cancel.check()?;
            let removed = if is_directory {
                tokio::fs::remove_dir(&target).await
            } else {
                tokio::fs::remove_file(&target).await
            };
            match removed {
                Ok(()) => state.mark_completed(index, 0, false),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    state.mark_completed(index, 0, false)
                }
                Err(e) => state.mark_failed(index, &relative_path, e.to_string()),
            }
        }

        // Phase 12: verification pass over everything copied.
        if self.options.verify_after_copy {
            state.set_phase(SyncPhase::Verifying);
            self.emit_status(SyncPhase::Verifying, None);
            let hasher = self.hasher();
            for index in state.completed_indices.iter().copied().collect::<Vec<_>>() {
                let (source, destination) = match &state.plan.actions[index] {
                    SyncAction::Copy {
                        source, destination, ..
                    }
                    | SyncAction::Update {
                        source, destination, ..
                    } => (source.clone(), destination.clone()),
                    _ => continue,
                };
                self.cancel.check()?;
                let expected = hasher.hash_file(&source, &self.cancel).await;
                let actual = hasher.hash_file(&destination, &self.cancel).await;
                match (expected, actual) {
                    (Ok(a), Ok(b)) if a == b => stats.files_verified += 1,
                    (Err(Error::Cancelled), _) | (_, Err(Error::Cancelled)) => {
                        return Err(Error::Cancelled)
                    }
                    _ => stats.verification_failures += 1,
                }
            }
        }

        self.emit_progress(state, None, started, &mut ProgressThrottle::new(
            std::time::Duration::ZERO,
            0.0,
        ));
        Ok(())
    }

    /// Reclassify updates whose external side drifted from the catalog
    /// baseline, then pick a resolution for every conflict and rebuild
    /// the plan with the resolutions attached.
    async fn resolve_conflicts(
        &self,
        plan: SyncPlan,
        local_snap: &DirectorySnapshot,
        external_snap: &DirectorySnapshot,
    ) -> Result<SyncPlan> {
        let mut conflicts = plan.conflicts.clone();
        let mut actions = Vec::with_capacity(plan.actions.len());
        for action in plan.actions {
            match action {
                SyncAction::ResolveConflict { .. } => {} // re-appended below
                SyncAction::Update { .. } => {
                    let relative_path = action.relative_path().to_owned();
                    if self.update_is_conflict(&relative_path, external_snap).await {
                        conflicts.push(ConflictInfo {
                            local_meta: local_snap.get(&relative_path).cloned(),
                            external_meta: external_snap.get(&relative_path).cloned(),
                            relative_path,
                            conflict_type: ConflictType::BothModified,
                            resolution: None,
                        });
                    } else {
                        actions.push(action);
                    }
                }
                other => actions.push(other),
            }
        }

        if !conflicts.is_empty() {
            let resolver = {
                let mut resolver = ConflictResolver::new(self.options.conflict_strategy);
                if let Some(prompt) = &self.prompt {
                    resolver = resolver.with_prompt(Arc::clone(prompt));
                }
                resolver
            };
            for conflict in &mut conflicts {
                if conflict.resolution.is_none() {
                    conflict.resolution = Some(resolver.choose(conflict).await);
                }
            }
            self.ctx.notifier.publish(Event::ConflictDetected {
                conflicts: conflicts.clone(),
            });
            for conflict in &conflicts {
                actions.push(SyncAction::ResolveConflict {
                    conflict: conflict.clone(),
                });
            }
        }

        Ok(SyncPlan::new(
            plan.source_root,
            plan.destination_root,
            actions,
            conflicts,
            plan.moves,
        ))
    }

    /// An update is a conflict when the external file no longer matches
    /// the baseline the last sync recorded, or when no sync ever
    /// established a baseline for a path that now differs on both
    /// sides.
    async fn update_is_conflict(
        &self,
        relative_path: &str,
        external_snap: &DirectorySnapshot,
    ) -> bool {
        let Ok(vpath) = VirtualPath::from_relative(relative_path) else {
            return false;
        };
        match self.ctx.catalog.get(&self.ctx.pair, &vpath).await {
            None => true,
            Some(entry) => match (
                entry.checksum.as_deref(),
                external_snap
                    .get(relative_path)
                    .and_then(|m| m.checksum.as_deref()),
            ) {
                (Some(baseline), Some(current)) => baseline != current,
                // Never synced: the external copy is not ours to
                // overwrite.
                (None, _) => true,
                (Some(_), None) => false,
            },
        }
    }

    async fn fill_checksums(&self, snapshot: &mut DirectorySnapshot) {
        let targets: Vec<String> = snapshot
            .files
            .iter()
            .filter(|(_, meta)| {
                !meta.is_directory && !meta.is_symlink && meta.checksum.is_none()
            })
            .map(|(rel, _)| rel.clone())
            .collect();
        if targets.is_empty() {
            return;
        }
        let paths: Vec<PathBuf> = targets.iter().map(|rel| snapshot.absolute(rel)).collect();
        let digests = self.hasher().hash_files_parallel(&paths, &self.cancel).await;
        for (rel, digest) in targets.into_iter().zip(digests) {
            if let Some(meta) = snapshot.files.get_mut(&rel) {
                meta.checksum = digest;
            }
        }
    }

    /// Fold the completed actions back into the catalog: copied files
    /// become `both` and clean, deleted files lose their entry.
    async fn finalize_catalog(&self, state: &SyncState) -> Result<()> {
        let mut upserts: Vec<FileEntry> = Vec::new();
        let mut removals: Vec<EntryKey> = Vec::new();
        for index in &state.completed_indices {
            match &state.plan.actions[*index] {
                SyncAction::Copy {
                    relative_path,
                    source,
                    destination,
                    size,
                    checksum,
                }
                | SyncAction::Update {
                    relative_path,
                    source,
                    destination,
                    size,
                    checksum,
                } => {
                    let Ok(vpath) = VirtualPath::from_relative(relative_path) else {
                        continue;
                    };
                    let (size, modified_at) = match tokio::fs::metadata(source).await {
                        Ok(meta) => (
                            meta.len(),
                            meta.modified()
                                .map(chrono::DateTime::from)
                                .unwrap_or_else(|_| chrono::Utc::now()),
                        ),
                        Err(_) => (*size, chrono::Utc::now()),
                    };
                    let mut entry = match self.ctx.catalog.get(&self.ctx.pair, &vpath).await {
                        Some(entry) => entry,
                        None => FileEntry::new_local(
                            self.ctx.pair.clone(),
                            vpath,
                            source.clone(),
                            size,
                            modified_at,
                            false,
                        ),
                    };
                    entry.local_path = Some(source.clone());
                    entry.size = size;
                    entry.modified_at = modified_at;
                    entry.mark_synced(destination.clone(), checksum.clone());
                    upserts.push(entry);
                }
                SyncAction::CreateDirectory {
                    relative_path,
                    destination,
                } => {
                    let Ok(vpath) = VirtualPath::from_relative(relative_path) else {
                        continue;
                    };
                    let mut entry = match self.ctx.catalog.get(&self.ctx.pair, &vpath).await {
                        Some(entry) => entry,
                        None => FileEntry::new_local(
                            self.ctx.pair.clone(),
                            vpath,
                            self.ctx.local_root.join(relative_path),
                            0,
                            chrono::Utc::now(),
                            true,
                        ),
                    };
                    entry.external_path = Some(destination.clone());
                    entry.location = Location::Both;
                    upserts.push(entry);
                }
                SyncAction::Delete { relative_path, .. } => {
                    if let Ok(vpath) = VirtualPath::from_relative(relative_path) {
                        removals.push(EntryKey::new(self.ctx.pair.clone(), vpath));
                    }
                }
                _ => {}
            }
        }
        self.ctx.catalog.put_batch(upserts).await?;
        self.ctx.catalog.delete_batch(&removals).await?;
        Ok(())
    }

    fn outcome(
        &self,
        state: &SyncState,
        stats: RunStats,
        resumed: bool,
        cancelled: bool,
    ) -> SyncOutcome {
        SyncOutcome {
            succeeded_actions: state.completed_indices.len() as u64,
            failed_actions: state.failed_actions.clone(),
            files_synced: state.processed_files,
            bytes_transferred: state.processed_bytes,
            files_verified: stats.files_verified,
            verification_failures: stats.verification_failures,
            conflicts: state.plan.conflicts.clone(),
            conflicts_resolved: stats.conflicts_resolved,
            deferred: stats.deferred,
            was_cancelled: cancelled,
            was_resumed: resumed,
        }
    }

    fn hasher(&self) -> Hasher {
        Hasher::new(self.options.checksum_algorithm)
            .with_buffer_size(self.options.buffer_size)
            .with_parallelism(self.options.parallel_ops)
    }

    fn emit_status(&self, phase: SyncPhase, message: Option<String>) {
        self.ctx.notifier.publish(Event::SyncStatusChanged {
            sync_pair_id: self.ctx.pair.clone(),
            status: phase.as_str().to_owned(),
            message,
        });
    }

    fn emit_progress(
        &self,
        state: &SyncState,
        current_file: Option<&str>,
        started: Instant,
        throttle: &mut ProgressThrottle,
    ) {
        let total_bytes = state.plan.total_bytes.max(1);
        let fraction = state.processed_bytes as f64 / total_bytes as f64;
        if !throttle.should_emit(fraction) {
            return;
        }
        let elapsed = started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            state.processed_bytes as f64 / elapsed
        } else {
            0.0
        };
        self.ctx.notifier.publish(Event::SyncProgress {
            sync_pair_id: self.ctx.pair.clone(),
            processed_files: state.processed_files,
            total_files: state.plan.total_files,
            processed_bytes: state.processed_bytes,
            total_bytes: state.plan.total_bytes,
            current_file: current_file.map(str::to_owned),
            speed,
        });
    }
}
