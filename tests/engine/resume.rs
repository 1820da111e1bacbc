//! Resuming an interrupted sync from its persisted state.

use crate::common::Fixture;

use overlay_mamont::control::CancelFlag;
use overlay_mamont::diff::{DiffEngine, DiffOptions};
use overlay_mamont::plan::SyncAction;
use overlay_mamont::scanner::Scanner;
use overlay_mamont::sync::{SyncState, SyncStateStore};

/// Build the state a crash mid-copy would have left behind: a plan for
/// every file, the first `completed` copies already applied to the
/// external store and checkpointed.
async fn interrupted_state(fx: &Fixture, completed: usize) -> SyncState {
    let scanner = Scanner::with_defaults();
    let cancel = CancelFlag::new();
    let local = scanner.scan(&fx.local_dir(), &cancel).await.unwrap();
    let external = scanner.scan(&fx.external_dir(), &cancel).await.unwrap();
    let plan = DiffEngine::new(DiffOptions::default()).diff(&local, &external);

    let mut state = SyncState::new(fx.pair(), plan);
    let indices: Vec<usize> = state
        .plan
        .actions
        .iter()
        .enumerate()
        .filter(|(_, a)| a.is_copy_like())
        .map(|(i, _)| i)
        .take(completed)
        .collect();
    for index in indices {
        let SyncAction::Copy {
            source,
            destination,
            size,
            ..
        } = state.plan.actions[index].clone()
        else {
            continue;
        };
        std::fs::copy(&source, &destination).unwrap();
        // Mirror what the real copier does with timestamps.
        let mtime = filetime::FileTime::from_last_modification_time(
            &std::fs::metadata(&source).unwrap(),
        );
        filetime::set_file_mtime(&destination, mtime).unwrap();
        state.mark_completed(index, size, true);
    }
    state
}

#[tokio::test]
async fn interrupted_sync_resumes_and_finishes_everything() {
    let fx = Fixture::new().await;
    for i in 0..8 {
        fx.write_local(&format!("file-{i}.bin"), &vec![i as u8; 100]);
    }
    fx.mount_pair().await;

    let state = interrupted_state(&fx, 3).await;
    assert!(state.is_resumable());
    let total_actions = state.plan.actions.len();

    let store = SyncStateStore::new(fx.root.path().join("state/sync-state"));
    store.save(&state).await.unwrap();

    let outcome = fx.engine.run_sync(&fx.pair()).await.expect("resume");
    assert!(outcome.was_resumed);
    assert!(outcome.success(), "failures: {:?}", outcome.failed_actions);
    assert_eq!(outcome.succeeded_actions as usize, total_actions);

    for i in 0..8 {
        assert_eq!(
            fx.read_external(&format!("file-{i}.bin")),
            vec![i as u8; 100]
        );
    }

    // The durable state is gone; a follow-up sync starts fresh and has
    // nothing to do.
    assert!(store.load(&fx.pair()).await.unwrap().is_none());
    let follow_up = fx.engine.run_sync(&fx.pair()).await.expect("follow-up");
    assert!(!follow_up.was_resumed);
    assert_eq!(follow_up.succeeded_actions, 0);
}

#[tokio::test]
async fn redoing_checkpointed_copies_is_safe() {
    let fx = Fixture::new().await;
    for i in 0..4 {
        fx.write_local(&format!("file-{i}.bin"), &vec![i as u8; 64]);
    }
    fx.mount_pair().await;

    // Crash before any checkpoint: everything still pending even
    // though two copies already landed.
    let mut state = interrupted_state(&fx, 2).await;
    let completed: Vec<usize> = state.completed_indices.iter().copied().collect();
    for index in completed {
        state.completed_indices.remove(&index);
        state.pending_indices.insert(index);
    }
    state.processed_bytes = 0;
    state.processed_files = 0;

    let store = SyncStateStore::new(fx.root.path().join("state/sync-state"));
    store.save(&state).await.unwrap();

    let outcome = fx.engine.run_sync(&fx.pair()).await.expect("resume");
    assert!(outcome.was_resumed);
    assert!(outcome.success(), "re-copying is idempotent");
    for i in 0..4 {
        assert_eq!(fx.read_external(&format!("file-{i}.bin")), vec![i as u8; 64]);
    }
}
