//! First-time and dirty-file sync flows through the full engine.

use crate::common::Fixture;

use overlay_mamont::catalog::Location;
use overlay_mamont::control::CancelFlag;
use overlay_mamont::diff::{DiffEngine, DiffOptions};
use overlay_mamont::scanner::Scanner;

#[tokio::test]
async fn first_time_sync_mirrors_local_onto_empty_external() {
    let fx = Fixture::new().await;
    fx.write_local("f1.txt", &[b'a'; 100]);
    fx.write_local("sub/f2.bin", &[7u8; 1024]);
    fx.mount_pair().await;

    let outcome = fx.engine.run_sync(&fx.pair()).await.expect("sync");
    assert!(outcome.success(), "failures: {:?}", outcome.failed_actions);
    assert_eq!(outcome.succeeded_actions, 3, "mkdir + two copies");
    assert_eq!(outcome.bytes_transferred, 1124);
    assert_eq!(outcome.files_verified, 2);
    assert!(!outcome.was_resumed);

    assert_eq!(fx.read_external("f1.txt"), vec![b'a'; 100]);
    assert_eq!(fx.read_external("sub/f2.bin"), vec![7u8; 1024]);

    for rel in ["/f1.txt", "/sub", "/sub/f2.bin"] {
        let entry = fx.entry(rel).await.unwrap_or_else(|| panic!("entry {rel}"));
        assert_eq!(entry.location, Location::Both, "{rel}");
        assert!(!entry.is_dirty, "{rel}");
    }

    // Both trees are now identical for every path.
    let scanner = Scanner::with_defaults();
    let cancel = CancelFlag::new();
    let local = scanner.scan(&fx.local_dir(), &cancel).await.unwrap();
    let external = scanner.scan(&fx.external_dir(), &cancel).await.unwrap();
    let engine = DiffEngine::new(DiffOptions::default());
    assert_eq!(
        local.files.keys().collect::<Vec<_>>(),
        external.files.keys().collect::<Vec<_>>()
    );
    for (rel, meta) in &local.files {
        assert!(
            engine.are_files_identical(meta, external.get(rel).unwrap()),
            "{rel} differs after sync"
        );
    }
}

#[tokio::test]
async fn second_sync_without_changes_does_nothing() {
    let fx = Fixture::new().await;
    fx.write_local("a.txt", b"stable");
    fx.mount_pair().await;

    let first = fx.engine.run_sync(&fx.pair()).await.expect("sync 1");
    assert_eq!(first.succeeded_actions, 1);

    let second = fx.engine.run_sync(&fx.pair()).await.expect("sync 2");
    assert_eq!(second.succeeded_actions, 0, "idempotent re-run");
    assert_eq!(second.bytes_transferred, 0);
    assert!(second.conflicts.is_empty());
}

#[tokio::test]
async fn dirty_file_sync_updates_only_the_written_file() {
    let fx = Fixture::new().await;
    fx.write_local("f1.txt", &[b'x'; 100]);
    fx.write_local("steady.txt", b"untouched");
    fx.mount_pair().await;
    fx.engine.run_sync(&fx.pair()).await.expect("initial sync");

    // A write through the mount replaces f1 with 50 bytes.
    fx.write_local("f1.txt", &[b'y'; 50]);
    fx.engine
        .vfs()
        .on_file_written(&fx.pair(), &Fixture::vpath("/f1.txt"))
        .await;
    let dirty = fx.entry("/f1.txt").await.expect("entry");
    assert!(dirty.is_dirty, "write marks the entry dirty");
    assert_eq!(dirty.size, 50);

    let outcome = fx.engine.run_sync(&fx.pair()).await.expect("dirty sync");
    assert!(outcome.success());
    assert_eq!(outcome.succeeded_actions, 1, "only f1 is re-copied");
    assert_eq!(outcome.bytes_transferred, 50);
    assert!(outcome.conflicts.is_empty(), "no conflict for our own write");

    assert_eq!(fx.read_external("f1.txt"), vec![b'y'; 50]);
    let synced = fx.entry("/f1.txt").await.expect("entry");
    assert!(!synced.is_dirty);
    assert_eq!(synced.size, 50);
    assert_eq!(synced.location, Location::Both);
}

#[tokio::test]
async fn deletions_mirror_when_enabled() {
    let fx = Fixture::new().await;
    fx.write_local("keep.txt", b"keep");
    fx.write_local("drop.txt", b"drop");
    fx.mount_pair().await;
    fx.engine.run_sync(&fx.pair()).await.expect("initial sync");

    std::fs::remove_file(fx.local_dir().join("drop.txt")).unwrap();
    fx.engine
        .vfs()
        .on_file_deleted(&fx.pair(), &Fixture::vpath("/drop.txt"))
        .await;

    let outcome = fx.engine.run_sync(&fx.pair()).await.expect("delete sync");
    assert!(outcome.success());
    assert!(!fx.external_dir().join("drop.txt").exists());
    assert!(fx.external_dir().join("keep.txt").exists());
    assert!(fx.entry("/drop.txt").await.is_none());
}
