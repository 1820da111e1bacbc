//! Divergent files on the two stores.

use crate::common::Fixture;

use overlay_mamont::plan::{ConflictResolution, ConflictType};

#[tokio::test]
async fn divergent_file_keeps_local_and_backs_up_external() {
    let fx = Fixture::new().await;
    fx.write_local("doc.md", &[b'L'; 210]);
    fx.write_external("doc.md", &[b'E'; 200]);
    fx.mount_pair().await;

    let outcome = fx.engine.run_sync(&fx.pair()).await.expect("sync");
    assert_eq!(outcome.conflicts.len(), 1);
    let conflict = &outcome.conflicts[0];
    assert_eq!(conflict.relative_path, "doc.md");
    assert_eq!(conflict.conflict_type, ConflictType::BothModified);
    assert_eq!(
        conflict.resolution,
        Some(ConflictResolution::KeepLocalWithBackup),
        "default strategy keeps local with backup"
    );
    assert_eq!(outcome.conflicts_resolved, 1);

    // External ends with both files, local is untouched.
    assert_eq!(fx.read_external("doc.md"), vec![b'L'; 210]);
    assert_eq!(fx.read_external("doc_backup.md"), vec![b'E'; 200]);
    assert_eq!(
        std::fs::read(fx.local_dir().join("doc.md")).unwrap(),
        vec![b'L'; 210]
    );
    assert!(!fx.local_dir().join("doc_backup.md").exists());
}

#[tokio::test]
async fn taken_backup_name_gets_a_discriminator() {
    // Deletion mirroring is off so the pre-existing external-only
    // backup file survives the run.
    let fx = Fixture::with_config(|config| {
        config.sync.enable_delete = false;
    })
    .await;
    fx.write_local("doc.md", b"local");
    fx.write_external("doc.md", b"external");
    fx.write_external("doc_backup.md", b"already here");
    fx.mount_pair().await;

    let outcome = fx.engine.run_sync(&fx.pair()).await.expect("sync");
    assert_eq!(outcome.conflicts_resolved, 1);
    assert_eq!(fx.read_external("doc.md"), b"local");
    assert_eq!(fx.read_external("doc_backup.md"), b"already here");
    assert_eq!(fx.read_external("doc_backup_1.md"), b"external");
}

#[tokio::test]
async fn skip_strategy_leaves_both_sides_alone() {
    let fx = Fixture::with_config(|config| {
        config.sync.conflict_strategy = overlay_mamont::conflict::ConflictStrategy::Skip;
    })
    .await;
    fx.write_local("doc.md", b"local version");
    fx.write_external("doc.md", b"external version");
    fx.mount_pair().await;

    let outcome = fx.engine.run_sync(&fx.pair()).await.expect("sync");
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(fx.read_external("doc.md"), b"external version");
    assert_eq!(
        std::fs::read(fx.local_dir().join("doc.md")).unwrap(),
        b"local version"
    );
}

#[tokio::test]
async fn explicit_resolution_command_applies_keep_both() {
    let fx = Fixture::new().await;
    fx.write_local("n.txt", b"L");
    fx.write_external("n.txt", b"E");
    fx.mount_pair().await;

    fx.engine
        .resolve_conflict(&fx.pair(), "n.txt", ConflictResolution::KeepBoth)
        .await
        .expect("resolve");

    for root in [fx.local_dir(), fx.external_dir()] {
        assert_eq!(std::fs::read(root.join("n_local.txt")).unwrap(), b"L");
        assert_eq!(std::fs::read(root.join("n_external.txt")).unwrap(), b"E");
        assert!(!root.join("n.txt").exists());
    }
}
