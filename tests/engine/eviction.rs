//! End-to-end eviction: synced files lose their local copy and keep
//! streaming from the external store.

use crate::common::Fixture;

use chrono::{Duration, Utc};
use overlay_mamont::catalog::Location;

/// Ten synced files, all last accessed two hours ago.
async fn seed_cold_files(fx: &Fixture, count: usize, size: usize) {
    for i in 0..count {
        fx.write_local(&format!("cold-{i:02}.bin"), &vec![i as u8; size]);
    }
    fx.engine.run_sync(&fx.pair()).await.expect("seed sync");
    for entry in fx.engine.catalog().entries_for_pair(&fx.pair()).await {
        if entry.is_directory {
            continue;
        }
        let mut aged = entry;
        aged.accessed_at = Utc::now() - Duration::seconds(7200);
        fx.engine.catalog().put(aged).await.expect("age entry");
    }
}

#[tokio::test]
async fn manual_eviction_frees_cold_files_oldest_first() {
    let fx = Fixture::with_config(|config| {
        config.eviction.target_free = 0;
        config.eviction.min_age = 3600;
    })
    .await;
    fx.mount_pair().await;
    seed_cold_files(&fx, 10, 600).await;

    let outcome = fx
        .engine
        .trigger_eviction(&fx.pair())
        .await
        .expect("eviction");
    assert_eq!(outcome.evicted_files, 10);
    assert_eq!(outcome.freed_bytes, 6000);
    assert!(outcome.reached_target);

    for i in 0..10 {
        let rel = format!("/cold-{i:02}.bin");
        let entry = fx.entry(&rel).await.expect("entry survives eviction");
        assert_eq!(entry.location, Location::ExternalOnly);
        assert!(entry.local_path.is_none());
        assert!(!entry.is_dirty);
        assert!(!fx.local_dir().join(&rel[1..]).exists());
        assert!(fx.external_dir().join(&rel[1..]).exists());
    }
}

#[tokio::test]
async fn partial_eviction_stops_at_the_target() {
    let fx = Fixture::with_config(|config| {
        config.eviction.target_free = 4200;
        config.eviction.min_age = 3600;
    })
    .await;
    fx.mount_pair().await;
    seed_cold_files(&fx, 10, 600).await;

    // 6000 bytes used, shrink to 4200: three 600-byte files go.
    let outcome = fx
        .engine
        .trigger_eviction(&fx.pair())
        .await
        .expect("eviction");
    assert_eq!(outcome.evicted_files, 3);
    assert_eq!(outcome.freed_bytes, 1800);
    assert!(outcome.reached_target);
    assert_eq!(
        fx.engine.catalog().local_bytes(&fx.pair()).await,
        4200
    );
}

#[tokio::test]
async fn evicted_files_remain_readable_through_the_mount() {
    let fx = Fixture::with_config(|config| {
        config.eviction.target_free = 0;
        config.eviction.min_age = 3600;
    })
    .await;
    fx.mount_pair().await;
    seed_cold_files(&fx, 1, 64).await;
    fx.engine
        .trigger_eviction(&fx.pair())
        .await
        .expect("eviction");

    let delegate = fx
        .engine
        .vfs()
        .delegate(&fx.pair())
        .await
        .expect("delegate");
    let resolved = delegate
        .resolve_read(&Fixture::vpath("/cold-00.bin"))
        .await
        .expect("evicted file still resolves");
    assert_eq!(resolved, fx.external_dir().join("cold-00.bin"));

    // With the disk gone, the same read maps to EIO.
    fx.engine
        .vfs()
        .set_external_offline(&fx.pair(), true)
        .await
        .expect("offline");
    assert!(delegate
        .resolve_read(&Fixture::vpath("/cold-00.bin"))
        .await
        .is_err());
}

#[tokio::test]
async fn dirty_files_survive_eviction_passes() {
    let fx = Fixture::with_config(|config| {
        config.eviction.target_free = 0;
        config.eviction.min_age = 3600;
    })
    .await;
    fx.mount_pair().await;
    seed_cold_files(&fx, 2, 64).await;

    fx.write_local("cold-00.bin", b"rewritten after sync");
    fx.engine
        .vfs()
        .on_file_written(&fx.pair(), &Fixture::vpath("/cold-00.bin"))
        .await;

    let outcome = fx
        .engine
        .trigger_eviction(&fx.pair())
        .await
        .expect("eviction");
    assert_eq!(outcome.evicted_files, 1, "only the clean file goes");
    assert!(fx.local_dir().join("cold-00.bin").exists());
    assert_eq!(
        fx.entry("/cold-00.bin").await.unwrap().location,
        Location::Both
    );
}
