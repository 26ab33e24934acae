//! Lifecycle tests against an extracting mounter on a real filesystem


use std::collections::BTreeSet;
use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use test_utils::assertions::*;
use test_utils::*;
use ugcmount::{
    AssetId, ContentId, Error, LifecycleState, MountRecord, Operation, OperationOutcome,
    PublishConflict, StateFile, Step, StepTimeouts,
};

fn assets(names: &[&str]) -> BTreeSet<AssetId> {
    names.iter().map(|n| AssetId::from(*n)).collect()
}

#[tokio::test]
async fn test_install_mounts_and_publishes() {
    let host = TestHost::new();
    let archive = host.archive(&TestArchive::new("mod-42", 1).with_assets(&["assetA", "assetB"]));
    let id = ContentId::from("mod-42");

    let outcome = host.orchestrator.install(source("mod-42", &archive)).await;
    assert!(
        matches!(
            outcome,
            OperationOutcome::Succeeded {
                state: LifecycleState::Active,
                ..
            }
        ),
        "{}",
        outcome
    );

    let record = host.orchestrator.lookup(&id).expect("mod-42 should be mounted");
    assert_eq!(record.mount_path.as_str(), "/ugc/mod-42");
    assert_eq!(record.assets, assets(&["assetA", "assetB"]));
    assert_eq!(record.origin.archive_path, archive);

    let dir = host.mounted_dir("mod-42");
    dir_exists(&dir);
    file_contains(&dir.join("Content/assetA.uasset"), "cooked assetA v1");
    file_contains(&dir.join("ugc.json"), "mod-42");

    let snapshot = host.orchestrator.index().snapshot();
    assert_eq!(snapshot.owner_of(&AssetId::from("assetA")), Some(&id));
    assert_eq!(snapshot.owner_of(&AssetId::from("assetB")), Some(&id));
    assert_eq!(snapshot.len(), 2);
}

#[tokio::test]
async fn test_corrupt_archives_change_nothing() {
    let host = TestHost::new();
    let garbage = write_garbage(&host.downloads, "junk.ugc");
    let truncated = write_truncated(
        &host.downloads,
        &TestArchive::new("cut", 1).with_assets(&["a", "b", "c"]),
    );

    for (id, path) in [("junk", garbage), ("cut", truncated)] {
        let outcome = host.orchestrator.install(source(id, &path)).await;
        assert!(
            matches!(outcome, OperationOutcome::Failed(Error::CorruptArchive { .. })),
            "{}: {}",
            id,
            outcome
        );
        assert_eq!(host.orchestrator.state(&ContentId::from(id)), None);
    }

    assert!(host.orchestrator.list_active().is_empty());
    assert!(host.orchestrator.index().snapshot().is_empty());
    assert_eq!(host.orchestrator.index().generation(), 0);
    dir_not_exists(&host.temp_dir.path().join("mounts/ugc"));
}

#[tokio::test]
async fn test_unsupported_format_version_is_rejected() {
    let host = TestHost::new();
    let archive = host.archive(
        &TestArchive::new("future", 1)
            .with_format_version(99)
            .with_assets(&["a"]),
    );

    let outcome = host.orchestrator.install(source("future", &archive)).await;
    assert!(matches!(
        outcome,
        OperationOutcome::Failed(Error::UnsupportedVersion { .. })
    ));
    assert!(host.orchestrator.lookup(&ContentId::from("future")).is_none());
}

#[tokio::test]
async fn test_wrong_checksum_is_rejected() {
    let host = TestHost::new();
    let archive = host.archive(&TestArchive::new("mod-9", 1).with_assets(&["a"]));
    let source = source("mod-9", &archive).with_checksum(format!("sha256:{}", "0".repeat(64)));

    let outcome = host.orchestrator.install(source).await;
    assert!(matches!(
        outcome,
        OperationOutcome::Failed(Error::CorruptArchive { .. })
    ));
    dir_not_exists(&host.mounted_dir("mod-9"));
}

#[tokio::test]
async fn test_uninstall_removes_everything() {
    let host = TestHost::new();
    let archive = host.archive(&TestArchive::new("mod-42", 1).with_assets(&["assetA", "assetB"]));
    let id = ContentId::from("mod-42");

    assert!(host.orchestrator.install(source("mod-42", &archive)).await.is_success());
    let outcome = host.orchestrator.uninstall(&id).await;
    assert!(matches!(
        outcome,
        OperationOutcome::Succeeded {
            state: LifecycleState::Retired,
            ..
        }
    ));

    dir_not_exists(&host.mounted_dir("mod-42"));
    assert!(host.orchestrator.lookup(&id).is_none());
    assert!(host.orchestrator.index().snapshot().is_empty());
    assert_eq!(host.orchestrator.state(&id), None);
    assert_eq!(host.orchestrator.tracked(), 0);

    // The archive itself is left where the service put it
    assert!(archive.exists());

    // A retired identifier can be installed again
    assert!(host.orchestrator.install(source("mod-42", &archive)).await.is_success());
    dir_exists(&host.mounted_dir("mod-42"));
}

#[tokio::test]
async fn test_failed_mount_leaves_no_directory() {
    let host = TestHost::new();
    let archive = host.archive(&TestArchive::new("mod-1", 1).with_assets(&["a"]));
    host.mounter.fail_mount.store(true, Ordering::SeqCst);

    let outcome = host.orchestrator.install(source("mod-1", &archive)).await;
    assert!(matches!(outcome, OperationOutcome::Failed(Error::Mount { .. })));
    assert!(host.orchestrator.table().is_empty());
    assert!(host.orchestrator.index().snapshot().is_empty());
    dir_not_exists(&host.mounted_dir("mod-1"));

    host.mounter.fail_mount.store(false, Ordering::SeqCst);
    assert!(host.orchestrator.install(source("mod-1", &archive)).await.is_success());
}

#[tokio::test]
async fn test_update_replaces_content_on_disk() {
    let host = TestHost::new();
    let v1 = host.archive(&TestArchive::new("mod-7", 1).with_assets(&["a", "b"]));
    let v2 = host.archive(&TestArchive::new("mod-7", 2).with_assets(&["b", "c"]));
    let id = ContentId::from("mod-7");

    assert!(host.orchestrator.install(source("mod-7", &v1)).await.is_success());
    let outcome = host.orchestrator.update(source("mod-7", &v2)).await;
    assert!(outcome.is_success(), "{}", outcome);

    let dir = host.mounted_dir("mod-7");
    file_contains(&dir.join("Content/b.uasset"), "cooked b v2");
    file_contains(&dir.join("Content/c.uasset"), "cooked c v2");
    assert!(!dir.join("Content/a.uasset").exists());

    // Neither the staging area nor the parked old mount outlives the update
    dir_not_exists(&host.temp_dir.path().join("mounts/ugc/~staging"));
    dir_not_exists(&host.temp_dir.path().join("mounts/ugc/~backup"));

    let record = host.orchestrator.lookup(&id).unwrap();
    assert_eq!(record.origin.version, 2);
    assert_eq!(record.origin.archive_path, v2);
    assert_eq!(record.assets, assets(&["b", "c"]));

    let snapshot = host.orchestrator.index().snapshot();
    assert_eq!(snapshot.assets_owned_by(&id), assets(&["b", "c"]));
    assert!(snapshot.owner_of(&AssetId::from("a")).is_none());
}

#[tokio::test]
async fn test_update_rolls_back_when_promotion_fails() {
    let host = TestHost::new();
    let v1 = host.archive(&TestArchive::new("mod-7", 1).with_assets(&["a", "b"]));
    let v2 = host.archive(&TestArchive::new("mod-7", 2).with_assets(&["b", "c"]));
    let id = ContentId::from("mod-7");

    assert!(host.orchestrator.install(source("mod-7", &v1)).await.is_success());
    let before = host.orchestrator.lookup(&id).unwrap();

    host.mounter.fail_promote.store(true, Ordering::SeqCst);
    let outcome = host.orchestrator.update(source("mod-7", &v2)).await;
    assert!(matches!(outcome, OperationOutcome::Failed(Error::Mount { .. })));

    // The original archive is serving again
    let dir = host.mounted_dir("mod-7");
    file_contains(&dir.join("Content/a.uasset"), "cooked a v1");
    assert!(!dir.join("Content/c.uasset").exists());

    let after = host.orchestrator.lookup(&id).unwrap();
    assert_eq!(after.origin, before.origin);
    assert_eq!(after.assets, before.assets);
    assert_eq!(
        host.orchestrator.index().snapshot().assets_owned_by(&id),
        assets(&["a", "b"])
    );
    assert_eq!(host.orchestrator.state(&id), Some(LifecycleState::Active));
    dir_not_exists(&host.temp_dir.path().join("mounts/ugc/~backup"));
}

#[tokio::test]
async fn test_rollback_restores_old_bytes_when_archive_was_overwritten() {
    let host = TestHost::new();
    let v1 = host.archive(&TestArchive::new("mod-7", 1).with_assets(&["a", "b"]));
    let id = ContentId::from("mod-7");

    assert!(host.orchestrator.install(source("mod-7", &v1)).await.is_success());
    let before = host.orchestrator.lookup(&id).unwrap();

    // The service rewrites the download in place with the next version
    TestArchive::new("mod-7", 2)
        .with_assets(&["b", "c"])
        .write_as(&host.downloads, "mod-7-v1.ugc");

    host.mounter.fail_promote.store(true, Ordering::SeqCst);
    let outcome = host.orchestrator.update(source("mod-7", &v1)).await;
    assert!(matches!(outcome, OperationOutcome::Failed(Error::Mount { .. })));

    let dir = host.mounted_dir("mod-7");
    file_contains(&dir.join("Content/a.uasset"), "cooked a v1");
    file_contains(&dir.join("Content/b.uasset"), "cooked b v1");
    assert!(!dir.join("Content/c.uasset").exists());

    assert_eq!(host.orchestrator.lookup(&id).unwrap().origin, before.origin);
    assert_eq!(host.orchestrator.state(&id), Some(LifecycleState::Active));
    assert!(!host.orchestrator.is_halted(&id));
}

#[tokio::test]
async fn test_rollback_keeps_serving_when_archive_was_deleted() {
    let host = TestHost::new();
    let v1 = host.archive(&TestArchive::new("mod-7", 1).with_assets(&["a"]));
    let v2 = host.archive(&TestArchive::new("mod-7", 2).with_assets(&["z"]));
    let id = ContentId::from("mod-7");

    assert!(host.orchestrator.install(source("mod-7", &v1)).await.is_success());
    fs::remove_file(&v1).unwrap();

    host.mounter.fail_promote.store(true, Ordering::SeqCst);
    let outcome = host.orchestrator.update(source("mod-7", &v2)).await;
    assert!(matches!(outcome, OperationOutcome::Failed(Error::Mount { .. })));

    let dir = host.mounted_dir("mod-7");
    dir_exists(&dir);
    file_contains(&dir.join("Content/a.uasset"), "cooked a v1");
    assert_eq!(
        host.orchestrator.index().snapshot().assets_owned_by(&id),
        assets(&["a"])
    );
    assert_eq!(host.orchestrator.state(&id), Some(LifecycleState::Active));
    assert!(!host.orchestrator.is_halted(&id));

    // With promotion working again the update goes through
    host.mounter.fail_promote.store(false, Ordering::SeqCst);
    assert!(host.orchestrator.update(source("mod-7", &v2)).await.is_success());
    file_contains(&dir.join("Content/z.uasset"), "cooked z v2");
}

#[tokio::test]
async fn test_incomplete_rollback_halts_the_package() {
    let host = TestHost::new();
    let v1 = host.archive(&TestArchive::new("mod-7", 1).with_assets(&["a"]));
    let v2 = host.archive(&TestArchive::new("mod-7", 2).with_assets(&["z"]));
    let id = ContentId::from("mod-7");

    assert!(host.orchestrator.install(source("mod-7", &v1)).await.is_success());

    // The new mount cannot be promoted, and rollback cannot remove it
    host.mounter.fail_promote.store(true, Ordering::SeqCst);
    host.mounter.fail_unmount.store(true, Ordering::SeqCst);
    let outcome = host.orchestrator.update(source("mod-7", &v2)).await;
    host.mounter.fail_promote.store(false, Ordering::SeqCst);
    host.mounter.fail_unmount.store(false, Ordering::SeqCst);

    assert!(matches!(
        outcome,
        OperationOutcome::Failed(Error::InternalConsistencyFault { .. })
    ));
    assert!(host.orchestrator.is_halted(&id));
    assert_eq!(host.orchestrator.state(&id), Some(LifecycleState::Failed));

    // The index rollback still went through
    assert_eq!(
        host.orchestrator.index().snapshot().assets_owned_by(&id),
        assets(&["a"])
    );
    file_contains(
        &host.mounted_dir("mod-7").join("Content/a.uasset"),
        "cooked a v1",
    );

    let outcome = host.orchestrator.uninstall(&id).await;
    assert!(matches!(outcome, OperationOutcome::Failed(Error::Halted(_))));

    assert!(host.orchestrator.clear_fault(&id));
    assert!(!host.orchestrator.is_halted(&id));
    assert!(!host.orchestrator.clear_fault(&id));
}

#[tokio::test]
async fn test_update_requires_a_mounted_package() {
    let host = TestHost::new();
    let v2 = host.archive(&TestArchive::new("ghost", 2).with_assets(&["a"]));

    let outcome = host.orchestrator.update(source("ghost", &v2)).await;
    assert!(matches!(outcome, OperationOutcome::Failed(Error::NotMounted(_))));
    dir_not_exists(&host.mounted_dir("ghost"));
}

#[tokio::test]
async fn test_superseded_asset_moves_to_latest_package() {
    let host = TestHost::new();
    let a = host.archive(&TestArchive::new("A", 1).with_assets(&["onlyA", "shared"]));
    let b = host.archive(&TestArchive::new("B", 1).with_assets(&["shared", "onlyB"]));

    assert!(host.orchestrator.install(source("A", &a)).await.is_success());
    let outcome = host.orchestrator.install(source("B", &b)).await;
    assert!(outcome.is_success());
    assert_eq!(
        outcome.warnings(),
        &[PublishConflict {
            asset: AssetId::from("shared"),
            previous_owner: ContentId::from("A"),
            new_owner: ContentId::from("B"),
        }]
    );

    let snapshot = host.orchestrator.index().snapshot();
    assert_eq!(
        snapshot.owner_of(&AssetId::from("shared")),
        Some(&ContentId::from("B"))
    );
    assert_eq!(
        host.orchestrator.lookup(&ContentId::from("A")).unwrap().assets,
        assets(&["onlyA"])
    );

    // Uninstalling B does not hand the asset back to A
    assert!(host
        .orchestrator
        .uninstall(&ContentId::from("B"))
        .await
        .is_success());
    let snapshot = host.orchestrator.index().snapshot();
    assert!(snapshot.owner_of(&AssetId::from("shared")).is_none());
    assert_eq!(
        snapshot.owner_of(&AssetId::from("onlyA")),
        Some(&ContentId::from("A"))
    );
}

#[tokio::test]
async fn test_mount_timeout_tears_down_late_mount() {
    let temp = tempfile::TempDir::new().unwrap();
    let mounter = Arc::new(FlakyMounter::new(&temp.path().join("mounts")));
    let orchestrator = ugcmount::LifecycleOrchestrator::builder(
        ugcmount::NamespaceAllocator::new("/ugc").unwrap(),
        mounter.clone(),
    )
    .timeouts(StepTimeouts {
        mount: Some(Duration::from_millis(50)),
        ..StepTimeouts::default()
    })
    .build();

    let archive = TestArchive::new("slow", 1)
        .with_assets(&["a"])
        .write_to(&temp.path().join("downloads"));
    mounter.mount_delay_ms.store(300, Ordering::SeqCst);

    let outcome = orchestrator.install(source("slow", &archive)).await;
    assert!(matches!(
        outcome,
        OperationOutcome::Failed(Error::Timeout {
            step: Step::Mount,
            ..
        })
    ));
    assert!(orchestrator.lookup(&ContentId::from("slow")).is_none());
    dir_not_exists(&temp.path().join("mounts/ugc/slow"));
}

#[tokio::test]
async fn test_queued_operations_apply_in_order() {
    let host = TestHost::new();
    let v1 = host.archive(&TestArchive::new("mod-8", 1).with_assets(&["a"]));
    let v2 = host.archive(&TestArchive::new("mod-8", 2).with_assets(&["b"]));
    let id = ContentId::from("mod-8");

    let install = host.orchestrator.submit(Operation::Install(source("mod-8", &v1)));
    let update = host.orchestrator.submit(Operation::Update(source("mod-8", &v2)));
    let uninstall = host.orchestrator.submit(Operation::Uninstall(id.clone()));
    let reinstall = host.orchestrator.submit(Operation::Install(source("mod-8", &v1)));

    assert!(install.outcome().await.is_success());
    assert!(update.outcome().await.is_success());
    assert!(uninstall.outcome().await.is_success());
    assert!(reinstall.outcome().await.is_success());

    let record = host.orchestrator.lookup(&id).unwrap();
    assert_eq!(record.origin.version, 1);
    file_contains(
        &host.mounted_dir("mod-8").join("Content/a.uasset"),
        "cooked a v1",
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_installs() {
    const PACKAGES: usize = 120;

    let host = TestHost::new();
    host.mounter.mount_delay_ms.store(20, Ordering::SeqCst);

    let handles: Vec<_> = (0..PACKAGES)
        .map(|i| {
            let id = format!("mod-{}", i);
            let asset = format!("asset-{}", i);
            let archive = host.archive(&TestArchive::new(&id, 1).with_assets(&[asset.as_str()]));
            host.orchestrator
                .submit(Operation::Install(source(&id, &archive)))
        })
        .collect();

    for handle in handles {
        let id = handle.content_id().clone();
        let outcome = handle.outcome().await;
        assert!(outcome.is_success(), "{}: {}", id, outcome);
    }

    assert_eq!(host.orchestrator.list_active().len(), PACKAGES);
    assert_eq!(host.mounter.mounts.load(Ordering::SeqCst), PACKAGES);
    assert!(
        host.mounter.peak_in_flight.load(Ordering::SeqCst) > 1,
        "installs of different packages should overlap"
    );

    let snapshot = host.orchestrator.index().snapshot();
    assert_eq!(snapshot.len(), PACKAGES);
    assert_eq!(snapshot.generation(), PACKAGES as u64);
    for i in 0..PACKAGES {
        assert_eq!(
            snapshot.owner_of(&AssetId::from(format!("asset-{}", i))),
            Some(&ContentId::from(format!("mod-{}", i)))
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_readers_never_see_a_half_applied_update() {
    let host = TestHost::new();
    let v1 = host.archive(&TestArchive::new("mod-7", 1).with_assets(&["a", "b"]));
    let v2 = host.archive(&TestArchive::new("mod-7", 2).with_assets(&["c", "d"]));
    let id = ContentId::from("mod-7");
    assert!(host.orchestrator.install(source("mod-7", &v1)).await.is_success());

    let index = Arc::clone(host.orchestrator.index());
    let reader_id = id.clone();
    let reader = tokio::task::spawn_blocking(move || {
        let old = assets(&["a", "b"]);
        let new = assets(&["c", "d"]);
        let mut observed = 0usize;
        loop {
            let snapshot = index.snapshot();
            let owned = snapshot.assets_owned_by(&reader_id);
            assert!(owned == old || owned == new, "torn snapshot: {:?}", owned);
            observed += 1;
            if owned == new {
                return observed;
            }
            std::thread::yield_now();
        }
    });

    assert!(host.orchestrator.update(source("mod-7", &v2)).await.is_success());
    let observed = tokio::time::timeout(Duration::from_secs(10), reader)
        .await
        .expect("reader should finish")
        .expect("reader panicked");
    assert!(observed >= 1);
}

#[tokio::test]
async fn test_state_file_restores_a_session() {
    let host = TestHost::new();
    let a = host.archive(&TestArchive::new("mod-1", 3).with_assets(&["a"]));
    let b = host.archive(&TestArchive::new("mod-2", 1).with_assets(&["b", "c"]));
    assert!(host.orchestrator.install(source("mod-1", &a)).await.is_success());
    assert!(host.orchestrator.install(source("mod-2", &b)).await.is_success());

    let state_path = host.temp_dir.path().join("state.toml");
    StateFile::new("/ugc", host.orchestrator.list_active())
        .save_to(&state_path)
        .unwrap();

    let restored = StateFile::load_from(&state_path).unwrap().unwrap();
    let records: Vec<MountRecord> = restored.mounts.clone();
    assert_eq!(records.len(), 2);

    // A fresh orchestrator over the same mount root picks the packages up
    let second = ugcmount::LifecycleOrchestrator::builder(
        ugcmount::NamespaceAllocator::new("/ugc").unwrap(),
        host.mounter.clone(),
    )
    .build();
    let conflicts = second.adopt(records).await.unwrap();
    assert!(conflicts.is_empty());

    let id = ContentId::from("mod-1");
    assert_eq!(second.state(&id), Some(LifecycleState::Active));
    assert_eq!(second.lookup(&id).unwrap().origin.version, 3);
    assert_eq!(
        second.index().snapshot().owner_of(&AssetId::from("c")),
        Some(&ContentId::from("mod-2"))
    );

    // Adopted packages can be uninstalled normally
    assert!(second.uninstall(&id).await.is_success());
    dir_not_exists(&host.mounted_dir("mod-1"));
    assert!(fs::read_dir(host.temp_dir.path().join("mounts/ugc")).is_ok());
}

#[tokio::test]
async fn test_disabled_package_survives_a_restart() {
    let host = TestHost::new();
    let a = host.archive(&TestArchive::new("mod-1", 1).with_assets(&["a"]));
    let b = host.archive(&TestArchive::new("mod-2", 1).with_assets(&["b"]));
    let disabled = ContentId::from("mod-2");
    assert!(host.orchestrator.install(source("mod-1", &a)).await.is_success());
    assert!(host.orchestrator.install(source("mod-2", &b)).await.is_success());

    assert!(host.orchestrator.disable(&disabled).await.is_success());
    dir_not_exists(&host.mounted_dir("mod-2"));
    assert!(host
        .orchestrator
        .index()
        .snapshot()
        .owner_of(&AssetId::from("b"))
        .is_none());

    let state_path = host.temp_dir.path().join("state.toml");
    StateFile::new("/ugc", host.orchestrator.list_all())
        .save_to(&state_path)
        .unwrap();
    file_contains(&state_path, "enabled = false");

    let restored = StateFile::load_from(&state_path).unwrap().unwrap();
    let second = ugcmount::LifecycleOrchestrator::builder(
        ugcmount::NamespaceAllocator::new("/ugc").unwrap(),
        host.mounter.clone(),
    )
    .build();
    second.adopt(restored.mounts).await.unwrap();

    assert_eq!(second.state(&disabled), Some(LifecycleState::Disabled));
    assert_eq!(second.list_active().len(), 1);
    assert!(second.index().snapshot().owner_of(&AssetId::from("b")).is_none());

    // Re-enabling mounts it from its archive again
    let outcome = second.enable(&disabled).await;
    assert!(outcome.is_success(), "{}", outcome);
    file_contains(
        &host.mounted_dir("mod-2").join("Content/b.uasset"),
        "cooked b v1",
    );
    assert_eq!(
        second.index().snapshot().owner_of(&AssetId::from("b")),
        Some(&disabled)
    );
}

#[tokio::test]
async fn test_unload_all_clears_the_mount_root() {
    let host = TestHost::new();
    for id in ["mod-1", "mod-2", "mod-3"] {
        let archive = host.archive(&TestArchive::new(id, 1).with_assets(&[id]));
        assert!(host.orchestrator.install(source(id, &archive)).await.is_success());
    }
    assert!(host
        .orchestrator
        .disable(&ContentId::from("mod-3"))
        .await
        .is_success());

    let outcomes = host.orchestrator.unload_all().await;
    assert_eq!(outcomes.len(), 3);
    for (id, outcome) in &outcomes {
        assert!(outcome.is_success(), "{}: {}", id, outcome);
    }

    assert!(host.orchestrator.list_all().is_empty());
    assert!(host.orchestrator.index().snapshot().is_empty());
    dir_not_exists(&host.temp_dir.path().join("mounts/ugc"));
}
