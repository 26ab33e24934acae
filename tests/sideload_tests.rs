//! Side-load folder refresh against an extracting mounter


use std::fs;
use test_utils::assertions::*;
use test_utils::*;
use ugcmount::{refresh, scan, AssetId, ContentId};

#[tokio::test]
async fn test_refresh_follows_the_folder() {
    let host = TestHost::new();
    let folder = host.temp_dir.path().join("sideload");

    TestArchive::new("map-pack", 1)
        .with_assets(&["Maps/Dunes"])
        .write_to(&folder);
    // No content id in the manifest: the file name supplies it
    TestArchive::anonymous(4)
        .with_assets(&["Skins/Red"])
        .write_as(&folder.join("skins"), "red-skin.tar.gz");

    let report = refresh(&host.orchestrator, &folder).await.unwrap();
    assert_eq!(
        report.installed,
        vec![ContentId::from("map-pack"), ContentId::from("red-skin")]
    );
    assert!(report.failed.is_empty());
    dir_exists(&host.mounted_dir("red-skin"));

    let snapshot = host.orchestrator.index().snapshot();
    assert_eq!(
        snapshot.owner_of(&AssetId::from("Skins/Red")),
        Some(&ContentId::from("red-skin"))
    );

    // Nothing changed on disk
    let report = refresh(&host.orchestrator, &folder).await.unwrap();
    assert!(report.is_noop());

    // A newer archive for the same id replaces the mounted one
    let v1 = folder.join("map-pack-v1.ugc");
    fs::remove_file(&v1).unwrap();
    TestArchive::new("map-pack", 2)
        .with_assets(&["Maps/Dunes", "Maps/Canyon"])
        .write_to(&folder);

    let report = refresh(&host.orchestrator, &folder).await.unwrap();
    assert_eq!(report.updated, vec![ContentId::from("map-pack")]);
    let record = host
        .orchestrator
        .lookup(&ContentId::from("map-pack"))
        .unwrap();
    assert_eq!(record.origin.version, 2);
    file_contains(
        &host
            .mounted_dir("map-pack")
            .join("Content/Maps/Canyon.uasset"),
        "cooked Maps/Canyon v2",
    );

    // Deleting an archive retires its package
    fs::remove_dir_all(folder.join("skins")).unwrap();
    let report = refresh(&host.orchestrator, &folder).await.unwrap();
    assert_eq!(report.removed, vec![ContentId::from("red-skin")]);
    dir_not_exists(&host.mounted_dir("red-skin"));
    assert!(host
        .orchestrator
        .index()
        .snapshot()
        .owner_of(&AssetId::from("Skins/Red"))
        .is_none());
}

#[tokio::test]
async fn test_refresh_leaves_downloaded_content_alone() {
    let host = TestHost::new();
    let folder = host.temp_dir.path().join("sideload");
    fs::create_dir_all(&folder).unwrap();

    let downloaded = host.archive(&TestArchive::new("mod-42", 1).with_assets(&["assetA"]));
    assert!(host
        .orchestrator
        .install(source("mod-42", &downloaded))
        .await
        .is_success());

    let report = refresh(&host.orchestrator, &folder).await.unwrap();
    assert!(report.is_noop());
    assert!(host
        .orchestrator
        .lookup(&ContentId::from("mod-42"))
        .is_some());
}

#[tokio::test]
async fn test_refresh_reports_broken_archives() {
    let host = TestHost::new();
    let folder = host.temp_dir.path().join("sideload");

    TestArchive::new("good", 1)
        .with_assets(&["a"])
        .write_to(&folder);
    write_garbage(&folder, "broken.ugc");
    TestArchive::new("empty", 1).write_to(&folder);

    let report = refresh(&host.orchestrator, &folder).await.unwrap();
    assert_eq!(report.installed, vec![ContentId::from("good")]);

    let mut failed: Vec<&str> = report.failed.iter().map(|(id, _)| id.as_str()).collect();
    failed.sort();
    assert_eq!(failed, vec!["broken", "empty"]);
    assert!(host.orchestrator.lookup(&ContentId::from("empty")).is_none());
}

#[test]
fn test_scan_keeps_highest_version_per_id() {
    let temp = tempfile::TempDir::new().unwrap();
    let old = TestArchive::new("mod-3", 1)
        .with_assets(&["a"])
        .write_to(temp.path());
    let new = TestArchive::new("mod-3", 5)
        .with_assets(&["a"])
        .write_to(&temp.path().join("nested"));
    fs::write(temp.path().join("notes.txt"), "not an archive").unwrap();

    let scan = scan(temp.path()).unwrap();
    assert_eq!(scan.sources.len(), 1);
    assert_eq!(scan.sources[0].archive_path, new);
    assert_eq!(scan.sources[0].declared_version, Some(5));
    assert_ne!(scan.sources[0].archive_path, old);
    assert!(scan.unreadable.is_empty());
}

#[test]
fn test_scan_of_missing_folder_is_empty() {
    let temp = tempfile::TempDir::new().unwrap();
    let scan = scan(temp.path().join("nowhere")).unwrap();
    assert!(scan.sources.is_empty());
}
