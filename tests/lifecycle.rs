//! End-to-end lifecycle tests against the in-process fake host

use assert_matches::assert_matches;
use rid_manager::lifecycle::RidLock;
use rid_manager::testing::FakeHost;
use rid_manager::{
    AssumeNo, AssumeYes, BatchMode, BatchOrchestrator, Error, MountDescriptor, MountState,
    ResourceManager, Rid,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn rid(n: u32) -> Rid {
    Rid::new(n).unwrap()
}

fn setup() -> (TempDir, Arc<FakeHost>, Arc<ResourceManager>) {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new(dir.path());
    let manager = ResourceManager::new(host.config(), host.ports()).unwrap();
    (dir, host, Arc::new(manager))
}

/// Relative path -> file contents (`None` for directories)
fn tree(root: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
    let mut entries = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            let relative = path.strip_prefix(root).unwrap().to_path_buf();
            if path.is_dir() {
                entries.insert(relative, None);
                pending.push(path);
            } else {
                entries.insert(relative, Some(fs::read(&path).unwrap()));
            }
        }
    }
    entries
}

#[tokio::test]
async fn mount_then_umount_restores_depot() {
    let (_dir, host, manager) = setup();
    let device = host.add_resource("sdb", rid(1501)).unwrap();
    let depot = manager.config().depot_dir.clone();
    fs::create_dir_all(&depot).unwrap();
    let before = tree(&depot);

    let descriptor = manager.mount(rid(1501)).await.unwrap();
    let paths = manager.paths(rid(1501));
    assert_eq!(
        descriptor,
        MountDescriptor::Direct {
            md_partition: device.md_partition(),
            data_partition: device.data_partition(),
        }
    );
    assert_eq!(
        fs::read_to_string(&paths.descriptor).unwrap(),
        format!(
            "dev:{}:{}\n",
            device.md_partition().display(),
            device.data_partition().display()
        )
    );
    assert!(host.is_mounted(&paths.md));
    assert!(host.is_mounted(&paths.data));
    assert!(paths.settings().is_file());
    assert_eq!(manager.mount_state(rid(1501)).unwrap(), MountState::MountedDirect);

    assert_matches!(
        manager.mount(rid(1501)).await,
        Err(Error::AlreadyInState { .. })
    );

    manager.umount(rid(1501)).await.unwrap();
    assert_eq!(tree(&depot), before);
    assert!(!host.is_mounted(&paths.md));
    assert!(host.backing_dir(&device.md_partition()).join("rid.settings").is_file());
    assert_eq!(manager.mount_state(rid(1501)).unwrap(), MountState::Unmounted);

    assert_matches!(
        manager.umount(rid(1501)).await,
        Err(Error::AlreadyInState { .. })
    );
}

#[tokio::test]
async fn sequestered_resource_refuses_mount() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();

    let outcome = manager.sequester(rid(1501), "bad SMART").await.unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.to_string(), "Rid 1501 is now sequestered.");

    let status = manager.check_sequester(rid(1501)).await.unwrap();
    assert!(status.to_string().starts_with("SEQUESTERED"));
    assert!(status.to_string().ends_with("| bad SMART"));

    assert_matches!(
        manager.mount(rid(1501)).await,
        Err(Error::Sequestered { .. })
    );
    assert!(!manager.paths(rid(1501)).root.exists());

    let again = manager.sequester(rid(1501), "still bad").await.unwrap();
    assert!(!again.changed);

    manager.unsequester(rid(1501), "drive replaced").await.unwrap();
    manager.mount(rid(1501)).await.unwrap();
    let summaries = manager.list().unwrap();
    assert_eq!(summaries.len(), 1);
    assert!(!summaries[0].sequester.is_sequestered());
}

#[tokio::test]
async fn sequester_leaves_existing_mount_in_place() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();
    manager.mount(rid(1501)).await.unwrap();
    let paths = manager.paths(rid(1501));

    manager.sequester(rid(1501), "pending replacement").await.unwrap();

    assert!(host.is_mounted(&paths.md));
    let ledger = fs::read_to_string(paths.md.join("SEQUESTER_STATUS")).unwrap();
    assert!(ledger.starts_with("SEQUESTERED | "));
}

#[tokio::test]
async fn import_then_export_preserves_metadata() {
    let (_dir, host, manager) = setup();
    let device = host.add_resource("sdb", rid(1501)).unwrap();
    let backing = host.backing_dir(&device.md_partition());
    fs::create_dir_all(backing.join("db/chunks")).unwrap();
    fs::write(backing.join("db/chunks/000001.log"), b"\x00\x01allocation").unwrap();
    fs::write(backing.join("db/CURRENT"), "MANIFEST-000004\n").unwrap();

    manager.mount(rid(1501)).await.unwrap();
    let paths = manager.paths(rid(1501));
    let original = tree(&paths.md);

    let import_root = manager.config().import_dir.clone();
    let external = manager.import(rid(1501), &import_root, false).await.unwrap();
    assert_eq!(external, import_root.join("md-1501"));
    assert_eq!(fs::read_link(&paths.md).unwrap(), external);
    assert!(!host.is_mounted(&paths.md));
    assert_eq!(manager.mount_state(rid(1501)).unwrap(), MountState::MountedImported);
    let descriptor = fs::read_to_string(&paths.descriptor).unwrap();
    assert_eq!(descriptor.trim().split(':').count(), 4);

    // remounting an imported resource symlinks again
    manager.umount(rid(1501)).await.unwrap();
    assert!(external.is_dir());
    let remounted = manager.mount(rid(1501)).await.unwrap();
    assert_eq!(remounted.external_dir(), Some(external.as_path()));
    assert!(fs::symlink_metadata(&paths.md).unwrap().file_type().is_symlink());

    assert_matches!(
        manager.import(rid(1501), &import_root, false).await,
        Err(Error::AlreadyInState { .. })
    );

    manager.export(rid(1501), &import_root, true).await.unwrap();
    assert!(host.is_mounted(&paths.md));
    assert_eq!(manager.mount_state(rid(1501)).unwrap(), MountState::MountedDirect);
    assert_eq!(tree(&paths.md), original);
    assert!(!external.exists());
    let snapshots = fs::read_dir(import_root.join("snapshots")).unwrap().count();
    assert_eq!(snapshots, 1);
}

#[tokio::test]
async fn busy_umount_changes_nothing() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();
    manager.mount(rid(1501)).await.unwrap();
    let paths = manager.paths(rid(1501));
    fs::write(paths.data.join("allocation"), "x").unwrap();
    host.hold_open(&paths.data.join("allocation"), "pid 4242");
    let depot = manager.config().depot_dir.clone();
    let before = tree(&depot);

    let err = manager.umount(rid(1501)).await.unwrap_err();
    assert_matches!(&err, Error::Busy { holders, .. } if holders == &vec!["pid 4242".to_string()]);
    assert_eq!(err.exit_code(), 5);
    assert_eq!(tree(&depot), before);
    assert!(host.is_mounted(&paths.data));
    assert!(host.is_mounted(&paths.md));

    host.release_open(&paths.data);
    manager.umount(rid(1501)).await.unwrap();
}

#[tokio::test]
async fn create_provisions_blank_device() {
    let (_dir, host, manager) = setup();
    let device = host.add_blank_disk("sdb");

    let descriptor = manager
        .create(rid(1501), &device, false, &AssumeNo)
        .await
        .unwrap();

    let root = host.root().display().to_string();
    let paths = manager.paths(rid(1501));
    assert_eq!(
        descriptor.to_string(),
        format!("dev:{}/dev/sdb1:{}/dev/sdb2", root, root)
    );
    assert_eq!(
        fs::read_to_string(&paths.descriptor).unwrap().trim(),
        descriptor.to_string()
    );
    let labels = &manager.config().label_dir;
    assert!(fs::symlink_metadata(labels.join("rid-md-1501")).is_ok());
    assert!(fs::symlink_metadata(labels.join("rid-data-1501")).is_ok());
    let settings = fs::read_to_string(paths.settings()).unwrap();
    assert!(settings.contains("[resource 1501]"));
    assert_eq!(manager.index().unwrap().device_for(rid(1501)), Some(&device));

    // the new resource survives a full unmount/mount cycle
    manager.umount(rid(1501)).await.unwrap();
    manager.mount(rid(1501)).await.unwrap();
}

#[tokio::test]
async fn create_respects_declined_confirmation() {
    let (_dir, host, manager) = setup();
    let device = host.add_resource("sdb", rid(4100)).unwrap();

    assert_matches!(
        manager.create(rid(1501), &device, false, &AssumeNo).await,
        Err(Error::Declined(_))
    );
    assert!(host.commands().iter().all(|c| !c.starts_with("parted")));
    assert!(manager.index().unwrap().resource_exists(rid(4100)));

    manager
        .create(rid(1501), &device, false, &AssumeYes)
        .await
        .unwrap();
    assert!(manager.index().unwrap().resource_exists(rid(1501)));
}

#[tokio::test]
async fn umount_all_reports_only_busy_resource() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();
    host.add_resource("sdc", rid(1502)).unwrap();
    let batch = BatchOrchestrator::new(manager.clone());
    assert!(batch.mount_all(BatchMode::Join).await.unwrap().is_success());
    let busy = manager.paths(rid(1502)).md.join("rid.settings");
    host.hold_open(&busy, "pid 77");

    let report = batch.umount_all(BatchMode::Join).await.unwrap();

    assert_eq!(report.succeeded, vec![rid(1501)]);
    assert_eq!(report.failed.len(), 1);
    assert_matches!(&report.failed[0], (r, Error::Busy { .. }) if *r == rid(1502));
    assert_eq!(manager.list_rids().unwrap(), vec![rid(1502)]);
}

#[tokio::test]
async fn failed_mount_is_rolled_back() {
    let (_dir, host, manager) = setup();
    let device = host.add_resource("sdb", rid(1501)).unwrap();
    host.fail_mount(&device.data_partition());

    let err = manager.mount(rid(1501)).await.unwrap_err();
    assert_matches!(&err, Error::PartialFailure { operation: "mount", rollback, .. } if rollback.is_empty());
    assert_eq!(err.exit_code(), 4);

    let paths = manager.paths(rid(1501));
    assert!(!paths.root.exists());
    assert!(!host.is_mounted(&paths.md));
    assert!(host.backing_dir(&device.md_partition()).join("rid.settings").is_file());

    manager.mount(rid(1501)).await.unwrap();
}

#[tokio::test]
async fn defrag_logs_fragmented_files() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();
    manager.mount(rid(1501)).await.unwrap();
    let data = manager.paths(rid(1501)).data;
    fs::create_dir_all(data.join("0")).unwrap();
    fs::write(data.join("0/fragmented"), vec![0u8; 4096]).unwrap();
    fs::write(data.join("0/contiguous"), "x").unwrap();
    host.set_extents(&data.join("0/fragmented"), 9);

    let log_dir = manager.config().defrag.log_dir.clone();
    let report = manager.defrag(rid(1501), &log_dir, 3).await.unwrap();

    assert_eq!(report.scanned, 2);
    assert_eq!(report.defragmented, 1);
    let log = fs::read_to_string(log_dir.join("extents-rid-1501.log")).unwrap();
    assert!(log.starts_with("# TIME START RID 1501 SCAN"));
    assert!(log.contains("Filesize = 4096 and Extents Before = 9 and Extents after = 1"));
    assert!(!log.contains("contiguous"));
}

#[tokio::test]
async fn settings_option_keeps_backup() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();
    manager.mount(rid(1501)).await.unwrap();
    let settings = manager.paths(rid(1501)).settings();
    let before = fs::read_to_string(&settings).unwrap();

    manager
        .set_rid_option(rid(1501), "rid".parse().unwrap(), "enable_chksum", "1")
        .await
        .unwrap();

    let after = fs::read_to_string(&settings).unwrap();
    assert!(after.starts_with("[resource 1501]\nrid = 1501\n"));
    assert!(after.contains("enable_chksum = 1"));
    let mut backup = settings.clone().into_os_string();
    backup.push(".old");
    assert_eq!(fs::read_to_string(PathBuf::from(backup)).unwrap(), before);
}

#[tokio::test]
async fn unknown_resource_is_not_found() {
    let (_dir, _host, manager) = setup();
    let err = manager.mount(rid(1999)).await.unwrap_err();
    assert_matches!(err, Error::ResourceNotFound { .. });
    assert_eq!(err.exit_code(), 7);
}

#[tokio::test]
async fn hand_written_sequester_line_blocks_mount() {
    let (_dir, host, manager) = setup();
    let device = host.add_resource("sdb", rid(1501)).unwrap();
    fs::write(
        host.backing_dir(&device.md_partition()).join("SEQUESTER_STATUS"),
        "SEQUESTERED bad SMART\n",
    )
    .unwrap();

    let status = manager.check_sequester(rid(1501)).await.unwrap();
    assert!(status.is_sequestered());
    assert_eq!(status.line, "SEQUESTERED bad SMART");

    assert_matches!(
        manager.mount(rid(1501)).await,
        Err(Error::Sequestered { .. })
    );
    assert!(!manager.paths(rid(1501)).root.exists());
}

#[tokio::test]
async fn sequestered_resource_is_not_imported() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();
    manager.mount(rid(1501)).await.unwrap();
    manager.sequester(rid(1501), "bad SMART").await.unwrap();
    let paths = manager.paths(rid(1501));

    let import_root = manager.config().import_dir.clone();
    assert_matches!(
        manager.import(rid(1501), &import_root, false).await,
        Err(Error::Sequestered { .. })
    );

    assert_eq!(manager.mount_state(rid(1501)).unwrap(), MountState::MountedDirect);
    assert!(host.is_mounted(&paths.md));
    assert!(!paths.default_import.exists());
    assert!(!paths.md.join("import").exists());
}

#[tokio::test]
async fn cancelled_import_leaves_resource_mounted() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();
    manager.mount(rid(1501)).await.unwrap();
    manager.cancellation().cancel();

    let import_root = manager.config().import_dir.clone();
    let err = manager.import(rid(1501), &import_root, false).await.unwrap_err();
    assert_matches!(err, Error::Cancelled);
    assert_eq!(err.exit_code(), 10);

    let paths = manager.paths(rid(1501));
    assert_eq!(manager.mount_state(rid(1501)).unwrap(), MountState::MountedDirect);
    assert!(host.is_mounted(&paths.md));
    assert!(!paths.default_import.exists());
}

#[tokio::test]
async fn failed_remount_reverts_import() {
    let (_dir, host, manager) = setup();
    let device = host.add_resource("sdb", rid(1501)).unwrap();
    manager.mount(rid(1501)).await.unwrap();
    let paths = manager.paths(rid(1501));
    let original = tree(&paths.md);
    host.fail_mount(&device.data_partition());

    let import_root = manager.config().import_dir.clone();
    let err = manager.import(rid(1501), &import_root, false).await.unwrap_err();
    assert_matches!(&err, Error::PartialFailure { operation: "import", rollback, .. } if rollback.is_empty());

    assert_eq!(manager.mount_state(rid(1501)).unwrap(), MountState::MountedDirect);
    assert!(host.is_mounted(&paths.md));
    assert!(host.is_mounted(&paths.data));
    assert!(!paths.default_import.exists());
    assert_eq!(tree(&paths.md), original);
}

#[tokio::test]
async fn relative_import_dir_is_made_absolute() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();
    manager.mount(rid(1501)).await.unwrap();
    let paths = manager.paths(rid(1501));
    let cwd_scratch = TempDir::new_in(".").unwrap();
    let relative = cwd_scratch
        .path()
        .strip_prefix(std::env::current_dir().unwrap())
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| cwd_scratch.path().to_path_buf())
        .join("ssd");
    assert!(relative.is_relative());

    let external = manager.import(rid(1501), &relative, false).await.unwrap();

    assert!(external.is_absolute());
    assert_eq!(fs::read_link(&paths.md).unwrap(), external);
    assert!(paths.settings().is_file());
    let marker = fs::read_to_string(external.join("import")).unwrap();
    assert_eq!(PathBuf::from(marker.trim()), external);

    manager.export(rid(1501), &relative, false).await.unwrap();
    assert_eq!(manager.mount_state(rid(1501)).unwrap(), MountState::MountedDirect);
    assert!(!external.exists());
}

#[tokio::test]
async fn import_refuses_existing_destination() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();
    manager.mount(rid(1501)).await.unwrap();
    let paths = manager.paths(rid(1501));
    fs::create_dir_all(paths.default_import.join("leftover")).unwrap();

    let import_root = manager.config().import_dir.clone();
    let err = manager.import(rid(1501), &import_root, false).await.unwrap_err();
    assert_matches!(&err, Error::DestinationExists { path } if path == &paths.default_import);

    assert_eq!(manager.mount_state(rid(1501)).unwrap(), MountState::MountedDirect);
    assert!(paths.default_import.join("leftover").is_dir());
    assert!(!paths.md.join("import").exists());
}

#[tokio::test]
async fn export_requires_imported_resource() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();
    manager.mount(rid(1501)).await.unwrap();

    let import_root = manager.config().import_dir.clone();
    assert_matches!(
        manager.export(rid(1501), &import_root, false).await,
        Err(Error::AlreadyInState { .. })
    );
    assert_eq!(manager.mount_state(rid(1501)).unwrap(), MountState::MountedDirect);
}

#[tokio::test]
async fn export_refuses_mismatched_marker() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();
    manager.mount(rid(1501)).await.unwrap();
    let import_root = manager.config().import_dir.clone();
    let external = manager.import(rid(1501), &import_root, false).await.unwrap();
    fs::write(external.join("import"), "/srv/elsewhere/md-1501\n").unwrap();

    let err = manager.export(rid(1501), &import_root, false).await.unwrap_err();
    assert_matches!(err, Error::Inconsistent { .. });

    let paths = manager.paths(rid(1501));
    assert_eq!(manager.mount_state(rid(1501)).unwrap(), MountState::MountedImported);
    assert_eq!(fs::read_link(&paths.md).unwrap(), external);
    assert!(external.join("rid.settings").is_file());
}

#[tokio::test]
async fn second_mount_reports_imported_state() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();
    manager.mount(rid(1501)).await.unwrap();
    let import_root = manager.config().import_dir.clone();
    manager.import(rid(1501), &import_root, false).await.unwrap();

    assert_matches!(
        manager.mount(rid(1501)).await,
        Err(Error::AlreadyInState { state, .. }) if state == MountState::MountedImported.to_string()
    );
}

#[tokio::test]
async fn incomplete_umount_keeps_descriptor_until_retry() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();
    let depot = manager.config().depot_dir.clone();
    fs::create_dir_all(&depot).unwrap();
    let before = tree(&depot);
    manager.mount(rid(1501)).await.unwrap();
    let paths = manager.paths(rid(1501));
    host.fail_umount(&paths.data);

    let err = manager.umount(rid(1501)).await.unwrap_err();
    assert_matches!(&err, Error::IncompleteUnmount { failures, .. } if failures.len() == 1 && failures[0].starts_with("data:"));
    assert_eq!(err.exit_code(), 4);
    assert!(paths.descriptor.is_file());
    assert!(host.is_mounted(&paths.data));
    assert!(!host.is_mounted(&paths.md));

    manager.umount(rid(1501)).await.unwrap();
    assert_eq!(tree(&depot), before);
    assert!(!host.is_mounted(&paths.data));
}

#[tokio::test]
async fn stray_entry_keeps_descriptor() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();
    manager.mount(rid(1501)).await.unwrap();
    let paths = manager.paths(rid(1501));
    let stray = paths.root.join("core.4242");
    fs::write(&stray, "dump").unwrap();

    assert_matches!(
        manager.umount(rid(1501)).await,
        Err(Error::IncompleteUnmount { failures, .. }) if failures.iter().any(|f| f.contains("core.4242"))
    );
    assert!(paths.descriptor.is_file());
    assert!(!host.is_mounted(&paths.md));
    assert!(!host.is_mounted(&paths.data));

    fs::remove_file(&stray).unwrap();
    manager.umount(rid(1501)).await.unwrap();
    assert!(!paths.root.exists());
}

#[tokio::test]
async fn force_cleanup_clears_directory_without_descriptor() {
    let (_dir, host, manager) = setup();
    let device = host.add_resource("sdb", rid(1501)).unwrap();
    manager.mount(rid(1501)).await.unwrap();
    let paths = manager.paths(rid(1501));
    fs::remove_file(&paths.descriptor).unwrap();

    assert_matches!(
        manager.umount(rid(1501)).await,
        Err(Error::MissingDescriptor { .. })
    );
    assert_matches!(
        manager.mount(rid(1501)).await,
        Err(Error::MissingDescriptor { .. })
    );

    manager.force_cleanup(rid(1501)).await.unwrap();
    assert!(!paths.root.exists());
    assert!(!host.is_mounted(&paths.md));
    assert!(!host.is_mounted(&paths.data));
    assert!(host.backing_dir(&device.md_partition()).join("rid.settings").is_file());

    assert_matches!(
        manager.force_cleanup(rid(1501)).await,
        Err(Error::AlreadyInState { .. })
    );
    manager.mount(rid(1501)).await.unwrap();
}

#[tokio::test]
async fn failed_initializer_rolls_back_create() {
    let (_dir, host, manager) = setup();
    let device = host.add_blank_disk("sdb");
    host.fail_initializer();

    let err = manager
        .create(rid(1501), &device, false, &AssumeNo)
        .await
        .unwrap_err();
    assert_matches!(&err, Error::PartialFailure { operation: "create", rollback, .. } if rollback.is_empty());

    let paths = manager.paths(rid(1501));
    assert!(!paths.root.exists());
    assert!(!host.is_mounted(&paths.md));
    assert!(!host.is_mounted(&paths.data));
    assert!(manager.list_rids().unwrap().is_empty());

    manager
        .create(rid(1501), &device, false, &AssumeYes)
        .await
        .unwrap();
    assert!(paths.settings().is_file());
}

#[tokio::test]
async fn operations_on_one_resource_are_serialized() {
    let (_dir, host, manager) = setup();
    host.add_resource("sdb", rid(1501)).unwrap();
    let mut impatient = host.config();
    impatient.timeouts.lock_secs = 1;
    let impatient = ResourceManager::new(impatient, host.ports()).unwrap();

    let held = RidLock::acquire(&manager.config().lock_dir, rid(1501), Duration::from_secs(1))
        .await
        .unwrap();

    let err = impatient.mount(rid(1501)).await.unwrap_err();
    assert_matches!(err, Error::LockContention { .. });
    assert_eq!(err.exit_code(), 9);

    let waiting = tokio::spawn({
        let manager = manager.clone();
        async move { manager.mount(rid(1501)).await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!manager.paths(rid(1501)).root.exists());

    drop(held);
    waiting.await.unwrap().unwrap();
    assert_eq!(manager.mount_state(rid(1501)).unwrap(), MountState::MountedDirect);
}
