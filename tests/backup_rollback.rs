//! Backup creation and rollback through the manager

mod common;

use common::Harness;
use schemaguard::config::GuardConfig;
use schemaguard::migration::{BackupOutcome, CampaignPhase, CancellationToken};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn test_backups_with_identical_labels_never_collide() {
    let h = Harness::new(GuardConfig::default());

    let paths: HashSet<_> = (0..5)
        .map(|_| {
            let result = h.manager.create_pre_migration_backup();
            assert!(result.is_success(), "{}", result.message());
            result.backup_path().unwrap().to_path_buf()
        })
        .collect();

    assert_eq!(paths.len(), 5);
    assert!(paths.iter().all(|p| p.exists()));
    assert_eq!(h.manager.list_backups().unwrap().len(), 5);
}

#[test]
fn test_backup_label_follows_the_schema_version() {
    let h = Harness::new(GuardConfig::default()).with_scripts(2);
    h.manager.execute_migrations();

    let result = h.manager.create_pre_migration_backup();
    let artifact = result.artifact().unwrap();
    assert_eq!(artifact.label, "pre-migration-2");
    assert!(artifact.name.starts_with("pre-migration-2-"));
}

#[test]
fn test_disabled_backup_is_a_successful_no_op() {
    let h = Harness::new(GuardConfig::default().with_backup_before_migration(false));

    let result = h.manager.create_pre_migration_backup();
    assert!(result.is_success());
    assert_eq!(result.message(), "Backup disabled by configuration");
    assert_eq!(
        result.success_detail().map(|s| &s.backup),
        Some(&BackupOutcome::Disabled)
    );
    assert!(result.backup_path().is_none());
    assert_eq!(h.snapshotter.dump_calls(), 0);
    assert!(!h.dir.path().join("backups").exists());
}

#[test]
fn test_rollback_restores_the_snapshot() {
    let h = Harness::new(GuardConfig::default());
    let name = h
        .manager
        .create_pre_migration_backup()
        .artifact()
        .unwrap()
        .name
        .clone();

    h.snapshotter.set_content("-- after a bad migration\n");
    let result = h.manager.rollback_to_backup(&name);
    assert!(result.is_success(), "{}", result.message());
    assert_eq!(result.success_detail().unwrap().name, name);
    assert_eq!(h.snapshotter.content(), b"-- database image\n");
    assert_eq!(h.manager.campaign_phase(), CampaignPhase::Done);
}

#[test]
fn test_rollback_preconditions_are_enforced() {
    let h = Harness::new(GuardConfig::default());
    let artifact = h
        .manager
        .create_pre_migration_backup()
        .artifact()
        .unwrap()
        .clone();

    let outside = format!("../{}", artifact.name);
    for name in ["does-not-exist.sql", outside.as_str(), "/etc/passwd"] {
        let result = h.manager.rollback_to_backup(name);
        assert!(result.is_failure(), "{name}");
        assert_eq!(result.failure_detail().unwrap().backup, name);
    }

    std::fs::write(&artifact.path, "-- tampered\n").unwrap();
    assert!(h.manager.rollback_to_backup(&artifact.name).is_failure());

    assert_eq!(h.snapshotter.restore_calls(), 0);
    assert_eq!(h.manager.campaign_phase(), CampaignPhase::Failed);
}

#[test]
fn test_timed_out_rollback_stops_before_the_lock_is_released() {
    let h = Harness::new(GuardConfig::default().with_backup_timeout_seconds(1)).with_scripts(1);
    let name = h
        .manager
        .create_pre_migration_backup()
        .artifact()
        .unwrap()
        .name
        .clone();
    h.snapshotter.set_content("-- after a bad migration\n");
    h.snapshotter.set_restore_delay(Some(Duration::from_secs(5)));

    let result = h.manager.rollback_to_backup(&name);
    assert!(result.is_failure());
    assert!(result.failure_detail().unwrap().timed_out);
    assert_eq!(result.message(), "Rollback failed: Restore timed out after 1s");
    assert_eq!(h.snapshotter.restores_in_flight(), 0);
    assert_eq!(h.manager.campaign_phase(), CampaignPhase::Failed);

    let executed = h.manager.execute_migrations();
    assert!(executed.is_success(), "{}", executed.message());
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(h.snapshotter.content(), b"-- after a bad migration\n");
}

#[test]
fn test_rollback_waits_for_the_campaign_lock_held_by_a_restore() {
    let h = Harness::new(GuardConfig::default().with_lock_timeout_seconds(10));
    let name = h
        .manager
        .create_pre_migration_backup()
        .artifact()
        .unwrap()
        .name
        .clone();
    h.snapshotter.set_restore_delay(Some(Duration::from_millis(500)));

    let manager = Arc::new(h.manager);
    let first = {
        let manager = Arc::clone(&manager);
        let name = name.clone();
        std::thread::spawn(move || manager.rollback_to_backup(&name))
    };
    std::thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    let second = manager.rollback_to_backup(&name);
    assert!(second.is_success(), "{}", second.message());
    assert!(first.join().unwrap().is_success());
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(h.snapshotter.restore_calls(), 2);
    assert_eq!(h.snapshotter.restores_in_flight(), 0);
}

#[test]
fn test_cancelled_rollback_leaves_the_database_untouched() {
    let h = Harness::new(GuardConfig::default());
    let name = h
        .manager
        .create_pre_migration_backup()
        .artifact()
        .unwrap()
        .name
        .clone();
    h.snapshotter.set_content("-- after a bad migration\n");
    h.snapshotter.set_restore_delay(Some(Duration::from_secs(5)));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        trigger.cancel();
    });

    let result = h.manager.rollback_to_backup_with_cancel(&name, &cancel);
    canceller.join().unwrap();
    assert!(result.is_failure());
    assert!(result.failure_detail().unwrap().cancelled);
    assert_eq!(h.snapshotter.content(), b"-- after a bad migration\n");
    assert_eq!(h.manager.campaign_phase(), CampaignPhase::Failed);
}
