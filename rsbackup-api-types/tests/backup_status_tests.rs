use rsbackup_api_types::{Backup, BackupStatus, Volume};

#[test]
fn status_code_round_trips() {
    for status in [
        BackupStatus::Unknown,
        BackupStatus::Underway,
        BackupStatus::Complete,
        BackupStatus::Failed,
        BackupStatus::Pruning,
        BackupStatus::Pruned,
    ] {
        assert_eq!(BackupStatus::from_code(status.code()), status);
    }
}

#[test]
fn pruned_is_the_only_non_live_status() {
    assert!(!BackupStatus::Pruned.is_live());
    for status in [
        BackupStatus::Unknown,
        BackupStatus::Underway,
        BackupStatus::Complete,
        BackupStatus::Failed,
        BackupStatus::Pruning,
    ] {
        assert!(status.is_live());
    }
}

#[test]
fn volume_tracks_per_device_and_overall_stats_across_lifecycle() {
    let mut volume = Volume::new("home", "/home/alice");

    let mut b1 = Backup::new("h1", "home", "usb1", "2026-01-01T00:00:00", 1000);
    b1.status = BackupStatus::Complete;
    volume.attach_backup(b1);

    let mut b2 = Backup::new("h1", "home", "usb1", "2026-01-02T00:00:00", 2000);
    b2.status = BackupStatus::Underway;
    volume.attach_backup(b2.clone());

    assert_eq!(volume.device_stats("usb1").count, 2);
    assert_eq!(volume.stats().completed_count, 1);

    // The backup completes: update in place rather than attaching a
    // duplicate row, matching the catalogue's (host, volume, device, id)
    // uniqueness invariant.
    b2.status = BackupStatus::Complete;
    b2.finish_time = 2100;
    volume.update_backup(b2);

    assert_eq!(volume.device_stats("usb1").count, 2);
    assert_eq!(volume.stats().completed_count, 2);
    assert_eq!(volume.stats().newest, Some(2000));

    volume.detach_backup("usb1", "2026-01-01T00:00:00");
    assert_eq!(volume.device_stats("usb1").count, 1);
    assert_eq!(volume.stats().oldest, Some(2000));
}
