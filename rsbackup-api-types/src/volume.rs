use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Backup, BackupStatus, PolicySpec};

/// Per-device backup counts and bounds, recomputed whenever a [`Backup`] is
/// attached to or detached from its owning [`Volume`] (spec.md §3: "The
/// in-memory Volume's derived statistics (count, oldest, newest per device;
/// overall oldest/newest/completed count) are recomputed on any insert or
/// delete of an attached Backup").
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceStats {
    pub count: usize,
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
}

/// Derived, volume-wide statistics over every attached [`Backup`],
/// regardless of device.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeStats {
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
    pub completed_count: usize,
}

/// Daily backup window, expressed as seconds since local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupWindow {
    pub earliest: u32,
    pub latest: u32,
}

impl BackupWindow {
    pub fn contains(&self, seconds_since_midnight: u32) -> bool {
        seconds_since_midnight >= self.earliest && seconds_since_midnight <= self.latest
    }
}

/// Which purposes select this volume (spec.md §3, "selection flags per
/// purpose (backup, prune, graph)"). The history-graph renderer is an
/// external collaborator (spec.md §1), but the flag that would feed it is
/// still part of the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectFlags {
    pub backup: bool,
    pub prune: bool,
    pub graph: bool,
}

impl Default for SelectFlags {
    fn default() -> Self {
        SelectFlags {
            backup: true,
            prune: true,
            graph: true,
        }
    }
}

/// A named data set on a [`crate::Host`] (spec.md §3 "Volume").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub path: PathBuf,
    pub exclude: Vec<String>,
    /// If false (the default) the backup engine passes `--one-file-system`.
    pub traverse_mounts: bool,
    pub mount_point: Option<PathBuf>,
    /// A file whose presence is required before the volume is considered
    /// mounted and ready to back up.
    pub check_file: Option<PathBuf>,
    /// Glob restricting which device names are eligible for this volume.
    /// `None` means every configured device is eligible.
    pub devices_pattern: Option<String>,
    pub backup_policy: PolicySpec,
    pub prune_policy: PolicySpec,
    pub pre_volume_hook: Option<String>,
    pub post_volume_hook: Option<String>,
    pub rsync_timeout: Option<u64>,
    pub ssh_timeout: Option<u64>,
    pub rsync_base_options: Vec<String>,
    pub rsync_extra_options: Vec<String>,
    pub rsync_command: Option<String>,
    pub backup_window: Option<BackupWindow>,
    pub select: SelectFlags,

    /// Every Backup record attached to this volume, owned here (spec.md
    /// §3 "Ownership": "Each Volume exclusively owns its Backups"). Not
    /// `serde`-visible: backups are catalogue-derived runtime state, not
    /// configuration.
    #[serde(skip)]
    backups: Vec<Backup>,
    #[serde(skip)]
    device_stats: BTreeMap<String, DeviceStats>,
    #[serde(skip)]
    stats: VolumeStats,
}

impl Volume {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Volume {
            name: name.into(),
            path: path.into(),
            exclude: Vec::new(),
            traverse_mounts: false,
            mount_point: None,
            check_file: None,
            devices_pattern: None,
            backup_policy: PolicySpec::new("always"),
            prune_policy: PolicySpec::new("never"),
            pre_volume_hook: None,
            post_volume_hook: None,
            rsync_timeout: None,
            ssh_timeout: None,
            rsync_base_options: Vec::new(),
            rsync_extra_options: Vec::new(),
            rsync_command: None,
            backup_window: None,
            select: SelectFlags::default(),
            backups: Vec::new(),
            device_stats: BTreeMap::new(),
            stats: VolumeStats::default(),
        }
    }

    /// True if `device_name` matches this volume's device glob, or if the
    /// volume carries no glob at all (every device is eligible).
    pub fn eligible_for_device(&self, device_name: &str) -> bool {
        match &self.devices_pattern {
            None => true,
            Some(pattern) => glob::Pattern::new(pattern)
                .map(|p| p.matches(device_name))
                .unwrap_or(false),
        }
    }

    pub fn backups(&self) -> &[Backup] {
        &self.backups
    }

    pub fn backups_for_device(&self, device: &str) -> impl Iterator<Item = &Backup> {
        self.backups.iter().filter(move |b| b.device == device)
    }

    /// Backups of this volume on `device`, newest-started first (spec.md
    /// §4.8 step 4: "walk existing backups ... from newest to oldest").
    pub fn backups_for_device_newest_first(&self, device: &str) -> Vec<&Backup> {
        let mut v: Vec<&Backup> = self.backups_for_device(device).collect();
        v.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        v
    }

    pub fn device_stats(&self, device: &str) -> DeviceStats {
        self.device_stats.get(device).copied().unwrap_or_default()
    }

    pub fn stats(&self) -> VolumeStats {
        self.stats
    }

    /// Adds `backup` to this volume's owned set and recomputes derived
    /// statistics (spec.md §3 invariant).
    pub fn attach_backup(&mut self, backup: Backup) {
        self.backups.push(backup);
        self.recompute_stats();
    }

    /// Replaces an existing backup (matched by id + device) in place, e.g.
    /// after a status transition, and recomputes derived statistics.
    pub fn update_backup(&mut self, backup: Backup) {
        if let Some(existing) = self
            .backups
            .iter_mut()
            .find(|b| b.device == backup.device && b.id == backup.id)
        {
            *existing = backup;
        } else {
            self.backups.push(backup);
        }
        self.recompute_stats();
    }

    /// Removes a backup (matched by id + device), e.g. once a prune
    /// completes, and recomputes derived statistics.
    pub fn detach_backup(&mut self, device: &str, id: &str) {
        self.backups.retain(|b| !(b.device == device && b.id == id));
        self.recompute_stats();
    }

    fn recompute_stats(&mut self) {
        self.device_stats.clear();
        let mut stats = VolumeStats::default();

        for backup in &self.backups {
            let entry = self.device_stats.entry(backup.device.clone()).or_default();
            entry.count += 1;
            entry.oldest = Some(entry.oldest.map_or(backup.start_time, |o| o.min(backup.start_time)));
            entry.newest = Some(entry.newest.map_or(backup.start_time, |n| n.max(backup.start_time)));

            stats.oldest = Some(stats.oldest.map_or(backup.start_time, |o| o.min(backup.start_time)));
            stats.newest = Some(stats.newest.map_or(backup.start_time, |n| n.max(backup.start_time)));
            if backup.status == BackupStatus::Complete {
                stats.completed_count += 1;
            }
        }

        self.stats = stats;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_recompute_on_attach_and_detach() {
        let mut volume = Volume::new("v1", "/data");
        let mut b1 = Backup::new("h", "v1", "d1", "id1", 100);
        b1.status = BackupStatus::Complete;
        let mut b2 = Backup::new("h", "v1", "d1", "id2", 300);
        b2.status = BackupStatus::Complete;
        let mut b3 = Backup::new("h", "v1", "d2", "id3", 200);
        b3.status = BackupStatus::Failed;

        volume.attach_backup(b1);
        volume.attach_backup(b2);
        volume.attach_backup(b3);

        let d1 = volume.device_stats("d1");
        assert_eq!(d1.count, 2);
        assert_eq!(d1.oldest, Some(100));
        assert_eq!(d1.newest, Some(300));

        let overall = volume.stats();
        assert_eq!(overall.oldest, Some(100));
        assert_eq!(overall.newest, Some(300));
        assert_eq!(overall.completed_count, 2);

        volume.detach_backup("d1", "id2");
        let d1 = volume.device_stats("d1");
        assert_eq!(d1.count, 1);
        assert_eq!(d1.newest, Some(100));
        assert_eq!(volume.stats().completed_count, 1);
    }

    #[test]
    fn backups_for_device_newest_first_orders_descending() {
        let mut volume = Volume::new("v1", "/data");
        volume.attach_backup(Backup::new("h", "v1", "d1", "old", 100));
        volume.attach_backup(Backup::new("h", "v1", "d1", "new", 300));
        volume.attach_backup(Backup::new("h", "v1", "d1", "mid", 200));
        let ordered = volume.backups_for_device_newest_first("d1");
        let ids: Vec<&str> = ordered.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn eligible_for_device_respects_glob() {
        let mut volume = Volume::new("v1", "/data");
        volume.devices_pattern = Some("usb*".to_string());
        assert!(volume.eligible_for_device("usb1"));
        assert!(!volume.eligible_for_device("nas1"));
    }
}
