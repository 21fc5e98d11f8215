use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Backup`] record (spec.md §3 "Backup status").
///
/// Transitions: `Unknown`/absent → `Underway` on record creation;
/// `Underway` → `Complete` (rc 0 or 24) or `Failed` (any other nonzero);
/// `Complete` → `Pruning` when selected by a prune policy;
/// `Pruning` → `Pruned` once the bulk removal succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Unknown,
    Underway,
    Complete,
    Failed,
    Pruning,
    Pruned,
}

impl BackupStatus {
    /// Integer encoding used for the catalogue's `status` column.
    pub fn code(self) -> i64 {
        match self {
            BackupStatus::Unknown => 0,
            BackupStatus::Underway => 1,
            BackupStatus::Complete => 2,
            BackupStatus::Failed => 3,
            BackupStatus::Pruning => 4,
            BackupStatus::Pruned => 5,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => BackupStatus::Underway,
            2 => BackupStatus::Complete,
            3 => BackupStatus::Failed,
            4 => BackupStatus::Pruning,
            5 => BackupStatus::Pruned,
            _ => BackupStatus::Unknown,
        }
    }

    /// True for states that still occupy on-disk space (i.e. everything
    /// except a tombstoned `Pruned` record).
    pub fn is_live(self) -> bool {
        !matches!(self, BackupStatus::Pruned)
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BackupStatus::Unknown => "unknown",
            BackupStatus::Underway => "underway",
            BackupStatus::Complete => "complete",
            BackupStatus::Failed => "failed",
            BackupStatus::Pruning => "pruning",
            BackupStatus::Pruned => "pruned",
        })
    }
}

/// A single attempt to copy a [`crate::Volume`] to a [`crate::Device`]
/// (spec.md §3 "Backup record").
///
/// `device` is stored as a plain string rather than a handle: the
/// configured device may vanish from the configuration between runs while
/// its catalogue rows remain as history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub host: String,
    pub volume: String,
    pub device: String,
    /// Canonically a UTC timestamp in `YYYY-MM-DDTHH:MM:SS` form.
    pub id: String,
    pub start_time: i64,
    /// May be zero for rows written while the schema did not yet carry a
    /// finish-time column.
    pub finish_time: i64,
    /// Decision-time while pruning is underway; completion-time once pruned.
    pub prune_time: i64,
    /// The rsync child's wait-status (not just its exit code).
    pub rc: i32,
    pub status: BackupStatus,
    pub log: Vec<u8>,
}

impl Backup {
    pub fn new(host: &str, volume: &str, device: &str, id: &str, start_time: i64) -> Self {
        Backup {
            host: host.to_string(),
            volume: volume.to_string(),
            device: device.to_string(),
            id: id.to_string(),
            start_time,
            finish_time: 0,
            prune_time: 0,
            rc: 0,
            status: BackupStatus::Underway,
            log: Vec::new(),
        }
    }

    /// Age of this backup, in whole days, relative to `now` (unix seconds).
    pub fn age_days(&self, now: i64) -> f64 {
        (now - self.start_time) as f64 / 86_400.0
    }
}
