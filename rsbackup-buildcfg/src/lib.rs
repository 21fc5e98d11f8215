//! Paths and directory layout shared across the `rsbackup` workspace.

pub const RSBACKUP_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration directory.
pub const CONFIGDIR: &str = "/etc/rsbackup";

#[macro_export]
macro_rules! RSBACKUP_RUN_DIR_M {
    () => {
        "/run/rsbackup"
    };
}

#[macro_export]
macro_rules! RSBACKUP_STATE_DIR_M {
    () => {
        "/var/lib/rsbackup"
    };
}

#[macro_export]
macro_rules! RSBACKUP_LOG_DIR_M {
    () => {
        "/var/log/rsbackup"
    };
}

/// namespaced directory for in-memory (tmpfs) run state, e.g. the whole-process lock file.
pub const RSBACKUP_RUN_DIR: &str = RSBACKUP_RUN_DIR_M!();

/// namespaced directory for persistent state, e.g. per-job state files and the task log directory.
pub const RSBACKUP_STATE_DIR: &str = RSBACKUP_STATE_DIR_M!();

/// namespaced directory for persistent logging.
pub const RSBACKUP_LOG_DIR: &str = RSBACKUP_LOG_DIR_M!();

/// the lock file guarding the whole process (spec.md §1: "advisory whole-process lock file").
pub const RSBACKUP_LOCK_FN: &str = concat!(RSBACKUP_RUN_DIR_M!(), "/rsbackup.lock");

/// the default catalogue database file.
pub const RSBACKUP_DATABASE_FN: &str = concat!(RSBACKUP_STATE_DIR_M!(), "/backup.db");

/// Prepend the configuration directory to a file name.
#[macro_export]
macro_rules! configdir {
    ($subdir:expr) => {
        concat!("/etc/rsbackup", $subdir)
    };
}

/// Prepend the run directory to a file name.
#[macro_export]
macro_rules! rundir {
    ($subdir:expr) => {
        concat!($crate::RSBACKUP_RUN_DIR_M!(), $subdir)
    };
}
