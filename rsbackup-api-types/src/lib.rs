//! Data model and error taxonomy shared across the `rsbackup` workspace.
//!
//! Mirrors the data model of spec.md §3: `Host`, `Volume`, `Device`, `Store`
//! and `Backup`/`BackupStatus`. These are plain, serde-friendly value types;
//! the tree-shaped ownership (`Conf` owns `Host`s, a `Host` owns its
//! `Volume`s) and the policy registries that operate on them live in the
//! root `rsbackup` crate.

mod backup;
mod device;
mod error;
mod host;
mod policy;
mod store;
mod volume;

pub use backup::{Backup, BackupStatus};
pub use device::Device;
pub use error::{RsbError, SubprocessFailure};
pub use host::{Host, ReachabilityStrategy};
pub use policy::PolicySpec;
pub use store::Store;
pub use volume::{BackupWindow, DeviceStats, SelectFlags, Volume, VolumeStats};
