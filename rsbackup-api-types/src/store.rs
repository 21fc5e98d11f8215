use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A configured filesystem path at which a [`crate::Device`] may be mounted
/// (spec.md §3 "Store").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    pub name: String,
    pub path: PathBuf,
    /// If true, the reconciliation layer verifies something is actually
    /// mounted at `path` (its device number must differ from its parent's).
    pub mount_required: bool,
    /// Administratively enabled; disabled stores are skipped entirely.
    pub enabled: bool,
}

impl Store {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Store {
            name: name.into(),
            path: path.into(),
            mount_required: true,
            enabled: true,
        }
    }

    /// Path to the single-line device identification file at the store root.
    pub fn device_id_path(&self) -> PathBuf {
        self.path.join("device-id")
    }

    /// On-disk path for one host's volumes on this store.
    pub fn host_path(&self, host: &str) -> PathBuf {
        self.path.join(host)
    }
}
