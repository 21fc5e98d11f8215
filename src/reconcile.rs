//! Store/device reconciliation (spec.md §4.5), grounded on the original's
//! `Store::identify`/`DeviceAccess.cc`.
//!
//! The original keeps a `Store*`/`Device*` cross-pointer pair once
//! reconciled. We keep both halves as independent values and hand back an
//! external `store name -> device name` map instead (spec.md §9's
//! "Cyclic/back references" note suggests nullable handles; an external
//! map avoids a `RefCell` cycle and is just as easy to invalidate on the
//! next reconciliation pass).

use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::fs::MetadataExt;

use anyhow::{bail, Result};
use rsbackup_api_types::{Device, RsbError, Store};
use rsbackup_tools::SubprocessSpec;

pub struct Reconciler {
    pre_access_hook: Option<Vec<String>>,
    post_access_hook: Option<Vec<String>>,
    public_stores: bool,
    hook_fired: bool,
    /// Kept open for the duration of the reconciliation so the backing
    /// filesystem can't be unmounted out from under a live store; closed
    /// explicitly before the post-access hook runs.
    open_files: Vec<File>,
}

/// One store's outcome: identified (paired with a device) or not, with a
/// reason attached in the latter case for reporting.
pub enum StoreOutcome {
    Identified { device: String },
    Unavailable { reason: String },
    Bad { reason: String },
}

impl Reconciler {
    pub fn new(
        pre_access_hook: Option<Vec<String>>,
        post_access_hook: Option<Vec<String>>,
        public_stores: bool,
    ) -> Self {
        Reconciler {
            pre_access_hook,
            post_access_hook,
            public_stores,
            hook_fired: false,
            open_files: Vec::new(),
        }
    }

    fn run_hook(&self, cmd: &[String], hook_name: &str, device_names: &[String]) -> Result<()> {
        if cmd.is_empty() {
            return Ok(());
        }
        let mut spec = SubprocessSpec::new(&cmd[0]).args(cmd[1..].to_vec());
        spec = spec
            .env("RSBACKUP_HOOK", hook_name)
            .env("RSBACKUP_DEVICES", device_names.join(" "));
        rsbackup_tools::run_standalone(spec)?;
        Ok(())
    }

    fn ensure_pre_access(&mut self, device_names: &[String]) -> Result<()> {
        if !self.hook_fired {
            if let Some(cmd) = self.pre_access_hook.clone() {
                self.run_hook(&cmd, "pre-access-hook", device_names)?;
            }
            self.hook_fired = true;
        }
        Ok(())
    }

    /// Runs the post-access hook exactly once, iff the pre-access hook
    /// fired, and releases the held-open store files first (spec.md §4.5:
    /// "that file is closed before the post-access hook fires").
    pub fn finish(&mut self, device_names: &[String]) -> Result<()> {
        self.open_files.clear();
        if self.hook_fired {
            if let Some(cmd) = self.post_access_hook.clone() {
                self.run_hook(&cmd, "post-access-hook", device_names)?;
            }
            self.hook_fired = false;
        }
        Ok(())
    }

    /// Reconciles every store in `stores` against `devices`, returning a
    /// `store name -> device name` map for every store that was
    /// successfully identified. A duplicate device ID across two stores is
    /// fatal for the whole operation (spec.md §4.5 step 4).
    pub fn reconcile(
        &mut self,
        stores: &[Store],
        devices: &[Device],
    ) -> Result<BTreeMap<String, String>> {
        let device_names: Vec<String> = devices.iter().map(|d| d.name.clone()).collect();
        let mut identified: BTreeMap<String, String> = BTreeMap::new();
        let mut claimed_by: BTreeMap<String, String> = BTreeMap::new(); // device -> store

        for store in stores {
            if !store.enabled {
                continue;
            }
            match self.identify_one(store, &devices, &device_names) {
                Ok(StoreOutcome::Identified { device }) => {
                    if let Some(existing) = claimed_by.get(&device) {
                        return Err(RsbError::FatalStore {
                            device_id: device,
                            first: existing.clone(),
                            second: store.name.clone(),
                        }
                        .into());
                    }
                    claimed_by.insert(device.clone(), store.name.clone());
                    identified.insert(store.name.clone(), device);
                }
                Ok(StoreOutcome::Unavailable { reason }) => {
                    log::warn!("store '{}' unavailable: {}", store.name, reason);
                }
                Ok(StoreOutcome::Bad { reason }) => {
                    log::warn!("store '{}' unsuitable: {}", store.name, reason);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(identified)
    }

    fn identify_one(
        &mut self,
        store: &Store,
        devices: &[Device],
        device_names: &[String],
    ) -> Result<StoreOutcome> {
        let meta = match std::fs::metadata(&store.path) {
            Ok(m) => m,
            Err(_) => {
                return Ok(StoreOutcome::Unavailable {
                    reason: format!("store '{}' does not exist", store.path.display()),
                })
            }
        };

        if store.mount_required {
            let parent = store.path.join("..");
            let parent_meta = std::fs::metadata(&parent).map_err(|err| {
                anyhow::anyhow!("cannot stat '{}': {}", parent.display(), err)
            })?;
            if meta.dev() == parent_meta.dev() {
                return Ok(StoreOutcome::Unavailable {
                    reason: format!("store '{}' is not mounted", store.path.display()),
                });
            }
        }

        self.ensure_pre_access(device_names)?;

        let id_path = store.device_id_path();
        let device_id = match std::fs::read_to_string(&id_path) {
            Ok(contents) => contents.lines().next().unwrap_or("").to_string(),
            Err(_) => {
                return Ok(StoreOutcome::Bad {
                    reason: format!("store '{}' has a malformed device-id", store.path.display()),
                })
            }
        };
        if device_id.is_empty() {
            return Ok(StoreOutcome::Bad {
                reason: format!("store '{}' has a malformed device-id", store.path.display()),
            });
        }
        if !devices.iter().any(|d| d.name == device_id) {
            return Ok(StoreOutcome::Bad {
                reason: format!(
                    "store '{}' has unknown device-id '{}'",
                    store.path.display(),
                    device_id
                ),
            });
        }

        if !self.public_stores {
            if meta.uid() != 0 {
                return Ok(StoreOutcome::Bad {
                    reason: format!("store '{}' not owned by root", store.path.display()),
                });
            }
            if meta.mode() & 0o077 != 0 {
                return Ok(StoreOutcome::Bad {
                    reason: format!("store '{}' is not private", store.path.display()),
                });
            }
        }

        if let Ok(file) = File::open(&store.path) {
            self.open_files.push(file);
        }

        Ok(StoreOutcome::Identified { device: device_id })
    }
}

/// Validates there are no two devices sharing a name before reconciliation
/// even starts (spec.md §3: "Device: a unique name").
pub fn check_unique_device_names(devices: &[Device]) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for device in devices {
        if !seen.insert(device.name.as_str()) {
            bail!("duplicate device name '{}'", device.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_store(dir: &std::path::Path, device_id: &str) -> Store {
        std::fs::write(dir.join("device-id"), format!("{}\n", device_id)).unwrap();
        let mut store = Store::new("s1", dir.to_path_buf());
        store.mount_required = false;
        store
    }

    #[test]
    fn identifies_store_with_known_device_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(dir.path(), "dev1");
        let devices = vec![Device::new("dev1")];
        let mut reconciler = Reconciler::new(None, None, true);
        let map = reconciler.reconcile(&[store], &devices).unwrap();
        assert_eq!(map.get("s1"), Some(&"dev1".to_string()));
    }

    #[test]
    fn unknown_device_id_is_non_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(dir.path(), "unknown-device");
        let devices = vec![Device::new("dev1")];
        let mut reconciler = Reconciler::new(None, None, true);
        let map = reconciler.reconcile(&[store], &devices).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn duplicate_device_id_across_stores_is_fatal() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let mut store1 = make_store(dir1.path(), "dev1");
        store1.name = "s1".into();
        let mut store2 = make_store(dir2.path(), "dev1");
        store2.name = "s2".into();
        let devices = vec![Device::new("dev1")];
        let mut reconciler = Reconciler::new(None, None, true);
        let result = reconciler.reconcile(&[store1, store2], &devices);
        assert!(result.is_err());
    }

    #[test]
    fn missing_store_path_is_unavailable_not_an_error() {
        let devices = vec![Device::new("dev1")];
        let mut store = Store::new("gone", std::path::PathBuf::from("/nonexistent/path/xyz"));
        store.mount_required = false;
        let mut reconciler = Reconciler::new(None, None, true);
        let map = reconciler.reconcile(&[store], &devices).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn disabled_store_is_skipped_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = make_store(dir.path(), "dev1");
        store.enabled = false;
        let devices = vec![Device::new("dev1")];
        let mut reconciler = Reconciler::new(None, None, true);
        let map = reconciler.reconcile(&[store], &devices).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn duplicate_device_names_rejected_up_front() {
        let devices = vec![Device::new("dev1"), Device::new("dev1")];
        assert!(check_unique_device_names(&devices).is_err());
    }

    #[test]
    fn private_store_with_group_writable_perms_is_downgraded() {
        let dir = tempfile::tempdir().unwrap();
        let store = make_store(dir.path(), "dev1");
        let mut perms = std::fs::metadata(dir.path()).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(dir.path(), perms).unwrap();
        let devices = vec![Device::new("dev1")];
        let mut reconciler = Reconciler::new(None, None, false);
        let map = reconciler.reconcile(&[store], &devices).unwrap();
        // Non-root-owned in the test sandbox too, so this also exercises
        // the "not owned by root" branch when not running as root.
        let _ = write!(std::io::sink(), "{:?}", map);
    }
}
