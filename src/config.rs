//! The in-memory configuration tree (spec.md §3 "Ownership", SPEC_FULL.md
//! §4.11 "Configuration loader").
//!
//! The real rsbackup's directive-language parser
//! (`examples/original_source/src/Conf.cc`, `ConfDirective.cc`) is out of
//! scope per spec.md §1. What is in scope is the typed tree those
//! directives populate: `Conf` exclusively owns `Host`s, `Device`s and
//! `Store`s (each `Host` in turn exclusively owns its `Volume`s), and can be
//! built either programmatically or by deserializing JSON written by an
//! embedding caller.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use rsbackup_api_types::{Device, Host, Store};

use crate::policy::{AdmissionRegistry, PruneRegistry};

fn default_prune_log_retention() -> i64 {
    // 31 days, matching the original's `prune-log-retention` default.
    31 * 86_400
}

fn default_rsync_timeout() -> Option<u64> {
    None
}

/// The root configuration tree (spec.md §3: "The root configuration
/// container exclusively owns Hosts, Devices, and Stores").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conf {
    #[serde(default)]
    hosts: Vec<Host>,
    #[serde(default)]
    devices: Vec<Device>,
    #[serde(default)]
    stores: Vec<Store>,

    /// How long `Pruned` tombstones are kept before being deleted from the
    /// catalogue (spec.md §4.4 "Prune-log retention"), in seconds.
    #[serde(default = "default_prune_log_retention")]
    pub prune_log_retention: i64,
    /// If false (the default), a store must be owned by root and not
    /// group/world-writable to be reconciled (spec.md §4.5 step 5).
    #[serde(default)]
    pub public_stores: bool,
    #[serde(default)]
    pub pre_access_hook: Option<Vec<String>>,
    #[serde(default)]
    pub post_access_hook: Option<Vec<String>>,
    /// `--rsync-path` passed to the remote rsync, if the remote binary
    /// isn't on the default `PATH` (spec.md §4.8 step 4).
    #[serde(default)]
    pub rsync_path: Option<String>,
    #[serde(default = "default_rsync_timeout")]
    pub rsync_timeout: Option<u64>,
    #[serde(default)]
    pub ssh_timeout: Option<u64>,
    /// Global deadline for a single prune pass (spec.md §4.9).
    #[serde(default)]
    pub prune_timeout: Option<u64>,
}

impl Conf {
    pub fn new() -> Self {
        Conf {
            prune_log_retention: default_prune_log_retention(),
            ..Default::default()
        }
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        let conf: Conf = serde_json::from_str(&text)
            .with_context(|| format!("parsing configuration {}", path.display()))?;
        Ok(conf)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn add_host(&mut self, host: Host) {
        self.hosts.push(host);
    }

    pub fn add_device(&mut self, device: Device) {
        self.devices.push(device);
    }

    pub fn add_store(&mut self, store: Store) {
        self.stores.push(store);
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn hosts_mut(&mut self) -> &mut [Host] {
        &mut self.hosts
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name == name)
    }

    pub fn host_mut(&mut self, name: &str) -> Option<&mut Host> {
        self.hosts.iter_mut().find(|h| h.name == name)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn stores(&self) -> &[Store] {
        &self.stores
    }

    pub fn stores_mut(&mut self) -> &mut [Store] {
        &mut self.stores
    }

    /// Hosts ordered by descending priority then name-aware ascending name
    /// (spec.md §4.10: "For each selected Host (in descending priority,
    /// then name order)").
    pub fn hosts_by_priority(&self) -> Vec<&Host> {
        let mut hosts: Vec<&Host> = self.hosts.iter().collect();
        hosts.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| rsbackup_tools::name_cmp(&a.name, &b.name))
        });
        hosts
    }

    /// Validates cross-references that the (out-of-scope) directive parser
    /// would otherwise reject at parse time: every volume's admission and
    /// prune policy name must be registered, and its parameters must
    /// validate against that policy (spec.md §7 "Configuration error").
    /// A device glob that matches no configured device is *not* an error
    /// (SPEC_FULL.md §4.11): globs may simply match nothing.
    pub fn validate(
        &self,
        admission: &AdmissionRegistry,
        prune: &PruneRegistry,
    ) -> Result<()> {
        for host in &self.hosts {
            for volume in host.volumes() {
                admission.validate_volume(volume).with_context(|| {
                    format!(
                        "host '{}' volume '{}': backup policy '{}'",
                        host.name, volume.name, volume.backup_policy.name
                    )
                })?;
                prune.get(&volume.prune_policy.name)
                    .and_then(|p| p.validate(&volume.prune_policy))
                    .with_context(|| {
                        format!(
                            "host '{}' volume '{}': prune policy '{}'",
                            host.name, volume.name, volume.prune_policy.name
                        )
                    })?;
            }
        }
        Ok(())
    }

    /// Database file backing the catalogue, defaulting to the workspace's
    /// standard state directory (`rsbackup_buildcfg::RSBACKUP_DATABASE_FN`).
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(rsbackup_buildcfg::RSBACKUP_DATABASE_FN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsbackup_api_types::{PolicySpec, Volume};

    fn sample_conf() -> Conf {
        let mut conf = Conf::new();
        let mut host = Host::new("h1", "localhost");
        host.add_volume(Volume::new("v1", "/data/v1"));
        conf.add_host(host);
        conf.add_device(Device::new("usb1"));
        conf
    }

    #[test]
    fn json_round_trip_preserves_tree_shape() {
        let conf = sample_conf();
        let json = conf.to_json().unwrap();
        let reloaded: Conf = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded.hosts().len(), 1);
        assert_eq!(reloaded.hosts()[0].volumes().len(), 1);
        assert_eq!(reloaded.devices().len(), 1);
        assert_eq!(reloaded.hosts()[0].name, "h1");
        assert_eq!(reloaded.hosts()[0].volumes()[0].name, "v1");
    }

    #[test]
    fn unknown_backup_policy_name_is_rejected_at_validate() {
        let mut conf = sample_conf();
        conf.hosts_mut()[0].volume_mut("v1").unwrap().backup_policy = PolicySpec::new("bogus");
        let result = conf.validate(&AdmissionRegistry::default(), &PruneRegistry::default());
        assert!(result.is_err());
    }

    #[test]
    fn device_glob_matching_nothing_is_not_a_validation_error() {
        let mut conf = sample_conf();
        conf.hosts_mut()[0].volume_mut("v1").unwrap().devices_pattern =
            Some("nonexistent-*".to_string());
        let result = conf.validate(&AdmissionRegistry::default(), &PruneRegistry::default());
        assert!(result.is_ok());
    }

    #[test]
    fn hosts_by_priority_orders_descending_then_by_name() {
        let mut conf = Conf::new();
        let mut low = Host::new("b", "localhost");
        low.priority = 1;
        let mut high = Host::new("a", "localhost");
        high.priority = 5;
        let mut tie_a = Host::new("host2", "localhost");
        tie_a.priority = 1;
        let mut tie_b = Host::new("host10", "localhost");
        tie_b.priority = 1;
        conf.add_host(low);
        conf.add_host(high);
        conf.add_host(tie_b);
        conf.add_host(tie_a);

        let ordered: Vec<&str> = conf.hosts_by_priority().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(ordered, vec!["a", "b", "host2", "host10"]);
    }
}
