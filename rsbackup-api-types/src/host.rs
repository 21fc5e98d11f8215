use serde::{Deserialize, Serialize};

use crate::Volume;

/// How a [`Host`]'s reachability is tested before a worker starts backing
/// it up (spec.md §3, "a reachability-test strategy").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "value")]
pub enum ReachabilityStrategy {
    /// Probe via the configured ssh-compatible binary.
    SshProbe,
    /// Never probe; the host is always considered reachable (used for
    /// `localhost` and always-on hosts).
    AlwaysUp,
    /// Run a user-supplied command; exit status 0 means reachable.
    Command(String),
}

/// A named machine to back up (spec.md §3 "Host").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    /// SSH user, if any; `None` plus `hostname == "localhost"` means the
    /// volumes are copied without going over SSH at all.
    pub user: Option<String>,
    pub hostname: String,
    pub concurrency_group: String,
    pub reachability: ReachabilityStrategy,
    pub priority: i64,
    /// Ordered mapping of volume-name → Volume: insertion order is the
    /// configuration order, preserved for deterministic worker iteration.
    volumes: Vec<Volume>,
}

impl Host {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        let name = name.into();
        let hostname = hostname.into();
        Host {
            concurrency_group: name.clone(),
            user: None,
            reachability: if hostname == "localhost" {
                ReachabilityStrategy::AlwaysUp
            } else {
                ReachabilityStrategy::SshProbe
            },
            priority: 0,
            name,
            hostname,
            volumes: Vec::new(),
        }
    }

    pub fn is_localhost(&self) -> bool {
        self.hostname == "localhost"
    }

    /// `user@hostname`, or just `hostname` when no user is configured.
    pub fn ssh_target(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.hostname),
            None => self.hostname.clone(),
        }
    }

    pub fn add_volume(&mut self, volume: Volume) {
        self.volumes.push(volume);
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    pub fn volumes_mut(&mut self) -> &mut [Volume] {
        &mut self.volumes
    }

    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.name == name)
    }

    pub fn volume_mut(&mut self, name: &str) -> Option<&mut Volume> {
        self.volumes.iter_mut().find(|v| v.name == name)
    }
}
