//! Backup-admission policy registry (spec.md §4.6).
//!
//! Each policy decides, per (volume, device) candidate, whether a new
//! backup should be attempted right now. `always`/`daily`/`interval` are
//! grounded on the original's `BackupPolicy{Daily,Interval}.cc`.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use rsbackup_api_types::{Backup, BackupStatus, PolicySpec, Volume};
use rsbackup_tools::{parse_time_interval, today};

/// A named backup-admission policy (spec.md §4.6: "validate(volume)" and
/// "backup(volume, device) -> bool").
pub trait AdmissionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called at config-load time; rejects malformed policy parameters.
    fn validate(&self, spec: &PolicySpec) -> Result<()>;

    /// `existing` is every known backup of this volume on this device,
    /// in no particular order.
    fn admits(&self, spec: &PolicySpec, existing: &[&Backup]) -> Result<bool>;
}

struct Always;

impl AdmissionPolicy for Always {
    fn name(&self) -> &'static str {
        "always"
    }

    fn validate(&self, _spec: &PolicySpec) -> Result<()> {
        Ok(())
    }

    fn admits(&self, _spec: &PolicySpec, _existing: &[&Backup]) -> Result<bool> {
        Ok(true)
    }
}

struct Daily;

impl AdmissionPolicy for Daily {
    fn name(&self) -> &'static str {
        "daily"
    }

    fn validate(&self, _spec: &PolicySpec) -> Result<()> {
        Ok(())
    }

    fn admits(&self, _spec: &PolicySpec, existing: &[&Backup]) -> Result<bool> {
        let today = today()?;
        let today_secs = today.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp();
        let tomorrow_secs = today_secs + 86_400;
        let has_todays_backup = existing.iter().any(|b| {
            b.status == BackupStatus::Complete
                && b.start_time >= today_secs
                && b.start_time < tomorrow_secs
        });
        Ok(!has_todays_backup)
    }
}

struct Interval;

impl AdmissionPolicy for Interval {
    fn name(&self) -> &'static str {
        "interval"
    }

    fn validate(&self, spec: &PolicySpec) -> Result<()> {
        let raw = spec
            .get("min-interval")
            .ok_or_else(|| anyhow::anyhow!("interval policy requires min-interval"))?;
        if parse_time_interval(raw, i64::MAX)? < 1 {
            bail!("min-interval too small");
        }
        Ok(())
    }

    fn admits(&self, spec: &PolicySpec, existing: &[&Backup]) -> Result<bool> {
        let raw = spec
            .get("min-interval")
            .ok_or_else(|| anyhow::anyhow!("interval policy requires min-interval"))?;
        let min_interval = parse_time_interval(raw, i64::MAX)?;
        let now = rsbackup_tools::now_backup()?.timestamp();
        let blocked = existing
            .iter()
            .any(|b| b.status == BackupStatus::Complete && now - b.start_time < min_interval);
        Ok(!blocked)
    }
}

/// A registry mapping policy name to implementation, with the three
/// built-ins pre-registered (spec.md §9 "virtual dispatch over policies").
pub struct AdmissionRegistry {
    policies: BTreeMap<&'static str, Box<dyn AdmissionPolicy>>,
}

impl Default for AdmissionRegistry {
    fn default() -> Self {
        let mut registry = AdmissionRegistry {
            policies: BTreeMap::new(),
        };
        registry.register(Box::new(Always));
        registry.register(Box::new(Daily));
        registry.register(Box::new(Interval));
        registry
    }
}

impl AdmissionRegistry {
    pub fn register(&mut self, policy: Box<dyn AdmissionPolicy>) {
        self.policies.insert(policy.name(), policy);
    }

    pub fn get(&self, name: &str) -> Result<&dyn AdmissionPolicy> {
        self.policies
            .get(name)
            .map(|p| p.as_ref())
            .ok_or_else(|| anyhow::anyhow!("unknown backup-admission policy '{}'", name))
    }

    /// Runs `validate` against every volume's configured policy; called
    /// once at config-load time.
    pub fn validate_volume(&self, volume: &Volume) -> Result<()> {
        self.get(&volume.backup_policy.name)?
            .validate(&volume.backup_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsbackup_api_types::PolicySpec;

    fn complete_today() -> Backup {
        let mut b = Backup::new("h", "v", "d", "id", today().unwrap().and_hms_opt(1, 0, 0).unwrap().and_utc().timestamp());
        b.status = BackupStatus::Complete;
        b
    }

    #[test]
    fn always_admits_with_no_history() {
        let registry = AdmissionRegistry::default();
        let policy = registry.get("always").unwrap();
        assert!(policy.admits(&PolicySpec::new("always"), &[]).unwrap());
    }

    #[test]
    fn daily_blocks_after_a_complete_backup_today() {
        let registry = AdmissionRegistry::default();
        let policy = registry.get("daily").unwrap();
        let backup = complete_today();
        assert!(!policy
            .admits(&PolicySpec::new("daily"), &[&backup])
            .unwrap());
    }

    #[test]
    fn daily_admits_with_no_backup_today() {
        let registry = AdmissionRegistry::default();
        let policy = registry.get("daily").unwrap();
        assert!(policy.admits(&PolicySpec::new("daily"), &[]).unwrap());
    }

    #[test]
    fn interval_requires_min_interval_param() {
        let registry = AdmissionRegistry::default();
        let policy = registry.get("interval").unwrap();
        assert!(policy.validate(&PolicySpec::new("interval")).is_err());
    }

    #[test]
    fn interval_blocks_within_window() {
        std::env::set_var("RSBACKUP_TIME_BACKUP", "7200");
        let registry = AdmissionRegistry::default();
        let policy = registry.get("interval").unwrap();
        let spec = PolicySpec::new("interval").with_param("min-interval", "3600");
        let mut backup = Backup::new("h", "v", "d", "id", 7200 - 1800);
        backup.status = BackupStatus::Complete;
        assert!(!policy.admits(&spec, &[&backup]).unwrap());
        std::env::remove_var("RSBACKUP_TIME_BACKUP");
    }

    #[test]
    fn interval_admits_outside_window() {
        std::env::set_var("RSBACKUP_TIME_BACKUP", "7200");
        let registry = AdmissionRegistry::default();
        let policy = registry.get("interval").unwrap();
        let spec = PolicySpec::new("interval").with_param("min-interval", "3600");
        let mut backup = Backup::new("h", "v", "d", "id", 7200 - 7200);
        backup.status = BackupStatus::Complete;
        assert!(policy.admits(&spec, &[&backup]).unwrap());
        std::env::remove_var("RSBACKUP_TIME_BACKUP");
    }
}
