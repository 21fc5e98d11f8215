//! Parses and applies `host:volume` selection patterns (spec.md §8
//! "Selection"), grounded on `examples/original_source/src/Selection.cc`.
//!
//! A pattern is `[-|!]host-glob[:volume-glob]`; a leading `-` or `!` gives
//! it negative sense. `host` alone is shorthand for `host:*`. Patterns are
//! applied in order, each one setting every matching volume's `backup`,
//! `prune` and `graph` [`rsbackup_api_types::SelectFlags`] simultaneously to
//! its sense — later patterns override earlier ones for the same volume.
//! With no patterns at all, every volume is selected for every purpose,
//! except that a volume outside its configured backup window is left
//! deselected for the `backup` purpose (the original's
//! `VolumeSelections::select` applies the current-time-of-day filter only
//! in this no-patterns-given default path).

use anyhow::{bail, Result};
use glob::Pattern;

use crate::config::Conf;

#[derive(Debug, Clone)]
struct SelectionEntry {
    host_pattern: String,
    volume_pattern: String,
    sense: bool,
}

/// An ordered list of selection patterns (spec.md §8's
/// `["*:*", "-h2:v1"]`).
#[derive(Debug, Clone, Default)]
pub struct Selection {
    entries: Vec<SelectionEntry>,
}

impl Selection {
    pub fn parse(patterns: &[&str]) -> Result<Self> {
        let mut entries = Vec::with_capacity(patterns.len());
        for raw in patterns {
            entries.push(Self::parse_one(raw)?);
        }
        Ok(Selection { entries })
    }

    fn parse_one(raw: &str) -> Result<SelectionEntry> {
        if raw.is_empty() {
            bail!("invalid selection ''");
        }
        let (sense, rest) = match raw.as_bytes()[0] {
            b'-' | b'!' => (false, &raw[1..]),
            _ => (true, raw),
        };
        if rest.is_empty() {
            bail!("invalid selection '{}'", raw);
        }
        let (host_pattern, volume_pattern) = match rest.split_once(':') {
            Some((h, v)) => (h.to_string(), v.to_string()),
            None => (rest.to_string(), "*".to_string()),
        };
        if host_pattern != "*" && Pattern::new(&host_pattern).is_err() {
            bail!("invalid host pattern '{}'", host_pattern);
        }
        if volume_pattern != "*" && Pattern::new(&volume_pattern).is_err() {
            bail!("invalid volume pattern '{}'", volume_pattern);
        }
        if host_pattern == "*" && volume_pattern != "*" {
            bail!("invalid selection '{}': host '*' with a specific volume", raw);
        }
        Ok(SelectionEntry {
            host_pattern,
            volume_pattern,
            sense,
        })
    }

    fn matches(pattern: &str, name: &str) -> bool {
        pattern == "*" || Pattern::new(pattern).map(|p| p.matches(name)).unwrap_or(false)
    }

    /// Applies the selection to `conf` in place, setting each matching
    /// volume's `select.{backup,prune,graph}` flags. `current_time_of_day`
    /// is the caller's current local time in seconds-since-midnight, used
    /// only for the backup-window check in the no-patterns default path
    /// (spec.md §3 "daily earliest/latest backup-window").
    pub fn apply(&self, conf: &mut Conf, current_time_of_day: i64) {
        if self.entries.is_empty() {
            for host in conf.hosts_mut() {
                for volume in host.volumes_mut() {
                    let in_window = volume
                        .backup_window
                        .map(|w| w.contains(current_time_of_day as u32))
                        .unwrap_or(true);
                    volume.select.backup = in_window;
                    volume.select.prune = true;
                    volume.select.graph = true;
                }
            }
            return;
        }

        for entry in &self.entries {
            for host in conf.hosts_mut() {
                if !Self::matches(&entry.host_pattern, &host.name) {
                    continue;
                }
                for volume in host.volumes_mut() {
                    if !Self::matches(&entry.volume_pattern, &volume.name) {
                        continue;
                    }
                    volume.select.backup = entry.sense;
                    volume.select.prune = entry.sense;
                    volume.select.graph = entry.sense;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsbackup_api_types::{Host, Volume};

    fn two_hosts_two_volumes() -> Conf {
        let mut conf = Conf::new();
        for host_name in ["h1", "h2"] {
            let mut host = Host::new(host_name, "localhost");
            host.add_volume(Volume::new("v1", "/data/v1"));
            host.add_volume(Volume::new("v2", "/data/v2"));
            conf.add_host(host);
        }
        conf
    }

    fn selected_backup_pairs(conf: &Conf) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for host in conf.hosts() {
            for volume in host.volumes() {
                if volume.select.backup {
                    out.push((host.name.clone(), volume.name.clone()));
                }
            }
        }
        out.sort();
        out
    }

    #[test]
    fn star_star_minus_h2_v1_selects_exactly_three() {
        let mut conf = two_hosts_two_volumes();
        let selection = Selection::parse(&["*:*", "-h2:v1"]).unwrap();
        selection.apply(&mut conf, 0);
        assert_eq!(
            selected_backup_pairs(&conf),
            vec![
                ("h1".to_string(), "v1".to_string()),
                ("h1".to_string(), "v2".to_string()),
                ("h2".to_string(), "v2".to_string()),
            ]
        );
    }

    #[test]
    fn empty_selection_selects_everything() {
        let mut conf = two_hosts_two_volumes();
        let selection = Selection::parse(&[]).unwrap();
        selection.apply(&mut conf, 0);
        assert_eq!(selected_backup_pairs(&conf).len(), 4);
    }

    #[test]
    fn bang_is_accepted_as_an_exclude_prefix() {
        let mut conf = two_hosts_two_volumes();
        let selection = Selection::parse(&["*:*", "!h1:v2"]).unwrap();
        selection.apply(&mut conf, 0);
        assert_eq!(
            selected_backup_pairs(&conf),
            vec![
                ("h1".to_string(), "v1".to_string()),
                ("h2".to_string(), "v1".to_string()),
                ("h2".to_string(), "v2".to_string()),
            ]
        );
    }

    #[test]
    fn host_only_pattern_means_every_volume_on_that_host() {
        let mut conf = two_hosts_two_volumes();
        let selection = Selection::parse(&["h1"]).unwrap();
        selection.apply(&mut conf, 0);
        assert_eq!(
            selected_backup_pairs(&conf),
            vec![("h1".to_string(), "v1".to_string()), ("h1".to_string(), "v2".to_string())]
        );
    }

    #[test]
    fn wildcard_host_with_specific_volume_is_rejected() {
        assert!(Selection::parse(&["*:v1"]).is_err());
    }
}
