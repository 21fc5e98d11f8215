use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A policy reference: the registered name plus a recognised-parameter
/// mapping (spec.md §3, "a backup-admission-policy name with a
/// recognised-parameter mapping").
///
/// Kept as a name + string map rather than an enum so that new policies can
/// be registered (spec.md §4.6/§4.7 "a registry keyed by policy name")
/// without changing the data model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySpec {
    pub name: String,
    pub params: BTreeMap<String, String>,
}

impl PolicySpec {
    pub fn new(name: impl Into<String>) -> Self {
        PolicySpec {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }
}
