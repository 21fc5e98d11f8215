use serde::{Deserialize, Serialize};

/// A named removable target medium (spec.md §3 "Device").
///
/// A `Device` carries no runtime state of its own: at any moment it may be
/// paired with at most one [`crate::Store`], but that pairing is
/// established and torn down by the reconciliation layer in a separate
/// map rather than a back-pointer stored here (see DESIGN.md's note on the
/// Device/Store cyclic reference).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Device { name: name.into() }
    }
}
