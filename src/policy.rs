//! Registries of backup-admission and prune policies (spec.md §4.6, §4.7).

pub mod admission;
pub mod prune;

pub use admission::{AdmissionPolicy, AdmissionRegistry};
pub use prune::{PrunePolicy, PruneRegistry};
