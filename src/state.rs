//! The process-wide shared state guarded by the "global state lock"
//! (spec.md §4.10, §5: "configuration tree, in-memory backup sets,
//! unknown-entity sets, database handle").
//!
//! Held as `Arc<Mutex<GlobalState>>` rather than the per-thread `Rc<RefCell<_>>`
//! used by [`crate::scheduler::ActionList`]/[`rsbackup_tools::EventLoop`]:
//! those are confined to a single worker thread for the duration of one
//! engine invocation, but `GlobalState` is touched by every per-host worker
//! thread and so must actually be `Send`.

use std::collections::BTreeMap;

use rsbackup_catalogue::Catalogue;

use crate::config::Conf;

pub struct GlobalState {
    pub conf: Conf,
    pub catalogue: Catalogue,
    /// store name -> device name, refreshed by a reconciliation pass.
    pub device_for_store: BTreeMap<String, String>,
    /// Names referenced by the configuration that reconciliation has never
    /// seen, logged once rather than every pass (spec.md §4.10's
    /// "unknown-entity sets").
    pub unknown_devices_warned: std::collections::BTreeSet<String>,
    pub error_count: u64,
}

impl GlobalState {
    pub fn new(conf: Conf, catalogue: Catalogue) -> Self {
        GlobalState {
            conf,
            catalogue,
            device_for_store: BTreeMap::new(),
            unknown_devices_warned: std::collections::BTreeSet::new(),
            error_count: 0,
        }
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }
}
