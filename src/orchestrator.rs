//! Top-level per-host worker-thread orchestration (spec.md §4.10, §5).
//!
//! One OS thread per selected host, spawned in descending-priority-then-name
//! order; threads sharing a concurrency group serialise on a shared mutex.
//! Each thread owns a private [`crate::scheduler::ActionList`]/
//! [`rsbackup_tools::EventLoop`] pair for the duration of its invocation and
//! only reaches into [`GlobalState`] through its `Arc<Mutex<_>>`, mirroring
//! the teacher's `pbs-datastore`/worker-task split between per-task state
//! and the shared datastore manager lock.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};

use rsbackup_api_types::{Host, ReachabilityStrategy, Volume};
use rsbackup_tools::subprocess::{Completion, CompletionPolicy, SubprocessSpec};
use rsbackup_tools::EventLoop;

use crate::availability::volume_available;
use crate::backup_engine::{self, BackupCandidate};
use crate::engine_run;
use crate::hooks::{self, PreHookOutcome};
use crate::policy::AdmissionRegistry;
use crate::scheduler::ActionList;
use crate::state::GlobalState;

/// Runs reachability probe per spec.md §4.10 step 1 / §6 ("An ssh-compatible
/// binary for host-probe ... using `-oConnectTimeout=<sec>`").
fn probe_reachable(host: &Host, ssh_timeout: Option<u64>) -> bool {
    let spec = match &host.reachability {
        ReachabilityStrategy::AlwaysUp => return true,
        ReachabilityStrategy::Command(cmd) => SubprocessSpec::new("/bin/sh").arg("-c").arg(cmd.clone()),
        ReachabilityStrategy::SshProbe => {
            let timeout = ssh_timeout.unwrap_or(10);
            SubprocessSpec::new("ssh")
                .arg(format!("-oConnectTimeout={}", timeout))
                .arg(host.ssh_target())
                .arg("true")
        }
    };
    let mut spec = spec;
    spec.policy = CompletionPolicy {
        throw_on_nonzero_exit: false,
        ..CompletionPolicy::default()
    };
    matches!(
        rsbackup_tools::run_standalone(spec),
        Ok((Completion::Exited(0), _))
    )
}

/// `device name -> its store's on-disk path`, derived from a prior
/// reconciliation pass already recorded in `GlobalState::device_for_store`.
fn store_path_for_device(state: &GlobalState) -> BTreeMap<String, PathBuf> {
    let mut map = BTreeMap::new();
    for (store_name, device_name) in &state.device_for_store {
        if let Some(store) = state.conf.stores().iter().find(|s| &s.name == store_name) {
            map.insert(device_name.clone(), store.path.clone());
        }
    }
    map
}

/// One host worker's body (spec.md §4.10 steps 1-3), run on its own thread.
fn run_host_worker(
    global: Arc<Mutex<GlobalState>>,
    group_lock: Arc<Mutex<()>>,
    admission: Arc<AdmissionRegistry>,
    host_name: String,
    ssh_timeout: Option<u64>,
    dry_run: bool,
) -> Result<()> {
    let host = {
        let state = global.lock().unwrap();
        state.conf.host(&host_name).cloned()
    };
    let Some(host) = host else {
        return Ok(());
    };

    if !probe_reachable(&host, ssh_timeout) {
        log::warn!("host '{}' is unreachable, skipping", host_name);
        return Ok(());
    }

    let _group_guard = group_lock.lock().unwrap();

    let (host, device_for_store, known_devices) = {
        let state = global.lock().unwrap();
        let host = state
            .conf
            .host(&host_name)
            .cloned()
            .with_context(|| format!("host '{}' vanished from configuration", host_name))?;
        let known_devices: Vec<String> = state.conf.devices().iter().map(|d| d.name.clone()).collect();
        (host, store_path_for_device(&state), known_devices)
    };

    let list = ActionList::new();
    let event_loop = Rc::new(RefCell::new(EventLoop::new()));
    let queue = engine_run::new_completion_queue();

    let mut post_hook_targets: Vec<Volume> = Vec::new();

    for volume in host.volumes() {
        if !volume.select.backup {
            continue;
        }

        match volume_available(&host, volume, ssh_timeout) {
            Ok(true) => {}
            Ok(false) => {
                log::info!("{}:{}: not available (mount point or check-file missing), skipping", host.name, volume.name);
                continue;
            }
            Err(err) => {
                log::error!("{}:{}: availability check failed: {}", host.name, volume.name, err);
                global.lock().unwrap().record_error();
                continue;
            }
        }

        let source_path = match hooks::run_pre_volume_hook(&host, volume, dry_run) {
            Ok(PreHookOutcome::Proceed { source_path }) => source_path,
            Ok(PreHookOutcome::SoftSkip) => {
                log::info!("{}:{}: pre-volume hook requested a soft skip", host.name, volume.name);
                continue;
            }
            Err(err) => {
                log::error!("{}:{}: pre-volume hook failed: {}", host.name, volume.name, err);
                global.lock().unwrap().record_error();
                continue;
            }
        };

        for device_name in &known_devices {
            if !volume.eligible_for_device(device_name) {
                continue;
            }
            let Some(store_path) = device_for_store.get(device_name) else {
                continue;
            };

            let candidate = BackupCandidate {
                host: host.name.clone(),
                volume: volume.name.clone(),
                device: device_name.clone(),
                store_path: store_path.clone(),
            };
            let result = backup_engine::schedule(
                global.clone(),
                &admission,
                &list,
                &event_loop,
                &queue,
                candidate,
                source_path.clone(),
                host.priority,
                false,
                dry_run,
            );
            if let Err(err) = result {
                log::error!(
                    "{}:{} on {}: failed to schedule backup: {}",
                    host.name,
                    volume.name,
                    device_name,
                    err
                );
                global.lock().unwrap().record_error();
            }
        }

        post_hook_targets.push(volume.clone());
    }

    engine_run::drive(&list, &event_loop, &queue)?;

    for volume in &post_hook_targets {
        if let Err(err) = hooks::run_post_volume_hook(&host, volume, dry_run) {
            log::error!("{}:{}: post-volume hook failed: {}", host.name, volume.name, err);
            global.lock().unwrap().record_error();
        }
    }

    Ok(())
}

/// Runs one full backup pass across every host selected for backup,
/// spawning one worker thread per host in descending-priority-then-name
/// order (spec.md §4.10, §5). Assumes a reconciliation pass has already
/// populated `GlobalState::device_for_store`.
pub fn run_backup_pass(
    global: Arc<Mutex<GlobalState>>,
    admission: Arc<AdmissionRegistry>,
    dry_run: bool,
) -> Result<()> {
    let (host_order, group_locks, ssh_timeout) = {
        let state = global.lock().unwrap();
        let order: Vec<(String, String)> = state
            .conf
            .hosts_by_priority()
            .iter()
            .filter(|h| h.volumes().iter().any(|v| v.select.backup))
            .map(|h| (h.name.clone(), h.concurrency_group.clone()))
            .collect();
        let mut group_locks: BTreeMap<String, Arc<Mutex<()>>> = BTreeMap::new();
        for (_, group) in &order {
            group_locks
                .entry(group.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())));
        }
        (order, group_locks, state.conf.ssh_timeout)
    };

    let mut handles = Vec::with_capacity(host_order.len());
    for (host_name, group) in host_order {
        let global = global.clone();
        let group_lock = group_locks.get(&group).expect("inserted above").clone();
        let admission = admission.clone();
        handles.push(thread::spawn(move || {
            run_host_worker(global, group_lock, admission, host_name.clone(), ssh_timeout, dry_run)
                .with_context(|| format!("host '{}'", host_name))
        }));
    }

    // Per-volume/per-device failures are already caught and counted inside
    // each worker (spec.md §7); a worker only returns `Err` for a vanished
    // host, which is itself non-fatal to the rest of the pass, so every
    // outcome here is logged-and-counted rather than propagated.
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log::error!("{}", err);
                global.lock().unwrap().record_error();
            }
            Err(_) => {
                log::error!("a host worker thread panicked");
                global.lock().unwrap().record_error();
            }
        }
    }

    Ok(())
}
