//! Three-pass prune engine (spec.md §4.9), grounded on
//! `examples/proxmox-proxmox-backup/src/server/prune_job.rs`'s worker-task
//! shape (log as you go around a bounded pass) applied to a
//! scheduler-driven bulk-removal sweep instead of the teacher's single
//! in-process loop.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use nix::sys::signal::{kill, Signal};

use rsbackup_api_types::{Backup, BackupStatus, Volume};
use rsbackup_tools::subprocess::SubprocessSpec;
use rsbackup_tools::EventLoop;

use crate::engine_run::{self, CompletionQueue};
use crate::policy::PruneRegistry;
use crate::scheduler::{ActionList, ActionState, Predecessor};
use crate::state::GlobalState;

fn volume_dir(store_path: &Path, host: &str, volume: &str) -> PathBuf {
    store_path.join(host).join(volume)
}

fn incomplete_marker(volume_dir: &Path, id: &str) -> PathBuf {
    volume_dir.join(format!("{}.incomplete", id))
}

struct Obsolete {
    backup: Backup,
    reason: String,
}

fn distinct_devices(volume: &Volume) -> Vec<String> {
    let mut devices: Vec<String> = volume.backups().iter().map(|b| b.device.clone()).collect();
    devices.sort();
    devices.dedup();
    devices
}

/// Pass 1: decides which live records are obsolete, without mutating
/// anything (spec.md §4.9 step 1).
fn identify_obsolete(
    conf: &crate::config::Conf,
    prune: &PruneRegistry,
    today_epoch_day: i64,
    prune_incompletes: bool,
) -> Result<Vec<Obsolete>> {
    let mut obsolete = Vec::new();

    for host in conf.hosts() {
        for volume in host.volumes() {
            if !volume.select.prune {
                continue;
            }
            for device in distinct_devices(volume) {
                let on_device: Vec<&Backup> = volume.backups_for_device(&device).collect();
                let total = on_device.len();

                for backup in &on_device {
                    let reason = match backup.status {
                        BackupStatus::Pruning => Some("already pruning".to_string()),
                        BackupStatus::Underway | BackupStatus::Unknown | BackupStatus::Failed
                            if prune_incompletes =>
                        {
                            Some(format!("status={}", backup.status))
                        }
                        _ => None,
                    };
                    if let Some(reason) = reason {
                        obsolete.push(Obsolete {
                            backup: (*backup).clone(),
                            reason,
                        });
                    }
                }

                let complete: Vec<&Backup> = on_device
                    .iter()
                    .filter(|b| b.status == BackupStatus::Complete)
                    .copied()
                    .collect();
                // Policies assume oldest-first ordering.
                let mut oldest_first = complete.clone();
                oldest_first.sort_by_key(|b| b.start_time);

                let policy = prune.get(&volume.prune_policy.name)?;
                let decisions =
                    policy.prunable(&volume.prune_policy, &oldest_first, today_epoch_day, total)?;
                for backup in &complete {
                    if let Some(reason) = decisions.get(&backup.id) {
                        obsolete.push(Obsolete {
                            backup: (*backup).clone(),
                            reason: reason.clone(),
                        });
                    }
                }
            }
        }
    }

    Ok(obsolete)
}

/// Pass 2: transitions every obsolete record not already `Pruning` into
/// `Pruning`, in one pass over the catalogue (spec.md §4.9 step 2: "This is
/// done even for backups whose device is currently unavailable").
fn mark_obsolete(
    global: &Mutex<GlobalState>,
    obsolete: &[Obsolete],
    now: i64,
    dry_run: bool,
) -> Result<Vec<Backup>> {
    let mut state = global.lock().unwrap();
    let mut marked = Vec::with_capacity(obsolete.len());
    for item in obsolete {
        let mut backup = item.backup.clone();
        if backup.status != BackupStatus::Pruning {
            if dry_run {
                log::info!(
                    "dry-run: {}:{}:{} backup {}: would be marked for removal ({})",
                    backup.host,
                    backup.volume,
                    backup.device,
                    backup.id,
                    item.reason
                );
                continue;
            }
            backup.status = BackupStatus::Pruning;
            backup.prune_time = now;
            state.catalogue.update(&backup)?;
            if let Some(host) = state.conf.host_mut(&backup.host) {
                if let Some(vol) = host.volume_mut(&backup.volume) {
                    vol.update_backup(backup.clone());
                }
            }
        }
        log::info!(
            "{}:{}:{} backup {}: marked for removal ({})",
            backup.host,
            backup.volume,
            backup.device,
            backup.id,
            item.reason
        );
        marked.push(backup);
    }
    Ok(marked)
}

/// Pass 3: for every marked record whose device is currently identified,
/// schedules a bulk-removal action plus an unconditional *removed*
/// follow-up that finalises the catalogue/in-memory state (spec.md §4.9
/// step 3).
fn schedule_removals(
    global: Arc<Mutex<GlobalState>>,
    list: &ActionList,
    event_loop: &Rc<std::cell::RefCell<EventLoop>>,
    queue: &CompletionQueue,
    marked: Vec<Backup>,
    identified_devices: &BTreeSet<String>,
    store_path_for_device: &BTreeMap<String, PathBuf>,
    dry_run: bool,
) -> usize {
    let mut scheduled = 0;

    for backup in marked {
        if !identified_devices.contains(&backup.device) {
            continue;
        }
        let Some(store_path) = store_path_for_device.get(&backup.device) else {
            continue;
        };

        let vol_dir = volume_dir(store_path, &backup.host, &backup.volume);
        let backup_dir = vol_dir.join(&backup.id);

        if dry_run {
            log::info!(
                "dry-run: would remove {}:{}:{} backup {} at {}",
                backup.host,
                backup.volume,
                backup.device,
                backup.id,
                backup_dir.display()
            );
            scheduled += 1;
            continue;
        }

        let _ = std::fs::File::create(incomplete_marker(&vol_dir, &backup.id));

        let remove_name = format!(
            "rm:{}:{}:{}:{}",
            backup.host, backup.volume, backup.device, backup.id
        );

        let queue_for_remove = queue.clone();
        let event_loop_for_remove = event_loop.clone();
        let remove_name_for_error = remove_name.clone();
        list.add(
            remove_name.clone(),
            vec![backup.device.clone()],
            vec![],
            0,
            move |handle| {
                let spec = SubprocessSpec::new("rm")
                    .arg("-rf")
                    .arg(backup_dir.display().to_string());
                let handle_cell = Rc::new(std::cell::RefCell::new(Some(handle)));
                let handle_for_complete = handle_cell.clone();
                let mut el = event_loop_for_remove.borrow_mut();
                let queue = queue_for_remove.clone();
                let result = rsbackup_tools::spawn_captured(&mut el, spec, move |completion, _buf| {
                    let handle = handle_for_complete.borrow_mut().take().expect("completes exactly once");
                    queue.borrow_mut().push_back((handle, completion.is_ok()));
                });
                match result {
                    Ok(pid) => {
                        if let Some(handle) = handle_cell.borrow().as_ref() {
                            handle.set_killer(move || {
                                let _ = kill(pid, Signal::SIGKILL);
                            });
                        }
                    }
                    Err(err) => {
                        log::error!("failed to spawn rm for {}: {}", remove_name_for_error, err);
                    }
                }
            },
            None,
        );

        let removed_name = format!("removed:{}", remove_name);
        let list_for_removed = list.clone();
        let remove_name_for_removed = remove_name.clone();
        let global_for_removed = global.clone();
        let vol_dir_for_removed = vol_dir.clone();
        let backup_for_removed = backup.clone();
        list.add(
            removed_name,
            vec![],
            vec![Predecessor::exact(remove_name_for_removed.clone(), false)],
            0,
            move |handle| {
                let removal_succeeded =
                    list_for_removed.state(&remove_name_for_removed) == Some(ActionState::Succeeded);
                if removal_succeeded {
                    let _ = std::fs::remove_file(incomplete_marker(
                        &vol_dir_for_removed,
                        &backup_for_removed.id,
                    ));
                    let completion_time = rsbackup_tools::now_finish()
                        .map(|dt| dt.timestamp())
                        .unwrap_or(backup_for_removed.prune_time);
                    let mut pruned = backup_for_removed.clone();
                    pruned.status = BackupStatus::Pruned;
                    pruned.prune_time = completion_time;

                    let mut state = global_for_removed.lock().unwrap();
                    if let Err(err) = state.catalogue.update(&pruned) {
                        log::error!("{}: failed to finalise prune: {}", pruned.id, err);
                    }
                    if let Some(host) = state.conf.host_mut(&pruned.host) {
                        if let Some(vol) = host.volume_mut(&pruned.volume) {
                            vol.detach_backup(&pruned.device, &pruned.id);
                        }
                    }
                } else {
                    log::warn!(
                        "{}:{}:{} backup {}: removal failed, will retry on the next pass",
                        backup_for_removed.host,
                        backup_for_removed.volume,
                        backup_for_removed.device,
                        backup_for_removed.id
                    );
                }
                handle.completed(true);
            },
            None,
        );

        scheduled += 1;
    }

    scheduled
}

/// Runs the whole three-pass sweep, honouring `prune_timeout` as a hard
/// deadline on the removal sweep (spec.md §4.9: "A global deadline ... may
/// cut the pass short; cancelled removals are reported as failures but do
/// not transition the catalogue").
pub fn run(
    global: Arc<Mutex<GlobalState>>,
    prune: &PruneRegistry,
    identified_devices: &BTreeSet<String>,
    store_path_for_device: &BTreeMap<String, PathBuf>,
    prune_incompletes: bool,
    prune_timeout: Option<Duration>,
    dry_run: bool,
) -> Result<usize> {
    let today_epoch_day = rsbackup_tools::today()?
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp()
        / 86_400;
    let now = rsbackup_tools::now_finish()?.timestamp();

    let obsolete = {
        let state = global.lock().unwrap();
        identify_obsolete(&state.conf, prune, today_epoch_day, prune_incompletes)?
    };
    let marked = mark_obsolete(&global, &obsolete, now, dry_run)?;

    let list = ActionList::new();
    if let Some(timeout) = prune_timeout {
        list.set_deadline(Instant::now() + timeout);
    }
    let event_loop = Rc::new(std::cell::RefCell::new(EventLoop::new()));
    let queue = engine_run::new_completion_queue();

    let scheduled = schedule_removals(
        global,
        &list,
        &event_loop,
        &queue,
        marked,
        identified_devices,
        store_path_for_device,
        dry_run,
    );

    engine_run::drive(&list, &event_loop, &queue)?;
    Ok(scheduled)
}
