//! Single-`(volume, device)` backup execution (spec.md §4.8), run as one
//! action under a host's [`crate::scheduler::ActionList`].
//!
//! Grounded on the subprocess-classification rules of
//! `rsbackup-tools::subprocess` (spec.md §4.2) and on
//! `examples/original_source/src/Volume.cc`'s backup-directory/marker/
//! hardlink-dedup layout for the on-disk side.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};

use rsbackup_api_types::{Backup, BackupStatus, Host, Volume};
use rsbackup_tools::subprocess::{CompletionPolicy, SubprocessSpec};

use crate::engine_run::CompletionQueue;
use crate::policy::AdmissionRegistry;
use crate::scheduler::ActionList;
use crate::state::GlobalState;

/// One candidate (volume, device) pair to evaluate for backup.
pub struct BackupCandidate {
    pub host: String,
    pub volume: String,
    pub device: String,
    pub store_path: PathBuf,
}

/// Volume directory under the store: `<store>/<host>/<volume>` (spec.md §6).
fn volume_dir(store_path: &Path, host: &str, volume: &str) -> PathBuf {
    store_path.join(host).join(volume)
}

fn incomplete_marker(volume_dir: &Path, id: &str) -> PathBuf {
    volume_dir.join(format!("{}.incomplete", id))
}

fn nolink_sentinel(store_path: &Path, host: &str, volume: &str) -> PathBuf {
    store_path.join(host).join(format!("{}.nolink", volume))
}

fn rsync_source(host: &Host, path: &Path) -> String {
    if host.is_localhost() {
        format!("{}/.", path.display())
    } else {
        format!("{}:{}/.", host.ssh_target(), path.display())
    }
}

fn build_rsync_spec(
    host: &Host,
    volume: &Volume,
    conf_rsync_path: &Option<String>,
    source_path: &Path,
    backup_dir: &Path,
    link_dest: Option<&Path>,
) -> SubprocessSpec {
    let program = volume.rsync_command.clone().unwrap_or_else(|| "rsync".to_string());
    let mut spec = SubprocessSpec::new(program);
    for opt in &volume.rsync_base_options {
        spec = spec.arg(opt.clone());
    }
    for opt in &volume.rsync_extra_options {
        spec = spec.arg(opt.clone());
    }
    for pattern in &volume.exclude {
        spec = spec.arg(format!("--exclude={}", pattern));
    }
    if !volume.traverse_mounts {
        spec = spec.arg("--one-file-system");
    }
    if let Some(path) = conf_rsync_path {
        spec = spec.arg("--rsync-path").arg(path.clone());
    }
    if let Some(timeout) = volume.rsync_timeout {
        spec = spec.arg(format!("--timeout={}", timeout));
    }
    if let Some(dest) = link_dest {
        spec = spec.arg(format!("--link-dest={}", dest.display()));
    }
    spec = spec
        .arg(rsync_source(host, source_path))
        .arg(format!("{}/.", backup_dir.display()));

    spec.policy = CompletionPolicy {
        throw_on_nonzero_exit: true,
        throw_on_signal_except_sigpipe: true,
        throw_on_sigpipe: false,
        reclassify_exit_24: true,
    };
    if let Some(timeout) = volume.rsync_timeout {
        spec = spec.kill_timeout(std::time::Duration::from_secs(timeout));
    }
    spec
}

/// Schedules a backup action for `candidate` onto `list`, unless the
/// admission policy declines (and `force` wasn't given), in which case
/// `Ok(None)` is returned with nothing scheduled. The action's resource key
/// is `candidate.device`, so backups to different devices run concurrently
/// while backups to the same device serialise (spec.md §4.8 step 5, §5).
pub fn schedule(
    global: Arc<Mutex<GlobalState>>,
    admission: &AdmissionRegistry,
    list: &ActionList,
    event_loop: &std::rc::Rc<std::cell::RefCell<rsbackup_tools::EventLoop>>,
    queue: &CompletionQueue,
    candidate: BackupCandidate,
    source_path: PathBuf,
    priority: i64,
    force: bool,
    dry_run: bool,
) -> Result<Option<String>> {
    let (host, volume, conf_rsync_path) = {
        let state = global.lock().unwrap();
        let host = state
            .conf
            .host(&candidate.host)
            .with_context(|| format!("unknown host '{}'", candidate.host))?
            .clone();
        let volume = host
            .volume(&candidate.volume)
            .with_context(|| format!("unknown volume '{}'", candidate.volume))?
            .clone();
        (host, volume, state.conf.rsync_path.clone())
    };

    let existing: Vec<Backup> = {
        let state = global.lock().unwrap();
        state
            .catalogue
            .for_volume_device(&candidate.host, &candidate.volume, &candidate.device)?
    };

    if !force {
        let existing_refs: Vec<&Backup> = existing.iter().collect();
        let policy = admission.get(&volume.backup_policy.name)?;
        if !policy.admits(&volume.backup_policy, &existing_refs)? {
            log::info!(
                "{}:{} on {}: admission policy '{}' declines a backup now",
                candidate.host,
                candidate.volume,
                candidate.device,
                volume.backup_policy.name
            );
            return Ok(None);
        }
    }

    let start = rsbackup_tools::now_backup()?;
    // spec.md §3: "an opaque ID (string; canonically a UTC timestamp in
    // YYYY-MM-DDTHH:MM:SS form)" — rendered in UTC regardless of the local
    // zone `start` itself carries.
    let id = start
        .with_timezone(&chrono::Utc)
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string();
    let vol_dir = volume_dir(&candidate.store_path, &candidate.host, &candidate.volume);
    let backup_dir = vol_dir.join(&id);

    if dry_run {
        log::info!(
            "dry-run: would back up {}:{} to device {} as {}",
            candidate.host,
            candidate.volume,
            candidate.device,
            id
        );
        return Ok(None);
    }

    std::fs::create_dir_all(&vol_dir)
        .with_context(|| format!("creating volume directory {}", vol_dir.display()))?;
    std::fs::File::create(incomplete_marker(&vol_dir, &id))
        .with_context(|| format!("creating incomplete marker for {}", id))?;
    std::fs::create_dir_all(&backup_dir)
        .with_context(|| format!("creating backup directory {}", backup_dir.display()))?;

    let backup = Backup::new(&candidate.host, &candidate.volume, &candidate.device, &id, start.timestamp());
    {
        let state = global.lock().unwrap();
        state.catalogue.insert(&backup)?;
    }

    let nolink = nolink_sentinel(&candidate.store_path, &candidate.host, &candidate.volume);
    let link_dest = if nolink.exists() {
        log::warn!(
            "{}:{}: .nolink sentinel present, skipping --link-dest",
            candidate.host,
            candidate.volume
        );
        None
    } else {
        existing.first().map(|b| vol_dir.join(&b.id))
    };

    let spec = build_rsync_spec(&host, &volume, &conf_rsync_path, &source_path, &backup_dir, link_dest.as_deref());

    let name = format!("backup:{}:{}:{}", candidate.host, candidate.volume, candidate.device);
    let name_for_error = name.clone();
    let resources = vec![candidate.device.clone()];
    let queue = queue.clone();
    let event_loop_for_go = event_loop.clone();
    let global_for_complete = global.clone();
    let id_for_complete = id.clone();
    let vol_dir_for_complete = vol_dir.clone();

    list.add(
        name.clone(),
        resources,
        vec![],
        priority,
        move |handle| {
            let handle_cell = std::rc::Rc::new(std::cell::RefCell::new(Some(handle)));
            let handle_for_complete = handle_cell.clone();
            let mut el = event_loop_for_go.borrow_mut();
            let spawn_result = rsbackup_tools::spawn_captured(&mut el, spec, move |completion, buf| {
                let handle = handle_for_complete.borrow_mut().take().expect("completes exactly once");
                let succeeded = completion.is_ok();
                let finish = rsbackup_tools::now_finish().unwrap_or_else(|err| {
                    log::warn!("{}: {}", id_for_complete, err);
                    start
                });
                if finish < start {
                    log::warn!(
                        "{}: finish time precedes start time (clock moved backwards?)",
                        id_for_complete
                    );
                }

                if succeeded {
                    let _ = std::fs::remove_file(incomplete_marker(&vol_dir_for_complete, &id_for_complete));
                    let _ = std::fs::remove_file(&nolink);
                }

                let rc = match &completion {
                    Ok(c) => match c {
                        rsbackup_tools::subprocess::Completion::Exited(code) => *code,
                        _ => -1,
                    },
                    Err(_) => -1,
                };

                let mut final_backup = backup;
                final_backup.finish_time = finish.timestamp();
                final_backup.rc = rc;
                final_backup.status = if succeeded {
                    BackupStatus::Complete
                } else {
                    BackupStatus::Failed
                };
                final_backup.log = buf;

                {
                    let state = global_for_complete.lock().unwrap();
                    if let Err(err) = state.catalogue.update(&final_backup) {
                        log::error!("{}: failed to update catalogue: {}", id_for_complete, err);
                    }
                }
                if let Some(err) = completion.err() {
                    log::warn!("{}: {}", id_for_complete, err);
                }
                {
                    let mut state = global_for_complete.lock().unwrap();
                    if let Some(host) = state.conf.host_mut(&final_backup.host) {
                        if let Some(vol) = host.volume_mut(&final_backup.volume) {
                            vol.attach_backup(final_backup);
                        }
                    }
                }

                queue.borrow_mut().push_back((handle, succeeded));
            });
            match spawn_result {
                Ok(pid) => {
                    if let Some(handle) = handle_cell.borrow().as_ref() {
                        handle.set_killer(move || {
                            let _ = kill(pid, Signal::SIGKILL);
                        });
                    }
                }
                Err(err) => {
                    log::error!("failed to spawn rsync for {}: {}", name_for_error, err);
                }
            }
        },
        None,
    );

    Ok(Some(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsbackup_api_types::{Device, PolicySpec, Store};
    use rsbackup_catalogue::Catalogue;

    fn sample_conf(store_path: &Path) -> crate::config::Conf {
        let mut conf = crate::config::Conf::new();
        let mut host = Host::new("h1", "localhost");
        let mut volume = Volume::new("v1", store_path.join("source"));
        volume.backup_policy = PolicySpec::new("always");
        // Avoid depending on a real rsync binary being installed.
        volume.rsync_command = Some("/bin/true".to_string());
        host.add_volume(volume);
        conf.add_host(host);
        conf.add_device(Device::new("d1"));
        conf.add_store(Store::new("s1", store_path.to_path_buf()));
        conf
    }

    #[test]
    fn schedules_and_completes_a_successful_backup() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("source")).unwrap();
        let conf = sample_conf(root.path());
        let catalogue = Catalogue::open_in_memory().unwrap();
        let global = Arc::new(Mutex::new(GlobalState::new(conf, catalogue)));
        let admission = AdmissionRegistry::default();
        let list = ActionList::new();
        let event_loop = std::rc::Rc::new(std::cell::RefCell::new(rsbackup_tools::EventLoop::new()));
        let queue = crate::engine_run::new_completion_queue();

        let candidate = BackupCandidate {
            host: "h1".to_string(),
            volume: "v1".to_string(),
            device: "d1".to_string(),
            store_path: root.path().to_path_buf(),
        };
        let source_path = root.path().join("source");

        let scheduled = schedule(
            global.clone(),
            &admission,
            &list,
            &event_loop,
            &queue,
            candidate,
            source_path,
            0,
            false,
            false,
        )
        .unwrap();
        assert!(scheduled.is_some());

        crate::engine_run::drive(&list, &event_loop, &queue).unwrap();

        let state = global.lock().unwrap();
        let backups = state.catalogue.for_volume_device("h1", "v1", "d1").unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].status, BackupStatus::Complete);
        let host = state.conf.host("h1").unwrap();
        let volume = host.volume("v1").unwrap();
        assert_eq!(volume.stats().completed_count, 1);
    }
}
