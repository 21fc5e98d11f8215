//! CLI entry point. Option parsing is hand-rolled rather than pulled in
//! from a dedicated crate (spec.md §1 places "the CLI/option parser"
//! out of scope as an external collaborator; no such crate appears in this
//! workspace's dependency table).

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};

use rsbackup::policy::{AdmissionRegistry, PruneRegistry};
use rsbackup::reconcile::{check_unique_device_names, Reconciler};
use rsbackup::state::GlobalState;
use rsbackup::{orchestrator, prune_engine, Conf, Selection};
use rsbackup_catalogue::Catalogue;
use rsbackup_tools::ProcessLock;

struct Args {
    command: String,
    config: PathBuf,
    database: Option<PathBuf>,
    dry_run: bool,
    select: Vec<String>,
}

fn parse_args() -> Result<Args> {
    let mut raw = std::env::args().skip(1);
    let command = raw
        .next()
        .context("usage: rsbackup <backup|prune> [--config PATH] [--database PATH] [--dry-run] [--select PATTERN]...")?;

    let mut config = PathBuf::from(format!("{}/rsbackup.json", rsbackup_buildcfg::CONFIGDIR));
    let mut database = None;
    let mut dry_run = false;
    let mut select = Vec::new();

    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--config" => config = PathBuf::from(raw.next().context("--config requires a value")?),
            "--database" => database = Some(PathBuf::from(raw.next().context("--database requires a value")?)),
            "--dry-run" => dry_run = true,
            "--select" => select.push(raw.next().context("--select requires a value")?),
            other => bail!("unrecognised option '{}'", other),
        }
    }

    Ok(Args {
        command,
        config,
        database,
        dry_run,
        select,
    })
}

fn run() -> Result<u64> {
    let args = parse_args()?;

    std::fs::create_dir_all(rsbackup_buildcfg::RSBACKUP_RUN_DIR).with_context(|| {
        format!(
            "creating run directory '{}'",
            rsbackup_buildcfg::RSBACKUP_RUN_DIR
        )
    })?;
    let lock = ProcessLock::open(rsbackup_buildcfg::RSBACKUP_LOCK_FN).with_context(|| {
        format!(
            "opening lock file '{}'",
            rsbackup_buildcfg::RSBACKUP_LOCK_FN
        )
    })?;
    let _lock_guard = lock.try_exclusive()?;

    let conf = Conf::load_json(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    let admission = AdmissionRegistry::default();
    let prune = PruneRegistry::default();
    conf.validate(&admission, &prune)?;
    check_unique_device_names(conf.devices())?;

    let selection_patterns: Vec<&str> = args.select.iter().map(String::as_str).collect();
    let selection = Selection::parse(&selection_patterns)?;
    let mut conf = conf;
    let current_time_of_day = {
        use chrono::Timelike;
        let now = rsbackup_tools::now_backup()?;
        (now.num_seconds_from_midnight()) as i64
    };
    selection.apply(&mut conf, current_time_of_day);

    let database_path = args.database.clone().unwrap_or_else(|| conf.database_path());
    let catalogue =
        Catalogue::open(&database_path).with_context(|| format!("opening catalogue {}", database_path.display()))?;
    catalogue.expire_prune_log(rsbackup_tools::now_finish()?.timestamp(), conf.prune_log_retention)?;

    let pre_access_hook = conf.pre_access_hook.clone();
    let post_access_hook = conf.post_access_hook.clone();
    let public_stores = conf.public_stores;
    let stores = conf.stores().to_vec();
    let devices = conf.devices().to_vec();
    let prune_timeout = conf.prune_timeout.map(std::time::Duration::from_secs);

    let global = Arc::new(Mutex::new(GlobalState::new(conf, catalogue)));
    {
        let mut reconciler = Reconciler::new(pre_access_hook, post_access_hook, public_stores);
        let device_for_store = reconciler.reconcile(&stores, &devices)?;
        let device_names: Vec<String> = devices.iter().map(|d| d.name.clone()).collect();
        reconciler.finish(&device_names)?;

        let mut state = global.lock().unwrap();
        state.device_for_store = device_for_store;
    }

    match args.command.as_str() {
        "backup" => {
            orchestrator::run_backup_pass(global.clone(), Arc::new(admission), args.dry_run)?;
        }
        "prune" => {
            let store_path_for_device = {
                let state = global.lock().unwrap();
                let mut map = std::collections::BTreeMap::new();
                for (store_name, device_name) in &state.device_for_store {
                    if let Some(store) = state.conf.stores().iter().find(|s| &s.name == store_name) {
                        map.insert(device_name.clone(), store.path.clone());
                    }
                }
                map
            };
            let identified_devices: std::collections::BTreeSet<String> =
                store_path_for_device.keys().cloned().collect();
            prune_engine::run(
                global.clone(),
                &prune,
                &identified_devices,
                &store_path_for_device,
                false,
                prune_timeout,
                args.dry_run,
            )?;
        }
        other => bail!("unknown command '{}' (expected 'backup' or 'prune')", other),
    }

    let error_count = global.lock().unwrap().error_count;
    Ok(error_count)
}

fn init_logging() {
    let interactive = unsafe { libc::isatty(std::io::stderr().as_raw_fd()) == 1 };
    if interactive {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
        return;
    }
    if let Err(err) = syslog::init(syslog::Facility::LOG_DAEMON, log::LevelFilter::Info, Some("rsbackup")) {
        eprintln!("falling back to env_logger: syslog init failed: {}", err);
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }
}

fn main() -> ExitCode {
    init_logging();

    match run() {
        Ok(0) => ExitCode::from(0),
        Ok(_) => ExitCode::from(1),
        Err(err) => {
            log::error!("{:#}", err);
            ExitCode::from(1)
        }
    }
}
