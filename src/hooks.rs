//! Hook environment and pre/post-volume hook invocation (spec.md §6 "Hook
//! environment", §4.10 "A per-volume pre-hook runs at most once on first
//! use and may replace the effective source path via its stdout").

use std::path::PathBuf;

use anyhow::Result;

use rsbackup_api_types::{Host, Volume};
use rsbackup_tools::subprocess::{Completion, CompletionPolicy, SubprocessSpec};

/// Exit code a hook uses to signal "temporary failure, skip me softly"
/// (spec.md §4.10: "Hook exit code 75 ('tempfail') is treated as a soft
/// skip"), the `sysexits.h` `EX_TEMPFAIL` convention (SPEC_FULL.md §9 open
/// question (d)).
pub const EX_TEMPFAIL: i32 = 75;

/// Outcome of running a volume pre-hook.
pub enum PreHookOutcome {
    /// The hook ran (or there was none) and backup should proceed, using
    /// `source_path` (the hook's stdout, trimmed, if it printed anything
    /// and exited 0; otherwise the volume's configured path unchanged).
    Proceed { source_path: PathBuf },
    /// The hook exited 75: soft skip, do not attempt the post-hook either.
    SoftSkip,
}

fn common_env(dry_run: bool, hook_name: &str) -> Vec<(String, String)> {
    vec![
        (
            "RSBACKUP_ACT".to_string(),
            (!dry_run).to_string(),
        ),
        ("RSBACKUP_HOOK".to_string(), hook_name.to_string()),
    ]
}

fn volume_env(host: &Host, volume: &Volume) -> Vec<(String, String)> {
    vec![
        ("RSBACKUP_HOST".to_string(), host.name.clone()),
        ("RSBACKUP_GROUP".to_string(), host.concurrency_group.clone()),
        ("RSBACKUP_SSH_HOSTNAME".to_string(), host.hostname.clone()),
        (
            "RSBACKUP_SSH_USERNAME".to_string(),
            host.user.clone().unwrap_or_default(),
        ),
        ("RSBACKUP_SSH_TARGET".to_string(), host.ssh_target()),
        ("RSBACKUP_VOLUME".to_string(), volume.name.clone()),
        (
            "RSBACKUP_VOLUME_PATH".to_string(),
            volume.path.display().to_string(),
        ),
    ]
}

/// Runs `volume.pre_volume_hook`, if configured, classifying its outcome.
/// Exit code 75 is a soft skip; any other nonzero exit is a hard failure
/// that propagates to the caller.
pub fn run_pre_volume_hook(
    host: &Host,
    volume: &Volume,
    dry_run: bool,
) -> Result<PreHookOutcome> {
    let Some(cmd) = volume.pre_volume_hook.as_ref() else {
        return Ok(PreHookOutcome::Proceed {
            source_path: volume.path.clone(),
        });
    };

    let mut spec = SubprocessSpec::new("/bin/sh").arg("-c").arg(cmd.clone());
    spec.policy = CompletionPolicy {
        throw_on_nonzero_exit: false,
        ..CompletionPolicy::default()
    };
    for (k, v) in common_env(dry_run, "pre-volume-hook") {
        spec = spec.env(k, v);
    }
    for (k, v) in volume_env(host, volume) {
        spec = spec.env(k, v);
    }

    let (completion, output) = rsbackup_tools::run_standalone(spec)?;
    match completion {
        Completion::Exited(0) => {
            let trimmed = String::from_utf8_lossy(&output).trim().to_string();
            let source_path = if trimmed.is_empty() {
                volume.path.clone()
            } else {
                PathBuf::from(trimmed)
            };
            Ok(PreHookOutcome::Proceed { source_path })
        }
        Completion::Exited(EX_TEMPFAIL) => Ok(PreHookOutcome::SoftSkip),
        other => anyhow::bail!(
            "pre-volume hook for {}:{} failed: {}",
            host.name,
            volume.name,
            other.describe()
        ),
    }
}

/// Runs `volume.post_volume_hook`, iff configured; always called after a
/// successful pre-hook (or the absence of one), never after a soft skip
/// (spec.md §4.10: "a matching post-hook runs iff the pre-hook succeeded").
pub fn run_post_volume_hook(host: &Host, volume: &Volume, dry_run: bool) -> Result<()> {
    let Some(cmd) = volume.post_volume_hook.as_ref() else {
        return Ok(());
    };

    let mut spec = SubprocessSpec::new("/bin/sh").arg("-c").arg(cmd.clone());
    for (k, v) in common_env(dry_run, "post-volume-hook") {
        spec = spec.env(k, v);
    }
    for (k, v) in volume_env(host, volume) {
        spec = spec.env(k, v);
    }
    rsbackup_tools::run_standalone(spec)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsbackup_api_types::Volume;

    #[test]
    fn no_hook_proceeds_with_configured_path() {
        let host = Host::new("h1", "localhost");
        let volume = Volume::new("v1", "/data/v1");
        let outcome = run_pre_volume_hook(&host, &volume, true).unwrap();
        match outcome {
            PreHookOutcome::Proceed { source_path } => {
                assert_eq!(source_path, PathBuf::from("/data/v1"));
            }
            PreHookOutcome::SoftSkip => panic!("expected Proceed"),
        }
    }

    #[test]
    fn hook_printing_a_path_overrides_source() {
        let host = Host::new("h1", "localhost");
        let mut volume = Volume::new("v1", "/data/v1");
        volume.pre_volume_hook = Some("/bin/echo /alt/path".to_string());
        let outcome = run_pre_volume_hook(&host, &volume, true).unwrap();
        match outcome {
            PreHookOutcome::Proceed { source_path } => {
                assert_eq!(source_path, PathBuf::from("/alt/path"));
            }
            PreHookOutcome::SoftSkip => panic!("expected Proceed"),
        }
    }

    #[test]
    fn hook_exiting_75_is_a_soft_skip() {
        let host = Host::new("h1", "localhost");
        let mut volume = Volume::new("v1", "/data/v1");
        volume.pre_volume_hook = Some("/bin/sh -c 'exit 75'".to_string());
        let outcome = run_pre_volume_hook(&host, &volume, true).unwrap();
        assert!(matches!(outcome, PreHookOutcome::SoftSkip));
    }

    #[test]
    fn hook_exiting_nonzero_non_tempfail_is_an_error() {
        let host = Host::new("h1", "localhost");
        let mut volume = Volume::new("v1", "/data/v1");
        volume.pre_volume_hook = Some("/bin/sh -c 'exit 2'".to_string());
        assert!(run_pre_volume_hook(&host, &volume, true).is_err());
    }
}
