//! Volume availability checks (spec.md §3: "optional mount-point and
//! sentinel-file checks"), grounded on the original's `Volume::available()`
//! (`examples/original_source/src/Volume.cc`): verify the configured mount
//! point is actually mounted (by comparing device numbers against its
//! parent directory) and that a sentinel check-file exists, running the
//! probes locally for `localhost` or over SSH otherwise.
//!
//! This is independent of which device a backup would land on — it is a
//! property of the source volume, checked once before any device is tried
//! (spec.md §4.10 step 3 runs it ahead of the per-device admission loop).

use std::path::{Path, PathBuf};

use anyhow::Result;

use rsbackup_api_types::{Host, Volume};
use rsbackup_tools::subprocess::{Completion, CompletionPolicy, SubprocessSpec};

fn run_on_host(host: &Host, args: Vec<String>, ssh_timeout: Option<u64>) -> Result<(Completion, Vec<u8>)> {
    let mut spec = if host.is_localhost() {
        let mut s = SubprocessSpec::new(args[0].clone());
        s = s.args(args[1..].to_vec());
        s
    } else {
        let mut s = SubprocessSpec::new("ssh")
            .arg(format!("-oConnectTimeout={}", ssh_timeout.unwrap_or(10)))
            .arg(host.ssh_target());
        s = s.args(args);
        s
    };
    spec.policy = CompletionPolicy {
        throw_on_nonzero_exit: false,
        ..CompletionPolicy::default()
    };
    rsbackup_tools::run_standalone(spec)
}

/// Guesses the right `stat(1)` flavour the way the original does: BSD/Darwin
/// `stat -f`, everything else (assumed GNU coreutils) `stat -c`.
fn stat_device_flag(host: &Host, ssh_timeout: Option<u64>) -> Result<&'static str> {
    let (completion, output) = run_on_host(
        host,
        vec!["uname".to_string(), "-s".to_string()],
        ssh_timeout,
    )?;
    if !matches!(completion, Completion::Exited(0)) {
        anyhow::bail!("uname -s on {} failed: {}", host.name, completion.describe());
    }
    let os = String::from_utf8_lossy(&output).trim().to_string();
    if os == "Darwin" || os.ends_with("BSD") {
        Ok("-f")
    } else {
        Ok("-c")
    }
}

/// True iff `path` is a mount point on `host`: its device number differs
/// from its parent directory's.
fn is_mounted(host: &Host, path: &Path, ssh_timeout: Option<u64>) -> Result<bool> {
    if host.is_localhost() {
        let meta = std::fs::metadata(path)?;
        let parent = path.join("..");
        let parent_meta = std::fs::metadata(&parent)?;
        use std::os::unix::fs::MetadataExt;
        return Ok(meta.dev() != parent_meta.dev());
    }

    let flag = stat_device_flag(host, ssh_timeout)?;
    let parent = path.join("..");
    let (completion, output) = run_on_host(
        host,
        vec![
            "stat".to_string(),
            flag.to_string(),
            "%d".to_string(),
            path.display().to_string(),
            parent.display().to_string(),
        ],
        ssh_timeout,
    )?;
    if !matches!(completion, Completion::Exited(0)) {
        return Ok(false);
    }
    let text = String::from_utf8_lossy(&output);
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() != 2 || lines[0].is_empty() || lines[1].is_empty() {
        return Ok(false);
    }
    Ok(lines[0] != lines[1])
}

/// True iff `path` exists on `host`.
fn file_exists(host: &Host, path: &Path, ssh_timeout: Option<u64>) -> Result<bool> {
    if host.is_localhost() {
        return Ok(path.exists());
    }
    let (completion, _) = run_on_host(
        host,
        vec!["test".to_string(), "-e".to_string(), path.display().to_string()],
        ssh_timeout,
    )?;
    Ok(matches!(completion, Completion::Exited(0)))
}

/// Runs `volume`'s configured mount-point and sentinel-file checks against
/// `host`, returning `false` (not an error) for either a missing mount or a
/// missing sentinel: the caller should skip the volume this pass, exactly
/// like an admission policy declining (spec.md §4.10/original's
/// `NotAvailable`).
pub fn volume_available(host: &Host, volume: &Volume, ssh_timeout: Option<u64>) -> Result<bool> {
    if let Some(mount_point) = &volume.mount_point {
        if !is_mounted(host, mount_point, ssh_timeout)? {
            return Ok(false);
        }
    }
    if let Some(check_file) = &volume.check_file {
        let file: PathBuf = if check_file.is_absolute() {
            check_file.clone()
        } else {
            volume.path.join(check_file)
        };
        if !file_exists(host, &file, ssh_timeout)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_checks_configured_is_always_available() {
        let host = Host::new("h1", "localhost");
        let volume = Volume::new("v1", "/data/v1");
        assert!(volume_available(&host, &volume, None).unwrap());
    }

    #[test]
    fn missing_check_file_is_unavailable() {
        let host = Host::new("h1", "localhost");
        let mut volume = Volume::new("v1", "/data/v1");
        volume.check_file = Some(PathBuf::from("/nonexistent/sentinel/xyz"));
        assert!(!volume_available(&host, &volume, None).unwrap());
    }

    #[test]
    fn present_check_file_relative_to_volume_path_is_available() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sentinel"), b"").unwrap();
        let host = Host::new("h1", "localhost");
        let mut volume = Volume::new("v1", dir.path());
        volume.check_file = Some(PathBuf::from("sentinel"));
        assert!(volume_available(&host, &volume, None).unwrap());
    }

    #[test]
    fn root_filesystem_is_a_mount_point() {
        let host = Host::new("h1", "localhost");
        let mut volume = Volume::new("v1", "/tmp");
        volume.mount_point = Some(PathBuf::from("/"));
        assert!(volume_available(&host, &volume, None).unwrap());
    }
}
