//! restic invocation assembly.

use std::fmt;

use serde::Deserialize;

use crate::jobs::CommandSpec;
use crate::vault::secrets::ResticProfile;

/// Upload/download bandwidth cap for backup runs, in KiB/s.
const BANDWIDTH_LIMIT_KIB: u32 = 2000;

/// Tag applied to snapshots created by the backup job.
const BACKUP_TAG: &str = "full-home";

/// Backup operation requested by the scheduler or control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    /// Initialize a new repository.
    Init,
    /// Probe whether the repository answers (`restic snapshots`).
    Exists,
    /// Verify repository integrity.
    Check,
    /// Run the backup itself.
    Backup,
    /// Remove stale repository locks.
    Unlock,
    /// List snapshots, with output always emitted.
    List,
}

impl BackupMode {
    /// Registry name of the job running this mode.
    pub fn job_name(self) -> &'static str {
        match self {
            BackupMode::Init => "backup init",
            BackupMode::Exists => "backup exists",
            BackupMode::Check => "check",
            BackupMode::Backup => "backup",
            BackupMode::Unlock => "backup unlock",
            BackupMode::List => "backup list",
        }
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackupMode::Init => "init",
            BackupMode::Exists => "exists",
            BackupMode::Check => "check",
            BackupMode::Backup => "backup",
            BackupMode::Unlock => "unlock",
            BackupMode::List => "list",
        })
    }
}

/// Build the invocation for one mode against `profile`.
pub fn command(mode: BackupMode, profile: &ResticProfile) -> CommandSpec {
    let cmd = match mode {
        BackupMode::Init => "restic init".to_string(),
        BackupMode::Exists | BackupMode::List => "restic snapshots".to_string(),
        BackupMode::Check => "restic check".to_string(),
        BackupMode::Unlock => "restic unlock".to_string(),
        BackupMode::Backup => backup_invocation(profile),
    };
    CommandSpec::new(cmd).with_env_pairs(profile.environment())
}

/// `restic backup` stays on one filesystem, excludes the profile's patterns,
/// tags the snapshot, and caps bandwidth both ways.
fn backup_invocation(profile: &ResticProfile) -> String {
    let mut cmd = format!("restic backup {} -x", profile.path);
    for pattern in profile
        .exclude
        .lines()
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        cmd.push_str(&format!(" --exclude=\"{pattern}\""));
    }
    cmd.push_str(&format!(
        " --tag '{BACKUP_TAG}' --limit-upload {BANDWIDTH_LIMIT_KIB} --limit-download {BANDWIDTH_LIMIT_KIB}"
    ));
    cmd
}
