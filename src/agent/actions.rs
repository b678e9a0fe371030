//! Core actions shared by the scheduler and the control surface.
//!
//! Every action resolves a token first, checks the backend is unsealed,
//! fetches the typed profiles it needs, then creates and runs named jobs
//! through the registry. The control surface is a thin façade over these;
//! the scheduler calls them in-process.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ActionError, AuthError, ExecutionError};
use crate::jobs::{CommandRunner, Job, JobRegistry, JobSnapshot};
use crate::ops::restic::BackupMode;
use crate::ops::{gocryptfs, git, restic};
use crate::vault::secrets::{self, GitProfile, GocryptVolume, HostConfig, ResticProfile};

use super::AgentState;

/// Execution disposition of one requested job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Run on the caller and report the job's outcome.
    Sync,
    /// Run on a spawned task and return immediately.
    #[default]
    Background,
    /// Register the job and mark it finished without executing.
    DryRun,
}

impl RunMode {
    /// Map request flags; a dry-run request wins over a foreground one.
    pub fn from_flags(run: bool, test: bool) -> Self {
        if test {
            RunMode::DryRun
        } else if run {
            RunMode::Sync
        } else {
            RunMode::Background
        }
    }
}

/// Run an already-registered job per `mode`. Sync failures surface to the
/// caller; background failures only land on the registry entry.
async fn run_job(
    registry: &JobRegistry,
    job: Arc<Job>,
    mode: RunMode,
    emit: bool,
) -> Result<(), ExecutionError> {
    match mode {
        RunMode::Sync => registry.run_sync(&job, emit).await,
        RunMode::Background => {
            registry.run_async(job, emit);
            Ok(())
        }
        RunMode::DryRun => {
            registry.dry_run(&job, emit).await;
            Ok(())
        }
    }
}

/// Token for one request: explicit override when the body carried one,
/// resolved from the store or AppRole otherwise.
pub(crate) async fn authorize_with(
    state: &AgentState,
    explicit: Option<&str>,
) -> Result<String, AuthError> {
    match explicit {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => state.authorize().await,
    }
}

/// Host entry for this agent, refused while the backend is sealed.
async fn host_config_for(state: &AgentState, token: &str) -> Result<HostConfig, ActionError> {
    secrets::ensure_unsealed(state.vault()).await?;
    Ok(secrets::host_config(state.vault(), token, state.hostname()).await?)
}

// -- Mounts --

/// Outcome of one mount pass over the host's volumes.
#[derive(Debug, Default, Serialize)]
pub struct MountReport {
    /// Volumes whose mount job was created and dispatched.
    pub started: Vec<String>,
    /// Volumes skipped because the mount point was missing or not empty.
    pub skipped: Vec<String>,
    /// Volumes whose job could not be created or failed a foreground run.
    pub failed: Vec<String>,
}

/// Per-request mount settings layered over volume and agent defaults.
#[derive(Debug, Default, Clone)]
pub struct MountOverrides {
    pub idle: Option<String>,
    pub allow_other: bool,
}

/// Mount every configured volume whose mount point is an empty directory.
/// Best-effort per volume; profile fetch failures abort the whole pass.
pub async fn mount_volumes(
    state: &AgentState,
    token: Option<&str>,
    mode: RunMode,
    emit: bool,
    overrides: &MountOverrides,
) -> Result<MountReport, ActionError> {
    let token = authorize_with(state, token).await?;
    let host = host_config_for(state, &token).await?;

    let mut report = MountReport::default();
    for name in host.gocryptfs_names() {
        let volume = secrets::gocrypt_volume(state.vault(), &token, name).await?;
        match mount_one(state, volume, mode, emit, overrides).await {
            Ok(true) => report.started.push(name.to_string()),
            Ok(false) => report.skipped.push(name.to_string()),
            Err(e) => {
                warn!(volume = name, error = %e, "mount failed");
                report.failed.push(name.to_string());
            }
        }
    }
    Ok(report)
}

/// Mount a single volume. `Ok(false)` means the mount point was not an
/// existing empty directory and the volume was skipped.
async fn mount_one(
    state: &AgentState,
    volume: GocryptVolume,
    mode: RunMode,
    emit: bool,
    overrides: &MountOverrides,
) -> Result<bool, ExecutionError> {
    let mount_point = gocryptfs::expand_home(&volume.mount_path);
    match gocryptfs::is_empty_dir(Path::new(&mount_point)) {
        Ok(true) => {}
        Ok(false) => {
            info!(mount_point, "mount point not empty, skipping");
            return Ok(false);
        }
        Err(e) => {
            info!(mount_point, error = %e, "mount point not usable, skipping");
            return Ok(false);
        }
    }

    let name = format!("mount {}", volume.name);
    let idle = state
        .config()
        .mount_idle(overrides.idle.as_deref(), volume.duration.as_deref())
        .map(str::to_string);
    let allow_other =
        volume.allow || overrides.allow_other || state.config().mount_allow_other;

    let spec = gocryptfs::mount_command(volume, idle.as_deref(), allow_other);
    let job = state.registry().create_from_command(spec, &name).await?;
    run_job(state.registry(), job, mode, emit).await?;
    Ok(true)
}

// -- Backups --

/// Run one backup mode against the host's restic profile. Returns the job's
/// snapshot after dispatch: terminal for sync and dry runs, possibly still
/// in flight for background ones.
pub async fn run_backup(
    state: &AgentState,
    mode: BackupMode,
    token: Option<&str>,
    run: RunMode,
    emit: bool,
) -> Result<JobSnapshot, ActionError> {
    let token = authorize_with(state, token).await?;
    let host = host_config_for(state, &token).await?;
    let profile = secrets::restic_profile(state.vault(), &token, &host.restic).await?;

    // A snapshot listing is pointless without its output.
    let emit = emit || mode == BackupMode::List;
    let job = run_backup_job(state.registry(), mode, &profile, run, emit).await?;
    Ok(job.snapshot().await)
}

/// Create and dispatch the job for one backup mode.
pub(crate) async fn run_backup_job(
    registry: &JobRegistry,
    mode: BackupMode,
    profile: &ResticProfile,
    run: RunMode,
    emit: bool,
) -> Result<Arc<Job>, ExecutionError> {
    let job = registry
        .create_from_command(restic::command(mode, profile), mode.job_name())
        .await?;
    run_job(registry, Arc::clone(&job), run, emit).await?;
    Ok(job)
}

/// Probe the restic repository and initialize it when the probe fails.
/// Quiet foreground runs either way.
pub async fn ensure_repo_exists(
    registry: &JobRegistry,
    profile: &ResticProfile,
) -> Result<(), ExecutionError> {
    if let Err(e) =
        run_backup_job(registry, BackupMode::Exists, profile, RunMode::Sync, false).await
    {
        info!(error = %e, "repository probe failed, initializing");
        run_backup_job(registry, BackupMode::Init, profile, RunMode::Sync, false).await?;
    }
    Ok(())
}

// -- Checkouts --

/// Which git operation a checkout request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitMode {
    Clone,
    Pull,
}

/// Outcome of one checkout pass over the host's repositories.
#[derive(Debug, Default, Serialize)]
pub struct CheckoutReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

/// Clone or pull every configured repository. Best-effort per repository;
/// profile fetch failures abort the whole pass.
pub async fn checkout_repos(
    state: &AgentState,
    mode: GitMode,
    token: Option<&str>,
    run: RunMode,
    emit: bool,
) -> Result<CheckoutReport, ActionError> {
    let token = authorize_with(state, token).await?;
    let host = host_config_for(state, &token).await?;

    let mut report = CheckoutReport::default();
    for name in host.git_names() {
        let profile = secrets::git_profile(state.vault(), &token, name).await?;
        let result = match mode {
            GitMode::Clone => clone_repo(state.registry(), &profile, &host.home, run, emit).await,
            GitMode::Pull => pull_repo(state.registry(), &profile, &host.home, run, emit).await,
        };
        match result {
            Ok(()) => report.succeeded.push(name.to_string()),
            Err(e) => {
                warn!(repo = name, error = %e, "checkout failed");
                report.failed.push(name.to_string());
            }
        }
    }
    Ok(report)
}

async fn clone_repo(
    registry: &JobRegistry,
    profile: &GitProfile,
    home: &str,
    run: RunMode,
    emit: bool,
) -> Result<(), ExecutionError> {
    let dir = git::checkout_dir(profile, home);
    let name = format!("clone {}", profile.name);
    let job = registry
        .create_from_command(git::clone_command(profile, &dir), &name)
        .await?;
    run_job(registry, job, run, emit).await
}

async fn pull_repo(
    registry: &JobRegistry,
    profile: &GitProfile,
    home: &str,
    run: RunMode,
    emit: bool,
) -> Result<(), ExecutionError> {
    let name = format!("pull {}", profile.name);
    let work = pull_pipeline(registry.runner(), profile.clone(), home.to_string());
    let job = registry.create_from_func(&name, Box::pin(work)).await?;
    run_job(registry, job, run, emit).await
}

/// Scheduler checkout: a synchronous clone that falls back to remote+pull
/// when the destination already holds a checkout.
pub(crate) async fn checkout_with_fallback(
    registry: &JobRegistry,
    profile: &GitProfile,
    home: &str,
) -> Result<(), ExecutionError> {
    let name = format!("checkout {}", profile.name);
    let work = checkout_pipeline(registry.runner(), profile.clone(), home.to_string());
    let job = registry.create_from_func(&name, Box::pin(work)).await?;
    registry.run_sync(&job, true).await
}

async fn checkout_pipeline(
    runner: Arc<dyn CommandRunner>,
    profile: GitProfile,
    home: String,
) -> Result<String, ExecutionError> {
    let dir = git::checkout_dir(&profile, &home);
    let cloned = runner.run(&git::clone_command(&profile, &dir)).await?;
    if cloned.success() {
        return Ok(cloned.stdout);
    }
    if !cloned.stderr.contains("already exists") {
        return Err(cloned.to_error());
    }
    info!(dir, "checkout exists, pulling instead");
    pull_pipeline(runner, profile, home).await
}

/// Point the agent's remote at the repository URL (adding it on first use,
/// retargeting it otherwise) and pull from it.
async fn pull_pipeline(
    runner: Arc<dyn CommandRunner>,
    profile: GitProfile,
    home: String,
) -> Result<String, ExecutionError> {
    let dir = git::checkout_dir(&profile, &home);
    let url = git::authenticated_url(&profile.repo, profile.personal_token.as_ref());

    let added = runner.run(&git::remote_add_command(&dir, &url)).await?;
    if !added.success() {
        let set = runner.run(&git::remote_set_url_command(&dir, &url)).await?;
        if !set.success() {
            return Err(set.to_error());
        }
    }

    let pulled = runner.run(&git::pull_command(&dir)).await?;
    if pulled.success() {
        Ok(pulled.stdout)
    } else {
        Err(pulled.to_error())
    }
}
