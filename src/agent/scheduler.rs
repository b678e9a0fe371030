//! Periodic tick driving mounts, checkouts, backups, and integrity checks.
//!
//! One long-lived task. Ticks are strictly sequential: the next sleep starts
//! only after the previous pipeline finished, so slow backups stretch the
//! schedule instead of overlapping it. Stage order within a tick is fixed;
//! stages are individually best-effort once the gates pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::UnsealError;
use crate::ops::restic::BackupMode;
use crate::vault::secrets::{self, HostConfig, ResticProfile};

use super::AgentState;
use super::actions::{self, MountOverrides, RunMode};

/// Delay before the first tick after startup.
const STARTUP_DELAY: Duration = Duration::from_secs(5);

/// Hours that must pass after a successful backup before the next one.
const BACKUP_EVERY_HOURS: i64 = 2;

/// Hours between repository integrity checks.
const CHECK_EVERY_HOURS: i64 = 12;

/// Why a tick ended: which gate short-circuited it, or that it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No store was opened at startup.
    StoreUnavailable,
    /// No token and no way to obtain one.
    Unauthorized,
    /// The backend could not be reached.
    VaultUnavailable,
    /// The backend stayed sealed after an unseal attempt.
    StillSealed,
    /// All stages ran, each best-effort.
    Completed,
}

pub struct Scheduler {
    state: Arc<AgentState>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(state: Arc<AgentState>) -> Self {
        let interval = state.config().interval;
        Self { state, interval }
    }

    /// Run the loop on a spawned task; aborting the handle stops it between
    /// pipelines.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        tokio::time::sleep(STARTUP_DELAY).await;
        loop {
            let outcome = self.tick().await;
            info!(?outcome, "tick finished");
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One pipeline: store and token gates, the seal gate, then the four
    /// stages in order.
    pub async fn tick(&self) -> TickOutcome {
        if self.state.store().is_err() {
            warn!("no store, skipping tick");
            return TickOutcome::StoreUnavailable;
        }
        let token = match self.state.authorize().await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "tick not authorized");
                return TickOutcome::Unauthorized;
            }
        };

        match self.state.vault().seal_status().await {
            Ok(status) if status.sealed => {
                let Ok(coordinator) = self.state.unseal_coordinator() else {
                    return TickOutcome::StoreUnavailable;
                };
                if let Err(e) = coordinator.auto_unseal().await {
                    warn!(error = %e, "auto unseal failed, skipping tick");
                    return match e {
                        UnsealError::Vault(_) => TickOutcome::VaultUnavailable,
                        _ => TickOutcome::StillSealed,
                    };
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "seal status unavailable, skipping tick");
                return TickOutcome::VaultUnavailable;
            }
        }

        let host = match secrets::host_config(self.state.vault(), &token, self.state.hostname())
            .await
        {
            Ok(host) => host,
            Err(e) => {
                warn!(error = %e, "host configuration unavailable, skipping tick");
                return TickOutcome::VaultUnavailable;
            }
        };

        self.mount_stage(&token).await;
        self.checkout_stage(&token, &host).await;
        self.backup_stage(&token, &host).await;
        self.check_stage(&token, &host).await;
        TickOutcome::Completed
    }

    /// Mounts run in the background so an indefinite mount cannot hold the
    /// tick open. Volumes with busy mount points are skipped.
    async fn mount_stage(&self, token: &str) {
        let result = actions::mount_volumes(
            &self.state,
            Some(token),
            RunMode::Background,
            false,
            &MountOverrides::default(),
        )
        .await;
        match result {
            Ok(report) => info!(
                started = report.started.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "mount stage done"
            ),
            Err(e) => warn!(error = %e, "mount stage failed"),
        }
    }

    /// Per repository: clone synchronously, falling back to remote+pull when
    /// the checkout already exists.
    async fn checkout_stage(&self, token: &str, host: &HostConfig) {
        for name in host.git_names() {
            let profile = match secrets::git_profile(self.state.vault(), token, name).await {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(repo = name, error = %e, "repository profile unavailable");
                    continue;
                }
            };
            if let Err(e) =
                actions::checkout_with_fallback(self.state.registry(), &profile, &host.home).await
            {
                warn!(repo = name, error = %e, "checkout failed");
            }
        }
    }

    async fn backup_stage(&self, token: &str, host: &HostConfig) {
        let Ok(store) = self.state.store() else {
            return;
        };
        let last = match store.last_backup().await {
            Ok(last) => last,
            Err(e) => {
                warn!(error = %e, "last backup unreadable, skipping stage");
                return;
            }
        };
        if !due(last, BACKUP_EVERY_HOURS) {
            info!(last = %last, "backup not due yet");
            return;
        }

        let Some(profile) = self.restic_profile(token, host).await else {
            return;
        };
        if let Err(e) = actions::ensure_repo_exists(self.state.registry(), &profile).await {
            warn!(error = %e, "repository probe and init failed, skipping backup");
            return;
        }
        let run = actions::run_backup_job(
            self.state.registry(),
            BackupMode::Backup,
            &profile,
            RunMode::Sync,
            true,
        )
        .await;
        match run {
            Ok(_) => {
                info!("backup finished");
                if let Err(e) = store.set_last_backup(Utc::now()).await {
                    warn!(error = %e, "failed persisting backup timestamp");
                }
            }
            Err(e) => warn!(error = %e, "backup failed"),
        }
    }

    async fn check_stage(&self, token: &str, host: &HostConfig) {
        let Ok(store) = self.state.store() else {
            return;
        };
        let last = match store.last_check().await {
            Ok(last) => last,
            Err(e) => {
                warn!(error = %e, "last check unreadable, skipping stage");
                return;
            }
        };
        if !due(last, CHECK_EVERY_HOURS) {
            info!(last = %last, "integrity check not due yet");
            return;
        }

        let Some(profile) = self.restic_profile(token, host).await else {
            return;
        };
        if let Err(e) = actions::ensure_repo_exists(self.state.registry(), &profile).await {
            warn!(error = %e, "repository probe and init failed, skipping check");
            return;
        }
        let run = actions::run_backup_job(
            self.state.registry(),
            BackupMode::Check,
            &profile,
            RunMode::Sync,
            true,
        )
        .await;
        match run {
            Ok(_) => {
                info!("integrity check finished");
                if let Err(e) = store.set_last_check(Utc::now()).await {
                    warn!(error = %e, "failed persisting check timestamp");
                }
            }
            Err(e) => warn!(error = %e, "integrity check failed"),
        }
    }

    async fn restic_profile(&self, token: &str, host: &HostConfig) -> Option<ResticProfile> {
        match secrets::restic_profile(self.state.vault(), token, &host.restic).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(error = %e, "restic profile unavailable, skipping stage");
                None
            }
        }
    }
}

/// True once more than `hours` have passed since `last`.
fn due(last: DateTime<Utc>, hours: i64) -> bool {
    Utc::now() > last + chrono::Duration::hours(hours)
}
