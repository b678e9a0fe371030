//! Binary entrypoint: wires the store, the backend client, the job registry,
//! the scheduler, and the control surface together.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use warden::agent::AgentState;
use warden::agent::scheduler::Scheduler;
use warden::config::AgentConfig;
use warden::jobs::{JobRegistry, ShellRunner};
use warden::server;
use warden::store::Store;
use warden::vault::VaultClient;
use warden::vault::unseal::UnsealCoordinator;

/// How long shutdown waits for in-flight store writes.
const STORE_CLOSE_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::load()?;
    config.log_summary();

    let hostname = hostname::get()?.to_string_lossy().to_string();
    info!(hostname, "starting agent");

    // A broken store is not fatal: the agent still serves direct requests,
    // it just cannot persist tokens, shares, or schedule timestamps.
    let store = match Store::open(&config.db_path) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            error!(error = %e, "store unavailable, continuing without persistence");
            None
        }
    };

    let vault = VaultClient::new(config.vault_address.clone())?;
    let registry = JobRegistry::new(Arc::new(ShellRunner));

    if let (Some(store), Some(path)) = (&store, &config.vault_key_file) {
        let coordinator = UnsealCoordinator::new(Arc::clone(store), vault.clone());
        match coordinator.bulk_load(path).await {
            Ok(count) => info!(count, path = %path.display(), "seal-key shares loaded"),
            Err(e) => warn!(error = %e, path = %path.display(), "seal-key file load failed"),
        }
    }

    let state = Arc::new(AgentState::new(
        config.clone(),
        store.clone(),
        registry,
        vault,
        hostname,
    ));

    let scheduler = Scheduler::new(Arc::clone(&state)).spawn();

    server::serve(state, &config.address, shutdown_signal()).await?;

    scheduler.abort();
    if let Some(store) = store {
        store.close(STORE_CLOSE_GRACE).await;
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
