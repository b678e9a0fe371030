//! Agent configuration from flags and environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;
use tracing::{info, warn};

use crate::error::ConfigError;

/// Command-line and environment surface (`AGENT_*` variables).
#[derive(Debug, Parser)]
#[command(
    name = "warden",
    version,
    about = "Host-resident backup agent gated by a secrets backend"
)]
pub struct Args {
    /// Address the control surface listens on.
    #[arg(long, env = "AGENT_ADDRESS", default_value = "localhost:8081")]
    pub address: String,

    /// Filesystem path of the embedded store.
    #[arg(long, env = "AGENT_PATHDB", default_value = "/opt/warden/db")]
    pub pathdb: PathBuf,

    /// Interval between scheduler ticks (e.g. "30m", "2h", "90s").
    #[arg(long, env = "AGENT_DURATION", default_value = "30m")]
    pub duration: String,

    /// Idle timeout for gocryptfs mounts when the volume sets none.
    #[arg(long, env = "AGENT_MOUNT_DURATION")]
    pub mount_duration: Option<String>,

    /// Pass -allow_other to every mount.
    #[arg(long, env = "AGENT_MOUNT_ALLOW_OTHER", default_value_t = false)]
    pub mount_allow_other: bool,

    /// Secrets backend address.
    #[arg(
        long,
        env = "AGENT_VAULT_ADDRESS",
        default_value = "https://localhost:8200"
    )]
    pub vault_address: String,

    /// Newline-delimited seal-key share file loaded at startup.
    #[arg(long, env = "AGENT_VAULT_KEY_FILE")]
    pub vault_key_file: Option<PathBuf>,

    /// AppRole role id (only honored together with --vault-secret-id).
    #[arg(long, env = "AGENT_VAULT_ROLE_ID")]
    pub vault_role_id: Option<String>,

    /// AppRole secret id (only honored together with --vault-role-id).
    #[arg(long, env = "AGENT_VAULT_SECRET_ID")]
    pub vault_secret_id: Option<String>,
}

/// AppRole credential pair; both halves or neither.
#[derive(Debug, Clone)]
pub struct AppRole {
    pub role_id: String,
    pub secret_id: SecretString,
}

/// Typed runtime configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub address: String,
    pub db_path: PathBuf,
    pub interval: Duration,
    pub mount_duration: Option<String>,
    pub mount_allow_other: bool,
    pub vault_address: String,
    pub vault_key_file: Option<PathBuf>,
    pub approle: Option<AppRole>,
}

impl AgentConfig {
    /// Parse process arguments and environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let interval = parse_duration(&args.duration)?;
        let approle = match (args.vault_role_id, args.vault_secret_id) {
            (Some(role_id), Some(secret_id)) => Some(AppRole {
                role_id,
                secret_id: SecretString::from(secret_id),
            }),
            (None, None) => None,
            _ => {
                warn!("approle role id and secret id must both be set; ignoring the one provided");
                None
            }
        };
        Ok(Self {
            address: args.address,
            db_path: args.pathdb,
            interval,
            mount_duration: args.mount_duration,
            mount_allow_other: args.mount_allow_other,
            vault_address: args.vault_address,
            vault_key_file: args.vault_key_file,
            approle,
        })
    }

    /// Idle timeout for one mount: request override first, then the volume's
    /// own setting, then the agent-wide default.
    pub fn mount_idle<'a>(
        &'a self,
        request: Option<&'a str>,
        volume: Option<&'a str>,
    ) -> Option<&'a str> {
        request.or(volume).or(self.mount_duration.as_deref())
    }

    pub fn log_summary(&self) {
        info!(
            address = %self.address,
            db = %self.db_path.display(),
            interval = ?self.interval,
            vault = %self.vault_address,
            approle = self.approle.is_some(),
            key_file = self.vault_key_file.is_some(),
            "agent configuration"
        );
    }
}

/// Parse durations like "30m", "2h", "90s", or compounds like "1h30m".
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let raw = value.trim();
    if raw.is_empty() {
        return Err(invalid(value, "empty"));
    }
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut seen_segment = false;
    for ch in raw.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let amount: u64 = digits
            .parse()
            .map_err(|_| invalid(value, "unit without a count"))?;
        digits.clear();
        let unit_secs = match ch {
            'h' => 60 * 60,
            'm' => 60,
            's' => 1,
            _ => return Err(invalid(value, "unknown unit, expected h, m, or s")),
        };
        total += Duration::from_secs(amount * unit_secs);
        seen_segment = true;
    }
    if !digits.is_empty() {
        return Err(invalid(value, "trailing count without a unit"));
    }
    if !seen_segment {
        return Err(invalid(value, "no duration segments"));
    }
    Ok(total)
}

fn invalid(value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidDuration {
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
