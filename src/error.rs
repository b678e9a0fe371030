//! Error types for the agent's subsystems.

use std::path::PathBuf;

/// Local configuration problems (flags, environment).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A duration string could not be parsed.
    #[error("invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: String },
}

/// Errors from the embedded key/value store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No store handle was opened at startup.
    #[error("store not initialized")]
    NotInitialized,

    /// The store is shutting down or already shut down.
    #[error("store closed")]
    Closed,

    /// Underlying database error.
    #[error("store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error preparing the store location.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from running external commands and tracking jobs.
///
/// Cloneable so the same error can be recorded on the job entry and returned
/// to the synchronous caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    /// The process could not be started at all.
    #[error("failed to spawn command: {reason}")]
    Spawn { reason: String },

    /// The process ran and exited non-zero.
    #[error("command exited with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },

    /// A job under this name has already claimed its unit of work.
    #[error("job {name} already in flight")]
    JobInFlight { name: String },
}

/// Errors talking to the secrets backend.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The backend could not be reached or the request failed outright.
    #[error("secrets backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("secrets backend returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The path exists but holds no usable secret data.
    #[error("no secret data at {path}")]
    NoSecret { path: String },

    /// The secret data does not decode into the expected shape.
    #[error("malformed secret at {path}: {reason}")]
    Malformed { path: String, reason: String },
}

/// Authorization failures that stop the agent from acting at all.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The secrets backend is sealed.
    #[error("secrets backend is sealed")]
    Sealed,

    /// No token in the store and no AppRole credentials to obtain one.
    #[error("no authorization token available")]
    NoToken,

    /// AppRole login was attempted and rejected.
    #[error("approle login failed: {reason}")]
    LoginFailed { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Errors from the seal-key share lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum UnsealError {
    /// Every candidate share was tried and the backend is still sealed.
    #[error("backend still sealed after submitting {submitted} share(s)")]
    StillSealed { submitted: usize },

    /// A drop ran but shares remain detectable in the store.
    #[error("seal-key shares were not dropped")]
    SharesNotDropped,

    /// The configured seal-key file is a directory.
    #[error("seal-key file {0} is a directory")]
    KeyFileIsDir(PathBuf),

    /// The seal-key file could not be read.
    #[error("failed to read seal-key file: {0}")]
    KeyFile(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Umbrella error for the action layer, so the control surface can map each
/// class to a distinct status signal.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
