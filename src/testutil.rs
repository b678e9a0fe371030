//! Shared helpers for inline test modules: a scripted command runner and an
//! in-process stand-in for the secrets backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::config::AgentConfig;
use crate::error::ExecutionError;
use crate::jobs::{Captured, CommandRunner, CommandSpec};

/// Scripted [`CommandRunner`]: records every spec, succeeds by default.
pub(crate) struct RecordingRunner {
    calls: Arc<Mutex<Vec<CommandSpec>>>,
    delay: Option<Duration>,
    stdout: String,
    status: i32,
    stderr: String,
    rules: Vec<FailRule>,
}

struct FailRule {
    needle: String,
    status: i32,
    stderr: String,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            stdout: String::new(),
            status: 0,
            stderr: String::new(),
            rules: Vec::new(),
        }
    }

    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.to_string();
        self
    }

    /// Every invocation fails with this status and stderr.
    pub fn with_failure(mut self, status: i32, stderr: &str) -> Self {
        self.status = status;
        self.stderr = stderr.to_string();
        self
    }

    /// Sleep before completing, to keep jobs observably in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Commands containing `needle` fail with `status`/`stderr`; everything
    /// else keeps the default outcome.
    pub fn fail_when(mut self, needle: &str, status: i32, stderr: &str) -> Self {
        self.rules.push(FailRule {
            needle: needle.to_string(),
            status,
            stderr: stderr.to_string(),
        });
        self
    }

    /// Handle to the recorded invocations; grab it before moving the runner
    /// into a registry.
    pub fn calls(&self) -> Arc<Mutex<Vec<CommandSpec>>> {
        Arc::clone(&self.calls)
    }
}

pub(crate) fn commands_of(calls: &Arc<Mutex<Vec<CommandSpec>>>) -> Vec<String> {
    calls
        .lock()
        .unwrap()
        .iter()
        .map(|spec| spec.command().to_string())
        .collect()
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<Captured, ExecutionError> {
        self.calls.lock().unwrap().push(spec.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        for rule in &self.rules {
            if spec.command().contains(&rule.needle) {
                return Ok(Captured {
                    stdout: String::new(),
                    stderr: rule.stderr.clone(),
                    status: rule.status,
                });
            }
        }
        Ok(Captured {
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            status: self.status,
        })
    }
}

/// Mutable state behind the fake secrets backend.
pub(crate) struct FakeVaultState {
    pub sealed: bool,
    pub t: u32,
    pub n: u32,
    pub progress: u32,
    /// Shares received via unseal calls, in order.
    pub submitted: Vec<String>,
    /// Respond 500 to every unseal call.
    pub reject_unseal: bool,
    /// Logical path (without `/v1/`) → payload served under `"data"`.
    pub secrets: HashMap<String, Value>,
}

/// In-process secrets backend with Vault-shaped endpoints.
pub(crate) struct FakeVault {
    pub state: Mutex<FakeVaultState>,
}

impl FakeVault {
    pub fn new(sealed: bool, t: u32, n: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeVaultState {
                sealed,
                t,
                n,
                progress: 0,
                submitted: Vec::new(),
                reject_unseal: false,
                secrets: HashMap::new(),
            }),
        })
    }

    pub fn unsealed() -> Arc<Self> {
        Self::new(false, 3, 5)
    }

    pub fn add_secret(&self, path: &str, value: Value) {
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert(path.to_string(), value);
    }

    fn seal_status_body(state: &FakeVaultState) -> Value {
        json!({
            "sealed": state.sealed,
            "t": state.t,
            "n": state.n,
            "progress": state.progress,
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/v1/sys/seal-status", get(seal_status))
            .route("/v1/sys/unseal", put(unseal))
            .route("/v1/sys/seal", put(seal))
            .route("/v1/auth/approle/login", post(approle_login))
            .route("/v1/{*path}", get(read_secret))
            .with_state(self)
    }

    /// Bind an ephemeral port, serve in the background, return the base URL.
    pub async fn serve(self: Arc<Self>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = self.router();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }
}

async fn seal_status(State(vault): State<Arc<FakeVault>>) -> Json<Value> {
    let state = vault.state.lock().unwrap();
    Json(FakeVault::seal_status_body(&state))
}

async fn unseal(
    State(vault): State<Arc<FakeVault>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let mut state = vault.state.lock().unwrap();
    if state.reject_unseal {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let key = body
        .get("key")
        .and_then(|k| k.as_str())
        .ok_or(StatusCode::BAD_REQUEST)?;
    state.submitted.push(key.to_string());
    if state.sealed {
        state.progress += 1;
        if state.progress >= state.t {
            state.sealed = false;
            state.progress = 0;
        }
    }
    Ok(Json(FakeVault::seal_status_body(&state)))
}

async fn seal(State(vault): State<Arc<FakeVault>>) -> StatusCode {
    let mut state = vault.state.lock().unwrap();
    state.sealed = true;
    state.progress = 0;
    StatusCode::NO_CONTENT
}

async fn approle_login(State(_vault): State<Arc<FakeVault>>) -> Json<Value> {
    Json(json!({"auth": {"client_token": "approle-token"}}))
}

async fn read_secret(
    State(vault): State<Arc<FakeVault>>,
    Path(path): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let state = vault.state.lock().unwrap();
    match state.secrets.get(&path) {
        Some(value) => Ok(Json(json!({"data": value}))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// Minimal agent configuration pointed at a test backend.
pub(crate) fn test_config(vault_address: &str) -> AgentConfig {
    AgentConfig {
        address: "127.0.0.1:0".to_string(),
        db_path: PathBuf::from("/tmp/warden-test-db"),
        interval: Duration::from_secs(30 * 60),
        mount_duration: None,
        mount_allow_other: false,
        vault_address: vault_address.to_string(),
        vault_key_file: None,
        approle: None,
    }
}
