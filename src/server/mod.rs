//! HTTP control surface: an externally reachable façade over the actions.
//!
//! Every route works on the shared [`AgentState`]; nothing here carries its
//! own logic beyond request decoding and error-to-status mapping. Error
//! responses are JSON with a `message` field.

use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::agent::AgentState;
use crate::agent::actions::{self, CheckoutReport, GitMode, MountOverrides, MountReport, RunMode};
use crate::error::{ActionError, AuthError, StoreError, VaultError};
use crate::jobs::JobSnapshot;
use crate::ops::restic::BackupMode;
use crate::vault::SealStatus;

pub fn router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/token", get(get_token).post(put_token))
        .route("/seal-key", post(put_seal_key))
        .route("/unseal", post(unseal))
        .route("/seal", post(seal))
        .route("/sealed", get(sealed))
        .route("/mount", post(mount))
        .route("/backup", post(backup))
        .route("/git", post(git))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` resolves; in-flight requests get
/// to finish.
pub async fn serve(
    state: Arc<AgentState>,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = addr, "control surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

// -- Requests --

#[derive(Debug, Deserialize)]
struct TokenRequest {
    token: String,
}

#[derive(Debug, Deserialize)]
struct SealKeyRequest {
    key: String,
    /// 1-based slot; appended after the highest populated slot when omitted.
    index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct UnsealRequest {
    key: String,
}

#[derive(Debug, Deserialize)]
struct SealRequest {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MountRequest {
    token: Option<String>,
    #[serde(default)]
    run: bool,
    #[serde(default)]
    test: bool,
    /// Idle-timeout override applied to every volume in this request.
    duration: Option<String>,
    #[serde(default, rename = "allowOther")]
    allow_other: bool,
}

#[derive(Debug, Deserialize)]
struct BackupRequest {
    mode: BackupMode,
    token: Option<String>,
    #[serde(default)]
    run: bool,
    #[serde(default)]
    test: bool,
}

#[derive(Debug, Deserialize)]
struct GitRequest {
    mode: GitMode,
    token: Option<String>,
    #[serde(default)]
    run: bool,
    #[serde(default)]
    test: bool,
}

// -- Error mapping --

/// Error envelope every failing route returns.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotInitialized | StoreError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Store(e) => e.into(),
            AuthError::Vault(e) => e.into(),
            e => Self::new(StatusCode::FORBIDDEN, e.to_string()),
        }
    }
}

impl From<ActionError> for ApiError {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::Auth(e) => e.into(),
            ActionError::Vault(e) => e.into(),
            ActionError::Store(e) => e.into(),
            ActionError::Execution(e) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

// -- Handlers --

async fn health() -> Json<Value> {
    Json(json!({ "message": "ok" }))
}

async fn status(State(state): State<Arc<AgentState>>) -> Json<Vec<JobSnapshot>> {
    Json(state.registry().snapshots().await)
}

async fn get_token(State(state): State<Arc<AgentState>>) -> Result<Json<Value>, ApiError> {
    let token = state.store()?.token().await?;
    Ok(Json(json!({ "token": token })))
}

async fn put_token(
    State(state): State<Arc<AgentState>>,
    Json(req): Json<TokenRequest>,
) -> Result<Json<Value>, ApiError> {
    state.store()?.put_token(&req.token).await?;
    Ok(Json(json!({})))
}

async fn put_seal_key(
    State(state): State<Arc<AgentState>>,
    Json(req): Json<SealKeyRequest>,
) -> Result<Json<Value>, ApiError> {
    let coordinator = state.unseal_coordinator()?;
    let index = match req.index {
        Some(0) => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "share index is 1-based",
            ));
        }
        Some(index) => index,
        None => coordinator.next_share_index().await?,
    };
    coordinator.record_share(index, &req.key).await?;
    Ok(Json(json!({ "index": index })))
}

/// Submit one share directly to the backend.
async fn unseal(
    State(state): State<Arc<AgentState>>,
    Json(req): Json<UnsealRequest>,
) -> Result<Json<SealStatus>, ApiError> {
    Ok(Json(state.vault().unseal(&req.key).await?))
}

async fn seal(
    State(state): State<Arc<AgentState>>,
    Json(req): Json<SealRequest>,
) -> Result<Json<Value>, ApiError> {
    let token = actions::authorize_with(&state, req.token.as_deref()).await?;
    state.vault().seal(&token).await?;
    Ok(Json(json!({ "sealed": true })))
}

async fn sealed(State(state): State<Arc<AgentState>>) -> Result<Json<SealStatus>, ApiError> {
    Ok(Json(state.vault().seal_status().await?))
}

async fn mount(
    State(state): State<Arc<AgentState>>,
    Json(req): Json<MountRequest>,
) -> Result<Json<MountReport>, ApiError> {
    let overrides = MountOverrides {
        idle: req.duration,
        allow_other: req.allow_other,
    };
    let report = actions::mount_volumes(
        &state,
        req.token.as_deref(),
        RunMode::from_flags(req.run, req.test),
        req.run,
        &overrides,
    )
    .await?;
    Ok(Json(report))
}

async fn backup(
    State(state): State<Arc<AgentState>>,
    Json(req): Json<BackupRequest>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let snapshot = actions::run_backup(
        &state,
        req.mode,
        req.token.as_deref(),
        RunMode::from_flags(req.run, req.test),
        req.run,
    )
    .await?;
    Ok(Json(snapshot))
}

async fn git(
    State(state): State<Arc<AgentState>>,
    Json(req): Json<GitRequest>,
) -> Result<Json<CheckoutReport>, ApiError> {
    let report = actions::checkout_repos(
        &state,
        req.mode,
        req.token.as_deref(),
        RunMode::from_flags(req.run, req.test),
        req.run,
    )
    .await?;
    Ok(Json(report))
}
