//! Client for the Vault-style secrets backend.
//!
//! Covers the seal lifecycle (status, unseal, seal), AppRole login, and
//! logical KV reads with the v2 `data.data` envelope unwrapped.

pub mod secrets;
pub mod unseal;

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::VaultError;

/// Per-request timeout against the backend.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Seal status as reported by the backend.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct SealStatus {
    pub sealed: bool,
    /// Unseal threshold.
    pub t: u32,
    /// Total share count.
    pub n: u32,
    /// Shares accepted so far in the current unseal attempt.
    pub progress: u32,
}

#[derive(Debug, Clone)]
pub struct VaultClient {
    client: Client,
    base_url: String,
}

impl VaultClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, VaultError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    pub async fn seal_status(&self) -> Result<SealStatus, VaultError> {
        let resp = self.client.get(self.url("sys/seal-status")).send().await?;
        let status: SealStatus = Self::check(resp).await?.json().await?;
        debug!(sealed = status.sealed, progress = status.progress, "seal status");
        Ok(status)
    }

    /// Submit one unseal share; returns the resulting seal status.
    pub async fn unseal(&self, share: &str) -> Result<SealStatus, VaultError> {
        let resp = self
            .client
            .put(self.url("sys/unseal"))
            .json(&json!({ "key": share }))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Seal the backend. Requires a token with seal capability.
    pub async fn seal(&self, token: &str) -> Result<(), VaultError> {
        let resp = self
            .client
            .put(self.url("sys/seal"))
            .header("X-Vault-Token", token)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Exchange AppRole credentials for a client token.
    pub async fn approle_login(
        &self,
        role_id: &str,
        secret_id: &SecretString,
    ) -> Result<SecretString, VaultError> {
        let resp = self
            .client
            .post(self.url("auth/approle/login"))
            .json(&json!({
                "role_id": role_id,
                "secret_id": secret_id.expose_secret(),
            }))
            .send()
            .await?;
        let body: Value = Self::check(resp).await?.json().await?;
        let token = body
            .get("auth")
            .and_then(|auth| auth.get("client_token"))
            .and_then(|token| token.as_str())
            .ok_or_else(|| VaultError::Malformed {
                path: "auth/approle/login".to_string(),
                reason: "missing auth.client_token".to_string(),
            })?;
        Ok(SecretString::from(token.to_string()))
    }

    /// Read a logical path, unwrapping the KV-v2 `data.data` envelope when
    /// present.
    pub async fn read_secret(&self, token: &str, path: &str) -> Result<Value, VaultError> {
        let resp = self
            .client
            .get(self.url(path))
            .header("X-Vault-Token", token)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(VaultError::NoSecret {
                path: path.to_string(),
            });
        }
        let body: Value = Self::check(resp).await?.json().await?;
        let data = body.get("data").cloned().ok_or_else(|| VaultError::NoSecret {
            path: path.to_string(),
        })?;
        match data.get("data") {
            Some(inner) if inner.is_object() => Ok(inner.clone()),
            _ => Ok(data),
        }
    }

    async fn check(resp: Response) -> Result<Response, VaultError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(VaultError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::testutil::FakeVault;

    #[tokio::test]
    async fn test_seal_status_decodes_fields() {
        let vault = FakeVault::new(true, 3, 5);
        let client = VaultClient::new(vault.clone().serve().await).unwrap();

        let status = client.seal_status().await.unwrap();
        assert!(status.sealed);
        assert_eq!(status.t, 3);
        assert_eq!(status.n, 5);
        assert_eq!(status.progress, 0);
    }

    #[tokio::test]
    async fn test_unseal_submits_share_and_tracks_progress() {
        let vault = FakeVault::new(true, 2, 3);
        let client = VaultClient::new(vault.clone().serve().await).unwrap();

        let status = client.unseal("share-one").await.unwrap();
        assert!(status.sealed);
        assert_eq!(status.progress, 1);

        let status = client.unseal("share-two").await.unwrap();
        assert!(!status.sealed);

        let submitted = vault.state.lock().unwrap().submitted.clone();
        assert_eq!(submitted, vec!["share-one", "share-two"]);
    }

    #[tokio::test]
    async fn test_seal_flips_backend_to_sealed() {
        let vault = FakeVault::unsealed();
        let client = VaultClient::new(vault.clone().serve().await).unwrap();

        client.seal("root-token").await.unwrap();
        assert!(client.seal_status().await.unwrap().sealed);
    }

    #[tokio::test]
    async fn test_approle_login_extracts_token() {
        let vault = FakeVault::unsealed();
        let client = VaultClient::new(vault.clone().serve().await).unwrap();

        let token = client
            .approle_login("role", &SecretString::from("secret"))
            .await
            .unwrap();
        assert_eq!(token.expose_secret(), "approle-token");
    }

    #[tokio::test]
    async fn test_read_secret_plain_data() {
        let vault = FakeVault::unsealed();
        vault.add_secret("config/myhost", json!({"home": "/home/me"}));
        let client = VaultClient::new(vault.clone().serve().await).unwrap();

        let value = client.read_secret("tok", "config/myhost").await.unwrap();
        assert_eq!(value["home"], "/home/me");
    }

    #[tokio::test]
    async fn test_read_secret_unwraps_kv2_envelope() {
        let vault = FakeVault::unsealed();
        vault.add_secret("restic/data/home", json!({"data": {"repo": "s3:bucket"}}));
        let client = VaultClient::new(vault.clone().serve().await).unwrap();

        let value = client.read_secret("tok", "restic/data/home").await.unwrap();
        assert_eq!(value["repo"], "s3:bucket");
    }

    #[tokio::test]
    async fn test_read_secret_missing_is_no_secret() {
        let vault = FakeVault::unsealed();
        let client = VaultClient::new(vault.clone().serve().await).unwrap();

        let err = client.read_secret("tok", "config/ghost").await.unwrap_err();
        assert!(matches!(err, VaultError::NoSecret { path } if path == "config/ghost"));
    }
}
