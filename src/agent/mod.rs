//! Shared agent state and the layers built on it.
//!
//! [`AgentState`] bundles what both the scheduler and the control surface
//! need: configuration, the store handle (when one opened at startup), the
//! job registry, and the secrets backend client.

pub mod actions;
pub mod scheduler;

use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::info;

use crate::config::AgentConfig;
use crate::error::{AuthError, StoreError};
use crate::jobs::JobRegistry;
use crate::store::Store;
use crate::vault::VaultClient;
use crate::vault::unseal::UnsealCoordinator;

pub struct AgentState {
    config: AgentConfig,
    store: Option<Arc<Store>>,
    registry: JobRegistry,
    vault: VaultClient,
    hostname: String,
}

impl AgentState {
    pub fn new(
        config: AgentConfig,
        store: Option<Arc<Store>>,
        registry: JobRegistry,
        vault: VaultClient,
        hostname: String,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            vault,
            hostname,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The store, or [`StoreError::NotInitialized`] when none opened at
    /// startup.
    pub fn store(&self) -> Result<&Arc<Store>, StoreError> {
        self.store.as_ref().ok_or(StoreError::NotInitialized)
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn vault(&self) -> &VaultClient {
        &self.vault
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn unseal_coordinator(&self) -> Result<UnsealCoordinator, StoreError> {
        Ok(UnsealCoordinator::new(
            Arc::clone(self.store()?),
            self.vault.clone(),
        ))
    }

    /// Resolve the token used against the backend: the stored token when one
    /// exists, otherwise an AppRole login whose token is persisted for next
    /// time.
    pub async fn authorize(&self) -> Result<String, AuthError> {
        let store = self.store()?;
        if let Some(token) = store.token().await? {
            return Ok(token);
        }
        let Some(approle) = &self.config.approle else {
            return Err(AuthError::NoToken);
        };

        info!("no stored token, logging in via approle");
        let token = self
            .vault
            .approle_login(&approle.role_id, &approle.secret_id)
            .await
            .map_err(|e| AuthError::LoginFailed {
                reason: e.to_string(),
            })?;
        let token = token.expose_secret().to_string();
        store.put_token(&token).await?;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use secrecy::SecretString;

    use super::*;
    use crate::config::AppRole;
    use crate::testutil::{FakeVault, RecordingRunner, test_config};

    async fn state(
        vault: Arc<FakeVault>,
        store: Option<Store>,
        approle: Option<AppRole>,
    ) -> AgentState {
        let base = vault.serve().await;
        let mut config = test_config(&base);
        config.approle = approle;
        AgentState::new(
            config,
            store.map(Arc::new),
            JobRegistry::new(Arc::new(RecordingRunner::new())),
            VaultClient::new(base).unwrap(),
            "testhost".to_string(),
        )
    }

    #[tokio::test]
    async fn test_store_accessor_without_store() {
        let state = state(FakeVault::unsealed(), None, None).await;
        assert!(matches!(state.store(), Err(StoreError::NotInitialized)));
        assert!(matches!(
            state.unseal_coordinator(),
            Err(StoreError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_authorize_prefers_stored_token() {
        let store = Store::open_in_memory().unwrap();
        store.put_token("stored").await.unwrap();
        let state = state(FakeVault::unsealed(), Some(store), None).await;

        assert_eq!(state.authorize().await.unwrap(), "stored");
    }

    #[tokio::test]
    async fn test_authorize_without_credentials_is_no_token() {
        let store = Store::open_in_memory().unwrap();
        let state = state(FakeVault::unsealed(), Some(store), None).await;

        assert!(matches!(state.authorize().await, Err(AuthError::NoToken)));
    }

    #[tokio::test]
    async fn test_authorize_falls_back_to_approle_and_persists() {
        let store = Store::open_in_memory().unwrap();
        let approle = AppRole {
            role_id: "role".to_string(),
            secret_id: SecretString::from("secret"),
        };
        let state = state(FakeVault::unsealed(), Some(store), Some(approle)).await;

        assert_eq!(state.authorize().await.unwrap(), "approle-token");
        assert_eq!(
            state.store().unwrap().token().await.unwrap(),
            Some("approle-token".to_string())
        );
    }
}
