//! OAuth 2.0 authorization flow and the token entry point for agents.
//!
//! Implements the authorization code flow:
//! 1. `begin_authorization("alice:github")` → provider URL with a CSRF state
//! 2. User authorizes on the provider's site
//! 3. Provider redirects back with `code` and `state`
//! 4. `complete_callback(state, code)` → exchange code, store encrypted record
//! 5. Agents call `token_for("alice:github")` for a live access token

mod endpoint;
mod exchange;
mod provider;
mod state_manager;

pub use endpoint::TokenEndpoint;
pub use exchange::HttpTokenEndpoint;
pub use provider::{provider_of, ProviderConfig, ProviderRegistry, BUILTIN_PROVIDERS};
pub use state_manager::{run_state_cleanup, StateEntry, StateManager};

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::VaultConfig;
use crate::credentials::{CredentialStatus, TokenRecord, TokenStore};
use crate::error::{Result, VaultError};
use crate::refresh::RefreshCoordinator;

/// Default lifetime of an authorization `state` (seconds)
pub const DEFAULT_STATE_EXPIRY_SECONDS: i64 = 600;

/// Where to send the user, and the state the callback must echo back.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Front door for agents and authorization flows.
pub struct OAuthHandler {
    store: Arc<TokenStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    coordinator: RefreshCoordinator,
    providers: Arc<ProviderRegistry>,
    states: StateManager,
}

impl OAuthHandler {
    pub fn new(
        store: Arc<TokenStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        skew: chrono::Duration,
    ) -> Self {
        let coordinator = RefreshCoordinator::new(Arc::clone(&store), Arc::clone(&endpoint), skew);
        Self {
            store,
            endpoint,
            coordinator,
            providers: Arc::new(ProviderRegistry::new()),
            states: StateManager::new(DEFAULT_STATE_EXPIRY_SECONDS),
        }
    }

    /// Providers used to build authorization URLs.
    pub fn with_providers(mut self, providers: Arc<ProviderRegistry>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_state_expiry(mut self, expiry_seconds: i64) -> Self {
        self.states = StateManager::new(expiry_seconds);
        self
    }

    /// Wires the store, provider registry and HTTP endpoint from configuration.
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        let store = Arc::new(config.open_store()?);
        let providers = Arc::new(ProviderRegistry::from_config(config));
        let endpoint = HttpTokenEndpoint::new(Arc::clone(&providers), config.refresh.http_timeout())
            .map_err(|e| VaultError::Config(e.to_string()))?;

        Ok(Self::new(store, Arc::new(endpoint), config.refresh.skew())
            .with_providers(providers)
            .with_state_expiry(config.oauth.state_expiry_seconds))
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Shared handle for [`run_state_cleanup`].
    pub fn state_manager(&self) -> StateManager {
        self.states.clone()
    }

    /// Starts an authorization flow for `identifier`.
    ///
    /// The returned state is single-use and expires after the configured window.
    pub fn begin_authorization(&self, identifier: &str) -> Result<AuthorizationRequest> {
        let provider = self
            .providers
            .for_identifier(identifier)
            .ok_or_else(|| VaultError::UnknownProvider(provider_of(identifier).to_string()))?;

        let state = self.states.create_state(identifier);
        let url = provider.build_auth_url(&state);

        info!(identifier = %identifier, provider = %provider.name, "Authorization flow started");
        Ok(AuthorizationRequest { url, state })
    }

    /// Handles the provider redirect: validates the CSRF state, then completes
    /// the authorization for the identifier the state was issued to.
    pub async fn complete_callback(&self, state: &str, code: &str) -> Result<TokenRecord> {
        let entry = self.states.validate_and_consume(state).ok_or_else(|| {
            warn!("Invalid or expired OAuth state");
            VaultError::InvalidState
        })?;

        debug!(identifier = %entry.identifier, "CSRF state validated");
        self.complete_authorization(&entry.identifier, code).await
    }

    /// Exchanges `code` and stores the resulting record, replacing any
    /// previous one for `identifier`.
    pub async fn complete_authorization(
        &self,
        identifier: &str,
        code: &str,
    ) -> Result<TokenRecord> {
        if identifier.trim().is_empty() {
            return Err(VaultError::InvalidRecord(
                "identifier must not be empty".to_string(),
            ));
        }

        let grant = self
            .endpoint
            .exchange_code(identifier, code)
            .await
            .map_err(|source| {
                warn!(identifier = %identifier, error = %source, "Token exchange failed");
                VaultError::Authorization {
                    identifier: identifier.to_string(),
                    source,
                }
            })?;

        let record = TokenRecord::from_grant(identifier, grant, Utc::now())?;
        self.coordinator.install(&record).await?;

        info!(
            identifier = %identifier,
            has_refresh_token = record.has_refresh_token(),
            expires_at = ?record.expires_at,
            "OAuth flow completed successfully"
        );
        Ok(record)
    }

    /// A live access token for `identifier`, renewed first if needed.
    pub async fn token_for(&self, identifier: &str) -> Result<String> {
        let record = self.coordinator.ensure_fresh(identifier).await?;
        Ok(record.access_token)
    }

    /// Forgets the credentials for `identifier`. Idempotent.
    pub async fn revoke(&self, identifier: &str) -> Result<bool> {
        self.coordinator.revoke(identifier).await
    }

    /// Forgets every stored credential.
    pub async fn reset(&self) -> Result<()> {
        self.coordinator.reset().await
    }

    pub fn status(&self, identifier: &str) -> Result<CredentialStatus> {
        self.store.status(identifier, self.coordinator.skew())
    }
}
