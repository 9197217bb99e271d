//! Encrypted OAuth token custody for agent processes.
//!
//! - [`credentials`]: encrypted, concurrency-safe token storage
//! - [`refresh`]: expiry tracking and single-flight renewal
//! - [`oauth`]: authorization flow and the `token_for` entry point
//! - [`config`]: TOML configuration with environment overrides

// Configuration loading
pub mod config;

// Encrypted token storage
pub mod credentials;

// Error taxonomy
pub mod error;

// Authorization flow and token endpoint
pub mod oauth;

// Token renewal
pub mod refresh;

pub use config::{load_config, VaultConfig};
pub use credentials::{CredentialStatus, Freshness, TokenGrant, TokenRecord, TokenStore};
pub use error::{CodecError, EndpointError, Result, VaultError};
pub use oauth::{AuthorizationRequest, OAuthHandler, TokenEndpoint};
pub use refresh::RefreshCoordinator;
