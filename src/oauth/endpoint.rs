//! The token endpoint collaborator seam.

use async_trait::async_trait;

use crate::credentials::TokenGrant;
use crate::error::EndpointError;

/// Talks to a provider's token endpoint.
///
/// The store and coordinator only see finished [`TokenGrant`]s; how they are
/// obtained (HTTP, a test fake, an in-house broker) is up to the implementor.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchanges an authorization code for a grant.
    async fn exchange_code(&self, identifier: &str, code: &str)
        -> Result<TokenGrant, EndpointError>;

    /// Mints a new access token from `refresh_token`.
    ///
    /// Returns [`EndpointError::Rejected`] only when the provider refuses the
    /// refresh token itself. Client or request problems are
    /// [`EndpointError::Refused`].
    async fn refresh(&self, identifier: &str, refresh_token: &str)
        -> Result<TokenGrant, EndpointError>;
}
