//! HTTP token endpoint.
//!
//! Exchanges authorization codes and refresh tokens at the provider's token
//! URL using a form-encoded POST (RFC 6749 §4.1.3 and §6).

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::endpoint::TokenEndpoint;
use super::provider::{provider_of, ProviderConfig, ProviderRegistry};
use crate::credentials::TokenGrant;
use crate::error::EndpointError;

/// Error codes meaning the code or refresh token itself is dead.
/// GitHub uses its own names for these.
const DEAD_GRANT_ERRORS: &[&str] = &[
    "invalid_grant",
    "bad_refresh_token",
    "bad_verification_code",
];

/// OAuth error body (RFC 6749 §5.2)
#[derive(Deserialize, Debug)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl ErrorResponse {
    fn into_endpoint_error(self, context: String) -> EndpointError {
        let detail = format!("{}{}", context, self.describe());
        if DEAD_GRANT_ERRORS.contains(&self.error.as_str()) {
            EndpointError::Rejected(detail)
        } else {
            EndpointError::Refused(detail)
        }
    }

    fn describe(&self) -> String {
        match &self.error_description {
            Some(description) => format!("{}: {}", self.error, description),
            None => self.error.clone(),
        }
    }
}

/// [`TokenEndpoint`] backed by real provider token URLs.
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    providers: Arc<ProviderRegistry>,
}

impl HttpTokenEndpoint {
    pub fn new(providers: Arc<ProviderRegistry>, timeout: Duration) -> Result<Self, EndpointError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EndpointError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, providers })
    }

    fn provider(&self, identifier: &str) -> Result<&ProviderConfig, EndpointError> {
        self.providers
            .for_identifier(identifier)
            .ok_or_else(|| EndpointError::UnknownProvider(provider_of(identifier).to_string()))
    }

    async fn request_grant<'a>(
        &self,
        provider: &'a ProviderConfig,
        mut form: Vec<(&'a str, &'a str)>,
    ) -> Result<TokenGrant, EndpointError> {
        form.push(("client_id", provider.client_id.as_str()));
        if let Some(secret) = &provider.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .client
            .post(&provider.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| EndpointError::Transport(format!("failed to send token request: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| {
                EndpointError::Transport(format!("failed to read token response: {}", e))
            })?;

        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }

        // Some providers (GitHub) answer 200 with an error body
        if let Ok(error) = serde_json::from_str::<ErrorResponse>(&body) {
            return Err(error.into_endpoint_error(String::new()));
        }

        let grant: TokenGrant = serde_json::from_str(&body)
            .map_err(|e| {
                EndpointError::InvalidResponse(format!("failed to parse token response: {}", e))
            })?;
        if grant.access_token.is_empty() {
            return Err(EndpointError::InvalidResponse(
                "token response has an empty access_token".to_string(),
            ));
        }

        debug!(
            provider = %provider.name,
            has_refresh_token = grant.refresh_token.is_some(),
            expires_in = ?grant.expires_in,
            "Token request successful"
        );
        Ok(grant)
    }
}

/// Maps a non-2xx answer to an endpoint error.
///
/// Only a dead grant is [`EndpointError::Rejected`]. Other 400/401 answers
/// (`invalid_client`, `invalid_request`, ...) are [`EndpointError::Refused`]
/// and leave the stored refresh token alone; 5xx and the rest may be transient.
fn classify_failure(status: StatusCode, body: &str) -> EndpointError {
    let context = format!("status {}: ", status);
    let parsed = serde_json::from_str::<ErrorResponse>(body);

    match (status, parsed) {
        (StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED, Ok(error)) => {
            let err = error.into_endpoint_error(context);
            if matches!(err, EndpointError::Refused(_)) {
                warn!(status = %status, error = %err, "Token endpoint refused the request");
            }
            err
        }
        (StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED, Err(_)) => {
            warn!(status = %status, "Token endpoint refused the request without an OAuth error");
            EndpointError::Refused(format!("{}{}", context, truncate(body)))
        }
        (_, parsed) => {
            warn!(status = %status, "Token endpoint returned an error");
            let detail = parsed.map(|e| e.describe()).unwrap_or_else(|_| truncate(body));
            EndpointError::Transport(format!("{}{}", context, detail))
        }
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn exchange_code(
        &self,
        identifier: &str,
        code: &str,
    ) -> Result<TokenGrant, EndpointError> {
        let provider = self.provider(identifier)?;
        debug!(
            identifier = %identifier,
            token_url = %provider.token_url,
            "Exchanging authorization code"
        );

        let form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", provider.redirect_uri.as_str()),
        ];
        self.request_grant(provider, form).await
    }

    async fn refresh(
        &self,
        identifier: &str,
        refresh_token: &str,
    ) -> Result<TokenGrant, EndpointError> {
        let provider = self.provider(identifier)?;
        debug!(
            identifier = %identifier,
            token_url = %provider.token_url,
            "Refreshing access token"
        );

        let form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.request_grant(provider, form).await
    }
}
