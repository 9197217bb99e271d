//! Error taxonomy for token custody.
//!
//! Every failure a caller can observe is one of the [`VaultError`] variants.
//! Missing, unreadable, expired-without-refresh and failed-refresh credentials
//! are distinct variants so callers must handle each case explicitly.

use thiserror::Error;

/// Failures produced by the blob codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Authentication tag mismatch: tampering, wrong key, or corruption.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// The blob layout is malformed (empty, truncated, unknown format).
    #[error("malformed blob: {0}")]
    Decode(String),

    /// The blob is encrypted but the store was opened without a key.
    #[error("blob is encrypted but no encryption key is configured")]
    KeyRequired,

    /// Serialization or cipher setup failed while encoding.
    #[error("encoding failed: {0}")]
    Encrypt(String),
}

/// Failures reported by a token endpoint collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// The provider refused the grant (e.g. `invalid_grant`). Retrying with the
    /// same refresh token will not succeed.
    #[error("provider rejected the grant: {0}")]
    Rejected(String),

    /// The provider refused the request for a reason other than the grant
    /// (e.g. `invalid_client`). The grant itself may still be valid.
    #[error("provider refused the request: {0}")]
    Refused(String),

    /// Network failure or a provider-side error that may be transient.
    #[error("token endpoint unreachable: {0}")]
    Transport(String),

    /// The provider answered with a body we could not use.
    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    /// No provider is configured for the identifier.
    #[error("no OAuth provider configured for '{0}'")]
    UnknownProvider(String),
}

/// Errors returned by the store, the refresh coordinator and the OAuth handler.
#[derive(Debug, Error)]
pub enum VaultError {
    /// No record exists for the identifier; run an authorization flow.
    #[error("no credentials stored for '{identifier}'")]
    NotFound { identifier: String },

    /// The persisted entry failed authentication (tampered, corrupted, or wrong key).
    #[error("credentials for '{identifier}' failed integrity check: {reason}")]
    Integrity { identifier: String, reason: String },

    /// The persisted entry could not be parsed.
    #[error("credentials for '{identifier}' are unreadable: {reason}")]
    Decode { identifier: String, reason: String },

    /// Key material is missing or malformed.
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    /// The access token expired and there is no usable refresh token.
    #[error("credentials for '{identifier}' expired and require re-authorization")]
    ReauthorizationRequired { identifier: String },

    /// The renewal call failed; the previous record is untouched.
    #[error("token refresh for '{identifier}' failed: {source}")]
    RefreshFailed {
        identifier: String,
        #[source]
        source: EndpointError,
    },

    /// The authorization-code exchange failed.
    #[error("authorization for '{identifier}' failed: {source}")]
    Authorization {
        identifier: String,
        #[source]
        source: EndpointError,
    },

    /// A record violates the data model invariants.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Durable storage I/O failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// OAuth state parameter is unknown, expired, or already used.
    #[error("invalid or expired OAuth state")]
    InvalidState,

    /// No provider configuration matches the identifier.
    #[error("no OAuth provider configured for '{0}'")]
    UnknownProvider(String),

    /// Configuration is incomplete or contradictory.
    #[error("configuration error: {0}")]
    Config(String),
}

impl VaultError {
    /// Lifts a codec failure into the store taxonomy for `identifier`.
    pub fn from_codec(identifier: &str, err: CodecError) -> Self {
        let identifier = identifier.to_string();
        match err {
            CodecError::Integrity(reason) => VaultError::Integrity { identifier, reason },
            CodecError::Decode(reason) => VaultError::Decode { identifier, reason },
            CodecError::KeyRequired => VaultError::InvalidKey(format!(
                "credentials for '{}' are encrypted but no key is configured",
                identifier
            )),
            CodecError::Encrypt(reason) => VaultError::Storage(reason),
        }
    }

    /// True when retrying the same operation later may succeed without
    /// operator or user intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            VaultError::RefreshFailed { source, .. } => {
                !matches!(source, EndpointError::Rejected(_) | EndpointError::Refused(_))
            }
            VaultError::Storage(_) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for VaultError {
    fn from(error: std::io::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
