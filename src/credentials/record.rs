//! Token record data model and lifecycle helpers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, VaultError};

/// Token type assumed when a provider omits `token_type`.
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// One credential set, keyed by `identifier`.
///
/// # Security
/// - `Debug` output redacts both secrets
/// - Only the store serializes this type, and only into an encrypted blob
///   (unless the store was explicitly opened unencrypted)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Lookup key (e.g. "github" or "alice:github"). Never empty.
    pub identifier: String,

    /// Bearer secret used for API calls
    pub access_token: String,

    /// Used to mint a new access token without re-authorizing
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Usually "Bearer"
    pub token_type: String,

    /// When the access token expires (UTC). `None` means no known expiry.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Space-delimited granted permissions (informational)
    #[serde(default)]
    pub scope: String,

    /// When the current access token was issued
    pub issued_at: DateTime<Utc>,
}

/// Whether a record can be served as-is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// No expiry, or expiry beyond the skew buffer.
    Fresh,
    /// Expired (or inside the skew buffer) with a refresh token available.
    NeedsRefresh,
    /// Expired with no refresh token. Terminal until a new authorization.
    ReauthorizationRequired,
}

impl TokenRecord {
    /// Builds a record from a freshly issued grant.
    ///
    /// Fails with [`VaultError::InvalidRecord`] if the grant is malformed.
    pub fn from_grant(identifier: &str, grant: TokenGrant, now: DateTime<Utc>) -> Result<Self> {
        let expires_at = grant.expires_at(now)?;
        let record = Self {
            identifier: identifier.to_string(),
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.filter(|t| !t.is_empty()),
            token_type: grant
                .token_type
                .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string()),
            expires_at,
            scope: grant.scope.unwrap_or_default(),
            issued_at: now,
        };
        record.validate()?;
        Ok(record)
    }

    /// Applies a refresh grant on top of this record.
    ///
    /// A refresh token returned by the provider replaces the current one; if the
    /// provider did not rotate it, the existing refresh token is kept. Token type
    /// and scope are carried over when the provider omits them.
    pub fn refreshed(&self, grant: TokenGrant, now: DateTime<Utc>) -> Result<Self> {
        let expires_at = grant.expires_at(now)?;
        let refresh_token = grant
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| self.refresh_token.clone());

        let record = Self {
            identifier: self.identifier.clone(),
            access_token: grant.access_token,
            refresh_token,
            token_type: grant
                .token_type
                .unwrap_or_else(|| self.token_type.clone()),
            expires_at,
            scope: grant.scope.unwrap_or_else(|| self.scope.clone()),
            issued_at: now,
        };
        record.validate()?;
        Ok(record)
    }

    /// Returns a copy with the refresh path revoked.
    pub fn without_refresh_token(&self) -> Self {
        Self {
            refresh_token: None,
            ..self.clone()
        }
    }

    /// Checks the data model invariants.
    pub fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(VaultError::InvalidRecord(
                "identifier must not be empty".to_string(),
            ));
        }
        if self.access_token.is_empty() {
            return Err(VaultError::InvalidRecord(format!(
                "access_token for '{}' must not be empty",
                self.identifier
            )));
        }
        if self.token_type.trim().is_empty() {
            return Err(VaultError::InvalidRecord(format!(
                "token_type for '{}' must not be empty",
                self.identifier
            )));
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at <= self.issued_at {
                return Err(VaultError::InvalidRecord(format!(
                    "expires_at for '{}' must be after issued_at",
                    self.identifier
                )));
            }
        }
        Ok(())
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token
            .as_deref()
            .map(|t| !t.is_empty())
            .unwrap_or(false)
    }

    /// Classifies the record at `now`.
    ///
    /// A token expiring at or before `now + skew` is treated as expired so it
    /// is not handed out moments before the API call that would use it.
    pub fn freshness_at(&self, now: DateTime<Utc>, skew: Duration) -> Freshness {
        match self.expires_at {
            // A skew past the end of time means everything is due
            Some(expires_at)
                if now
                    .checked_add_signed(skew)
                    .map_or(true, |deadline| expires_at <= deadline) =>
            {
                if self.has_refresh_token() {
                    Freshness::NeedsRefresh
                } else {
                    Freshness::ReauthorizationRequired
                }
            }
            _ => Freshness::Fresh,
        }
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("identifier", &self.identifier)
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Token endpoint response (standard OAuth 2.0 fields).
///
/// Returned by both the authorization-code exchange and the refresh grant.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenGrant {
    /// Minimal grant with only an access token.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: None,
            expires_in: None,
            scope: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expires_in(mut self, seconds: i64) -> Self {
        self.expires_in = Some(seconds);
        self
    }

    fn expires_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self.expires_in {
            Some(seconds) if seconds <= 0 => Err(VaultError::InvalidRecord(format!(
                "expires_in must be positive, got {}",
                seconds
            ))),
            Some(seconds) => Duration::try_seconds(seconds)
                .and_then(|lifetime| now.checked_add_signed(lifetime))
                .map(Some)
                .ok_or_else(|| {
                    VaultError::InvalidRecord(format!("expires_in out of range: {}", seconds))
                }),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}
