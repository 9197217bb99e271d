//! Expiry tracking and single-flight token renewal.
//!
//! ```text
//! ensure_fresh("alice:github")
//!     │
//!     ├─ store.get ── Fresh ───────────────────────────────► record
//!     │            └─ no refresh token ──► ReauthorizationRequired
//!     │
//!     └─ NeedsRefresh
//!          │  per-identifier lock (waiters queue here)
//!          ▼
//!        spawned task: re-read ── renewed by someone else? ─► record
//!                           └─ endpoint.refresh ─► store.put ─► record
//! ```
//!
//! The renewal task owns the lock guard, so a caller that stops waiting
//! never cancels a renewal halfway between the provider call and the write.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::credentials::{Freshness, TokenRecord, TokenStore};
use crate::error::{EndpointError, Result, VaultError};
use crate::oauth::TokenEndpoint;


/// Default margin before expiry at which a token is renewed (seconds)
pub const DEFAULT_SKEW_SECONDS: i64 = 90;

/// What a renewal task should do once it holds the lock.
enum Renewal {
    /// Renew only if the record still needs it.
    IfStale,
    /// Renew unless the access token already changed from `seen`.
    Force { seen: String },
}

/// Serves records that are valid for at least the skew window, renewing
/// them through the token endpoint when they are not.
pub struct RefreshCoordinator {
    store: Arc<TokenStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    skew: chrono::Duration,
    /// Per-identifier renewal locks; idle entries are dropped after use
    flights: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<TokenStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        skew: chrono::Duration,
    ) -> Self {
        Self {
            store,
            endpoint,
            skew,
            flights: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn skew(&self) -> chrono::Duration {
        self.skew
    }

    /// Returns a record whose access token is valid beyond `now + skew`.
    ///
    /// # Returns
    /// * `Ok(TokenRecord)` - Unchanged if still fresh, otherwise renewed and persisted
    /// * `Err(VaultError::NotFound)` - Nothing stored
    /// * `Err(VaultError::ReauthorizationRequired)` - Expired and no refresh token
    /// * `Err(VaultError::RefreshFailed)` - Renewal failed; stored record untouched
    pub async fn ensure_fresh(&self, identifier: &str) -> Result<TokenRecord> {
        let record = self.store.get(identifier)?;

        match record.freshness_at(Utc::now(), self.skew) {
            Freshness::Fresh => Ok(record),
            Freshness::ReauthorizationRequired => {
                debug!(identifier = %identifier, "Token expired without refresh token");
                Err(VaultError::ReauthorizationRequired {
                    identifier: identifier.to_string(),
                })
            }
            Freshness::NeedsRefresh => self.renew(identifier, Renewal::IfStale).await,
        }
    }

    /// Renews regardless of expiry, e.g. after an API call answered 401.
    ///
    /// Concurrent forced renewals of the same token collapse into one.
    pub async fn refresh_now(&self, identifier: &str) -> Result<TokenRecord> {
        let record = self.store.get(identifier)?;
        if !record.has_refresh_token() {
            return Err(VaultError::ReauthorizationRequired {
                identifier: identifier.to_string(),
            });
        }

        self.renew(
            identifier,
            Renewal::Force {
                seen: record.access_token,
            },
        )
        .await
    }

    /// Persists a newly authorized record.
    ///
    /// Waits for any in-flight renewal of the same identifier so the renewal
    /// cannot overwrite the new grant afterwards.
    pub async fn install(&self, record: &TokenRecord) -> Result<()> {
        let guard = self.flight_lock(&record.identifier).lock_owned().await;
        let result = self.store.put(record);
        drop(guard);
        prune_flight(&self.flights, &record.identifier);
        result
    }

    /// Deletes the record once no renewal of it is in flight.
    pub async fn revoke(&self, identifier: &str) -> Result<bool> {
        let guard = self.flight_lock(identifier).lock_owned().await;
        let result = self.store.delete(identifier);
        drop(guard);
        prune_flight(&self.flights, identifier);
        result
    }

    /// Deletes every stored record once the renewals in flight have landed.
    ///
    /// Renewals that start after the reset began are not waited for.
    pub async fn reset(&self) -> Result<()> {
        let mut identifiers: Vec<String> =
            self.flights.iter().map(|entry| entry.key().clone()).collect();
        // Fixed order so concurrent resets cannot deadlock
        identifiers.sort();

        let mut guards = Vec::with_capacity(identifiers.len());
        for identifier in &identifiers {
            guards.push(self.flight_lock(identifier).lock_owned().await);
        }

        let result = self.store.reset();
        drop(guards);
        for identifier in &identifiers {
            prune_flight(&self.flights, identifier);
        }
        result
    }

    fn flight_lock(&self, identifier: &str) -> Arc<Mutex<()>> {
        self.flights
            .entry(identifier.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn renew(&self, identifier: &str, renewal: Renewal) -> Result<TokenRecord> {
        let guard = self.flight_lock(identifier).lock_owned().await;

        let store = Arc::clone(&self.store);
        let endpoint = Arc::clone(&self.endpoint);
        let flights = Arc::clone(&self.flights);
        let skew = self.skew;
        let owned_identifier = identifier.to_string();

        let task = tokio::spawn(async move {
            let result =
                renew_locked(&store, endpoint.as_ref(), &owned_identifier, skew, renewal).await;
            drop(guard);
            prune_flight(&flights, &owned_identifier);
            result
        });

        task.await.map_err(|e| VaultError::RefreshFailed {
            identifier: identifier.to_string(),
            source: EndpointError::Transport(format!("renewal task aborted: {}", e)),
        })?
    }
}

/// Drops the lock entry for `identifier` unless someone else holds or awaits it.
fn prune_flight(flights: &DashMap<String, Arc<Mutex<()>>>, identifier: &str) {
    flights.remove_if(identifier, |_, lock| Arc::strong_count(lock) == 1);
}

/// Runs with the identifier's flight lock held.
async fn renew_locked(
    store: &TokenStore,
    endpoint: &dyn TokenEndpoint,
    identifier: &str,
    skew: chrono::Duration,
    renewal: Renewal,
) -> Result<TokenRecord> {
    // Whoever held the lock before us, or another process, may already have renewed
    let current = store.get_durable(identifier)?;
    match renewal {
        Renewal::IfStale => match current.freshness_at(Utc::now(), skew) {
            Freshness::Fresh => {
                debug!(identifier = %identifier, "Token already renewed by another caller");
                return Ok(current);
            }
            Freshness::ReauthorizationRequired => {
                return Err(VaultError::ReauthorizationRequired {
                    identifier: identifier.to_string(),
                })
            }
            Freshness::NeedsRefresh => {}
        },
        Renewal::Force { seen } => {
            if current.access_token != seen {
                debug!(identifier = %identifier, "Token already renewed by another caller");
                return Ok(current);
            }
        }
    }

    let Some(refresh_token) = current.refresh_token.clone().filter(|t| !t.is_empty()) else {
        return Err(VaultError::ReauthorizationRequired {
            identifier: identifier.to_string(),
        });
    };

    info!(identifier = %identifier, "Refreshing OAuth token");

    match endpoint.refresh(identifier, &refresh_token).await {
        Ok(grant) => {
            let renewed = current
                .refreshed(grant, Utc::now())
                .map_err(|e| VaultError::RefreshFailed {
                    identifier: identifier.to_string(),
                    source: EndpointError::InvalidResponse(e.to_string()),
                })?;

            store.put(&renewed).inspect_err(|e| {
                error!(identifier = %identifier, error = %e, "Failed to persist refreshed token");
            })?;

            info!(
                identifier = %identifier,
                expires_at = ?renewed.expires_at,
                rotated = renewed.refresh_token != current.refresh_token,
                "OAuth token refreshed successfully"
            );
            Ok(renewed)
        }
        Err(EndpointError::Rejected(reason)) => {
            warn!(
                identifier = %identifier,
                reason = %reason,
                "Provider rejected refresh token; re-authorization required"
            );
            // Only clear the token that was rejected, never a grant written meanwhile
            match store.get_durable(identifier) {
                Ok(latest) if latest.refresh_token.as_deref() != Some(refresh_token.as_str()) => {
                    info!(
                        identifier = %identifier,
                        "Rejected refresh token was superseded by another writer"
                    );
                    if latest.freshness_at(Utc::now(), skew) == Freshness::Fresh {
                        return Ok(latest);
                    }
                    return Err(VaultError::RefreshFailed {
                        identifier: identifier.to_string(),
                        source: EndpointError::Transport(
                            "refresh token changed during renewal".to_string(),
                        ),
                    });
                }
                Ok(latest) => {
                    // Later calls report ReauthorizationRequired instead of retrying a dead token
                    if let Err(e) = store.put(&latest.without_refresh_token()) {
                        error!(
                            identifier = %identifier,
                            error = %e,
                            "Failed to revoke rejected refresh token"
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        identifier = %identifier,
                        error = %e,
                        "Could not re-read record after rejected refresh"
                    );
                }
            }
            Err(VaultError::RefreshFailed {
                identifier: identifier.to_string(),
                source: EndpointError::Rejected(reason),
            })
        }
        Err(source) => {
            warn!(identifier = %identifier, error = %source, "Token refresh failed");
            Err(VaultError::RefreshFailed {
                identifier: identifier.to_string(),
                source,
            })
        }
    }
}
