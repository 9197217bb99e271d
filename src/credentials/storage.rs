//! Encrypted token storage with an in-memory read cache.
//!
//! Each identifier is persisted as one envelope:
//!
//! ```json
//! { "identifier": "alice:github", "format": 1, "blob": "<base64>", "written_at": "..." }
//! ```
//!
//! `blob` is the codec output (format byte, nonce, ciphertext and tag). No
//! secret appears outside it when the store is keyed.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::backend::StorageBackend;
use super::codec::BlobCodec;
use super::keys::{KeyManager, KeyMaterial};
use super::record::{Freshness, TokenRecord};
use crate::error::{Result, VaultError};


/// Default time a cached record is served before re-reading durable storage
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Persisted form of one record.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    identifier: String,
    format: u8,
    blob: String,
    written_at: DateTime<Utc>,
}

/// Store-level report for one identifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CredentialStatus {
    /// Nothing persisted for the identifier.
    Missing,
    /// An entry exists but cannot be decoded or authenticated.
    Unreadable { reason: String },
    /// A readable record exists.
    Present {
        freshness: Freshness,
        expires_at: Option<DateTime<Utc>>,
    },
}

struct CachedRecord {
    record: TokenRecord,
    loaded_at: Instant,
}

/// Cache slot for one identifier.
///
/// `generation` increases on every committed write or delete. A reader only
/// installs what it loaded if the generation is unchanged since it started,
/// so a slow read never overwrites a newer committed value. Slots are kept
/// (with `cached: None`) after deletes for the same reason, so the cache holds
/// at most one slot per identifier this instance has touched.
struct CacheSlot {
    generation: u64,
    cached: Option<CachedRecord>,
}

/// Durable, concurrency-safe token storage.
///
/// # Concurrency
/// - `get` never blocks on other readers
/// - `put`/`delete` on one identifier are serialized by a per-identifier lock
/// - writes to different identifiers never contend
/// - the cache is updated only after the durable write succeeds
///
/// Writers in other processes are not serialized with this instance; the
/// backend's atomic replace makes that last-writer-wins.
pub struct TokenStore {
    backend: Box<dyn StorageBackend>,
    codec: BlobCodec,
    cache: DashMap<String, CacheSlot>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
    cache_ttl: Duration,
}

impl TokenStore {
    /// Creates a store over `backend` using `codec` for every entry.
    pub fn new(backend: Box<dyn StorageBackend>, codec: BlobCodec) -> Self {
        if codec.is_encrypted() {
            info!("Token store opened with AES-256-GCM encryption");
        } else {
            warn!("Token store opened WITHOUT encryption; secrets are stored in plaintext");
        }

        Self {
            backend,
            codec,
            cache: DashMap::new(),
            write_locks: DashMap::new(),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    /// Sets how long a cached record is trusted. `Duration::ZERO` disables the cache.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Provisioning helper; the store never persists the key.
    pub fn generate_encryption_key() -> KeyMaterial {
        KeyManager::generate()
    }

    pub fn is_encrypted(&self) -> bool {
        self.codec.is_encrypted()
    }

    /// Returns the current record for `identifier`, expired or not.
    ///
    /// # Returns
    /// * `Ok(TokenRecord)` - A copy of the stored record
    /// * `Err(VaultError::NotFound)` - Nothing stored
    /// * `Err(VaultError::Integrity | VaultError::Decode)` - Entry exists but is unreadable
    pub fn get(&self, identifier: &str) -> Result<TokenRecord> {
        if let Some(slot) = self.cache.get(identifier) {
            if let Some(cached) = &slot.cached {
                if cached.loaded_at.elapsed() < self.cache_ttl {
                    return Ok(cached.record.clone());
                }
            }
        }
        self.get_durable(identifier)
    }

    /// Like [`get`](Self::get) but always reads durable storage, picking up
    /// writes made by other processes since the cached copy was loaded.
    pub fn get_durable(&self, identifier: &str) -> Result<TokenRecord> {
        let generation = self
            .cache
            .get(identifier)
            .map_or(0, |slot| slot.generation);

        let record = self.load(identifier)?;

        let cached = || CachedRecord {
            record: record.clone(),
            loaded_at: Instant::now(),
        };
        self.cache
            .entry(identifier.to_string())
            .and_modify(|slot| {
                if slot.generation == generation {
                    slot.cached = Some(cached());
                }
            })
            .or_insert_with(|| CacheSlot {
                generation,
                cached: Some(cached()),
            });

        Ok(record)
    }

    /// Validates, seals and durably writes `record`, replacing any previous one.
    ///
    /// On failure the previous durable entry and the cache are untouched.
    pub fn put(&self, record: &TokenRecord) -> Result<()> {
        record.validate()?;
        let identifier = record.identifier.as_str();

        let entry = self.seal_entry(record)?;

        self.with_write_lock(identifier, || {
            self.backend.write(identifier, &entry)?;

            let cached = CachedRecord {
                record: record.clone(),
                loaded_at: Instant::now(),
            };
            let mut slot = self
                .cache
                .entry(identifier.to_string())
                .or_insert_with(|| CacheSlot {
                    generation: 0,
                    cached: None,
                });
            slot.generation += 1;
            slot.cached = Some(cached);
            Ok(())
        })?;

        debug!(identifier = %identifier, "Credentials stored");
        Ok(())
    }

    /// Removes the durable entry and cache entry. Idempotent.
    ///
    /// Returns `Ok(true)` if something was removed.
    pub fn delete(&self, identifier: &str) -> Result<bool> {
        let removed = self.with_write_lock(identifier, || {
            let removed = self.backend.remove(identifier)?;
            self.invalidate(identifier);
            Ok(removed)
        })?;

        if removed {
            info!(identifier = %identifier, "Credentials deleted");
        }
        Ok(removed)
    }

    /// Identifiers with a persisted entry, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        self.backend.list()
    }

    /// Deletes every persisted entry and empties the cache.
    ///
    /// Not serialized with renewals; use `RefreshCoordinator::reset` when a
    /// coordinator shares this store.
    pub fn reset(&self) -> Result<()> {
        self.backend.clear()?;
        for mut slot in self.cache.iter_mut() {
            slot.generation += 1;
            slot.cached = None;
        }
        info!("Token store reset");
        Ok(())
    }

    /// Drops cached records so the next `get` re-reads durable storage.
    pub fn clear_cache(&self) {
        for mut slot in self.cache.iter_mut() {
            slot.cached = None;
        }
    }

    /// Reports whether `identifier` is missing, unreadable, or present.
    ///
    /// Only storage I/O failures are returned as errors.
    pub fn status(&self, identifier: &str, skew: chrono::Duration) -> Result<CredentialStatus> {
        match self.get(identifier) {
            Ok(record) => Ok(CredentialStatus::Present {
                freshness: record.freshness_at(Utc::now(), skew),
                expires_at: record.expires_at,
            }),
            Err(VaultError::NotFound { .. }) => Ok(CredentialStatus::Missing),
            Err(VaultError::Integrity { reason, .. }) | Err(VaultError::Decode { reason, .. }) => {
                Ok(CredentialStatus::Unreadable { reason })
            }
            Err(VaultError::InvalidKey(reason)) => Ok(CredentialStatus::Unreadable { reason }),
            Err(other) => Err(other),
        }
    }

    /// Runs `f` holding the write lock for `identifier`, then drops the lock
    /// entry if nobody else is waiting on it.
    fn with_write_lock<T>(&self, identifier: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self
            .write_locks
            .entry(identifier.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f()
        };

        drop(lock);
        self.write_locks
            .remove_if(identifier, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    fn invalidate(&self, identifier: &str) {
        let mut slot = self
            .cache
            .entry(identifier.to_string())
            .or_insert_with(|| CacheSlot {
                generation: 0,
                cached: None,
            });
        slot.generation += 1;
        slot.cached = None;
    }

    fn load(&self, identifier: &str) -> Result<TokenRecord> {
        let bytes = self
            .backend
            .read(identifier)?
            .ok_or_else(|| VaultError::NotFound {
                identifier: identifier.to_string(),
            })?;

        self.open_entry(identifier, &bytes).inspect_err(|e| {
            warn!(identifier = %identifier, error = %e, "Stored credentials are unreadable");
        })
    }

    fn seal_entry(&self, record: &TokenRecord) -> Result<Vec<u8>> {
        let blob = self
            .codec
            .seal(record)
            .map_err(|e| VaultError::from_codec(&record.identifier, e))?;

        let entry = PersistedEntry {
            identifier: record.identifier.clone(),
            format: self.codec.format(),
            blob: BASE64.encode(&blob),
            written_at: Utc::now(),
        };

        serde_json::to_vec(&entry)
            .map_err(|e| VaultError::Storage(format!("failed to serialize entry: {}", e)))
    }

    fn open_entry(&self, identifier: &str, bytes: &[u8]) -> Result<TokenRecord> {
        let decode_err = |reason: String| VaultError::Decode {
            identifier: identifier.to_string(),
            reason,
        };
        let integrity_err = |reason: String| VaultError::Integrity {
            identifier: identifier.to_string(),
            reason,
        };

        let entry: PersistedEntry = serde_json::from_slice(bytes)
            .map_err(|e| decode_err(format!("entry is not a valid envelope: {}", e)))?;

        if entry.identifier != identifier {
            return Err(integrity_err(format!(
                "entry belongs to '{}'",
                entry.identifier
            )));
        }

        let blob = BASE64
            .decode(&entry.blob)
            .map_err(|e| decode_err(format!("blob is not valid base64: {}", e)))?;

        if let Some(&format) = blob.first() {
            if format != entry.format {
                return Err(integrity_err(
                    "envelope format does not match blob format".to_string(),
                ));
            }
        }

        let record = self
            .codec
            .open(&blob)
            .map_err(|e| VaultError::from_codec(identifier, e))?;

        if record.identifier != identifier {
            return Err(integrity_err(format!(
                "sealed record belongs to '{}'",
                record.identifier
            )));
        }

        Ok(record)
    }
}
