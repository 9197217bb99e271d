//! Encrypted credential storage for OAuth tokens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenStore                         │
//! │  - get / put / delete / list / reset     │
//! │  - read cache, per-identifier write lock │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!     (seal)               (open)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Codec + KeyManager                 │
//! │  - AES-256-GCM, fresh nonce per write    │
//! │  - format byte marks keyed/unencrypted   │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       StorageBackend                     │
//! │  - FileBackend: temp + fsync + rename    │
//! │  - SqliteBackend: upsert per identifier  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use tokenvault::credentials::{
//!     BlobCodec, FileBackend, KeyManager, TokenGrant, TokenRecord, TokenStore,
//! };
//! use chrono::Utc;
//!
//! # fn main() -> tokenvault::Result<()> {
//! // Master key from the environment (base64, 32 bytes)
//! let key = KeyManager::from_base64(&std::env::var("TOKENVAULT_ENCRYPTION_KEY").unwrap())?;
//! let store = TokenStore::new(
//!     Box::new(FileBackend::new("/var/lib/tokenvault")?),
//!     BlobCodec::Keyed(key),
//! );
//!
//! let grant = TokenGrant::new("gho_access").with_refresh_token("ghr_refresh").with_expires_in(3600);
//! store.put(&TokenRecord::from_grant("alice:github", grant, Utc::now())?)?;
//!
//! let record = store.get("alice:github")?;
//! println!("expires at {:?}", record.expires_at);
//!
//! store.delete("alice:github")?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Records are sealed as a whole with AES-256-GCM; the tag is verified
//!   before any field is returned
//! - Each write uses a fresh random nonce
//! - The key lives in memory only and is never logged
//! - Unencrypted mode must be chosen explicitly and is marked on disk

mod backend;
mod codec;
mod keys;
mod record;
mod storage;

pub use backend::{FileBackend, SqliteBackend, StorageBackend};
pub use codec::{
    decode, decode_unencrypted, encode, encode_unencrypted, BlobCodec, FORMAT_AES256GCM,
    FORMAT_UNENCRYPTED,
};
pub use keys::{KeyManager, KeyMaterial, KEY_SIZE};
pub use record::{Freshness, TokenGrant, TokenRecord, DEFAULT_TOKEN_TYPE};
pub use storage::{CredentialStatus, TokenStore, DEFAULT_CACHE_TTL};
