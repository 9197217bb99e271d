mod env;

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::{
    BlobCodec, FileBackend, KeyManager, SqliteBackend, StorageBackend, TokenStore,
};
use crate::error::{Result, VaultError};

/// Complete tokenvault configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    /// Per-provider OAuth settings, keyed by provider name (e.g. "github")
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
}

/// Which durable backend holds the entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    File,
    Sqlite,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Directory for the file backend (one file per identifier)
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Database path for the sqlite backend
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    /// How long a cached record is served before re-reading storage (seconds)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
}

fn default_backend() -> BackendKind {
    BackendKind::File
}

fn default_directory() -> PathBuf {
    PathBuf::from(".tokenvault")
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from(".tokenvault/tokens.db")
}

fn default_cache_ttl() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            directory: default_directory(),
            sqlite_path: default_sqlite_path(),
            cache_ttl_seconds: default_cache_ttl(),
        }
    }
}

impl StorageConfig {
    pub fn open_backend(&self) -> Result<Box<dyn StorageBackend>> {
        match self.backend {
            BackendKind::File => Ok(Box::new(FileBackend::new(&self.directory)?)),
            BackendKind::Sqlite => {
                if let Some(parent) = self.sqlite_path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Ok(Box::new(SqliteBackend::new(&self.sqlite_path)?))
            }
        }
    }
}

/// Whether records are encrypted at rest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    /// AES-256-GCM with a key from the environment (default)
    Keyed,
    /// Plaintext at rest. Must be selected explicitly.
    Unencrypted,
}

/// Encryption configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default = "default_encryption_mode")]
    pub mode: EncryptionMode,
    /// Environment variable holding the base64 key
    #[serde(default = "default_key_env")]
    pub key_env: String,
}

fn default_encryption_mode() -> EncryptionMode {
    EncryptionMode::Keyed
}

fn default_key_env() -> String {
    "TOKENVAULT_ENCRYPTION_KEY".to_string()
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            mode: default_encryption_mode(),
            key_env: default_key_env(),
        }
    }
}

impl EncryptionConfig {
    /// Builds the codec, reading the key from `key_env` in keyed mode.
    pub fn resolve_codec(&self) -> Result<BlobCodec> {
        match self.mode {
            EncryptionMode::Keyed => KeyManager::from_env(&self.key_env)?
                .map(BlobCodec::Keyed)
                .ok_or_else(|| self.missing_key()),
            EncryptionMode::Unencrypted => Ok(BlobCodec::Unencrypted),
        }
    }

    /// Builds the codec from an already-fetched base64 key.
    ///
    /// Keyed mode without a key is an error; there is no silent fallback
    /// to unencrypted storage.
    pub fn codec_from(&self, key_base64: Option<&str>) -> Result<BlobCodec> {
        match self.mode {
            EncryptionMode::Keyed => {
                let key_base64 = key_base64
                    .filter(|k| !k.trim().is_empty())
                    .ok_or_else(|| self.missing_key())?;
                Ok(BlobCodec::Keyed(KeyManager::from_base64(key_base64)?))
            }
            EncryptionMode::Unencrypted => Ok(BlobCodec::Unencrypted),
        }
    }

    fn missing_key(&self) -> VaultError {
        VaultError::InvalidKey(format!(
            "{} is not set (set a base64 32-byte key, or explicitly configure encryption.mode = \"unencrypted\")",
            self.key_env
        ))
    }
}

/// Refresh configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Tokens expiring within this many seconds are treated as expired
    #[serde(default = "default_skew_seconds")]
    pub skew_seconds: i64,
    /// Timeout for token endpoint calls (seconds)
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
}

/// Upper bound for the renewal margin (one day)
pub const MAX_SKEW_SECONDS: i64 = 86_400;

fn default_skew_seconds() -> i64 {
    90
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            skew_seconds: default_skew_seconds(),
            http_timeout_seconds: default_http_timeout(),
        }
    }
}

impl RefreshConfig {
    /// Clamped to `0..=MAX_SKEW_SECONDS`.
    pub fn skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.skew_seconds.clamp(0, MAX_SKEW_SECONDS))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

/// Authorization flow configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// Base URL providers redirect back to
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    /// How long an authorization `state` stays valid (seconds)
    #[serde(default = "default_state_expiry")]
    pub state_expiry_seconds: i64,
}

fn default_callback_base_url() -> String {
    "http://localhost:8765".to_string()
}

fn default_state_expiry() -> i64 {
    600
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            callback_base_url: default_callback_base_url(),
            state_expiry_seconds: default_state_expiry(),
        }
    }
}

/// Per-provider overrides. Unset fields fall back to the built-in table.
#[derive(Clone, Default, Deserialize)]
pub struct ProviderSettings {
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("scopes", &self.scopes)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

impl VaultConfig {
    /// Opens the token store described by this configuration.
    pub fn open_store(&self) -> Result<TokenStore> {
        let codec = self.encryption.resolve_codec()?;
        let backend = self.storage.open_backend()?;
        Ok(TokenStore::new(backend, codec)
            .with_cache_ttl(Duration::from_secs(self.storage.cache_ttl_seconds)))
    }
}

/// Load configuration from a TOML file, then apply environment overrides.
///
/// A missing file yields the defaults (plus overrides).
pub fn load_config(path: &Path) -> anyhow::Result<VaultConfig> {
    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?
    } else {
        VaultConfig::default()
    };
    config.apply_env();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    #[test]
    fn test_default_config() {
        let config = VaultConfig::default();
        assert_eq!(config.storage.backend, BackendKind::File);
        assert_eq!(config.storage.cache_ttl_seconds, 30);
        assert_eq!(config.encryption.mode, EncryptionMode::Keyed);
        assert_eq!(config.encryption.key_env, "TOKENVAULT_ENCRYPTION_KEY");
        assert_eq!(config.refresh.skew_seconds, 90);
        assert_eq!(config.oauth.state_expiry_seconds, 600);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [storage]
            backend = "sqlite"
            sqlite_path = "/tmp/tokens.db"
            cache_ttl_seconds = 5

            [encryption]
            mode = "keyed"
            key_env = "MY_KEY"

            [refresh]
            skew_seconds = 30

            [oauth]
            callback_base_url = "https://agents.example.com"

            [providers.github]
            client_id = "gh-client"
            client_secret = "gh-secret"

            [providers.mcp]
            auth_url = "https://mcp.internal/authorize"
            token_url = "https://mcp.internal/token"
            scopes = ["tools:read"]
        "#;

        let config: VaultConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.storage.backend, BackendKind::Sqlite);
        assert_eq!(config.storage.sqlite_path, PathBuf::from("/tmp/tokens.db"));
        assert_eq!(config.storage.cache_ttl_seconds, 5);
        assert_eq!(config.encryption.key_env, "MY_KEY");
        assert_eq!(config.refresh.skew(), chrono::Duration::seconds(30));
        assert_eq!(config.oauth.callback_base_url, "https://agents.example.com");
        assert_eq!(
            config.providers["github"].client_id.as_deref(),
            Some("gh-client")
        );
        assert_eq!(
            config.providers["mcp"].scopes,
            Some(vec!["tools:read".to_string()])
        );
    }

    #[test]
    fn test_partial_config() {
        // Missing sections use defaults
        let toml = r#"
            [refresh]
            skew_seconds = 10
        "#;

        let config: VaultConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.refresh.skew_seconds, 10);
        assert_eq!(config.refresh.http_timeout_seconds, 30); // Default
        assert_eq!(config.storage.backend, BackendKind::File); // Default
    }

    #[test]
    fn test_skew_is_clamped() {
        let mut refresh = RefreshConfig::default();
        refresh.skew_seconds = i64::MAX;
        assert_eq!(refresh.skew(), chrono::Duration::seconds(MAX_SKEW_SECONDS));

        refresh.skew_seconds = -5;
        assert_eq!(refresh.skew(), chrono::Duration::zero());
    }

    #[test]
    fn test_keyed_mode_requires_key() {
        let config = EncryptionConfig::default();

        assert!(matches!(config.codec_from(None), Err(VaultError::InvalidKey(_))));
        assert!(matches!(config.codec_from(Some("  ")), Err(VaultError::InvalidKey(_))));
        assert!(matches!(
            config.codec_from(Some("c2hvcnQ=")),
            Err(VaultError::InvalidKey(_))
        ));

        let key = BASE64.encode([9u8; 32]);
        assert!(config.codec_from(Some(&key)).unwrap().is_encrypted());
    }

    #[test]
    fn test_unencrypted_mode_is_explicit() {
        let config: EncryptionConfig = toml::from_str(r#"mode = "unencrypted""#).unwrap();
        assert!(!config.codec_from(None).unwrap().is_encrypted());
    }

    #[test]
    fn test_provider_settings_debug_redacts_secret() {
        let settings = ProviderSettings {
            client_secret: Some("super-secret".to_string()),
            ..Default::default()
        };
        assert!(!format!("{:?}", settings).contains("super-secret"));
    }
}
