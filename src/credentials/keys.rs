//! Key material generation and validation.
//!
//! The key is supplied from the environment (base64) or generated for
//! provisioning. This module never persists key material.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{rngs::OsRng, RngCore};
use std::fmt;

use crate::error::{Result, VaultError};

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// 256-bit symmetric key for AES-256-GCM.
///
/// `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial([u8; KEY_SIZE]);

impl KeyMaterial {
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Base64 form, as expected in the key environment variable.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

/// Produces and validates [`KeyMaterial`].
pub struct KeyManager;

impl KeyManager {
    /// Generates a fresh random key from the OS CSPRNG.
    pub fn generate() -> KeyMaterial {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        KeyMaterial(bytes)
    }

    /// Validates externally supplied raw key bytes.
    ///
    /// # Returns
    /// * `Ok(KeyMaterial)` - Key is exactly 32 bytes
    /// * `Err(VaultError::InvalidKey)` - Wrong length
    pub fn load_or_fail(external_key_bytes: &[u8]) -> Result<KeyMaterial> {
        let bytes: [u8; KEY_SIZE] = external_key_bytes.try_into().map_err(|_| {
            VaultError::InvalidKey(format!(
                "encryption key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                external_key_bytes.len()
            ))
        })?;
        Ok(KeyMaterial(bytes))
    }

    /// Decodes a base64 key (the environment-variable form) and validates it.
    pub fn from_base64(key_base64: &str) -> Result<KeyMaterial> {
        let key_bytes = BASE64.decode(key_base64.trim()).map_err(|e| {
            VaultError::InvalidKey(format!("failed to decode base64 encryption key: {}", e))
        })?;
        Self::load_or_fail(&key_bytes)
    }

    /// Reads and validates the key from the environment variable `var`.
    ///
    /// Returns `Ok(None)` when the variable is unset or empty.
    pub fn from_env(var: &str) -> Result<Option<KeyMaterial>> {
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Self::from_base64(&value).map(Some),
            _ => Ok(None),
        }
    }
}
