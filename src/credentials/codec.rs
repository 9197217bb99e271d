//! AES-256-GCM blob codec for token records.
//!
//! A record is serialized to JSON and sealed as one self-describing blob:
//!
//! ```text
//! [format: 1 byte][nonce: 12 bytes][ciphertext + tag: n + 16 bytes]
//! ```
//!
//! The format byte is authenticated as associated data. Unencrypted blobs use
//! a different format byte and carry the JSON directly, so a keyed store can
//! never mistake them for ciphertext.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};

use super::keys::KeyMaterial;
use super::record::TokenRecord;
use crate::error::CodecError;

/// Format marker for plaintext blobs (explicit unencrypted mode only)
pub const FORMAT_UNENCRYPTED: u8 = 0x00;

/// Format marker for AES-256-GCM blobs
pub const FORMAT_AES256GCM: u8 = 0x01;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Encrypts a record with a fresh random nonce.
///
/// Two calls with the same record and key never produce the same blob.
pub fn encode(record: &TokenRecord, key: &KeyMaterial) -> Result<Vec<u8>, CodecError> {
    let plaintext =
        serde_json::to_vec(record).map_err(|e| CodecError::Encrypt(e.to_string()))?;

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CodecError::Encrypt(format!("failed to create cipher: {}", e)))?;

    // Generate random nonce (never reuse!)
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: &plaintext,
                aad: &[FORMAT_AES256GCM],
            },
        )
        .map_err(|e| CodecError::Encrypt(format!("encryption failed: {}", e)))?;

    let mut blob = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
    blob.push(FORMAT_AES256GCM);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Verifies and decrypts a blob produced by [`encode`].
///
/// # Returns
/// * `Ok(TokenRecord)` - Tag verified, payload parsed
/// * `Err(CodecError::Integrity)` - Wrong key, tampering, or a plaintext blob
/// * `Err(CodecError::Decode)` - Empty or truncated blob
pub fn decode(blob: &[u8], key: &KeyMaterial) -> Result<TokenRecord, CodecError> {
    let (&format, body) = blob
        .split_first()
        .ok_or_else(|| CodecError::Decode("blob is empty".to_string()))?;

    match format {
        FORMAT_AES256GCM => {}
        FORMAT_UNENCRYPTED => {
            return Err(CodecError::Integrity(
                "blob is unencrypted but the store requires encryption".to_string(),
            ))
        }
        other => {
            return Err(CodecError::Integrity(format!(
                "unrecognized format marker 0x{:02x}",
                other
            )))
        }
    }

    if body.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CodecError::Decode(format!(
            "blob is truncated: {} bytes after format marker",
            body.len()
        )));
    }

    let (nonce, ciphertext) = body.split_at(NONCE_SIZE);

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CodecError::Decode(format!("failed to create cipher: {}", e)))?;

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &[format],
            },
        )
        .map_err(|_| {
            CodecError::Integrity("authentication tag mismatch (wrong key or corrupted data)".to_string())
        })?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| CodecError::Decode(format!("decrypted payload is not a record: {}", e)))
}

/// Serializes a record without encryption, marked as such.
pub fn encode_unencrypted(record: &TokenRecord) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(record).map_err(|e| CodecError::Encrypt(e.to_string()))?;
    let mut blob = Vec::with_capacity(1 + json.len());
    blob.push(FORMAT_UNENCRYPTED);
    blob.extend_from_slice(&json);
    Ok(blob)
}

/// Parses a blob produced by [`encode_unencrypted`].
///
/// Encrypted blobs fail with [`CodecError::KeyRequired`].
pub fn decode_unencrypted(blob: &[u8]) -> Result<TokenRecord, CodecError> {
    let (&format, body) = blob
        .split_first()
        .ok_or_else(|| CodecError::Decode("blob is empty".to_string()))?;

    match format {
        FORMAT_UNENCRYPTED => serde_json::from_slice(body)
            .map_err(|e| CodecError::Decode(format!("payload is not a record: {}", e))),
        FORMAT_AES256GCM => Err(CodecError::KeyRequired),
        other => Err(CodecError::Decode(format!(
            "unrecognized format marker 0x{:02x}",
            other
        ))),
    }
}

/// The protection mode a store operates in.
///
/// There is no implicit fallback: a store holds exactly one of these, chosen
/// at construction.
#[derive(Clone, Debug)]
pub enum BlobCodec {
    Keyed(KeyMaterial),
    Unencrypted,
}

impl BlobCodec {
    pub fn seal(&self, record: &TokenRecord) -> Result<Vec<u8>, CodecError> {
        match self {
            BlobCodec::Keyed(key) => encode(record, key),
            BlobCodec::Unencrypted => encode_unencrypted(record),
        }
    }

    pub fn open(&self, blob: &[u8]) -> Result<TokenRecord, CodecError> {
        match self {
            BlobCodec::Keyed(key) => decode(blob, key),
            BlobCodec::Unencrypted => decode_unencrypted(blob),
        }
    }

    /// Format marker written by [`seal`](Self::seal).
    pub fn format(&self) -> u8 {
        match self {
            BlobCodec::Keyed(_) => FORMAT_AES256GCM,
            BlobCodec::Unencrypted => FORMAT_UNENCRYPTED,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, BlobCodec::Keyed(_))
    }
}
