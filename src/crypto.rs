//! Credential encryption module using AES-256-GCM
//!
//! Registry API and user keys are stored encrypted in the `licenses` table,
//! using AES-256-GCM with additional authenticated data (AAD) binding the
//! ciphertext to the owning site and license number. The wire format is
//! `version byte || nonce || ciphertext+tag`, base64-encoded for storage in
//! text columns.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::models::license::Model as LicenseModel;

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

/// Type alias for crypto keys
pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    /// Create a new crypto key from bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::EncryptionFailed(
                "Invalid key length: expected 32 bytes".to_string(),
            ));
        }
        Ok(ZeroizingKey(bytes))
    }

    /// Get the key as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypt bytes using AES-256-GCM
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    // Prepend version byte and nonce to ciphertext
    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes using AES-256-GCM
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    if ciphertext[0] != VERSION_ENCRYPTED {
        return Err(CryptoError::InvalidFormat);
    }

    if ciphertext.len() < MIN_ENCRYPTED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// AAD binding a license credential ciphertext to its owning site + number.
fn license_aad(site_id: Uuid, license_number: &str) -> String {
    format!("{}|{}", site_id, license_number)
}

/// Encrypted credential pair for a license, base64 for text-column storage.
pub struct EncryptedCredentials {
    pub api_key: String,
    pub user_key: String,
}

/// Decrypted credential pair for a license.
pub struct LicenseCredentials {
    pub api_key: String,
    pub user_key: String,
}

/// Encrypt a registry credential pair for storage on a license row.
pub fn encrypt_license_credentials(
    key: &CryptoKey,
    site_id: Uuid,
    license_number: &str,
    api_key: &str,
    user_key: &str,
) -> Result<EncryptedCredentials, CryptoError> {
    let aad = license_aad(site_id, license_number);

    let api_ct = encrypt_bytes(key, aad.as_bytes(), api_key.as_bytes())?;
    let user_ct = encrypt_bytes(key, aad.as_bytes(), user_key.as_bytes())?;

    Ok(EncryptedCredentials {
        api_key: BASE64.encode(api_ct),
        user_key: BASE64.encode(user_ct),
    })
}

/// Decrypt the registry credential pair stored on a license row.
pub fn decrypt_license_credentials(
    key: &CryptoKey,
    license: &LicenseModel,
) -> Result<LicenseCredentials, CryptoError> {
    let aad = license_aad(license.site_id, &license.license_number);

    let decrypt_field = |encoded: &str| -> Result<String, CryptoError> {
        let ciphertext = BASE64
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidBase64(e.to_string()))?;
        let plaintext = decrypt_bytes(key, aad.as_bytes(), &ciphertext)?;
        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid UTF-8: {}", e)))
    };

    Ok(LicenseCredentials {
        api_key: decrypt_field(&license.api_key_encrypted)?,
        user_key: decrypt_field(&license.user_key_encrypted)?,
    })
}
