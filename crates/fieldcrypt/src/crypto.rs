//! Field-level crypto seam and its AES-256-GCM-SIV default.
//!
//! The coordination core never performs crypto inline; every encrypt/decrypt
//! goes through the [`CryptoHooks`] trait held by the process handle. The
//! default implementation uses AES-256-GCM-SIV (RFC 8452).
//!
//! # Ciphertext format
//!
//! ```text
//! v1.<base64url-no-pad(nonce)>.<base64url-no-pad(ciphertext+tag)>
//! ```
//!
//! The `v1` prefix enables future algorithm or key-version migration without
//! breaking existing ciphertext. The same format wraps both field values and
//! locally-wrapped data-encryption keys.

use aes_gcm_siv::{
    aead::{Aead, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Prefix that appears at the start of every encoded ciphertext.
pub const VERSION_PREFIX: &str = "v1";

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes")]
    InvalidKeyLength,

    /// AEAD encryption or decryption failed (wrong key or tampered data).
    #[error("aead operation failed")]
    AeadFailure,

    /// The encoded ciphertext does not match the `v1.<nonce>.<ciphertext>` structure.
    #[error("invalid encrypted value format")]
    InvalidFormat,
}

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// Fixed-size buffer holding exactly [`KEY_LEN`] bytes of plaintext key
/// material.
///
/// The memory is overwritten with zeroes on drop to minimise the window
/// during which key material lives in RAM.
#[derive(Clone)]
pub struct KeyMaterial(Box<[u8; KEY_LEN]>);

impl KeyMaterial {
    /// Copy `bytes` into a new buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKeyLength`] unless `bytes` is exactly
    /// [`KEY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() != KEY_LEN {
            return Err(CipherError::InvalidKeyLength);
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        // Zero the key material on drop.
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material — not even in debug builds.
        f.write_str("KeyMaterial([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// Encrypted field
// ---------------------------------------------------------------------------

/// A parsed encrypted value.
///
/// The string representation is `v1.<base64url(nonce)>.<base64url(ciphertext+tag)>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedField {
    /// Raw nonce bytes.
    pub nonce: [u8; NONCE_LEN],
    /// Raw ciphertext + authentication tag bytes.
    pub ciphertext: Vec<u8>,
}

impl EncryptedField {
    /// Encode this value to its canonical string representation.
    pub fn to_string_repr(&self) -> String {
        format!(
            "{}.{}.{}",
            VERSION_PREFIX,
            URL_SAFE_NO_PAD.encode(self.nonce),
            URL_SAFE_NO_PAD.encode(&self.ciphertext),
        )
    }
}

impl std::str::FromStr for EncryptedField {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(3, '.').collect();
        if parts.len() != 3 || parts[0] != VERSION_PREFIX {
            return Err(CipherError::InvalidFormat);
        }
        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(parts[1])
            .map_err(|_| CipherError::InvalidFormat)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CipherError::InvalidFormat);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&nonce_bytes);

        let ciphertext = URL_SAFE_NO_PAD
            .decode(parts[2])
            .map_err(|_| CipherError::InvalidFormat)?;

        Ok(Self { nonce, ciphertext })
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Symmetric crypto operations used by the coordination core.
///
/// The process handle carries one implementation shared by every context.
/// Implementations must be deterministic given (key, nonce) and must
/// authenticate on decrypt.
#[cfg_attr(test, automock)]
pub trait CryptoHooks: Send + Sync {
    /// Encrypt `plaintext` under `key`, producing a fresh-nonce ciphertext.
    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<EncryptedField, CipherError>;

    /// Decrypt and authenticate `field` under `key`.
    fn decrypt(&self, key: &[u8], field: &EncryptedField) -> Result<Vec<u8>, CipherError>;
}

/// Default [`CryptoHooks`] implementation: AES-256-GCM-SIV with a random
/// 96-bit nonce per encryption, drawn from the OS CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmSivHooks;

impl CryptoHooks for AesGcmSivHooks {
    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<EncryptedField, CipherError> {
        encrypt_field(plaintext, key)
    }

    fn decrypt(&self, key: &[u8], field: &EncryptedField) -> Result<Vec<u8>, CipherError> {
        decrypt_field(field, key)
    }
}

/// Encrypt a plaintext value using AES-256-GCM-SIV with a random nonce.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes.
/// Returns [`CipherError::AeadFailure`] on an internal AEAD error (should be
/// unreachable with a valid key and nonce).
pub fn encrypt_field(plaintext: &[u8], key: &[u8]) -> Result<EncryptedField, CipherError> {
    let cipher = build_cipher(key)?;

    use aes_gcm_siv::aead::rand_core::RngCore;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CipherError::AeadFailure)?;

    Ok(EncryptedField {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Decrypt an [`EncryptedField`] back to plaintext bytes.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes.
/// Returns [`CipherError::AeadFailure`] if authentication fails (wrong key or
/// tampered data).
pub fn decrypt_field(field: &EncryptedField, key: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key)?;
    let nonce = Nonce::from_slice(&field.nonce);
    cipher
        .decrypt(nonce, field.ciphertext.as_ref())
        .map_err(|_| CipherError::AeadFailure)
}

fn build_cipher(key: &[u8]) -> Result<Aes256GcmSiv, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength);
    }
    Aes256GcmSiv::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength)
}
