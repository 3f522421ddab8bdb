//! Wire-protocol forms exchanged with the host driver.
//!
//! Two single-key wrapper objects ride inside otherwise ordinary JSON command
//! and result documents:
//!
//! - A **marking** `{"$fleMark": {...}}` is produced by the host's
//!   command-marking engine and identifies a value that must be encrypted
//!   under a specific data-encryption key before the command leaves the
//!   client.
//! - An **encrypted value** `{"$fleEncrypted": {...}}` replaces a marking in
//!   the finalized command, and is what comes back from the server for
//!   encrypted fields.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Wrapper key identifying a marking placeholder.
pub const MARK_FIELD: &str = "$fleMark";

/// Wrapper key identifying an encrypted field value.
pub const ENCRYPTED_FIELD: &str = "$fleEncrypted";

// ---------------------------------------------------------------------------
// Marking
// ---------------------------------------------------------------------------

/// Body of a `{"$fleMark": {...}}` placeholder.
///
/// Exactly one of `key_id` / `key_alt_name` names the data-encryption key;
/// `v` is the plaintext value to encrypt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marking {
    /// Canonical hyphenated UUID of the data-encryption key.
    #[serde(rename = "keyId", skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,

    /// Alternate name of the data-encryption key.
    #[serde(rename = "keyAltName", skip_serializing_if = "Option::is_none")]
    pub key_alt_name: Option<String>,

    /// Optional algorithm label carried through from the marking engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,

    /// Plaintext value to encrypt.
    pub v: Value,
}

impl Marking {
    /// Wrap this marking into its on-the-wire `{"$fleMark": {...}}` form.
    pub fn wrap(&self) -> Value {
        json!({ MARK_FIELD: self })
    }

    /// If `value` is a `{"$fleMark": {...}}` wrapper, parse its body.
    ///
    /// Returns `None` for any other shape; returns `Some(Err(_))` when the
    /// wrapper is present but its body does not deserialize.
    pub fn from_wrapped(value: &Value) -> Option<serde_json::Result<Self>> {
        let map = value.as_object()?;
        if map.len() != 1 {
            return None;
        }
        map.get(MARK_FIELD)
            .map(|body| serde_json::from_value(body.clone()))
    }
}

// ---------------------------------------------------------------------------
// Encrypted value
// ---------------------------------------------------------------------------

/// Body of a `{"$fleEncrypted": {...}}` field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    /// Canonical hyphenated UUID of the data-encryption key that encrypted
    /// this value.
    #[serde(rename = "keyId")]
    pub key_id: String,

    /// Encoded ciphertext in `v1.<nonce>.<ciphertext>` form.
    pub data: String,
}

impl EncryptedValue {
    /// Wrap into the on-the-wire `{"$fleEncrypted": {...}}` form.
    pub fn wrap(&self) -> Value {
        json!({ ENCRYPTED_FIELD: self })
    }

    /// If `value` is a `{"$fleEncrypted": {...}}` wrapper, parse its body.
    pub fn from_wrapped(value: &Value) -> Option<serde_json::Result<Self>> {
        let map = value.as_object()?;
        if map.len() != 1 {
            return None;
        }
        map.get(ENCRYPTED_FIELD)
            .map(|body| serde_json::from_value(body.clone()))
    }
}
