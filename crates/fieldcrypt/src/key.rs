//! Key-vault document parsing.
//!
//! Each document in the key vault describes one data-encryption key: its
//! UUID, the wrapped (encrypted) key material, the KEK descriptor under
//! `masterKey`, and optional alternate names. Extra fields are ignored.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{Error, Result};
use serde_json::Value;
use uuid::Uuid;

use crate::kek::KekDescriptor;
use crate::parse::{optional_str_array, required_str};

/// A parsed key-vault document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDocument {
    /// 16-byte UUID identifying the data-encryption key.
    pub id: Uuid,
    /// Wrapped key material (ciphertext bytes).
    pub key_material: Vec<u8>,
    /// How the key material is wrapped.
    pub kek: KekDescriptor,
    /// Alternate names this key can be referenced by.
    pub key_alt_names: Vec<String>,
}

impl KeyDocument {
    /// Parse a key-vault document.
    ///
    /// Required fields: `_id` (canonical UUID string), `keyMaterial`
    /// (standard base64), `masterKey` (KEK document). Optional:
    /// `keyAltNames` (array of strings). Anything else is ignored.
    pub fn parse(doc: &Value) -> Result<Self> {
        let id_raw = required_str(doc, "_id")?;
        let id = Uuid::parse_str(&id_raw)
            .map_err(|_| Error::client(format!("field '_id' is not a valid UUID: '{id_raw}'")))?;

        let material_raw = required_str(doc, "keyMaterial")?;
        let key_material = STANDARD
            .decode(&material_raw)
            .map_err(|_| Error::client("field 'keyMaterial' is not valid base64"))?;

        let kek = match doc.get("masterKey") {
            Some(master) if master.is_object() => KekDescriptor::parse(master)?,
            Some(_) => return Err(Error::client("field 'masterKey' must be a document")),
            None => return Err(Error::client("expected required field 'masterKey'")),
        };

        let key_alt_names = optional_str_array(doc, "keyAltNames")?;

        Ok(Self {
            id,
            key_material,
            kek,
            key_alt_names,
        })
    }
}
