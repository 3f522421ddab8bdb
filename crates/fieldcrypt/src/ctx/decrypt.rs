//! Decrypt-side strategy: collect the keys a result payload references and
//! rewrite its encrypted values back to plaintext.

use common::{protocol::EncryptedValue, Error, Result};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::broker::KeyBroker;
use crate::crypt::Crypt;
use crate::crypto::EncryptedField;
use crate::transform::{for_each_wrapper, map_wrappers};

/// Per-operation storage for a decryption context.
#[derive(Debug)]
pub(crate) struct DecryptCtx {
    payload: Value,
}

impl DecryptCtx {
    /// Scan `payload` for encrypted values and register every referenced key
    /// with the broker.
    pub(crate) fn new(payload: Value, broker: &mut KeyBroker) -> Result<Self> {
        let mut count = 0usize;
        for_each_wrapper(&payload, common::protocol::ENCRYPTED_FIELD, &mut |wrapper| {
            let value = parse_encrypted(wrapper)?;
            count += 1;
            broker.request_id(parse_key_id(&value)?)
        })?;

        debug!(encrypted_values = count, "decrypt payload scanned");
        Ok(Self { payload })
    }

    /// Produce the plaintext payload: every encrypted value replaced by its
    /// decrypted, deserialized value.
    pub(crate) fn finalize(&self, crypt: &Crypt, broker: &KeyBroker) -> Result<Value> {
        map_wrappers(&self.payload, common::protocol::ENCRYPTED_FIELD, &mut |wrapper| {
            let value = parse_encrypted(wrapper)?;
            let id = parse_key_id(&value)?;
            let material = broker.decrypted_key_for(&id)?;

            let field: EncryptedField = value
                .data
                .parse()
                .map_err(|_| Error::document(format!("malformed encrypted value for key {id}")))?;

            let plaintext = crypt
                .crypto()
                .decrypt(material.as_bytes(), &field)
                .map_err(|_| Error::kms(format!("failed to decrypt value under key {id}")))?;

            serde_json::from_slice(&plaintext)
                .map_err(|_| Error::document(format!("decrypted value for key {id} is not valid JSON")))
        })
    }
}

fn parse_encrypted(wrapper: &Value) -> Result<EncryptedValue> {
    match EncryptedValue::from_wrapped(wrapper) {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(Error::document(format!("malformed encrypted value: {e}"))),
        None => Err(Error::internal("expected an encrypted value wrapper")),
    }
}

fn parse_key_id(value: &EncryptedValue) -> Result<Uuid> {
    Uuid::parse_str(&value.key_id).map_err(|_| {
        Error::client(format!(
            "encrypted value references invalid key id '{}'",
            value.key_id
        ))
    })
}
