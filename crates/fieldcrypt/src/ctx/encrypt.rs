//! Encrypt-side strategy: resolve the collection schema, collect markings,
//! and rewrite the command with encrypted values.

use common::{protocol::Marking, Error, Result};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::broker::KeyBroker;
use crate::crypt::Crypt;
use crate::ctx::State;
use crate::transform::{for_each_wrapper, map_wrappers};

/// Per-operation storage for an encryption context.
#[derive(Debug)]
pub(crate) struct EncryptCtx {
    namespace: String,
    coll: String,
    command: Value,
    /// Resolved collection schema; `None` until known, `Some(Value::Null)`
    /// once the collection is known to have no schema.
    schema: Option<Value>,
    collinfo_fed: bool,
    marked: Option<Value>,
}

impl EncryptCtx {
    /// Validate the namespace (`"db.coll"`) and command shape.
    pub(crate) fn new(namespace: &str, command: Value) -> Result<Self> {
        let coll = match namespace.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => coll.to_owned(),
            _ => {
                return Err(Error::client(format!(
                    "invalid namespace '{namespace}', expected 'db.coll'"
                )))
            }
        };
        if !command.is_object() {
            return Err(Error::client("command must be a document"));
        }
        Ok(Self {
            namespace: namespace.to_owned(),
            coll,
            command,
            schema: None,
            collinfo_fed: false,
            marked: None,
        })
    }

    /// Adopt a schema already cached on the handle.
    pub(crate) fn set_cached_schema(&mut self, schema: Value) {
        self.schema = Some(schema);
    }

    /// The listCollections-style filter for this context's collection.
    pub(crate) fn op_collinfo(&self) -> Result<Value> {
        Ok(serde_json::json!({ "name": self.coll }))
    }

    /// Ingest the collection-info document; at most one is accepted.
    pub(crate) fn feed_collinfo(&mut self, doc: &Value) -> Result<()> {
        if self.collinfo_fed {
            return Err(Error::client(
                "expected at most one collection info document",
            ));
        }
        self.collinfo_fed = true;

        if let Some(schema) = doc
            .get("options")
            .and_then(|o| o.get("validator"))
            .and_then(|v| v.get("$jsonSchema"))
        {
            if !schema.is_object() {
                return Err(Error::document("field '$jsonSchema' must be a document"));
            }
            self.schema = Some(schema.clone());
        }
        Ok(())
    }

    /// Close the collection-info phase, caching the outcome on the handle.
    ///
    /// A collection without a schema has nothing to encrypt; such contexts
    /// are terminal.
    pub(crate) fn done_collinfo(&mut self, crypt: &Crypt) -> State {
        let cached = self.schema.clone().unwrap_or(Value::Null);
        crypt.schema_cache().insert(&self.namespace, cached);

        match &self.schema {
            Some(schema) if !schema.is_null() => State::NeedMarkings,
            _ => {
                debug!(namespace = %self.namespace, "collection has no schema");
                State::NothingToDo
            }
        }
    }

    /// The command to hand the marking engine: the original command with the
    /// resolved schema attached.
    pub(crate) fn op_markings(&self) -> Result<Value> {
        let schema = match &self.schema {
            Some(s) if !s.is_null() => s.clone(),
            _ => return Err(Error::internal("marking requested without a schema")),
        };
        let mut cmd = self.command.clone();
        match cmd.as_object_mut() {
            Some(map) => {
                map.insert("jsonSchema".to_owned(), schema);
            }
            None => return Err(Error::internal("command is not a document")),
        }
        Ok(cmd)
    }

    /// Ingest the marked command, registering every referenced key with the
    /// broker. At most one marked document is accepted.
    pub(crate) fn feed_markings(&mut self, doc: &Value, broker: &mut KeyBroker) -> Result<()> {
        if self.marked.is_some() {
            return Err(Error::client("expected at most one marked command document"));
        }

        let mut count = 0usize;
        for_each_wrapper(doc, common::protocol::MARK_FIELD, &mut |wrapper| {
            let marking = parse_marking(wrapper)?;
            count += 1;
            match (&marking.key_id, &marking.key_alt_name) {
                (Some(id), None) => {
                    let id = Uuid::parse_str(id).map_err(|_| {
                        Error::client(format!("marking references invalid key id '{id}'"))
                    })?;
                    broker.request_id(id)
                }
                (None, Some(name)) => broker.request_alt_name(name),
                _ => Err(Error::client(
                    "marking must reference exactly one of keyId or keyAltName",
                )),
            }
        })?;

        debug!(markings = count, "marked command ingested");
        self.marked = Some(doc.clone());
        Ok(())
    }

    /// Close the marking phase. With no referenced keys there is nothing to
    /// fetch and the context is ready to finalize.
    pub(crate) fn done_markings(&self, broker: &KeyBroker) -> State {
        if broker.has_wants() {
            State::NeedKeys
        } else {
            State::Ready
        }
    }

    /// Produce the final command: every marking replaced by its encrypted
    /// value under the resolved key.
    pub(crate) fn finalize(&self, crypt: &Crypt, broker: &KeyBroker) -> Result<Value> {
        let source = self.marked.as_ref().unwrap_or(&self.command);
        map_wrappers(source, common::protocol::MARK_FIELD, &mut |wrapper| {
            let marking = parse_marking(wrapper)?;

            let (key_id, material) = match (&marking.key_id, &marking.key_alt_name) {
                (Some(id), None) => {
                    let id = Uuid::parse_str(id).map_err(|_| {
                        Error::client(format!("marking references invalid key id '{id}'"))
                    })?;
                    (id, broker.decrypted_key_for(&id)?)
                }
                (None, Some(name)) => broker.decrypted_key_by_alt_name(name)?,
                _ => {
                    return Err(Error::client(
                        "marking must reference exactly one of keyId or keyAltName",
                    ))
                }
            };

            let plaintext = marking.v.to_string().into_bytes();
            let field = crypt
                .crypto()
                .encrypt(material.as_bytes(), &plaintext)
                .map_err(|e| Error::internal(format!("field encryption failed: {e}")))?;

            Ok(common::protocol::EncryptedValue {
                key_id: key_id.to_string(),
                data: field.to_string_repr(),
            }
            .wrap())
        })
    }
}

fn parse_marking(wrapper: &Value) -> Result<Marking> {
    match Marking::from_wrapped(wrapper) {
        Some(Ok(marking)) => Ok(marking),
        Some(Err(e)) => Err(Error::document(format!("malformed marking: {e}"))),
        None => Err(Error::internal("expected a marking wrapper")),
    }
}
