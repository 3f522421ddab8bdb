//! The process handle shared by all operation contexts.
//!
//! A [`Crypt`] is built once per process (or per key-vault configuration) and
//! holds everything contexts only read: validated KMS options, the collection
//! schema cache, and the crypto hooks. Contexts borrow it via `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use common::Result;
use serde_json::Value;
use tracing::debug;

use crate::crypto::{AesGcmSivHooks, CryptoHooks};
use crate::ctx::Ctx;
use crate::options::CryptOptions;
use crate::schema::SchemaCache;

/// Process-wide handle: read-only configuration shared across contexts.
pub struct Crypt {
    options: CryptOptions,
    schema_cache: SchemaCache,
    crypto: Arc<dyn CryptoHooks>,
}

impl Crypt {
    /// Start building a handle.
    pub fn builder() -> CryptBuilder {
        CryptBuilder::default()
    }

    /// The validated KMS options.
    pub fn options(&self) -> &CryptOptions {
        &self.options
    }

    /// The shared collection schema cache.
    pub fn schema_cache(&self) -> &SchemaCache {
        &self.schema_cache
    }

    pub(crate) fn crypto(&self) -> &Arc<dyn CryptoHooks> {
        &self.crypto
    }

    /// Create an encryption context for one command against `namespace`
    /// (`"db.coll"` form).
    ///
    /// # Errors
    ///
    /// Returns a client error if the namespace is malformed.
    pub fn ctx_encrypt(self: &Arc<Self>, namespace: &str, command: Value) -> Result<Ctx> {
        Ctx::new_encrypt(Arc::clone(self), namespace, command)
    }

    /// Create a decryption context for one result payload.
    ///
    /// # Errors
    ///
    /// Returns a client error if the payload references a malformed key id.
    pub fn ctx_decrypt(self: &Arc<Self>, payload: Value) -> Result<Ctx> {
        Ctx::new_decrypt(Arc::clone(self), payload)
    }
}

impl std::fmt::Debug for Crypt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crypt")
            .field("options", &self.options)
            .field("schemas_cached", &self.schema_cache.len())
            .finish()
    }
}

/// Builder for [`Crypt`].
pub struct CryptBuilder {
    options: CryptOptions,
    schemas: HashMap<String, Value>,
    crypto: Option<Arc<dyn CryptoHooks>>,
}

impl Default for CryptBuilder {
    fn default() -> Self {
        Self {
            options: CryptOptions::new(),
            schemas: HashMap::new(),
            crypto: None,
        }
    }
}

impl CryptBuilder {
    /// Set the KMS options.
    pub fn options(mut self, options: CryptOptions) -> Self {
        self.options = options;
        self
    }

    /// Seed the schema cache with a known collection schema.
    ///
    /// Contexts for a seeded namespace skip the collection-info round trip.
    pub fn schema(mut self, namespace: impl Into<String>, schema: Value) -> Self {
        self.schemas.insert(namespace.into(), schema);
        self
    }

    /// Replace the default AES-256-GCM-SIV crypto hooks.
    pub fn crypto_hooks(mut self, hooks: Arc<dyn CryptoHooks>) -> Self {
        self.crypto = Some(hooks);
        self
    }

    /// Validate the options and build the handle.
    ///
    /// # Errors
    ///
    /// Returns a client error if any configured credential is incomplete.
    pub fn build(self) -> Result<Arc<Crypt>> {
        self.options.validate()?;

        let schema_cache = SchemaCache::new();
        if !self.schemas.is_empty() {
            schema_cache.replace_all(self.schemas);
        }

        debug!(schemas_seeded = schema_cache.len(), "crypt handle built");

        Ok(Arc::new(Crypt {
            options: self.options,
            schema_cache,
            crypto: self.crypto.unwrap_or_else(|| Arc::new(AesGcmSivHooks)),
        }))
    }
}
