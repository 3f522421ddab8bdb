//! In-memory cache of collection schemas, keyed by namespace.
//!
//! The process handle carries one [`SchemaCache`] shared read-only by every
//! context. An encrypt context consults it before asking the driver for
//! collection info and records what the driver fed back, so later contexts
//! for the same namespace skip the round trip. The cache uses `arc-swap` for
//! lock-free reads on the hot path.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use serde_json::Value;

/// Lock-free cache of collection schemas keyed by `db.coll` namespace.
///
/// An entry of `Value::Null` records that the collection is known to have no
/// schema (so contexts for it have nothing to encrypt); a missing entry means
/// the schema has not been fetched yet.
#[derive(Clone, Debug)]
pub struct SchemaCache {
    inner: Arc<ArcSwap<HashMap<String, Arc<Value>>>>,
}

impl SchemaCache {
    /// Create a new, empty cache.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::new(Arc::new(HashMap::new()))),
        }
    }

    /// Number of namespaces currently cached.
    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    /// Returns `true` if no namespaces are cached.
    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }

    /// Look up the cached schema for `namespace`.
    ///
    /// This is a lock-free read; safe to call on the hot encryption path.
    pub fn get(&self, namespace: &str) -> Option<Arc<Value>> {
        self.inner.load().get(namespace).cloned()
    }

    /// Record the schema for `namespace`, replacing any previous entry.
    ///
    /// Pass `Value::Null` to record that the collection has no schema.
    /// Concurrent inserts may each win with their own snapshot; a lost entry
    /// is refetched on the next miss.
    pub fn insert(&self, namespace: &str, schema: Value) {
        let mut map = (*self.inner.load_full()).clone();
        map.insert(namespace.to_owned(), Arc::new(schema));
        self.inner.store(Arc::new(map));
    }

    /// Atomically replace the entire cache contents.
    ///
    /// Used to seed the cache from a configured schema map at handle
    /// construction.
    pub fn replace_all(&self, schemas: HashMap<String, Value>) {
        let new_map: HashMap<String, Arc<Value>> = schemas
            .into_iter()
            .map(|(ns, schema)| (ns, Arc::new(schema)))
            .collect();
        self.inner.store(Arc::new(new_map));
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}
