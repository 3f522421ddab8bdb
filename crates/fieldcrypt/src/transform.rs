//! Recursive walks over command and result documents.
//!
//! Marking placeholders and encrypted values are single-key wrapper objects
//! (`{"$fleMark": {...}}`, `{"$fleEncrypted": {...}}`) that can appear at any
//! depth, including inside arrays. These helpers visit or replace every
//! wrapper without interpreting the surrounding document.

use common::Result;
use serde_json::Value;

/// Returns `true` if `value` is a single-key object wrapping `key`.
fn is_wrapper(value: &Value, key: &str) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.len() == 1 && map.contains_key(key))
}

/// Visit every `{key: {...}}` wrapper in `doc`, depth-first.
///
/// `f` receives the whole wrapper object. Wrappers are not recursed into.
pub(crate) fn for_each_wrapper(
    doc: &Value,
    key: &str,
    f: &mut dyn FnMut(&Value) -> Result<()>,
) -> Result<()> {
    if is_wrapper(doc, key) {
        return f(doc);
    }
    match doc {
        Value::Object(map) => {
            for value in map.values() {
                for_each_wrapper(value, key, f)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                for_each_wrapper(item, key, f)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Rebuild `doc` with every `{key: {...}}` wrapper replaced by `f`'s result.
///
/// Everything else is cloned unchanged.
pub(crate) fn map_wrappers(
    doc: &Value,
    key: &str,
    f: &mut dyn FnMut(&Value) -> Result<Value>,
) -> Result<Value> {
    if is_wrapper(doc, key) {
        return f(doc);
    }
    match doc {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), map_wrappers(v, key, f)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(map_wrappers(item, key, f)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}
