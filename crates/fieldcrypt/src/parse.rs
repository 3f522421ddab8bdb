//! Field-extraction helpers for JSON documents.
//!
//! Shared by the KEK descriptor and key-document parsers. Every failure is a
//! client error naming the offending field.

use common::{Error, Result};
use serde_json::Value;

use crate::endpoint::Endpoint;

/// Extract a required string field.
pub(crate) fn required_str(doc: &Value, field: &str) -> Result<String> {
    match doc.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(Error::client(format!("field '{field}' must be a string"))),
        None => Err(Error::client(format!("expected required field '{field}'"))),
    }
}

/// Extract an optional string field. Present-but-ill-typed is an error.
pub(crate) fn optional_str(doc: &Value, field: &str) -> Result<Option<String>> {
    match doc.get(field) {
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(Error::client(format!("field '{field}' must be a string"))),
    }
}

/// Extract a required endpoint field.
pub(crate) fn required_endpoint(doc: &Value, field: &str) -> Result<Endpoint> {
    let raw = required_str(doc, field)?;
    Endpoint::parse(&raw)
        .map_err(|e| Error::client(format!("error parsing field '{field}': {}", e.message)))
}

/// Extract an optional endpoint field.
pub(crate) fn optional_endpoint(doc: &Value, field: &str) -> Result<Option<Endpoint>> {
    match optional_str(doc, field)? {
        Some(raw) => Endpoint::parse(&raw)
            .map(Some)
            .map_err(|e| Error::client(format!("error parsing field '{field}': {}", e.message))),
        None => Ok(None),
    }
}

/// Extract an optional array-of-strings field.
pub(crate) fn optional_str_array(doc: &Value, field: &str) -> Result<Vec<String>> {
    match doc.get(field) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                _ => Err(Error::client(format!(
                    "field '{field}' must be an array of strings"
                ))),
            })
            .collect(),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(_) => Err(Error::client(format!("field '{field}' must be an array"))),
    }
}
