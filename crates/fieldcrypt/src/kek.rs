//! Key-encryption-key (KEK) descriptors.
//!
//! A KEK descriptor records how a data-encryption key is wrapped: at which
//! provider, under which key, and through which endpoint. It parses from and
//! serializes to the `masterKey` document stored alongside each key, and the
//! two directions round-trip exactly (modulo field order).
//!
//! Documents parsed per provider:
//!
//! ```text
//! aws    provider, key, region, endpoint?
//! azure  provider, keyVaultEndpoint, keyName, keyVersion?
//! gcp    provider, projectId, location, keyRing, keyName, keyVersion?, endpoint?
//! local  provider
//! ```

use common::{Error, Result};
use serde_json::{Map, Value};

use crate::endpoint::Endpoint;
use crate::parse::{optional_endpoint, optional_str, required_endpoint, required_str};

/// How a data-encryption key is wrapped.
///
/// The variant determines which fields are meaningful; cloning and dropping
/// follow the active variant structurally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KekDescriptor {
    /// Wrapped by an AWS KMS customer master key.
    Aws {
        /// Customer master key ARN.
        key: String,
        /// AWS region, e.g. `us-east-1`.
        region: String,
        /// Optional KMS endpoint override.
        endpoint: Option<Endpoint>,
    },
    /// Wrapped by an Azure Key Vault key.
    Azure {
        /// Key vault endpoint.
        key_vault_endpoint: Endpoint,
        /// Key name within the vault.
        key_name: String,
        /// Optional key version.
        key_version: Option<String>,
    },
    /// Wrapped by a GCP Cloud KMS key.
    Gcp {
        /// GCP project id.
        project_id: String,
        /// Key ring location, e.g. `global`.
        location: String,
        /// Key ring name.
        key_ring: String,
        /// Key name within the ring.
        key_name: String,
        /// Optional key version.
        key_version: Option<String>,
        /// Optional KMS endpoint override.
        endpoint: Option<Endpoint>,
    },
    /// Wrapped by the locally configured key; no parameters.
    Local,
}

impl KekDescriptor {
    /// Parse a descriptor from its document form.
    ///
    /// Unknown fields are ignored. Failures are client errors naming the
    /// offending field, or `unrecognized KMS provider: <value>` for an
    /// unknown `provider` tag.
    pub fn parse(doc: &Value) -> Result<Self> {
        let provider = required_str(doc, "provider")?;
        match provider.as_str() {
            "aws" => Ok(KekDescriptor::Aws {
                key: required_str(doc, "key")?,
                region: required_str(doc, "region")?,
                endpoint: optional_endpoint(doc, "endpoint")?,
            }),
            "azure" => Ok(KekDescriptor::Azure {
                key_vault_endpoint: required_endpoint(doc, "keyVaultEndpoint")?,
                key_name: required_str(doc, "keyName")?,
                key_version: optional_str(doc, "keyVersion")?,
            }),
            "gcp" => Ok(KekDescriptor::Gcp {
                project_id: required_str(doc, "projectId")?,
                location: required_str(doc, "location")?,
                key_ring: required_str(doc, "keyRing")?,
                key_name: required_str(doc, "keyName")?,
                key_version: optional_str(doc, "keyVersion")?,
                endpoint: optional_endpoint(doc, "endpoint")?,
            }),
            "local" => Ok(KekDescriptor::Local),
            other => Err(Error::client(format!("unrecognized KMS provider: {other}"))),
        }
    }

    /// The lowercase provider tag this descriptor serializes under.
    pub fn provider(&self) -> &'static str {
        match self {
            KekDescriptor::Aws { .. } => "aws",
            KekDescriptor::Azure { .. } => "azure",
            KekDescriptor::Gcp { .. } => "gcp",
            KekDescriptor::Local => "local",
        }
    }

    /// Serialize back to the document form accepted by [`KekDescriptor::parse`].
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("provider".into(), Value::String(self.provider().into()));
        match self {
            KekDescriptor::Aws {
                key,
                region,
                endpoint,
            } => {
                doc.insert("region".into(), Value::String(region.clone()));
                doc.insert("key".into(), Value::String(key.clone()));
                if let Some(e) = endpoint {
                    doc.insert("endpoint".into(), Value::String(e.host_and_port().into()));
                }
            }
            KekDescriptor::Azure {
                key_vault_endpoint,
                key_name,
                key_version,
            } => {
                doc.insert(
                    "keyVaultEndpoint".into(),
                    Value::String(key_vault_endpoint.host_and_port().into()),
                );
                doc.insert("keyName".into(), Value::String(key_name.clone()));
                if let Some(v) = key_version {
                    doc.insert("keyVersion".into(), Value::String(v.clone()));
                }
            }
            KekDescriptor::Gcp {
                project_id,
                location,
                key_ring,
                key_name,
                key_version,
                endpoint,
            } => {
                doc.insert("projectId".into(), Value::String(project_id.clone()));
                doc.insert("location".into(), Value::String(location.clone()));
                doc.insert("keyRing".into(), Value::String(key_ring.clone()));
                doc.insert("keyName".into(), Value::String(key_name.clone()));
                if let Some(v) = key_version {
                    doc.insert("keyVersion".into(), Value::String(v.clone()));
                }
                if let Some(e) = endpoint {
                    doc.insert("endpoint".into(), Value::String(e.host_and_port().into()));
                }
            }
            KekDescriptor::Local => {}
        }
        Value::Object(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aws_round_trip() {
        let doc = json!({
            "provider": "aws",
            "region": "us-east-1",
            "key": "arn:aws:kms:us-east-1:1234:key/abcd",
        });
        let kek = KekDescriptor::parse(&doc).unwrap();
        assert!(matches!(kek, KekDescriptor::Aws { .. }));
        assert_eq!(kek.to_document(), doc);
    }

    #[test]
    fn aws_with_endpoint_round_trip() {
        let doc = json!({
            "provider": "aws",
            "region": "us-east-1",
            "key": "arn:aws:kms:us-east-1:1234:key/abcd",
            "endpoint": "kms.example:443",
        });
        let kek = KekDescriptor::parse(&doc).unwrap();
        assert_eq!(kek.to_document(), doc);
    }

    #[test]
    fn azure_with_key_version() {
        let doc = json!({
            "provider": "azure",
            "keyVaultEndpoint": "vault.example:443",
            "keyName": "my-key",
            "keyVersion": "v2",
        });
        let kek = KekDescriptor::parse(&doc).unwrap();
        match &kek {
            KekDescriptor::Azure {
                key_vault_endpoint,
                key_version,
                ..
            } => {
                assert_eq!(key_vault_endpoint.host_and_port(), "vault.example:443");
                assert_eq!(key_version.as_deref(), Some("v2"));
            }
            other => panic!("expected azure, got {other:?}"),
        }
        assert_eq!(kek.to_document(), doc);
    }

    #[test]
    fn azure_key_version_omitted() {
        let doc = json!({
            "provider": "azure",
            "keyVaultEndpoint": "vault.example",
            "keyName": "my-key",
        });
        let kek = KekDescriptor::parse(&doc).unwrap();
        match &kek {
            KekDescriptor::Azure { key_version, .. } => assert!(key_version.is_none()),
            other => panic!("expected azure, got {other:?}"),
        }
        // Serialize must omit the absent field entirely.
        assert!(kek.to_document().get("keyVersion").is_none());
        assert_eq!(kek.to_document(), doc);
    }

    #[test]
    fn gcp_full_round_trip() {
        let doc = json!({
            "provider": "gcp",
            "projectId": "my-project",
            "location": "global",
            "keyRing": "my-ring",
            "keyName": "my-key",
            "keyVersion": "1",
            "endpoint": "cloudkms.example:443",
        });
        let kek = KekDescriptor::parse(&doc).unwrap();
        assert_eq!(kek.to_document(), doc);
    }

    #[test]
    fn local_round_trip() {
        let doc = json!({"provider": "local"});
        let kek = KekDescriptor::parse(&doc).unwrap();
        assert_eq!(kek, KekDescriptor::Local);
        assert_eq!(kek.to_document(), doc);
    }

    #[test]
    fn unrecognized_provider() {
        let err = KekDescriptor::parse(&json!({"provider": "x"})).unwrap_err();
        assert_eq!(err.kind, common::ErrorKind::Client);
        assert!(err.message.contains("unrecognized KMS provider"));
        assert!(err.message.contains('x'));
    }

    #[test]
    fn missing_required_fields_name_the_field() {
        let cases = [
            (json!({"provider": "aws", "region": "r"}), "key"),
            (json!({"provider": "aws", "key": "k"}), "region"),
            (
                json!({"provider": "azure", "keyName": "k"}),
                "keyVaultEndpoint",
            ),
            (
                json!({"provider": "azure", "keyVaultEndpoint": "v.example"}),
                "keyName",
            ),
            (
                json!({"provider": "gcp", "location": "l", "keyRing": "r", "keyName": "k"}),
                "projectId",
            ),
            (
                json!({"provider": "gcp", "projectId": "p", "keyRing": "r", "keyName": "k"}),
                "location",
            ),
            (
                json!({"provider": "gcp", "projectId": "p", "location": "l", "keyName": "k"}),
                "keyRing",
            ),
            (
                json!({"provider": "gcp", "projectId": "p", "location": "l", "keyRing": "r"}),
                "keyName",
            ),
        ];
        for (doc, field) in cases {
            let err = KekDescriptor::parse(&doc).unwrap_err();
            assert_eq!(err.kind, common::ErrorKind::Client, "doc: {doc}");
            assert!(err.message.contains(field), "doc: {doc}, err: {err}");
        }
    }

    #[test]
    fn malformed_endpoint_names_the_field() {
        let doc = json!({
            "provider": "azure",
            "keyVaultEndpoint": ":443",
            "keyName": "k",
        });
        let err = KekDescriptor::parse(&doc).unwrap_err();
        assert!(err.message.contains("keyVaultEndpoint"));
    }

    #[test]
    fn unknown_fields_are_dropped() {
        let doc = json!({
            "provider": "local",
            "futureField": true,
        });
        let kek = KekDescriptor::parse(&doc).unwrap();
        assert_eq!(kek.to_document(), json!({"provider": "local"}));
    }

    #[test]
    fn clone_is_deep() {
        let kek = KekDescriptor::parse(&json!({
            "provider": "gcp",
            "projectId": "p",
            "location": "l",
            "keyRing": "r",
            "keyName": "k",
        }))
        .unwrap();
        let copy = kek.clone();
        assert_eq!(copy, kek);
        drop(kek);
        assert_eq!(copy.provider(), "gcp");
    }
}
