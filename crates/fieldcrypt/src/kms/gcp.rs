//! GCP Cloud KMS `decrypt` request body and reply parsing.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{Error, Result};
use serde_json::{json, Value};

/// `cloudkms.googleapis.com:443`, used unless the KEK carries an override.
pub(crate) fn default_endpoint() -> String {
    "cloudkms.googleapis.com:443".to_owned()
}

/// Body of a `decrypt` call naming the full crypto-key resource path.
pub(crate) fn build_request(
    project_id: &str,
    location: &str,
    key_ring: &str,
    key_name: &str,
    key_version: Option<&str>,
    ciphertext: &[u8],
) -> Vec<u8> {
    let mut name = format!(
        "projects/{project_id}/locations/{location}/keyRings/{key_ring}/cryptoKeys/{key_name}"
    );
    if let Some(version) = key_version {
        name.push_str("/cryptoKeyVersions/");
        name.push_str(version);
    }
    json!({
        "name": name,
        "ciphertext": STANDARD.encode(ciphertext),
    })
    .to_string()
    .into_bytes()
}

/// Extract plaintext bytes from a `decrypt` reply, or surface the provider
/// error.
pub(crate) fn parse_reply(reply: &Value) -> Result<Vec<u8>> {
    if let Some(Value::String(encoded)) = reply.get("plaintext") {
        return STANDARD
            .decode(encoded)
            .map_err(|_| Error::kms("gcp reply 'plaintext' is not valid base64"));
    }
    if let Some(error) = reply.get("error") {
        let message = error.get("message").and_then(Value::as_str).unwrap_or("");
        return Err(Error::kms(format!("gcp cloud KMS error: {message}")));
    }
    Err(Error::kms("unexpected gcp cloud KMS reply shape"))
}
