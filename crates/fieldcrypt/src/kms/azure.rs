//! Azure Key Vault `unwrapKey` request body and reply parsing.
//!
//! Azure transports binary values as base64url without padding.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use common::{Error, Result};
use serde_json::{json, Value};

/// Body of an `unwrapKey` call against the vault named by the KEK endpoint.
pub(crate) fn build_request(
    key_name: &str,
    key_version: Option<&str>,
    ciphertext: &[u8],
) -> Vec<u8> {
    let mut body = json!({
        "keyName": key_name,
        "alg": "RSA-OAEP-256",
        "value": URL_SAFE_NO_PAD.encode(ciphertext),
    });
    if let Some(version) = key_version {
        body["keyVersion"] = Value::String(version.to_owned());
    }
    body.to_string().into_bytes()
}

/// Extract plaintext bytes from an `unwrapKey` reply, or surface the provider
/// error.
pub(crate) fn parse_reply(reply: &Value) -> Result<Vec<u8>> {
    if let Some(Value::String(encoded)) = reply.get("value") {
        return URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| Error::kms("azure reply 'value' is not valid base64url"));
    }
    if let Some(error) = reply.get("error") {
        let code = error.get("code").and_then(Value::as_str).unwrap_or("unknown");
        let message = error.get("message").and_then(Value::as_str).unwrap_or("");
        return Err(Error::kms(format!("azure key vault error: {code}: {message}")));
    }
    Err(Error::kms("unexpected azure key vault reply shape"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_omits_absent_version() {
        let body: Value = serde_json::from_slice(&build_request("k", None, b"c")).unwrap();
        assert!(body.get("keyVersion").is_none());
    }

    #[test]
    fn reply_value_decoded() {
        let reply = json!({"value": URL_SAFE_NO_PAD.encode(b"dek")});
        assert_eq!(parse_reply(&reply).unwrap(), b"dek");
    }

    #[test]
    fn reply_error_surfaced() {
        let reply = json!({"error": {"code": "Forbidden", "message": "denied"}});
        let err = parse_reply(&reply).unwrap_err();
        assert!(err.message.contains("Forbidden"));
        assert!(err.message.contains("denied"));
    }
}
