//! AWS KMS `Decrypt` request body and reply parsing.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{Error, Result};
use serde_json::{json, Value};

/// `kms.<region>.amazonaws.com:443`, used unless the KEK carries an override.
pub(crate) fn default_endpoint(region: &str) -> String {
    format!("kms.{region}.amazonaws.com:443")
}

/// Body of a `TrentService.Decrypt` call.
pub(crate) fn build_request(key: &str, ciphertext: &[u8]) -> Vec<u8> {
    json!({
        "KeyId": key,
        "CiphertextBlob": STANDARD.encode(ciphertext),
    })
    .to_string()
    .into_bytes()
}

/// Extract plaintext bytes from a `Decrypt` reply, or surface the provider
/// error.
pub(crate) fn parse_reply(reply: &Value) -> Result<Vec<u8>> {
    if let Some(Value::String(encoded)) = reply.get("Plaintext") {
        return STANDARD
            .decode(encoded)
            .map_err(|_| Error::kms("aws KMS reply 'Plaintext' is not valid base64"));
    }
    if let Some(error_type) = reply.get("__type").and_then(Value::as_str) {
        let message = reply
            .get("message")
            .or_else(|| reply.get("Message"))
            .and_then(Value::as_str)
            .unwrap_or("");
        return Err(Error::kms(format!("aws KMS error: {error_type}: {message}")));
    }
    Err(Error::kms("unexpected aws KMS reply shape"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_is_json_with_blob() {
        let body: Value = serde_json::from_slice(&build_request("arn:x", b"abc")).unwrap();
        assert_eq!(body["KeyId"], "arn:x");
        assert_eq!(body["CiphertextBlob"], STANDARD.encode(b"abc"));
    }

    #[test]
    fn reply_plaintext_decoded() {
        let reply = json!({"Plaintext": STANDARD.encode(b"dek")});
        assert_eq!(parse_reply(&reply).unwrap(), b"dek");
    }

    #[test]
    fn reply_error_includes_type_and_message() {
        let reply = json!({"__type": "AccessDeniedException", "Message": "no"});
        let err = parse_reply(&reply).unwrap_err();
        assert!(err.message.contains("AccessDeniedException"));
        assert!(err.message.contains("no"));
    }

    #[test]
    fn unexpected_shape_rejected() {
        assert!(parse_reply(&json!({"ok": true})).is_err());
        assert!(parse_reply(&json!({"Plaintext": "!!"})).is_err());
    }
}
