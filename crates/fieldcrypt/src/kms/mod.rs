//! Per-DEK KMS exchanges.
//!
//! A [`KmsContext`] drives one provider-specific request/response exchange
//! that unwraps one data-encryption key. The core builds the request body and
//! parses the reply; the host's KMS transport owns framing, authentication,
//! and the actual network round trip.
//!
//! The exchange is cooperative and finite: the caller transmits
//! [`KmsContext::message`], reporting progress via [`KmsContext::bytes_sent`],
//! then feeds reply bytes until [`KmsContext::bytes_needed`] reaches zero.
//! A sub-context is never restarted; a failed exchange fails its key record.

mod aws;
mod azure;
mod gcp;

use bytes::Bytes;
use common::{Error, Result};
use serde_json::Value;
use tracing::trace;

use crate::crypto::{KeyMaterial, KEY_LEN};
use crate::endpoint::Endpoint;

/// Reply-chunk hint returned by [`KmsContext::bytes_needed`] while a reply is
/// incomplete.
pub const DEFAULT_BYTES_NEEDED: usize = 1024;

/// Which remote provider a [`KmsContext`] speaks to.
///
/// Local keys never build a sub-context; they are unwrapped in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmsProvider {
    /// AWS KMS `Decrypt`.
    Aws,
    /// Azure Key Vault `unwrapKey`.
    Azure,
    /// GCP Cloud KMS `asymmetricDecrypt`/`decrypt`.
    Gcp,
}

impl std::fmt::Display for KmsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KmsProvider::Aws => "aws",
            KmsProvider::Azure => "azure",
            KmsProvider::Gcp => "gcp",
        };
        f.write_str(s)
    }
}

enum Outcome {
    Plaintext(KeyMaterial),
    Failed(Error),
}

/// One in-flight KMS exchange for one data-encryption key.
pub struct KmsContext {
    provider: KmsProvider,
    endpoint: String,
    message: Bytes,
    sent: usize,
    buf: Vec<u8>,
    outcome: Option<Outcome>,
}

impl KmsContext {
    fn new(provider: KmsProvider, endpoint: String, body: Vec<u8>) -> Self {
        Self {
            provider,
            endpoint,
            message: Bytes::from(body),
            sent: 0,
            buf: Vec::new(),
            outcome: None,
        }
    }

    pub(crate) fn for_aws(
        key: &str,
        region: &str,
        endpoint: Option<&Endpoint>,
        ciphertext: &[u8],
    ) -> Self {
        let endpoint = endpoint
            .map(|e| e.host_and_port().to_owned())
            .unwrap_or_else(|| aws::default_endpoint(region));
        Self::new(KmsProvider::Aws, endpoint, aws::build_request(key, ciphertext))
    }

    pub(crate) fn for_azure(
        key_vault_endpoint: &Endpoint,
        key_name: &str,
        key_version: Option<&str>,
        ciphertext: &[u8],
    ) -> Self {
        Self::new(
            KmsProvider::Azure,
            key_vault_endpoint.host_and_port().to_owned(),
            azure::build_request(key_name, key_version, ciphertext),
        )
    }

    pub(crate) fn for_gcp(
        project_id: &str,
        location: &str,
        key_ring: &str,
        key_name: &str,
        key_version: Option<&str>,
        endpoint: Option<&Endpoint>,
        ciphertext: &[u8],
    ) -> Self {
        let resolved = endpoint
            .map(|e| e.host_and_port().to_owned())
            .unwrap_or_else(gcp::default_endpoint);
        Self::new(
            KmsProvider::Gcp,
            resolved,
            gcp::build_request(project_id, location, key_ring, key_name, key_version, ciphertext),
        )
    }

    /// The provider this exchange targets.
    pub fn provider(&self) -> KmsProvider {
        self.provider
    }

    /// `host[:port]` the request should be sent to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The request bytes not yet reported as transmitted.
    pub fn message(&self) -> &[u8] {
        &self.message[self.sent..]
    }

    /// Report that the caller transmitted the first `n` bytes of
    /// [`KmsContext::message`]. Progress is monotonic.
    pub fn bytes_sent(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.message.len());
    }

    /// How many reply bytes this exchange still wants.
    ///
    /// A non-zero value is a chunk-size hint, not an exact count: the reply is
    /// complete when a full JSON document has been fed. Zero means the
    /// exchange is finished (successfully or not) and must not be fed again.
    pub fn bytes_needed(&self) -> usize {
        if self.outcome.is_some() {
            0
        } else {
            DEFAULT_BYTES_NEEDED
        }
    }

    /// Feed up to [`KmsContext::bytes_needed`] bytes of reply.
    ///
    /// # Errors
    ///
    /// Fails with a client error when the exchange is already finished or the
    /// chunk exceeds `bytes_needed`; with a kms error when the reply is
    /// malformed, reports a provider error, or carries key material of the
    /// wrong length. Any error finishes the exchange.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        if self.outcome.is_some() {
            return Err(Error::client("KMS context is not expecting a reply"));
        }
        if bytes.len() > self.bytes_needed() {
            let err = Error::client("fed more bytes than requested");
            self.outcome = Some(Outcome::Failed(err.clone()));
            return Err(err);
        }

        self.buf.extend_from_slice(bytes);
        trace!(provider = %self.provider, buffered = self.buf.len(), "kms reply bytes fed");

        let reply: Value = match serde_json::from_slice(&self.buf) {
            Ok(v) => v,
            Err(e) if e.is_eof() => return Ok(()), // incomplete; keep feeding
            Err(e) => {
                let err = Error::kms(format!("malformed KMS reply: {e}"));
                self.outcome = Some(Outcome::Failed(err.clone()));
                return Err(err);
            }
        };

        match self.unwrap_reply(&reply) {
            Ok(material) => {
                self.outcome = Some(Outcome::Plaintext(material));
                Ok(())
            }
            Err(err) => {
                self.outcome = Some(Outcome::Failed(err.clone()));
                Err(err)
            }
        }
    }

    fn unwrap_reply(&self, reply: &Value) -> Result<KeyMaterial> {
        let plaintext = match self.provider {
            KmsProvider::Aws => aws::parse_reply(reply)?,
            KmsProvider::Azure => azure::parse_reply(reply)?,
            KmsProvider::Gcp => gcp::parse_reply(reply)?,
        };
        KeyMaterial::from_slice(&plaintext).map_err(|_| {
            Error::kms(format!(
                "KMS returned key material of length {}, expected {KEY_LEN}",
                plaintext.len()
            ))
        })
    }

    /// Record a transport-level failure reported by the caller. Finishes the
    /// exchange.
    pub fn fail_network(&mut self, message: impl Into<String>) {
        if self.outcome.is_none() {
            self.outcome = Some(Outcome::Failed(Error::network(message)));
        }
    }

    /// `true` while the exchange still has bytes to send or a reply to
    /// receive.
    pub fn has_work(&self) -> bool {
        self.outcome.is_none()
    }

    /// Unwrapped key material, when the exchange succeeded.
    pub fn plaintext(&self) -> Option<&KeyMaterial> {
        match &self.outcome {
            Some(Outcome::Plaintext(m)) => Some(m),
            _ => None,
        }
    }

    /// The failure that finished this exchange, if any.
    pub fn error(&self) -> Option<&Error> {
        match &self.outcome {
            Some(Outcome::Failed(e)) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Debug for KmsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsContext")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("sent", &self.sent)
            .field("has_work", &self.has_work())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde_json::json;

    fn aws_ctx() -> KmsContext {
        KmsContext::for_aws("arn:aws:kms:us-east-1:1234:key/abcd", "us-east-1", None, b"wrapped")
    }

    #[test]
    fn aws_request_targets_regional_endpoint() {
        let ctx = aws_ctx();
        assert_eq!(ctx.endpoint(), "kms.us-east-1.amazonaws.com:443");
        assert!(!ctx.message().is_empty());
        let body: Value = serde_json::from_slice(ctx.message()).unwrap();
        assert_eq!(body["CiphertextBlob"], STANDARD.encode(b"wrapped"));
    }

    #[test]
    fn endpoint_override_wins() {
        let ep = Endpoint::parse("kms.example:4443").unwrap();
        let ctx = KmsContext::for_aws("arn", "us-east-1", Some(&ep), b"c");
        assert_eq!(ctx.endpoint(), "kms.example:4443");
    }

    #[test]
    fn bytes_sent_is_monotonic_and_clamped() {
        let mut ctx = aws_ctx();
        let total = ctx.message().len();
        ctx.bytes_sent(10);
        assert_eq!(ctx.message().len(), total - 10);
        ctx.bytes_sent(total * 2);
        assert!(ctx.message().is_empty());
    }

    #[test]
    fn feed_complete_reply_yields_plaintext() {
        let mut ctx = aws_ctx();
        let reply = json!({"Plaintext": STANDARD.encode([0x42u8; KEY_LEN])}).to_string();
        ctx.feed(reply.as_bytes()).unwrap();
        assert_eq!(ctx.bytes_needed(), 0);
        assert!(!ctx.has_work());
        assert_eq!(ctx.plaintext().unwrap().as_bytes(), &[0x42u8; KEY_LEN]);
    }

    #[test]
    fn feed_accepts_split_replies() {
        let mut ctx = aws_ctx();
        let reply = json!({"Plaintext": STANDARD.encode([7u8; KEY_LEN])}).to_string();
        let (a, b) = reply.as_bytes().split_at(reply.len() / 2);
        ctx.feed(a).unwrap();
        assert!(ctx.bytes_needed() > 0);
        ctx.feed(b).unwrap();
        assert!(ctx.plaintext().is_some());
    }

    #[test]
    fn provider_error_reply_fails_with_kms_kind() {
        let mut ctx = aws_ctx();
        let reply = json!({"__type": "InvalidCiphertextException", "message": "nope"}).to_string();
        let err = ctx.feed(reply.as_bytes()).unwrap_err();
        assert_eq!(err.kind, common::ErrorKind::Kms);
        assert!(err.message.contains("InvalidCiphertextException"));
        assert_eq!(ctx.bytes_needed(), 0);
        assert_eq!(ctx.error().unwrap().kind, common::ErrorKind::Kms);
    }

    #[test]
    fn wrong_length_material_rejected() {
        let mut ctx = aws_ctx();
        let reply = json!({"Plaintext": STANDARD.encode([1u8; 16])}).to_string();
        let err = ctx.feed(reply.as_bytes()).unwrap_err();
        assert!(err.message.contains("length"));
    }

    #[test]
    fn feed_after_finish_is_client_error() {
        let mut ctx = aws_ctx();
        ctx.fail_network("connection reset");
        let err = ctx.feed(b"{}").unwrap_err();
        assert_eq!(err.kind, common::ErrorKind::Client);
        // The recorded outcome keeps the first (network) error.
        assert_eq!(ctx.error().unwrap().kind, common::ErrorKind::Network);
    }

    #[test]
    fn azure_request_and_reply() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let vault = Endpoint::parse("vault.example:443").unwrap();
        let mut ctx = KmsContext::for_azure(&vault, "my-key", Some("v2"), b"wrapped");
        assert_eq!(ctx.endpoint(), "vault.example:443");
        let body: Value = serde_json::from_slice(ctx.message()).unwrap();
        assert_eq!(body["keyName"], "my-key");
        assert_eq!(body["keyVersion"], "v2");
        assert_eq!(body["alg"], "RSA-OAEP-256");

        let reply = json!({"value": URL_SAFE_NO_PAD.encode([9u8; KEY_LEN])}).to_string();
        ctx.feed(reply.as_bytes()).unwrap();
        assert!(ctx.plaintext().is_some());
    }

    #[test]
    fn gcp_request_names_full_resource_path() {
        let ctx = KmsContext::for_gcp("proj", "global", "ring", "key", Some("3"), None, b"w");
        assert_eq!(ctx.endpoint(), "cloudkms.googleapis.com:443");
        let body: Value = serde_json::from_slice(ctx.message()).unwrap();
        assert_eq!(
            body["name"],
            "projects/proj/locations/global/keyRings/ring/cryptoKeys/key/cryptoKeyVersions/3"
        );
    }

    #[test]
    fn gcp_error_reply_surfaces_message() {
        let mut ctx = KmsContext::for_gcp("p", "l", "r", "k", None, None, b"w");
        let reply = json!({"error": {"code": 403, "message": "permission denied"}}).to_string();
        let err = ctx.feed(reply.as_bytes()).unwrap_err();
        assert_eq!(err.kind, common::ErrorKind::Kms);
        assert!(err.message.contains("permission denied"));
    }
}
