//! The key broker: fetches and unwraps every data-encryption key one
//! operation needs.
//!
//! A broker is owned by its operation context and moves through a fixed
//! lifecycle: wants are registered (by UUID or alternate name), a key-vault
//! filter is issued, fetched key documents are ingested and deduplicated,
//! then each wrapped key is unwrapped — remotely through a [`KmsContext`] or
//! locally for `local`-provider keys. The broker is `satisfied` once every
//! wanted key is decrypted, and immutable from then on.
//!
//! Records move forward only: `Empty → Encrypted → Decrypting → Decrypted`.

use common::{Error, Result};
use serde_json::{json, Value};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::crypt::Crypt;
use crate::crypto::{EncryptedField, KeyMaterial};
use crate::kek::KekDescriptor;
use crate::key::KeyDocument;
use crate::kms::KmsContext;

/// Unwrap progress of one data-encryption key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Wanted, not yet fetched.
    Empty,
    /// Fetched; ciphertext known, awaiting unwrap.
    Encrypted,
    /// KMS exchange in flight.
    Decrypting,
    /// Plaintext material available.
    Decrypted,
    /// The unwrap failed.
    Errored,
}

#[derive(Debug)]
struct KeyRecord {
    id: Uuid,
    state: RecordState,
    doc: Option<KeyDocument>,
    kms: Option<KmsContext>,
    material: Option<KeyMaterial>,
}

impl KeyRecord {
    fn empty(id: Uuid) -> Self {
        Self {
            id,
            state: RecordState::Empty,
            doc: None,
            kms: None,
            material: None,
        }
    }
}

#[derive(Debug)]
struct AltNameWant {
    name: String,
    resolved: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Wants are being registered.
    Requesting,
    /// Filter issued; key documents accepted.
    Adding,
    /// Ingestion closed; unwraps scheduled.
    Closed,
    /// Every wanted key decrypted.
    Satisfied,
    /// An unwrap failed.
    Failed,
}

/// Set of data-encryption key records for one operation.
#[derive(Debug)]
pub struct KeyBroker {
    records: Vec<KeyRecord>,
    alt_name_wants: Vec<AltNameWant>,
    phase: Phase,
    require_all: bool,
}

impl KeyBroker {
    /// Create an empty broker.
    ///
    /// With `require_all`, closing ingestion while any want is unfetched is
    /// an error; without it, unfetched wants are tolerated and simply never
    /// become available.
    pub fn new(require_all: bool) -> Self {
        Self {
            records: Vec::new(),
            alt_name_wants: Vec::new(),
            phase: Phase::Requesting,
            require_all,
        }
    }

    /// Register a wanted key by UUID. Duplicate registrations are collapsed.
    pub fn request_id(&mut self, id: Uuid) -> Result<()> {
        if self.phase != Phase::Requesting {
            return Err(Error::client("key broker is no longer accepting requests"));
        }
        if !self.records.iter().any(|r| r.id == id) {
            trace!(key_id = %id, "key requested");
            self.records.push(KeyRecord::empty(id));
        }
        Ok(())
    }

    /// Register a wanted key by alternate name. Duplicates are collapsed.
    pub fn request_alt_name(&mut self, name: &str) -> Result<()> {
        if self.phase != Phase::Requesting {
            return Err(Error::client("key broker is no longer accepting requests"));
        }
        if !self.alt_name_wants.iter().any(|w| w.name == name) {
            trace!(key_alt_name = name, "key requested by alternate name");
            self.alt_name_wants.push(AltNameWant {
                name: name.to_owned(),
                resolved: None,
            });
        }
        Ok(())
    }

    /// Returns `true` if any want has been registered.
    pub fn has_wants(&self) -> bool {
        !self.records.is_empty() || !self.alt_name_wants.is_empty()
    }

    /// Produce the key-vault query selecting every wanted key, and start
    /// accepting key documents.
    pub fn filter(&mut self) -> Result<Value> {
        match self.phase {
            Phase::Requesting => self.phase = Phase::Adding,
            Phase::Adding => {}
            _ => return Err(Error::client("key broker is no longer fetching keys")),
        }

        let ids: Vec<Value> = self
            .records
            .iter()
            .map(|r| Value::String(r.id.to_string()))
            .collect();
        let names: Vec<Value> = self
            .alt_name_wants
            .iter()
            .map(|w| Value::String(w.name.clone()))
            .collect();

        Ok(json!({
            "$or": [
                { "_id": { "$in": ids } },
                { "keyAltNames": { "$in": names } },
            ]
        }))
    }

    /// Ingest one fetched key document.
    ///
    /// Documents are deduplicated by UUID: an identical re-observation is
    /// accepted silently; contradictory contents are a client error. A
    /// document matching no registered want is rejected.
    pub fn add_doc(&mut self, doc: &Value) -> Result<()> {
        if self.phase != Phase::Adding {
            return Err(Error::client("key broker is not accepting key documents"));
        }

        let key = KeyDocument::parse(doc)?;

        if let Some(record) = self.records.iter_mut().find(|r| r.id == key.id) {
            match record.state {
                RecordState::Empty => {
                    trace!(key_id = %key.id, provider = key.kek.provider(), "key document added");
                    Self::resolve_alt_names(&mut self.alt_name_wants, &key);
                    record.doc = Some(key);
                    record.state = RecordState::Encrypted;
                    Ok(())
                }
                _ => {
                    if record.doc.as_ref() == Some(&key) {
                        Ok(())
                    } else {
                        Err(Error::client(format!(
                            "contradictory key document for key {}",
                            key.id
                        )))
                    }
                }
            }
        } else if key
            .key_alt_names
            .iter()
            .any(|n| self.alt_name_wants.iter().any(|w| w.resolved.is_none() && w.name == *n))
        {
            trace!(key_id = %key.id, "key document added for alternate-name want");
            Self::resolve_alt_names(&mut self.alt_name_wants, &key);
            let mut record = KeyRecord::empty(key.id);
            record.doc = Some(key);
            record.state = RecordState::Encrypted;
            self.records.push(record);
            Ok(())
        } else {
            Err(Error::client(format!(
                "unexpected key document: key {} was not requested",
                key.id
            )))
        }
    }

    fn resolve_alt_names(wants: &mut [AltNameWant], key: &KeyDocument) {
        for want in wants.iter_mut() {
            if want.resolved.is_none() && key.key_alt_names.iter().any(|n| *n == want.name) {
                want.resolved = Some(key.id);
            }
        }
    }

    /// Close ingestion and schedule an unwrap for every fetched key.
    ///
    /// `local`-provider keys are unwrapped synchronously through the handle's
    /// crypto hooks; remote providers get a [`KmsContext`] each, built only
    /// when credentials for that provider are configured.
    pub fn done_adding_docs(&mut self, crypt: &Crypt) -> Result<()> {
        match self.phase {
            Phase::Requesting | Phase::Adding => {}
            _ => return Err(Error::client("key broker has already closed ingestion")),
        }

        if self.require_all {
            if let Some(record) = self.records.iter().find(|r| r.state == RecordState::Empty) {
                return Err(Error::client(format!("missing key: {}", record.id)));
            }
            if let Some(want) = self.alt_name_wants.iter().find(|w| w.resolved.is_none()) {
                return Err(Error::client(format!(
                    "missing key with keyAltName: '{}'",
                    want.name
                )));
            }
        }

        for record in &mut self.records {
            if record.state != RecordState::Encrypted {
                continue;
            }
            let doc = match &record.doc {
                Some(d) => d,
                None => return Err(Error::internal("encrypted record has no document")),
            };

            if !crypt.options().has_provider(doc.kek.provider()) {
                return Err(Error::client(format!(
                    "no credentials configured for KMS provider '{}'",
                    doc.kek.provider()
                )));
            }

            match &doc.kek {
                KekDescriptor::Local => {
                    record.material = Some(unwrap_local(crypt, doc)?);
                    record.state = RecordState::Decrypted;
                }
                KekDescriptor::Aws {
                    key,
                    region,
                    endpoint,
                } => {
                    record.kms = Some(KmsContext::for_aws(
                        key,
                        region,
                        endpoint.as_ref(),
                        &doc.key_material,
                    ));
                    record.state = RecordState::Decrypting;
                }
                KekDescriptor::Azure {
                    key_vault_endpoint,
                    key_name,
                    key_version,
                } => {
                    record.kms = Some(KmsContext::for_azure(
                        key_vault_endpoint,
                        key_name,
                        key_version.as_deref(),
                        &doc.key_material,
                    ));
                    record.state = RecordState::Decrypting;
                }
                KekDescriptor::Gcp {
                    project_id,
                    location,
                    key_ring,
                    key_name,
                    key_version,
                    endpoint,
                } => {
                    record.kms = Some(KmsContext::for_gcp(
                        project_id,
                        location,
                        key_ring,
                        key_name,
                        key_version.as_deref(),
                        endpoint.as_ref(),
                        &doc.key_material,
                    ));
                    record.state = RecordState::Decrypting;
                }
            }
        }

        self.phase = Phase::Closed;
        debug!(
            records = self.records.len(),
            pending_kms = self.records.iter().filter(|r| r.state == RecordState::Decrypting).count(),
            "key ingestion closed"
        );
        Ok(())
    }

    /// Returns `true` while any record still has a KMS exchange to drive.
    pub fn needs_kms(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.state == RecordState::Decrypting && r.kms.as_ref().is_some_and(KmsContext::has_work))
    }

    /// The next KMS exchange with outstanding work, in insertion order.
    ///
    /// Returns `None` when none remain. Iteration is resumable: finished
    /// exchanges are skipped, so callers may drain cooperatively.
    pub fn next_kms(&mut self) -> Option<&mut KmsContext> {
        let idx = self.records.iter().position(|r| {
            r.state == RecordState::Decrypting && r.kms.as_ref().is_some_and(KmsContext::has_work)
        })?;
        self.records[idx].kms.as_mut()
    }

    /// Verify that every scheduled exchange finished, harvesting plaintext.
    ///
    /// # Errors
    ///
    /// Fails with a client error when any exchange still has outstanding
    /// work, or with the first exchange error otherwise; either failure moves
    /// the broker to its failed state.
    pub fn kms_done(&mut self) -> Result<()> {
        if self.phase != Phase::Closed {
            return Err(Error::client("key broker is not awaiting KMS results"));
        }

        let mut first_error: Option<Error> = None;
        for record in &mut self.records {
            if record.state != RecordState::Decrypting {
                continue;
            }
            let kms = match record.kms.take() {
                Some(k) => k,
                None => return Err(Error::internal("decrypting record has no KMS context")),
            };

            if let Some(err) = kms.error() {
                record.state = RecordState::Errored;
                first_error.get_or_insert_with(|| err.clone());
            } else if let Some(material) = kms.plaintext() {
                record.material = Some(material.clone());
                record.state = RecordState::Decrypted;
            } else {
                record.state = RecordState::Errored;
                first_error.get_or_insert_with(|| {
                    Error::client(format!("KMS exchange for key {} is incomplete", record.id))
                });
            }
        }

        match first_error {
            Some(err) => {
                self.phase = Phase::Failed;
                Err(err)
            }
            None => {
                self.phase = Phase::Satisfied;
                debug!(records = self.records.len(), "key broker satisfied");
                Ok(())
            }
        }
    }

    /// `true` once every wanted key is decrypted.
    pub fn satisfied(&self) -> bool {
        self.phase == Phase::Satisfied
    }

    /// Plaintext material for the key with `id`.
    ///
    /// # Errors
    ///
    /// Fails with a client error unless the broker is satisfied and holds a
    /// decrypted record for `id`.
    pub fn decrypted_key_for(&self, id: &Uuid) -> Result<&KeyMaterial> {
        if !self.satisfied() {
            return Err(Error::client("key broker is not satisfied"));
        }
        self.records
            .iter()
            .find(|r| r.id == *id && r.state == RecordState::Decrypted)
            .and_then(|r| r.material.as_ref())
            .ok_or_else(|| Error::client(format!("no decrypted key for id {id}")))
    }

    /// Plaintext material for the key carrying the alternate name `name`,
    /// along with the key's UUID.
    pub fn decrypted_key_by_alt_name(&self, name: &str) -> Result<(Uuid, &KeyMaterial)> {
        if !self.satisfied() {
            return Err(Error::client("key broker is not satisfied"));
        }
        self.records
            .iter()
            .find(|r| {
                r.state == RecordState::Decrypted
                    && r.doc
                        .as_ref()
                        .is_some_and(|d| d.key_alt_names.iter().any(|n| n == name))
            })
            .and_then(|r| r.material.as_ref().map(|m| (r.id, m)))
            .ok_or_else(|| Error::client(format!("no decrypted key with keyAltName '{name}'")))
    }
}

/// Unwrap a `local`-provider key synchronously: the stored `keyMaterial` is
/// the encoded `v1.<nonce>.<ciphertext>` form under the configured local key.
fn unwrap_local(crypt: &Crypt, doc: &KeyDocument) -> Result<KeyMaterial> {
    let local_key = crypt
        .options()
        .local_key
        .as_ref()
        .ok_or_else(|| Error::client("no credentials configured for KMS provider 'local'"))?;

    let encoded = std::str::from_utf8(&doc.key_material)
        .map_err(|_| Error::kms(format!("key {} has malformed local key material", doc.id)))?;
    let field: EncryptedField = encoded
        .parse()
        .map_err(|_| Error::kms(format!("key {} has malformed local key material", doc.id)))?;

    let plaintext = crypt
        .crypto()
        .decrypt(local_key.as_bytes(), &field)
        .map_err(|e| Error::kms(format!("failed to unwrap key {} locally: {e}", doc.id)))?;

    KeyMaterial::from_slice(&plaintext)
        .map_err(|_| Error::kms(format!("key {} unwrapped to an invalid length", doc.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::Crypt;
    use crate::crypto::{encrypt_field, KEY_LEN};
    use crate::options::CryptOptions;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use std::sync::Arc;

    fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    fn aws_key_doc(id: Uuid) -> Value {
        json!({
            "_id": id.to_string(),
            "keyMaterial": STANDARD.encode(b"wrapped"),
            "masterKey": {
                "provider": "aws",
                "region": "us-east-1",
                "key": "arn:aws:kms:us-east-1:1234:key/abcd",
            },
        })
    }

    fn aws_crypt() -> Arc<Crypt> {
        let options = CryptOptions::new().with_aws(crate::options::AwsCredentials {
            access_key_id: "AKIA".into(),
            secret_access_key: "secret".into(),
            session_token: None,
        });
        Crypt::builder().options(options).build().unwrap()
    }

    fn feed_ok(kms: &mut KmsContext) {
        let reply = json!({"Plaintext": STANDARD.encode([1u8; KEY_LEN])}).to_string();
        kms.feed(reply.as_bytes()).unwrap();
    }

    #[test]
    fn filter_selects_ids_and_alt_names() {
        let mut broker = KeyBroker::new(true);
        broker.request_id(uuid(1)).unwrap();
        broker.request_id(uuid(2)).unwrap();
        broker.request_alt_name("payroll").unwrap();

        let filter = broker.filter().unwrap();
        let arms = filter["$or"].as_array().unwrap();
        assert_eq!(arms[0]["_id"]["$in"].as_array().unwrap().len(), 2);
        assert_eq!(arms[1]["keyAltNames"]["$in"][0], "payroll");
    }

    #[test]
    fn duplicate_wants_collapse() {
        let mut broker = KeyBroker::new(true);
        broker.request_id(uuid(1)).unwrap();
        broker.request_id(uuid(1)).unwrap();
        broker.request_alt_name("a").unwrap();
        broker.request_alt_name("a").unwrap();
        let filter = broker.filter().unwrap();
        assert_eq!(filter["$or"][0]["_id"]["$in"].as_array().unwrap().len(), 1);
        assert_eq!(
            filter["$or"][1]["keyAltNames"]["$in"].as_array().unwrap().len(),
            1
        );
    }

    #[test]
    fn add_doc_dedup_identical_silently() {
        let mut broker = KeyBroker::new(true);
        broker.request_id(uuid(1)).unwrap();
        broker.filter().unwrap();
        broker.add_doc(&aws_key_doc(uuid(1))).unwrap();
        broker.add_doc(&aws_key_doc(uuid(1))).unwrap();
    }

    #[test]
    fn add_doc_rejects_contradiction() {
        let mut broker = KeyBroker::new(true);
        broker.request_id(uuid(1)).unwrap();
        broker.filter().unwrap();
        broker.add_doc(&aws_key_doc(uuid(1))).unwrap();

        let mut conflicting = aws_key_doc(uuid(1));
        conflicting["masterKey"]["key"] = json!("arn:aws:kms:us-east-1:1234:key/other");
        let err = broker.add_doc(&conflicting).unwrap_err();
        assert_eq!(err.kind, common::ErrorKind::Client);
        assert!(err.message.contains("contradictory"));
    }

    #[test]
    fn add_doc_rejects_unrequested_key() {
        let mut broker = KeyBroker::new(true);
        broker.request_id(uuid(1)).unwrap();
        broker.filter().unwrap();
        let err = broker.add_doc(&aws_key_doc(uuid(9))).unwrap_err();
        assert!(err.message.contains("was not requested"));
    }

    #[test]
    fn add_doc_requires_filter_first() {
        let mut broker = KeyBroker::new(true);
        broker.request_id(uuid(1)).unwrap();
        assert!(broker.add_doc(&aws_key_doc(uuid(1))).is_err());
    }

    #[test]
    fn alt_name_want_resolves_to_new_record() {
        let mut broker = KeyBroker::new(true);
        broker.request_alt_name("payroll").unwrap();
        broker.filter().unwrap();

        let mut doc = aws_key_doc(uuid(3));
        doc["keyAltNames"] = json!(["payroll"]);
        broker.add_doc(&doc).unwrap();
        broker.done_adding_docs(&aws_crypt()).unwrap();
        assert!(broker.needs_kms());
    }

    #[test]
    fn missing_key_fails_when_required() {
        let crypt = aws_crypt();
        let mut broker = KeyBroker::new(true);
        broker.request_id(uuid(1)).unwrap();
        broker.filter().unwrap();
        let err = broker.done_adding_docs(&crypt).unwrap_err();
        assert_eq!(err.kind, common::ErrorKind::Client);
        assert!(err.message.contains("missing key"));
    }

    #[test]
    fn missing_key_tolerated_when_not_required() {
        let crypt = aws_crypt();
        let mut broker = KeyBroker::new(false);
        broker.request_id(uuid(1)).unwrap();
        broker.filter().unwrap();
        broker.done_adding_docs(&crypt).unwrap();
        assert!(!broker.needs_kms());
        broker.kms_done().unwrap();
        // Satisfied, but the unfetched key is still unavailable.
        assert!(broker.decrypted_key_for(&uuid(1)).is_err());
    }

    #[test]
    fn missing_credentials_rejected_at_close() {
        let crypt = Crypt::builder().build().unwrap(); // no providers
        let mut broker = KeyBroker::new(true);
        broker.request_id(uuid(1)).unwrap();
        broker.filter().unwrap();
        broker.add_doc(&aws_key_doc(uuid(1))).unwrap();
        let err = broker.done_adding_docs(&crypt).unwrap_err();
        assert!(err.message.contains("no credentials configured"));
        assert!(err.message.contains("aws"));
    }

    #[test]
    fn kms_iteration_is_deterministic_and_resumable() {
        let crypt = aws_crypt();
        let mut broker = KeyBroker::new(true);
        for n in 1..=3u8 {
            broker.request_id(uuid(n)).unwrap();
        }
        broker.filter().unwrap();
        for n in 1..=3u8 {
            broker.add_doc(&aws_key_doc(uuid(n))).unwrap();
        }
        broker.done_adding_docs(&crypt).unwrap();

        // First unfinished exchange is the first inserted key; finishing it
        // moves iteration to the next, in order.
        for _ in 1..=3 {
            let kms = broker.next_kms().expect("expected outstanding exchange");
            feed_ok(kms);
        }
        assert!(broker.next_kms().is_none());
        broker.kms_done().unwrap();
        assert!(broker.satisfied());
        for n in 1..=3u8 {
            assert_eq!(broker.decrypted_key_for(&uuid(n)).unwrap().as_bytes(), &[1u8; KEY_LEN]);
        }
    }

    #[test]
    fn kms_done_with_outstanding_work_fails() {
        let crypt = aws_crypt();
        let mut broker = KeyBroker::new(true);
        broker.request_id(uuid(1)).unwrap();
        broker.filter().unwrap();
        broker.add_doc(&aws_key_doc(uuid(1))).unwrap();
        broker.done_adding_docs(&crypt).unwrap();

        let err = broker.kms_done().unwrap_err();
        assert!(err.message.contains("incomplete"));
        assert!(!broker.satisfied());
    }

    #[test]
    fn kms_error_promoted_as_first_error() {
        let crypt = aws_crypt();
        let mut broker = KeyBroker::new(true);
        broker.request_id(uuid(1)).unwrap();
        broker.filter().unwrap();
        broker.add_doc(&aws_key_doc(uuid(1))).unwrap();
        broker.done_adding_docs(&crypt).unwrap();

        broker.next_kms().unwrap().fail_network("connection reset");
        let err = broker.kms_done().unwrap_err();
        assert_eq!(err.kind, common::ErrorKind::Network);
        assert!(err.message.contains("connection reset"));
    }

    #[test]
    fn local_keys_unwrap_without_kms() {
        let local_key = [5u8; KEY_LEN];
        let dek = [9u8; KEY_LEN];
        let wrapped = encrypt_field(&dek, &local_key).unwrap().to_string_repr();

        let options = CryptOptions::new()
            .with_local_key(KeyMaterial::from_slice(&local_key).unwrap());
        let crypt = Crypt::builder().options(options).build().unwrap();

        let doc = json!({
            "_id": uuid(7).to_string(),
            "keyMaterial": STANDARD.encode(wrapped.as_bytes()),
            "masterKey": {"provider": "local"},
        });

        let mut broker = KeyBroker::new(true);
        broker.request_id(uuid(7)).unwrap();
        broker.filter().unwrap();
        broker.add_doc(&doc).unwrap();
        broker.done_adding_docs(&crypt).unwrap();

        assert!(!broker.needs_kms());
        assert!(broker.next_kms().is_none());
        broker.kms_done().unwrap();
        assert_eq!(broker.decrypted_key_for(&uuid(7)).unwrap().as_bytes(), &dek);
    }

    #[test]
    fn satisfied_broker_is_immutable() {
        let crypt = aws_crypt();
        let mut broker = KeyBroker::new(false);
        broker.filter().unwrap();
        broker.done_adding_docs(&crypt).unwrap();
        broker.kms_done().unwrap();
        assert!(broker.satisfied());

        assert!(broker.request_id(uuid(1)).is_err());
        assert!(broker.add_doc(&aws_key_doc(uuid(1))).is_err());
        assert!(broker.filter().is_err());
        assert!(broker.kms_done().is_err());
    }

    #[test]
    fn alt_name_lookup_returns_id_and_material() {
        let crypt = aws_crypt();
        let mut broker = KeyBroker::new(true);
        broker.request_alt_name("payroll").unwrap();
        broker.filter().unwrap();

        let mut doc = aws_key_doc(uuid(4));
        doc["keyAltNames"] = json!(["payroll", "hr"]);
        broker.add_doc(&doc).unwrap();
        broker.done_adding_docs(&crypt).unwrap();
        feed_ok(broker.next_kms().unwrap());
        broker.kms_done().unwrap();

        let (id, material) = broker.decrypted_key_by_alt_name("payroll").unwrap();
        assert_eq!(id, uuid(4));
        assert_eq!(material.as_bytes(), &[1u8; KEY_LEN]);
        assert!(broker.decrypted_key_by_alt_name("unknown").is_err());
    }

    #[test]
    fn missing_alt_name_fails_when_required() {
        let crypt = aws_crypt();
        let mut broker = KeyBroker::new(true);
        broker.request_alt_name("ghost").unwrap();
        broker.filter().unwrap();
        let err = broker.done_adding_docs(&crypt).unwrap_err();
        assert!(err.message.contains("ghost"));
    }
}
