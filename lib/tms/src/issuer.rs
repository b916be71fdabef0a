//! Signature issuance and verification
//!
//! Signing fetches the document, signs its content in the token and records
//! the base64 signature in the ledger under the composite id of
//! `(document, owner, label)`. Verification first requires the caller's
//! signature to match the ledger record byte for byte, and only then checks
//! the recorded signature against the current document content.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine;
use crate::error::TmsError;
use crate::hsm::{Hsm, KeyClass};
use crate::keys::find_key_by_label;
use crate::store::{DocumentStore, SignatureLedger};
use crate::types::{CompositeId, Document, SignatureResult, decode_signature, encode_signature};

const SIGN_STEP: &str = "sign document";
const VERIFY_STEP: &str = "verify signature";

pub struct SignatureIssuer {
    hsm: Hsm,
    documents: Arc<dyn DocumentStore>,
    ledger: Arc<dyn SignatureLedger>,
    collaborator_timeout: Duration,
}

impl std::fmt::Debug for SignatureIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureIssuer")
            .field("hsm", &self.hsm)
            .field("collaborator_timeout", &self.collaborator_timeout)
            .finish_non_exhaustive()
    }
}

async fn bounded<T>(
    limit: Duration,
    step: &'static str,
    call: impl Future<Output = Result<T, TmsError>>,
) -> Result<T, TmsError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| TmsError::Timeout { step })?
}

fn require(value: &str, name: &str) -> Result<(), TmsError> {
    if value.is_empty() {
        return Err(TmsError::InvalidRequest(format!("{} cannot be empty", name)));
    }
    Ok(())
}

impl SignatureIssuer {
    pub fn new(
        hsm: Hsm,
        documents: Arc<dyn DocumentStore>,
        ledger: Arc<dyn SignatureLedger>,
        collaborator_timeout: Duration,
    ) -> Self {
        Self {
            hsm,
            documents,
            ledger,
            collaborator_timeout,
        }
    }

    async fn fetch_document(&self, document_id: &str) -> Result<Document, TmsError> {
        bounded(self.collaborator_timeout, "fetch document", async {
            self.documents
                .get_document(document_id)
                .await
                .map_err(|e| TmsError::from_document_store(document_id, e))
        })
        .await
    }

    /// Sign the document's content with the private key for `key_label` and
    /// record the signature in the ledger.
    ///
    /// Re-signing the same triple addresses the same ledger record.
    pub async fn sign_document(
        &self,
        key_label: &str,
        owner_id: &str,
        document_id: &str,
    ) -> Result<SignatureResult, TmsError> {
        require(key_label, "Key label")?;
        require(owner_id, "Owner id")?;
        require(document_id, "Document id")?;

        let document = self.fetch_document(document_id).await?;

        let label = key_label.to_string();
        let payload = document.content.into_bytes();
        let raw = self
            .hsm
            .with_session(SIGN_STEP, move |session, abort| {
                let key = find_key_by_label(session, &label, KeyClass::Private)?;
                abort.check(SIGN_STEP)?;
                engine::sign(session, key, &payload).map_err(TmsError::from)
            })
            .await?;
        let signature = encode_signature(&raw);

        let id = CompositeId::new(document_id, owner_id, key_label);
        let receipt = bounded(self.collaborator_timeout, "ledger append", async {
            self.ledger
                .append(&id, &signature)
                .await
                .map_err(|e| TmsError::from_ledger(id.as_str(), e))
        })
        .await?;

        if !receipt.success {
            warn!(record = %id, "Ledger did not acknowledge signature");
            return Err(TmsError::LedgerRejected(format!(
                "append of {} not acknowledged",
                id
            )));
        }

        info!(record = %id, "Signature issued");
        Ok(SignatureResult {
            signature,
            valid: true,
        })
    }

    /// Check a presented signature against the ledger and the current
    /// document content.
    ///
    /// A signature that differs from the recorded one is reported as invalid
    /// without touching the token. Otherwise the recorded signature is
    /// verified with the public key for `key_label`.
    pub async fn verify_signature(
        &self,
        signature: &str,
        document_id: &str,
        key_label: &str,
        owner_id: &str,
    ) -> Result<SignatureResult, TmsError> {
        require(key_label, "Key label")?;
        require(owner_id, "Owner id")?;
        require(document_id, "Document id")?;

        let document = self.fetch_document(document_id).await?;

        let id = CompositeId::new(document_id, owner_id, key_label);
        let record = bounded(self.collaborator_timeout, "ledger lookup", async {
            self.ledger
                .get(&id)
                .await
                .map_err(|e| TmsError::from_ledger(id.as_str(), e))
        })
        .await?;

        let presented = decode_signature(signature)
            .map_err(|e| TmsError::InvalidSignatureEncoding(e.to_string()))?;
        let recorded = decode_signature(&record.signature)
            .map_err(|e| TmsError::LedgerCorrupt(format!("{}: {}", id, e)))?;

        if presented != recorded {
            warn!(record = %id, "Presented signature does not match ledger");
            return Ok(SignatureResult {
                signature: signature.to_string(),
                valid: false,
            });
        }

        let label = key_label.to_string();
        let payload = document.content.into_bytes();
        let valid = self
            .hsm
            .with_session(VERIFY_STEP, move |session, abort| {
                let key = find_key_by_label(session, &label, KeyClass::Public)?;
                abort.check(VERIFY_STEP)?;
                engine::verify(session, key, &payload, &recorded).map_err(TmsError::from)
            })
            .await?;

        if valid {
            info!(record = %id, "Signature verified");
        } else {
            warn!(record = %id, "Recorded signature does not verify over current content");
        }

        Ok(SignatureResult {
            signature: record.signature,
            valid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsm::MemoryToken;
    use crate::keys::KeyManager;
    use crate::store::{MemoryDocumentStore, MemoryKeyRegistry, MemoryLedger};

    struct Fixture {
        token: MemoryToken,
        documents: Arc<MemoryDocumentStore>,
        ledger: Arc<MemoryLedger>,
        keys: KeyManager,
        issuer: SignatureIssuer,
    }

    fn fixture() -> Fixture {
        let token = MemoryToken::new("tms", "1234");
        let hsm = Hsm::new(
            Arc::new(token.session_manager("tms", "1234")),
            Duration::from_secs(5),
        );
        let documents = Arc::new(MemoryDocumentStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let keys = KeyManager::new(
            hsm.clone(),
            Arc::new(MemoryKeyRegistry::new()),
            Duration::from_secs(5),
        );
        let issuer = SignatureIssuer::new(
            hsm,
            documents.clone(),
            ledger.clone(),
            Duration::from_secs(5),
        );
        documents.insert_content("doc-1", "user-1", "hello");
        Fixture {
            token,
            documents,
            ledger,
            keys,
            issuer,
        }
    }

    #[tokio::test]
    async fn test_sign_then_verify() {
        let f = fixture();
        f.keys.generate_key_pair("user-1", "label-A").await.unwrap();

        let signed = f
            .issuer
            .sign_document("label-A", "user-1", "doc-1")
            .await
            .unwrap();
        assert!(signed.valid);

        let id = CompositeId::new("doc-1", "user-1", "label-A");
        assert_eq!(f.ledger.get(&id).await.unwrap().signature, signed.signature);

        let verified = f
            .issuer
            .verify_signature(&signed.signature, "doc-1", "label-A", "user-1")
            .await
            .unwrap();
        assert!(verified.valid);
        assert_eq!(verified.signature, signed.signature);
        assert_eq!(f.token.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_mismatch_is_invalid_without_touching_token() {
        let f = fixture();
        f.keys.generate_key_pair("user-1", "label-A").await.unwrap();
        f.issuer
            .sign_document("label-A", "user-1", "doc-1")
            .await
            .unwrap();

        let presented = encode_signature(b"not the recorded signature");
        f.token.set_fail_crypto(true);
        let calls = f.token.crypto_calls();

        let result = f
            .issuer
            .verify_signature(&presented, "doc-1", "label-A", "user-1")
            .await
            .unwrap();

        assert!(!result.valid);
        assert_eq!(result.signature, presented);
        assert_eq!(f.token.crypto_calls(), calls);
    }

    #[tokio::test]
    async fn test_changed_content_is_invalid() {
        let f = fixture();
        f.keys.generate_key_pair("user-1", "label-A").await.unwrap();
        let signed = f
            .issuer
            .sign_document("label-A", "user-1", "doc-1")
            .await
            .unwrap();

        assert!(f.documents.update_content("doc-1", "hello, edited"));

        let result = f
            .issuer
            .verify_signature(&signed.signature, "doc-1", "label-A", "user-1")
            .await
            .unwrap();
        assert!(!result.valid);
        assert_eq!(result.signature, signed.signature);
    }

    #[tokio::test]
    async fn test_resigning_overwrites_same_ledger_record() {
        let f = fixture();
        f.keys.generate_key_pair("user-1", "label-A").await.unwrap();

        f.issuer
            .sign_document("label-A", "user-1", "doc-1")
            .await
            .unwrap();
        let second = f
            .issuer
            .sign_document("label-A", "user-1", "doc-1")
            .await
            .unwrap();

        assert_eq!(f.ledger.len(), 1);
        assert_eq!(f.ledger.append_count(), 2);
        let verified = f
            .issuer
            .verify_signature(&second.signature, "doc-1", "label-A", "user-1")
            .await
            .unwrap();
        assert!(verified.valid);
    }

    #[tokio::test]
    async fn test_unacknowledged_append_is_ledger_rejected() {
        let f = fixture();
        f.keys.generate_key_pair("user-1", "label-A").await.unwrap();
        f.ledger.set_reject_appends(true);

        let err = f
            .issuer
            .sign_document("label-A", "user-1", "doc-1")
            .await
            .unwrap_err();
        assert!(matches!(err, TmsError::LedgerRejected(_)));
        assert!(!err.is_client_error());
    }

    #[tokio::test]
    async fn test_unreachable_ledger_is_backend_error() {
        let f = fixture();
        f.keys.generate_key_pair("user-1", "label-A").await.unwrap();
        f.ledger.set_unavailable(true);

        let err = f
            .issuer
            .sign_document("label-A", "user-1", "doc-1")
            .await
            .unwrap_err();
        assert!(matches!(err, TmsError::LedgerUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unknown_document_and_key() {
        let f = fixture();
        f.keys.generate_key_pair("user-1", "label-A").await.unwrap();

        let err = f
            .issuer
            .sign_document("label-A", "user-1", "doc-404")
            .await
            .unwrap_err();
        assert!(matches!(err, TmsError::DocumentNotFound(_)));

        let err = f
            .issuer
            .sign_document("label-Z", "user-1", "doc-1")
            .await
            .unwrap_err();
        assert!(matches!(err, TmsError::KeyNotFound(_)));
        assert!(f.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_verify_without_record_and_with_bad_encoding() {
        let f = fixture();
        f.keys.generate_key_pair("user-1", "label-A").await.unwrap();

        let err = f
            .issuer
            .verify_signature("AAAA", "doc-1", "label-A", "user-1")
            .await
            .unwrap_err();
        assert!(matches!(err, TmsError::SignatureNotRecorded(_)));

        f.issuer
            .sign_document("label-A", "user-1", "doc-1")
            .await
            .unwrap();
        let err = f
            .issuer
            .verify_signature("not base64!", "doc-1", "label-A", "user-1")
            .await
            .unwrap_err();
        assert!(matches!(err, TmsError::InvalidSignatureEncoding(_)));
    }

    #[tokio::test]
    async fn test_corrupt_ledger_record() {
        let f = fixture();
        f.keys.generate_key_pair("user-1", "label-A").await.unwrap();
        let id = CompositeId::new("doc-1", "user-1", "label-A");
        f.ledger.tamper(&id, "%%%");

        let err = f
            .issuer
            .verify_signature("AAAA", "doc-1", "label-A", "user-1")
            .await
            .unwrap_err();
        assert!(matches!(err, TmsError::LedgerCorrupt(_)));
    }

    #[tokio::test]
    async fn test_empty_inputs_are_rejected() {
        let f = fixture();
        let err = f
            .issuer
            .sign_document("", "user-1", "doc-1")
            .await
            .unwrap_err();
        assert!(matches!(err, TmsError::InvalidRequest(_)));
        assert_eq!(f.token.sessions_opened(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_signing_keeps_keys_apart() {
        let f = Arc::new(fixture());
        let labels: Vec<String> = (0..8).map(|i| format!("label-{}", i)).collect();
        for label in &labels {
            f.keys.generate_key_pair("user-1", label).await.unwrap();
        }

        // Slow lookups keep several sessions open at once.
        f.token.set_lookup_delay(Duration::from_millis(20));

        let mut handles = Vec::new();
        for label in labels.clone() {
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                let signed = f.issuer.sign_document(&label, "user-1", "doc-1").await;
                (label, signed)
            }));
        }

        let mut issued = Vec::new();
        for handle in handles {
            let (label, signed) = handle.await.unwrap();
            let signed = signed.unwrap_or_else(|e| panic!("signing with {} failed: {}", label, e));
            issued.push((label, signed.signature));
        }
        assert!(f.token.peak_open_sessions() > 1);
        assert_eq!(f.token.operation_conflicts(), 0);

        for (label, signature) in &issued {
            let result = f
                .issuer
                .verify_signature(signature, "doc-1", label, "user-1")
                .await
                .unwrap();
            assert!(result.valid, "{} should verify under its own key", label);
        }

        let (label_a, signature_a) = &issued[0];
        let (label_b, _) = &issued[1];
        let cross = f
            .hsm_verify_under(label_b, signature_a)
            .await
            .unwrap();
        assert!(!cross, "{} signature verified under {}", label_a, label_b);

        assert_eq!(f.token.open_sessions(), 0);
        assert!(!f.token.is_logged_in());
    }

    impl Fixture {
        async fn hsm_verify_under(&self, label: &str, signature: &str) -> Result<bool, TmsError> {
            let raw = decode_signature(signature).unwrap();
            let label = label.to_string();
            self.issuer
                .hsm
                .with_session("cross verify", move |session, _| {
                    engine::verify_with_label(session, &label, b"hello", &raw)
                        .map_err(TmsError::from)
                })
                .await
        }
    }
}
