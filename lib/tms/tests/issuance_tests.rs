#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end issuance tests against the in-memory token and stores
//!
//! The SoftHSM tests at the bottom need an initialized SoftHSM2 token and are
//! ignored by default. Run them with:
//!
//! ```text
//! softhsm2-util --init-token --free --label tms --pin 1234 --so-pin 5678
//! SOFTHSM2_LIBRARY=/usr/lib/softhsm/libsofthsm2.so cargo test -p tms -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use tms::{
    CompositeId, Hsm, HsmConfig, KeyClass, KeyManager, MemoryDocumentStore, MemoryKeyRegistry,
    MemoryLedger, MemoryToken, Pkcs11SessionManager, SessionManager, SignatureIssuer,
    SignatureLedger, TmsError,
};

struct Service {
    keys: KeyManager,
    issuer: SignatureIssuer,
    documents: Arc<MemoryDocumentStore>,
    registry: Arc<MemoryKeyRegistry>,
    ledger: Arc<MemoryLedger>,
}

fn service(sessions: Arc<dyn SessionManager>) -> Service {
    let hsm = Hsm::new(sessions, Duration::from_secs(30));
    let documents = Arc::new(MemoryDocumentStore::new());
    let registry = Arc::new(MemoryKeyRegistry::new());
    let ledger = Arc::new(MemoryLedger::new());
    Service {
        keys: KeyManager::new(hsm.clone(), registry.clone(), Duration::from_secs(5)),
        issuer: SignatureIssuer::new(
            hsm,
            documents.clone(),
            ledger.clone(),
            Duration::from_secs(5),
        ),
        documents,
        registry,
        ledger,
    }
}

async fn run_lifecycle(service: &Service, label: &str) {
    service
        .documents
        .insert_content("doc-1", "user-1", "hello");

    service.keys.generate_key_pair("user-1", label).await.unwrap();
    assert_eq!(service.registry.owner_of(label).as_deref(), Some("user-1"));

    let signed = service
        .issuer
        .sign_document(label, "user-1", "doc-1")
        .await
        .unwrap();
    assert!(signed.valid);

    let id = CompositeId::new("doc-1", "user-1", label);
    assert_eq!(
        service.ledger.get(&id).await.unwrap().signature,
        signed.signature
    );

    let verified = service
        .issuer
        .verify_signature(&signed.signature, "doc-1", label, "user-1")
        .await
        .unwrap();
    assert!(verified.valid);

    service.documents.update_content("doc-1", "hello!");
    let verified = service
        .issuer
        .verify_signature(&signed.signature, "doc-1", label, "user-1")
        .await
        .unwrap();
    assert!(!verified.valid);

    service.keys.delete_key_pair("user-1", label).await.unwrap();
    assert!(service.registry.owner_of(label).is_none());
    assert!(
        !service
            .keys
            .key_exists(label, KeyClass::Private)
            .await
            .unwrap()
    );
    assert!(
        !service
            .keys
            .key_exists(label, KeyClass::Public)
            .await
            .unwrap()
    );

    let err = service
        .issuer
        .sign_document(label, "user-1", "doc-1")
        .await
        .unwrap_err();
    assert!(matches!(err, TmsError::KeyNotFound(_)));
}

#[tokio::test]
async fn test_generate_sign_verify_delete_with_memory_token() {
    let token = MemoryToken::new("tms", "1234");
    let service = service(Arc::new(token.session_manager("tms", "1234")));

    run_lifecycle(&service, "label-A").await;

    assert_eq!(token.object_count(), 0);
    assert_eq!(token.open_sessions(), 0);
}

#[tokio::test]
async fn test_signing_with_another_owners_triple_is_not_recorded() {
    let token = MemoryToken::new("tms", "1234");
    let service = service(Arc::new(token.session_manager("tms", "1234")));
    service.documents.insert_content("doc-1", "user-1", "hello");
    service
        .keys
        .generate_key_pair("user-1", "label-A")
        .await
        .unwrap();

    let signed = service
        .issuer
        .sign_document("label-A", "user-1", "doc-1")
        .await
        .unwrap();

    let err = service
        .issuer
        .verify_signature(&signed.signature, "doc-1", "label-A", "user-2")
        .await
        .unwrap_err();
    assert!(matches!(err, TmsError::SignatureNotRecorded(_)));
    assert!(err.is_client_error());
}

#[tokio::test]
async fn test_unreachable_token_is_backend_error() {
    let token = MemoryToken::new("tms", "1234");
    let service = service(Arc::new(token.session_manager("other-token", "1234")));
    service.documents.insert_content("doc-1", "user-1", "hello");

    let err = service
        .keys
        .generate_key_pair("user-1", "label-A")
        .await
        .unwrap_err();
    assert!(matches!(err, TmsError::TokenUnavailable(_)));
    assert!(!err.is_client_error());
}

fn softhsm_config() -> Option<HsmConfig> {
    let library = std::env::var("SOFTHSM2_LIBRARY").ok()?;
    let label = std::env::var("SOFTHSM2_TOKEN_LABEL").unwrap_or_else(|_| "tms".to_string());
    let pin = std::env::var("SOFTHSM2_PIN").unwrap_or_else(|_| "1234".to_string());
    Some(HsmConfig::new(&library, &label, &pin))
}

#[tokio::test]
#[ignore = "Requires an initialized SoftHSM2 token"]
async fn test_generate_sign_verify_delete_with_softhsm() {
    let config = softhsm_config().expect("SOFTHSM2_LIBRARY must be set");
    let sessions = Pkcs11SessionManager::connect(&config).expect("Failed to load PKCS#11 module");
    let service = service(Arc::new(sessions));

    let label = format!("tms-test-{}", std::process::id());
    run_lifecycle(&service, &label).await;
}

#[tokio::test]
#[ignore = "Requires an initialized SoftHSM2 token"]
async fn test_softhsm_rejects_wrong_pin() {
    let mut config = softhsm_config().expect("SOFTHSM2_LIBRARY must be set");
    config.pin = "not-the-pin".to_string();
    let sessions = Pkcs11SessionManager::connect(&config).expect("Failed to load PKCS#11 module");
    let service = service(Arc::new(sessions));

    let err = service.keys.list_keys().await.unwrap_err();
    assert!(matches!(err, TmsError::SessionAuthFailed(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "Requires an initialized SoftHSM2 token"]
async fn test_softhsm_concurrent_signing_shares_one_login() {
    let config = softhsm_config().expect("SOFTHSM2_LIBRARY must be set");
    let sessions = Pkcs11SessionManager::connect(&config).expect("Failed to load PKCS#11 module");
    let service = Arc::new(service(Arc::new(sessions)));
    service.documents.insert_content("doc-1", "user-1", "hello");

    let labels: Vec<String> = (0..8)
        .map(|i| format!("tms-test-{}-{}", std::process::id(), i))
        .collect();
    for label in &labels {
        service.keys.generate_key_pair("user-1", label).await.unwrap();
    }

    let mut handles = Vec::new();
    for label in labels.clone() {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let mut signatures = Vec::new();
            for _ in 0..4 {
                let signed = service.issuer.sign_document(&label, "user-1", "doc-1").await;
                signatures.push(signed);
            }
            (label, signatures)
        }));
    }

    for handle in handles {
        let (label, signatures) = handle.await.unwrap();
        for signed in signatures {
            let signed =
                signed.unwrap_or_else(|e| panic!("signing with {} failed: {}", label, e));
            let verified = service
                .issuer
                .verify_signature(&signed.signature, "doc-1", &label, "user-1")
                .await
                .unwrap();
            assert!(verified.valid, "{} signature did not verify", label);
        }
    }

    for label in &labels {
        service.keys.delete_key_pair("user-1", label).await.unwrap();
    }
}
