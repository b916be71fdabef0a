//! TMS (Trust Management Service) core library
//!
//! HSM-backed key lifecycle, document signing and ledger-gated signature
//! verification over pluggable document store, key registry and ledger
//! collaborators.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod config;
pub mod engine;
pub mod error;
pub mod hsm;
pub mod issuer;
pub mod keys;
pub mod store;
pub mod types;

pub use config::{HsmConfig, IssuerConfig};
pub use error::TmsError;
pub use hsm::{
    Hsm, HsmError, HsmSession, KeyClass, MemorySessionManager, MemoryToken, ObjectHandle,
    Pkcs11SessionManager, SessionManager, TokenSession,
};
pub use issuer::SignatureIssuer;
pub use keys::KeyManager;
pub use store::{
    AppendReceipt, DocumentStore, KeyRegistry, LedgerRecord, MemoryDocumentStore,
    MemoryKeyRegistry, MemoryLedger, SignatureLedger, StoreError,
};
pub use types::{CompositeId, Document, Owner, SignatureResult};
