//! Collaborator stores consumed by the core
//!
//! The document store, key registry and signature ledger are external
//! services. They are synchronized on their side, so the core calls them
//! without local locking.

pub mod memory;

pub use memory::{MemoryDocumentStore, MemoryKeyRegistry, MemoryLedger};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CompositeId, Document};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document. `NotFound` if there is no document with this id.
    async fn get_document(&self, id: &str) -> Result<Document, StoreError>;
}

/// Label ↔ owner metadata for key pairs held in the token.
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    async fn save_key_pair(&self, label: &str, owner_id: &str) -> Result<(), StoreError>;

    /// Returns `false` if no entry matched.
    async fn delete_key_pair(&self, owner_id: &str, label: &str) -> Result<bool, StoreError>;
}

/// Acknowledgement of a ledger append. Only `success == true` counts as recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendReceipt {
    pub success: bool,
}

/// A signature as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRecord {
    /// Standard base64
    pub signature: String,
}

/// Append-only, tamper-evident record of issued signatures.
#[async_trait]
pub trait SignatureLedger: Send + Sync {
    async fn append(&self, id: &CompositeId, signature: &str) -> Result<AppendReceipt, StoreError>;

    /// `NotFound` if nothing was recorded under `id`.
    async fn get(&self, id: &CompositeId) -> Result<LedgerRecord, StoreError>;
}
