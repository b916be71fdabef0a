//! TMS Error Types

use thiserror::Error;

use crate::hsm::HsmError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum TmsError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Key already exists: {0}")]
    KeyAlreadyExists(String),

    #[error("No signature recorded for {0}")]
    SignatureNotRecorded(String),

    #[error("Invalid signature encoding: {0}")]
    InvalidSignatureEncoding(String),

    #[error("Token unavailable: {0}")]
    TokenUnavailable(String),

    #[error("Session authentication failed: {0}")]
    SessionAuthFailed(String),

    #[error("Cryptographic operation failed: {0}")]
    CryptoOperationFailed(String),

    #[error("Document store unavailable: {0}")]
    DocumentStoreUnavailable(String),

    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Ledger rejected signature: {0}")]
    LedgerRejected(String),

    #[error("Ledger record corrupt: {0}")]
    LedgerCorrupt(String),

    #[error("HSM and key registry inconsistent: {0}")]
    RegistryInconsistent(String),

    #[error("Timed out during {step}")]
    Timeout { step: &'static str },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TmsError {
    /// True when the failure was caused by the caller's input (unknown document
    /// or key, malformed signature) rather than a backend fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TmsError::InvalidRequest(_)
                | TmsError::DocumentNotFound(_)
                | TmsError::KeyNotFound(_)
                | TmsError::KeyAlreadyExists(_)
                | TmsError::SignatureNotRecorded(_)
                | TmsError::InvalidSignatureEncoding(_)
        )
    }

    /// Prefix backend error messages with the workflow step that produced them.
    pub(crate) fn in_step(self, step: &str) -> Self {
        match self {
            TmsError::TokenUnavailable(m) => TmsError::TokenUnavailable(format!("{step}: {m}")),
            TmsError::SessionAuthFailed(m) => TmsError::SessionAuthFailed(format!("{step}: {m}")),
            TmsError::CryptoOperationFailed(m) => {
                TmsError::CryptoOperationFailed(format!("{step}: {m}"))
            }
            TmsError::Internal(m) => TmsError::Internal(format!("{step}: {m}")),
            other => other,
        }
    }
}

impl From<HsmError> for TmsError {
    fn from(e: HsmError) -> Self {
        match e {
            HsmError::KeyNotFound { ref label, .. } => TmsError::KeyNotFound(label.clone()),
            HsmError::TokenNotFound(_) | HsmError::SessionOpenFailed(_) | HsmError::Library(_) => {
                TmsError::TokenUnavailable(e.to_string())
            }
            HsmError::LoginFailed(_) => TmsError::SessionAuthFailed(e.to_string()),
            _ => TmsError::CryptoOperationFailed(e.to_string()),
        }
    }
}

impl TmsError {
    pub(crate) fn from_document_store(document_id: &str, e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => TmsError::DocumentNotFound(document_id.to_string()),
            other => TmsError::DocumentStoreUnavailable(other.to_string()),
        }
    }

    pub(crate) fn from_ledger(record_id: &str, e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => TmsError::SignatureNotRecorded(record_id.to_string()),
            StoreError::Rejected(m) => TmsError::LedgerRejected(m),
            other => TmsError::LedgerUnavailable(other.to_string()),
        }
    }
}
