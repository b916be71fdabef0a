//! Shared domain types

use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};

/// Owner of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub id: String,
    pub name: String,
    pub email: String,
}

/// A document as returned by the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    pub owner: Owner,
}

/// Ledger address of a signature: `{documentId}-{userId}-{keyLabel}`.
///
/// The same triple always yields the same id, so re-signing addresses the
/// same ledger slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeId(String);

impl CompositeId {
    pub fn new(document_id: &str, user_id: &str, key_label: &str) -> Self {
        Self(format!("{}-{}-{}", document_id, user_id, key_label))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompositeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a sign or verify request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureResult {
    /// Signature in transport encoding (standard base64)
    pub signature: String,
    pub valid: bool,
}

/// Encode raw signature bytes for transport and ledger storage.
pub fn encode_signature(signature: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(signature)
}

pub fn decode_signature(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(encoded)
}
