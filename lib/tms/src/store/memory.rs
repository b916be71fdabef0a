//! In-memory collaborator stores for tests and local development

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{AppendReceipt, DocumentStore, KeyRegistry, LedgerRecord, SignatureLedger, StoreError};
use crate::types::{CompositeId, Document, Owner};

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<String, Document>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: Document) {
        if let Ok(mut guard) = self.documents.write() {
            guard.insert(document.id.clone(), document);
        }
    }

    /// Convenience for tests: a document owned by `owner_id`.
    pub fn insert_content(&self, id: &str, owner_id: &str, content: &str) {
        self.insert(Document {
            id: id.to_string(),
            title: id.to_string(),
            content: content.to_string(),
            owner: Owner {
                id: owner_id.to_string(),
                name: owner_id.to_string(),
                email: format!("{}@example.com", owner_id),
            },
        });
    }

    /// Replace a document's content, returning false if it does not exist.
    pub fn update_content(&self, id: &str, content: &str) -> bool {
        let Ok(mut guard) = self.documents.write() else {
            return false;
        };
        match guard.get_mut(id) {
            Some(document) => {
                document.content = content.to_string();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get_document(&self, id: &str) -> Result<Document, StoreError> {
        self.documents
            .read()
            .map_err(|_| StoreError::Unavailable("Document store lock poisoned".into()))?
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeyRegistry {
    // label -> owner id
    entries: RwLock<HashMap<String, String>>,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl MemoryKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner_of(&self, label: &str) -> Option<String> {
        self.entries
            .read()
            .ok()
            .and_then(|g| g.get(label).cloned())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make saves and deletes fail as an unreachable registry would.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Hold every save and delete for `delay` before it is applied.
    pub fn set_write_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.write_delay_ms.store(millis, Ordering::SeqCst);
    }

    async fn check_writable(&self) -> Result<(), StoreError> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("Registry write failed (injected)".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyRegistry for MemoryKeyRegistry {
    async fn save_key_pair(&self, label: &str, owner_id: &str) -> Result<(), StoreError> {
        self.check_writable().await?;
        self.entries
            .write()
            .map_err(|_| StoreError::Unavailable("Registry lock poisoned".into()))?
            .insert(label.to_string(), owner_id.to_string());
        Ok(())
    }

    async fn delete_key_pair(&self, owner_id: &str, label: &str) -> Result<bool, StoreError> {
        self.check_writable().await?;
        let mut guard = self
            .entries
            .write()
            .map_err(|_| StoreError::Unavailable("Registry lock poisoned".into()))?;
        if guard.get(label).map(String::as_str) == Some(owner_id) {
            guard.remove(label);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Ledger keyed by composite id. A second append under the same id replaces
/// the first, so one triple never holds two records.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: RwLock<HashMap<String, String>>,
    appends: AtomicUsize,
    reject_appends: AtomicBool,
    unavailable: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored record, as a tampered ledger would.
    pub fn tamper(&self, id: &CompositeId, signature: &str) {
        if let Ok(mut guard) = self.records.write() {
            guard.insert(id.as_str().to_string(), signature.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append calls received, including rejected ones.
    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    /// Acknowledge appends with `success: false`.
    pub fn set_reject_appends(&self, reject: bool) {
        self.reject_appends.store(reject, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("Ledger unreachable (injected)".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SignatureLedger for MemoryLedger {
    async fn append(&self, id: &CompositeId, signature: &str) -> Result<AppendReceipt, StoreError> {
        self.check_available()?;
        self.appends.fetch_add(1, Ordering::SeqCst);
        if self.reject_appends.load(Ordering::SeqCst) {
            return Ok(AppendReceipt { success: false });
        }
        self.records
            .write()
            .map_err(|_| StoreError::Unavailable("Ledger lock poisoned".into()))?
            .insert(id.as_str().to_string(), signature.to_string());
        Ok(AppendReceipt { success: true })
    }

    async fn get(&self, id: &CompositeId) -> Result<LedgerRecord, StoreError> {
        self.check_available()?;
        self.records
            .read()
            .map_err(|_| StoreError::Unavailable("Ledger lock poisoned".into()))?
            .get(id.as_str())
            .map(|signature| LedgerRecord {
                signature: signature.clone(),
            })
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}
