//! HTTP clients for the document store, key registry and signature ledger

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tms::store::{AppendReceipt, DocumentStore, KeyRegistry, LedgerRecord, SignatureLedger, StoreError};
use tms::{CompositeId, Document};

// ==================== Wire Types ====================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveKeyPairRequest {
    pub label: String,
    pub owner_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteKeyPairResponse {
    pub deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendSignatureRequest {
    pub id: String,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
}

fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// `base_url` joined with `segments`, each percent-encoded as one path segment.
fn endpoint(base_url: &str, segments: &[&str]) -> Result<Url, StoreError> {
    let invalid = || StoreError::Unavailable(format!("Invalid base URL: {}", base_url));
    let mut url = Url::parse(base_url).map_err(|_| invalid())?;
    url.path_segments_mut()
        .map_err(|_| invalid())?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn request_error(service: &str, e: reqwest::Error) -> StoreError {
    StoreError::Unavailable(format!("{} request failed: {}", service, e))
}

/// Map a non-success response to a store error, preferring the body's `error` field.
async fn error_from(service: &str, id: &str, response: Response) -> StoreError {
    let status = response.status();
    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => format!("{} returned {}", service, status),
    };

    if status == StatusCode::NOT_FOUND {
        StoreError::NotFound(id.to_string())
    } else if status.is_client_error() {
        StoreError::Rejected(message)
    } else {
        StoreError::Unavailable(message)
    }
}

async fn parse<T: for<'de> Deserialize<'de>>(
    service: &str,
    response: Response,
) -> Result<T, StoreError> {
    response
        .json()
        .await
        .map_err(|e| StoreError::Unavailable(format!("Failed to parse {} response: {}", service, e)))
}

// ==================== Document Store ====================

/// HTTP client for the document service.
pub struct DocumentClient {
    client: Client,
    base_url: String,
}

impl DocumentClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl DocumentStore for DocumentClient {
    async fn get_document(&self, id: &str) -> Result<Document, StoreError> {
        let url = endpoint(&self.base_url, &["api", "documents", id])?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error("Document store", e))?;

        if !response.status().is_success() {
            return Err(error_from("Document store", id, response).await);
        }

        parse("document store", response).await
    }
}

// ==================== Key Registry ====================

/// HTTP client for the key registry service.
pub struct RegistryClient {
    client: Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl KeyRegistry for RegistryClient {
    async fn save_key_pair(&self, label: &str, owner_id: &str) -> Result<(), StoreError> {
        let url = endpoint(&self.base_url, &["api", "keys"])?;

        let request = SaveKeyPairRequest {
            label: label.to_string(),
            owner_id: owner_id.to_string(),
        };

        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| request_error("Registry", e))?;

        if !response.status().is_success() {
            return Err(error_from("Registry", label, response).await);
        }

        Ok(())
    }

    async fn delete_key_pair(&self, owner_id: &str, label: &str) -> Result<bool, StoreError> {
        let url = endpoint(&self.base_url, &["api", "keys", owner_id, label])?;

        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| request_error("Registry", e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(error_from("Registry", label, response).await);
        }

        let resp: DeleteKeyPairResponse = parse("registry", response).await?;
        Ok(resp.deleted)
    }
}

// ==================== Signature Ledger ====================

/// HTTP client for the signature ledger service.
pub struct LedgerClient {
    client: Client,
    base_url: String,
}

impl LedgerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SignatureLedger for LedgerClient {
    async fn append(&self, id: &CompositeId, signature: &str) -> Result<AppendReceipt, StoreError> {
        let url = endpoint(&self.base_url, &["api", "signatures"])?;

        let request = AppendSignatureRequest {
            id: id.to_string(),
            signature: signature.to_string(),
        };

        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| request_error("Ledger", e))?;

        if !response.status().is_success() {
            return Err(error_from("Ledger", id.as_str(), response).await);
        }

        parse("ledger", response).await
    }

    async fn get(&self, id: &CompositeId) -> Result<LedgerRecord, StoreError> {
        let url = endpoint(&self.base_url, &["api", "signatures", id.as_str()])?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error("Ledger", e))?;

        if !response.status().is_success() {
            return Err(error_from("Ledger", id.as_str(), response).await);
        }

        parse("ledger", response).await
    }
}
