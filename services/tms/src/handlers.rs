//! TMS Service REST API Handlers

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tms::{KeyManager, SignatureIssuer, SignatureResult, TmsError};
use tracing::error;

pub struct AppState {
    pub keys: KeyManager,
    pub issuer: SignatureIssuer,
}

/// Request to generate a key pair
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateKeyRequest {
    pub owner_id: String,
    /// Label for the key pair (persistent identifier in the token)
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairResponse {
    pub owner_id: String,
    pub label: String,
}

/// Request to sign a document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    pub key_label: String,
    pub owner_id: String,
    pub document_id: String,
}

/// Request to verify a previously issued signature
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// Signature (standard base64)
    pub signature: String,
    pub document_id: String,
    pub key_label: String,
    pub owner_id: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
}

/// List of key labels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListKeysResponse {
    pub keys: Vec<String>,
}

// ==================== Error Handling ====================

pub struct ApiError(pub StatusCode, pub Json<ErrorResponse>);

impl ApiError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        ApiError(status, Json(ErrorResponse { error: msg.into() }))
    }
}

impl From<TmsError> for ApiError {
    fn from(e: TmsError) -> Self {
        let status = match &e {
            TmsError::DocumentNotFound(_)
            | TmsError::KeyNotFound(_)
            | TmsError::SignatureNotRecorded(_) => StatusCode::NOT_FOUND,
            TmsError::InvalidRequest(_) | TmsError::InvalidSignatureEncoding(_) => {
                StatusCode::BAD_REQUEST
            }
            TmsError::KeyAlreadyExists(_) => StatusCode::CONFLICT,
            TmsError::DocumentStoreUnavailable(_)
            | TmsError::LedgerUnavailable(_)
            | TmsError::LedgerRejected(_)
            | TmsError::LedgerCorrupt(_)
            | TmsError::RegistryInconsistent(_) => StatusCode::BAD_GATEWAY,
            TmsError::TokenUnavailable(_) | TmsError::SessionAuthFailed(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            TmsError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            TmsError::CryptoOperationFailed(_) | TmsError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if !e.is_client_error() {
            error!("Request failed: {}", e);
        }
        ApiError::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

// ==================== Handlers ====================

/// Health check
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// List all key labels in the token
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ListKeysResponse>, ApiError> {
    let keys = state.keys.list_keys().await?;
    Ok(Json(ListKeysResponse { keys }))
}

/// Generate an RSA key pair for an owner
pub async fn generate_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerateKeyRequest>,
) -> Result<(StatusCode, Json<KeyPairResponse>), ApiError> {
    state
        .keys
        .generate_key_pair(&request.owner_id, &request.label)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(KeyPairResponse {
            owner_id: request.owner_id,
            label: request.label,
        }),
    ))
}

/// Delete an owner's key pair
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path((owner_id, label)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.keys.delete_key_pair(&owner_id, &label).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Sign a document and record the signature in the ledger
pub async fn sign_document(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SignRequest>,
) -> Result<Json<SignatureResult>, ApiError> {
    let result = state
        .issuer
        .sign_document(&request.key_label, &request.owner_id, &request.document_id)
        .await?;
    Ok(Json(result))
}

/// Verify a signature against the ledger and the current document
pub async fn verify_signature(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<SignatureResult>, ApiError> {
    let result = state
        .issuer
        .verify_signature(
            &request.signature,
            &request.document_id,
            &request.key_label,
            &request.owner_id,
        )
        .await?;
    Ok(Json(result))
}
