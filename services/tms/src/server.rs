//! TMS Service HTTP Server

use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};

use axum::{
    Router,
    routing::{delete, get, post},
};
use tms::{
    Hsm, KeyManager, MemoryToken, Pkcs11SessionManager, SessionManager, SignatureIssuer,
};

use crate::clients::{DocumentClient, LedgerClient, RegistryClient};
use crate::config::{HsmBackend, ServiceConfig};
use crate::handlers::{self, AppState};

/// Create and configure the Axum router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))
        // Key lifecycle
        .route(
            "/api/keys",
            get(handlers::list_keys).post(handlers::generate_key),
        )
        .route("/api/keys/:owner_id/:label", delete(handlers::delete_key))
        // Signatures
        .route("/api/signatures", post(handlers::sign_document))
        .route("/api/signatures/verify", post(handlers::verify_signature))
        .with_state(state)
}

/// Open the configured token backend.
pub fn connect_token(
    config: &ServiceConfig,
) -> Result<Arc<dyn SessionManager>, Box<dyn std::error::Error>> {
    match config.backend {
        HsmBackend::Pkcs11 => {
            info!("Loading PKCS#11 module from {}", config.hsm.library_path);
            let sessions = Pkcs11SessionManager::connect(&config.hsm)
                .map_err(|e| format!("Failed to initialize HSM: {}", e))?;
            Ok(Arc::new(sessions))
        }
        HsmBackend::Memory => {
            info!("Using in-memory token; keys will not survive a restart");
            let token = MemoryToken::new(&config.hsm.token_label, &config.hsm.pin);
            Ok(Arc::new(
                token.session_manager(&config.hsm.token_label, &config.hsm.pin),
            ))
        }
    }
}

/// Wire the token and collaborator clients into the application state.
pub fn build_state(
    config: &ServiceConfig,
    sessions: Arc<dyn SessionManager>,
) -> Arc<AppState> {
    let timeout = config.issuer.collaborator_timeout;
    let hsm = Hsm::new(sessions, config.issuer.hsm_timeout);

    let registry = Arc::new(RegistryClient::new(&config.registry_url, timeout));
    let documents = Arc::new(DocumentClient::new(&config.documents_url, timeout));
    let ledger = Arc::new(LedgerClient::new(&config.ledger_url, timeout));

    Arc::new(AppState {
        keys: KeyManager::new(hsm.clone(), registry, timeout),
        issuer: SignatureIssuer::new(hsm, documents, ledger, timeout),
    })
}

/// Run the HTTP server
pub async fn run(
    listener: tokio::net::TcpListener,
    config: ServiceConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let sessions = connect_token(&config)?;
    info!("Token '{}' ready", config.hsm.token_label);

    let app = create_router(build_state(&config, sessions));

    info!(
        "TMS service listening on {}",
        listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for SIGTERM or SIGINT signal
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Starting graceful shutdown...");
}
