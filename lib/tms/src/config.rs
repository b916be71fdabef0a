//! Configuration for the token connection and request workflows

use std::time::Duration;

pub const DEFAULT_LIBRARY_PATH: &str = "/usr/lib/softhsm/libsofthsm2.so";
pub const DEFAULT_HSM_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Token connection settings. Read-only for the life of the process.
#[derive(Clone)]
pub struct HsmConfig {
    /// Path to the PKCS#11 module
    pub library_path: String,
    /// Label of the (already initialized) token to use
    pub token_label: String,
    /// User PIN
    pub pin: String,
}

impl HsmConfig {
    pub fn new(library_path: &str, token_label: &str, pin: &str) -> Self {
        Self {
            library_path: library_path.to_string(),
            token_label: token_label.to_string(),
            pin: pin.to_string(),
        }
    }
}

impl std::fmt::Debug for HsmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmConfig")
            .field("library_path", &self.library_path)
            .field("token_label", &self.token_label)
            .finish_non_exhaustive()
    }
}

/// Time limits applied to each blocking step of a request.
#[derive(Debug, Clone, Copy)]
pub struct IssuerConfig {
    /// Limit for one HSM step (session open, lookup and sign/verify)
    pub hsm_timeout: Duration,
    /// Limit for one document store, key registry or ledger call
    pub collaborator_timeout: Duration,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            hsm_timeout: DEFAULT_HSM_TIMEOUT,
            collaborator_timeout: DEFAULT_COLLABORATOR_TIMEOUT,
        }
    }
}
