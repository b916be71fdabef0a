//! TMS Service - HTTP front end for HSM-backed document signing
//!
//! Exposes key lifecycle and signature issuance/verification over a REST API.
//! The token is reached through PKCS#11; documents, key ownership and issued
//! signatures live in external services reached over HTTP.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod clients;
pub mod config;
pub mod handlers;
pub mod server;

pub use config::{ConfigError, Environment, HsmBackend, ServiceConfig};
pub use handlers::AppState;
