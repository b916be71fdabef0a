//! Service configuration from the environment

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tms::config::{DEFAULT_COLLABORATOR_TIMEOUT, DEFAULT_HSM_TIMEOUT, DEFAULT_LIBRARY_PATH};
use tms::{HsmConfig, IssuerConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{name} is required")]
    Missing { name: &'static str },
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Deployment environment. Selects the log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Local,
    Dev,
    Production,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Environment::Local),
            "dev" => Ok(Environment::Dev),
            "production" => Ok(Environment::Production),
            other => Err(format!("expected local, dev or production, got '{}'", other)),
        }
    }
}

/// Which token implementation backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsmBackend {
    Pkcs11,
    /// Software token; keys are lost on restart. Refused in production.
    Memory,
}

impl FromStr for HsmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pkcs11" => Ok(HsmBackend::Pkcs11),
            "memory" => Ok(HsmBackend::Memory),
            other => Err(format!("expected pkcs11 or memory, got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub environment: Environment,
    pub backend: HsmBackend,
    pub hsm: HsmConfig,
    pub issuer: IssuerConfig,
    pub documents_url: String,
    pub registry_url: String,
    pub ledger_url: String,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = parse_or(&lookup, "PORT", 80)?;
        let environment = parse_or(&lookup, "TMS_ENV", Environment::Production)?;
        let backend = parse_or(&lookup, "HSM_BACKEND", HsmBackend::Pkcs11)?;
        if backend == HsmBackend::Memory && environment == Environment::Production {
            return Err(ConfigError::Invalid {
                name: "HSM_BACKEND",
                reason: "memory backend is not allowed in production".to_string(),
            });
        }

        let library_path =
            lookup("HSM_LIBPATH").unwrap_or_else(|| DEFAULT_LIBRARY_PATH.to_string());
        let token_label = required(&lookup, "HSM_TOKEN_LABEL")?;
        let pin = required(&lookup, "HSM_PIN")?;

        let issuer = IssuerConfig {
            hsm_timeout: millis_or(&lookup, "HSM_TIMEOUT_MS", DEFAULT_HSM_TIMEOUT)?,
            collaborator_timeout: millis_or(
                &lookup,
                "COLLABORATOR_TIMEOUT_MS",
                DEFAULT_COLLABORATOR_TIMEOUT,
            )?,
        };

        Ok(Self {
            port,
            environment,
            backend,
            hsm: HsmConfig::new(&library_path, &token_label, &pin),
            issuer,
            documents_url: required(&lookup, "DOCUMENTS_URL")?,
            registry_url: required(&lookup, "REGISTRY_URL")?,
            ledger_url: required(&lookup, "LEDGER_URL")?,
        })
    }
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    match lookup(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::Missing { name }),
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let millis: u64 = parse_or(lookup, name, default.as_millis() as u64)?;
    if millis == 0 {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(millis))
}
