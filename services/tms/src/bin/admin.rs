//! TMS Admin CLI
//!
//! Direct token administration: inspect key labels, create or remove key
//! pairs without going through the key registry (for reconciling orphans),
//! and sign or verify raw payloads.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use tms::config::DEFAULT_LIBRARY_PATH;
use tms::types::{decode_signature, encode_signature};
use tms::{Hsm, HsmConfig, Pkcs11SessionManager, TmsError, engine, keys};

#[derive(Parser)]
#[command(name = "tms-admin")]
#[command(about = "TMS Token Administration")]
struct Cli {
    /// Path to the PKCS#11 module
    #[arg(long, env = "HSM_LIBPATH", default_value = DEFAULT_LIBRARY_PATH)]
    library_path: String,

    /// Label of the token to use
    #[arg(long, env = "HSM_TOKEN_LABEL")]
    token_label: String,

    /// User PIN
    #[arg(long, env = "HSM_PIN", hide_env_values = true)]
    pin: String,

    /// Timeout for each token operation, in milliseconds
    #[arg(long, env = "HSM_TIMEOUT_MS", default_value_t = 10_000)]
    timeout_ms: u64,

    /// Output as JSON
    #[arg(short, long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List key labels held by the token
    Keys,
    /// Generate an RSA key pair in the token (not registered)
    Generate { label: String },
    /// Destroy both halves of a key pair in the token
    Destroy { label: String },
    /// Sign a UTF-8 payload, printing the base64 signature
    Sign { label: String, payload: String },
    /// Verify a base64 signature over a UTF-8 payload
    Verify {
        label: String,
        payload: String,
        signature: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = HsmConfig::new(&cli.library_path, &cli.token_label, &cli.pin);
    let sessions = Pkcs11SessionManager::connect(&config)?;
    let hsm = Hsm::new(Arc::new(sessions), Duration::from_millis(cli.timeout_ms));

    match cli.command {
        Commands::Keys => cmd_keys(&hsm, cli.json).await?,
        Commands::Generate { label } => cmd_generate(&hsm, label, cli.json).await?,
        Commands::Destroy { label } => cmd_destroy(&hsm, label, cli.json).await?,
        Commands::Sign { label, payload } => cmd_sign(&hsm, label, payload, cli.json).await?,
        Commands::Verify {
            label,
            payload,
            signature,
        } => cmd_verify(&hsm, label, payload, &signature, cli.json).await?,
    }

    Ok(())
}

async fn cmd_keys(hsm: &Hsm, json: bool) -> anyhow::Result<()> {
    let labels = hsm
        .with_session("list keys", |session, _| {
            keys::list_key_labels(session).map_err(TmsError::from)
        })
        .await?;

    if json {
        println!("{}", serde_json::json!({ "keys": labels }));
    } else if labels.is_empty() {
        println!("{}", "No keys in token.".yellow());
    } else {
        println!("{}", "Token Keys".cyan().bold());
        println!("{}", "=".repeat(60));
        for label in labels {
            println!("  {}", label);
        }
    }

    Ok(())
}

async fn cmd_generate(hsm: &Hsm, label: String, json: bool) -> anyhow::Result<()> {
    if label.is_empty() {
        anyhow::bail!("Label cannot be empty");
    }

    let key_label = label.clone();
    hsm.with_session("generate key pair", move |session, _| {
        match keys::find_key_by_label(session, &key_label, tms::KeyClass::Private) {
            Ok(_) => return Err(TmsError::KeyAlreadyExists(key_label)),
            Err(tms::HsmError::KeyNotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        keys::create_key_pair(session, &key_label)?;
        Ok(())
    })
    .await?;

    if json {
        println!("{}", serde_json::json!({ "label": label, "created": true }));
    } else {
        println!("{} {}", "Generated key pair".green(), label.yellow());
    }

    Ok(())
}

async fn cmd_destroy(hsm: &Hsm, label: String, json: bool) -> anyhow::Result<()> {
    let key_label = label.clone();
    hsm.with_session("destroy key pair", move |session, _| {
        keys::destroy_key_pair(session, &key_label).map_err(TmsError::from)
    })
    .await?;

    if json {
        println!("{}", serde_json::json!({ "label": label, "destroyed": true }));
    } else {
        println!("{} {}", "Destroyed key pair".green(), label.yellow());
    }

    Ok(())
}

async fn cmd_sign(hsm: &Hsm, label: String, payload: String, json: bool) -> anyhow::Result<()> {
    let signature = hsm
        .with_session("sign payload", move |session, _| {
            engine::sign_with_label(session, &label, payload.as_bytes()).map_err(TmsError::from)
        })
        .await?;
    let signature = encode_signature(&signature);

    if json {
        println!("{}", serde_json::json!({ "signature": signature }));
    } else {
        println!("{}", signature);
    }

    Ok(())
}

async fn cmd_verify(
    hsm: &Hsm,
    label: String,
    payload: String,
    signature: &str,
    json: bool,
) -> anyhow::Result<()> {
    let raw = decode_signature(signature)
        .map_err(|e| anyhow::anyhow!("Invalid base64 signature: {}", e))?;

    let valid = hsm
        .with_session("verify payload", move |session, _| {
            engine::verify_with_label(session, &label, payload.as_bytes(), &raw)
                .map_err(TmsError::from)
        })
        .await?;

    if json {
        println!("{}", serde_json::json!({ "valid": valid }));
    } else if valid {
        println!("{}", "Signature valid".green());
    } else {
        println!("{}", "Signature invalid".red());
    }

    Ok(())
}
