//! TMS Service - HSM-backed document signing

use tms_service::{Environment, ServiceConfig};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(environment: Environment) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tms=info,tms_service=info,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    match environment {
        Environment::Production => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        Environment::Dev => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .init(),
        Environment::Local => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServiceConfig::from_env()?;
    init_tracing(config.environment);

    tracing::info!("Starting TMS Service");

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tms_service::server::run(listener, config).await?;

    Ok(())
}
