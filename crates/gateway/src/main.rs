use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use tenantkv_gateway::{EngineKind, Gateway, GatewayConfig, server};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Multi-tenant key-value gateway.
#[derive(Debug, Parser)]
#[command(name = "tenantkv", version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, env = "TENANTKV_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long, env = "TENANTKV_LISTEN")]
    listen: Option<SocketAddr>,

    /// Directory for namespace databases.
    #[arg(long, env = "TENANTKV_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory for offloaded values.
    #[arg(long, env = "TENANTKV_BLOB_DIR")]
    blob_dir: Option<PathBuf>,

    /// Storage engine (`redb` or `memory`).
    #[arg(long, env = "TENANTKV_ENGINE")]
    engine: Option<EngineKind>,

    /// Requests per window for tokens without their own limit.
    #[arg(long, env = "TENANTKV_RATE_LIMIT")]
    default_rate_limit: Option<u64>,

    /// Super-token for the auth namespace. Generated when unset.
    #[arg(long, env = "TENANTKV_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<GatewayConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::load(path)?,
            None => GatewayConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(blob_dir) = self.blob_dir {
            config.blob_dir = blob_dir;
        }
        if let Some(engine) = self.engine {
            config.engine = engine;
        }
        if let Some(limit) = self.default_rate_limit {
            config.default_rate_limit = limit;
        }
        if self.admin_token.is_some() {
            config.admin_token = self.admin_token;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Args::parse().into_config()?;
    let gateway = Arc::new(Gateway::open(&config).await?);

    // Operators need this once to create permission records.
    println!("Auth namespace token: {}", gateway.authority().admin_token());

    let listener = TcpListener::bind(config.listen).await?;
    tracing::info!(listen = %listener.local_addr()?, "serving");

    server::serve(listener, Arc::clone(&gateway), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutting down");
    })
    .await?;

    gateway.shutdown();
    Ok(())
}
