use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use partial_serve::catalog::LocalCatalog;
use partial_serve::server::{self, AppState, Config};
use partial_serve::StreamConfig;

/// Serves byte ranges of registered resources over HTTP.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long)]
    port: u16,

    /// Directory holding downloaded data; only files inside it are deleted on removal
    #[arg(short, long)]
    download_dir: PathBuf,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Largest single read while streaming, in bytes
    #[arg(long, default_value_t = StreamConfig::default().buffer_size)]
    buffer_size: usize,

    /// Read-ahead hint passed to the content source, in bytes (0 disables it)
    #[arg(long, default_value_t = StreamConfig::default().readahead.unwrap_or(0))]
    readahead: usize,

    /// Abort a stream when a single read waits longer than this many seconds
    #[arg(long)]
    read_timeout_secs: Option<u64>,
}

impl Cli {
    fn config(&self) -> Config {
        Config {
            bind: SocketAddr::new(self.bind, self.port),
            download_dir: self.download_dir.clone(),
            stream: StreamConfig {
                buffer_size: self.buffer_size,
                readahead: (self.readahead > 0).then_some(self.readahead),
                read_timeout: self.read_timeout_secs.map(Duration::from_secs),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = cli.config();
    let catalog = LocalCatalog::open(&config.download_dir)
        .await
        .with_context(|| format!("Failed to create download directory {}", config.download_dir.display()))?;
    let catalog = Arc::new(catalog);
    let state = AppState::new(catalog, config.stream.clone());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutting down");
    };

    server::serve(&config, state, shutdown)
        .await
        .with_context(|| format!("Server on {} failed", config.bind))
}
