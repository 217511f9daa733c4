//! VFS cache proxy server
//!
//! Loads configuration, sets up logging and metrics, and serves registered
//! URLs until interrupted.

use anyhow::Context;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vfscache_proxy::{
    server, MetricsEndpoint, ProxyConfig, ProxyHandler, ProxyMetrics, UrlFs, UrlRegistry, Vfs,
};

/// Name of the virtual filesystem backing the proxy
const FS_NAME: &str = "link";

/// # Usage
/// ```bash
/// # Start with default settings
/// vfscache-proxy
///
/// # Start with a configuration file
/// vfscache-proxy /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    if let Err(e) = run().await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    info!("Starting vfscache-proxy");

    let config = match env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            ProxyConfig::from_file(&path)
                .with_context(|| format!("failed to load configuration from {}", path))?
        }
        None => {
            info!("No configuration file given, using defaults");
            ProxyConfig::default()
        }
    };

    info!("Configuration loaded successfully");
    info!("  - Listen address: {}", config.listen_address);
    info!("  - Mount path: {}", config.mount_path);
    info!(
        "  - Key normalization: strip_query={}, strip_domain={}",
        config.strip_query, config.strip_domain
    );
    info!("  - Shard level: {}", config.shard_level);
    info!("  - Max retries: {}", config.max_retries);
    info!("  - Cache mode: {:?}", config.cache.cache_mode);
    info!("  - Cache dir: {}", config.cache.cache_dir.display());
    info!(
        "  - Chunk size: {} bytes ({} KB)",
        config.cache.chunk_size,
        config.cache.chunk_size / 1024
    );

    let metrics = Arc::new(ProxyMetrics::new().context("failed to create metrics")?);
    let registry = Arc::new(UrlRegistry::new());
    let fs = UrlFs::from_config(FS_NAME, Arc::clone(&registry), &config)?;
    let vfs = Arc::new(Vfs::new(Arc::new(fs), &config.cache, Some(Arc::clone(&metrics))).await?);
    let handler = Arc::new(ProxyHandler::new(
        Arc::clone(&vfs),
        registry,
        &config,
        Some(Arc::clone(&metrics)),
    ));

    if let Some(endpoint) = config.metrics_endpoint.as_ref().filter(|e| e.enabled) {
        let addr: SocketAddr = endpoint
            .address
            .parse()
            .with_context(|| format!("invalid metrics address {}", endpoint.address))?;
        let endpoint = MetricsEndpoint::new(Arc::clone(&metrics), addr);
        tokio::spawn(async move {
            if let Err(e) = endpoint.start().await {
                error!("Metrics endpoint failed: {}", e);
            }
        });
    }

    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    server::serve(listener, handler, shutdown_signal()).await;

    vfs.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
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

    info!("Shutting down server...");
}
