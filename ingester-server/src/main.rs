//! Ingester Server - HTTP push/query surface over the ingester core

mod api;
mod protocol;

use anyhow::Context;
use ingester_core::chunk::EncodingKind;
use ingester_core::store::{ChunkStore, FileChunkStore, FileStoreConfig, MemoryChunkStore};
use ingester_core::{Ingester, IngesterConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Where flushed chunks go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    File,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Data directory of the file store
    pub data_dir: PathBuf,
    pub store: StoreKind,
    /// Chunk encoding for new chunks
    pub encoding: EncodingKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            data_dir: PathBuf::from("data"),
            store: StoreKind::File,
            encoding: EncodingKind::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `INGESTER_HTTP_ADDR`, `INGESTER_DATA_DIR`,
    /// `INGESTER_STORE` (`file` or `memory`) and `INGESTER_CHUNK_ENCODING`
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("INGESTER_HTTP_ADDR") {
            config.http_addr = addr
                .parse()
                .with_context(|| format!("invalid INGESTER_HTTP_ADDR {:?}", addr))?;
        }
        if let Ok(dir) = std::env::var("INGESTER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(kind) = std::env::var("INGESTER_STORE") {
            config.store = match kind.as_str() {
                "file" => StoreKind::File,
                "memory" => StoreKind::Memory,
                other => anyhow::bail!("unknown INGESTER_STORE {:?}", other),
            };
        }

        if let Ok(encoding) = std::env::var("INGESTER_CHUNK_ENCODING") {
            config.encoding = encoding.parse()?;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = ServerConfig::from_env()?;

    info!("Starting ingester {}...", ingester_core::VERSION);
    info!("HTTP server: http://{}", config.http_addr);

    let store: Arc<dyn ChunkStore> = match config.store {
        StoreKind::File => {
            info!("Chunk store directory: {:?}", config.data_dir);
            Arc::new(FileChunkStore::open(FileStoreConfig {
                dir: config.data_dir.join("chunks"),
                ..Default::default()
            })?)
        }
        StoreKind::Memory => {
            info!("Using in-memory chunk store");
            Arc::new(MemoryChunkStore::new())
        }
    };

    let ingester_config = IngesterConfig {
        encoding: config.encoding,
        ..Default::default()
    };
    let ingester = Arc::new(Ingester::new(ingester_config, store)?);

    // Create router
    let app = api::create_router(ingester.clone());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("Ingester listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, flushing buffered chunks");
    ingester.stop().await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
