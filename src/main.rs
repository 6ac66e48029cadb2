// SynthDB server entrypoint: parses CLI flags, loads the server config,
// boots the Graph Catalog from the document store, and serves the PreQL
// request envelope over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use synthdb::config::{Cli, ServerConfig};
use synthdb::document_store::FileDocumentStore;
use synthdb::observability::init_logging_with_level;
use synthdb::transport::{load_api_key, router};
use synthdb::SynthDb;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = init_logging_with_level(cli.verbose, cli.quiet);

    let config = ServerConfig::load(&cli)?;
    info!(bind_addr = %config.bind_addr, secure = config.secure, free = config.free, "starting synthdb");

    tokio::fs::create_dir_all(&config.document_store_path)
        .await
        .with_context(|| format!("creating document store directory {}", config.document_store_path.display()))?;
    let store = Arc::new(FileDocumentStore::open(&config.document_store_path).await?);

    let db = Arc::new(SynthDb::new(store, config.free));
    db.bootstrap().await.context("bootstrapping graph catalog")?;

    let expected_api_key = if config.secure {
        let path = config
            .api_key_path
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("config/api_key"));
        Some(load_api_key(&path).with_context(|| format!("loading Api-Key secret from {}", path.display()))?)
    } else {
        None
    };

    let app = router(db, expected_api_key);
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
