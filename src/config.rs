//! Server configuration (§4.K / §6): the CLI surface and the on-disk
//! config file the Transport & Auth Boundary reads at startup.
//!
//! Grounded on the host crate's `main.rs` `Cli`/`Commands` (`clap::Parser`)
//! and its `mcp/config.rs` use of the `config` crate for file-plus-env
//! layered settings.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// `synthdb serve` and friends, matching the flags named in §6.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "SynthDB - a JSON graph database with a fluent PreQL query language"
)]
pub struct Cli {
    /// Enable verbose logging (DEBUG level). Default is WARN level.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress all non-essential logging (ERROR level only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Require a matching `Api-Key` header and enable the secured listener.
    #[arg(long)]
    pub secure: bool,

    /// Enable free-mode per-graph quotas (nodes <= 1000, links <= 10000).
    #[arg(long)]
    pub free: bool,

    /// Address to bind the HTTP listener to.
    #[arg(long, default_value = "127.0.0.1:8529")]
    pub bind_addr: String,

    /// Directory the Document Store Adapter persists databases under.
    #[arg(long, default_value = "./synthdb-data")]
    pub document_store_path: PathBuf,

    /// Override path to `server.conf`. Defaults to `config/server.conf`
    /// beneath the install root.
    #[arg(long)]
    pub config_path: Option<PathBuf>,
}

/// Settings layered from `config/server.conf`, environment variables
/// (`SYNTHDB_*`), then CLI flags, in that order of increasing precedence.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub secure: bool,
    pub free: bool,
    pub bind_addr: String,
    pub document_store_path: PathBuf,
    /// Path to the file holding the expected `Api-Key` value. Only
    /// consulted when `secure` is set.
    pub api_key_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            secure: false,
            free: false,
            bind_addr: "127.0.0.1:8529".to_string(),
            document_store_path: PathBuf::from("./synthdb-data"),
            api_key_path: None,
        }
    }
}

impl ServerConfig {
    /// Load `config/server.conf` (or `cli.config_path` if given) layered
    /// under environment overrides, then apply the CLI flags on top.
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = cli
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("config/server.conf"));

        let mut builder = config::Config::builder()
            .set_default("secure", false)?
            .set_default("free", false)?
            .set_default("bind_addr", "127.0.0.1:8529")?
            .set_default("document_store_path", "./synthdb-data")?;

        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path.as_path()));
        }
        builder = builder.add_source(config::Environment::with_prefix("SYNTHDB"));

        let settings = builder
            .build()
            .with_context(|| format!("loading server config from {}", config_path.display()))?;

        let mut cfg: ServerConfig = settings
            .try_deserialize()
            .context("deserializing server config")?;

        // CLI flags always win over file/env settings.
        cfg.secure = cfg.secure || cli.secure;
        cfg.free = cfg.free || cli.free;
        cfg.bind_addr = cli.bind_addr.clone();
        cfg.document_store_path = cli.document_store_path.clone();
        Ok(cfg)
    }
}
