//! Application configuration
//!
//! Layered config in the usual order: built-in defaults, optional
//! `config/default` + `config/local` files, then `ORACLE_*` environment
//! variables (with `__` as the nesting separator). Per-feed TOML documents
//! are handled separately in [`feeds`].

pub mod feeds;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::chain::ChainEndpoints;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Environment name, used for metrics and error reporting.
    pub env: String,
    /// Log level: error, warn, info, debug, trace.
    pub log_level: String,
    /// Directory holding one TOML file per feed.
    pub feeds_dir: String,
    /// Admin API bind address.
    pub admin_listen_addr: String,
    /// Prometheus exporter bind address; metrics stay in-process when unset.
    #[serde(default)]
    pub metrics_addr: Option<String>,
    #[serde(default)]
    pub stork: StorkSettings,
    #[serde(default)]
    pub chainlink: ChainlinkSettings,
    #[serde(default)]
    pub chain: ChainSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorkSettings {
    /// Stork WebSocket endpoint URL.
    pub websocket_url: String,
    /// Raw basic-auth credential; sent as `Basic base64(header)`.
    pub websocket_header: String,
    /// Subscribe frame template with a `%s` placeholder for the ticker list.
    pub subscribe_message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainlinkSettings {
    pub ws_url: String,
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainSettings {
    /// Log-and-ack broadcasts instead of hitting a chain backend.
    pub dry_run: bool,
    /// Relayer identity used by the dry-run client.
    pub sender: String,
    /// Endpoint slots, tried in order on every flush.
    #[serde(default)]
    pub endpoints: Vec<ChainEndpoints>,
}

impl Default for ChainSettings {
    fn default() -> Self {
        ChainSettings {
            dry_run: true,
            sender: String::new(),
            endpoints: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("env", "local")?
            .set_default("log_level", "info")?
            .set_default("feeds_dir", "feeds")?
            .set_default("admin_listen_addr", "127.0.0.1:8075")?
            .set_default("chain.dry_run", true)?
            .set_default("chain.sender", "")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("ORACLE").separator("__"))
            .build()
            .context("failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Short config summary (no secrets) for startup logging.
    pub fn digest(&self) -> String {
        format!(
            "env={} feeds_dir={} stork_ws={} chainlink_ws={} chain_endpoints={} dry_run={}",
            self.env,
            self.feeds_dir,
            !self.stork.websocket_url.is_empty(),
            !self.chainlink.ws_url.is_empty(),
            self.chain.endpoints.len(),
            self.chain.dry_run,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if !self.chain.dry_run && self.chain.endpoints.is_empty() {
            bail!("chain.dry_run is off but no chain endpoints are configured");
        }
        if !self.chain.dry_run && self.chain.sender.is_empty() {
            bail!("chain.sender must be set when broadcasting to a chain");
        }
        Ok(())
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
