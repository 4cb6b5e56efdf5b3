//! oracle-relayer binary
//!
//! `start` runs the oracle loop, `probe <file>` validates one feed config by
//! running its pipeline once, `version` prints build metadata.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use oracle_relayer::admin::{self, AdminState};
use oracle_relayer::chain;
use oracle_relayer::config::{feeds, AppConfig};
use oracle_relayer::oracle::{
    stork, ChainlinkFetcher, OracleService, StorkFetcher,
};
use oracle_relayer::types::FeedProvider;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        None | Some("start") => start().await,
        Some("probe") => {
            let file = args
                .get(2)
                .context("usage: oracle-relayer probe <feed.toml>")?;
            probe(file).await
        }
        Some("version") => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(other) => {
            eprintln!("unknown command {other:?}; commands: start, probe <file>, version");
            std::process::exit(2);
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn start() -> Result<()> {
    let cfg = AppConfig::load()?;
    init_tracing(&cfg.log_level);
    cfg.validate()?;

    info!(config = %cfg.digest(), "starting oracle relayer");

    if let Some(addr) = &cfg.metrics_addr {
        let addr: std::net::SocketAddr = addr.parse().context("bad metrics_addr")?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install metrics exporter")?;
        info!(addr = %addr, "metrics exporter listening");
    }

    let feed_configs = feeds::load_feed_configs(Path::new(&cfg.feeds_dir))?;

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                token.cancel();
            }
        });
    }

    // streaming fetchers subscribe to everything their providers declare
    let stork_tickers: Vec<String> = feed_configs
        .values()
        .filter(|cfg| FeedProvider::from_slug(&cfg.provider) == FeedProvider::Stork)
        .map(|cfg| cfg.ticker.as_str().to_string())
        .collect();
    let chainlink_feed_ids: Vec<String> = feed_configs
        .values()
        .filter(|cfg| FeedProvider::from_slug(&cfg.provider) == FeedProvider::Chainlink)
        .filter_map(|cfg| cfg.feed_id.clone())
        .collect();

    let stork_fetcher = Arc::new(StorkFetcher::new(
        cfg.stork.subscribe_message.clone(),
        stork_tickers,
    ));
    if !stork_fetcher.tickers().is_empty() {
        if cfg.stork.websocket_url.is_empty() {
            warn!("stork feeds configured but stork.websocket_url is empty, they will stay idle");
        } else {
            tokio::spawn(stork::run_stork_driver(
                Arc::clone(&stork_fetcher),
                cfg.stork.clone(),
                token.clone(),
            ));
        }
    }

    let chainlink_fetcher = Arc::new(ChainlinkFetcher::new(chainlink_feed_ids));
    if !chainlink_fetcher.feed_ids().is_empty() {
        // the data-streams SDK client is provided by the deployment; without
        // one the chainlink pullers skip every cycle on an empty cache
        warn!("chainlink feeds configured but no stream client is wired into this build");
    }

    let clients = chain::connect_clients(&cfg.chain)?;

    let service = OracleService::new(
        &feed_configs,
        Arc::clone(&stork_fetcher),
        Arc::clone(&chainlink_fetcher),
        clients,
    )?;

    let admin_state = Arc::new(AdminState {
        feed_count: service.puller_count(),
    });
    let admin_addr = cfg.admin_listen_addr.clone();
    tokio::spawn(async move {
        if let Err(err) = admin::serve(&admin_addr, admin_state).await {
            warn!(error = %err, "admin API server stopped");
        }
    });

    service.run(token).await;

    info!("shutdown complete");
    Ok(())
}

async fn probe(file: &str) -> Result<()> {
    init_tracing("info");

    let body = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read feed config {file}"))?;

    match admin::probe_feed(&body).await {
        Ok(result) => {
            println!("{result}");
            Ok(())
        }
        Err(err) => anyhow::bail!("probe failed: {}", probe_error_message(err)),
    }
}

fn probe_error_message(err: admin::ProbeError) -> String {
    match err {
        admin::ProbeError::BadConfig(e) => format!("invalid feed config: {e:#}"),
        admin::ProbeError::PullFailed(e) => format!("pull failed: {e:#}"),
    }
}
