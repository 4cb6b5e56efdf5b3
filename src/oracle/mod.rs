//! Oracle service
//!
//! Owns the puller registry, drives each feed on its own cadence, and hands
//! observations to the batcher for relay.

pub mod batch;
pub mod chainlink;
pub mod dynamic;
pub mod stork;

pub use batch::Batcher;
pub use chainlink::{ChainlinkFetcher, ChainlinkPriceFeed, RawReport, ReportStream, ReportStreamClient};
pub use dynamic::DynamicPriceFeed;
pub use stork::{StorkError, StorkFetcher, StorkPriceFeed};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chain::ChainClient;
use crate::config::feeds::FeedConfig;
use crate::types::{FeedProvider, OracleType, PriceData, Ticker};

/// Per-pull deadline.
pub(crate) const MAX_RESP_TIME: Duration = Duration::from_secs(15);
/// Attempts per cycle before giving up until the next interval.
const MAX_RETRIES_PER_INTERVAL: u32 = 3;
/// Spacing between in-cycle retries.
const RETRY_SPACING: Duration = Duration::from_secs(1);
/// Delay before the first pull of every driver.
const INITIAL_PULL_DELAY: Duration = Duration::from_secs(5);

/// A stateful component that turns one feed into observations on demand.
///
/// `pull_price` returning `Ok(None)` means "skip this cycle" (streaming
/// pullers report it while their cache is still empty); it is not an error.
#[async_trait]
pub trait PricePuller: Send + Sync {
    fn provider(&self) -> FeedProvider;
    fn provider_name(&self) -> &str;
    fn symbol(&self) -> &str;
    fn ticker(&self) -> &Ticker;
    fn interval(&self) -> Duration;
    fn oracle_type(&self) -> OracleType;

    async fn pull_price(&self) -> Result<Option<PriceData>>;
}

pub struct OracleService {
    price_pullers: HashMap<String, Arc<dyn PricePuller>>,
    clients: Vec<Arc<dyn ChainClient>>,
}

impl OracleService {
    /// Build the puller registry out of the loaded feed configs. Keyed by
    /// ticker, so a late config for the same ticker replaces the earlier
    /// puller.
    pub fn new(
        feed_configs: &HashMap<String, FeedConfig>,
        stork_fetcher: Arc<StorkFetcher>,
        chainlink_fetcher: Arc<ChainlinkFetcher>,
        clients: Vec<Arc<dyn ChainClient>>,
    ) -> Result<Self> {
        let mut price_pullers: HashMap<String, Arc<dyn PricePuller>> = HashMap::new();

        for (key, cfg) in feed_configs {
            let ticker = cfg.ticker.clone();
            match FeedProvider::from_slug(&cfg.provider) {
                FeedProvider::Stork => {
                    let puller = StorkPriceFeed::new(Arc::clone(&stork_fetcher), cfg)
                        .with_context(|| format!("failed to init stork price feed {key}"))?;
                    price_pullers.insert(ticker.0, Arc::new(puller));
                }
                FeedProvider::Chainlink => {
                    let puller = ChainlinkPriceFeed::new(Arc::clone(&chainlink_fetcher), cfg)
                        .with_context(|| format!("failed to init chainlink price feed {key}"))?;
                    price_pullers.insert(ticker.0, Arc::new(puller));
                }
                FeedProvider::Dynamic(_) => {
                    let puller = DynamicPriceFeed::new(cfg)
                        .with_context(|| format!("failed to init dynamic price feed {key}"))?;
                    price_pullers.insert(ticker.0, Arc::new(puller));
                }
            }
        }

        info!(pullers = price_pullers.len(), "initialized price pullers");

        Ok(OracleService {
            price_pullers,
            clients,
        })
    }

    pub fn puller_count(&self) -> usize {
        self.price_pullers.len()
    }

    /// Start one driver per puller plus the batcher, and run until the token
    /// is cancelled. The batcher does a final flush on the way out.
    pub async fn run(&self, token: CancellationToken) {
        if self.price_pullers.is_empty() {
            warn!("no price pullers configured, oracle loop is idle");
            token.cancelled().await;
            return;
        }

        info!(feeds = self.price_pullers.len(), "starting pullers");

        let (data_tx, data_rx) = mpsc::channel::<PriceData>(self.price_pullers.len());

        let mut drivers = Vec::new();
        for (ticker, puller) in &self.price_pullers {
            let driver = PullerDriver {
                ticker: ticker.clone(),
                puller: Arc::clone(puller),
                out: data_tx.clone(),
                token: token.clone(),
            };
            drivers.push(tokio::spawn(driver.run()));
        }
        // the batcher observes channel close once every driver is done
        drop(data_tx);

        let batcher = Batcher::new(self.clients.clone());
        batcher.run(data_rx, token.clone()).await;

        for driver in drivers {
            let _ = driver.await;
        }
    }
}

/// Drives a single puller on its cadence, with bounded in-cycle retries.
struct PullerDriver {
    ticker: String,
    puller: Arc<dyn PricePuller>,
    out: mpsc::Sender<PriceData>,
    token: CancellationToken,
}

impl PullerDriver {
    async fn run(self) {
        let provider = self.puller.provider_name().to_string();
        let symbol = self.puller.symbol().to_string();

        let timer = tokio::time::sleep(INITIAL_PULL_DELAY);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    info!(ticker = %self.ticker, provider = %provider, "stopping price feed driver");
                    return;
                }
                _ = &mut timer => {}
            }

            let mut result = None;
            let mut last_err = None;

            for attempt in 0..MAX_RETRIES_PER_INTERVAL {
                match tokio::time::timeout(MAX_RESP_TIME, self.puller.pull_price()).await {
                    Ok(Ok(data)) => {
                        result = Some(data);
                        last_err = None;
                        break;
                    }
                    Ok(Err(err)) => {
                        warn!(
                            ticker = %self.ticker,
                            provider = %provider,
                            attempt,
                            error = %err,
                            "retrying PullPrice after error"
                        );
                        last_err = Some(err);
                    }
                    Err(_) => {
                        warn!(
                            ticker = %self.ticker,
                            provider = %provider,
                            attempt,
                            "PullPrice timed out"
                        );
                        last_err = Some(anyhow::anyhow!("pull timed out"));
                    }
                }
                tokio::time::sleep(RETRY_SPACING).await;
            }

            if let Some(err) = last_err {
                counter!("price_oracle.pull_errors", "provider" => provider.clone()).increment(1);
                error!(
                    ticker = %self.ticker,
                    provider = %provider,
                    symbol = %symbol,
                    retries = MAX_RETRIES_PER_INTERVAL,
                    error = %err,
                    "failed to fetch price"
                );
            } else if let Some(Some(data)) = result {
                if self.out.send(data).await.is_err() {
                    // batcher is gone, nothing left to do
                    return;
                }
            }

            timer
                .as_mut()
                .reset(tokio::time::Instant::now() + self.puller.interval());
        }
    }
}
