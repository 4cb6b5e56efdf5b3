//! Chainlink Data Streams fetcher
//!
//! Long-lived subscription to a report stream that keeps the latest opaque
//! report per feed id. The SDK transport lives behind the [`ReportStream`]
//! trait; reconnects are its problem, decode errors are ours.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, histogram};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::oracle::PricePuller;
use crate::types::{ChainlinkReport, FeedProvider, OracleType, PriceData, PricePayload, Ticker};

/// One report as delivered by the stream SDK.
#[derive(Debug, Clone)]
pub struct RawReport {
    pub feed_id: [u8; 32],
    pub full_report: Vec<u8>,
    pub valid_from_timestamp: u64,
    pub observations_timestamp: u64,
}

/// Stream of reports for a set of subscribed feed ids. The implementation is
/// expected to manage its own reconnection; a read error here is transient.
#[async_trait]
pub trait ReportStream: Send + Sync {
    async fn read(&mut self) -> Result<RawReport>;
}

/// Opens subscriptions; the connected SDK client implements this.
#[async_trait]
pub trait ReportStreamClient: Send + Sync {
    async fn subscribe(&self, feed_ids: Vec<[u8; 32]>) -> Result<Box<dyn ReportStream>>;
}

pub struct ChainlinkFetcher {
    latest_reports: RwLock<HashMap<String, ChainlinkReport>>,
    feed_ids: Vec<String>,
}

impl ChainlinkFetcher {
    pub fn new(feed_ids: Vec<String>) -> Self {
        ChainlinkFetcher {
            latest_reports: RwLock::new(HashMap::new()),
            feed_ids,
        }
    }

    pub fn feed_ids(&self) -> &[String] {
        &self.feed_ids
    }

    /// Latest report for a feed id (lowercase hex, `0x`-prefixed or not).
    pub async fn report(&self, feed_id: &str) -> Option<ChainlinkReport> {
        self.latest_reports
            .read()
            .await
            .get(&canonical_feed_id(feed_id))
            .cloned()
    }

    /// Subscribe and consume reports until the token is cancelled. Read
    /// errors are logged and the loop continues; only cancellation ends it.
    pub async fn start(
        &self,
        client: &dyn ReportStreamClient,
        token: CancellationToken,
    ) -> Result<()> {
        if self.feed_ids.is_empty() {
            bail!("no feed IDs to subscribe to");
        }

        let mut ids = Vec::with_capacity(self.feed_ids.len());
        for feed_id in &self.feed_ids {
            ids.push(
                parse_feed_id(feed_id)
                    .with_context(|| format!("invalid stream ID {feed_id}"))?,
            );
        }

        info!(feeds = self.feed_ids.len(), "subscribing to Chainlink feed IDs");
        let mut stream = client.subscribe(ids).await
            .context("failed to subscribe to Chainlink streams")?;
        info!("successfully subscribed to Chainlink Data Streams");

        loop {
            let report = tokio::select! {
                _ = token.cancelled() => {
                    info!("cancelled, stopping Chainlink fetcher");
                    self.latest_reports.write().await.clear();
                    return Ok(());
                }
                read = stream.read() => match read {
                    Ok(report) => report,
                    Err(err) => {
                        counter!("feed_provider.chainlink.read_error").increment(1);
                        warn!(error = %err, "error reading from Chainlink stream");
                        continue;
                    }
                }
            };

            let now = Utc::now().timestamp();
            let latency_ms = now
                .saturating_sub(report.observations_timestamp as i64)
                .saturating_mul(1000);
            histogram!("feed_provider.chainlink.price_receive_latency_ms")
                .record(latency_ms as f64);
            counter!("feed_provider.chainlink.price_receive").increment(1);

            let feed_id_hex = hex::encode(report.feed_id);
            info!(
                feed_id = %feed_id_hex,
                observations_timestamp = report.observations_timestamp,
                valid_from_timestamp = report.valid_from_timestamp,
                "received Chainlink report"
            );

            let entry = ChainlinkReport {
                feed_id: report.feed_id.to_vec(),
                full_report: report.full_report,
                valid_from_timestamp: report.valid_from_timestamp,
                observations_timestamp: report.observations_timestamp,
            };

            self.latest_reports.write().await.insert(feed_id_hex, entry);
            counter!("feed_provider.chainlink.latest_pairs_update").increment(1);
        }
    }
}

fn canonical_feed_id(feed_id: &str) -> String {
    feed_id.trim_start_matches("0x").to_ascii_lowercase()
}

/// Parse a 32-byte hex feed id.
pub fn parse_feed_id(feed_id: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(canonical_feed_id(feed_id))
        .with_context(|| format!("feed id {feed_id:?} is not hex"))?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("feed id must be 32 bytes, got {}", b.len()))?;
    Ok(array)
}

/// Puller adapter: reads the fetcher cache once per cycle.
pub struct ChainlinkPriceFeed {
    fetcher: Arc<ChainlinkFetcher>,
    ticker: Ticker,
    provider_name: String,
    feed_id: String,
    interval: Duration,
}

impl ChainlinkPriceFeed {
    pub fn new(
        fetcher: Arc<ChainlinkFetcher>,
        cfg: &crate::config::feeds::FeedConfig,
    ) -> Result<Self> {
        let feed_id = cfg
            .feed_id
            .clone()
            .context("chainlink feed requires a feedId")?;
        parse_feed_id(&feed_id)?;

        Ok(ChainlinkPriceFeed {
            fetcher,
            ticker: cfg.ticker.clone(),
            provider_name: cfg.provider.clone(),
            feed_id,
            interval: cfg.pull_interval,
        })
    }

    pub fn feed_id(&self) -> &str {
        &self.feed_id
    }
}

#[async_trait]
impl PricePuller for ChainlinkPriceFeed {
    fn provider(&self) -> FeedProvider {
        FeedProvider::Chainlink
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    fn symbol(&self) -> &str {
        self.ticker.as_str()
    }

    fn ticker(&self) -> &Ticker {
        &self.ticker
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn oracle_type(&self) -> OracleType {
        OracleType::Chainlink
    }

    async fn pull_price(&self) -> Result<Option<PriceData>> {
        let report = match self.fetcher.report(&self.feed_id).await {
            Some(report) => report,
            None => return Ok(None), // cache empty, skip this cycle
        };

        Ok(Some(PriceData {
            ticker: self.ticker.clone(),
            provider_name: self.provider_name.clone(),
            symbol: self.ticker.as_str().to_string(),
            oracle_type: OracleType::Chainlink,
            timestamp: Utc::now(),
            payload: PricePayload::Report(report),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED_ID: &str = "0x00037da06d56d083fe599397a4769a042d63aa73dc4ef57709d31e9971a5b439";

    #[test]
    fn parses_32_byte_hex_feed_ids() {
        assert!(parse_feed_id(FEED_ID).is_ok());
        assert!(parse_feed_id("0xdeadbeef").is_err());
        assert!(parse_feed_id("zz").is_err());
    }

    #[tokio::test]
    async fn report_lookup_is_prefix_insensitive() {
        let fetcher = ChainlinkFetcher::new(vec![FEED_ID.to_string()]);
        let id = parse_feed_id(FEED_ID).unwrap();
        fetcher.latest_reports.write().await.insert(
            hex::encode(id),
            ChainlinkReport {
                feed_id: id.to_vec(),
                full_report: vec![1, 2, 3],
                valid_from_timestamp: 10,
                observations_timestamp: 11,
            },
        );

        assert!(fetcher.report(FEED_ID).await.is_some());
        assert!(fetcher.report(FEED_ID.trim_start_matches("0x")).await.is_some());
        assert!(fetcher.report("0xffff").await.is_none());
    }

    #[tokio::test]
    async fn empty_cache_skips_the_cycle() {
        let fetcher = Arc::new(ChainlinkFetcher::new(vec![FEED_ID.to_string()]));
        let cfg = crate::config::feeds::FeedConfig {
            provider: "chainlink".to_string(),
            ticker: Ticker::from("BTC/USD"),
            feed_id: Some(FEED_ID.to_string()),
            pull_interval: Duration::from_secs(60),
            observation_source: None,
            oracle_type: Some(OracleType::Chainlink),
        };
        let feed = ChainlinkPriceFeed::new(fetcher, &cfg).unwrap();
        assert!(feed.pull_price().await.unwrap().is_none());
    }
}
