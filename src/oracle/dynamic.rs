//! Dynamic price feed
//!
//! Binds one feed config to an observation-source pipeline; every pull is a
//! fresh pipeline run whose single terminal value becomes the observation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::feeds::FeedConfig;
use crate::oracle::PricePuller;
use crate::pipeline::{Graph, Runner, RunStatus, Spec, Value, Vars};
use crate::types::{FeedProvider, OracleType, PriceData, PricePayload, Ticker};

pub struct DynamicPriceFeed {
    ticker: Ticker,
    provider_name: String,
    interval: Duration,
    graph: Graph,
    source: String,
    oracle_type: OracleType,
    runner: Runner,
    run_nonce: AtomicU64,
}

impl DynamicPriceFeed {
    pub fn new(cfg: &FeedConfig) -> Result<Self> {
        let source = cfg
            .observation_source
            .as_deref()
            .context("dynamic feed requires an observationSource")?;
        let graph = Graph::parse(source).context("observation source pipeline parse error")?;

        Ok(DynamicPriceFeed {
            ticker: cfg.ticker.clone(),
            provider_name: cfg.provider.clone(),
            interval: cfg.pull_interval,
            graph,
            source: source.to_string(),
            oracle_type: cfg.oracle_type.unwrap_or(OracleType::PriceFeed),
            runner: Runner::new(),
            run_nonce: AtomicU64::new(0),
        })
    }

}

#[async_trait]
impl PricePuller for DynamicPriceFeed {
    fn provider(&self) -> FeedProvider {
        FeedProvider::Dynamic(self.provider_name.clone())
    }

    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    fn symbol(&self) -> &str {
        // dynamic feeds don't expose a symbol outside the observation source
        // graph, so the ticker stands in
        self.ticker.as_str()
    }

    fn ticker(&self) -> &Ticker {
        &self.ticker
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn oracle_type(&self) -> OracleType {
        self.oracle_type
    }

    async fn pull_price(&self) -> Result<Option<PriceData>> {
        let started = std::time::Instant::now();

        let job_id = self.run_nonce.fetch_add(1, Ordering::Relaxed) + 1;
        let spec = Spec {
            id: job_id,
            job_name: format!("{}_{}", self.provider_name, self.ticker),
            source: self.source.clone(),
        };

        let run = self
            .runner
            .execute_run(&spec, &self.graph, &Vars::new())
            .await;

        let final_result = run.final_result();

        if run.state != RunStatus::Completed {
            if final_result.has_errors() && !final_result.has_fatal_errors() {
                warn!(
                    ticker = %self.ticker,
                    errors = ?final_result.non_fatal,
                    "final run result has non-critical errors"
                );
            }
            if final_result.has_fatal_errors() {
                bail!(
                    "final run result has fatal errors: {:?}",
                    final_result.fatal_errors()
                );
            }
            bail!("expected run to be completed, yet got {:?}", run.state);
        }

        if final_result.has_errors() {
            warn!(
                ticker = %self.ticker,
                errors = ?final_result.non_fatal,
                "final run result has non-critical errors"
            );
        }

        let value = final_result
            .singular()
            .map_err(|e| anyhow!("failed to get single result of pipeline run: {e}"))?;
        // normalize so relayed strings carry no trailing zeros
        let price = decimal_from_value(&value)?.normalize();

        info!(
            ticker = %self.ticker,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "PullPrice (pipeline run) done"
        );

        Ok(Some(PriceData {
            ticker: self.ticker.clone(),
            provider_name: self.provider_name.clone(),
            symbol: self.ticker.as_str().to_string(),
            oracle_type: self.oracle_type,
            timestamp: Utc::now(),
            payload: PricePayload::Price(price),
        }))
    }
}

/// Accept the terminal value as decimal, decimal string, or float (integers
/// arrive as decimals from the JSON layer). The float path converts through
/// `Decimal::try_from` and can lose precision for values that do not
/// round-trip through f64; pipelines wanting exactness should end on a
/// decimal-producing task.
fn decimal_from_value(value: &Value) -> Result<Decimal> {
    match value {
        Value::Decimal(d) => Ok(*d),
        Value::String(s) => s
            .trim()
            .parse::<Decimal>()
            .with_context(|| format!("pipeline result {s:?} is not a decimal string")),
        Value::Float(f) => Decimal::try_from(*f)
            .with_context(|| format!("pipeline result {f} does not fit a decimal")),
        other => bail!("value is neither decimal, float nor string: {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config(source: &str) -> FeedConfig {
        FeedConfig {
            provider: "binance_v3".to_string(),
            ticker: Ticker::from("INJ/USDT"),
            feed_id: None,
            pull_interval: Duration::from_secs(60),
            observation_source: Some(source.to_string()),
            oracle_type: None,
        }
    }

    #[tokio::test]
    async fn pulls_price_from_pipeline() {
        let feed = DynamicPriceFeed::new(&config(
            r#"
                price [type=memo value=4.948];
                scale [type=multiply times=1000000];
                price -> scale
            "#,
        ))
        .unwrap();

        let data = feed.pull_price().await.unwrap().unwrap();
        assert_eq!(data.price(), Some(dec!(4948000)));
        assert_eq!(data.oracle_type, OracleType::PriceFeed);
        assert_eq!(data.ticker.as_str(), "INJ/USDT");
    }

    #[tokio::test]
    async fn fatal_pipeline_error_fails_the_pull() {
        let feed =
            DynamicPriceFeed::new(&config(r#"boom [type=fail msg="upstream down"];"#)).unwrap();
        let err = feed.pull_price().await.unwrap_err();
        assert!(err.to_string().contains("fatal errors"));
    }

    #[test]
    fn terminal_value_coercion_paths() {
        assert_eq!(
            decimal_from_value(&Value::Decimal(dec!(4948000))).unwrap(),
            dec!(4948000)
        );
        assert_eq!(
            decimal_from_value(&Value::String("4.948".to_string())).unwrap(),
            dec!(4.948)
        );
        assert_eq!(decimal_from_value(&Value::Float(4.948)).unwrap(), dec!(4.948));
        // integers come through the JSON layer as decimals already
        assert_eq!(decimal_from_value(&Value::Decimal(dec!(42))).unwrap(), dec!(42));

        let err = decimal_from_value(&Value::Float(1e300)).unwrap_err();
        assert!(err.to_string().contains("does not fit"));
        assert!(decimal_from_value(&Value::Bool(true)).is_err());
    }

    #[tokio::test]
    async fn non_decimal_terminal_value_is_rejected() {
        let feed =
            DynamicPriceFeed::new(&config(r#"word [type=memo value=hello];"#)).unwrap();
        let err = feed.pull_price().await.unwrap_err();
        assert!(err.to_string().contains("not a decimal"));
    }

    #[tokio::test]
    async fn honors_configured_oracle_type() {
        let mut cfg = config("p [type=memo value=2];");
        cfg.oracle_type = Some(OracleType::Provider);
        let feed = DynamicPriceFeed::new(&cfg).unwrap();
        let data = feed.pull_price().await.unwrap().unwrap();
        assert_eq!(data.oracle_type, OracleType::Provider);
    }

    #[test]
    fn requires_observation_source() {
        let mut cfg = config("x [type=memo value=1];");
        cfg.observation_source = None;
        assert!(DynamicPriceFeed::new(&cfg).is_err());
    }

    #[test]
    fn two_nonces_never_collide() {
        let feed = DynamicPriceFeed::new(&config("x [type=memo value=1];")).unwrap();
        let a = feed.run_nonce.fetch_add(1, Ordering::Relaxed);
        let b = feed.run_nonce.fetch_add(1, Ordering::Relaxed);
        assert_ne!(a, b);
    }
}
