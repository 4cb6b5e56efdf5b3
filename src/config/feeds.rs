//! Per-feed TOML configuration
//!
//! One file per feed; the directory is walked non-recursively and invalid
//! files are logged and skipped, never fatal. The file stem is the registry
//! key for the config.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::pipeline::graph::{format_duration, parse_duration, Graph};
use crate::types::{FeedProvider, OracleType, Ticker};

const DEFAULT_PULL_INTERVAL: Duration = Duration::from_secs(60);
const MIN_PULL_INTERVAL: Duration = Duration::from_secs(1);

/// Raw TOML shape. Unknown fields are ignored on parse; `None` fields are
/// omitted on serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawFeedConfig {
    provider: String,
    ticker: String,
    #[serde(default, rename = "feedId", skip_serializing_if = "Option::is_none")]
    feed_id: Option<String>,
    #[serde(default, rename = "pullInterval", skip_serializing_if = "Option::is_none")]
    pull_interval: Option<String>,
    #[serde(
        default,
        rename = "observationSource",
        skip_serializing_if = "Option::is_none"
    )]
    observation_source: Option<String>,
    #[serde(default, rename = "oracleType", skip_serializing_if = "Option::is_none")]
    oracle_type: Option<String>,
}

/// Validated feed declaration. Created at startup, immutable thereafter.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub provider: String,
    pub ticker: Ticker,
    pub feed_id: Option<String>,
    pub pull_interval: Duration,
    pub observation_source: Option<String>,
    pub oracle_type: Option<OracleType>,
}

impl FeedConfig {
    pub fn parse_toml(body: &str) -> Result<FeedConfig> {
        let raw: RawFeedConfig =
            toml::from_str(body).context("failed to unmarshal TOML config")?;
        FeedConfig::from_raw(raw)
    }

    fn from_raw(raw: RawFeedConfig) -> Result<FeedConfig> {
        if raw.provider.is_empty() {
            bail!("provider name is empty in feed config");
        }
        if raw.ticker.is_empty() {
            bail!("ticker is empty in feed config");
        }

        let pull_interval = match raw.pull_interval.as_deref() {
            None | Some("") => DEFAULT_PULL_INTERVAL,
            Some(text) => {
                let interval = parse_duration(text).with_context(|| {
                    format!("failed to parse pull interval: {text} (expected format: 60s)")
                })?;
                if interval < MIN_PULL_INTERVAL {
                    bail!("failed to parse pull interval: {text} (minimum interval = 1s)");
                }
                interval
            }
        };

        let oracle_type = match raw.oracle_type.as_deref() {
            None | Some("") => None,
            Some(name) => Some(
                OracleType::from_str(name)
                    .with_context(|| format!("oracle type does not exist: {name}"))?,
            ),
        };

        let provider = FeedProvider::from_slug(&raw.provider);
        let ticker = match provider {
            // dynamic feed prices are split into base/quote for relay
            FeedProvider::Dynamic(_) => Ticker::parse(&raw.ticker)
                .with_context(|| format!("ticker {:?} is not BASE/QUOTE", raw.ticker))?,
            // streaming providers key their caches by the raw ticker
            FeedProvider::Stork | FeedProvider::Chainlink => Ticker(raw.ticker.clone()),
        };

        match provider {
            FeedProvider::Dynamic(_) => {
                let source = raw
                    .observation_source
                    .as_deref()
                    .context("observation source is empty in feed config")?;
                Graph::parse(source).context("observation source pipeline parse error")?;
            }
            FeedProvider::Chainlink => {
                if raw.feed_id.as_deref().unwrap_or_default().is_empty() {
                    bail!("feedId is empty in chainlink feed config");
                }
            }
            FeedProvider::Stork => {}
        }

        Ok(FeedConfig {
            provider: raw.provider,
            ticker,
            feed_id: raw.feed_id,
            pull_interval,
            observation_source: raw.observation_source,
            oracle_type,
        })
    }

    /// Serialize back to the TOML file shape. Parsing the output yields an
    /// equal config.
    pub fn to_toml(&self) -> Result<String> {
        let raw = RawFeedConfig {
            provider: self.provider.clone(),
            ticker: self.ticker.as_str().to_string(),
            feed_id: self.feed_id.clone(),
            pull_interval: Some(format_duration(self.pull_interval)),
            observation_source: self.observation_source.clone(),
            oracle_type: self.oracle_type.map(|t| t.name().to_string()),
        };
        toml::to_string(&raw).context("failed to serialize feed config to TOML")
    }

    /// Oracle type with the per-provider default applied.
    pub fn resolved_oracle_type(&self) -> OracleType {
        if let Some(oracle_type) = self.oracle_type {
            return oracle_type;
        }
        match FeedProvider::from_slug(&self.provider) {
            FeedProvider::Stork => OracleType::Stork,
            FeedProvider::Chainlink => OracleType::Chainlink,
            FeedProvider::Dynamic(_) => OracleType::PriceFeed,
        }
    }
}

/// Walk a directory (non-recursively) for `*.toml` feed files. Bad files are
/// logged and skipped.
pub fn load_feed_configs(dir: &Path) -> Result<HashMap<String, FeedConfig>> {
    let mut configs = HashMap::new();

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read feeds dir {}", dir.display()))?;

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        let body = match std::fs::read_to_string(&path) {
            Ok(body) => body,
            Err(err) => {
                warn!(file = %path.display(), error = %err, "failed to read feed config");
                continue;
            }
        };

        match FeedConfig::parse_toml(&body) {
            Ok(cfg) => {
                configs.insert(stem, cfg);
            }
            Err(err) => {
                warn!(file = %path.display(), error = %err, "failed to parse feed config, skipping");
            }
        }
    }

    info!(count = configs.len(), dir = %dir.display(), "found feed configs");
    Ok(configs)
}
