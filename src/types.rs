//! Core types shared across the relayer
//!
//! Tickers, oracle classification, and the observation payloads produced by
//! pullers and consumed by the batcher.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A `BASE/QUOTE` trading pair, used both as the on-chain identifier and as
/// the registry key for a puller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticker(pub String);

impl Ticker {
    /// Parse a ticker, rejecting anything that is not exactly `BASE/QUOTE`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(base), Some(quote), None) if !base.is_empty() && !quote.is_empty() => {
                Some(Ticker(s.to_string()))
            }
            _ => None,
        }
    }

    pub fn base(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }

    pub fn quote(&self) -> &str {
        self.0.split('/').nth(1).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Ticker {
    fn from(s: &str) -> Self {
        Ticker(s.to_string())
    }
}

/// Chain-level classification of a relayed price. Drives which relay message
/// envelope carries the observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OracleType {
    PriceFeed,
    Provider,
    Stork,
    Chainlink,
}

impl OracleType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PriceFeed" => Some(OracleType::PriceFeed),
            "Provider" => Some(OracleType::Provider),
            "Stork" => Some(OracleType::Stork),
            "Chainlink" => Some(OracleType::Chainlink),
            _ => None,
        }
    }

    /// Lowercase tag used in metrics keys and batch map keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            OracleType::PriceFeed => "pricefeed",
            OracleType::Provider => "provider",
            OracleType::Stork => "stork",
            OracleType::Chainlink => "chainlink",
        }
    }

    /// Canonical config-file spelling; inverse of [`OracleType::from_str`].
    pub fn name(&self) -> &'static str {
        match self {
            OracleType::PriceFeed => "PriceFeed",
            OracleType::Provider => "Provider",
            OracleType::Stork => "Stork",
            OracleType::Chainlink => "Chainlink",
        }
    }
}

impl fmt::Display for OracleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Price feed provider kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeedProvider {
    Stork,
    Chainlink,
    /// Anything driven by an observation-source pipeline (binance_v3, etc).
    Dynamic(String),
}

impl FeedProvider {
    pub fn from_slug(slug: &str) -> Self {
        match slug {
            "stork" => FeedProvider::Stork,
            "chainlink" => FeedProvider::Chainlink,
            other => FeedProvider::Dynamic(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FeedProvider::Stork => "stork",
            FeedProvider::Chainlink => "chainlink",
            FeedProvider::Dynamic(slug) => slug,
        }
    }
}

impl fmt::Display for FeedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single publisher-signed price inside a Stork asset pair. Timestamp is in
/// seconds, the signature is the 65-byte `r || s || v` concatenation.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedPriceOfAssetPair {
    pub publisher_key: String,
    pub timestamp: u64,
    pub price: Decimal,
    pub signature: Vec<u8>,
}

/// A set of per-publisher signed prices for one Stork asset in one time window.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssetPair {
    pub asset_id: String,
    pub signed_prices: Vec<SignedPriceOfAssetPair>,
}

/// Opaque Chainlink Data Streams report with its validity window. The chain
/// module decodes the report; the relayer only carries it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainlinkReport {
    pub feed_id: Vec<u8>,
    pub full_report: Vec<u8>,
    pub valid_from_timestamp: u64,
    pub observations_timestamp: u64,
}

/// Observation payload, tagged by the oracle type that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum PricePayload {
    /// PriceFeed / Provider observations carry a plain decimal price.
    Price(Decimal),
    /// Stork observations carry the full signed asset pair.
    AssetPair(AssetPair),
    /// Chainlink observations carry the opaque report.
    Report(ChainlinkReport),
}

/// One observation emitted by a puller. Created by a puller, consumed once by
/// the batcher, never mutated.
#[derive(Debug, Clone)]
pub struct PriceData {
    pub ticker: Ticker,
    pub provider_name: String,
    pub symbol: String,
    pub oracle_type: OracleType,
    pub timestamp: DateTime<Utc>,
    pub payload: PricePayload,
}

impl PriceData {
    /// Plain decimal price, if this observation carries one.
    pub fn price(&self) -> Option<Decimal> {
        match &self.payload {
            PricePayload::Price(p) => Some(*p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_splits_on_slash() {
        let t = Ticker::parse("INJ/USDT").unwrap();
        assert_eq!(t.base(), "INJ");
        assert_eq!(t.quote(), "USDT");
        assert_eq!(format!("{}/{}", t.base(), t.quote()), t.as_str());
    }

    #[test]
    fn ticker_rejects_malformed_pairs() {
        assert!(Ticker::parse("INJUSDT").is_none());
        assert!(Ticker::parse("A/B/C").is_none());
        assert!(Ticker::parse("/USDT").is_none());
        assert!(Ticker::parse("INJ/").is_none());
    }

    #[test]
    fn oracle_type_round_trip() {
        for name in ["PriceFeed", "Provider", "Stork", "Chainlink"] {
            assert!(OracleType::from_str(name).is_some());
        }
        assert!(OracleType::from_str("Band").is_none());
    }

    #[test]
    fn provider_slug_mapping() {
        assert_eq!(FeedProvider::from_slug("stork"), FeedProvider::Stork);
        assert_eq!(FeedProvider::from_slug("chainlink"), FeedProvider::Chainlink);
        assert_eq!(
            FeedProvider::from_slug("binance_v3"),
            FeedProvider::Dynamic("binance_v3".to_string())
        );
    }
}
