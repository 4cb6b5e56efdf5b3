//! Chain client seam
//!
//! Typed relay messages and the broadcast interface the batcher drives. The
//! actual transaction signing and gRPC plumbing live behind the
//! [`ChainClient`] trait; this crate ships a dry-run implementation for
//! operation without a connected chain backend, and tests provide doubles.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::types::{AssetPair, ChainlinkReport};

/// One chain endpoint slot. A list of slots is accepted and tried in order.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainEndpoints {
    pub tendermint_rpc: String,
    pub cosmos_grpc: String,
    #[serde(default)]
    pub cosmos_stream_grpc: String,
    #[serde(default)]
    pub gas_prices: String,
    #[serde(default = "default_gas_adjustment")]
    pub gas_adjustment: f64,
}

fn default_gas_adjustment() -> f64 {
    1.5
}

/// Relay price message. Prices travel as arbitrary-precision decimals encoded
/// as strings (the chain `Dec` convention).
#[derive(Debug, Clone, PartialEq)]
pub struct MsgRelayPriceFeedPrice {
    pub sender: String,
    pub base: Vec<String>,
    pub quote: Vec<String>,
    pub price: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MsgRelayProviderPrices {
    pub sender: String,
    pub provider: String,
    pub symbols: Vec<String>,
    pub prices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MsgRelayStorkPrices {
    pub sender: String,
    pub asset_pairs: Vec<AssetPair>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MsgRelayChainlinkPrices {
    pub sender: String,
    pub reports: Vec<ChainlinkReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayMsg {
    PriceFeedPrice(MsgRelayPriceFeedPrice),
    ProviderPrices(MsgRelayProviderPrices),
    StorkPrices(MsgRelayStorkPrices),
    ChainlinkPrices(MsgRelayChainlinkPrices),
}

#[derive(Debug, Clone, Default)]
pub struct TxResponse {
    pub height: i64,
    pub tx_hash: String,
    pub code: u32,
    pub raw_log: String,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastResponse {
    pub tx_response: Option<TxResponse>,
}

/// Broadcast surface of a connected chain client. Implementations are
/// expected to be internally thread-safe.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Relayer identity this client signs with.
    fn sender(&self) -> &str;

    /// Sign and broadcast the messages synchronously, retrying transport
    /// failures up to `max_retries` times spaced `retry_delay` apart, all
    /// within `timeout`.
    async fn sync_broadcast_msgs(
        &self,
        timeout: Duration,
        retry_delay: Duration,
        max_retries: u32,
        msgs: &[RelayMsg],
    ) -> Result<BroadcastResponse>;
}

/// Build the broadcast clients for the configured endpoint slots. Signing and
/// gRPC transport come from the deployment's chain SDK; this build ships the
/// dry-run client only.
pub fn connect_clients(
    settings: &crate::config::ChainSettings,
) -> Result<Vec<std::sync::Arc<dyn ChainClient>>> {
    if settings.dry_run {
        let sender = if settings.sender.is_empty() {
            "oracle-dry-run"
        } else {
            &settings.sender
        };
        return Ok(vec![std::sync::Arc::new(DryRunChainClient::new(sender))]);
    }

    anyhow::bail!(
        "chain.dry_run is off but this build has no chain signer backend; \
         wire a ChainClient implementation for the configured endpoints"
    )
}

/// Stand-in client used when no chain backend is wired up: every batch is
/// logged and acked. Useful for local runs and feed validation.
pub struct DryRunChainClient {
    sender: String,
}

impl DryRunChainClient {
    pub fn new(sender: impl Into<String>) -> Self {
        DryRunChainClient {
            sender: sender.into(),
        }
    }
}

#[async_trait]
impl ChainClient for DryRunChainClient {
    fn sender(&self) -> &str {
        &self.sender
    }

    async fn sync_broadcast_msgs(
        &self,
        _timeout: Duration,
        _retry_delay: Duration,
        _max_retries: u32,
        msgs: &[RelayMsg],
    ) -> Result<BroadcastResponse> {
        info!(sender = %self.sender, msgs = msgs.len(), "dry-run broadcast");
        Ok(BroadcastResponse {
            tx_response: Some(TxResponse {
                height: 0,
                tx_hash: "DRYRUN".to_string(),
                code: 0,
                raw_log: String::new(),
            }),
        })
    }
}
