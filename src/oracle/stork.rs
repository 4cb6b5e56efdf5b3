//! Stork streaming fetcher
//!
//! Long-lived WebSocket subscription that keeps the latest signed asset pair
//! per ticker. The fetcher owns the cache; the reconnect policy belongs to
//! the driver around it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StorkSettings;
use crate::oracle::PricePuller;
use crate::types::{
    AssetPair, FeedProvider, OracleType, PriceData, PricePayload, SignedPriceOfAssetPair, Ticker,
};

/// Maximum publisher-timestamp spread inside one asset frame (500 ms).
pub const MAX_TIMESTAMP_SPREAD_NANOS: u64 = 500_000_000;

/// Dial attempts before the driver gives up for this cycle.
pub const MAX_WS_DIAL_RETRIES: u32 = 5;

const WS_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorkError {
    #[error("received invalid message")]
    InvalidMessage,

    #[error("no tickers to subscribe to")]
    NoTickers,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("connection closed by server")]
    ConnectionClosed,
}

/// Which publisher samples survive ingestion when a frame mixes timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalePricePolicy {
    /// Keep only samples whose seconds-granular timestamp equals the newest
    /// one. Sub-second-older samples are dropped with the stale ones.
    #[default]
    NewestSecondOnly,
    /// Keep every sample that passed the spread gate.
    KeepAll,
}

pub struct StorkFetcher {
    latest_pairs: RwLock<HashMap<String, AssetPair>>,
    tickers: Vec<String>,
    message_template: String,
    policy: StalePricePolicy,
}

impl StorkFetcher {
    pub fn new(message_template: impl Into<String>, tickers: Vec<String>) -> Self {
        StorkFetcher {
            latest_pairs: RwLock::new(HashMap::new()),
            tickers,
            message_template: message_template.into(),
            policy: StalePricePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: StalePricePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    /// Latest asset pair for a ticker, if any frame delivered one since the
    /// connection came up.
    pub async fn asset_pair(&self, ticker: &str) -> Option<AssetPair> {
        self.latest_pairs.read().await.get(ticker).cloned()
    }

    /// Run the subscription over an established connection. Returns when the
    /// connection fails or the server sends `invalid_message`; the cache is
    /// cleared on the way out so stale quotes never outlive the stream.
    pub async fn start<S>(&self, ws: WebSocketStream<S>) -> Result<(), StorkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.read_loop(ws).await;
        self.reset().await;
        result
    }

    async fn reset(&self) {
        self.latest_pairs.write().await.clear();
    }

    async fn read_loop<S>(&self, mut ws: WebSocketStream<S>) -> Result<(), StorkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.tickers.is_empty() {
            return Err(StorkError::NoTickers);
        }

        let subscribe = self
            .message_template
            .replacen("%s", &self.tickers.join("\",\""), 1);
        debug!(tickers = ?self.tickers, "subscribing to tickers");
        ws.send(Message::Text(subscribe)).await?;

        loop {
            let message = match ws.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    counter!("feed_provider.stork.unable_read_message").increment(1);
                    warn!(error = %err, "error reading stork message");
                    return Err(StorkError::WebSocket(err));
                }
                None => {
                    counter!("feed_provider.stork.unable_read_message").increment(1);
                    return Err(StorkError::ConnectionClosed);
                }
            };

            match message {
                Message::Text(text) => self.handle_frame(&text).await?,
                Message::Ping(payload) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Message::Close(_) => return Err(StorkError::ConnectionClosed),
                _ => {}
            }
        }
    }

    /// Dispatch one JSON frame. Malformed frames are logged and skipped; an
    /// `invalid_message` frame is fatal for the connection.
    pub async fn handle_frame(&self, text: &str) -> Result<(), StorkError> {
        let frame: WsFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "error unmarshalling feed message");
                return Ok(());
            }
        };

        match frame.msg_type.as_str() {
            "invalid_message" => {
                counter!("feed_provider.stork.invalid_message").increment(1);
                Err(StorkError::InvalidMessage)
            }
            "subscribe" => {
                info!(tickers = %self.tickers.join(","), "subscribed to tickers");
                Ok(())
            }
            "oracle_prices" => {
                let data: HashMap<String, WsAssetData> =
                    match serde_json::from_value(frame.data) {
                        Ok(data) => data,
                        Err(err) => {
                            warn!(error = %err, "error unmarshalling oracle data");
                            return Ok(());
                        }
                    };
                self.ingest_prices(data).await;
                Ok(())
            }
            other => {
                counter!("feed_provider.stork.unknown_message").increment(1);
                warn!(msg_type = %other, "received unknown message type");
                Ok(())
            }
        }
    }

    async fn ingest_prices(&self, data: HashMap<String, WsAssetData>) {
        let mut new_pairs: HashMap<String, AssetPair> = HashMap::new();

        for (asset_id, asset) in data {
            let newest = match newest_timestamp_in_range(&asset) {
                Ok(ts) => ts,
                Err(err) => {
                    counter!("feed_provider.stork.max_diff_threshold").increment(1);
                    warn!(asset = %asset_id, error = %err, "error finding timestamp");
                    continue;
                }
            };

            let pair = convert_to_asset_pair(&asset, &asset_id, newest, self.policy);
            new_pairs.insert(asset_id, pair);
        }

        if new_pairs.is_empty() {
            return;
        }

        let mut cache = self.latest_pairs.write().await;
        for (key, value) in new_pairs {
            cache.insert(key, value);
        }
    }
}

/// Newest publisher timestamp (nanoseconds) of the frame, or an error when
/// the spread between newest and oldest exceeds the 500 ms gate.
fn newest_timestamp_in_range(asset: &WsAssetData) -> Result<u64, String> {
    let mut newest: u64 = 0;
    let mut oldest: u64 = u64::MAX;

    for signed_price in &asset.signed_prices {
        let nanos = normalize_timestamp_nanos(signed_price.timestamped_signature.timestamp);
        newest = newest.max(nanos);
        oldest = oldest.min(nanos);
    }

    if newest == 0 {
        return Err(format!("asset {:?} has no price timestamps", asset.asset_id));
    }

    if newest - oldest > MAX_TIMESTAMP_SPREAD_NANOS {
        return Err(format!(
            "asset {:?} price timestamps between {oldest} and {newest} exceed threshold {MAX_TIMESTAMP_SPREAD_NANOS}",
            asset.asset_id
        ));
    }

    Ok(newest)
}

/// Normalize a raw publisher timestamp to nanoseconds by magnitude.
pub fn normalize_timestamp_nanos(ts: u64) -> u64 {
    if ts > 1_000_000_000_000_000_000 {
        ts // already nanoseconds
    } else if ts > 1_000_000_000_000_000 {
        ts.saturating_mul(1_000) // microseconds
    } else if ts > 1_000_000_000_000 {
        ts.saturating_mul(1_000_000) // milliseconds
    } else {
        ts.saturating_mul(1_000_000_000) // seconds
    }
}

pub fn timestamp_seconds(ts: u64) -> u64 {
    normalize_timestamp_nanos(ts) / 1_000_000_000
}

/// Convert a frame's asset into the canonical pair: timestamps in seconds,
/// signatures as decoded `r || s || v` bytes, and (by default) only the
/// samples sharing the newest second.
fn convert_to_asset_pair(
    asset: &WsAssetData,
    asset_id: &str,
    newest_nanos: u64,
    policy: StalePricePolicy,
) -> AssetPair {
    let newest_second = newest_nanos / 1_000_000_000;

    let mut signed_prices = Vec::with_capacity(asset.signed_prices.len());
    for sp in &asset.signed_prices {
        let seconds = timestamp_seconds(sp.timestamped_signature.timestamp);
        if policy == StalePricePolicy::NewestSecondOnly && seconds != newest_second {
            continue;
        }

        let signature = match decode_signature(&sp.timestamped_signature.signature) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(
                    asset = %asset_id,
                    publisher = %sp.publisher_key,
                    error = %err,
                    "skipping signed price with bad signature"
                );
                continue;
            }
        };

        let price = match sp.price.parse::<Decimal>() {
            Ok(price) => price,
            Err(err) => {
                warn!(
                    asset = %asset_id,
                    publisher = %sp.publisher_key,
                    error = %err,
                    "skipping signed price with bad price"
                );
                continue;
            }
        };

        signed_prices.push(SignedPriceOfAssetPair {
            publisher_key: sp.publisher_key.clone(),
            timestamp: seconds,
            price,
            signature,
        });
    }

    AssetPair {
        asset_id: asset_id.to_string(),
        signed_prices,
    }
}

/// Concatenate `r || s || v` with `0x` prefixes stripped and decode to bytes.
fn decode_signature(sig: &WsSignature) -> Result<Vec<u8>, hex::FromHexError> {
    let concat = format!(
        "{}{}{}",
        sig.r.trim_start_matches("0x"),
        sig.s.trim_start_matches("0x"),
        sig.v.trim_start_matches("0x"),
    );
    hex::decode(concat)
}

#[derive(Debug, Deserialize)]
struct WsFrame {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    #[allow(dead_code)]
    trace_id: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WsAssetData {
    #[serde(default)]
    asset_id: String,
    #[serde(default)]
    signed_prices: Vec<WsSignedPrice>,
}

#[derive(Debug, Deserialize)]
struct WsSignedPrice {
    publisher_key: String,
    price: String,
    timestamped_signature: WsTimestampedSignature,
}

#[derive(Debug, Deserialize)]
struct WsTimestampedSignature {
    signature: WsSignature,
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct WsSignature {
    r: String,
    s: String,
    v: String,
}

/// Dial the Stork endpoint with basic auth, retrying up to
/// [`MAX_WS_DIAL_RETRIES`] times with 5 s spacing.
pub async fn connect_websocket(
    url: &str,
    auth_header: &str,
    token: &CancellationToken,
) -> anyhow::Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let mut retries = 0u32;
    loop {
        let mut request = url
            .into_client_request()
            .map_err(|e| anyhow::anyhow!("can not parse WS url {url}: {e}"))?;
        if !auth_header.is_empty() {
            request.headers_mut().insert(
                "Authorization",
                format!("Basic {}", BASE64.encode(auth_header))
                    .parse()
                    .expect("base64 output is a valid header value"),
            );
        }

        tokio::select! {
            _ = token.cancelled() => anyhow::bail!("cancelled while dialing websocket"),
            dialed = connect_async(request) => match dialed {
                Ok((conn, _resp)) => {
                    info!("connected to WebSocket server");
                    return Ok(conn);
                }
                Err(err) => {
                    retries += 1;
                    if retries > MAX_WS_DIAL_RETRIES {
                        anyhow::bail!("reached maximum retries ({MAX_WS_DIAL_RETRIES}): {err}");
                    }
                    info!(error = %err, retries, "failed to connect to WebSocket server, retrying in 5s");
                    tokio::select! {
                        _ = token.cancelled() => anyhow::bail!("cancelled while dialing websocket"),
                        _ = tokio::time::sleep(WS_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }
}

/// Reconnect loop around the fetcher: dial, run, wait 5 s, dial again, until
/// the token is cancelled.
pub async fn run_stork_driver(
    fetcher: Arc<StorkFetcher>,
    settings: StorkSettings,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            return;
        }

        let conn = match connect_websocket(
            &settings.websocket_url,
            &settings.websocket_header,
            &token,
        )
        .await
        {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "stork websocket dial failed");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(WS_RETRY_DELAY) => continue,
                }
            }
        };

        tokio::select! {
            _ = token.cancelled() => return,
            result = fetcher.start(conn) => {
                if let Err(err) = result {
                    warn!(error = %err, "stork fetcher stopped, reconnecting in 5s");
                }
            }
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(WS_RETRY_DELAY) => {}
        }
    }
}

/// Puller adapter: reads the fetcher cache once per cycle.
pub struct StorkPriceFeed {
    fetcher: Arc<StorkFetcher>,
    ticker: Ticker,
    provider_name: String,
    interval: Duration,
}

impl StorkPriceFeed {
    pub fn new(
        fetcher: Arc<StorkFetcher>,
        cfg: &crate::config::feeds::FeedConfig,
    ) -> anyhow::Result<Self> {
        Ok(StorkPriceFeed {
            fetcher,
            ticker: cfg.ticker.clone(),
            provider_name: cfg.provider.clone(),
            interval: cfg.pull_interval,
        })
    }
}

#[async_trait::async_trait]
impl PricePuller for StorkPriceFeed {
    fn provider(&self) -> FeedProvider {
        FeedProvider::Stork
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
        OracleType::Stork
    }

    async fn pull_price(&self) -> anyhow::Result<Option<PriceData>> {
        let pair = match self.fetcher.asset_pair(self.ticker.as_str()).await {
            Some(pair) if !pair.signed_prices.is_empty() => pair,
            _ => return Ok(None), // cache empty, skip this cycle
        };

        Ok(Some(PriceData {
            ticker: self.ticker.clone(),
            provider_name: self.provider_name.clone(),
            symbol: self.ticker.as_str().to_string(),
            oracle_type: OracleType::Stork,
            timestamp: chrono::Utc::now(),
            payload: PricePayload::AssetPair(pair),
        }))
    }
}
