//! Batcher / broadcaster
//!
//! Drains the observation channel into a keyed batch (most recent observation
//! per oracle-type + symbol wins), flushes on size or time, composes one
//! relay message per oracle kind, and walks the chain-client list until one
//! of them acks the transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{
    ChainClient, MsgRelayChainlinkPrices, MsgRelayPriceFeedPrice, MsgRelayProviderPrices,
    MsgRelayStorkPrices, RelayMsg,
};
use crate::types::{OracleType, PriceData, PricePayload};

const BATCH_TIME_LIMIT: Duration = Duration::from_secs(5);
const BATCH_SIZE_LIMIT: usize = 100;
const CHAIN_BROADCAST_TIMEOUT: Duration = Duration::from_secs(3);
const BROADCAST_RETRY_DELAY: Duration = Duration::from_millis(500);
const BROADCAST_MAX_RETRIES: u32 = 3;

pub struct Batcher {
    clients: Vec<Arc<dyn ChainClient>>,
}

impl Batcher {
    pub fn new(clients: Vec<Arc<dyn ChainClient>>) -> Self {
        Batcher { clients }
    }

    /// Consume observations until the channel closes or the token fires; both
    /// paths do one final flush before returning.
    pub async fn run(&self, mut rx: mpsc::Receiver<PriceData>, token: CancellationToken) {
        let mut batch: BTreeMap<String, PriceData> = BTreeMap::new();
        let mut meta: HashMap<OracleType, u64> = HashMap::new();

        let timer = tokio::time::sleep(BATCH_TIME_LIMIT);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("cancelled, stopping price committer");
                    self.submit_batch(std::mem::take(&mut batch), std::mem::take(&mut meta), false).await;
                    return;
                }
                received = rx.recv() => {
                    let Some(data) = received else {
                        info!("stopping committing prices");
                        self.submit_batch(std::mem::take(&mut batch), std::mem::take(&mut meta), false).await;
                        return;
                    };

                    if !validate(&data) {
                        continue;
                    }

                    *meta.entry(data.oracle_type).or_default() += 1;
                    let key = format!("{}:{}", data.oracle_type, data.symbol);
                    batch.insert(key, data);

                    if batch.len() >= BATCH_SIZE_LIMIT {
                        self.submit_batch(std::mem::take(&mut batch), std::mem::take(&mut meta), false).await;
                        timer.as_mut().reset(tokio::time::Instant::now() + BATCH_TIME_LIMIT);
                    }
                }
                _ = &mut timer => {
                    self.submit_batch(std::mem::take(&mut batch), std::mem::take(&mut meta), true).await;
                    timer.as_mut().reset(tokio::time::Instant::now() + BATCH_TIME_LIMIT);
                }
            }
        }
    }

    async fn submit_batch(
        &self,
        batch: BTreeMap<String, PriceData>,
        meta: HashMap<OracleType, u64>,
        timeout_flush: bool,
    ) {
        if batch.is_empty() {
            return;
        }

        debug!(batch_size = batch.len(), timeout = timeout_flush, "submitting batch");

        let observations: Vec<&PriceData> = batch.values().collect();

        for client in &self.clients {
            let msgs = compose_msgs(client.sender(), &observations);
            if msgs.is_empty() {
                debug!(client = %client.sender(), "composed no messages for this client");
                continue;
            }

            if self.broadcast_to_client(client.as_ref(), &msgs, &meta).await {
                return;
            }
        }

        warn!(batch_size = batch.len(), "no chain client accepted the batch, dropping it");
        counter!("price_oracle.batch_dropped").increment(1);
    }

    /// One broadcast attempt against one client. True means the batch is done.
    async fn broadcast_to_client(
        &self,
        client: &dyn ChainClient,
        msgs: &[RelayMsg],
        meta: &HashMap<OracleType, u64>,
    ) -> bool {
        let started = std::time::Instant::now();

        let response = match client
            .sync_broadcast_msgs(
                CHAIN_BROADCAST_TIMEOUT,
                BROADCAST_RETRY_DELAY,
                BROADCAST_MAX_RETRIES,
                msgs,
            )
            .await
        {
            Ok(response) => response,
            Err(err) => {
                counter!("price_oracle.broadcast_errors").increment(1);
                error!(client = %client.sender(), error = %err, "failed to SyncBroadcastMsg");
                return false;
            }
        };

        let Some(tx_response) = response.tx_response else {
            return false;
        };

        if tx_response.code != 0 {
            counter!("price_oracle.broadcast_errors").increment(1);
            error!(
                client = %client.sender(),
                hash = %tx_response.tx_hash,
                err_code = tx_response.code,
                raw_log = %tx_response.raw_log,
                "set price Tx error"
            );
            return false;
        }

        for (oracle_type, count) in meta {
            counter!(
                "price_oracle.submitted_prices",
                "oracle_type" => oracle_type.as_str()
            )
            .increment(*count);
        }

        let elapsed = started.elapsed();
        histogram!("price_oracle.execution_time_ms").record(elapsed.as_millis() as f64);

        info!(
            client = %client.sender(),
            height = tx_response.height,
            hash = %tx_response.tx_hash,
            elapsed_ms = elapsed.as_millis() as u64,
            "sent Tx successfully"
        );

        true
    }
}

/// Drop observations that cannot be relayed. Mirrors the relay module's own
/// acceptance rules so bad data never costs a broadcast.
fn validate(data: &PriceData) -> bool {
    match (&data.payload, data.oracle_type) {
        (PricePayload::AssetPair(pair), OracleType::Stork) => {
            if pair.signed_prices.is_empty() {
                debug!(ticker = %data.ticker, provider = %data.provider_name, "got empty asset pair for stork oracle, skipping");
                return false;
            }
            true
        }
        (PricePayload::Report(report), OracleType::Chainlink) => {
            if report.feed_id.is_empty() || report.full_report.is_empty() {
                debug!(ticker = %data.ticker, provider = %data.provider_name, "got invalid chainlink report data, skipping");
                return false;
            }
            true
        }
        (PricePayload::Price(price), _) => {
            if price.is_zero() || price.is_sign_negative() {
                debug!(ticker = %data.ticker, provider = %data.provider_name, "got negative or zero price, skipping");
                return false;
            }
            true
        }
        (payload, oracle_type) => {
            debug!(
                ticker = %data.ticker,
                ?payload,
                %oracle_type,
                "payload does not match oracle type, skipping"
            );
            false
        }
    }
}

/// Build the relay messages for one flush, grouped per oracle kind.
pub fn compose_msgs(sender: &str, batch: &[&PriceData]) -> Vec<RelayMsg> {
    let mut msgs = Vec::new();
    msgs.extend(compose_price_feed_msg(sender, batch));
    msgs.extend(compose_provider_msgs(sender, batch));
    msgs.extend(compose_stork_msg(sender, batch));
    msgs.extend(compose_chainlink_msg(sender, batch));
    msgs
}

fn compose_price_feed_msg(sender: &str, batch: &[&PriceData]) -> Option<RelayMsg> {
    let mut msg = MsgRelayPriceFeedPrice {
        sender: sender.to_string(),
        base: Vec::new(),
        quote: Vec::new(),
        price: Vec::new(),
    };

    for data in batch {
        if data.oracle_type != OracleType::PriceFeed {
            continue;
        }
        let Some(price) = data.price() else { continue };
        msg.base.push(data.ticker.base().to_string());
        msg.quote.push(data.ticker.quote().to_string());
        msg.price.push(price.to_string());
    }

    (!msg.base.is_empty()).then_some(RelayMsg::PriceFeedPrice(msg))
}

fn compose_provider_msgs(sender: &str, batch: &[&PriceData]) -> Vec<RelayMsg> {
    let mut per_provider: BTreeMap<String, MsgRelayProviderPrices> = BTreeMap::new();

    for data in batch {
        if data.oracle_type != OracleType::Provider {
            continue;
        }
        let Some(price) = data.price() else { continue };
        let provider = data.provider_name.to_lowercase();
        let msg = per_provider
            .entry(provider.clone())
            .or_insert_with(|| MsgRelayProviderPrices {
                sender: sender.to_string(),
                provider,
                symbols: Vec::new(),
                prices: Vec::new(),
            });
        msg.symbols.push(data.symbol.clone());
        msg.prices.push(price.to_string());
    }

    per_provider
        .into_values()
        .map(RelayMsg::ProviderPrices)
        .collect()
}

fn compose_stork_msg(sender: &str, batch: &[&PriceData]) -> Option<RelayMsg> {
    let asset_pairs: Vec<_> = batch
        .iter()
        .filter(|data| data.oracle_type == OracleType::Stork)
        .filter_map(|data| match &data.payload {
            PricePayload::AssetPair(pair) => Some(pair.clone()),
            _ => None,
        })
        .collect();

    (!asset_pairs.is_empty()).then(|| {
        RelayMsg::StorkPrices(MsgRelayStorkPrices {
            sender: sender.to_string(),
            asset_pairs,
        })
    })
}

fn compose_chainlink_msg(sender: &str, batch: &[&PriceData]) -> Option<RelayMsg> {
    let reports: Vec<_> = batch
        .iter()
        .filter(|data| data.oracle_type == OracleType::Chainlink)
        .filter_map(|data| match &data.payload {
            PricePayload::Report(report) => Some(report.clone()),
            _ => None,
        })
        .collect();

    (!reports.is_empty()).then(|| {
        RelayMsg::ChainlinkPrices(MsgRelayChainlinkPrices {
            sender: sender.to_string(),
            reports,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BroadcastResponse, TxResponse};
    use crate::types::{AssetPair, ChainlinkReport, SignedPriceOfAssetPair, Ticker};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn price_observation(ticker: &str, oracle_type: OracleType, price: Decimal) -> PriceData {
        PriceData {
            ticker: Ticker::from(ticker),
            provider_name: "binance_v3".to_string(),
            symbol: ticker.to_string(),
            oracle_type,
            timestamp: Utc::now(),
            payload: PricePayload::Price(price),
        }
    }

    fn stork_observation(ticker: &str, publishers: usize) -> PriceData {
        PriceData {
            ticker: Ticker::from(ticker),
            provider_name: "stork".to_string(),
            symbol: ticker.to_string(),
            oracle_type: OracleType::Stork,
            timestamp: Utc::now(),
            payload: PricePayload::AssetPair(AssetPair {
                asset_id: ticker.to_string(),
                signed_prices: (0..publishers)
                    .map(|i| SignedPriceOfAssetPair {
                        publisher_key: format!("0xpub{i}"),
                        timestamp: 1_737_468_044,
                        price: dec!(64000),
                        signature: vec![0u8; 65],
                    })
                    .collect(),
            }),
        }
    }

    struct RecordingClient {
        sender: String,
        responses: Mutex<VecDeque<Result<BroadcastResponse>>>,
        calls: Mutex<Vec<Vec<RelayMsg>>>,
    }

    impl RecordingClient {
        fn new(sender: &str, responses: Vec<Result<BroadcastResponse>>) -> Arc<Self> {
            Arc::new(RecordingClient {
                sender: sender.to_string(),
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn ack() -> Result<BroadcastResponse> {
            Ok(BroadcastResponse {
                tx_response: Some(TxResponse {
                    height: 100,
                    tx_hash: "HASH".to_string(),
                    code: 0,
                    raw_log: String::new(),
                }),
            })
        }

        fn nack(code: u32) -> Result<BroadcastResponse> {
            Ok(BroadcastResponse {
                tx_response: Some(TxResponse {
                    height: 0,
                    tx_hash: "BADHASH".to_string(),
                    code,
                    raw_log: "failed".to_string(),
                }),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChainClient for RecordingClient {
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
            self.calls.lock().unwrap().push(msgs.to_vec());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(Self::ack)
        }
    }

    #[test]
    fn validation_rules() {
        assert!(validate(&price_observation("INJ/USDT", OracleType::PriceFeed, dec!(1))));
        assert!(!validate(&price_observation("INJ/USDT", OracleType::PriceFeed, dec!(0))));
        assert!(!validate(&price_observation("INJ/USDT", OracleType::Provider, dec!(-1))));
        assert!(validate(&stork_observation("BTCUSD", 1)));
        assert!(!validate(&stork_observation("BTCUSD", 0)));

        let bad_report = PriceData {
            oracle_type: OracleType::Chainlink,
            payload: PricePayload::Report(ChainlinkReport {
                feed_id: Vec::new(),
                full_report: vec![1],
                valid_from_timestamp: 0,
                observations_timestamp: 0,
            }),
            ..price_observation("BTC/USD", OracleType::Chainlink, dec!(1))
        };
        assert!(!validate(&bad_report));
    }

    #[test]
    fn price_feed_msg_uses_parallel_slices() {
        let a = price_observation("INJ/USDT", OracleType::PriceFeed, dec!(4948000));
        let b = price_observation("BTC/USDT", OracleType::PriceFeed, dec!(64000));
        let batch = [&a, &b];
        let msgs = compose_msgs("inj1sender", &batch);
        assert_eq!(msgs.len(), 1);
        let RelayMsg::PriceFeedPrice(msg) = &msgs[0] else {
            panic!("expected a price feed message");
        };
        assert_eq!(msg.sender, "inj1sender");
        assert_eq!(msg.base, vec!["INJ", "BTC"]);
        assert_eq!(msg.quote, vec!["USDT", "USDT"]);
        assert_eq!(msg.price, vec!["4948000", "64000"]);
    }

    #[test]
    fn provider_msgs_group_by_lowercased_provider() {
        let mut a = price_observation("INJ/USDT", OracleType::Provider, dec!(1));
        a.provider_name = "Binance".to_string();
        let mut b = price_observation("BTC/USDT", OracleType::Provider, dec!(2));
        b.provider_name = "binance".to_string();
        let mut c = price_observation("ETH/USDT", OracleType::Provider, dec!(3));
        c.provider_name = "kraken".to_string();

        let batch = [&a, &b, &c];
        let msgs = compose_msgs("inj1sender", &batch);
        assert_eq!(msgs.len(), 2);

        let providers: Vec<&str> = msgs
            .iter()
            .filter_map(|m| match m {
                RelayMsg::ProviderPrices(p) => Some(p.provider.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(providers, vec!["binance", "kraken"]);

        let RelayMsg::ProviderPrices(binance) = &msgs[0] else {
            panic!("expected provider message");
        };
        assert_eq!(binance.symbols.len(), 2);
        assert_eq!(binance.prices.len(), 2);
    }

    #[test]
    fn mixed_batch_composes_one_msg_per_kind() {
        let pf = price_observation("INJ/USDT", OracleType::PriceFeed, dec!(1));
        let stork = stork_observation("BTCUSD", 2);
        let chainlink = PriceData {
            oracle_type: OracleType::Chainlink,
            payload: PricePayload::Report(ChainlinkReport {
                feed_id: vec![0u8; 32],
                full_report: vec![1, 2],
                valid_from_timestamp: 1,
                observations_timestamp: 2,
            }),
            ..price_observation("BTC/USD", OracleType::Chainlink, dec!(1))
        };
        let batch = [&pf, &stork, &chainlink];
        let msgs = compose_msgs("inj1sender", &batch);
        assert_eq!(msgs.len(), 3);
    }

    #[tokio::test]
    async fn broadcast_failover_tries_next_client() {
        let first = RecordingClient::new("inj1first", vec![RecordingClient::nack(13)]);
        let second = RecordingClient::new("inj1second", vec![RecordingClient::ack()]);
        let batcher = Batcher::new(vec![first.clone(), second.clone()]);

        let mut batch = BTreeMap::new();
        let data = price_observation("INJ/USDT", OracleType::PriceFeed, dec!(5));
        batch.insert("pricefeed:INJ/USDT".to_string(), data);
        batcher.submit_batch(batch, HashMap::new(), false).await;

        assert_eq!(first.call_count(), 1);
        assert_eq!(second.call_count(), 1);
        // each client composes with its own sender identity
        let second_calls = second.calls.lock().unwrap();
        let RelayMsg::PriceFeedPrice(msg) = &second_calls[0][0] else {
            panic!("expected price feed message");
        };
        assert_eq!(msg.sender, "inj1second");
    }

    #[tokio::test]
    async fn transport_error_also_fails_over() {
        let first = RecordingClient::new("inj1first", vec![Err(anyhow::anyhow!("conn refused"))]);
        let second = RecordingClient::new("inj1second", vec![RecordingClient::ack()]);
        let batcher = Batcher::new(vec![first.clone(), second.clone()]);

        let mut batch = BTreeMap::new();
        batch.insert(
            "pricefeed:INJ/USDT".to_string(),
            price_observation("INJ/USDT", OracleType::PriceFeed, dec!(5)),
        );
        batcher.submit_batch(batch, HashMap::new(), false).await;

        assert_eq!(first.call_count(), 1);
        assert_eq!(second.call_count(), 1);
    }

    #[tokio::test]
    async fn successful_first_client_stops_the_walk() {
        let first = RecordingClient::new("inj1first", vec![RecordingClient::ack()]);
        let second = RecordingClient::new("inj1second", vec![]);
        let batcher = Batcher::new(vec![first.clone(), second.clone()]);

        let mut batch = BTreeMap::new();
        batch.insert(
            "pricefeed:INJ/USDT".to_string(),
            price_observation("INJ/USDT", OracleType::PriceFeed, dec!(5)),
        );
        batcher.submit_batch(batch, HashMap::new(), false).await;

        assert_eq!(first.call_count(), 1);
        assert_eq!(second.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn size_threshold_triggers_flush() {
        let client = RecordingClient::new("inj1sender", vec![]);
        let (tx, rx) = mpsc::channel(256);
        let token = CancellationToken::new();

        let run_token = token.clone();
        let handle = {
            let client = client.clone();
            tokio::spawn(async move {
                Batcher::new(vec![client]).run(rx, run_token).await;
            })
        };

        // 120 distinct tickers worth of observations
        for i in 0..120 {
            let data =
                price_observation(&format!("T{i}/USDT"), OracleType::PriceFeed, dec!(1));
            tx.send(data).await.unwrap();
        }
        tokio::task::yield_now().await;

        // first flush at exactly the size limit
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.call_count(), 1);
        {
            let calls = client.calls.lock().unwrap();
            let RelayMsg::PriceFeedPrice(msg) = &calls[0][0] else {
                panic!("expected price feed message");
            };
            assert_eq!(msg.base.len(), 100);
        }

        // the remaining 20 go out on the expiration timer
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(client.call_count(), 2);
        {
            let calls = client.calls.lock().unwrap();
            let RelayMsg::PriceFeedPrice(msg) = &calls[1][0] else {
                panic!("expected price feed message");
            };
            assert_eq!(msg.base.len(), 20);
        }

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_flushes_pending_observations() {
        let client = RecordingClient::new("inj1sender", vec![]);
        let (tx, rx) = mpsc::channel(16);
        let token = CancellationToken::new();

        let handle = {
            let client = client.clone();
            let token = token.clone();
            tokio::spawn(async move {
                Batcher::new(vec![client]).run(rx, token).await;
            })
        };

        for ticker in ["A/USDT", "B/USDT", "C/USDT"] {
            tx.send(price_observation(ticker, OracleType::PriceFeed, dec!(1)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        token.cancel();
        handle.await.unwrap();

        assert_eq!(client.call_count(), 1);
        let calls = client.calls.lock().unwrap();
        let RelayMsg::PriceFeedPrice(msg) = &calls[0][0] else {
            panic!("expected price feed message");
        };
        assert_eq!(msg.base.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn latest_observation_per_key_wins() {
        let client = RecordingClient::new("inj1sender", vec![]);
        let (tx, rx) = mpsc::channel(16);
        let token = CancellationToken::new();

        let handle = {
            let client = client.clone();
            let token = token.clone();
            tokio::spawn(async move {
                Batcher::new(vec![client]).run(rx, token).await;
            })
        };

        tx.send(price_observation("INJ/USDT", OracleType::PriceFeed, dec!(1)))
            .await
            .unwrap();
        tx.send(price_observation("INJ/USDT", OracleType::PriceFeed, dec!(2)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();

        let calls = client.calls.lock().unwrap();
        let RelayMsg::PriceFeedPrice(msg) = &calls[0][0] else {
            panic!("expected price feed message");
        };
        assert_eq!(msg.price, vec!["2"]);
    }
}
