//! End-to-end dynamic feed tests against a local mock HTTP endpoint.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use rust_decimal_macros::dec;

use oracle_relayer::config::feeds::FeedConfig;
use oracle_relayer::oracle::batch::compose_msgs;
use oracle_relayer::oracle::{DynamicPriceFeed, PricePuller};
use oracle_relayer::chain::RelayMsg;
use oracle_relayer::types::OracleType;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn feed_toml(base_url: &str, extra_attrs: &str) -> String {
    format!(
        r#"
provider = "binance_v3"
ticker = "INJ/USDT"
pullInterval = "1m"
observationSource = """
   ticker [type=http method=GET url="{base_url}/api/v3/ticker/price?symbol=INJUSDT"{extra_attrs}];
   parsePrice [type=jsonparse path="price"];
   multiplyDecimals [type=multiply times=1000000];
   ticker -> parsePrice -> multiplyDecimals
"""
"#
    )
}

#[tokio::test]
async fn dynamic_http_feed_produces_a_relayable_observation() {
    let base_url = serve(Router::new().route(
        "/api/v3/ticker/price",
        get(|| async { r#"{"symbol":"INJUSDT","price":"4.948"}"# }),
    ))
    .await;

    let cfg = FeedConfig::parse_toml(&feed_toml(&base_url, "")).unwrap();
    let feed = DynamicPriceFeed::new(&cfg).unwrap();

    let data = feed.pull_price().await.unwrap().unwrap();
    assert_eq!(data.price(), Some(dec!(4948000)));
    assert_eq!(data.oracle_type, OracleType::PriceFeed);

    let batch = [&data];
    let msgs = compose_msgs("inj1relayer", &batch);
    assert_eq!(msgs.len(), 1);
    let RelayMsg::PriceFeedPrice(msg) = &msgs[0] else {
        panic!("expected a price feed relay message");
    };
    assert_eq!(msg.base, vec!["INJ"]);
    assert_eq!(msg.quote, vec!["USDT"]);
    assert_eq!(msg.price, vec!["4948000"]);
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let hits = Arc::new(AtomicU32::new(0));
    let router = Router::new()
        .route(
            "/api/v3/ticker/price",
            get(|State(hits): State<Arc<AtomicU32>>| async move {
                if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                    (StatusCode::INTERNAL_SERVER_ERROR, "oops".to_string())
                } else {
                    (
                        StatusCode::OK,
                        r#"{"symbol":"INJUSDT","price":"4.948"}"#.to_string(),
                    )
                }
            }),
        )
        .with_state(Arc::clone(&hits));
    let base_url = serve(router).await;

    let cfg = FeedConfig::parse_toml(&feed_toml(
        &base_url,
        " retries=3 minBackoff=10ms maxBackoff=50ms",
    ))
    .unwrap();
    let feed = DynamicPriceFeed::new(&cfg).unwrap();

    let data = feed.pull_price().await.unwrap().unwrap();
    assert_eq!(data.price(), Some(dec!(4948000)));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let hits = Arc::new(AtomicU32::new(0));
    let router = Router::new()
        .route(
            "/api/v3/ticker/price",
            get(|State(hits): State<Arc<AtomicU32>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::NOT_FOUND, r#"{"error":"no such symbol"}"#)
            }),
        )
        .with_state(Arc::clone(&hits));
    let base_url = serve(router).await;

    let cfg = FeedConfig::parse_toml(&feed_toml(
        &base_url,
        " retries=3 minBackoff=10ms maxBackoff=50ms",
    ))
    .unwrap();
    let feed = DynamicPriceFeed::new(&cfg).unwrap();

    let err = feed.pull_price().await.unwrap_err();
    assert!(err.to_string().contains("fatal errors"));
    // a 4xx is final: one request, no retries
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn request_headers_reach_the_endpoint() {
    let router = Router::new().route(
        "/api/v3/ticker/price",
        get(|headers: axum::http::HeaderMap| async move {
            if headers.get("x-api-key").map(|v| v.to_str().unwrap()) == Some("sekrit") {
                (StatusCode::OK, r#"{"symbol":"INJUSDT","price":"1"}"#)
            } else {
                (StatusCode::UNAUTHORIZED, r#"{"error":"missing key"}"#)
            }
        }),
    );
    let base_url = serve(router).await;

    let cfg = FeedConfig::parse_toml(&feed_toml(
        &base_url,
        r#" headerMap="{\\"x-api-key\\": \\"sekrit\\"}""#,
    ))
    .unwrap();
    let feed = DynamicPriceFeed::new(&cfg).unwrap();

    let data = feed.pull_price().await.unwrap().unwrap();
    assert_eq!(data.price(), Some(dec!(1000000)));
}
