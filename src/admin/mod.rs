//! Admin HTTP API
//!
//! Health probe plus a `/probe` endpoint that validates a feed config by
//! running its pipeline once.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::feeds::FeedConfig;
use crate::oracle::{DynamicPriceFeed, PricePuller};
use crate::types::FeedProvider;

pub struct AdminState {
    pub feed_count: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    feeds: usize,
}

#[derive(Serialize)]
struct ProbeResponse {
    result: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Build the admin router.
pub fn create_router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/probe", post(post_probe))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Serve the admin API until the process exits.
pub async fn serve(addr: &str, state: Arc<AdminState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "admin API listening");
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}

/// GET /health - liveness plus the loaded feed count.
async fn get_health(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        feeds: state.feed_count,
    })
}

/// POST /probe - validate one TOML feed config by pulling its price once.
async fn post_probe(body: String) -> impl IntoResponse {
    match probe_feed(&body).await {
        Ok(result) => (StatusCode::OK, Json(ProbeResponse { result })).into_response(),
        Err(ProbeError::BadConfig(err)) => {
            error!(error = %err, "failed to parse feed config for probe");
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
        Err(ProbeError::PullFailed(err)) => {
            error!(error = %err, "probe pull failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}

#[derive(Debug)]
pub enum ProbeError {
    BadConfig(anyhow::Error),
    PullFailed(anyhow::Error),
}

/// Parse, validate, and run a dynamic feed config once, returning the
/// terminal value as a decimal string.
pub async fn probe_feed(body: &str) -> Result<String, ProbeError> {
    let cfg = FeedConfig::parse_toml(body).map_err(ProbeError::BadConfig)?;

    if !matches!(FeedProvider::from_slug(&cfg.provider), FeedProvider::Dynamic(_)) {
        return Err(ProbeError::BadConfig(anyhow::anyhow!(
            "probe supports dynamic feeds only, got provider {:?}",
            cfg.provider
        )));
    }

    let puller = DynamicPriceFeed::new(&cfg).map_err(ProbeError::BadConfig)?;
    let data = puller
        .pull_price()
        .await
        .map_err(ProbeError::PullFailed)?
        .ok_or_else(|| ProbeError::PullFailed(anyhow::anyhow!("no observation produced")))?;

    let price = data
        .price()
        .ok_or_else(|| ProbeError::PullFailed(anyhow::anyhow!("observation has no price")))?;

    Ok(price.to_string())
}
