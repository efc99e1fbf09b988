//! Read-only dashboard endpoints
//!
//! Thin query layer over the aggregators; nothing here mutates core state.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::rates::percent_change;
use crate::AppState;

/// Indicator snapshot for one symbol.
#[derive(Serialize)]
pub struct IndicatorsResponse {
    pub symbol: String,
    pub rvol: Option<f64>,
    pub swing_low: Option<f64>,
    pub swing_high: Option<f64>,
    pub cvd: f64,
    pub imbalance_1m: Option<f64>,
    pub funding_rate: Option<f64>,
    pub open_interest: Option<f64>,
    pub oi_change_1h_pct: Option<f64>,
    pub dominance_price: Option<f64>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/indicators/{symbol}", get(get_indicators))
        .route("/api/setups", get(get_setups))
        .route("/api/signals", get(get_signals))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

/// GET /health - process liveness and uptime
async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": uptime,
        "symbols": state.config.symbols,
    }))
}

/// GET /api/indicators/{symbol} - current indicator values
async fn get_indicators(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let symbol = symbol.to_uppercase();
    if !state.config.symbols.contains(&symbol) {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("unknown symbol {symbol}")})),
        );
    }

    let now = Utc::now();
    let candles = state.candles.read().await;
    let flow = state.flow.read().await;
    let rates = state.rates.read().await;

    let swing = candles.swing_range(&symbol, state.config.swing_lookback);
    let rate = rates.snapshot(&symbol);
    let oi_change = match (rate.open_interest, rates.oi_at(&symbol, now - Duration::hours(1))) {
        (Some(current), Some(prior)) => percent_change(current, prior),
        _ => None,
    };

    let body = IndicatorsResponse {
        rvol: candles.rvol(&symbol, state.config.rvol_lookback),
        swing_low: swing.map(|(low, _)| low),
        swing_high: swing.map(|(_, high)| high),
        cvd: flow.cvd(&symbol),
        imbalance_1m: flow.imbalance_ratio(&symbol, 60_000, now),
        funding_rate: rate.funding_rate,
        open_interest: rate.open_interest,
        oi_change_1h_pct: oi_change,
        dominance_price: rates.dominance().map(|d| d.price),
        symbol,
    };

    (StatusCode::OK, Json(serde_json::json!(body)))
}

/// GET /api/setups - currently armed setups
async fn get_setups(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let setups = state.engine.read().await.pending_setups();
    Json(serde_json::json!({ "setups": setups }))
}

/// GET /api/signals - recent signal outcomes, newest first
async fn get_signals(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let signals = state.engine.read().await.recent_signals();
    Json(serde_json::json!({ "signals": signals }))
}
