//! Market stream gateway
//!
//! One combined-stream WebSocket carries trade prints, klines for three
//! timeframes, and mark-price pushes for every configured symbol. Events are
//! applied to the aggregators in arrival order; 15m and 5m closes drive the
//! setup engine. On any disconnect the task sleeps a fixed delay and
//! reconnects with the full subscription set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use crate::binance::client::DOMINANCE_SYMBOL;
use crate::binance::models::{AggTradeEvent, KlineEvent, MarkPriceEvent, StreamEnvelope};
use crate::types::{Candle, Timeframe};
use crate::AppState;

/// Default WebSocket base for USDⓈ-M futures.
pub const DEFAULT_WS_URL: &str = "wss://fstream.binance.com";

/// Fixed reconnect delay after any disconnect.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

fn ts_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("invalid timestamp millis: {ms}"))
}

/// Combined-stream URL for the full subscription set.
fn stream_url(ws_base: &str, symbols: &[String]) -> String {
    let mut streams = Vec::new();
    for symbol in symbols {
        let lower = symbol.to_lowercase();
        streams.push(format!("{lower}@aggTrade"));
        for timeframe in Timeframe::ALL {
            streams.push(format!("{lower}@kline_{}", timeframe.label()));
        }
        streams.push(format!("{lower}@markPrice"));
    }
    format!("{}/stream?streams={}", ws_base.trim_end_matches('/'), streams.join("/"))
}

/// Run the market stream for the process lifetime.
pub async fn run_market_stream(state: Arc<AppState>, ws_base: String) {
    let url = stream_url(&ws_base, &state.config.symbols);

    loop {
        info!("connecting market stream");
        match stream_once(&state, &url).await {
            Ok(()) => warn!("market stream closed"),
            Err(e) => warn!("market stream error: {:#}", e),
        }
        sleep(RECONNECT_DELAY).await;
    }
}

async fn stream_once(state: &Arc<AppState>, url: &str) -> Result<()> {
    let (mut ws, _) = connect_async(url).await.context("websocket connect failed")?;
    info!("market stream connected ({} symbols)", state.config.symbols.len());

    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Err(e) = dispatch(state, &text).await {
                    debug!("dropped malformed stream message: {:#}", e);
                }
            }
            Ok(Message::Ping(payload)) => {
                ws.send(Message::Pong(payload))
                    .await
                    .context("pong send failed")?;
            }
            Ok(Message::Close(_)) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(e).context("websocket read failed"),
        }
    }

    Ok(())
}

async fn dispatch(state: &Arc<AppState>, text: &str) -> Result<()> {
    let envelope: StreamEnvelope = serde_json::from_str(text)?;

    if envelope.stream.contains("@aggTrade") {
        let event: AggTradeEvent = serde_json::from_value(envelope.data)?;
        apply_trade(state, event).await?;
    } else if envelope.stream.contains("@kline") {
        let event: KlineEvent = serde_json::from_value(envelope.data)?;
        apply_kline(state, event).await?;
    } else if envelope.stream.contains("@markPrice") {
        let event: MarkPriceEvent = serde_json::from_value(envelope.data)?;
        apply_mark_price(state, event).await?;
    }

    Ok(())
}

async fn apply_trade(state: &Arc<AppState>, event: AggTradeEvent) -> Result<()> {
    let qty: f64 = event.quantity.parse().context("malformed trade quantity")?;
    let timestamp = ts_ms(event.trade_time)?;
    // Buyer-is-maker means the aggressor hit the bid
    let is_aggressive_buy = !event.buyer_is_maker;

    state
        .flow
        .write()
        .await
        .apply_trade(&event.symbol, qty, is_aggressive_buy, timestamp);
    Ok(())
}

async fn apply_kline(state: &Arc<AppState>, event: KlineEvent) -> Result<()> {
    let payload = event.kline;
    let Some(timeframe) = Timeframe::from_label(&payload.interval) else {
        return Ok(()); // not a subscribed timeframe
    };

    let candle = Candle {
        open_time: ts_ms(payload.open_time)?,
        close_time: ts_ms(payload.close_time)?,
        open: payload.open.parse().context("malformed open")?,
        high: payload.high.parse().context("malformed high")?,
        low: payload.low.parse().context("malformed low")?,
        close: payload.close.parse().context("malformed close")?,
        volume: payload.volume.parse().context("malformed volume")?,
        closed: payload.is_closed,
    };

    state
        .candles
        .write()
        .await
        .apply_live_update(&event.symbol, timeframe, candle.clone());

    if !candle.closed {
        return Ok(());
    }

    match timeframe {
        Timeframe::M15 => {
            let candles = state.candles.read().await;
            let flow = state.flow.read().await;
            let rates = state.rates.read().await;
            state
                .engine
                .write()
                .await
                .on_slow_close(&event.symbol, &candle, &candles, &flow, &rates);
        }
        Timeframe::M5 => {
            // Instruments resolve strictly sequentially inside this call;
            // the engine's per-key locks cover overlapping invocations.
            state
                .engine
                .write()
                .await
                .on_fast_close(&event.symbol, &candle, Utc::now())
                .await;
        }
        Timeframe::H4 => {}
    }

    Ok(())
}

async fn apply_mark_price(state: &Arc<AppState>, event: MarkPriceEvent) -> Result<()> {
    let rate: f64 = event.funding_rate.parse().context("malformed funding rate")?;
    let funding_time = ts_ms(event.next_funding_time)?;

    let mut rates = state.rates.write().await;
    rates.update_funding(&event.symbol, rate, funding_time);

    // The reference instrument's mark price doubles as the dominance feed
    if event.symbol == DOMINANCE_SYMBOL {
        let price: f64 = event.mark_price.parse().context("malformed mark price")?;
        rates.set_dominance(price, Utc::now());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url_covers_all_channels() {
        let url = stream_url(DEFAULT_WS_URL, &["BTCUSDT".to_string()]);
        assert!(url.starts_with("wss://fstream.binance.com/stream?streams="));
        assert!(url.contains("btcusdt@aggTrade"));
        assert!(url.contains("btcusdt@kline_5m"));
        assert!(url.contains("btcusdt@kline_15m"));
        assert!(url.contains("btcusdt@kline_4h"));
        assert!(url.contains("btcusdt@markPrice"));
    }
}
