//! Bracket execution adapter
//!
//! Quantizes an order intent against the venue's tick/step/notional
//! constraints and submits the three-order bracket: market entry plus
//! reduce-only stop and target. Each step is independently fallible and
//! logged; nothing is retried, and a partial bracket is reported in the
//! result object rather than compensated.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use super::client::BinanceClient;
use super::models::SymbolFilter;
use crate::engine::{BracketOutcome, ExecutionApi};
use crate::types::OrderIntent;

/// Settlement asset whose available balance sizes orders.
const BALANCE_ASSET: &str = "USDT";

/// Balance reported in dry-run mode, where no signed calls are made.
const PAPER_BALANCE: f64 = 10_000.0;

/// Quantization constraints for one symbol. `None` fields are permissive:
/// no rounding and no minimum is applied.
#[derive(Debug, Clone, Default)]
pub struct SymbolFilters {
    pub tick_size: Option<f64>,
    pub step_size: Option<f64>,
    pub min_qty: Option<f64>,
    pub min_notional: Option<f64>,
}

/// Kill float noise so quantization is idempotent.
fn snap(value: f64) -> f64 {
    (value * 1e10).round() / 1e10
}

/// Round to the nearest increment. Zero or absent increments pass through.
pub fn round_to_tick(value: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return value;
    }
    snap((value / tick).round() * tick)
}

/// Floor to the increment, avoiding over-submission from rounding up.
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    snap(((value / step) + 1e-9).floor() * step)
}

/// Ceiling to the increment, used when raising quantity to a minimum.
pub fn ceil_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    snap(((value / step) - 1e-9).ceil() * step)
}

/// Execution adapter over the futures REST client.
pub struct BracketExecutor {
    client: BinanceClient,
    filters: HashMap<String, SymbolFilters>,
    dry_run: bool,
}

impl BracketExecutor {
    pub fn new(client: BinanceClient, dry_run: bool) -> Self {
        Self {
            client,
            filters: HashMap::new(),
            dry_run,
        }
    }

    /// Fetch and cache exchange constraints. Called once per process; a
    /// failure leaves the permissive defaults in place.
    pub async fn load_filters(&mut self) -> Result<()> {
        let info = self.client.fetch_exchange_info().await?;
        for symbol in info.symbols {
            let mut filters = SymbolFilters::default();
            for filter in symbol.filters {
                match filter {
                    SymbolFilter::Price { tick_size } => {
                        filters.tick_size = tick_size.parse().ok();
                    }
                    SymbolFilter::LotSize { step_size, min_qty } => {
                        filters.step_size = step_size.parse().ok();
                        filters.min_qty = min_qty.parse().ok();
                    }
                    SymbolFilter::MinNotional { notional } => {
                        filters.min_notional = notional.parse().ok();
                    }
                    SymbolFilter::Other => {}
                }
            }
            self.filters.insert(symbol.symbol, filters);
        }
        info!("cached exchange filters for {} symbols", self.filters.len());
        Ok(())
    }

    #[cfg(test)]
    fn set_filters(&mut self, symbol: &str, filters: SymbolFilters) {
        self.filters.insert(symbol.to_string(), filters);
    }

    fn filters_for(&self, symbol: &str) -> SymbolFilters {
        match self.filters.get(symbol) {
            Some(filters) => filters.clone(),
            None => {
                warn!("no cached filters for {}, using permissive defaults", symbol);
                SymbolFilters::default()
            }
        }
    }

    /// Quantize price and quantity per the cached constraints: price to the
    /// nearest tick; quantity floored to step, raised to min-qty, and bumped
    /// to satisfy min-notional (rounded up to step).
    fn quantize(&self, symbol: &str, price: f64, quantity: f64) -> (f64, f64) {
        let filters = self.filters_for(symbol);

        let price = round_to_tick(price, filters.tick_size.unwrap_or(0.0));

        let step = filters.step_size.unwrap_or(0.0);
        let mut quantity = floor_to_step(quantity, step);
        if let Some(min_qty) = filters.min_qty {
            if quantity < min_qty {
                quantity = min_qty;
            }
        }
        if let Some(min_notional) = filters.min_notional {
            if price > 0.0 && price * quantity < min_notional {
                quantity = ceil_to_step(min_notional / price, step);
            }
        }

        (price, quantity)
    }

    fn order_id(prefix: &str) -> String {
        format!("sf-{}-{}", prefix, &Uuid::new_v4().to_string()[..8])
    }
}

#[async_trait]
impl ExecutionApi for BracketExecutor {
    async fn available_balance(&self) -> Result<f64> {
        if self.dry_run {
            return Ok(PAPER_BALANCE);
        }
        self.client.available_balance(BALANCE_ASSET).await
    }

    async fn submit(&self, intent: &OrderIntent) -> BracketOutcome {
        let mut outcome = BracketOutcome::default();

        let (entry_price, quantity) = self.quantize(&intent.symbol, intent.entry_price, intent.quantity);
        let stop_price = round_to_tick(
            intent.stop_price,
            self.filters_for(&intent.symbol).tick_size.unwrap_or(0.0),
        );
        let target_price = round_to_tick(
            intent.target_price,
            self.filters_for(&intent.symbol).tick_size.unwrap_or(0.0),
        );

        if self.dry_run {
            info!(
                "DRY RUN {:?} {} qty {} entry ~{} stop {} target {}",
                intent.direction, intent.symbol, quantity, entry_price, stop_price, target_price
            );
            outcome.success = true;
            return outcome;
        }

        // Account mode setup: fallible, logged, never retried
        if let Err(e) = self
            .client
            .set_margin_mode(&intent.symbol, &intent.margin_mode)
            .await
        {
            warn!("set margin mode failed for {}: {:#}", intent.symbol, e);
        }
        if let Err(e) = self.client.set_leverage(&intent.symbol, intent.leverage).await {
            warn!("set leverage failed for {}: {:#}", intent.symbol, e);
        }

        // Entry leg: a rejection here fails the whole bracket
        let entry_side = intent.direction.entry_side();
        match self
            .client
            .place_market_order(&intent.symbol, entry_side, quantity, &Self::order_id("e"))
            .await
        {
            Ok(ack) => {
                info!(
                    "entry order {} {} accepted ({} {})",
                    entry_side, intent.symbol, ack.order_id, ack.status
                );
                outcome.entry_order_id = Some(ack.order_id);
            }
            Err(e) => {
                warn!("entry order failed for {}: {:#}", intent.symbol, e);
                outcome.error = Some(format!("entry: {e:#}"));
                return outcome;
            }
        }

        // Protective legs: attempted independently. A failure leaves the
        // entry uncovered; reported, not compensated.
        let exit_side = intent.direction.exit_side();
        match self
            .client
            .place_stop_market(&intent.symbol, exit_side, quantity, stop_price, &Self::order_id("s"))
            .await
        {
            Ok(ack) => outcome.stop_order_id = Some(ack.order_id),
            Err(e) => {
                warn!("stop order failed for {}: {:#}", intent.symbol, e);
                outcome.error = Some(format!("stop: {e:#}"));
            }
        }

        match self
            .client
            .place_take_profit_market(
                &intent.symbol,
                exit_side,
                quantity,
                target_price,
                &Self::order_id("t"),
            )
            .await
        {
            Ok(ack) => outcome.target_order_id = Some(ack.order_id),
            Err(e) => {
                warn!("target order failed for {}: {:#}", intent.symbol, e);
                let prior = outcome.error.take();
                outcome.error = Some(match prior {
                    Some(prior) => format!("{prior}; target: {e:#}"),
                    None => format!("target: {e:#}"),
                });
            }
        }

        outcome.success = outcome.entry_order_id.is_some()
            && outcome.stop_order_id.is_some()
            && outcome.target_order_id.is_some();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::client::DEFAULT_BASE_URL;

    fn executor_with(symbol: &str, filters: SymbolFilters) -> BracketExecutor {
        let client = BinanceClient::new(DEFAULT_BASE_URL, None, None).unwrap();
        let mut executor = BracketExecutor::new(client, true);
        executor.set_filters(symbol, filters);
        executor
    }

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(100.123, 0.05), 100.1);
        assert_eq!(round_to_tick(100.126, 0.05), 100.15);
        // Already aligned: no-op
        assert_eq!(round_to_tick(100.15, 0.05), 100.15);
        // Idempotent
        let once = round_to_tick(0.123456, 0.001);
        assert_eq!(round_to_tick(once, 0.001), once);
        // Absent constraint passes through
        assert_eq!(round_to_tick(100.123, 0.0), 100.123);
    }

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(1.299, 0.1), 1.2);
        assert_eq!(floor_to_step(1.2, 0.1), 1.2);
        let once = floor_to_step(0.987654, 0.001);
        assert_eq!(floor_to_step(once, 0.001), once);
    }

    #[test]
    fn test_quantize_applies_minimums() {
        let executor = executor_with(
            "BTCUSDT",
            SymbolFilters {
                tick_size: Some(0.1),
                step_size: Some(0.001),
                min_qty: Some(0.001),
                min_notional: Some(100.0),
            },
        );

        // Floors quantity, keeps aligned price
        let (price, qty) = executor.quantize("BTCUSDT", 50_000.0, 0.0057999);
        assert_eq!(price, 50_000.0);
        assert_eq!(qty, 0.005);

        // Below min-qty gets raised (price high enough that notional passes)
        let (_, qty) = executor.quantize("BTCUSDT", 200_000.0, 0.0004);
        assert_eq!(qty, 0.001);

        // Below min-notional gets bumped up to the step-rounded minimum:
        // 100 / 20_000 = 0.005 exactly
        let (_, qty) = executor.quantize("BTCUSDT", 20_000.0, 0.001);
        assert_eq!(qty, 0.005);
    }

    #[test]
    fn test_unknown_symbol_is_permissive() {
        let executor = executor_with("BTCUSDT", SymbolFilters::default());
        let (price, qty) = executor.quantize("DOGEUSDT", 0.12345, 17.77);
        assert_eq!(price, 0.12345);
        assert_eq!(qty, 17.77);
    }
}
