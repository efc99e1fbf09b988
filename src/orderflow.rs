//! Order-flow accumulation
//!
//! Tracks cumulative volume delta and time-bucketed buy/sell aggression per
//! symbol. CVD is a running scalar updated per trade, never recomputed from
//! the buckets.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::types::Direction;

/// Clamp returned when a window is effectively one-sided.
pub const ONE_SIDED_RATIO: f64 = 10.0;

/// One trade print's aggression, bucketed by timestamp.
#[derive(Debug, Clone)]
pub struct AggressionBucket {
    pub timestamp: DateTime<Utc>,
    pub buy_qty: f64,
    pub sell_qty: f64,
}

/// Per-symbol CVD and bounded aggression bucket history.
pub struct FlowTracker {
    cvd: HashMap<String, f64>,
    buckets: HashMap<String, Vec<AggressionBucket>>,
    capacity: usize,
}

impl FlowTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            cvd: HashMap::new(),
            buckets: HashMap::new(),
            capacity,
        }
    }

    /// Record one trade print: O(1) CVD update plus one bucket append.
    pub fn apply_trade(
        &mut self,
        symbol: &str,
        qty: f64,
        is_aggressive_buy: bool,
        timestamp: DateTime<Utc>,
    ) {
        let delta = if is_aggressive_buy { qty } else { -qty };
        *self.cvd.entry(symbol.to_string()).or_insert(0.0) += delta;

        let (buy_qty, sell_qty) = if is_aggressive_buy {
            (qty, 0.0)
        } else {
            (0.0, qty)
        };

        let buckets = self.buckets.entry(symbol.to_string()).or_default();
        buckets.push(AggressionBucket {
            timestamp,
            buy_qty,
            sell_qty,
        });
        if buckets.len() > self.capacity {
            let excess = buckets.len() - self.capacity;
            buckets.drain(..excess);
        }
    }

    /// Current cumulative volume delta for a symbol.
    pub fn cvd(&self, symbol: &str) -> f64 {
        self.cvd.get(symbol).copied().unwrap_or(0.0)
    }

    /// Aggressive (buy, sell) sums over [from, to].
    fn window_sums(&self, symbol: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> (f64, f64) {
        let mut buy = 0.0;
        let mut sell = 0.0;
        if let Some(buckets) = self.buckets.get(symbol) {
            for b in buckets {
                if b.timestamp >= from && b.timestamp <= to {
                    buy += b.buy_qty;
                    sell += b.sell_qty;
                }
            }
        }
        (buy, sell)
    }

    /// Buy/sell aggression ratio over the trailing window.
    ///
    /// None when the window is empty; clamped to `ONE_SIDED_RATIO` when
    /// exactly one side is zero.
    pub fn imbalance_ratio(&self, symbol: &str, window_ms: i64, now: DateTime<Utc>) -> Option<f64> {
        let (buy, sell) = self.window_sums(symbol, now - Duration::milliseconds(window_ms), now);
        match (buy > 0.0, sell > 0.0) {
            (false, false) => None,
            (true, false) | (false, true) => Some(ONE_SIDED_RATIO),
            (true, true) => Some(buy / sell),
        }
    }

    /// Direction-aligned aggression ratio over [from, to]: buy/sell for
    /// longs, sell/buy for shorts, with the same one-sided clamp. This is
    /// what the arming predicate thresholds against per sampling window.
    pub fn directional_ratio(
        &self,
        symbol: &str,
        direction: Direction,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Option<f64> {
        let (buy, sell) = self.window_sums(symbol, from, to);
        let (num, den) = match direction {
            Direction::Long => (buy, sell),
            Direction::Short => (sell, buy),
        };
        if num == 0.0 && den == 0.0 {
            return None;
        }
        if den == 0.0 {
            return Some(ONE_SIDED_RATIO);
        }
        Some((num / den).min(ONE_SIDED_RATIO))
    }

    /// Net aggression (buy minus sell) over [from, to].
    pub fn net_delta(&self, symbol: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
        let (buy, sell) = self.window_sums(symbol, from, to);
        buy - sell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_cvd_running_sum() {
        let mut flow = FlowTracker::new(100);
        flow.apply_trade("BTCUSDT", 5.0, true, t(0));
        flow.apply_trade("BTCUSDT", 2.0, false, t(1));
        flow.apply_trade("BTCUSDT", 1.0, false, t(2));
        assert_eq!(flow.cvd("BTCUSDT"), 2.0);
        assert_eq!(flow.cvd("ETHUSDT"), 0.0);
    }

    #[test]
    fn test_bucket_capacity() {
        let mut flow = FlowTracker::new(3);
        for i in 0..5 {
            flow.apply_trade("BTCUSDT", 1.0, true, t(i));
        }
        // CVD keeps the full history even after eviction
        assert_eq!(flow.cvd("BTCUSDT"), 5.0);
        assert_eq!(flow.buckets.get("BTCUSDT").unwrap().len(), 3);
    }

    #[test]
    fn test_imbalance_ratio_window() {
        let mut flow = FlowTracker::new(100);
        flow.apply_trade("BTCUSDT", 6.0, true, t(10));
        flow.apply_trade("BTCUSDT", 2.0, false, t(20));
        // Outside the window
        flow.apply_trade("BTCUSDT", 50.0, false, t(-120));

        let ratio = flow.imbalance_ratio("BTCUSDT", 60_000, t(30)).unwrap();
        assert_eq!(ratio, 3.0);
    }

    #[test]
    fn test_imbalance_ratio_edge_cases() {
        let mut flow = FlowTracker::new(100);
        assert_eq!(flow.imbalance_ratio("BTCUSDT", 60_000, t(0)), None);

        flow.apply_trade("BTCUSDT", 4.0, true, t(0));
        assert_eq!(
            flow.imbalance_ratio("BTCUSDT", 60_000, t(1)),
            Some(ONE_SIDED_RATIO)
        );
    }

    #[test]
    fn test_directional_ratio_short() {
        let mut flow = FlowTracker::new(100);
        flow.apply_trade("BTCUSDT", 9.0, false, t(0));
        flow.apply_trade("BTCUSDT", 3.0, true, t(1));

        let long = flow
            .directional_ratio("BTCUSDT", Direction::Long, t(-5), t(5))
            .unwrap();
        let short = flow
            .directional_ratio("BTCUSDT", Direction::Short, t(-5), t(5))
            .unwrap();
        assert!((long - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(short, 3.0);
    }

    #[test]
    fn test_net_delta() {
        let mut flow = FlowTracker::new(100);
        flow.apply_trade("BTCUSDT", 5.0, true, t(0));
        flow.apply_trade("BTCUSDT", 8.0, false, t(1));
        assert_eq!(flow.net_delta("BTCUSDT", t(-5), t(5)), -3.0);
    }
}
