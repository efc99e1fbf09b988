//! Bot configuration

use serde::{Deserialize, Serialize};

/// A trading window in minutes-of-day (UTC), inclusive on both ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionWindow {
    pub start: u32,
    pub end: u32,
}

impl SessionWindow {
    const fn new(start_h: u32, start_m: u32, end_h: u32, end_m: u32) -> Self {
        Self {
            start: start_h * 60 + start_m,
            end: end_h * 60 + end_m,
        }
    }

    fn contains(&self, minute_of_day: u32) -> bool {
        minute_of_day >= self.start && minute_of_day <= self.end
    }
}

/// Flat configuration for the signal engine and execution adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Instruments to trade (e.g. "BTCUSDT")
    pub symbols: Vec<String>,

    /// Candle series capacity per (symbol, timeframe)
    pub candle_capacity: usize,

    /// Aggression bucket capacity per symbol
    pub bucket_capacity: usize,

    /// Zone width around a swing extreme as a fraction of price (0.008 = 0.8%)
    pub zone_pct: f64,

    /// Minimum buy/sell (or sell/buy) aggression ratio for a window to qualify
    pub imbalance_threshold: f64,

    /// Qualifying sampling windows required within the arming candle
    pub imbalance_min_windows: u32,

    /// Width of one imbalance sampling window in milliseconds
    pub imbalance_window_ms: i64,

    /// Minimum relative volume on the arming close
    pub rvol_threshold: f64,

    /// Closed 15m candles needed for RVOL (1 target + baseline)
    pub rvol_lookback: usize,

    /// Closed 4h candles in the swing range window
    pub swing_lookback: usize,

    /// Fraction of available balance risked per signal (0.01 = 1%)
    pub risk_fraction: f64,

    /// Stop offset as a fraction of entry price
    pub stop_pct: f64,

    /// Target offset as a fraction of entry price
    pub target_pct: f64,

    /// How long an armed setup waits for a 5m confirmation, in seconds
    pub entry_window_secs: i64,

    /// UTC windows during which setups may fire
    pub sessions: Vec<SessionWindow>,

    /// Leverage set before each entry
    pub leverage: u32,

    /// Margin mode set before each entry ("ISOLATED" or "CROSSED")
    pub margin_mode: String,

    /// External-rate refresh cadence in seconds
    pub refresh_secs: u64,

    /// OI history retention in minutes
    pub oi_retention_mins: i64,

    /// Quantize and log brackets without sending signed calls
    pub dry_run: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string(), "SOLUSDT".to_string()],
            candle_capacity: 500,
            bucket_capacity: 20_000,
            zone_pct: 0.008,
            imbalance_threshold: 2.8,
            imbalance_min_windows: 3,
            imbalance_window_ms: 3 * 60 * 1000,
            rvol_threshold: 2.5,
            rvol_lookback: 97, // 1 target + 96 baseline
            swing_lookback: 20,
            risk_fraction: 0.01,
            stop_pct: 0.01,
            target_pct: 0.02,
            entry_window_secs: 30 * 60,
            sessions: vec![
                SessionWindow::new(0, 5, 13, 55),
                SessionWindow::new(14, 5, 21, 55),
            ],
            leverage: 5,
            margin_mode: "ISOLATED".to_string(),
            refresh_secs: 60,
            oi_retention_mins: 4 * 60,
            dry_run: false,
        }
    }
}

impl BotConfig {
    /// Whether a setup is allowed to fire at the given UTC wall-clock time.
    pub fn session_open(&self, hour: u32, minute: u32) -> bool {
        let current = hour * 60 + minute;
        self.sessions.iter().any(|w| w.contains(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_gate_boundaries() {
        let config = BotConfig::default();

        // Morning window
        assert!(!config.session_open(0, 4));
        assert!(config.session_open(0, 5));
        assert!(config.session_open(13, 55));
        assert!(!config.session_open(13, 56));

        // Funding-hour gap
        assert!(!config.session_open(14, 0));
        assert!(config.session_open(14, 5));

        // Evening close
        assert!(config.session_open(21, 55));
        assert!(!config.session_open(21, 56));
        assert!(!config.session_open(23, 30));
    }
}
