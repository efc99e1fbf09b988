//! Candle aggregation
//!
//! Maintains per-(symbol, timeframe) OHLCV series fed by both the live
//! kline stream and REST backfill, and answers the two indicator queries
//! the setup engine needs: relative volume and swing range.

use std::collections::HashMap;

use crate::types::{Candle, Timeframe};

type SeriesKey = (String, Timeframe);

/// Bounded, ordered-by-open-time candle series per (symbol, timeframe).
///
/// Invariant after every mutation: strictly increasing open_time and
/// length <= capacity.
pub struct CandleStore {
    series: HashMap<SeriesKey, Vec<Candle>>,
    capacity: usize,
}

impl CandleStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            series: HashMap::new(),
            capacity,
        }
    }

    /// Apply one live kline update. If a candle with the same open_time
    /// exists it is mutated in place (the in-progress bar), otherwise the
    /// candle is appended and the series trimmed from the front.
    pub fn apply_live_update(&mut self, symbol: &str, timeframe: Timeframe, candle: Candle) {
        let series = self
            .series
            .entry((symbol.to_string(), timeframe))
            .or_default();

        if let Some(existing) = series
            .iter_mut()
            .find(|c| c.open_time == candle.open_time)
        {
            *existing = candle;
            return;
        }

        series.push(candle);
        series.sort_by_key(|c| c.open_time);
        let capacity = self.capacity;
        if series.len() > capacity {
            series.drain(..series.len() - capacity);
        }
    }

    /// Merge historical candles: replace-by-open-time or insert, then
    /// re-sort and trim. Last write wins on a given open_time regardless
    /// of source, so this is safe to run while live updates arrive.
    pub fn backfill(&mut self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        let series = self
            .series
            .entry((symbol.to_string(), timeframe))
            .or_default();

        for candle in candles {
            match series.iter_mut().find(|c| c.open_time == candle.open_time) {
                Some(existing) => *existing = candle,
                None => series.push(candle),
            }
        }

        series.sort_by_key(|c| c.open_time);
        let capacity = self.capacity;
        if series.len() > capacity {
            series.drain(..series.len() - capacity);
        }
    }

    /// Current snapshot of one series (ordered, possibly empty).
    pub fn series(&self, symbol: &str, timeframe: Timeframe) -> &[Candle] {
        self.series
            .get(&(symbol.to_string(), timeframe))
            .map(|s| s.as_slice())
            .unwrap_or(&[])
    }

    /// Closed candles of one series, oldest first.
    pub fn closed(&self, symbol: &str, timeframe: Timeframe) -> Vec<&Candle> {
        self.series(symbol, timeframe)
            .iter()
            .filter(|c| c.closed)
            .collect()
    }

    /// Relative volume: last closed 15m volume divided by the mean volume
    /// of the `lookback - 1` closed candles preceding it. None until
    /// `lookback` closed candles exist or when the baseline mean is zero.
    pub fn rvol(&self, symbol: &str, lookback: usize) -> Option<f64> {
        let closed = self.closed(symbol, Timeframe::M15);
        if closed.len() < lookback || lookback < 2 {
            return None;
        }

        let target = closed[closed.len() - 1];
        let baseline = &closed[closed.len() - lookback..closed.len() - 1];
        let mean = baseline.iter().map(|c| c.volume).sum::<f64>() / baseline.len() as f64;
        if mean == 0.0 {
            return None;
        }

        Some(target.volume / mean)
    }

    /// (min low, max high) over the most recent `lookback` closed 4h
    /// candles. None until enough closed candles exist.
    pub fn swing_range(&self, symbol: &str, lookback: usize) -> Option<(f64, f64)> {
        let closed = self.closed(symbol, Timeframe::H4);
        if closed.len() < lookback {
            return None;
        }

        let window = &closed[closed.len() - lookback..];
        let low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        Some((low, high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn candle(open_time: DateTime<Utc>, volume: f64, closed: bool) -> Candle {
        Candle {
            open_time,
            close_time: open_time + Duration::minutes(15),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume,
            closed,
        }
    }

    #[test]
    fn test_live_update_mutates_in_place() {
        let mut store = CandleStore::new(10);
        let t0 = base_time();

        let mut c = candle(t0, 10.0, false);
        store.apply_live_update("BTCUSDT", Timeframe::M15, c.clone());

        c.volume = 25.0;
        c.closed = true;
        store.apply_live_update("BTCUSDT", Timeframe::M15, c);

        let series = store.series("BTCUSDT", Timeframe::M15);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].volume, 25.0);
        assert!(series[0].closed);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut store = CandleStore::new(3);
        let t0 = base_time();

        for i in 0..5 {
            let t = t0 + Duration::minutes(15 * i);
            store.apply_live_update("BTCUSDT", Timeframe::M15, candle(t, 1.0, true));
        }

        let series = store.series("BTCUSDT", Timeframe::M15);
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].open_time, t0 + Duration::minutes(30));
        assert!(series.windows(2).all(|w| w[0].open_time < w[1].open_time));
    }

    #[test]
    fn test_backfill_overwrites_and_sorts() {
        let mut store = CandleStore::new(10);
        let t0 = base_time();

        store.apply_live_update("BTCUSDT", Timeframe::M15, candle(t0 + Duration::minutes(15), 5.0, true));

        // Out-of-order backfill with an overlapping open_time
        store.backfill(
            "BTCUSDT",
            Timeframe::M15,
            vec![
                candle(t0 + Duration::minutes(30), 7.0, true),
                candle(t0, 3.0, true),
                candle(t0 + Duration::minutes(15), 6.0, true),
            ],
        );

        let series = store.series("BTCUSDT", Timeframe::M15);
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].open_time, t0);
        assert_eq!(series[1].volume, 6.0); // backfill won on the overlap
        assert_eq!(series[2].volume, 7.0);
    }

    #[test]
    fn test_rvol_requires_full_lookback() {
        let mut store = CandleStore::new(200);
        let t0 = base_time();

        // 96 closed baseline candles averaging 20, then the target at 50
        for i in 0..96 {
            let t = t0 + Duration::minutes(15 * i);
            store.apply_live_update("BTCUSDT", Timeframe::M15, candle(t, 20.0, true));
        }
        assert_eq!(store.rvol("BTCUSDT", 97), None);

        let t = t0 + Duration::minutes(15 * 96);
        store.apply_live_update("BTCUSDT", Timeframe::M15, candle(t, 50.0, true));
        assert_eq!(store.rvol("BTCUSDT", 97), Some(2.5));
    }

    #[test]
    fn test_rvol_ignores_open_candle() {
        let mut store = CandleStore::new(200);
        let t0 = base_time();

        for i in 0..97 {
            let t = t0 + Duration::minutes(15 * i);
            store.apply_live_update("BTCUSDT", Timeframe::M15, candle(t, 20.0, true));
        }
        // In-progress bar must not become the RVOL target
        let t = t0 + Duration::minutes(15 * 97);
        store.apply_live_update("BTCUSDT", Timeframe::M15, candle(t, 9999.0, false));

        assert_eq!(store.rvol("BTCUSDT", 97), Some(1.0));
    }

    #[test]
    fn test_swing_range_window() {
        let mut store = CandleStore::new(50);
        let t0 = base_time();

        for i in 0..19 {
            let t = t0 + Duration::hours(4 * i);
            let mut c = candle(t, 1.0, true);
            c.low = 100.0 - i as f64;
            c.high = 120.0 + i as f64;
            store.apply_live_update("BTCUSDT", Timeframe::H4, c);
        }
        assert_eq!(store.swing_range("BTCUSDT", 20), None);

        let t = t0 + Duration::hours(4 * 19);
        let mut c = candle(t, 1.0, true);
        c.low = 95.0;
        c.high = 118.0;
        store.apply_live_update("BTCUSDT", Timeframe::H4, c);

        let (low, high) = store.swing_range("BTCUSDT", 20).unwrap();
        assert_eq!(low, 95.0);
        assert_eq!(high, 138.0); // 120 + 18 from the widest candle
    }
}
