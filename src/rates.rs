//! External-rate cache
//!
//! Periodically refreshed funding rate and open interest per symbol plus one
//! process-wide BTC dominance price. Failed or malformed fetches leave the
//! previous value in place; each field retries on the next scheduled tick.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::binance::client::BinanceClient;

/// Latest known funding/OI values for one symbol. `None` means never
/// observed, which is distinct from an observed zero.
#[derive(Debug, Clone, Default)]
pub struct RateSnapshot {
    pub funding_rate: Option<f64>,
    pub funding_time: Option<DateTime<Utc>>,
    pub open_interest: Option<f64>,
    pub oi_time: Option<DateTime<Utc>>,
}

/// Process-wide cross-market reference price.
#[derive(Debug, Clone)]
pub struct DominanceSnapshot {
    pub price: f64,
    pub last_update: DateTime<Utc>,
}

/// One retained open-interest observation.
#[derive(Debug, Clone)]
pub struct OiHistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub open_interest: f64,
}

/// Rate cache state. All mutation is field-wise upsert; a fetch failure
/// never clears a cached value.
pub struct RateCache {
    rates: HashMap<String, RateSnapshot>,
    oi_history: HashMap<String, Vec<OiHistoryPoint>>,
    dominance: Option<DominanceSnapshot>,
    retention: Duration,
}

impl RateCache {
    pub fn new(retention_mins: i64) -> Self {
        Self {
            rates: HashMap::new(),
            oi_history: HashMap::new(),
            dominance: None,
            retention: Duration::minutes(retention_mins),
        }
    }

    pub fn snapshot(&self, symbol: &str) -> RateSnapshot {
        self.rates.get(symbol).cloned().unwrap_or_default()
    }

    pub fn dominance(&self) -> Option<DominanceSnapshot> {
        self.dominance.clone()
    }

    pub fn set_dominance(&mut self, price: f64, at: DateTime<Utc>) {
        self.dominance = Some(DominanceSnapshot {
            price,
            last_update: at,
        });
    }

    /// Upsert the funding fields, leaving OI untouched. Used by both the
    /// mark-price stream and the periodic REST refresh.
    pub fn update_funding(&mut self, symbol: &str, rate: f64, funding_time: DateTime<Utc>) {
        let entry = self.rates.entry(symbol.to_string()).or_default();
        entry.funding_rate = Some(rate);
        entry.funding_time = Some(funding_time);
    }

    /// Upsert the OI fields, leaving funding untouched, and retain the
    /// observation in the history ring.
    pub fn update_open_interest(&mut self, symbol: &str, oi: f64, at: DateTime<Utc>) {
        let entry = self.rates.entry(symbol.to_string()).or_default();
        entry.open_interest = Some(oi);
        entry.oi_time = Some(at);
        self.ingest_oi(symbol, oi, at);
    }

    /// Append to the OI history ring unless an entry already exists at this
    /// exact timestamp, then evict entries older than the retention window.
    pub fn ingest_oi(&mut self, symbol: &str, oi: f64, timestamp: DateTime<Utc>) {
        let history = self.oi_history.entry(symbol.to_string()).or_default();
        if history.iter().any(|p| p.timestamp == timestamp) {
            return;
        }
        history.push(OiHistoryPoint {
            timestamp,
            open_interest: oi,
        });
        history.sort_by_key(|p| p.timestamp);

        let cutoff = timestamp - self.retention;
        history.retain(|p| p.timestamp >= cutoff);
    }

    /// Open interest at or before `target`; falls back to the closest entry
    /// by absolute distance when nothing precedes it. None on empty history.
    pub fn oi_at(&self, symbol: &str, target: DateTime<Utc>) -> Option<f64> {
        let history = self.oi_history.get(symbol)?;
        if history.is_empty() {
            return None;
        }

        if let Some(point) = history.iter().rev().find(|p| p.timestamp <= target) {
            return Some(point.open_interest);
        }

        history
            .iter()
            .min_by_key(|p| (p.timestamp - target).num_milliseconds().abs())
            .map(|p| p.open_interest)
    }

    pub fn oi_history(&self, symbol: &str) -> &[OiHistoryPoint] {
        self.oi_history
            .get(symbol)
            .map(|h| h.as_slice())
            .unwrap_or(&[])
    }
}

/// (now - prior) / prior * 100, defined only for a non-zero prior.
pub fn percent_change(now: f64, prior: f64) -> Option<f64> {
    if prior == 0.0 {
        return None;
    }
    Some((now - prior) / prior * 100.0)
}

/// One scheduled refresh pass: funding rate and open interest per symbol,
/// each independently, plus the dominance price. Every fetch failure is
/// logged and retried only on the next tick.
pub async fn refresh_all(client: &BinanceClient, cache: &RwLock<RateCache>, symbols: &[String]) {
    for symbol in symbols {
        match client.fetch_funding_rate(symbol).await {
            Ok((rate, funding_time)) => {
                cache.write().await.update_funding(symbol, rate, funding_time);
            }
            Err(e) => warn!("funding refresh failed for {}: {:#}", symbol, e),
        }

        match client.fetch_open_interest(symbol).await {
            Ok((oi, at)) => {
                cache.write().await.update_open_interest(symbol, oi, at);
            }
            Err(e) => warn!("open interest refresh failed for {}: {:#}", symbol, e),
        }
    }

    match client.fetch_dominance_price().await {
        Ok(price) => {
            cache.write().await.set_dominance(price, Utc::now());
            debug!("dominance price {:.2}", price);
        }
        Err(e) => warn!("dominance refresh failed: {:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(mins: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(mins)
    }

    #[test]
    fn test_field_wise_upsert() {
        let mut cache = RateCache::new(240);
        cache.update_funding("BTCUSDT", 0.0001, t(0));
        cache.update_open_interest("BTCUSDT", 5000.0, t(1));

        let snap = cache.snapshot("BTCUSDT");
        assert_eq!(snap.funding_rate, Some(0.0001));
        assert_eq!(snap.open_interest, Some(5000.0));

        // A later funding update must not disturb OI
        cache.update_funding("BTCUSDT", -0.0002, t(2));
        let snap = cache.snapshot("BTCUSDT");
        assert_eq!(snap.funding_rate, Some(-0.0002));
        assert_eq!(snap.open_interest, Some(5000.0));
    }

    #[test]
    fn test_unknown_is_not_zero() {
        let cache = RateCache::new(240);
        let snap = cache.snapshot("ETHUSDT");
        assert_eq!(snap.funding_rate, None);
        assert_eq!(snap.open_interest, None);
    }

    #[test]
    fn test_oi_at_nearest_preceding() {
        let mut cache = RateCache::new(240);
        cache.ingest_oi("BTCUSDT", 100.0, t(0));
        cache.ingest_oi("BTCUSDT", 110.0, t(10));

        assert_eq!(cache.oi_at("BTCUSDT", t(7)), Some(100.0));
        assert_eq!(cache.oi_at("BTCUSDT", t(10)), Some(110.0));
        // Nothing precedes the target: closest by absolute distance
        assert_eq!(cache.oi_at("BTCUSDT", t(-5)), Some(100.0));
        assert_eq!(cache.oi_at("ETHUSDT", t(0)), None);
    }

    #[test]
    fn test_oi_history_dedup_and_retention() {
        let mut cache = RateCache::new(240);
        cache.ingest_oi("BTCUSDT", 100.0, t(0));
        cache.ingest_oi("BTCUSDT", 999.0, t(0)); // duplicate timestamp, dropped
        cache.ingest_oi("BTCUSDT", 110.0, t(60));
        assert_eq!(cache.oi_history("BTCUSDT").len(), 2);
        assert_eq!(cache.oi_at("BTCUSDT", t(0)), Some(100.0));

        // 4h retention measured from the newest ingest
        cache.ingest_oi("BTCUSDT", 120.0, t(241));
        assert_eq!(cache.oi_at("BTCUSDT", t(0)), Some(110.0));
    }

    #[test]
    fn test_percent_change() {
        assert_eq!(percent_change(110.0, 100.0), Some(10.0));
        assert_eq!(percent_change(90.0, 100.0), Some(-10.0));
        assert_eq!(percent_change(50.0, 0.0), None);
    }
}
