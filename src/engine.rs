//! Setup/trigger engine
//!
//! The two-phase state machine at the center of the bot. A 15m close can arm
//! a setup when price sweeps a 4h swing extreme with confirming order flow;
//! the next 5m close fires it (session and TTL permitting), sizes the order
//! from available balance, and hands a bracket to the execution adapter.
//! Every armed setup resolves through exactly one terminal transition:
//! fired, gated, sized-out, or expired.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::candles::CandleStore;
use crate::config::BotConfig;
use crate::orderflow::FlowTracker;
use crate::rates::RateCache;
use crate::types::{
    Candle, Direction, OrderIntent, PendingSetup, SetupSnapshot, SignalEvent, SignalObserver,
    SignalOutcome,
};

/// Result object for one bracket submission. Individual leg failures are
/// carried here, never thrown.
#[derive(Debug, Clone, Default)]
pub struct BracketOutcome {
    pub success: bool,
    pub entry_order_id: Option<i64>,
    pub stop_order_id: Option<i64>,
    pub target_order_id: Option<i64>,
    pub error: Option<String>,
}

/// Venue seam used by the trigger engine: balance for sizing plus bracket
/// submission.
#[async_trait]
pub trait ExecutionApi: Send + Sync {
    async fn available_balance(&self) -> Result<f64>;
    async fn submit(&self, intent: &OrderIntent) -> BracketOutcome;
}

type SetupKey = (String, Direction);

/// Owns all pending setups and drives them through the state machine.
pub struct SetupEngine<E: ExecutionApi> {
    config: BotConfig,
    execution: Arc<E>,
    pending: HashMap<SetupKey, PendingSetup>,
    /// Guards the ARMED -> UNARMED transition per key so overlapping
    /// fast-close invocations cannot double-fire one setup.
    firing_locks: HashMap<SetupKey, Arc<Mutex<()>>>,
    observers: Vec<Box<dyn SignalObserver>>,
    recent: VecDeque<SignalEvent>,
}

const RECENT_SIGNALS_CAP: usize = 100;

impl<E: ExecutionApi> SetupEngine<E> {
    pub fn new(config: BotConfig, execution: Arc<E>) -> Self {
        Self {
            config,
            execution,
            pending: HashMap::new(),
            firing_locks: HashMap::new(),
            observers: Vec::new(),
            recent: VecDeque::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn SignalObserver>) {
        self.observers.push(observer);
    }

    pub fn pending_setups(&self) -> Vec<PendingSetup> {
        self.pending.values().cloned().collect()
    }

    pub fn recent_signals(&self) -> Vec<SignalEvent> {
        self.recent.iter().cloned().collect()
    }

    /// Slow-timeframe close: evaluate the arming predicate for both
    /// directions and arm where it holds. Re-evaluating the same arming
    /// candle, or matching again while a pending entry exists, is a no-op.
    pub fn on_slow_close(
        &mut self,
        symbol: &str,
        candle: &Candle,
        candles: &CandleStore,
        flow: &FlowTracker,
        rates: &RateCache,
    ) {
        for direction in [Direction::Long, Direction::Short] {
            let key = (symbol.to_string(), direction);
            if self.pending.contains_key(&key) {
                continue;
            }

            if let Some(snapshot) = self.evaluate_arming(symbol, direction, candle, candles, flow) {
                let rate = rates.snapshot(symbol);
                let mut snapshot = snapshot;
                snapshot.funding_rate = rate.funding_rate;
                snapshot.open_interest = rate.open_interest;

                info!(
                    "ARMED {:?} {} on 15m close {:.4} (rvol {:?}, windows {})",
                    direction, symbol, candle.close, snapshot.rvol, snapshot.imbalance_windows_hit
                );
                self.pending.insert(
                    key,
                    PendingSetup {
                        symbol: symbol.to_string(),
                        direction,
                        arming_candle_open: candle.open_time,
                        snapshot,
                        armed_at: candle.close_time,
                    },
                );
            }
        }
    }

    /// The composite arming predicate. All legs must hold.
    fn evaluate_arming(
        &self,
        symbol: &str,
        direction: Direction,
        candle: &Candle,
        candles: &CandleStore,
        flow: &FlowTracker,
    ) -> Option<SetupSnapshot> {
        let rvol = candles.rvol(symbol, self.config.rvol_lookback)?;
        if rvol < self.config.rvol_threshold {
            return None;
        }

        let (swing_low, swing_high) = candles.swing_range(symbol, self.config.swing_lookback)?;

        // Price containment: close within the zone around the swing extreme
        let in_zone = match direction {
            Direction::Long => (candle.close - swing_low).abs() <= swing_low * self.config.zone_pct,
            Direction::Short => {
                (swing_high - candle.close).abs() <= swing_high * self.config.zone_pct
            }
        };
        if !in_zone {
            return None;
        }

        // Liquidity sweep: wick beyond the boundary, body back inside
        let swept = match direction {
            Direction::Long => {
                candle.low < swing_low && candle.close > swing_low && candle.open > swing_low
            }
            Direction::Short => {
                candle.high > swing_high && candle.close < swing_high && candle.open < swing_high
            }
        };
        if !swept {
            return None;
        }

        // Sustained imbalance: enough qualifying sampling windows in the span
        let windows_hit = self.qualifying_windows(symbol, direction, candle, flow);
        if windows_hit < self.config.imbalance_min_windows {
            return None;
        }

        // Net aggression over the candle must agree with the direction
        let net = flow.net_delta(symbol, candle.open_time, candle.close_time);
        let aligned = match direction {
            Direction::Long => net > 0.0,
            Direction::Short => net < 0.0,
        };
        if !aligned {
            return None;
        }

        if !self.divergence(symbol, direction, candles, flow) {
            return None;
        }

        Some(SetupSnapshot {
            rvol: Some(rvol),
            swing_low: Some(swing_low),
            swing_high: Some(swing_high),
            imbalance_windows_hit: windows_hit,
            cvd: flow.cvd(symbol),
            funding_rate: None,
            open_interest: None,
        })
    }

    /// Count sampling windows inside the arming span whose direction-aligned
    /// aggression ratio meets the threshold.
    fn qualifying_windows(
        &self,
        symbol: &str,
        direction: Direction,
        candle: &Candle,
        flow: &FlowTracker,
    ) -> u32 {
        let span_ms = (candle.close_time - candle.open_time).num_milliseconds();
        let window_ms = self.config.imbalance_window_ms;
        let count = (span_ms / window_ms).max(1);

        let mut hit = 0u32;
        for i in 0..count {
            let from = candle.open_time + Duration::milliseconds(i * window_ms);
            let to = from + Duration::milliseconds(window_ms);
            if let Some(ratio) = flow.directional_ratio(symbol, direction, from, to) {
                if ratio >= self.config.imbalance_threshold {
                    hit += 1;
                }
            }
        }
        hit
    }

    /// Order-flow divergence: the newest closed 15m candle prints a fresh
    /// price extreme against the prior one while its intra-candle net
    /// aggression points the other way.
    fn divergence(
        &self,
        symbol: &str,
        direction: Direction,
        candles: &CandleStore,
        flow: &FlowTracker,
    ) -> bool {
        let closed = candles.closed(symbol, crate::types::Timeframe::M15);
        if closed.len() < 2 {
            return false;
        }
        let prev = closed[closed.len() - 2];
        let cur = closed[closed.len() - 1];
        let net = flow.net_delta(symbol, cur.open_time, cur.close_time);

        match direction {
            Direction::Long => cur.low < prev.low && net > 0.0,
            Direction::Short => cur.high > prev.high && net < 0.0,
        }
    }

    /// Fast-timeframe close: resolve any pending setups for this symbol.
    /// The pending entry is removed on every path out of ARMED.
    pub async fn on_fast_close(&mut self, symbol: &str, candle: &Candle, now: DateTime<Utc>) {
        for direction in [Direction::Long, Direction::Short] {
            let key = (symbol.to_string(), direction);
            if !self.pending.contains_key(&key) {
                continue;
            }

            let lock = self
                .firing_locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let Ok(_guard) = lock.try_lock() else {
                // Another invocation is mid-transition for this key
                debug!("firing lock busy for {:?} {}", direction, symbol);
                continue;
            };

            let Some(setup) = self.pending.remove(&key) else {
                continue;
            };

            // Entry window expiry
            if now - setup.armed_at > Duration::seconds(self.config.entry_window_secs) {
                info!("EXPIRED {:?} {} (armed {})", direction, symbol, setup.armed_at);
                self.emit(&setup, SignalOutcome::Expired, candle, now);
                continue;
            }

            // Session gate on the confirming close
            let gate_time = candle.close_time;
            if !self.config.session_open(gate_time.hour(), gate_time.minute()) {
                info!("GATED {:?} {} at {}", direction, symbol, gate_time);
                self.emit(&setup, SignalOutcome::SkippedGate, candle, now);
                continue;
            }

            let entry = candle.close;
            let (stop, target) = match direction {
                Direction::Long => (
                    entry * (1.0 - self.config.stop_pct),
                    entry * (1.0 + self.config.target_pct),
                ),
                Direction::Short => (
                    entry * (1.0 + self.config.stop_pct),
                    entry * (1.0 - self.config.target_pct),
                ),
            };

            let balance = match self.execution.available_balance().await {
                Ok(balance) => balance,
                Err(e) => {
                    warn!("balance query failed, skipping {:?} {}: {:#}", direction, symbol, e);
                    self.emit(&setup, SignalOutcome::SkippedSizing, candle, now);
                    continue;
                }
            };

            let quantity = (self.config.risk_fraction * balance) / (entry - stop).abs();
            if !quantity.is_finite() || quantity <= 0.0 {
                warn!(
                    "computed quantity {} invalid, skipping {:?} {}",
                    quantity, direction, symbol
                );
                self.emit(&setup, SignalOutcome::SkippedSizing, candle, now);
                continue;
            }

            let intent = OrderIntent {
                symbol: symbol.to_string(),
                direction,
                quantity,
                entry_price: entry,
                stop_price: stop,
                target_price: target,
                leverage: self.config.leverage,
                margin_mode: self.config.margin_mode.clone(),
            };

            info!(
                "FIRING {:?} {} entry {:.4} stop {:.4} target {:.4} qty {:.6}",
                direction, symbol, entry, stop, target, quantity
            );
            let outcome = self.execution.submit(&intent).await;

            // Disarmed regardless of the adapter outcome
            let signal_outcome = if outcome.success {
                SignalOutcome::Submitted
            } else {
                SignalOutcome::Failed(
                    outcome.error.unwrap_or_else(|| "bracket rejected".to_string()),
                )
            };
            self.emit(&setup, signal_outcome, candle, now);
        }
    }

    fn emit(
        &mut self,
        setup: &PendingSetup,
        outcome: SignalOutcome,
        trigger_candle: &Candle,
        at: DateTime<Utc>,
    ) {
        let event = SignalEvent {
            id: Uuid::new_v4(),
            symbol: setup.symbol.clone(),
            direction: setup.direction,
            outcome,
            trigger_candle: trigger_candle.clone(),
            triggered_at: at,
            snapshot: setup.snapshot.clone(),
        };

        self.recent.push_front(event.clone());
        self.recent.truncate(RECENT_SIGNALS_CAP);

        for observer in &self.observers {
            observer.on_signal(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;
    use chrono::TimeZone;
    use std::sync::Mutex as StdMutex;

    struct MockExec {
        balance: f64,
        fail_submit: bool,
        submitted: StdMutex<Vec<OrderIntent>>,
    }

    impl MockExec {
        fn new(balance: f64) -> Self {
            Self {
                balance,
                fail_submit: false,
                submitted: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExecutionApi for MockExec {
        async fn available_balance(&self) -> Result<f64> {
            Ok(self.balance)
        }

        async fn submit(&self, intent: &OrderIntent) -> BracketOutcome {
            self.submitted.lock().unwrap().push(intent.clone());
            if self.fail_submit {
                BracketOutcome {
                    success: false,
                    error: Some("entry rejected".to_string()),
                    ..Default::default()
                }
            } else {
                BracketOutcome {
                    success: true,
                    entry_order_id: Some(1),
                    stop_order_id: Some(2),
                    target_order_id: Some(3),
                    error: None,
                }
            }
        }
    }

    fn test_config() -> BotConfig {
        BotConfig {
            // Small lookbacks keep fixture setup readable
            rvol_lookback: 3,
            swing_lookback: 2,
            imbalance_window_ms: 60_000,
            ..Default::default()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
    }

    fn m15(open_time: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            open_time,
            close_time: open_time + Duration::minutes(15),
            open,
            high,
            low,
            close,
            volume,
            closed: true,
        }
    }

    fn h4(open_time: DateTime<Utc>, low: f64, high: f64) -> Candle {
        Candle {
            open_time,
            close_time: open_time + Duration::hours(4),
            open: (low + high) / 2.0,
            high,
            low,
            close: (low + high) / 2.0,
            volume: 1.0,
            closed: true,
        }
    }

    /// World where a long arming predicate holds: 4h swing 100/120, two
    /// prior 15m candles, arming candle sweeping the swing low on elevated
    /// volume, with buy-side aggression in `windows` sampling windows.
    fn long_world(windows: u32) -> (CandleStore, FlowTracker, RateCache, Candle) {
        let mut candles = CandleStore::new(100);
        let mut flow = FlowTracker::new(10_000);
        let rates = RateCache::new(240);

        candles.backfill(
            "XUSDT",
            Timeframe::H4,
            vec![
                h4(t0() - Duration::hours(8), 100.0, 118.0),
                h4(t0() - Duration::hours(4), 101.0, 120.0),
            ],
        );

        // Two baseline candles (volume 20) then the arming sweep at volume 50
        let arming_open = t0() + Duration::minutes(30);
        candles.backfill(
            "XUSDT",
            Timeframe::M15,
            vec![
                m15(t0(), 102.0, 102.5, 101.0, 101.5, 20.0),
                m15(t0() + Duration::minutes(15), 101.5, 102.0, 100.6, 100.9, 20.0),
            ],
        );
        let arming = m15(arming_open, 100.8, 101.0, 99.5, 100.5, 50.0);
        candles.apply_live_update("XUSDT", Timeframe::M15, arming.clone());

        // Buy-dominant flow in the first `windows` one-minute windows
        for w in 0..windows {
            let ts = arming_open + Duration::milliseconds(w as i64 * 60_000 + 500);
            flow.apply_trade("XUSDT", 30.0, true, ts);
            flow.apply_trade("XUSDT", 5.0, false, ts + Duration::seconds(1));
        }

        (candles, flow, rates, arming)
    }

    fn m5(open_time: DateTime<Utc>, close: f64) -> Candle {
        Candle {
            open_time,
            close_time: open_time + Duration::minutes(5),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            closed: true,
        }
    }

    #[test]
    fn test_arming_requires_three_windows() {
        let exec = Arc::new(MockExec::new(10_000.0));

        // Two qualifying windows: rejected
        let (candles, flow, rates, arming) = long_world(2);
        let mut engine = SetupEngine::new(test_config(), exec.clone());
        engine.on_slow_close("XUSDT", &arming, &candles, &flow, &rates);
        assert!(engine.pending_setups().is_empty());

        // Three qualifying windows: armed
        let (candles, flow, rates, arming) = long_world(3);
        let mut engine = SetupEngine::new(test_config(), exec);
        engine.on_slow_close("XUSDT", &arming, &candles, &flow, &rates);
        let pending = engine.pending_setups();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].direction, Direction::Long);
        assert_eq!(pending[0].snapshot.imbalance_windows_hit, 3);
    }

    #[test]
    fn test_rearming_is_noop() {
        let exec = Arc::new(MockExec::new(10_000.0));
        let (candles, flow, rates, arming) = long_world(5);
        let mut engine = SetupEngine::new(test_config(), exec);

        engine.on_slow_close("XUSDT", &arming, &candles, &flow, &rates);
        let armed_at = engine.pending_setups()[0].armed_at;

        // Same arming candle re-evaluated, then a later matching close:
        // still exactly one pending entry per (symbol, direction)
        engine.on_slow_close("XUSDT", &arming, &candles, &flow, &rates);
        let mut later = arming.clone();
        later.open_time = arming.open_time + Duration::minutes(15);
        later.close_time = arming.close_time + Duration::minutes(15);
        engine.on_slow_close("XUSDT", &later, &candles, &flow, &rates);

        let pending = engine.pending_setups();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].armed_at, armed_at);
    }

    #[tokio::test]
    async fn test_fire_long_bracket() {
        let exec = Arc::new(MockExec::new(10_000.0));
        let (candles, flow, rates, arming) = long_world(4);
        let mut engine = SetupEngine::new(test_config(), exec.clone());
        engine.on_slow_close("XUSDT", &arming, &candles, &flow, &rates);

        let confirm_open = arming.close_time;
        let confirm = m5(confirm_open, 101.0);
        engine
            .on_fast_close("XUSDT", &confirm, confirm.close_time)
            .await;

        let submitted = exec.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        let intent = &submitted[0];
        assert_eq!(intent.entry_price, 101.0);
        assert!((intent.stop_price - 99.99).abs() < 1e-9);
        assert!((intent.target_price - 103.02).abs() < 1e-9);
        // 1% of 10k risked over a 1.01 stop distance
        assert!((intent.quantity - 100.0 / 1.01).abs() < 1e-9);

        assert!(engine.pending_setups().is_empty());
        assert_eq!(engine.recent_signals()[0].outcome, SignalOutcome::Submitted);
    }

    #[tokio::test]
    async fn test_disarms_on_submit_failure() {
        let mut exec = MockExec::new(10_000.0);
        exec.fail_submit = true;
        let exec = Arc::new(exec);

        let (candles, flow, rates, arming) = long_world(4);
        let mut engine = SetupEngine::new(test_config(), exec.clone());
        engine.on_slow_close("XUSDT", &arming, &candles, &flow, &rates);

        let confirm = m5(arming.close_time, 101.0);
        engine
            .on_fast_close("XUSDT", &confirm, confirm.close_time)
            .await;

        assert!(engine.pending_setups().is_empty());
        match &engine.recent_signals()[0].outcome {
            SignalOutcome::Failed(err) => assert!(err.contains("rejected")),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_session_gate_disarms_without_firing() {
        let exec = Arc::new(MockExec::new(10_000.0));
        let (candles, flow, rates, arming) = long_world(4);
        // Wide entry window so the gate, not the TTL, is what rejects
        let mut config = test_config();
        config.entry_window_secs = 24 * 3600;
        let mut engine = SetupEngine::new(config, exec.clone());
        engine.on_slow_close("XUSDT", &arming, &candles, &flow, &rates);

        // 13:56 UTC close is outside the morning window
        let gated_open = Utc.with_ymd_and_hms(2024, 3, 4, 13, 51, 0).unwrap();
        let mut confirm = m5(gated_open, 101.0);
        confirm.close_time = Utc.with_ymd_and_hms(2024, 3, 4, 13, 56, 0).unwrap();
        engine
            .on_fast_close("XUSDT", &confirm, confirm.close_time)
            .await;

        assert!(exec.submitted.lock().unwrap().is_empty());
        assert!(engine.pending_setups().is_empty());
        assert_eq!(engine.recent_signals()[0].outcome, SignalOutcome::SkippedGate);
    }

    #[tokio::test]
    async fn test_entry_window_expiry() {
        let exec = Arc::new(MockExec::new(10_000.0));
        let (candles, flow, rates, arming) = long_world(4);
        let mut engine = SetupEngine::new(test_config(), exec.clone());
        engine.on_slow_close("XUSDT", &arming, &candles, &flow, &rates);

        let late_open = arming.close_time + Duration::hours(2);
        let confirm = m5(late_open, 101.0);
        engine
            .on_fast_close("XUSDT", &confirm, confirm.close_time)
            .await;

        assert!(exec.submitted.lock().unwrap().is_empty());
        assert!(engine.pending_setups().is_empty());
        assert_eq!(engine.recent_signals()[0].outcome, SignalOutcome::Expired);
    }

    #[tokio::test]
    async fn test_zero_balance_skips_sizing() {
        let exec = Arc::new(MockExec::new(0.0));
        let (candles, flow, rates, arming) = long_world(4);
        let mut engine = SetupEngine::new(test_config(), exec.clone());
        engine.on_slow_close("XUSDT", &arming, &candles, &flow, &rates);

        let confirm = m5(arming.close_time, 101.0);
        engine
            .on_fast_close("XUSDT", &confirm, confirm.close_time)
            .await;

        assert!(exec.submitted.lock().unwrap().is_empty());
        assert_eq!(
            engine.recent_signals()[0].outcome,
            SignalOutcome::SkippedSizing
        );
    }

    #[tokio::test]
    async fn test_at_most_one_pending_per_key() {
        let exec = Arc::new(MockExec::new(10_000.0));
        let (candles, flow, rates, arming) = long_world(5);
        let mut engine = SetupEngine::new(test_config(), exec);

        // Arbitrary interleaving of slow and fast closes never leaves more
        // than one pending setup per (symbol, direction)
        for round in 0..4 {
            let mut slow = arming.clone();
            slow.open_time = arming.open_time + Duration::minutes(15 * round);
            slow.close_time = arming.close_time + Duration::minutes(15 * round);
            engine.on_slow_close("XUSDT", &slow, &candles, &flow, &rates);
            assert!(engine.pending_setups().len() <= 1);

            if round % 2 == 1 {
                let confirm = m5(slow.close_time, 101.0);
                engine
                    .on_fast_close("XUSDT", &confirm, confirm.close_time)
                    .await;
                assert!(engine.pending_setups().is_empty());
            }
        }
    }
}
