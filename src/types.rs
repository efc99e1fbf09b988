use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Candle timeframes the bot subscribes to.
///
/// 5m confirms entries, 15m arms setups, 4h supplies the swing range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M5,
    M15,
    H4,
}

impl Timeframe {
    /// Interval label used by the venue ("5m", "15m", "4h").
    pub fn label(&self) -> &'static str {
        match self {
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H4 => "4h",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "5m" => Some(Self::M5),
            "15m" => Some(Self::M15),
            "4h" => Some(Self::H4),
            _ => None,
        }
    }

    pub const ALL: [Timeframe; 3] = [Timeframe::M5, Timeframe::M15, Timeframe::H4];
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One OHLCV candle. Mutable in place while `closed` is false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub closed: bool,
}

/// Trade direction of a setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Order side that opens a position in this direction.
    pub fn entry_side(&self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }

    /// Order side that closes a position in this direction.
    pub fn exit_side(&self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }
}

/// Indicator values captured at arming time, carried through to the signal
/// event for the dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupSnapshot {
    pub rvol: Option<f64>,
    pub swing_low: Option<f64>,
    pub swing_high: Option<f64>,
    pub imbalance_windows_hit: u32,
    pub cvd: f64,
    pub funding_rate: Option<f64>,
    pub open_interest: Option<f64>,
}

/// A candidate signal waiting for fast-timeframe confirmation.
///
/// At most one exists per (symbol, direction); see `SetupEngine`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSetup {
    pub symbol: String,
    pub direction: Direction,
    /// Open time of the 15m candle whose close armed this setup.
    pub arming_candle_open: DateTime<Utc>,
    pub snapshot: SetupSnapshot,
    pub armed_at: DateTime<Utc>,
}

/// Fully-sized order request handed to the execution adapter. Not persisted.
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub symbol: String,
    pub direction: Direction,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub leverage: u32,
    pub margin_mode: String,
}

/// Terminal outcome of a pending setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalOutcome {
    /// Bracket accepted by the venue.
    Submitted,
    /// One or more bracket legs were rejected; error from the adapter.
    Failed(String),
    /// Fast close landed outside the session windows.
    SkippedGate,
    /// Computed quantity was non-finite or non-positive, or balance unknown.
    SkippedSizing,
    /// Entry window elapsed before a fast close fired the setup.
    Expired,
}

/// Emitted on every terminal transition of a pending setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEvent {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub outcome: SignalOutcome,
    /// The 5m candle whose close resolved the setup.
    pub trigger_candle: Candle,
    pub triggered_at: DateTime<Utc>,
    pub snapshot: SetupSnapshot,
}

/// Synchronous, ordered fan-out for signal events. Observers must not block.
pub trait SignalObserver: Send + Sync {
    fn on_signal(&self, event: &SignalEvent);
}

/// Observer that writes each outcome to the log.
pub struct LogObserver;

impl SignalObserver for LogObserver {
    fn on_signal(&self, event: &SignalEvent) {
        tracing::info!(
            "SIGNAL {:?} {} @ {:.4} -> {:?}",
            event.direction,
            event.symbol,
            event.trigger_candle.close,
            event.outcome
        );
    }
}
