// Library crate - exports the signal engine and its collaborators

pub mod api;
pub mod binance;
pub mod candles;
pub mod config;
pub mod engine;
pub mod orderflow;
pub mod rates;
pub mod stream;
pub mod types;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use binance::BracketExecutor;
use candles::CandleStore;
use config::BotConfig;
use engine::SetupEngine;
use orderflow::FlowTracker;
use rates::RateCache;

// Re-export commonly used types
pub use types::*;

/// Shared application state: the streaming aggregators on the write path and
/// the dashboard accessors on the read path.
pub struct AppState {
    pub config: BotConfig,
    pub candles: RwLock<CandleStore>,
    pub flow: RwLock<FlowTracker>,
    pub rates: RwLock<RateCache>,
    pub engine: RwLock<SetupEngine<BracketExecutor>>,
    pub started_at: DateTime<Utc>,
}
