use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use sweepflow::binance::client::DEFAULT_BASE_URL;
use sweepflow::binance::{BinanceClient, BracketExecutor};
use sweepflow::candles::CandleStore;
use sweepflow::config::BotConfig;
use sweepflow::engine::SetupEngine;
use sweepflow::orderflow::FlowTracker;
use sweepflow::rates::{refresh_all, RateCache};
use sweepflow::stream::{run_market_stream, DEFAULT_WS_URL};
use sweepflow::types::{LogObserver, Timeframe};
use sweepflow::{api, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Symbols to trade (comma-separated)
    #[arg(short, long, default_value = "BTCUSDT,ETHUSDT,SOLUSDT")]
    symbols: String,

    /// Port for the dashboard endpoints
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// REST base URL
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// WebSocket base URL
    #[arg(long, default_value = DEFAULT_WS_URL)]
    ws_url: String,

    /// API key for signed endpoints
    #[arg(long, env = "BINANCE_API_KEY")]
    api_key: Option<String>,

    /// API secret for signed endpoints
    #[arg(long, env = "BINANCE_API_SECRET")]
    api_secret: Option<String>,

    /// Quantize and log brackets without sending orders
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sweepflow=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let symbols: Vec<String> = args
        .symbols
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    let config = BotConfig {
        symbols: symbols.clone(),
        dry_run: args.dry_run,
        ..Default::default()
    };

    info!("Starting sweepflow");
    info!("Symbols: {:?}", symbols);
    info!("Dry run: {}", config.dry_run);

    let client = BinanceClient::new(&args.base_url, args.api_key, args.api_secret)?;

    let mut executor = BracketExecutor::new(client.clone(), config.dry_run);
    if let Err(e) = executor.load_filters().await {
        warn!("exchange filter fetch failed, quantization is permissive: {:#}", e);
    }

    let mut engine = SetupEngine::new(config.clone(), Arc::new(executor));
    engine.add_observer(Box::new(LogObserver));

    let mut candles = CandleStore::new(config.candle_capacity);
    let mut rates = RateCache::new(config.oi_retention_mins);
    backfill(&client, &config, &mut candles, &mut rates).await;

    let state = Arc::new(AppState {
        flow: RwLock::new(FlowTracker::new(config.bucket_capacity)),
        candles: RwLock::new(candles),
        rates: RwLock::new(rates),
        engine: RwLock::new(engine),
        started_at: chrono::Utc::now(),
        config,
    });

    // Market stream task (reconnects for the process lifetime)
    let stream_state = state.clone();
    tokio::spawn(async move {
        run_market_stream(stream_state, args.ws_url).await;
    });

    // Periodic external-rate refresh, independent of trigger evaluation
    let refresh_state = state.clone();
    let refresh_client = client.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(refresh_state.config.refresh_secs));
        loop {
            interval.tick().await;
            refresh_all(&refresh_client, &refresh_state.rates, &refresh_state.config.symbols).await;
        }
    });

    let app = api::router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    info!("Dashboard endpoints at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind dashboard port")?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Pre-seed candle series and the OI history ring before the live stream
/// attaches. Failures are logged; the series fill in from the stream.
async fn backfill(
    client: &BinanceClient,
    config: &BotConfig,
    candles: &mut CandleStore,
    rates: &mut RateCache,
) {
    let limit = config.candle_capacity.min(500) as u32;
    let oi_limit = (config.oi_retention_mins / 5).max(1) as u32;

    for symbol in &config.symbols {
        for timeframe in Timeframe::ALL {
            match client.fetch_klines(symbol, timeframe.label(), limit).await {
                Ok(history) => {
                    info!("backfilled {} {} candles for {}", history.len(), timeframe, symbol);
                    candles.backfill(symbol, timeframe, history);
                }
                Err(e) => error!("kline backfill failed for {} {}: {:#}", symbol, timeframe, e),
            }
        }

        match client.fetch_open_interest_hist(symbol, oi_limit).await {
            Ok(points) => {
                for (timestamp, oi) in points {
                    rates.ingest_oi(symbol, oi, timestamp);
                }
            }
            Err(e) => error!("OI history backfill failed for {}: {:#}", symbol, e),
        }
    }
}
