//! Venue integration: REST client, wire models, and the bracket executor.

pub mod client;
pub mod executor;
pub mod models;

pub use client::BinanceClient;
pub use executor::BracketExecutor;
