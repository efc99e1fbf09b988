//! Wire types for the USDⓈ-M futures venue
//!
//! Stream payloads arrive wrapped in a combined-stream envelope; numeric
//! fields come over the wire as strings and are parsed at the boundary.

use serde::Deserialize;

/// Combined-stream envelope: `{"stream": "...", "data": {...}}`.
#[derive(Debug, Deserialize)]
pub struct StreamEnvelope {
    pub stream: String,
    pub data: serde_json::Value,
}

/// Aggregated trade print (`<symbol>@aggTrade`).
#[derive(Debug, Deserialize)]
pub struct AggTradeEvent {
    #[serde(rename = "s")]
    pub symbol: String,
    #[allow(dead_code)]
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub quantity: String,
    /// True when the buyer is the market maker, i.e. the aggressor sold.
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
    #[serde(rename = "T")]
    pub trade_time: i64,
}

/// Kline update (`<symbol>@kline_<interval>`).
#[derive(Debug, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
pub struct KlinePayload {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "x")]
    pub is_closed: bool,
}

/// Mark-price push (`<symbol>@markPrice`), carrying the live funding rate.
#[derive(Debug, Deserialize)]
pub struct MarkPriceEvent {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub mark_price: String,
    #[serde(rename = "r")]
    pub funding_rate: String,
    #[serde(rename = "T")]
    pub next_funding_time: i64,
}

/// Instantaneous open interest (`/fapi/v1/openInterest`).
#[derive(Debug, Deserialize)]
pub struct OpenInterestResponse {
    #[serde(rename = "openInterest")]
    pub open_interest: String,
    pub time: i64,
}

/// Premium index (`/fapi/v1/premiumIndex`): mark price + last funding.
#[derive(Debug, Deserialize)]
pub struct PremiumIndexResponse {
    #[serde(rename = "markPrice")]
    pub mark_price: String,
    #[serde(rename = "lastFundingRate")]
    pub last_funding_rate: String,
    #[serde(rename = "nextFundingTime")]
    pub next_funding_time: i64,
}

/// One row of `/futures/data/openInterestHist`.
#[derive(Debug, Deserialize)]
pub struct OpenInterestHistRow {
    #[serde(rename = "sumOpenInterest")]
    pub sum_open_interest: String,
    pub timestamp: i64,
}

/// One asset row of the signed `/fapi/v2/balance` call.
#[derive(Debug, Deserialize)]
pub struct BalanceRow {
    pub asset: String,
    #[serde(rename = "availableBalance")]
    pub available_balance: String,
}

/// Order acknowledgement from `/fapi/v1/order`.
#[derive(Debug, Deserialize)]
pub struct OrderAck {
    #[serde(rename = "orderId")]
    pub order_id: i64,
    pub status: String,
}

/// Subset of `/fapi/v1/exchangeInfo` needed for quantization.
#[derive(Debug, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub filters: Vec<SymbolFilter>,
}

/// Filters are a heterogeneous tagged list; unknown types are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "PRICE_FILTER")]
    Price {
        #[serde(rename = "tickSize")]
        tick_size: String,
    },
    #[serde(rename = "LOT_SIZE")]
    LotSize {
        #[serde(rename = "stepSize")]
        step_size: String,
        #[serde(rename = "minQty")]
        min_qty: String,
    },
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional {
        #[serde(rename = "notional")]
        notional: String,
    },
    #[serde(other)]
    Other,
}
