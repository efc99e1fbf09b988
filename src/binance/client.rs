//! Futures REST client
//!
//! Public market-data fetches plus HMAC-signed account and trading calls.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Url};
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

use super::models::{
    BalanceRow, ExchangeInfo, OpenInterestHistRow, OpenInterestResponse, OrderAck,
    PremiumIndexResponse,
};
use crate::types::Candle;

type HmacSha256 = Hmac<Sha256>;

/// Default REST base for USDⓈ-M futures.
pub const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";

/// Symbol used for the process-wide dominance reference price.
pub const DOMINANCE_SYMBOL: &str = "BTCUSDT";

fn ts_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("invalid timestamp millis: {ms}"))
}

/// REST client for the futures venue. Cheap to clone.
#[derive(Clone)]
pub struct BinanceClient {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
    api_secret: Option<String>,
    recv_window_ms: u64,
}

impl BinanceClient {
    pub fn new(base_url: &str, api_key: Option<String>, api_secret: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        let base_url = Url::parse(base_url).context("invalid base URL")?;

        Ok(Self {
            http,
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
            api_secret: api_secret.filter(|s| !s.is_empty()),
            recv_window_ms: 5000,
        })
    }

    /// Append timestamp + recvWindow and sign the query string.
    fn sign_params(&self, mut params: Vec<(String, String)>) -> Result<String> {
        let api_secret = self
            .api_secret
            .as_ref()
            .ok_or_else(|| anyhow!("API secret required for signed requests"))?;

        params.push(("timestamp".into(), Utc::now().timestamp_millis().to_string()));
        params.push(("recvWindow".into(), self.recv_window_ms.to_string()));
        let query = serde_urlencoded::to_string(&params)?;

        let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes())
            .map_err(|err| anyhow!("failed to init signer: {err}"))?;
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(format!("{query}&signature={signature}"))
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| anyhow!("API key required for signed requests"))
    }

    async fn signed_get<R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<R> {
        let query = self.sign_params(params)?;
        let url = format!("{}{}?{}", self.base_url.as_str().trim_end_matches('/'), path, query);
        let res = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", self.api_key()?)
            .send()
            .await
            .with_context(|| format!("request to {path} failed"))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("{path} returned {status}: {body}"));
        }
        res.json()
            .await
            .with_context(|| format!("failed to parse response from {path}"))
    }

    async fn signed_post<R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<R> {
        let query = self.sign_params(params)?;
        let url = format!("{}{}?{}", self.base_url.as_str().trim_end_matches('/'), path, query);
        let res = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", self.api_key()?)
            .send()
            .await
            .with_context(|| format!("request to {path} failed"))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("{path} returned {status}: {body}"));
        }
        res.json()
            .await
            .with_context(|| format!("failed to parse response from {path}"))
    }

    /// Historical klines, oldest first.
    pub async fn fetch_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let mut url = self.base_url.join("/fapi/v1/klines")?;
        url.query_pairs_mut()
            .append_pair("symbol", symbol)
            .append_pair("interval", interval)
            .append_pair("limit", &limit.to_string());

        let res = self.http.get(url).send().await?;
        if !res.status().is_success() {
            anyhow::bail!("klines error: {}", res.text().await?);
        }

        let raw: Vec<serde_json::Value> = res.json().await?;
        let now = Utc::now();
        let candles = raw
            .into_iter()
            .filter_map(|row| {
                let row = row.as_array()?;
                if row.len() < 7 {
                    return None;
                }
                let close_time = ts_ms(row[6].as_i64()?).ok()?;
                Some(Candle {
                    open_time: ts_ms(row[0].as_i64()?).ok()?,
                    open: row[1].as_str()?.parse().ok()?,
                    high: row[2].as_str()?.parse().ok()?,
                    low: row[3].as_str()?.parse().ok()?,
                    close: row[4].as_str()?.parse().ok()?,
                    volume: row[5].as_str()?.parse().ok()?,
                    close_time,
                    // The endpoint's last row is the in-progress bar
                    closed: close_time <= now,
                })
            })
            .collect();

        Ok(candles)
    }

    /// Instantaneous open interest.
    pub async fn fetch_open_interest(&self, symbol: &str) -> Result<(f64, DateTime<Utc>)> {
        let mut url = self.base_url.join("/fapi/v1/openInterest")?;
        url.query_pairs_mut().append_pair("symbol", symbol);

        let res = self.http.get(url).send().await?;
        if !res.status().is_success() {
            anyhow::bail!("openInterest error: {}", res.text().await?);
        }

        let body: OpenInterestResponse = res.json().await?;
        let oi = body
            .open_interest
            .parse()
            .context("malformed openInterest value")?;
        Ok((oi, ts_ms(body.time)?))
    }

    /// Most recent funding rate via the premium index.
    pub async fn fetch_funding_rate(&self, symbol: &str) -> Result<(f64, DateTime<Utc>)> {
        let body = self.premium_index(symbol).await?;
        let rate = body
            .last_funding_rate
            .parse()
            .context("malformed funding rate")?;
        Ok((rate, ts_ms(body.next_funding_time)?))
    }

    /// Mark price of the dominance reference instrument.
    pub async fn fetch_dominance_price(&self) -> Result<f64> {
        let body = self.premium_index(DOMINANCE_SYMBOL).await?;
        body.mark_price.parse().context("malformed mark price")
    }

    async fn premium_index(&self, symbol: &str) -> Result<PremiumIndexResponse> {
        let mut url = self.base_url.join("/fapi/v1/premiumIndex")?;
        url.query_pairs_mut().append_pair("symbol", symbol);

        let res = self.http.get(url).send().await?;
        if !res.status().is_success() {
            anyhow::bail!("premiumIndex error: {}", res.text().await?);
        }
        Ok(res.json().await?)
    }

    /// Historical open interest at 5m resolution, oldest first. Used once at
    /// startup to pre-seed the OI history ring.
    pub async fn fetch_open_interest_hist(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let mut url = self.base_url.join("/futures/data/openInterestHist")?;
        url.query_pairs_mut()
            .append_pair("symbol", symbol)
            .append_pair("period", "5m")
            .append_pair("limit", &limit.to_string());

        let res = self.http.get(url).send().await?;
        if !res.status().is_success() {
            anyhow::bail!("openInterestHist error: {}", res.text().await?);
        }

        let raw: Vec<OpenInterestHistRow> = res.json().await?;
        let points = raw
            .into_iter()
            .filter_map(|row| {
                let oi = row.sum_open_interest.parse().ok()?;
                Some((ts_ms(row.timestamp).ok()?, oi))
            })
            .collect();
        Ok(points)
    }

    /// Tick/step/notional constraints for every listed symbol.
    pub async fn fetch_exchange_info(&self) -> Result<ExchangeInfo> {
        let url = self.base_url.join("/fapi/v1/exchangeInfo")?;
        let res = self.http.get(url).send().await?;
        if !res.status().is_success() {
            anyhow::bail!("exchangeInfo error: {}", res.text().await?);
        }
        Ok(res.json().await?)
    }

    /// Available balance of one asset from the signed balance endpoint.
    pub async fn available_balance(&self, asset: &str) -> Result<f64> {
        let rows: Vec<BalanceRow> = self.signed_get("/fapi/v2/balance", Vec::new()).await?;
        let row = rows
            .into_iter()
            .find(|r| r.asset == asset)
            .ok_or_else(|| anyhow!("no balance entry for {asset}"))?;
        row.available_balance
            .parse()
            .context("malformed availableBalance")
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("leverage".to_string(), leverage.to_string()),
        ];
        let _: serde_json::Value = self.signed_post("/fapi/v1/leverage", params).await?;
        debug!("leverage for {} set to {}x", symbol, leverage);
        Ok(())
    }

    pub async fn set_margin_mode(&self, symbol: &str, mode: &str) -> Result<()> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("marginType".to_string(), mode.to_string()),
        ];
        // The venue rejects a no-op change with a dedicated error code;
        // treat that as success.
        match self
            .signed_post::<serde_json::Value>("/fapi/v1/marginType", params)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("-4046") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Market entry order.
    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        client_order_id: &str,
    ) -> Result<OrderAck> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("side".to_string(), side.to_string()),
            ("type".to_string(), "MARKET".to_string()),
            ("quantity".to_string(), format_qty(quantity)),
            ("newClientOrderId".to_string(), client_order_id.to_string()),
        ];
        self.signed_post("/fapi/v1/order", params).await
    }

    /// Reduce-only stop-market order.
    pub async fn place_stop_market(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        stop_price: f64,
        client_order_id: &str,
    ) -> Result<OrderAck> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("side".to_string(), side.to_string()),
            ("type".to_string(), "STOP_MARKET".to_string()),
            ("quantity".to_string(), format_qty(quantity)),
            ("stopPrice".to_string(), format_qty(stop_price)),
            ("reduceOnly".to_string(), "true".to_string()),
            ("newClientOrderId".to_string(), client_order_id.to_string()),
        ];
        self.signed_post("/fapi/v1/order", params).await
    }

    /// Reduce-only take-profit-market order.
    pub async fn place_take_profit_market(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        stop_price: f64,
        client_order_id: &str,
    ) -> Result<OrderAck> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("side".to_string(), side.to_string()),
            ("type".to_string(), "TAKE_PROFIT_MARKET".to_string()),
            ("quantity".to_string(), format_qty(quantity)),
            ("stopPrice".to_string(), format_qty(stop_price)),
            ("reduceOnly".to_string(), "true".to_string()),
            ("newClientOrderId".to_string(), client_order_id.to_string()),
        ];
        self.signed_post("/fapi/v1/order", params).await
    }
}

/// Trim float formatting noise off order parameters.
fn format_qty(value: f64) -> String {
    let s = format!("{value:.8}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_qty_trims_zeroes() {
        assert_eq!(format_qty(0.5), "0.5");
        assert_eq!(format_qty(12.0), "12");
        assert_eq!(format_qty(0.00012345), "0.00012345");
    }

    #[test]
    fn test_signed_request_requires_secret() {
        let client = BinanceClient::new(DEFAULT_BASE_URL, None, None).unwrap();
        assert!(client.sign_params(Vec::new()).is_err());
    }

    #[test]
    fn test_sign_params_appends_signature() {
        let client = BinanceClient::new(
            DEFAULT_BASE_URL,
            Some("key".into()),
            Some("secret".into()),
        )
        .unwrap();
        let query = client
            .sign_params(vec![("symbol".into(), "BTCUSDT".into())])
            .unwrap();
        assert!(query.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(query.contains("&signature="));
    }
}
