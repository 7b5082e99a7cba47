// =============================================================================
// BinanceFuturesTrader — live adapter over Binance USDⓈ-M Futures
// =============================================================================
//
// SECURITY: the secret key is never logged or serialised. Every signed
// request carries X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to
// tolerate minor clock drift between this process and Binance's servers.
//
// By design this adapter never places a stop-loss order — closes happen
// only through the engine's own monitor loop or an explicit close decision.
// `set_stop_loss` is implemented so a future revision can turn stops back on
// without touching the `Trader` trait or its callers.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use once_cell::sync::OnceCell;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use super::{Balance, OrderOutcome, PositionView, Trader, TraderError};
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;

/// Live Binance USDⓈ-M Futures client with HMAC-SHA256 request signing.
pub struct BinanceFuturesTrader {
    trader_id: String,
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    /// Cached after the first `positions()`/`balance()` call — Multi-Assets
    /// Mode changes how `positionSide` is reported and this adapter refuses
    /// to guess at side once that mode is active.
    multi_assets_mode: OnceCell<bool>,
    stale_clock_warned: AtomicBool,
}

impl BinanceFuturesTrader {
    pub fn new(trader_id: impl Into<String>, api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceFuturesTrader initialised (base_url=https://fapi.binance.com)");

        Self {
            trader_id: trader_id.into(),
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            client,
            multi_assets_mode: OnceCell::new(),
            stale_clock_warned: AtomicBool::new(false),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn map_error_code(status: reqwest::StatusCode, body: &serde_json::Value) -> TraderError {
        let code = body["code"].as_i64().unwrap_or(0);
        match code {
            -1021 => TraderError::RecvWindowExpired,
            -2019 => TraderError::MarginInsufficient {
                required: 0.0,
                available: 0.0,
            },
            _ => TraderError::Exchange(format!("{status}: {body}")),
        }
    }

    #[instrument(skip(self), name = "binance_futures::get_account")]
    async fn get_account(&self) -> Result<serde_json::Value, TraderError> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/account?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TraderError::Exchange(e.to_string()))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TraderError::Exchange(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::map_error_code(status, &body));
        }
        Ok(body)
    }

    async fn ensure_single_assets_mode(&self) -> Result<(), TraderError> {
        if let Some(mode) = self.multi_assets_mode.get() {
            return if *mode {
                Err(TraderError::MultiAssetsMode)
            } else {
                Ok(())
            };
        }
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v1/multiAssetsMargin?{}", self.base_url, qs);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TraderError::Exchange(e.to_string()))?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TraderError::Exchange(e.to_string()))?;
        let multi_assets = body["multiAssetsMargin"].as_bool().unwrap_or(false);
        let _ = self.multi_assets_mode.set(multi_assets);
        if multi_assets {
            Err(TraderError::MultiAssetsMode)
        } else {
            Ok(())
        }
    }

    #[instrument(skip(self), name = "binance_futures::place_order")]
    async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        quantity: f64,
        reduce_only: bool,
        extra: &str,
    ) -> Result<OrderOutcome, TraderError> {
        let mut params = format!("symbol={symbol}&side={side}&type={order_type}&quantity={quantity}");
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }
        if !extra.is_empty() {
            params.push('&');
            params.push_str(extra);
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| TraderError::Exchange(e.to_string()))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TraderError::Exchange(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::map_error_code(status, &body));
        }

        let order_id = body["orderId"].as_i64().unwrap_or(0).to_string();
        let filled_qty = body["executedQty"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(quantity);
        let avg_price = body["avgPrice"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        debug!(symbol, side, order_type, filled_qty, "futures order placed");
        Ok(OrderOutcome::Filled {
            order_id,
            filled_qty,
            avg_price,
        })
    }
}

#[async_trait]
impl Trader for BinanceFuturesTrader {
    fn trader_id(&self) -> &str {
        &self.trader_id
    }

    async fn balance(&self) -> Result<Balance, TraderError> {
        self.ensure_single_assets_mode().await?;
        let account = self.get_account().await?;
        let wallet_balance = account["totalWalletBalance"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let unrealized_pnl = account["totalUnrealizedProfit"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let available_balance = account["availableBalance"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        Ok(Balance {
            wallet_balance,
            unrealized_pnl,
            available_balance,
        })
    }

    async fn positions(&self) -> Result<Vec<PositionView>, TraderError> {
        self.ensure_single_assets_mode().await?;
        let account = self.get_account().await?;
        let raw_positions = account["positions"].as_array().cloned().unwrap_or_default();

        let mut out = Vec::new();
        for p in raw_positions {
            let position_amt = p["positionAmt"]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
            if position_amt == 0.0 {
                continue;
            }
            let symbol = p["symbol"].as_str().unwrap_or_default().to_string();
            let raw_side = p["positionSide"].as_str().unwrap_or("BOTH");
            let side = Side::normalise(raw_side, position_amt);
            let entry_price = p["entryPrice"]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
            let mark_price = p["markPrice"]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(entry_price);
            let unrealized_pnl = p["unrealizedProfit"]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
            let leverage = p["leverage"]
                .as_str()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(1);
            let isolated_margin = p["isolatedWallet"]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);

            out.push(PositionView {
                symbol,
                side,
                position_amt,
                entry_price,
                mark_price,
                unrealized_pnl,
                leverage,
                isolated_margin,
                take_profit_price: None,
            });
        }
        Ok(out)
    }

    async fn open_long(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderOutcome, TraderError> {
        self.set_leverage(symbol, leverage).await?;
        self.place_order(symbol, "BUY", "MARKET", quantity, false, "")
            .await
    }

    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderOutcome, TraderError> {
        self.set_leverage(symbol, leverage).await?;
        self.place_order(symbol, "SELL", "MARKET", quantity, false, "")
            .await
    }

    async fn close_long(&self, symbol: &str) -> Result<OrderOutcome, TraderError> {
        let positions = self.positions().await?;
        let pos = positions
            .iter()
            .find(|p| p.symbol == symbol && p.side == Side::Long)
            .ok_or(TraderError::AlreadyClosed)?;
        self.place_order(symbol, "SELL", "MARKET", pos.position_amt.abs(), true, "")
            .await
    }

    async fn close_short(&self, symbol: &str) -> Result<OrderOutcome, TraderError> {
        let positions = self.positions().await?;
        let pos = positions
            .iter()
            .find(|p| p.symbol == symbol && p.side == Side::Short)
            .ok_or(TraderError::AlreadyClosed)?;
        self.place_order(symbol, "BUY", "MARKET", pos.position_amt.abs(), true, "")
            .await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), TraderError> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/leverage?{}", self.base_url, qs);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| TraderError::Exchange(e.to_string()))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TraderError::Exchange(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::map_error_code(status, &body));
        }
        Ok(())
    }

    async fn set_stop_loss(&self, symbol: &str, stop_price: f64) -> Result<(), TraderError> {
        let positions = self.positions().await?;
        let pos = positions
            .iter()
            .find(|p| p.symbol == symbol)
            .ok_or(TraderError::AlreadyClosed)?;
        let side = match pos.side {
            Side::Long => "SELL",
            Side::Short => "BUY",
        };
        let extra = format!("stopPrice={stop_price}&closePosition=true");
        self.place_order(symbol, side, "STOP_MARKET", 0.0, false, &extra)
            .await?;
        Ok(())
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        take_profit_price: f64,
    ) -> Result<(), TraderError> {
        let positions = self.positions().await?;
        let pos = positions
            .iter()
            .find(|p| p.symbol == symbol)
            .ok_or(TraderError::AlreadyClosed)?;
        let side = match pos.side {
            Side::Long => "SELL",
            Side::Short => "BUY",
        };
        let extra = format!("stopPrice={take_profit_price}&closePosition=true");
        self.place_order(symbol, side, "TAKE_PROFIT_MARKET", 0.0, false, &extra)
            .await?;
        Ok(())
    }

    async fn cancel_all(&self, symbol: &str) -> Result<(), TraderError> {
        let params = format!("symbol={symbol}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/allOpenOrders?{}", self.base_url, qs);

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| TraderError::Exchange(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp
                .json()
                .await
                .unwrap_or(serde_json::Value::Null);
            warn!(symbol, %status, %body, "cancel_all returned non-success status");
            return Err(TraderError::Exchange(format!("{status}: {body}")));
        }
        Ok(())
    }

    fn format_quantity(&self, _symbol: &str, quantity: f64) -> f64 {
        // Exchange-specific step sizes come from exchangeInfo in a full
        // deployment; this adapter rounds to three decimals as a
        // conservative default for the majority of USDⓈ-M symbols.
        (quantity * 1000.0).floor() / 1000.0
    }
}

impl std::fmt::Debug for BinanceFuturesTrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesTrader")
            .field("trader_id", &self.trader_id)
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_quantity_rounds_down_to_three_decimals() {
        let trader = BinanceFuturesTrader::new("t1", "key", "secret");
        assert!((trader.format_quantity("BTCUSDT", 1.23456) - 1.234).abs() < 1e-9);
    }

    #[test]
    fn map_error_code_recognises_recv_window_expired() {
        let body = serde_json::json!({"code": -1021, "msg": "Timestamp outside of recvWindow"});
        let err = BinanceFuturesTrader::map_error_code(reqwest::StatusCode::BAD_REQUEST, &body);
        assert!(matches!(err, TraderError::RecvWindowExpired));
    }

    #[test]
    fn map_error_code_recognises_margin_insufficient() {
        let body = serde_json::json!({"code": -2019, "msg": "Margin is insufficient"});
        let err = BinanceFuturesTrader::map_error_code(reqwest::StatusCode::BAD_REQUEST, &body);
        assert!(matches!(err, TraderError::MarginInsufficient { .. }));
    }
}
