// =============================================================================
// MarketClient — public Binance Futures REST data, read-only
// =============================================================================
//
// Every call here hits an unauthenticated endpoint, so there's no HMAC
// signing in this file — that machinery lives in `trader::binance` instead.
// The liquidity filter and indicator math is the one place this crate reuses
// the teacher's `indicators::*` and `futures_intel::*` modules directly.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::futures_intel::funding_rate::FundingRateMonitor;
use crate::futures_intel::open_interest::OpenInterestTracker;
use crate::indicators::{adx, atr, ema, rsi};
use crate::market_data::Candle;

const FAPI_BASE: &str = "https://fapi.binance.com";

/// A single symbol's read-only market state, assembled once per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: f64,
    pub change_1h_pct: f64,
    pub change_4h_pct: f64,
    pub change_24h_pct: f64,
    pub volume_24h_usd: f64,
    pub open_interest_usd: f64,
    pub funding_rate_pct: f64,
    pub rsi_14: Option<f64>,
    pub ema_trend_aligned: Option<bool>,
    pub atr_pct: Option<f64>,
    pub adx: Option<f64>,
}

impl MarketSnapshot {
    /// $15,000,000 open-interest-notional threshold below which a symbol is
    /// dropped from every candidate source.
    pub fn passes_liquidity_filter(&self, threshold_usd: f64) -> bool {
        self.open_interest_usd >= threshold_usd
    }
}

pub struct MarketClient {
    client: reqwest::Client,
    oi_tracker: OpenInterestTracker,
    funding_monitor: FundingRateMonitor,
}

impl MarketClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client for MarketClient");
        Self {
            oi_tracker: OpenInterestTracker::with_client(client.clone()),
            funding_monitor: FundingRateMonitor::with_client(client.clone()),
            client,
        }
    }

    /// GET /fapi/v1/klines — mirrors the teacher's spot client parsing, just
    /// pointed at the futures host.
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let url = format!(
            "{FAPI_BASE}/fapi/v1/klines?symbol={symbol}&interval={interval}&limit={limit}"
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/klines request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /fapi/v1/klines returned {}: {}", status, body);
        }

        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 11 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }
            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: parse_str_f64(&arr[1])?,
                high: parse_str_f64(&arr[2])?,
                low: parse_str_f64(&arr[3])?,
                close: parse_str_f64(&arr[4])?,
                volume: parse_str_f64(&arr[5])?,
                close_time: arr[6].as_i64().unwrap_or(0),
                quote_volume: parse_str_f64(&arr[7])?,
                trades_count: arr[8].as_u64().unwrap_or(0),
                taker_buy_volume: parse_str_f64(&arr[9])?,
                taker_buy_quote_volume: parse_str_f64(&arr[10])?,
                is_closed: true,
            });
        }
        Ok(candles)
    }

    /// GET /fapi/v1/ticker/24hr — last price, quote volume, 24h change.
    async fn get_ticker_24hr(&self, symbol: &str) -> Result<(f64, f64, f64)> {
        let url = format!("{FAPI_BASE}/fapi/v1/ticker/24hr?symbol={symbol}");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/ticker/24hr request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse ticker response")?;
        if !status.is_success() {
            anyhow::bail!("Binance GET /fapi/v1/ticker/24hr returned {}: {}", status, body);
        }
        let price: f64 = body["lastPrice"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
        let quote_volume: f64 = body["quoteVolume"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
        let change_pct: f64 = body["priceChangePercent"]
            .as_str()
            .unwrap_or("0")
            .parse()
            .unwrap_or(0.0);
        Ok((price, quote_volume, change_pct))
    }

    /// GET /fapi/v1/exchangeInfo — every tradeable USDⓈ-M perpetual symbol.
    pub async fn list_perpetual_symbols(&self) -> Result<Vec<String>> {
        let url = format!("{FAPI_BASE}/fapi/v1/exchangeInfo");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/exchangeInfo request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse exchangeInfo response")?;
        if !status.is_success() {
            anyhow::bail!("Binance GET /fapi/v1/exchangeInfo returned {}: {}", status, body);
        }
        let symbols = body["symbols"]
            .as_array()
            .context("exchangeInfo response missing 'symbols'")?
            .iter()
            .filter(|s| {
                s["contractType"].as_str() == Some("PERPETUAL")
                    && s["quoteAsset"].as_str() == Some("USDT")
                    && s["status"].as_str() == Some("TRADING")
            })
            .filter_map(|s| s["symbol"].as_str().map(str::to_string))
            .collect();
        Ok(symbols)
    }

    /// Assemble a full [`MarketSnapshot`] for one symbol: 1h-interval candles
    /// drive the 1h/4h change figures and the indicator set, the 24hr ticker
    /// gives price/volume, open interest and funding round out the picture.
    pub async fn fetch_snapshot(&self, symbol: &str) -> Result<MarketSnapshot> {
        let candles = self.get_klines(symbol, "1h", 100).await?;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let (price, volume_24h, change_24h_pct) = self.get_ticker_24hr(symbol).await?;

        let change_1h_pct = pct_change_over(&closes, 1);
        let change_4h_pct = pct_change_over(&closes, 4);

        let oi_state = self.oi_tracker.fetch(symbol).await?;
        let open_interest_usd = oi_state.current_oi * price;

        let funding_state = self.funding_monitor.fetch(symbol).await?;

        let rsi_14 = rsi::current_rsi(&closes, 14).map(|(v, _)| v);
        let ema_trend_aligned = ema::ema_trend_aligned(&closes).map(|(aligned, _)| aligned);
        let atr_pct = atr::calculate_atr_pct(&candles, 14);
        let adx_val = adx::calculate_adx(&candles, 14);

        debug!(symbol, price, open_interest_usd, "market snapshot assembled");

        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            price,
            change_1h_pct,
            change_4h_pct,
            change_24h_pct,
            volume_24h_usd: volume_24h,
            open_interest_usd,
            funding_rate_pct: funding_state.rate_pct,
            rsi_14,
            ema_trend_aligned,
            atr_pct,
            adx: adx_val,
        })
    }

    /// Fetch snapshots for every symbol concurrently, dropping any that
    /// errored rather than failing the whole cycle.
    pub async fn fetch_universe(&self, symbols: &[String]) -> Vec<MarketSnapshot> {
        let futures = symbols.iter().map(|s| self.fetch_snapshot(s));
        join_all(futures)
            .await
            .into_iter()
            .filter_map(|r| match r {
                Ok(snap) => Some(snap),
                Err(e) => {
                    warn!(error = %e, "failed to fetch market snapshot for symbol, dropping");
                    None
                }
            })
            .collect()
    }
}

impl Default for MarketClient {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>().with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

/// Percent change between the latest close and the close `hours` candles back.
fn pct_change_over(closes: &[f64], hours: usize) -> f64 {
    if closes.len() <= hours {
        return 0.0;
    }
    let latest = closes[closes.len() - 1];
    let past = closes[closes.len() - 1 - hours];
    if past == 0.0 {
        return 0.0;
    }
    ((latest - past) / past) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liquidity_filter_rejects_below_threshold() {
        let snap = MarketSnapshot {
            symbol: "DOGEUSDT".into(),
            price: 0.1,
            change_1h_pct: 0.0,
            change_4h_pct: 0.0,
            change_24h_pct: 0.0,
            volume_24h_usd: 1_000_000.0,
            open_interest_usd: 10_000_000.0,
            funding_rate_pct: 0.0,
            rsi_14: None,
            ema_trend_aligned: None,
            atr_pct: None,
            adx: None,
        };
        assert!(!snap.passes_liquidity_filter(15_000_000.0));
        assert!(snap.passes_liquidity_filter(5_000_000.0));
    }

    #[test]
    fn pct_change_over_computes_relative_move() {
        let closes = vec![100.0, 101.0, 102.0, 103.0, 110.0];
        assert!((pct_change_over(&closes, 1) - ((110.0 - 103.0) / 103.0 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn pct_change_over_returns_zero_when_insufficient_history() {
        let closes = vec![100.0];
        assert_eq!(pct_change_over(&closes, 4), 0.0);
    }
}
