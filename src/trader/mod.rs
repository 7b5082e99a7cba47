// =============================================================================
// Trader — the exchange-facing interface every adapter implements
// =============================================================================
//
// `Trader` is the seam between the decision engine and whatever actually
// moves money: a paper ledger for backtesting or a live futures account.
// The engine only ever talks to this trait, never to `PaperTrader` or
// `BinanceFuturesTrader` directly, so a new exchange adapter is a single
// new file plus one registry entry.
// =============================================================================

pub mod binance;
pub mod paper;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Side;

/// Account equity snapshot. `equity()` is wallet balance plus unrealized PnL
/// and is the figure every margin-band and risk-fraction formula uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Balance {
    pub wallet_balance: f64,
    pub unrealized_pnl: f64,
    pub available_balance: f64,
}

impl Balance {
    pub fn equity(&self) -> f64 {
        self.wallet_balance + self.unrealized_pnl
    }
}

/// A single open position as reported by the exchange (or the paper ledger).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionView {
    pub symbol: String,
    pub side: Side,
    pub position_amt: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
    pub isolated_margin: f64,
    pub take_profit_price: Option<f64>,
}

impl PositionView {
    /// `(price_change / entry) * leverage * 100`, signed for side.
    pub fn pnl_pct(&self) -> f64 {
        let direction = self.side.direction();
        let price_change = (self.mark_price - self.entry_price) * direction;
        (price_change / self.entry_price) * self.leverage as f64 * 100.0
    }

    pub fn notional(&self) -> f64 {
        self.position_amt.abs() * self.mark_price
    }
}

/// Result of submitting an order — every adapter returns one of these so the
/// cycle engine can record a uniform per-decision outcome regardless of
/// which exchange actually executed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderOutcome {
    Filled { order_id: String, filled_qty: f64, avg_price: f64 },
    Rejected { reason: String },
}

#[derive(Debug, Error)]
pub enum TraderError {
    #[error("margin insufficient: required {required:.2}, available {available:.2}")]
    MarginInsufficient { required: f64, available: f64 },

    #[error("position already closed")]
    AlreadyClosed,

    #[error("recvWindow expired — local clock drifted from exchange time")]
    RecvWindowExpired,

    #[error("account runs in Multi-Assets Mode, which this adapter does not support")]
    MultiAssetsMode,

    #[error("exchange error: {0}")]
    Exchange(String),
}

/// Everything the decision engine needs from an exchange (or a paper stand-in).
/// Implementations must be safe to call concurrently from multiple cycle
/// tasks — the engine itself serialises same-symbol operations via its lock
/// map, but a `Trader` may be shared across traders that copy-trade the same
/// account.
#[async_trait]
pub trait Trader: Send + Sync {
    fn trader_id(&self) -> &str;

    async fn balance(&self) -> Result<Balance, TraderError>;

    async fn positions(&self) -> Result<Vec<PositionView>, TraderError>;

    async fn open_long(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderOutcome, TraderError>;

    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderOutcome, TraderError>;

    async fn close_long(&self, symbol: &str) -> Result<OrderOutcome, TraderError>;

    async fn close_short(&self, symbol: &str) -> Result<OrderOutcome, TraderError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), TraderError>;

    /// No-op on adapters that place no stop-loss orders by design — the
    /// exchange futures adapter still implements it so a future revision can
    /// turn stops back on without touching the engine.
    async fn set_stop_loss(&self, symbol: &str, stop_price: f64) -> Result<(), TraderError>;

    async fn set_take_profit(&self, symbol: &str, take_profit_price: f64)
        -> Result<(), TraderError>;

    async fn cancel_all(&self, symbol: &str) -> Result<(), TraderError>;

    /// Round `quantity` down to the symbol's lot-size step.
    fn format_quantity(&self, symbol: &str, quantity: f64) -> f64;

    /// Refresh the mark price used for unrealized PnL. A no-op on exchange
    /// adapters, which always read the live mark price straight from the
    /// account endpoint; only the paper ledger needs to be told.
    fn update_mark_price(&self, _symbol: &str, _price: f64) {}

    /// Close every paper position whose PnL% has crossed `threshold_pct`.
    /// A no-op on exchange adapters — real accounts carry no such sweep,
    /// they rely on the exchange's own take-profit order instead.
    fn sweep_auto_take_profit(&self, _threshold_pct: f64) -> Vec<String> {
        Vec::new()
    }
}

/// Two traders share an account when their equity is within one cent of
/// each other — the threshold the engine uses to avoid double-counting risk
/// across a copy-trading pair that actually settles against the same wallet.
pub fn detect_shared_account(a: &Balance, b: &Balance) -> bool {
    (a.equity() - b.equity()).abs() < 0.01
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_account_detected_within_one_cent() {
        let a = Balance { wallet_balance: 1000.0, unrealized_pnl: 5.004, available_balance: 900.0 };
        let b = Balance { wallet_balance: 1000.0, unrealized_pnl: 5.009, available_balance: 850.0 };
        assert!(detect_shared_account(&a, &b));
    }

    #[test]
    fn distinct_accounts_not_flagged() {
        let a = Balance { wallet_balance: 1000.0, unrealized_pnl: 0.0, available_balance: 900.0 };
        let b = Balance { wallet_balance: 1200.0, unrealized_pnl: 0.0, available_balance: 850.0 };
        assert!(!detect_shared_account(&a, &b));
    }

    #[test]
    fn pnl_pct_matches_leverage_scaled_formula() {
        let pos = PositionView {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            position_amt: 1.0,
            entry_price: 100.0,
            mark_price: 102.0,
            unrealized_pnl: 2.0,
            leverage: 10,
            isolated_margin: 10.0,
            take_profit_price: None,
        };
        // (2/100) * 10 * 100 = 20%
        assert!((pos.pnl_pct() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn pnl_pct_negated_for_short() {
        let pos = PositionView {
            symbol: "BTCUSDT".into(),
            side: Side::Short,
            position_amt: 1.0,
            entry_price: 100.0,
            mark_price: 102.0,
            unrealized_pnl: -2.0,
            leverage: 10,
            isolated_margin: 10.0,
            take_profit_price: None,
        };
        assert!((pos.pnl_pct() - (-20.0)).abs() < 1e-9);
    }
}
