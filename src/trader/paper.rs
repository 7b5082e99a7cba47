// =============================================================================
// PaperTrader — in-memory simulated ledger
// =============================================================================
//
// Mirrors the shape of the teacher's in-process position manager: a single
// RwLock guarding a Vec of open positions, with snapshot-style getters for
// everything the engine reads. Fills are immediate at the supplied mark
// price; there is no slippage model because the spec treats paper trading
// as a bookkeeping exercise, not a market simulator.
// =============================================================================

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Balance, OrderOutcome, PositionView, Trader, TraderError};
use crate::types::Side;

struct PaperPosition {
    symbol: String,
    side: Side,
    quantity: f64,
    entry_price: f64,
    leverage: u32,
    take_profit_price: Option<f64>,
}

/// Simulated futures account. `mark_prices` must be refreshed by the caller
/// (normally the cycle engine, right after it fetches the market snapshot)
/// before `balance()`/`positions()` are read, otherwise unrealized PnL is
/// computed against stale prices.
pub struct PaperTrader {
    trader_id: String,
    wallet_balance: RwLock<f64>,
    positions: RwLock<Vec<PaperPosition>>,
    mark_prices: RwLock<std::collections::HashMap<String, f64>>,
    lot_step: f64,
}

impl PaperTrader {
    pub fn new(trader_id: impl Into<String>, initial_balance: f64) -> Self {
        Self {
            trader_id: trader_id.into(),
            wallet_balance: RwLock::new(initial_balance),
            positions: RwLock::new(Vec::new()),
            mark_prices: RwLock::new(std::collections::HashMap::new()),
            lot_step: 0.001,
        }
    }

    pub fn update_mark_price(&self, symbol: &str, price: f64) {
        self.mark_prices.write().insert(symbol.to_string(), price);
    }

    fn mark_price(&self, symbol: &str, fallback: f64) -> f64 {
        self.mark_prices
            .read()
            .get(symbol)
            .copied()
            .unwrap_or(fallback)
    }

    fn unrealized_pnl_total(&self) -> f64 {
        self.positions
            .read()
            .iter()
            .map(|p| {
                let mark = self.mark_price(&p.symbol, p.entry_price);
                (mark - p.entry_price) * p.side.direction() * p.quantity
            })
            .sum()
    }

    /// Sweep every open position against its configured auto take-profit
    /// threshold and close any that have crossed it. Paper-only — live
    /// accounts rely on the exchange's own TP order instead.
    pub fn sweep_auto_take_profit(&self, threshold_pct: f64) -> Vec<String> {
        if threshold_pct <= 0.0 {
            return Vec::new();
        }
        let to_close: Vec<(String, Side)> = self
            .positions
            .read()
            .iter()
            .filter_map(|p| {
                let mark = self.mark_price(&p.symbol, p.entry_price);
                let pnl_pct = ((mark - p.entry_price) * p.side.direction() / p.entry_price)
                    * p.leverage as f64
                    * 100.0;
                if pnl_pct >= threshold_pct {
                    Some((p.symbol.clone(), p.side))
                } else {
                    None
                }
            })
            .collect();

        let mut closed = Vec::new();
        for (symbol, side) in to_close {
            let result = match side {
                Side::Long => self.close_position_sync(&symbol, Side::Long),
                Side::Short => self.close_position_sync(&symbol, Side::Short),
            };
            if result.is_ok() {
                closed.push(symbol);
            }
        }
        closed
    }

    fn close_position_sync(&self, symbol: &str, side: Side) -> Result<(), TraderError> {
        let mut positions = self.positions.write();
        let idx = positions
            .iter()
            .position(|p| p.symbol == symbol && p.side == side)
            .ok_or(TraderError::AlreadyClosed)?;
        let pos = positions.remove(idx);
        let mark = self.mark_price(&pos.symbol, pos.entry_price);
        let realized = (mark - pos.entry_price) * pos.side.direction() * pos.quantity;
        drop(positions);
        *self.wallet_balance.write() += realized;
        Ok(())
    }
}

#[async_trait]
impl Trader for PaperTrader {
    fn trader_id(&self) -> &str {
        &self.trader_id
    }

    async fn balance(&self) -> Result<Balance, TraderError> {
        let wallet = *self.wallet_balance.read();
        let unrealized = self.unrealized_pnl_total();
        Ok(Balance {
            wallet_balance: wallet,
            unrealized_pnl: unrealized,
            available_balance: wallet,
        })
    }

    async fn positions(&self) -> Result<Vec<PositionView>, TraderError> {
        let positions = self.positions.read();
        Ok(positions
            .iter()
            .map(|p| {
                let mark = self.mark_price(&p.symbol, p.entry_price);
                let unrealized = (mark - p.entry_price) * p.side.direction() * p.quantity;
                PositionView {
                    symbol: p.symbol.clone(),
                    side: p.side,
                    position_amt: p.quantity * p.side.direction(),
                    entry_price: p.entry_price,
                    mark_price: mark,
                    unrealized_pnl: unrealized,
                    leverage: p.leverage,
                    isolated_margin: (p.quantity * p.entry_price) / p.leverage.max(1) as f64,
                    take_profit_price: p.take_profit_price,
                }
            })
            .collect())
    }

    async fn open_long(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderOutcome, TraderError> {
        let entry = self.mark_price(symbol, 0.0);
        if entry <= 0.0 {
            return Ok(OrderOutcome::Rejected {
                reason: "no mark price available for symbol".to_string(),
            });
        }
        self.positions.write().push(PaperPosition {
            symbol: symbol.to_string(),
            side: Side::Long,
            quantity,
            entry_price: entry,
            leverage,
            take_profit_price: None,
        });
        Ok(OrderOutcome::Filled {
            order_id: uuid::Uuid::new_v4().to_string(),
            filled_qty: quantity,
            avg_price: entry,
        })
    }

    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderOutcome, TraderError> {
        let entry = self.mark_price(symbol, 0.0);
        if entry <= 0.0 {
            return Ok(OrderOutcome::Rejected {
                reason: "no mark price available for symbol".to_string(),
            });
        }
        self.positions.write().push(PaperPosition {
            symbol: symbol.to_string(),
            side: Side::Short,
            quantity,
            entry_price: entry,
            leverage,
            take_profit_price: None,
        });
        Ok(OrderOutcome::Filled {
            order_id: uuid::Uuid::new_v4().to_string(),
            filled_qty: quantity,
            avg_price: entry,
        })
    }

    async fn close_long(&self, symbol: &str) -> Result<OrderOutcome, TraderError> {
        let mark = self.mark_price(symbol, 0.0);
        self.close_position_sync(symbol, Side::Long)?;
        Ok(OrderOutcome::Filled {
            order_id: uuid::Uuid::new_v4().to_string(),
            filled_qty: 0.0,
            avg_price: mark,
        })
    }

    async fn close_short(&self, symbol: &str) -> Result<OrderOutcome, TraderError> {
        let mark = self.mark_price(symbol, 0.0);
        self.close_position_sync(symbol, Side::Short)?;
        Ok(OrderOutcome::Filled {
            order_id: uuid::Uuid::new_v4().to_string(),
            filled_qty: 0.0,
            avg_price: mark,
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), TraderError> {
        let mut positions = self.positions.write();
        for p in positions.iter_mut().filter(|p| p.symbol == symbol) {
            p.leverage = leverage;
        }
        Ok(())
    }

    async fn set_stop_loss(&self, _symbol: &str, _stop_price: f64) -> Result<(), TraderError> {
        Ok(())
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        take_profit_price: f64,
    ) -> Result<(), TraderError> {
        let mut positions = self.positions.write();
        for p in positions.iter_mut().filter(|p| p.symbol == symbol) {
            p.take_profit_price = Some(take_profit_price);
        }
        Ok(())
    }

    async fn cancel_all(&self, _symbol: &str) -> Result<(), TraderError> {
        Ok(())
    }

    fn format_quantity(&self, _symbol: &str, quantity: f64) -> f64 {
        (quantity / self.lot_step).floor() * self.lot_step
    }

    fn update_mark_price(&self, symbol: &str, price: f64) {
        PaperTrader::update_mark_price(self, symbol, price);
    }

    fn sweep_auto_take_profit(&self, threshold_pct: f64) -> Vec<String> {
        PaperTrader::sweep_auto_take_profit(self, threshold_pct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_then_close_long_realises_pnl() {
        let trader = PaperTrader::new("t1", 1000.0);
        trader.update_mark_price("BTCUSDT", 100.0);
        trader.open_long("BTCUSDT", 1.0, 10).await.unwrap();
        trader.update_mark_price("BTCUSDT", 110.0);

        let positions = trader.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].unrealized_pnl - 10.0).abs() < 1e-9);

        trader.close_long("BTCUSDT").await.unwrap();
        let balance = trader.balance().await.unwrap();
        assert!((balance.wallet_balance - 1010.0).abs() < 1e-9);
        assert!(trader.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_take_profit_sweep_closes_crossed_positions() {
        let trader = PaperTrader::new("t1", 1000.0);
        trader.update_mark_price("ETHUSDT", 100.0);
        trader.open_long("ETHUSDT", 1.0, 10).await.unwrap();
        trader.update_mark_price("ETHUSDT", 105.0); // pnl_pct = 50%

        let closed = trader.sweep_auto_take_profit(4.5);
        assert_eq!(closed, vec!["ETHUSDT".to_string()]);
        assert!(trader.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_already_closed_position_errors() {
        let trader = PaperTrader::new("t1", 1000.0);
        let err = trader.close_long("DOESNOTEXIST").await.unwrap_err();
        assert!(matches!(err, TraderError::AlreadyClosed));
    }
}
