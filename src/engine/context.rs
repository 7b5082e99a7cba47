// =============================================================================
// Context builder — per-cycle snapshot fed to the prompt builder
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::decision::PerformanceAnalysis;
use crate::market::{Candidate, MarketSnapshot};
use crate::trader::{Balance, PositionView};
use crate::types::{MarketRegime, Side};

#[derive(Debug, Clone, Serialize)]
pub struct AccountContext {
    pub equity: f64,
    pub wallet: f64,
    pub available: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub margin_used: f64,
    pub margin_used_pct: f64,
    pub position_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionContext {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub mark_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub holding_duration_secs: i64,
}

/// Everything the prompt builder needs, assembled once per cycle.
#[derive(Debug, Clone, Serialize)]
pub struct Context {
    pub current_time: DateTime<Utc>,
    pub runtime_minutes: i64,
    pub call_count: u64,
    pub account: AccountContext,
    pub positions: Vec<PositionContext>,
    pub candidate_coins: Vec<Candidate>,
    pub market_data_map: HashMap<String, MarketSnapshot>,
    pub performance: PerformanceAnalysis,
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
    pub regime: MarketRegime,
}

/// first_seen_ts lookup, keyed `"SYMBOL_SIDE"`, used to compute holding
/// duration for the per-position prompt block.
pub type FirstSeenMap = HashMap<String, DateTime<Utc>>;

#[allow(clippy::too_many_arguments)]
pub fn build_context(
    now: DateTime<Utc>,
    started_at: DateTime<Utc>,
    call_count: u64,
    initial_balance: f64,
    balance: &Balance,
    positions: &[PositionView],
    first_seen: &FirstSeenMap,
    candidate_coins: Vec<Candidate>,
    market_data_map: HashMap<String, MarketSnapshot>,
    performance: PerformanceAnalysis,
    btc_eth_leverage: u32,
    altcoin_leverage: u32,
    btc_change_1h_pct: f64,
    btc_change_4h_pct: f64,
) -> Context {
    let equity = balance.equity();
    let total_pnl = equity - initial_balance;
    let total_pnl_pct = if initial_balance > 0.0 {
        (total_pnl / initial_balance) * 100.0
    } else {
        0.0
    };
    let margin_used = equity - balance.available_balance;
    let margin_used_pct = if equity > 0.0 {
        (margin_used / equity) * 100.0
    } else {
        0.0
    };

    let account = AccountContext {
        equity,
        wallet: balance.wallet_balance,
        available: balance.available_balance,
        total_pnl,
        total_pnl_pct,
        margin_used,
        margin_used_pct,
        position_count: positions.len() as u32,
    };

    let position_contexts = positions
        .iter()
        .map(|p| {
            let key = format!("{}_{}", p.symbol, p.side.to_string().to_uppercase());
            let holding_duration_secs = first_seen
                .get(&key)
                .map(|ts| (now - *ts).num_seconds())
                .unwrap_or(0);
            PositionContext {
                symbol: p.symbol.clone(),
                side: p.side,
                entry_price: p.entry_price,
                mark_price: p.mark_price,
                quantity: p.position_amt.abs(),
                leverage: p.leverage,
                unrealized_pnl: p.unrealized_pnl,
                unrealized_pnl_pct: p.pnl_pct(),
                holding_duration_secs,
            }
        })
        .collect();

    Context {
        current_time: now,
        runtime_minutes: (now - started_at).num_minutes(),
        call_count,
        account,
        positions: position_contexts,
        candidate_coins,
        market_data_map,
        performance,
        btc_eth_leverage,
        altcoin_leverage,
        regime: MarketRegime::classify(btc_change_1h_pct, btc_change_4h_pct),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::PerformanceAnalysis;

    fn empty_performance() -> PerformanceAnalysis {
        PerformanceAnalysis {
            sharpe_ratio: 0.0,
            total_trades: 0,
            wins: 0,
            losses: 0,
            win_rate: 0.0,
            avg_win: 0.0,
            avg_loss: 0.0,
            profit_factor: 0.0,
            recent_trades: Vec::new(),
            best_symbol: None,
            worst_symbol: None,
        }
    }

    #[test]
    fn account_context_computes_pnl_and_margin() {
        let now = Utc::now();
        let balance = Balance {
            wallet_balance: 900.0,
            unrealized_pnl: 50.0,
            available_balance: 700.0,
        };
        let ctx = build_context(
            now,
            now,
            1,
            1000.0,
            &balance,
            &[],
            &FirstSeenMap::new(),
            Vec::new(),
            HashMap::new(),
            empty_performance(),
            20,
            10,
            0.0,
            0.0,
        );
        assert!((ctx.account.equity - 950.0).abs() < 1e-9);
        assert!((ctx.account.total_pnl - (-50.0)).abs() < 1e-9);
        assert!((ctx.account.margin_used - 250.0).abs() < 1e-9);
        assert_eq!(ctx.regime, MarketRegime::Neutral);
    }
}
