// =============================================================================
// Decision types and validation
// =============================================================================

pub mod parser;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::types::Action;

/// One instruction the AI asked for, before or after execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub action: Action,
    pub leverage: Option<u32>,
    /// Margin in USDT, *not* notional.
    pub position_size_usd: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub confidence: Option<f64>,
    pub risk_usd: Option<f64>,
    pub reasoning: String,
}

impl Decision {
    pub fn wait(reasoning: impl Into<String>) -> Self {
        Self {
            symbol: "ALL".to_string(),
            action: Action::Wait,
            leverage: None,
            position_size_usd: None,
            stop_loss: None,
            take_profit: None,
            confidence: None,
            risk_usd: None,
            reasoning: reasoning.into(),
        }
    }
}

/// A decision after execution was attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedDecision {
    pub decision: Decision,
    pub order_id: Option<String>,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub success: bool,
    pub error: Option<String>,
}

/// Output of one call to the AI client (or copy-trading/consensus merge),
/// always containing at least one decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullDecision {
    pub user_prompt: String,
    pub cot_trace: String,
    pub decisions: Vec<Decision>,
    pub raw_response: String,
    pub timestamp: DateTime<Utc>,
    pub used_fallback: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountStateSnapshot {
    pub total_equity: f64,
    pub available_balance: f64,
    pub total_unrealized_profit: f64,
    pub position_count: u32,
    pub margin_used_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: crate::types::Side,
    pub entry_price: f64,
    pub mark_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub margin_used: f64,
}

/// One row per cycle, the unit the decision logger persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub trader_id: String,
    pub cycle_number: u64,
    pub timestamp: DateTime<Utc>,
    pub input_prompt: String,
    pub cot_trace: String,
    pub raw_response: String,
    pub decision_json: String,
    pub account_state: AccountStateSnapshot,
    pub positions: Vec<PositionSnapshot>,
    pub candidate_coins: Vec<String>,
    pub decisions: Vec<ExecutedDecision>,
    pub execution_log: Vec<String>,
    pub success: bool,
    pub error_message: Option<String>,
}

impl DecisionRecord {
    /// The cycle-0 seed row written at trader initialisation, so
    /// state-restoration scans know to skip it.
    pub fn seed(trader_id: impl Into<String>, account_state: AccountStateSnapshot) -> Self {
        Self {
            trader_id: trader_id.into(),
            cycle_number: 0,
            timestamp: Utc::now(),
            input_prompt: String::new(),
            cot_trace: String::new(),
            raw_response: String::new(),
            decision_json: "[]".to_string(),
            account_state,
            positions: Vec::new(),
            candidate_coins: Vec::new(),
            decisions: Vec::new(),
            execution_log: vec!["seed row at initialisation".to_string()],
            success: true,
            error_message: None,
        }
    }

    /// Synthesise a record for an out-of-cycle manual close, so performance
    /// analysis stays accurate between AI-driven cycles.
    pub fn manual_close(
        trader_id: impl Into<String>,
        cycle_number: u64,
        account_state: AccountStateSnapshot,
        positions: Vec<PositionSnapshot>,
        executed: ExecutedDecision,
    ) -> Self {
        Self {
            trader_id: trader_id.into(),
            cycle_number,
            timestamp: Utc::now(),
            input_prompt: String::new(),
            cot_trace: "Manual position close by user".to_string(),
            raw_response: String::new(),
            decision_json: "[]".to_string(),
            account_state,
            positions,
            candidate_coins: Vec::new(),
            decisions: vec![executed],
            execution_log: vec!["manual close via API".to_string()],
            success: true,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedTrade {
    pub symbol: String,
    pub side: crate::types::Side,
    pub open_price: f64,
    pub close_price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub duration_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceAnalysis {
    pub sharpe_ratio: f64,
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_factor: f64,
    pub recent_trades: Vec<CompletedTrade>,
    pub best_symbol: Option<String>,
    pub worst_symbol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggerStatistics {
    pub total_cycles: u64,
    pub wins: u32,
    pub losses: u32,
    pub avg_trade_duration_secs: f64,
}

// =============================================================================
// Validation — spec §4.6.4
// =============================================================================

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unrecognised action: {0}")]
    UnrecognisedAction(String),

    #[error("{symbol}: missing required field '{field}' for an open decision")]
    MissingField { symbol: String, field: &'static str },

    #[error("{symbol}: leverage {leverage} out of range [1, {cap}]")]
    LeverageOutOfRange { symbol: String, leverage: u32, cap: u32 },

    #[error("{symbol}: stop_loss/take_profit ordering invalid for {side}")]
    InvalidStopTakeProfitOrder { symbol: String, side: crate::types::Side },

    #[error("{symbol}: risk-reward {ratio:.2} below required 3:1")]
    RiskRewardTooLow { symbol: String, ratio: f64 },

    #[error("{symbol}: tighten stop or reduce leverage — allowed margin {allowed:.2} below minimum {minimum:.2}")]
    MarginBelowMinimum {
        symbol: String,
        allowed: f64,
        minimum: f64,
    },

    #[error("{symbol}: no live market price available")]
    NoMarketPrice { symbol: String },

    #[error("{symbol}: risk_per_unit must be positive")]
    NonPositiveRiskPerUnit { symbol: String },
}

pub struct ValidationContext<'a> {
    pub equity: f64,
    pub btc_eth_leverage_cap: u32,
    pub altcoin_leverage_cap: u32,
    pub engine: &'a EngineConfig,
    pub prices: &'a HashMap<String, f64>,
}

/// Validate (and, for risk-capped opens, adjust in place) one non-fallback
/// decision. Returns the possibly-adjusted decision or the first validation
/// error encountered.
pub fn validate_decision(
    mut decision: Decision,
    ctx: &ValidationContext,
) -> Result<Decision, ValidationError> {
    if !decision.action.is_open() {
        return Ok(decision);
    }

    let symbol = decision.symbol.clone();
    let side = decision
        .action
        .side()
        .expect("open actions always carry a side");

    let cap = if EngineConfig::is_btc_or_eth(&symbol) {
        ctx.btc_eth_leverage_cap
    } else {
        ctx.altcoin_leverage_cap
    };
    let leverage = decision.leverage.ok_or(ValidationError::MissingField {
        symbol: symbol.clone(),
        field: "leverage",
    })?;
    if leverage < 1 || leverage > cap {
        return Err(ValidationError::LeverageOutOfRange {
            symbol: symbol.clone(),
            leverage,
            cap,
        });
    }

    let position_size_usd = decision
        .position_size_usd
        .filter(|v| *v > 0.0)
        .ok_or(ValidationError::MissingField {
            symbol: symbol.clone(),
            field: "position_size_usd",
        })?;
    let sl = decision
        .stop_loss
        .filter(|v| *v > 0.0)
        .ok_or(ValidationError::MissingField {
            symbol: symbol.clone(),
            field: "stop_loss",
        })?;
    let tp = decision
        .take_profit
        .filter(|v| *v > 0.0)
        .ok_or(ValidationError::MissingField {
            symbol: symbol.clone(),
            field: "take_profit",
        })?;

    match side {
        crate::types::Side::Long if sl >= tp => {
            return Err(ValidationError::InvalidStopTakeProfitOrder {
                symbol: symbol.clone(),
                side,
            })
        }
        crate::types::Side::Short if sl <= tp => {
            return Err(ValidationError::InvalidStopTakeProfitOrder {
                symbol: symbol.clone(),
                side,
            })
        }
        _ => {}
    }

    // Risk-reward at an assumed entry 20% into the stop-to-tp range.
    let (entry, risk, reward) = match side {
        crate::types::Side::Long => {
            let range = tp - sl;
            let entry = sl + 0.2 * range;
            (entry, entry - sl, tp - entry)
        }
        crate::types::Side::Short => {
            let range = sl - tp;
            let entry = sl - 0.2 * range;
            (entry, sl - entry, entry - tp)
        }
    };
    let risk_pct = risk / entry;
    let reward_pct = reward / entry;
    let ratio = if risk_pct > 0.0 {
        reward_pct / risk_pct
    } else {
        0.0
    };
    if ratio < ctx.engine.min_risk_reward {
        return Err(ValidationError::RiskRewardTooLow {
            symbol: symbol.clone(),
            ratio,
        });
    }

    // Risk-cap enforcement against the live market price.
    let price = *ctx
        .prices
        .get(&symbol)
        .ok_or_else(|| ValidationError::NoMarketPrice {
            symbol: symbol.clone(),
        })?;
    let risk_per_unit = match side {
        crate::types::Side::Long => price - sl,
        crate::types::Side::Short => sl - price,
    };
    if risk_per_unit <= 0.0 {
        return Err(ValidationError::NonPositiveRiskPerUnit {
            symbol: symbol.clone(),
        });
    }
    let max_risk_usd = ctx.equity * ctx.engine.max_single_trade_risk_pct;
    let allowed_margin = (max_risk_usd * price) / (risk_per_unit * leverage as f64);
    let min_margin = ctx.engine.min_margin(&symbol, ctx.equity);
    if allowed_margin < min_margin {
        return Err(ValidationError::MarginBelowMinimum {
            symbol: symbol.clone(),
            allowed: allowed_margin,
            minimum: min_margin,
        });
    }
    let mut capped = position_size_usd.min(allowed_margin);
    if capped < min_margin {
        capped = min_margin;
    }

    let max_margin = ctx.engine.max_margin(&symbol, ctx.equity);
    capped = capped.min(max_margin);

    decision.position_size_usd = Some(capped);
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx<'a>(equity: f64, prices: &'a HashMap<String, f64>, engine: &'a EngineConfig) -> ValidationContext<'a> {
        ValidationContext {
            equity,
            btc_eth_leverage_cap: 20,
            altcoin_leverage_cap: 10,
            engine,
            prices,
        }
    }

    #[test]
    fn rejects_leverage_above_cap() {
        let engine = EngineConfig::default();
        let prices = HashMap::from([("ADAUSDT".to_string(), 1.0)]);
        let decision = Decision {
            symbol: "ADAUSDT".to_string(),
            action: Action::OpenLong,
            leverage: Some(15),
            position_size_usd: Some(20.0),
            stop_loss: Some(0.9),
            take_profit: Some(1.5),
            confidence: None,
            risk_usd: None,
            reasoning: String::new(),
        };
        let err = validate_decision(decision, &ctx(1000.0, &prices, &engine)).unwrap_err();
        assert!(matches!(err, ValidationError::LeverageOutOfRange { .. }));
    }

    #[test]
    fn risk_cap_bites_per_spec_example() {
        // equity=100, leverage=10, margin=30, sl=0.95*P, tp=1.20*P
        let engine = EngineConfig::default();
        let price = 100.0;
        let prices = HashMap::from([("ADAUSDT".to_string(), price)]);
        let decision = Decision {
            symbol: "ADAUSDT".to_string(),
            action: Action::OpenLong,
            leverage: Some(10),
            position_size_usd: Some(30.0),
            stop_loss: Some(0.95 * price),
            take_profit: Some(1.20 * price),
            confidence: None,
            risk_usd: None,
            reasoning: String::new(),
        };
        let err = validate_decision(decision, &ctx(100.0, &prices, &engine)).unwrap_err();
        match err {
            ValidationError::MarginBelowMinimum { allowed, minimum, .. } => {
                assert!((allowed - 4.0).abs() < 0.05);
                assert!((minimum - 15.0).abs() < 1e-9);
            }
            other => panic!("expected MarginBelowMinimum, got {other:?}"),
        }
    }

    #[test]
    fn accepts_well_formed_open_and_caps_margin() {
        let engine = EngineConfig::default();
        let price = 100.0;
        let prices = HashMap::from([("ADAUSDT".to_string(), price)]);
        let decision = Decision {
            symbol: "ADAUSDT".to_string(),
            action: Action::OpenLong,
            leverage: Some(5),
            position_size_usd: Some(5000.0),
            stop_loss: Some(90.0),
            take_profit: Some(150.0),
            confidence: None,
            risk_usd: None,
            reasoning: String::new(),
        };
        let adjusted = validate_decision(decision, &ctx(10_000.0, &prices, &engine)).unwrap();
        // margin must never exceed the 40% altcoin hard cap of equity.
        assert!(adjusted.position_size_usd.unwrap() <= 0.40 * 10_000.0 + 1e-9);
    }

    #[test]
    fn hold_and_wait_pass_through_untouched() {
        let engine = EngineConfig::default();
        let prices = HashMap::new();
        let decision = Decision::wait("nothing to do");
        let out = validate_decision(decision.clone(), &ctx(100.0, &prices, &engine)).unwrap();
        assert_eq!(out.action, decision.action);
    }
}
