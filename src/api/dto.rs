// =============================================================================
// Response DTOs — the shapes the REST layer actually serialises
// =============================================================================
//
// Kept separate from the domain types in `decision`/`trader` so an API
// consumer's view can diverge from the internal record shape without
// touching the engine.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::decision::{DecisionRecord, ExecutedDecision, LoggerStatistics, PerformanceAnalysis};
use crate::trader::PositionView;
use crate::types::TraderState;

#[derive(Debug, Clone, Serialize)]
pub struct TraderSummary {
    pub trader_id: String,
    pub trader_name: String,
    pub ai_model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraderStatus {
    pub trader_id: String,
    pub state: TraderState,
    pub daily_pnl: f64,
    pub call_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountDto {
    pub trader_id: String,
    pub total_equity: f64,
    pub available_balance: f64,
    pub total_unrealized_profit: f64,
    pub position_count: u32,
    pub margin_used_pct: f64,
    /// `true` when this account is proportionally scaled because it shares
    /// an exchange account with one or more other traders.
    pub shared: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionsDto {
    pub trader_id: String,
    pub positions: Vec<PositionView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompetitionEntry {
    pub trader_id: String,
    pub trader_name: String,
    pub ai_model: String,
    pub equity: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub win_rate: f64,
    pub total_trades: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioEntry {
    pub trader_id: String,
    pub equity: f64,
    pub total_pnl: f64,
    pub shared: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioDto {
    pub traders: Vec<PortfolioEntry>,
    pub total_equity: f64,
    pub total_pnl: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EquityPoint {
    pub cycle_number: u64,
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub pnl_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradingSignalDto {
    pub trader_id: String,
    pub cycle_number: u64,
    pub timestamp: DateTime<Utc>,
    pub cot_trace: String,
    pub decisions: Vec<ExecutedDecision>,
    pub account_state: crate::decision::AccountStateSnapshot,
}

impl TradingSignalDto {
    pub fn from_record(record: &DecisionRecord) -> Self {
        Self {
            trader_id: record.trader_id.clone(),
            cycle_number: record.cycle_number,
            timestamp: record.timestamp,
            cot_trace: record.cot_trace.clone(),
            decisions: record.decisions.clone(),
            account_state: record.account_state,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatisticsDto {
    #[serde(flatten)]
    pub stats: LoggerStatistics,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceDto {
    #[serde(flatten)]
    pub analysis: PerformanceAnalysis,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}
