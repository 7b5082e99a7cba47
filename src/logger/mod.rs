// =============================================================================
// Decision logger — append-only record store + performance analysis
// =============================================================================

pub mod sled_store;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::decision::{CompletedTrade, DecisionRecord, LoggerStatistics, PerformanceAnalysis};
use crate::types::{Action, Side};

pub use sled_store::SledDecisionStore;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Backing store abstraction — a local embedded database or a remote row
/// store are both valid implementations of this exact interface.
pub trait DecisionLogger: Send + Sync {
    fn log_decision(&self, record: DecisionRecord) -> Result<u64, LoggerError>;
    fn write_seed(&self, record: DecisionRecord) -> Result<(), LoggerError>;
    fn get_latest_records(&self, n: usize) -> Result<Vec<DecisionRecord>, LoggerError>;
    fn get_all_records(&self) -> Result<Vec<DecisionRecord>, LoggerError>;
    fn get_first_record(&self) -> Result<Option<DecisionRecord>, LoggerError>;

    fn get_statistics(&self) -> Result<LoggerStatistics, LoggerError> {
        let all = self.get_all_records()?;
        let real_cycles = all.iter().filter(|r| r.cycle_number != 0).count() as u64;
        let analysis = analyse(&all, 0);
        let avg_trade_duration_secs = if analysis.recent_trades.is_empty() {
            0.0
        } else {
            analysis
                .recent_trades
                .iter()
                .map(|t| t.duration_secs as f64)
                .sum::<f64>()
                / analysis.recent_trades.len() as f64
        };
        Ok(LoggerStatistics {
            total_cycles: real_cycles,
            wins: analysis.wins,
            losses: analysis.losses,
            avg_trade_duration_secs,
        })
    }

    fn analyse_performance(&self, lookback: usize) -> Result<PerformanceAnalysis, LoggerError> {
        let all = self.get_all_records()?;
        Ok(analyse(&all, lookback))
    }
}

struct OpenLeg {
    price: f64,
    timestamp: DateTime<Utc>,
    quantity: f64,
}

/// Pair opens with closes in chronological order and derive aggregate
/// statistics. Shared by every `DecisionLogger` implementation via the
/// trait's default methods.
fn analyse(all_records: &[DecisionRecord], lookback: usize) -> PerformanceAnalysis {
    let non_seed: Vec<&DecisionRecord> = all_records.iter().filter(|r| r.cycle_number != 0).collect();
    let records: Vec<&&DecisionRecord> = if lookback == 0 {
        non_seed.iter().collect()
    } else {
        let skip = non_seed.len().saturating_sub(lookback);
        non_seed.iter().skip(skip).collect()
    };

    let mut open_stacks: std::collections::HashMap<(String, Side), VecDeque<OpenLeg>> =
        std::collections::HashMap::new();
    let mut trades: Vec<CompletedTrade> = Vec::new();
    let mut pnl_by_symbol: std::collections::HashMap<String, f64> = std::collections::HashMap::new();

    for record in records {
        for ed in &record.decisions {
            if !ed.success {
                continue;
            }
            let Some(side) = ed.decision.action.side() else {
                continue;
            };
            let key = (ed.decision.symbol.clone(), side);
            match ed.decision.action {
                Action::OpenLong | Action::OpenShort => {
                    if let Some(price) = ed.price {
                        open_stacks.entry(key).or_default().push_back(OpenLeg {
                            price,
                            timestamp: record.timestamp,
                            quantity: ed.quantity.unwrap_or(0.0),
                        });
                    }
                }
                Action::CloseLong | Action::CloseShort => {
                    if let (Some(close_price), Some(stack)) = (ed.price, open_stacks.get_mut(&key)) {
                        if let Some(leg) = stack.pop_front() {
                            let direction = side.direction();
                            let pnl = (close_price - leg.price) * direction * leg.quantity;
                            let pnl_pct = if leg.price > 0.0 {
                                ((close_price - leg.price) / leg.price) * direction * 100.0
                            } else {
                                0.0
                            };
                            let duration_secs = (record.timestamp - leg.timestamp).num_seconds();
                            *pnl_by_symbol.entry(ed.decision.symbol.clone()).or_insert(0.0) += pnl;
                            trades.push(CompletedTrade {
                                symbol: ed.decision.symbol.clone(),
                                side,
                                open_price: leg.price,
                                close_price,
                                pnl,
                                pnl_pct,
                                duration_secs,
                            });
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let total_trades = trades.len() as u32;
    let wins = trades.iter().filter(|t| t.pnl > 0.0).count() as u32;
    let losses = trades.iter().filter(|t| t.pnl <= 0.0).count() as u32;
    let win_rate = if total_trades > 0 {
        wins as f64 / total_trades as f64
    } else {
        0.0
    };

    let gross_win: f64 = trades.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).sum();
    let gross_loss: f64 = trades.iter().filter(|t| t.pnl <= 0.0).map(|t| t.pnl).sum();
    let avg_win = if wins > 0 { gross_win / wins as f64 } else { 0.0 };
    let avg_loss = if losses > 0 { gross_loss / losses as f64 } else { 0.0 };
    let profit_factor = if gross_loss.abs() > 0.0 {
        gross_win / gross_loss.abs()
    } else if gross_win > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let returns: Vec<f64> = trades.iter().map(|t| t.pnl_pct).collect();
    let sharpe_ratio = sharpe(&returns);

    let best_symbol = pnl_by_symbol
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(s, _)| s.clone());
    let worst_symbol = pnl_by_symbol
        .iter()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(s, _)| s.clone());

    let recent_trades: Vec<CompletedTrade> = trades
        .iter()
        .rev()
        .take(10)
        .rev()
        .cloned()
        .collect();

    PerformanceAnalysis {
        sharpe_ratio,
        total_trades,
        wins,
        losses,
        win_rate,
        avg_win,
        avg_loss,
        profit_factor,
        recent_trades,
        best_symbol,
        worst_symbol,
    }
}

fn sharpe(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    let stdev = variance.sqrt();
    if stdev == 0.0 {
        0.0
    } else {
        mean / stdev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{AccountStateSnapshot, Decision, ExecutedDecision};

    fn record(cycle: u64, ts: DateTime<Utc>, decisions: Vec<ExecutedDecision>) -> DecisionRecord {
        DecisionRecord {
            trader_id: "t1".to_string(),
            cycle_number: cycle,
            timestamp: ts,
            input_prompt: String::new(),
            cot_trace: String::new(),
            raw_response: String::new(),
            decision_json: "[]".to_string(),
            account_state: AccountStateSnapshot {
                total_equity: 1000.0,
                available_balance: 900.0,
                total_unrealized_profit: 0.0,
                position_count: 0,
                margin_used_pct: 0.0,
            },
            positions: Vec::new(),
            candidate_coins: Vec::new(),
            decisions,
            execution_log: Vec::new(),
            success: true,
            error_message: None,
        }
    }

    fn executed(symbol: &str, action: Action, price: f64, qty: f64) -> ExecutedDecision {
        ExecutedDecision {
            decision: Decision {
                symbol: symbol.to_string(),
                action,
                leverage: Some(10),
                position_size_usd: Some(100.0),
                stop_loss: None,
                take_profit: None,
                confidence: None,
                risk_usd: None,
                reasoning: String::new(),
            },
            order_id: Some("o1".to_string()),
            quantity: Some(qty),
            price: Some(price),
            success: true,
            error: None,
        }
    }

    #[test]
    fn pairs_open_and_close_into_a_completed_trade() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::minutes(30);
        let records = vec![
            record(0, t0 - chrono::Duration::minutes(1), Vec::new()), // seed, excluded
            record(1, t0, vec![executed("BTCUSDT", Action::OpenLong, 100.0, 1.0)]),
            record(2, t1, vec![executed("BTCUSDT", Action::CloseLong, 110.0, 1.0)]),
        ];
        let analysis = analyse(&records, 0);
        assert_eq!(analysis.total_trades, 1);
        assert_eq!(analysis.wins, 1);
        assert!((analysis.recent_trades[0].pnl - 10.0).abs() < 1e-9);
        assert_eq!(analysis.recent_trades[0].duration_secs, 1800);
    }

    #[test]
    fn seed_row_excluded_from_analysis() {
        let t0 = Utc::now();
        let records = vec![record(0, t0, vec![executed("ETHUSDT", Action::OpenLong, 100.0, 1.0)])];
        let analysis = analyse(&records, 0);
        assert_eq!(analysis.total_trades, 0);
    }

    #[test]
    fn lookback_limits_to_most_recent_records() {
        let t0 = Utc::now();
        let mut records = vec![record(0, t0, Vec::new())];
        for i in 1..=5u64 {
            let ts = t0 + chrono::Duration::minutes(i as i64 * 10);
            records.push(record(
                i,
                ts,
                vec![executed("BTCUSDT", Action::OpenLong, 100.0, 1.0)],
            ));
        }
        let analysis = analyse(&records, 2);
        // only the last two open-only records are considered; no closes pair, so 0 trades.
        assert_eq!(analysis.total_trades, 0);
    }

    #[test]
    fn short_trade_pnl_is_direction_aware() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::minutes(5);
        let records = vec![
            record(1, t0, vec![executed("BTCUSDT", Action::OpenShort, 100.0, 1.0)]),
            record(2, t1, vec![executed("BTCUSDT", Action::CloseShort, 90.0, 1.0)]),
        ];
        let analysis = analyse(&records, 0);
        assert_eq!(analysis.total_trades, 1);
        assert!((analysis.recent_trades[0].pnl - 10.0).abs() < 1e-9);
    }
}
