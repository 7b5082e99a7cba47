// =============================================================================
// REST API — Axum 0.7
// =============================================================================
//
// Every route is read-only except the two position-closing actions. There is
// no authentication boundary and CORS is permissive, matching a development
// deployment rather than a gated one.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{StatusCode, Uri},
    response::IntoResponse,
    routing::{any, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::decision::{
    AccountStateSnapshot, Decision, DecisionRecord, ExecutedDecision, PositionSnapshot,
};
use crate::engine::TraderEngine;
use crate::registry::TraderRegistry;
use crate::trader::{OrderOutcome, TraderError};
use crate::types::{Action, Side};

use super::dto::{
    AccountDto, CompetitionEntry, EquityPoint, ErrorResponse, PerformanceDto, PortfolioDto,
    PortfolioEntry, PositionsDto, StatisticsDto, TradingSignalDto, TraderStatus, TraderSummary,
};

#[derive(Clone)]
pub struct ApiState {
    pub registry: TraderRegistry,
}

pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", any(health))
        .route("/api/competition", get(competition))
        .route("/api/portfolio", get(portfolio))
        .route("/api/traders", get(traders))
        .route("/api/status", get(status))
        .route("/api/account", get(account))
        .route("/api/positions", get(positions))
        .route("/api/decisions", get(decisions))
        .route("/api/decisions/latest", get(decisions_latest))
        .route("/api/statistics", get(statistics))
        .route("/api/equity-history", get(equity_history))
        .route("/api/performance", get(performance))
        .route("/api/trading-signal", get(trading_signal))
        .route("/api/positions/close", post(close_position))
        .route("/api/positions/force-close", post(force_close_position))
        .fallback(not_found_fallback)
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error plumbing — every handler funnels failures through this
// =============================================================================

enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

async fn not_found_fallback(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new(format!("no route for {uri}"))),
    )
}

fn require_trader(state: &ApiState, trader_id: &Option<String>) -> Result<Arc<TraderEngine>, ApiError> {
    let id = trader_id
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("missing required query parameter 'trader_id'".to_string()))?;
    state
        .registry
        .get_trader(id)
        .ok_or_else(|| ApiError::NotFound(format!("unknown trader_id '{id}'")))
}

// =============================================================================
// Query parameter shapes
// =============================================================================

#[derive(Deserialize)]
struct TraderIdQuery {
    trader_id: Option<String>,
}

#[derive(Deserialize)]
struct EquityHistoryQuery {
    trader_id: Option<String>,
    #[serde(rename = "startCycle")]
    start_cycle: Option<u64>,
}

#[derive(Deserialize)]
struct TradingSignalQuery {
    trader_id: Option<String>,
    model: Option<String>,
}

// =============================================================================
// Health
// =============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "time": Utc::now().timestamp_millis() }))
}

// =============================================================================
// Fleet-wide views
// =============================================================================

async fn traders(State(state): State<Arc<ApiState>>) -> Json<Vec<TraderSummary>> {
    let out = state
        .registry
        .get_all_traders()
        .into_iter()
        .map(|t| {
            let cfg = t.config();
            TraderSummary {
                trader_id: cfg.trader_id,
                trader_name: cfg.trader_name,
                ai_model: cfg.ai_model,
            }
        })
        .collect();
    Json(out)
}

async fn competition(State(state): State<Arc<ApiState>>) -> Json<Vec<CompetitionEntry>> {
    let mut out = Vec::new();
    for engine in state.registry.get_all_traders() {
        let cfg = engine.config();
        let equity = engine
            .trader()
            .balance()
            .await
            .map(|b| b.equity())
            .unwrap_or_else(|_| engine.initial_balance());
        let initial = engine.initial_balance();
        let total_pnl = equity - initial;
        let total_pnl_pct = if initial > 0.0 { (total_pnl / initial) * 100.0 } else { 0.0 };
        let (win_rate, total_trades) = match engine.logger().analyse_performance(0) {
            Ok(p) => (p.win_rate, p.total_trades),
            Err(_) => (0.0, 0),
        };
        out.push(CompetitionEntry {
            trader_id: cfg.trader_id,
            trader_name: cfg.trader_name,
            ai_model: cfg.ai_model,
            equity,
            total_pnl,
            total_pnl_pct,
            win_rate,
            total_trades,
        });
    }
    out.sort_by(|a, b| b.total_pnl.partial_cmp(&a.total_pnl).unwrap_or(std::cmp::Ordering::Equal));
    Json(out)
}

/// Shared-account view for one trader: the live equity/available/unrealized
/// figures scaled by `own_initial_balance / Σ(initial_balances)` across every
/// other trader whose raw equity is within 0.01 USDT of this one's.
async fn account_dto_for(target: &Arc<TraderEngine>, all: &[Arc<TraderEngine>]) -> Result<AccountDto, ApiError> {
    let balance = target
        .trader()
        .balance()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let mut group: Vec<(String, f64)> = vec![(target.trader_id.clone(), target.initial_balance())];
    for other in all {
        if other.trader_id == target.trader_id {
            continue;
        }
        if let Ok(other_balance) = other.trader().balance().await {
            if (other_balance.equity() - balance.equity()).abs() < 0.01 {
                group.push((other.trader_id.clone(), other.initial_balance()));
            }
        }
    }

    let shared = group.len() > 1;
    let (equity, available, unrealized) = if shared {
        let sum_initial: f64 = group.iter().map(|(_, init)| init).sum();
        let ratio = if sum_initial > 0.0 {
            target.initial_balance() / sum_initial
        } else {
            1.0
        };
        (
            balance.equity() * ratio,
            balance.available_balance * ratio,
            balance.unrealized_pnl * ratio,
        )
    } else {
        (balance.equity(), balance.available_balance, balance.unrealized_pnl)
    };

    let margin_used = equity - available;
    let margin_used_pct = if equity > 0.0 { (margin_used / equity) * 100.0 } else { 0.0 };
    let position_count = target.trader().positions().await.map(|p| p.len() as u32).unwrap_or(0);

    Ok(AccountDto {
        trader_id: target.trader_id.clone(),
        total_equity: equity,
        available_balance: available,
        total_unrealized_profit: unrealized,
        position_count,
        margin_used_pct,
        shared,
    })
}

async fn portfolio(State(state): State<Arc<ApiState>>) -> Result<Json<PortfolioDto>, ApiError> {
    let all = state.registry.get_all_traders();
    let mut entries = Vec::with_capacity(all.len());
    let mut total_equity = 0.0;
    let mut total_pnl = 0.0;

    for engine in &all {
        let dto = account_dto_for(engine, &all).await?;
        let pnl = dto.total_equity - engine.initial_balance();
        total_equity += dto.total_equity;
        total_pnl += pnl;
        entries.push(PortfolioEntry {
            trader_id: dto.trader_id,
            equity: dto.total_equity,
            total_pnl: pnl,
            shared: dto.shared,
        });
    }

    Ok(Json(PortfolioDto { traders: entries, total_equity, total_pnl }))
}

// =============================================================================
// Per-trader views
// =============================================================================

async fn status(State(state): State<Arc<ApiState>>, Query(params): Query<TraderIdQuery>) -> Result<Json<TraderStatus>, ApiError> {
    let engine = require_trader(&state, &params.trader_id)?;
    Ok(Json(TraderStatus {
        trader_id: engine.trader_id.clone(),
        state: engine.state(),
        daily_pnl: engine.daily_pnl(),
        call_count: engine.call_count(),
    }))
}

async fn account(State(state): State<Arc<ApiState>>, Query(params): Query<TraderIdQuery>) -> Result<Json<AccountDto>, ApiError> {
    let engine = require_trader(&state, &params.trader_id)?;
    let all = state.registry.get_all_traders();
    let dto = account_dto_for(&engine, &all).await?;
    Ok(Json(dto))
}

async fn positions(State(state): State<Arc<ApiState>>, Query(params): Query<TraderIdQuery>) -> Result<Json<PositionsDto>, ApiError> {
    let engine = require_trader(&state, &params.trader_id)?;
    let positions = engine.trader().positions().await.map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(PositionsDto { trader_id: engine.trader_id.clone(), positions }))
}

async fn decisions(State(state): State<Arc<ApiState>>, Query(params): Query<TraderIdQuery>) -> Result<Json<Vec<DecisionRecord>>, ApiError> {
    let engine = require_trader(&state, &params.trader_id)?;
    let records = engine.logger().get_all_records().map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(records))
}

async fn decisions_latest(State(state): State<Arc<ApiState>>, Query(params): Query<TraderIdQuery>) -> Result<Json<Vec<DecisionRecord>>, ApiError> {
    let engine = require_trader(&state, &params.trader_id)?;
    let mut records = engine.logger().get_latest_records(10).map_err(|e| ApiError::Internal(e.to_string()))?;
    records.reverse(); // the store returns oldest-first; this endpoint promises newest-first
    Ok(Json(records))
}

async fn statistics(State(state): State<Arc<ApiState>>, Query(params): Query<TraderIdQuery>) -> Result<Json<StatisticsDto>, ApiError> {
    let engine = require_trader(&state, &params.trader_id)?;
    let stats = engine.logger().get_statistics().map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(StatisticsDto { stats }))
}

async fn performance(State(state): State<Arc<ApiState>>, Query(params): Query<TraderIdQuery>) -> Result<Json<PerformanceDto>, ApiError> {
    let engine = require_trader(&state, &params.trader_id)?;
    let analysis = engine.logger().analyse_performance(0).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(PerformanceDto { analysis }))
}

/// Up to the latest 2000 records, baseline-recovered: `startCycle` present
/// filters to `cycle_number >= startCycle` and that first point becomes the
/// zeroed baseline; otherwise cycle 1 is the baseline (or the earliest
/// record if cycle 1 is missing). One live point is appended at the end,
/// timestamped just past now, with the sentinel `cycle_number = 0`.
async fn equity_history(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<EquityHistoryQuery>,
) -> Result<Json<Vec<EquityPoint>>, ApiError> {
    let engine = require_trader(&state, &params.trader_id)?;
    let mut records = engine.logger().get_all_records().map_err(|e| ApiError::Internal(e.to_string()))?;
    records.sort_by_key(|r| r.cycle_number);
    if records.len() > 2000 {
        let skip = records.len() - 2000;
        records = records.split_off(skip);
    }

    let filtered: Vec<DecisionRecord> = match params.start_cycle {
        Some(start) => records.into_iter().filter(|r| r.cycle_number >= start).collect(),
        None => records,
    };

    let baseline_cycle = match params.start_cycle {
        Some(_) => filtered.first().map(|r| r.cycle_number),
        None => Some(
            filtered
                .iter()
                .find(|r| r.cycle_number == 1)
                .or_else(|| filtered.first())
                .map(|r| r.cycle_number)
                .unwrap_or(0),
        ),
    };
    let fallback_equity = filtered.first().map(|r| r.account_state.total_equity).unwrap_or(0.0);
    let baseline_equity = match baseline_cycle {
        Some(cycle) => filtered
            .iter()
            .find(|r| r.cycle_number == cycle)
            .map(|r| r.account_state.total_equity)
            .unwrap_or(fallback_equity),
        None => fallback_equity,
    };

    let mut points: Vec<EquityPoint> = filtered
        .iter()
        .map(|r| {
            let pnl_pct = if Some(r.cycle_number) == baseline_cycle || baseline_equity <= 0.0 {
                0.0
            } else {
                ((r.account_state.total_equity - baseline_equity) / baseline_equity) * 100.0
            };
            EquityPoint {
                cycle_number: r.cycle_number,
                timestamp: r.timestamp,
                equity: r.account_state.total_equity,
                pnl_pct,
            }
        })
        .collect();

    let live_equity = engine
        .trader()
        .balance()
        .await
        .map(|b| b.equity())
        .unwrap_or_else(|_| points.last().map(|p| p.equity).unwrap_or(baseline_equity));
    let live_pnl_pct = if baseline_equity > 0.0 {
        ((live_equity - baseline_equity) / baseline_equity) * 100.0
    } else {
        0.0
    };
    points.push(EquityPoint {
        cycle_number: 0,
        timestamp: Utc::now() + chrono::Duration::milliseconds(1),
        equity: live_equity,
        pnl_pct: live_pnl_pct,
    });

    Ok(Json(points))
}

async fn trading_signal(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<TradingSignalQuery>,
) -> Result<Json<TradingSignalDto>, ApiError> {
    let engine = if let Some(trader_id) = params.trader_id.as_deref() {
        state
            .registry
            .get_trader(trader_id)
            .ok_or_else(|| ApiError::NotFound(format!("unknown trader_id '{trader_id}'")))?
    } else if let Some(model) = params.model.as_deref() {
        state
            .registry
            .get_all_traders()
            .into_iter()
            .find(|t| t.config().ai_model == model)
            .ok_or_else(|| ApiError::NotFound(format!("no trader running model '{model}'")))?
    } else {
        return Err(ApiError::BadRequest("provide either 'trader_id' or 'model'".to_string()));
    };

    let latest = engine.logger().get_latest_records(1).map_err(|e| ApiError::Internal(e.to_string()))?;
    let record = latest
        .last()
        .ok_or_else(|| ApiError::NotFound("no decision records yet for this trader".to_string()))?;
    Ok(Json(TradingSignalDto::from_record(record)))
}

// =============================================================================
// Position-closing actions
// =============================================================================

#[derive(Deserialize)]
struct ClosePositionBody {
    symbol: String,
    side: Side,
}

#[derive(Deserialize)]
struct ForceClosePositionBody {
    symbol: String,
    side: Side,
    #[serde(default)]
    quantity: Option<f64>,
}

/// Shared by both close endpoints: refuses a losing position, serialises
/// through the same closing lock the cycle engine and the monitor use, and
/// persists a manual-close record so performance analysis stays accurate
/// between AI-driven cycles.
async fn execute_manual_close(
    engine: &Arc<TraderEngine>,
    symbol: &str,
    side: Side,
    requested_quantity: Option<f64>,
) -> Result<ExecutedDecision, ApiError> {
    let trader = engine.trader();
    let lock = engine.locks().get(symbol, side);
    let _guard = lock.lock().await;

    let open_positions = trader.positions().await.map_err(|e| ApiError::Internal(e.to_string()))?;
    let position = open_positions
        .iter()
        .find(|p| p.symbol == symbol && p.side == side)
        .ok_or_else(|| ApiError::NotFound(format!("no open {side:?} position for {symbol}")))?;

    if let Some(qty) = requested_quantity {
        if (qty - position.position_amt.abs()).abs() > 1e-6 {
            return Err(ApiError::BadRequest(
                "partial close is not supported; quantity must match the full position size".to_string(),
            ));
        }
    }

    if position.unrealized_pnl < 0.0 {
        return Err(ApiError::BadRequest("refused: position is not currently profitable".to_string()));
    }

    let decision = Decision {
        symbol: symbol.to_string(),
        action: if side == Side::Long { Action::CloseLong } else { Action::CloseShort },
        leverage: None,
        position_size_usd: None,
        stop_loss: None,
        take_profit: None,
        confidence: None,
        risk_usd: None,
        reasoning: "manual close via API".to_string(),
    };

    let result = match side {
        Side::Long => trader.close_long(symbol).await,
        Side::Short => trader.close_short(symbol).await,
    };

    let executed = match result {
        Ok(OrderOutcome::Filled { order_id, filled_qty, avg_price }) => ExecutedDecision {
            decision,
            order_id: Some(order_id),
            quantity: Some(filled_qty),
            price: Some(avg_price),
            success: true,
            error: None,
        },
        Ok(OrderOutcome::Rejected { reason }) => ExecutedDecision {
            decision,
            order_id: None,
            quantity: None,
            price: None,
            success: false,
            error: Some(reason),
        },
        Err(TraderError::AlreadyClosed) => ExecutedDecision {
            decision,
            order_id: None,
            quantity: None,
            price: None,
            success: false,
            error: Some("position already closed".to_string()),
        },
        Err(e) => ExecutedDecision {
            decision,
            order_id: None,
            quantity: None,
            price: None,
            success: false,
            error: Some(e.to_string()),
        },
    };

    persist_manual_close(engine, &trader, executed.clone()).await;
    Ok(executed)
}

async fn persist_manual_close(
    engine: &Arc<TraderEngine>,
    trader: &Arc<dyn crate::trader::Trader>,
    executed: ExecutedDecision,
) {
    let Ok(balance) = trader.balance().await else { return };
    let positions = trader.positions().await.unwrap_or_default();
    let equity = balance.equity();
    let margin_used = equity - balance.available_balance;
    let account_state = AccountStateSnapshot {
        total_equity: equity,
        available_balance: balance.available_balance,
        total_unrealized_profit: balance.unrealized_pnl,
        position_count: positions.len() as u32,
        margin_used_pct: if equity > 0.0 { (margin_used / equity) * 100.0 } else { 0.0 },
    };
    let position_snapshots = positions
        .iter()
        .map(|p| PositionSnapshot {
            symbol: p.symbol.clone(),
            side: p.side,
            entry_price: p.entry_price,
            mark_price: p.mark_price,
            quantity: p.position_amt.abs(),
            leverage: p.leverage,
            unrealized_pnl: p.unrealized_pnl,
            unrealized_pnl_pct: p.pnl_pct(),
            margin_used: p.isolated_margin,
        })
        .collect();

    let record = DecisionRecord::manual_close(
        engine.trader_id.clone(),
        0,
        account_state,
        position_snapshots,
        executed,
    );
    if let Err(e) = engine.logger().log_decision(record) {
        warn!(trader_id = %engine.trader_id, error = %e, "failed to persist manual close record");
    }
}

async fn close_position(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<TraderIdQuery>,
    Json(body): Json<ClosePositionBody>,
) -> Result<Json<ExecutedDecision>, ApiError> {
    let engine = require_trader(&state, &params.trader_id)?;
    let executed = execute_manual_close(&engine, &body.symbol, body.side, None).await?;
    Ok(Json(executed))
}

async fn force_close_position(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<TraderIdQuery>,
    Json(body): Json<ForceClosePositionBody>,
) -> Result<Json<ExecutedDecision>, ApiError> {
    let engine = require_trader(&state, &params.trader_id)?;
    let executed = execute_manual_close(&engine, &body.symbol, body.side, body.quantity).await?;
    Ok(Json(executed))
}
