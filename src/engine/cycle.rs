// =============================================================================
// TraderEngine — per-trader cycle state machine
// =============================================================================
//
// One `TraderEngine` owns one `Trader` adapter and runs the scan-decide-act
// loop on its own interval. `run_cycle` is the thirteen-step body; `Run`/
// `Stop` flip the state the API exposes, `pause_for` is how the monitor or a
// forced-close endpoint tells the engine to skip upcoming cycles without
// fully stopping it.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tracing::{error, info, instrument, warn};

use crate::ai::client::AiClient;
use crate::ai::{multi_agent, prompt};
use crate::config::{EngineConfig, TraderConfig};
use crate::decision::parser::parse_response;
use crate::decision::{
    AccountStateSnapshot, Decision, DecisionRecord, ExecutedDecision, FullDecision,
    PositionSnapshot, ValidationContext,
};
use crate::logger::DecisionLogger;
use crate::market::{build_candidate_pool, Candidate, MarketClient};
use crate::trader::{Trader, TraderError};
use crate::types::{Action, Side, TraderState};

use super::context::{build_context, FirstSeenMap, PositionContext};
use super::locks::PositionClosingLocks;

/// A snapshot of another trader's latest cycle, handed in by whatever owns
/// the whole fleet so a copy-trading engine never has to reach across trader
/// boundaries itself.
#[derive(Debug, Clone)]
pub struct CopySource {
    pub trader_id: String,
    pub equity: f64,
    pub decisions: Vec<Decision>,
}

/// Scale a peer's margin sizing by the ratio of this trader's equity to the
/// combined equity of every copy source, so a copy-trading account of a
/// different size reproduces the same *risk fraction* of the whole panel
/// rather than the same dollar amount or a per-source ratio.
fn scale_for_copy(decisions: &[Decision], own_equity: f64, total_source_equity: f64) -> Vec<Decision> {
    if total_source_equity <= 0.0 {
        return Vec::new();
    }
    let ratio = own_equity / total_source_equity;
    decisions
        .iter()
        .cloned()
        .map(|mut d| {
            if let Some(size) = d.position_size_usd {
                d.position_size_usd = Some(size * ratio);
            }
            d
        })
        .collect()
}

/// Union every copy source's decisions, scaled to this trader's share of the
/// panel's combined equity. Skips `wait`/`hold`/symbol-less decisions (they
/// carry nothing to copy), drops a copied close unless this account actually
/// holds the matching position, and dedupes by `(symbol, action)` so a
/// source's `wait` can never shadow another source's real decision on the
/// same symbol. A `(symbol, action)` pair appearing from more than one
/// source keeps the first (the caller supplies sources in priority order).
fn union_copy_decisions(own_equity: f64, own_positions: &[PositionContext], sources: &[CopySource]) -> FullDecision {
    let total_source_equity: f64 = sources.iter().map(|s| s.equity).sum();
    let mut seen = std::collections::HashSet::new();
    let mut combined = Vec::new();
    let mut from = Vec::new();
    for source in sources {
        from.push(source.trader_id.clone());
        for mut d in scale_for_copy(&source.decisions, own_equity, total_source_equity) {
            if d.symbol == "ALL" || matches!(d.action, Action::Wait | Action::Hold) {
                continue;
            }
            if d.action.is_close() {
                let holds_position = d.action.side().map_or(false, |side| {
                    own_positions.iter().any(|p| p.symbol == d.symbol && p.side == side)
                });
                if !holds_position {
                    continue;
                }
            }
            if seen.insert((d.symbol.clone(), d.action)) {
                d.reasoning = format!("[Copied from {}] {}", source.trader_id, d.reasoning);
                combined.push(d);
            }
        }
    }
    if combined.is_empty() {
        combined.push(Decision::wait("no copy-trading source produced a decision this cycle"));
    }
    FullDecision {
        user_prompt: String::new(),
        cot_trace: format!("copy-trading: unioned decisions from {}", from.join(", ")),
        decisions: combined,
        raw_response: String::new(),
        timestamp: Utc::now(),
        used_fallback: false,
        error: None,
    }
}

pub struct TraderEngine {
    pub trader_id: String,
    config: RwLock<TraderConfig>,
    engine_config: Arc<EngineConfig>,
    trader: Arc<dyn Trader>,
    ai_client: Arc<dyn AiClient>,
    ai_base_url: String,
    market_client: Arc<MarketClient>,
    logger: Arc<dyn DecisionLogger>,
    locks: Arc<PositionClosingLocks>,

    state: RwLock<TraderState>,
    paused_until: RwLock<Option<DateTime<Utc>>>,
    started_at: DateTime<Utc>,
    call_count: AtomicU64,
    first_seen: RwLock<FirstSeenMap>,
    initial_balance: RwLock<f64>,
    daily_pnl: RwLock<f64>,
    daily_reset_at: RwLock<DateTime<Utc>>,
}

impl TraderEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TraderConfig,
        engine_config: Arc<EngineConfig>,
        trader: Arc<dyn Trader>,
        ai_client: Arc<dyn AiClient>,
        ai_base_url: String,
        market_client: Arc<MarketClient>,
        logger: Arc<dyn DecisionLogger>,
        locks: Arc<PositionClosingLocks>,
        initial_balance: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            trader_id: config.trader_id.clone(),
            config: RwLock::new(config),
            engine_config,
            trader,
            ai_client,
            ai_base_url,
            market_client,
            logger,
            locks,
            state: RwLock::new(TraderState::Idle),
            paused_until: RwLock::new(None),
            started_at: now,
            call_count: AtomicU64::new(0),
            first_seen: RwLock::new(FirstSeenMap::new()),
            initial_balance: RwLock::new(initial_balance),
            daily_pnl: RwLock::new(0.0),
            daily_reset_at: RwLock::new(now),
        }
    }

    pub fn state(&self) -> TraderState {
        *self.state.read()
    }

    pub fn daily_pnl(&self) -> f64 {
        *self.daily_pnl.read()
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn config(&self) -> TraderConfig {
        self.config_snapshot()
    }

    pub fn trader(&self) -> Arc<dyn Trader> {
        self.trader.clone()
    }

    pub fn logger(&self) -> Arc<dyn DecisionLogger> {
        self.logger.clone()
    }

    pub fn locks(&self) -> Arc<PositionClosingLocks> {
        self.locks.clone()
    }

    pub fn engine_config_handle(&self) -> Arc<EngineConfig> {
        self.engine_config.clone()
    }

    /// The recovered baseline used for PnL% arithmetic and shared-account
    /// proportional scaling (spec §4.1, §6.3).
    pub fn initial_balance(&self) -> f64 {
        *self.initial_balance.read()
    }

    pub fn run(&self) {
        *self.state.write() = TraderState::Running;
        info!(trader_id = %self.trader_id, "trader engine started");
    }

    pub fn stop(&self) {
        *self.state.write() = TraderState::Stopped;
        info!(trader_id = %self.trader_id, "trader engine stopped");
    }

    /// Skip cycles until `until` without leaving the running state — used by
    /// a forced-close API call that wants the engine to stand down briefly.
    pub fn pause_for(&self, duration: std::time::Duration) {
        let until = Utc::now() + ChronoDuration::from_std(duration).unwrap_or_default();
        *self.paused_until.write() = Some(until);
    }

    fn config_snapshot(&self) -> TraderConfig {
        self.config.read().clone()
    }

    /// Step 1 + step 3: increment the cycle counter, then report whether a
    /// pause is still in effect (and should cause this tick to be skipped).
    fn advance_and_check_pause(&self) -> (u64, bool) {
        let call_count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        let paused = match *self.paused_until.read() {
            Some(until) => Utc::now() < until,
            None => false,
        };
        (call_count, paused)
    }

    /// Step 4: reset the rolling daily PnL counter once 24h have elapsed
    /// since the last reset.
    fn maybe_reset_daily_pnl(&self, now: DateTime<Utc>) {
        let should_reset = (now - *self.daily_reset_at.read()) >= ChronoDuration::hours(24);
        if should_reset {
            *self.daily_pnl.write() = 0.0;
            *self.daily_reset_at.write() = now;
        }
    }

    /// Step 5: paper-only auto take-profit sweep. Real exchange adapters are
    /// untouched by this — `auto_take_profit_pct` only means anything against
    /// an in-memory ledger. Mark prices must already be current on `self.trader`.
    fn sweep_paper_auto_tp(&self, cfg: &TraderConfig) {
        if cfg.auto_take_profit_pct <= 0.0 {
            return;
        }
        let closed = self.trader.sweep_auto_take_profit(cfg.auto_take_profit_pct);
        if !closed.is_empty() {
            info!(trader_id = %self.trader_id, ?closed, "paper auto take-profit swept positions");
        }
    }

    /// Fetch the tradeable universe, refresh the trader's mark prices from
    /// it (a no-op on exchange adapters), and build the candidate pool.
    async fn fetch_market_universe(
        &self,
    ) -> (Vec<Candidate>, HashMap<String, crate::market::MarketSnapshot>) {
        let symbols = self.market_client.list_perpetual_symbols().await.unwrap_or_default();
        let universe = self.market_client.fetch_universe(&symbols).await;
        for snap in &universe {
            self.trader.update_mark_price(&snap.symbol, snap.price);
        }
        let candidate_coins = build_candidate_pool(
            &universe,
            self.engine_config.liquidity_filter_usd,
            self.engine_config.candidate_pool_k,
        );
        let market_data_map = universe.into_iter().map(|s| (s.symbol.clone(), s)).collect();
        (candidate_coins, market_data_map)
    }

    /// Steps 6-8: build the per-cycle context and the account/position/
    /// candidate snapshots the record persists. Assumes the trader's mark
    /// prices are already current (see `fetch_market_universe`).
    async fn snapshot_cycle_inputs(
        &self,
        cfg: &TraderConfig,
        call_count: u64,
        candidate_coins: Vec<Candidate>,
        market_data_map: HashMap<String, crate::market::MarketSnapshot>,
    ) -> anyhow::Result<(super::context::Context, AccountStateSnapshot, Vec<PositionSnapshot>)> {
        let balance = self.trader.balance().await?;
        let positions = self.trader.positions().await?;

        for p in &positions {
            let key = format!("{}_{}", p.symbol, p.side.to_string().to_uppercase());
            self.first_seen.write().entry(key).or_insert_with(Utc::now);
        }

        let (btc_1h, btc_4h) = market_data_map
            .get("BTCUSDT")
            .map(|s| (s.change_1h_pct, s.change_4h_pct))
            .unwrap_or((0.0, 0.0));

        let performance = self.logger.analyse_performance(100).unwrap_or(crate::decision::PerformanceAnalysis {
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
        });

        let now = Utc::now();
        let ctx = build_context(
            now,
            self.started_at,
            call_count,
            *self.initial_balance.read(),
            &balance,
            &positions,
            &self.first_seen.read(),
            candidate_coins,
            market_data_map,
            performance,
            cfg.btc_eth_leverage_cap,
            cfg.altcoin_leverage_cap,
            btc_1h,
            btc_4h,
        );

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

        info!(
            trader_id = %self.trader_id,
            equity,
            positions = positions.len(),
            candidates = ctx.candidate_coins.len(),
            "account breakdown for cycle"
        );

        Ok((ctx, account_state, position_snapshots))
    }

    /// Step 9: decide where this cycle's decisions come from — copy-trading,
    /// the multi-agent panel, or a single AI call — in that priority order.
    async fn obtain_decisions(
        &self,
        cfg: &TraderConfig,
        ctx: &super::context::Context,
        copy_sources: &[CopySource],
        prices: &HashMap<String, f64>,
    ) -> FullDecision {
        let validation_ctx = ValidationContext {
            equity: ctx.account.equity,
            btc_eth_leverage_cap: cfg.btc_eth_leverage_cap,
            altcoin_leverage_cap: cfg.altcoin_leverage_cap,
            engine: &self.engine_config,
            prices,
        };

        if cfg.copy_from.is_some() && !copy_sources.is_empty() {
            return union_copy_decisions(ctx.account.equity, &ctx.positions, copy_sources);
        }

        let system_prompt = prompt::build_system_prompt(ctx);
        let user_prompt = prompt::build_user_prompt(ctx);

        if let Some(multi_agent_cfg) = &cfg.multi_agent {
            return multi_agent::run_multi_agent(
                multi_agent_cfg,
                &self.ai_base_url,
                &system_prompt,
                &user_prompt,
                &validation_ctx,
                self.ai_client.as_ref(),
            )
            .await;
        }

        let raw = match self.ai_client.complete(&system_prompt, &user_prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(trader_id = %self.trader_id, error = %e, "AI call failed, parser will fall back to wait");
                e
            }
        };
        parse_response(&raw, &user_prompt, &validation_ctx)
    }

    /// `position_size_usd` is margin; convert to a quantity given leverage
    /// and the live price, then hand it to `determine_executable_margin`'s
    /// floor/cap before ever calling the exchange.
    fn determine_executable_margin(&self, requested_margin: f64, available_balance: f64) -> Result<f64, TraderError> {
        let usable = available_balance - self.engine_config.margin_safety_buffer;
        let executable = requested_margin.min(usable);
        if executable < self.engine_config.min_executable_margin {
            return Err(TraderError::MarginInsufficient {
                required: self.engine_config.min_executable_margin,
                available: executable,
            });
        }
        Ok(executable)
    }

    /// Steps 11-12: sort close-before-open-before-hold/wait, cap new opens to
    /// the remaining slot budget, then execute each decision in order,
    /// serialised per `(symbol, side)` through the closing-lock map.
    async fn execute_decisions(
        &self,
        mut decisions: Vec<Decision>,
        cfg: &TraderConfig,
        prices: &HashMap<String, f64>,
        open_position_count: u32,
    ) -> Vec<ExecutedDecision> {
        decisions.sort_by_key(|d| d.action.sort_rank());

        let validation_ctx_equity = self.trader.balance().await.map(|b| b.equity()).unwrap_or(0.0);
        let validation_ctx = ValidationContext {
            equity: validation_ctx_equity,
            btc_eth_leverage_cap: cfg.btc_eth_leverage_cap,
            altcoin_leverage_cap: cfg.altcoin_leverage_cap,
            engine: &self.engine_config,
            prices,
        };

        let max_new_opens = self
            .engine_config
            .max_concurrent_positions
            .saturating_sub(open_position_count);
        let mut opens_used = 0u32;
        let mut out = Vec::with_capacity(decisions.len());

        for decision in decisions {
            if decision.action == Action::Hold || decision.action == Action::Wait {
                out.push(ExecutedDecision {
                    decision,
                    order_id: None,
                    quantity: None,
                    price: None,
                    success: true,
                    error: None,
                });
                continue;
            }

            if decision.action.is_open() && opens_used >= max_new_opens {
                out.push(ExecutedDecision {
                    decision,
                    order_id: None,
                    quantity: None,
                    price: None,
                    success: false,
                    error: Some("max concurrent positions reached this cycle".to_string()),
                });
                continue;
            }

            let executed = self.execute_one(decision, &validation_ctx, prices).await;
            if executed.decision.action.is_open() && executed.success {
                opens_used += 1;
            }
            out.push(executed);
        }

        out
    }

    async fn execute_one(
        &self,
        decision: Decision,
        validation_ctx: &ValidationContext<'_>,
        prices: &HashMap<String, f64>,
    ) -> ExecutedDecision {
        let side = match decision.action.side() {
            Some(s) => s,
            None => {
                return ExecutedDecision {
                    decision,
                    order_id: None,
                    quantity: None,
                    price: None,
                    success: true,
                    error: None,
                }
            }
        };

        let lock = self.locks.get(&decision.symbol, side);
        let _guard = lock.lock().await;

        if decision.action.is_close() {
            return self.execute_close(decision, side).await;
        }

        self.execute_open(decision, side, validation_ctx, prices).await
    }

    async fn execute_open(
        &self,
        decision: Decision,
        side: Side,
        validation_ctx: &ValidationContext<'_>,
        prices: &HashMap<String, f64>,
    ) -> ExecutedDecision {
        let validated = match crate::decision::validate_decision(decision.clone(), validation_ctx) {
            Ok(d) => d,
            Err(e) => {
                return ExecutedDecision {
                    decision,
                    order_id: None,
                    quantity: None,
                    price: None,
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        };

        let price = match prices.get(&validated.symbol) {
            Some(p) => *p,
            None => {
                return ExecutedDecision {
                    decision: validated,
                    order_id: None,
                    quantity: None,
                    price: None,
                    success: false,
                    error: Some("no live market price available".to_string()),
                }
            }
        };

        let balance = match self.trader.balance().await {
            Ok(b) => b,
            Err(e) => {
                return ExecutedDecision {
                    decision: validated,
                    order_id: None,
                    quantity: None,
                    price: None,
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        };

        let leverage = validated.leverage.unwrap_or(1);
        let margin = validated.position_size_usd.unwrap_or(0.0);
        let executable_margin = match self.determine_executable_margin(margin, balance.available_balance) {
            Ok(m) => m,
            Err(e) => {
                return ExecutedDecision {
                    decision: validated,
                    order_id: None,
                    quantity: None,
                    price: None,
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        };

        let notional = executable_margin * leverage as f64;
        let quantity = self.trader.format_quantity(&validated.symbol, notional / price);
        if quantity <= 0.0 {
            return ExecutedDecision {
                decision: validated,
                order_id: None,
                quantity: None,
                price: None,
                success: false,
                error: Some("formatted quantity rounds to zero".to_string()),
            };
        }

        if let Err(e) = self.trader.set_leverage(&validated.symbol, leverage).await {
            warn!(symbol = %validated.symbol, error = %e, "set_leverage failed, continuing with existing leverage");
        }

        let outcome = match side {
            Side::Long => self.trader.open_long(&validated.symbol, quantity, leverage).await,
            Side::Short => self.trader.open_short(&validated.symbol, quantity, leverage).await,
        };

        match outcome {
            Ok(crate::trader::OrderOutcome::Filled { order_id, filled_qty, avg_price }) => {
                // Take-profit only — a stop-loss order is deliberately never placed.
                if let Some(tp) = validated.take_profit {
                    if let Err(e) = self.trader.set_take_profit(&validated.symbol, tp).await {
                        warn!(symbol = %validated.symbol, error = %e, "set_take_profit failed after fill");
                    }
                }
                ExecutedDecision {
                    decision: validated,
                    order_id: Some(order_id),
                    quantity: Some(filled_qty),
                    price: Some(avg_price),
                    success: true,
                    error: None,
                }
            }
            Ok(crate::trader::OrderOutcome::Rejected { reason }) => ExecutedDecision {
                decision: validated,
                order_id: None,
                quantity: None,
                price: None,
                success: false,
                error: Some(reason),
            },
            Err(e) => ExecutedDecision {
                decision: validated,
                order_id: None,
                quantity: None,
                price: None,
                success: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Profitable-only-close: re-verify the position's unrealized PnL under
    /// the lock before sending the close order. Refuses a close on a
    /// position that has gone negative since the decision was made.
    async fn execute_close(&self, decision: Decision, side: Side) -> ExecutedDecision {
        let positions = match self.trader.positions().await {
            Ok(p) => p,
            Err(e) => {
                return ExecutedDecision {
                    decision,
                    order_id: None,
                    quantity: None,
                    price: None,
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        };
        let position = positions.iter().find(|p| p.symbol == decision.symbol && p.side == side);
        let position = match position {
            Some(p) => p,
            None => {
                return ExecutedDecision {
                    decision,
                    order_id: None,
                    quantity: None,
                    price: None,
                    success: false,
                    error: Some("position already closed".to_string()),
                }
            }
        };

        if position.unrealized_pnl < 0.0 {
            return ExecutedDecision {
                decision,
                order_id: None,
                quantity: None,
                price: None,
                success: false,
                error: Some("refused: position is not currently profitable".to_string()),
            };
        }
        let realized_pnl = position.unrealized_pnl;

        let result = match side {
            Side::Long => self.trader.close_long(&decision.symbol).await,
            Side::Short => self.trader.close_short(&decision.symbol).await,
        };

        match result {
            Ok(crate::trader::OrderOutcome::Filled { order_id, filled_qty, avg_price }) => {
                *self.daily_pnl.write() += realized_pnl;
                ExecutedDecision {
                    decision,
                    order_id: Some(order_id),
                    quantity: Some(filled_qty),
                    price: Some(avg_price),
                    success: true,
                    error: None,
                }
            }
            Ok(crate::trader::OrderOutcome::Rejected { reason }) => ExecutedDecision {
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
        }
    }

    /// The full thirteen-step cycle: builds context, obtains decisions,
    /// executes them in close-before-open order, and persists one record.
    #[instrument(skip(self, copy_sources), fields(trader_id = %self.trader_id))]
    pub async fn run_cycle(&self, copy_sources: &[CopySource]) -> anyhow::Result<DecisionRecord> {
        let (call_count, paused) = self.advance_and_check_pause();
        let cfg = self.config_snapshot();
        let now = Utc::now();
        self.maybe_reset_daily_pnl(now);

        if paused {
            info!(trader_id = %self.trader_id, "cycle skipped: trader is paused");
            let balance = self.trader.balance().await.ok();
            let account_state = balance
                .map(|b| AccountStateSnapshot {
                    total_equity: b.equity(),
                    available_balance: b.available_balance,
                    total_unrealized_profit: b.unrealized_pnl,
                    position_count: 0,
                    margin_used_pct: 0.0,
                })
                .unwrap_or(AccountStateSnapshot {
                    total_equity: 0.0,
                    available_balance: 0.0,
                    total_unrealized_profit: 0.0,
                    position_count: 0,
                    margin_used_pct: 0.0,
                });
            let record = DecisionRecord {
                trader_id: self.trader_id.clone(),
                cycle_number: call_count,
                timestamp: now,
                input_prompt: String::new(),
                cot_trace: "skipped: trader paused".to_string(),
                raw_response: String::new(),
                decision_json: "[]".to_string(),
                account_state,
                positions: Vec::new(),
                candidate_coins: Vec::new(),
                decisions: Vec::new(),
                execution_log: vec!["cycle skipped while paused".to_string()],
                success: true,
                error_message: None,
            };
            return Ok(self.persist(record));
        }

        let (candidate_coins, market_data_map) = self.fetch_market_universe().await;
        self.sweep_paper_auto_tp(&cfg);

        let (ctx, mut account_state, positions) = self
            .snapshot_cycle_inputs(&cfg, call_count, candidate_coins, market_data_map)
            .await?;

        let prices: HashMap<String, f64> = ctx
            .market_data_map
            .iter()
            .map(|(symbol, snap)| (symbol.clone(), snap.price))
            .collect();

        let full_decision = self
            .obtain_decisions(&cfg, &ctx, copy_sources, &prices)
            .await;

        let decision_json = serde_json::to_string(&full_decision.decisions).unwrap_or_else(|_| "[]".to_string());

        let executed = self
            .execute_decisions(
                full_decision.decisions.clone(),
                &cfg,
                &prices,
                account_state.position_count,
            )
            .await;

        if let Ok(balance) = self.trader.balance().await {
            let equity = balance.equity();
            let margin_used = equity - balance.available_balance;
            account_state = AccountStateSnapshot {
                total_equity: equity,
                available_balance: balance.available_balance,
                total_unrealized_profit: balance.unrealized_pnl,
                position_count: self.trader.positions().await.map(|p| p.len() as u32).unwrap_or(account_state.position_count),
                margin_used_pct: if equity > 0.0 { (margin_used / equity) * 100.0 } else { 0.0 },
            };
        }

        let execution_log: Vec<String> = executed
            .iter()
            .map(|e| {
                if e.success {
                    format!("{} {}: ok", e.decision.symbol, e.decision.action)
                } else {
                    format!(
                        "{} {}: {}",
                        e.decision.symbol,
                        e.decision.action,
                        e.error.as_deref().unwrap_or("unknown error")
                    )
                }
            })
            .collect();

        let record = DecisionRecord {
            trader_id: self.trader_id.clone(),
            cycle_number: call_count,
            timestamp: now,
            input_prompt: full_decision.user_prompt,
            cot_trace: full_decision.cot_trace,
            raw_response: full_decision.raw_response,
            decision_json,
            account_state,
            positions,
            candidate_coins: ctx.candidate_coins.iter().map(|c| c.snapshot.symbol.clone()).collect(),
            decisions: executed,
            execution_log,
            success: full_decision.error.is_none(),
            error_message: full_decision.error,
        };

        Ok(self.persist(record))
    }

    fn persist(&self, record: DecisionRecord) -> DecisionRecord {
        match self.logger.log_decision(record.clone()) {
            Ok(cycle_number) => {
                let mut persisted = record;
                persisted.cycle_number = cycle_number;
                persisted
            }
            Err(e) => {
                error!(trader_id = %self.trader_id, error = %e, "failed to persist decision record");
                record
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Decision;
    use crate::types::Action;

    fn decision(symbol: &str, action: Action, margin: f64) -> Decision {
        Decision {
            symbol: symbol.to_string(),
            action,
            leverage: Some(5),
            position_size_usd: Some(margin),
            stop_loss: None,
            take_profit: None,
            confidence: None,
            risk_usd: None,
            reasoning: String::new(),
        }
    }

    fn position_ctx(symbol: &str, side: Side) -> PositionContext {
        PositionContext {
            symbol: symbol.to_string(),
            side,
            entry_price: 100.0,
            mark_price: 100.0,
            quantity: 1.0,
            leverage: 5,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            holding_duration_secs: 0,
        }
    }

    #[test]
    fn scale_for_copy_applies_equity_ratio() {
        let decisions = vec![decision("BTCUSDT", Action::OpenLong, 100.0)];
        let scaled = scale_for_copy(&decisions, 500.0, 1000.0);
        assert!((scaled[0].position_size_usd.unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn union_copy_decisions_dedupes_by_symbol_and_action_priority_order() {
        let sources = vec![
            CopySource { trader_id: "a".to_string(), equity: 1000.0, decisions: vec![decision("BTCUSDT", Action::OpenLong, 100.0)] },
            CopySource { trader_id: "b".to_string(), equity: 1000.0, decisions: vec![decision("BTCUSDT", Action::OpenLong, 50.0)] },
        ];
        let full = union_copy_decisions(1000.0, &[], &sources);
        assert_eq!(full.decisions.len(), 1);
        assert_eq!(full.decisions[0].action, Action::OpenLong);
        assert!(full.decisions[0].reasoning.starts_with("[Copied from a]"));
    }

    #[test]
    fn union_copy_decisions_skips_wait_so_it_never_shadows_a_real_decision() {
        let sources = vec![
            CopySource { trader_id: "a".to_string(), equity: 1000.0, decisions: vec![decision("BTCUSDT", Action::Wait, 0.0)] },
            CopySource { trader_id: "b".to_string(), equity: 1000.0, decisions: vec![decision("BTCUSDT", Action::OpenLong, 100.0)] },
        ];
        let full = union_copy_decisions(1000.0, &[], &sources);
        assert_eq!(full.decisions.len(), 1);
        assert_eq!(full.decisions[0].action, Action::OpenLong);
        assert!(full.decisions[0].reasoning.starts_with("[Copied from b]"));
    }

    #[test]
    fn union_copy_decisions_drops_close_without_matching_local_position() {
        let sources = vec![CopySource {
            trader_id: "a".to_string(),
            equity: 1000.0,
            decisions: vec![decision("BTCUSDT", Action::CloseLong, 0.0)],
        }];
        let full = union_copy_decisions(1000.0, &[], &sources);
        assert_eq!(full.decisions.len(), 1);
        assert_eq!(full.decisions[0].action, Action::Wait);
    }

    #[test]
    fn union_copy_decisions_keeps_close_with_matching_local_position() {
        let sources = vec![CopySource {
            trader_id: "a".to_string(),
            equity: 1000.0,
            decisions: vec![decision("BTCUSDT", Action::CloseLong, 0.0)],
        }];
        let own_positions = vec![position_ctx("BTCUSDT", Side::Long)];
        let full = union_copy_decisions(1000.0, &own_positions, &sources);
        assert_eq!(full.decisions.len(), 1);
        assert_eq!(full.decisions[0].action, Action::CloseLong);
    }

    #[test]
    fn union_copy_decisions_scales_by_sum_of_source_equities() {
        let sources = vec![
            CopySource { trader_id: "a".to_string(), equity: 500.0, decisions: vec![decision("BTCUSDT", Action::OpenLong, 100.0)] },
            CopySource { trader_id: "b".to_string(), equity: 500.0, decisions: vec![decision("ETHUSDT", Action::OpenLong, 100.0)] },
        ];
        // own_equity 500, total source equity 1000 -> ratio 0.5 for every source.
        let full = union_copy_decisions(500.0, &[], &sources);
        assert_eq!(full.decisions.len(), 2);
        for d in &full.decisions {
            assert!((d.position_size_usd.unwrap() - 50.0).abs() < 1e-9);
        }
    }

    #[test]
    fn union_copy_decisions_falls_back_to_wait_when_empty() {
        let full = union_copy_decisions(1000.0, &[], &[]);
        assert_eq!(full.decisions[0].action, Action::Wait);
    }
}
