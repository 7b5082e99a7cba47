// =============================================================================
// Aurora Traders — Main Entry Point
// =============================================================================
//
// Builds the fleet from `fleet_config.json`, spawns one scan-decide cycle
// task and one profitable-position monitor task per enabled trader, then
// serves the read-only HTTP API alongside them until Ctrl+C.
// =============================================================================

mod ai;
mod api;
mod config;
mod decision;
mod engine;
mod futures_intel;
mod indicators;
mod logger;
mod market;
mod market_data;
mod registry;
mod trader;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::ai::client::{AiClient, HttpAiClient};
use crate::config::{FleetConfig, TraderConfig};
use crate::decision::DecisionRecord;
use crate::engine::{CopySource, PositionClosingLocks, TraderEngine};
use crate::logger::sled_store::SledDecisionStore;
use crate::logger::DecisionLogger;
use crate::market::MarketClient;
use crate::registry::TraderRegistry;
use crate::trader::binance::BinanceFuturesTrader;
use crate::trader::paper::PaperTrader;
use crate::trader::Trader;

const FLEET_CONFIG_PATH: &str = "fleet_config.json";
const DECISION_DB_PATH: &str = "decisions.sled";
const DEFAULT_AI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_PAPER_BALANCE: f64 = 10_000.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("aurora-traders starting up");

    let fleet_config = FleetConfig::load(FLEET_CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load fleet config, using defaults (no traders)");
        FleetConfig::default()
    });

    let engine_config = Arc::new(fleet_config.engine.clone());
    let db = sled::open(DECISION_DB_PATH)?;
    let market_client = Arc::new(MarketClient::new());

    let mut engines = Vec::new();
    for trader_config in fleet_config.traders.iter().filter(|t| t.enabled) {
        match build_trader_engine(trader_config, &engine_config, &db, &market_client).await {
            Ok(engine) => engines.push(engine),
            Err(e) => error!(trader_id = %trader_config.trader_id, error = %e, "failed to build trader, skipping"),
        }
    }

    info!(count = engines.len(), "trader fleet assembled");
    let registry = TraderRegistry::new(engines.clone());

    for engine in &engines {
        engine.run();
        spawn_cycle_task(engine.clone(), registry.clone());
        spawn_monitor_task(engine.clone());
    }

    let api_state = Arc::new(api::ApiState { registry: registry.clone() });
    let bind_addr = std::env::var("AURORA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    tokio::spawn(async move {
        let app = api::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server exited");
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    for engine in &engines {
        engine.stop();
    }
    if let Err(e) = fleet_config.save(FLEET_CONFIG_PATH) {
        error!(error = %e, "failed to save fleet config on shutdown");
    }

    info!("aurora-traders shut down complete");
    Ok(())
}

/// Build one fully-wired `TraderEngine`: the exchange adapter picked by
/// `exchange_tag`, the single-agent AI client from env credentials, this
/// trader's own logger tree, and the recovered initial-balance baseline.
async fn build_trader_engine(
    trader_config: &TraderConfig,
    engine_config: &Arc<config::EngineConfig>,
    db: &sled::Db,
    market_client: &Arc<MarketClient>,
) -> anyhow::Result<Arc<TraderEngine>> {
    let trader_id = &trader_config.trader_id;
    let env_prefix = trader_id.to_uppercase().replace('-', "_");

    let trader: Arc<dyn Trader> = match trader_config.exchange_tag.as_str() {
        "paper" => Arc::new(PaperTrader::new(trader_id.clone(), DEFAULT_PAPER_BALANCE)),
        "binance" => {
            let api_key = std::env::var(format!("{env_prefix}_BINANCE_API_KEY")).unwrap_or_default();
            let api_secret = std::env::var(format!("{env_prefix}_BINANCE_API_SECRET")).unwrap_or_default();
            Arc::new(BinanceFuturesTrader::new(trader_id.clone(), api_key, api_secret))
        }
        other => anyhow::bail!("unknown exchange_tag '{other}' for trader '{trader_id}'"),
    };

    let ai_api_key = std::env::var(format!("{env_prefix}_AI_API_KEY"))
        .or_else(|_| std::env::var("AI_API_KEY"))
        .unwrap_or_default();
    let ai_base_url = std::env::var("AI_BASE_URL").unwrap_or_else(|_| DEFAULT_AI_BASE_URL.to_string());
    let ai_client: Arc<dyn AiClient> = Arc::new(HttpAiClient::new(ai_api_key, ai_base_url.clone(), trader_config.ai_model.clone()));

    let logger: Arc<dyn DecisionLogger> = Arc::new(SledDecisionStore::open(db, trader_id)?);

    let live_equity = trader.balance().await.map(|b| b.equity()).unwrap_or(DEFAULT_PAPER_BALANCE);
    let initial_balance = TraderRegistry::recover_initial_balance(
        trader_config.initial_balance,
        logger.as_ref(),
        live_equity,
    )
    .await;

    if logger.get_first_record()?.is_none() {
        let account_state = crate::decision::AccountStateSnapshot {
            total_equity: initial_balance,
            available_balance: initial_balance,
            total_unrealized_profit: 0.0,
            position_count: 0,
            margin_used_pct: 0.0,
        };
        logger.write_seed(DecisionRecord::seed(trader_id.clone(), account_state))?;
    }

    let locks = Arc::new(PositionClosingLocks::new());

    Ok(Arc::new(TraderEngine::new(
        trader_config.clone(),
        engine_config.clone(),
        trader,
        ai_client,
        ai_base_url,
        market_client.clone(),
        logger,
        locks,
        initial_balance,
    )))
}

/// Most recent decision plus live equity for every trader, keyed by id —
/// the raw material `TraderRegistry::copy_sources_for` turns into the
/// `CopySource` list a copy-trading cycle needs.
async fn latest_decision_snapshot(traders: &[Arc<TraderEngine>]) -> HashMap<String, (f64, DecisionRecord)> {
    let mut out = HashMap::new();
    for engine in traders {
        let equity = match engine.trader().balance().await {
            Ok(b) => b.equity(),
            Err(_) => continue,
        };
        let latest = match engine.logger().get_latest_records(1) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if let Some(record) = latest.into_iter().last() {
            out.insert(engine.trader_id.clone(), (equity, record));
        }
    }
    out
}

fn spawn_cycle_task(engine: Arc<TraderEngine>, registry: TraderRegistry) {
    tokio::spawn(async move {
        loop {
            let scan_interval_secs = engine.config().scan_interval_secs.max(1);
            tokio::time::sleep(tokio::time::Duration::from_secs(scan_interval_secs)).await;

            if matches!(engine.state(), crate::types::TraderState::Stopped) {
                break;
            }

            let copy_sources = match engine.config().copy_from.as_deref() {
                Some(copy_from) => {
                    let all = registry.get_all_traders();
                    let snapshot = latest_decision_snapshot(&all).await;
                    registry.copy_sources_for(&engine.trader_id, copy_from, &snapshot)
                }
                None => Vec::new(),
            };

            if let Err(e) = run_cycle_logged(&engine, &copy_sources).await {
                error!(trader_id = %engine.trader_id, error = %e, "cycle failed");
            }
        }
    });
}

async fn run_cycle_logged(engine: &Arc<TraderEngine>, copy_sources: &[CopySource]) -> anyhow::Result<()> {
    let record = engine.run_cycle(copy_sources).await?;
    info!(
        trader_id = %engine.trader_id,
        cycle_number = record.cycle_number,
        decisions = record.decisions.len(),
        "cycle complete"
    );
    Ok(())
}

fn spawn_monitor_task(engine: Arc<TraderEngine>) {
    tokio::spawn(async move {
        engine::monitor::run_profit_monitor(engine).await;
    });
}
