// =============================================================================
// TraderRegistry — the fleet's single source of truth for trader lookups
// =============================================================================
//
// Deliberately narrow: the API layer and the copy-trading wiring only ever
// need to fetch one trader by id or enumerate all of them. Keeping the
// surface this small means nothing outside `main.rs` ever has to know how
// the registry is populated (config file today, a database tomorrow).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use crate::decision::DecisionRecord;
use crate::engine::{CopySource, TraderEngine};

/// Read-only handle to every trader running in this process.
#[derive(Clone, Default)]
pub struct TraderRegistry {
    traders: Arc<HashMap<String, Arc<TraderEngine>>>,
}

impl TraderRegistry {
    pub fn new(traders: Vec<Arc<TraderEngine>>) -> Self {
        let map = traders
            .into_iter()
            .map(|t| (t.trader_id.clone(), t))
            .collect();
        Self { traders: Arc::new(map) }
    }

    pub fn get_trader(&self, trader_id: &str) -> Option<Arc<TraderEngine>> {
        self.traders.get(trader_id).cloned()
    }

    pub fn get_all_traders(&self) -> Vec<Arc<TraderEngine>> {
        self.traders.values().cloned().collect()
    }

    /// Recover the initial-balance baseline per the logger-recovery rule:
    /// an explicit `TraderConfig::initial_balance` always wins; otherwise
    /// fall back to the equity recorded in the logger's earliest record —
    /// the cycle-0 seed row when no real cycle has run yet — and failing
    /// that, live equity.
    pub async fn recover_initial_balance(
        configured: Option<f64>,
        logger: &dyn crate::logger::DecisionLogger,
        live_equity: f64,
    ) -> f64 {
        if let Some(balance) = configured {
            return balance;
        }
        match logger.get_first_record() {
            Ok(Some(record)) => record.account_state.total_equity,
            _ => live_equity,
        }
    }

    /// Build the copy-trading snapshot for `target_trader_id` from whichever
    /// other traders are configured as its copy source: `"all"`/`"portfolio"`
    /// means every other trader, a bare id means exactly that one trader.
    /// The caller supplies each source's most recent decisions directly, as
    /// recovered from its own logger — this never re-derives them itself.
    pub fn copy_sources_for(
        &self,
        target_trader_id: &str,
        copy_from: &str,
        latest_decisions: &HashMap<String, (f64, DecisionRecord)>,
    ) -> Vec<CopySource> {
        let wants_all = matches!(copy_from, "all" | "portfolio");
        let mut sources = Vec::new();
        for trader in self.get_all_traders() {
            if trader.trader_id == target_trader_id {
                continue;
            }
            if !wants_all && trader.trader_id != copy_from {
                continue;
            }
            if let Some((equity, record)) = latest_decisions.get(&trader.trader_id) {
                let decisions: Vec<_> = record
                    .decisions
                    .iter()
                    .map(|ed| ed.decision.clone())
                    .collect();
                sources.push(CopySource {
                    trader_id: trader.trader_id.clone(),
                    equity: *equity,
                    decisions,
                });
            }
        }
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::client::AiClient;
    use crate::config::{EngineConfig, TraderConfig};
    use crate::engine::locks::PositionClosingLocks;
    use crate::logger::sled_store::SledDecisionStore;
    use crate::market::MarketClient;
    use crate::trader::paper::PaperTrader;
    use crate::trader::Trader;
    use async_trait::async_trait;

    struct NeverCalledAi;
    #[async_trait]
    impl AiClient for NeverCalledAi {
        async fn complete(&self, _s: &str, _u: &str) -> Result<String, String> {
            Err("not used in this test".to_string())
        }
    }

    fn trader_config(id: &str) -> TraderConfig {
        TraderConfig {
            trader_id: id.to_string(),
            trader_name: id.to_string(),
            ai_model: "gpt-4".to_string(),
            exchange_tag: "paper".to_string(),
            initial_balance: None,
            btc_eth_leverage_cap: 20,
            altcoin_leverage_cap: 10,
            scan_interval_secs: 300,
            auto_take_profit_pct: 0.0,
            copy_from: None,
            multi_agent: None,
            enabled: true,
        }
    }

    fn engine(id: &str, db: &sled::Db) -> Arc<TraderEngine> {
        let trader: Arc<dyn Trader> = Arc::new(PaperTrader::new(id, 1000.0));
        let logger = Arc::new(SledDecisionStore::open(db, id).unwrap());
        Arc::new(TraderEngine::new(
            trader_config(id),
            Arc::new(EngineConfig::default()),
            trader,
            Arc::new(NeverCalledAi),
            "http://localhost".to_string(),
            Arc::new(MarketClient::new()),
            logger,
            Arc::new(PositionClosingLocks::new()),
            1000.0,
        ))
    }

    #[test]
    fn registry_looks_up_by_id() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let a = engine("alpha", &db);
        let b = engine("beta", &db);
        let registry = TraderRegistry::new(vec![a.clone(), b.clone()]);

        assert!(registry.get_trader("alpha").is_some());
        assert!(registry.get_trader("missing").is_none());
        assert_eq!(registry.get_all_traders().len(), 2);
    }

    #[tokio::test]
    async fn recover_initial_balance_prefers_configured_value() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let logger = SledDecisionStore::open(&db, "t1").unwrap();
        let balance = TraderRegistry::recover_initial_balance(Some(2500.0), &logger, 999.0).await;
        assert!((balance - 2500.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn recover_initial_balance_falls_back_to_live_equity_when_logger_empty() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let logger = SledDecisionStore::open(&db, "t1").unwrap();
        let balance = TraderRegistry::recover_initial_balance(None, &logger, 777.0).await;
        assert!((balance - 777.0).abs() < 1e-9);
    }
}
