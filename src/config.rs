// =============================================================================
// Runtime configuration — hot-reloadable engine + per-trader settings
// =============================================================================
//
// Two layers: `EngineConfig` holds the cross-trader constants the cycle
// engine and response parser enforce (position caps, risk fractions, margin
// bands); `TraderConfig` holds the knobs that differ per fleet member.
//
// Persistence uses the atomic tmp + rename pattern: write to a temporary
// sibling file, then rename over the target, so a crash mid-write never
// corrupts the on-disk config. Every field carries `#[serde(default)]` so
// that adding a field never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."`)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_candidate_pool_k() -> usize {
    20
}

fn default_max_concurrent_positions() -> u32 {
    6
}

fn default_max_single_trade_risk_pct() -> f64 {
    0.02
}

fn default_liquidity_filter_usd() -> f64 {
    15_000_000.0
}

fn default_min_risk_reward() -> f64 {
    3.0
}

fn default_margin_safety_buffer() -> f64 {
    1.0
}

fn default_min_executable_margin() -> f64 {
    5.0
}

fn default_profit_monitor_interval_secs() -> u64 {
    10
}

fn default_profit_monitor_pnl_pct_threshold() -> f64 {
    4.5
}

fn default_altcoin_min_margin_floor() -> f64 {
    13.0
}

fn default_altcoin_min_margin_equity_pct() -> f64 {
    0.15
}

fn default_btc_eth_min_margin_floor() -> f64 {
    15.0
}

fn default_btc_eth_min_margin_equity_pct() -> f64 {
    0.20
}

fn default_altcoin_max_margin_equity_pct() -> f64 {
    0.40
}

fn default_btc_eth_max_margin_equity_pct() -> f64 {
    0.50
}

fn default_scan_interval_secs() -> u64 {
    300
}

fn default_btc_eth_leverage_cap() -> u32 {
    20
}

fn default_altcoin_leverage_cap() -> u32 {
    10
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Cross-trader constants the cycle engine and the response parser enforce.
/// Every numeric constant named in the system prompt lives here so a single
/// change propagates to both the prompt text and the validation math.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_candidate_pool_k")]
    pub candidate_pool_k: usize,

    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,

    #[serde(default = "default_max_single_trade_risk_pct")]
    pub max_single_trade_risk_pct: f64,

    #[serde(default = "default_liquidity_filter_usd")]
    pub liquidity_filter_usd: f64,

    #[serde(default = "default_min_risk_reward")]
    pub min_risk_reward: f64,

    #[serde(default = "default_margin_safety_buffer")]
    pub margin_safety_buffer: f64,

    #[serde(default = "default_min_executable_margin")]
    pub min_executable_margin: f64,

    #[serde(default = "default_profit_monitor_interval_secs")]
    pub profit_monitor_interval_secs: u64,

    #[serde(default = "default_profit_monitor_pnl_pct_threshold")]
    pub profit_monitor_pnl_pct_threshold: f64,

    #[serde(default = "default_altcoin_min_margin_floor")]
    pub altcoin_min_margin_floor: f64,
    #[serde(default = "default_altcoin_min_margin_equity_pct")]
    pub altcoin_min_margin_equity_pct: f64,
    #[serde(default = "default_btc_eth_min_margin_floor")]
    pub btc_eth_min_margin_floor: f64,
    #[serde(default = "default_btc_eth_min_margin_equity_pct")]
    pub btc_eth_min_margin_equity_pct: f64,

    #[serde(default = "default_altcoin_max_margin_equity_pct")]
    pub altcoin_max_margin_equity_pct: f64,
    #[serde(default = "default_btc_eth_max_margin_equity_pct")]
    pub btc_eth_max_margin_equity_pct: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            candidate_pool_k: default_candidate_pool_k(),
            max_concurrent_positions: default_max_concurrent_positions(),
            max_single_trade_risk_pct: default_max_single_trade_risk_pct(),
            liquidity_filter_usd: default_liquidity_filter_usd(),
            min_risk_reward: default_min_risk_reward(),
            margin_safety_buffer: default_margin_safety_buffer(),
            min_executable_margin: default_min_executable_margin(),
            profit_monitor_interval_secs: default_profit_monitor_interval_secs(),
            profit_monitor_pnl_pct_threshold: default_profit_monitor_pnl_pct_threshold(),
            altcoin_min_margin_floor: default_altcoin_min_margin_floor(),
            altcoin_min_margin_equity_pct: default_altcoin_min_margin_equity_pct(),
            btc_eth_min_margin_floor: default_btc_eth_min_margin_floor(),
            btc_eth_min_margin_equity_pct: default_btc_eth_min_margin_equity_pct(),
            altcoin_max_margin_equity_pct: default_altcoin_max_margin_equity_pct(),
            btc_eth_max_margin_equity_pct: default_btc_eth_max_margin_equity_pct(),
        }
    }
}

impl EngineConfig {
    pub fn is_btc_or_eth(symbol: &str) -> bool {
        matches!(symbol, "BTCUSDT" | "ETHUSDT")
    }

    pub fn leverage_cap(&self, symbol: &str, btc_eth_cap: u32, altcoin_cap: u32) -> u32 {
        if Self::is_btc_or_eth(symbol) {
            btc_eth_cap
        } else {
            altcoin_cap
        }
    }

    pub fn min_margin(&self, symbol: &str, equity: f64) -> f64 {
        if Self::is_btc_or_eth(symbol) {
            self.btc_eth_min_margin_floor
                .max(self.btc_eth_min_margin_equity_pct * equity)
        } else {
            self.altcoin_min_margin_floor
                .max(self.altcoin_min_margin_equity_pct * equity)
        }
    }

    pub fn max_margin(&self, symbol: &str, equity: f64) -> f64 {
        if Self::is_btc_or_eth(symbol) {
            self.btc_eth_max_margin_equity_pct * equity
        } else {
            self.altcoin_max_margin_equity_pct * equity
        }
    }
}

// =============================================================================
// MultiAgentConfig — the neutral type called for by the redesign notes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    FastFirst,
    CollectAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMode {
    Majority,
    Weighted,
    FastFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_agent_weight")]
    pub weight: f64,
}

fn default_agent_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiAgentConfig {
    pub agents: Vec<AgentSpec>,
    #[serde(default = "default_scheduling_mode")]
    pub scheduling: SchedulingMode,
    #[serde(default = "default_consensus_mode")]
    pub consensus: ConsensusMode,
    #[serde(default = "default_max_wait_time_secs")]
    pub max_wait_time_secs: u64,
    #[serde(default = "default_min_quorum")]
    pub min_quorum: usize,
}

fn default_scheduling_mode() -> SchedulingMode {
    SchedulingMode::CollectAll
}
fn default_consensus_mode() -> ConsensusMode {
    ConsensusMode::Majority
}
fn default_max_wait_time_secs() -> u64 {
    30
}
fn default_min_quorum() -> usize {
    1
}

// =============================================================================
// TraderConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderConfig {
    pub trader_id: String,
    pub trader_name: String,
    pub ai_model: String,
    pub exchange_tag: String,

    /// Configured initial-balance baseline. `None` means "recover from the
    /// logger at startup" per §4.10.1.
    #[serde(default)]
    pub initial_balance: Option<f64>,

    #[serde(default = "default_btc_eth_leverage_cap")]
    pub btc_eth_leverage_cap: u32,
    #[serde(default = "default_altcoin_leverage_cap")]
    pub altcoin_leverage_cap: u32,

    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Paper-only auto take-profit threshold (percent). Zero disables the
    /// sweep. Real exchanges ignore this field entirely.
    #[serde(default)]
    pub auto_take_profit_pct: f64,

    /// `None` = no copy trading. `Some("all")` / `Some("portfolio")` = union
    /// of every other trader. `Some(id)` = copy a single trader.
    #[serde(default)]
    pub copy_from: Option<String>,

    #[serde(default)]
    pub multi_agent: Option<MultiAgentConfig>,

    /// New traders start disabled; an operator must explicitly enable them.
    #[serde(default)]
    pub enabled: bool,
}

impl TraderConfig {
    pub fn leverage_cap(&self, symbol: &str) -> u32 {
        if EngineConfig::is_btc_or_eth(symbol) {
            self.btc_eth_leverage_cap
        } else {
            self.altcoin_leverage_cap
        }
    }
}

// =============================================================================
// FleetConfig — top-level file on disk
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FleetConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub traders: Vec<TraderConfig>,
}

impl FleetConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fleet config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse fleet config from {}", path.display()))?;
        info!(path = %path.display(), traders = config.traders.len(), "fleet config loaded");
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise fleet config to JSON")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "fleet config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_engine_config_matches_spec_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.candidate_pool_k, 20);
        assert_eq!(cfg.max_concurrent_positions, 6);
        assert!((cfg.max_single_trade_risk_pct - 0.02).abs() < f64::EPSILON);
        assert!((cfg.liquidity_filter_usd - 15_000_000.0).abs() < f64::EPSILON);
        assert!((cfg.min_risk_reward - 3.0).abs() < f64::EPSILON);
        assert!((cfg.margin_safety_buffer - 1.0).abs() < f64::EPSILON);
        assert!((cfg.min_executable_margin - 5.0).abs() < f64::EPSILON);
        assert_eq!(cfg.profit_monitor_interval_secs, 10);
        assert!((cfg.profit_monitor_pnl_pct_threshold - 4.5).abs() < f64::EPSILON);
    }

    #[test]
    fn min_margin_uses_floor_or_equity_pct_whichever_is_larger() {
        let cfg = EngineConfig::default();
        // altcoin: max(13, 0.15*equity)
        assert!((cfg.min_margin("ADAUSDT", 50.0) - 13.0).abs() < 1e-9);
        assert!((cfg.min_margin("ADAUSDT", 200.0) - 30.0).abs() < 1e-9);
        // btc/eth: max(15, 0.20*equity)
        assert!((cfg.min_margin("BTCUSDT", 50.0) - 15.0).abs() < 1e-9);
        assert!((cfg.min_margin("ETHUSDT", 200.0) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn max_margin_applies_hard_caps() {
        let cfg = EngineConfig::default();
        assert!((cfg.max_margin("ADAUSDT", 100.0) - 40.0).abs() < 1e-9);
        assert!((cfg.max_margin("BTCUSDT", 100.0) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.candidate_pool_k, 20);
        assert_eq!(cfg.max_concurrent_positions, 6);
    }

    #[test]
    fn trader_defaults_disabled() {
        let json = r#"{"trader_id":"t1","trader_name":"Alpha","ai_model":"gpt","exchange_tag":"binance"}"#;
        let cfg: TraderConfig = serde_json::from_str(json).unwrap();
        assert!(!cfg.enabled);
        assert_eq!(cfg.scan_interval_secs, 300);
        assert_eq!(cfg.btc_eth_leverage_cap, 20);
    }
}
