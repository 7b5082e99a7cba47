// =============================================================================
// Background profitable-position monitor
// =============================================================================
//
// Runs once per trader as its own Tokio task, independent of the scan-decide
// cycle's `scan_interval_secs`. Every tick it collects the positions that
// have crossed the profit-lock threshold *outside* any lock, then acts on
// that list — the same two-phase shape the teacher's exit monitor uses, so a
// slow exchange call during the act phase never holds up the next symbol's
// read.
// =============================================================================

use std::sync::Arc;

use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::trader::{OrderOutcome, Trader, TraderError};
use crate::types::{Side, TraderState};

use super::cycle::TraderEngine;
use super::locks::PositionClosingLocks;

/// Run until `engine` stops, closing any position whose PnL% has crossed the
/// configured threshold. Intended to be spawned once per trader at startup;
/// `TraderEngine::stop` is observed at the top of every tick so the task
/// terminates alongside the rest of that trader's engine instead of
/// continuing to close positions after it has stopped.
pub async fn run_profit_monitor(engine: Arc<TraderEngine>) {
    let trader_id = engine.trader_id.clone();
    let trader = engine.trader();
    let engine_config = engine.engine_config_handle();
    let locks = engine.locks();

    info!(
        trader_id = %trader_id,
        interval_secs = engine_config.profit_monitor_interval_secs,
        threshold_pct = engine_config.profit_monitor_pnl_pct_threshold,
        "profit monitor started"
    );

    let mut ticker = interval(Duration::from_secs(engine_config.profit_monitor_interval_secs));

    loop {
        ticker.tick().await;

        if matches!(engine.state(), TraderState::Stopped) {
            info!(trader_id = %trader_id, "profit monitor stopping: engine stopped");
            break;
        }

        let positions = match trader.positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(trader_id = %trader_id, error = %e, "profit monitor: failed to fetch positions");
                continue;
            }
        };

        if positions.is_empty() {
            debug!(trader_id = %trader_id, "profit monitor: no open positions");
            continue;
        }

        let to_close: Vec<(String, Side)> = positions
            .iter()
            .filter(|p| p.unrealized_pnl > 0.0 && p.pnl_pct() >= engine_config.profit_monitor_pnl_pct_threshold)
            .map(|p| (p.symbol.clone(), p.side))
            .collect();

        for (symbol, side) in to_close {
            close_if_still_profitable(&trader_id, &trader, &locks, &symbol, side, &engine_config).await;
        }
    }
}

/// Re-verify under the closing lock before acting: the cycle engine or an
/// API-initiated close may have already touched this position between the
/// read above and this task acquiring the lock.
async fn close_if_still_profitable(
    trader_id: &str,
    trader: &Arc<dyn Trader>,
    locks: &Arc<PositionClosingLocks>,
    symbol: &str,
    side: Side,
    engine_config: &EngineConfig,
) {
    let lock = locks.get(symbol, side);
    let _guard = lock.lock().await;

    let positions = match trader.positions().await {
        Ok(p) => p,
        Err(e) => {
            warn!(trader_id, symbol, error = %e, "profit monitor: re-fetch failed, skipping close");
            return;
        }
    };
    let position = match positions.iter().find(|p| p.symbol == symbol && p.side == side) {
        Some(p) => p,
        None => {
            debug!(trader_id, symbol, "profit monitor: position already gone, nothing to close");
            return;
        }
    };
    if !(position.unrealized_pnl > 0.0 && position.pnl_pct() >= engine_config.profit_monitor_pnl_pct_threshold) {
        debug!(trader_id, symbol, "profit monitor: position no longer past threshold, skipping");
        return;
    }

    let result = match side {
        Side::Long => trader.close_long(symbol).await,
        Side::Short => trader.close_short(symbol).await,
    };

    match result {
        Ok(OrderOutcome::Filled { order_id, avg_price, .. }) => {
            info!(trader_id, symbol, order_id, avg_price, pnl_pct = position.pnl_pct(), "profit monitor closed position");
        }
        Ok(OrderOutcome::Rejected { reason }) => {
            warn!(trader_id, symbol, reason, "profit monitor: close rejected by exchange");
        }
        // A race with a concurrent close (API, cycle) or a clock drift error
        // is benign here — the position is either already gone or will be
        // retried next tick.
        Err(TraderError::AlreadyClosed) => {
            debug!(trader_id, symbol, "profit monitor: position closed by a concurrent actor");
        }
        Err(TraderError::RecvWindowExpired) => {
            warn!(trader_id, symbol, "profit monitor: recvWindow expired, will retry next tick");
        }
        Err(e) => {
            warn!(trader_id, symbol, error = %e, "profit monitor: close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trader::paper::PaperTrader;

    #[tokio::test]
    async fn closes_position_past_threshold() {
        let trader: Arc<dyn Trader> = Arc::new(PaperTrader::new("t1", 1000.0));
        trader.update_mark_price("ETHUSDT", 100.0);
        trader.open_long("ETHUSDT", 1.0, 10).await.unwrap();
        trader.update_mark_price("ETHUSDT", 105.0); // pnl_pct = 50%

        let engine_config = Arc::new(EngineConfig::default());
        let locks = Arc::new(PositionClosingLocks::new());

        close_if_still_profitable("t1", &trader, &locks, "ETHUSDT", Side::Long, &engine_config).await;

        assert!(trader.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leaves_unprofitable_position_untouched() {
        let trader: Arc<dyn Trader> = Arc::new(PaperTrader::new("t1", 1000.0));
        trader.update_mark_price("ETHUSDT", 100.0);
        trader.open_long("ETHUSDT", 1.0, 10).await.unwrap();
        trader.update_mark_price("ETHUSDT", 99.0); // negative pnl

        let engine_config = Arc::new(EngineConfig::default());
        let locks = Arc::new(PositionClosingLocks::new());

        close_if_still_profitable("t1", &trader, &locks, "ETHUSDT", Side::Long, &engine_config).await;

        assert_eq!(trader.positions().await.unwrap().len(), 1);
    }
}
