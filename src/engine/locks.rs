// =============================================================================
// Position-closing locks — process-wide "SYMBOL_SIDE" -> mutex map
// =============================================================================
//
// Created lazily under a small guarding mutex, never released: the universe
// of symbols is bounded so the map's memory footprint never grows unbounded.
// Every close path — a cycle's sorted execution, the background monitor, and
// the API's close endpoints — acquires through this same map, so a
// user-initiated close and a monitor close on the same position can never
// race each other.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Default)]
pub struct PositionClosingLocks {
    map: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PositionClosingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(symbol: &str, side: crate::types::Side) -> String {
        format!("{}_{}", symbol.to_uppercase(), side.to_string().to_uppercase())
    }

    /// Fetch (creating if necessary) the mutex guarding `(symbol, side)`.
    pub fn get(&self, symbol: &str, side: crate::types::Side) -> Arc<tokio::sync::Mutex<()>> {
        let key = Self::key(symbol, side);
        let mut map = self.map.lock();
        map.entry(key).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    #[tokio::test]
    async fn same_symbol_side_returns_same_mutex() {
        let locks = PositionClosingLocks::new();
        let a = locks.get("BTCUSDT", Side::Long);
        let b = locks.get("btcusdt", Side::Long);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn distinct_sides_get_distinct_mutexes() {
        let locks = PositionClosingLocks::new();
        let long = locks.get("BTCUSDT", Side::Long);
        let short = locks.get("BTCUSDT", Side::Short);
        assert!(!Arc::ptr_eq(&long, &short));
    }

    #[tokio::test]
    async fn lock_serialises_concurrent_closes() {
        let locks = PositionClosingLocks::new();
        let m = locks.get("ETHUSDT", Side::Long);
        let _guard = m.lock().await;
        let m2 = locks.get("ETHUSDT", Side::Long);
        let try_lock = m2.try_lock();
        assert!(try_lock.is_err());
    }
}
