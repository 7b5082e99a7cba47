// =============================================================================
// Sled-backed decision store — one tree per trader
// =============================================================================

use std::convert::TryInto;

use super::{DecisionLogger, LoggerError};
use crate::decision::DecisionRecord;

/// Cycle 0 is reserved for the initialisation seed row; real cycles start
/// at 1 and increment monotonically per trader.
const SEED_KEY: u64 = 0;

pub struct SledDecisionStore {
    tree: sled::Tree,
}

impl SledDecisionStore {
    pub fn open(db: &sled::Db, trader_id: &str) -> Result<Self, LoggerError> {
        let tree = db
            .open_tree(format!("decisions_{trader_id}"))
            .map_err(|e| LoggerError::Storage(e.to_string()))?;
        Ok(Self { tree })
    }

    fn next_cycle_number(&self) -> Result<u64, LoggerError> {
        let max = self
            .tree
            .iter()
            .keys()
            .filter_map(|k| k.ok())
            .filter_map(|k| k.as_ref().try_into().ok().map(u64::from_be_bytes))
            .filter(|&n| n != SEED_KEY)
            .max();
        Ok(max.map(|m| m + 1).unwrap_or(1))
    }

    fn decode(bytes: sled::IVec) -> Result<DecisionRecord, LoggerError> {
        serde_json::from_slice(&bytes).map_err(LoggerError::Serde)
    }
}

impl DecisionLogger for SledDecisionStore {
    fn log_decision(&self, mut record: DecisionRecord) -> Result<u64, LoggerError> {
        let cycle_number = self.next_cycle_number()?;
        record.cycle_number = cycle_number;
        let value = serde_json::to_vec(&record)?;
        self.tree
            .insert(cycle_number.to_be_bytes(), value)
            .map_err(|e| LoggerError::Storage(e.to_string()))?;
        self.tree.flush().map_err(|e| LoggerError::Storage(e.to_string()))?;
        Ok(cycle_number)
    }

    fn write_seed(&self, mut record: DecisionRecord) -> Result<(), LoggerError> {
        record.cycle_number = SEED_KEY;
        let value = serde_json::to_vec(&record)?;
        self.tree
            .insert(SEED_KEY.to_be_bytes(), value)
            .map_err(|e| LoggerError::Storage(e.to_string()))?;
        self.tree.flush().map_err(|e| LoggerError::Storage(e.to_string()))?;
        Ok(())
    }

    fn get_latest_records(&self, n: usize) -> Result<Vec<DecisionRecord>, LoggerError> {
        let mut out = Vec::new();
        for entry in self.tree.iter().rev().take(n) {
            let (_, value) = entry.map_err(|e| LoggerError::Storage(e.to_string()))?;
            out.push(Self::decode(value)?);
        }
        out.reverse();
        Ok(out)
    }

    fn get_all_records(&self) -> Result<Vec<DecisionRecord>, LoggerError> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let (_, value) = entry.map_err(|e| LoggerError::Storage(e.to_string()))?;
            out.push(Self::decode(value)?);
        }
        Ok(out)
    }

    fn get_first_record(&self) -> Result<Option<DecisionRecord>, LoggerError> {
        match self.tree.iter().next() {
            Some(entry) => {
                let (_, value) = entry.map_err(|e| LoggerError::Storage(e.to_string()))?;
                Ok(Some(Self::decode(value)?))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::AccountStateSnapshot;

    fn account() -> AccountStateSnapshot {
        AccountStateSnapshot {
            total_equity: 1000.0,
            available_balance: 900.0,
            total_unrealized_profit: 0.0,
            position_count: 0,
            margin_used_pct: 0.0,
        }
    }

    fn open_store() -> SledDecisionStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SledDecisionStore::open(&db, "t1").unwrap()
    }

    #[test]
    fn seed_row_does_not_collide_with_real_cycles() {
        let store = open_store();
        store.write_seed(DecisionRecord::seed("t1", account())).unwrap();
        let c1 = store
            .log_decision(DecisionRecord::seed("t1", account()))
            .unwrap();
        assert_eq!(c1, 1);
        let all = store.get_all_records().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].cycle_number, 0);
        assert_eq!(all[1].cycle_number, 1);
    }

    #[test]
    fn cycle_numbers_increment_monotonically() {
        let store = open_store();
        for _ in 0..3 {
            store.log_decision(DecisionRecord::seed("t1", account())).unwrap();
        }
        let all = store.get_all_records().unwrap();
        let cycles: Vec<u64> = all.iter().map(|r| r.cycle_number).collect();
        assert_eq!(cycles, vec![1, 2, 3]);
    }

    #[test]
    fn get_latest_returns_newest_last() {
        let store = open_store();
        for _ in 0..5 {
            store.log_decision(DecisionRecord::seed("t1", account())).unwrap();
        }
        let latest = store.get_latest_records(2).unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].cycle_number, 4);
        assert_eq!(latest[1].cycle_number, 5);
    }

    #[test]
    fn get_first_record_returns_absolute_earliest() {
        let store = open_store();
        store.write_seed(DecisionRecord::seed("t1", account())).unwrap();
        store.log_decision(DecisionRecord::seed("t1", account())).unwrap();
        let first = store.get_first_record().unwrap().unwrap();
        assert_eq!(first.cycle_number, 0);
    }
}
