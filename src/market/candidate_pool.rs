// =============================================================================
// Candidate pool — merge the scored top-K with the full open-interest leaders
// =============================================================================
//
// Two sources feed the pool: a scored shortlist (momentum + volatility) and
// the raw open-interest leaderboard. Both are liquidity-filtered first, then
// merged with de-duplication; a symbol present in both sources keeps the
// higher-priority tag so the prompt builder can explain why it's there.

use serde::{Deserialize, Serialize};

use super::snapshot::MarketSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// Appears in the momentum/volatility-scored top-K.
    Scored,
    /// Appears in the raw open-interest leaderboard only.
    OpenInterestTop,
    /// Appears in both.
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub snapshot: MarketSnapshot,
    pub score: f64,
    pub source: CandidateSource,
}

/// Momentum + volatility score used to rank the scored shortlist. Weighted
/// toward recent momentum (1h) with a smaller contribution from the 4h trend
/// and volatility (ATR%), so a symbol that is merely volatile without moving
/// doesn't crowd out genuine momentum names.
fn score_snapshot(snap: &MarketSnapshot) -> f64 {
    let momentum = snap.change_1h_pct.abs() * 0.6 + snap.change_4h_pct.abs() * 0.3;
    let volatility = snap.atr_pct.unwrap_or(0.0) * 0.1;
    momentum + volatility
}

/// Build the merged candidate pool from a liquidity-filtered universe.
///
/// `pool_k` candidates come from the momentum/volatility score, ranked
/// descending; every symbol that survives the liquidity filter is also a
/// member of the open-interest-top source, tagged `Both` when it's also in
/// the scored list.
pub fn build_candidate_pool(
    universe: &[MarketSnapshot],
    liquidity_threshold_usd: f64,
    pool_k: usize,
) -> Vec<Candidate> {
    let liquid: Vec<&MarketSnapshot> = universe
        .iter()
        .filter(|s| s.passes_liquidity_filter(liquidity_threshold_usd))
        .collect();

    let mut scored: Vec<(&MarketSnapshot, f64)> =
        liquid.iter().map(|s| (*s, score_snapshot(s))).collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let scored_symbols: std::collections::HashSet<&str> = scored
        .iter()
        .take(pool_k)
        .map(|(s, _)| s.symbol.as_str())
        .collect();

    let mut oi_ranked: Vec<&MarketSnapshot> = liquid.clone();
    oi_ranked.sort_by(|a, b| {
        b.open_interest_usd
            .partial_cmp(&a.open_interest_usd)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut seen = std::collections::HashSet::new();
    let mut candidates = Vec::new();

    for (snap, score) in scored.into_iter().take(pool_k) {
        seen.insert(snap.symbol.clone());
        candidates.push(Candidate {
            snapshot: snap.clone(),
            score,
            source: CandidateSource::Scored,
        });
    }

    for snap in oi_ranked {
        if seen.contains(&snap.symbol) {
            if let Some(c) = candidates.iter_mut().find(|c| c.snapshot.symbol == snap.symbol) {
                c.source = CandidateSource::Both;
            }
            continue;
        }
        seen.insert(snap.symbol.clone());
        let in_scored = scored_symbols.contains(snap.symbol.as_str());
        candidates.push(Candidate {
            snapshot: snap.clone(),
            score: score_snapshot(snap),
            source: if in_scored {
                CandidateSource::Both
            } else {
                CandidateSource::OpenInterestTop
            },
        });
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(symbol: &str, change_1h: f64, oi_usd: f64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.to_string(),
            price: 100.0,
            change_1h_pct: change_1h,
            change_4h_pct: change_1h * 0.5,
            change_24h_pct: change_1h,
            volume_24h_usd: 50_000_000.0,
            open_interest_usd: oi_usd,
            funding_rate_pct: 0.0,
            rsi_14: None,
            ema_trend_aligned: None,
            atr_pct: Some(1.0),
            adx: None,
        }
    }

    #[test]
    fn liquidity_filter_drops_illiquid_symbols() {
        let universe = vec![snap("A", 5.0, 1_000_000.0), snap("B", 1.0, 20_000_000.0)];
        let pool = build_candidate_pool(&universe, 15_000_000.0, 20);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].snapshot.symbol, "B");
    }

    #[test]
    fn symbol_in_both_sources_tagged_both() {
        let universe = vec![snap("A", 5.0, 100_000_000.0), snap("B", 0.1, 200_000_000.0)];
        let pool = build_candidate_pool(&universe, 15_000_000.0, 1);
        // A scores highest (momentum) and is also OI-top overall? B has higher OI.
        let a = pool.iter().find(|c| c.snapshot.symbol == "A").unwrap();
        assert_eq!(a.source, CandidateSource::Scored);
        let b = pool.iter().find(|c| c.snapshot.symbol == "B").unwrap();
        assert_eq!(b.source, CandidateSource::OpenInterestTop);
    }

    #[test]
    fn pool_caps_scored_slice_at_pool_k() {
        let universe: Vec<MarketSnapshot> = (0..30)
            .map(|i| snap(&format!("SYM{i}"), i as f64, 50_000_000.0))
            .collect();
        let pool = build_candidate_pool(&universe, 15_000_000.0, 20);
        let scored_count = pool
            .iter()
            .filter(|c| matches!(c.source, CandidateSource::Scored | CandidateSource::Both))
            .count();
        assert!(scored_count <= 20);
    }
}
