// =============================================================================
// Prompt builder — fixed system prompt, dynamic user prompt
// =============================================================================

use std::fmt::Write as _;

use crate::engine::context::Context;
use crate::market::CandidateSource;
use crate::types::MarketRegime;

/// Static contract the AI cannot drift from: mission, hard risk limits, the
/// margin bands computed from the account's *current* equity, the regime
/// vocabulary, and the exact two-part output format.
pub fn build_system_prompt(ctx: &Context) -> String {
    let equity = ctx.account.equity;
    let alt_min = 0.15 * equity;
    let alt_max = 0.25 * equity;
    let alt_hard_max = 0.40 * equity;
    let major_min = 0.20 * equity;
    let major_max = 0.35 * equity;
    let major_hard_max = 0.50 * equity;

    let mut s = String::new();
    let _ = writeln!(
        s,
        "You trade USDⓈ-M perpetual futures. Your objective is to maximise risk-adjusted \
         return (Sharpe ratio) over many cycles, not to win every trade."
    );
    let _ = writeln!(s, "\nHARD CONSTRAINTS (violating any of these invalidates the decision):");
    let _ = writeln!(s, "- Maximum risk per trade: 2% of account equity ({:.2} USDT here).", equity * 0.02);
    let _ = writeln!(s, "- Every opened position must carry a risk-reward ratio of at least 3:1, measured from an assumed entry 20% into the stop-to-take-profit range.");
    let _ = writeln!(s, "- Maximum {} concurrent open positions across the whole account.", 6);
    let _ = writeln!(
        s,
        "- Margin bands (position_size_usd, i.e. margin, not notional): altcoins {:.2}-{:.2} USDT (hard maximum {:.2}); BTC/ETH {:.2}-{:.2} USDT (hard maximum {:.2}).",
        alt_min, alt_max, alt_hard_max, major_min, major_max, major_hard_max
    );
    let _ = writeln!(
        s,
        "- Leverage caps: {}x on BTC/ETH, {}x on altcoins.",
        ctx.btc_eth_leverage, ctx.altcoin_leverage
    );
    let _ = writeln!(s, "- Long positions require stop_loss < take_profit; short positions require stop_loss > take_profit.");
    let _ = writeln!(s, "- Stop-loss orders are never placed on the exchange — sizing and re-evaluation each cycle are the only protection against adverse moves.");

    let _ = writeln!(s, "\nMARKET REGIME (derived from BTC's 1h and 4h percentage change):");
    let _ = writeln!(s, "- CRASHING: BTC down at least 1% over 1h and at least 0.5% over 4h. Prefer closes and shorts, avoid new longs.");
    let _ = writeln!(s, "- BULLISH: BTC up at least 1% over 1h and at least 0.5% over 4h. Longs favoured, stay alert to reversals.");
    let _ = writeln!(s, "- NEUTRAL: neither threshold met. Trade the individual candidate's own setup.");

    let _ = writeln!(s, "\nREQUIRED OUTPUT FORMAT:");
    let _ = writeln!(s, "1. A chain-of-thought section explaining your read of the market and each candidate you considered.");
    let _ = writeln!(
        s,
        "2. A fenced ```json code block containing a JSON array of decision objects, each with: \
         symbol, action (one of open_long, open_short, close_long, close_short, hold, wait), \
         leverage, position_size_usd (margin in USDT), stop_loss, take_profit, confidence (0-100), reasoning."
    );
    let _ = writeln!(s, "Emit at least one decision; use action \"wait\" with symbol \"ALL\" if nothing qualifies.");

    s
}

/// Dynamic per-cycle snapshot: regime label, account line, risk guardrail,
/// positions with holding duration, candidates with formatted market data,
/// and a performance recap split into recent wins/losses.
pub fn build_user_prompt(ctx: &Context) -> String {
    let mut s = String::new();

    let regime_label = match ctx.regime {
        MarketRegime::Crashing => "CRASHING — BTC is falling hard on both the 1h and 4h window.",
        MarketRegime::Bullish => "BULLISH — BTC is rallying on both the 1h and 4h window.",
        MarketRegime::Neutral => "NEUTRAL — no strong directional signal from BTC.",
    };
    let _ = writeln!(s, "Market regime: {regime_label}");

    let _ = writeln!(
        s,
        "\nAccount: equity={:.2} USDT, wallet={:.2}, available={:.2}, total_pnl={:.2} ({:.2}%), margin_used={:.2} ({:.2}%), open_positions={}",
        ctx.account.equity,
        ctx.account.wallet,
        ctx.account.available,
        ctx.account.total_pnl,
        ctx.account.total_pnl_pct,
        ctx.account.margin_used,
        ctx.account.margin_used_pct,
        ctx.account.position_count,
    );
    let _ = writeln!(
        s,
        "Risk guardrail: no single new position may risk more than {:.2} USDT.",
        ctx.account.equity * 0.02
    );

    if ctx.positions.is_empty() {
        let _ = writeln!(s, "\nOpen positions: none.");
    } else {
        let _ = writeln!(s, "\nOpen positions:");
        for p in &ctx.positions {
            let _ = writeln!(
                s,
                "- {} {} qty={:.4} entry={:.4} mark={:.4} leverage={}x pnl={:.2} ({:.2}%) held_for={}m",
                p.symbol,
                p.side,
                p.quantity,
                p.entry_price,
                p.mark_price,
                p.leverage,
                p.unrealized_pnl,
                p.unrealized_pnl_pct,
                p.holding_duration_secs / 60,
            );
        }
    }

    if ctx.candidate_coins.is_empty() {
        let _ = writeln!(s, "\nCandidates: none passed the liquidity filter this cycle.");
    } else {
        let _ = writeln!(s, "\nCandidates:");
        for c in &ctx.candidate_coins {
            let tag = match c.source {
                CandidateSource::Scored => "scored",
                CandidateSource::OpenInterestTop => "oi_top",
                CandidateSource::Both => "scored+oi_top",
            };
            let snap = &c.snapshot;
            let _ = writeln!(
                s,
                "- {} [{tag}] price={:.4} 1h={:.2}% 4h={:.2}% 24h={:.2}% oi_usd={:.0} funding={:.4}% rsi14={} adx={} atr%={}",
                snap.symbol,
                snap.price,
                snap.change_1h_pct,
                snap.change_4h_pct,
                snap.change_24h_pct,
                snap.open_interest_usd,
                snap.funding_rate_pct,
                fmt_opt(snap.rsi_14),
                fmt_opt(snap.adx),
                fmt_opt(snap.atr_pct),
            );
        }
    }

    let _ = writeln!(
        s,
        "\nPerformance (last {} trades): win_rate={:.1}% profit_factor={:.2} sharpe={:.2}",
        ctx.performance.total_trades,
        ctx.performance.win_rate * 100.0,
        ctx.performance.profit_factor,
        ctx.performance.sharpe_ratio,
    );

    let (wins, losses): (Vec<_>, Vec<_>) = ctx
        .performance
        .recent_trades
        .iter()
        .partition(|t| t.pnl >= 0.0);

    if !losses.is_empty() {
        let _ = writeln!(s, "Recent losses (learn from these):");
        for t in losses.iter().take(5) {
            let _ = writeln!(s, "- {} {} pnl={:.2} ({:.2}%)", t.symbol, t.side, t.pnl, t.pnl_pct);
        }
    }
    if !wins.is_empty() {
        let _ = writeln!(s, "Recent wins (what worked):");
        for t in wins.iter().take(5) {
            let _ = writeln!(s, "- {} {} pnl={:.2} ({:.2}%)", t.symbol, t.side, t.pnl, t.pnl_pct);
        }
    }

    let _ = writeln!(
        s,
        "\nRespond with your chain-of-thought followed by a ```json fenced array of decision objects, as specified."
    );

    s
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|n| format!("{n:.2}")).unwrap_or_else(|| "n/a".to_string())
}
