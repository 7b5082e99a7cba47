// =============================================================================
// Multi-agent consensus
// =============================================================================
//
// Runs the configured agent panel, then reconciles conflicting per-symbol
// decisions by the configured consensus mode. Falls back to a single-agent
// call whenever every panel member fails — consensus is an enhancement, not
// a single point of failure for the cycle.

use std::collections::HashMap;

use futures_util::future::{join_all, select_all};
use tracing::warn;

use super::client::{AiClient, HttpAiClient};
use super::prompt;
use crate::config::{ConsensusMode, MultiAgentConfig, SchedulingMode};
use crate::decision::parser::parse_response;
use crate::decision::{Decision, FullDecision, ValidationContext};
use crate::types::Action;

async fn run_panel(
    config: &MultiAgentConfig,
    base_url: &str,
    system_prompt: &str,
    user_prompt: &str,
) -> Vec<(f64, String)> {
    let handles: Vec<_> = config
        .agents
        .iter()
        .map(|agent| {
            let client = HttpAiClient::new(agent.api_key.clone(), base_url.to_string(), agent.model.clone());
            let system_prompt = system_prompt.to_string();
            let user_prompt = user_prompt.to_string();
            let weight = agent.weight;
            tokio::spawn(async move {
                let result = client.complete(&system_prompt, &user_prompt).await;
                (weight, result)
            })
        })
        .collect();

    match config.scheduling {
        SchedulingMode::FastFirst => {
            let mut remaining = handles;
            let mut responses = Vec::new();
            while responses.len() < config.min_quorum && !remaining.is_empty() {
                let (result, _idx, rest) = select_all(remaining).await;
                remaining = rest;
                if let Ok((weight, Ok(text))) = result {
                    responses.push((weight, text));
                }
            }
            responses
        }
        SchedulingMode::CollectAll => {
            let timeout = std::time::Duration::from_secs(config.max_wait_time_secs);
            match tokio::time::timeout(timeout, join_all(handles)).await {
                Ok(results) => results
                    .into_iter()
                    .filter_map(|r| match r {
                        Ok((weight, Ok(text))) => Some((weight, text)),
                        _ => None,
                    })
                    .collect(),
                Err(_) => {
                    warn!("multi-agent panel exceeded max_wait_time, proceeding with no responses");
                    Vec::new()
                }
            }
        }
    }
}

fn reconcile(parsed: Vec<(f64, FullDecision)>, mode: ConsensusMode) -> FullDecision {
    let mut by_symbol: HashMap<String, Vec<(f64, Decision)>> = HashMap::new();
    let mut cot_parts = Vec::new();
    let mut raw_parts = Vec::new();
    let mut user_prompt = String::new();

    for (weight, fd) in &parsed {
        cot_parts.push(fd.cot_trace.clone());
        raw_parts.push(fd.raw_response.clone());
        user_prompt = fd.user_prompt.clone();
        for d in &fd.decisions {
            by_symbol.entry(d.symbol.clone()).or_default().push((*weight, d.clone()));
        }
    }

    let mut combined = Vec::new();
    for (_symbol, votes) in by_symbol {
        let winner: Option<Decision> = match mode {
            ConsensusMode::FastFirst => votes.first().map(|(_, d)| d.clone()),
            ConsensusMode::Majority => {
                let mut counts: HashMap<Action, u32> = HashMap::new();
                for (_, d) in &votes {
                    *counts.entry(d.action).or_insert(0) += 1;
                }
                counts
                    .into_iter()
                    .max_by_key(|(_, c)| *c)
                    .and_then(|(action, _)| votes.iter().find(|(_, d)| d.action == action))
                    .map(|(_, d)| d.clone())
            }
            ConsensusMode::Weighted => {
                let mut weights: HashMap<Action, f64> = HashMap::new();
                for (w, d) in &votes {
                    *weights.entry(d.action).or_insert(0.0) += w;
                }
                weights
                    .into_iter()
                    .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                    .and_then(|(action, _)| votes.iter().find(|(_, d)| d.action == action))
                    .map(|(_, d)| d.clone())
            }
        };
        if let Some(decision) = winner {
            combined.push(decision);
        }
    }

    if combined.is_empty() {
        combined.push(Decision::wait("multi-agent consensus produced no decisions"));
    }

    FullDecision {
        user_prompt,
        cot_trace: cot_parts.join("\n---\n"),
        decisions: combined,
        raw_response: raw_parts.join("\n---\n"),
        timestamp: chrono::Utc::now(),
        used_fallback: false,
        error: None,
    }
}

/// Run the configured agent panel and reconcile their decisions. Falls back
/// to `fallback` (typically the trader's own single-agent client) if every
/// panel member fails to respond.
pub async fn run_multi_agent(
    config: &MultiAgentConfig,
    base_url: &str,
    system_prompt: &str,
    user_prompt: &str,
    ctx: &ValidationContext<'_>,
    fallback: &dyn AiClient,
) -> FullDecision {
    let responses = run_panel(config, base_url, system_prompt, user_prompt).await;

    if responses.is_empty() {
        warn!("multi-agent panel produced no responses, falling back to single-agent");
        let raw = match fallback.complete(system_prompt, user_prompt).await {
            Ok(text) => text,
            Err(e) => e,
        };
        return parse_response(&raw, user_prompt, ctx);
    }

    let parsed: Vec<(f64, FullDecision)> = responses
        .into_iter()
        .map(|(weight, text)| (weight, parse_response(&text, user_prompt, ctx)))
        .collect();

    reconcile(parsed, config.consensus)
}

/// Exposed so a caller can build the shared system/user prompt pair once
/// and pass it into `run_multi_agent` alongside the single-agent path.
pub fn shared_prompts(ctx: &crate::engine::context::Context) -> (String, String) {
    (prompt::build_system_prompt(ctx), prompt::build_user_prompt(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(symbol: &str, action: Action) -> Decision {
        Decision {
            symbol: symbol.to_string(),
            action,
            leverage: None,
            position_size_usd: None,
            stop_loss: None,
            take_profit: None,
            confidence: None,
            risk_usd: None,
            reasoning: String::new(),
        }
    }

    fn full(decisions: Vec<Decision>) -> FullDecision {
        FullDecision {
            user_prompt: "u".to_string(),
            cot_trace: "trace".to_string(),
            decisions,
            raw_response: "raw".to_string(),
            timestamp: chrono::Utc::now(),
            used_fallback: false,
            error: None,
        }
    }

    #[test]
    fn majority_picks_most_common_action_per_symbol() {
        let parsed = vec![
            (1.0, full(vec![decision("BTCUSDT", Action::Hold)])),
            (1.0, full(vec![decision("BTCUSDT", Action::Hold)])),
            (1.0, full(vec![decision("BTCUSDT", Action::OpenLong)])),
        ];
        let result = reconcile(parsed, ConsensusMode::Majority);
        assert_eq!(result.decisions.len(), 1);
        assert_eq!(result.decisions[0].action, Action::Hold);
    }

    #[test]
    fn weighted_consensus_favours_higher_weight_minority() {
        let parsed = vec![
            (1.0, full(vec![decision("ETHUSDT", Action::Hold)])),
            (1.0, full(vec![decision("ETHUSDT", Action::Hold)])),
            (5.0, full(vec![decision("ETHUSDT", Action::OpenShort)])),
        ];
        let result = reconcile(parsed, ConsensusMode::Weighted);
        assert_eq!(result.decisions[0].action, Action::OpenShort);
    }

    #[test]
    fn empty_panel_yields_wait_decision() {
        let result = reconcile(Vec::<(f64, FullDecision)>::new(), ConsensusMode::Majority);
        assert_eq!(result.decisions[0].action, Action::Wait);
    }
}
