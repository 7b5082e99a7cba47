// =============================================================================
// Response parser — chain-of-thought extraction + decision array parsing
// =============================================================================
//
// The hardest piece in the crate: AI output is free text that *usually*
// ends with a JSON array of decisions, but fences, smart quotes, trailing
// commas, and truncated output are all routine. This module never fails —
// `parse_response` always returns a `FullDecision` with at least one
// decision, falling back to a single `wait` when no array can be recovered.
// =============================================================================

use serde::Deserialize;
use serde_json::Value;

use super::{validate_decision, Decision, FullDecision, ValidationContext};
use crate::types::Action;

/// Scan `response` forward, then backward, for a `[` that opens a JSON array
/// of decision objects. Returns the byte offset of that `[` plus the parsed
/// decisions. This is the function the chain-of-thought boundary and the
/// decision array itself both derive from.
fn locate_and_parse(s: &str) -> Option<(usize, Vec<RawDecision>)> {
    let mut search_from = 0;
    while let Some(rel) = s[search_from..].find('[') {
        let idx = search_from + rel;
        if next_non_whitespace(s, idx + 1).map(|(_, c)| c) == Some('{') {
            if let Some(end) = find_matching_bracket(s, idx) {
                if let Some(decisions) = try_parse_decisions(&s[idx..=end]) {
                    return Some((idx, decisions));
                }
            }
        }
        search_from = idx + 1;
    }

    let open_positions: Vec<usize> = s
        .char_indices()
        .filter(|&(_, c)| c == '[')
        .map(|(i, _)| i)
        .collect();
    for &idx in open_positions.iter().rev() {
        if let Some(end) = find_matching_bracket(s, idx) {
            if let Some(decisions) = try_parse_decisions(&s[idx..=end]) {
                return Some((idx, decisions));
            }
        }
    }
    None
}

fn next_non_whitespace(s: &str, from_byte: usize) -> Option<(usize, char)> {
    if from_byte > s.len() {
        return None;
    }
    s[from_byte..]
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map(|(off, c)| (from_byte + off, c))
}

/// Depth-counted search for the `]` matching the `[` at `open_byte_idx`,
/// treating string-literal content (including escapes) as opaque.
fn find_matching_bracket(s: &str, open_byte_idx: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (idx, c) in s[open_byte_idx..].char_indices() {
        let abs = open_byte_idx + idx;
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(abs);
                }
            }
            _ => {}
        }
    }
    None
}

fn normalise_quotes(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect()
}

/// Remove a comma that is immediately followed (ignoring whitespace) by `}`
/// or `]` — conservative in that it never touches commas that separate real
/// elements.
fn strip_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escape = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }
        if c == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

fn try_parse_decisions(slice: &str) -> Option<Vec<RawDecision>> {
    let cleaned = strip_trailing_commas(&normalise_quotes(slice));
    let raw: Vec<RawDecision> = serde_json::from_str(&cleaned).ok()?;
    if raw.is_empty() {
        None
    } else {
        Some(raw)
    }
}

/// Find the first ```json fenced block, returning its content and the byte
/// offset at which that content begins in the original response.
fn extract_fenced_json(response: &str) -> Option<(String, usize)> {
    let marker = "```json";
    let start = response.find(marker)?;
    let content_start = start + marker.len();
    let end_rel = response[content_start..].find("```")?;
    Some((response[content_start..content_start + end_rel].to_string(), content_start))
}

/// Find the first fenced block with any (or no) language tag.
fn extract_fenced_any(response: &str) -> Option<(String, usize)> {
    let start = response.find("```")?;
    let after_marker = start + 3;
    let line_end = response[after_marker..]
        .find('\n')
        .map(|p| after_marker + p)
        .unwrap_or(after_marker);
    let content_start = line_end + 1;
    if content_start >= response.len() {
        return None;
    }
    let end_rel = response[content_start..].find("```")?;
    Some((response[content_start..content_start + end_rel].to_string(), content_start))
}

/// Run the full extraction pipeline: fenced ```json, then any fenced block,
/// then a bare array anywhere in the response. Returns the offset of the
/// opening `[` within the *original* response plus the raw decisions.
fn extract_decisions(response: &str) -> Option<(usize, Vec<RawDecision>)> {
    if let Some((content, offset)) = extract_fenced_json(response) {
        if let Some((rel, decisions)) = locate_and_parse(&content) {
            return Some((offset + rel, decisions));
        }
    }
    if let Some((content, offset)) = extract_fenced_any(response) {
        if let Some((rel, decisions)) = locate_and_parse(&content) {
            return Some((offset + rel, decisions));
        }
    }
    locate_and_parse(response)
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    symbol: Option<String>,
    action: Option<String>,
    leverage: Option<Value>,
    position_size_usd: Option<Value>,
    stop_loss: Option<Value>,
    take_profit: Option<Value>,
    confidence: Option<Value>,
    risk_usd: Option<Value>,
    reasoning: Option<String>,
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn value_to_u32(v: &Value) -> Option<u32> {
    value_to_f64(v).map(|f| f.round() as u32)
}

impl RawDecision {
    /// Coerce into a `Decision`, recognising the action string loosely.
    /// Returns `None` only when the action itself is unrecognised — every
    /// other missing field is deferred to full validation so the caller can
    /// report a precise error.
    fn into_decision(self) -> Option<Decision> {
        let action = Action::parse_loose(self.action.as_deref().unwrap_or(""))?;
        Some(Decision {
            symbol: self.symbol.unwrap_or_else(|| "ALL".to_string()),
            action,
            leverage: self.leverage.as_ref().and_then(value_to_u32),
            position_size_usd: self.position_size_usd.as_ref().and_then(value_to_f64),
            stop_loss: self.stop_loss.as_ref().and_then(value_to_f64),
            take_profit: self.take_profit.as_ref().and_then(value_to_f64),
            confidence: self.confidence.as_ref().and_then(value_to_f64),
            risk_usd: self.risk_usd.as_ref().and_then(value_to_f64),
            reasoning: self.reasoning.unwrap_or_default(),
        })
    }
}

fn first_line_or_200_chars(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or(text).trim();
    if first_line.chars().count() > 200 {
        first_line.chars().take(200).collect()
    } else {
        first_line.to_string()
    }
}

/// Parse one raw AI response into a `FullDecision`. Never errors: a
/// response with no recoverable JSON array yields a single `wait` decision
/// with `used_fallback = true`.
pub fn parse_response(
    raw_response: &str,
    user_prompt: &str,
    ctx: &ValidationContext,
) -> FullDecision {
    let extraction = extract_decisions(raw_response);

    let json_start = extraction.as_ref().map(|(idx, _)| *idx);
    let cot_trace = match json_start {
        Some(idx) => {
            let pre = raw_response[..idx].trim();
            if pre.is_empty() {
                raw_response.chars().take(1000).collect()
            } else {
                pre.to_string()
            }
        }
        None => {
            if raw_response.trim().is_empty() {
                raw_response.chars().take(1000).collect()
            } else {
                raw_response.to_string()
            }
        }
    };

    let Some((_, raw_decisions)) = extraction else {
        return FullDecision {
            user_prompt: user_prompt.to_string(),
            cot_trace: cot_trace.clone(),
            decisions: vec![Decision::wait(first_line_or_200_chars(&cot_trace))],
            raw_response: raw_response.to_string(),
            timestamp: chrono::Utc::now(),
            used_fallback: true,
            error: None,
        };
    };

    let mut decisions = Vec::with_capacity(raw_decisions.len());
    let mut first_error: Option<String> = None;

    for raw in raw_decisions {
        let raw_action = raw.action.clone().unwrap_or_default();
        match raw.into_decision() {
            None => {
                if first_error.is_none() {
                    first_error = Some(format!("unrecognised action: {raw_action}"));
                }
            }
            Some(decision) => {
                if decision.action.is_open() {
                    match validate_decision(decision, ctx) {
                        Ok(adjusted) => decisions.push(adjusted),
                        Err(e) => {
                            if first_error.is_none() {
                                first_error = Some(e.to_string());
                            }
                        }
                    }
                } else {
                    decisions.push(decision);
                }
            }
        }
    }

    if decisions.is_empty() {
        decisions.push(Decision::wait(first_line_or_200_chars(&cot_trace)));
    }

    FullDecision {
        user_prompt: user_prompt.to_string(),
        cot_trace,
        decisions,
        raw_response: raw_response.to_string(),
        timestamp: chrono::Utc::now(),
        used_fallback: false,
        error: first_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::collections::HashMap;

    fn ctx<'a>(prices: &'a HashMap<String, f64>, engine: &'a EngineConfig) -> ValidationContext<'a> {
        ValidationContext {
            equity: 10_000.0,
            btc_eth_leverage_cap: 20,
            altcoin_leverage_cap: 10,
            engine,
            prices,
        }
    }

    #[test]
    fn extracts_fenced_json_with_smart_quotes_and_trailing_comma() {
        let response = r#"Some reasoning text here.

```json
[
  {“symbol”: “BTCUSDT”, “action”: “hold”, “reasoning”: “steady”,}
]
```
"#;
        let engine = EngineConfig::default();
        let prices = HashMap::new();
        let full = parse_response(response, "prompt", &ctx(&prices, &engine));
        assert!(!full.used_fallback);
        assert_eq!(full.decisions.len(), 1);
        assert_eq!(full.decisions[0].symbol, "BTCUSDT");
        assert_eq!(full.decisions[0].action, Action::Hold);
        assert!(full.cot_trace.contains("Some reasoning text"));
    }

    #[test]
    fn malformed_json_falls_back_to_wait() {
        let response = "...analysis... decisions: [ { symbol: \"BTC\", action: open_long, ";
        let engine = EngineConfig::default();
        let prices = HashMap::new();
        let full = parse_response(response, "prompt", &ctx(&prices, &engine));
        assert!(full.used_fallback);
        assert_eq!(full.decisions.len(), 1);
        assert_eq!(full.decisions[0].action, Action::Wait);
        assert_eq!(full.decisions[0].symbol, "ALL");
    }

    #[test]
    fn bare_array_without_fence_is_recovered() {
        let response = r#"I think we should wait. [{"symbol": "ALL", "action": "wait", "reasoning": "no edge"}]"#;
        let engine = EngineConfig::default();
        let prices = HashMap::new();
        let full = parse_response(response, "prompt", &ctx(&prices, &engine));
        assert!(!full.used_fallback);
        assert_eq!(full.decisions[0].action, Action::Wait);
    }

    #[test]
    fn invalid_open_decision_surfaces_error_but_keeps_guarantee() {
        let response = r#"[{"symbol": "ADAUSDT", "action": "open_long", "leverage": 50, "position_size_usd": 20, "stop_loss": 0.9, "take_profit": 1.5, "reasoning": "x"}]"#;
        let engine = EngineConfig::default();
        let mut prices = HashMap::new();
        prices.insert("ADAUSDT".to_string(), 1.0);
        let full = parse_response(response, "prompt", &ctx(&prices, &engine));
        assert!(full.error.is_some());
        assert!(!full.decisions.is_empty());
    }

    #[test]
    fn numeric_array_is_not_mistaken_for_decisions() {
        let response = "weights considered: [1, 2, 3] then [{\"symbol\": \"ALL\", \"action\": \"wait\", \"reasoning\": \"ok\"}]";
        let engine = EngineConfig::default();
        let prices = HashMap::new();
        let full = parse_response(response, "prompt", &ctx(&prices, &engine));
        assert!(!full.used_fallback);
        assert_eq!(full.decisions[0].action, Action::Wait);
    }
}
