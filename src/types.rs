// =============================================================================
// Shared types used across the trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Long or short, as carried by a position or an open/close decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for long, -1.0 for short — the sign used in every PnL formula.
    pub fn direction(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Normalise a raw exchange field (`"LONG"`, `"SELL"`, `"BOTH"` + signed
    /// amount, …) to `long`/`short`. Falls back to the sign of `position_amt`
    /// when the side string itself is ambiguous (Multi-Assets Mode).
    pub fn normalise(raw: &str, position_amt: f64) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "long" | "buy" => Self::Long,
            "short" | "sell" => Self::Short,
            _ => {
                if position_amt >= 0.0 {
                    Self::Long
                } else {
                    Self::Short
                }
            }
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// The action an AI decision (or an executed record row) carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    Hold,
    Wait,
}

impl Action {
    pub fn is_open(self) -> bool {
        matches!(self, Self::OpenLong | Self::OpenShort)
    }

    pub fn is_close(self) -> bool {
        matches!(self, Self::CloseLong | Self::CloseShort)
    }

    /// Sort rank used by the engine's close-before-open-before-hold ordering.
    /// Lower sorts first.
    pub fn sort_rank(self) -> u8 {
        if self.is_close() {
            0
        } else if self.is_open() {
            1
        } else {
            2
        }
    }

    pub fn side(self) -> Option<Side> {
        match self {
            Self::OpenLong | Self::CloseLong => Some(Side::Long),
            Self::OpenShort | Self::CloseShort => Some(Side::Short),
            _ => None,
        }
    }

    /// Parse a loosely-cased action string from AI output. Unrecognised
    /// strings return `None` — the caller turns that into a validation error.
    pub fn parse_loose(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open_long" | "openlong" => Some(Self::OpenLong),
            "open_short" | "openshort" => Some(Self::OpenShort),
            "close_long" | "closelong" => Some(Self::CloseLong),
            "close_short" | "closeshort" => Some(Self::CloseShort),
            "hold" => Some(Self::Hold),
            "wait" => Some(Self::Wait),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OpenLong => "open_long",
            Self::OpenShort => "open_short",
            Self::CloseLong => "close_long",
            Self::CloseShort => "close_short",
            Self::Hold => "hold",
            Self::Wait => "wait",
        };
        write!(f, "{s}")
    }
}

/// Market regime derived from BTC's 1h/4h percentage change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketRegime {
    Crashing,
    Bullish,
    Neutral,
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crashing => write!(f, "CRASHING"),
            Self::Bullish => write!(f, "BULLISH"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// `MarketRegime::classify` thresholds, matching the plaintext bands the
/// system prompt states: BTC down more than 1% on both windows is crashing,
/// up more than 1% on both is bullish, everything else is neutral.
impl MarketRegime {
    pub fn classify(btc_change_1h_pct: f64, btc_change_4h_pct: f64) -> Self {
        if btc_change_1h_pct <= -1.0 && btc_change_4h_pct <= -0.5 {
            Self::Crashing
        } else if btc_change_1h_pct >= 1.0 && btc_change_4h_pct >= 0.5 {
            Self::Bullish
        } else {
            Self::Neutral
        }
    }
}

/// Per-trader cycle state machine (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraderState {
    Idle,
    Running,
    Stopped,
}

impl Default for TraderState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for TraderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_normalise_falls_back_to_sign() {
        assert_eq!(Side::normalise("BOTH", 1.5), Side::Long);
        assert_eq!(Side::normalise("BOTH", -1.5), Side::Short);
        assert_eq!(Side::normalise("LONG", -1.0), Side::Long);
    }

    #[test]
    fn action_sort_rank_orders_close_open_hold() {
        assert!(Action::CloseLong.sort_rank() < Action::OpenLong.sort_rank());
        assert!(Action::OpenShort.sort_rank() < Action::Hold.sort_rank());
        assert!(Action::Wait.sort_rank() == Action::Hold.sort_rank());
    }

    #[test]
    fn regime_classifies_crash_and_bull() {
        assert_eq!(MarketRegime::classify(-1.2, -0.7), MarketRegime::Crashing);
        assert_eq!(MarketRegime::classify(1.5, 0.8), MarketRegime::Bullish);
        assert_eq!(MarketRegime::classify(0.2, -0.1), MarketRegime::Neutral);
    }

    #[test]
    fn action_parse_loose_rejects_unknown() {
        assert_eq!(Action::parse_loose("open_long"), Some(Action::OpenLong));
        assert_eq!(Action::parse_loose("sell everything"), None);
    }
}
