// =============================================================================
// Shared types used across the Halla trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Execution mode. Every persisted row is namespaced by mode so that test
/// runs can never touch real-account state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    DryRun,
    Paper,
    Real,
}

impl Default for Mode {
    fn default() -> Self {
        Self::DryRun
    }
}

impl Mode {
    /// Canonical string used in database keys and file namespaces.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DryRun => "DRY_RUN",
            Self::Paper => "PAPER",
            Self::Real => "REAL",
        }
    }

    /// Parse the canonical string form (as written by [`Mode::as_str`]).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "DRY_RUN" | "DRYRUN" => Some(Self::DryRun),
            "PAPER" => Some(Self::Paper),
            "REAL" => Some(Self::Real),
            _ => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order side. The engine is long-only: BUY opens, SELL closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable order lifecycle status.
///
/// Terminal statuses (`Filled`, `Cancelled`, `Failed`) are immutable once
/// written, except for audit metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Submitted,
    Partial,
    Filled,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SUBMITTED" => Some(Self::Submitted),
            "PARTIAL" => Some(Self::Partial),
            "FILLED" => Some(Self::Filled),
            "CANCELLED" => Some(Self::Cancelled),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a position was (or should be) exited. Recorded on every SELL trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    AtrStop,
    TakeProfit,
    TrailingStop,
    TrendBroken,
    GapProtection,
    Manual,
    SignalOnly,
    /// Position vanished from the broker account and was closed by the
    /// reconciler rather than by a fill we observed.
    RecoveredMissing,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AtrStop => "ATR_STOP",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::TrailingStop => "TRAILING_STOP",
            Self::TrendBroken => "TREND_BROKEN",
            Self::GapProtection => "GAP_PROTECTION",
            Self::Manual => "MANUAL",
            Self::SignalOnly => "SIGNAL_ONLY",
            Self::RecoveredMissing => "RECOVERED_MISSING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ATR_STOP" => Some(Self::AtrStop),
            "TAKE_PROFIT" => Some(Self::TakeProfit),
            "TRAILING_STOP" => Some(Self::TrailingStop),
            "TREND_BROKEN" => Some(Self::TrendBroken),
            "GAP_PROTECTION" => Some(Self::GapProtection),
            "MANUAL" => Some(Self::Manual),
            "SIGNAL_ONLY" => Some(Self::SignalOnly),
            "RECOVERED_MISSING" => Some(Self::RecoveredMissing),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Strategy output for one symbol on one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_roundtrip() {
        for m in [Mode::DryRun, Mode::Paper, Mode::Real] {
            assert_eq!(Mode::parse(m.as_str()), Some(m));
        }
        assert_eq!(Mode::parse("paper"), Some(Mode::Paper));
        assert_eq!(Mode::parse("nope"), None);
    }

    #[test]
    fn order_status_terminality() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Submitted.is_terminal());
        assert!(!OrderStatus::Partial.is_terminal());
    }

    #[test]
    fn exit_reason_roundtrip() {
        for r in [
            ExitReason::AtrStop,
            ExitReason::TakeProfit,
            ExitReason::TrailingStop,
            ExitReason::TrendBroken,
            ExitReason::GapProtection,
            ExitReason::Manual,
            ExitReason::SignalOnly,
            ExitReason::RecoveredMissing,
        ] {
            assert_eq!(ExitReason::parse(r.as_str()), Some(r));
        }
    }
}
