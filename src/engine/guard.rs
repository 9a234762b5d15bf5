// =============================================================================
// Gap and trailing guard — overnight gap protection, trailing-stop advance
// =============================================================================
//
// Gap protection compares today's open against the persisted entry reference
// (never today's values):
//
//   raw_gap_pct = (open − reference) / reference × 100
//
// The exit fires only when raw_gap_pct ≤ −(threshold + epsilon). Profit gaps
// and near-zero gaps never trigger. Both the raw and the rounded display
// percentage are logged with every decision.
//
// Trailing stops derive exclusively from the entry-era ATR:
//
//   proposal = highest_price − k × atr_at_entry
//
// and are applied through Position::advance_trailing_stop, which enforces
// monotonicity.
// =============================================================================

use tracing::{debug, info};

use crate::position::{Position, PositionState};

/// A triggered gap-protection decision.
#[derive(Debug, Clone, PartialEq)]
pub struct GapDecision {
    pub raw_gap_pct: f64,
    /// Rounded to two decimals for operator messages.
    pub display_gap_pct: f64,
    pub reference: f64,
    pub open_price: f64,
}

/// Evaluate gap protection for one open position.
///
/// `reference` is the persisted entry reference of the position. Returns a
/// decision only when the downside gap breaches `threshold + epsilon`.
pub fn check_gap(
    position: &Position,
    open_price: f64,
    threshold_pct: f64,
    epsilon_pct: f64,
) -> Option<GapDecision> {
    if position.state != PositionState::Entered {
        return None;
    }
    let reference = position.entry_price;
    if reference <= 0.0 || open_price <= 0.0 {
        return None;
    }

    let raw_gap_pct = (open_price - reference) / reference * 100.0;
    if raw_gap_pct >= 0.0 {
        // Profit gap, never protective.
        return None;
    }

    let trigger = -(threshold_pct + epsilon_pct);
    if raw_gap_pct > trigger {
        debug!(
            symbol = %position.symbol,
            raw_gap_pct,
            trigger,
            "gap within tolerance"
        );
        return None;
    }

    let decision = GapDecision {
        raw_gap_pct,
        display_gap_pct: (raw_gap_pct * 100.0).round() / 100.0,
        reference,
        open_price,
    };
    info!(
        symbol = %position.symbol,
        raw_gap_pct = decision.raw_gap_pct,
        display_gap_pct = decision.display_gap_pct,
        reference,
        open_price,
        "gap protection triggered"
    );
    Some(decision)
}

/// Compute the trailing-stop proposal for an open position that has a valid
/// entry-era ATR. The caller applies it via `advance_trailing_stop`, which
/// ignores proposals below the current trailing stop.
pub fn trailing_proposal(position: &Position, trail_atr_multiplier: f64) -> Option<f64> {
    if position.state != PositionState::Entered || position.atr_at_entry <= 0.0 {
        return None;
    }
    let proposal = position.highest_price - trail_atr_multiplier * position.atr_at_entry;
    if proposal <= 0.0 {
        return None;
    }
    Some(proposal)
}

/// Advance the trailing stop after a new price observation. Returns the new
/// trailing stop if it moved.
pub fn advance_trailing(position: &mut Position, trail_atr_multiplier: f64) -> Option<f64> {
    let proposal = trailing_proposal(position, trail_atr_multiplier)?;
    if position.advance_trailing_stop(proposal) {
        Some(proposal)
    } else {
        None
    }
}
