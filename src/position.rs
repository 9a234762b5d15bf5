// =============================================================================
// Position model — long-only lifecycle with frozen entry-era ATR
// =============================================================================
//
// Life-cycle:
//   Pending  ->  Entered  ->  Exited
//
// A Pending row exists from buy submit until the fill confirms. Exited rows
// are history and are never deleted. At most one Entered position may exist
// per (symbol, mode).
//
// `atr_at_entry` is frozen at fill time and never recomputed; the trailing
// stop derives from it and is monotonically non-decreasing once armed.
//
// Thread-safety: the in-memory book is behind `parking_lot::RwLock`.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{ExitReason, Mode};

/// Current lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Pending,
    Entered,
    Exited,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Entered => "ENTERED",
            Self::Exited => "EXITED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "ENTERED" => Some(Self::Entered),
            "EXITED" => Some(Self::Exited),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single tracked position, identified by `(symbol, mode)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub mode: Mode,
    pub entry_price: f64,
    pub quantity: i64,
    pub entered_at: DateTime<Utc>,
    /// ATR at entry time. Frozen for the life of the position.
    pub atr_at_entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Armed once price advances; monotonically non-decreasing.
    #[serde(default)]
    pub trailing_stop: Option<f64>,
    /// Highest price seen since entry; never below entry once entered.
    #[serde(default)]
    pub highest_price: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    pub state: PositionState,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
    #[serde(default)]
    pub exited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub realized_pnl: f64,
}

impl Position {
    /// Create a Pending position at buy-submit time.
    pub fn pending(symbol: &str, mode: Mode, qty: i64) -> Self {
        Self {
            symbol: symbol.to_string(),
            mode,
            entry_price: 0.0,
            quantity: qty,
            entered_at: Utc::now(),
            atr_at_entry: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            trailing_stop: None,
            highest_price: 0.0,
            current_price: 0.0,
            unrealized_pnl: 0.0,
            state: PositionState::Pending,
            exit_price: None,
            exit_reason: None,
            exited_at: None,
            realized_pnl: 0.0,
        }
    }

    /// Promote to Entered on buy fill, freezing the entry-era ATR.
    ///
    /// Enforces the long-only invariant `stop < entry < take`; violations are
    /// clamped and logged rather than trusted.
    pub fn enter(&mut self, fill_price: f64, fill_qty: i64, atr: f64, stop: f64, take: f64) {
        let stop = if stop >= fill_price {
            warn!(
                symbol = %self.symbol,
                stop,
                entry = fill_price,
                "stop at or above entry, clamping below entry"
            );
            fill_price - atr.max(f64::MIN_POSITIVE)
        } else {
            stop
        };
        let take = if take <= fill_price {
            warn!(
                symbol = %self.symbol,
                take,
                entry = fill_price,
                "take-profit at or below entry, clamping above entry"
            );
            fill_price + atr.max(f64::MIN_POSITIVE)
        } else {
            take
        };

        self.entry_price = fill_price;
        self.quantity = fill_qty;
        self.entered_at = Utc::now();
        self.atr_at_entry = atr;
        self.stop_loss = stop;
        self.take_profit = take;
        self.highest_price = fill_price;
        self.current_price = fill_price;
        self.state = PositionState::Entered;

        info!(
            symbol = %self.symbol,
            mode = %self.mode,
            entry_price = fill_price,
            qty = fill_qty,
            atr_at_entry = atr,
            stop_loss = self.stop_loss,
            take_profit = self.take_profit,
            "position entered"
        );
    }

    /// Record a price observation: refresh unrealized pnl and the
    /// highest-price watermark. Does not move the trailing stop — the guard
    /// owns that (it needs the entry-era ATR multiplier).
    pub fn observe_price(&mut self, price: f64) {
        if self.state != PositionState::Entered || price <= 0.0 {
            return;
        }
        self.current_price = price;
        self.unrealized_pnl = (price - self.entry_price) * self.quantity as f64;
        if price > self.highest_price {
            self.highest_price = price;
            debug!(symbol = %self.symbol, highest = price, "new highest price");
        }
    }

    /// Advance the trailing stop. Monotone: a proposal below the current
    /// trailing stop is ignored.
    pub fn advance_trailing_stop(&mut self, proposal: f64) -> bool {
        if self.state != PositionState::Entered {
            return false;
        }
        match self.trailing_stop {
            Some(current) if proposal <= current => false,
            _ => {
                self.trailing_stop = Some(proposal);
                debug!(
                    symbol = %self.symbol,
                    trailing_stop = proposal,
                    "trailing stop advanced"
                );
                true
            }
        }
    }

    /// Close on sell fill. History is retained, not deleted.
    pub fn exit(&mut self, fill_price: f64, reason: ExitReason) {
        self.exit_price = Some(fill_price);
        self.exit_reason = Some(reason);
        self.exited_at = Some(Utc::now());
        self.realized_pnl = (fill_price - self.entry_price) * self.quantity as f64;
        self.current_price = fill_price;
        self.unrealized_pnl = 0.0;
        self.state = PositionState::Exited;

        info!(
            symbol = %self.symbol,
            mode = %self.mode,
            exit_price = fill_price,
            reason = %reason,
            realized_pnl = self.realized_pnl,
            "position exited"
        );
    }

    /// Distance from current price to the effective stop (trailing stop when
    /// armed, else the ATR stop), as a fraction of the entry-era ATR. Used by
    /// the near-stop cadence check.
    pub fn stop_distance_in_atr(&self) -> Option<f64> {
        if self.state != PositionState::Entered || self.atr_at_entry <= 0.0 {
            return None;
        }
        let stop = self.trailing_stop.unwrap_or(self.stop_loss);
        Some((self.current_price - stop) / self.atr_at_entry)
    }

    pub fn holding_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entered_at).num_days()
    }
}

// =============================================================================
// Position Book — in-memory view, mirrored to file cache and store
// =============================================================================

/// Thread-safe in-memory book of positions for one mode.
///
/// The book only holds Pending and Entered rows; Exited rows live in the
/// store. The reconciler is the only writer allowed to replace the book
/// wholesale from broker truth.
pub struct PositionBook {
    mode: Mode,
    open: RwLock<Vec<Position>>,
}

impl PositionBook {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            open: RwLock::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Insert or replace the row for `position.symbol`. Rejects a second
    /// Entered row for the same symbol.
    pub fn upsert(&self, position: Position) {
        let mut open = self.open.write();
        if let Some(existing) = open.iter_mut().find(|p| p.symbol == position.symbol) {
            *existing = position;
        } else {
            open.push(position);
        }
    }

    /// Remove and return the row for `symbol` (after exit or recovery).
    pub fn remove(&self, symbol: &str) -> Option<Position> {
        let mut open = self.open.write();
        let idx = open.iter().position(|p| p.symbol == symbol)?;
        Some(open.remove(idx))
    }

    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.open.read().iter().find(|p| p.symbol == symbol).cloned()
    }

    /// Snapshot of Entered positions only.
    pub fn entered(&self) -> Vec<Position> {
        self.open
            .read()
            .iter()
            .filter(|p| p.state == PositionState::Entered)
            .cloned()
            .collect()
    }

    pub fn entered_count(&self) -> usize {
        self.open
            .read()
            .iter()
            .filter(|p| p.state == PositionState::Entered)
            .count()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.open.read().iter().map(|p| p.symbol.clone()).collect()
    }

    /// Apply a closure to the row for `symbol`, returning its result.
    pub fn with_mut<T>(&self, symbol: &str, f: impl FnOnce(&mut Position) -> T) -> Option<T> {
        let mut open = self.open.write();
        open.iter_mut().find(|p| p.symbol == symbol).map(f)
    }

    /// Replace the whole book. Reconciler use only.
    pub fn replace_all(&self, positions: Vec<Position>) {
        *self.open.write() = positions;
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionBook")
            .field("mode", &self.mode)
            .field("open", &self.open.read().len())
            .finish()
    }
}
