// =============================================================================
// Risk controller — ordered gate chain protecting capital
// =============================================================================
//
// Gates, evaluated in order (first failure denies):
//   1. Kill-switch file        — blocks new entries; exits and reads continue.
//   2. Market-hours            — entries only in the regular session; exits
//                                during the call auction become pending-exits.
//   3. Per-trade loss cap      — blocks re-entries after one oversized loss.
//   4. Daily loss cap          — blocks entries; exits still allowed.
//   5. Consecutive-loss cap    — blocks entries until the next trading day
//                                or a manual reset.
//   6. Daily trade-count cap.
//   7. Cumulative drawdown     — engages the kill-switch persistently.
//
// Daily counters reset when the KST trade date rolls over, and are restored
// from the daily_summary table across restarts. Rules are evaluated on a
// read-only snapshot taken once per cycle; a fill racing the check is
// absorbed by the synchronizer's idempotency key.
// =============================================================================

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::market::hours::{self, SessionState};
use crate::store::DailySummaryRow;
use crate::types::Mode;

/// Why an order was denied.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskDenial {
    KillSwitch,
    MarketClosed,
    /// The closing call auction is running; SELLs defer via pending-exit.
    CallAuction,
    PerTradeLoss { last_loss_pct: f64 },
    DailyLoss { loss_pct: f64 },
    ConsecutiveLosses { count: u32 },
    TradeCount { count: u32 },
    Drawdown { drawdown_pct: f64 },
}

impl std::fmt::Display for RiskDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KillSwitch => write!(f, "KILL_SWITCH"),
            Self::MarketClosed => write!(f, "MARKET_CLOSED"),
            Self::CallAuction => write!(f, "CALL_AUCTION"),
            Self::PerTradeLoss { last_loss_pct } => {
                write!(f, "PER_TRADE_LOSS ({last_loss_pct:.2}%)")
            }
            Self::DailyLoss { loss_pct } => write!(f, "DAILY_LOSS ({loss_pct:.2}%)"),
            Self::ConsecutiveLosses { count } => write!(f, "CONSECUTIVE_LOSSES ({count})"),
            Self::TradeCount { count } => write!(f, "TRADE_COUNT ({count})"),
            Self::Drawdown { drawdown_pct } => write!(f, "CUMULATIVE_DD ({drawdown_pct:.2}%)"),
        }
    }
}

/// Configured limits, copied out of EngineConfig at construction.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub daily_max_loss_pct: f64,
    pub per_trade_loss_pct: f64,
    pub cumulative_dd_pct: f64,
    pub max_consecutive_losses: u32,
    pub daily_max_trades: u32,
}

struct Inner {
    trade_date: String,
    daily_realized_pnl: f64,
    daily_start_equity: f64,
    consecutive_losses: u32,
    daily_trade_count: u32,
    /// pnl% of the most recently closed trade, negative for a loss.
    last_trade_pnl_pct: f64,
    current_equity: f64,
}

pub struct RiskController {
    limits: RiskLimits,
    mode: Mode,
    kill_switch_path: PathBuf,
    /// Equity baseline for the cumulative drawdown check.
    initial_equity: f64,
    state: RwLock<Inner>,
}

impl RiskController {
    pub fn new(
        limits: RiskLimits,
        mode: Mode,
        kill_switch_path: impl AsRef<Path>,
        initial_equity: f64,
        now: DateTime<Utc>,
    ) -> Self {
        info!(
            daily_max_loss_pct = limits.daily_max_loss_pct,
            per_trade_loss_pct = limits.per_trade_loss_pct,
            cumulative_dd_pct = limits.cumulative_dd_pct,
            max_consecutive_losses = limits.max_consecutive_losses,
            daily_max_trades = limits.daily_max_trades,
            initial_equity,
            "risk controller initialised"
        );
        Self {
            limits,
            mode,
            kill_switch_path: kill_switch_path.as_ref().to_path_buf(),
            initial_equity,
            state: RwLock::new(Inner {
                trade_date: hours::trade_date(now),
                daily_realized_pnl: 0.0,
                daily_start_equity: initial_equity,
                consecutive_losses: 0,
                daily_trade_count: 0,
                last_trade_pnl_pct: 0.0,
                current_equity: initial_equity,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Restart restore
    // -------------------------------------------------------------------------

    /// Restore today's counters from the persisted daily summary so that a
    /// restart cannot forget a tripped breaker.
    pub fn restore_daily(&self, summary: Option<&DailySummaryRow>, now: DateTime<Utc>) {
        let Some(s) = summary else { return };
        if s.trade_date != hours::trade_date(now) {
            return;
        }
        let mut inner = self.state.write();
        inner.daily_realized_pnl = s.realized_pnl;
        inner.daily_trade_count = s.trade_count as u32;
        // Losses since the last win are not reconstructible exactly; the
        // conservative reading is the day's loss streak so far.
        inner.consecutive_losses = if s.win_count == 0 {
            s.loss_count as u32
        } else {
            0
        };
        info!(
            trade_date = %s.trade_date,
            realized_pnl = s.realized_pnl,
            trade_count = s.trade_count,
            "daily risk counters restored"
        );
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    /// Record the outcome of a closed trade.
    pub fn record_trade_result(&self, pnl: f64, pnl_pct: f64, now: DateTime<Utc>) {
        self.maybe_reset_daily(now);
        let mut s = self.state.write();
        s.daily_realized_pnl += pnl;
        s.daily_trade_count += 1;
        s.last_trade_pnl_pct = pnl_pct;
        if pnl < 0.0 {
            s.consecutive_losses += 1;
        } else {
            s.consecutive_losses = 0;
        }
        debug!(
            pnl,
            pnl_pct,
            daily_pnl = s.daily_realized_pnl,
            consecutive_losses = s.consecutive_losses,
            trades = s.daily_trade_count,
            "trade result recorded"
        );
    }

    /// Record an order submission that counts toward the daily trade cap even
    /// if the fill never confirms.
    pub fn record_entry_attempt(&self, now: DateTime<Utc>) {
        self.maybe_reset_daily(now);
        self.state.write().daily_trade_count += 1;
    }

    /// Update current equity and run the cumulative-drawdown breaker.
    /// Returns the drawdown denial when the cap is breached, after engaging
    /// the kill-switch persistently.
    pub fn update_equity(&self, current_equity: f64) -> Option<RiskDenial> {
        if current_equity <= 0.0 || self.initial_equity <= 0.0 {
            return None;
        }
        self.state.write().current_equity = current_equity;

        let drawdown_pct =
            (self.initial_equity - current_equity) / self.initial_equity * 100.0;
        if drawdown_pct >= self.limits.cumulative_dd_pct {
            warn!(
                drawdown_pct,
                cap = self.limits.cumulative_dd_pct,
                "cumulative drawdown cap breached, engaging kill-switch"
            );
            self.engage_kill_switch();
            return Some(RiskDenial::Drawdown { drawdown_pct });
        }
        None
    }

    // -------------------------------------------------------------------------
    // Gates
    // -------------------------------------------------------------------------

    /// Gate a new entry (BUY). First failing check denies.
    pub fn check_entry(&self, now: DateTime<Utc>) -> Result<(), RiskDenial> {
        self.maybe_reset_daily(now);

        if self.kill_switch_engaged() {
            return Err(RiskDenial::KillSwitch);
        }
        if !hours::entries_allowed(now) {
            return Err(RiskDenial::MarketClosed);
        }

        let s = self.state.read();

        if s.last_trade_pnl_pct <= -self.limits.per_trade_loss_pct {
            return Err(RiskDenial::PerTradeLoss {
                last_loss_pct: s.last_trade_pnl_pct,
            });
        }

        let daily_loss_pct = if s.daily_start_equity > 0.0 {
            -s.daily_realized_pnl / s.daily_start_equity * 100.0
        } else {
            0.0
        };
        if daily_loss_pct >= self.limits.daily_max_loss_pct {
            return Err(RiskDenial::DailyLoss {
                loss_pct: daily_loss_pct,
            });
        }

        if s.consecutive_losses >= self.limits.max_consecutive_losses {
            return Err(RiskDenial::ConsecutiveLosses {
                count: s.consecutive_losses,
            });
        }

        if s.daily_trade_count >= self.limits.daily_max_trades {
            return Err(RiskDenial::TradeCount {
                count: s.daily_trade_count,
            });
        }

        let drawdown_pct = if self.initial_equity > 0.0 {
            (self.initial_equity - s.current_equity) / self.initial_equity * 100.0
        } else {
            0.0
        };
        if drawdown_pct >= self.limits.cumulative_dd_pct {
            return Err(RiskDenial::Drawdown { drawdown_pct });
        }

        Ok(())
    }

    /// Gate an exit (SELL). Exits survive the kill-switch and the daily loss
    /// cap; they only defer when the session disallows orders.
    pub fn check_exit(&self, now: DateTime<Utc>) -> Result<(), RiskDenial> {
        match hours::session_state(now) {
            SessionState::Regular => Ok(()),
            SessionState::CallAuction => Err(RiskDenial::CallAuction),
            SessionState::Closed => Err(RiskDenial::MarketClosed),
        }
    }

    // -------------------------------------------------------------------------
    // Kill switch
    // -------------------------------------------------------------------------

    pub fn kill_switch_engaged(&self) -> bool {
        self.kill_switch_path.exists()
    }

    /// Engage persistently: the file survives restarts until an operator
    /// removes it.
    pub fn engage_kill_switch(&self) {
        if let Some(parent) = self.kill_switch_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let note = format!(
            "engaged at {} mode {}\n",
            Utc::now().to_rfc3339(),
            self.mode
        );
        if let Err(e) = std::fs::write(&self.kill_switch_path, note) {
            warn!(
                path = %self.kill_switch_path.display(),
                error = %e,
                "failed to write kill-switch file"
            );
        } else {
            warn!(path = %self.kill_switch_path.display(), "kill-switch engaged");
        }
    }

    /// Manual reset of the day's counters (admin action).
    pub fn reset_daily(&self, now: DateTime<Utc>) {
        let mut s = self.state.write();
        let equity = s.current_equity;
        Self::do_reset(&mut s, &hours::trade_date(now), equity);
        info!("daily risk counters reset (manual)");
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn maybe_reset_daily(&self, now: DateTime<Utc>) {
        let today = hours::trade_date(now);
        {
            let s = self.state.read();
            if s.trade_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        // Double-check after acquiring the write lock.
        if s.trade_date != today {
            info!(
                old_date = %s.trade_date,
                new_date = %today,
                "trade date rolled, resetting daily risk counters"
            );
            let equity = s.current_equity;
            Self::do_reset(&mut s, &today, equity);
        }
    }

    fn do_reset(s: &mut Inner, date: &str, equity: f64) {
        s.trade_date = date.to_string();
        s.daily_realized_pnl = 0.0;
        s.daily_start_equity = equity;
        s.consecutive_losses = 0;
        s.daily_trade_count = 0;
        s.last_trade_pnl_pct = 0.0;
    }
}

impl std::fmt::Debug for RiskController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("RiskController")
            .field("mode", &self.mode)
            .field("trade_date", &s.trade_date)
            .field("daily_realized_pnl", &s.daily_realized_pnl)
            .field("consecutive_losses", &s.consecutive_losses)
            .field("daily_trade_count", &s.daily_trade_count)
            .finish()
    }
}
