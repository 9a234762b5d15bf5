// =============================================================================
// Order synchronizer — the single entry point that places or closes positions
// =============================================================================
//
// Guarantees:
//   * Idempotent submission. The key SHA256(mode|side|symbol|qty|signal_id)
//     is looked up before any broker call; a terminal row short-circuits, a
//     live row is adopted (no second submit), and only a fresh key reaches
//     the broker.
//   * One durable transaction per decision: order_state transition, trade
//     row, and position upsert commit or roll back together.
//   * A submit failure always leaves a terminal order_state row — broker
//     exceptions are never swallowed.
//
// Pending-exit backoff: a SELL refused because the market is closed (call
// auction, un-orderable symbol) is parked with a retry-after timestamp and
// surfaced again once the backoff elapses. Success clears the flag and
// notifies.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerExt, OrderType, WaitStatus};
use crate::error::{EngineError, EngineResult};
use crate::notify::{Event, Notifier};
use crate::position::{Position, PositionBook, PositionState};
use crate::store::{DecisionWrite, OrderStateRow, OrderTransition, Store, TradeRow};
use crate::types::{ExitReason, Mode, OrderStatus, Side};

/// PENDING rows that never reached the broker are cancelled after this.
const STALE_UNSUBMITTED_MINUTES: i64 = 15;
/// Any non-terminal row older than this is cancelled.
const STALE_ANY_MINUTES: i64 = 240;

/// One order decision handed to the synchronizer.
#[derive(Debug, Clone)]
pub struct OrderDecision {
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    /// Unique per signal evaluation; feeds the idempotency key.
    pub signal_id: String,
    /// Limit price; 0 means market.
    pub price: f64,
    pub order_type: OrderType,
    /// Entry bracket (BUY only).
    pub atr_at_entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Exit classification (SELL only).
    pub exit_reason: Option<ExitReason>,
}

impl OrderDecision {
    pub fn buy(
        symbol: &str,
        qty: i64,
        signal_id: &str,
        atr: f64,
        stop: f64,
        take: f64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: Side::Buy,
            qty,
            signal_id: signal_id.to_string(),
            price: 0.0,
            order_type: OrderType::Market,
            atr_at_entry: atr,
            stop_loss: stop,
            take_profit: take,
            exit_reason: None,
        }
    }

    pub fn sell(symbol: &str, qty: i64, signal_id: &str, reason: ExitReason) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: Side::Sell,
            qty,
            signal_id: signal_id.to_string(),
            price: 0.0,
            order_type: OrderType::Market,
            atr_at_entry: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            exit_reason: Some(reason),
        }
    }
}

/// Outcome of a synchronized decision.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncResult {
    Filled { filled_qty: i64, avg_price: f64 },
    Partial { filled_qty: i64, avg_price: f64 },
    Cancelled,
    Failed { reason: String },
    /// The idempotency key already reached a terminal state earlier; nothing
    /// was resubmitted.
    AlreadyTerminal { status: OrderStatus },
    /// SELL deferred to the pending-exit backoff path.
    PendingExit { reason: ExitReason },
}

/// A SELL waiting out the market-closed backoff.
#[derive(Debug, Clone)]
struct PendingExit {
    reason: ExitReason,
    next_retry_at: DateTime<Utc>,
}

pub struct OrderSynchronizer {
    broker: Arc<dyn Broker>,
    store: Arc<dyn Store>,
    book: Arc<PositionBook>,
    notifier: Arc<dyn Notifier>,
    mode: Mode,
    execution_timeout_secs: u64,
    commission_rate: f64,
    pending_exit_backoff_secs: u64,
    pending_exits: RwLock<HashMap<String, PendingExit>>,
}

impl OrderSynchronizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn Store>,
        book: Arc<PositionBook>,
        notifier: Arc<dyn Notifier>,
        mode: Mode,
        execution_timeout_secs: u64,
        commission_rate: f64,
        pending_exit_backoff_secs: u64,
    ) -> Self {
        Self {
            broker,
            store,
            book,
            notifier,
            mode,
            execution_timeout_secs,
            commission_rate,
            pending_exit_backoff_secs,
            pending_exits: RwLock::new(HashMap::new()),
        }
    }

    /// Content-hash idempotency key: identical decisions collapse to one
    /// submission no matter how often they are retried.
    pub fn idempotency_key(mode: Mode, decision: &OrderDecision) -> String {
        let mut hasher = Sha256::new();
        hasher.update(mode.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(decision.side.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(decision.symbol.as_bytes());
        hasher.update(b"|");
        hasher.update(decision.qty.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(decision.signal_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    // -------------------------------------------------------------------------
    // Public entry points
    // -------------------------------------------------------------------------

    pub async fn execute_buy(&self, decision: &OrderDecision) -> EngineResult<SyncResult> {
        debug_assert_eq!(decision.side, Side::Buy);
        self.execute(decision).await
    }

    pub async fn execute_sell(&self, decision: &OrderDecision) -> EngineResult<SyncResult> {
        debug_assert_eq!(decision.side, Side::Sell);

        // Respect an active backoff before touching the broker.
        if let Some(pending) = self.pending_exits.read().get(&decision.symbol) {
            if Utc::now() < pending.next_retry_at {
                debug!(
                    symbol = %decision.symbol,
                    retry_at = %pending.next_retry_at,
                    "sell still inside pending-exit backoff"
                );
                return Ok(SyncResult::PendingExit {
                    reason: pending.reason,
                });
            }
        }

        self.execute(decision).await
    }

    /// Whether a pending exit is parked for `symbol`.
    pub fn has_pending_exit(&self, symbol: &str) -> bool {
        self.pending_exits.read().contains_key(symbol)
    }

    /// Park an exit that was denied before submission (e.g. the risk gate
    /// observed the call auction). The backoff mirrors the broker-denied path.
    pub fn park_pending_exit(&self, symbol: &str, reason: ExitReason) {
        let retry_at =
            Utc::now() + chrono::Duration::seconds(self.pending_exit_backoff_secs as i64);
        let mut pending = self.pending_exits.write();
        pending
            .entry(symbol.to_string())
            .or_insert_with(|| PendingExit {
                reason,
                next_retry_at: retry_at,
            });
    }

    /// The market has verifiably reopened: lift the backoff so the next SELL
    /// goes straight through instead of waiting out the timer.
    pub fn release_pending_backoff(&self, symbol: &str) {
        if let Some(p) = self.pending_exits.write().get_mut(symbol) {
            p.next_retry_at = Utc::now();
        }
    }

    // -------------------------------------------------------------------------
    // Core algorithm
    // -------------------------------------------------------------------------

    async fn execute(&self, decision: &OrderDecision) -> EngineResult<SyncResult> {
        let key = Self::idempotency_key(self.mode, decision);

        // 1. Adopt-or-insert the durable order state.
        let existing = self
            .store
            .order_state(&key)
            .await
            .map_err(|e| EngineError::StorePersistence(e.to_string()))?;

        let state = match existing {
            Some(row) if row.status.is_terminal() => {
                info!(
                    key = %row.idempotency_key,
                    status = %row.status,
                    "decision already terminal, not resubmitting"
                );
                return Ok(SyncResult::AlreadyTerminal { status: row.status });
            }
            Some(row) => {
                info!(
                    key = %row.idempotency_key,
                    status = %row.status,
                    order_no = row.order_no.as_deref().unwrap_or("-"),
                    "adopting in-flight order state"
                );
                row
            }
            None => {
                let row = OrderStateRow::pending(
                    key.clone(),
                    decision.signal_id.clone(),
                    decision.symbol.clone(),
                    decision.side,
                    decision.qty,
                    self.mode,
                );
                self.store
                    .insert_order_state(&row)
                    .await
                    .map_err(|e| EngineError::StorePersistence(e.to_string()))?;
                row
            }
        };

        // 2. Submit if this key never reached the broker.
        let order_no = match state.order_no.clone() {
            Some(no) => no,
            None => match self.submit(decision, &key).await? {
                Some(no) => no,
                None => {
                    // Terminal failure or deferred; submit() already
                    // transitioned and notified.
                    return Ok(self.post_submit_result(decision, &key).await);
                }
            },
        };

        // 3. Wait for the fill and settle the decision.
        self.settle(decision, &key, &order_no).await
    }

    /// Submit to the broker. Returns the order number on acceptance, or None
    /// when the decision ended without one (FAILED row written, or a SELL
    /// parked as pending-exit).
    async fn submit(&self, decision: &OrderDecision, key: &str) -> EngineResult<Option<String>> {
        let submit = match decision.side {
            Side::Buy => self.broker.place_buy(
                &decision.symbol,
                decision.qty,
                decision.price,
                decision.order_type,
            ),
            Side::Sell => self.broker.place_sell(
                &decision.symbol,
                decision.qty,
                decision.price,
                decision.order_type,
            ),
        };
        let ack = match submit.await {
            Ok(ack) => ack,
            Err(EngineError::MarketClosed { symbol, reason }) if decision.side == Side::Sell => {
                // Deferred, not failed: park and retry after the backoff.
                let retry_at = Utc::now()
                    + chrono::Duration::seconds(self.pending_exit_backoff_secs as i64);
                self.pending_exits.write().insert(
                    symbol.clone(),
                    PendingExit {
                        reason: decision.exit_reason.unwrap_or(ExitReason::SignalOnly),
                        next_retry_at: retry_at,
                    },
                );
                warn!(
                    symbol = %symbol,
                    reason = %reason,
                    retry_at = %retry_at,
                    "sell deferred as pending exit"
                );
                return Ok(None);
            }
            Err(e) => {
                // A submit exception is never swallowed: record FAILED.
                self.transition(
                    key,
                    OrderStatus::Failed,
                    0,
                    decision.qty,
                    None,
                )
                .await?;
                self.notify_submit_failure(decision, key, &e.to_string()).await;
                return Ok(None);
            }
        };

        if !ack.accepted {
            let reason = ack.raw.to_string();
            self.transition(key, OrderStatus::Failed, 0, decision.qty, None)
                .await?;
            self.notify_submit_failure(decision, key, &reason).await;
            return Ok(None);
        }

        let order_no = ack
            .order_no
            .clone()
            .unwrap_or_else(|| format!("unknown-{key}"));
        self.transition(
            key,
            OrderStatus::Submitted,
            0,
            decision.qty,
            Some(order_no.clone()),
        )
        .await?;

        // For a BUY, persist the provisional position now so that a crash
        // before the fill can recover the bracket parameters.
        if decision.side == Side::Buy {
            let mut pending = Position::pending(&decision.symbol, self.mode, decision.qty);
            pending.atr_at_entry = decision.atr_at_entry;
            pending.stop_loss = decision.stop_loss;
            pending.take_profit = decision.take_profit;
            if let Err(e) = self.store.upsert_position(&pending).await {
                warn!(symbol = %decision.symbol, error = %e, "failed to persist pending position");
            }
            self.book.upsert(pending);
        }

        info!(
            symbol = %decision.symbol,
            side = %decision.side,
            qty = decision.qty,
            order_no = %order_no,
            key = %key,
            "order submitted"
        );
        Ok(Some(order_no))
    }

    /// Map the row written by a no-order-number outcome into a SyncResult.
    async fn post_submit_result(&self, decision: &OrderDecision, key: &str) -> SyncResult {
        if decision.side == Side::Sell && self.has_pending_exit(&decision.symbol) {
            return SyncResult::PendingExit {
                reason: decision.exit_reason.unwrap_or(ExitReason::SignalOnly),
            };
        }
        match self.store.order_state(key).await {
            Ok(Some(row)) if row.status == OrderStatus::Failed => SyncResult::Failed {
                reason: "order submission rejected".into(),
            },
            _ => SyncResult::Failed {
                reason: "order submission did not produce an order number".into(),
            },
        }
    }

    /// Wait for execution and write the terminal decision transaction.
    async fn settle(
        &self,
        decision: &OrderDecision,
        key: &str,
        order_no: &str,
    ) -> EngineResult<SyncResult> {
        let outcome = self
            .broker
            .wait_for_execution(order_no, decision.qty, self.execution_timeout_secs)
            .await?;

        let (status, filled_qty, avg_price) = match outcome.status {
            WaitStatus::Filled => (OrderStatus::Filled, outcome.filled_qty, outcome.avg_price),
            WaitStatus::Partial => {
                // Cancel the remainder, then settle the filled slice.
                self.broker.cancel_order(order_no).await.ok();
                (OrderStatus::Partial, outcome.filled_qty, outcome.avg_price)
            }
            WaitStatus::Cancelled => {
                if outcome.filled_qty > 0 {
                    (OrderStatus::Partial, outcome.filled_qty, outcome.avg_price)
                } else {
                    (OrderStatus::Cancelled, 0, 0.0)
                }
            }
            WaitStatus::Timeout => {
                // The broker has not cancelled yet: cancel and re-query once.
                warn!(order_no, "execution wait timed out, cancelling");
                self.broker.cancel_order(order_no).await.ok();
                let post = self.broker.order_status(order_no).await;
                match post {
                    Ok(report) if report.filled_qty > 0 => {
                        (OrderStatus::Partial, report.filled_qty, report.avg_price)
                    }
                    _ => (OrderStatus::Cancelled, 0, 0.0),
                }
            }
        };

        let write = self.build_decision_write(decision, key, order_no, status, filled_qty, avg_price);
        self.store
            .execute_decision(&write)
            .await
            .map_err(|e| EngineError::StorePersistence(e.to_string()))?;
        self.apply_to_book(decision, &write, filled_qty, avg_price);

        // A successful SELL clears any pending-exit flag for the symbol.
        if decision.side == Side::Sell
            && matches!(status, OrderStatus::Filled | OrderStatus::Partial)
        {
            if self.pending_exits.write().remove(&decision.symbol).is_some() {
                self.notifier
                    .notify(Event::info(
                        "pending_exit_cleared",
                        json!({
                            "symbol": decision.symbol,
                            "mode": self.mode.as_str(),
                            "idempotency_key": key,
                        }),
                    ))
                    .await;
            }
        }

        let result = match status {
            OrderStatus::Filled => SyncResult::Filled {
                filled_qty,
                avg_price,
            },
            OrderStatus::Partial => SyncResult::Partial {
                filled_qty,
                avg_price,
            },
            _ => SyncResult::Cancelled,
        };
        info!(
            symbol = %decision.symbol,
            side = %decision.side,
            status = %status,
            filled_qty,
            avg_price,
            key = %key,
            "decision settled"
        );
        Ok(result)
    }

    /// Assemble the atomic write for one settled decision.
    fn build_decision_write(
        &self,
        decision: &OrderDecision,
        key: &str,
        order_no: &str,
        status: OrderStatus,
        filled_qty: i64,
        avg_price: f64,
    ) -> DecisionWrite {
        let transition = OrderTransition {
            idempotency_key: key.to_string(),
            status,
            filled_qty,
            remaining_qty: decision.qty - filled_qty,
            order_no: Some(order_no.to_string()),
        };

        if filled_qty <= 0 {
            // Cancelled with no fill: drop the provisional BUY position row.
            let position = if decision.side == Side::Buy {
                self.book.get(&decision.symbol).map(|mut p| {
                    if p.state == PositionState::Pending {
                        p.state = PositionState::Exited;
                        p.exit_reason = Some(ExitReason::SignalOnly);
                        p.exited_at = Some(Utc::now());
                    }
                    p
                })
            } else {
                None
            };
            return DecisionWrite {
                transition,
                trade: None,
                position,
            };
        }

        match decision.side {
            Side::Buy => {
                let mut position = self
                    .book
                    .get(&decision.symbol)
                    .unwrap_or_else(|| Position::pending(&decision.symbol, self.mode, filled_qty));
                position.enter(
                    avg_price,
                    filled_qty,
                    decision.atr_at_entry,
                    decision.stop_loss,
                    decision.take_profit,
                );
                let trade = TradeRow {
                    idempotency_key: key.to_string(),
                    symbol: decision.symbol.clone(),
                    side: Side::Buy,
                    price: avg_price,
                    qty: filled_qty,
                    executed_at: Utc::now(),
                    reason: None,
                    pnl: 0.0,
                    pnl_pct: 0.0,
                    entry_reference: avg_price,
                    holding_days: 0,
                    order_no: Some(order_no.to_string()),
                    mode: self.mode,
                };
                DecisionWrite {
                    transition,
                    trade: Some(trade),
                    position: Some(position),
                }
            }
            Side::Sell => {
                let now = Utc::now();
                let existing = self.book.get(&decision.symbol);
                let (entry_price, holding_days, mut position) = match existing {
                    Some(p) => (p.entry_price, p.holding_days(now), p),
                    None => (avg_price, 0, Position::pending(&decision.symbol, self.mode, 0)),
                };

                let gross = (avg_price - entry_price) * filled_qty as f64;
                let commission =
                    self.commission_rate * (entry_price + avg_price) * filled_qty as f64;
                let pnl = gross - commission;
                let pnl_pct = if entry_price > 0.0 {
                    (avg_price - entry_price) / entry_price * 100.0
                } else {
                    0.0
                };

                if filled_qty >= position.quantity {
                    position.exit(
                        avg_price,
                        decision.exit_reason.unwrap_or(ExitReason::SignalOnly),
                    );
                } else {
                    // Partial exit: the remainder stays open with broker-true
                    // quantity; the exit signal re-fires next cycle.
                    position.quantity -= filled_qty;
                    position.realized_pnl += pnl;
                }

                let trade = TradeRow {
                    idempotency_key: key.to_string(),
                    symbol: decision.symbol.clone(),
                    side: Side::Sell,
                    price: avg_price,
                    qty: filled_qty,
                    executed_at: now,
                    reason: decision.exit_reason.or(Some(ExitReason::SignalOnly)),
                    pnl,
                    pnl_pct,
                    entry_reference: entry_price,
                    holding_days,
                    order_no: Some(order_no.to_string()),
                    mode: self.mode,
                };
                DecisionWrite {
                    transition,
                    trade: Some(trade),
                    position: Some(position),
                }
            }
        }
    }

    /// Mirror the durable write into the in-memory book.
    fn apply_to_book(&self, decision: &OrderDecision, write: &DecisionWrite, filled_qty: i64, _avg_price: f64) {
        match &write.position {
            Some(p) if p.state == PositionState::Exited => {
                self.book.remove(&decision.symbol);
            }
            Some(p) => {
                self.book.upsert(p.clone());
            }
            None => {
                if decision.side == Side::Buy && filled_qty <= 0 {
                    self.book.remove(&decision.symbol);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Startup recovery and stale cleanup
    // -------------------------------------------------------------------------

    /// Resume non-terminal order_state rows left behind by a crash. Rows with
    /// an order number are driven through the normal wait-and-settle path;
    /// rows without one fall to the stale cleanup.
    pub async fn resume_incomplete(&self) -> EngineResult<usize> {
        let rows = self
            .store
            .recoverable_order_states(self.mode)
            .await
            .map_err(|e| EngineError::StorePersistence(e.to_string()))?;

        let mut resumed = 0;
        for row in rows {
            let Some(order_no) = row.order_no.clone() else {
                continue;
            };
            if row.status == OrderStatus::Partial {
                // Already settled once (its trade row exists); the remainder
                // was cancelled. Nothing to drive.
                continue;
            }
            info!(
                key = %row.idempotency_key,
                symbol = %row.symbol,
                order_no = %order_no,
                "resuming in-flight order from previous run"
            );

            let decision = self.decision_from_row(&row).await;
            self.settle(&decision, &row.idempotency_key, &order_no)
                .await?;
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Rebuild enough of the original decision from the durable row to settle
    /// it. Bracket parameters for a BUY come from the provisional position
    /// persisted at submit time.
    async fn decision_from_row(&self, row: &OrderStateRow) -> OrderDecision {
        let mut decision = OrderDecision {
            symbol: row.symbol.clone(),
            side: row.side,
            qty: row.requested_qty,
            signal_id: row.signal_id.clone(),
            price: 0.0,
            order_type: OrderType::Market,
            atr_at_entry: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            exit_reason: (row.side == Side::Sell).then_some(ExitReason::SignalOnly),
        };
        if row.side == Side::Buy {
            if let Ok(Some(p)) = self.store.position(&row.symbol, self.mode).await {
                decision.atr_at_entry = p.atr_at_entry;
                decision.stop_loss = p.stop_loss;
                decision.take_profit = p.take_profit;
                self.book.upsert(p);
            }
        }
        decision
    }

    /// Cancel abandoned rows: PENDING with no order number after 15 minutes,
    /// anything non-terminal after 240 minutes.
    pub async fn cleanup_stale(&self) -> EngineResult<usize> {
        let rows = self
            .store
            .recoverable_order_states(self.mode)
            .await
            .map_err(|e| EngineError::StorePersistence(e.to_string()))?;

        let now = Utc::now();
        let mut cancelled = 0;
        for row in rows {
            let age_minutes = (now - row.requested_at).num_minutes();
            let unsubmitted_expired =
                row.order_no.is_none() && age_minutes >= STALE_UNSUBMITTED_MINUTES;
            let hard_expired = age_minutes >= STALE_ANY_MINUTES;
            if !(unsubmitted_expired || hard_expired) {
                continue;
            }

            warn!(
                key = %row.idempotency_key,
                symbol = %row.symbol,
                status = %row.status,
                age_minutes,
                "cancelling stale order state"
            );
            self.transition(
                &row.idempotency_key,
                OrderStatus::Cancelled,
                row.filled_qty,
                row.remaining_qty,
                None,
            )
            .await?;
            cancelled += 1;
        }
        Ok(cancelled)
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn transition(
        &self,
        key: &str,
        status: OrderStatus,
        filled_qty: i64,
        remaining_qty: i64,
        order_no: Option<String>,
    ) -> EngineResult<()> {
        self.store
            .transition_order_state(&OrderTransition {
                idempotency_key: key.to_string(),
                status,
                filled_qty,
                remaining_qty,
                order_no,
            })
            .await
            .map_err(|e| EngineError::StorePersistence(e.to_string()))
    }

    async fn notify_submit_failure(&self, decision: &OrderDecision, key: &str, reason: &str) {
        self.notifier
            .notify(Event::error(
                "order_submit_failed",
                json!({
                    "symbol": decision.symbol,
                    "side": decision.side.as_str(),
                    "mode": self.mode.as_str(),
                    "idempotency_key": key,
                    "reason": reason,
                }),
            ))
            .await;
    }
}

impl std::fmt::Debug for OrderSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderSynchronizer")
            .field("mode", &self.mode)
            .field("pending_exits", &self.pending_exits.read().len())
            .finish()
    }
}

// =============================================================================
// Tests — the spec's core idempotence and fill scenarios
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::{FakeBroker, FillPlan};
    use crate::notify::RecordingNotifier;
    use crate::store::sqlite::SqliteStore;
    use crate::store::Store;

    struct Fixture {
        broker: Arc<FakeBroker>,
        store: Arc<SqliteStore>,
        book: Arc<PositionBook>,
        notifier: Arc<RecordingNotifier>,
        sync: OrderSynchronizer,
    }

    async fn fixture() -> Fixture {
        let broker = Arc::new(FakeBroker::new());
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let book = Arc::new(PositionBook::new(Mode::Paper));
        let notifier = Arc::new(RecordingNotifier::new());
        let sync = OrderSynchronizer::new(
            broker.clone(),
            store.clone(),
            book.clone(),
            notifier.clone(),
            Mode::Paper,
            45,
            0.0,
            300,
        );
        Fixture {
            broker,
            store,
            book,
            notifier,
            sync,
        }
    }

    fn buy(signal_id: &str) -> OrderDecision {
        OrderDecision::buy("005930", 10, signal_id, 1_500.0, 68_000.0, 77_000.0)
    }

    #[tokio::test]
    async fn clean_buy_fills_and_persists_everything() {
        let f = fixture().await;
        f.broker.set_quote("005930", 71_000.0, 70_500.0);

        let result = f.sync.execute_buy(&buy("sig-1")).await.unwrap();
        assert_eq!(
            result,
            SyncResult::Filled {
                filled_qty: 10,
                avg_price: 71_000.0
            }
        );

        let key = OrderSynchronizer::idempotency_key(Mode::Paper, &buy("sig-1"));
        let row = f.store.order_state(&key).await.unwrap().unwrap();
        assert_eq!(row.status, OrderStatus::Filled);
        assert_eq!(row.filled_qty + row.remaining_qty, row.requested_qty);

        let trade = f.store.trade_by_key(&key).await.unwrap().unwrap();
        assert_eq!(trade.qty, 10);

        let pos = f.book.get("005930").unwrap();
        assert_eq!(pos.state, PositionState::Entered);
        assert!((pos.atr_at_entry - 1_500.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn duplicate_decision_submits_once() {
        let f = fixture().await;
        f.broker.set_quote("005930", 71_000.0, 70_500.0);

        let first = f.sync.execute_buy(&buy("sig-1")).await.unwrap();
        assert!(matches!(first, SyncResult::Filled { .. }));

        let second = f.sync.execute_buy(&buy("sig-1")).await.unwrap();
        assert_eq!(
            second,
            SyncResult::AlreadyTerminal {
                status: OrderStatus::Filled
            }
        );

        // Exactly one broker submission and one trade row.
        assert_eq!(f.broker.submissions().len(), 1);
        let key = OrderSynchronizer::idempotency_key(Mode::Paper, &buy("sig-1"));
        assert!(f.store.trade_by_key(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn partial_fill_opens_position_with_filled_slice() {
        let f = fixture().await;
        f.broker
            .set_fill_plan("005930", FillPlan::Partial { qty: 3, price: 70_000.0 });

        let result = f.sync.execute_buy(&buy("sig-1")).await.unwrap();
        assert_eq!(
            result,
            SyncResult::Partial {
                filled_qty: 3,
                avg_price: 70_000.0
            }
        );

        let key = OrderSynchronizer::idempotency_key(Mode::Paper, &buy("sig-1"));
        let row = f.store.order_state(&key).await.unwrap().unwrap();
        assert_eq!(row.status, OrderStatus::Partial);
        assert_eq!(row.filled_qty, 3);
        assert_eq!(row.remaining_qty, 7);

        // Remainder was cancelled at the broker.
        assert_eq!(f.broker.cancelled_orders().len(), 1);

        let pos = f.book.get("005930").unwrap();
        assert_eq!(pos.quantity, 3);
        assert_eq!(pos.state, PositionState::Entered);
    }

    #[tokio::test]
    async fn timeout_with_no_fill_cancels() {
        let f = fixture().await;
        f.broker.set_fill_plan("005930", FillPlan::NoFill);

        let result = f.sync.execute_buy(&buy("sig-1")).await.unwrap();
        assert_eq!(result, SyncResult::Cancelled);

        let key = OrderSynchronizer::idempotency_key(Mode::Paper, &buy("sig-1"));
        let row = f.store.order_state(&key).await.unwrap().unwrap();
        assert_eq!(row.status, OrderStatus::Cancelled);
        assert!(f.store.trade_by_key(&key).await.unwrap().is_none());
        // No open position remains.
        assert!(f.book.get("005930").is_none());
        assert_eq!(f.broker.cancelled_orders().len(), 1);
    }

    #[tokio::test]
    async fn rejected_submit_writes_failed_and_notifies_error() {
        let f = fixture().await;
        f.broker.set_fill_plan(
            "005930",
            FillPlan::Reject {
                reason: "insufficient buying power".into(),
            },
        );

        let result = f.sync.execute_buy(&buy("sig-1")).await.unwrap();
        assert!(matches!(result, SyncResult::Failed { .. }));

        let key = OrderSynchronizer::idempotency_key(Mode::Paper, &buy("sig-1"));
        let row = f.store.order_state(&key).await.unwrap().unwrap();
        assert_eq!(row.status, OrderStatus::Failed);

        let errors = f.notifier.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, "order_submit_failed");
        assert_eq!(errors[0].payload["idempotency_key"], key);
    }

    #[tokio::test]
    async fn crash_between_submit_and_wait_resumes_to_same_state() {
        let f = fixture().await;
        f.broker.set_quote("005930", 70_100.0, 70_000.0);

        // Simulate the crash: order submitted durably, fill never awaited.
        let decision = buy("sig-1");
        let key = OrderSynchronizer::idempotency_key(Mode::Paper, &decision);
        let ack = f
            .broker
            .place_order("005930", Side::Buy, 10, 0.0, OrderType::Market)
            .await
            .unwrap();
        let order_no = ack.order_no.unwrap();

        let mut row = OrderStateRow::pending(
            key.clone(),
            "sig-1".into(),
            "005930".into(),
            Side::Buy,
            10,
            Mode::Paper,
        );
        row.order_no = Some(order_no.clone());
        f.store.insert_order_state(&row).await.unwrap();
        f.store
            .transition_order_state(&OrderTransition {
                idempotency_key: key.clone(),
                status: OrderStatus::Submitted,
                filled_qty: 0,
                remaining_qty: 10,
                order_no: Some(order_no),
            })
            .await
            .unwrap();
        let mut pending = Position::pending("005930", Mode::Paper, 10);
        pending.atr_at_entry = 1_500.0;
        pending.stop_loss = 68_000.0;
        pending.take_profit = 77_000.0;
        f.store.upsert_position(&pending).await.unwrap();

        // "Restart": resume and settle.
        let resumed = f.sync.resume_incomplete().await.unwrap();
        assert_eq!(resumed, 1);

        let row = f.store.order_state(&key).await.unwrap().unwrap();
        assert_eq!(row.status, OrderStatus::Filled);
        let trade = f.store.trade_by_key(&key).await.unwrap().unwrap();
        assert!((trade.price - 70_100.0).abs() < f64::EPSILON);
        assert_eq!(f.broker.submissions().len(), 1);

        let pos = f.book.get("005930").unwrap();
        assert_eq!(pos.state, PositionState::Entered);
        assert!((pos.atr_at_entry - 1_500.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn sell_fills_and_closes_position() {
        let f = fixture().await;
        f.broker.set_quote("005930", 71_000.0, 70_500.0);
        f.sync.execute_buy(&buy("sig-1")).await.unwrap();

        f.broker.set_quote("005930", 73_500.0, 71_000.0);
        let sell = OrderDecision::sell("005930", 10, "sig-2", ExitReason::TakeProfit);
        let result = f.sync.execute_sell(&sell).await.unwrap();
        assert!(matches!(result, SyncResult::Filled { .. }));

        let key = OrderSynchronizer::idempotency_key(Mode::Paper, &sell);
        let trade = f.store.trade_by_key(&key).await.unwrap().unwrap();
        assert_eq!(trade.reason, Some(ExitReason::TakeProfit));
        assert!((trade.pnl - 25_000.0).abs() < f64::EPSILON);
        assert!((trade.entry_reference - 71_000.0).abs() < f64::EPSILON);

        // Book no longer holds the symbol; store row is EXITED history.
        assert!(f.book.get("005930").is_none());
        assert!(f
            .store
            .position("005930", Mode::Paper)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn call_auction_sell_parks_pending_exit_then_clears() {
        let f = fixture().await;
        f.broker.set_quote("005930", 71_000.0, 70_500.0);
        f.sync.execute_buy(&buy("sig-1")).await.unwrap();

        f.broker.set_market_closed(true);
        let sell = OrderDecision::sell("005930", 10, "sig-2", ExitReason::TrendBroken);
        let result = f.sync.execute_sell(&sell).await.unwrap();
        assert_eq!(
            result,
            SyncResult::PendingExit {
                reason: ExitReason::TrendBroken
            }
        );
        assert!(f.sync.has_pending_exit("005930"));

        // Backoff still active: no broker call.
        let before = f.broker.submissions().len();
        let again = f.sync.execute_sell(&sell).await.unwrap();
        assert!(matches!(again, SyncResult::PendingExit { .. }));
        assert_eq!(f.broker.submissions().len(), before);

        // Market reopens and the backoff is forced to expire.
        f.broker.set_market_closed(false);
        f.sync
            .pending_exits
            .write()
            .get_mut("005930")
            .unwrap()
            .next_retry_at = Utc::now() - chrono::Duration::seconds(1);

        // A fresh signal re-fires the exit; no duplicate trades.
        let sell2 = OrderDecision::sell("005930", 10, "sig-3", ExitReason::TrendBroken);
        let result = f.sync.execute_sell(&sell2).await.unwrap();
        assert!(matches!(result, SyncResult::Filled { .. }));
        assert!(!f.sync.has_pending_exit("005930"));

        let cleared: Vec<_> = f
            .notifier
            .events()
            .into_iter()
            .filter(|e| e.kind == "pending_exit_cleared")
            .collect();
        assert_eq!(cleared.len(), 1);
    }

    #[tokio::test]
    async fn stale_pending_rows_are_cancelled() {
        let f = fixture().await;

        let mut old_row = OrderStateRow::pending(
            "stale-key".into(),
            "sig-x".into(),
            "005930".into(),
            Side::Buy,
            10,
            Mode::Paper,
        );
        old_row.requested_at = Utc::now() - chrono::Duration::minutes(20);
        old_row.updated_at = old_row.requested_at;
        f.store.insert_order_state(&old_row).await.unwrap();

        let cancelled = f.sync.cleanup_stale().await.unwrap();
        assert_eq!(cancelled, 1);
        let row = f.store.order_state("stale-key").await.unwrap().unwrap();
        assert_eq!(row.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn fresh_pending_rows_survive_cleanup() {
        let f = fixture().await;
        let row = OrderStateRow::pending(
            "fresh-key".into(),
            "sig-x".into(),
            "005930".into(),
            Side::Buy,
            10,
            Mode::Paper,
        );
        f.store.insert_order_state(&row).await.unwrap();

        let cancelled = f.sync.cleanup_stale().await.unwrap();
        assert_eq!(cancelled, 0);
        let row = f.store.order_state("fresh-key").await.unwrap().unwrap();
        assert_eq!(row.status, OrderStatus::Pending);
    }
}
