// =============================================================================
// Store capability interface — durable rows and the decision transaction
// =============================================================================
//
// The store owns the durable tables: positions, trades, order_state,
// account_snapshots, symbol_cache, daily_summary. Everything is namespaced by
// mode. The one non-negotiable contract is `execute_decision`: all writes for
// a single order decision (order_state transition + trade row + position
// upsert) commit or roll back together.
// =============================================================================

pub mod file_cache;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::position::Position;
use crate::types::{ExitReason, Mode, OrderStatus, Side};

/// Durable record of one order decision, keyed by idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStateRow {
    pub idempotency_key: String,
    pub signal_id: String,
    pub symbol: String,
    pub side: Side,
    pub requested_qty: i64,
    pub filled_qty: i64,
    pub remaining_qty: i64,
    pub order_no: Option<String>,
    pub status: OrderStatus,
    pub mode: Mode,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderStateRow {
    /// Fresh PENDING row for a new decision.
    pub fn pending(
        idempotency_key: String,
        signal_id: String,
        symbol: String,
        side: Side,
        qty: i64,
        mode: Mode,
    ) -> Self {
        let now = Utc::now();
        Self {
            idempotency_key,
            signal_id,
            symbol,
            side,
            requested_qty: qty,
            filled_qty: 0,
            remaining_qty: qty,
            order_no: None,
            status: OrderStatus::Pending,
            mode,
            requested_at: now,
            updated_at: now,
        }
    }
}

/// One executed trade. Every row corresponds to exactly one terminal
/// order_state row via the shared idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRow {
    pub idempotency_key: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub qty: i64,
    pub executed_at: DateTime<Utc>,
    pub reason: Option<ExitReason>,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub entry_reference: f64,
    pub holding_days: i64,
    pub order_no: Option<String>,
    pub mode: Mode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshotRow {
    pub snapshot_time: DateTime<Utc>,
    pub mode: Mode,
    pub total_equity: f64,
    pub cash: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub position_count: i64,
}

/// Daily universe selection, created at most once per trade date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseRecordRow {
    pub trade_date: String,
    pub selection_method: String,
    pub symbols: Vec<String>,
    pub holdings_at_creation: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySummaryRow {
    pub trade_date: String,
    pub mode: Mode,
    pub realized_pnl: f64,
    pub trade_count: i64,
    pub win_count: i64,
    pub loss_count: i64,
}

/// The transition applied to an order_state row inside a decision.
#[derive(Debug, Clone)]
pub struct OrderTransition {
    pub idempotency_key: String,
    pub status: OrderStatus,
    pub filled_qty: i64,
    pub remaining_qty: i64,
    pub order_no: Option<String>,
}

/// Everything one order decision writes, committed atomically.
#[derive(Debug, Clone)]
pub struct DecisionWrite {
    pub transition: OrderTransition,
    pub trade: Option<TradeRow>,
    pub position: Option<Position>,
}

/// Durable persistence capability.
#[async_trait]
pub trait Store: Send + Sync {
    // --- positions -----------------------------------------------------------
    /// Insert or update the open row for `(position.symbol, position.mode)`.
    async fn upsert_position(&self, position: &Position) -> anyhow::Result<()>;
    async fn open_positions(&self, mode: Mode) -> anyhow::Result<Vec<Position>>;
    async fn position(&self, symbol: &str, mode: Mode) -> anyhow::Result<Option<Position>>;

    // --- order_state ---------------------------------------------------------
    async fn order_state(&self, idempotency_key: &str) -> anyhow::Result<Option<OrderStateRow>>;
    async fn insert_order_state(&self, row: &OrderStateRow) -> anyhow::Result<()>;
    async fn transition_order_state(&self, transition: &OrderTransition) -> anyhow::Result<()>;
    /// Non-terminal rows, oldest first, for crash recovery and stale cleanup.
    async fn recoverable_order_states(&self, mode: Mode) -> anyhow::Result<Vec<OrderStateRow>>;

    // --- trades --------------------------------------------------------------
    async fn insert_trade(&self, trade: &TradeRow) -> anyhow::Result<()>;
    async fn trades_for_date(&self, trade_date: &str, mode: Mode)
        -> anyhow::Result<Vec<TradeRow>>;
    async fn trade_by_key(&self, idempotency_key: &str) -> anyhow::Result<Option<TradeRow>>;

    // --- decision transaction ------------------------------------------------
    /// Apply all writes for one decision in a single transaction.
    async fn execute_decision(&self, write: &DecisionWrite) -> anyhow::Result<()>;

    // --- snapshots -----------------------------------------------------------
    async fn insert_account_snapshot(&self, row: &AccountSnapshotRow) -> anyhow::Result<()>;

    // --- universe ------------------------------------------------------------
    async fn universe_record(&self, trade_date: &str)
        -> anyhow::Result<Option<UniverseRecordRow>>;
    async fn upsert_universe_record(&self, row: &UniverseRecordRow) -> anyhow::Result<()>;

    // --- symbol cache --------------------------------------------------------
    async fn symbol_name(&self, stock_code: &str) -> anyhow::Result<Option<(String, DateTime<Utc>)>>;
    async fn upsert_symbol_cache(&self, stock_code: &str, stock_name: &str) -> anyhow::Result<()>;

    // --- daily summary -------------------------------------------------------
    async fn daily_summary(
        &self,
        trade_date: &str,
        mode: Mode,
    ) -> anyhow::Result<Option<DailySummaryRow>>;
    async fn upsert_daily_summary(&self, row: &DailySummaryRow) -> anyhow::Result<()>;
}
