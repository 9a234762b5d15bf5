// =============================================================================
// SQLite store — sqlx-backed implementation of the Store capability
// =============================================================================
//
// Schema is created at startup with CREATE TABLE IF NOT EXISTS. WAL journal
// mode and a small pool (≤ 5 connections) match the target host: a small VM
// with one decision loop and bounded I/O fan-out.
//
// `mode` participates in the primary key of positions (open rows),
// account_snapshots, and daily_summary. The idempotency key is unique across
// all modes on both order_state and trades — that uniqueness is what absorbs
// duplicate submissions.
// =============================================================================

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::info;

use crate::position::{Position, PositionState};
use crate::store::{
    AccountSnapshotRow, DailySummaryRow, DecisionWrite, OrderStateRow, OrderTransition, Store,
    TradeRow, UniverseRecordRow,
};
use crate::types::{ExitReason, Mode, OrderStatus, Side};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `db_url` (e.g. `sqlite://data/halla.db` or
    /// `sqlite::memory:` for tests) and initialise the schema.
    pub async fn connect(db_url: &str) -> Result<Self> {
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .context("failed to create database directory")?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to SQLite database")?;

        info!(db_url, "connected to database");

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                mode TEXT NOT NULL,
                entry_price REAL NOT NULL DEFAULT 0,
                quantity INTEGER NOT NULL DEFAULT 0,
                entered_at TEXT NOT NULL,
                atr_at_entry REAL NOT NULL DEFAULT 0,
                stop_loss REAL NOT NULL DEFAULT 0,
                take_profit REAL NOT NULL DEFAULT 0,
                trailing_stop REAL,
                highest_price REAL NOT NULL DEFAULT 0,
                current_price REAL NOT NULL DEFAULT 0,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                exit_price REAL,
                exit_reason TEXT,
                exited_at TEXT,
                realized_pnl REAL NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create positions table")?;

        // History rows (EXITED) are retained, so uniqueness only applies to
        // the open row per (symbol, mode).
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open
            ON positions (symbol, mode) WHERE state != 'EXITED';
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create open-position index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_state (
                idempotency_key TEXT PRIMARY KEY,
                signal_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                requested_qty INTEGER NOT NULL,
                filled_qty INTEGER NOT NULL DEFAULT 0,
                remaining_qty INTEGER NOT NULL,
                order_no TEXT,
                status TEXT NOT NULL,
                mode TEXT NOT NULL,
                requested_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create order_state table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_order_state_status
            ON order_state (mode, status);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create order_state index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                idempotency_key TEXT NOT NULL UNIQUE,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                price REAL NOT NULL,
                qty INTEGER NOT NULL,
                executed_at TEXT NOT NULL,
                reason TEXT,
                pnl REAL NOT NULL DEFAULT 0,
                pnl_pct REAL NOT NULL DEFAULT 0,
                entry_reference REAL NOT NULL DEFAULT 0,
                holding_days INTEGER NOT NULL DEFAULT 0,
                order_no TEXT,
                mode TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create trades table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_snapshots (
                snapshot_time TEXT NOT NULL,
                mode TEXT NOT NULL,
                total_equity REAL NOT NULL,
                cash REAL NOT NULL,
                unrealized_pnl REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                position_count INTEGER NOT NULL,
                PRIMARY KEY (snapshot_time, mode)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create account_snapshots table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS universe_records (
                trade_date TEXT PRIMARY KEY,
                selection_method TEXT NOT NULL,
                symbols TEXT NOT NULL,
                holdings_at_creation TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create universe_records table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS symbol_cache (
                stock_code TEXT PRIMARY KEY,
                stock_name TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create symbol_cache table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_summary (
                trade_date TEXT NOT NULL,
                mode TEXT NOT NULL,
                realized_pnl REAL NOT NULL DEFAULT 0,
                trade_count INTEGER NOT NULL DEFAULT 0,
                win_count INTEGER NOT NULL DEFAULT 0,
                loss_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (trade_date, mode)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("failed to create daily_summary table")?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Row mapping
    // -------------------------------------------------------------------------

    fn map_position(row: &SqliteRow) -> Result<Position> {
        let mode_str: String = row.try_get("mode")?;
        let state_str: String = row.try_get("state")?;
        let reason_str: Option<String> = row.try_get("exit_reason")?;

        Ok(Position {
            symbol: row.try_get("symbol")?,
            mode: Mode::parse(&mode_str)
                .with_context(|| format!("unknown mode '{mode_str}' in positions row"))?,
            entry_price: row.try_get("entry_price")?,
            quantity: row.try_get("quantity")?,
            entered_at: row.try_get::<DateTime<Utc>, _>("entered_at")?,
            atr_at_entry: row.try_get("atr_at_entry")?,
            stop_loss: row.try_get("stop_loss")?,
            take_profit: row.try_get("take_profit")?,
            trailing_stop: row.try_get("trailing_stop")?,
            highest_price: row.try_get("highest_price")?,
            current_price: row.try_get("current_price")?,
            unrealized_pnl: row.try_get("unrealized_pnl")?,
            state: PositionState::parse(&state_str)
                .with_context(|| format!("unknown state '{state_str}' in positions row"))?,
            exit_price: row.try_get("exit_price")?,
            exit_reason: reason_str.as_deref().and_then(ExitReason::parse),
            exited_at: row.try_get::<Option<DateTime<Utc>>, _>("exited_at")?,
            realized_pnl: row.try_get("realized_pnl")?,
        })
    }

    fn map_order_state(row: &SqliteRow) -> Result<OrderStateRow> {
        let side_str: String = row.try_get("side")?;
        let status_str: String = row.try_get("status")?;
        let mode_str: String = row.try_get("mode")?;

        Ok(OrderStateRow {
            idempotency_key: row.try_get("idempotency_key")?,
            signal_id: row.try_get("signal_id")?,
            symbol: row.try_get("symbol")?,
            side: Side::parse(&side_str)
                .with_context(|| format!("unknown side '{side_str}' in order_state row"))?,
            requested_qty: row.try_get("requested_qty")?,
            filled_qty: row.try_get("filled_qty")?,
            remaining_qty: row.try_get("remaining_qty")?,
            order_no: row.try_get("order_no")?,
            status: OrderStatus::parse(&status_str)
                .with_context(|| format!("unknown status '{status_str}' in order_state row"))?,
            mode: Mode::parse(&mode_str)
                .with_context(|| format!("unknown mode '{mode_str}' in order_state row"))?,
            requested_at: row.try_get::<DateTime<Utc>, _>("requested_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    fn map_trade(row: &SqliteRow) -> Result<TradeRow> {
        let side_str: String = row.try_get("side")?;
        let mode_str: String = row.try_get("mode")?;
        let reason_str: Option<String> = row.try_get("reason")?;

        Ok(TradeRow {
            idempotency_key: row.try_get("idempotency_key")?,
            symbol: row.try_get("symbol")?,
            side: Side::parse(&side_str)
                .with_context(|| format!("unknown side '{side_str}' in trades row"))?,
            price: row.try_get("price")?,
            qty: row.try_get("qty")?,
            executed_at: row.try_get::<DateTime<Utc>, _>("executed_at")?,
            reason: reason_str.as_deref().and_then(ExitReason::parse),
            pnl: row.try_get("pnl")?,
            pnl_pct: row.try_get("pnl_pct")?,
            entry_reference: row.try_get("entry_reference")?,
            holding_days: row.try_get("holding_days")?,
            order_no: row.try_get("order_no")?,
            mode: Mode::parse(&mode_str)
                .with_context(|| format!("unknown mode '{mode_str}' in trades row"))?,
        })
    }

    // -------------------------------------------------------------------------
    // Write helpers shared between direct calls and the decision transaction
    // -------------------------------------------------------------------------

    /// Update the open row for `(symbol, mode)`; insert when none exists.
    /// Two steps because a transition to EXITED must close the open row, not
    /// insert a sibling next to it.
    async fn upsert_position_on(conn: &mut sqlx::SqliteConnection, p: &Position) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE positions SET
                entry_price = ?, quantity = ?, entered_at = ?, atr_at_entry = ?,
                stop_loss = ?, take_profit = ?, trailing_stop = ?,
                highest_price = ?, current_price = ?, unrealized_pnl = ?,
                state = ?, exit_price = ?, exit_reason = ?, exited_at = ?,
                realized_pnl = ?
            WHERE symbol = ? AND mode = ? AND state != 'EXITED'
            "#,
        )
        .bind(p.entry_price)
        .bind(p.quantity)
        .bind(p.entered_at)
        .bind(p.atr_at_entry)
        .bind(p.stop_loss)
        .bind(p.take_profit)
        .bind(p.trailing_stop)
        .bind(p.highest_price)
        .bind(p.current_price)
        .bind(p.unrealized_pnl)
        .bind(p.state.as_str())
        .bind(p.exit_price)
        .bind(p.exit_reason.map(|r| r.as_str()))
        .bind(p.exited_at)
        .bind(p.realized_pnl)
        .bind(&p.symbol)
        .bind(p.mode.as_str())
        .execute(&mut *conn)
        .await
        .context("failed to update position")?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO positions (
                    symbol, mode, entry_price, quantity, entered_at, atr_at_entry,
                    stop_loss, take_profit, trailing_stop, highest_price,
                    current_price, unrealized_pnl, state, exit_price, exit_reason,
                    exited_at, realized_pnl
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&p.symbol)
            .bind(p.mode.as_str())
            .bind(p.entry_price)
            .bind(p.quantity)
            .bind(p.entered_at)
            .bind(p.atr_at_entry)
            .bind(p.stop_loss)
            .bind(p.take_profit)
            .bind(p.trailing_stop)
            .bind(p.highest_price)
            .bind(p.current_price)
            .bind(p.unrealized_pnl)
            .bind(p.state.as_str())
            .bind(p.exit_price)
            .bind(p.exit_reason.map(|r| r.as_str()))
            .bind(p.exited_at)
            .bind(p.realized_pnl)
            .execute(&mut *conn)
            .await
            .context("failed to insert position")?;
        }
        Ok(())
    }

    async fn insert_trade_on(conn: &mut sqlx::SqliteConnection, t: &TradeRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                idempotency_key, symbol, side, price, qty, executed_at, reason,
                pnl, pnl_pct, entry_reference, holding_days, order_no, mode
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(&t.idempotency_key)
        .bind(&t.symbol)
        .bind(t.side.as_str())
        .bind(t.price)
        .bind(t.qty)
        .bind(t.executed_at)
        .bind(t.reason.map(|r| r.as_str()))
        .bind(t.pnl)
        .bind(t.pnl_pct)
        .bind(t.entry_reference)
        .bind(t.holding_days)
        .bind(&t.order_no)
        .bind(t.mode.as_str())
        .execute(&mut *conn)
        .await
        .context("failed to insert trade")?;
        Ok(())
    }

    async fn transition_order_state_on(
        conn: &mut sqlx::SqliteConnection,
        tr: &OrderTransition,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE order_state
            SET status = ?, filled_qty = ?, remaining_qty = ?,
                order_no = COALESCE(?, order_no), updated_at = ?
            WHERE idempotency_key = ?
            "#,
        )
        .bind(tr.status.as_str())
        .bind(tr.filled_qty)
        .bind(tr.remaining_qty)
        .bind(&tr.order_no)
        .bind(Utc::now())
        .bind(&tr.idempotency_key)
        .execute(&mut *conn)
        .await
        .context("failed to transition order_state")?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_position(&self, position: &Position) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::upsert_position_on(&mut *conn, position).await
    }

    async fn open_positions(&self, mode: Mode) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT * FROM positions WHERE mode = ? AND state = 'ENTERED' ORDER BY symbol",
        )
        .bind(mode.as_str())
        .fetch_all(&self.pool)
        .await
        .context("failed to read open positions")?;
        rows.iter().map(Self::map_position).collect()
    }

    async fn position(&self, symbol: &str, mode: Mode) -> Result<Option<Position>> {
        let row = sqlx::query(
            "SELECT * FROM positions WHERE symbol = ? AND mode = ? AND state != 'EXITED'",
        )
        .bind(symbol)
        .bind(mode.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("failed to read position")?;
        row.as_ref().map(Self::map_position).transpose()
    }

    async fn order_state(&self, idempotency_key: &str) -> Result<Option<OrderStateRow>> {
        let row = sqlx::query("SELECT * FROM order_state WHERE idempotency_key = ?")
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read order_state")?;
        row.as_ref().map(Self::map_order_state).transpose()
    }

    async fn insert_order_state(&self, r: &OrderStateRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO order_state (
                idempotency_key, signal_id, symbol, side, requested_qty,
                filled_qty, remaining_qty, order_no, status, mode,
                requested_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&r.idempotency_key)
        .bind(&r.signal_id)
        .bind(&r.symbol)
        .bind(r.side.as_str())
        .bind(r.requested_qty)
        .bind(r.filled_qty)
        .bind(r.remaining_qty)
        .bind(&r.order_no)
        .bind(r.status.as_str())
        .bind(r.mode.as_str())
        .bind(r.requested_at)
        .bind(r.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to insert order_state")?;
        Ok(())
    }

    async fn transition_order_state(&self, transition: &OrderTransition) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::transition_order_state_on(&mut *conn, transition).await
    }

    async fn recoverable_order_states(&self, mode: Mode) -> Result<Vec<OrderStateRow>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM order_state
            WHERE mode = ? AND status IN ('PENDING', 'SUBMITTED', 'PARTIAL')
            ORDER BY requested_at
            "#,
        )
        .bind(mode.as_str())
        .fetch_all(&self.pool)
        .await
        .context("failed to read recoverable order_state rows")?;
        rows.iter().map(Self::map_order_state).collect()
    }

    async fn insert_trade(&self, trade: &TradeRow) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_trade_on(&mut *conn, trade).await
    }

    async fn trades_for_date(&self, trade_date: &str, mode: Mode) -> Result<Vec<TradeRow>> {
        // executed_at is RFC 3339 UTC; compare on the KST trade date handed in
        // by the caller as an inclusive day window.
        let rows = sqlx::query(
            r#"
            SELECT * FROM trades
            WHERE mode = ? AND strftime('%Y%m%d', datetime(executed_at, '+9 hours')) = ?
            ORDER BY executed_at
            "#,
        )
        .bind(mode.as_str())
        .bind(trade_date)
        .fetch_all(&self.pool)
        .await
        .context("failed to read trades for date")?;
        rows.iter().map(Self::map_trade).collect()
    }

    async fn trade_by_key(&self, idempotency_key: &str) -> Result<Option<TradeRow>> {
        let row = sqlx::query("SELECT * FROM trades WHERE idempotency_key = ?")
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read trade by key")?;
        row.as_ref().map(Self::map_trade).transpose()
    }

    async fn execute_decision(&self, write: &DecisionWrite) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin decision transaction")?;

        Self::transition_order_state_on(&mut *tx, &write.transition).await?;
        if let Some(trade) = &write.trade {
            Self::insert_trade_on(&mut *tx, trade).await?;
        }
        if let Some(position) = &write.position {
            Self::upsert_position_on(&mut *tx, position).await?;
        }

        tx.commit()
            .await
            .context("failed to commit decision transaction")?;
        Ok(())
    }

    async fn insert_account_snapshot(&self, r: &AccountSnapshotRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO account_snapshots (
                snapshot_time, mode, total_equity, cash, unrealized_pnl,
                realized_pnl, position_count
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (snapshot_time, mode) DO NOTHING
            "#,
        )
        .bind(r.snapshot_time)
        .bind(r.mode.as_str())
        .bind(r.total_equity)
        .bind(r.cash)
        .bind(r.unrealized_pnl)
        .bind(r.realized_pnl)
        .bind(r.position_count)
        .execute(&self.pool)
        .await
        .context("failed to insert account snapshot")?;
        Ok(())
    }

    async fn universe_record(&self, trade_date: &str) -> Result<Option<UniverseRecordRow>> {
        let row = sqlx::query("SELECT * FROM universe_records WHERE trade_date = ?")
            .bind(trade_date)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read universe record")?;

        row.map(|row| -> Result<UniverseRecordRow> {
            let symbols_json: String = row.try_get("symbols")?;
            let holdings_json: String = row.try_get("holdings_at_creation")?;
            Ok(UniverseRecordRow {
                trade_date: row.try_get("trade_date")?,
                selection_method: row.try_get("selection_method")?,
                symbols: serde_json::from_str(&symbols_json)
                    .context("malformed symbols json in universe record")?,
                holdings_at_creation: serde_json::from_str(&holdings_json)
                    .context("malformed holdings json in universe record")?,
                created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            })
        })
        .transpose()
    }

    async fn upsert_universe_record(&self, r: &UniverseRecordRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO universe_records (
                trade_date, selection_method, symbols, holdings_at_creation, created_at
            )
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (trade_date) DO UPDATE SET
                selection_method = excluded.selection_method,
                symbols = excluded.symbols,
                holdings_at_creation = excluded.holdings_at_creation,
                created_at = excluded.created_at
            "#,
        )
        .bind(&r.trade_date)
        .bind(&r.selection_method)
        .bind(serde_json::to_string(&r.symbols)?)
        .bind(serde_json::to_string(&r.holdings_at_creation)?)
        .bind(r.created_at)
        .execute(&self.pool)
        .await
        .context("failed to upsert universe record")?;
        Ok(())
    }

    async fn symbol_name(&self, stock_code: &str) -> Result<Option<(String, DateTime<Utc>)>> {
        let row = sqlx::query("SELECT stock_name, updated_at FROM symbol_cache WHERE stock_code = ?")
            .bind(stock_code)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read symbol cache")?;
        row.map(|row| -> Result<(String, DateTime<Utc>)> {
            Ok((
                row.try_get("stock_name")?,
                row.try_get::<DateTime<Utc>, _>("updated_at")?,
            ))
        })
        .transpose()
    }

    async fn upsert_symbol_cache(&self, stock_code: &str, stock_name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO symbol_cache (stock_code, stock_name, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (stock_code) DO UPDATE SET
                stock_name = excluded.stock_name,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(stock_code)
        .bind(stock_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to upsert symbol cache")?;
        Ok(())
    }

    async fn daily_summary(&self, trade_date: &str, mode: Mode) -> Result<Option<DailySummaryRow>> {
        let row = sqlx::query("SELECT * FROM daily_summary WHERE trade_date = ? AND mode = ?")
            .bind(trade_date)
            .bind(mode.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("failed to read daily summary")?;
        row.map(|row| -> Result<DailySummaryRow> {
            let mode_str: String = row.try_get("mode")?;
            Ok(DailySummaryRow {
                trade_date: row.try_get("trade_date")?,
                mode: Mode::parse(&mode_str)
                    .with_context(|| format!("unknown mode '{mode_str}' in daily_summary"))?,
                realized_pnl: row.try_get("realized_pnl")?,
                trade_count: row.try_get("trade_count")?,
                win_count: row.try_get("win_count")?,
                loss_count: row.try_get("loss_count")?,
            })
        })
        .transpose()
    }

    async fn upsert_daily_summary(&self, r: &DailySummaryRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_summary (
                trade_date, mode, realized_pnl, trade_count, win_count, loss_count
            )
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (trade_date, mode) DO UPDATE SET
                realized_pnl = excluded.realized_pnl,
                trade_count = excluded.trade_count,
                win_count = excluded.win_count,
                loss_count = excluded.loss_count
            "#,
        )
        .bind(&r.trade_date)
        .bind(r.mode.as_str())
        .bind(r.realized_pnl)
        .bind(r.trade_count)
        .bind(r.win_count)
        .bind(r.loss_count)
        .execute(&self.pool)
        .await
        .context("failed to upsert daily summary")?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::PositionState;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    fn entered_position(symbol: &str, mode: Mode) -> Position {
        let mut p = Position::pending(symbol, mode, 10);
        p.enter(71_000.0, 10, 1_500.0, 68_000.0, 77_000.0);
        p
    }

    #[tokio::test]
    async fn position_upsert_and_readback() {
        let s = store().await;
        let p = entered_position("005930", Mode::Paper);
        s.upsert_position(&p).await.unwrap();

        let loaded = s.position("005930", Mode::Paper).await.unwrap().unwrap();
        assert_eq!(loaded.state, PositionState::Entered);
        assert!((loaded.atr_at_entry - 1_500.0).abs() < f64::EPSILON);

        // Same (symbol, mode) upserts in place, no duplicate open rows.
        s.upsert_position(&loaded).await.unwrap();
        let open = s.open_positions(Mode::Paper).await.unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn positions_are_mode_scoped() {
        let s = store().await;
        s.upsert_position(&entered_position("005930", Mode::Paper))
            .await
            .unwrap();

        assert!(s.position("005930", Mode::Real).await.unwrap().is_none());
        assert!(s.open_positions(Mode::Real).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exited_history_is_retained_and_reentry_allowed() {
        let s = store().await;
        let mut p = entered_position("005930", Mode::Paper);
        s.upsert_position(&p).await.unwrap();

        p.exit(73_500.0, ExitReason::TakeProfit);
        s.upsert_position(&p).await.unwrap();
        assert!(s.position("005930", Mode::Paper).await.unwrap().is_none());

        // A new entry after the exit inserts a second row.
        let p2 = entered_position("005930", Mode::Paper);
        s.upsert_position(&p2).await.unwrap();
        let open = s.open_positions(Mode::Paper).await.unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn order_state_unique_key_rejects_duplicates() {
        let s = store().await;
        let row = OrderStateRow::pending(
            "key1".into(),
            "sig1".into(),
            "005930".into(),
            Side::Buy,
            10,
            Mode::Paper,
        );
        s.insert_order_state(&row).await.unwrap();
        assert!(s.insert_order_state(&row).await.is_err());

        let loaded = s.order_state("key1").await.unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Pending);
        assert_eq!(loaded.remaining_qty, 10);
    }

    #[tokio::test]
    async fn recoverable_rows_exclude_terminal() {
        let s = store().await;
        for (key, status) in [
            ("k1", OrderStatus::Pending),
            ("k2", OrderStatus::Submitted),
            ("k3", OrderStatus::Filled),
        ] {
            let row = OrderStateRow::pending(
                key.into(),
                "sig".into(),
                "005930".into(),
                Side::Buy,
                10,
                Mode::Paper,
            );
            s.insert_order_state(&row).await.unwrap();
            s.transition_order_state(&OrderTransition {
                idempotency_key: key.into(),
                status,
                filled_qty: 0,
                remaining_qty: 10,
                order_no: None,
            })
            .await
            .unwrap();
        }

        let recoverable = s.recoverable_order_states(Mode::Paper).await.unwrap();
        let keys: Vec<_> = recoverable.iter().map(|r| r.idempotency_key.as_str()).collect();
        assert_eq!(keys, vec!["k1", "k2"]);
    }

    #[tokio::test]
    async fn decision_transaction_commits_all_rows() {
        let s = store().await;
        let row = OrderStateRow::pending(
            "key1".into(),
            "sig1".into(),
            "005930".into(),
            Side::Buy,
            10,
            Mode::Paper,
        );
        s.insert_order_state(&row).await.unwrap();

        let position = entered_position("005930", Mode::Paper);
        let trade = TradeRow {
            idempotency_key: "key1".into(),
            symbol: "005930".into(),
            side: Side::Buy,
            price: 71_000.0,
            qty: 10,
            executed_at: Utc::now(),
            reason: None,
            pnl: 0.0,
            pnl_pct: 0.0,
            entry_reference: 71_000.0,
            holding_days: 0,
            order_no: Some("KRX1".into()),
            mode: Mode::Paper,
        };

        s.execute_decision(&DecisionWrite {
            transition: OrderTransition {
                idempotency_key: "key1".into(),
                status: OrderStatus::Filled,
                filled_qty: 10,
                remaining_qty: 0,
                order_no: Some("KRX1".into()),
            },
            trade: Some(trade),
            position: Some(position),
        })
        .await
        .unwrap();

        let os = s.order_state("key1").await.unwrap().unwrap();
        assert_eq!(os.status, OrderStatus::Filled);
        assert_eq!(os.filled_qty, 10);
        assert!(s.trade_by_key("key1").await.unwrap().is_some());
        assert_eq!(s.open_positions(Mode::Paper).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_trade_insert_is_noop() {
        let s = store().await;
        let trade = TradeRow {
            idempotency_key: "key1".into(),
            symbol: "005930".into(),
            side: Side::Buy,
            price: 71_000.0,
            qty: 10,
            executed_at: Utc::now(),
            reason: None,
            pnl: 0.0,
            pnl_pct: 0.0,
            entry_reference: 71_000.0,
            holding_days: 0,
            order_no: None,
            mode: Mode::Paper,
        };
        s.insert_trade(&trade).await.unwrap();
        s.insert_trade(&trade).await.unwrap();

        assert!(s.trade_by_key("key1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn universe_record_roundtrip() {
        let s = store().await;
        let record = UniverseRecordRow {
            trade_date: "20250602".into(),
            selection_method: "combined".into(),
            symbols: vec!["005930".into(), "000660".into()],
            holdings_at_creation: vec!["005930".into()],
            created_at: Utc::now(),
        };
        s.upsert_universe_record(&record).await.unwrap();

        let loaded = s.universe_record("20250602").await.unwrap().unwrap();
        assert_eq!(loaded.symbols, record.symbols);
        assert_eq!(loaded.selection_method, "combined");
        assert!(s.universe_record("20250603").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn daily_summary_upsert_overwrites() {
        let s = store().await;
        let mut row = DailySummaryRow {
            trade_date: "20250602".into(),
            mode: Mode::Paper,
            realized_pnl: -50_000.0,
            trade_count: 2,
            win_count: 0,
            loss_count: 2,
        };
        s.upsert_daily_summary(&row).await.unwrap();
        row.realized_pnl = 30_000.0;
        row.trade_count = 3;
        row.win_count = 1;
        s.upsert_daily_summary(&row).await.unwrap();

        let loaded = s.daily_summary("20250602", Mode::Paper).await.unwrap().unwrap();
        assert_eq!(loaded.trade_count, 3);
        assert!((loaded.realized_pnl - 30_000.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn symbol_cache_roundtrip() {
        let s = store().await;
        s.upsert_symbol_cache("005930", "Samsung Electronics")
            .await
            .unwrap();
        let (name, _at) = s.symbol_name("005930").await.unwrap().unwrap();
        assert_eq!(name, "Samsung Electronics");
        assert!(s.symbol_name("999999").await.unwrap().is_none());
    }
}
