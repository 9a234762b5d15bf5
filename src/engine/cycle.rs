// =============================================================================
// Execution loop — per-cycle orchestration with dynamic cadence
// =============================================================================
//
// One cycle, per symbol in (holdings ∪ entry candidates):
//   1. fetch the quote and recent daily bars
//   2. gap protection for open positions (against the persisted entry
//      reference, never today's values)
//   3. strategy signal
//   4. trailing-stop advance (monotone, entry-era ATR)
//   5. risk gate, then the order synchronizer
//   6. account snapshot at most once per minute
//
// Cadence: 60 s baseline; 15 s while any open position sits inside the
// near-stop band. Floor 15 s.
//
// A network outage aborts the cycle without placing orders; the reconciler
// runs once on recovery before the next full cycle. One symbol's failure is
// caught at the loop boundary and never stops the others.
// =============================================================================

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::engine::guard;
use crate::engine::sync::{OrderDecision, SyncResult};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::notify::Event;
use crate::position::PositionState;
use crate::risk::RiskDenial;
use crate::store::{AccountSnapshotRow, DailySummaryRow, Store};
use crate::types::{ExitReason, Side, Signal};

/// Daily-bar history requested per symbol each cycle.
const BARS_PER_CYCLE: usize = 40;

/// Symbol-name cache entries older than this are refreshed best-effort.
const SYMBOL_CACHE_TTL_DAYS: i64 = 30;

/// What one cycle did, for cadence control and tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub symbols_processed: usize,
    pub orders_placed: usize,
    pub near_stop: bool,
    pub aborted_on_outage: bool,
    pub reconciled_after_outage: bool,
}

impl Engine {
    /// Run cycles until shutdown or `max_runs` cycles have completed.
    pub async fn run(&self, max_runs: Option<u64>) -> EngineResult<()> {
        let mut runs: u64 = 0;
        loop {
            let report = match self.run_cycle().await {
                Ok(report) => report,
                Err(e) => {
                    // Loop-level exceptions are operator-visible but do not
                    // kill the process.
                    error!(error = %e, "cycle failed");
                    self.notifier
                        .notify(Event::error(
                            "cycle_failed",
                            json!({ "mode": self.config.mode.as_str(), "reason": e.to_string() }),
                        ))
                        .await;
                    CycleReport::default()
                }
            };

            runs += 1;
            if let Some(max) = max_runs {
                if runs >= max {
                    info!(runs, "max runs reached, stopping loop");
                    return Ok(());
                }
            }

            let sleep_secs = if report.near_stop {
                self.config.near_stop_interval_seconds
            } else {
                self.config.interval_seconds
            }
            .max(15);
            debug!(sleep_secs, near_stop = report.near_stop, "cycle complete");

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
                _ = tokio::signal::ctrl_c() => {
                    warn!("shutdown signal received, completing at decision boundary");
                    return Ok(());
                }
            }
        }
    }

    /// One full cycle over holdings ∪ entry candidates.
    pub async fn run_cycle(&self) -> EngineResult<CycleReport> {
        let now = Utc::now();
        let mut report = CycleReport::default();

        // Outage handling: abort without orders, reconcile once on recovery.
        if self.broker.network_outage() {
            warn!("network outage active, aborting cycle without orders");
            self.set_outage_pending(true);
            report.aborted_on_outage = true;
            return Ok(report);
        }
        if self.outage_pending() {
            info!("network recovered, reconciling before next cycle");
            self.reconciler.run().await?;
            self.set_outage_pending(false);
            report.reconciled_after_outage = true;
        }

        // Universe and the symbol set for this cycle.
        let holdings: Vec<String> = self.book.symbols();
        let universe = self
            .universe
            .universe_for(&self.config, &holdings, now)
            .await?;
        if universe.from_fallback {
            warn!(
                trade_date = %universe.trade_date,
                method = %universe.method,
                "running on fallback universe"
            );
        }
        let universe_set: HashSet<&String> = universe.symbols.iter().collect();

        let mut symbols: Vec<String> = holdings.clone();
        for s in &universe.symbols {
            if !symbols.contains(s) {
                symbols.push(s.clone());
            }
        }

        for symbol in &symbols {
            let in_universe = universe_set.contains(symbol);
            if let Err(e) = self.process_symbol(symbol, in_universe, &mut report).await {
                // One symbol's failure never stops the others.
                error!(symbol = %symbol, error = %e, "symbol cycle failed");
                if !matches!(e, EngineError::BrokerTransient(_)) {
                    self.notifier
                        .notify(Event::error(
                            "symbol_cycle_failed",
                            json!({
                                "symbol": symbol,
                                "mode": self.config.mode.as_str(),
                                "reason": e.to_string(),
                            }),
                        ))
                        .await;
                }
            }
            report.symbols_processed += 1;
        }

        // Snapshot, daily summary, drawdown breaker — at most once a minute.
        if let Err(e) = self.persist_snapshot(false).await {
            warn!(error = %e, "snapshot persistence failed");
        }

        self.mirror_book_to_file();

        report.near_stop = self.any_position_near_stop();
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Per-symbol pipeline
    // -------------------------------------------------------------------------

    async fn process_symbol(
        &self,
        symbol: &str,
        in_universe: bool,
        report: &mut CycleReport,
    ) -> EngineResult<()> {
        let now = Utc::now();

        // 1. Quote. No quote → nothing to decide.
        let Some(quote) = self.broker.get_current_price(symbol).await? else {
            debug!(symbol, "no quote, skipping");
            return Ok(());
        };

        let position = self.book.get(symbol);
        if position.is_some() {
            self.book.with_mut(symbol, |p| p.observe_price(quote.price));
        }

        // 2. Gap protection, open positions only, before anything else.
        if let Some(pos) = &position {
            if let Some(gap) = guard::check_gap(
                pos,
                quote.open,
                self.config.gap_threshold_pct,
                self.config.gap_epsilon_pct,
            ) {
                self.notifier
                    .notify(Event::warning(
                        "gap_protection",
                        json!({
                            "symbol": symbol,
                            "mode": self.config.mode.as_str(),
                            "raw_gap_pct": gap.raw_gap_pct,
                            "display_gap_pct": gap.display_gap_pct,
                            "reference": gap.reference,
                            "open_price": gap.open_price,
                        }),
                    ))
                    .await;
                return self
                    .try_exit(symbol, ExitReason::GapProtection, report)
                    .await;
            }
        }

        // 3. Strategy evaluation over oldest-first bars.
        let mut bars = self.broker.get_daily_ohlcv(symbol, BARS_PER_CYCLE).await?;
        bars.reverse();

        let verdict = self
            .strategy
            .evaluate(symbol, position.as_ref(), &bars, quote.price);

        // 4. Trailing-stop advance for surviving open positions.
        if position
            .as_ref()
            .map(|p| p.state == PositionState::Entered)
            .unwrap_or(false)
            && verdict.signal != Signal::Sell
        {
            let moved = self.book.with_mut(symbol, |p| {
                guard::advance_trailing(p, self.config.strategy_params.trail_atr_multiplier)
            });
            if let Some(Some(trail)) = moved {
                debug!(symbol, trailing_stop = trail, "trailing stop advanced");
                if let Some(p) = self.book.get(symbol) {
                    if let Err(e) = self.store.upsert_position(&p).await {
                        warn!(symbol, error = %e, "failed to persist trailing stop");
                    }
                }
            }
        }

        // 5. Dispatch.
        match verdict.signal {
            Signal::Hold => Ok(()),
            Signal::Sell => {
                let reason = verdict.exit_reason.unwrap_or(ExitReason::SignalOnly);
                self.try_exit(symbol, reason, report).await
            }
            Signal::Buy => {
                // Entry gating: universe membership, not already held,
                // capacity, then the risk chain.
                if !in_universe {
                    debug!(symbol, "buy signal outside universe, ignored");
                    return Ok(());
                }
                if position.is_some() {
                    debug!(symbol, "buy signal while holding, ignored");
                    return Ok(());
                }
                if self.book.entered_count() >= self.config.max_positions as usize {
                    debug!(symbol, "max positions reached, entry skipped");
                    return Ok(());
                }
                if let Err(denial) = self.risk.check_entry(now) {
                    debug!(symbol, denial = %denial, "entry denied by risk");
                    return Ok(());
                }

                let decision = OrderDecision::buy(
                    symbol,
                    self.order_quantity,
                    &Uuid::new_v4().to_string(),
                    verdict.atr_at_entry.unwrap_or(0.0),
                    verdict.suggested_stop,
                    verdict.suggested_take_profit,
                );
                self.risk.record_entry_attempt(now);
                let result = self.sync.execute_buy(&decision).await?;
                report.orders_placed += 1;
                info!(symbol, result = ?result, "entry decision settled");
                Ok(())
            }
        }
    }

    /// Route an exit through the risk gate and the synchronizer.
    async fn try_exit(
        &self,
        symbol: &str,
        reason: ExitReason,
        report: &mut CycleReport,
    ) -> EngineResult<()> {
        let now = Utc::now();
        let Some(position) = self.book.get(symbol) else {
            return Ok(());
        };
        if position.state != PositionState::Entered || position.quantity <= 0 {
            return Ok(());
        }

        match self.risk.check_exit(now) {
            Ok(()) => {
                // The market is verifiably open: any parked backoff is lifted.
                self.sync.release_pending_backoff(symbol);
            }
            Err(RiskDenial::CallAuction) => {
                info!(symbol, reason = %reason, "exit deferred: call auction window");
                self.sync.park_pending_exit(symbol, reason);
                return Ok(());
            }
            Err(denial) => {
                debug!(symbol, denial = %denial, "exit denied");
                return Ok(());
            }
        }

        let entry_price = position.entry_price;
        let decision = OrderDecision::sell(
            symbol,
            position.quantity,
            &Uuid::new_v4().to_string(),
            reason,
        );
        let result = self.sync.execute_sell(&decision).await?;
        report.orders_placed += 1;

        if let SyncResult::Filled {
            filled_qty,
            avg_price,
        }
        | SyncResult::Partial {
            filled_qty,
            avg_price,
        } = result
        {
            let gross = (avg_price - entry_price) * filled_qty as f64;
            let commission =
                self.config.commission_rate * (entry_price + avg_price) * filled_qty as f64;
            let pnl = gross - commission;
            let pnl_pct = if entry_price > 0.0 {
                (avg_price - entry_price) / entry_price * 100.0
            } else {
                0.0
            };
            self.risk.record_trade_result(pnl, pnl_pct, now);
            info!(
                symbol,
                reason = %reason,
                filled_qty,
                avg_price,
                pnl,
                "exit settled"
            );
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Snapshot and mirrors
    // -------------------------------------------------------------------------

    /// Persist an account snapshot and the daily summary, at most once per
    /// minute (always when `force` is set, e.g. at shutdown). Also runs the
    /// cumulative-drawdown breaker against fresh equity.
    pub(crate) async fn persist_snapshot(&self, force: bool) -> EngineResult<()> {
        let now = Utc::now();
        if !force && !self.snapshot_due(now) {
            return Ok(());
        }

        let balance = self.broker.get_account_balance().await?;
        let entered = self.book.entered();
        let unrealized: f64 = entered.iter().map(|p| p.unrealized_pnl).sum();

        // Refresh stale symbol names from the holdings we already have in
        // hand. Best-effort: a failure never blocks trading.
        for holding in &balance.holdings {
            let stale = match self.store.symbol_name(&holding.symbol).await {
                Ok(Some((_, updated_at))) => {
                    (now - updated_at).num_days() >= SYMBOL_CACHE_TTL_DAYS
                }
                Ok(None) => true,
                Err(_) => false,
            };
            if stale && !holding.name.is_empty() {
                if let Err(e) = self
                    .store
                    .upsert_symbol_cache(&holding.symbol, &holding.name)
                    .await
                {
                    debug!(symbol = %holding.symbol, error = %e, "symbol cache refresh failed");
                }
            }
        }

        if let Some(denial) = self.risk.update_equity(balance.total_equity) {
            self.notifier
                .notify(Event::error(
                    "drawdown_kill_switch",
                    json!({
                        "mode": self.config.mode.as_str(),
                        "reason": denial.to_string(),
                        "total_equity": balance.total_equity,
                    }),
                ))
                .await;
        }

        let trade_date = crate::market::hours::trade_date(now);
        let trades = self
            .store
            .trades_for_date(&trade_date, self.config.mode)
            .await
            .map_err(|e| EngineError::StorePersistence(e.to_string()))?;
        let sells: Vec<_> = trades.iter().filter(|t| t.side == Side::Sell).collect();
        let realized: f64 = sells.iter().map(|t| t.pnl).sum();

        let snapshot = AccountSnapshotRow {
            snapshot_time: now,
            mode: self.config.mode,
            total_equity: balance.total_equity,
            cash: balance.cash,
            unrealized_pnl: unrealized,
            realized_pnl: realized,
            position_count: entered.len() as i64,
        };
        self.store
            .insert_account_snapshot(&snapshot)
            .await
            .map_err(|e| EngineError::StorePersistence(e.to_string()))?;

        let summary = DailySummaryRow {
            trade_date,
            mode: self.config.mode,
            realized_pnl: realized,
            trade_count: trades.len() as i64,
            win_count: sells.iter().filter(|t| t.pnl >= 0.0).count() as i64,
            loss_count: sells.iter().filter(|t| t.pnl < 0.0).count() as i64,
        };
        self.store
            .upsert_daily_summary(&summary)
            .await
            .map_err(|e| EngineError::StorePersistence(e.to_string()))?;

        self.mark_snapshot(now);
        debug!(
            total_equity = balance.total_equity,
            positions = entered.len(),
            "account snapshot persisted"
        );
        Ok(())
    }

    /// Mirror the in-memory book into data/positions.json.
    pub(crate) fn mirror_book_to_file(&self) {
        let positions = self.book.entered();
        if let Err(e) = self.file_cache.save_positions(self.config.mode, &positions) {
            warn!(error = %e, "failed to mirror positions to file cache");
        }
    }

    fn any_position_near_stop(&self) -> bool {
        self.book.entered().iter().any(|p| {
            p.stop_distance_in_atr()
                .map(|d| d <= self.config.strategy_params.near_stop_band)
                .unwrap_or(false)
        })
    }
}

// =============================================================================
// Tests — end-to-end cycle scenarios over the fake broker
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::{FakeBroker, FillPlan};
    use crate::config::EngineConfig;
    use crate::market::Candle;
    use crate::notify::RecordingNotifier;
    use crate::position::{Position, PositionBook};
    use crate::risk::{RiskController, RiskLimits};
    use crate::store::sqlite::SqliteStore;
    use crate::store::Store;
    use crate::strategy::TrendAtrStrategy;
    use crate::types::Mode;
    use chrono::NaiveDate;
    use std::sync::Arc;

    struct Fixture {
        broker: Arc<FakeBroker>,
        store: Arc<SqliteStore>,
        book: Arc<PositionBook>,
        notifier: Arc<RecordingNotifier>,
        engine: Engine,
        _dir: std::path::PathBuf,
    }

    /// Whether the real clock currently sits inside the KRX regular session.
    /// Entry/exit assertions that need the gate open are skipped otherwise —
    /// risk gating itself is covered with pinned clocks in risk::tests.
    fn session_open_now() -> bool {
        crate::market::hours::entries_allowed(Utc::now())
    }

    async fn fixture(tag: &str) -> Fixture {
        let dir = std::env::temp_dir().join(format!(
            "halla-cycle-test-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);

        let mut config = EngineConfig::default();
        config.mode = Mode::Paper;
        config.data_dir = dir.display().to_string();
        config.fixed_symbols = vec!["005930".to_string()];
        config.max_stocks = 1;
        config.commission_rate = 0.0;

        let broker = Arc::new(FakeBroker::new());
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let book = Arc::new(PositionBook::new(Mode::Paper));
        let notifier = Arc::new(RecordingNotifier::new());
        let risk = Arc::new(RiskController::new(
            RiskLimits {
                daily_max_loss_pct: 50.0,
                per_trade_loss_pct: 50.0,
                cumulative_dd_pct: 90.0,
                max_consecutive_losses: 100,
                daily_max_trades: 100,
            },
            Mode::Paper,
            dir.join("KILL_SWITCH"),
            10_000_000.0,
            Utc::now(),
        ));
        let strategy = Arc::new(TrendAtrStrategy::new(config.strategy_params.clone()));

        let engine = Engine::new(
            config.clone(),
            broker.clone(),
            store.clone(),
            strategy,
            notifier.clone(),
            book.clone(),
            risk,
            10,
        );

        Fixture {
            broker,
            store,
            book,
            notifier,
            engine,
            _dir: dir,
        }
    }

    fn rising_bars(n: usize) -> Vec<Candle> {
        // Newest-first as the broker returns them.
        (0..n)
            .rev()
            .map(|i| {
                let base = 60_000.0 + i as f64 * 200.0;
                Candle::new(
                    NaiveDate::from_ymd_opt(2025, 1, 1)
                        .unwrap()
                        .checked_add_days(chrono::Days::new(i as u64))
                        .unwrap(),
                    base,
                    base + 600.0,
                    base - 600.0,
                    base + 100.0,
                    800_000,
                )
            })
            .collect()
    }

    fn entered(symbol: &str, entry: f64, qty: i64) -> Position {
        let mut p = Position::pending(symbol, Mode::Paper, qty);
        p.enter(entry, qty, 1_500.0, entry - 3_000.0, entry + 6_000.0);
        p
    }

    #[tokio::test]
    async fn outage_aborts_cycle_and_reconciles_on_recovery() {
        let f = fixture("outage").await;
        f.broker.set_outage(true);

        let report = f.engine.run_cycle().await.unwrap();
        assert!(report.aborted_on_outage);
        assert_eq!(report.symbols_processed, 0);

        f.broker.set_outage(false);
        let report = f.engine.run_cycle().await.unwrap();
        assert!(report.reconciled_after_outage);
    }

    #[tokio::test]
    async fn clean_buy_cycle_enters_position() {
        if !session_open_now() {
            return;
        }
        let f = fixture("buy").await;
        f.broker.set_bars("005930", rising_bars(40));
        let last_close = 60_000.0 + 39.0 * 200.0 + 100.0;
        f.broker.set_quote("005930", last_close + 1_000.0, last_close);

        let report = f.engine.run_cycle().await.unwrap();
        assert_eq!(report.orders_placed, 1);

        let pos = f.book.get("005930").unwrap();
        assert_eq!(pos.state, PositionState::Entered);
        assert_eq!(pos.quantity, 10);
        assert_eq!(f.broker.submissions().len(), 1);
        assert_eq!(f.store.open_positions(Mode::Paper).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gap_down_exits_with_gap_protection() {
        if !crate::market::hours::exits_allowed(Utc::now()) {
            return;
        }
        let f = fixture("gap").await;
        // Overnight position with entry reference 70,000; today opens 64,000.
        f.book.upsert(entered("005930", 70_000.0, 10));
        f.broker.set_quote("005930", 64_100.0, 64_000.0);
        f.broker.set_bars("005930", rising_bars(40));

        let report = f.engine.run_cycle().await.unwrap();
        assert_eq!(report.orders_placed, 1);
        assert!(f.book.get("005930").is_none());

        let warnings: Vec<_> = f
            .notifier
            .events()
            .into_iter()
            .filter(|e| e.kind == "gap_protection")
            .collect();
        assert_eq!(warnings.len(), 1);
        let raw = warnings[0].payload["raw_gap_pct"].as_f64().unwrap();
        assert!(raw < -8.0 && raw > -9.0);
        assert!(warnings[0].payload["display_gap_pct"].as_f64().is_some());

        // The trade row carries the GAP_PROTECTION reason.
        let trade_date = crate::market::hours::trade_date(Utc::now());
        let trades = f
            .store
            .trades_for_date(&trade_date, Mode::Paper)
            .await
            .unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].reason, Some(ExitReason::GapProtection));
    }

    #[tokio::test]
    async fn near_stop_band_switches_cadence() {
        let f = fixture("nearstop").await;
        // Stop at entry − 3,000 with ATR 1,500: price 300 above the stop is
        // 0.2 ATR away, inside the 0.3 band.
        let mut pos = entered("005930", 70_000.0, 10);
        pos.observe_price(67_300.0);
        f.book.upsert(pos);
        // No quote: the symbol is skipped but the book still drives cadence.
        f.broker.set_bars("005930", rising_bars(40));

        let report = f.engine.run_cycle().await.unwrap();
        assert!(report.near_stop);

        // Price well above the stop leaves the fast band.
        f.book.with_mut("005930", |p| p.observe_price(75_000.0));
        let report = f.engine.run_cycle().await.unwrap();
        assert!(!report.near_stop);
    }

    #[tokio::test]
    async fn one_symbol_failure_does_not_stop_others() {
        let f = fixture("isolation").await;
        // A holding in 000660 forces a second symbol into the set beside the
        // single-member universe.
        f.book.upsert(entered("000660", 150_000.0, 5));
        f.broker.set_quote("005930", 71_000.0, 70_500.0);
        f.broker.set_bars("005930", rising_bars(40));
        // 000660 has a quote but no bars: strategy holds on data quality.
        f.broker.set_quote("000660", 150_000.0, 150_000.0);

        let report = f.engine.run_cycle().await.unwrap();
        assert_eq!(report.symbols_processed, 2);
    }

    #[tokio::test]
    async fn snapshot_written_at_most_once_per_minute() {
        let f = fixture("snapshot").await;
        f.engine.persist_snapshot(false).await.unwrap();
        let first_due = f.engine.snapshot_due(Utc::now());
        assert!(!first_due, "second snapshot within a minute must be skipped");

        // Forced snapshots (shutdown) always write.
        f.engine.persist_snapshot(true).await.unwrap();
    }

    #[tokio::test]
    async fn sell_not_evaluated_for_universe_nonmembers_but_holdings_always() {
        if !crate::market::hours::exits_allowed(Utc::now()) {
            return;
        }
        let f = fixture("sellalways").await;
        // 000660 is held but NOT in the universe (universe is only 005930).
        let mut pos = entered("000660", 150_000.0, 5);
        pos.observe_price(146_000.0); // below stop at 147,000
        f.book.upsert(pos);
        f.broker.set_quote("000660", 146_000.0, 149_000.0);
        f.broker.set_bars("000660", rising_bars(40));

        let report = f.engine.run_cycle().await.unwrap();
        // The SELL fired despite 000660 not being in today's universe.
        assert_eq!(report.orders_placed, 1);
        assert!(f.book.get("000660").is_none());
    }

    #[tokio::test]
    async fn partial_buy_timeout_scenario() {
        if !session_open_now() {
            return;
        }
        let f = fixture("partial").await;
        f.broker.set_bars("005930", rising_bars(40));
        let last_close = 60_000.0 + 39.0 * 200.0 + 100.0;
        f.broker.set_quote("005930", last_close + 1_000.0, last_close);
        f.broker
            .set_fill_plan("005930", FillPlan::Partial { qty: 3, price: 70_000.0 });

        f.engine.run_cycle().await.unwrap();

        let pos = f.book.get("005930").unwrap();
        assert_eq!(pos.quantity, 3);
        assert_eq!(f.broker.cancelled_orders().len(), 1);
    }
}
