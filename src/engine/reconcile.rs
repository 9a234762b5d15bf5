// =============================================================================
// Position reconciler — broker account ⇄ file cache ⇄ store
// =============================================================================
//
// Runs at startup and whenever the network-outage flag clears. The broker is
// the account of record; the reconciler is the only writer allowed to
// overwrite file and store from broker truth. Per-symbol classification:
//
//   local absent,  broker absent  → clean
//   local absent,  broker present → UNTRACKED_HOLDING (ERROR): snapshot the
//                                   broker values as a recovered position
//   local present, broker absent  → broker is truth: clear the file entry,
//                                   mark the store row EXITED with reason
//                                   RECOVERED_MISSING (WARNING)
//   qty match                     → adopt broker avg price, recompute pnl;
//                                   ATR-at-entry is never recomputed
//   qty mismatch                  → CRITICAL_MISMATCH (ERROR): take broker
//                                   qty, keep original ATR/stop/take
//
// Individual store-upsert failures inside the pass are soft: logged as
// warnings, counted, never fatal, never ERROR-notified. Only the
// UNTRACKED_HOLDING and CRITICAL_MISMATCH verdicts page the operator.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::{EngineError, EngineResult};
use crate::market::Holding;
use crate::notify::{Event, Notifier};
use crate::position::{Position, PositionBook, PositionState};
use crate::store::file_cache::FileCache;
use crate::store::Store;
use crate::types::{ExitReason, Mode};

/// Outcome class for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileCase {
    UntrackedHolding {
        symbol: String,
        broker_qty: i64,
    },
    RecoveredMissing {
        symbol: String,
    },
    Adopted {
        symbol: String,
    },
    CriticalMismatch {
        symbol: String,
        local_qty: i64,
        broker_qty: i64,
    },
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub cases: Vec<ReconcileCase>,
    pub soft_failures: u32,
}

impl ReconcileReport {
    pub fn untracked(&self) -> usize {
        self.cases
            .iter()
            .filter(|c| matches!(c, ReconcileCase::UntrackedHolding { .. }))
            .count()
    }

    pub fn critical(&self) -> usize {
        self.cases
            .iter()
            .filter(|c| matches!(c, ReconcileCase::CriticalMismatch { .. }))
            .count()
    }

    /// Whether this pass produced an operator-level verdict.
    pub fn has_alerts(&self) -> bool {
        self.untracked() > 0 || self.critical() > 0
    }

    /// A clean pass repairs nothing.
    pub fn is_noop(&self) -> bool {
        self.cases.is_empty() && self.soft_failures == 0
    }
}

pub struct Reconciler {
    broker: Arc<dyn Broker>,
    store: Arc<dyn Store>,
    book: Arc<PositionBook>,
    file_cache: FileCache,
    notifier: Arc<dyn Notifier>,
    mode: Mode,
}

impl Reconciler {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn Store>,
        book: Arc<PositionBook>,
        file_cache: FileCache,
        notifier: Arc<dyn Notifier>,
        mode: Mode,
    ) -> Self {
        Self {
            broker,
            store,
            book,
            file_cache,
            notifier,
            mode,
        }
    }

    /// Run one reconciliation pass. A broker failure aborts (startup is
    /// allowed to fail); store failures inside the pass are soft.
    pub async fn run(&self) -> EngineResult<ReconcileReport> {
        info!(mode = %self.mode, "reconciliation pass started");

        // 1. Broker holdings are authoritative.
        let balance = self.broker.get_account_balance().await?;
        let broker_by_symbol: HashMap<String, Holding> = balance
            .holdings
            .iter()
            .cloned()
            .map(|h| (h.symbol.clone(), h))
            .collect();

        // 2. + 3. Local view: file cache first, store rows fill the gaps.
        let file_positions = self.file_cache.load_positions(self.mode);
        let store_positions = self
            .store
            .open_positions(self.mode)
            .await
            .map_err(|e| EngineError::StorePersistence(e.to_string()))?;

        let mut local_by_symbol: HashMap<String, Position> = HashMap::new();
        for p in store_positions {
            local_by_symbol.insert(p.symbol.clone(), p);
        }
        for p in file_positions {
            // The file entry wins when both exist; it is the most recent
            // mirror written by the loop.
            local_by_symbol.insert(p.symbol.clone(), p);
        }

        let symbols: BTreeSet<String> = local_by_symbol
            .keys()
            .chain(broker_by_symbol.keys())
            .cloned()
            .collect();

        let mut report = ReconcileReport::default();
        let mut repaired: Vec<Position> = Vec::new();

        // 4. Classify per symbol.
        for symbol in symbols {
            let local = local_by_symbol.get(&symbol);
            let broker = broker_by_symbol.get(&symbol);

            match (local, broker) {
                (None, None) => unreachable!("symbol came from one of the maps"),

                (None, Some(holding)) => {
                    warn!(
                        symbol = %symbol,
                        broker_qty = holding.qty,
                        "untracked holding: broker position with no local record"
                    );
                    let recovered = self.recovered_position(holding);
                    self.soft_upsert(&recovered, &mut report).await;
                    repaired.push(recovered);
                    report.cases.push(ReconcileCase::UntrackedHolding {
                        symbol: symbol.clone(),
                        broker_qty: holding.qty,
                    });
                    self.notify_verdict(
                        "UNTRACKED_HOLDING",
                        &symbol,
                        json!({ "broker_qty": holding.qty }),
                    )
                    .await;
                }

                (Some(local), None) => {
                    warn!(
                        symbol = %symbol,
                        local_qty = local.quantity,
                        "local position missing at broker, closing as recovered"
                    );
                    let mut closed = local.clone();
                    closed.exit(closed.current_price, ExitReason::RecoveredMissing);
                    self.soft_upsert(&closed, &mut report).await;
                    report
                        .cases
                        .push(ReconcileCase::RecoveredMissing { symbol });
                }

                (Some(local), Some(holding)) if local.quantity == holding.qty => {
                    let mut adopted = local.clone();
                    adopted.entry_price = holding.avg_price;
                    adopted.observe_price(holding.current_price);
                    // ATR-at-entry, stop, and take stay untouched.
                    debug!(
                        symbol = %symbol,
                        avg_price = holding.avg_price,
                        "quantities agree, adopted broker average price"
                    );
                    self.soft_upsert(&adopted, &mut report).await;
                    repaired.push(adopted);
                    report.cases.push(ReconcileCase::Adopted { symbol });
                }

                (Some(local), Some(holding)) => {
                    warn!(
                        symbol = %symbol,
                        local_qty = local.quantity,
                        broker_qty = holding.qty,
                        "CRITICAL_MISMATCH: quantity drift, taking broker quantity"
                    );
                    let mut fixed = local.clone();
                    fixed.quantity = holding.qty;
                    fixed.entry_price = holding.avg_price;
                    fixed.observe_price(holding.current_price);
                    self.soft_upsert(&fixed, &mut report).await;
                    repaired.push(fixed);
                    report.cases.push(ReconcileCase::CriticalMismatch {
                        symbol: symbol.clone(),
                        local_qty: local.quantity,
                        broker_qty: holding.qty,
                    });
                    self.notify_verdict(
                        "CRITICAL_MISMATCH",
                        &symbol,
                        json!({
                            "local_qty": local.quantity,
                            "broker_qty": holding.qty,
                        }),
                    )
                    .await;
                }
            }
        }

        // 5. The repaired view becomes the in-memory book and the file cache.
        self.book.replace_all(repaired.clone());
        if let Err(e) = self.file_cache.save_positions(self.mode, &repaired) {
            warn!(error = %e, "failed to rewrite positions file cache");
            report.soft_failures += 1;
        }

        info!(
            adopted = report.cases.iter().filter(|c| matches!(c, ReconcileCase::Adopted { .. })).count(),
            untracked = report.untracked(),
            critical = report.critical(),
            recovered_missing = report.cases.iter().filter(|c| matches!(c, ReconcileCase::RecoveredMissing { .. })).count(),
            soft_failures = report.soft_failures,
            "reconciliation pass completed"
        );
        Ok(report)
    }

    /// Snapshot broker values into a recovered position. Bracket levels are
    /// unknown and stay zeroed; the strategy treats zero levels as unarmed.
    fn recovered_position(&self, holding: &Holding) -> Position {
        let mut p = Position::pending(&holding.symbol, self.mode, holding.qty);
        p.entry_price = holding.avg_price;
        p.quantity = holding.qty;
        p.entered_at = Utc::now();
        p.highest_price = holding.avg_price.max(holding.current_price);
        p.current_price = holding.current_price;
        p.state = PositionState::Entered;
        p.unrealized_pnl = (holding.current_price - holding.avg_price) * holding.qty as f64;
        p
    }

    /// Store writes inside the pass must not crash startup.
    async fn soft_upsert(&self, position: &Position, report: &mut ReconcileReport) {
        if let Err(e) = self.store.upsert_position(position).await {
            warn!(
                symbol = %position.symbol,
                error = %e,
                "soft failure: store upsert during reconciliation"
            );
            report.soft_failures += 1;
        }
    }

    async fn notify_verdict(&self, verdict: &str, symbol: &str, detail: serde_json::Value) {
        let mut payload = json!({
            "symbol": symbol,
            "mode": self.mode.as_str(),
            "verdict": verdict,
        });
        if let (Some(obj), Some(extra)) = (payload.as_object_mut(), detail.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        self.notifier
            .notify(Event::error("reconciliation_verdict", payload))
            .await;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBroker;
    use crate::notify::RecordingNotifier;
    use crate::store::sqlite::SqliteStore;

    struct Fixture {
        broker: Arc<FakeBroker>,
        store: Arc<SqliteStore>,
        book: Arc<PositionBook>,
        notifier: Arc<RecordingNotifier>,
        file_cache: FileCache,
        reconciler: Reconciler,
    }

    async fn fixture(tag: &str) -> Fixture {
        let dir = std::env::temp_dir().join(format!(
            "halla-reconcile-test-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let broker = Arc::new(FakeBroker::new());
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let book = Arc::new(PositionBook::new(Mode::Paper));
        let notifier = Arc::new(RecordingNotifier::new());
        let file_cache = FileCache::new(&dir);
        let reconciler = Reconciler::new(
            broker.clone(),
            store.clone(),
            book.clone(),
            file_cache.clone(),
            notifier.clone(),
            Mode::Paper,
        );
        Fixture {
            broker,
            store,
            book,
            notifier,
            file_cache,
            reconciler,
        }
    }

    fn holding(symbol: &str, qty: i64, avg: f64, current: f64) -> Holding {
        Holding {
            symbol: symbol.into(),
            name: symbol.into(),
            qty,
            avg_price: avg,
            current_price: current,
        }
    }

    fn entered(symbol: &str, qty: i64) -> Position {
        let mut p = Position::pending(symbol, Mode::Paper, qty);
        p.enter(71_000.0, qty, 1_500.0, 68_000.0, 77_000.0);
        p
    }

    #[tokio::test]
    async fn empty_everywhere_is_clean() {
        let f = fixture("empty").await;
        let report = f.reconciler.run().await.unwrap();
        assert!(report.is_noop());
        assert!(f.notifier.errors().is_empty());
    }

    #[tokio::test]
    async fn untracked_holding_is_recovered_and_alerted() {
        let f = fixture("untracked").await;
        f.broker
            .set_holdings(vec![holding("005930", 10, 70_000.0, 71_000.0)]);

        let report = f.reconciler.run().await.unwrap();
        assert_eq!(report.untracked(), 1);

        // Recovered into book, store, and file.
        let pos = f.book.get("005930").unwrap();
        assert_eq!(pos.state, PositionState::Entered);
        assert_eq!(pos.quantity, 10);
        assert!((pos.entry_price - 70_000.0).abs() < f64::EPSILON);
        assert!(f.store.position("005930", Mode::Paper).await.unwrap().is_some());
        assert_eq!(f.file_cache.load_positions(Mode::Paper).len(), 1);

        let errors = f.notifier.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload["verdict"], "UNTRACKED_HOLDING");
    }

    #[tokio::test]
    async fn missing_at_broker_closes_local_with_recovered_reason() {
        let f = fixture("missing").await;
        let pos = entered("005930", 10);
        f.store.upsert_position(&pos).await.unwrap();
        f.file_cache.save_positions(Mode::Paper, &[pos]).unwrap();

        let report = f.reconciler.run().await.unwrap();
        assert!(report
            .cases
            .iter()
            .any(|c| matches!(c, ReconcileCase::RecoveredMissing { .. })));

        // Store row is EXITED history; book and file are empty.
        assert!(f.store.position("005930", Mode::Paper).await.unwrap().is_none());
        assert!(f.book.get("005930").is_none());
        assert!(f.file_cache.load_positions(Mode::Paper).is_empty());
        // WARNING path only — no ERROR notifications.
        assert!(f.notifier.errors().is_empty());
    }

    #[tokio::test]
    async fn qty_match_adopts_avg_price_and_keeps_atr() {
        let f = fixture("adopt").await;
        let pos = entered("005930", 10);
        f.store.upsert_position(&pos).await.unwrap();
        f.broker
            .set_holdings(vec![holding("005930", 10, 70_500.0, 72_000.0)]);

        let report = f.reconciler.run().await.unwrap();
        assert!(report
            .cases
            .iter()
            .any(|c| matches!(c, ReconcileCase::Adopted { .. })));

        let adopted = f.book.get("005930").unwrap();
        assert!((adopted.entry_price - 70_500.0).abs() < f64::EPSILON);
        assert!((adopted.atr_at_entry - 1_500.0).abs() < f64::EPSILON);
        assert!((adopted.stop_loss - 68_000.0).abs() < f64::EPSILON);
        assert!((adopted.unrealized_pnl - 15_000.0).abs() < f64::EPSILON);
        assert!(f.notifier.errors().is_empty());
    }

    #[tokio::test]
    async fn qty_mismatch_takes_broker_qty_keeps_brackets() {
        let f = fixture("mismatch").await;
        // Spec scenario 5: file says 10, broker says 7.
        let pos = entered("005930", 10);
        f.file_cache.save_positions(Mode::Paper, &[pos]).unwrap();
        f.broker
            .set_holdings(vec![holding("005930", 7, 70_500.0, 71_000.0)]);

        let report = f.reconciler.run().await.unwrap();
        assert_eq!(report.critical(), 1);

        let fixed = f.book.get("005930").unwrap();
        assert_eq!(fixed.quantity, 7);
        assert!((fixed.atr_at_entry - 1_500.0).abs() < f64::EPSILON);
        assert!((fixed.stop_loss - 68_000.0).abs() < f64::EPSILON);
        assert!((fixed.take_profit - 77_000.0).abs() < f64::EPSILON);

        let errors = f.notifier.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload["verdict"], "CRITICAL_MISMATCH");
        assert_eq!(errors[0].payload["broker_qty"], 7);
    }

    #[tokio::test]
    async fn rerun_when_agreeing_is_noop() {
        let f = fixture("rerun").await;
        let pos = entered("005930", 10);
        f.store.upsert_position(&pos).await.unwrap();
        f.broker
            .set_holdings(vec![holding("005930", 10, 71_000.0, 71_000.0)]);

        let first = f.reconciler.run().await.unwrap();
        assert_eq!(first.critical(), 0);

        let second = f.reconciler.run().await.unwrap();
        // Second pass classifies the same single adoption; nothing changes
        // and no alerts fire.
        assert_eq!(second.untracked(), 0);
        assert_eq!(second.critical(), 0);
        assert!(f.notifier.errors().is_empty());

        let book_pos = f.book.get("005930").unwrap();
        assert_eq!(book_pos.quantity, 10);
    }

    #[tokio::test]
    async fn broker_failure_aborts_pass() {
        let f = fixture("outage").await;
        f.broker.set_outage(true);
        assert!(f.reconciler.run().await.is_err());
    }
}
