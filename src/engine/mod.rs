// =============================================================================
// Engine assembly — wiring, startup sequence, shutdown
// =============================================================================
//
// Startup order matters:
//   1. stale order_state cleanup (abandoned PENDING rows)
//   2. reconciliation (broker is truth; failure here aborts startup)
//   3. resume of in-flight orders left by a crash
//   4. daily risk counter restore from the daily summary
//
// Only after all four does the execution loop start. Shutdown completes the
// in-flight cycle at a decision boundary, persists a final snapshot, and
// releases the instance lock (in main).
// =============================================================================

pub mod cycle;
pub mod guard;
pub mod reconcile;
pub mod sync;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::notify::Notifier;
use crate::position::PositionBook;
use crate::risk::RiskController;
use crate::store::file_cache::FileCache;
use crate::store::Store;
use crate::strategy::Strategy;
use crate::universe::UniverseService;

use reconcile::Reconciler;
use sync::OrderSynchronizer;

struct RunState {
    last_snapshot_at: Option<DateTime<Utc>>,
    /// Set while an outage is observed; forces a reconcile on recovery.
    outage_pending_reconcile: bool,
}

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) strategy: Arc<dyn Strategy>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) book: Arc<PositionBook>,
    pub(crate) risk: Arc<RiskController>,
    pub(crate) sync: Arc<OrderSynchronizer>,
    pub(crate) reconciler: Reconciler,
    pub(crate) universe: UniverseService,
    pub(crate) file_cache: FileCache,
    pub(crate) order_quantity: i64,
    state: RwLock<RunState>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn Store>,
        strategy: Arc<dyn Strategy>,
        notifier: Arc<dyn Notifier>,
        book: Arc<PositionBook>,
        risk: Arc<RiskController>,
        order_quantity: i64,
    ) -> Self {
        let file_cache = FileCache::new(&config.data_dir);
        let sync = Arc::new(OrderSynchronizer::new(
            broker.clone(),
            store.clone(),
            book.clone(),
            notifier.clone(),
            config.mode,
            config.order_execution_timeout,
            config.commission_rate,
            config.pending_exit_backoff_secs,
        ));
        let reconciler = Reconciler::new(
            broker.clone(),
            store.clone(),
            book.clone(),
            file_cache.clone(),
            notifier.clone(),
            config.mode,
        );
        let universe = UniverseService::new(broker.clone(), store.clone(), file_cache.clone());

        Self {
            config,
            broker,
            store,
            strategy,
            notifier,
            book,
            risk,
            sync,
            reconciler,
            universe,
            file_cache,
            order_quantity,
            state: RwLock::new(RunState {
                last_snapshot_at: None,
                outage_pending_reconcile: false,
            }),
        }
    }

    /// Startup sequence. A failure here is fatal — trading must not begin on
    /// unreconciled state.
    pub async fn startup(&self) -> EngineResult<()> {
        let cancelled = self.sync.cleanup_stale().await?;
        if cancelled > 0 {
            info!(cancelled, "stale order states cancelled at startup");
        }

        let report = self.reconciler.run().await?;
        if report.has_alerts() {
            warn!(
                untracked = report.untracked(),
                critical = report.critical(),
                "startup reconciliation produced operator alerts"
            );
        }

        let resumed = self.sync.resume_incomplete().await?;
        if resumed > 0 {
            info!(resumed, "in-flight orders resumed from previous run");
        }

        let today = crate::market::hours::trade_date(Utc::now());
        match self.store.daily_summary(&today, self.config.mode).await {
            Ok(summary) => self.risk.restore_daily(summary.as_ref(), Utc::now()),
            Err(e) => warn!(error = %e, "failed to load daily summary for risk restore"),
        }

        info!(mode = %self.config.mode, "engine startup complete");
        Ok(())
    }

    /// Final persistence before exit: one last snapshot and the position
    /// mirror. Best-effort — shutdown must not hang on a dead broker.
    pub async fn shutdown(&self) {
        if let Err(e) = self.persist_snapshot(true).await {
            warn!(error = %e, "failed to persist final snapshot");
        }
        self.mirror_book_to_file();
        info!("engine shutdown persistence complete");
    }

    pub(crate) fn outage_pending(&self) -> bool {
        self.state.read().outage_pending_reconcile
    }

    pub(crate) fn set_outage_pending(&self, pending: bool) {
        self.state.write().outage_pending_reconcile = pending;
    }

    /// True when at least a minute has passed since the last account
    /// snapshot (or one was never taken).
    pub(crate) fn snapshot_due(&self, now: DateTime<Utc>) -> bool {
        match self.state.read().last_snapshot_at {
            None => true,
            Some(at) => (now - at).num_seconds() >= 60,
        }
    }

    pub(crate) fn mark_snapshot(&self, now: DateTime<Utc>) {
        self.state.write().last_snapshot_at = Some(now);
    }
}
