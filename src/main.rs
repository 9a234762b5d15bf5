// =============================================================================
// Halla Trend Engine — Main Entry Point
// =============================================================================
//
// Startup order: env → logging → CLI → config (+ mode agreement) → kill-switch
// check → instance lock → broker/store wiring → reconciliation → loop.
// Trading never begins on unreconciled state.
// =============================================================================

mod broker;
mod cli;
mod config;
mod engine;
mod error;
mod indicators;
mod lock;
mod market;
mod notify;
mod position;
mod risk;
mod store;
mod strategy;
mod types;
mod universe;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::fake::FakeBroker;
use crate::broker::kis::{KisBroker, KisCredentials};
use crate::broker::Broker;
use crate::cli::{exit_code, Cli, FeedKind, RunMode};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::lock::InstanceLock;
use crate::notify::{LogNotifier, Notifier};
use crate::position::PositionBook;
use crate::risk::{RiskController, RiskLimits};
use crate::store::sqlite::SqliteStore;
use crate::strategy::TrendAtrStrategy;
use crate::types::Mode;

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // ── 2. Configuration ─────────────────────────────────────────────────
    let mut config = EngineConfig::load("config/engine.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    if let Some(interval) = cli.interval {
        config.interval_seconds = interval;
    }
    if let Some(stock) = &cli.stock {
        config.fixed_symbols = vec![stock.clone()];
        config.max_stocks = 1;
    }
    if cli.feed == FeedKind::Ws {
        warn!("websocket feed not supported, falling back to REST polling");
    }
    config.normalise();

    if let Err(e) = config.check_mode_agreement() {
        error!(error = %e, "mode disagreement between config and environment");
        return exit_code::CONFIG;
    }
    if config.mode == Mode::Real && !cli.confirm_real_trading {
        error!("REAL mode requires --confirm-real-trading");
        return exit_code::CONFIG;
    }

    info!(
        mode = %config.mode,
        interval = config.interval_seconds,
        symbols = ?config.fixed_symbols,
        "Halla engine starting"
    );

    // ── 3. Kill-switch gate ──────────────────────────────────────────────
    let kill_switch_path = Path::new(&config.data_dir).join("KILL_SWITCH");
    if kill_switch_path.exists() {
        error!(
            path = %kill_switch_path.display(),
            "kill-switch file present, refusing to start"
        );
        return exit_code::KILL_SWITCH;
    }

    // ── 4. Single-instance lock ──────────────────────────────────────────
    let lock = if config.enforce_single_instance {
        match InstanceLock::acquire(Path::new(&config.data_dir).join("instance.lock")) {
            Ok(lock) => Some(lock),
            Err(EngineError::LockHeld { path, pid }) => {
                error!(path = %path, holder_pid = pid, "another instance is running");
                return exit_code::LOCK_HELD;
            }
            Err(e) => {
                error!(error = %e, "failed to acquire instance lock");
                return exit_code::CONFIG;
            }
        }
    } else {
        None
    };

    // ── 5. Broker ────────────────────────────────────────────────────────
    let use_fake = cli.mode == RunMode::Cbt || config.mode == Mode::DryRun;
    let broker: Arc<dyn Broker> = if use_fake {
        info!("using in-memory fake broker (no live orders)");
        Arc::new(FakeBroker::new())
    } else {
        let creds = match KisCredentials::from_env() {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "missing broker credentials");
                return exit_code::CONFIG;
            }
        };
        Arc::new(KisBroker::new(creds, config.mode))
    };

    // ── 6. Store & shared state ──────────────────────────────────────────
    let store: Arc<SqliteStore> = match SqliteStore::connect(&config.db_url).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to open database");
            return exit_code::CONFIG;
        }
    };
    let book = Arc::new(PositionBook::new(config.mode));
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    let initial_equity = match broker.get_account_balance().await {
        Ok(balance) => balance.total_equity,
        Err(e) => {
            warn!(error = %e, "could not read starting equity, drawdown breaker disabled");
            0.0
        }
    };
    let risk = Arc::new(RiskController::new(
        RiskLimits {
            daily_max_loss_pct: config.daily_max_loss_pct,
            per_trade_loss_pct: config.per_trade_loss_pct,
            cumulative_dd_pct: config.cumulative_dd_pct,
            max_consecutive_losses: config.max_consecutive_losses,
            daily_max_trades: config.daily_max_trades,
        },
        config.mode,
        &kill_switch_path,
        initial_equity,
        chrono::Utc::now(),
    ));

    let strategy = Arc::new(TrendAtrStrategy::new(config.strategy_params.clone()));
    let order_quantity = cli.order_quantity.unwrap_or(config.order_quantity);

    let engine = Engine::new(
        config,
        broker,
        store.clone(),
        strategy,
        notifier,
        book,
        risk,
        order_quantity,
    );

    // ── 7. Startup: cleanup, reconcile, resume ───────────────────────────
    if let Err(e) = engine.startup().await {
        error!(error = %e, "startup reconciliation failed");
        if let Some(lock) = lock {
            lock.release();
        }
        return exit_code::RECONCILE_CRITICAL;
    }

    // ── 8. Loop until shutdown or max runs ───────────────────────────────
    let max_runs = match cli.mode {
        RunMode::Cbt => Some(cli.max_runs.unwrap_or(1)),
        RunMode::Trade => cli.max_runs,
    };
    if let Err(e) = engine.run(max_runs).await {
        error!(error = %e, "trading loop ended with error");
    }

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    engine.shutdown().await;
    if let Some(lock) = lock {
        lock.release();
    }

    info!("Halla engine shut down complete");
    exit_code::OK
}
