// =============================================================================
// CLI surface
// =============================================================================

use clap::{Parser, ValueEnum};

/// Process exit codes, kept stable for operators and wrappers.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG: i32 = 2;
    pub const LOCK_HELD: i32 = 3;
    pub const RECONCILE_CRITICAL: i32 = 4;
    pub const KILL_SWITCH: i32 = 5;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    /// Normal trading loop against the configured broker.
    Trade,
    /// Canned bounded run over the fake broker (closed-book test drive).
    Cbt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FeedKind {
    Rest,
    /// Accepted for compatibility; quotes are polled over REST either way.
    Ws,
}

/// Halla — trend/ATR trading engine for KRX equities.
#[derive(Debug, Parser)]
#[command(name = "halla-bot", version)]
pub struct Cli {
    /// Run mode.
    #[arg(long, value_enum, default_value = "trade")]
    pub mode: RunMode,

    /// Quote feed flavor.
    #[arg(long, value_enum, default_value = "rest")]
    pub feed: FeedKind,

    /// Override the base cycle interval in seconds (floor 15).
    #[arg(long)]
    pub interval: Option<u64>,

    /// Stop after this many cycles.
    #[arg(long)]
    pub max_runs: Option<u64>,

    /// Trade a single stock code instead of the configured universe.
    #[arg(long)]
    pub stock: Option<String>,

    /// Override the per-order quantity.
    #[arg(long)]
    pub order_quantity: Option<i64>,

    /// Required to run with mode REAL.
    #[arg(long)]
    pub confirm_real_trading: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["halla-bot"]);
        assert_eq!(cli.mode, RunMode::Trade);
        assert_eq!(cli.feed, FeedKind::Rest);
        assert!(cli.interval.is_none());
        assert!(!cli.confirm_real_trading);
    }

    #[test]
    fn full_invocation_parses() {
        let cli = Cli::parse_from([
            "halla-bot",
            "--mode",
            "cbt",
            "--feed",
            "ws",
            "--interval",
            "30",
            "--max-runs",
            "5",
            "--stock",
            "005930",
            "--order-quantity",
            "3",
            "--confirm-real-trading",
        ]);
        assert_eq!(cli.mode, RunMode::Cbt);
        assert_eq!(cli.feed, FeedKind::Ws);
        assert_eq!(cli.interval, Some(30));
        assert_eq!(cli.max_runs, Some(5));
        assert_eq!(cli.stock.as_deref(), Some("005930"));
        assert_eq!(cli.order_quantity, Some(3));
        assert!(cli.confirm_real_trading);
    }
}
