// =============================================================================
// Engine Configuration — serde-defaulted settings with atomic save
// =============================================================================
//
// Every tunable parameter lives here. Persistence uses an atomic tmp + rename
// pattern to prevent corruption on crash. All fields carry `#[serde(default)]`
// so that adding new fields never breaks loading an older config file.
//
// The runtime mode must agree with the `.env`-declared HALLA_MODE; a mismatch
// is a startup-fatal configuration error (exit code 2).
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;
use crate::types::Mode;
use crate::universe::SelectionMethod;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_interval_seconds() -> u64 {
    60
}

fn default_near_stop_interval_seconds() -> u64 {
    15
}

fn default_order_execution_timeout() -> u64 {
    45
}

fn default_gap_threshold_pct() -> f64 {
    5.0
}

fn default_gap_epsilon_pct() -> f64 {
    0.1
}

fn default_daily_max_loss_pct() -> f64 {
    3.0
}

fn default_cumulative_dd_pct() -> f64 {
    15.0
}

fn default_per_trade_loss_pct() -> f64 {
    5.0
}

fn default_max_consecutive_losses() -> u32 {
    3
}

fn default_daily_max_trades() -> u32 {
    10
}

fn default_max_positions() -> u32 {
    5
}

fn default_max_stocks() -> u32 {
    10
}

fn default_order_quantity() -> i64 {
    1
}

fn default_fixed_symbols() -> Vec<String> {
    vec![
        "005930".to_string(), // Samsung Electronics
        "000660".to_string(), // SK hynix
        "035420".to_string(), // NAVER
    ]
}

fn default_min_atr_pct() -> f64 {
    1.0
}

fn default_max_atr_pct() -> f64 {
    8.0
}

fn default_min_volume() -> i64 {
    100_000
}

fn default_pending_exit_backoff_secs() -> u64 {
    300
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_db_url() -> String {
    "sqlite://data/halla.db".to_string()
}

fn default_commission_rate() -> f64 {
    0.00015
}

// =============================================================================
// StrategyParams
// =============================================================================

/// Tunable parameters for the trend/ATR strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Look-back for the trend reference SMA.
    #[serde(default = "StrategyParams::default_trend_period")]
    pub trend_period: usize,

    /// Look-back for the ATR calculation.
    #[serde(default = "StrategyParams::default_atr_period")]
    pub atr_period: usize,

    /// ATR multiplier for the stop-loss distance below entry.
    #[serde(default = "StrategyParams::default_stop_atr_multiplier")]
    pub stop_atr_multiplier: f64,

    /// ATR multiplier for the take-profit distance above entry.
    #[serde(default = "StrategyParams::default_take_atr_multiplier")]
    pub take_atr_multiplier: f64,

    /// ATR multiplier for the trailing-stop distance below the highest price.
    #[serde(default = "StrategyParams::default_trail_atr_multiplier")]
    pub trail_atr_multiplier: f64,

    /// Fraction of entry ATR that defines the near-stop band. A position whose
    /// distance-to-stop falls inside the band switches the loop to the fast
    /// cadence.
    #[serde(default = "StrategyParams::default_near_stop_band")]
    pub near_stop_band: f64,
}

impl StrategyParams {
    fn default_trend_period() -> usize {
        20
    }
    fn default_atr_period() -> usize {
        14
    }
    fn default_stop_atr_multiplier() -> f64 {
        2.0
    }
    fn default_take_atr_multiplier() -> f64 {
        4.0
    }
    fn default_trail_atr_multiplier() -> f64 {
        2.5
    }
    fn default_near_stop_band() -> f64 {
        0.30
    }
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            trend_period: Self::default_trend_period(),
            atr_period: Self::default_atr_period(),
            stop_atr_multiplier: Self::default_stop_atr_multiplier(),
            take_atr_multiplier: Self::default_take_atr_multiplier(),
            trail_atr_multiplier: Self::default_trail_atr_multiplier(),
            near_stop_band: Self::default_near_stop_band(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Halla engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Mode ----------------------------------------------------------------
    /// Execution mode. Must match the `.env`-declared HALLA_MODE.
    #[serde(default)]
    pub mode: Mode,

    // --- Cadence -------------------------------------------------------------
    /// Base cycle period in seconds (floor 15).
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,

    /// Fast cadence used while any open position is inside the near-stop band.
    #[serde(default = "default_near_stop_interval_seconds")]
    pub near_stop_interval_seconds: u64,

    /// Budget for wait_for_execution, in seconds.
    #[serde(default = "default_order_execution_timeout")]
    pub order_execution_timeout: u64,

    // --- Gap protection ------------------------------------------------------
    #[serde(default = "default_gap_threshold_pct")]
    pub gap_threshold_pct: f64,

    #[serde(default = "default_gap_epsilon_pct")]
    pub gap_epsilon_pct: f64,

    // --- Risk limits ---------------------------------------------------------
    /// Daily realized-loss cap as a percentage of starting equity.
    #[serde(default = "default_daily_max_loss_pct")]
    pub daily_max_loss_pct: f64,

    /// Cumulative drawdown cap; breaching it engages the kill-switch file.
    #[serde(default = "default_cumulative_dd_pct")]
    pub cumulative_dd_pct: f64,

    /// Per-trade loss cap as a percentage of entry; blocks re-entries when
    /// the last closed trade breached it.
    #[serde(default = "default_per_trade_loss_pct")]
    pub per_trade_loss_pct: f64,

    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,

    #[serde(default = "default_daily_max_trades")]
    pub daily_max_trades: u32,

    /// Maximum concurrent ENTERED positions.
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    // --- Universe ------------------------------------------------------------
    #[serde(default)]
    pub selection_method: SelectionMethod,

    /// Final universe size cap. Older configs call this `universe_size`.
    #[serde(default = "default_max_stocks", alias = "universe_size")]
    pub max_stocks: u32,

    /// Configured list for `fixed` selection and the fallback chain.
    #[serde(default = "default_fixed_symbols")]
    pub fixed_symbols: Vec<String>,

    #[serde(default = "default_min_atr_pct")]
    pub min_atr_pct: f64,

    #[serde(default = "default_max_atr_pct")]
    pub max_atr_pct: f64,

    /// Minimum daily volume for `volume_top` candidates.
    #[serde(default = "default_min_volume")]
    pub min_volume: i64,

    /// Whether a universe fallback in REAL mode halts trading.
    #[serde(default = "default_true")]
    pub halt_on_fallback_in_real: bool,

    // --- Orders --------------------------------------------------------------
    /// Default order quantity when the CLI does not override it.
    #[serde(default = "default_order_quantity")]
    pub order_quantity: i64,

    /// Backoff before a deferred SELL is retried, in seconds.
    #[serde(default = "default_pending_exit_backoff_secs")]
    pub pending_exit_backoff_secs: u64,

    /// Commission rate applied to realized pnl.
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,

    // --- Process -------------------------------------------------------------
    #[serde(default = "default_true")]
    pub enforce_single_instance: bool,

    /// Directory for the file cache, lock file, and kill-switch.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// SQLite connection URL.
    #[serde(default = "default_db_url")]
    pub db_url: String,

    #[serde(default)]
    pub strategy_params: StrategyParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            mode = %config.mode,
            interval = config.interval_seconds,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Enforce the floor on the cycle interval and normalise derived fields.
    pub fn normalise(&mut self) {
        if self.interval_seconds < 15 {
            self.interval_seconds = 15;
        }
        if self.near_stop_interval_seconds < 15 {
            self.near_stop_interval_seconds = 15;
        }
        self.fixed_symbols.retain(|s| is_stock_code(s));
        self.fixed_symbols.dedup();
    }

    /// Verify that the runtime mode agrees with the `.env`-declared mode.
    ///
    /// A missing HALLA_MODE only passes for DRY_RUN; PAPER and REAL must be
    /// declared explicitly so a stray config file cannot reach an account.
    pub fn check_mode_agreement(&self) -> Result<(), EngineError> {
        let declared = std::env::var("HALLA_MODE").ok();
        match (declared.as_deref().and_then(Mode::parse), self.mode) {
            (Some(env_mode), mode) if env_mode == mode => Ok(()),
            (None, Mode::DryRun) => Ok(()),
            (env_mode, mode) => Err(EngineError::Config(format!(
                "runtime mode {} disagrees with HALLA_MODE {:?}",
                mode, env_mode
            ))),
        }
    }
}

/// A valid KRX stock code is exactly six ASCII digits.
pub fn is_stock_code(s: &str) -> bool {
    s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.mode, Mode::DryRun);
        assert_eq!(cfg.interval_seconds, 60);
        assert_eq!(cfg.near_stop_interval_seconds, 15);
        assert_eq!(cfg.order_execution_timeout, 45);
        assert_eq!(cfg.max_positions, 5);
        assert!(cfg.halt_on_fallback_in_real);
        assert!(cfg.enforce_single_instance);
        assert!((cfg.gap_threshold_pct - 5.0).abs() < f64::EPSILON);
        assert!((cfg.gap_epsilon_pct - 0.1).abs() < f64::EPSILON);
        assert_eq!(cfg.strategy_params.trend_period, 20);
        assert_eq!(cfg.strategy_params.atr_period, 14);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.mode, Mode::DryRun);
        assert_eq!(cfg.daily_max_trades, 10);
        assert_eq!(cfg.fixed_symbols.len(), 3);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "mode": "Paper", "interval_seconds": 30 }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.mode, Mode::Paper);
        assert_eq!(cfg.interval_seconds, 30);
        assert_eq!(cfg.max_positions, 5);
    }

    #[test]
    fn normalise_enforces_interval_floor() {
        let mut cfg = EngineConfig::default();
        cfg.interval_seconds = 5;
        cfg.near_stop_interval_seconds = 1;
        cfg.normalise();
        assert_eq!(cfg.interval_seconds, 15);
        assert_eq!(cfg.near_stop_interval_seconds, 15);
    }

    #[test]
    fn normalise_drops_malformed_symbols() {
        let mut cfg = EngineConfig::default();
        cfg.fixed_symbols = vec![
            "005930".to_string(),
            "ABC123".to_string(),
            "12345".to_string(),
        ];
        cfg.normalise();
        assert_eq!(cfg.fixed_symbols, vec!["005930".to_string()]);
    }

    #[test]
    fn stock_code_validation() {
        assert!(is_stock_code("005930"));
        assert!(!is_stock_code("5930"));
        assert!(!is_stock_code("00593A"));
        assert!(!is_stock_code("0059301"));
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.mode, cfg2.mode);
        assert_eq!(cfg.fixed_symbols, cfg2.fixed_symbols);
        assert_eq!(cfg.max_stocks, cfg2.max_stocks);
    }
}
