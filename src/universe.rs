// =============================================================================
// Universe service — daily candidate selection with cached reuse
// =============================================================================
//
// One UniverseRecord per trade date. Intraday restarts reuse the record
// verbatim; a method change between runs invalidates it immediately.
//
// Selection methods:
//   fixed      — configured list truncated to max_stocks
//   volume_top — rank the candidate pool by traded value, filter minimum
//                volume and exclude halted / |session change| ≥ 28% symbols
//   atr_filter — keep symbols whose ATR/close ratio is inside the band
//   combined   — volume_top(3 × max_stocks), then atr_filter, then truncate
//
// Fallback chain on selection failure: today's cache → fixed list → empty.
// In REAL mode with halt_on_fallback_in_real, any fallback halts trading.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::config::{is_stock_code, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::indicators::calculate_atr_pct;
use crate::store::file_cache::{FileCache, UniverseCacheFile};
use crate::store::{Store, UniverseRecordRow};
use crate::types::Mode;

/// Symbols with a session move at or beyond this are excluded: they are
/// either limit-locked or too disorderly to enter.
const MAX_SESSION_CHANGE_PCT: f64 = 28.0;
/// Minimum daily history required by the ATR filter.
const MIN_BARS_FOR_ATR: usize = 20;
/// Bars requested per symbol for the ATR filter.
const ATR_LOOKBACK_BARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    Fixed,
    VolumeTop,
    AtrFilter,
    Combined,
}

impl Default for SelectionMethod {
    fn default() -> Self {
        Self::Fixed
    }
}

impl SelectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::VolumeTop => "volume_top",
            Self::AtrFilter => "atr_filter",
            Self::Combined => "combined",
        }
    }
}

impl std::fmt::Display for SelectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Today's universe: the entry-candidate set, separate from holdings.
#[derive(Debug, Clone)]
pub struct TodaysUniverse {
    pub trade_date: String,
    pub method: SelectionMethod,
    pub symbols: Vec<String>,
    /// True when the selection came from the fallback chain rather than the
    /// configured method.
    pub from_fallback: bool,
}

pub struct UniverseService {
    broker: Arc<dyn Broker>,
    store: Arc<dyn Store>,
    file_cache: FileCache,
}

impl UniverseService {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn Store>, file_cache: FileCache) -> Self {
        Self {
            broker,
            store,
            file_cache,
        }
    }

    /// Return today's universe, selecting once per trade date and reusing the
    /// cached record for intraday restarts.
    pub async fn universe_for(
        &self,
        config: &EngineConfig,
        holdings: &[String],
        now: DateTime<Utc>,
    ) -> EngineResult<TodaysUniverse> {
        let trade_date = crate::market::hours::trade_date(now);
        let method = config.selection_method;

        // 1. Cached record for today, still under the same method, wins.
        if let Ok(Some(record)) = self.store.universe_record(&trade_date).await {
            if record.selection_method == method.as_str() {
                debug!(
                    trade_date = %trade_date,
                    count = record.symbols.len(),
                    "reusing cached universe record"
                );
                return Ok(TodaysUniverse {
                    trade_date,
                    method,
                    symbols: record.symbols,
                    from_fallback: false,
                });
            }
            info!(
                cached_method = %record.selection_method,
                new_method = %method,
                "selection method changed, invalidating cached universe"
            );
        }

        // 2. Fresh selection.
        match self.select(config, method).await {
            Ok(symbols) => {
                let symbols = self.validate(symbols, config)?;
                let record = UniverseRecordRow {
                    trade_date: trade_date.clone(),
                    selection_method: method.as_str().to_string(),
                    symbols: symbols.clone(),
                    holdings_at_creation: holdings.to_vec(),
                    created_at: now,
                };
                if let Err(e) = self.store.upsert_universe_record(&record).await {
                    warn!(error = %e, "failed to persist universe record");
                }
                if let Err(e) = self.file_cache.save_universe(&UniverseCacheFile {
                    trade_date: trade_date.clone(),
                    selection_method: method.as_str().to_string(),
                    stocks: symbols.clone(),
                }) {
                    warn!(error = %e, "failed to write universe file cache");
                }
                info!(
                    trade_date = %trade_date,
                    method = %method,
                    count = symbols.len(),
                    "universe selected"
                );
                Ok(TodaysUniverse {
                    trade_date,
                    method,
                    symbols,
                    from_fallback: false,
                })
            }
            Err(e) => {
                warn!(error = %e, method = %method, "universe selection failed, entering fallback chain");
                self.fallback(config, &trade_date)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Selection methods
    // -------------------------------------------------------------------------

    async fn select(
        &self,
        config: &EngineConfig,
        method: SelectionMethod,
    ) -> EngineResult<Vec<String>> {
        let max = config.max_stocks as usize;
        match method {
            SelectionMethod::Fixed => Ok(config
                .fixed_symbols
                .iter()
                .take(max)
                .cloned()
                .collect()),
            SelectionMethod::VolumeTop => self.volume_top(config, max).await,
            SelectionMethod::AtrFilter => {
                self.atr_filter(config, config.fixed_symbols.clone()).await
            }
            SelectionMethod::Combined => {
                let pool = self.volume_top(config, max * 3).await?;
                let filtered = self.atr_filter(config, pool).await?;
                Ok(filtered.into_iter().take(max).collect())
            }
        }
    }

    /// Rank the candidate pool by traded value, applying the liquidity and
    /// orderliness filters.
    async fn volume_top(&self, config: &EngineConfig, limit: usize) -> EngineResult<Vec<String>> {
        let mut ranked: Vec<(String, f64)> = Vec::new();

        for symbol in &config.fixed_symbols {
            let Some(quote) = self.broker.get_current_price(symbol).await? else {
                debug!(symbol, "no quote, excluded from volume ranking");
                continue;
            };
            if quote.halted {
                debug!(symbol, "halted or managed, excluded");
                continue;
            }
            if quote.change_pct.abs() >= MAX_SESSION_CHANGE_PCT {
                debug!(symbol, change_pct = quote.change_pct, "session change too large, excluded");
                continue;
            }
            if quote.volume < config.min_volume {
                debug!(symbol, volume = quote.volume, "below minimum volume, excluded");
                continue;
            }
            ranked.push((symbol.clone(), quote.price * quote.volume as f64));
        }

        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(ranked.into_iter().take(limit).map(|(s, _)| s).collect())
    }

    /// Keep symbols whose ATR/close ratio sits inside the configured band.
    async fn atr_filter(
        &self,
        config: &EngineConfig,
        candidates: Vec<String>,
    ) -> EngineResult<Vec<String>> {
        let mut kept = Vec::new();

        for symbol in candidates {
            let mut bars = self.broker.get_daily_ohlcv(&symbol, ATR_LOOKBACK_BARS).await?;
            if bars.len() < MIN_BARS_FOR_ATR {
                debug!(symbol = %symbol, bars = bars.len(), "too little history, dropped");
                continue;
            }
            bars.reverse(); // broker returns newest-first
            let last_close = bars.last().map(|c| c.close).unwrap_or(0.0);
            if last_close <= 0.0 {
                continue;
            }
            match calculate_atr_pct(&bars, 14) {
                Some(ratio) if ratio >= config.min_atr_pct && ratio <= config.max_atr_pct => {
                    debug!(symbol = %symbol, atr_pct = ratio, "passes ATR band");
                    kept.push(symbol);
                }
                Some(ratio) => {
                    debug!(symbol = %symbol, atr_pct = ratio, "outside ATR band, dropped");
                }
                None => {
                    debug!(symbol = %symbol, "ATR not computable, dropped");
                }
            }
        }

        Ok(kept)
    }

    // -------------------------------------------------------------------------
    // Validation and fallback
    // -------------------------------------------------------------------------

    /// Candidates must be 6-digit codes, deduplicated, and the final count
    /// must equal min(max_stocks, available) — anything else halts trading.
    fn validate(&self, symbols: Vec<String>, config: &EngineConfig) -> EngineResult<Vec<String>> {
        let mut seen = HashSet::new();
        let cleaned: Vec<String> = symbols
            .into_iter()
            .filter(|s| {
                if !is_stock_code(s) {
                    warn!(symbol = %s, "dropping malformed symbol from universe");
                    return false;
                }
                seen.insert(s.clone())
            })
            .collect();

        let expected = (config.max_stocks as usize).min(cleaned.len());
        let finalised: Vec<String> = cleaned.into_iter().take(expected).collect();
        if finalised.len() != expected {
            return Err(EngineError::Config(format!(
                "universe count {} does not match expected {}",
                finalised.len(),
                expected
            )));
        }
        Ok(finalised)
    }

    fn fallback(&self, config: &EngineConfig, trade_date: &str) -> EngineResult<TodaysUniverse> {
        if config.mode == Mode::Real && config.halt_on_fallback_in_real {
            return Err(EngineError::Config(
                "universe selection failed in REAL mode with halt_on_fallback_in_real".into(),
            ));
        }

        // Today's file cache first.
        if let Some(cached) = self.file_cache.load_universe() {
            if cached.trade_date == trade_date && !cached.stocks.is_empty() {
                warn!(count = cached.stocks.len(), "fallback: using today's cached universe");
                return Ok(TodaysUniverse {
                    trade_date: trade_date.to_string(),
                    method: config.selection_method,
                    symbols: cached.stocks,
                    from_fallback: true,
                });
            }
        }

        // Then the fixed list.
        let fixed: Vec<String> = config
            .fixed_symbols
            .iter()
            .take(config.max_stocks as usize)
            .cloned()
            .collect();
        if !fixed.is_empty() {
            warn!(count = fixed.len(), "fallback: using fixed symbol list");
            return Ok(TodaysUniverse {
                trade_date: trade_date.to_string(),
                method: SelectionMethod::Fixed,
                symbols: fixed,
                from_fallback: true,
            });
        }

        warn!("fallback: empty universe, no entries today");
        Ok(TodaysUniverse {
            trade_date: trade_date.to_string(),
            method: config.selection_method,
            symbols: Vec::new(),
            from_fallback: true,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBroker;
    use crate::market::{Candle, Quote};
    use crate::store::sqlite::SqliteStore;
    use chrono::NaiveDate;

    fn tmp_cache(tag: &str) -> FileCache {
        FileCache::new(std::env::temp_dir().join(format!(
            "halla-universe-test-{tag}-{}",
            std::process::id()
        )))
    }

    fn bars(n: usize, spread: f64) -> Vec<Candle> {
        // Newest-first like the broker returns them.
        (0..n)
            .rev()
            .map(|i| {
                let base = 70_000.0;
                Candle::new(
                    NaiveDate::from_ymd_opt(2025, 1, 1)
                        .unwrap()
                        .checked_add_days(chrono::Days::new(i as u64))
                        .unwrap(),
                    base,
                    base + spread,
                    base - spread,
                    base,
                    500_000,
                )
            })
            .collect()
    }

    async fn service(tag: &str) -> (Arc<FakeBroker>, Arc<SqliteStore>, UniverseService) {
        let broker = Arc::new(FakeBroker::new());
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let svc = UniverseService::new(broker.clone(), store.clone(), tmp_cache(tag));
        (broker, store, svc)
    }

    fn config(method: SelectionMethod) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.selection_method = method;
        cfg.max_stocks = 2;
        cfg
    }

    #[tokio::test]
    async fn fixed_selection_truncates() {
        let (_b, _s, svc) = service("fixed").await;
        let cfg = config(SelectionMethod::Fixed);
        let u = svc.universe_for(&cfg, &[], Utc::now()).await.unwrap();
        assert_eq!(u.symbols.len(), 2);
        assert!(!u.from_fallback);
    }

    #[tokio::test]
    async fn cached_record_is_reused_verbatim() {
        let (_b, store, svc) = service("cache").await;
        let cfg = config(SelectionMethod::Fixed);
        let now = Utc::now();
        let first = svc.universe_for(&cfg, &[], now).await.unwrap();

        // Mutate the stored record; the next call must return it verbatim.
        let mut record = store.universe_record(&first.trade_date).await.unwrap().unwrap();
        record.symbols = vec!["035420".to_string()];
        store.upsert_universe_record(&record).await.unwrap();

        let second = svc.universe_for(&cfg, &[], now).await.unwrap();
        assert_eq!(second.symbols, vec!["035420".to_string()]);
    }

    #[tokio::test]
    async fn method_change_invalidates_cache() {
        let (broker, _s, svc) = service("invalidate").await;
        let now = Utc::now();
        let cfg = config(SelectionMethod::Fixed);
        let first = svc.universe_for(&cfg, &[], now).await.unwrap();
        assert_eq!(first.symbols.len(), 2);

        // Switch to volume_top; quotes exist for one symbol only.
        broker.set_quote("005930", 71_000.0, 70_500.0);
        let cfg2 = config(SelectionMethod::VolumeTop);
        let second = svc.universe_for(&cfg2, &[], now).await.unwrap();
        assert_eq!(second.symbols, vec!["005930".to_string()]);
    }

    #[tokio::test]
    async fn volume_top_excludes_halted_and_runaway() {
        let (broker, _s, svc) = service("volume").await;
        broker.set_quote("005930", 71_000.0, 70_500.0);
        broker.set_quote_full(Quote {
            symbol: "000660".into(),
            price: 150_000.0,
            open: 149_000.0,
            change_pct: 29.5,
            volume: 2_000_000,
            halted: false,
        });
        broker.set_quote_full(Quote {
            symbol: "035420".into(),
            price: 200_000.0,
            open: 199_000.0,
            change_pct: 0.5,
            volume: 2_000_000,
            halted: true,
        });

        let cfg = config(SelectionMethod::VolumeTop);
        let u = svc.universe_for(&cfg, &[], Utc::now()).await.unwrap();
        assert_eq!(u.symbols, vec!["005930".to_string()]);
    }

    #[tokio::test]
    async fn atr_filter_keeps_band_members() {
        let (broker, _s, svc) = service("atr").await;
        // ~2.1% ATR: inside the default 1..8 band.
        broker.set_bars("005930", bars(40, 1_500.0));
        // ~0.07% ATR: below the band.
        broker.set_bars("000660", bars(40, 50.0));
        // Too little history.
        broker.set_bars("035420", bars(10, 1_500.0));

        let mut cfg = config(SelectionMethod::AtrFilter);
        cfg.max_stocks = 5;
        let u = svc.universe_for(&cfg, &[], Utc::now()).await.unwrap();
        assert_eq!(u.symbols, vec!["005930".to_string()]);
    }

    #[tokio::test]
    async fn real_mode_fallback_halts_when_configured() {
        let (broker, _s, svc) = service("halt").await;
        broker.set_outage(true); // every quote call fails → selection fails

        let mut cfg = config(SelectionMethod::VolumeTop);
        cfg.mode = Mode::Real;
        cfg.halt_on_fallback_in_real = true;

        let err = svc.universe_for(&cfg, &[], Utc::now()).await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn paper_mode_falls_back_to_fixed() {
        let (broker, _s, svc) = service("fallback").await;
        broker.set_outage(true);

        let mut cfg = config(SelectionMethod::VolumeTop);
        cfg.mode = Mode::Paper;

        let u = svc.universe_for(&cfg, &[], Utc::now()).await.unwrap();
        assert!(u.from_fallback);
        assert_eq!(u.symbols.len(), 2);
        assert_eq!(u.method, SelectionMethod::Fixed);
    }
}
