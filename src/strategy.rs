// =============================================================================
// Strategy — trend reference plus ATR-derived entry/exit levels
// =============================================================================
//
// The strategy is a pure function of its inputs: no I/O, no state beyond
// what the caller passes in. The engine owns everything else (risk, orders,
// persistence).
//
// Pipeline per symbol:
//   1. Validate data quality (enough bars, positive price, ATR ready)
//   2. Compute the trend reference (SMA of closes)
//   3. For open positions: stop / take-profit / trailing / trend-broken exits
//   4. For flat symbols: BUY when price holds above the reference,
//      with stop = entry − k_stop×ATR and take = entry + k_take×ATR
// =============================================================================

use crate::config::StrategyParams;
use crate::indicators::{calculate_atr, calculate_sma};
use crate::market::Candle;
use crate::position::{Position, PositionState};
use crate::types::{ExitReason, Signal};

/// Strategy output for one `(symbol, cycle)` evaluation.
#[derive(Debug, Clone)]
pub struct StrategyVerdict {
    pub signal: Signal,
    /// Human-readable rationale, logged with the decision.
    pub reason: String,
    /// Exit classification; present iff `signal == Sell`.
    pub exit_reason: Option<ExitReason>,
    /// The moving trend reference the verdict was computed against.
    pub reference_price: f64,
    pub suggested_stop: f64,
    pub suggested_take_profit: f64,
    /// ATR to freeze at entry; present iff `signal == Buy`.
    pub atr_at_entry: Option<f64>,
}

impl StrategyVerdict {
    fn hold(reason: impl Into<String>, reference: f64) -> Self {
        Self {
            signal: Signal::Hold,
            reason: reason.into(),
            exit_reason: None,
            reference_price: reference,
            suggested_stop: 0.0,
            suggested_take_profit: 0.0,
            atr_at_entry: None,
        }
    }
}

/// Capability interface: pure evaluation over the caller's snapshot.
///
/// `bars` are oldest-first; the caller reverses broker output once.
pub trait Strategy: Send + Sync {
    fn evaluate(
        &self,
        symbol: &str,
        position: Option<&Position>,
        bars: &[Candle],
        current_price: f64,
    ) -> StrategyVerdict;
}

/// Trend-following entries with ATR-sized brackets.
#[derive(Debug, Clone)]
pub struct TrendAtrStrategy {
    params: StrategyParams,
}

impl TrendAtrStrategy {
    pub fn new(params: StrategyParams) -> Self {
        Self { params }
    }
}

impl Strategy for TrendAtrStrategy {
    fn evaluate(
        &self,
        symbol: &str,
        position: Option<&Position>,
        bars: &[Candle],
        current_price: f64,
    ) -> StrategyVerdict {
        let p = &self.params;

        if current_price <= 0.0 {
            return StrategyVerdict::hold("no quote", 0.0);
        }
        if bars.len() < p.trend_period.max(p.atr_period + 1) {
            return StrategyVerdict::hold(
                format!("insufficient bars: {} available", bars.len()),
                0.0,
            );
        }

        let closes: Vec<f64> = bars.iter().map(|c| c.close).collect();
        let Some(reference) = calculate_sma(&closes, p.trend_period) else {
            return StrategyVerdict::hold("trend reference not ready", 0.0);
        };
        let Some(atr) = calculate_atr(bars, p.atr_period) else {
            return StrategyVerdict::hold("ATR not ready", reference);
        };
        if atr <= 0.0 {
            return StrategyVerdict::hold("degenerate ATR", reference);
        }

        match position {
            Some(pos) if pos.state == PositionState::Entered => {
                self.evaluate_exit(symbol, pos, reference, current_price)
            }
            _ => self.evaluate_entry(reference, atr, current_price),
        }
    }
}

impl TrendAtrStrategy {
    /// Exit checks in priority order: trailing stop, ATR stop, take-profit,
    /// trend-broken. All levels come from the position — the entry-era ATR,
    /// never today's.
    fn evaluate_exit(
        &self,
        _symbol: &str,
        pos: &Position,
        reference: f64,
        price: f64,
    ) -> StrategyVerdict {
        let sell = |reason: ExitReason, detail: String| StrategyVerdict {
            signal: Signal::Sell,
            reason: detail,
            exit_reason: Some(reason),
            reference_price: reference,
            suggested_stop: pos.stop_loss,
            suggested_take_profit: pos.take_profit,
            atr_at_entry: None,
        };

        // Recovered positions may carry zeroed levels; only armed levels fire.
        if let Some(trail) = pos.trailing_stop {
            if price <= trail {
                return sell(
                    ExitReason::TrailingStop,
                    format!("price {price} at or below trailing stop {trail}"),
                );
            }
        }
        if pos.stop_loss > 0.0 && price <= pos.stop_loss {
            return sell(
                ExitReason::AtrStop,
                format!("price {price} at or below stop {}", pos.stop_loss),
            );
        }
        if pos.take_profit > 0.0 && price >= pos.take_profit {
            return sell(
                ExitReason::TakeProfit,
                format!("price {price} at or above take-profit {}", pos.take_profit),
            );
        }
        if price < reference {
            return sell(
                ExitReason::TrendBroken,
                format!("price {price} below trend reference {reference:.1}"),
            );
        }

        StrategyVerdict::hold("holding within bracket", reference)
    }

    fn evaluate_entry(&self, reference: f64, atr: f64, price: f64) -> StrategyVerdict {
        if price <= reference {
            return StrategyVerdict::hold(
                format!("price {price} not above trend reference {reference:.1}"),
                reference,
            );
        }

        let stop = price - self.params.stop_atr_multiplier * atr;
        let take = price + self.params.take_atr_multiplier * atr;

        StrategyVerdict {
            signal: Signal::Buy,
            reason: format!(
                "uptrend: price {price} above reference {reference:.1}, atr {atr:.1}"
            ),
            exit_reason: None,
            reference_price: reference,
            suggested_stop: stop,
            suggested_take_profit: take,
            atr_at_entry: Some(atr),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Mode;
    use chrono::NaiveDate;

    fn bars_trending_up(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 60_000.0 + i as f64 * 200.0;
                Candle::new(
                    NaiveDate::from_ymd_opt(2025, 1, 1)
                        .unwrap()
                        .checked_add_days(chrono::Days::new(i as u64))
                        .unwrap(),
                    base,
                    base + 500.0,
                    base - 500.0,
                    base + 100.0,
                    500_000,
                )
            })
            .collect()
    }

    fn strategy() -> TrendAtrStrategy {
        TrendAtrStrategy::new(StrategyParams::default())
    }

    fn entered(symbol: &str) -> Position {
        let mut p = Position::pending(symbol, Mode::Paper, 10);
        p.enter(71_000.0, 10, 1_500.0, 68_000.0, 77_000.0);
        p
    }

    #[test]
    fn insufficient_bars_holds() {
        let v = strategy().evaluate("005930", None, &bars_trending_up(5), 71_000.0);
        assert_eq!(v.signal, Signal::Hold);
        assert!(v.reason.contains("insufficient"));
    }

    #[test]
    fn no_quote_holds() {
        let v = strategy().evaluate("005930", None, &bars_trending_up(40), 0.0);
        assert_eq!(v.signal, Signal::Hold);
    }

    #[test]
    fn uptrend_flat_buys_with_bracket() {
        let bars = bars_trending_up(40);
        let price = bars.last().unwrap().close + 1_000.0;
        let v = strategy().evaluate("005930", None, &bars, price);
        assert_eq!(v.signal, Signal::Buy);
        let atr = v.atr_at_entry.unwrap();
        assert!(atr > 0.0);
        assert!(v.suggested_stop < price);
        assert!(v.suggested_take_profit > price);
        assert!((price - v.suggested_stop - 2.0 * atr).abs() < 1e-9);
        assert!((v.suggested_take_profit - price - 4.0 * atr).abs() < 1e-9);
    }

    #[test]
    fn below_reference_does_not_enter() {
        let bars = bars_trending_up(40);
        let v = strategy().evaluate("005930", None, &bars, 50_000.0);
        assert_eq!(v.signal, Signal::Hold);
    }

    #[test]
    fn stop_breach_sells_with_atr_stop() {
        let bars = bars_trending_up(40);
        let pos = entered("005930");
        let v = strategy().evaluate("005930", Some(&pos), &bars, 67_900.0);
        assert_eq!(v.signal, Signal::Sell);
        assert_eq!(v.exit_reason, Some(ExitReason::AtrStop));
    }

    #[test]
    fn take_profit_breach_sells() {
        let bars = bars_trending_up(40);
        let pos = entered("005930");
        let v = strategy().evaluate("005930", Some(&pos), &bars, 77_100.0);
        assert_eq!(v.signal, Signal::Sell);
        assert_eq!(v.exit_reason, Some(ExitReason::TakeProfit));
    }

    #[test]
    fn trailing_stop_takes_priority_over_atr_stop() {
        let bars = bars_trending_up(40);
        let mut pos = entered("005930");
        pos.advance_trailing_stop(70_000.0);
        let v = strategy().evaluate("005930", Some(&pos), &bars, 69_500.0);
        assert_eq!(v.signal, Signal::Sell);
        assert_eq!(v.exit_reason, Some(ExitReason::TrailingStop));
    }

    #[test]
    fn close_below_reference_classifies_trend_broken() {
        let bars = bars_trending_up(40);
        let reference = calculate_sma(
            &bars.iter().map(|c| c.close).collect::<Vec<_>>(),
            20,
        )
        .unwrap();
        let mut pos = entered("005930");
        // Wide bracket so only the trend check can fire.
        pos.stop_loss = 1_000.0;
        pos.take_profit = 1_000_000.0;
        let price = reference - 100.0;
        let v = strategy().evaluate("005930", Some(&pos), &bars, price);
        assert_eq!(v.signal, Signal::Sell);
        assert_eq!(v.exit_reason, Some(ExitReason::TrendBroken));
    }

    #[test]
    fn in_bracket_uptrend_holds() {
        let bars = bars_trending_up(40);
        let mut pos = entered("005930");
        pos.stop_loss = 60_000.0;
        pos.take_profit = 90_000.0;
        let price = bars.last().unwrap().close + 500.0;
        let v = strategy().evaluate("005930", Some(&pos), &bars, price);
        assert_eq!(v.signal, Signal::Hold);
    }
}
