// =============================================================================
// Market data types — daily bars, quotes, account holdings
// =============================================================================

pub mod hours;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One daily OHLCV bar for a listed stock.
///
/// Brokers return daily history newest-first; the indicator code expects
/// oldest-first, so callers reverse before computing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl Candle {
    pub fn new(date: NaiveDate, open: f64, high: f64, low: f64, close: f64, volume: i64) -> Self {
        Self {
            date,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Latest trade snapshot for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    /// Today's opening price, used by the gap guard.
    pub open: f64,
    /// Session change percentage as reported by the exchange.
    pub change_pct: f64,
    pub volume: i64,
    /// Suspended or under management designation; excluded from selection.
    #[serde(default)]
    pub halted: bool,
}

/// One holding row from the broker's account-of-record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub name: String,
    pub qty: i64,
    pub avg_price: f64,
    pub current_price: f64,
}

/// Cash plus per-symbol holdings, as returned by the broker balance call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub cash: f64,
    pub total_equity: f64,
    pub holdings: Vec<Holding>,
}
