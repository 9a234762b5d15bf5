// =============================================================================
// Broker capability interface
// =============================================================================
//
// The engine depends only on this capability set. `KisBroker` implements it
// over the brokerage REST API; `FakeBroker` implements it in-memory for
// DRY_RUN and tests.
//
// Behavioral contract: accept-then-fill semantics. An accepted submission is
// never treated as a fill; fills are reported cumulatively per order number.
// =============================================================================

pub mod fake;
pub mod kis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineResult;
use crate::market::{AccountBalance, Candle, Quote};
use crate::types::Side;

/// How an order should be priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
        }
    }
}

/// Broker response to an order submission. Acceptance is not a fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub accepted: bool,
    /// Broker order number; present iff accepted.
    pub order_no: Option<String>,
    /// Raw broker payload retained for audit.
    pub raw: Value,
}

/// Cumulative execution state for one order number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub order_no: String,
    pub filled_qty: i64,
    pub avg_price: f64,
}

/// Outcome of a fill-wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitStatus {
    Filled,
    Partial,
    /// The wait expired, the client already issued a best-effort cancel, and
    /// the post-cancel query showed no fill.
    Cancelled,
    /// The wait expired and no cancel has been attempted yet (fake broker
    /// path); the synchronizer cancels and re-queries.
    Timeout,
}

impl std::fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filled => write!(f, "FILLED"),
            Self::Partial => write!(f, "PARTIAL"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitOutcome {
    pub status: WaitStatus,
    pub filled_qty: i64,
    pub avg_price: f64,
}

/// Brokerage-facing surface needed by the core.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Latest trade snapshot. `Ok(None)` means "no quote" (price 0 or absent).
    async fn get_current_price(&self, symbol: &str) -> EngineResult<Option<Quote>>;

    /// Up to `n` daily bars, most recent first.
    async fn get_daily_ohlcv(&self, symbol: &str, n: usize) -> EngineResult<Vec<Candle>>;

    /// Cash plus per-symbol holdings. May be served from a short-lived cache.
    async fn get_account_balance(&self) -> EngineResult<AccountBalance>;

    /// Submit an order. `price` of 0 means market. Never auto-retried.
    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        qty: i64,
        price: f64,
        order_type: OrderType,
    ) -> EngineResult<OrderAck>;

    /// Cumulative execution state for an order number.
    async fn order_status(&self, order_no: &str) -> EngineResult<ExecutionReport>;

    /// Best-effort cancel.
    async fn cancel_order(&self, order_no: &str) -> EngineResult<()>;

    /// Poll order status until filled or `timeout_secs` elapses.
    async fn wait_for_execution(
        &self,
        order_no: &str,
        expected_qty: i64,
        timeout_secs: u64,
    ) -> EngineResult<WaitOutcome>;

    /// Whether the client currently observes a network outage (≥ 60 s of
    /// continuous request failures).
    fn network_outage(&self) -> bool;
}

/// Convenience wrappers matching the decision vocabulary of the synchronizer.
#[async_trait]
pub trait BrokerExt: Broker {
    async fn place_buy(
        &self,
        symbol: &str,
        qty: i64,
        price: f64,
        order_type: OrderType,
    ) -> EngineResult<OrderAck> {
        self.place_order(symbol, Side::Buy, qty, price, order_type)
            .await
    }

    async fn place_sell(
        &self,
        symbol: &str,
        qty: i64,
        price: f64,
        order_type: OrderType,
    ) -> EngineResult<OrderAck> {
        self.place_order(symbol, Side::Sell, qty, price, order_type)
            .await
    }
}

impl<T: Broker + ?Sized> BrokerExt for T {}
