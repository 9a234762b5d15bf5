// =============================================================================
// Fake broker — scriptable in-memory implementation for DRY_RUN and tests
// =============================================================================
//
// Each symbol carries a fill plan that decides how the next order behaves:
// immediate full fill, partial fill, no fill (timeout path), or rejection.
// Every submission is recorded so tests can assert on exactly how many
// reached the "exchange" — the idempotency property of the synchronizer is
// checked against this log.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;

use crate::broker::{Broker, ExecutionReport, OrderAck, OrderType, WaitOutcome, WaitStatus};
use crate::error::{EngineError, EngineResult};
use crate::market::{AccountBalance, Candle, Quote};
use crate::types::Side;

/// How the fake handles the next order for a symbol.
#[derive(Debug, Clone)]
pub enum FillPlan {
    /// Fill the whole quantity at this price as soon as the wait starts.
    Immediate { price: f64 },
    /// Fill only `qty` at `price`; the remainder never fills.
    Partial { qty: i64, price: f64 },
    /// Accept but never fill (drives the timeout/cancel path).
    NoFill,
    /// Reject the submission outright.
    Reject { reason: String },
}

/// One recorded submission.
#[derive(Debug, Clone)]
pub struct SubmittedOrder {
    pub order_no: String,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub price: f64,
    pub order_type: OrderType,
}

#[derive(Debug, Clone)]
struct OrderRecord {
    filled_qty: i64,
    avg_price: f64,
    cancelled: bool,
}

/// In-memory broker with scriptable behavior.
#[derive(Default)]
pub struct FakeBroker {
    quotes: RwLock<HashMap<String, Quote>>,
    bars: RwLock<HashMap<String, Vec<Candle>>>,
    cash: RwLock<f64>,
    holdings: RwLock<Vec<crate::market::Holding>>,
    fill_plans: RwLock<HashMap<String, FillPlan>>,
    orders: RwLock<HashMap<String, OrderRecord>>,
    submissions: RwLock<Vec<SubmittedOrder>>,
    next_order_no: AtomicU64,
    /// When set, every SELL is rejected as if the call auction were running.
    market_closed: AtomicBool,
    outage: AtomicBool,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            cash: RwLock::new(10_000_000.0),
            next_order_no: AtomicU64::new(1),
            ..Self::default()
        }
    }

    // -------------------------------------------------------------------------
    // Scripting surface
    // -------------------------------------------------------------------------

    pub fn set_quote(&self, symbol: &str, price: f64, open: f64) {
        self.quotes.write().insert(
            symbol.to_string(),
            Quote {
                symbol: symbol.to_string(),
                price,
                open,
                change_pct: 0.0,
                volume: 1_000_000,
                halted: false,
            },
        );
    }

    /// Full control over the quote row, for universe-filter tests.
    pub fn set_quote_full(&self, quote: Quote) {
        self.quotes.write().insert(quote.symbol.clone(), quote);
    }

    pub fn clear_quote(&self, symbol: &str) {
        self.quotes.write().remove(symbol);
    }

    pub fn set_bars(&self, symbol: &str, bars: Vec<Candle>) {
        self.bars.write().insert(symbol.to_string(), bars);
    }

    pub fn set_cash(&self, cash: f64) {
        *self.cash.write() = cash;
    }

    pub fn set_holdings(&self, holdings: Vec<crate::market::Holding>) {
        *self.holdings.write() = holdings;
    }

    pub fn set_fill_plan(&self, symbol: &str, plan: FillPlan) {
        self.fill_plans.write().insert(symbol.to_string(), plan);
    }

    pub fn set_market_closed(&self, closed: bool) {
        self.market_closed.store(closed, Ordering::Relaxed);
    }

    pub fn set_outage(&self, outage: bool) {
        self.outage.store(outage, Ordering::Relaxed);
    }

    /// Every order that reached the fake exchange, in submission order.
    pub fn submissions(&self) -> Vec<SubmittedOrder> {
        self.submissions.read().clone()
    }

    pub fn cancelled_orders(&self) -> Vec<String> {
        self.orders
            .read()
            .iter()
            .filter(|(_, r)| r.cancelled)
            .map(|(no, _)| no.clone())
            .collect()
    }

    /// Reflect a fill in the fake account so reconciliation sees it.
    pub fn apply_fill_to_holdings(&self, symbol: &str, side: Side, qty: i64, price: f64) {
        let mut holdings = self.holdings.write();
        match side {
            Side::Buy => {
                if let Some(h) = holdings.iter_mut().find(|h| h.symbol == symbol) {
                    let total_cost = h.avg_price * h.qty as f64 + price * qty as f64;
                    h.qty += qty;
                    h.avg_price = total_cost / h.qty as f64;
                } else {
                    holdings.push(crate::market::Holding {
                        symbol: symbol.to_string(),
                        name: symbol.to_string(),
                        qty,
                        avg_price: price,
                        current_price: price,
                    });
                }
                *self.cash.write() -= price * qty as f64;
            }
            Side::Sell => {
                if let Some(h) = holdings.iter_mut().find(|h| h.symbol == symbol) {
                    h.qty -= qty;
                }
                holdings.retain(|h| h.qty > 0);
                *self.cash.write() += price * qty as f64;
            }
        }
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn get_current_price(&self, symbol: &str) -> EngineResult<Option<Quote>> {
        if self.outage.load(Ordering::Relaxed) {
            return Err(EngineError::BrokerTransient("scripted outage".into()));
        }
        Ok(self.quotes.read().get(symbol).cloned())
    }

    async fn get_daily_ohlcv(&self, symbol: &str, n: usize) -> EngineResult<Vec<Candle>> {
        if self.outage.load(Ordering::Relaxed) {
            return Err(EngineError::BrokerTransient("scripted outage".into()));
        }
        Ok(self
            .bars
            .read()
            .get(symbol)
            .map(|b| b.iter().take(n).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_account_balance(&self) -> EngineResult<AccountBalance> {
        if self.outage.load(Ordering::Relaxed) {
            return Err(EngineError::BrokerTransient("scripted outage".into()));
        }
        let holdings = self.holdings.read().clone();
        let cash = *self.cash.read();
        let equity = cash
            + holdings
                .iter()
                .map(|h| h.current_price * h.qty as f64)
                .sum::<f64>();
        Ok(AccountBalance {
            cash,
            total_equity: equity,
            holdings,
        })
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        qty: i64,
        price: f64,
        order_type: OrderType,
    ) -> EngineResult<OrderAck> {
        if self.outage.load(Ordering::Relaxed) {
            return Err(EngineError::BrokerSubmit {
                symbol: symbol.to_string(),
                side,
                reason: "scripted outage".into(),
            });
        }
        if side == Side::Sell && self.market_closed.load(Ordering::Relaxed) {
            return Err(EngineError::MarketClosed {
                symbol: symbol.to_string(),
                reason: "call auction in progress".into(),
            });
        }

        let plan = self
            .fill_plans
            .read()
            .get(symbol)
            .cloned()
            .unwrap_or(FillPlan::Immediate {
                price: if price > 0.0 {
                    price
                } else {
                    self.quotes
                        .read()
                        .get(symbol)
                        .map(|q| q.price)
                        .unwrap_or(0.0)
                },
            });

        if let FillPlan::Reject { reason } = &plan {
            return Ok(OrderAck {
                accepted: false,
                order_no: None,
                raw: json!({"rejected": reason}),
            });
        }

        let order_no = format!("F{:08}", self.next_order_no.fetch_add(1, Ordering::Relaxed));

        let (filled_qty, avg_price) = match &plan {
            FillPlan::Immediate { price } => (qty, *price),
            FillPlan::Partial { qty: fq, price } => ((*fq).min(qty), *price),
            FillPlan::NoFill => (0, 0.0),
            FillPlan::Reject { .. } => unreachable!(),
        };

        self.orders.write().insert(
            order_no.clone(),
            OrderRecord {
                filled_qty,
                avg_price,
                cancelled: false,
            },
        );
        self.submissions.write().push(SubmittedOrder {
            order_no: order_no.clone(),
            symbol: symbol.to_string(),
            side,
            qty,
            price,
            order_type,
        });

        Ok(OrderAck {
            accepted: true,
            order_no: Some(order_no),
            raw: json!({"fake": true}),
        })
    }

    async fn order_status(&self, order_no: &str) -> EngineResult<ExecutionReport> {
        let orders = self.orders.read();
        let record = orders.get(order_no).ok_or_else(|| {
            EngineError::BrokerTransient(format!("unknown order number {order_no}"))
        })?;
        Ok(ExecutionReport {
            order_no: order_no.to_string(),
            filled_qty: record.filled_qty,
            avg_price: record.avg_price,
        })
    }

    async fn cancel_order(&self, order_no: &str) -> EngineResult<()> {
        if let Some(record) = self.orders.write().get_mut(order_no) {
            record.cancelled = true;
        }
        Ok(())
    }

    async fn wait_for_execution(
        &self,
        order_no: &str,
        expected_qty: i64,
        _timeout_secs: u64,
    ) -> EngineResult<WaitOutcome> {
        // No real clock: the fill plan already decided the outcome.
        let report = self.order_status(order_no).await?;
        let status = if report.filled_qty >= expected_qty {
            WaitStatus::Filled
        } else if report.filled_qty > 0 {
            WaitStatus::Partial
        } else {
            WaitStatus::Timeout
        };
        Ok(WaitOutcome {
            status,
            filled_qty: report.filled_qty,
            avg_price: report.avg_price,
        })
    }

    fn network_outage(&self) -> bool {
        self.outage.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FakeBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeBroker")
            .field("orders", &self.orders.read().len())
            .field("submissions", &self.submissions.read().len())
            .finish()
    }
}
