// =============================================================================
// KIS REST API Client — token lifecycle, quotes, balance, orders, fill polling
// =============================================================================
//
// SECURITY: the app secret is never logged or serialized. All authenticated
// requests carry the bearer token plus appkey/appsecret headers; order
// submissions additionally carry a hashkey computed server-side.
//
// Retry policy: non-order calls retry up to 3 times with exponential backoff
// (base × 2^attempt). Order submissions are NEVER auto-retried — a duplicate
// fill is worse than a missed one; retries happen only through the
// synchronizer after a confirmed terminal state.
//
// Outage detection: ≥ 60 s of continuous request failures raises a
// process-wide network-outage flag; the first success clears it.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::broker::{Broker, ExecutionReport, OrderAck, OrderType, WaitOutcome, WaitStatus};
use crate::error::{EngineError, EngineResult};
use crate::market::{AccountBalance, Candle, Holding, Quote};
use crate::types::{Mode, Side};

/// Hard timeout for every HTTP request.
const HTTP_TIMEOUT_SECS: u64 = 15;
/// Non-order calls retry this many times.
const MAX_RETRIES: u32 = 3;
/// Base backoff; attempt N sleeps base × 2^N.
const RETRY_BACKOFF_BASE_MS: u64 = 500;
/// Token is refreshed when within this window of expiry.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 600;
/// Balance responses younger than this are served from cache.
const BALANCE_CACHE_AGE_SECS: u64 = 5;
/// Continuous failures for at least this long raise the outage flag.
const OUTAGE_THRESHOLD_SECS: u64 = 60;
/// Fill-wait polling interval.
const EXECUTION_POLL_SECS: u64 = 2;

/// Credentials and account coordinates, usually read from the environment.
#[derive(Debug, Clone)]
pub struct KisCredentials {
    pub app_key: String,
    pub app_secret: String,
    /// 8-digit account number.
    pub account_no: String,
    /// 2-digit product code, usually "01".
    pub account_product: String,
}

impl KisCredentials {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            app_key: std::env::var("KIS_APP_KEY").context("missing env var KIS_APP_KEY")?,
            app_secret: std::env::var("KIS_APP_SECRET")
                .context("missing env var KIS_APP_SECRET")?,
            account_no: std::env::var("KIS_ACCOUNT_NO")
                .context("missing env var KIS_ACCOUNT_NO")?,
            account_product: std::env::var("KIS_ACCOUNT_PRODUCT")
                .unwrap_or_else(|_| "01".to_string()),
        })
    }
}

#[derive(Debug, Clone)]
struct Token {
    access_token: String,
    expires_at: DateTime<Utc>,
    /// Calendar day (KST-agnostic UTC date is close enough for a daily roll)
    /// the token was issued on; a day change forces a refresh.
    issued_on: NaiveDate,
}

struct BalanceCache {
    fetched_at: Instant,
    balance: AccountBalance,
}

/// KIS REST client.
pub struct KisBroker {
    creds: KisCredentials,
    mode: Mode,
    base_url: String,
    client: reqwest::Client,
    token: RwLock<Option<Token>>,
    /// Only one caller refreshes the token; the rest wait on this.
    refresh_guard: tokio::sync::Mutex<()>,
    balance_cache: RwLock<Option<BalanceCache>>,
    /// Start of the current continuous-failure window, if any.
    failing_since: RwLock<Option<Instant>>,
    outage: AtomicBool,
}

impl KisBroker {
    /// Create a client for the given mode. PAPER routes to the mock-trading
    /// host and tr-id family; REAL routes to the production host.
    pub fn new(creds: KisCredentials, mode: Mode) -> Self {
        let base_url = match mode {
            Mode::Real => "https://openapi.koreainvestment.com:9443".to_string(),
            _ => "https://openapivts.koreainvestment.com:29443".to_string(),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, mode = %mode, "KisBroker initialised");

        Self {
            creds,
            mode,
            base_url,
            client,
            token: RwLock::new(None),
            refresh_guard: tokio::sync::Mutex::new(()),
            balance_cache: RwLock::new(None),
            failing_since: RwLock::new(None),
            outage: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Token lifecycle
    // -------------------------------------------------------------------------

    /// Return a valid access token, refreshing when within 10 minutes of
    /// expiry or when the calendar day changed. Refresh is mutually
    /// exclusive; concurrent callers wait for the winner.
    pub async fn get_access_token(&self) -> EngineResult<String> {
        if let Some(tok) = self.usable_token() {
            return Ok(tok);
        }

        let _guard = self.refresh_guard.lock().await;
        // Double-check: another caller may have refreshed while we waited.
        if let Some(tok) = self.usable_token() {
            return Ok(tok);
        }

        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.creds.app_key,
            "appsecret": self.creds.app_secret,
        });
        let url = format!("{}/oauth2/tokenP", self.base_url);

        let resp: Value = self
            .post_json_raw(&url, &body, &[])
            .await
            .map_err(|e| EngineError::BrokerTransient(format!("token request failed: {e}")))?;

        let access_token = resp["access_token"]
            .as_str()
            .ok_or_else(|| {
                EngineError::BrokerTransient(format!("token response missing access_token: {resp}"))
            })?
            .to_string();
        let expires_in = resp["expires_in"].as_i64().unwrap_or(86_400);

        let now = Utc::now();
        *self.token.write() = Some(Token {
            access_token: access_token.clone(),
            expires_at: now + chrono::Duration::seconds(expires_in),
            issued_on: now.date_naive(),
        });

        info!(expires_in, "access token refreshed");
        Ok(access_token)
    }

    fn usable_token(&self) -> Option<String> {
        let guard = self.token.read();
        let tok = guard.as_ref()?;
        let now = Utc::now();
        let near_expiry =
            (tok.expires_at - now).num_seconds() < TOKEN_REFRESH_MARGIN_SECS;
        let day_rolled = tok.issued_on != now.date_naive();
        if near_expiry || day_rolled {
            None
        } else {
            Some(tok.access_token.clone())
        }
    }

    // -------------------------------------------------------------------------
    // tr-id routing (REAL vs paper-trading families)
    // -------------------------------------------------------------------------

    fn tr_id_balance(&self) -> &'static str {
        match self.mode {
            Mode::Real => "TTTC8434R",
            _ => "VTTC8434R",
        }
    }

    fn tr_id_order(&self, side: Side) -> &'static str {
        match (self.mode, side) {
            (Mode::Real, Side::Buy) => "TTTC0802U",
            (Mode::Real, Side::Sell) => "TTTC0801U",
            (_, Side::Buy) => "VTTC0802U",
            (_, Side::Sell) => "VTTC0801U",
        }
    }

    fn tr_id_order_status(&self) -> &'static str {
        match self.mode {
            Mode::Real => "TTTC8001R",
            _ => "VTTC8001R",
        }
    }

    fn tr_id_cancel(&self) -> &'static str {
        match self.mode {
            Mode::Real => "TTTC0803U",
            _ => "VTTC0803U",
        }
    }

    // -------------------------------------------------------------------------
    // HTTP plumbing with outage tracking
    // -------------------------------------------------------------------------

    fn record_success(&self) {
        *self.failing_since.write() = None;
        if self.outage.swap(false, Ordering::Relaxed) {
            info!("network outage cleared");
        }
    }

    fn record_failure(&self) {
        let mut failing = self.failing_since.write();
        let since = failing.get_or_insert_with(Instant::now);
        if since.elapsed() >= Duration::from_secs(OUTAGE_THRESHOLD_SECS)
            && !self.outage.swap(true, Ordering::Relaxed)
        {
            warn!(
                failing_secs = since.elapsed().as_secs(),
                "network outage flag raised"
            );
        }
    }

    async fn post_json_raw(
        &self,
        url: &str,
        body: &Value,
        headers: &[(&str, String)],
    ) -> Result<Value> {
        let mut req = self.client.post(url).json(body);
        for (k, v) in headers {
            req = req.header(*k, v.as_str());
        }
        let resp = req.send().await;
        match resp {
            Ok(resp) => {
                let status = resp.status();
                let parsed: Value = resp.json().await.context("failed to parse response body")?;
                if !status.is_success() {
                    self.record_failure();
                    anyhow::bail!("POST {url} returned {status}: {parsed}");
                }
                self.record_success();
                Ok(parsed)
            }
            Err(e) => {
                self.record_failure();
                Err(e).context(format!("POST {url} request failed"))
            }
        }
    }

    async fn get_json(
        &self,
        path: &str,
        tr_id: &str,
        query: &[(&str, String)],
    ) -> Result<Value> {
        let token = self
            .get_access_token()
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .header("appkey", &self.creds.app_key)
            .header("appsecret", &self.creds.app_secret)
            .header("tr_id", tr_id)
            .query(query)
            .send()
            .await;

        match resp {
            Ok(resp) => {
                let status = resp.status();
                let parsed: Value = resp.json().await.context("failed to parse response body")?;
                if !status.is_success() {
                    self.record_failure();
                    anyhow::bail!("GET {path} returned {status}: {parsed}");
                }
                self.record_success();
                Ok(parsed)
            }
            Err(e) => {
                self.record_failure();
                Err(e).context(format!("GET {path} request failed"))
            }
        }
    }

    /// Retry wrapper for non-order calls.
    async fn get_json_retry(
        &self,
        path: &str,
        tr_id: &str,
        query: &[(&str, String)],
    ) -> EngineResult<Value> {
        let mut last_err = None;
        for attempt in 0..MAX_RETRIES {
            match self.get_json(path, tr_id, query).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let backoff = RETRY_BACKOFF_BASE_MS * (1 << attempt);
                    debug!(path, attempt, backoff_ms = backoff, error = %e, "retrying request");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
        Err(EngineError::BrokerTransient(format!(
            "{path} failed after {MAX_RETRIES} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Request the order hashkey for a POST body.
    async fn hashkey(&self, body: &Value) -> Result<String> {
        let url = format!("{}/uapi/hashkey", self.base_url);
        let resp = self
            .post_json_raw(
                &url,
                body,
                &[
                    ("appkey", self.creds.app_key.clone()),
                    ("appsecret", self.creds.app_secret.clone()),
                ],
            )
            .await?;
        resp["HASH"]
            .as_str()
            .map(|s| s.to_string())
            .context("hashkey response missing HASH")
    }

    // -------------------------------------------------------------------------
    // Parse helpers — KIS reports numbers as strings
    // -------------------------------------------------------------------------

    fn field_f64(v: &Value, key: &str) -> f64 {
        match &v[key] {
            Value::String(s) => s.trim().parse().unwrap_or(0.0),
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    fn field_i64(v: &Value, key: &str) -> i64 {
        match &v[key] {
            Value::String(s) => s.trim().parse().unwrap_or(0),
            Value::Number(n) => n.as_i64().unwrap_or(0),
            _ => 0,
        }
    }
}

// -----------------------------------------------------------------------------
// Typed deserialization of the holdings row
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HoldingRow {
    #[serde(default)]
    pdno: String,
    #[serde(default)]
    prdt_name: String,
    #[serde(default)]
    hldg_qty: String,
    #[serde(default)]
    pchs_avg_pric: String,
    #[serde(default)]
    prpr: String,
}

impl HoldingRow {
    fn into_holding(self) -> Option<Holding> {
        let qty: i64 = self.hldg_qty.trim().parse().unwrap_or(0);
        if qty <= 0 || self.pdno.is_empty() {
            return None;
        }
        Some(Holding {
            symbol: self.pdno,
            name: self.prdt_name,
            qty,
            avg_price: self.pchs_avg_pric.trim().parse().unwrap_or(0.0),
            current_price: self.prpr.trim().parse().unwrap_or(0.0),
        })
    }
}

#[async_trait]
impl Broker for KisBroker {
    #[instrument(skip(self), name = "kis::get_current_price")]
    async fn get_current_price(&self, symbol: &str) -> EngineResult<Option<Quote>> {
        let resp = self
            .get_json_retry(
                "/uapi/domestic-stock/v1/quotations/inquire-price",
                "FHKST01010100",
                &[
                    ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
                    ("FID_INPUT_ISCD", symbol.to_string()),
                ],
            )
            .await?;

        let output = &resp["output"];
        let price = Self::field_f64(output, "stck_prpr");
        if price <= 0.0 {
            debug!(symbol, "no quote available");
            return Ok(None);
        }

        // 51 = managed stock, 52/58 = halted variants; 55 = normal trading.
        let stat = output["iscd_stat_cls_code"].as_str().unwrap_or("55");
        let halted = matches!(stat, "51" | "52" | "53" | "54" | "58" | "59");

        Ok(Some(Quote {
            symbol: symbol.to_string(),
            price,
            open: Self::field_f64(output, "stck_oprc"),
            change_pct: Self::field_f64(output, "prdy_ctrt"),
            volume: Self::field_i64(output, "acml_vol"),
            halted,
        }))
    }

    #[instrument(skip(self), name = "kis::get_daily_ohlcv")]
    async fn get_daily_ohlcv(&self, symbol: &str, n: usize) -> EngineResult<Vec<Candle>> {
        let resp = self
            .get_json_retry(
                "/uapi/domestic-stock/v1/quotations/inquire-daily-price",
                "FHKST01010400",
                &[
                    ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
                    ("FID_INPUT_ISCD", symbol.to_string()),
                    ("FID_PERIOD_DIV_CODE", "D".to_string()),
                    ("FID_ORG_ADJ_PRC", "0".to_string()),
                ],
            )
            .await?;

        let rows = resp["output"].as_array().cloned().unwrap_or_default();
        let mut candles = Vec::with_capacity(rows.len().min(n));
        for row in rows.iter().take(n) {
            let date_str = row["stck_bsop_date"].as_str().unwrap_or("");
            let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y%m%d") else {
                warn!(symbol, date = date_str, "skipping bar with malformed date");
                continue;
            };
            let close = Self::field_f64(row, "stck_clpr");
            if close <= 0.0 {
                continue;
            }
            candles.push(Candle::new(
                date,
                Self::field_f64(row, "stck_oprc"),
                Self::field_f64(row, "stck_hgpr"),
                Self::field_f64(row, "stck_lwpr"),
                close,
                Self::field_i64(row, "acml_vol"),
            ));
        }

        debug!(symbol, count = candles.len(), "daily bars fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "kis::get_account_balance")]
    async fn get_account_balance(&self) -> EngineResult<AccountBalance> {
        if let Some(cache) = self.balance_cache.read().as_ref() {
            if cache.fetched_at.elapsed() < Duration::from_secs(BALANCE_CACHE_AGE_SECS) {
                debug!("balance served from cache");
                return Ok(cache.balance.clone());
            }
        }

        let resp = self
            .get_json_retry(
                "/uapi/domestic-stock/v1/trading/inquire-balance",
                self.tr_id_balance(),
                &[
                    ("CANO", self.creds.account_no.clone()),
                    ("ACNT_PRDT_CD", self.creds.account_product.clone()),
                    ("AFHR_FLPR_YN", "N".to_string()),
                    ("INQR_DVSN", "02".to_string()),
                    ("UNPR_DVSN", "01".to_string()),
                    ("FUND_STTL_ICLD_YN", "N".to_string()),
                    ("FNCG_AMT_AUTO_RDPT_YN", "N".to_string()),
                    ("PRCS_DVSN", "00".to_string()),
                    ("CTX_AREA_FK100", String::new()),
                    ("CTX_AREA_NK100", String::new()),
                ],
            )
            .await?;

        let holdings: Vec<Holding> = resp["output1"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|row| {
                serde_json::from_value::<HoldingRow>(row)
                    .ok()
                    .and_then(HoldingRow::into_holding)
            })
            .collect();

        let summary = resp["output2"]
            .as_array()
            .and_then(|a| a.first().cloned())
            .unwrap_or(Value::Null);
        let balance = AccountBalance {
            cash: Self::field_f64(&summary, "dnca_tot_amt"),
            total_equity: Self::field_f64(&summary, "tot_evlu_amt"),
            holdings,
        };

        *self.balance_cache.write() = Some(BalanceCache {
            fetched_at: Instant::now(),
            balance: balance.clone(),
        });

        debug!(
            cash = balance.cash,
            holdings = balance.holdings.len(),
            "account balance fetched"
        );
        Ok(balance)
    }

    #[instrument(skip(self), name = "kis::place_order")]
    async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        qty: i64,
        price: f64,
        order_type: OrderType,
    ) -> EngineResult<OrderAck> {
        // Division 01 = market, 00 = limit with unit price.
        let (dvsn, unpr) = match order_type {
            OrderType::Market => ("01", "0".to_string()),
            OrderType::Limit => ("00", format!("{}", price as i64)),
        };

        let body = json!({
            "CANO": self.creds.account_no,
            "ACNT_PRDT_CD": self.creds.account_product,
            "PDNO": symbol,
            "ORD_DVSN": dvsn,
            "ORD_QTY": qty.to_string(),
            "ORD_UNPR": unpr,
        });

        // Hashkey failures are transient (nothing was submitted yet).
        let hash = self
            .hashkey(&body)
            .await
            .map_err(|e| EngineError::BrokerTransient(format!("hashkey failed: {e}")))?;

        let token = self.get_access_token().await?;
        let url = format!("{}/uapi/domestic-stock/v1/trading/order-cash", self.base_url);

        // Single attempt, no retry: after this point a duplicate submission
        // could double-fill.
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .header("appkey", &self.creds.app_key)
            .header("appsecret", &self.creds.app_secret)
            .header("tr_id", self.tr_id_order(side))
            .header("hashkey", hash)
            .json(&body)
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                self.record_failure();
                return Err(EngineError::BrokerSubmit {
                    symbol: symbol.to_string(),
                    side,
                    reason: format!("order request failed: {e}"),
                });
            }
        };

        let status = resp.status();
        let parsed: Value = resp.json().await.map_err(|e| EngineError::BrokerSubmit {
            symbol: symbol.to_string(),
            side,
            reason: format!("unparseable order response: {e}"),
        })?;
        self.record_success();

        let rt_cd = parsed["rt_cd"].as_str().unwrap_or("");
        let accepted = status.is_success() && rt_cd == "0";
        let order_no = parsed["output"]["ODNO"].as_str().map(|s| s.to_string());

        // A SELL refused because the session is closed goes to the
        // pending-exit path instead of FAILED. 40310000 = outside order
        // hours; APBK0919/APBK0656 = market closed variants.
        if !accepted && side == Side::Sell {
            let msg_cd = parsed["msg_cd"].as_str().unwrap_or("");
            if matches!(msg_cd, "40310000" | "APBK0919" | "APBK0656") {
                return Err(EngineError::MarketClosed {
                    symbol: symbol.to_string(),
                    reason: parsed["msg1"].as_str().unwrap_or("order hours closed").to_string(),
                });
            }
        }

        if accepted {
            info!(
                symbol,
                side = %side,
                qty,
                order_no = order_no.as_deref().unwrap_or("?"),
                "order accepted"
            );
        } else {
            warn!(
                symbol,
                side = %side,
                rt_cd,
                msg = parsed["msg1"].as_str().unwrap_or(""),
                "order rejected"
            );
        }

        Ok(OrderAck {
            accepted,
            order_no: if accepted { order_no } else { None },
            raw: parsed,
        })
    }

    #[instrument(skip(self), name = "kis::order_status")]
    async fn order_status(&self, order_no: &str) -> EngineResult<ExecutionReport> {
        let today = Utc::now().format("%Y%m%d").to_string();
        let resp = self
            .get_json_retry(
                "/uapi/domestic-stock/v1/trading/inquire-daily-ccld",
                self.tr_id_order_status(),
                &[
                    ("CANO", self.creds.account_no.clone()),
                    ("ACNT_PRDT_CD", self.creds.account_product.clone()),
                    ("INQR_STRT_DT", today.clone()),
                    ("INQR_END_DT", today),
                    ("SLL_BUY_DVSN_CD", "00".to_string()),
                    ("ODNO", order_no.to_string()),
                    ("INQR_DVSN", "00".to_string()),
                    ("PDNO", String::new()),
                    ("CCLD_DVSN", "00".to_string()),
                    ("INQR_DVSN_1", String::new()),
                    ("INQR_DVSN_3", "00".to_string()),
                    ("CTX_AREA_FK100", String::new()),
                    ("CTX_AREA_NK100", String::new()),
                ],
            )
            .await?;

        // Fills are reported cumulatively; find our order number.
        let rows = resp["output1"].as_array().cloned().unwrap_or_default();
        let row = rows
            .iter()
            .find(|r| r["odno"].as_str() == Some(order_no))
            .cloned()
            .unwrap_or(Value::Null);

        Ok(ExecutionReport {
            order_no: order_no.to_string(),
            filled_qty: Self::field_i64(&row, "tot_ccld_qty"),
            avg_price: Self::field_f64(&row, "avg_prvs"),
        })
    }

    #[instrument(skip(self), name = "kis::cancel_order")]
    async fn cancel_order(&self, order_no: &str) -> EngineResult<()> {
        let body = json!({
            "CANO": self.creds.account_no,
            "ACNT_PRDT_CD": self.creds.account_product,
            "KRX_FWDG_ORD_ORGNO": "",
            "ORGN_ODNO": order_no,
            "ORD_DVSN": "00",
            "RVSE_CNCL_DVSN_CD": "02",
            "ORD_QTY": "0",
            "ORD_UNPR": "0",
            "QTY_ALL_ORD_YN": "Y",
        });

        let hash = self
            .hashkey(&body)
            .await
            .map_err(|e| EngineError::BrokerTransient(format!("hashkey failed: {e}")))?;
        let token = self.get_access_token().await?;
        let url = format!(
            "{}/uapi/domestic-stock/v1/trading/order-rvsecncl",
            self.base_url
        );

        let result = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .header("appkey", &self.creds.app_key)
            .header("appsecret", &self.creds.app_secret)
            .header("tr_id", self.tr_id_cancel())
            .header("hashkey", hash)
            .json(&body)
            .send()
            .await;

        // Best-effort: log and move on; the post-cancel status query decides.
        match result {
            Ok(resp) => {
                self.record_success();
                let parsed: Value = resp.json().await.unwrap_or(Value::Null);
                info!(
                    order_no,
                    rt_cd = parsed["rt_cd"].as_str().unwrap_or(""),
                    "cancel submitted"
                );
            }
            Err(e) => {
                self.record_failure();
                warn!(order_no, error = %e, "cancel request failed");
            }
        }
        Ok(())
    }

    #[instrument(skip(self), name = "kis::wait_for_execution")]
    async fn wait_for_execution(
        &self,
        order_no: &str,
        expected_qty: i64,
        timeout_secs: u64,
    ) -> EngineResult<WaitOutcome> {
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        let mut last = ExecutionReport {
            order_no: order_no.to_string(),
            filled_qty: 0,
            avg_price: 0.0,
        };

        loop {
            match self.order_status(order_no).await {
                Ok(report) => {
                    if report.filled_qty >= expected_qty {
                        info!(
                            order_no,
                            filled = report.filled_qty,
                            avg_price = report.avg_price,
                            "order fully filled"
                        );
                        return Ok(WaitOutcome {
                            status: WaitStatus::Filled,
                            filled_qty: report.filled_qty,
                            avg_price: report.avg_price,
                        });
                    }
                    last = report;
                }
                Err(e) => {
                    // Keep polling until the deadline; transient status
                    // failures must not orphan an in-flight order.
                    warn!(order_no, error = %e, "order status poll failed");
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_secs(EXECUTION_POLL_SECS)).await;
        }

        // Timed out: cancel the remainder and re-query once.
        warn!(
            order_no,
            filled = last.filled_qty,
            expected = expected_qty,
            "execution wait timed out, cancelling remainder"
        );
        self.cancel_order(order_no).await?;

        let post = self.order_status(order_no).await.unwrap_or(last);
        let status = if post.filled_qty > 0 {
            WaitStatus::Partial
        } else {
            WaitStatus::Cancelled
        };
        Ok(WaitOutcome {
            status,
            filled_qty: post.filled_qty,
            avg_price: post.avg_price,
        })
    }

    fn network_outage(&self) -> bool {
        self.outage.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for KisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KisBroker")
            .field("app_key", &"<redacted>")
            .field("app_secret", &"<redacted>")
            .field("mode", &self.mode)
            .field("base_url", &self.base_url)
            .finish()
    }
}
