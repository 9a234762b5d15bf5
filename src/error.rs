// =============================================================================
// Engine error kinds
// =============================================================================
//
// Fatal-at-startup errors (Config, LockHeld) abort the process with a
// dedicated exit code. Per-cycle errors are caught at the loop boundary so
// that one symbol's failure never stops the others.
// =============================================================================

use thiserror::Error;

use crate::types::{Mode, Side};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("another instance holds the lock at {path} (pid {pid})")]
    LockHeld { path: String, pid: u32 },

    /// Transient broker failure. Non-order calls retry; order paths surface
    /// it to the loop which aborts the cycle.
    #[error("broker transient failure: {0}")]
    BrokerTransient(String),

    /// The broker rejected an order submission. Always terminal: the
    /// synchronizer records FAILED and notifies.
    #[error("broker rejected {side} {symbol}: {reason}")]
    BrokerSubmit {
        symbol: String,
        side: Side,
        reason: String,
    },

    #[error("execution wait timed out for order {order_no} after {waited_secs}s")]
    ExecutionTimeout { order_no: String, waited_secs: u64 },

    #[error("store persistence failure: {0}")]
    StorePersistence(String),

    #[error("reconciliation critical ({verdict}) for {symbol} in {mode}")]
    ReconciliationCritical {
        symbol: String,
        mode: Mode,
        verdict: String,
    },

    #[error("risk denied: {0}")]
    RiskDenied(String),

    /// SELL could not be routed because the market is closed or the symbol is
    /// un-orderable. Routed to the pending-exit backoff path, never dropped.
    #[error("market closed for {symbol}: {reason}")]
    MarketClosed { symbol: String, reason: String },
}

impl EngineError {
    /// Whether this error may be retried by the broker client's backoff loop.
    /// Order submissions are never auto-retried regardless of this flag.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BrokerTransient(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(EngineError::BrokerTransient("timeout".into()).is_transient());
        assert!(!EngineError::RiskDenied("daily loss cap".into()).is_transient());
        assert!(!EngineError::BrokerSubmit {
            symbol: "005930".into(),
            side: Side::Buy,
            reason: "rejected".into(),
        }
        .is_transient());
    }

    #[test]
    fn display_includes_context() {
        let e = EngineError::ExecutionTimeout {
            order_no: "KRX123".into(),
            waited_secs: 45,
        };
        let msg = e.to_string();
        assert!(msg.contains("KRX123"));
        assert!(msg.contains("45"));
    }
}
