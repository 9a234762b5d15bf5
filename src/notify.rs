// =============================================================================
// Notifier — structured operator events
// =============================================================================
//
// The engine emits `{severity, kind, payload}` events. ERROR is reserved for:
// strategy exceptions, loop exceptions, terminal order-submit failures, and
// reconciliation verdicts of UNTRACKED_HOLDING / CRITICAL_MISMATCH.
// Individual reconciler soft-failures stay at WARNING.
//
// The default implementation writes through `tracing`; transports such as
// Telegram plug in behind the same trait.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// One operator-visible event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub severity: Severity,
    /// Stable machine-readable kind, e.g. `order_submit_failed`.
    pub kind: String,
    pub payload: Value,
}

impl Event {
    pub fn new(severity: Severity, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            severity,
            kind: kind.into(),
            payload,
        }
    }

    pub fn info(kind: impl Into<String>, payload: Value) -> Self {
        Self::new(Severity::Info, kind, payload)
    }

    pub fn warning(kind: impl Into<String>, payload: Value) -> Self {
        Self::new(Severity::Warning, kind, payload)
    }

    pub fn error(kind: impl Into<String>, payload: Value) -> Self {
        Self::new(Severity::Error, kind, payload)
    }
}

/// Capability interface for pushing events to an operator channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: Event);
}

/// Notifier that writes events to the process log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: Event) {
        match event.severity {
            Severity::Info => {
                info!(kind = %event.kind, payload = %event.payload, "notify")
            }
            Severity::Warning => {
                warn!(kind = %event.kind, payload = %event.payload, "notify")
            }
            Severity::Error => {
                error!(kind = %event.kind, payload = %event.payload, "notify")
            }
        }
    }
}

/// Test notifier that records every event it receives.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: parking_lot::Mutex<Vec<Event>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn errors(&self) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.severity == Severity::Error)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: Event) {
        self.events.lock().push(event);
    }
}
