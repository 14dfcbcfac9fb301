use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod envelope;
pub mod logging;

pub use envelope::{Envelope, EnvelopeError};

// ============================================================================
// Received Message Model
// ============================================================================

/// A raw message pulled from a queue, before envelope decoding.
///
/// The body is kept as the untouched wire string so the consumer cycle owns
/// decode failures (malformed bodies count as validation errors, not
/// transport errors).
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub body: String,
    pub receipt_handle: String,
    /// Broker-assigned message id, when the transport exposes one
    pub broker_message_id: Option<String>,
    pub queue: String,
    /// How many times the transport has delivered this message (1 = first)
    pub receive_count: u32,
    pub sent_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Alerting Types
// ============================================================================

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Informational
    Info,
    /// May need attention
    Warn,
    /// Requires attention
    Error,
    /// Requires immediate attention
    Critical,
}

/// An operator alert routed through the notifier sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub source: String,
    /// Structured context (queue, counts, thresholds, ...)
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            severity,
            title: title.into(),
            message: message.into(),
            source: source.into(),
            context: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn critical(
        title: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self::new(Severity::Critical, title, message, source)
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Warn < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn alert_builder() {
        let alert = Alert::critical("dlq depth", "depth 42 over threshold", "monitor-dlq")
            .with_context(serde_json::json!({"queue": "payment-service-queue", "depth": 42}));

        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.context["depth"], 42);
    }
}
