//! Error classification for the consume path.
//!
//! Listeners report failures through a closed kind enum; classification maps
//! kinds to a disposition. Substring heuristics apply only to opaque errors,
//! where they merely refine logging: an unmatched unknown is still treated
//! as transient, preferring redelivery to silent loss.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("throttled by upstream: {0}")]
    Throttled(String),

    #[error("upstream returned {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("database unavailable: {0}")]
    DatabaseUnavailable(String),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("business rule violated: {0}")]
    BusinessRule(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Unique-constraint violation on the processed-events table: the event
    /// was already handled at the durable tier.
    #[error("already processed: {0}")]
    AlreadyProcessed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ListenerError {
    /// Stable kind label for alerts and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ListenerError::Connection(_) => "connection",
            ListenerError::Timeout(_) => "timeout",
            ListenerError::Throttled(_) => "throttled",
            ListenerError::UpstreamStatus { .. } => "upstream_status",
            ListenerError::DatabaseUnavailable(_) => "database_unavailable",
            ListenerError::CacheUnavailable(_) => "cache_unavailable",
            ListenerError::BusinessRule(_) => "business_rule",
            ListenerError::NotFound(_) => "not_found",
            ListenerError::InvalidState(_) => "invalid_state",
            ListenerError::AlreadyProcessed(_) => "already_processed",
            ListenerError::Other(_) => "unknown",
        }
    }
}

/// Disposition of a failed dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Leave for redelivery; the transport promotes to the DLQ after the
    /// redrive limit
    Transient,
    /// Acknowledge and alert
    Permanent,
}

/// Classify a listener failure. Evaluated in order: declared transient
/// kinds, declared permanent kinds, then opaque errors default to transient.
pub fn classify(error: &ListenerError) -> ErrorClass {
    match error {
        ListenerError::Connection(_)
        | ListenerError::Timeout(_)
        | ListenerError::Throttled(_)
        | ListenerError::DatabaseUnavailable(_)
        | ListenerError::CacheUnavailable(_) => ErrorClass::Transient,

        // 5xx is declared transient; anything else an upstream returns is
        // unknown territory and also left for redelivery
        ListenerError::UpstreamStatus { .. } => ErrorClass::Transient,

        ListenerError::BusinessRule(_)
        | ListenerError::NotFound(_)
        | ListenerError::InvalidState(_)
        | ListenerError::AlreadyProcessed(_) => ErrorClass::Permanent,

        ListenerError::Other(_) => ErrorClass::Transient,
    }
}

/// Last-resort message sniffing for opaque errors, used to log whether an
/// unknown failure looked like a known transient condition.
pub fn matches_transient_heuristics(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["connection", "timeout", "temporarily unavailable", "throttl"]
        .iter()
        .any(|needle| lower.contains(needle))
}
