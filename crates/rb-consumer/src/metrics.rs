//! Metrics sink contract for consume outcomes.
//!
//! The CloudWatch toggles in configuration select an external sink honoring
//! this contract; the logging sink is the in-tree default.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Outcome of handling one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    ValidationError,
    TransientError,
    PermanentError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::ValidationError => "validation_error",
            Outcome::TransientError => "transient_error",
            Outcome::PermanentError => "permanent_error",
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, queue: &str, outcome: Outcome);
}

/// Default sink: structured log lines, one per recorded outcome.
pub struct LoggingMetricsSink {
    namespace: String,
}

impl LoggingMetricsSink {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

impl MetricsSink for LoggingMetricsSink {
    fn record(&self, queue: &str, outcome: Outcome) {
        debug!(
            namespace = %self.namespace,
            queue = %queue,
            outcome = outcome.as_str(),
            "Consume outcome"
        );
    }
}

/// Test sink: counts outcomes per queue.
#[derive(Default)]
pub struct RecordingMetricsSink {
    counts: Mutex<HashMap<Outcome, u64>>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, outcome: Outcome) -> u64 {
        self.counts.lock().get(&outcome).copied().unwrap_or(0)
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn record(&self, _queue: &str, outcome: Outcome) {
        *self.counts.lock().entry(outcome).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels() {
        assert_eq!(Outcome::Success.as_str(), "success");
        assert_eq!(Outcome::ValidationError.as_str(), "validation_error");
        assert_eq!(Outcome::TransientError.as_str(), "transient_error");
        assert_eq!(Outcome::PermanentError.as_str(), "permanent_error");
    }

    #[test]
    fn recording_sink_counts() {
        let sink = RecordingMetricsSink::new();
        sink.record("q", Outcome::Success);
        sink.record("q", Outcome::Success);
        sink.record("q", Outcome::TransientError);

        assert_eq!(sink.count(Outcome::Success), 2);
        assert_eq!(sink.count(Outcome::TransientError), 1);
        assert_eq!(sink.count(Outcome::PermanentError), 0);
    }
}
