//! The consumer cycle: one long poll, per-message orchestration, rate
//! alerting, then exit.
//!
//! Designed to run under an external supervisor that restarts the process
//! after every cycle. A message reaches exactly one terminal state per
//! delivery: acknowledged (success, duplicate, validation or permanent
//! failure) or left in place for redelivery (transient failure), with the
//! transport's redrive policy promoting repeat offenders to the DLQ.

use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use rb_alert::Notifier;
use rb_common::{Alert, Envelope, ReceivedMessage, Severity};
use rb_idempotency::IdempotencyStore;
use rb_queue::QueueSource;

use crate::classify::{classify, matches_transient_heuristics, ErrorClass, ListenerError};
use crate::listener::ListenerRegistry;
use crate::metrics::{MetricsSink, Outcome};

#[derive(Debug, Error)]
pub enum CycleError {
    /// The receive call itself failed; the cycle aborts and the supervisor
    /// restarts the process.
    #[error("receive failed: {0}")]
    Receive(String),
}

#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Logical queue name, used in alerts and metrics
    pub queue: String,
    pub max_messages: u32,
    pub long_running_events: BTreeSet<String>,
    pub long_running_visibility_seconds: u32,
    pub validation_error_rate_threshold: f64,
    pub transient_error_rate_threshold: f64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            queue: String::new(),
            max_messages: 10,
            long_running_events: BTreeSet::new(),
            long_running_visibility_seconds: 120,
            validation_error_rate_threshold: 0.01,
            transient_error_rate_threshold: 0.10,
        }
    }
}

/// Counters for one cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Messages handled this cycle
    pub processed: u64,
    pub success: u64,
    /// Duplicate deliveries acked as success
    pub duplicates: u64,
    pub validation_errors: u64,
    pub transient_errors: u64,
    pub permanent_errors: u64,
    /// Rate alerts fired after the batch
    pub alerts_fired: u64,
}

pub struct ConsumerCycle {
    source: Arc<dyn QueueSource>,
    registry: Arc<ListenerRegistry>,
    store: Arc<IdempotencyStore>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn MetricsSink>,
    config: CycleConfig,
}

impl ConsumerCycle {
    pub fn new(
        source: Arc<dyn QueueSource>,
        registry: Arc<ListenerRegistry>,
        store: Arc<IdempotencyStore>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<dyn MetricsSink>,
        config: CycleConfig,
    ) -> Self {
        Self {
            source,
            registry,
            store,
            notifier,
            metrics,
            config,
        }
    }

    /// Run one full cycle: a single long-poll receive, the per-message state
    /// machine for each delivery, then rate alerting over the batch.
    pub async fn run_once(&self) -> Result<CycleReport, CycleError> {
        let messages = self
            .source
            .poll(self.config.max_messages)
            .await
            .map_err(|e| {
                error!(queue = %self.config.queue, error = %e, "Receive failed, aborting cycle");
                CycleError::Receive(e.to_string())
            })?;

        let mut report = CycleReport::default();

        if messages.is_empty() {
            debug!(queue = %self.config.queue, "No messages received");
            return Ok(report);
        }

        info!(
            queue = %self.config.queue,
            count = messages.len(),
            "Processing received batch"
        );

        for message in messages {
            self.process_message(message, &mut report).await;
        }

        self.check_rates(&mut report).await;

        Ok(report)
    }

    async fn process_message(&self, message: ReceivedMessage, report: &mut CycleReport) {
        report.processed += 1;

        // DECODE + VALIDATE
        let envelope = match Envelope::from_body(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    queue = %self.config.queue,
                    error = %e,
                    "Discarding message that failed envelope validation"
                );
                report.validation_errors += 1;
                self.metrics.record(&self.config.queue, Outcome::ValidationError);
                self.ack_quietly(&message).await;
                return;
            }
        };

        let key = envelope.idempotency_key.clone();

        // DEDUP: a duplicate is a success for delivery semantics
        match self.store.is_processed(&key).await {
            Ok(true) => {
                debug!(
                    queue = %self.config.queue,
                    event_type = %envelope.event_type,
                    trace_id = %envelope.trace_id,
                    "Duplicate delivery, acking"
                );
                report.success += 1;
                report.duplicates += 1;
                self.metrics.record(&self.config.queue, Outcome::Success);
                self.ack_quietly(&message).await;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    queue = %self.config.queue,
                    error = %e,
                    "Idempotency store unavailable, leaving message for redelivery"
                );
                report.transient_errors += 1;
                self.metrics.record(&self.config.queue, Outcome::TransientError);
                return;
            }
        }

        // CLAIM: advisory, crash-safe via TTL
        self.store.claim(&key).await;

        // EXTEND_VIS for configured long-running events
        if self.config.long_running_events.contains(&envelope.event_type) {
            if let Err(e) = self
                .source
                .extend_visibility(
                    &message.receipt_handle,
                    self.config.long_running_visibility_seconds,
                )
                .await
            {
                warn!(
                    queue = %self.config.queue,
                    error = %e,
                    "Failed to extend visibility for long-running event"
                );
            }
        }

        // DISPATCH
        let Some(listener) = self.registry.get(&envelope.event_type) else {
            warn!(
                queue = %self.config.queue,
                event_type = %envelope.event_type,
                "No listener mapped for event type, discarding"
            );
            report.permanent_errors += 1;
            self.metrics.record(&self.config.queue, Outcome::PermanentError);
            self.store.release(&key).await;
            self.alert_unmapped(&envelope).await;
            self.ack_quietly(&message).await;
            return;
        };

        match listener.handle(envelope.payload.clone()).await {
            Ok(()) => {
                // COMMIT: the durable insert makes redeliveries duplicates
                match self
                    .store
                    .commit(&key, &envelope.event_type, &envelope.service)
                    .await
                {
                    Ok(()) => {
                        debug!(
                            queue = %self.config.queue,
                            event_type = %envelope.event_type,
                            trace_id = %envelope.trace_id,
                            "Message handled"
                        );
                        report.success += 1;
                        self.metrics.record(&self.config.queue, Outcome::Success);
                        self.ack_quietly(&message).await;
                    }
                    Err(e) => {
                        warn!(
                            queue = %self.config.queue,
                            error = %e,
                            "Commit failed, leaving message for redelivery"
                        );
                        report.transient_errors += 1;
                        self.metrics.record(&self.config.queue, Outcome::TransientError);
                        self.store.release(&key).await;
                    }
                }
            }
            Err(listener_error) => {
                self.store.release(&key).await;
                self.handle_dispatch_failure(&message, &envelope, listener_error, report)
                    .await;
            }
        }
    }

    async fn handle_dispatch_failure(
        &self,
        message: &ReceivedMessage,
        envelope: &Envelope,
        listener_error: ListenerError,
        report: &mut CycleReport,
    ) {
        match classify(&listener_error) {
            ErrorClass::Transient => {
                if let ListenerError::Other(_) = &listener_error {
                    if matches_transient_heuristics(&listener_error.to_string()) {
                        debug!("Opaque error matched transient heuristics");
                    } else {
                        debug!("Unknown error kind, treating as transient");
                    }
                }
                warn!(
                    queue = %self.config.queue,
                    event_type = %envelope.event_type,
                    kind = listener_error.kind(),
                    error = %listener_error,
                    receive_count = message.receive_count,
                    "Transient failure, leaving message for redelivery"
                );
                report.transient_errors += 1;
                self.metrics.record(&self.config.queue, Outcome::TransientError);
                // LEAVE: no ack, visibility expiry returns the message
            }
            ErrorClass::Permanent => {
                error!(
                    queue = %self.config.queue,
                    event_type = %envelope.event_type,
                    kind = listener_error.kind(),
                    error = %listener_error,
                    "Permanent failure, discarding message"
                );
                report.permanent_errors += 1;
                self.metrics.record(&self.config.queue, Outcome::PermanentError);
                self.alert_permanent(envelope, &listener_error).await;
                self.ack_quietly(message).await;
            }
        }
    }

    /// Rate alerting over the cycle's batch.
    async fn check_rates(&self, report: &mut CycleReport) {
        let total = report.processed as f64;
        if total == 0.0 {
            return;
        }

        let validation_rate = report.validation_errors as f64 / total;
        if validation_rate > self.config.validation_error_rate_threshold {
            self.fire_rate_alert(
                "Validation error rate exceeded",
                "validation_errors",
                report.validation_errors,
                report.processed,
                validation_rate,
                self.config.validation_error_rate_threshold,
            )
            .await;
            report.alerts_fired += 1;
        }

        let transient_rate = report.transient_errors as f64 / total;
        if transient_rate > self.config.transient_error_rate_threshold {
            self.fire_rate_alert(
                "Transient error rate exceeded",
                "transient_errors",
                report.transient_errors,
                report.processed,
                transient_rate,
                self.config.transient_error_rate_threshold,
            )
            .await;
            report.alerts_fired += 1;
        }
    }

    async fn fire_rate_alert(
        &self,
        title: &str,
        counter: &str,
        count: u64,
        total: u64,
        rate: f64,
        threshold: f64,
    ) {
        let alert = Alert::new(
            Severity::Error,
            title,
            format!(
                "{count} of {total} messages on {} ({:.1}%, threshold {:.1}%)",
                self.config.queue,
                rate * 100.0,
                threshold * 100.0
            ),
            "consumer-cycle",
        )
        .with_context(json!({
            "queue": self.config.queue,
            (counter): count,
            "total_processed": total,
            "rate_percent": rate * 100.0,
            "threshold_percent": threshold * 100.0,
        }));
        self.notifier.notify(&alert).await;
    }

    async fn alert_unmapped(&self, envelope: &Envelope) {
        let alert = Alert::critical(
            "Unmapped event type",
            format!(
                "No listener is mapped for event type '{}' on {}",
                envelope.event_type, self.config.queue
            ),
            "consumer-cycle",
        )
        .with_context(json!({
            "queue": self.config.queue,
            "event_type": envelope.event_type,
            "trace_id": envelope.trace_id,
        }));
        self.notifier.notify(&alert).await;
    }

    async fn alert_permanent(&self, envelope: &Envelope, error: &ListenerError) {
        let alert = Alert::critical(
            "Permanent consume failure",
            format!(
                "Listener for '{}' failed permanently: {error}",
                envelope.event_type
            ),
            "consumer-cycle",
        )
        .with_context(json!({
            "queue": self.config.queue,
            "event_type": envelope.event_type,
            "error_kind": error.kind(),
            "trace_id": envelope.trace_id,
        }));
        self.notifier.notify(&alert).await;
    }

    /// Ack failures are logged, not propagated: the message will simply be
    /// redelivered and deduplicated.
    async fn ack_quietly(&self, message: &ReceivedMessage) {
        if let Err(e) = self.source.ack(&message.receipt_handle).await {
            warn!(
                queue = %self.config.queue,
                error = %e,
                "Failed to ack message"
            );
        }
    }
}
