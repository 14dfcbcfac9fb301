//! DLQ tooling: inspect, replay, monitor.
//!
//! All three operate on the `{prefix}-{logical}-dlq` sibling of a main
//! queue, over the same received-message model the consumer uses.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use rb_alert::Notifier;
use rb_common::{Alert, Envelope};
use rb_queue::{EventPublisher, QueueSource, Result, RECEIVE_BATCH_MAX};

/// One message observed in a DLQ
#[derive(Debug, Clone)]
pub struct DlqEntry {
    /// Envelope fields, when the body decodes
    pub event_type: Option<String>,
    pub trace_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub payload: Option<Value>,
    pub receive_count: u32,
    pub sent_at: Option<DateTime<Utc>>,
    pub body: String,
}

impl DlqEntry {
    pub fn is_valid_envelope(&self) -> bool {
        self.event_type.is_some()
    }
}

/// Peek up to `limit` messages without consuming them. Received messages
/// stay in the DLQ; visibility expiry returns them shortly.
pub async fn inspect(dlq: &dyn QueueSource, limit: u32) -> Result<Vec<DlqEntry>> {
    let mut entries = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    'outer: while (entries.len() as u32) < limit {
        let batch = dlq
            .poll((limit - entries.len() as u32).min(RECEIVE_BATCH_MAX))
            .await?;
        if batch.is_empty() {
            break;
        }

        for message in batch {
            // a repeated broker id means we wrapped around the queue
            if let Some(id) = &message.broker_message_id {
                if !seen.insert(id.clone()) {
                    break 'outer;
                }
            }

            let envelope = Envelope::from_body(&message.body).ok();
            entries.push(DlqEntry {
                event_type: envelope.as_ref().map(|e| e.event_type.clone()),
                trace_id: envelope.as_ref().map(|e| e.trace_id.clone()),
                idempotency_key: envelope.as_ref().map(|e| e.idempotency_key.clone()),
                payload: envelope.map(|e| e.payload),
                receive_count: message.receive_count,
                sent_at: message.sent_at,
                body: message.body,
            });
        }
    }

    info!(queue = dlq.identifier(), count = entries.len(), "DLQ inspected");
    Ok(entries)
}

/// Outcome of a replay run
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    /// Messages republished to the main queue and removed from the DLQ
    pub replayed: u64,
    /// Undecodable messages removed from the DLQ
    pub failed: u64,
}

/// Move up to `limit` messages back to the main queue: decode, republish
/// the original event type and payload, then delete from the DLQ. Messages
/// that are not valid envelopes are deleted and counted as failed.
pub async fn replay(
    dlq: &dyn QueueSource,
    publisher: &dyn EventPublisher,
    main_queue: &str,
    limit: u32,
) -> Result<ReplayReport> {
    let mut report = ReplayReport::default();

    while report.replayed + report.failed < limit as u64 {
        let remaining = limit as u64 - report.replayed - report.failed;
        let batch = dlq
            .poll((remaining as u32).min(RECEIVE_BATCH_MAX))
            .await?;
        if batch.is_empty() {
            break;
        }

        for message in batch {
            match Envelope::from_body(&message.body) {
                Ok(envelope) => {
                    publisher
                        .publish(
                            main_queue,
                            &envelope.event_type,
                            envelope.payload,
                            &BTreeMap::new(),
                        )
                        .await?;
                    dlq.ack(&message.receipt_handle).await?;
                    report.replayed += 1;
                    info!(
                        queue = dlq.identifier(),
                        event_type = %envelope.event_type,
                        trace_id = %envelope.trace_id,
                        "DLQ message replayed"
                    );
                }
                Err(e) => {
                    warn!(
                        queue = dlq.identifier(),
                        error = %e,
                        "Deleting undecodable DLQ message"
                    );
                    dlq.ack(&message.receipt_handle).await?;
                    report.failed += 1;
                }
            }
        }
    }

    info!(
        queue = dlq.identifier(),
        replayed = report.replayed,
        failed = report.failed,
        "Replay complete"
    );
    Ok(report)
}

/// Depth monitor: CRITICAL alert when a DLQ holds more messages than the
/// configured threshold.
pub struct DlqMonitor {
    notifier: Arc<dyn Notifier>,
    alert_threshold: u64,
}

impl DlqMonitor {
    pub fn new(notifier: Arc<dyn Notifier>, alert_threshold: u64) -> Self {
        Self {
            notifier,
            alert_threshold,
        }
    }

    /// Check one DLQ; returns true when an alert fired.
    pub async fn check(&self, logical_queue: &str, dlq: &dyn QueueSource) -> Result<bool> {
        let depth = dlq.depth().await?;
        let total = depth.visible + depth.in_flight;

        if total <= self.alert_threshold {
            info!(
                queue = %logical_queue,
                depth = total,
                threshold = self.alert_threshold,
                "DLQ depth within threshold"
            );
            return Ok(false);
        }

        warn!(
            queue = %logical_queue,
            depth = total,
            threshold = self.alert_threshold,
            "DLQ depth exceeds threshold"
        );

        let alert = Alert::critical(
            "DLQ depth exceeded",
            format!(
                "DLQ for {logical_queue} holds {total} messages (threshold {})",
                self.alert_threshold
            ),
            "monitor-dlq",
        )
        .with_context(json!({
            "queue": logical_queue,
            "dlq": dlq.identifier(),
            "depth": total,
            "threshold": self.alert_threshold,
        }));
        self.notifier.notify(&alert).await;

        Ok(true)
    }
}
