//! In-memory transport for tests and dev mode.
//!
//! Models the queue semantics the consumer cycle depends on: receive counts,
//! redelivery of unacked messages, and promotion to an attached DLQ once the
//! receive count exceeds the redrive limit. Visibility timeouts are treated
//! as already expired: an unacked message is redeliverable on the next poll.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

use rb_common::{Envelope, ReceivedMessage};

use crate::{
    BatchEntry, BatchOutcome, DepthSnapshot, EventPublisher, QueueSource, Result,
};

struct StoredMessage {
    seq: u64,
    body: String,
    receive_count: u32,
    sent_at: chrono::DateTime<Utc>,
    receipt: Option<String>,
}

#[derive(Default)]
struct State {
    messages: VecDeque<StoredMessage>,
    next_seq: u64,
}

/// One in-memory queue. As a publisher it ignores the logical queue name:
/// the instance is the queue.
pub struct InMemoryQueue {
    name: String,
    service: String,
    max_receive_count: u32,
    dlq: Option<Arc<InMemoryQueue>>,
    state: Mutex<State>,
    extensions: std::sync::atomic::AtomicU64,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            service: "test".to_string(),
            max_receive_count: u32::MAX,
            dlq: None,
            state: Mutex::new(State::default()),
            extensions: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Queue with a redrive limit and an attached DLQ.
    pub fn with_dlq(
        name: impl Into<String>,
        max_receive_count: u32,
        dlq: Arc<InMemoryQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            service: "test".to_string(),
            max_receive_count,
            dlq: Some(dlq),
            state: Mutex::new(State::default()),
            extensions: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Number of visibility extensions requested, for test assertions.
    pub fn extensions(&self) -> u64 {
        self.extensions.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Enqueue a raw wire body.
    pub fn push_raw(&self, body: impl Into<String>) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.messages.push_back(StoredMessage {
            seq,
            body: body.into(),
            receive_count: 0,
            sent_at: Utc::now(),
            receipt: None,
        });
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current message bodies, oldest first.
    pub fn bodies(&self) -> Vec<String> {
        self.state
            .lock()
            .messages
            .iter()
            .map(|m| m.body.clone())
            .collect()
    }
}

#[async_trait]
impl QueueSource for InMemoryQueue {
    fn identifier(&self) -> &str {
        &self.name
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<ReceivedMessage>> {
        let mut delivered = Vec::new();
        let mut promoted = Vec::new();

        {
            let mut state = self.state.lock();
            let mut remaining = VecDeque::new();

            while let Some(mut msg) = state.messages.pop_front() {
                if delivered.len() as u32 >= max_messages {
                    remaining.push_back(msg);
                    continue;
                }

                msg.receive_count += 1;
                if msg.receive_count > self.max_receive_count {
                    promoted.push(msg.body);
                    continue;
                }

                let receipt = format!("{}-{}", msg.seq, uuid::Uuid::new_v4());
                msg.receipt = Some(receipt.clone());
                delivered.push(ReceivedMessage {
                    body: msg.body.clone(),
                    receipt_handle: receipt,
                    broker_message_id: Some(msg.seq.to_string()),
                    queue: self.name.clone(),
                    receive_count: msg.receive_count,
                    sent_at: Some(msg.sent_at),
                });
                remaining.push_back(msg);
            }

            state.messages = remaining;
        }

        if let Some(dlq) = &self.dlq {
            for body in promoted {
                debug!(queue = %self.name, "Message exceeded receive limit, moving to DLQ");
                dlq.push_raw(body);
            }
        }

        Ok(delivered)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .messages
            .retain(|m| m.receipt.as_deref() != Some(receipt_handle));
        Ok(())
    }

    async fn extend_visibility(&self, _receipt_handle: &str, _seconds: u32) -> Result<()> {
        self.extensions
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    async fn depth(&self) -> Result<DepthSnapshot> {
        Ok(DepthSnapshot {
            queue: self.name.clone(),
            visible: self.len() as u64,
            in_flight: 0,
        })
    }
}

#[async_trait]
impl EventPublisher for InMemoryQueue {
    async fn publish(
        &self,
        logical_queue: &str,
        event_type: &str,
        payload: Value,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String> {
        let envelope = Envelope::wrap(event_type, payload, &self.service);
        self.publish_envelope(logical_queue, &envelope, attributes)
            .await
    }

    async fn publish_envelope(
        &self,
        _logical_queue: &str,
        envelope: &Envelope,
        _attributes: &BTreeMap<String, String>,
    ) -> Result<String> {
        self.push_raw(serde_json::to_string(envelope)?);
        Ok(envelope.trace_id.clone())
    }

    async fn publish_batch(
        &self,
        logical_queue: &str,
        entries: Vec<BatchEntry>,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for entry in entries {
            let id = self
                .publish(logical_queue, &entry.event_type, entry.payload, &entry.attributes)
                .await?;
            outcome.successful.push(id);
        }
        Ok(outcome)
    }
}
