//! SQS publisher: wraps payloads in envelopes and enqueues them on resolved
//! queues, mirroring the envelope's event type as a message attribute.

use async_trait::async_trait;
use aws_sdk_sqs::types::{MessageAttributeValue, SendMessageBatchRequestEntry};
use aws_sdk_sqs::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

use rb_common::Envelope;

use crate::{
    BatchEntry, BatchFailure, BatchOutcome, EventPublisher, QueueError, QueueResolver, Result,
    SEND_BATCH_MAX,
};

/// Message attribute mirroring the envelope's `event_type`
pub const EVENT_TYPE_ATTRIBUTE: &str = "EventType";

pub struct SqsPublisher {
    client: Client,
    resolver: Arc<QueueResolver>,
    /// Origin service stamped on every envelope
    service: String,
}

impl SqsPublisher {
    pub fn new(client: Client, resolver: Arc<QueueResolver>, service: impl Into<String>) -> Self {
        Self {
            client,
            resolver,
            service: service.into(),
        }
    }

    pub fn resolver(&self) -> &Arc<QueueResolver> {
        &self.resolver
    }

    fn string_attribute(value: &str) -> Result<MessageAttributeValue> {
        MessageAttributeValue::builder()
            .data_type("String")
            .string_value(value)
            .build()
            .map_err(|e| QueueError::Sqs(e.to_string()))
    }
}

#[async_trait]
impl EventPublisher for SqsPublisher {
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
        logical_queue: &str,
        envelope: &Envelope,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String> {
        let queue_url = self.resolver.resolve(logical_queue).await?;
        let body = serde_json::to_string(envelope)?;

        let mut request = self
            .client
            .send_message()
            .queue_url(&queue_url)
            .message_body(body)
            .message_attributes(
                EVENT_TYPE_ATTRIBUTE,
                Self::string_attribute(&envelope.event_type)?,
            );

        for (name, value) in attributes {
            request = request.message_attributes(name, Self::string_attribute(value)?);
        }

        let result = request.send().await.map_err(|e| {
            error!(
                queue = %logical_queue,
                event_type = %envelope.event_type,
                error = %e,
                "Failed to publish event"
            );
            QueueError::Sqs(e.to_string())
        })?;

        let message_id = result
            .message_id()
            .ok_or_else(|| QueueError::Publish("no message id returned".to_string()))?
            .to_string();

        debug!(
            queue = %logical_queue,
            event_type = %envelope.event_type,
            message_id = %message_id,
            trace_id = %envelope.trace_id,
            "Event published"
        );

        Ok(message_id)
    }

    async fn publish_batch(
        &self,
        logical_queue: &str,
        entries: Vec<BatchEntry>,
    ) -> Result<BatchOutcome> {
        let queue_url = self.resolver.resolve(logical_queue).await?;
        let mut outcome = BatchOutcome::default();

        for (chunk_index, chunk) in entries.chunks(SEND_BATCH_MAX).enumerate() {
            let base = chunk_index * SEND_BATCH_MAX;
            let mut request = self.client.send_message_batch().queue_url(&queue_url);

            for (offset, entry) in chunk.iter().enumerate() {
                let envelope = Envelope::wrap(&entry.event_type, entry.payload.clone(), &self.service);
                let body = serde_json::to_string(&envelope)?;

                let mut batch_entry = SendMessageBatchRequestEntry::builder()
                    .id((base + offset).to_string())
                    .message_body(body)
                    .message_attributes(
                        EVENT_TYPE_ATTRIBUTE,
                        Self::string_attribute(&envelope.event_type)?,
                    );

                for (name, value) in &entry.attributes {
                    batch_entry =
                        batch_entry.message_attributes(name, Self::string_attribute(value)?);
                }

                request = request.entries(
                    batch_entry
                        .build()
                        .map_err(|e| QueueError::Sqs(e.to_string()))?,
                );
            }

            let result = request.send().await.map_err(|e| {
                error!(queue = %logical_queue, error = %e, "Batch publish failed");
                QueueError::Sqs(e.to_string())
            })?;

            for ok in result.successful() {
                outcome.successful.push(ok.message_id().to_string());
            }
            for failed in result.failed() {
                outcome.failed.push(BatchFailure {
                    index: failed.id().parse().unwrap_or(base),
                    reason: failed.message().unwrap_or("unknown").to_string(),
                });
            }
        }

        debug!(
            queue = %logical_queue,
            successful = outcome.successful.len(),
            failed = outcome.failed.len(),
            "Batch publish complete"
        );

        Ok(outcome)
    }
}
