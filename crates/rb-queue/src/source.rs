//! SQS queue source: long-poll receive, ack, visibility management.

use async_trait::async_trait;
use aws_sdk_sqs::types::{Message as SqsMessage, MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use chrono::DateTime;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use rb_common::ReceivedMessage;

use crate::{DepthSnapshot, QueueError, QueueSource, Result, RECEIVE_BATCH_MAX};

pub struct SqsQueueSource {
    client: Client,
    queue_url: String,
    queue_name: String,
    visibility_timeout_seconds: i32,
    wait_time_seconds: i32,
    total_polled: AtomicU64,
    total_acked: AtomicU64,
}

impl SqsQueueSource {
    pub fn new(
        client: Client,
        queue_url: String,
        queue_name: String,
        visibility_timeout_seconds: u32,
    ) -> Self {
        Self {
            client,
            queue_url,
            queue_name,
            visibility_timeout_seconds: visibility_timeout_seconds as i32,
            wait_time_seconds: 20,
            total_polled: AtomicU64::new(0),
            total_acked: AtomicU64::new(0),
        }
    }

    /// Set the long poll wait time in seconds (transport max 20).
    /// DLQ tooling peeks with wait 0.
    pub fn with_wait_time_seconds(mut self, seconds: u32) -> Self {
        self.wait_time_seconds = (seconds as i32).clamp(0, 20);
        self
    }

    fn to_received(&self, sqs_msg: SqsMessage) -> Option<ReceivedMessage> {
        let body = sqs_msg.body().map(str::to_string)?;
        let receipt_handle = sqs_msg.receipt_handle().map(str::to_string)?;
        let broker_message_id = sqs_msg.message_id().map(str::to_string);

        let receive_count = sqs_msg
            .attributes()
            .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1);

        let sent_at = sqs_msg
            .attributes()
            .and_then(|attrs| attrs.get(&MessageSystemAttributeName::SentTimestamp))
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis);

        Some(ReceivedMessage {
            body,
            receipt_handle,
            broker_message_id,
            queue: self.queue_name.clone(),
            receive_count,
            sent_at,
        })
    }
}

#[async_trait]
impl QueueSource for SqsQueueSource {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<ReceivedMessage>> {
        let result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.min(RECEIVE_BATCH_MAX) as i32)
            .visibility_timeout(self.visibility_timeout_seconds)
            .wait_time_seconds(self.wait_time_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let messages: Vec<ReceivedMessage> = result
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| self.to_received(m))
            .collect();

        if !messages.is_empty() {
            self.total_polled
                .fetch_add(messages.len() as u64, Ordering::Relaxed);
            debug!(
                queue = %self.queue_name,
                count = messages.len(),
                "Polled messages from SQS"
            );
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        self.total_acked.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %self.queue_name, "Message acknowledged");
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        debug!(queue = %self.queue_name, seconds = seconds, "Visibility extended");
        Ok(())
    }

    async fn depth(&self) -> Result<DepthSnapshot> {
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let attributes = result.attributes();

        let visible = attributes
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let in_flight = attributes
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(DepthSnapshot {
            queue: self.queue_name.clone(),
            visible,
            in_flight,
        })
    }
}
