use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use rb_common::{Envelope, ReceivedMessage};

pub mod error;
pub mod mock;
pub mod publisher;
pub mod resolver;
pub mod router;
pub mod source;

pub use error::QueueError;
pub use mock::InMemoryQueue;
pub use publisher::SqsPublisher;
pub use resolver::QueueResolver;
pub use router::{
    DriverLeg, HttpLegacyDriver, MessagingConfig, MessagingService, PrimaryDriver,
    PublishReceipt, QueueExistenceProbe, TargetTable,
};
pub use source::SqsQueueSource;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Transport bound on messages per receive request
pub const RECEIVE_BATCH_MAX: u32 = 10;

/// Transport bound on entries per batch send request
pub const SEND_BATCH_MAX: usize = 10;

/// Approximate queue depth for monitoring
#[derive(Debug, Clone, Default)]
pub struct DepthSnapshot {
    pub queue: String,
    /// Messages visible (pending delivery)
    pub visible: u64,
    /// Messages currently in flight (received, not yet acked)
    pub in_flight: u64,
}

/// Trait for consuming messages from one queue.
///
/// `poll` returns raw bodies: envelope decoding belongs to the consumer
/// cycle so malformed messages are classified there, not dropped by the
/// transport.
#[async_trait]
pub trait QueueSource: Send + Sync {
    /// Queue identifier (remote queue name)
    fn identifier(&self) -> &str;

    /// Receive up to `max_messages` messages
    async fn poll(&self, max_messages: u32) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledge (delete) a message so it is never redelivered
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Extend the visibility timeout for an in-flight message
    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()>;

    /// Approximate queue depth
    async fn depth(&self) -> Result<DepthSnapshot>;
}

/// One entry of a batch publish call
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub event_type: String,
    pub payload: Value,
    pub attributes: BTreeMap<String, String>,
}

/// Per-entry outcome of a batch publish
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Message ids of accepted entries
    pub successful: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone)]
pub struct BatchFailure {
    /// Index into the submitted entries
    pub index: usize,
    pub reason: String,
}

/// Trait for publishing events to a logical queue
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Wrap the payload in an envelope and enqueue it; returns the broker
    /// message id
    async fn publish(
        &self,
        logical_queue: &str,
        event_type: &str,
        payload: Value,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String>;

    /// Enqueue an already-wrapped envelope (dual-write publishes one envelope
    /// on both drivers)
    async fn publish_envelope(
        &self,
        logical_queue: &str,
        envelope: &Envelope,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String>;

    /// Publish a batch, bounded by the transport's per-request limit
    async fn publish_batch(
        &self,
        logical_queue: &str,
        entries: Vec<BatchEntry>,
    ) -> Result<BatchOutcome>;
}

/// The opaque secondary transport. Wire protocol is not this crate's
/// concern: anything that can take an envelope and report availability fits.
#[async_trait]
pub trait LegacyDriver: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> Result<String>;

    async fn is_available(&self) -> bool;
}
