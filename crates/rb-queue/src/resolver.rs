//! Queue resolver: logical queue name to transport URL, creating the queue
//! and its DLQ on first use.
//!
//! Remote naming convention: `{prefix}-{logical}` with a `-dlq` sibling.
//! Monitoring, replay and the redrive policy all assume this convention.

use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::{QueueError, Result};

/// Resolved URL cache lifetime
const URL_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Queue attributes applied on creation
const VISIBILITY_TIMEOUT: &str = "30";
const RECEIVE_WAIT_TIME: &str = "20";
/// 14 days, main queue and DLQ alike
const MESSAGE_RETENTION: &str = "1209600";
/// Redeliveries before the transport promotes a message to the DLQ
const MAX_RECEIVE_COUNT: &str = "5";

struct CachedUrl {
    url: String,
    resolved_at: Instant,
}

pub struct QueueResolver {
    client: Client,
    prefix: String,
    cache: Mutex<HashMap<String, CachedUrl>>,
}

impl QueueResolver {
    pub fn new(client: Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Remote name for a logical queue
    pub fn effective_name(&self, logical: &str) -> String {
        format!("{}-{}", self.prefix, logical)
    }

    /// Remote name of the sibling DLQ
    pub fn dlq_name(&self, logical: &str) -> String {
        format!("{}-{}-dlq", self.prefix, logical)
    }

    /// Resolve a logical queue name to its URL, creating queue + DLQ when the
    /// queue does not exist yet. Cache-through with a 30-day TTL.
    pub async fn resolve(&self, logical: &str) -> Result<String> {
        if let Some(url) = self.cached(logical) {
            return Ok(url);
        }

        let effective = self.effective_name(logical);
        let url = match self.lookup_url(&effective).await? {
            Some(url) => url,
            None => {
                info!(queue = %effective, "Queue does not exist, creating with DLQ");
                self.create_queue(logical).await?
            }
        };

        self.cache.lock().insert(
            logical.to_string(),
            CachedUrl {
                url: url.clone(),
                resolved_at: Instant::now(),
            },
        );

        Ok(url)
    }

    /// Pure existence check: never creates. Conservatively false on any
    /// lookup error.
    pub async fn queue_exists(&self, logical: &str) -> bool {
        let effective = self.effective_name(logical);
        matches!(self.lookup_url(&effective).await, Ok(Some(_)))
    }

    /// URL of an existing queue; never creates.
    pub async fn url_if_exists(&self, logical: &str) -> Result<Option<String>> {
        let effective = self.effective_name(logical);
        self.lookup_url(&effective).await
    }

    /// URL of an existing DLQ; never creates.
    pub async fn dlq_url(&self, logical: &str) -> Result<String> {
        let name = self.dlq_name(logical);
        self.lookup_url(&name)
            .await?
            .ok_or(QueueError::QueueMissing(name))
    }

    fn cached(&self, logical: &str) -> Option<String> {
        let cache = self.cache.lock();
        cache
            .get(logical)
            .filter(|entry| entry.resolved_at.elapsed() < URL_CACHE_TTL)
            .map(|entry| entry.url.clone())
    }

    /// `GetQueueUrl`, mapping the transport's non-existent error to `None`.
    async fn lookup_url(&self, remote_name: &str) -> Result<Option<String>> {
        match self
            .client
            .get_queue_url()
            .queue_name(remote_name)
            .send()
            .await
        {
            Ok(out) => Ok(out.queue_url().map(str::to_string)),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_queue_does_not_exist() {
                    Ok(None)
                } else {
                    Err(QueueError::Sqs(service_err.to_string()))
                }
            }
        }
    }

    /// Create the DLQ first, then the main queue with a redrive policy
    /// pointing at it. Creation is idempotent by name, so a partial failure
    /// is safe to retry.
    async fn create_queue(&self, logical: &str) -> Result<String> {
        let dlq_name = self.dlq_name(logical);
        let dlq = self
            .client
            .create_queue()
            .queue_name(&dlq_name)
            .attributes(QueueAttributeName::MessageRetentionPeriod, MESSAGE_RETENTION)
            .send()
            .await
            .map_err(|e| QueueError::Creation(format!("create DLQ {dlq_name}: {e}")))?;

        let dlq_url = dlq
            .queue_url()
            .ok_or_else(|| QueueError::Creation(format!("no URL returned for {dlq_name}")))?;

        let dlq_attrs = self
            .client
            .get_queue_attributes()
            .queue_url(dlq_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| QueueError::Creation(format!("read ARN of {dlq_name}: {e}")))?;

        let dlq_arn = dlq_attrs
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
            .ok_or_else(|| QueueError::Creation(format!("no ARN returned for {dlq_name}")))?;

        let redrive_policy = serde_json::json!({
            "deadLetterTargetArn": dlq_arn,
            "maxReceiveCount": MAX_RECEIVE_COUNT,
        })
        .to_string();

        let effective = self.effective_name(logical);
        let main = self
            .client
            .create_queue()
            .queue_name(&effective)
            .attributes(QueueAttributeName::VisibilityTimeout, VISIBILITY_TIMEOUT)
            .attributes(QueueAttributeName::ReceiveMessageWaitTimeSeconds, RECEIVE_WAIT_TIME)
            .attributes(QueueAttributeName::MessageRetentionPeriod, MESSAGE_RETENTION)
            .attributes(QueueAttributeName::RedrivePolicy, redrive_policy)
            .send()
            .await
            .map_err(|e| QueueError::Creation(format!("create queue {effective}: {e}")))?;

        let url = main
            .queue_url()
            .ok_or_else(|| QueueError::Creation(format!("no URL returned for {effective}")))?
            .to_string();

        info!(queue = %effective, dlq = %dlq_name, "Queue created");
        debug!(queue = %effective, url = %url, "Queue URL resolved");

        Ok(url)
    }
}
