//! Driver routing: primary selection, dual-write, and legacy fallback.
//!
//! Drivers are a closed set (managed cloud queue, opaque legacy transport).
//! The router is a decision procedure over configuration, evaluated in order:
//! dual-write, queue-absence pre-check, primary attempt with failure
//! fallback.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use rb_common::Envelope;

use crate::{EventPublisher, LegacyDriver, QueueError, QueueResolver, Result};

/// Primary transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryDriver {
    Managed,
    Legacy,
}

/// Router policy knobs
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    pub driver: PrimaryDriver,
    /// Publish on both drivers on every call
    pub dual_write: bool,
    /// Fall back to legacy on managed failure or target-queue absence
    pub fallback_to_legacy: bool,
    /// Origin service stamped on envelopes
    pub service: String,
}

/// Static `event_type -> logical queue` routing table with a default
#[derive(Debug, Clone)]
pub struct TargetTable {
    default: String,
    events: HashMap<String, String>,
}

impl TargetTable {
    pub fn new(default: impl Into<String>, events: HashMap<String, String>) -> Self {
        Self {
            default: default.into(),
            events,
        }
    }

    /// Pure lookup over the configured table.
    pub fn for_event(&self, event_type: &str) -> &str {
        self.events
            .get(event_type)
            .map(String::as_str)
            .unwrap_or(&self.default)
    }
}

/// Existence probe used by the fallback pre-check. Never creates.
#[async_trait]
pub trait QueueExistenceProbe: Send + Sync {
    async fn queue_exists(&self, logical: &str) -> bool;
}

#[async_trait]
impl QueueExistenceProbe for QueueResolver {
    async fn queue_exists(&self, logical: &str) -> bool {
        QueueResolver::queue_exists(self, logical).await
    }
}

/// Which driver produced the returned result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverLeg {
    Managed,
    Legacy,
}

/// Outcome of a routed publish, recording per-leg message ids
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub driver: DriverLeg,
    pub managed_message_id: Option<String>,
    pub legacy_message_id: Option<String>,
    pub idempotency_key: String,
    pub trace_id: String,
}

impl PublishReceipt {
    /// The broker message id: managed leg if present, else legacy.
    pub fn message_id(&self) -> Option<&str> {
        self.managed_message_id
            .as_deref()
            .or(self.legacy_message_id.as_deref())
    }
}

pub struct MessagingService {
    config: MessagingConfig,
    managed: Arc<dyn EventPublisher>,
    probe: Arc<dyn QueueExistenceProbe>,
    legacy: Option<Arc<dyn LegacyDriver>>,
    targets: TargetTable,
}

impl MessagingService {
    pub fn new(
        config: MessagingConfig,
        managed: Arc<dyn EventPublisher>,
        probe: Arc<dyn QueueExistenceProbe>,
        legacy: Option<Arc<dyn LegacyDriver>>,
        targets: TargetTable,
    ) -> Self {
        Self {
            config,
            managed,
            probe,
            legacy,
            targets,
        }
    }

    pub fn target_for(&self, event_type: &str) -> &str {
        self.targets.for_event(event_type)
    }

    /// Publish one event under the configured policy.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: Value,
        attributes: &BTreeMap<String, String>,
    ) -> Result<PublishReceipt> {
        let target = self.targets.for_event(event_type).to_string();
        let envelope = Envelope::wrap(event_type, payload, &self.config.service);

        // Dual write: both legs run, per-leg failures are logged, the call
        // succeeds if at least one leg did.
        if self.config.driver == PrimaryDriver::Managed && self.config.dual_write {
            if let Some(legacy) = &self.legacy {
                return self
                    .dual_write(&target, &envelope, attributes, legacy.clone())
                    .await;
            }
        }

        // Fallback pre-check: with an available legacy driver, a missing
        // target queue routes the publish to legacy instead of triggering
        // the managed driver's lazy create. Used during cross-service
        // migration.
        if self.config.driver == PrimaryDriver::Managed && self.config.fallback_to_legacy {
            if let Some(legacy) = &self.legacy {
                if legacy.is_available().await && !self.probe.queue_exists(&target).await {
                    info!(
                        queue = %target,
                        event_type = %event_type,
                        "Target queue absent, publishing on legacy driver"
                    );
                    let legacy_id = legacy.publish(&envelope).await?;
                    return Ok(Self::legacy_receipt(&envelope, legacy_id));
                }
            }
        }

        // Primary attempt
        match self.config.driver {
            PrimaryDriver::Managed => {
                match self
                    .managed
                    .publish_envelope(&target, &envelope, attributes)
                    .await
                {
                    Ok(message_id) => Ok(Self::managed_receipt(&envelope, message_id)),
                    Err(e) => {
                        if self.config.fallback_to_legacy {
                            if let Some(legacy) = &self.legacy {
                                warn!(
                                    event_type = %event_type,
                                    error = %e,
                                    "Managed publish failed, falling back to legacy driver"
                                );
                                let legacy_id = legacy.publish(&envelope).await?;
                                return Ok(Self::legacy_receipt(&envelope, legacy_id));
                            }
                        }
                        Err(e)
                    }
                }
            }
            PrimaryDriver::Legacy => {
                let legacy = self.legacy.as_ref().ok_or_else(|| {
                    QueueError::Config("legacy driver selected but not registered".to_string())
                })?;
                let legacy_id = legacy.publish(&envelope).await?;
                Ok(Self::legacy_receipt(&envelope, legacy_id))
            }
        }
    }

    async fn dual_write(
        &self,
        target: &str,
        envelope: &Envelope,
        attributes: &BTreeMap<String, String>,
        legacy: Arc<dyn LegacyDriver>,
    ) -> Result<PublishReceipt> {
        let managed_id = match self
            .managed
            .publish_envelope(target, envelope, attributes)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(
                    event_type = %envelope.event_type,
                    error = %e,
                    "Dual-write managed leg failed"
                );
                None
            }
        };

        let legacy_id = match legacy.publish(envelope).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(
                    event_type = %envelope.event_type,
                    error = %e,
                    "Dual-write legacy leg failed"
                );
                None
            }
        };

        if managed_id.is_none() && legacy_id.is_none() {
            return Err(QueueError::Publish(
                "dual-write failed on both drivers".to_string(),
            ));
        }

        Ok(PublishReceipt {
            driver: if managed_id.is_some() {
                DriverLeg::Managed
            } else {
                DriverLeg::Legacy
            },
            managed_message_id: managed_id,
            legacy_message_id: legacy_id,
            idempotency_key: envelope.idempotency_key.clone(),
            trace_id: envelope.trace_id.clone(),
        })
    }

    fn managed_receipt(envelope: &Envelope, message_id: String) -> PublishReceipt {
        PublishReceipt {
            driver: DriverLeg::Managed,
            managed_message_id: Some(message_id),
            legacy_message_id: None,
            idempotency_key: envelope.idempotency_key.clone(),
            trace_id: envelope.trace_id.clone(),
        }
    }

    fn legacy_receipt(envelope: &Envelope, message_id: String) -> PublishReceipt {
        PublishReceipt {
            driver: DriverLeg::Legacy,
            managed_message_id: None,
            legacy_message_id: Some(message_id),
            idempotency_key: envelope.idempotency_key.clone(),
            trace_id: envelope.trace_id.clone(),
        }
    }
}

/// Reference legacy driver: posts the envelope JSON to a configured HTTP
/// endpoint. Availability is a configuration probe, not a network call.
pub struct HttpLegacyDriver {
    client: reqwest::Client,
    endpoint_url: String,
}

impl HttpLegacyDriver {
    pub fn new(endpoint_url: impl Into<String>, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| QueueError::Legacy(e.to_string()))?;
        Ok(Self {
            client,
            endpoint_url: endpoint_url.into(),
        })
    }
}

#[async_trait]
impl LegacyDriver for HttpLegacyDriver {
    async fn publish(&self, envelope: &Envelope) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint_url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| QueueError::Legacy(e.to_string()))?;

        if !response.status().is_success() {
            return Err(QueueError::Legacy(format!(
                "legacy endpoint returned {}",
                response.status()
            )));
        }

        // The legacy endpoint may return {"message_id": ...}; fall back to
        // the trace id when it does not.
        let message_id = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("message_id").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| envelope.trace_id.clone());

        Ok(message_id)
    }

    async fn is_available(&self) -> bool {
        !self.endpoint_url.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BatchEntry, BatchOutcome};
    use parking_lot::Mutex;
    use serde_json::json;

    struct FakeManaged {
        fail: bool,
        published: Mutex<Vec<(String, String)>>,
    }

    impl FakeManaged {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                published: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl EventPublisher for FakeManaged {
        async fn publish(
            &self,
            logical_queue: &str,
            event_type: &str,
            payload: Value,
            attributes: &BTreeMap<String, String>,
        ) -> Result<String> {
            let envelope = Envelope::wrap(event_type, payload, "test");
            self.publish_envelope(logical_queue, &envelope, attributes)
                .await
        }

        async fn publish_envelope(
            &self,
            logical_queue: &str,
            envelope: &Envelope,
            _attributes: &BTreeMap<String, String>,
        ) -> Result<String> {
            if self.fail {
                return Err(QueueError::Sqs("boom".to_string()));
            }
            self.published
                .lock()
                .push((logical_queue.to_string(), envelope.event_type.clone()));
            Ok("managed-id".to_string())
        }

        async fn publish_batch(
            &self,
            _logical_queue: &str,
            _entries: Vec<BatchEntry>,
        ) -> Result<BatchOutcome> {
            Ok(BatchOutcome::default())
        }
    }

    struct FakeLegacy {
        fail: bool,
        available: bool,
        published: Mutex<Vec<String>>,
    }

    impl FakeLegacy {
        fn new(fail: bool, available: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                available,
                published: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LegacyDriver for FakeLegacy {
        async fn publish(&self, envelope: &Envelope) -> Result<String> {
            if self.fail {
                return Err(QueueError::Legacy("legacy down".to_string()));
            }
            self.published.lock().push(envelope.event_type.clone());
            Ok("legacy-id".to_string())
        }

        async fn is_available(&self) -> bool {
            self.available
        }
    }

    struct FakeProbe {
        exists: bool,
    }

    #[async_trait]
    impl QueueExistenceProbe for FakeProbe {
        async fn queue_exists(&self, _logical: &str) -> bool {
            self.exists
        }
    }

    fn config(driver: PrimaryDriver, dual_write: bool, fallback: bool) -> MessagingConfig {
        MessagingConfig {
            driver,
            dual_write,
            fallback_to_legacy: fallback,
            service: "payment".to_string(),
        }
    }

    fn targets() -> TargetTable {
        let mut events = HashMap::new();
        events.insert(
            "payment.paid".to_string(),
            "payment-service-queue".to_string(),
        );
        TargetTable::new("default-queue", events)
    }

    #[test]
    fn target_table_lookup_with_default() {
        let table = targets();
        assert_eq!(table.for_event("payment.paid"), "payment-service-queue");
        assert_eq!(table.for_event("unknown.event"), "default-queue");
    }

    #[tokio::test]
    async fn primary_managed_publishes_to_target_queue() {
        let managed = FakeManaged::new(false);
        let service = MessagingService::new(
            config(PrimaryDriver::Managed, false, false),
            managed.clone(),
            Arc::new(FakeProbe { exists: true }),
            None,
            targets(),
        );

        let receipt = service
            .publish("payment.paid", json!({"amount": 500}), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(receipt.driver, DriverLeg::Managed);
        assert_eq!(receipt.message_id(), Some("managed-id"));
        assert_eq!(
            managed.published.lock()[0].0,
            "payment-service-queue"
        );
    }

    #[tokio::test]
    async fn dual_write_publishes_on_both() {
        let managed = FakeManaged::new(false);
        let legacy = FakeLegacy::new(false, true);
        let service = MessagingService::new(
            config(PrimaryDriver::Managed, true, false),
            managed.clone(),
            Arc::new(FakeProbe { exists: true }),
            Some(legacy.clone()),
            targets(),
        );

        let receipt = service
            .publish("payment.paid", json!({"amount": 500}), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(receipt.driver, DriverLeg::Managed);
        assert_eq!(receipt.managed_message_id.as_deref(), Some("managed-id"));
        assert_eq!(receipt.legacy_message_id.as_deref(), Some("legacy-id"));
        assert_eq!(managed.published.lock().len(), 1);
        assert_eq!(legacy.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn dual_write_survives_managed_failure() {
        let managed = FakeManaged::new(true);
        let legacy = FakeLegacy::new(false, true);
        let service = MessagingService::new(
            config(PrimaryDriver::Managed, true, false),
            managed,
            Arc::new(FakeProbe { exists: true }),
            Some(legacy.clone()),
            targets(),
        );

        let receipt = service
            .publish("payment.paid", json!({"amount": 500}), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(receipt.driver, DriverLeg::Legacy);
        assert_eq!(receipt.message_id(), Some("legacy-id"));
    }

    #[tokio::test]
    async fn dual_write_fails_when_both_legs_fail() {
        let service = MessagingService::new(
            config(PrimaryDriver::Managed, true, false),
            FakeManaged::new(true),
            Arc::new(FakeProbe { exists: true }),
            Some(FakeLegacy::new(true, true)),
            targets(),
        );

        let result = service
            .publish("payment.paid", json!({"amount": 500}), &BTreeMap::new())
            .await;

        assert!(matches!(result, Err(QueueError::Publish(_))));
    }

    #[tokio::test]
    async fn fallback_precheck_routes_to_legacy_on_queue_absence() {
        let managed = FakeManaged::new(false);
        let legacy = FakeLegacy::new(false, true);
        let service = MessagingService::new(
            config(PrimaryDriver::Managed, false, true),
            managed.clone(),
            Arc::new(FakeProbe { exists: false }),
            Some(legacy.clone()),
            targets(),
        );

        let receipt = service
            .publish("payment.paid", json!({"amount": 500}), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(receipt.driver, DriverLeg::Legacy);
        // managed's lazy create was not triggered
        assert!(managed.published.lock().is_empty());
        assert_eq!(legacy.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn fallback_precheck_skipped_when_legacy_unavailable() {
        let managed = FakeManaged::new(false);
        let service = MessagingService::new(
            config(PrimaryDriver::Managed, false, true),
            managed.clone(),
            Arc::new(FakeProbe { exists: false }),
            Some(FakeLegacy::new(false, false)),
            targets(),
        );

        let receipt = service
            .publish("payment.paid", json!({"amount": 500}), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(receipt.driver, DriverLeg::Managed);
        assert_eq!(managed.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn managed_failure_falls_back_to_legacy() {
        let legacy = FakeLegacy::new(false, true);
        let service = MessagingService::new(
            config(PrimaryDriver::Managed, false, true),
            FakeManaged::new(true),
            Arc::new(FakeProbe { exists: true }),
            Some(legacy.clone()),
            targets(),
        );

        let receipt = service
            .publish("payment.paid", json!({"amount": 500}), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(receipt.driver, DriverLeg::Legacy);
        assert_eq!(legacy.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn managed_failure_propagates_without_fallback() {
        let service = MessagingService::new(
            config(PrimaryDriver::Managed, false, false),
            FakeManaged::new(true),
            Arc::new(FakeProbe { exists: true }),
            None,
            targets(),
        );

        let result = service
            .publish("payment.paid", json!({"amount": 500}), &BTreeMap::new())
            .await;

        assert!(matches!(result, Err(QueueError::Sqs(_))));
    }

    #[tokio::test]
    async fn legacy_primary_publishes_on_legacy() {
        let legacy = FakeLegacy::new(false, true);
        let service = MessagingService::new(
            config(PrimaryDriver::Legacy, false, false),
            FakeManaged::new(false),
            Arc::new(FakeProbe { exists: true }),
            Some(legacy.clone()),
            targets(),
        );

        let receipt = service
            .publish("payment.paid", json!({"amount": 500}), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(receipt.driver, DriverLeg::Legacy);
        assert_eq!(legacy.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn legacy_primary_without_registration_is_config_error() {
        let service = MessagingService::new(
            config(PrimaryDriver::Legacy, false, false),
            FakeManaged::new(false),
            Arc::new(FakeProbe { exists: true }),
            None,
            targets(),
        );

        let result = service
            .publish("payment.paid", json!({"amount": 500}), &BTreeMap::new())
            .await;

        assert!(matches!(result, Err(QueueError::Config(_))));
    }
}
