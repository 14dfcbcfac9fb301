//! End-to-end consumer cycle scenarios over the in-memory transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rb_alert::RecordingNotifier;
use rb_common::{Envelope, ReceivedMessage, Severity};
use rb_consumer::{
    ConsumerCycle, CycleConfig, CycleError, EventListener, ListenerError, ListenerRegistry,
    Outcome, RecordingMetricsSink,
};
use rb_idempotency::{IdempotencyStore, InMemoryCacheTier, InMemoryProcessedStore};
use rb_queue::mock::InMemoryQueue;
use rb_queue::{DepthSnapshot, EventPublisher, QueueError, QueueSource};

enum ListenerMode {
    Succeed,
    FailTimeout,
    FailBusinessRule,
}

struct ScriptedListener {
    mode: ListenerMode,
    payloads: Mutex<Vec<Value>>,
}

impl ScriptedListener {
    fn new(mode: ListenerMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            payloads: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.payloads.lock().len()
    }

    fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().clone()
    }
}

#[async_trait]
impl EventListener for ScriptedListener {
    async fn handle(&self, payload: Value) -> Result<(), ListenerError> {
        match self.mode {
            ListenerMode::Succeed => {
                self.payloads.lock().push(payload);
                Ok(())
            }
            ListenerMode::FailTimeout => Err(ListenerError::Timeout(
                "connection timed out after 30s".to_string(),
            )),
            ListenerMode::FailBusinessRule => Err(ListenerError::BusinessRule(
                "insufficient balance".to_string(),
            )),
        }
    }
}

struct Harness {
    main: Arc<InMemoryQueue>,
    dlq: Arc<InMemoryQueue>,
    store: Arc<IdempotencyStore>,
    durable: Arc<InMemoryProcessedStore>,
    notifier: Arc<RecordingNotifier>,
    metrics: Arc<RecordingMetricsSink>,
    cycle: ConsumerCycle,
}

fn harness(registry: ListenerRegistry, long_running: &[&str]) -> Harness {
    let dlq = InMemoryQueue::new("payment-service-queue-dlq");
    let main = InMemoryQueue::with_dlq("payment-service-queue", 5, dlq.clone());

    let durable = Arc::new(InMemoryProcessedStore::new());
    let store = Arc::new(IdempotencyStore::new(
        Arc::new(InMemoryCacheTier::new()),
        durable.clone(),
    ));

    let notifier = Arc::new(RecordingNotifier::new());
    let metrics = Arc::new(RecordingMetricsSink::new());

    let config = CycleConfig {
        queue: "payment-service-queue".to_string(),
        long_running_events: long_running.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        ..Default::default()
    };

    let cycle = ConsumerCycle::new(
        main.clone(),
        Arc::new(registry),
        store.clone(),
        notifier.clone(),
        metrics.clone(),
        config,
    );

    Harness {
        main,
        dlq,
        store,
        durable,
        notifier,
        metrics,
        cycle,
    }
}

fn registry_with(event_type: &str, listener: Arc<ScriptedListener>) -> ListenerRegistry {
    let mut registry = ListenerRegistry::new();
    registry.register(event_type, listener);
    registry
}

fn expected_key(event_type: &str, canonical: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(format!("{event_type}|{canonical}").as_bytes());
    hex::encode(hasher.finalize())
}

#[tokio::test]
async fn happy_path_publish_consume() {
    let listener = ScriptedListener::new(ListenerMode::Succeed);
    let h = harness(registry_with("payment.paid", listener.clone()), &[]);

    h.main
        .publish(
            "payment-service-queue",
            "payment.paid",
            json!({"student_id": 42, "amount": 500}),
            &BTreeMap::new(),
        )
        .await
        .unwrap();

    let report = h.cycle.run_once().await.unwrap();

    assert_eq!(report.success, 1);
    assert_eq!(listener.calls(), 1);
    assert_eq!(listener.payloads()[0], json!({"student_id": 42, "amount": 500}));

    // durable row exists under the deterministic key
    let key = expected_key("payment.paid", r#"{"amount":500,"student_id":42}"#);
    let row = h.durable.row(&key).expect("durable row missing");
    assert_eq!(row.event_type, "payment.paid");

    // acked: nothing left to redeliver
    assert!(h.main.is_empty());
}

#[tokio::test]
async fn duplicate_publish_is_suppressed() {
    let listener = ScriptedListener::new(ListenerMode::Succeed);
    let h = harness(registry_with("payment.paid", listener.clone()), &[]);

    for _ in 0..2 {
        h.main
            .publish(
                "payment-service-queue",
                "payment.paid",
                json!({"student_id": 42, "amount": 500}),
                &BTreeMap::new(),
            )
            .await
            .unwrap();
    }

    let report = h.cycle.run_once().await.unwrap();

    assert_eq!(listener.calls(), 1);
    assert_eq!(report.success, 2);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.validation_errors, 0);
    assert_eq!(h.metrics.count(Outcome::Success), 2);
    assert_eq!(h.metrics.count(Outcome::ValidationError), 0);
    assert!(h.main.is_empty());
    assert_eq!(h.durable.len(), 1);
}

#[tokio::test]
async fn transient_failures_leave_message_until_dlq() {
    let listener = ScriptedListener::new(ListenerMode::FailTimeout);
    let h = harness(registry_with("payment.paid", listener), &[]);

    h.main
        .publish(
            "payment-service-queue",
            "payment.paid",
            json!({"student_id": 42, "amount": 500}),
            &BTreeMap::new(),
        )
        .await
        .unwrap();

    // five failing deliveries, the sixth receive attempt promotes to the DLQ
    for _ in 0..6 {
        h.cycle.run_once().await.unwrap();
    }

    assert_eq!(h.dlq.len(), 1);
    assert_eq!(h.main.len(), 0);
    assert!(h.metrics.count(Outcome::TransientError) >= 5);
    assert_eq!(h.metrics.count(Outcome::Success), 0);
    assert!(h.durable.is_empty());
}

#[tokio::test]
async fn permanent_failure_acks_and_alerts() {
    let listener = ScriptedListener::new(ListenerMode::FailBusinessRule);
    let h = harness(registry_with("payment.paid", listener), &[]);

    h.main
        .publish(
            "payment-service-queue",
            "payment.paid",
            json!({"student_id": 42, "amount": 500}),
            &BTreeMap::new(),
        )
        .await
        .unwrap();

    let report = h.cycle.run_once().await.unwrap();

    assert_eq!(report.permanent_errors, 1);
    // acked on the first attempt, DLQ untouched
    assert!(h.main.is_empty());
    assert!(h.dlq.is_empty());

    let alerts = h.notifier.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(alerts[0].context["event_type"], "payment.paid");
    assert_eq!(alerts[0].context["error_kind"], "business_rule");
}

#[tokio::test]
async fn unmapped_event_acks_and_alerts() {
    let listener = ScriptedListener::new(ListenerMode::Succeed);
    let h = harness(registry_with("payment.paid", listener), &[]);

    h.main
        .publish(
            "payment-service-queue",
            "unknown.event",
            json!({"x": 1}),
            &BTreeMap::new(),
        )
        .await
        .unwrap();

    let report = h.cycle.run_once().await.unwrap();

    assert_eq!(report.permanent_errors, 1);
    assert_eq!(h.metrics.count(Outcome::PermanentError), 1);
    assert!(h.main.is_empty());
    assert!(h.dlq.is_empty());

    let alerts = h.notifier.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].context["event_type"], "unknown.event");
}

#[tokio::test]
async fn malformed_body_counts_as_validation_error_and_fires_rate_alert() {
    let listener = ScriptedListener::new(ListenerMode::Succeed);
    let h = harness(registry_with("payment.paid", listener.clone()), &[]);

    h.main.push_raw("{not json");
    h.main
        .publish(
            "payment-service-queue",
            "payment.paid",
            json!({"amount": 1}),
            &BTreeMap::new(),
        )
        .await
        .unwrap();

    let report = h.cycle.run_once().await.unwrap();

    assert_eq!(report.validation_errors, 1);
    assert_eq!(report.success, 1);
    assert_eq!(listener.calls(), 1);
    // 50% validation rate against a 1% threshold
    assert_eq!(report.alerts_fired, 1);
    assert!(h.main.is_empty());
}

#[tokio::test]
async fn missing_envelope_field_is_discarded() {
    let listener = ScriptedListener::new(ListenerMode::Succeed);
    let h = harness(registry_with("payment.paid", listener.clone()), &[]);

    // valid JSON, but not a complete envelope
    h.main
        .push_raw(r#"{"event_type":"payment.paid","payload":{"amount":1}}"#);

    let report = h.cycle.run_once().await.unwrap();

    assert_eq!(report.validation_errors, 1);
    assert_eq!(listener.calls(), 0);
    assert!(h.main.is_empty());
}

#[tokio::test]
async fn clean_cycle_fires_no_rate_alerts() {
    let listener = ScriptedListener::new(ListenerMode::Succeed);
    let h = harness(registry_with("payment.paid", listener), &[]);

    for i in 0..3 {
        h.main
            .publish(
                "payment-service-queue",
                "payment.paid",
                json!({"amount": i}),
                &BTreeMap::new(),
            )
            .await
            .unwrap();
    }

    let report = h.cycle.run_once().await.unwrap();

    assert_eq!(report.success, 3);
    assert_eq!(report.alerts_fired, 0);
    assert_eq!(h.notifier.count(), 0);
}

#[tokio::test]
async fn long_running_event_gets_visibility_extension() {
    let listener = ScriptedListener::new(ListenerMode::Succeed);
    let h = harness(
        registry_with("report.generate", listener),
        &["report.generate"],
    );

    h.main
        .publish(
            "payment-service-queue",
            "report.generate",
            json!({"month": "2024-01"}),
            &BTreeMap::new(),
        )
        .await
        .unwrap();

    h.cycle.run_once().await.unwrap();

    assert_eq!(h.main.extensions(), 1);
}

#[tokio::test]
async fn empty_receive_returns_empty_report() {
    let listener = ScriptedListener::new(ListenerMode::Succeed);
    let h = harness(registry_with("payment.paid", listener), &[]);

    let report = h.cycle.run_once().await.unwrap();

    assert_eq!(report.processed, 0);
    assert_eq!(report.alerts_fired, 0);
}

struct FailingSource;

#[async_trait]
impl QueueSource for FailingSource {
    fn identifier(&self) -> &str {
        "broken"
    }

    async fn poll(&self, _max_messages: u32) -> rb_queue::Result<Vec<ReceivedMessage>> {
        Err(QueueError::Sqs("endpoint unreachable".to_string()))
    }

    async fn ack(&self, _receipt_handle: &str) -> rb_queue::Result<()> {
        Ok(())
    }

    async fn extend_visibility(&self, _receipt_handle: &str, _seconds: u32) -> rb_queue::Result<()> {
        Ok(())
    }

    async fn depth(&self) -> rb_queue::Result<DepthSnapshot> {
        Ok(DepthSnapshot::default())
    }
}

#[tokio::test]
async fn receive_failure_aborts_cycle() {
    let durable = Arc::new(InMemoryProcessedStore::new());
    let store = Arc::new(IdempotencyStore::new(
        Arc::new(InMemoryCacheTier::new()),
        durable,
    ));
    let cycle = ConsumerCycle::new(
        Arc::new(FailingSource),
        Arc::new(ListenerRegistry::new()),
        store,
        Arc::new(RecordingNotifier::new()),
        Arc::new(RecordingMetricsSink::new()),
        CycleConfig::default(),
    );

    let result = cycle.run_once().await;
    assert!(matches!(result, Err(CycleError::Receive(_))));
}

#[tokio::test]
async fn redelivered_message_after_commit_is_duplicate() {
    let listener = ScriptedListener::new(ListenerMode::Succeed);
    let h = harness(registry_with("payment.paid", listener.clone()), &[]);

    let envelope = Envelope::wrap("payment.paid", json!({"amount": 500}), "payment");
    let body = serde_json::to_string(&envelope).unwrap();

    h.main.push_raw(body.clone());
    h.cycle.run_once().await.unwrap();
    assert_eq!(listener.calls(), 1);

    // the same envelope arrives again (crashed worker, visibility expiry)
    h.main.push_raw(body);
    let report = h.cycle.run_once().await.unwrap();

    assert_eq!(listener.calls(), 1);
    assert_eq!(report.duplicates, 1);
    assert!(h.store.is_processed(&envelope.idempotency_key).await.unwrap());
}
