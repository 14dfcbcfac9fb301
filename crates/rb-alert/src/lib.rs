//! Notifier sink: routes operator alerts to a webhook endpoint.
//!
//! The consumer cycle and DLQ monitor only know the [`Notifier`] trait; the
//! concrete sink (chat, paging, ...) is whatever sits behind the webhook.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use rb_common::{Alert, Severity};

/// Alert sink contract
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an alert. Delivery failures are logged, never propagated:
    /// alerting must not alter message dispositions.
    async fn notify(&self, alert: &Alert);

    fn is_enabled(&self) -> bool;
}

/// No-op sink for when notifications are disabled
pub struct NoOpNotifier;

#[async_trait]
impl Notifier for NoOpNotifier {
    async fn notify(&self, _alert: &Alert) {}

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Webhook sink: posts the alert as a JSON document
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
    min_severity: Severity,
}

impl WebhookNotifier {
    pub fn new(webhook_url: String, min_severity: Severity) -> Self {
        info!(min_severity = ?min_severity, "WebhookNotifier initialized");
        Self {
            client: reqwest::Client::new(),
            webhook_url,
            min_severity,
        }
    }

    fn build_payload(&self, alert: &Alert) -> serde_json::Value {
        json!({
            "id": alert.id,
            "severity": format!("{:?}", alert.severity),
            "title": alert.title,
            "message": alert.message,
            "source": alert.source,
            "context": alert.context,
            "created_at": alert.created_at.to_rfc3339(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) {
        if alert.severity < self.min_severity {
            debug!(
                severity = ?alert.severity,
                title = %alert.title,
                "Alert below minimum severity, skipping"
            );
            return;
        }

        let payload = self.build_payload(alert);
        let result = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) if !response.status().is_success() => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!(status = %status, body = %body, "Alert webhook returned error");
            }
            Ok(_) => {
                info!(
                    severity = ?alert.severity,
                    title = %alert.title,
                    source = %alert.source,
                    "Alert delivered"
                );
            }
            Err(e) => {
                error!(error = %e, title = %alert.title, "Failed to deliver alert");
            }
        }
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Parse a configured severity string, defaulting to Warn.
pub fn parse_severity(value: &str) -> Severity {
    match value.to_lowercase().as_str() {
        "info" => Severity::Info,
        "warn" | "warning" => Severity::Warn,
        "error" => Severity::Error,
        "critical" => Severity::Critical,
        other => {
            warn!(value = other, "Unknown severity, defaulting to warn");
            Severity::Warn
        }
    }
}

/// Build a notifier from configuration: webhook when enabled with a URL,
/// no-op otherwise.
pub fn create_notifier(enabled: bool, webhook_url: &str, min_severity: &str) -> Arc<dyn Notifier> {
    if enabled && !webhook_url.is_empty() {
        Arc::new(WebhookNotifier::new(
            webhook_url.to_string(),
            parse_severity(min_severity),
        ))
    } else {
        if enabled {
            warn!("Notifier enabled but webhook URL is empty, using no-op sink");
        } else {
            info!("Notifier disabled, using no-op sink");
        }
        Arc::new(NoOpNotifier)
    }
}

/// Recording sink for tests: captures every alert it is handed.
pub struct RecordingNotifier {
    alerts: parking_lot::Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            alerts: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.alerts.lock().len()
    }
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: &Alert) {
        self.alerts.lock().push(alert.clone());
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_severity_variants() {
        assert_eq!(parse_severity("info"), Severity::Info);
        assert_eq!(parse_severity("WARN"), Severity::Warn);
        assert_eq!(parse_severity("critical"), Severity::Critical);
        assert_eq!(parse_severity("bogus"), Severity::Warn);
    }

    #[test]
    fn disabled_config_yields_noop() {
        let notifier = create_notifier(false, "https://example.com/hook", "warn");
        assert!(!notifier.is_enabled());
    }

    #[test]
    fn enabled_without_url_yields_noop() {
        let notifier = create_notifier(true, "", "warn");
        assert!(!notifier.is_enabled());
    }

    #[test]
    fn enabled_with_url_yields_webhook() {
        let notifier = create_notifier(true, "https://example.com/hook", "error");
        assert!(notifier.is_enabled());
    }

    #[tokio::test]
    async fn recording_notifier_captures() {
        let notifier = RecordingNotifier::new();
        notifier
            .notify(&Alert::critical("t", "m", "test"))
            .await;
        assert_eq!(notifier.count(), 1);
        assert_eq!(notifier.alerts()[0].title, "t");
    }
}
