//! RelayBus configuration: TOML file with environment variable overrides.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Primary transport driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Managed,
    Legacy,
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bus: BusConfig,
    pub aws: AwsConfig,
    pub redis: RedisConfig,
    pub database: DatabaseConfig,
    pub legacy: LegacyConfig,
    /// Per-service logical queue names
    pub queues: BTreeMap<String, ServiceQueues>,
    /// event_type -> listener identifier
    pub event_listeners: BTreeMap<String, String>,
    pub target_queues: TargetQueues,
    pub consumer: ConsumerConfig,
    pub idempotency: IdempotencyConfig,
    pub cleanup: CleanupConfig,
    pub dlq: DlqConfig,
    pub cloudwatch: CloudwatchConfig,
    pub notifier: NotifierConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            aws: AwsConfig::default(),
            redis: RedisConfig::default(),
            database: DatabaseConfig::default(),
            legacy: LegacyConfig::default(),
            queues: BTreeMap::new(),
            event_listeners: BTreeMap::new(),
            target_queues: TargetQueues::default(),
            consumer: ConsumerConfig::default(),
            idempotency: IdempotencyConfig::default(),
            cleanup: CleanupConfig::default(),
            dlq: DlqConfig::default(),
            cloudwatch: CloudwatchConfig::default(),
            notifier: NotifierConfig::default(),
        }
    }
}

/// Bus-level driver and naming policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub driver: DriverKind,
    /// Publish on both drivers on every call
    pub dual_write: bool,
    /// Fall back to the legacy driver on failure or queue absence
    pub fallback_to_legacy: bool,
    /// Environment queue prefix (local, dev, staging, production, ...)
    pub prefix: String,
    /// Origin service identifier stamped on every envelope
    pub service: String,
    /// Resolve (and thereby create) all configured queues at process start
    pub auto_ensure: bool,
    /// Event types eligible for the one-shot visibility extension
    pub long_running_events: BTreeSet<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Managed,
            dual_write: false,
            fallback_to_legacy: false,
            prefix: "local".to_string(),
            service: "app".to_string(),
            auto_ensure: false,
            long_running_events: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: String,
    /// Endpoint override for LocalStack / compatible services (empty = AWS)
    pub endpoint_url: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/relaybus".to_string(),
            max_connections: 5,
        }
    }
}

/// Legacy transport endpoint (opaque driver, publish-only contract)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyConfig {
    pub endpoint_url: String,
    pub timeout_ms: u64,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            timeout_ms: 10_000,
        }
    }
}

/// Logical queues owned by one service
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceQueues {
    pub default: String,
    pub specific: Vec<String>,
}

/// event_type -> logical queue routing table with a default
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetQueues {
    pub default: String,
    pub events: BTreeMap<String, String>,
}

impl Default for TargetQueues {
    fn default() -> Self {
        Self {
            default: "default-queue".to_string(),
            events: BTreeMap::new(),
        }
    }
}

impl TargetQueues {
    /// Pure lookup: configured mapping for the event type, else the default.
    pub fn for_event(&self, event_type: &str) -> &str {
        self.events
            .get(event_type)
            .map(String::as_str)
            .unwrap_or(&self.default)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Long-poll wait (transport max is 20)
    pub wait_time_seconds: u32,
    /// Receive visibility timeout
    pub visibility_timeout_seconds: u32,
    /// Messages per receive (transport max is 10)
    pub max_messages: u32,
    /// One-shot visibility extension for long-running events
    pub long_running_visibility_seconds: u32,
    pub validation_error_rate_threshold: f64,
    pub transient_error_rate_threshold: f64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            wait_time_seconds: 20,
            visibility_timeout_seconds: 30,
            max_messages: 10,
            long_running_visibility_seconds: 120,
            validation_error_rate_threshold: 0.01,
            transient_error_rate_threshold: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub processing_ttl_secs: u64,
    pub processed_ttl_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            processing_ttl_secs: 300,
            processed_ttl_secs: 604_800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub retention_days: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { retention_days: 7 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub alert_threshold: u64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            alert_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudwatchConfig {
    pub enabled: bool,
    pub namespace: String,
}

impl Default for CloudwatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: "RelayBus".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub enabled: bool,
    pub webhook_url: String,
    /// Minimum severity forwarded: info, warn, error, critical
    pub min_severity: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: String::new(),
            min_severity: "warn".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// All configured logical queue names (defaults + specifics), deduplicated.
    pub fn all_logical_queues(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for service in self.queues.values() {
            if !service.default.is_empty() {
                names.insert(service.default.clone());
            }
            names.extend(service.specific.iter().cloned());
        }
        if !self.target_queues.default.is_empty() {
            names.insert(self.target_queues.default.clone());
        }
        names.extend(self.target_queues.events.values().cloned());
        names
    }

    /// Structural validation used by the `check` command and at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "bus.prefix must not be empty".to_string(),
            ));
        }
        if self.bus.service.is_empty() {
            return Err(ConfigError::ValidationError(
                "bus.service must not be empty".to_string(),
            ));
        }
        if self.bus.driver == DriverKind::Legacy && self.legacy.endpoint_url.is_empty() {
            return Err(ConfigError::ValidationError(
                "bus.driver = legacy requires legacy.endpoint_url".to_string(),
            ));
        }
        if (self.bus.dual_write || self.bus.fallback_to_legacy)
            && self.legacy.endpoint_url.is_empty()
        {
            return Err(ConfigError::ValidationError(
                "dual_write / fallback_to_legacy require legacy.endpoint_url".to_string(),
            ));
        }
        if self.target_queues.default.is_empty() {
            return Err(ConfigError::ValidationError(
                "target_queues.default must not be empty".to_string(),
            ));
        }
        for threshold in [
            self.consumer.validation_error_rate_threshold,
            self.consumer.transient_error_rate_threshold,
        ] {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::ValidationError(format!(
                    "error rate threshold {threshold} must be within 0.0..=1.0"
                )));
            }
        }
        if self.consumer.max_messages == 0 || self.consumer.max_messages > 10 {
            return Err(ConfigError::ValidationError(
                "consumer.max_messages must be within 1..=10".to_string(),
            ));
        }
        if self.consumer.wait_time_seconds > 20 {
            return Err(ConfigError::ValidationError(
                "consumer.wait_time_seconds must be at most 20".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# RelayBus Configuration
# Environment variables (RELAYBUS_*) override these settings

[bus]
driver = "managed"          # managed or legacy
dual_write = false
fallback_to_legacy = false
prefix = "local"            # environment queue prefix
service = "payment"         # origin service identifier
auto_ensure = false
long_running_events = []

[aws]
region = "us-east-1"
endpoint_url = ""           # set for LocalStack

[redis]
url = "redis://localhost:6379"

[database]
url = "postgres://localhost:5432/relaybus"
max_connections = 5

[legacy]
endpoint_url = ""
timeout_ms = 10000

[queues.payment]
default = "payment-service-queue"
specific = ["payment-refund-queue"]

[event_listeners]
"payment.paid" = "payment_paid"

[target_queues]
default = "default-queue"

[target_queues.events]
"payment.paid" = "payment-service-queue"

[consumer]
wait_time_seconds = 20
visibility_timeout_seconds = 30
max_messages = 10
long_running_visibility_seconds = 120
validation_error_rate_threshold = 0.01
transient_error_rate_threshold = 0.10

[idempotency]
processing_ttl_secs = 300
processed_ttl_secs = 604800

[cleanup]
retention_days = 7

[dlq]
alert_threshold = 10

[cloudwatch]
enabled = false
namespace = "RelayBus"

[notifier]
enabled = false
webhook_url = ""
min_severity = "warn"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.consumer.validation_error_rate_threshold, 0.01);
        assert_eq!(config.consumer.transient_error_rate_threshold, 0.10);
        assert_eq!(config.idempotency.processing_ttl_secs, 300);
        assert_eq!(config.idempotency.processed_ttl_secs, 604_800);
        assert_eq!(config.cleanup.retention_days, 7);
        assert_eq!(config.dlq.alert_threshold, 10);
    }

    #[test]
    fn example_toml_parses() {
        let config: AppConfig = toml::from_str(&AppConfig::example_toml()).unwrap();
        assert_eq!(config.bus.service, "payment");
        assert_eq!(
            config.target_queues.for_event("payment.paid"),
            "payment-service-queue"
        );
        assert_eq!(config.target_queues.for_event("unknown.event"), "default-queue");
        assert!(config
            .all_logical_queues()
            .contains("payment-refund-queue"));
    }

    #[test]
    fn legacy_driver_requires_endpoint() {
        let mut config = AppConfig::default();
        config.bus.driver = DriverKind::Legacy;
        assert!(config.validate().is_err());

        config.legacy.endpoint_url = "http://localhost:8081/events".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn threshold_bounds_enforced() {
        let mut config = AppConfig::default();
        config.consumer.transient_error_rate_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn all_logical_queues_includes_targets() {
        let mut config = AppConfig::default();
        config.queues.insert(
            "payment".to_string(),
            ServiceQueues {
                default: "payment-service-queue".to_string(),
                specific: vec!["payment-refund-queue".to_string()],
            },
        );
        config
            .target_queues
            .events
            .insert("admission.accepted".to_string(), "admission-service-queue".to_string());

        let names = config.all_logical_queues();
        assert!(names.contains("payment-service-queue"));
        assert!(names.contains("payment-refund-queue"));
        assert!(names.contains("admission-service-queue"));
        assert!(names.contains("default-queue"));
    }
}
