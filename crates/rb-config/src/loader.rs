//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError, DriverKind};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "relaybus.toml",
    "config.toml",
    "./config/relaybus.toml",
    "/etc/relaybus/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("RELAYBUS_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Bus
        if let Ok(val) = env::var("RELAYBUS_DRIVER") {
            match val.to_lowercase().as_str() {
                "managed" => config.bus.driver = DriverKind::Managed,
                "legacy" => config.bus.driver = DriverKind::Legacy,
                _ => {}
            }
        }
        if let Ok(val) = env::var("RELAYBUS_DUAL_WRITE") {
            config.bus.dual_write = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("RELAYBUS_FALLBACK_TO_LEGACY") {
            config.bus.fallback_to_legacy = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("RELAYBUS_PREFIX") {
            config.bus.prefix = val;
        }
        if let Ok(val) = env::var("RELAYBUS_SERVICE") {
            config.bus.service = val;
        }
        if let Ok(val) = env::var("RELAYBUS_AUTO_ENSURE") {
            config.bus.auto_ensure = val.parse().unwrap_or(false);
        }

        // AWS
        if let Ok(val) = env::var("RELAYBUS_AWS_REGION") {
            config.aws.region = val;
        }
        if let Ok(val) = env::var("RELAYBUS_AWS_ENDPOINT_URL") {
            config.aws.endpoint_url = val;
        }

        // Redis
        if let Ok(val) = env::var("RELAYBUS_REDIS_URL") {
            config.redis.url = val;
        }

        // Database
        if let Ok(val) = env::var("RELAYBUS_DATABASE_URL") {
            config.database.url = val;
        }
        if let Ok(val) = env::var("RELAYBUS_DATABASE_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                config.database.max_connections = n;
            }
        }

        // Legacy driver
        if let Ok(val) = env::var("RELAYBUS_LEGACY_ENDPOINT_URL") {
            config.legacy.endpoint_url = val;
        }
        if let Ok(val) = env::var("RELAYBUS_LEGACY_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                config.legacy.timeout_ms = ms;
            }
        }

        // Consumer thresholds
        if let Ok(val) = env::var("RELAYBUS_VALIDATION_ERROR_RATE_THRESHOLD") {
            if let Ok(rate) = val.parse() {
                config.consumer.validation_error_rate_threshold = rate;
            }
        }
        if let Ok(val) = env::var("RELAYBUS_TRANSIENT_ERROR_RATE_THRESHOLD") {
            if let Ok(rate) = val.parse() {
                config.consumer.transient_error_rate_threshold = rate;
            }
        }

        // Idempotency / cleanup
        if let Ok(val) = env::var("RELAYBUS_PROCESSING_TTL_SECS") {
            if let Ok(ttl) = val.parse() {
                config.idempotency.processing_ttl_secs = ttl;
            }
        }
        if let Ok(val) = env::var("RELAYBUS_PROCESSED_TTL_SECS") {
            if let Ok(ttl) = val.parse() {
                config.idempotency.processed_ttl_secs = ttl;
            }
        }
        if let Ok(val) = env::var("RELAYBUS_CLEANUP_RETENTION_DAYS") {
            if let Ok(days) = val.parse() {
                config.cleanup.retention_days = days;
            }
        }

        // DLQ monitoring
        if let Ok(val) = env::var("RELAYBUS_DLQ_ALERT_THRESHOLD") {
            if let Ok(threshold) = val.parse() {
                config.dlq.alert_threshold = threshold;
            }
        }

        // CloudWatch
        if let Ok(val) = env::var("RELAYBUS_CLOUDWATCH_ENABLED") {
            config.cloudwatch.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("RELAYBUS_CLOUDWATCH_NAMESPACE") {
            config.cloudwatch.namespace = val;
        }

        // Notifier
        if let Ok(val) = env::var("RELAYBUS_NOTIFIER_ENABLED") {
            config.notifier.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("RELAYBUS_NOTIFIER_WEBHOOK_URL") {
            config.notifier.webhook_url = val;
        }
        if let Ok(val) = env::var("RELAYBUS_NOTIFIER_MIN_SEVERITY") {
            config.notifier.min_severity = val;
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
