//! RelayBus worker and operator CLI.
//!
//! One subcommand per operator action: queue provisioning, a supervised
//! consumer cycle, DLQ inspection/replay/monitoring, processed-events
//! cleanup, and configuration checks. Every command returns 0 on success and
//! non-zero when it failed or fired an alert.
//!
//! The consume command runs exactly one cycle and exits, matching the
//! external-supervisor process model; `--loop` re-runs cycles in-process for
//! development.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use rb_alert::{create_notifier, Notifier};
use rb_config::{AppConfig, ConfigLoader, DriverKind};
use rb_consumer::{
    ConsumerCycle, CycleConfig, EventListener, ListenerError, ListenerRegistry,
    LoggingMetricsSink, MetricsSink,
};
use rb_dlq::DlqMonitor;
use rb_idempotency::{IdempotencyStore, PostgresProcessedStore, RedisCacheTier};
use rb_queue::{
    HttpLegacyDriver, MessagingConfig, MessagingService, PrimaryDriver, QueueResolver,
    QueueSource, SqsQueueSource, TargetTable,
};

#[derive(Parser, Debug)]
#[command(name = "rb-worker")]
#[command(about = "RelayBus message bus worker and operator tooling")]
struct Args {
    /// Config file path (searches standard locations when omitted)
    #[arg(long, env = "RELAYBUS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve all configured queues, creating each with its DLQ when absent
    EnsureQueues,

    /// Publish one event through the configured driver policy
    Publish {
        event_type: String,

        /// JSON payload
        payload: String,

        /// Additional message attributes as key=value pairs
        #[arg(long = "attr")]
        attributes: Vec<String>,
    },

    /// Run one consumer cycle against a logical queue, then exit
    Consume {
        /// Logical queue name (unprefixed)
        queue: String,

        /// Re-run cycles in-process instead of exiting after one
        #[arg(long = "loop")]
        run_loop: bool,
    },

    /// Show messages sitting in a queue's DLQ without consuming them
    InspectDlq {
        queue: String,

        #[arg(long, default_value_t = 10)]
        limit: u32,
    },

    /// Move DLQ messages back onto the main queue
    ReplayDlq {
        queue: String,

        #[arg(long, default_value_t = 10)]
        limit: u32,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Check DLQ depths; alerts and exits non-zero above the threshold
    MonitorDlq {
        /// Single logical queue (all configured queues when omitted)
        queue: Option<String>,
    },

    /// Purge processed-event rows older than the retention window
    CleanupProcessedEvents {
        #[arg(long)]
        days: Option<u32>,
    },

    /// Show configuration and queue depth summary
    Status,

    /// Validate configuration and listener bindings
    Check,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    rb_common::logging::init_logging("rb-worker");

    let args = Args::parse();

    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path.clone()),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("failed to load configuration")?;

    let code = match args.command {
        Command::EnsureQueues => ensure_queues(&config).await?,
        Command::Publish {
            event_type,
            payload,
            attributes,
        } => publish(&config, &event_type, &payload, &attributes).await?,
        Command::Consume { queue, run_loop } => consume(&config, &queue, run_loop).await?,
        Command::InspectDlq { queue, limit } => inspect_dlq(&config, &queue, limit).await?,
        Command::ReplayDlq { queue, limit, yes } => {
            replay_dlq(&config, &queue, limit, yes).await?
        }
        Command::MonitorDlq { queue } => monitor_dlq(&config, queue.as_deref()).await?,
        Command::CleanupProcessedEvents { days } => cleanup(&config, days).await?,
        Command::Status => status(&config).await?,
        Command::Check => check(&config),
    };

    Ok(ExitCode::from(code))
}

// ============================================================================
// Component wiring
// ============================================================================

async fn sqs_client(config: &AppConfig) -> aws_sdk_sqs::Client {
    let mut builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.aws.region.clone()));

    if !config.aws.endpoint_url.is_empty() {
        info!(endpoint = %config.aws.endpoint_url, "Using SQS endpoint override");
        builder = builder.endpoint_url(&config.aws.endpoint_url);
    }

    aws_sdk_sqs::Client::new(&builder.load().await)
}

async fn resolver(config: &AppConfig) -> Arc<QueueResolver> {
    Arc::new(QueueResolver::new(
        sqs_client(config).await,
        config.bus.prefix.clone(),
    ))
}

async fn idempotency_store(config: &AppConfig) -> Result<Arc<IdempotencyStore>> {
    let cache = RedisCacheTier::connect(&config.redis.url)
        .await
        .context("failed to connect to the cache tier")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("failed to connect to the durable tier")?;

    let durable = PostgresProcessedStore::new(pool);
    durable
        .init_schema()
        .await
        .context("failed to initialize the processed-events schema")?;

    Ok(Arc::new(
        IdempotencyStore::new(Arc::new(cache), Arc::new(durable)).with_ttls(
            config.idempotency.processing_ttl_secs,
            config.idempotency.processed_ttl_secs,
        ),
    ))
}

fn notifier(config: &AppConfig) -> Arc<dyn Notifier> {
    create_notifier(
        config.notifier.enabled,
        &config.notifier.webhook_url,
        &config.notifier.min_severity,
    )
}

fn metrics_sink(config: &AppConfig) -> Arc<dyn MetricsSink> {
    // The CloudWatch toggle selects the namespace an external sink would
    // publish under; the in-tree sink emits structured log lines either way.
    Arc::new(LoggingMetricsSink::new(config.cloudwatch.namespace.clone()))
}

/// Logs each payload it handles. Deployments register their own listener
/// implementations here, keyed by the identifiers used in `event_listeners`.
struct LoggingListener;

#[async_trait]
impl EventListener for LoggingListener {
    async fn handle(&self, payload: Value) -> std::result::Result<(), ListenerError> {
        info!(payload = %payload, "Event received");
        Ok(())
    }
}

fn listener_implementations() -> HashMap<String, Arc<dyn EventListener>> {
    let mut implementations: HashMap<String, Arc<dyn EventListener>> = HashMap::new();
    implementations.insert("log".to_string(), Arc::new(LoggingListener));
    implementations
}

async fn dlq_source(config: &AppConfig, logical_queue: &str) -> Result<SqsQueueSource> {
    let resolver = resolver(config).await;
    let dlq_url = resolver.dlq_url(logical_queue).await?;
    Ok(SqsQueueSource::new(
        sqs_client(config).await,
        dlq_url,
        resolver.dlq_name(logical_queue),
        config.consumer.visibility_timeout_seconds,
    )
    .with_wait_time_seconds(0))
}

// ============================================================================
// Commands
// ============================================================================

async fn ensure_queues(config: &AppConfig) -> Result<u8> {
    let resolver = resolver(config).await;
    let queues = config.all_logical_queues();

    if queues.is_empty() {
        warn!("No queues configured");
        return Ok(0);
    }

    for logical in &queues {
        let url = resolver.resolve(logical).await?;
        println!("{logical}\t{url}");
    }

    info!(count = queues.len(), "All configured queues resolved");
    Ok(0)
}

async fn consume(config: &AppConfig, logical_queue: &str, run_loop: bool) -> Result<u8> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("configuration invalid: {e}"))?;

    let registry = ListenerRegistry::from_bindings(
        &config.event_listeners,
        &listener_implementations(),
    )
    .context("listener bindings did not resolve")?;

    let resolver = resolver(config).await;

    if config.bus.auto_ensure {
        for logical in config.all_logical_queues() {
            resolver.resolve(&logical).await?;
        }
    }

    let queue_url = resolver.resolve(logical_queue).await?;
    let source = Arc::new(
        SqsQueueSource::new(
            sqs_client(config).await,
            queue_url,
            resolver.effective_name(logical_queue),
            config.consumer.visibility_timeout_seconds,
        )
        .with_wait_time_seconds(config.consumer.wait_time_seconds),
    );

    let cycle = ConsumerCycle::new(
        source,
        Arc::new(registry),
        idempotency_store(config).await?,
        notifier(config),
        metrics_sink(config),
        CycleConfig {
            queue: logical_queue.to_string(),
            max_messages: config.consumer.max_messages,
            long_running_events: config.bus.long_running_events.clone(),
            long_running_visibility_seconds: config.consumer.long_running_visibility_seconds,
            validation_error_rate_threshold: config.consumer.validation_error_rate_threshold,
            transient_error_rate_threshold: config.consumer.transient_error_rate_threshold,
        },
    );

    loop {
        match cycle.run_once().await {
            Ok(report) => {
                info!(
                    queue = %logical_queue,
                    processed = report.processed,
                    success = report.success,
                    duplicates = report.duplicates,
                    validation_errors = report.validation_errors,
                    transient_errors = report.transient_errors,
                    permanent_errors = report.permanent_errors,
                    "Cycle complete"
                );
                if !run_loop {
                    return Ok(0);
                }
            }
            Err(e) => {
                error!(queue = %logical_queue, error = %e, "Cycle aborted");
                return Ok(1);
            }
        }
    }
}

async fn inspect_dlq(config: &AppConfig, logical_queue: &str, limit: u32) -> Result<u8> {
    let source = dlq_source(config, logical_queue).await?;
    let entries = rb_dlq::inspect(&source, limit).await?;

    if entries.is_empty() {
        println!("DLQ for {logical_queue} is empty");
        return Ok(0);
    }

    for (i, entry) in entries.iter().enumerate() {
        println!("--- message {} ---", i + 1);
        match (&entry.event_type, &entry.payload) {
            (Some(event_type), Some(payload)) => {
                println!("event_type:      {event_type}");
                if let Some(trace_id) = &entry.trace_id {
                    println!("trace_id:        {trace_id}");
                }
                if let Some(key) = &entry.idempotency_key {
                    println!("idempotency_key: {key}");
                }
                println!("payload:         {payload}");
            }
            _ => {
                println!("undecodable body: {}", entry.body);
            }
        }
        println!("receive_count:   {}", entry.receive_count);
        if let Some(sent_at) = entry.sent_at {
            println!("sent_at:         {}", sent_at.to_rfc3339());
        }
    }

    Ok(0)
}

async fn replay_dlq(config: &AppConfig, logical_queue: &str, limit: u32, yes: bool) -> Result<u8> {
    if !yes && !confirm(&format!(
        "Replay up to {limit} messages from the DLQ of {logical_queue}? [y/N] "
    ))? {
        println!("Aborted");
        return Ok(1);
    }

    let source = dlq_source(config, logical_queue).await?;

    let resolver = resolver(config).await;
    let publisher = rb_queue::SqsPublisher::new(
        sqs_client(config).await,
        resolver,
        config.bus.service.clone(),
    );

    let report = rb_dlq::replay(&source, &publisher, logical_queue, limit).await?;
    println!("replayed: {}\nfailed:   {}", report.replayed, report.failed);

    Ok(0)
}

async fn monitor_dlq(config: &AppConfig, queue: Option<&str>) -> Result<u8> {
    let queues: Vec<String> = match queue {
        Some(name) => vec![name.to_string()],
        None => config.all_logical_queues().into_iter().collect(),
    };

    let monitor = DlqMonitor::new(notifier(config), config.dlq.alert_threshold);
    let mut alerts_fired = 0u32;

    for logical in &queues {
        match dlq_source(config, logical).await {
            Ok(source) => {
                if monitor.check(logical, &source).await? {
                    alerts_fired += 1;
                }
            }
            Err(e) => {
                warn!(queue = %logical, error = %e, "Skipping queue without DLQ");
            }
        }
    }

    if alerts_fired > 0 {
        println!("{alerts_fired} DLQ(s) over threshold");
        return Ok(1);
    }

    println!("All DLQs within threshold");
    Ok(0)
}

async fn cleanup(config: &AppConfig, days: Option<u32>) -> Result<u8> {
    let retention_days = days.unwrap_or(config.cleanup.retention_days);
    let store = idempotency_store(config).await?;

    let deleted = store.cleanup(retention_days).await?;
    println!("deleted {deleted} processed-event rows older than {retention_days} days");

    Ok(0)
}

async fn status(config: &AppConfig) -> Result<u8> {
    println!("driver:             {:?}", config.bus.driver);
    println!("prefix:             {}", config.bus.prefix);
    println!("service:            {}", config.bus.service);
    println!("dual_write:         {}", config.bus.dual_write);
    println!("fallback_to_legacy: {}", config.bus.fallback_to_legacy);
    println!();

    let resolver = resolver(config).await;
    let client = sqs_client(config).await;

    for logical in config.all_logical_queues() {
        match resolver.url_if_exists(&logical).await? {
            Some(url) => {
                let source = SqsQueueSource::new(
                    client.clone(),
                    url,
                    resolver.effective_name(&logical),
                    config.consumer.visibility_timeout_seconds,
                );
                let depth = source.depth().await?;
                println!(
                    "{logical}: visible={} in_flight={}",
                    depth.visible, depth.in_flight
                );
            }
            None => println!("{logical}: not created"),
        }
    }

    Ok(0)
}

fn check(config: &AppConfig) -> u8 {
    let mut problems = Vec::new();

    if let Err(e) = config.validate() {
        problems.push(e.to_string());
    }

    if let Err(e) =
        ListenerRegistry::from_bindings(&config.event_listeners, &listener_implementations())
    {
        problems.push(e.to_string());
    }

    // router wiring dry-run: legacy driver must construct when referenced
    if config.bus.driver == DriverKind::Legacy
        || config.bus.dual_write
        || config.bus.fallback_to_legacy
    {
        if let Err(e) =
            HttpLegacyDriver::new(config.legacy.endpoint_url.clone(), config.legacy.timeout_ms)
        {
            problems.push(format!("legacy driver: {e}"));
        }
    }

    if problems.is_empty() {
        println!("configuration OK");
        0
    } else {
        for problem in &problems {
            eprintln!("problem: {problem}");
        }
        1
    }
}

async fn publish(
    config: &AppConfig,
    event_type: &str,
    payload: &str,
    attributes: &[String],
) -> Result<u8> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("configuration invalid: {e}"))?;

    let payload: Value = serde_json::from_str(payload).context("payload is not valid JSON")?;

    let mut attrs = std::collections::BTreeMap::new();
    for pair in attributes {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("attribute '{pair}' is not key=value"))?;
        attrs.insert(key.to_string(), value.to_string());
    }

    let service = messaging_service(config).await?;
    let receipt = service.publish(event_type, payload, &attrs).await?;

    println!("driver:     {:?}", receipt.driver);
    println!("message_id: {}", receipt.message_id().unwrap_or("-"));
    println!("trace_id:   {}", receipt.trace_id);

    Ok(0)
}

async fn messaging_service(config: &AppConfig) -> Result<MessagingService> {
    let resolver = resolver(config).await;
    let publisher = Arc::new(rb_queue::SqsPublisher::new(
        sqs_client(config).await,
        resolver.clone(),
        config.bus.service.clone(),
    ));

    let legacy: Option<Arc<dyn rb_queue::LegacyDriver>> =
        if config.legacy.endpoint_url.is_empty() {
            None
        } else {
            Some(Arc::new(HttpLegacyDriver::new(
                config.legacy.endpoint_url.clone(),
                config.legacy.timeout_ms,
            )?))
        };

    let targets = TargetTable::new(
        config.target_queues.default.clone(),
        config.target_queues.events.clone().into_iter().collect(),
    );

    Ok(MessagingService::new(
        MessagingConfig {
            driver: match config.bus.driver {
                DriverKind::Managed => PrimaryDriver::Managed,
                DriverKind::Legacy => PrimaryDriver::Legacy,
            },
            dual_write: config.bus.dual_write,
            fallback_to_legacy: config.bus.fallback_to_legacy,
            service: config.bus.service.clone(),
        },
        publisher,
        resolver,
        legacy,
        targets,
    ))
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}
