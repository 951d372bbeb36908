//! Service configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use bus::BusConfig;
use bus::handlers::OutboxPolicy;
use outbox::ProcessorConfig;

use crate::error::{Result, ServerError};

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

/// Service configuration with defaults for local runs.
///
/// Reads from environment variables:
/// - `HOST` / `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `DATABASE_URL`: PostgreSQL; unset runs on the in-memory database
/// - `NATS_URL`: NATS server; unset uses the in-memory broker
/// - `SEARCH_URL`: search store base URL; unset uses the in-memory index
/// - `OUTBOX_WORKERS`, `OUTBOX_BATCH_SIZE`, `OUTBOX_POLL_INTERVAL_MS`,
///   `OUTBOX_PUBLISH_TIMEOUT_MS`, `OUTBOX_STALE_LEASE_MS`,
///   `OUTBOX_MAX_RETRIES`, `OUTBOX_TOPIC_PREFIX`: relay tuning
/// - `BUS_STATEMENT_TIMEOUT_MS`, `BUS_EVENT_CHANNEL_CAPACITY`,
///   `BUS_MAX_CONCURRENT_HANDLERS`, `BUS_SHUTDOWN_GRACE_MS`: message bus
///   tuning
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub nats_url: Option<String>,
    pub search_url: Option<String>,
    pub search_timeout: Duration,
    pub outbox_workers: usize,
    pub outbox_batch_size: usize,
    pub outbox_poll_interval: Duration,
    pub outbox_publish_timeout: Duration,
    pub outbox_stale_lease: Duration,
    pub outbox_max_retries: i32,
    pub outbox_topic_prefix: String,
    pub bus_statement_timeout: Duration,
    pub bus_event_channel_capacity: usize,
    pub bus_max_concurrent_handlers: usize,
    pub bus_shutdown_grace: Duration,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from `lookup`, falling back to defaults for
    /// missing keys and failing on values that do not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parsed(&lookup, "PORT", defaults.port)?,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parsed(&lookup, "LOG_FORMAT", defaults.log_format)?,
            database_url: non_empty(lookup("DATABASE_URL")),
            database_max_connections: parsed(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            nats_url: non_empty(lookup("NATS_URL")),
            search_url: non_empty(lookup("SEARCH_URL")),
            search_timeout: Duration::from_millis(parsed(
                &lookup,
                "SEARCH_TIMEOUT_MS",
                defaults.search_timeout.as_millis() as u64,
            )?),
            outbox_workers: parsed(&lookup, "OUTBOX_WORKERS", defaults.outbox_workers)?,
            outbox_batch_size: parsed(&lookup, "OUTBOX_BATCH_SIZE", defaults.outbox_batch_size)?,
            outbox_poll_interval: millis(
                &lookup,
                "OUTBOX_POLL_INTERVAL_MS",
                defaults.outbox_poll_interval,
            )?,
            outbox_publish_timeout: millis(
                &lookup,
                "OUTBOX_PUBLISH_TIMEOUT_MS",
                defaults.outbox_publish_timeout,
            )?,
            outbox_stale_lease: millis(
                &lookup,
                "OUTBOX_STALE_LEASE_MS",
                defaults.outbox_stale_lease,
            )?,
            outbox_max_retries: parsed(&lookup, "OUTBOX_MAX_RETRIES", defaults.outbox_max_retries)?,
            outbox_topic_prefix: lookup("OUTBOX_TOPIC_PREFIX")
                .unwrap_or(defaults.outbox_topic_prefix),
            bus_statement_timeout: millis(
                &lookup,
                "BUS_STATEMENT_TIMEOUT_MS",
                defaults.bus_statement_timeout,
            )?,
            bus_event_channel_capacity: parsed(
                &lookup,
                "BUS_EVENT_CHANNEL_CAPACITY",
                defaults.bus_event_channel_capacity,
            )?,
            bus_max_concurrent_handlers: parsed(
                &lookup,
                "BUS_MAX_CONCURRENT_HANDLERS",
                defaults.bus_max_concurrent_handlers,
            )?,
            bus_shutdown_grace: millis(
                &lookup,
                "BUS_SHUTDOWN_GRACE_MS",
                defaults.bus_shutdown_grace,
            )?,
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            workers: self.outbox_workers,
            batch_size: self.outbox_batch_size,
            poll_interval: self.outbox_poll_interval,
            publish_timeout: self.outbox_publish_timeout,
            stale_lease: self.outbox_stale_lease,
            topic_prefix: self.outbox_topic_prefix.clone(),
            ..ProcessorConfig::default()
        }
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            statement_timeout: self.bus_statement_timeout,
            event_channel_capacity: self.bus_event_channel_capacity,
            max_concurrent_handlers: self.bus_max_concurrent_handlers,
            shutdown_grace: self.bus_shutdown_grace,
        }
    }

    pub fn outbox_policy(&self) -> OutboxPolicy {
        OutboxPolicy {
            max_retries: self.outbox_max_retries,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let processor = ProcessorConfig::default();
        let bus = BusConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            database_max_connections: 10,
            nats_url: None,
            search_url: None,
            search_timeout: Duration::from_secs(5),
            outbox_workers: processor.workers,
            outbox_batch_size: processor.batch_size,
            outbox_poll_interval: processor.poll_interval,
            outbox_publish_timeout: processor.publish_timeout,
            outbox_stale_lease: processor.stale_lease,
            outbox_max_retries: OutboxPolicy::default().max_retries,
            outbox_topic_prefix: processor.topic_prefix,
            bus_statement_timeout: bus.statement_timeout,
            bus_event_channel_capacity: bus.event_channel_capacity,
            bus_max_concurrent_handlers: bus.max_concurrent_handlers,
            bus_shutdown_grace: bus.shutdown_grace,
        }
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ServerError::Config { key, value }),
        None => Ok(default),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration> {
    parsed(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
