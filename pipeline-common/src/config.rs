use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use thiserror::Error;

use crate::classify::{Classify, ErrorClass};
use crate::retry::RetryPolicy;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("RETRY_ATTEMPTS must be between 0 and 10, got {0}")]
    RetryAttempts(u32),
    #[error("RETRY_BACKOFF_SECONDS must be between 0.1 and 60.0, got {0}")]
    RetryBackoff(f64),
}

impl Classify for ConfigError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Fatal
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Which broker binding a stage talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Kafka protocol, straight to the brokers.
    Native,
    /// JSON frames over a WebSocket to a bus gateway, for networks that block the native one.
    Tunneled,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseTransportKindError(pub String);

impl FromStr for TransportKind {
    type Err = ParseTransportKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "native" | "kafka" => Ok(TransportKind::Native),
            "tunneled" | "tunnelled" | "websocket" => Ok(TransportKind::Tunneled),
            invalid => Err(ParseTransportKindError(invalid.to_owned())),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct BusConfig {
    #[envconfig(from = "MESSAGE_BUS_TRANSPORT", default = "native")]
    pub transport: TransportKind,

    #[envconfig(from = "MESSAGE_BUS_HOSTS", default = "localhost:9092")]
    pub hosts: String,

    #[envconfig(from = "MESSAGE_BUS_TLS", default = "false")]
    pub tls: bool,

    /// The single logical exchange every event is published to.
    #[envconfig(from = "MESSAGE_BUS_EXCHANGE", default = "copilot.events")]
    pub exchange: String,

    #[envconfig(from = "MESSAGE_BUS_TUNNEL_URL", default = "ws://localhost:8080/bus")]
    pub tunnel_url: String,

    #[envconfig(from = "MESSAGE_BUS_CONNECT_TIMEOUT_MS", default = "10000")]
    pub connect_timeout: EnvMsDuration,

    #[envconfig(from = "MESSAGE_BUS_PUBLISH_TIMEOUT_MS", default = "5000")]
    pub publish_timeout: EnvMsDuration,

    /// Deliveries requeued more often than this are dead-lettered instead.
    #[envconfig(from = "MESSAGE_BUS_MAX_REDELIVERIES", default = "3")]
    pub max_redeliveries: u32,

    /// Handlers a stage runs at once. Deliveries are processed one at a time by default.
    #[envconfig(from = "MESSAGE_BUS_MAX_CONCURRENT_HANDLERS", default = "1")]
    pub max_concurrent_handlers: usize,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    // We default to "earliest" so a new stage picks up events published before it started
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryConfig {
    /// Retries after the first try. 0 disables retrying.
    #[envconfig(from = "RETRY_ATTEMPTS", default = "3")]
    pub retry_attempts: u32,

    #[envconfig(from = "RETRY_BACKOFF_SECONDS", default = "1.0")]
    pub retry_backoff_seconds: f64,

    #[envconfig(from = "RETRY_MAXIMUM_INTERVAL_MS")]
    pub maximum_interval: Option<EnvMsDuration>,
}

impl RetryConfig {
    pub fn policy(&self) -> Result<RetryPolicy, ConfigError> {
        if self.retry_attempts > 10 {
            return Err(ConfigError::RetryAttempts(self.retry_attempts));
        }

        if !(0.1..=60.0).contains(&self.retry_backoff_seconds) {
            return Err(ConfigError::RetryBackoff(self.retry_backoff_seconds));
        }

        Ok(RetryPolicy::new(
            2,
            time::Duration::from_secs_f64(self.retry_backoff_seconds),
            self.maximum_interval.map(|interval| interval.0),
        )
        .with_max_retries(self.retry_attempts))
    }
}

/// Which document store backend a stage uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseStoreKindError(pub String);

impl FromStr for StoreKind {
    type Err = ParseStoreKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreKind::Postgres),
            "memory" => Ok(StoreKind::Memory),
            invalid => Err(ParseStoreKindError(invalid.to_owned())),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct StoreConfig {
    #[envconfig(from = "DOCUMENT_STORE_BACKEND", default = "postgres")]
    pub backend: StoreKind,

    /// Falls back to the `document_store_url` secret when unset.
    #[envconfig(from = "DOCUMENT_STORE_URL")]
    pub url: Option<String>,

    /// Read replica used for eventually consistent reads.
    #[envconfig(from = "DOCUMENT_STORE_REPLICA_URL")]
    pub replica_url: Option<String>,

    #[envconfig(from = "DOCUMENT_STORE_MAX_CONNECTIONS", default = "10")]
    pub max_connections: u32,

    #[envconfig(from = "DOCUMENT_STORE_RUN_MIGRATIONS", default = "true")]
    pub run_migrations: bool,

    /// Bound on a single store call, and on waiting for a pooled connection.
    #[envconfig(from = "DOCUMENT_STORE_OPERATION_TIMEOUT_MS", default = "5000")]
    pub operation_timeout: EnvMsDuration,
}
