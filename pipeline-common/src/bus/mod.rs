//! # Bus
//!
//! Publishing and consuming events through the message broker.
//!
//! All events go to a single exchange and are routed by a key derived from their type, see
//! [`crate::event::routing_key`]. The broker binding is picked once from configuration:
//! Kafka when the brokers are reachable, or a WebSocket tunnel to a bus gateway when the
//! network in between only lets HTTP through. An in-process broker backs the tests.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::error::KafkaError;
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, instrument, warn};

use crate::classify::{classify_message, Classify, ErrorClass};
use crate::config::{BusConfig, TransportKind};
use crate::event::EventEnvelope;
use crate::retry::{RetryError, RetryPolicy};
use crate::schema::{SchemaError, SchemaRegistry};
use crate::secrets::BusCredentials;

pub mod kafka;
pub mod memory;
pub mod tunnel;

pub use memory::{DeadLetter, MemoryBroker};

pub const DEAD_LETTER_SUFFIX: &str = ".dead_letter";
pub const EVENT_TYPE_HEADER: &str = "event_type";
pub const REDELIVERY_HEADER: &str = "x-redelivery-count";
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";

pub const EVENTS_PUBLISHED: &str = "pipeline_events_published_total";
pub const PUBLISH_FAILURES: &str = "pipeline_publish_failures_total";

/// Where dead-lettered messages of `exchange` end up.
pub fn dead_letter_exchange(exchange: &str) -> String {
    format!("{exchange}{DEAD_LETTER_SUFFIX}")
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error(transparent)]
    Validation(#[from] SchemaError),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("connection closed by broker")]
    ConnectionClosed,
    #[error("not connected to the message bus")]
    NotConnected,
    #[error("broker rejected the request: {0}")]
    Rejected(String),
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid message bus configuration: {0}")]
    Config(String),
    #[error("unexpected frame from gateway: {0}")]
    Protocol(String),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("in-memory broker lock poisoned")]
    Poisoned,
    #[error("gave up after {attempts} attempts: {error}")]
    RetriesExhausted { attempts: u32, error: Box<BusError> },
}

impl Classify for BusError {
    fn class(&self) -> ErrorClass {
        match self {
            BusError::Kafka(error) => error.class(),
            BusError::WebSocket(error) => classify_websocket(error),
            BusError::Timeout { .. } | BusError::ConnectionClosed => ErrorClass::Transient,
            BusError::Rejected(message) => classify_message(message),
            BusError::RetriesExhausted { error, .. } => error.class(),
            BusError::Validation(_)
            | BusError::NotConnected
            | BusError::Serialization(_)
            | BusError::Config(_)
            | BusError::Protocol(_)
            | BusError::Task(_)
            | BusError::Poisoned => ErrorClass::Fatal,
        }
    }
}

fn classify_websocket(error: &tungstenite::Error) -> ErrorClass {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ErrorClass::Transient
        }
        tungstenite::Error::Io(error) => error.class(),
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status.is_server_error() || status.as_u16() == 429 {
                ErrorClass::Transient
            } else {
                ErrorClass::Fatal
            }
        }
        tungstenite::Error::Url(_) | tungstenite::Error::HttpFormat(_) => ErrorClass::Fatal,
        other => classify_message(&other.to_string()),
    }
}

impl From<RetryError<BusError>> for BusError {
    fn from(error: RetryError<BusError>) -> Self {
        match error {
            RetryError::Fatal(error) => error,
            RetryError::Exhausted { attempts, error } => BusError::RetriesExhausted {
                attempts,
                error: Box::new(error),
            },
        }
    }
}

/// Timeouts and naming shared by both ends of a binding.
#[derive(Debug, Clone)]
pub struct BusSettings {
    pub exchange: String,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
}

impl BusSettings {
    pub fn new(exchange: &str) -> Self {
        Self {
            exchange: exchange.to_owned(),
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
        }
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            exchange: config.exchange.clone(),
            connect_timeout: config.connect_timeout.0,
            publish_timeout: config.publish_timeout.0,
        }
    }
}

async fn with_timeout<T>(
    operation: &'static str,
    timeout: Duration,
    future: impl Future<Output = Result<T, BusError>>,
) -> Result<T, BusError> {
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(BusError::Timeout { operation, timeout }),
    }
}

enum PublisherTransport {
    Kafka(kafka::KafkaPublisher),
    Tunnel(tunnel::TunnelPublisher),
    Memory(memory::MemoryPublisher),
}

impl PublisherTransport {
    fn name(&self) -> &'static str {
        match self {
            PublisherTransport::Kafka(_) => "kafka",
            PublisherTransport::Tunnel(_) => "tunnel",
            PublisherTransport::Memory(_) => "memory",
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            PublisherTransport::Kafka(transport) => transport.is_connected(),
            PublisherTransport::Tunnel(transport) => transport.is_connected(),
            PublisherTransport::Memory(transport) => transport.is_connected(),
        }
    }

    async fn connect(&self) -> Result<(), BusError> {
        match self {
            PublisherTransport::Kafka(transport) => transport.connect().await,
            PublisherTransport::Tunnel(transport) => transport.connect().await,
            PublisherTransport::Memory(transport) => transport.connect().await,
        }
    }

    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &EventEnvelope,
        payload: &[u8],
    ) -> Result<(), BusError> {
        match self {
            PublisherTransport::Kafka(transport) => {
                transport
                    .send(exchange, routing_key, &envelope.event_type, payload)
                    .await
            }
            PublisherTransport::Tunnel(transport) => {
                transport
                    .send(exchange, routing_key, &envelope.event_type, payload)
                    .await
            }
            PublisherTransport::Memory(transport) => {
                transport.send(routing_key, envelope, payload).await
            }
        }
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        match self {
            PublisherTransport::Kafka(transport) => transport.disconnect().await,
            PublisherTransport::Tunnel(transport) => transport.disconnect().await,
            PublisherTransport::Memory(transport) => transport.disconnect().await,
        }
    }
}

/// Publishes validated events.
///
/// A publisher owns one broker connection and is not meant for concurrent publishes: every
/// call takes `&mut self`. Share one between tasks behind a mutex.
pub struct Publisher {
    transport: PublisherTransport,
    registry: Arc<SchemaRegistry>,
    retry: RetryPolicy,
    settings: BusSettings,
}

impl Publisher {
    fn new(
        transport: PublisherTransport,
        registry: Arc<SchemaRegistry>,
        retry: RetryPolicy,
        settings: BusSettings,
    ) -> Self {
        Self {
            transport,
            registry,
            retry,
            settings,
        }
    }

    pub fn from_config(
        config: &BusConfig,
        credentials: &BusCredentials,
        registry: Arc<SchemaRegistry>,
        retry: RetryPolicy,
    ) -> Result<Self, BusError> {
        let transport = match config.transport {
            TransportKind::Native => PublisherTransport::Kafka(kafka::KafkaPublisher::new(
                kafka::KafkaSettings::from_config(config, credentials),
            )),
            TransportKind::Tunneled => PublisherTransport::Tunnel(tunnel::TunnelPublisher::new(
                tunnel::TunnelSettings::from_config(config, credentials)?,
            )),
        };

        Ok(Self::new(
            transport,
            registry,
            retry,
            BusSettings::from_config(config),
        ))
    }

    pub fn memory(
        broker: &MemoryBroker,
        registry: Arc<SchemaRegistry>,
        retry: RetryPolicy,
        settings: BusSettings,
    ) -> Self {
        Self::new(
            PublisherTransport::Memory(memory::MemoryPublisher::new(broker.clone())),
            registry,
            retry,
            settings,
        )
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Connect to the broker. Does nothing when already connected.
    #[instrument(skip_all, fields(transport = self.transport.name()))]
    pub async fn connect(&mut self) -> Result<(), BusError> {
        if self.transport.is_connected() {
            return Ok(());
        }

        let transport = &self.transport;
        let timeout = self.settings.connect_timeout;

        self.retry
            .execute("bus.connect", move || {
                with_timeout("connect", timeout, transport.connect())
            })
            .await?;

        info!(exchange = %self.settings.exchange, "connected to message bus");
        Ok(())
    }

    /// Validate `data` against the current contract for `event_type` and publish it.
    /// Returns the envelope that was sent.
    pub async fn publish(
        &mut self,
        event_type: &str,
        data: Value,
    ) -> Result<EventEnvelope, BusError> {
        let envelope = match EventEnvelope::current(&self.registry, event_type, data) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(event_type, error = %error, "refusing to publish invalid event");
                metrics::counter!(PUBLISH_FAILURES, "event_type" => event_type.to_owned(), "reason" => "validation")
                    .increment(1);
                return Err(error.into());
            }
        };
        self.publish_envelope(&envelope).await?;

        Ok(envelope)
    }

    /// Publish an already built envelope. Retries resend this same envelope.
    #[instrument(skip_all, fields(event_type = %envelope.event_type, event_id = %envelope.event_id))]
    pub async fn publish_envelope(&mut self, envelope: &EventEnvelope) -> Result<(), BusError> {
        // Nothing reaches the transport unless the payload satisfies its contract.
        if let Err(error) = envelope.validate(&self.registry) {
            warn!(error = %error, "refusing to publish invalid event");
            metrics::counter!(PUBLISH_FAILURES, "event_type" => envelope.event_type.clone(), "reason" => "validation")
                .increment(1);
            return Err(error.into());
        }

        let payload = envelope.to_bytes()?;
        let routing_key = envelope.routing_key();

        self.connect().await?;

        let transport = &self.transport;
        let exchange = self.settings.exchange.as_str();
        let routing_key = routing_key.as_str();
        let payload = payload.as_slice();
        let connect_timeout = self.settings.connect_timeout;
        let publish_timeout = self.settings.publish_timeout;

        let result = self
            .retry
            .execute("bus.publish", move || async move {
                // A failed send may have dropped the connection; reconnecting is part of
                // this attempt and does not count as the send succeeding.
                if !transport.is_connected() {
                    with_timeout("connect", connect_timeout, transport.connect()).await?;
                }
                with_timeout(
                    "publish",
                    publish_timeout,
                    transport.send(exchange, routing_key, envelope, payload),
                )
                .await
            })
            .await;

        match result {
            Ok(()) => {
                debug!(routing_key, "published event");
                metrics::counter!(EVENTS_PUBLISHED, "event_type" => envelope.event_type.clone())
                    .increment(1);
                Ok(())
            }
            Err(error) => {
                metrics::counter!(PUBLISH_FAILURES, "event_type" => envelope.event_type.clone(), "reason" => "transport")
                    .increment(1);
                Err(error.into())
            }
        }
    }

    pub async fn disconnect(&mut self) -> Result<(), BusError> {
        if !self.transport.is_connected() {
            return Ok(());
        }

        self.transport.disconnect().await?;
        info!("disconnected from message bus");
        Ok(())
    }
}

enum SubscriberTransport {
    Kafka(kafka::KafkaSubscriber),
    Tunnel(tunnel::TunnelSubscriber),
    Memory(memory::MemorySubscriber),
}

impl SubscriberTransport {
    fn name(&self) -> &'static str {
        match self {
            SubscriberTransport::Kafka(_) => "kafka",
            SubscriberTransport::Tunnel(_) => "tunnel",
            SubscriberTransport::Memory(_) => "memory",
        }
    }

    async fn connect(&self, exchange: &str, queue: &str, bindings: &[String]) -> Result<(), BusError> {
        match self {
            SubscriberTransport::Kafka(transport) => transport.connect(exchange, queue, bindings).await,
            SubscriberTransport::Tunnel(transport) => transport.connect(exchange, queue, bindings).await,
            SubscriberTransport::Memory(transport) => transport.connect(bindings).await,
        }
    }

    async fn recv(&mut self) -> Result<Delivery, BusError> {
        match self {
            SubscriberTransport::Kafka(transport) => transport.recv().await,
            SubscriberTransport::Tunnel(transport) => transport.recv().await,
            SubscriberTransport::Memory(transport) => transport.recv().await,
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        match self {
            SubscriberTransport::Kafka(transport) => transport.close().await,
            SubscriberTransport::Tunnel(transport) => transport.close().await,
            SubscriberTransport::Memory(transport) => transport.close().await,
        }
    }
}

/// Consumes events bound to one named queue (a Kafka consumer group, or a gateway queue).
pub struct Subscriber {
    transport: SubscriberTransport,
    registry: Arc<SchemaRegistry>,
    retry: RetryPolicy,
    settings: BusSettings,
    queue: String,
    bindings: Vec<String>,
    connected: bool,
}

impl Subscriber {
    fn new(
        transport: SubscriberTransport,
        queue: &str,
        registry: Arc<SchemaRegistry>,
        retry: RetryPolicy,
        settings: BusSettings,
    ) -> Self {
        Self {
            transport,
            registry,
            retry,
            settings,
            queue: queue.to_owned(),
            bindings: Vec::new(),
            connected: false,
        }
    }

    pub fn from_config(
        config: &BusConfig,
        credentials: &BusCredentials,
        queue: &str,
        registry: Arc<SchemaRegistry>,
        retry: RetryPolicy,
    ) -> Result<Self, BusError> {
        let transport = match config.transport {
            TransportKind::Native => SubscriberTransport::Kafka(kafka::KafkaSubscriber::new(
                kafka::KafkaSettings::from_config(config, credentials),
            )),
            TransportKind::Tunneled => SubscriberTransport::Tunnel(tunnel::TunnelSubscriber::new(
                tunnel::TunnelSettings::from_config(config, credentials)?,
            )),
        };

        Ok(Self::new(
            transport,
            queue,
            registry,
            retry,
            BusSettings::from_config(config),
        ))
    }

    pub fn memory(
        broker: &MemoryBroker,
        queue: &str,
        registry: Arc<SchemaRegistry>,
        retry: RetryPolicy,
        settings: BusSettings,
    ) -> Self {
        Self::new(
            SubscriberTransport::Memory(memory::MemorySubscriber::new(broker.clone(), queue)),
            queue,
            registry,
            retry,
            settings,
        )
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn bindings(&self) -> &[String] {
        &self.bindings
    }

    /// Bind the queue to an event type. Must happen before connecting.
    pub fn subscribe(&mut self, event_type: &str) -> Result<(), BusError> {
        if self.connected {
            return Err(BusError::Config(format!(
                "cannot subscribe to {event_type} after connecting"
            )));
        }

        if self.registry.current_version(event_type).is_none() {
            return Err(SchemaError::UnknownContract {
                event_type: event_type.to_owned(),
                version: "any".to_owned(),
            }
            .into());
        }

        let routing_key = crate::event::routing_key(event_type);
        if !self.bindings.contains(&routing_key) {
            self.bindings.push(routing_key);
        }

        Ok(())
    }

    #[instrument(skip_all, fields(transport = self.transport.name(), queue = %self.queue))]
    pub async fn connect(&mut self) -> Result<(), BusError> {
        if self.connected {
            return Ok(());
        }

        if self.bindings.is_empty() {
            return Err(BusError::Config(
                "subscriber has no bindings, subscribe to an event type first".to_owned(),
            ));
        }

        let transport = &self.transport;
        let exchange = self.settings.exchange.as_str();
        let queue = self.queue.as_str();
        let bindings = self.bindings.as_slice();
        let timeout = self.settings.connect_timeout;

        self.retry
            .execute("bus.subscribe", move || {
                with_timeout("connect", timeout, transport.connect(exchange, queue, bindings))
            })
            .await?;

        self.connected = true;
        info!(bindings = ?self.bindings, "subscribed to message bus");
        Ok(())
    }

    /// Wait for the next delivery.
    pub async fn recv(&mut self) -> Result<Delivery, BusError> {
        if !self.connected {
            return Err(BusError::NotConnected);
        }

        self.transport.recv().await
    }

    /// Stop consuming and close the connection.
    pub async fn close(&mut self) -> Result<(), BusError> {
        if !self.connected {
            return Ok(());
        }

        self.connected = false;
        self.transport.close().await?;
        info!(queue = %self.queue, "closed subscription");
        Ok(())
    }
}

pub(crate) enum Acker {
    Kafka(kafka::KafkaAcker),
    Tunnel(tunnel::TunnelAcker),
    Memory(memory::MemoryAcker),
}

/// A consumed message. Must be settled exactly once with `ack` or `nack`.
pub struct Delivery {
    payload: Vec<u8>,
    routing_key: String,
    redelivery_count: u32,
    acker: Acker,
}

impl Delivery {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// How many times this message was requeued before this delivery.
    pub fn redelivery_count(&self) -> u32 {
        self.redelivery_count
    }

    pub async fn ack(self) -> Result<(), BusError> {
        match self.acker {
            Acker::Kafka(acker) => acker.ack(),
            Acker::Tunnel(acker) => acker.ack().await,
            Acker::Memory(acker) => acker.ack(),
        }
    }

    /// Reject the message. With `requeue` it is delivered again later, otherwise it is
    /// dead-lettered with `reason`.
    pub async fn nack(self, requeue: bool, reason: &str) -> Result<(), BusError> {
        match (self.acker, requeue) {
            (Acker::Kafka(acker), true) => {
                acker
                    .requeue(&self.routing_key, &self.payload, self.redelivery_count)
                    .await
            }
            (Acker::Kafka(acker), false) => {
                acker
                    .dead_letter(&self.routing_key, &self.payload, reason)
                    .await
            }
            (Acker::Tunnel(acker), requeue) => acker.nack(requeue, reason).await,
            (Acker::Memory(acker), true) => {
                acker.requeue(self.routing_key, self.payload, self.redelivery_count)
            }
            (Acker::Memory(acker), false) => {
                acker.dead_letter(self.routing_key, self.payload, reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Arc<SchemaRegistry> {
        Arc::new(SchemaRegistry::builtin().unwrap())
    }

    fn retry() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(10), None)
    }

    fn archive_ingested() -> Value {
        json!({
            "archive_id": "0123456789abcdef",
            "source_name": "ietf-quic",
            "source_type": "local",
            "source_url": "/data/quic.mbox",
            "file_path": "/data/quic.mbox",
            "file_size_bytes": 10,
            "file_hash_sha256": "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            "ingestion_started_at": "2024-01-01T00:00:00Z",
            "ingestion_completed_at": "2024-01-01T00:00:01Z"
        })
    }

    fn publisher(broker: &MemoryBroker) -> Publisher {
        Publisher::memory(broker, registry(), retry(), BusSettings::new("copilot.events"))
    }

    fn subscriber(broker: &MemoryBroker, queue: &str) -> Subscriber {
        Subscriber::memory(
            broker,
            queue,
            registry(),
            retry(),
            BusSettings::new("copilot.events"),
        )
    }

    #[tokio::test]
    async fn test_invalid_payload_never_reaches_transport() {
        let broker = MemoryBroker::new();
        let mut publisher = publisher(&broker);

        let mut data = archive_ingested();
        data.as_object_mut().unwrap().remove("archive_id");

        let error = publisher
            .publish("ArchiveIngested", data)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            BusError::Validation(SchemaError::Invalid(_))
        ));
        assert_eq!(error.class(), ErrorClass::Fatal);
        assert_eq!(broker.publish_calls(), 0);
        assert_eq!(broker.connect_calls(), 0);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_rejected() {
        let broker = MemoryBroker::new();
        let mut publisher = publisher(&broker);

        assert!(matches!(
            publisher.publish("ArchiveExploded", json!({})).await,
            Err(BusError::Validation(SchemaError::UnknownContract { .. }))
        ));
        assert_eq!(broker.publish_calls(), 0);

        let mut subscriber = subscriber(&broker, "parsing");
        assert!(matches!(
            subscriber.subscribe("ArchiveExploded"),
            Err(BusError::Validation(SchemaError::UnknownContract { .. }))
        ));
    }

    #[tokio::test]
    async fn test_publish_and_consume() {
        let broker = MemoryBroker::new();
        let mut subscriber = subscriber(&broker, "parsing");
        subscriber.subscribe("ArchiveIngested").unwrap();
        subscriber.connect().await.unwrap();
        assert_eq!(subscriber.bindings(), ["archive.ingested"]);

        let mut publisher = publisher(&broker);
        let envelope = publisher
            .publish("ArchiveIngested", archive_ingested())
            .await
            .unwrap();

        assert_eq!(envelope.version, "1.0");
        assert_eq!(broker.published(), vec![envelope.clone()]);

        let delivery = subscriber.recv().await.unwrap();
        assert_eq!(delivery.routing_key(), "archive.ingested");
        assert_eq!(delivery.redelivery_count(), 0);
        assert_eq!(
            EventEnvelope::from_bytes(delivery.payload()).unwrap(),
            envelope
        );

        delivery.ack().await.unwrap();
        assert_eq!(broker.acks(), 1);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let broker = MemoryBroker::new();
        let mut publisher = publisher(&broker);

        publisher.connect().await.unwrap();
        publisher.connect().await.unwrap();
        assert_eq!(broker.connect_calls(), 1);

        publisher.disconnect().await.unwrap();
        assert!(!publisher.is_connected());
        publisher.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_publish_failures_resend_same_envelope() {
        let broker = MemoryBroker::new();
        let mut publisher = publisher(&broker);
        broker.fail_next_publishes(["Connection reset by peer", "broker unavailable"]);

        let envelope = publisher
            .publish("ArchiveIngested", archive_ingested())
            .await
            .unwrap();

        assert_eq!(broker.publish_calls(), 3);
        assert_eq!(broker.published(), vec![envelope]);
    }

    #[tokio::test]
    async fn test_fatal_publish_failure_is_not_retried() {
        let broker = MemoryBroker::new();
        let mut publisher = publisher(&broker);
        broker.fail_next_publishes(["ACCESS_REFUSED - login refused"]);

        let error = publisher
            .publish("ArchiveIngested", archive_ingested())
            .await
            .unwrap_err();

        assert!(matches!(error, BusError::Rejected(_)));
        assert_eq!(broker.publish_calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_publish_reports_attempts() {
        let broker = MemoryBroker::new();
        let mut publisher = publisher(&broker);
        broker.fail_next_publishes(["timed out"; 4]);

        let error = publisher
            .publish("ArchiveIngested", archive_ingested())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            BusError::RetriesExhausted { attempts: 4, .. }
        ));
        assert_eq!(error.class(), ErrorClass::Transient);
        assert_eq!(broker.publish_calls(), 4);
    }

    #[tokio::test]
    async fn test_connect_failures_are_retried() {
        let broker = MemoryBroker::new();
        let mut publisher = publisher(&broker);
        broker.fail_next_connects(["connection refused"]);

        publisher.connect().await.unwrap();
        assert_eq!(broker.connect_calls(), 2);
        assert!(publisher.is_connected());
    }

    #[tokio::test]
    async fn test_requeue_and_dead_letter() {
        let broker = MemoryBroker::new();
        let mut subscriber = subscriber(&broker, "parsing");
        subscriber.subscribe("ArchiveIngested").unwrap();
        subscriber.connect().await.unwrap();

        broker.inject("archive.ingested", b"payload".to_vec()).unwrap();

        let delivery = subscriber.recv().await.unwrap();
        delivery.nack(true, "store unavailable").await.unwrap();

        let delivery = subscriber.recv().await.unwrap();
        assert_eq!(delivery.redelivery_count(), 1);
        assert_eq!(delivery.payload(), b"payload");
        delivery.nack(false, "gave up").await.unwrap();

        assert_eq!(
            broker.dead_letters(),
            vec![DeadLetter {
                queue: "parsing".to_owned(),
                routing_key: "archive.ingested".to_owned(),
                payload: b"payload".to_vec(),
                reason: "gave up".to_owned(),
            }]
        );
    }

    #[tokio::test]
    async fn test_subscriber_only_gets_bound_keys() {
        let broker = MemoryBroker::new();
        let mut subscriber = subscriber(&broker, "parsing");
        subscriber.subscribe("ArchiveIngested").unwrap();
        subscriber.connect().await.unwrap();

        broker.inject("json.parsed", b"other".to_vec()).unwrap();
        broker.inject("archive.ingested", b"mine".to_vec()).unwrap();

        let delivery = subscriber.recv().await.unwrap();
        assert_eq!(delivery.payload(), b"mine");
    }

    #[tokio::test]
    async fn test_subscribe_after_connect_fails() {
        let broker = MemoryBroker::new();
        let mut subscriber = subscriber(&broker, "parsing");

        assert!(matches!(
            subscriber.connect().await,
            Err(BusError::Config(_))
        ));
        assert!(matches!(
            subscriber.recv().await,
            Err(BusError::NotConnected)
        ));

        subscriber.subscribe("ArchiveIngested").unwrap();
        subscriber.connect().await.unwrap();
        assert!(matches!(
            subscriber.subscribe("JSONParsed"),
            Err(BusError::Config(_))
        ));
    }

    #[test]
    fn test_classify_bus_errors() {
        assert_eq!(BusError::ConnectionClosed.class(), ErrorClass::Transient);
        assert_eq!(
            BusError::Timeout {
                operation: "publish",
                timeout: Duration::from_secs(1)
            }
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(
            BusError::WebSocket(tungstenite::Error::ConnectionClosed).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            BusError::WebSocket(tungstenite::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset"
            )))
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(
            BusError::Config("bad".to_owned()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            BusError::Rejected("403 Forbidden".to_owned()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(dead_letter_exchange("copilot.events"), "copilot.events.dead_letter");
    }
}
