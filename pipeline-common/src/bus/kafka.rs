//! Native binding: the exchange is a Kafka topic, routing keys are message keys.
//!
//! Every queue is a consumer group reading the exchange topic and keeping only the routing
//! keys it is bound to. Requeued messages go to a retry topic private to the queue, so other
//! queues never see them twice. Dead letters go to `<exchange>.dead_letter`.
//!
//! Deliveries may settle out of order when handlers run concurrently. The stored offset of a
//! partition only moves up to its lowest unsettled delivery, so a crash redelivers whatever
//! was still in flight.
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use metrics::gauge;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tracing::{debug, info};

use super::{
    dead_letter_exchange, Acker, BusError, Delivery, DEAD_LETTER_REASON_HEADER,
    EVENT_TYPE_HEADER, REDELIVERY_HEADER,
};
use crate::config::BusConfig;
use crate::event::routing_key;
use crate::secrets::BusCredentials;

pub struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("pipeline_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("pipeline_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("pipeline_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("pipeline_kafka_producer_queue_bytes").set(stats.msg_size as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!("pipeline_kafka_broker_requests_pending", "broker" => id_string.clone())
                .set(stats.outbuf_cnt as f64);
            gauge!("pipeline_kafka_broker_responses_awaiting", "broker" => id_string)
                .set(stats.waitresp_cnt as f64);
        }
    }
}

impl ConsumerContext for KafkaContext {}

/// Topic holding the messages `queue` asked to see again.
pub fn retry_topic(exchange: &str, queue: &str) -> String {
    format!("{exchange}.retry.{queue}")
}

#[derive(Clone)]
pub struct KafkaSettings {
    pub hosts: String,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub producer_linger_ms: u32,
    pub message_timeout_ms: u32,
    pub compression_codec: String,
    pub offset_reset: String,
    pub metadata_timeout: Duration,
}

impl std::fmt::Debug for KafkaSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaSettings")
            .field("hosts", &self.hosts)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl KafkaSettings {
    pub fn new(hosts: &str) -> Self {
        Self {
            hosts: hosts.to_owned(),
            tls: false,
            username: None,
            password: None,
            producer_linger_ms: 20,
            message_timeout_ms: 20000,
            compression_codec: "none".to_owned(),
            offset_reset: "earliest".to_owned(),
            metadata_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &BusConfig, credentials: &BusCredentials) -> Self {
        Self {
            hosts: config.hosts.clone(),
            tls: config.tls,
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            producer_linger_ms: config.kafka_producer_linger_ms,
            message_timeout_ms: config.kafka_message_timeout_ms,
            compression_codec: config.kafka_compression_codec.clone(),
            offset_reset: config.kafka_consumer_offset_reset.clone(),
            metadata_timeout: config.connect_timeout.0,
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.hosts)
            .set("statistics.interval.ms", "10000");

        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                let protocol = if self.tls { "sasl_ssl" } else { "sasl_plaintext" };
                client_config
                    .set("security.protocol", protocol)
                    .set("sasl.mechanisms", "PLAIN")
                    .set("sasl.username", username)
                    .set("sasl.password", password);
            }
            _ if self.tls => {
                client_config.set("security.protocol", "ssl");
            }
            _ => {}
        }

        client_config
    }

    pub fn producer_config(&self) -> ClientConfig {
        let mut client_config = self.client_config();
        client_config
            .set("linger.ms", self.producer_linger_ms.to_string())
            .set("message.timeout.ms", self.message_timeout_ms.to_string())
            .set("compression.codec", self.compression_codec.to_owned());
        client_config
    }

    pub fn consumer_config(&self, group: &str) -> ClientConfig {
        let mut client_config = self.client_config();
        client_config
            .set("group.id", group)
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", &self.offset_reset);
        client_config
    }

    fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.message_timeout_ms))
    }
}

async fn create_producer(settings: &KafkaSettings) -> Result<FutureProducer<KafkaContext>, BusError> {
    let client_config = settings.producer_config();
    debug!("rdkafka configuration: {:?}", settings);
    let producer: FutureProducer<KafkaContext> = client_config.create_with_context(KafkaContext)?;

    // "Ping" the brokers by requesting metadata, the client connects lazily otherwise.
    let ping = producer.clone();
    let timeout = settings.metadata_timeout;
    let topics = tokio::task::spawn_blocking(move || {
        ping.client()
            .fetch_metadata(None, timeout)
            .map(|metadata| metadata.topics().len())
    })
    .await??;
    info!("connected to Kafka brokers, found {} topics", topics);

    Ok(producer)
}

async fn produce(
    producer: &FutureProducer<KafkaContext>,
    delivery_timeout: Duration,
    topic: &str,
    key: &str,
    payload: &[u8],
    headers: OwnedHeaders,
) -> Result<(), BusError> {
    let delivery = producer
        .send_result(FutureRecord {
            topic,
            partition: None,
            payload: Some(payload),
            key: Some(key),
            timestamp: None,
            headers: Some(headers),
        })
        .map_err(|(error, _)| error)?;

    match delivery.await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err((error, _))) => Err(error.into()),
        // The producer dropped the message without reporting back.
        Err(_) => Err(BusError::Timeout {
            operation: "kafka delivery",
            timeout: delivery_timeout,
        }),
    }
}

fn delivery_headers(event_type: Option<&str>, redelivery_count: u32) -> OwnedHeaders {
    let count = redelivery_count.to_string();
    let headers = OwnedHeaders::new().insert(Header {
        key: REDELIVERY_HEADER,
        value: Some(count.as_str()),
    });

    match event_type {
        Some(event_type) => headers.insert(Header {
            key: EVENT_TYPE_HEADER,
            value: Some(event_type),
        }),
        None => headers,
    }
}

pub struct KafkaPublisher {
    settings: KafkaSettings,
    producer: Mutex<Option<FutureProducer<KafkaContext>>>,
}

impl KafkaPublisher {
    pub fn new(settings: KafkaSettings) -> Self {
        Self {
            settings,
            producer: Mutex::new(None),
        }
    }

    fn producer(&self) -> Result<Option<FutureProducer<KafkaContext>>, BusError> {
        Ok(self.producer.lock().map_err(|_| BusError::Poisoned)?.clone())
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.producer(), Ok(Some(_)))
    }

    pub async fn connect(&self) -> Result<(), BusError> {
        let producer = create_producer(&self.settings).await?;
        *self.producer.lock().map_err(|_| BusError::Poisoned)? = Some(producer);
        Ok(())
    }

    pub async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        event_type: &str,
        payload: &[u8],
    ) -> Result<(), BusError> {
        let producer = self.producer()?.ok_or(BusError::NotConnected)?;

        produce(
            &producer,
            self.settings.delivery_timeout(),
            exchange,
            routing_key,
            payload,
            delivery_headers(Some(event_type), 0),
        )
        .await
    }

    pub async fn disconnect(&self) -> Result<(), BusError> {
        let producer = self.producer.lock().map_err(|_| BusError::Poisoned)?.take();

        if let Some(producer) = producer {
            let timeout = self.settings.delivery_timeout();
            tokio::task::spawn_blocking(move || producer.flush(timeout)).await??;
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    /// One past the highest settled offset.
    next: Option<i64>,
    stored: Option<i64>,
}

/// Which offsets may be stored, per topic partition.
#[derive(Debug, Default)]
struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

impl OffsetTracker {
    fn received(&mut self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .entry((topic.to_owned(), partition))
            .or_default()
            .in_flight
            .insert(offset);
    }

    /// Mark `offset` done. Returns the offset to store when the committable position moved.
    fn settled(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let offsets = self
            .partitions
            .entry((topic.to_owned(), partition))
            .or_default();

        offsets.in_flight.remove(&offset);
        offsets.next = Some(offsets.next.map_or(offset + 1, |next| next.max(offset + 1)));

        // Partitions are read in order, so everything below the lowest in-flight offset is done.
        let committable = match offsets.in_flight.first() {
            Some(lowest) => *lowest,
            None => offsets.next?,
        };

        if offsets.stored.is_some_and(|stored| stored >= committable) {
            return None;
        }

        offsets.stored = Some(committable);
        Some(committable)
    }
}

/// The retry topic only exists once something was requeued.
fn is_missing_topic(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(RDKafkaErrorCode::UnknownTopic | RDKafkaErrorCode::UnknownTopicOrPartition)
    )
}

struct ConsumerState {
    consumer: StreamConsumer<KafkaContext>,
    producer: FutureProducer<KafkaContext>,
    exchange: String,
    queue: String,
    bindings: Vec<String>,
    delivery_timeout: Duration,
    offsets: Mutex<OffsetTracker>,
}

impl ConsumerState {
    fn received(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BusError> {
        self.offsets
            .lock()
            .map_err(|_| BusError::Poisoned)?
            .received(topic, partition, offset);
        Ok(())
    }

    fn settle(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BusError> {
        // Held while storing so concurrent settles cannot store out of order.
        let mut offsets = self.offsets.lock().map_err(|_| BusError::Poisoned)?;

        if let Some(next) = offsets.settled(topic, partition, offset) {
            self.consumer.store_offset(topic, partition, next)?;
        }

        Ok(())
    }
}

pub struct KafkaSubscriber {
    settings: KafkaSettings,
    state: Mutex<Option<Arc<ConsumerState>>>,
}

impl KafkaSubscriber {
    pub fn new(settings: KafkaSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(None),
        }
    }

    pub async fn connect(
        &self,
        exchange: &str,
        queue: &str,
        bindings: &[String],
    ) -> Result<(), BusError> {
        let producer = create_producer(&self.settings).await?;

        let consumer: StreamConsumer<KafkaContext> = self
            .settings
            .consumer_config(queue)
            .create_with_context(KafkaContext)?;
        let retry = retry_topic(exchange, queue);
        consumer.subscribe(&[exchange, retry.as_str()])?;

        let state = ConsumerState {
            consumer,
            producer,
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            bindings: bindings.to_vec(),
            delivery_timeout: self.settings.delivery_timeout(),
            offsets: Mutex::new(OffsetTracker::default()),
        };
        *self.state.lock().map_err(|_| BusError::Poisoned)? = Some(Arc::new(state));

        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Delivery, BusError> {
        let state = self
            .state
            .get_mut()
            .map_err(|_| BusError::Poisoned)?
            .clone()
            .ok_or(BusError::NotConnected)?;

        loop {
            let message = match state.consumer.recv().await {
                Ok(message) => message,
                Err(error) if is_missing_topic(&error) => {
                    debug!(error = %error, "subscribed topic does not exist yet");
                    continue;
                }
                Err(error) => return Err(error.into()),
            };
            let key = message_routing_key(&message);
            let (topic, partition, offset) = (message.topic(), message.partition(), message.offset());
            state.received(topic, partition, offset)?;

            let bound = key
                .as_ref()
                .is_some_and(|key| state.bindings.contains(key));
            if !bound {
                // Not for this queue: move past it.
                state.settle(topic, partition, offset)?;
                continue;
            }

            return Ok(Delivery {
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                routing_key: key.unwrap_or_default(),
                redelivery_count: message_redelivery_count(&message),
                acker: Acker::Kafka(KafkaAcker {
                    state: Arc::downgrade(&state),
                    topic: message.topic().to_owned(),
                    partition: message.partition(),
                    offset: message.offset(),
                }),
            });
        }
    }

    pub async fn close(&self) -> Result<(), BusError> {
        let state = self.state.lock().map_err(|_| BusError::Poisoned)?.take();

        if let Some(state) = state {
            state.consumer.unsubscribe();
        }

        Ok(())
    }
}

fn header_value<'a>(message: &'a BorrowedMessage<'_>, name: &str) -> Option<&'a str> {
    message
        .headers()?
        .iter()
        .find(|header| header.key == name)
        .and_then(|header| header.value)
        .and_then(|value| std::str::from_utf8(value).ok())
}

fn message_routing_key(message: &BorrowedMessage<'_>) -> Option<String> {
    match message.key().map(std::str::from_utf8) {
        Some(Ok(key)) => Some(key.to_owned()),
        _ => header_value(message, EVENT_TYPE_HEADER).map(routing_key),
    }
}

fn message_redelivery_count(message: &BorrowedMessage<'_>) -> u32 {
    header_value(message, REDELIVERY_HEADER)
        .and_then(|count| count.parse().ok())
        .unwrap_or(0)
}

pub(crate) struct KafkaAcker {
    state: Weak<ConsumerState>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl KafkaAcker {
    fn state(&self) -> Result<Arc<ConsumerState>, BusError> {
        self.state.upgrade().ok_or(BusError::ConnectionClosed)
    }

    pub(crate) fn ack(self) -> Result<(), BusError> {
        self.state()?
            .settle(&self.topic, self.partition, self.offset)
    }

    pub(crate) async fn requeue(
        self,
        routing_key: &str,
        payload: &[u8],
        redelivery_count: u32,
    ) -> Result<(), BusError> {
        let state = self.state()?;

        produce(
            &state.producer,
            state.delivery_timeout,
            &retry_topic(&state.exchange, &state.queue),
            routing_key,
            payload,
            delivery_headers(None, redelivery_count + 1),
        )
        .await?;

        self.ack()
    }

    pub(crate) async fn dead_letter(
        self,
        routing_key: &str,
        payload: &[u8],
        reason: &str,
    ) -> Result<(), BusError> {
        let state = self.state()?;
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: DEAD_LETTER_REASON_HEADER,
                value: Some(reason),
            })
            .insert(Header {
                key: "queue",
                value: Some(state.queue.as_str()),
            });

        produce(
            &state.producer,
            state.delivery_timeout,
            &dead_letter_exchange(&state.exchange),
            routing_key,
            payload,
            headers,
        )
        .await?;

        self.ack()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::mocking::MockCluster;

    fn settings(hosts: &str) -> KafkaSettings {
        KafkaSettings {
            producer_linger_ms: 0,
            message_timeout_ms: 500,
            ..KafkaSettings::new(hosts)
        }
    }

    #[test]
    fn test_client_config_authentication() {
        let mut settings = settings("kafka:9092");
        assert_eq!(settings.producer_config().get("security.protocol"), None);

        settings.tls = true;
        assert_eq!(
            settings.producer_config().get("security.protocol"),
            Some("ssl")
        );

        settings.username = Some("pipeline".to_owned());
        settings.password = Some("hunter2".to_owned());
        let config = settings.consumer_config("parsing");
        assert_eq!(config.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(config.get("sasl.username"), Some("pipeline"));
        assert_eq!(config.get("group.id"), Some("parsing"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert!(!format!("{:?}", settings).contains("hunter2"));
    }

    #[test]
    fn test_offsets_wait_for_lowest_unsettled_delivery() {
        let mut offsets = OffsetTracker::default();
        for offset in 10..13 {
            offsets.received("copilot.events", 0, offset);
        }
        offsets.received("copilot.events", 1, 4);

        // 11 and 12 finish before 10: nothing may be stored past 10 yet.
        assert_eq!(offsets.settled("copilot.events", 0, 12), Some(10));
        assert_eq!(offsets.settled("copilot.events", 0, 11), None);
        assert_eq!(offsets.settled("copilot.events", 0, 10), Some(13));

        // Partitions are independent.
        assert_eq!(offsets.settled("copilot.events", 1, 4), Some(5));

        offsets.received("copilot.events", 0, 13);
        assert_eq!(offsets.settled("copilot.events", 0, 13), Some(14));
    }

    #[test]
    fn test_missing_topics_are_skipped() {
        assert!(is_missing_topic(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopicOrPartition
        )));
        assert!(is_missing_topic(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopic
        )));
        assert!(!is_missing_topic(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::TopicAuthorizationFailed
        )));
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(
            retry_topic("copilot.events", "parsing"),
            "copilot.events.retry.parsing"
        );
    }

    #[tokio::test]
    async fn test_publish_to_mock_cluster() {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let publisher = KafkaPublisher::new(settings(&cluster.bootstrap_servers()));

        assert!(!publisher.is_connected());
        assert!(matches!(
            publisher
                .send("copilot.events", "archive.ingested", "ArchiveIngested", b"{}")
                .await,
            Err(BusError::NotConnected)
        ));

        publisher.connect().await.expect("failed to connect");
        assert!(publisher.is_connected());

        // The mock broker needs a moment to elect a leader for the new topic.
        let mut sent = false;
        for _ in 0..20 {
            if publisher
                .send("copilot.events", "archive.ingested", "ArchiveIngested", b"{}")
                .await
                .is_ok()
            {
                sent = true;
                break;
            }
        }
        assert!(sent);

        publisher.disconnect().await.expect("failed to flush");
        assert!(!publisher.is_connected());
    }
}
