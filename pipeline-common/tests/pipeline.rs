use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use envconfig::Envconfig;
use pipeline_common::bus::{BusSettings, MemoryBroker, Publisher, Subscriber};
use pipeline_common::config::BusConfig;
use pipeline_common::event::EventEnvelope;
use pipeline_common::ids::{archive_id, content_hash, message_id, thread_id, EntityKind};
use pipeline_common::retry::RetryPolicy;
use pipeline_common::runtime::{OutgoingEvent, RuntimeSettings, StageError, StageHandler, StageRuntime};
use pipeline_common::schema::SchemaRegistry;
use pipeline_common::store::{DocumentStore, Filter, ReadConsistency};
use serde_json::{json, Value};
use tokio::sync::Mutex;

const EXCHANGE: &str = "copilot.events";

/// Stores one message per archive and announces it.
struct ParsingStage;

#[async_trait]
impl StageHandler for ParsingStage {
    fn name(&self) -> &str {
        "parsing"
    }

    fn subscriptions(&self) -> Vec<String> {
        vec!["ArchiveIngested".to_owned()]
    }

    async fn handle(
        &self,
        event: &EventEnvelope,
        store: &DocumentStore,
    ) -> Result<Vec<OutgoingEvent>, StageError> {
        let archive_id: pipeline_common::ids::DocumentId =
            serde_json::from_value(event.data["archive_id"].clone())
                .map_err(|error| StageError::Fatal(error.to_string()))?;

        let message = message_id(
            &archive_id,
            "<first@example.com>",
            "Mon, 1 Jan 2024 00:00:00 +0000",
            "alice@example.com",
            "QUIC draft",
        );
        let thread = thread_id("<first@example.com>");

        store
            .upsert(
                EntityKind::Message.collection(),
                &message,
                &json!({
                    "archive_id": archive_id,
                    "thread_id": thread,
                    "subject": "QUIC draft",
                }),
            )
            .await?;

        Ok(vec![OutgoingEvent::new(
            "JSONParsed",
            json!({
                "archive_id": archive_id,
                "message_count": 1,
                "parsed_message_ids": [message],
                "thread_count": 1,
                "thread_ids": [thread],
                "parsing_duration_seconds": 0.1
            }),
        )])
    }
}

fn archive_ingested(blob: &[u8]) -> Value {
    json!({
        "archive_id": archive_id(blob),
        "source_name": "ietf-quic",
        "source_type": "local",
        "source_url": "/data/quic.mbox",
        "file_path": "/data/quic.mbox",
        "file_size_bytes": blob.len(),
        "file_hash_sha256": content_hash(blob),
        "ingestion_started_at": "2024-01-01T00:00:00Z",
        "ingestion_completed_at": "2024-01-01T00:00:01Z"
    })
}

#[tokio::test]
async fn test_stage_consumes_stores_and_publishes_downstream() {
    let broker = MemoryBroker::new();
    let registry = Arc::new(SchemaRegistry::builtin().unwrap());
    let retry = RetryPolicy::new(2, Duration::from_millis(10), None);
    let settings = BusSettings::new(EXCHANGE);
    let store = DocumentStore::memory(retry.clone());

    // Downstream chunking stage, bound before anything is published.
    let mut chunking = Subscriber::memory(
        &broker,
        "chunking",
        registry.clone(),
        retry.clone(),
        settings.clone(),
    );
    chunking.subscribe("JSONParsed").unwrap();
    chunking.connect().await.unwrap();

    let mut runtime = StageRuntime::new(
        ParsingStage,
        Subscriber::memory(
            &broker,
            "parsing",
            registry.clone(),
            retry.clone(),
            settings.clone(),
        ),
        Arc::new(Mutex::new(Publisher::memory(
            &broker,
            registry.clone(),
            retry.clone(),
            settings.clone(),
        ))),
        store.clone(),
        retry.clone(),
        RuntimeSettings::from_config(&BusConfig::init_from_hashmap(&HashMap::new()).unwrap()),
    );
    runtime.start().await.unwrap();

    let (shutdown, signal) = tokio::sync::oneshot::channel::<()>();
    let stage = tokio::spawn(runtime.run(async move { signal.await.unwrap_or_default() }));

    let mut ingestion = Publisher::memory(&broker, registry.clone(), retry.clone(), settings);
    let blob = b"From alice@example.com Mon Jan  1 00:00:00 2024\n\nhello";
    let ingested = ingestion
        .publish("ArchiveIngested", archive_ingested(blob))
        .await
        .unwrap();
    // A redelivery of the same event must not change anything.
    ingestion.publish_envelope(&ingested).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), chunking.recv())
        .await
        .unwrap()
        .unwrap();
    let parsed = EventEnvelope::from_bytes(first.payload()).unwrap();
    first.ack().await.unwrap();

    assert_eq!(parsed.event_type, "JSONParsed");
    assert_eq!(parsed.data["archive_id"], json!(archive_id(blob)));
    parsed.validate(&registry).unwrap();

    let second = tokio::time::timeout(Duration::from_secs(5), chunking.recv())
        .await
        .unwrap()
        .unwrap();
    second.ack().await.unwrap();

    shutdown.send(()).unwrap();
    stage.await.unwrap().unwrap();

    let messages = store
        .query(
            EntityKind::Message.collection(),
            &Filter::new()
                .field_eq("archive_id", archive_id(blob).as_str())
                .consistency(ReadConsistency::Strong),
        )
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body["subject"], "QUIC draft");

    assert_eq!(broker.published_of("JSONParsed").len(), 2);
    assert!(broker.dead_letters().is_empty());
    // Two inputs and two outputs acknowledged.
    assert_eq!(broker.acks(), 4);
}
