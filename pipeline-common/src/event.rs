use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::schema::{SchemaError, SchemaRegistry};

/// The envelope every event travels in.
///
/// An envelope is built once per occurrence: retried publishes send the same envelope,
/// so consumers can use `event_id` to recognise redeliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub data: Value,
}

impl EventEnvelope {
    pub fn new(event_type: &str, version: &str, data: Value) -> Self {
        Self {
            event_type: event_type.to_owned(),
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: version.to_owned(),
            data,
        }
    }

    /// Build an envelope for the current contract version of `event_type` and check `data`
    /// against it.
    pub fn current(
        registry: &SchemaRegistry,
        event_type: &str,
        data: Value,
    ) -> Result<Self, SchemaError> {
        let version = registry
            .current_version(event_type)
            .ok_or_else(|| SchemaError::UnknownContract {
                event_type: event_type.to_owned(),
                version: "any".to_owned(),
            })?;

        let envelope = Self::new(event_type, version, data);
        envelope.validate(registry)?;
        Ok(envelope)
    }

    pub fn routing_key(&self) -> String {
        routing_key(&self.event_type)
    }

    pub fn validate(&self, registry: &SchemaRegistry) -> Result<(), SchemaError> {
        registry.validate(&self.event_type, &self.version, &self.data)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Derive the routing key for an event type: `ArchiveIngestionFailed` becomes
/// `archive.ingestion.failed`, `JSONParsed` becomes `json.parsed`.
pub fn routing_key(event_type: &str) -> String {
    let chars: Vec<char> = event_type.chars().collect();
    let mut key = String::with_capacity(event_type.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if i > 0 && c.is_uppercase() {
            let previous = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());

            // A new word starts after a lowercase letter, or at the last capital of an acronym.
            if previous.is_lowercase()
                || previous.is_ascii_digit()
                || (previous.is_uppercase() && next_is_lower)
            {
                key.push('.');
            }
        }
        key.extend(c.to_lowercase());
    }

    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_routing_keys() {
        for (event_type, expected) in [
            ("ArchiveIngested", "archive.ingested"),
            ("ArchiveIngestionFailed", "archive.ingestion.failed"),
            ("JSONParsed", "json.parsed"),
            ("ParsingFailed", "parsing.failed"),
            ("ChunksPrepared", "chunks.prepared"),
            ("EmbeddingGenerationFailed", "embedding.generation.failed"),
            ("SummaryComplete", "summary.complete"),
            ("ReportDeliveryFailed", "report.delivery.failed"),
            ("Ping", "ping"),
        ] {
            assert_eq!(routing_key(event_type), expected);
        }
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = EventEnvelope::new("ArchiveIngested", "1.0", json!({"archive_id": "x"}));
        let wire: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(wire["event_type"], "ArchiveIngested");
        assert_eq!(wire["version"], "1.0");
        assert_eq!(wire["data"], json!({"archive_id": "x"}));
        assert_eq!(
            Uuid::parse_str(wire["event_id"].as_str().unwrap())
                .unwrap()
                .get_version_num(),
            4
        );
        assert!(wire["timestamp"].as_str().unwrap().ends_with('Z'));

        let decoded = EventEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_current_uses_latest_contract_and_validates() {
        let registry = SchemaRegistry::builtin().unwrap();

        let envelope = EventEnvelope::current(
            &registry,
            "ChunkingFailed",
            json!({
                "message_doc_ids": ["0123456789abcdef"],
                "error_message": "chunker crashed",
                "error_type": "RuntimeError",
                "retry_count": 0,
                "failed_at": "2024-01-01T00:00:00Z"
            }),
        )
        .unwrap();
        assert_eq!(envelope.event_type, "ChunkingFailed");
        assert_eq!(envelope.version, "1.0");

        assert!(matches!(
            EventEnvelope::current(&registry, "ChunkingFailed", json!({})),
            Err(SchemaError::Invalid(_))
        ));
        assert!(matches!(
            EventEnvelope::current(&registry, "NoSuchEvent", json!({})),
            Err(SchemaError::UnknownContract { .. })
        ));
    }

    #[test]
    fn test_envelopes_get_fresh_ids() {
        let a = EventEnvelope::new("ArchiveIngested", "1.0", json!({}));
        let b = EventEnvelope::new("ArchiveIngested", "1.0", json!({}));

        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(EventEnvelope::from_bytes(b"not json").is_err());
        assert!(EventEnvelope::from_bytes(br#"{"event_type": "ArchiveIngested"}"#).is_err());
    }
}
