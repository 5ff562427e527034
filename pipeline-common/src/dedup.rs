//! Content hash index, shared by every run of a stage.
//!
//! Records live in the `checksums` collection keyed by [`checksum_id`], so recording the
//! same hash twice is an idempotent upsert, and a hash already pointing elsewhere shows up
//! as a conflict.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ids::{checksum_id, DocumentId, EntityKind};
use crate::store::{DocumentStore, ReadConsistency, StoreError};

pub const DUPLICATES_SKIPPED: &str = "pipeline_duplicates_skipped_total";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    pub hash: String,
    pub entity_id: DocumentId,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    New,
    Duplicate {
        entity_id: DocumentId,
        first_seen: DateTime<Utc>,
    },
}

impl Seen {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Seen::Duplicate { .. })
    }
}

#[derive(Clone, Debug)]
pub struct ChecksumIndex {
    store: DocumentStore,
}

impl ChecksumIndex {
    pub fn new(store: DocumentStore) -> Self {
        Self { store }
    }

    fn collection() -> &'static str {
        EntityKind::Checksum.collection()
    }

    /// Look `hash` up. Reads are strongly consistent: a stale miss would mean a duplicate
    /// downstream event.
    pub async fn check(&self, hash: &str) -> Result<Option<ChecksumRecord>, StoreError> {
        let record = self
            .store
            .find(Self::collection(), &checksum_id(hash), ReadConsistency::Strong)
            .await?;

        match record {
            Some(document) => Ok(Some(document.deserialize()?)),
            None => Ok(None),
        }
    }

    /// Record that `hash` belongs to `entity_id`.
    pub async fn record(&self, hash: &str, entity_id: &DocumentId) -> Result<Seen, StoreError> {
        if let Some(existing) = self.check(hash).await? {
            debug!(hash, entity_id = %existing.entity_id, "hash already indexed");
            metrics::counter!(DUPLICATES_SKIPPED, "collection" => Self::collection()).increment(1);
            return Ok(Seen::Duplicate {
                entity_id: existing.entity_id,
                first_seen: existing.first_seen,
            });
        }

        let record = ChecksumRecord {
            hash: hash.to_owned(),
            entity_id: entity_id.clone(),
            first_seen: Utc::now(),
        };

        match self
            .store
            .upsert(Self::collection(), &checksum_id(hash), &record)
            .await
        {
            Ok(_) => Ok(Seen::New),
            // Someone else indexed it between our check and our write.
            Err(StoreError::Conflict { .. }) => match self.check(hash).await? {
                Some(existing) => Ok(Seen::Duplicate {
                    entity_id: existing.entity_id,
                    first_seen: existing.first_seen,
                }),
                None => Err(StoreError::NotFound {
                    collection: Self::collection().to_owned(),
                    id: checksum_id(hash),
                }),
            },
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{archive_id, content_hash};
    use crate::retry::RetryPolicy;

    #[tokio::test]
    async fn test_record_then_duplicate() {
        let index = ChecksumIndex::new(DocumentStore::memory(RetryPolicy::no_retries()));
        let blob = b"From alice@example.com Mon Jan  1 00:00:00 2024";
        let hash = content_hash(blob);
        let id = archive_id(blob);

        assert_eq!(index.check(&hash).await.unwrap(), None);
        assert_eq!(index.record(&hash, &id).await.unwrap(), Seen::New);

        let record = index.check(&hash).await.unwrap().unwrap();
        assert_eq!(record.entity_id, id);
        assert_eq!(record.hash, hash);

        let seen = index.record(&hash, &id).await.unwrap();
        assert!(seen.is_duplicate());
        assert_eq!(
            seen,
            Seen::Duplicate {
                entity_id: id,
                first_seen: record.first_seen,
            }
        );
    }

    #[tokio::test]
    async fn test_different_hashes_are_independent() {
        let index = ChecksumIndex::new(DocumentStore::memory(RetryPolicy::no_retries()));

        let first = content_hash(b"one");
        let second = content_hash(b"two");

        assert_eq!(
            index.record(&first, &archive_id(b"one")).await.unwrap(),
            Seen::New
        );
        assert_eq!(
            index.record(&second, &archive_id(b"two")).await.unwrap(),
            Seen::New
        );
    }
}
