use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde_json::Value;

use super::{Document, DocumentStatus, Filter, StoreError, UpsertOutcome};
use crate::ids::DocumentId;

#[derive(Debug, Default)]
struct MemoryState {
    documents: HashMap<(String, DocumentId), (u64, Document)>,
    next_seq: u64,
}

/// A DocumentStore backend keeping everything in process memory.
///
/// Clones share the same documents. Reads are always strongly consistent.
#[derive(Clone, Debug, Default)]
pub struct MemoryDocumentStore {
    state: Arc<RwLock<MemoryState>>,
    failures: Arc<AtomicU32>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with a transient pool timeout.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn injected_failure(&self, command: &str) -> Result<(), StoreError> {
        let consumed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        match consumed {
            Ok(_) => Err(StoreError::QueryError {
                command: command.to_owned(),
                error: sqlx::Error::PoolTimedOut,
            }),
            Err(_) => Ok(()),
        }
    }

    pub(super) fn upsert(
        &self,
        collection: &str,
        id: &DocumentId,
        body: &Value,
    ) -> Result<UpsertOutcome, StoreError> {
        self.injected_failure("INSERT")?;
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        let key = (collection.to_owned(), id.clone());

        if let Some((_, existing)) = state.documents.get(&key) {
            return if existing.body == *body {
                Ok(UpsertOutcome::Unchanged)
            } else {
                Err(StoreError::Conflict {
                    collection: collection.to_owned(),
                    id: id.clone(),
                })
            };
        }

        let now = Utc::now();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.documents.insert(
            key,
            (
                seq,
                Document {
                    collection: collection.to_owned(),
                    id: id.clone(),
                    body: body.clone(),
                    status: DocumentStatus::Pending,
                    created_at: now,
                    updated_at: now,
                },
            ),
        );

        Ok(UpsertOutcome::Created)
    }

    pub(super) fn get(&self, collection: &str, id: &DocumentId) -> Result<Document, StoreError> {
        self.injected_failure("SELECT")?;
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;

        state
            .documents
            .get(&(collection.to_owned(), id.clone()))
            .map(|(_, document)| document.clone())
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_owned(),
                id: id.clone(),
            })
    }

    pub(super) fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        self.injected_failure("SELECT")?;
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;

        let mut matching: Vec<&(u64, Document)> = state
            .documents
            .values()
            .filter(|(_, document)| document.collection == collection && filter.matches(document))
            .collect();
        matching.sort_by_key(|(seq, document)| (document.created_at, *seq));

        let limit = filter
            .limit
            .and_then(|limit| usize::try_from(limit).ok())
            .unwrap_or(usize::MAX);

        Ok(matching
            .into_iter()
            .take(limit)
            .map(|(_, document)| document.clone())
            .collect())
    }

    pub(super) fn delete(&self, collection: &str, id: &DocumentId) -> Result<(), StoreError> {
        self.injected_failure("DELETE")?;
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;

        match state.documents.remove(&(collection.to_owned(), id.clone())) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                collection: collection.to_owned(),
                id: id.clone(),
            }),
        }
    }

    pub(super) fn transition(
        &self,
        collection: &str,
        id: &DocumentId,
        to: DocumentStatus,
    ) -> Result<DocumentStatus, StoreError> {
        self.injected_failure("UPDATE")?;
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;

        let (_, document) = state
            .documents
            .get_mut(&(collection.to_owned(), id.clone()))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_owned(),
                id: id.clone(),
            })?;

        let from = document.status;
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                collection: collection.to_owned(),
                id: id.clone(),
                from,
                to,
            });
        }

        document.status = to;
        document.updated_at = Utc::now();

        Ok(from)
    }

    /// Number of documents stored in `collection`.
    pub fn count(&self, collection: &str) -> usize {
        self.state
            .read()
            .map(|state| {
                state
                    .documents
                    .keys()
                    .filter(|(c, _)| c == collection)
                    .count()
            })
            .unwrap_or(0)
    }
}
