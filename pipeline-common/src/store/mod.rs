//! # Store
//!
//! The document store every stage persists its entities in.
//!
//! Documents are JSON bodies addressed by `(collection, id)`, where the id always comes from
//! [`crate::ids`]. Writes are idempotent upserts: writing an equal body under an existing id
//! is a no-op, writing a different one is a [`StoreError::Conflict`]. The processing status of
//! a document lives beside its body so that status changes never make an upsert conflict.
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::classify::{classify_sqlx, Classify, ErrorClass};
use crate::config::{StoreConfig, StoreKind};
use crate::ids::{DocumentId, IdError};
use crate::retry::{RetryError, RetryPolicy};

pub mod memory;
pub mod postgres;

pub use memory::MemoryDocumentStore;
pub use postgres::PgDocumentStore;

pub const STORE_CONFLICTS: &str = "pipeline_store_conflicts_total";
pub const STORE_WRITES: &str = "pipeline_store_writes_total";

/// Enumeration of errors for operations with a DocumentStore.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{collection}/{id} not found")]
    NotFound { collection: String, id: DocumentId },
    #[error("{collection}/{id} already exists with different content")]
    Conflict { collection: String, id: DocumentId },
    #[error("{collection}/{id} cannot move from {from} to {to}")]
    InvalidTransition {
        collection: String,
        id: DocumentId,
        from: DocumentStatus,
        to: DocumentStatus,
    },
    #[error("{collection}/{id} status changed while moving it from {expected}")]
    StatusChanged {
        collection: String,
        id: DocumentId,
        expected: DocumentStatus,
    },
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("failed to serialize document: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("{0} is not a valid DocumentStatus")]
    ParseDocumentStatusError(String),
    #[error("stored document has an invalid id: {0}")]
    InvalidId(#[from] IdError),
    #[error("failed to run migrations: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
    #[error("in-memory store lock poisoned")]
    Poisoned,
    #[error("no document store url configured")]
    MissingUrl,
    #[error("{operation} did not finish within {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("gave up after {attempts} attempts: {error}")]
    RetriesExhausted {
        attempts: u32,
        error: Box<StoreError>,
    },
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::PoolCreationError { error } | StoreError::QueryError { error, .. } => {
                classify_sqlx(error)
            }
            StoreError::RetriesExhausted { error, .. } => error.class(),
            StoreError::Timeout { .. } => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

impl From<RetryError<StoreError>> for StoreError {
    fn from(error: RetryError<StoreError>) -> Self {
        match error {
            RetryError::Fatal(error) => error,
            RetryError::Exhausted { attempts, error } => StoreError::RetriesExhausted {
                attempts,
                error: Box::new(error),
            },
        }
    }
}

/// Where a document is in its owning stage's processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    FailedMaxRetries,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
            DocumentStatus::FailedMaxRetries => "failed_max_retries",
        }
    }

    /// Allowed moves: pending -> processing -> completed | failed | failed_max_retries,
    /// and failed -> processing to retry.
    pub fn can_transition_to(&self, to: DocumentStatus) -> bool {
        matches!(
            (self, to),
            (DocumentStatus::Pending, DocumentStatus::Processing)
                | (DocumentStatus::Processing, DocumentStatus::Completed)
                | (DocumentStatus::Processing, DocumentStatus::Failed)
                | (DocumentStatus::Processing, DocumentStatus::FailedMaxRetries)
                | (DocumentStatus::Failed, DocumentStatus::Processing)
        )
    }
}

/// Allow casting DocumentStatus from strings.
impl FromStr for DocumentStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            "failed_max_retries" => Ok(DocumentStatus::FailedMaxRetries),
            invalid => Err(StoreError::ParseDocumentStatusError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub collection: String,
    pub id: DocumentId,
    pub body: Value,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    /// An equal document was already stored under the same id.
    Unchanged,
}

/// Whether a read may be served by a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadConsistency {
    /// Replica reads, possibly a little behind the latest writes.
    #[default]
    Eventual,
    /// Read from the primary, observing every acknowledged write.
    Strong,
}

/// Selects documents of a collection. Field filters compare top-level body fields for equality.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub fields: Vec<(String, Value)>,
    pub status: Option<DocumentStatus>,
    pub limit: Option<i64>,
    pub consistency: ReadConsistency,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.push((field.to_owned(), value.into()));
        self
    }

    pub fn status(mut self, status: DocumentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn consistency(mut self, consistency: ReadConsistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn matches(&self, document: &Document) -> bool {
        if self.status.is_some_and(|status| status != document.status) {
            return false;
        }

        self.fields
            .iter()
            .all(|(field, value)| document.body.get(field) == Some(value))
    }
}

/// The backends a DocumentStore can run on, chosen once at startup.
#[derive(Clone, Debug)]
pub enum StoreBackend {
    Postgres(PgDocumentStore),
    Memory(MemoryDocumentStore),
}

impl StoreBackend {
    async fn upsert(
        &self,
        collection: &str,
        id: &DocumentId,
        body: &Value,
    ) -> Result<UpsertOutcome, StoreError> {
        match self {
            StoreBackend::Postgres(store) => store.upsert(collection, id, body).await,
            StoreBackend::Memory(store) => store.upsert(collection, id, body),
        }
    }

    async fn get(
        &self,
        collection: &str,
        id: &DocumentId,
        consistency: ReadConsistency,
    ) -> Result<Document, StoreError> {
        match self {
            StoreBackend::Postgres(store) => store.get(collection, id, consistency).await,
            StoreBackend::Memory(store) => store.get(collection, id),
        }
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        match self {
            StoreBackend::Postgres(store) => store.query(collection, filter).await,
            StoreBackend::Memory(store) => store.query(collection, filter),
        }
    }

    async fn delete(&self, collection: &str, id: &DocumentId) -> Result<(), StoreError> {
        match self {
            StoreBackend::Postgres(store) => store.delete(collection, id).await,
            StoreBackend::Memory(store) => store.delete(collection, id),
        }
    }

    async fn transition(
        &self,
        collection: &str,
        id: &DocumentId,
        to: DocumentStatus,
    ) -> Result<DocumentStatus, StoreError> {
        match self {
            StoreBackend::Postgres(store) => store.transition(collection, id, to).await,
            StoreBackend::Memory(store) => store.transition(collection, id, to),
        }
    }
}

/// Default bound on a single backend call.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Run one backend call, failing it as a transient timeout once `timeout` passes.
async fn bounded<T>(
    operation: &'static str,
    timeout: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| StoreError::Timeout { operation, timeout })?
}

/// The document store handle shared by a stage. Cheap to clone, safe to use concurrently.
/// Every call runs through the configured RetryPolicy, each attempt bounded by the
/// operation timeout.
#[derive(Clone, Debug)]
pub struct DocumentStore {
    backend: StoreBackend,
    retry: RetryPolicy,
    timeout: Duration,
}

impl DocumentStore {
    pub fn new(backend: StoreBackend, retry: RetryPolicy) -> Self {
        Self {
            backend,
            retry,
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn operation_timeout(&self) -> Duration {
        self.timeout
    }

    /// An in-process store, for tests and local runs.
    pub fn memory(retry: RetryPolicy) -> Self {
        Self::new(StoreBackend::Memory(MemoryDocumentStore::new()), retry)
    }

    /// Build the configured backend. `url` is the primary connection string, from the
    /// configuration or the secrets provider.
    pub async fn from_config(
        config: &StoreConfig,
        url: Option<&str>,
        retry: RetryPolicy,
    ) -> Result<Self, StoreError> {
        let backend = match config.backend {
            StoreKind::Memory => StoreBackend::Memory(MemoryDocumentStore::new()),
            StoreKind::Postgres => {
                let url = url.ok_or(StoreError::MissingUrl)?;
                let replica_url = config.replica_url.as_deref();
                let timeout = config.operation_timeout.0;

                let store = retry
                    .execute("store.connect", move || {
                        PgDocumentStore::new(url, replica_url, config.max_connections, timeout)
                    })
                    .await
                    .map_err(StoreError::from)?;

                if config.run_migrations {
                    store.migrate().await?;
                }

                StoreBackend::Postgres(store)
            }
        };

        Ok(Self::new(backend, retry).with_operation_timeout(config.operation_timeout.0))
    }

    pub fn backend(&self) -> &StoreBackend {
        &self.backend
    }

    /// Store `document` under `id`, unless an equal document is already there.
    pub async fn upsert<T: Serialize + ?Sized>(
        &self,
        collection: &str,
        id: &DocumentId,
        document: &T,
    ) -> Result<UpsertOutcome, StoreError> {
        let body = serde_json::to_value(document)?;
        let body = &body;
        let backend = &self.backend;
        let timeout = self.timeout;

        let result = self
            .retry
            .execute("store.upsert", move || {
                bounded("store.upsert", timeout, backend.upsert(collection, id, body))
            })
            .await
            .map_err(StoreError::from);

        match &result {
            Ok(outcome) => {
                debug!(collection, %id, ?outcome, "upserted document");
                metrics::counter!(STORE_WRITES, "collection" => collection.to_owned()).increment(1);
            }
            Err(StoreError::Conflict { .. }) => {
                warn!(collection, %id, "upsert conflicts with stored document");
                metrics::counter!(STORE_CONFLICTS, "collection" => collection.to_owned())
                    .increment(1);
            }
            Err(_) => {}
        }

        result
    }

    pub async fn get(
        &self,
        collection: &str,
        id: &DocumentId,
        consistency: ReadConsistency,
    ) -> Result<Document, StoreError> {
        let backend = &self.backend;
        let timeout = self.timeout;

        self.retry
            .execute("store.get", move || {
                bounded("store.get", timeout, backend.get(collection, id, consistency))
            })
            .await
            .map_err(StoreError::from)
    }

    /// Like `get`, but a missing document is `None` instead of an error.
    pub async fn find(
        &self,
        collection: &str,
        id: &DocumentId,
        consistency: ReadConsistency,
    ) -> Result<Option<Document>, StoreError> {
        match self.get(collection, id, consistency).await {
            Ok(document) => Ok(Some(document)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Documents of `collection` matching `filter`, oldest first.
    pub async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let backend = &self.backend;
        let timeout = self.timeout;

        self.retry
            .execute("store.query", move || {
                bounded("store.query", timeout, backend.query(collection, filter))
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn delete(&self, collection: &str, id: &DocumentId) -> Result<(), StoreError> {
        let backend = &self.backend;
        let timeout = self.timeout;

        self.retry
            .execute("store.delete", move || {
                bounded("store.delete", timeout, backend.delete(collection, id))
            })
            .await
            .map_err(StoreError::from)
    }

    /// Move a document to status `to`, returning the status it had before.
    pub async fn transition(
        &self,
        collection: &str,
        id: &DocumentId,
        to: DocumentStatus,
    ) -> Result<DocumentStatus, StoreError> {
        let backend = &self.backend;
        let timeout = self.timeout;

        let from = self
            .retry
            .execute("store.transition", move || {
                bounded("store.transition", timeout, backend.transition(collection, id, to))
            })
            .await
            .map_err(StoreError::from)?;

        debug!(collection, %id, %from, %to, "moved document status");

        Ok(from)
    }
}
