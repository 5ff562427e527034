use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::info;

use super::{Document, DocumentStatus, Filter, ReadConsistency, StoreError, UpsertOutcome};
use crate::ids::DocumentId;

const SELECT_DOCUMENTS: &str = r#"
SELECT
    collection, id, document, status, created_at, updated_at
FROM
    pipeline_documents
WHERE
    collection = "#;

#[derive(sqlx::FromRow)]
struct DocumentRow {
    collection: String,
    id: String,
    document: sqlx::types::Json<Value>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DocumentRow> for Document {
    type Error = StoreError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        Ok(Document {
            collection: row.collection,
            id: row.id.parse()?,
            body: row.document.0,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// A DocumentStore backend on PostgreSQL, every collection sharing the `pipeline_documents`
/// table. Eventually consistent reads go to the replica pool when one is configured.
#[derive(Clone, Debug)]
pub struct PgDocumentStore {
    primary: PgPool,
    replica: Option<PgPool>,
}

impl PgDocumentStore {
    pub async fn new(
        url: &str,
        replica_url: Option<&str>,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let primary = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|error| StoreError::PoolCreationError { error })?;

        let replica = match replica_url {
            Some(replica_url) => Some(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect(replica_url)
                    .await
                    .map_err(|error| StoreError::PoolCreationError { error })?,
            ),
            None => None,
        };

        Ok(Self { primary, replica })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            primary: pool,
            replica: None,
        }
    }

    pub fn with_replica(mut self, replica: PgPool) -> Self {
        self.replica = Some(replica);
        self
    }

    /// Create or update the documents table.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../migrations").run(&self.primary).await?;
        info!("document store migrations applied");
        Ok(())
    }

    fn reader(&self, consistency: ReadConsistency) -> &PgPool {
        match (consistency, &self.replica) {
            (ReadConsistency::Eventual, Some(replica)) => replica,
            _ => &self.primary,
        }
    }

    pub(super) async fn upsert(
        &self,
        collection: &str,
        id: &DocumentId,
        body: &Value,
    ) -> Result<UpsertOutcome, StoreError> {
        // The no-op update only happens when the stored body is equal, which lets us tell
        // "already there" apart from "there with different content" in one round trip.
        let inserted: Option<bool> = sqlx::query_scalar(
            r#"
INSERT INTO pipeline_documents
    (collection, id, document)
VALUES
    ($1, $2, $3)
ON CONFLICT (collection, id) DO UPDATE
SET
    updated_at = pipeline_documents.updated_at
WHERE
    pipeline_documents.document = EXCLUDED.document
RETURNING
    (xmax = 0) AS inserted
            "#,
        )
        .bind(collection)
        .bind(id.as_str())
        .bind(sqlx::types::Json(body))
        .fetch_optional(&self.primary)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        match inserted {
            Some(true) => Ok(UpsertOutcome::Created),
            Some(false) => Ok(UpsertOutcome::Unchanged),
            None => Err(StoreError::Conflict {
                collection: collection.to_owned(),
                id: id.clone(),
            }),
        }
    }

    pub(super) async fn get(
        &self,
        collection: &str,
        id: &DocumentId,
        consistency: ReadConsistency,
    ) -> Result<Document, StoreError> {
        let row: Option<DocumentRow> = sqlx::query_as(&format!("{SELECT_DOCUMENTS} $1 AND id = $2"))
            .bind(collection)
            .bind(id.as_str())
            .fetch_optional(self.reader(consistency))
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        match row {
            Some(row) => row.try_into(),
            None => Err(StoreError::NotFound {
                collection: collection.to_owned(),
                id: id.clone(),
            }),
        }
    }

    pub(super) async fn query(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<Document>, StoreError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_DOCUMENTS);
        builder.push_bind(collection.to_owned());

        for (field, value) in &filter.fields {
            builder.push(" AND document -> ");
            builder.push_bind(field.clone());
            builder.push(" = ");
            builder.push_bind(sqlx::types::Json(value.clone()));
        }

        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }

        builder.push(" ORDER BY created_at, id");

        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }

        let rows: Vec<DocumentRow> = builder
            .build_query_as()
            .fetch_all(self.reader(filter.consistency))
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        rows.into_iter().map(Document::try_from).collect()
    }

    pub(super) async fn delete(&self, collection: &str, id: &DocumentId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM pipeline_documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id.as_str())
            .execute(&self.primary)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                collection: collection.to_owned(),
                id: id.clone(),
            });
        }

        Ok(())
    }

    pub(super) async fn transition(
        &self,
        collection: &str,
        id: &DocumentId,
        to: DocumentStatus,
    ) -> Result<DocumentStatus, StoreError> {
        let from = self
            .get(collection, id, ReadConsistency::Strong)
            .await?
            .status;

        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                collection: collection.to_owned(),
                id: id.clone(),
                from,
                to,
            });
        }

        let result = sqlx::query(
            r#"
UPDATE
    pipeline_documents
SET
    status = $3,
    updated_at = NOW()
WHERE
    collection = $1
    AND id = $2
    AND status = $4
            "#,
        )
        .bind(collection)
        .bind(id.as_str())
        .bind(to.as_str())
        .bind(from.as_str())
        .execute(&self.primary)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StatusChanged {
                collection: collection.to_owned(),
                id: id.clone(),
                expected: from,
            });
        }

        Ok(from)
    }
}
