//! Scan archive sources and announce every new archive.
//!
//! Per file: hash the content, skip it when the checksum index knows the hash, store the
//! archive document under its derived id, publish `ArchiveIngested`, and only then record
//! the hash. A crash anywhere before the last step makes the next scan redo the file, and
//! every step on the way is idempotent.
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pipeline_common::bus::Publisher;
use pipeline_common::classify::{Classify, ErrorClass};
use pipeline_common::dedup::{ChecksumIndex, Seen};
use pipeline_common::ids::{archive_id, content_hash, DocumentId, EntityKind};
use pipeline_common::store::{DocumentStore, StoreError};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ArchiveSource;
use crate::error::IngestionError;

pub const ARCHIVES_INGESTED: &str = "ingestion_archives_total";

/// The stored archive document. Only content derived fields, so that ingesting the same
/// file again writes an equal document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveDocument {
    pub source_name: String,
    pub source_type: String,
    pub source_url: String,
    pub file_path: String,
    pub file_size_bytes: u64,
    pub file_hash_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Ingested(DocumentId),
    Duplicate(DocumentId),
    Failed,
}

impl FileOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            FileOutcome::Ingested(_) => "ingested",
            FileOutcome::Duplicate(_) => "duplicate",
            FileOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub ingested: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl ScanReport {
    fn add(&mut self, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::Ingested(_) => self.ingested += 1,
            FileOutcome::Duplicate(_) => self.duplicates += 1,
            FileOutcome::Failed => self.failed += 1,
        }
    }
}

pub struct ArchiveIngestor {
    sources: Vec<ArchiveSource>,
    store: DocumentStore,
    index: ChecksumIndex,
    publisher: Publisher,
    /// Last failure announced per path, so a file that stays broken is announced once.
    failures: HashMap<PathBuf, String>,
}

impl ArchiveIngestor {
    pub fn new(sources: Vec<ArchiveSource>, store: DocumentStore, publisher: Publisher) -> Self {
        Self {
            sources,
            index: ChecksumIndex::new(store.clone()),
            store,
            publisher,
            failures: HashMap::new(),
        }
    }

    pub fn publisher(&mut self) -> &mut Publisher {
        &mut self.publisher
    }

    /// Scan every `interval` until `shutdown` resolves. Transient failures end the current
    /// scan and wait for the next one; anything else stops the ingestor.
    pub async fn run(
        &mut self,
        interval: Duration,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), IngestionError> {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }

            match self.scan_once().await {
                Ok(report) => info!(
                    ingested = report.ingested,
                    duplicates = report.duplicates,
                    failed = report.failed,
                    "scan complete"
                ),
                Err(error) if error.class() == ErrorClass::Transient => {
                    warn!(error = %error, "scan interrupted, retrying on next tick");
                }
                Err(error) => {
                    error!(error = %error, "scan failed");
                    return Err(error);
                }
            }
        }

        Ok(())
    }

    /// Go through every source once.
    pub async fn scan_once(&mut self) -> Result<ScanReport, IngestionError> {
        let mut report = ScanReport::default();

        for source in self.sources.clone() {
            for path in list_archives(&source.path).await? {
                let outcome = self.ingest_file(&source, &path).await?;
                metrics::counter!(ARCHIVES_INGESTED, "source" => source.name.clone(), "outcome" => outcome.as_str())
                    .increment(1);
                report.add(&outcome);
            }
        }

        Ok(report)
    }

    #[instrument(skip_all, fields(source = %source.name, path = %path.display()))]
    pub async fn ingest_file(
        &mut self,
        source: &ArchiveSource,
        path: &Path,
    ) -> Result<FileOutcome, IngestionError> {
        let started_at = Utc::now();

        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(error) => {
                let message = error.to_string();
                if self.failures.get(path) == Some(&message) {
                    debug!(error = %error, "archive still unreadable");
                    return Ok(FileOutcome::Failed);
                }

                warn!(error = %error, "failed to read archive");
                self.publish_failure(source, path, &message, "io").await?;
                self.failures.insert(path.to_owned(), message);
                return Ok(FileOutcome::Failed);
            }
        };
        self.failures.remove(path);

        let hash = content_hash(&content);
        if let Some(record) = self.index.check(&hash).await? {
            debug!(archive_id = %record.entity_id, "archive already ingested");
            return Ok(FileOutcome::Duplicate(record.entity_id));
        }

        let id = archive_id(&content);
        let document = ArchiveDocument {
            source_name: source.name.clone(),
            source_type: "local".to_owned(),
            source_url: source.path.display().to_string(),
            file_path: path.display().to_string(),
            file_size_bytes: content.len() as u64,
            file_hash_sha256: hash.clone(),
        };

        match self
            .store
            .upsert(EntityKind::Archive.collection(), &id, &document)
            .await
        {
            Ok(_) => {}
            // The same content was stored from another path before its hash got indexed.
            Err(StoreError::Conflict { .. }) => {
                warn!(archive_id = %id, "archive stored under another path, not re-announcing");
                self.index.record(&hash, &id).await?;
                return Ok(FileOutcome::Duplicate(id));
            }
            Err(error) => return Err(error.into()),
        }

        self.publish_ingested(&id, &document, started_at).await?;

        if let Seen::Duplicate { entity_id, .. } = self.index.record(&hash, &id).await? {
            debug!(archive_id = %entity_id, "hash indexed concurrently");
        }

        info!(archive_id = %id, size = document.file_size_bytes, "ingested archive");
        Ok(FileOutcome::Ingested(id))
    }

    async fn publish_ingested(
        &mut self,
        id: &DocumentId,
        document: &ArchiveDocument,
        started_at: DateTime<Utc>,
    ) -> Result<(), IngestionError> {
        let data = json!({
            "archive_id": id,
            "source_name": document.source_name,
            "source_type": document.source_type,
            "source_url": document.source_url,
            "file_path": document.file_path,
            "file_size_bytes": document.file_size_bytes,
            "file_hash_sha256": document.file_hash_sha256,
            "ingestion_started_at": started_at.to_rfc3339(),
            "ingestion_completed_at": Utc::now().to_rfc3339(),
        });

        self.publisher.publish("ArchiveIngested", data).await?;
        Ok(())
    }

    async fn publish_failure(
        &mut self,
        source: &ArchiveSource,
        path: &Path,
        message: &str,
        error_type: &str,
    ) -> Result<(), IngestionError> {
        let data = json!({
            "source_name": source.name,
            "source_type": "local",
            "source_url": path.display().to_string(),
            "error_message": message,
            "error_type": error_type,
            "retry_count": 0,
            "failed_at": Utc::now().to_rfc3339(),
        });

        self.publisher.publish("ArchiveIngestionFailed", data).await?;
        Ok(())
    }
}

/// A source path is either one archive or a directory of them. Hidden files are skipped,
/// and the listing is sorted so scans are reproducible.
async fn list_archives(path: &Path) -> Result<Vec<PathBuf>, IngestionError> {
    let list_error = |error| IngestionError::ListSource {
        path: path.to_owned(),
        error,
    };

    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        // Reading it reports the failure as an ingestion failure.
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(vec![path.to_owned()])
        }
        Err(error) => return Err(list_error(error)),
    };

    if !metadata.is_dir() {
        return Ok(vec![path.to_owned()]);
    }

    let mut entries = tokio::fs::read_dir(path).await.map_err(list_error)?;
    let mut archives = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(list_error)? {
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        let is_file = entry.file_type().await.map_err(list_error)?.is_file();

        if is_file && !hidden {
            archives.push(entry.path());
        }
    }

    archives.sort();
    Ok(archives)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_include;
    use pipeline_common::bus::{BusSettings, MemoryBroker};
    use pipeline_common::retry::RetryPolicy;
    use pipeline_common::schema::SchemaRegistry;
    use pipeline_common::store::ReadConsistency;
    use std::sync::Arc;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let path = std::env::temp_dir().join(format!("ingestion-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&path).unwrap();
            Self(path)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            if std::fs::remove_dir_all(&self.0).is_err() {
                eprintln!("failed to remove {}", self.0.display());
            }
        }
    }

    fn ingestor(broker: &MemoryBroker, sources: Vec<ArchiveSource>) -> (ArchiveIngestor, DocumentStore) {
        let registry = Arc::new(SchemaRegistry::builtin().unwrap());
        let retry = RetryPolicy::new(2, Duration::from_millis(1), None);
        let store = DocumentStore::memory(retry.clone());
        let publisher = Publisher::memory(broker, registry, retry, BusSettings::new("copilot.events"));

        (ArchiveIngestor::new(sources, store.clone(), publisher), store)
    }

    #[tokio::test]
    async fn test_identical_blobs_are_announced_once() {
        let dir = TempDir::new();
        let blob = b"From alice@example.com Mon Jan  1 00:00:00 2024\n\nhello\n";
        std::fs::write(dir.0.join("2024-01.mbox"), blob).unwrap();
        std::fs::write(dir.0.join("2024-01-copy.mbox"), blob).unwrap();
        std::fs::write(dir.0.join(".partial"), b"ignored").unwrap();

        let broker = MemoryBroker::new();
        let (mut ingestor, store) = ingestor(
            &broker,
            vec![ArchiveSource {
                name: "quic".to_owned(),
                path: dir.0.clone(),
            }],
        );

        let report = ingestor.scan_once().await.unwrap();
        assert_eq!(
            report,
            ScanReport {
                ingested: 1,
                duplicates: 1,
                failed: 0,
            }
        );

        let announced = broker.published_of("ArchiveIngested");
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].data["archive_id"], archive_id(blob).as_str());
        assert_eq!(announced[0].data["file_hash_sha256"], content_hash(blob));
        assert_eq!(announced[0].data["file_size_bytes"], blob.len());

        let stored = store
            .get(
                EntityKind::Archive.collection(),
                &archive_id(blob),
                ReadConsistency::Strong,
            )
            .await
            .unwrap();
        assert_eq!(stored.body["source_name"], "quic");

        // Nothing new on the next scan.
        let report = ingestor.scan_once().await.unwrap();
        assert_eq!(report.ingested, 0);
        assert_eq!(report.duplicates, 2);
        assert_eq!(broker.published_of("ArchiveIngested").len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_source_publishes_failure() {
        let dir = TempDir::new();
        let broker = MemoryBroker::new();
        let missing = dir.0.join("missing.mbox");
        let (mut ingestor, _store) = ingestor(
            &broker,
            vec![ArchiveSource {
                name: "gone".to_owned(),
                path: missing.clone(),
            }],
        );

        let report = ingestor.scan_once().await.unwrap();
        assert_eq!(report.failed, 1);

        let failures = broker.published_of("ArchiveIngestionFailed");
        assert_eq!(failures.len(), 1);
        assert_json_include!(
            actual: failures[0].data.clone(),
            expected: json!({
                "source_name": "gone",
                "source_type": "local",
                "error_type": "io",
                "retry_count": 0
            })
        );
        assert_eq!(
            failures[0].data["source_url"],
            missing.display().to_string()
        );
        assert!(broker.published_of("ArchiveIngested").is_empty());
    }

    #[tokio::test]
    async fn test_persistent_read_failure_is_announced_once() {
        let dir = TempDir::new();
        let broker = MemoryBroker::new();
        let path = dir.0.join("late.mbox");
        let (mut ingestor, _store) = ingestor(
            &broker,
            vec![ArchiveSource {
                name: "late".to_owned(),
                path: path.clone(),
            }],
        );

        assert_eq!(ingestor.scan_once().await.unwrap().failed, 1);
        assert_eq!(ingestor.scan_once().await.unwrap().failed, 1);
        assert_eq!(broker.published_of("ArchiveIngestionFailed").len(), 1);

        std::fs::write(&path, b"archive").unwrap();
        assert_eq!(ingestor.scan_once().await.unwrap().ingested, 1);

        // Broken again after recovering: a new failure.
        std::fs::remove_file(&path).unwrap();
        assert_eq!(ingestor.scan_once().await.unwrap().failed, 1);
        assert_eq!(broker.published_of("ArchiveIngestionFailed").len(), 2);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_hash_unrecorded() {
        let dir = TempDir::new();
        let blob = b"archive";
        std::fs::write(dir.0.join("a.mbox"), blob).unwrap();

        let broker = MemoryBroker::new();
        let (mut ingestor, _store) = ingestor(
            &broker,
            vec![ArchiveSource {
                name: "quic".to_owned(),
                path: dir.0.clone(),
            }],
        );

        broker.fail_next_publishes(["not authorized to publish"]);
        let error = ingestor.scan_once().await.unwrap_err();
        assert_eq!(error.class(), ErrorClass::Fatal);
        assert!(broker.published_of("ArchiveIngested").is_empty());

        // The next scan retries the file and announces it.
        let report = ingestor.scan_once().await.unwrap();
        assert_eq!(report.ingested, 1);
        assert_eq!(broker.published_of("ArchiveIngested").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_scans_until_shutdown() {
        let dir = TempDir::new();
        std::fs::write(dir.0.join("a.mbox"), b"archive").unwrap();

        let broker = MemoryBroker::new();
        let (mut ingestor, _store) = ingestor(
            &broker,
            vec![ArchiveSource {
                name: "quic".to_owned(),
                path: dir.0.clone(),
            }],
        );

        ingestor
            .run(
                Duration::from_secs(60),
                tokio::time::sleep(Duration::from_secs(150)),
            )
            .await
            .unwrap();

        // Scans at 0s, 60s and 120s; only the first announces.
        assert_eq!(broker.published_of("ArchiveIngested").len(), 1);
        assert!(ingestor.publisher().is_connected());
        assert_eq!(broker.connect_calls(), 1);
    }
}
