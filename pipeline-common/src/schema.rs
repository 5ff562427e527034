//! # Schema
//!
//! The registry of event contracts. Every event is checked against the contract for its
//! `(event_type, version)` before it is published, and again when it is received.
//!
//! A contract file is a JSON document of the form:
//!
//! ```json
//! {"event_type": "ArchiveIngested", "version": "1.0", "schema": { ...JSON Schema... }}
//! ```
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use jsonschema::JSONSchema;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::classify::{Classify, ErrorClass};

/// Contracts compiled into the binary, used when no contract directory is configured.
const BUILTIN_CONTRACTS: &[(&str, &str)] = &[
    (
        "archive_ingested.json",
        include_str!("../schemas/events/archive_ingested.json"),
    ),
    (
        "archive_ingestion_failed.json",
        include_str!("../schemas/events/archive_ingestion_failed.json"),
    ),
    (
        "json_parsed.json",
        include_str!("../schemas/events/json_parsed.json"),
    ),
    (
        "parsing_failed.json",
        include_str!("../schemas/events/parsing_failed.json"),
    ),
    (
        "chunks_prepared.json",
        include_str!("../schemas/events/chunks_prepared.json"),
    ),
    (
        "chunking_failed.json",
        include_str!("../schemas/events/chunking_failed.json"),
    ),
    (
        "embeddings_generated.json",
        include_str!("../schemas/events/embeddings_generated.json"),
    ),
    (
        "embedding_generation_failed.json",
        include_str!("../schemas/events/embedding_generation_failed.json"),
    ),
    (
        "summarization_requested.json",
        include_str!("../schemas/events/summarization_requested.json"),
    ),
    (
        "summary_complete.json",
        include_str!("../schemas/events/summary_complete.json"),
    ),
    (
        "summarization_failed.json",
        include_str!("../schemas/events/summarization_failed.json"),
    ),
    (
        "report_published.json",
        include_str!("../schemas/events/report_published.json"),
    ),
    (
        "report_delivery_failed.json",
        include_str!("../schemas/events/report_delivery_failed.json"),
    ),
];

/// A single problem found while validating an event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFault {
    /// JSON pointer to the offending value, empty for the payload root.
    pub path: String,
    pub message: String,
}

impl fmt::Display for FieldFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{event_type} {version} payload is invalid: {}", render_faults(.faults))]
pub struct ValidationError {
    pub event_type: String,
    pub version: String,
    pub faults: Vec<FieldFault>,
}

fn render_faults(faults: &[FieldFault]) -> String {
    faults
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<String>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("no contract registered for {event_type} version {version}")]
    UnknownContract { event_type: String, version: String },
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("failed to read contracts from {path}: {error}")]
    Load {
        path: String,
        error: std::io::Error,
    },
    #[error("failed to parse contract {name}: {error}")]
    Parse {
        name: String,
        error: serde_json::Error,
    },
    #[error("contract for {event_type} version {version} is not a valid schema: {message}")]
    Compile {
        event_type: String,
        version: String,
        message: String,
    },
    #[error("contract for {event_type} version {version} is registered twice")]
    Duplicate { event_type: String, version: String },
}

impl Classify for SchemaError {
    fn class(&self) -> ErrorClass {
        // Neither a bad payload nor a missing contract gets better by retrying.
        ErrorClass::Fatal
    }
}

/// A contract as stored on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractDocument {
    pub event_type: String,
    pub version: String,
    pub schema: Value,
}

impl ContractDocument {
    pub fn parse(name: &str, raw: &str) -> Result<Self, SchemaError> {
        serde_json::from_str(raw).map_err(|error| SchemaError::Parse {
            name: name.to_owned(),
            error,
        })
    }
}

/// Compiled contracts, looked up by `(event_type, version)`.
#[derive(Default)]
pub struct SchemaRegistry {
    contracts: HashMap<(String, String), JSONSchema>,
    current: HashMap<String, String>,
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("current", &self.current)
            .finish()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry holding the contracts shipped with this crate.
    pub fn builtin() -> Result<Self, SchemaError> {
        let mut registry = Self::new();

        for (name, raw) in BUILTIN_CONTRACTS {
            registry.register(ContractDocument::parse(name, raw)?)?;
        }

        Ok(registry)
    }

    /// Build a registry from every `*.json` file in `path`.
    pub fn from_dir(path: &Path) -> Result<Self, SchemaError> {
        let load_error = |error| SchemaError::Load {
            path: path.display().to_string(),
            error,
        };

        let mut files = Vec::new();
        for entry in std::fs::read_dir(path).map_err(load_error)? {
            let file = entry.map_err(load_error)?.path();
            if file.extension().is_some_and(|ext| ext == "json") {
                files.push(file);
            }
        }
        files.sort();

        let mut registry = Self::new();
        for file in files {
            let raw = std::fs::read_to_string(&file).map_err(|error| SchemaError::Load {
                path: file.display().to_string(),
                error,
            })?;
            registry.register(ContractDocument::parse(&file.display().to_string(), &raw)?)?;
        }

        info!(
            path = %path.display(),
            contracts = registry.contracts.len(),
            "loaded event contracts"
        );

        Ok(registry)
    }

    pub fn from_documents(
        documents: impl IntoIterator<Item = ContractDocument>,
    ) -> Result<Self, SchemaError> {
        let mut registry = Self::new();

        for document in documents {
            registry.register(document)?;
        }

        Ok(registry)
    }

    /// Compile and add a contract. Registering the same `(event_type, version)` twice fails.
    pub fn register(&mut self, document: ContractDocument) -> Result<(), SchemaError> {
        let key = (document.event_type.clone(), document.version.clone());
        if self.contracts.contains_key(&key) {
            return Err(SchemaError::Duplicate {
                event_type: document.event_type,
                version: document.version,
            });
        }

        let compiled =
            JSONSchema::compile(&document.schema).map_err(|error| SchemaError::Compile {
                event_type: document.event_type.clone(),
                version: document.version.clone(),
                message: error.to_string(),
            })?;

        let newer = match self.current.get(&document.event_type) {
            Some(current) => version_key(&document.version) > version_key(current),
            None => true,
        };
        if newer {
            self.current
                .insert(document.event_type.clone(), document.version.clone());
        }

        self.contracts.insert(key, compiled);

        Ok(())
    }

    /// Check `data` against the contract for `(event_type, version)`.
    ///
    /// Fails closed: an unregistered contract is an error, never a pass.
    pub fn validate(&self, event_type: &str, version: &str, data: &Value) -> Result<(), SchemaError> {
        let schema = self
            .contracts
            .get(&(event_type.to_owned(), version.to_owned()))
            .ok_or_else(|| SchemaError::UnknownContract {
                event_type: event_type.to_owned(),
                version: version.to_owned(),
            })?;

        if let Err(errors) = schema.validate(data) {
            let faults = errors
                .map(|error| FieldFault {
                    path: error.instance_path.to_string(),
                    message: error.to_string(),
                })
                .collect();

            return Err(ValidationError {
                event_type: event_type.to_owned(),
                version: version.to_owned(),
                faults,
            }
            .into());
        }

        Ok(())
    }

    /// The newest registered version for an event type.
    pub fn current_version(&self, event_type: &str) -> Option<&str> {
        self.current.get(event_type).map(String::as_str)
    }

    pub fn contains(&self, event_type: &str, version: &str) -> bool {
        self.contracts
            .contains_key(&(event_type.to_owned(), version.to_owned()))
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.current.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

/// Order versions like "1.10" after "1.9". Non-numeric parts sort first.
fn version_key(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}
