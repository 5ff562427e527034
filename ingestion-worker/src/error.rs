use std::io;
use std::path::PathBuf;

use pipeline_common::bus::BusError;
use pipeline_common::classify::{Classify, ErrorClass};
use pipeline_common::config::ConfigError;
use pipeline_common::schema::SchemaError;
use pipeline_common::secrets::SecretsError;
use pipeline_common::store::StoreError;
use thiserror::Error;

/// Enumeration of errors raised while scanning sources and ingesting archives.
#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Secrets(#[from] SecretsError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("failed to list {path}: {error}")]
    ListSource { path: PathBuf, error: io::Error },
}

impl Classify for IngestionError {
    fn class(&self) -> ErrorClass {
        match self {
            IngestionError::Store(error) => error.class(),
            IngestionError::Bus(error) => error.class(),
            IngestionError::ListSource { error, .. } => error.class(),
            IngestionError::Config(_) | IngestionError::Secrets(_) | IngestionError::Schema(_) => {
                ErrorClass::Fatal
            }
        }
    }
}
