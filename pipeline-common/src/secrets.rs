//! Credentials handed to a stage at process start.
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::classify::{Classify, ErrorClass};

pub const MESSAGE_BUS_USERNAME: &str = "message_bus_username";
pub const MESSAGE_BUS_PASSWORD: &str = "message_bus_password";
pub const DOCUMENT_STORE_URL: &str = "document_store_url";

#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("secret {0} is not set")]
    Missing(String),
    #[error("failed to read secret {key}: {error}")]
    Read { key: String, error: io::Error },
}

impl Classify for SecretsError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Fatal
    }
}

/// Where secrets are looked up. Lookups are synchronous and only happen during startup.
#[derive(Debug, Clone)]
pub enum SecretsProvider {
    /// Upper-cased key as an environment variable, e.g. `MESSAGE_BUS_PASSWORD`.
    Environment,
    /// One file per key in a mounted directory, e.g. `/run/secrets/message_bus_password`.
    Directory(PathBuf),
    /// Fixed values, for tests.
    Static(HashMap<String, String>),
}

impl SecretsProvider {
    pub fn from_dir(dir: Option<&str>) -> Self {
        match dir {
            Some(dir) if !dir.is_empty() => SecretsProvider::Directory(PathBuf::from(dir)),
            _ => SecretsProvider::Environment,
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, SecretsError> {
        let value = match self {
            SecretsProvider::Environment => std::env::var(key.to_uppercase()).ok(),
            SecretsProvider::Directory(dir) => match std::fs::read_to_string(dir.join(key)) {
                Ok(value) => Some(value),
                Err(error) if error.kind() == io::ErrorKind::NotFound => None,
                Err(error) => {
                    return Err(SecretsError::Read {
                        key: key.to_owned(),
                        error,
                    })
                }
            },
            SecretsProvider::Static(values) => values.get(key).cloned(),
        };

        Ok(value
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty()))
    }

    pub fn require(&self, key: &str) -> Result<String, SecretsError> {
        self.get(key)?
            .ok_or_else(|| SecretsError::Missing(key.to_owned()))
    }
}

/// Broker credentials. Both are optional: local brokers usually run without authentication.
#[derive(Clone, Default)]
pub struct BusCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for BusCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl BusCredentials {
    pub fn from_secrets(secrets: &SecretsProvider) -> Result<Self, SecretsError> {
        Ok(Self {
            username: secrets.get(MESSAGE_BUS_USERNAME)?,
            password: secrets.get(MESSAGE_BUS_PASSWORD)?,
        })
    }
}
