use std::path::PathBuf;
use std::str::FromStr;

use envconfig::Envconfig;
use pipeline_common::config::{BusConfig, EnvMsDuration, NonEmptyString, RetryConfig, StoreConfig};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    /// Comma separated `name=path` pairs, each path a file or a directory of archives.
    #[envconfig(from = "INGESTION_SOURCES")]
    pub sources: ArchiveSources,

    #[envconfig(from = "INGESTION_SCAN_INTERVAL_MS", default = "60000")]
    pub scan_interval: EnvMsDuration,

    /// Directory of event contract files. The built-in contracts are used when unset.
    #[envconfig(from = "SCHEMA_DIR")]
    pub schema_dir: Option<NonEmptyString>,

    /// Directory with one file per secret. Secrets come from the environment when unset.
    #[envconfig(from = "SECRETS_DIR")]
    pub secrets_dir: Option<String>,

    #[envconfig(nested = true)]
    pub bus: BusConfig,

    #[envconfig(nested = true)]
    pub retry: RetryConfig,

    #[envconfig(nested = true)]
    pub store: StoreConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSource {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSources(pub Vec<ArchiveSource>);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseArchiveSourcesError(pub String);

impl std::fmt::Display for ParseArchiveSourcesError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid archive source: {}", self.0)
    }
}

impl FromStr for ArchiveSources {
    type Err = ParseArchiveSourcesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut sources = Vec::new();

        for entry in s.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let (name, path) = entry
                .split_once('=')
                .ok_or_else(|| ParseArchiveSourcesError(entry.to_owned()))?;
            let (name, path) = (name.trim(), path.trim());

            if name.is_empty() || path.is_empty() {
                return Err(ParseArchiveSourcesError(entry.to_owned()));
            }
            if sources.iter().any(|source: &ArchiveSource| source.name == name) {
                return Err(ParseArchiveSourcesError(format!("duplicate name {name}")));
            }

            sources.push(ArchiveSource {
                name: name.to_owned(),
                path: PathBuf::from(path),
            });
        }

        if sources.is_empty() {
            return Err(ParseArchiveSourcesError("no sources given".to_owned()));
        }

        Ok(ArchiveSources(sources))
    }
}
