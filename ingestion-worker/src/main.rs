//! Scan mailing-list archive sources and publish `ArchiveIngested` events.
use std::path::Path;
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing_subscriber::EnvFilter;

use ingestion_worker::config::Config;
use ingestion_worker::ingestor::ArchiveIngestor;
use pipeline_common::bus::Publisher;
use pipeline_common::metrics::{serve, setup_stage_router, Readiness};
use pipeline_common::schema::SchemaRegistry;
use pipeline_common::secrets::{BusCredentials, SecretsProvider, DOCUMENT_STORE_URL};
use pipeline_common::store::DocumentStore;

async fn shutdown(mut term: Signal, mut interrupt: Signal) {
    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().wrap_err("invalid configuration")?;
    let secrets = SecretsProvider::from_dir(config.secrets_dir.as_deref());
    let credentials = BusCredentials::from_secrets(&secrets)?;

    let registry = match &config.schema_dir {
        Some(dir) => SchemaRegistry::from_dir(Path::new(dir.as_str()))?,
        None => SchemaRegistry::builtin()?,
    };
    tracing::info!(contracts = registry.len(), "loaded event contracts");

    let retry_policy = config.retry.policy()?;

    let store_url = match &config.store.url {
        Some(url) => Some(url.clone()),
        None => secrets.get(DOCUMENT_STORE_URL)?,
    };
    let store = DocumentStore::from_config(&config.store, store_url.as_deref(), retry_policy.clone())
        .await
        .wrap_err("failed to initialize document store")?;

    let mut publisher = Publisher::from_config(
        &config.bus,
        &credentials,
        Arc::new(registry),
        retry_policy,
    )?;
    publisher
        .connect()
        .await
        .wrap_err("failed to connect to message bus")?;

    let readiness = Readiness::default();
    readiness.set_ready(true);

    let bind = config.bind();
    let router = setup_stage_router("ingestion", readiness.clone())?;
    tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            tracing::error!(error = %error, "failed to serve metrics");
        }
    });

    let term = signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
    let interrupt = signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

    let mut ingestor = ArchiveIngestor::new(config.sources.0, store, publisher);
    let result = ingestor
        .run(config.scan_interval.0, shutdown(term, interrupt))
        .await;

    readiness.set_ready(false);
    ingestor.publisher().disconnect().await?;
    result?;

    Ok(())
}
