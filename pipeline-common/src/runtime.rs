//! # Runtime
//!
//! The loop every stage runs: receive an event, process it, store results, publish the next
//! events, settle the delivery.
//!
//! Each delivery goes through `Received → Validating → Processing` and ends either acked,
//! requeued, or dead-lettered:
//! * payloads that do not parse or do not match their contract are dead-lettered at once,
//! * transient handler failures are retried in place, then requeued until the delivery has
//!   been redelivered `max_redeliveries` times, then dead-lettered,
//! * fatal handler failures are dead-lettered.
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::bus::{BusError, Delivery, Publisher, Subscriber};
use crate::classify::{Classify, ErrorClass};
use crate::config::BusConfig;
use crate::event::EventEnvelope;
use crate::retry::{RetryError, RetryPolicy};
use crate::schema::{SchemaError, SchemaRegistry};
use crate::store::{DocumentStore, StoreError};

pub const DELIVERIES: &str = "pipeline_deliveries_total";
pub const HANDLER_DURATION: &str = "pipeline_handler_duration_seconds";
pub const RUNTIME_SATURATION: &str = "pipeline_runtime_saturation_percent";

/// Errors raised while a stage handles an event.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
    #[error("gave up after {attempts} attempts: {error}")]
    RetriesExhausted {
        attempts: u32,
        error: Box<StageError>,
    },
}

impl Classify for StageError {
    fn class(&self) -> ErrorClass {
        match self {
            StageError::Store(error) => error.class(),
            StageError::Bus(error) => error.class(),
            StageError::Schema(error) => error.class(),
            StageError::Transient(_) => ErrorClass::Transient,
            StageError::Fatal(_) => ErrorClass::Fatal,
            StageError::RetriesExhausted { error, .. } => error.class(),
        }
    }
}

impl From<RetryError<StageError>> for StageError {
    fn from(error: RetryError<StageError>) -> Self {
        match error {
            RetryError::Fatal(error) => error,
            RetryError::Exhausted { attempts, error } => StageError::RetriesExhausted {
                attempts,
                error: Box::new(error),
            },
        }
    }
}

/// An event a handler wants published once it is done.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEvent {
    pub event_type: String,
    pub data: Value,
}

impl OutgoingEvent {
    pub fn new(event_type: &str, data: Value) -> Self {
        Self {
            event_type: event_type.to_owned(),
            data,
        }
    }
}

/// The business logic of a stage.
///
/// Handlers must be idempotent: a delivery may be handled again after a crash or a requeue.
/// Writing through [`DocumentStore::upsert`] with derived ids gives that for free.
#[async_trait]
pub trait StageHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Event types this stage consumes.
    fn subscriptions(&self) -> Vec<String>;

    async fn handle(
        &self,
        event: &EventEnvelope,
        store: &DocumentStore,
    ) -> Result<Vec<OutgoingEvent>, StageError>;

    /// The event to announce a delivery that will not be processed, e.g. `ParsingFailed`.
    fn failure_event(
        &self,
        _event: &EventEnvelope,
        _error: &StageError,
        _redelivery_count: u32,
    ) -> Option<OutgoingEvent> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    pub max_concurrent_handlers: usize,
    pub max_redeliveries: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 1,
            max_redeliveries: 3,
        }
    }
}

impl RuntimeSettings {
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            max_concurrent_handlers: config.max_concurrent_handlers.max(1),
            max_redeliveries: config.max_redeliveries,
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Requeued,
    DeadLettered,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Acked => "acked",
            Outcome::Requeued => "requeued",
            Outcome::DeadLettered => "dead_lettered",
        }
    }
}

struct StageContext<H> {
    handler: H,
    publisher: Arc<Mutex<Publisher>>,
    store: DocumentStore,
    registry: Arc<SchemaRegistry>,
    retry: RetryPolicy,
    max_redeliveries: u32,
}

pub struct StageRuntime<H> {
    context: Arc<StageContext<H>>,
    subscriber: Subscriber,
    settings: RuntimeSettings,
    started: bool,
}

impl<H: StageHandler> StageRuntime<H> {
    pub fn new(
        handler: H,
        subscriber: Subscriber,
        publisher: Arc<Mutex<Publisher>>,
        store: DocumentStore,
        retry: RetryPolicy,
        settings: RuntimeSettings,
    ) -> Self {
        let registry = subscriber.registry().clone();

        Self {
            context: Arc::new(StageContext {
                handler,
                publisher,
                store,
                registry,
                retry,
                max_redeliveries: settings.max_redeliveries,
            }),
            subscriber,
            settings,
            started: false,
        }
    }

    /// Bind to the handler's event types and connect both ends. Does nothing the second time.
    pub async fn start(&mut self) -> Result<(), BusError> {
        if self.started {
            return Ok(());
        }

        for event_type in self.context.handler.subscriptions() {
            self.subscriber.subscribe(&event_type)?;
        }

        self.subscriber.connect().await?;
        self.context.publisher.lock().await.connect().await?;

        self.started = true;
        info!(stage = self.context.handler.name(), "stage started");
        Ok(())
    }

    /// Consume until `shutdown` resolves, then wait for in-flight handlers and disconnect.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), StageError> {
        self.start().await?;

        let max_concurrent = self.settings.max_concurrent_handlers.max(1);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let stage = self.context.handler.name().to_owned();
        tokio::pin!(shutdown);

        loop {
            metrics::gauge!(RUNTIME_SATURATION, "stage" => stage.clone()).set(
                1f64 - semaphore.available_permits() as f64 / max_concurrent as f64,
            );

            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                _ = &mut shutdown => break,
                delivery = self.subscriber.recv() => delivery,
            };

            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(error) if error.class() == ErrorClass::Transient => {
                    warn!(stage = %stage, error = %error, "failed to receive delivery, retrying");
                    drop(permit);
                    tokio::time::sleep(self.context.retry.time_until_next_retry(0)).await;
                    continue;
                }
                Err(error) => {
                    error!(stage = %stage, error = %error, "failed to receive delivery, stopping");
                    return Err(error.into());
                }
            };

            let context = self.context.clone();
            let span = info_span!("delivery", stage = %stage, routing_key = delivery.routing_key());
            tokio::spawn(
                async move {
                    if let Err(error) = process_delivery(&context, delivery).await {
                        error!(error = %error, "failed to settle delivery");
                    }
                    drop(permit);
                }
                .instrument(span),
            );
        }

        info!(stage = %stage, "shutting down, waiting for in-flight deliveries");
        // Every permit back means every spawned handler is done.
        if let Ok(permits) = semaphore.acquire_many(max_concurrent as u32).await {
            drop(permits);
        }

        self.subscriber.close().await?;
        self.context.publisher.lock().await.disconnect().await?;
        info!(stage = %stage, "stage stopped");

        Ok(())
    }
}

/// Take one delivery through validation and processing and settle it. Errors are failures
/// to settle; processing failures are reported through the outcome.
async fn process_delivery<H: StageHandler>(
    context: &StageContext<H>,
    delivery: Delivery,
) -> Result<Outcome, BusError> {
    let stage = context.handler.name();

    let envelope = match EventEnvelope::from_bytes(delivery.payload()) {
        Ok(envelope) => envelope,
        Err(error) => {
            warn!(stage, error = %error, "dead-lettering unparseable payload");
            let reason = format!("invalid payload: {error}");
            return settle(stage, delivery, Outcome::DeadLettered, &reason).await;
        }
    };

    if let Err(error) = envelope.validate(&context.registry) {
        warn!(stage, event_id = %envelope.event_id, error = %error, "dead-lettering invalid event");
        let reason = format!("schema validation failed: {error}");
        return settle(stage, delivery, Outcome::DeadLettered, &reason).await;
    }

    debug!(stage, event_type = %envelope.event_type, event_id = %envelope.event_id, "processing event");

    let now = tokio::time::Instant::now();
    let result = handle_and_publish(context, &envelope).await;
    metrics::histogram!(HANDLER_DURATION, "stage" => stage.to_owned())
        .record(now.elapsed().as_secs_f64());

    let error = match result {
        Ok(()) => return settle(stage, delivery, Outcome::Acked, "").await,
        Err(error) => error,
    };

    let redelivery_count = delivery.redelivery_count();
    let outcome = if error.class() == ErrorClass::Transient
        && redelivery_count < context.max_redeliveries
    {
        warn!(stage, event_id = %envelope.event_id, redelivery_count, error = %error, "requeueing event");
        Outcome::Requeued
    } else {
        error!(stage, event_id = %envelope.event_id, redelivery_count, error = %error, "dead-lettering event");
        announce_failure(context, &envelope, &error, redelivery_count).await;
        Outcome::DeadLettered
    };

    settle(stage, delivery, outcome, &error.to_string()).await
}

async fn handle_and_publish<H: StageHandler>(
    context: &StageContext<H>,
    envelope: &EventEnvelope,
) -> Result<(), StageError> {
    let handler = &context.handler;
    let store = &context.store;

    let outgoing = context
        .retry
        .execute(handler.name(), move || handler.handle(envelope, store))
        .await?;

    if outgoing.is_empty() {
        return Ok(());
    }

    // Every outgoing event must satisfy its contract before the first one is sent.
    let envelopes = outgoing
        .into_iter()
        .map(|event| EventEnvelope::current(&context.registry, &event.event_type, event.data))
        .collect::<Result<Vec<_>, _>>()?;

    let mut publisher = context.publisher.lock().await;
    for envelope in &envelopes {
        publisher.publish_envelope(envelope).await?;
    }

    Ok(())
}

async fn announce_failure<H: StageHandler>(
    context: &StageContext<H>,
    envelope: &EventEnvelope,
    error: &StageError,
    redelivery_count: u32,
) {
    let Some(event) = context
        .handler
        .failure_event(envelope, error, redelivery_count)
    else {
        return;
    };

    let mut publisher = context.publisher.lock().await;
    if let Err(publish_error) = publisher.publish(&event.event_type, event.data).await {
        error!(
            event_type = %event.event_type,
            error = %publish_error,
            "failed to publish failure event"
        );
    }
}

async fn settle(
    stage: &str,
    delivery: Delivery,
    outcome: Outcome,
    reason: &str,
) -> Result<Outcome, BusError> {
    match outcome {
        Outcome::Acked => delivery.ack().await?,
        Outcome::Requeued => delivery.nack(true, reason).await?,
        Outcome::DeadLettered => delivery.nack(false, reason).await?,
    }

    metrics::counter!(DELIVERIES, "stage" => stage.to_owned(), "outcome" => outcome.as_str())
        .increment(1);

    Ok(outcome)
}
