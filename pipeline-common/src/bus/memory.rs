//! An in-process broker, used by tests and single-process runs.
//!
//! Each subscriber queue is bound to a set of routing keys when it connects; events published
//! before any queue is bound to their routing key are only kept in the published log.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;

use super::{Acker, BusError, Delivery};
use crate::event::EventEnvelope;

#[derive(Debug, Clone)]
struct MemoryMessage {
    routing_key: String,
    payload: Vec<u8>,
    redelivery_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub reason: String,
}

#[derive(Debug)]
struct Queue {
    bindings: Vec<String>,
    sender: mpsc::UnboundedSender<MemoryMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    published: Vec<EventEnvelope>,
    dead_letters: Vec<DeadLetter>,
    publish_failures: VecDeque<String>,
    connect_failures: VecDeque<String>,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    publish_calls: Arc<AtomicUsize>,
    connect_calls: Arc<AtomicUsize>,
    acks: Arc<AtomicUsize>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, BrokerState>, BusError> {
        self.state.lock().map_err(|_| BusError::Poisoned)
    }

    /// Fail the next publishes, one per message, with the given broker error messages.
    pub fn fail_next_publishes<'a>(&self, messages: impl IntoIterator<Item = &'a str>) {
        if let Ok(mut state) = self.state() {
            state
                .publish_failures
                .extend(messages.into_iter().map(str::to_owned));
        }
    }

    /// Fail the next connection attempts, one per message.
    pub fn fail_next_connects<'a>(&self, messages: impl IntoIterator<Item = &'a str>) {
        if let Ok(mut state) = self.state() {
            state
                .connect_failures
                .extend(messages.into_iter().map(str::to_owned));
        }
    }

    /// Every publish that reached the transport, including failed ones.
    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    /// Successfully published envelopes, in publish order.
    pub fn published(&self) -> Vec<EventEnvelope> {
        self.state()
            .map(|state| state.published.clone())
            .unwrap_or_default()
    }

    pub fn published_of(&self, event_type: &str) -> Vec<EventEnvelope> {
        self.published()
            .into_iter()
            .filter(|envelope| envelope.event_type == event_type)
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state()
            .map(|state| state.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Deliver a raw payload to every queue bound to `routing_key`, bypassing validation.
    pub fn inject(&self, routing_key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.route(MemoryMessage {
            routing_key: routing_key.to_owned(),
            payload,
            redelivery_count: 0,
        })
    }

    fn route(&self, message: MemoryMessage) -> Result<(), BusError> {
        let state = self.state()?;

        for queue in state.queues.values() {
            if queue.bindings.contains(&message.routing_key)
                && queue.sender.send(message.clone()).is_err()
            {
                debug!(routing_key = %message.routing_key, "queue receiver is gone, dropping message");
            }
        }

        Ok(())
    }

    fn bind(
        &self,
        queue: &str,
        bindings: &[String],
    ) -> Result<mpsc::UnboundedReceiver<MemoryMessage>, BusError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state()?.queues.insert(
            queue.to_owned(),
            Queue {
                bindings: bindings.to_vec(),
                sender,
            },
        );
        Ok(receiver)
    }
}

#[derive(Debug)]
pub struct MemoryPublisher {
    broker: MemoryBroker,
    connected: AtomicBool,
}

impl MemoryPublisher {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn connect(&self) -> Result<(), BusError> {
        self.broker.connect_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = self.broker.state()?.connect_failures.pop_front() {
            return Err(BusError::Rejected(message));
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn send(
        &self,
        routing_key: &str,
        envelope: &EventEnvelope,
        payload: &[u8],
    ) -> Result<(), BusError> {
        self.broker.publish_calls.fetch_add(1, Ordering::SeqCst);

        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }

        if let Some(message) = self.broker.state()?.publish_failures.pop_front() {
            return Err(BusError::Rejected(message));
        }

        self.broker.route(MemoryMessage {
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
            redelivery_count: 0,
        })?;
        self.broker.state()?.published.push(envelope.clone());

        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), BusError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemorySubscriber {
    broker: MemoryBroker,
    queue: String,
    receiver: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<MemoryMessage>>>,
}

impl MemorySubscriber {
    pub fn new(broker: MemoryBroker, queue: &str) -> Self {
        Self {
            broker,
            queue: queue.to_owned(),
            receiver: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.receiver.lock().await.is_some()
    }

    pub async fn connect(&self, bindings: &[String]) -> Result<(), BusError> {
        self.broker.connect_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = self.broker.state()?.connect_failures.pop_front() {
            return Err(BusError::Rejected(message));
        }

        let mut receiver = self.receiver.lock().await;
        if receiver.is_none() {
            *receiver = Some(self.broker.bind(&self.queue, bindings)?);
        }

        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Delivery, BusError> {
        let receiver = self
            .receiver
            .get_mut()
            .as_mut()
            .ok_or(BusError::NotConnected)?;

        let message = receiver.recv().await.ok_or(BusError::ConnectionClosed)?;

        Ok(Delivery {
            payload: message.payload,
            routing_key: message.routing_key,
            redelivery_count: message.redelivery_count,
            acker: Acker::Memory(MemoryAcker {
                broker: self.broker.clone(),
                queue: self.queue.clone(),
            }),
        })
    }

    pub async fn close(&self) -> Result<(), BusError> {
        if let Some(mut receiver) = self.receiver.lock().await.take() {
            receiver.close();
        }
        self.broker.state()?.queues.remove(&self.queue);
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
}

impl MemoryAcker {
    pub(crate) fn ack(self) -> Result<(), BusError> {
        self.broker.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn requeue(
        self,
        routing_key: String,
        payload: Vec<u8>,
        redelivery_count: u32,
    ) -> Result<(), BusError> {
        let state = self.broker.state()?;
        let queue = state
            .queues
            .get(&self.queue)
            .ok_or(BusError::ConnectionClosed)?;

        queue
            .sender
            .send(MemoryMessage {
                routing_key,
                payload,
                redelivery_count: redelivery_count + 1,
            })
            .map_err(|_| BusError::ConnectionClosed)
    }

    pub(crate) fn dead_letter(
        self,
        routing_key: String,
        payload: Vec<u8>,
        reason: &str,
    ) -> Result<(), BusError> {
        self.broker.state()?.dead_letters.push(DeadLetter {
            queue: self.queue,
            routing_key,
            payload,
            reason: reason.to_owned(),
        });
        Ok(())
    }
}
