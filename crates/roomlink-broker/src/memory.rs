//! In-process topic broker.
//!
//! Implements [`BrokerClient`] with topic-exchange routing (`*` is exactly one
//! word, `#` is zero or more), exclusive auto-delete queues and one delivery
//! task per consumer. Used by the binary when no external broker is wired in,
//! and by tests everywhere.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use roomlink_core::routing::topic_matches;
use roomlink_core::{ConsumerTag, MessageHeaders};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::client::{BrokerClient, ConnectOptions, Delivery, DeliveryHandler, ExchangeSpec, QueueSpec};
use crate::errors::BrokerClientError;

struct Binding {
    exchange: String,
    pattern: String,
}

struct Consumer {
    tag: ConsumerTag,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct MemoryQueue {
    spec: QueueSpec,
    bindings: Vec<Binding>,
    consumers: Vec<Consumer>,
    next: usize,
    pending: VecDeque<Delivery>,
}

impl MemoryQueue {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            bindings: Vec::new(),
            consumers: Vec::new(),
            next: 0,
            pending: VecDeque::new(),
        }
    }

    fn routes(&self, exchange: &str, routing_key: &str) -> bool {
        self.bindings
            .iter()
            .any(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
    }

    /// Round-robin to live consumers; buffer while there are none.
    fn enqueue(&mut self, mut delivery: Delivery) {
        while !self.consumers.is_empty() {
            let idx = self.next % self.consumers.len();
            self.next = self.next.wrapping_add(1);
            match self.consumers[idx].tx.send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    delivery = returned;
                    let _ = self.consumers.remove(idx);
                }
            }
        }
        self.pending.push_back(delivery);
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    consumers: HashMap<ConsumerTag, String>,
}

/// An in-process topic broker.
pub struct MemoryBroker {
    options: ConnectOptions,
    connected: AtomicBool,
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    /// Open a new broker "connection".
    pub fn connect(options: ConnectOptions) -> Arc<Self> {
        info!(
            host = %options.host,
            application = %options.application_name,
            "connected to in-process broker"
        );
        Arc::new(Self {
            options,
            connected: AtomicBool::new(true),
            state: Mutex::new(BrokerState::default()),
        })
    }

    /// Options this connection was opened with.
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Whether the connection is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Drop the connection.
    ///
    /// Exclusive queues and their consumers go with it. Every later operation
    /// fails with [`BrokerClientError::ConnectionClosed`].
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.lock();
        state.queues.retain(|_, q| !q.spec.exclusive);
        state.consumers.clear();
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
        warn!(host = %self.options.host, "broker connection closed");
    }

    /// Options an exchange was declared with.
    pub fn exchange_spec(&self, name: &str) -> Option<ExchangeSpec> {
        self.state.lock().exchanges.get(name).copied()
    }

    /// Whether a queue currently exists.
    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    /// Names of all existing queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// `(exchange, pattern)` bindings of a queue.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| {
                q.bindings
                    .iter()
                    .map(|b| (b.exchange.clone(), b.pattern.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live consumers on a queue.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Messages waiting on a queue for a consumer.
    pub fn pending_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.pending.len())
    }

    fn ensure_connected(&self) -> Result<(), BrokerClientError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerClientError::ConnectionClosed)
        }
    }
}

fn not_found(kind: &'static str, name: &str) -> BrokerClientError {
    BrokerClientError::NotFound {
        kind,
        name: name.to_owned(),
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn declare_exchange(
        &self,
        name: &str,
        spec: &ExchangeSpec,
    ) -> Result<(), BrokerClientError> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        match state.exchanges.get(name) {
            Some(existing) if existing == spec => Ok(()),
            Some(_) => Err(BrokerClientError::ExchangeConflict {
                name: name.to_owned(),
            }),
            None => {
                let _ = state.exchanges.insert(name.to_owned(), *spec);
                debug!(exchange = name, "exchange created");
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, spec: &QueueSpec) -> Result<(), BrokerClientError> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        match state.queues.get(name) {
            Some(existing) if existing.spec == *spec => Ok(()),
            Some(_) => Err(BrokerClientError::QueueConflict {
                name: name.to_owned(),
            }),
            None => {
                let _ = state.queues.insert(name.to_owned(), MemoryQueue::new(*spec));
                debug!(queue = name, "queue created");
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerClientError> {
        self.ensure_connected()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.exchanges.contains_key(exchange) {
            return Err(not_found("exchange", exchange));
        }
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| not_found("queue", queue))?;
        let exists = q
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.pattern == routing_key);
        if !exists {
            q.bindings.push(Binding {
                exchange: exchange.to_owned(),
                pattern: routing_key.to_owned(),
            });
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<ConsumerTag, BrokerClientError> {
        self.ensure_connected()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let tag = ConsumerTag::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| not_found("queue", queue))?;
            while let Some(delivery) = q.pending.pop_front() {
                let _ = tx.send(delivery);
            }
            q.consumers.push(Consumer {
                tag: tag.clone(),
                tx,
            });
            let _ = state.consumers.insert(tag.clone(), queue.to_owned());
        }

        let task_tag = tag.clone();
        let _task = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                handler.on_delivery(delivery).await;
            }
            trace!(consumer_tag = %task_tag, "consumer task finished");
        });
        Ok(tag)
    }

    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerClientError> {
        self.ensure_connected()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let queue = state
            .consumers
            .remove(tag)
            .ok_or_else(|| not_found("consumer", tag.as_str()))?;
        let Some(q) = state.queues.get_mut(&queue) else {
            return Ok(());
        };
        q.consumers.retain(|c| &c.tag != tag);
        if q.spec.auto_delete && q.consumers.is_empty() {
            let _ = state.queues.remove(&queue);
            debug!(queue = %queue, "auto-deleted queue after last consumer");
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerClientError> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        if let Some(q) = state.queues.remove(name) {
            for consumer in &q.consumers {
                let _ = state.consumers.remove(&consumer.tag);
            }
            debug!(queue = name, dropped = q.pending.len(), "queue deleted");
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        headers: MessageHeaders,
    ) -> Result<(), BrokerClientError> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(not_found("exchange", exchange));
        }
        let delivery = Delivery {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body,
            headers,
        };
        let mut routed = 0usize;
        for q in state.queues.values_mut() {
            if q.routes(exchange, routing_key) {
                q.enqueue(delivery.clone());
                routed += 1;
            }
        }
        if routed == 0 {
            trace!(exchange, routing_key, "unroutable message dropped");
        }
        Ok(())
    }
}
