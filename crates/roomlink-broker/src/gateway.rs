//! `BrokerGateway`: the async façade every other component talks to.
//!
//! The gateway owns the consumer bookkeeping: for each queue name it keeps the
//! consumer tags it has handed out, guarded by a mutex for that queue alone.
//! Operations on unrelated queues never contend on a shared lock.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use roomlink_core::{ConsumerTag, MessageHeaders};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::client::{BrokerClient, DeliveryHandler, ExchangeSpec, QueueSpec};
use crate::errors::{BrokerClientError, GatewayError};

/// A declared exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exchange {
    /// Exchange name.
    pub name: String,
    /// Options it was declared with.
    pub spec: ExchangeSpec,
}

/// A declared queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueHandle {
    name: String,
}

impl QueueHandle {
    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An active subscription on a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerHandle {
    queue: String,
    tag: ConsumerTag,
}

impl ConsumerHandle {
    /// Queue this consumer is attached to.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Broker-assigned consumer tag.
    pub fn tag(&self) -> &ConsumerTag {
        &self.tag
    }
}

type ConsumerSlot = Arc<Mutex<Vec<ConsumerTag>>>;

/// Async façade over a shared [`BrokerClient`].
///
/// `publish` is fire-and-forget: the connection is not in confirm mode, so
/// `Ok(())` only means the message was handed to the broker client, not that
/// it was routed or delivered. No operation is retried.
pub struct BrokerGateway {
    client: Arc<dyn BrokerClient>,
    consumers: DashMap<String, ConsumerSlot>,
}

impl BrokerGateway {
    /// Wrap a broker connection.
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self {
            client,
            consumers: DashMap::new(),
        }
    }

    fn slot(&self, queue: &str) -> ConsumerSlot {
        self.consumers.entry(queue.to_owned()).or_default().clone()
    }

    fn existing_slot(&self, queue: &str) -> Option<ConsumerSlot> {
        self.consumers.get(queue).map(|s| s.value().clone())
    }

    /// Forget `slot` if it is still the tracked one and holds no consumers.
    /// Must be called with the slot's lock released.
    fn release_if_unused(&self, queue: &str, slot: &ConsumerSlot) {
        let _ = self.consumers.remove_if(queue, |_, s| {
            Arc::ptr_eq(s, slot) && s.try_lock().is_ok_and(|tags| tags.is_empty())
        });
    }

    /// Declare an exchange. Idempotent when the options match.
    #[instrument(skip(self, name, spec), fields(exchange = name))]
    pub async fn declare_exchange(
        &self,
        name: &str,
        spec: ExchangeSpec,
    ) -> Result<Exchange, GatewayError> {
        match self.client.declare_exchange(name, &spec).await {
            Ok(()) => {
                debug!("exchange declared");
                Ok(Exchange {
                    name: name.to_owned(),
                    spec,
                })
            }
            Err(BrokerClientError::ExchangeConflict { .. }) => Err(GatewayError::ExchangeConflict {
                exchange: name.to_owned(),
            }),
            Err(e) => Err(GatewayError::from_client(e, |reason| {
                GatewayError::ExchangeDeclareFailed {
                    exchange: name.to_owned(),
                    reason,
                }
            })),
        }
    }

    /// Declare a queue.
    #[instrument(skip(self, name, spec), fields(queue = name))]
    pub async fn declare_queue(
        &self,
        name: &str,
        spec: QueueSpec,
    ) -> Result<QueueHandle, GatewayError> {
        self.client
            .declare_queue(name, &spec)
            .await
            .map_err(|e| {
                GatewayError::from_client(e, |reason| GatewayError::QueueDeclareFailed {
                    queue: name.to_owned(),
                    reason,
                })
            })?;
        debug!("queue declared");
        Ok(QueueHandle {
            name: name.to_owned(),
        })
    }

    /// Bind a declared queue to an exchange.
    #[instrument(skip(self, queue), fields(queue = queue.name()))]
    pub async fn bind(
        &self,
        queue: &QueueHandle,
        exchange: &str,
        routing_key: &str,
    ) -> Result<QueueHandle, GatewayError> {
        self.client
            .bind_queue(&queue.name, exchange, routing_key)
            .await
            .map_err(|e| {
                GatewayError::from_client(e, |reason| GatewayError::BindFailed {
                    queue: queue.name.clone(),
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    reason,
                })
            })?;
        debug!("queue bound");
        Ok(queue.clone())
    }

    /// Attach `handler` to a queue.
    ///
    /// The handler sees deliveries one at a time in queue order. Nothing is
    /// guaranteed about ordering across different queues.
    #[instrument(skip(self, queue, handler), fields(queue = queue.name()))]
    pub async fn subscribe(
        &self,
        queue: &QueueHandle,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<ConsumerHandle, GatewayError> {
        let slot = self.slot(&queue.name);
        let mut tags = slot.lock().await;
        let tag = match self.client.consume(&queue.name, handler).await {
            Ok(tag) => tag,
            Err(e) => {
                drop(tags);
                self.release_if_unused(&queue.name, &slot);
                return Err(GatewayError::from_client(e, |reason| {
                    GatewayError::SubscribeFailed {
                        queue: queue.name.clone(),
                        reason,
                    }
                }));
            }
        };
        tags.push(tag.clone());
        debug!(consumer_tag = %tag, consumers = tags.len(), "subscribed");
        Ok(ConsumerHandle {
            queue: queue.name.clone(),
            tag,
        })
    }

    /// Cancel a consumer. Unsubscribing a handle that is already gone is a no-op.
    #[instrument(skip(self, handle), fields(queue = handle.queue(), consumer_tag = %handle.tag()))]
    pub async fn unsubscribe(&self, handle: &ConsumerHandle) -> Result<(), GatewayError> {
        let Some(slot) = self.existing_slot(&handle.queue) else {
            debug!("no consumers tracked for queue");
            return Ok(());
        };
        let mut tags = slot.lock().await;
        let Some(pos) = tags.iter().position(|t| t == &handle.tag) else {
            debug!("consumer already removed");
            return Ok(());
        };
        match self.client.cancel(&handle.tag).await {
            Ok(()) | Err(BrokerClientError::NotFound { .. }) => {
                let _ = tags.remove(pos);
                debug!(remaining = tags.len(), "unsubscribed");
                Ok(())
            }
            Err(e) => Err(GatewayError::from_client(e, |reason| {
                GatewayError::UnsubscribeFailed {
                    queue: handle.queue.clone(),
                    reason,
                }
            })),
        }
    }

    /// Delete a queue that has no remaining consumers.
    ///
    /// Fails with [`GatewayError::QueueBusy`] while any consumer handle for
    /// the queue is still registered.
    pub async fn destroy(&self, queue: &QueueHandle) -> Result<(), GatewayError> {
        self.destroy_inner(&queue.name, false).await
    }

    /// Cancel any remaining consumers, then delete the queue.
    pub async fn force_destroy(&self, queue: &QueueHandle) -> Result<(), GatewayError> {
        self.destroy_inner(&queue.name, true).await
    }

    #[instrument(skip(self, name), fields(queue = name))]
    async fn destroy_inner(&self, name: &str, force: bool) -> Result<(), GatewayError> {
        let slot = self.slot(name);
        let mut tags = slot.lock().await;
        let result = self.destroy_locked(name, force, &mut tags).await;
        drop(tags);
        if result.is_ok() {
            let _ = self
                .consumers
                .remove_if(name, |_, s| Arc::ptr_eq(s, &slot));
            debug!("queue destroyed");
        } else {
            self.release_if_unused(name, &slot);
        }
        result
    }

    async fn destroy_locked(
        &self,
        name: &str,
        force: bool,
        tags: &mut Vec<ConsumerTag>,
    ) -> Result<(), GatewayError> {
        if !tags.is_empty() {
            if !force {
                return Err(GatewayError::QueueBusy {
                    queue: name.to_owned(),
                    consumers: tags.len(),
                });
            }
            for tag in tags.drain(..) {
                match self.client.cancel(&tag).await {
                    Ok(()) | Err(BrokerClientError::NotFound { .. }) => {}
                    Err(BrokerClientError::ConnectionClosed) => {
                        return Err(GatewayError::ConnectionLost);
                    }
                    Err(e) => warn!(consumer_tag = %tag, error = %e, "cancel before destroy failed"),
                }
            }
        }
        self.client.delete_queue(name).await.map_err(|e| {
            GatewayError::from_client(e, |reason| GatewayError::DestroyFailed {
                queue: name.to_owned(),
                reason,
            })
        })
    }

    /// Publish a message. See the type-level note on confirmation.
    #[instrument(skip(self, body, headers))]
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Bytes>,
        headers: MessageHeaders,
    ) -> Result<(), GatewayError> {
        self.client
            .publish(exchange, routing_key, body.into(), headers)
            .await
            .map_err(|e| {
                GatewayError::from_client(e, |reason| GatewayError::PublishFailed {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    reason,
                })
            })
    }

    /// Consumers currently registered for a queue.
    pub async fn consumer_count(&self, queue: &str) -> usize {
        match self.existing_slot(queue) {
            Some(slot) => slot.lock().await.len(),
            None => 0,
        }
    }
}
