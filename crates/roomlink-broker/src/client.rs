//! The broker collaborator contract.
//!
//! A [`BrokerClient`] is one shared connection to a topic broker. All methods
//! take `&self` and may be called concurrently from many tasks.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use roomlink_core::{ConsumerTag, HeaderError, MessageHeaders, RoutingHeaders};
use serde::{Deserialize, Serialize};

use crate::errors::BrokerClientError;

/// Where and as whom to connect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Broker host name.
    pub host: String,
    /// Application identity presented to the broker.
    pub application_name: String,
}

/// Exchange routing behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Hierarchical wildcard matching on `.`-separated routing keys.
    Topic,
}

/// Options an exchange is declared with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    /// Routing behaviour.
    pub kind: ExchangeKind,
    /// Survives a broker restart.
    pub durable: bool,
    /// Removed once the last queue unbinds.
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// Non-durable, non-auto-deleted topic exchange.
    pub const fn topic() -> Self {
        Self {
            kind: ExchangeKind::Topic,
            durable: false,
            auto_delete: false,
        }
    }
}

/// Options a queue is declared with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    /// Only usable by the declaring connection.
    pub exclusive: bool,
    /// Removed once its last consumer is cancelled.
    pub auto_delete: bool,
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self {
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// One message handed to a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// Opaque body.
    pub body: Bytes,
    /// Header table.
    pub headers: MessageHeaders,
}

impl Delivery {
    /// Decode `{room, client, action}` from the header table.
    pub fn routing_headers(&self) -> Result<RoutingHeaders, HeaderError> {
        RoutingHeaders::from_headers(&self.headers)
    }
}

/// Receives deliveries for one consumer, one at a time, in queue order.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Handle one delivery.
    async fn on_delivery(&self, delivery: Delivery);
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> DeliveryHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_delivery(&self, delivery: Delivery) {
        (self.0)(delivery).await;
    }
}

/// Wrap an async closure as a [`DeliveryHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn DeliveryHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A connection to a topic broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Declare an exchange. Re-declaring with identical options succeeds.
    async fn declare_exchange(&self, name: &str, spec: &ExchangeSpec)
    -> Result<(), BrokerClientError>;

    /// Declare a queue. Re-declaring with identical options succeeds.
    async fn declare_queue(&self, name: &str, spec: &QueueSpec) -> Result<(), BrokerClientError>;

    /// Bind `queue` to `exchange` with a routing pattern.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerClientError>;

    /// Attach a consumer; deliveries flow to `handler` until cancelled.
    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<ConsumerTag, BrokerClientError>;

    /// Cancel a consumer.
    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerClientError>;

    /// Delete a queue. Deleting a queue that is already gone succeeds.
    async fn delete_queue(&self, name: &str) -> Result<(), BrokerClientError>;

    /// Publish without waiting for a broker acknowledgement.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        headers: MessageHeaders,
    ) -> Result<(), BrokerClientError>;
}
