//! Broker error types.

use thiserror::Error;

/// Failure reported by a [`BrokerClient`](crate::BrokerClient) implementation.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BrokerClientError {
    /// An exchange of this name exists with different options.
    #[error("exchange {name:?} already exists with different options")]
    ExchangeConflict {
        /// Exchange name.
        name: String,
    },
    /// A queue of this name exists with incompatible options.
    #[error("queue {name:?} already exists with incompatible options")]
    QueueConflict {
        /// Queue name.
        name: String,
    },
    /// The named exchange, queue or consumer does not exist.
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// `"exchange"`, `"queue"` or `"consumer"`.
        kind: &'static str,
        /// The missing name.
        name: String,
    },
    /// The broker connection is gone.
    #[error("broker connection closed")]
    ConnectionClosed,
    /// Anything else the broker rejected.
    #[error("{0}")]
    Other(String),
}

/// Errors surfaced by [`BrokerGateway`](crate::BrokerGateway) operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Re-declaring an exchange with options that differ from the existing one.
    #[error("exchange {exchange:?} conflicts with an existing declaration")]
    ExchangeConflict {
        /// Exchange name.
        exchange: String,
    },
    /// The broker rejected an exchange declaration for another reason.
    #[error("failed to declare exchange {exchange:?}: {reason}")]
    ExchangeDeclareFailed {
        /// Exchange name.
        exchange: String,
        /// Broker-reported cause.
        reason: String,
    },
    /// The broker rejected a queue declaration.
    #[error("failed to declare queue {queue:?}: {reason}")]
    QueueDeclareFailed {
        /// Queue name.
        queue: String,
        /// Broker-reported cause.
        reason: String,
    },
    /// Binding failed, typically because the exchange does not exist.
    #[error("failed to bind queue {queue:?} to {exchange:?} with {routing_key:?}: {reason}")]
    BindFailed {
        /// Queue name.
        queue: String,
        /// Exchange name.
        exchange: String,
        /// Binding pattern.
        routing_key: String,
        /// Broker-reported cause.
        reason: String,
    },
    /// Attaching a consumer failed.
    #[error("failed to subscribe to queue {queue:?}: {reason}")]
    SubscribeFailed {
        /// Queue name.
        queue: String,
        /// Broker-reported cause.
        reason: String,
    },
    /// Cancelling a consumer failed.
    #[error("failed to unsubscribe from queue {queue:?}: {reason}")]
    UnsubscribeFailed {
        /// Queue name.
        queue: String,
        /// Broker-reported cause.
        reason: String,
    },
    /// Destroy requested while consumers are still registered.
    #[error("queue {queue:?} still has {consumers} consumer(s)")]
    QueueBusy {
        /// Queue name.
        queue: String,
        /// Outstanding consumer count.
        consumers: usize,
    },
    /// The broker client refused the publish.
    #[error("failed to publish to {exchange:?} with {routing_key:?}: {reason}")]
    PublishFailed {
        /// Exchange name.
        exchange: String,
        /// Routing key.
        routing_key: String,
        /// Broker-reported cause.
        reason: String,
    },
    /// Deleting a queue failed.
    #[error("failed to destroy queue {queue:?}: {reason}")]
    DestroyFailed {
        /// Queue name.
        queue: String,
        /// Broker-reported cause.
        reason: String,
    },
    /// The broker connection was lost. Fatal for the process.
    #[error("broker connection lost")]
    ConnectionLost,
}

impl GatewayError {
    /// Whether this error means the process can no longer talk to the broker.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost)
    }

    /// Map a client error, turning a closed connection into [`Self::ConnectionLost`].
    pub(crate) fn from_client(
        err: BrokerClientError,
        otherwise: impl FnOnce(String) -> GatewayError,
    ) -> GatewayError {
        match err {
            BrokerClientError::ConnectionClosed => Self::ConnectionLost,
            other => otherwise(other.to_string()),
        }
    }
}
