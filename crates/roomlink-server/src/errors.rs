//! Server error types.

use roomlink_broker::GatewayError;
use roomlink_core::RoutingError;
use thiserror::Error;

/// Connection-level failure on a client transport.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection is closed or closing.
    #[error("transport closed")]
    Closed,
    /// The connection failed.
    #[error("transport error: {0}")]
    Io(String),
}

/// Errors in a session's lifecycle.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Declaring, binding or subscribing one of the session's queues failed.
    #[error("provisioning queue {queue:?} failed: {source}")]
    ProvisioningFailed {
        /// Queue being provisioned.
        queue: String,
        /// Gateway failure.
        #[source]
        source: GatewayError,
    },
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// An identifier could not be turned into a queue name or routing key.
    #[error(transparent)]
    Routing(#[from] RoutingError),
    /// A gateway operation outside provisioning failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    /// The session already has a room.
    #[error("session already assigned to room {room:?}")]
    RoomAlreadyAssigned {
        /// The room assigned first.
        room: String,
    },
}

impl SessionError {
    /// Whether the underlying cause is a lost broker connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ProvisioningFailed { source, .. } | Self::Gateway(source) => source.is_fatal(),
            _ => false,
        }
    }
}

/// Failures while bringing the bridge up.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Declaring an exchange or the monitor queue failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    /// The monitor id could not be used as a queue name.
    #[error(transparent)]
    Routing(#[from] RoutingError),
}
