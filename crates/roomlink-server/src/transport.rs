//! The transport collaborator.
//!
//! A [`Connection`] is what the lifecycle controller receives for every
//! accepted client: the room parsed from the request path, a sink for
//! outbound frames and a stream of [`TransportEvent`]s.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::errors::TransportError;

/// Something that happened on a client connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A frame arrived from the client.
    Message(Bytes),
    /// The connection failed.
    Error(TransportError),
    /// The client closed the connection.
    Closed,
}

/// Outbound half of a client connection.
#[async_trait]
pub trait TransportSink: Send + Sync {
    /// Send one frame to the client.
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Start closing the connection. Idempotent.
    async fn close(&self);
}

/// An accepted client connection.
pub struct Connection {
    target_room: String,
    sink: Arc<dyn TransportSink>,
    events: mpsc::Receiver<TransportEvent>,
}

impl Connection {
    /// Wrap a connection accepted on `path`.
    pub fn new(
        path: &str,
        sink: Arc<dyn TransportSink>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        Self {
            target_room: room_from_path(path),
            sink,
            events,
        }
    }

    /// Room requested by the client.
    pub fn target_room(&self) -> &str {
        &self.target_room
    }

    /// Split into room, sink and event stream.
    pub fn into_parts(
        self,
    ) -> (
        String,
        Arc<dyn TransportSink>,
        mpsc::Receiver<TransportEvent>,
    ) {
        (self.target_room, self.sink, self.events)
    }
}

/// Room named by a request path: the path with its leading `/` removed.
pub fn room_from_path(path: &str) -> String {
    path.strip_prefix('/').unwrap_or(path).to_owned()
}
