//! One connected client.
//!
//! A [`Session`] is shared (`Arc`) between its lifecycle controller, the
//! registry and the delivery handlers on its queues. Its inbound events are
//! not shared: they live in a [`SessionEvents`] owned by the controller.

use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::Mutex;
use roomlink_core::ClientId;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::errors::{SessionError, TransportError};
use crate::transport::{TransportEvent, TransportSink};

/// Lifecycle states, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Transport accepted, nothing else yet.
    Connecting,
    /// Room attached.
    RoomAssigned,
    /// Public and private queues being declared, bound and subscribed.
    QueuesProvisioning,
    /// Both queues subscribed; traffic flows both ways.
    Active,
    /// Unsubscribing and destroying queues.
    TearingDown,
    /// Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::RoomAssigned => "room_assigned",
            Self::QueuesProvisioning => "queues_provisioning",
            Self::Active => "active",
            Self::TearingDown => "tearing_down",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Inbound lifecycle event of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// The client sent a frame.
    MessageReceived(Bytes),
    /// The transport failed.
    Error(TransportError),
    /// The transport closed.
    Closed,
}

impl From<TransportEvent> for SessionEvent {
    fn from(event: TransportEvent) -> Self {
        match event {
            TransportEvent::Message(bytes) => Self::MessageReceived(bytes),
            TransportEvent::Error(e) => Self::Error(e),
            TransportEvent::Closed => Self::Closed,
        }
    }
}

/// Inbound event stream of a session.
pub struct SessionEvents {
    rx: mpsc::Receiver<TransportEvent>,
}

impl SessionEvents {
    /// Wrap a transport event receiver.
    pub fn new(rx: mpsc::Receiver<TransportEvent>) -> Self {
        Self { rx }
    }

    /// Next event. A transport that went away without saying so reads as `Closed`.
    pub async fn next(&mut self) -> SessionEvent {
        self.rx
            .recv()
            .await
            .map_or(SessionEvent::Closed, SessionEvent::from)
    }
}

/// A connected client.
pub struct Session {
    id: ClientId,
    room: OnceLock<String>,
    sink: Arc<dyn TransportSink>,
    state: watch::Sender<SessionState>,
    history: Mutex<Vec<SessionState>>,
}

impl Session {
    /// New session in [`SessionState::Connecting`].
    pub fn new(id: ClientId, sink: Arc<dyn TransportSink>) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            id,
            room: OnceLock::new(),
            sink,
            state,
            history: Mutex::new(vec![SessionState::Connecting]),
        }
    }

    /// Client id.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Assigned room, once set.
    pub fn room(&self) -> Option<&str> {
        self.room.get().map(String::as_str)
    }

    /// Attach the room. Succeeds exactly once.
    pub fn assign_room(&self, room: impl Into<String>) -> Result<(), SessionError> {
        self.room.set(room.into()).map_err(|_| SessionError::RoomAlreadyAssigned {
            room: self.room().unwrap_or_default().to_owned(),
        })
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Every state this session has been in, oldest first.
    pub fn history(&self) -> Vec<SessionState> {
        self.history.lock().clone()
    }

    /// Move to `next`. Nothing leaves [`SessionState::Closed`].
    pub(crate) fn transition(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == SessionState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            self.history.lock().push(next);
            debug!(client_id = %self.id, state = %next, "session state changed");
        }
    }

    /// Whether the session ever reached [`SessionState::Active`].
    pub fn was_active(&self) -> bool {
        self.history.lock().contains(&SessionState::Active)
    }

    /// Forward a broker message to the client.
    ///
    /// Deliveries that arrive while the queues are still being provisioned
    /// are held until the session settles. They are sent once it is
    /// [`SessionState::Active`] and dropped if it tears down without ever
    /// getting there. A closed or closing transport is not an error here:
    /// deliveries can race teardown. Returns whether the frame was handed to
    /// the transport.
    pub async fn deliver(&self, frame: Bytes) -> bool {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(|s| *s >= SessionState::Active).await {
            Ok(state) => *state,
            Err(_) => return false,
        };
        if settled == SessionState::Closed {
            debug!(client_id = %self.id, "delivery after close discarded");
            return false;
        }
        if !self.was_active() {
            debug!(client_id = %self.id, "delivery for session that never activated discarded");
            return false;
        }
        match self.sink.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                debug!(client_id = %self.id, error = %e, "delivery not sent");
                false
            }
        }
    }

    /// Close the transport.
    pub async fn close(&self) {
        self.sink.close().await;
    }
}
