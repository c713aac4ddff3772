//! # roomlink-server
//!
//! Bridges WebSocket clients to the topic broker, grouped by room.
//!
//! - [`Session`]: one connected client, its room and its transport
//! - [`LifecycleController`]: provisions a session's public and private
//!   queues, forwards traffic both ways, tears everything down on close
//! - [`Monitor`]: observes every client-originated message and republishes it
//!   to the room's broadcast key
//! - [`bootstrap`]: exchange declaration and monitor start-up
//! - HTTP surface: the WebSocket endpoint (`/<room>`) and `/health`

#![deny(unsafe_code)]

pub mod bootstrap;
pub mod config;
pub mod errors;
pub mod health;
pub mod lifecycle;
pub mod monitor;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod transport;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

pub use bootstrap::{bootstrap, Bridge};
pub use config::ServerConfig;
pub use errors::{SessionError, StartupError, TransportError};
pub use lifecycle::LifecycleController;
pub use monitor::{Monitor, MonitorSnapshot};
pub use registry::SessionRegistry;
pub use server::RoomlinkServer;
pub use session::{Session, SessionEvent, SessionState};
pub use shutdown::ShutdownCoordinator;
pub use transport::{Connection, TransportEvent, TransportSink};
