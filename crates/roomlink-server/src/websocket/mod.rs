//! axum WebSocket adapter for the transport collaborator.
//!
//! Each upgraded socket is split into a reader task (client frames become
//! [`TransportEvent`](crate::TransportEvent)s) and a writer task (outbound
//! frames plus periodic Ping heartbeats), with the lifecycle controller
//! running in between.

pub mod adapter;
pub mod connection;

pub use adapter::serve_socket;
pub use connection::{Liveness, WsSink};
