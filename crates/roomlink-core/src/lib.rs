//! # roomlink-core
//!
//! Shared vocabulary for the roomlink crates.
//!
//! - **Routing scheme**: queue names and routing keys for room / broadcast /
//!   private addressing, with identifier validation
//! - **Branded IDs**: `ClientId`, `MonitorId`, `ConsumerTag` as newtypes
//! - **Headers**: the `{room, client, action}` routing headers carried on
//!   client-originated traffic
//! - **Payloads**: decoding of inbound client frames (`{action, data}`)
//! - **Logging**: `tracing` subscriber setup and a capture layer for tests

#![deny(unsafe_code)]

pub mod headers;
pub mod ids;
pub mod logging;
pub mod payload;
pub mod routing;

pub use headers::{HeaderError, MessageHeaders, RoutingHeaders};
pub use ids::{ClientId, ConsumerTag, MonitorId};
pub use payload::{ClientPayload, PayloadError};
pub use routing::{QueueBinding, RoutingError, CLIENT_EXCHANGE, SERVER_EXCHANGE};
