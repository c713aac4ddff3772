//! # roomlink-broker
//!
//! Everything between roomlink and the topic broker.
//!
//! - [`BrokerClient`]: the collaborator trait a concrete broker connection implements
//! - [`BrokerGateway`]: async façade with per-queue consumer bookkeeping, so
//!   teardown can unsubscribe every consumer before destroying a queue
//! - [`MemoryBroker`]: in-process topic broker for development and tests

#![deny(unsafe_code)]

pub mod client;
pub mod errors;
pub mod gateway;
pub mod memory;

pub use client::{
    handler_fn, BrokerClient, ConnectOptions, Delivery, DeliveryHandler, ExchangeKind,
    ExchangeSpec, QueueSpec,
};
pub use errors::{BrokerClientError, GatewayError};
pub use gateway::{BrokerGateway, ConsumerHandle, Exchange, QueueHandle};
pub use memory::MemoryBroker;
