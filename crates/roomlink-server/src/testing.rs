//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use roomlink_broker::{
    handler_fn, BrokerClient, BrokerClientError, BrokerGateway, ConnectOptions, Delivery,
    DeliveryHandler, ExchangeSpec, MemoryBroker, QueueSpec,
};
use roomlink_core::{ConsumerTag, MessageHeaders, CLIENT_EXCHANGE, SERVER_EXCHANGE};
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::transport::TransportSink;

/// Sink that records frames and refuses them once closed.
#[derive(Default)]
pub(crate) struct RecordingSink {
    frames: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl TransportSink for RecordingSink {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.frames.lock().push(frame);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub(crate) fn connect_broker() -> (Arc<MemoryBroker>, Arc<BrokerGateway>) {
    let broker = MemoryBroker::connect(ConnectOptions {
        host: "localhost".into(),
        application_name: "roomlink-test".into(),
    });
    let gateway = Arc::new(BrokerGateway::new(broker.clone()));
    (broker, gateway)
}

pub(crate) async fn declare_exchanges(gateway: &BrokerGateway) {
    for name in [SERVER_EXCHANGE, CLIENT_EXCHANGE] {
        let _ = gateway
            .declare_exchange(name, ExchangeSpec::topic())
            .await
            .unwrap();
    }
}

/// Bind a fresh queue to `exchange` and stream its deliveries.
pub(crate) async fn collect(
    gateway: &BrokerGateway,
    exchange: &str,
    pattern: &str,
) -> mpsc::UnboundedReceiver<Delivery> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |d: Delivery| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(d);
        }
    });
    let name = format!("collector.{}", ConsumerTag::new());
    let queue = gateway
        .declare_queue(&name, QueueSpec::default())
        .await
        .unwrap();
    let queue = gateway.bind(&queue, exchange, pattern).await.unwrap();
    let _ = gateway.subscribe(&queue, handler).await.unwrap();
    rx
}

pub(crate) async fn recv(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("delivery timed out")
        .expect("collector closed")
}

/// Wraps a [`MemoryBroker`], delaying and optionally failing binds of queues
/// whose name ends with `suffix`, and recording every queue-level call.
pub(crate) struct FaultyBroker {
    inner: Arc<MemoryBroker>,
    bind_suffix: String,
    bind_delay: Duration,
    fail_bind: bool,
    calls: Mutex<Vec<String>>,
}

impl FaultyBroker {
    pub(crate) fn failing_bind(inner: Arc<MemoryBroker>, suffix: &str) -> Self {
        Self::slow_bind(inner, suffix, Duration::ZERO, true)
    }

    pub(crate) fn slow_bind(
        inner: Arc<MemoryBroker>,
        suffix: &str,
        delay: Duration,
        fail: bool,
    ) -> Self {
        Self {
            inner,
            bind_suffix: suffix.to_owned(),
            bind_delay: delay,
            fail_bind: fail,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl BrokerClient for FaultyBroker {
    async fn declare_exchange(
        &self,
        name: &str,
        spec: &ExchangeSpec,
    ) -> Result<(), BrokerClientError> {
        self.inner.declare_exchange(name, spec).await
    }

    async fn declare_queue(&self, name: &str, spec: &QueueSpec) -> Result<(), BrokerClientError> {
        self.record(format!("declare {name}"));
        self.inner.declare_queue(name, spec).await
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerClientError> {
        self.record(format!("bind {queue}"));
        if queue.ends_with(&self.bind_suffix) {
            if !self.bind_delay.is_zero() {
                tokio::time::sleep(self.bind_delay).await;
            }
            if self.fail_bind {
                return Err(BrokerClientError::Other("injected bind failure".into()));
            }
        }
        self.inner.bind_queue(queue, exchange, routing_key).await
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<ConsumerTag, BrokerClientError> {
        self.record(format!("consume {queue}"));
        self.inner.consume(queue, handler).await
    }

    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerClientError> {
        self.record("cancel".to_owned());
        self.inner.cancel(tag).await
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerClientError> {
        self.record(format!("delete {name}"));
        self.inner.delete_queue(name).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        headers: MessageHeaders,
    ) -> Result<(), BrokerClientError> {
        self.inner.publish(exchange, routing_key, body, headers).await
    }
}
