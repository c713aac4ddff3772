//! The monitor: re-addresses every client-originated message to its room.
//!
//! One instance per process, owning one queue (`monitor.<id>`) bound to
//! `user-to-server` with `#`. Each delivery's `{room, client, action}`
//! headers select the republish key
//! `room.<room>.broadcast.client.<client>.<action>` on `server-to-user`. The
//! body is forwarded untouched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use roomlink_broker::{
    BrokerGateway, ConsumerHandle, Delivery, DeliveryHandler, GatewayError, QueueHandle, QueueSpec,
};
use roomlink_core::routing::{monitor_queue, republish_key};
use roomlink_core::{MonitorId, CLIENT_EXCHANGE, SERVER_EXCHANGE};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::errors::StartupError;

/// Counters reported on `/health`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    /// Monitor id.
    pub id: String,
    /// Messages republished to a room.
    pub republished: u64,
    /// Messages dropped (unusable headers or failed publish).
    pub dropped: u64,
}

struct Republisher {
    gateway: Arc<BrokerGateway>,
    fatal: CancellationToken,
    republished: AtomicU64,
    dropped: AtomicU64,
}

impl Republisher {
    async fn handle(&self, delivery: Delivery) {
        let headers = match delivery.routing_headers() {
            Ok(headers) => headers,
            Err(e) => {
                warn!(
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "dropping client message without usable routing headers"
                );
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let key = match republish_key(&headers.room, &headers.client, &headers.action) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "dropping client message with unroutable headers");
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        match self
            .gateway
            .publish(SERVER_EXCHANGE, &key, delivery.body, delivery.headers)
            .await
        {
            Ok(()) => {
                let _ = self.republished.fetch_add(1, Ordering::Relaxed);
                debug!(routing_key = %key, "republished");
            }
            Err(e) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                if e.is_fatal() {
                    error!(error = %e, "monitor lost the broker connection");
                    self.fatal.cancel();
                } else {
                    warn!(routing_key = %key, error = %e, "republish failed");
                }
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for Republisher {
    async fn on_delivery(&self, delivery: Delivery) {
        self.handle(delivery).await;
    }
}

/// Process-wide observer of client traffic.
pub struct Monitor {
    id: MonitorId,
    republisher: Arc<Republisher>,
    subscription: Mutex<Option<(QueueHandle, ConsumerHandle)>>,
}

impl Monitor {
    /// Provision the monitor queue and start consuming.
    ///
    /// `fatal` is cancelled if the broker connection is found to be lost.
    #[instrument(skip_all)]
    pub async fn start(
        gateway: Arc<BrokerGateway>,
        fatal: CancellationToken,
    ) -> Result<Arc<Self>, StartupError> {
        let id = MonitorId::new();
        let binding = monitor_queue(id.as_str())?;
        let republisher = Arc::new(Republisher {
            gateway: gateway.clone(),
            fatal,
            republished: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let queue = gateway
            .declare_queue(&binding.queue, QueueSpec::default())
            .await?;
        let queue = gateway
            .bind(&queue, CLIENT_EXCHANGE, &binding.routing_key)
            .await?;
        let consumer = gateway.subscribe(&queue, republisher.clone()).await?;
        info!(monitor_id = %id, queue = %binding.queue, "monitor started");

        Ok(Arc::new(Self {
            id,
            republisher,
            subscription: Mutex::new(Some((queue, consumer))),
        }))
    }

    /// Monitor id.
    pub fn id(&self) -> &MonitorId {
        &self.id
    }

    /// Whether the monitor still owns its subscription.
    pub fn is_running(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Current counters.
    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            id: self.id.to_string(),
            republished: self.republisher.republished.load(Ordering::Relaxed),
            dropped: self.republisher.dropped.load(Ordering::Relaxed),
        }
    }

    /// Process one client-originated message as if it had been delivered.
    pub async fn ingest(&self, delivery: Delivery) {
        self.republisher.handle(delivery).await;
    }

    /// Unsubscribe and destroy the monitor queue. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        let Some((queue, consumer)) = self.subscription.lock().take() else {
            return Ok(());
        };
        let gateway = &self.republisher.gateway;
        gateway.unsubscribe(&consumer).await?;
        gateway.destroy(&queue).await?;
        info!(monitor_id = %self.id, "monitor stopped");
        Ok(())
    }
}
