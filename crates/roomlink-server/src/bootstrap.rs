//! Start-up orchestration: exchanges, then the monitor, then the controller.

use std::sync::Arc;

use roomlink_broker::{BrokerClient, BrokerGateway, ExchangeSpec};
use roomlink_core::{CLIENT_EXCHANGE, SERVER_EXCHANGE};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::errors::StartupError;
use crate::lifecycle::LifecycleController;
use crate::monitor::Monitor;
use crate::registry::SessionRegistry;

/// Everything needed to serve clients against one broker connection.
#[derive(Clone)]
pub struct Bridge {
    /// Broker façade shared by the monitor and every session.
    pub gateway: Arc<BrokerGateway>,
    /// The process-wide monitor.
    pub monitor: Arc<Monitor>,
    /// Per-session orchestration.
    pub controller: Arc<LifecycleController>,
    /// Live sessions.
    pub registry: Arc<SessionRegistry>,
}

/// Declare both exchanges, start the monitor and build the controller.
///
/// The exchanges are declared concurrently and must both exist before the
/// monitor binds to `user-to-server`. `fatal` is cancelled whenever the broker
/// connection is found to be lost.
#[instrument(skip_all)]
pub async fn bootstrap(
    client: Arc<dyn BrokerClient>,
    fatal: CancellationToken,
) -> Result<Bridge, StartupError> {
    let gateway = Arc::new(BrokerGateway::new(client));

    let (server, user) = tokio::join!(
        gateway.declare_exchange(SERVER_EXCHANGE, ExchangeSpec::topic()),
        gateway.declare_exchange(CLIENT_EXCHANGE, ExchangeSpec::topic()),
    );
    let _ = server?;
    let _ = user?;

    let monitor = Monitor::start(gateway.clone(), fatal.clone()).await?;
    let registry = Arc::new(SessionRegistry::new());
    let controller = Arc::new(LifecycleController::new(
        gateway.clone(),
        monitor.clone(),
        registry.clone(),
        fatal,
    ));
    info!(monitor_id = %monitor.id(), "bridge ready");

    Ok(Bridge {
        gateway,
        monitor,
        controller,
        registry,
    })
}
