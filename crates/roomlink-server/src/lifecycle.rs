//! Client lifecycle controller.
//!
//! Drives one session through
//! `Connecting → RoomAssigned → QueuesProvisioning → Active → TearingDown → Closed`.
//!
//! - Both queues are provisioned concurrently (declare, bind, subscribe in
//!   order per queue) and the session only becomes `Active` once both are
//!   subscribed. Any failure goes straight to `TearingDown`. Deliveries
//!   on the first queue wait in [`Session::deliver`] until then.
//! - Transport events are not read while provisioning, so a close that
//!   arrives early is handled after provisioning has settled.
//! - Teardown unsubscribes both consumers, then destroys both queues. It is
//!   best-effort: failures are logged and never stop the sibling queue.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use roomlink_broker::{
    BrokerGateway, ConsumerHandle, Delivery, DeliveryHandler, GatewayError, QueueHandle, QueueSpec,
};
use roomlink_core::routing::{client_action_key, private_queue, public_queue};
use roomlink_core::{ClientId, ClientPayload, QueueBinding, RoutingHeaders, CLIENT_EXCHANGE, SERVER_EXCHANGE};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Span};

use crate::errors::SessionError;
use crate::monitor::Monitor;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionEvent, SessionEvents, SessionState};
use crate::transport::Connection;

/// Forwards deliveries from one of a session's queues to its transport.
struct Forwarder {
    session: Weak<Session>,
}

#[async_trait]
impl DeliveryHandler for Forwarder {
    async fn on_delivery(&self, delivery: Delivery) {
        if let Some(session) = self.session.upgrade() {
            let _ = session.deliver(delivery.body).await;
        }
    }
}

/// Broker resources provisioned for one queue, possibly partially.
#[derive(Default)]
struct Provisioned {
    queue: Option<QueueHandle>,
    consumer: Option<ConsumerHandle>,
}

/// Orchestrates every session's broker resources.
pub struct LifecycleController {
    gateway: Arc<BrokerGateway>,
    monitor: Arc<Monitor>,
    registry: Arc<SessionRegistry>,
    fatal: CancellationToken,
}

impl LifecycleController {
    /// Build a controller around a started monitor.
    ///
    /// `fatal` is cancelled when the broker connection is found to be lost.
    pub fn new(
        gateway: Arc<BrokerGateway>,
        monitor: Arc<Monitor>,
        registry: Arc<SessionRegistry>,
        fatal: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            monitor,
            registry,
            fatal,
        }
    }

    /// The monitor this controller was started with.
    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Live sessions.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run one session from accept to close.
    ///
    /// Returns once the session is `Closed`. `cancel` asks an active session
    /// to close its transport and tear down.
    #[instrument(skip_all, fields(client_id = tracing::field::Empty, room = tracing::field::Empty))]
    pub async fn run(&self, connection: Connection, cancel: CancellationToken) -> Arc<Session> {
        let (target_room, sink, events) = connection.into_parts();
        let session = Arc::new(Session::new(ClientId::new(), sink));
        let span = Span::current();
        let _ = span.record("client_id", session.id().as_str());
        let _ = span.record("room", target_room.as_str());
        self.registry.insert(session.clone());
        info!("client connected");

        // A fresh session cannot already have a room.
        if let Err(e) = session.assign_room(target_room) {
            error!(error = %e, "room assignment failed");
        }
        session.transition(SessionState::RoomAssigned);

        session.transition(SessionState::QueuesProvisioning);
        let (provisioned, failures) = self.provision(&session).await;

        if failures.is_empty() {
            session.transition(SessionState::Active);
            info!("session active");
            self.serve(&session, SessionEvents::new(events), &cancel).await;
        } else {
            for failure in &failures {
                error!(error = %failure, "session provisioning failed");
                if failure.is_fatal() {
                    self.fatal.cancel();
                }
            }
            session.close().await;
        }

        session.transition(SessionState::TearingDown);
        self.teardown(&provisioned).await;
        session.transition(SessionState::Closed);
        let _ = self.registry.remove(session.id());
        info!("client disconnected");
        session
    }

    async fn provision(&self, session: &Arc<Session>) -> (Vec<Provisioned>, Vec<SessionError>) {
        let room = session.room().unwrap_or_default();
        let client = session.id().as_str();
        let bindings = match (public_queue(client, room), private_queue(client, room)) {
            (Ok(public), Ok(private)) => [public, private],
            (Err(e), _) | (_, Err(e)) => return (Vec::new(), vec![e.into()]),
        };

        let [public, private] = &bindings;
        let (public, private) = tokio::join!(
            self.provision_queue(session, public),
            self.provision_queue(session, private),
        );

        let mut provisioned = Vec::with_capacity(2);
        let mut failures = Vec::new();
        for (resources, outcome) in [public, private] {
            provisioned.push(resources);
            if let Err(e) = outcome {
                failures.push(e);
            }
        }
        (provisioned, failures)
    }

    async fn provision_queue(
        &self,
        session: &Arc<Session>,
        binding: &QueueBinding,
    ) -> (Provisioned, Result<(), SessionError>) {
        let mut resources = Provisioned::default();
        let outcome = async {
            let queue = self
                .gateway
                .declare_queue(&binding.queue, QueueSpec::default())
                .await?;
            resources.queue = Some(queue.clone());
            let queue = self
                .gateway
                .bind(&queue, SERVER_EXCHANGE, &binding.routing_key)
                .await?;
            let handler = Arc::new(Forwarder {
                session: Arc::downgrade(session),
            });
            resources.consumer = Some(self.gateway.subscribe(&queue, handler).await?);
            debug!(queue = %binding.queue, routing_key = %binding.routing_key, "queue provisioned");
            Ok::<(), GatewayError>(())
        }
        .await
        .map_err(|source| SessionError::ProvisioningFailed {
            queue: binding.queue.clone(),
            source,
        });
        (resources, outcome)
    }

    async fn serve(&self, session: &Session, mut events: SessionEvents, cancel: &CancellationToken) {
        loop {
            tokio::select! {
                event = events.next() => match event {
                    SessionEvent::MessageReceived(frame) => {
                        if let Err(e) = self.handle_message(session, &frame).await {
                            if e.is_fatal() {
                                error!(error = %e, "broker connection lost");
                                self.fatal.cancel();
                                session.close().await;
                                return;
                            }
                            warn!(error = %e, "client message not published");
                        }
                    }
                    SessionEvent::Error(e) => {
                        warn!(error = %e, "transport error");
                        return;
                    }
                    SessionEvent::Closed => {
                        debug!("transport closed");
                        return;
                    }
                },
                () = cancel.cancelled() => {
                    info!("closing session for shutdown");
                    session.close().await;
                    return;
                }
            }
        }
    }

    /// Publish one client frame. Malformed frames are reported and dropped.
    async fn handle_message(&self, session: &Session, frame: &Bytes) -> Result<(), GatewayError> {
        let payload = match ClientPayload::from_bytes(frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, len = frame.len(), "dropping malformed client payload");
                return Ok(());
            }
        };
        let client = session.id().as_str();
        let key = match client_action_key(client, &payload.action) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "dropping client payload with malformed action");
                return Ok(());
            }
        };
        let room = session.room().unwrap_or_default();
        let headers = RoutingHeaders::new(room, client, payload.action.as_str()).to_headers();
        self.gateway
            .publish(CLIENT_EXCHANGE, &key, payload.body(), headers)
            .await?;
        debug!(routing_key = %key, "client action published");
        Ok(())
    }

    async fn teardown(&self, provisioned: &[Provisioned]) {
        let gateway = &self.gateway;
        let fatal = &self.fatal;
        let _ = join_all(
            provisioned
                .iter()
                .filter_map(|p| p.consumer.as_ref())
                .map(|consumer| async move {
                    if let Err(e) = gateway.unsubscribe(consumer).await {
                        warn!(queue = consumer.queue(), error = %e, "unsubscribe failed during teardown");
                        if e.is_fatal() {
                            fatal.cancel();
                        }
                    }
                }),
        )
        .await;
        let _ = join_all(
            provisioned
                .iter()
                .filter_map(|p| p.queue.as_ref())
                .map(|queue| async move {
                    if let Err(e) = gateway.destroy(queue).await {
                        warn!(queue = queue.name(), error = %e, "destroy failed during teardown");
                        if e.is_fatal() {
                            fatal.cancel();
                        }
                    }
                }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        collect, connect_broker, declare_exchanges, recv, FaultyBroker, RecordingSink,
    };
    use crate::transport::TransportEvent;
    use roomlink_broker::MemoryBroker;
    use roomlink_core::logging::capture_logs;
    use roomlink_core::routing::republish_key;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tracing::Level;

    struct Harness {
        broker: Arc<MemoryBroker>,
        gateway: Arc<BrokerGateway>,
        controller: Arc<LifecycleController>,
        fatal: CancellationToken,
    }

    async fn harness() -> Harness {
        let (broker, gateway) = connect_broker();
        declare_exchanges(&gateway).await;
        harness_with(broker, gateway).await
    }

    async fn harness_with(broker: Arc<MemoryBroker>, gateway: Arc<BrokerGateway>) -> Harness {
        let fatal = CancellationToken::new();
        let monitor = Monitor::start(gateway.clone(), fatal.clone()).await.unwrap();
        let controller = Arc::new(LifecycleController::new(
            gateway.clone(),
            monitor,
            Arc::new(SessionRegistry::new()),
            fatal.clone(),
        ));
        Harness {
            broker,
            gateway,
            controller,
            fatal,
        }
    }

    struct Client {
        events: mpsc::Sender<TransportEvent>,
        sink: Arc<RecordingSink>,
        task: tokio::task::JoinHandle<Arc<Session>>,
    }

    fn connect(controller: &Arc<LifecycleController>, path: &str, cancel: CancellationToken) -> Client {
        let (events, rx) = mpsc::channel(16);
        let sink = Arc::new(RecordingSink::new());
        let connection = Connection::new(path, sink.clone(), rx);
        let controller = controller.clone();
        let task = tokio::spawn(async move { controller.run(connection, cancel).await });
        Client { events, sink, task }
    }

    async fn wait_for_active(controller: &LifecycleController, n: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while controller.registry().count_in(SessionState::Active) < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn only_session(controller: &LifecycleController) -> Arc<Session> {
        let summaries = controller.registry().summaries();
        assert_eq!(summaries.len(), 1);
        controller
            .registry()
            .get(&ClientId::from_raw(summaries[0].id.clone()))
            .unwrap()
    }

    async fn wait_for_frames(sink: &RecordingSink, n: usize) -> Vec<Bytes> {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let frames = sink.frames();
                if frames.len() >= n {
                    return frames;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn provisions_both_queues_then_tears_down() {
        let h = harness().await;
        let client = connect(&h.controller, "/lobby", CancellationToken::new());
        wait_for_active(&h.controller, 1).await;

        let session = only_session(&h.controller);
        let id = session.id().as_str().to_owned();
        let public = format!("client.{id}.public");
        let private = format!("client.{id}.private");
        assert_eq!(
            h.broker.bindings(&public),
            vec![(SERVER_EXCHANGE.to_owned(), "room.lobby.broadcast.#".to_owned())]
        );
        assert_eq!(
            h.broker.bindings(&private),
            vec![(SERVER_EXCHANGE.to_owned(), format!("room.lobby.client.{id}.#"))]
        );

        client.events.send(TransportEvent::Closed).await.unwrap();
        let session = client.task.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session.history(),
            vec![
                SessionState::Connecting,
                SessionState::RoomAssigned,
                SessionState::QueuesProvisioning,
                SessionState::Active,
                SessionState::TearingDown,
                SessionState::Closed,
            ]
        );
        assert!(!h.broker.has_queue(&public));
        assert!(!h.broker.has_queue(&private));
        assert!(h.controller.registry().is_empty());
        assert_eq!(h.gateway.consumer_count(&public).await, 0);
    }

    #[tokio::test]
    async fn client_action_published_with_headers() {
        let h = harness().await;
        let mut observed = collect(&h.gateway, CLIENT_EXCHANGE, "client.#").await;
        let client = connect(&h.controller, "/r", CancellationToken::new());
        wait_for_active(&h.controller, 1).await;
        let id = only_session(&h.controller).id().to_string();

        client
            .events
            .send(TransportEvent::Message(Bytes::from_static(
                br#"{"action":"move","data":{"x":1}}"#,
            )))
            .await
            .unwrap();

        let delivery = recv(&mut observed).await;
        assert_eq!(delivery.routing_key, format!("client.{id}.move"));
        assert_eq!(&delivery.body[..], br#"{"x":1}"#);
        let headers = delivery.routing_headers().unwrap();
        assert_eq!(headers, RoutingHeaders::new("r", id.as_str(), "move"));
    }

    #[tokio::test]
    async fn broadcast_round_trips_to_sender() {
        let h = harness().await;
        let client = connect(&h.controller, "/r", CancellationToken::new());
        wait_for_active(&h.controller, 1).await;

        client
            .events
            .send(TransportEvent::Message(Bytes::from_static(
                br#"{"action":"move","data":{"x":1}}"#,
            )))
            .await
            .unwrap();

        let frames = wait_for_frames(&client.sink, 1).await;
        assert_eq!(&frames[0][..], br#"{"x":1}"#);
    }

    #[tokio::test]
    async fn room_broadcast_reaches_everyone_in_room_only() {
        let h = harness().await;
        let a = connect(&h.controller, "/r", CancellationToken::new());
        let b = connect(&h.controller, "/r", CancellationToken::new());
        let other = connect(&h.controller, "/elsewhere", CancellationToken::new());
        wait_for_active(&h.controller, 3).await;

        a.events
            .send(TransportEvent::Message(Bytes::from_static(
                br#"{"action":"chat","data":"hi"}"#,
            )))
            .await
            .unwrap();

        assert_eq!(wait_for_frames(&a.sink, 1).await[0], Bytes::from_static(b"\"hi\""));
        assert_eq!(wait_for_frames(&b.sink, 1).await[0], Bytes::from_static(b"\"hi\""));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(other.sink.frames().is_empty());
    }

    #[tokio::test]
    async fn private_message_reaches_only_addressee() {
        let h = harness().await;
        let a = connect(&h.controller, "/r", CancellationToken::new());
        let b = connect(&h.controller, "/r", CancellationToken::new());
        wait_for_active(&h.controller, 2).await;
        let ids: Vec<String> = h
            .controller
            .registry()
            .summaries()
            .into_iter()
            .map(|s| s.id)
            .collect();

        let target = &ids[0];
        h.gateway
            .publish(
                SERVER_EXCHANGE,
                format!("room.r.client.{target}.whisper").as_str(),
                Bytes::from_static(b"psst"),
                roomlink_core::MessageHeaders::new(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let received: Vec<usize> = [&a, &b].iter().map(|c| c.sink.frames().len()).collect();
        assert_eq!(received.iter().sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_dropped_session_stays_active() {
        let (logs, _guard) = capture_logs();
        let h = harness().await;
        let mut observed = collect(&h.gateway, CLIENT_EXCHANGE, "#").await;
        let client = connect(&h.controller, "/r", CancellationToken::new());
        wait_for_active(&h.controller, 1).await;

        for bad in [&b"not json"[..], &br#"{"data":1}"#[..], &br#"{"action":"a.b"}"#[..]] {
            client
                .events
                .send(TransportEvent::Message(Bytes::copy_from_slice(bad)))
                .await
                .unwrap();
        }
        client
            .events
            .send(TransportEvent::Message(Bytes::from_static(br#"{"action":"ok"}"#)))
            .await
            .unwrap();

        let delivery = recv(&mut observed).await;
        assert!(delivery.routing_key.ends_with(".ok"));
        assert_eq!(only_session(&h.controller).state(), SessionState::Active);
        assert!(logs.has_event(Level::WARN, "dropping malformed client payload"));
        assert!(logs.has_event(Level::WARN, "malformed action"));
    }

    #[tokio::test]
    async fn transport_error_triggers_teardown() {
        let h = harness().await;
        let client = connect(&h.controller, "/r", CancellationToken::new());
        wait_for_active(&h.controller, 1).await;

        client
            .events
            .send(TransportEvent::Error(crate::errors::TransportError::Io(
                "reset".into(),
            )))
            .await
            .unwrap();
        let session = client.task.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(h
            .broker
            .queue_names()
            .iter()
            .all(|q| !q.starts_with("client.")));
    }

    #[tokio::test]
    async fn failed_private_bind_never_reaches_active() {
        let memory = MemoryBroker::connect(roomlink_broker::ConnectOptions {
            host: "localhost".into(),
            application_name: "test".into(),
        });
        let faulty = Arc::new(FaultyBroker::failing_bind(memory.clone(), ".private"));
        let gateway = Arc::new(BrokerGateway::new(faulty.clone()));
        declare_exchanges(&gateway).await;
        let h = harness_with(memory, gateway).await;

        let client = connect(&h.controller, "/r", CancellationToken::new());
        let session = client.task.await.unwrap();

        let history = session.history();
        assert!(!history.contains(&SessionState::Active));
        assert_eq!(
            &history[history.len() - 3..],
            &[
                SessionState::QueuesProvisioning,
                SessionState::TearingDown,
                SessionState::Closed
            ]
        );
        assert!(client.sink.is_closed());
        assert!(h
            .broker
            .queue_names()
            .iter()
            .all(|q| !q.starts_with("client.")));
        let calls = faulty.calls();
        assert!(calls.iter().any(|c| c.starts_with("delete client.") && c.ends_with(".private")));
        assert!(!h.fatal.is_cancelled());
    }

    #[tokio::test]
    async fn malformed_room_provisions_nothing() {
        let memory = MemoryBroker::connect(roomlink_broker::ConnectOptions {
            host: "localhost".into(),
            application_name: "test".into(),
        });
        let faulty = Arc::new(FaultyBroker::failing_bind(memory.clone(), "never"));
        let gateway = Arc::new(BrokerGateway::new(faulty.clone()));
        declare_exchanges(&gateway).await;
        let h = harness_with(memory, gateway).await;
        let before = faulty.calls().len();

        let client = connect(&h.controller, "/room.with.dots", CancellationToken::new());
        let session = client.task.await.unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(faulty.calls().len(), before);
        assert!(client.sink.is_closed());
    }

    #[tokio::test]
    async fn close_during_provisioning_waits_for_it() {
        let h = harness().await;
        let (events, rx) = mpsc::channel(4);
        events.send(TransportEvent::Closed).await.unwrap();
        let sink = Arc::new(RecordingSink::new());
        let session = h
            .controller
            .run(Connection::new("/r", sink, rx), CancellationToken::new())
            .await;

        assert!(session.history().contains(&SessionState::Active));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(h
            .broker
            .queue_names()
            .iter()
            .all(|q| !q.starts_with("client.")));
    }

    #[tokio::test]
    async fn cancellation_closes_transport_and_tears_down() {
        let h = harness().await;
        let cancel = CancellationToken::new();
        let client = connect(&h.controller, "/r", cancel.clone());
        wait_for_active(&h.controller, 1).await;

        cancel.cancel();
        let session = client.task.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(client.sink.is_closed());
    }

    #[tokio::test]
    async fn lost_broker_connection_is_fatal() {
        let h = harness().await;
        let client = connect(&h.controller, "/r", CancellationToken::new());
        wait_for_active(&h.controller, 1).await;

        h.broker.disconnect();
        client
            .events
            .send(TransportEvent::Message(Bytes::from_static(br#"{"action":"move"}"#)))
            .await
            .unwrap();
        let session = client.task.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(h.fatal.is_cancelled());
    }

    #[tokio::test]
    async fn lost_broker_connection_during_teardown_is_fatal() {
        let h = harness().await;
        let client = connect(&h.controller, "/r", CancellationToken::new());
        wait_for_active(&h.controller, 1).await;

        h.broker.disconnect();
        client.events.send(TransportEvent::Closed).await.unwrap();
        let session = client.task.await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(h.fatal.is_cancelled());
    }

    async fn slow_private_bind(fail: bool) -> (Harness, Client) {
        let memory = MemoryBroker::connect(roomlink_broker::ConnectOptions {
            host: "localhost".into(),
            application_name: "test".into(),
        });
        let faulty = Arc::new(FaultyBroker::slow_bind(
            memory.clone(),
            ".private",
            Duration::from_millis(200),
            fail,
        ));
        let gateway = Arc::new(BrokerGateway::new(faulty));
        declare_exchanges(&gateway).await;
        let h = harness_with(memory, gateway).await;
        let client = connect(&h.controller, "/r", CancellationToken::new());

        // Wait for the public queue to be consuming while the private bind stalls.
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let subscribed = h
                    .broker
                    .queue_names()
                    .iter()
                    .any(|q| q.ends_with(".public") && h.broker.consumer_count(q) == 1);
                if subscribed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(only_session(&h.controller).state(), SessionState::QueuesProvisioning);
        (h, client)
    }

    #[tokio::test]
    async fn broadcast_during_failed_provisioning_never_reaches_client() {
        let (h, client) = slow_private_bind(true).await;
        h.gateway
            .publish(
                SERVER_EXCHANGE,
                "room.r.broadcast.x",
                Bytes::from_static(b"early"),
                roomlink_core::MessageHeaders::new(),
            )
            .await
            .unwrap();

        let session = client.task.await.unwrap();
        assert!(!session.history().contains(&SessionState::Active));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client.sink.frames().is_empty());
    }

    #[tokio::test]
    async fn broadcast_during_provisioning_arrives_after_active() {
        let (h, client) = slow_private_bind(false).await;
        h.gateway
            .publish(
                SERVER_EXCHANGE,
                "room.r.broadcast.x",
                Bytes::from_static(b"early"),
                roomlink_core::MessageHeaders::new(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client.sink.frames().is_empty());

        wait_for_active(&h.controller, 1).await;
        assert_eq!(
            wait_for_frames(&client.sink, 1).await,
            vec![Bytes::from_static(b"early")]
        );
    }

    #[test]
    fn republish_key_matches_public_binding() {
        let key = republish_key("r", "c1", "move").unwrap();
        let binding = public_queue("c1", "r").unwrap();
        assert!(roomlink_core::routing::topic_matches(&binding.routing_key, &key));
    }
}
