//! Runs one upgraded WebSocket through the lifecycle controller.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{Liveness, Outbound, WsSink};
use crate::config::ServerConfig;
use crate::errors::TransportError;
use crate::lifecycle::LifecycleController;
use crate::transport::{Connection, TransportEvent, TransportSink};

/// How long the writer gets to flush and send Close after the session ends.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Serve a client connected on `path` until its session is closed.
pub async fn serve_socket(
    ws: WebSocket,
    path: String,
    config: ServerConfig,
    controller: Arc<LifecycleController>,
    cancel: CancellationToken,
) {
    let (ws_tx, ws_rx) = ws.split();
    let capacity = config.send_queue.max(1);
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    let liveness = Arc::new(Liveness::new());
    let sink = Arc::new(WsSink::new(out_tx));

    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        out_rx,
        liveness.clone(),
        event_tx.clone(),
        config.heartbeat_interval,
        config.heartbeat_timeout,
    ));
    let reader = tokio::spawn(read_loop(ws_rx, liveness, event_tx));

    let connection = Connection::new(&path, sink.clone(), event_rx);
    let session = controller.run(connection, cancel).await;

    reader.abort();
    sink.close().await;
    if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        warn!(client_id = %session.id(), "writer did not finish, aborting");
        writer.abort();
    }
    if sink.dropped_frames() > 0 {
        info!(
            client_id = %session.id(),
            dropped = sink.dropped_frames(),
            "frames dropped on a full send queue"
        );
    }
}

fn to_message(frame: Bytes) -> Message {
    match String::from_utf8(frame.to_vec()) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(frame),
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Outbound>,
    liveness: Arc<Liveness>,
    events: mpsc::Sender<TransportEvent>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
) {
    let mut ping_interval = tokio::time::interval(heartbeat_interval);
    // Skip the immediate first tick
    let _ = ping_interval.tick().await;

    loop {
        tokio::select! {
            msg = out_rx.recv() => match msg {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = ws_tx.send(to_message(frame)).await {
                        let _ = events.send(TransportEvent::Error(TransportError::Io(e.to_string()))).await;
                        break;
                    }
                }
                Some(Outbound::Close) => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                None => break,
            },
            _ = ping_interval.tick() => {
                if liveness.timed_out(heartbeat_timeout) {
                    warn!("client unresponsive for {heartbeat_timeout:?}, failing connection");
                    let _ = events
                        .send(TransportEvent::Error(TransportError::Io("heartbeat timeout".into())))
                        .await;
                    break;
                }
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    liveness: Arc<Liveness>,
    events: mpsc::Sender<TransportEvent>,
) {
    while let Some(frame) = ws_rx.next().await {
        let event = match frame {
            Ok(Message::Text(text)) => {
                TransportEvent::Message(Bytes::copy_from_slice(text.as_str().as_bytes()))
            }
            Ok(Message::Binary(data)) => TransportEvent::Message(data),
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                liveness.mark_alive();
                continue;
            }
            Ok(Message::Close(_)) => {
                debug!("client sent close frame");
                TransportEvent::Closed
            }
            Err(e) => TransportEvent::Error(TransportError::Io(e.to_string())),
        };
        let done = !matches!(event, TransportEvent::Message(_));
        if events.send(event).await.is_err() || done {
            return;
        }
    }
    let _ = events.send(TransportEvent::Closed).await;
}
