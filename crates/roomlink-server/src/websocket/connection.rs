//! Outbound half and liveness state of one WebSocket connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::errors::TransportError;
use crate::transport::TransportSink;

/// Work item for the writer task.
#[derive(Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Send a frame: text if it is UTF-8, binary otherwise.
    Frame(Bytes),
    /// Send a Close frame and stop writing.
    Close,
}

/// [`TransportSink`] feeding a connection's writer task.
pub struct WsSink {
    tx: mpsc::Sender<Outbound>,
    closed: AtomicBool,
    dropped_frames: AtomicU64,
}

impl WsSink {
    /// Wrap the writer task's channel.
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            tx,
            closed: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Frames refused because the send queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        match self.tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io("send queue full".into()))
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Outbound::Close).await;
    }
}

/// Ping/Pong bookkeeping for the heartbeat.
pub struct Liveness {
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
}

impl Liveness {
    /// Fresh connection, counted as alive.
    pub fn new() -> Self {
        Self {
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(Instant::now()),
        }
    }

    /// Record a Ping or Pong from the client.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Check and reset the alive flag.
    ///
    /// Returns `true` if the client was heard from since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last Ping/Pong (or since connect).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Whether a heartbeat tick should fail the connection.
    pub fn timed_out(&self, timeout: Duration) -> bool {
        !self.check_alive() && self.last_pong_elapsed() > timeout
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_enqueues_frame() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = WsSink::new(tx);
        sink.send(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Frame(Bytes::from_static(b"hi")))
        );
    }

    #[tokio::test]
    async fn full_queue_drops_frame() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = WsSink::new(tx);
        sink.send(Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(
            sink.send(Bytes::from_static(b"2")).await,
            Err(TransportError::Io("send queue full".into()))
        );
        assert_eq!(sink.dropped_frames(), 1);
    }

    #[tokio::test]
    async fn writer_gone_reads_as_closed() {
        let (tx, rx) = mpsc::channel(1);
        let sink = WsSink::new(tx);
        drop(rx);
        assert_eq!(
            sink.send(Bytes::from_static(b"x")).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn close_once_then_refuse_frames() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = WsSink::new(tx);
        sink.close().await;
        sink.close().await;
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert!(rx.try_recv().is_err());
        assert_eq!(
            sink.send(Bytes::from_static(b"x")).await,
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn check_alive_resets_flag() {
        let liveness = Liveness::new();
        assert!(liveness.check_alive());
        assert!(!liveness.check_alive());
        liveness.mark_alive();
        assert!(liveness.check_alive());
    }

    #[test]
    fn timed_out_needs_both_silence_and_elapsed_time() {
        let liveness = Liveness::new();
        assert!(!liveness.timed_out(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(5));
        assert!(liveness.timed_out(Duration::ZERO));
        assert!(!liveness.timed_out(Duration::from_secs(60)));
    }
}
