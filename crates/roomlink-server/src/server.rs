//! `RoomlinkServer`: axum HTTP + WebSocket front end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::Uri;
use axum::response::{Json, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bootstrap::Bridge;
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::registry::SessionSummary;
use crate::session::SessionState;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::serve_socket;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Broker-side wiring.
    pub bridge: Bridge,
    /// Server configuration.
    pub config: ServerConfig,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
}

/// The roomlink server.
pub struct RoomlinkServer {
    config: ServerConfig,
    bridge: Bridge,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl RoomlinkServer {
    /// Create a new server around a bootstrapped bridge.
    pub fn new(config: ServerConfig, bridge: Bridge) -> Self {
        Self {
            config,
            bridge,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Build the axum router.
    ///
    /// `/health` and `/sessions` are static routes; every other path is a
    /// WebSocket endpoint whose path names the room.
    pub fn router(&self) -> Router {
        let state = AppState {
            bridge: self.bridge.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/sessions", get(sessions_handler))
            .route("/{*room}", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(self.config.bind_addr()).await
    }

    /// Serve until shutdown is requested, then drain sessions and stop the monitor.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "listening");
        let token = self.shutdown.token();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(token.cancelled_owned())
            .await?;

        info!(
            sessions = self.bridge.registry.len(),
            "listener stopped, closing sessions"
        );
        let _ = self.shutdown.graceful_shutdown(None).await;
        if let Err(e) = self.bridge.monitor.shutdown().await {
            warn!(error = %e, "monitor shutdown failed");
        }
        Ok(())
    }

    /// Bind, then serve in the background. Returns the bound address.
    pub async fn spawn(
        self: Arc<Self>,
    ) -> std::io::Result<(SocketAddr, JoinHandle<std::io::Result<()>>)> {
        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move { self.serve(listener).await });
        Ok((addr, handle))
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the bridge.
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = &state.bridge.registry;
    let monitor = &state.bridge.monitor;
    Json(health::health_check(
        state.start_time,
        registry.len(),
        registry.count_in(SessionState::Active),
        monitor.is_running(),
        monitor.snapshot(),
    ))
}

/// GET /sessions
async fn sessions_handler(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.bridge.registry.summaries())
}

/// GET /<room>: WebSocket upgrade.
async fn ws_handler(ws: WebSocketUpgrade, uri: Uri, State(state): State<AppState>) -> Response {
    let path = uri.path().to_owned();
    let cancel = state.shutdown.token();
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| {
        let task = serve_socket(
            socket,
            path,
            state.config,
            state.bridge.controller,
            cancel,
        );
        async move {
            let _ = shutdown.track(task);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::bootstrap;
    use crate::testing::connect_broker;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    async fn make_server() -> RoomlinkServer {
        let (broker, _) = connect_broker();
        let bridge = bootstrap(broker, CancellationToken::new()).await.unwrap();
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        };
        RoomlinkServer::new(config, bridge)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server().await;
        let (status, parsed) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["sessions"], 0);
        assert_eq!(
            parsed["monitor"]["id"],
            server.bridge().monitor.id().as_str()
        );
    }

    #[tokio::test]
    async fn health_degraded_after_monitor_shutdown() {
        let server = make_server().await;
        server.bridge().monitor.shutdown().await.unwrap();
        let (_, parsed) = get_json(server.router(), "/health").await;
        assert_eq!(parsed["status"], "degraded");
    }

    #[tokio::test]
    async fn sessions_endpoint_lists_nothing_initially() {
        let server = make_server().await;
        let (status, parsed) = get_json(server.router(), "/sessions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parsed, serde_json::json!([]));
    }

    #[tokio::test]
    async fn room_path_without_upgrade_is_rejected() {
        let server = make_server().await;
        let req = Request::builder().uri("/lobby").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown_and_stops_monitor() {
        let server = Arc::new(make_server().await);
        let (_, handle) = server.clone().spawn().await.unwrap();
        server.shutdown().shutdown();
        handle.await.unwrap().unwrap();
        assert!(!server.bridge().monitor.is_running());
    }
}
