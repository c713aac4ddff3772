//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

use crate::monitor::MonitorSnapshot;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"` while the monitor runs, `"degraded"` otherwise.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Sessions between accept and close.
    pub sessions: usize,
    /// Sessions with both queues subscribed.
    pub active_sessions: usize,
    /// Monitor counters.
    pub monitor: MonitorSnapshot,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    sessions: usize,
    active_sessions: usize,
    monitor_running: bool,
    monitor: MonitorSnapshot,
) -> HealthResponse {
    HealthResponse {
        status: if monitor_running { "ok" } else { "degraded" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        sessions,
        active_sessions,
        monitor,
    }
}
