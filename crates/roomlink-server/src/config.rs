//! Server configuration.

use std::time::Duration;

use roomlink_settings::ServerSettings;

/// Runtime configuration for the HTTP and WebSocket surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Outbound frames buffered per connection.
    pub send_queue: usize,
    /// Interval between server-initiated Ping frames.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is reported as failed.
    pub heartbeat_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            send_queue: settings.send_queue,
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(settings.heartbeat_timeout_secs),
        }
    }
}

impl ServerConfig {
    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
