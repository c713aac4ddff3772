//! Settings types.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomlinkSettings {
    /// HTTP / WebSocket listener.
    pub server: ServerSettings,
    /// Broker connection.
    pub broker: BrokerSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RoomlinkSettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.send_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueue must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalSecs must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_timeout_secs < self.server.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(format!(
                "server.heartbeatTimeoutSecs ({}) is shorter than the interval ({})",
                self.server.heartbeat_timeout_secs, self.server.heartbeat_interval_secs
            )));
        }
        if self.broker.host.is_empty() {
            return Err(SettingsError::InvalidValue("broker.host is empty".into()));
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Outbound frames buffered per connection before sends start failing.
    pub send_queue: usize,
    /// Seconds between server Ping frames.
    pub heartbeat_interval_secs: u64,
    /// Seconds without a Pong before the connection is treated as failed.
    pub heartbeat_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            send_queue: 1024,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
        }
    }
}

/// Broker connection settings.
///
/// The bundled broker runs in-process: both fields are passed through in the
/// connect options and show up in logs, but no network connection is made.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Broker host name. Recorded only; the in-process broker does not dial it.
    pub host: String,
    /// Application identity presented on connect.
    pub application_name: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            application_name: "roomlink".to_string(),
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults() {
        let s = RoomlinkSettings::default();
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.server.port, 3000);
        assert_eq!(s.server.send_queue, 1024);
        assert_eq!(s.server.heartbeat_interval_secs, 30);
        assert_eq!(s.server.heartbeat_timeout_secs, 60);
        assert_eq!(s.broker.host, "localhost");
        assert_eq!(s.broker.application_name, "roomlink");
        assert_eq!(s.logging.level, "info");
        assert!(!s.logging.json);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(RoomlinkSettings::default()).unwrap();
        assert_eq!(json["server"]["sendQueue"], 1024);
        assert_eq!(json["server"]["heartbeatIntervalSecs"], 30);
        assert_eq!(json["broker"]["applicationName"], "roomlink");
    }

    #[test]
    fn zero_send_queue_rejected() {
        let mut s = RoomlinkSettings::default();
        s.server.send_queue = 0;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn timeout_shorter_than_interval_rejected() {
        let mut s = RoomlinkSettings::default();
        s.server.heartbeat_timeout_secs = 10;
        assert_matches!(
            s.validate(),
            Err(SettingsError::InvalidValue(msg)) if msg.contains("heartbeatTimeoutSecs")
        );
    }

    #[test]
    fn empty_broker_host_rejected() {
        let mut s = RoomlinkSettings::default();
        s.broker.host.clear();
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }
}
