//! Server configuration.

use std::time::Duration;

use parley_settings::ParleySettings;

/// Runtime configuration for the Parley server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Interval between server Ping frames.
    pub heartbeat_interval: Duration,
    /// A peer silent for this long is disconnected.
    pub heartbeat_timeout: Duration,
    /// Upper bound on how long shutdown waits for sessions and the hub.
    pub shutdown_timeout: Duration,
    /// Per-connection outbound queue capacity.
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1024,
            max_message_size: 64 * 1024,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            shutdown_timeout: Duration::from_secs(10),
            outbound_queue: 256,
        }
    }
}

impl From<&ParleySettings> for ServerConfig {
    fn from(settings: &ParleySettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_connections: server.max_connections,
            max_message_size: server.max_message_size,
            heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(server.heartbeat_timeout_secs),
            shutdown_timeout: Duration::from_secs(server.shutdown_timeout_secs),
            outbound_queue: settings.hub.outbound_queue,
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_loopback_on_any_port() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn default_heartbeat() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(90));
    }

    #[test]
    fn from_settings_copies_every_field() {
        let mut settings = ParleySettings::default();
        settings.server.host = "0.0.0.0".into();
        settings.server.port = 4000;
        settings.server.max_connections = 3;
        settings.server.heartbeat_interval_secs = 5;
        settings.server.heartbeat_timeout_secs = 15;
        settings.server.shutdown_timeout_secs = 2;
        settings.hub.outbound_queue = 8;

        let cfg = ServerConfig::from(&settings);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:4000");
        assert_eq!(cfg.max_connections, 3);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(2));
        assert_eq!(cfg.outbound_queue, 8);
    }
}
