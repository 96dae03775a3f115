//! Server configuration.
//!
//! Supplied once at [`Server`](crate::server::Server) construction; nothing is
//! reconfigured at runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum lengths (in characters) of the client-identifying headers copied
/// into request log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderLimits {
    pub x_real_ip: usize,
    pub x_forwarded_for: usize,
    pub x_user_agent_id: usize,
}

impl Default for HeaderLimits {
    fn default() -> Self {
        Self {
            x_real_ip: 32,
            x_forwarded_for: 32,
            x_user_agent_id: 70,
        }
    }
}

/// Configuration for a [`Server`](crate::server::Server).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use courier::config::ServerConfig;
///
/// let config = ServerConfig::new()
///     .host("0.0.0.0")
///     .port(9000)
///     .shutdown_timeout(Duration::from_secs(5));
///
/// assert_eq!(config.bind_addr(), "0.0.0.0:9000");
/// assert_eq!(config.header_limits.x_user_agent_id, 70);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on. `0` picks a free port.
    pub port: u16,
    /// Upper bound on a graceful [`stop`](crate::server::Server::stop).
    pub shutdown_timeout: Duration,
    /// Deadline for writing one response. `None` waits for the sink indefinitely.
    pub write_timeout: Option<Duration>,
    pub header_limits: HeaderLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_timeout: Duration::from_secs(15),
            write_timeout: None,
            header_limits: HeaderLimits::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn header_limits(mut self, limits: HeaderLimits) -> Self {
        self.header_limits = limits;
        self
    }

    /// Get the bind address. IPv6 literals are bracketed.
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
