//! Configuration for the wirecall client

use std::time::Duration;

/// Configuration for connecting to a server
#[derive(Debug, Clone)]
pub struct WirecallConfig {
    /// Server URL (e.g., "ws://localhost:9090/socket")
    pub url: String,

    /// Deadline for a correlated request to receive its reply
    pub request_timeout: Duration,

    /// Deadline for establishing a connection
    pub connect_timeout: Duration,
}

impl WirecallConfig {
    /// Create a new configuration with the given URL and default timeouts
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set the per-request reply deadline
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the connection establishment deadline
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
