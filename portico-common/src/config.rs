//! Configuration types for the Portico client

use crate::constants;
use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunnel client configuration. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Ingress server address (host:port)
    pub server_addr: String,
    /// Authentication token
    pub token: String,
    /// Local service port that inbound requests are forwarded to
    pub local_port: u16,
    /// Specific subdomain to bind; `None` binds every domain owned by the token
    pub subdomain: Option<String>,
}

impl TunnelConfig {
    pub fn new(server_addr: impl Into<String>, token: impl Into<String>, local_port: u16) -> Self {
        Self {
            server_addr: server_addr.into(),
            token: token.into(),
            local_port,
            subdomain: None,
        }
    }

    #[must_use]
    pub fn with_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_addr.is_empty() {
            return Err(TunnelError::Config("server_addr must be set".into()));
        }
        if self.token.is_empty() {
            return Err(TunnelError::Config("token must be set".into()));
        }
        Ok(())
    }

    /// Host portion of `server_addr` (everything before the last `:`).
    pub fn server_host(&self) -> &str {
        match self.server_addr.rfind(':') {
            Some(idx) => &self.server_addr[..idx],
            None => &self.server_addr,
        }
    }
}

/// Reconnection backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Ceiling applied to the growing delay
    pub max_delay: Duration,
    /// Growth factor applied after each attempt
    pub multiplier: f64,
    /// Give up after this many failed attempts (0 = retry forever)
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 0,
        }
    }
}

/// Inspector server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectorConfig {
    /// Loopback port the inspector listens on
    pub port: u16,
    /// Maximum number of captured exchanges kept in memory
    pub capacity: usize,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            port: constants::DEFAULT_INSPECTOR_PORT,
            capacity: constants::DEFAULT_STORE_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_defaults() {
        let cfg = ReconnectConfig::default();
        assert_eq!(cfg.initial_delay, Duration::from_secs(1));
        assert_eq!(cfg.max_delay, Duration::from_secs(60));
        assert_eq!(cfg.multiplier, 2.0);
        assert_eq!(cfg.max_attempts, 0);
    }

    #[test]
    fn test_tunnel_config_validate() {
        let cfg = TunnelConfig::new("tunnel.example.com:4443", "tok", 3000);
        assert!(cfg.validate().is_ok());

        let missing_token = TunnelConfig::new("tunnel.example.com:4443", "", 3000);
        assert!(missing_token.validate().is_err());
    }

    #[test]
    fn test_server_host() {
        let cfg = TunnelConfig::new("localhost:4443", "tok", 3000);
        assert_eq!(cfg.server_host(), "localhost");

        let bare = TunnelConfig::new("example.com", "tok", 3000);
        assert_eq!(bare.server_host(), "example.com");
    }
}
