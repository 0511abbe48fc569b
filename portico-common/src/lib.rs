//! Common utilities and types for Portico

pub mod config;
pub mod constants;
pub mod error;

pub use config::{InspectorConfig, ReconnectConfig, TunnelConfig};
pub use error::{HandshakeErrorCode, Result, TunnelError};
