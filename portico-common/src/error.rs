//! Error types for Portico

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable handshake rejection code, mirrored on the wire by
/// `InitResponse.error_code`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeErrorCode {
    InvalidToken,
    AlreadyConnected,
    NoDomains,
    #[default]
    #[serde(rename = "")]
    None,
}

impl HandshakeErrorCode {
    pub fn is_none(&self) -> bool {
        *self == HandshakeErrorCode::None
    }
}

/// Main error type for Portico operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server rejected the handshake
    #[error("Handshake rejected: {message}")]
    HandshakeRejected {
        message: String,
        code: HandshakeErrorCode,
    },

    /// Connection error
    #[error("Connection failed: {0}")]
    Connection(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation cancelled by the caller
    #[error("Cancelled")]
    Cancelled,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// Structured handshake error code, if this error carries one.
    pub fn handshake_code(&self) -> Option<HandshakeErrorCode> {
        match self {
            TunnelError::HandshakeRejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(err: serde_json::Error) -> Self {
        TunnelError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::Protocol("bad frame".to_string());
        assert!(err.to_string().contains("bad frame"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::other("boom");
        let tunnel_err: TunnelError = io_err.into();
        assert!(matches!(tunnel_err, TunnelError::Io(_)));
    }

    #[test]
    fn test_handshake_code_accessor() {
        let err = TunnelError::HandshakeRejected {
            message: "bad token".into(),
            code: HandshakeErrorCode::InvalidToken,
        };
        assert_eq!(err.handshake_code(), Some(HandshakeErrorCode::InvalidToken));
        assert_eq!(TunnelError::Cancelled.handshake_code(), None);
    }
}
