//! Transport layer: dialing the ingress over TCP or TLS.

pub mod tcp;
pub mod tls;

use portico_common::{Result, TunnelError};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

pub use tls::TlsOptions;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Pin<Box<dyn AsyncStream>>;

/// Host portion of a `host:port` address.
pub fn host_of(addr: &str) -> &str {
    // Bracketed IPv6 like [::1]:4443
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match addr.rfind(':') {
        Some(idx) if addr[..idx].contains(':') => addr, // bare IPv6, no port
        Some(idx) => &addr[..idx],
        None => addr,
    }
}

/// True when the ingress runs on this machine, in which case plain TCP is
/// used and public URLs are advertised as `http`.
pub fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Dial the ingress.
///
/// Local servers get plain TCP. Remote servers get TLS; when no explicit
/// trust anchor is configured a TLS failure falls back to plain TCP, since
/// the development posture cannot tell a self-signed server from a missing
/// listener. With a CA configured the TLS error is surfaced instead.
pub async fn connect(addr: &str, tls_options: &TlsOptions) -> Result<BoxedStream> {
    let host = host_of(addr);

    if is_local_host(host) {
        debug!("local server detected on {addr}, using plain TCP");
        return tcp::connect(addr).await;
    }

    match tls::connect(addr, host, tls_options).await {
        Ok(stream) => Ok(stream),
        Err(err) if tls_options.ca_cert_path.is_none() => {
            warn!("TLS connection to {addr} failed, trying plain TCP: {err}");
            tcp::connect(addr)
                .await
                .map_err(|e| TunnelError::Connection(format!("failed to connect: {e}")))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("localhost:4443"), "localhost");
        assert_eq!(host_of("tunnel.example.com:4443"), "tunnel.example.com");
        assert_eq!(host_of("example.com"), "example.com");
        assert_eq!(host_of("[::1]:4443"), "::1");
    }

    #[test]
    fn test_is_local_host() {
        assert!(is_local_host("localhost"));
        assert!(is_local_host("127.0.0.1"));
        assert!(is_local_host("::1"));
        assert!(!is_local_host("tunnel.example.com"));
        assert!(!is_local_host("192.168.1.10"));
    }
}
