//! TLS transport using rustls.
//!
//! Without a configured trust anchor the client accepts any server
//! certificate. That is the development posture of the tunnel protocol;
//! operators terminate production traffic behind a CA they pass in
//! [`TlsOptions::ca_cert_path`].

use super::BoxedStream;
use portico_common::{Result, TunnelError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Client-side TLS options.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Explicit trust anchor (PEM). When unset, certificate verification is
    /// disabled.
    pub ca_cert_path: Option<PathBuf>,
    /// Server name for SNI; defaults to the dialed host.
    pub server_name: Option<String>,
}

/// A verifier that accepts any certificate.
#[derive(Debug)]
struct InsecureServerCertVerifier;

impl ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn load_ca_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| TunnelError::Tls(format!("invalid CA certificate: {e}")))
}

fn client_config(options: &TlsOptions) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder();

    let config = if let Some(ca_path) = &options.ca_cert_path {
        let mut root_store = RootCertStore::empty();
        for cert in load_ca_certs(ca_path)? {
            root_store
                .add(cert)
                .map_err(|e| TunnelError::Tls(format!("invalid CA certificate: {e}")))?;
        }
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
            .with_no_client_auth()
    };

    Ok(Arc::new(config))
}

/// Connect over TLS to `addr`, verifying (or not) per `options`.
pub async fn connect(addr: &str, host: &str, options: &TlsOptions) -> Result<BoxedStream> {
    let config = client_config(options)?;
    let connector = TlsConnector::from(config);

    let tcp_stream = TcpStream::connect(addr).await?;
    tcp_stream.set_nodelay(true)?;

    let sni = options.server_name.as_deref().unwrap_or(host);
    let server_name = ServerName::try_from(sni.to_string())
        .map_err(|e| TunnelError::Tls(format!("invalid server name {sni:?}: {e}")))?;

    let tls_stream = connector
        .connect(server_name, tcp_stream)
        .await
        .map_err(|e| TunnelError::Tls(e.to_string()))?;
    Ok(Box::pin(tls_stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_crypto_provider() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }

    #[test]
    fn test_insecure_config_builds() {
        ensure_crypto_provider();
        let options = TlsOptions::default();
        assert!(client_config(&options).is_ok());
    }

    #[test]
    fn test_missing_ca_file_is_an_error() {
        ensure_crypto_provider();
        let options = TlsOptions {
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.pem")),
            server_name: None,
        };
        assert!(client_config(&options).is_err());
    }
}
