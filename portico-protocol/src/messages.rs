//! Control-stream handshake records.
//!
//! Three JSON values cross the control stream, in order: [`AuthRequest`],
//! [`TunnelRequest`], then the server's [`InitResponse`]. Each value is
//! written as a single line (`\n`-terminated UTF-8 JSON); there is no other
//! framing. Field names are stable lower_snake_case.

use portico_common::{Result, TunnelError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Structured error code carried by a failed [`InitResponse`].
pub use portico_common::HandshakeErrorCode as ErrorCode;

/// First record on the control stream: authenticate with a token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub token: String,
    /// Force-disconnect an existing session holding the same token.
    #[serde(default, skip_serializing_if = "is_false")]
    pub force: bool,
}

/// Second record: which domains to bind. Empty means "bind every domain
/// owned by this token".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    #[serde(default)]
    pub requested_domains: Vec<String>,
}

/// Bandwidth accounting reported by the server on a successful handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    /// Bytes used today
    pub bandwidth_today: i64,
    /// Total bytes used all time
    pub bandwidth_total: i64,
    /// Daily bandwidth limit in bytes
    pub bandwidth_limit: i64,
}

/// Final record: the server's verdict on the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitResponse {
    pub success: bool,
    /// Human-readable failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable failure kind.
    #[serde(default, skip_serializing_if = "ErrorCode::is_none")]
    pub error_code: ErrorCode,
    /// Domains the server bound to this session.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bound_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_stats: Option<ServerStats>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Write one record as a newline-terminated JSON value and flush.
pub async fn write_record<T, W>(writer: &mut W, record: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut buf = serde_json::to_vec(record)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next newline-terminated JSON record, skipping blank lines.
pub async fn read_record<T, R>(reader: &mut R) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(TunnelError::Protocol(
                "connection closed before handshake record".into(),
            ));
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    Ok(serde_json::from_str(line.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T>(value: &T) -> T
    where
        T: Serialize + DeserializeOwned,
    {
        let json = serde_json::to_string(value).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_auth_request_round_trip() {
        let req = AuthRequest {
            token: "tok-123".into(),
            force: false,
        };
        assert_eq!(round_trip(&req), req);

        // `force` is omitted when false
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("force"));

        let forced = AuthRequest {
            token: "tok-123".into(),
            force: true,
        };
        let json = serde_json::to_string(&forced).unwrap();
        assert!(json.contains("\"force\":true"));
        assert_eq!(round_trip(&forced), forced);
    }

    #[test]
    fn test_tunnel_request_round_trip() {
        let req = TunnelRequest {
            requested_domains: vec!["misty-river".into()],
        };
        assert_eq!(round_trip(&req), req);

        let empty = TunnelRequest::default();
        let json = serde_json::to_string(&empty).unwrap();
        assert_eq!(json, r#"{"requested_domains":[]}"#);
        assert_eq!(round_trip(&empty), empty);
    }

    #[test]
    fn test_init_response_failure_codes() {
        let resp = InitResponse {
            success: false,
            error: Some("token not recognized".into()),
            error_code: ErrorCode::InvalidToken,
            ..Default::default()
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"error_code\":\"invalid_token\""));
        assert_eq!(round_trip(&resp), resp);
    }

    #[test]
    fn test_init_response_absent_fields_stay_absent() {
        let resp = InitResponse {
            success: true,
            bound_domains: vec!["app.example.dev".into()],
            ..Default::default()
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("error"));
        assert!(!json.contains("server_stats"));
        assert_eq!(round_trip(&resp), resp);
    }

    #[test]
    fn test_init_response_with_server_stats() {
        let resp = InitResponse {
            success: true,
            bound_domains: vec!["a.example.dev".into(), "b.example.dev".into()],
            server_stats: Some(ServerStats {
                bandwidth_today: 1024,
                bandwidth_total: 1 << 30,
                bandwidth_limit: 10 << 30,
            }),
            ..Default::default()
        };
        assert_eq!(round_trip(&resp), resp);
    }

    #[test]
    fn test_decodes_go_style_response() {
        // Shape emitted by the original server implementation.
        let json = r#"{"success":true,"bound_domains":["misty-river.example.dev"],"server_stats":{"bandwidth_today":12,"bandwidth_total":34,"bandwidth_limit":0}}"#;
        let resp: InitResponse = serde_json::from_str(json).unwrap();
        assert!(resp.success);
        assert_eq!(resp.error_code, ErrorCode::None);
        assert_eq!(resp.bound_domains.len(), 1);
    }

    #[tokio::test]
    async fn test_record_io_round_trip() {
        let mut buf = Vec::new();
        let auth = AuthRequest {
            token: "secret".into(),
            force: false,
        };
        let tunnel = TunnelRequest::default();
        write_record(&mut buf, &auth).await.unwrap();
        write_record(&mut buf, &tunnel).await.unwrap();

        let mut reader = tokio::io::BufReader::new(buf.as_slice());
        let got_auth: AuthRequest = read_record(&mut reader).await.unwrap();
        let got_tunnel: TunnelRequest = read_record(&mut reader).await.unwrap();
        assert_eq!(got_auth, auth);
        assert_eq!(got_tunnel, tunnel);
    }

    #[tokio::test]
    async fn test_read_record_eof() {
        let mut reader = tokio::io::BufReader::new(&b""[..]);
        let err = read_record::<InitResponse, _>(&mut reader).await.unwrap_err();
        assert!(matches!(err, TunnelError::Protocol(_)));
    }
}
