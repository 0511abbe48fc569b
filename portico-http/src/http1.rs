//! Incremental HTTP/1 message parsing and re-serialization.
//!
//! The proxy buffers whole messages so the inspector can capture them, so
//! parsing here reads the complete head and body into memory. Bodies framed
//! with `Transfer-Encoding: chunked` are decoded; re-serialization always
//! emits `Content-Length` framing.

use bytes::{Buf, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEADERS: usize = 64;
/// Upper bound on the head section; longer heads are treated as non-HTTP.
const MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid HTTP message: {0}")]
    Invalid(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A fully buffered HTTP/1 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    /// Minor version: `1` for HTTP/1.1
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// A fully buffered HTTP/1 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn proto(&self) -> String {
        format!("HTTP/1.{}", self.version)
    }
}

impl Response {
    pub fn proto(&self) -> String {
        format!("HTTP/1.{}", self.version)
    }
}

enum BodyKind {
    None,
    Length(usize),
    Chunked,
    /// Delimited by connection close (responses only)
    Eof,
}

struct RequestHead {
    method: String,
    path: String,
    version: u8,
    headers: Vec<(String, String)>,
    head_len: usize,
}

struct ResponseHead {
    status: u16,
    reason: String,
    version: u8,
    headers: Vec<(String, String)>,
    head_len: usize,
}

fn owned_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

fn try_parse_request_head(buf: &[u8]) -> Result<Option<RequestHead>, ParseError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut storage);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => Ok(Some(RequestHead {
            method: parsed.method.unwrap_or_default().to_string(),
            path: parsed.path.unwrap_or_default().to_string(),
            version: parsed.version.unwrap_or(1),
            headers: owned_headers(parsed.headers),
            head_len,
        })),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ParseError::Invalid(e.to_string())),
    }
}

fn try_parse_response_head(buf: &[u8]) -> Result<Option<ResponseHead>, ParseError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut storage);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => Ok(Some(ResponseHead {
            status: parsed.code.unwrap_or_default(),
            reason: parsed.reason.unwrap_or_default().to_string(),
            version: parsed.version.unwrap_or(1),
            headers: owned_headers(parsed.headers),
            head_len,
        })),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ParseError::Invalid(e.to_string())),
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    header_value(headers, "transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
}

fn content_length(headers: &[(String, String)]) -> Result<Option<usize>, ParseError> {
    match header_value(headers, "content-length") {
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ParseError::Invalid(format!("bad content-length: {v:?}"))),
        None => Ok(None),
    }
}

fn request_body_kind(headers: &[(String, String)]) -> Result<BodyKind, ParseError> {
    if is_chunked(headers) {
        return Ok(BodyKind::Chunked);
    }
    Ok(match content_length(headers)? {
        Some(0) | None => BodyKind::None,
        Some(n) => BodyKind::Length(n),
    })
}

fn response_body_kind(
    status: u16,
    head_request: bool,
    headers: &[(String, String)],
) -> Result<BodyKind, ParseError> {
    if head_request || (100..200).contains(&status) || status == 204 || status == 304 {
        return Ok(BodyKind::None);
    }
    if is_chunked(headers) {
        return Ok(BodyKind::Chunked);
    }
    Ok(match content_length(headers)? {
        Some(0) => BodyKind::None,
        Some(n) => BodyKind::Length(n),
        None => BodyKind::Eof,
    })
}

async fn fill<R: AsyncRead + Unpin>(io: &mut R, buf: &mut BytesMut) -> Result<usize, ParseError> {
    Ok(io.read_buf(buf).await?)
}

async fn read_line<R: AsyncRead + Unpin>(
    io: &mut R,
    buf: &mut BytesMut,
) -> Result<String, ParseError> {
    loop {
        if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line = buf.split_to(pos + 1);
            return Ok(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        if fill(io, buf).await? == 0 {
            return Err(ParseError::Invalid("unexpected eof in chunked body".into()));
        }
    }
}

async fn read_body<R: AsyncRead + Unpin>(
    io: &mut R,
    buf: &mut BytesMut,
    kind: BodyKind,
) -> Result<Vec<u8>, ParseError> {
    match kind {
        BodyKind::None => Ok(Vec::new()),
        BodyKind::Length(n) => {
            while buf.len() < n {
                if fill(io, buf).await? == 0 {
                    return Err(ParseError::Invalid("unexpected eof in body".into()));
                }
            }
            Ok(buf.split_to(n).to_vec())
        }
        BodyKind::Chunked => {
            let mut body = Vec::new();
            loop {
                let size_line = read_line(io, buf).await?;
                let size_str = size_line.split(';').next().unwrap_or_default().trim();
                let size = usize::from_str_radix(size_str, 16)
                    .map_err(|_| ParseError::Invalid(format!("bad chunk size: {size_str:?}")))?;
                if size == 0 {
                    // Trailer section runs to the blank line
                    loop {
                        if read_line(io, buf).await?.is_empty() {
                            break;
                        }
                    }
                    return Ok(body);
                }
                while buf.len() < size + 2 {
                    if fill(io, buf).await? == 0 {
                        return Err(ParseError::Invalid("unexpected eof in chunk".into()));
                    }
                }
                body.extend_from_slice(&buf.split_to(size));
                buf.advance(2); // CRLF after chunk data
            }
        }
        BodyKind::Eof => {
            let mut body = buf.split().to_vec();
            while fill(io, buf).await? != 0 {
                body.extend_from_slice(&buf.split());
            }
            Ok(body)
        }
    }
}

/// Read one complete request from `io`, buffering through `buf`.
///
/// On failure `buf` still holds every byte consumed from the wire so the
/// caller can fall back to a raw copy.
pub async fn read_request<R: AsyncRead + Unpin>(
    io: &mut R,
    buf: &mut BytesMut,
) -> Result<Request, ParseError> {
    let head = loop {
        if let Some(head) = try_parse_request_head(buf)? {
            break head;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ParseError::Invalid("request head too large".into()));
        }
        if fill(io, buf).await? == 0 {
            return Err(ParseError::Invalid(
                "unexpected eof while reading request head".into(),
            ));
        }
    };

    buf.advance(head.head_len);
    let kind = request_body_kind(&head.headers)?;
    let body = read_body(io, buf, kind).await?;

    Ok(Request {
        method: head.method,
        path: head.path,
        version: head.version,
        headers: head.headers,
        body,
    })
}

/// Read one complete response from `io`. `head_request` suppresses the body
/// per HEAD semantics.
pub async fn read_response<R: AsyncRead + Unpin>(
    io: &mut R,
    buf: &mut BytesMut,
    head_request: bool,
) -> Result<Response, ParseError> {
    let head = loop {
        if let Some(head) = try_parse_response_head(buf)? {
            break head;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ParseError::Invalid("response head too large".into()));
        }
        if fill(io, buf).await? == 0 {
            return Err(ParseError::Invalid(
                "unexpected eof while reading response head".into(),
            ));
        }
    };

    buf.advance(head.head_len);
    let kind = response_body_kind(head.status, head_request, &head.headers)?;
    let body = read_body(io, buf, kind).await?;

    Ok(Response {
        status: head.status,
        reason: head.reason,
        version: head.version,
        headers: head.headers,
        body,
    })
}

fn has_body_framing(headers: &[(String, String)]) -> bool {
    header_value(headers, "content-length").is_some() || is_chunked(headers)
}

/// Serialize `req` with `Content-Length` framing.
pub async fn write_request<W: AsyncWrite + Unpin>(io: &mut W, req: &Request) -> io::Result<()> {
    let mut out = Vec::with_capacity(256 + req.body.len());
    out.extend_from_slice(
        format!("{} {} HTTP/1.{}\r\n", req.method, req.path, req.version).as_bytes(),
    );

    let mut wrote_length = false;
    for (name, value) in &req.headers {
        if name.eq_ignore_ascii_case("transfer-encoding") {
            continue; // body is re-framed below
        }
        if name.eq_ignore_ascii_case("content-length") {
            if wrote_length {
                continue;
            }
            wrote_length = true;
            out.extend_from_slice(format!("Content-Length: {}\r\n", req.body.len()).as_bytes());
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !wrote_length && (!req.body.is_empty() || has_body_framing(&req.headers)) {
        out.extend_from_slice(format!("Content-Length: {}\r\n", req.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&req.body);

    io.write_all(&out).await?;
    io.flush().await
}

/// Serialize `resp` with `Content-Length` framing. For HEAD responses the
/// original headers pass through untouched and no body is written.
pub async fn write_response<W: AsyncWrite + Unpin>(
    io: &mut W,
    resp: &Response,
    head_request: bool,
) -> io::Result<()> {
    let mut out = Vec::with_capacity(256 + resp.body.len());
    out.extend_from_slice(
        format!("HTTP/1.{} {} {}\r\n", resp.version, resp.status, resp.reason).as_bytes(),
    );

    let allow_body =
        !head_request && !(100..200).contains(&resp.status) && resp.status != 204 && resp.status != 304;

    let mut wrote_length = false;
    for (name, value) in &resp.headers {
        if allow_body {
            if name.eq_ignore_ascii_case("transfer-encoding") {
                continue;
            }
            if name.eq_ignore_ascii_case("content-length") {
                if wrote_length {
                    continue;
                }
                wrote_length = true;
                out.extend_from_slice(
                    format!("Content-Length: {}\r\n", resp.body.len()).as_bytes(),
                );
                continue;
            }
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if allow_body && !wrote_length {
        out.extend_from_slice(format!("Content-Length: {}\r\n", resp.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    if allow_body {
        out.extend_from_slice(&resp.body);
    }

    io.write_all(&out).await?;
    io.flush().await
}
