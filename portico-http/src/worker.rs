//! Per-stream proxy worker.
//!
//! One worker runs per inbound tunnel stream: dial the local service, parse
//! the request, forward it, buffer the response, capture the exchange, and
//! relay the response back. Streams that do not parse as HTTP degrade to a
//! raw byte copy in both directions.

use crate::http1::{self, ParseError};
use bytes::BytesMut;
use portico_core::events::{EventBus, EventKind, RequestInfo};
use portico_core::stats::Stats;
use portico_core::stream::VirtualStream;
use portico_core::tunnel::StreamHandler;
use portico_inspector::store::{Exchange, ExchangeStore, RequestRecord, ResponseRecord};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

/// Holds the open-connection count for exactly the worker's lifetime.
struct ConnGuard {
    stats: Arc<Stats>,
}

impl ConnGuard {
    fn new(stats: Arc<Stats>) -> Self {
        stats.increment_connections();
        Self { stats }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.stats.decrement_open_connections();
    }
}

/// Spawns one proxying task per accepted tunnel stream.
#[derive(Clone)]
pub struct ProxyWorker {
    local_port: u16,
    store: Arc<ExchangeStore>,
    stats: Arc<Stats>,
    bus: Arc<EventBus>,
}

impl ProxyWorker {
    pub fn new(
        local_port: u16,
        store: Arc<ExchangeStore>,
        stats: Arc<Stats>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            local_port,
            store,
            stats,
            bus,
        }
    }

    /// Proxy a single stream to completion. Both the stream and the local
    /// socket are closed by the time this returns.
    pub async fn proxy_stream<S>(self, mut remote: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let _guard = ConnGuard::new(self.stats.clone());
        let started = Instant::now();

        let local_addr = format!("127.0.0.1:{}", self.local_port);
        let mut local = match TcpStream::connect(&local_addr).await {
            Ok(socket) => socket,
            Err(err) => {
                error!("failed to dial local service {local_addr}: {err}");
                let _ = remote.shutdown().await;
                return;
            }
        };

        let mut request_buf = BytesMut::with_capacity(8 * 1024);
        let request = match http1::read_request(&mut remote, &mut request_buf).await {
            Ok(request) => request,
            Err(ParseError::Invalid(reason)) => {
                // Not HTTP. Relay the bytes we already took, then go duplex.
                debug!("request did not parse ({reason}), falling back to raw copy");
                if request_buf.is_empty() || local.write_all(&request_buf).await.is_ok() {
                    let _ = tokio::io::copy_bidirectional(&mut remote, &mut local).await;
                }
                let _ = remote.shutdown().await;
                return;
            }
            Err(ParseError::Io(err)) => {
                debug!("stream ended while reading request: {err}");
                let _ = remote.shutdown().await;
                return;
            }
        };

        self.bus.publish_kind(EventKind::RequestStart {
            method: request.method.clone(),
            path: request.path.clone(),
        });

        if let Err(err) = http1::write_request(&mut local, &request).await {
            warn!("failed to forward request to local service: {err}");
            let _ = remote.shutdown().await;
            return;
        }

        let head_request = request.method.eq_ignore_ascii_case("HEAD");
        let mut response_buf = BytesMut::with_capacity(8 * 1024);
        let response = match http1::read_response(&mut local, &mut response_buf, head_request).await
        {
            Ok(response) => response,
            Err(err) => {
                warn!("failed to read response from local service: {err}");
                // The request happened; capture it without a response half.
                self.store.add(Exchange::new(
                    Some(capture_request(&request)),
                    None,
                    started.elapsed(),
                ));
                let _ = remote.shutdown().await;
                return;
            }
        };

        let duration = started.elapsed();
        let bytes = (request.body.len() + response.body.len()) as u64;

        // Store first so a consumer woken by the event finds the entry.
        self.store.add(Exchange::new(
            Some(capture_request(&request)),
            Some(capture_response(&response)),
            duration,
        ));
        self.stats.record_request(duration, bytes);
        self.bus
            .publish_kind(EventKind::RequestComplete(RequestInfo {
                method: request.method.clone(),
                path: request.path.clone(),
                status: response.status,
                duration,
                bytes,
            }));

        if let Err(err) = http1::write_response(&mut remote, &response, head_request).await {
            debug!("failed to relay response to tunnel: {err}");
        }
        let _ = remote.shutdown().await;
    }
}

fn capture_request(request: &http1::Request) -> RequestRecord {
    RequestRecord::capture(
        &request.method,
        &request.path,
        &request.proto(),
        &request.headers,
        &request.body,
    )
}

fn capture_response(response: &http1::Response) -> ResponseRecord {
    ResponseRecord::capture(
        response.status,
        &response.proto(),
        &response.headers,
        &response.body,
    )
}

impl StreamHandler for ProxyWorker {
    fn handle(&self, stream: VirtualStream) {
        let worker = self.clone();
        tokio::spawn(async move {
            worker.proxy_stream(stream).await;
        });
    }
}
