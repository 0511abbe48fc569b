//! Tunnel session: dial the ingress, handshake, accept inbound streams.

use crate::events::{ConnectedInfo, Event, EventBus, EventKind, TunnelReadyInfo};
use crate::reconnect::{delay_for_attempt, sleep_cancellable};
use crate::stats::Stats;
use crate::stream::{MuxSession, VirtualStream};
use crate::transport::{self, TlsOptions};
use portico_common::{ReconnectConfig, Result, TunnelConfig, TunnelError};
use portico_protocol::messages::{self, AuthRequest, InitResponse, TunnelRequest};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consumer of inbound streams. One call per accepted stream; the handler
/// owns the stream from then on and must close it exactly once.
pub trait StreamHandler: Send + Sync {
    fn handle(&self, stream: VirtualStream);
}

impl<F> StreamHandler for F
where
    F: Fn(VirtualStream) + Send + Sync,
{
    fn handle(&self, stream: VirtualStream) {
        self(stream);
    }
}

/// Lifecycle of a single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Dialing,
    Handshaking,
    Serving,
    Closed,
}

/// A tunnel client bound to one local service.
pub struct Tunnel {
    config: TunnelConfig,
    tls_options: TlsOptions,
    handler: Arc<dyn StreamHandler>,
    stats: Arc<Stats>,
    bus: Arc<EventBus>,
    state: Mutex<SessionState>,
}

impl Tunnel {
    pub fn new(
        config: TunnelConfig,
        handler: Arc<dyn StreamHandler>,
        stats: Arc<Stats>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            tls_options: TlsOptions::default(),
            handler,
            stats,
            bus,
            state: Mutex::new(SessionState::Closed),
        }
    }

    #[must_use]
    pub fn with_tls_options(mut self, tls_options: TlsOptions) -> Self {
        self.tls_options = tls_options;
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Run a single session to termination. Always returns an error: either
    /// the terminating cause or [`TunnelError::Cancelled`].
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let (_, err) = self.run_session(cancel).await;
        Err(err)
    }

    /// Run sessions under the reconnect policy until cancellation or, with
    /// `max_attempts > 0`, until that many consecutive attempts fail without
    /// ever reaching the serving state.
    pub async fn start_with_reconnect(
        &self,
        cancel: &CancellationToken,
        policy: &ReconnectConfig,
    ) -> Result<()> {
        let mut failed_attempts: u32 = 0;
        loop {
            let (served, err) = self.run_session(cancel).await;
            if matches!(err, TunnelError::Cancelled) {
                return Err(err);
            }

            self.publish_session_error(&err);
            self.bus.publish_kind(EventKind::Disconnected);

            if served {
                failed_attempts = 0;
            } else {
                failed_attempts += 1;
            }
            if policy.max_attempts > 0 && failed_attempts >= policy.max_attempts {
                warn!("giving up after {failed_attempts} failed attempts: {err}");
                return Err(err);
            }

            self.bus.publish_kind(EventKind::Reconnecting);
            let delay = delay_for_attempt(policy, failed_attempts.saturating_sub(1));
            debug!("reconnecting in {delay:?}");
            sleep_cancellable(delay, cancel).await?;
        }
    }

    async fn run_session(&self, cancel: &CancellationToken) -> (bool, TunnelError) {
        let result = self.try_session(cancel).await;
        let served = self.state() == SessionState::Serving;
        self.set_state(SessionState::Closed);
        match result {
            Err(err) => (served, err),
            // The accept loop only exits by error or cancellation
            Ok(()) => (served, TunnelError::Connection("session ended".into())),
        }
    }

    async fn try_session(&self, cancel: &CancellationToken) -> Result<()> {
        self.bus.publish_kind(EventKind::Connecting);

        self.set_state(SessionState::Dialing);
        info!("connecting to {}", self.config.server_addr);
        let io = transport::connect(&self.config.server_addr, &self.tls_options).await?;

        let mut session = MuxSession::client(io);

        self.set_state(SessionState::Handshaking);
        let handshake_started = Instant::now();
        let mut control = session.open_stream().await?;

        messages::write_record(
            &mut control,
            &AuthRequest {
                token: self.config.token.clone(),
                force: false,
            },
        )
        .await?;

        let requested_domains: Vec<String> = self.config.subdomain.iter().cloned().collect();
        messages::write_record(&mut control, &TunnelRequest { requested_domains }).await?;

        let response: InitResponse = {
            let mut reader = BufReader::new(&mut control);
            messages::read_record(&mut reader).await?
        };
        let latency = handshake_started.elapsed();

        if !response.success {
            return Err(TunnelError::HandshakeRejected {
                message: response
                    .error
                    .unwrap_or_else(|| "handshake rejected".to_string()),
                code: response.error_code,
            });
        }

        self.stats.set_server_latency(latency);
        info!(
            "tunnel established, {} domain(s) bound, latency {:?}",
            response.bound_domains.len(),
            latency
        );

        self.bus
            .publish_kind(EventKind::Connected(ConnectedInfo {
                server_addr: self.config.server_addr.clone(),
                bound_domains: response.bound_domains.clone(),
                latency,
            }));

        let scheme = if transport::is_local_host(self.config.server_host()) {
            "http"
        } else {
            "https"
        };
        for domain in &response.bound_domains {
            self.bus
                .publish_kind(EventKind::TunnelReady(TunnelReadyInfo {
                    name: domain.clone(),
                    local_port: self.config.local_port,
                    bound_domains: vec![domain.clone()],
                    scheme: scheme.to_string(),
                }));
        }

        // Handshake done; data streams follow
        control.shutdown().await?;
        drop(control);

        self.set_state(SessionState::Serving);
        loop {
            // The accept future is dropped before the session is closed, so
            // cancellation can tear the session down without a live borrow.
            let inbound = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                inbound = session.accept() => Some(inbound),
            };
            match inbound {
                None => {
                    session.close().await;
                    return Err(TunnelError::Cancelled);
                }
                Some(Ok(stream)) => {
                    debug!("accepted stream {}", stream.id());
                    self.handler.handle(stream);
                }
                Some(Err(err)) => return Err(err),
            }
        }
    }

    fn publish_session_error(&self, err: &TunnelError) {
        let context = match err {
            TunnelError::Io(_) | TunnelError::Connection(_) | TunnelError::Tls(_) => "dial",
            TunnelError::Protocol(_)
            | TunnelError::Serialization(_)
            | TunnelError::HandshakeRejected { .. } => "handshake",
            _ => "session",
        };
        self.bus.publish(Event::new(EventKind::Error(
            crate::events::ErrorInfo {
                context: context.to_string(),
                message: err.to_string(),
                code: err.handshake_code(),
            },
        )));
    }
}
