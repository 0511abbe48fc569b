//! Dashboard state machine.
//!
//! The model mutates only in response to [`Msg`] values delivered by the
//! driver's merged message loop: keyboard input, terminal resize, the 1 s
//! tick, and tunnel events. Rendering reads the model and a statistics
//! snapshot and produces a string (see [`crate::view`]).

use portico_core::events::{Event, EventKind};
use std::time::{Duration, SystemTime};

/// Messages driving the model.
#[derive(Debug, Clone)]
pub enum Msg {
    Key(char),
    Resize { width: u16, height: u16 },
    Tick,
    Event(Event),
}

/// What the driver should do after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Quit,
}

/// Connection status shown in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Online,
    Offline,
    Reconnecting,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Connecting => "connecting",
            Status::Online => "online",
            Status::Offline => "offline",
            Status::Reconnecting => "reconnecting",
        }
    }
}

/// One forwarding entry, keyed by local port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEntry {
    pub name: String,
    pub local_port: u16,
    pub bound_domains: Vec<String>,
    pub scheme: String,
}

/// One recent request line.
#[derive(Debug, Clone)]
pub struct RequestEntry {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration: Duration,
    pub time: SystemTime,
}

const MAX_RECENT_REQUESTS: usize = 10;

#[derive(Debug, Clone)]
pub struct Model {
    pub status: Status,
    pub tunnels: Vec<TunnelEntry>,
    pub width: u16,
    pub height: u16,
    pub server_addr: String,
    pub server_latency: Duration,
    pub requests: Vec<RequestEntry>,
    pub max_requests: usize,
    pub last_error: Option<String>,
    pub inspector_port: u16,
}

impl Model {
    pub fn new(inspector_port: u16) -> Self {
        Self {
            status: Status::Connecting,
            tunnels: Vec::new(),
            width: 80,
            height: 24,
            server_addr: String::new(),
            server_latency: Duration::ZERO,
            requests: Vec::new(),
            max_requests: MAX_RECENT_REQUESTS,
            last_error: None,
            inspector_port,
        }
    }

    /// Apply one message. Pure state transition; no I/O.
    pub fn update(&mut self, msg: Msg) -> Action {
        match msg {
            Msg::Key('q') | Msg::Key('\x03') => Action::Quit,
            Msg::Key(_) => Action::Continue,
            Msg::Resize { width, height } => {
                self.width = width;
                self.height = height;
                Action::Continue
            }
            // Tick carries no state; the driver re-renders with a fresh
            // statistics snapshot.
            Msg::Tick => Action::Continue,
            Msg::Event(event) => {
                self.handle_event(event);
                Action::Continue
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event.kind {
            EventKind::Connecting => self.status = Status::Connecting,
            EventKind::Reconnecting => self.status = Status::Reconnecting,
            EventKind::Disconnected => self.status = Status::Offline,
            EventKind::Connected(info) => {
                self.status = Status::Online;
                self.server_addr = info.server_addr;
                self.server_latency = info.latency;
            }
            EventKind::TunnelReady(info) => {
                // Duplicate bindings for a port merge their domains
                match self
                    .tunnels
                    .iter_mut()
                    .find(|t| t.local_port == info.local_port)
                {
                    Some(existing) => {
                        existing.bound_domains.extend(info.bound_domains);
                    }
                    None => self.tunnels.push(TunnelEntry {
                        name: info.name,
                        local_port: info.local_port,
                        bound_domains: info.bound_domains,
                        scheme: info.scheme,
                    }),
                }
            }
            EventKind::RequestComplete(info) => {
                self.requests.insert(
                    0,
                    RequestEntry {
                        method: info.method,
                        path: info.path,
                        status: info.status,
                        duration: info.duration,
                        time: event.timestamp.unwrap_or_else(SystemTime::now),
                    },
                );
                self.requests.truncate(self.max_requests);
            }
            EventKind::Error(info) => {
                self.last_error = Some(format!("{}: {}", info.context, info.message));
            }
            EventKind::RequestStart { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_core::events::{ConnectedInfo, ErrorInfo, RequestInfo, TunnelReadyInfo};

    fn event(kind: EventKind) -> Msg {
        Msg::Event(Event::new(kind))
    }

    #[test]
    fn test_quit_keys() {
        let mut model = Model::new(4040);
        assert_eq!(model.update(Msg::Key('q')), Action::Quit);
        assert_eq!(model.update(Msg::Key('\x03')), Action::Quit);
        assert_eq!(model.update(Msg::Key('x')), Action::Continue);
    }

    #[test]
    fn test_resize() {
        let mut model = Model::new(4040);
        model.update(Msg::Resize {
            width: 120,
            height: 40,
        });
        assert_eq!(model.width, 120);
        assert_eq!(model.height, 40);
    }

    #[test]
    fn test_status_transitions() {
        let mut model = Model::new(4040);
        assert_eq!(model.status, Status::Connecting);

        model.update(event(EventKind::Connected(ConnectedInfo {
            server_addr: "tunnel.example.dev:4443".into(),
            bound_domains: vec!["app.example.dev".into()],
            latency: Duration::from_millis(45),
        })));
        assert_eq!(model.status, Status::Online);
        assert_eq!(model.server_addr, "tunnel.example.dev:4443");
        assert_eq!(model.server_latency, Duration::from_millis(45));

        model.update(event(EventKind::Disconnected));
        assert_eq!(model.status, Status::Offline);

        model.update(event(EventKind::Reconnecting));
        assert_eq!(model.status, Status::Reconnecting);

        model.update(event(EventKind::Connecting));
        assert_eq!(model.status, Status::Connecting);
    }

    #[test]
    fn test_tunnel_ready_merges_by_port() {
        let mut model = Model::new(4040);
        model.update(event(EventKind::TunnelReady(TunnelReadyInfo {
            name: "web".into(),
            local_port: 3000,
            bound_domains: vec!["a.example.dev".into()],
            scheme: "https".into(),
        })));
        model.update(event(EventKind::TunnelReady(TunnelReadyInfo {
            name: "web".into(),
            local_port: 3000,
            bound_domains: vec!["b.example.dev".into()],
            scheme: "https".into(),
        })));
        model.update(event(EventKind::TunnelReady(TunnelReadyInfo {
            name: "api".into(),
            local_port: 4000,
            bound_domains: vec!["api.example.dev".into()],
            scheme: "https".into(),
        })));

        assert_eq!(model.tunnels.len(), 2);
        assert_eq!(
            model.tunnels[0].bound_domains,
            vec!["a.example.dev", "b.example.dev"]
        );
        assert_eq!(model.tunnels[1].local_port, 4000);
    }

    #[test]
    fn test_recent_requests_bounded_newest_first() {
        let mut model = Model::new(4040);
        for i in 0..15 {
            model.update(event(EventKind::RequestComplete(RequestInfo {
                method: "GET".into(),
                path: format!("/{i}"),
                status: 200,
                duration: Duration::from_millis(i),
                bytes: 0,
            })));
        }
        assert_eq!(model.requests.len(), 10);
        assert_eq!(model.requests[0].path, "/14");
        assert_eq!(model.requests[9].path, "/5");
    }

    #[test]
    fn test_error_formatting() {
        let mut model = Model::new(4040);
        model.update(event(EventKind::Error(ErrorInfo {
            context: "dial".into(),
            message: "connection refused".into(),
            code: None,
        })));
        assert_eq!(model.last_error.as_deref(), Some("dial: connection refused"));
    }
}
