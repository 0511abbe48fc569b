//! Lifecycle and request event fan-out.
//!
//! The bus delivers every published event to every subscriber that has room
//! in its queue. Publishing never blocks and never fails: a subscriber whose
//! queue is full simply misses that event. Each subscriber therefore sees a
//! subsequence of the publish order.

use portico_common::constants::DEFAULT_EVENT_BUFFER;
use portico_common::HandshakeErrorCode;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

/// Payload of [`EventKind::Connected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedInfo {
    pub server_addr: String,
    pub bound_domains: Vec<String>,
    pub latency: Duration,
}

/// Payload of [`EventKind::TunnelReady`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelReadyInfo {
    pub name: String,
    pub local_port: u16,
    pub bound_domains: Vec<String>,
    pub scheme: String,
}

/// Payload of [`EventKind::RequestComplete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration: Duration,
    pub bytes: u64,
}

/// Payload of [`EventKind::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub context: String,
    pub message: String,
    /// Present when the server rejected the handshake with a coded reason,
    /// so consumers can decide to stop retrying.
    pub code: Option<HandshakeErrorCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Connecting,
    Connected(ConnectedInfo),
    Disconnected,
    Reconnecting,
    RequestStart { method: String, path: String },
    RequestComplete(RequestInfo),
    TunnelReady(TunnelReadyInfo),
    Error(ErrorInfo),
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connecting => "connecting",
            EventKind::Connected(_) => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Reconnecting => "reconnecting",
            EventKind::RequestStart { .. } => "request_start",
            EventKind::RequestComplete(_) => "request_complete",
            EventKind::TunnelReady(_) => "tunnel_ready",
            EventKind::Error(_) => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// Stamped at publish time when the producer left it unset.
    pub timestamp: Option<SystemTime>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: None,
        }
    }
}

/// Receiving end of a bus subscription.
///
/// Closed (unsubscribed, or bus shut down) endpoints yield `None`.
#[derive(Debug)]
pub struct Subscriber {
    id: u64,
    rx: mpsc::Receiver<Event>,
}

impl Subscriber {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking poll; `None` when the queue is empty or the endpoint is
    /// closed.
    pub fn try_recv(&mut self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

struct BusInner {
    subscribers: Vec<(u64, mpsc::Sender<Event>)>,
    closed: bool,
}

/// Best-effort, non-blocking event fan-out.
pub struct EventBus {
    inner: Mutex<BusInner>,
    buffer: usize,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_EVENT_BUFFER)
    }

    /// Bus whose subscriber queues hold `buffer` events (minimum 1).
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                subscribers: Vec::new(),
                closed: false,
            }),
            buffer: buffer.max(1),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber. After [`close`](Self::close) the returned
    /// endpoint is already closed.
    pub fn subscribe(&self) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.closed {
            inner.subscribers.push((id, tx));
        }
        // When closed, `tx` drops here and the endpoint reads as closed.
        Subscriber { id, rx }
    }

    /// Deliver `event` to every subscriber with queue room. Never blocks;
    /// full or closed endpoints are skipped.
    pub fn publish(&self, mut event: Event) {
        event.timestamp.get_or_insert_with(SystemTime::now);

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return;
        }
        inner.subscribers.retain(|(_, tx)| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                // Queue full: drop the event for this subscriber only.
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn publish_kind(&self, kind: EventKind) {
        self.publish(Event::new(kind));
    }

    /// Convenience wrapper for error events.
    pub fn publish_error(&self, err: impl fmt::Display, context: impl Into<String>) {
        self.publish(Event::new(EventKind::Error(ErrorInfo {
            context: context.into(),
            message: err.to_string(),
            code: None,
        })));
    }

    /// Close `subscriber`'s endpoint and remove it from the bus.
    pub fn unsubscribe(&self, subscriber: &Subscriber) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.retain(|(id, _)| *id != subscriber.id);
    }

    /// Close every endpoint and refuse further deliveries.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.publish_kind(EventKind::Connecting);

        let event = sub.recv().await.expect("event");
        assert_eq!(event.kind, EventKind::Connecting);
        assert!(event.timestamp.is_some());
    }

    #[tokio::test]
    async fn test_fan_out() {
        let bus = EventBus::new();
        let mut subs = vec![bus.subscribe(), bus.subscribe(), bus.subscribe()];
        assert_eq!(bus.subscriber_count(), 3);

        bus.publish_kind(EventKind::Connecting);

        for sub in &mut subs {
            let event = sub.recv().await.expect("event");
            assert_eq!(event.kind, EventKind::Connecting);
        }
    }

    #[tokio::test]
    async fn test_publish_error() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.publish_error("dial tcp: refused", "dial");

        match sub.recv().await.expect("event").kind {
            EventKind::Error(info) => {
                assert_eq!(info.context, "dial");
                assert_eq!(info.message, "dial tcp: refused");
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.unsubscribe(&sub);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close() {
        let bus = EventBus::new();
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        bus.publish_kind(EventKind::Connecting);
        bus.close();

        // Buffered events drain, then the endpoints read closed.
        assert!(sub1.recv().await.is_some());
        assert!(sub1.recv().await.is_none());
        assert!(sub2.recv().await.is_some());
        assert!(sub2.recv().await.is_none());

        // Publishing after close must not panic; the event is dropped.
        bus.publish_kind(EventKind::Disconnected);

        // Subscribing after close yields a pre-closed endpoint.
        let mut late = bus.subscribe();
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_nonblocking_publish_when_full() {
        let bus = EventBus::with_buffer(1);
        let mut sub = bus.subscribe();

        bus.publish_kind(EventKind::Connecting);
        // Queue is now full; these must complete immediately and be dropped
        // for the stuck subscriber.
        for _ in 0..1000 {
            bus.publish_kind(EventKind::Disconnected);
        }

        let first = sub.recv().await.expect("buffered event");
        assert_eq!(first.kind, EventKind::Connecting);
    }

    #[tokio::test]
    async fn test_subsequence_ordering() {
        let bus = EventBus::with_buffer(64);
        let mut sub = bus.subscribe();

        for i in 0..32u16 {
            bus.publish_kind(EventKind::RequestComplete(RequestInfo {
                method: "GET".into(),
                path: format!("/{i}"),
                status: 200,
                duration: Duration::from_millis(u64::from(i)),
                bytes: 0,
            }));
        }
        drop(bus);

        let mut last = -1i32;
        while let Some(event) = sub.recv().await {
            if let EventKind::RequestComplete(info) = event.kind {
                let idx: i32 = info.path.trim_start_matches('/').parse().unwrap();
                assert!(idx > last, "events reordered: {idx} after {last}");
                last = idx;
            }
        }
    }

    #[tokio::test]
    async fn test_preset_timestamp_preserved() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        bus.publish(Event {
            kind: EventKind::Connecting,
            timestamp: Some(stamp),
        });

        let event = sub.recv().await.expect("event");
        assert_eq!(event.timestamp, Some(stamp));
    }
}
