//! Bounded in-memory ring of captured HTTP exchanges.
//!
//! Exchange IDs increase monotonically for the lifetime of a store and are
//! never reused, even across [`ExchangeStore::clear`]. Captured bodies are
//! stored as text and cut at 1 MiB with a trailing truncation marker.

use chrono::{DateTime, Utc};
use portico_common::constants::{DEFAULT_STORE_CAPACITY, MAX_CAPTURE_BODY};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Marker appended to bodies longer than [`MAX_CAPTURE_BODY`].
const TRUNCATION_MARKER: &str = "\n... (truncated)";

/// Captured request half of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub proto: String,
    pub headers: HashMap<String, Vec<String>>,
    pub body: String,
    /// Original body size in bytes, before truncation.
    pub size: i64,
}

/// Captured response half of an exchange. Absent when the local service
/// failed before responding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub status: u16,
    pub proto: String,
    pub headers: HashMap<String, Vec<String>>,
    pub body: String,
    pub size: i64,
}

/// One proxied request/response pair with timing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseRecord>,
    pub duration_ms: i64,
    pub timestamp: DateTime<Utc>,
}

impl Exchange {
    /// Build an exchange ready for [`ExchangeStore::add`]; the ID is stamped
    /// by the store.
    pub fn new(
        request: Option<RequestRecord>,
        response: Option<ResponseRecord>,
        duration: Duration,
    ) -> Self {
        Self {
            id: 0,
            request,
            response,
            duration_ms: duration.as_millis() as i64,
            timestamp: Utc::now(),
        }
    }
}

/// Cut `body` at the capture limit, marking the cut.
pub fn truncate_body(body: &[u8]) -> String {
    if body.len() > MAX_CAPTURE_BODY {
        let mut text = String::from_utf8_lossy(&body[..MAX_CAPTURE_BODY]).into_owned();
        text.push_str(TRUNCATION_MARKER);
        text
    } else {
        String::from_utf8_lossy(body).into_owned()
    }
}

/// Fold a header list into the multi-valued map served by the API.
pub fn header_map(headers: &[(String, String)]) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        map.entry(name.clone()).or_default().push(value.clone());
    }
    map
}

impl RequestRecord {
    pub fn capture(
        method: &str,
        url: &str,
        proto: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
            proto: proto.to_string(),
            headers: header_map(headers),
            body: truncate_body(body),
            size: body.len() as i64,
        }
    }
}

impl ResponseRecord {
    pub fn capture(status: u16, proto: &str, headers: &[(String, String)], body: &[u8]) -> Self {
        Self {
            status,
            proto: proto.to_string(),
            headers: header_map(headers),
            body: truncate_body(body),
            size: body.len() as i64,
        }
    }
}

struct StoreInner {
    exchanges: Vec<Exchange>,
    next_id: i64,
}

/// Thread-safe bounded ring of exchanges, newest first.
pub struct ExchangeStore {
    inner: RwLock<StoreInner>,
    capacity: usize,
}

impl ExchangeStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_STORE_CAPACITY)
    }

    /// Store keeping at most `capacity` exchanges (0 falls back to the
    /// default).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_STORE_CAPACITY
        } else {
            capacity
        };
        Self {
            inner: RwLock::new(StoreInner {
                exchanges: Vec::with_capacity(capacity),
                next_id: 0,
            }),
            capacity,
        }
    }

    /// Stamp the next ID into `exchange`, prepend it, evict the oldest entry
    /// when over capacity. Returns the assigned ID.
    pub fn add(&self, mut exchange: Exchange) -> i64 {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let id = inner.next_id;
        inner.next_id += 1;
        exchange.id = id;

        inner.exchanges.insert(0, exchange);
        if inner.exchanges.len() > self.capacity {
            inner.exchanges.truncate(self.capacity);
        }

        id
    }

    /// Look up an exchange by ID. Returns an owned copy; mutations do not
    /// touch the store.
    pub fn get(&self, id: i64) -> Option<Exchange> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.exchanges.iter().find(|ex| ex.id == id).cloned()
    }

    /// All exchanges, newest first, as a freshly allocated copy.
    pub fn list(&self) -> Vec<Exchange> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.exchanges.clone()
    }

    /// Empty the ring. The ID counter is not reset, so old IDs stay dead.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.exchanges.clear();
    }

    pub fn count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.exchanges.len()
    }
}

impl Default for ExchangeStore {
    fn default() -> Self {
        Self::new()
    }
}
