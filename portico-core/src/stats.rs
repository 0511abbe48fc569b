//! Connection and request statistics.
//!
//! A single shared [`Stats`] value is updated by the tunnel and every proxy
//! worker, and read by the dashboard through [`Stats::snapshot`]. Writers are
//! mutually exclusive; snapshot readers run concurrently with each other.

use portico_common::constants::DEFAULT_STATS_SAMPLES;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct StatsInner {
    total_conns: u64,
    open_conns: u64,
    total_requests: u64,
    total_bytes: u64,

    // Ring of recent request durations for percentile calculations
    samples: Vec<Duration>,
    max_samples: usize,

    // Measured across the handshake
    server_latency: Duration,

    started_at: Instant,
}

/// Point-in-time view of all statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub total_connections: u64,
    pub open_connections: u64,
    pub total_requests: u64,
    pub total_bytes: u64,

    /// Duration of the most recent request
    pub rt1: Duration,
    /// Mean of the last up-to-5 requests
    pub rt5: Duration,
    /// 50th percentile (nearest rank)
    pub p50: Duration,
    /// 90th percentile (nearest rank)
    pub p90: Duration,

    pub server_latency: Duration,
    pub uptime: Duration,
}

/// Thread-safe statistics tracker.
pub struct Stats {
    inner: RwLock<StatsInner>,
}

impl Stats {
    pub fn new() -> Self {
        Self::with_max_samples(DEFAULT_STATS_SAMPLES)
    }

    /// Tracker keeping at most `max_samples` request durations (values of 0
    /// fall back to the default).
    pub fn with_max_samples(max_samples: usize) -> Self {
        let max_samples = if max_samples == 0 {
            DEFAULT_STATS_SAMPLES
        } else {
            max_samples
        };
        Self {
            inner: RwLock::new(StatsInner {
                total_conns: 0,
                open_conns: 0,
                total_requests: 0,
                total_bytes: 0,
                samples: Vec::with_capacity(max_samples),
                max_samples,
                server_latency: Duration::ZERO,
                started_at: Instant::now(),
            }),
        }
    }

    /// Count a newly opened proxy connection.
    pub fn increment_connections(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.total_conns += 1;
        inner.open_conns += 1;
    }

    /// Count a closed proxy connection. Clamped at zero.
    pub fn decrement_open_connections(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.open_conns = inner.open_conns.saturating_sub(1);
    }

    /// Record a completed request with its duration and transferred bytes.
    pub fn record_request(&self, duration: Duration, bytes: u64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.total_requests += 1;
        inner.total_bytes += bytes;

        if inner.samples.len() >= inner.max_samples {
            // Shift left, drop oldest
            inner.samples.remove(0);
        }
        inner.samples.push(duration);
    }

    pub fn set_server_latency(&self, latency: Duration) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.server_latency = latency;
    }

    /// Freeze a consistent view of the counters and derived timings.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

        let mut snap = Snapshot {
            total_connections: inner.total_conns,
            open_connections: inner.open_conns,
            total_requests: inner.total_requests,
            total_bytes: inner.total_bytes,
            server_latency: inner.server_latency,
            uptime: inner.started_at.elapsed(),
            ..Default::default()
        };

        let n = inner.samples.len();
        if n == 0 {
            return snap;
        }

        snap.rt1 = inner.samples[n - 1];

        let count = n.min(5);
        let sum: Duration = inner.samples[n - count..].iter().sum();
        snap.rt5 = sum / count as u32;

        let mut sorted = inner.samples.clone();
        sorted.sort_unstable();

        snap.p50 = sorted[n / 2];

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let p90_index = ((n as f64 * 0.9) as usize).min(n - 1);
        snap.p90 = sorted[p90_index];

        snap
    }

    /// Zero everything, including the start timestamp.
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.total_conns = 0;
        inner.open_conns = 0;
        inner.total_requests = 0;
        inner.total_bytes = 0;
        inner.samples.clear();
        inner.server_latency = Duration::ZERO;
        inner.started_at = Instant::now();
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_connection_counters() {
        let stats = Stats::new();
        stats.increment_connections();
        stats.increment_connections();
        stats.decrement_open_connections();

        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.open_connections, 1);
    }

    #[test]
    fn test_decrement_clamped_at_zero() {
        let stats = Stats::new();
        stats.decrement_open_connections();
        stats.decrement_open_connections();
        assert_eq!(stats.snapshot().open_connections, 0);
    }

    #[test]
    fn test_open_never_exceeds_total() {
        let stats = Stats::new();
        for i in 0..50 {
            stats.increment_connections();
            if i % 3 == 0 {
                stats.decrement_open_connections();
            }
            let snap = stats.snapshot();
            assert!(snap.open_connections <= snap.total_connections);
        }
    }

    #[test]
    fn test_percentiles() {
        let stats = Stats::new();
        for ms in (10..=100).step_by(10) {
            stats.record_request(Duration::from_millis(ms), 0);
        }

        let snap = stats.snapshot();
        assert_eq!(snap.rt1, Duration::from_millis(100));
        // Mean of 60..100
        assert_eq!(snap.rt5, Duration::from_millis(80));
        assert_eq!(snap.p50, Duration::from_millis(60));
        assert_eq!(snap.p90, Duration::from_millis(100));
    }

    #[test]
    fn test_ring_eviction() {
        let stats = Stats::with_max_samples(5);
        for ms in 0..10 {
            stats.record_request(Duration::from_millis(ms), 0);
        }

        let snap = stats.snapshot();
        assert_eq!(snap.rt1, Duration::from_millis(9));
        // Only 5..=9 survive; mean is 7ms
        assert_eq!(snap.rt5, Duration::from_millis(7));
        assert_eq!(snap.total_requests, 10);
    }

    #[test]
    fn test_empty_snapshot_timings_zero() {
        let snap = Stats::new().snapshot();
        assert_eq!(snap.rt1, Duration::ZERO);
        assert_eq!(snap.rt5, Duration::ZERO);
        assert_eq!(snap.p50, Duration::ZERO);
        assert_eq!(snap.p90, Duration::ZERO);
    }

    #[test]
    fn test_single_sample() {
        let stats = Stats::new();
        stats.record_request(Duration::from_millis(42), 10);

        let snap = stats.snapshot();
        assert_eq!(snap.rt1, Duration::from_millis(42));
        assert_eq!(snap.rt5, Duration::from_millis(42));
        assert_eq!(snap.p50, Duration::from_millis(42));
        assert_eq!(snap.p90, Duration::from_millis(42));
        assert_eq!(snap.total_bytes, 10);
    }

    #[test]
    fn test_reset() {
        let stats = Stats::new();
        stats.increment_connections();
        stats.record_request(Duration::from_millis(5), 100);
        stats.set_server_latency(Duration::from_millis(30));

        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 0);
        assert_eq!(snap.open_connections, 0);
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.total_bytes, 0);
        assert_eq!(snap.rt1, Duration::ZERO);
        assert_eq!(snap.server_latency, Duration::ZERO);
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = Arc::new(Stats::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = stats.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    stats.increment_connections();
                    stats.record_request(Duration::from_millis(1), 1);
                    stats.decrement_open_connections();
                    let snap = stats.snapshot();
                    assert!(snap.open_connections <= snap.total_connections);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 800);
        assert_eq!(snap.open_connections, 0);
        assert_eq!(snap.total_requests, 800);
        assert_eq!(snap.total_bytes, 800);
    }
}
