//! Default ports and sizes for Portico.
//!
//! Use these constants instead of magic numbers so defaults stay consistent
//! across the crates and the CLI.

use std::time::Duration;

/// Default port for the ingress control plane.
pub const DEFAULT_SERVER_PORT: u16 = 4443;

/// Default address of the ingress control plane as a string.
pub const DEFAULT_SERVER_ADDR: &str = "localhost:4443";

/// Default loopback port for the traffic inspector.
pub const DEFAULT_INSPECTOR_PORT: u16 = 4040;

/// Default number of captured exchanges kept by the inspector store.
pub const DEFAULT_STORE_CAPACITY: usize = 100;

/// Default number of duration samples kept by the statistics engine.
pub const DEFAULT_STATS_SAMPLES: usize = 100;

/// Largest request or response body stored verbatim by the inspector.
/// Longer bodies are cut here and marked truncated.
pub const MAX_CAPTURE_BODY: usize = 1024 * 1024;

/// Maximum frame size accepted by the multiplexer codec (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on a replayed request round trip.
pub const REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-subscriber buffer of the event bus.
pub const DEFAULT_EVENT_BUFFER: usize = 16;
