pub mod events;
pub mod reconnect;
pub mod stats;
pub mod stream;
pub mod transport;
pub mod tunnel;

// Re-export specific items for convenience
pub use events::{Event, EventBus, EventKind};
pub use stats::{Snapshot, Stats};
pub use tunnel::{SessionState, StreamHandler, Tunnel};
