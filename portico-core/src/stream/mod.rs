//! Stream multiplexing over a single connection

pub mod multiplexer;

pub use multiplexer::{MuxSession, VirtualStream};
