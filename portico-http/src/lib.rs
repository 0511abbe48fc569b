//! HTTP/1 proxying for inbound tunnel streams.

pub mod http1;
pub mod worker;

pub use worker::ProxyWorker;
