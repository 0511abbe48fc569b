//! Traffic inspector: capture store and loopback HTTP surface.

pub mod server;
pub mod store;

pub use server::InspectorServer;
pub use store::{Exchange, ExchangeStore, RequestRecord, ResponseRecord};
