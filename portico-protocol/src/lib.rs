//! Portico wire protocol.
//!
//! Two layers live here: the JSON records exchanged on the control stream
//! during the handshake ([`messages`]) and the length-prefixed frames the
//! stream multiplexer runs over the raw connection ([`frame`], [`codec`]).

pub mod codec;
pub mod frame;
pub mod messages;

pub use codec::MuxCodec;
pub use frame::{CloseReason, Frame};
pub use messages::{AuthRequest, ErrorCode, InitResponse, ServerStats, TunnelRequest};
