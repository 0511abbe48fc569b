//! Multiplexer frame definitions

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Wire frame of the stream multiplexer.
///
/// `Data` is the fast path and is encoded by hand in the codec; the other
/// variants travel as bincode control frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Frame {
    /// Open a new logical stream
    OpenStream { stream_id: u32 },

    /// Payload bytes for a stream (fast path)
    Data {
        stream_id: u32,
        data: Bytes,
        end_of_stream: bool,
    },

    /// Close a stream
    CloseStream { stream_id: u32, reason: CloseReason },

    /// Orderly teardown of the whole session
    GoAway,
}

impl Frame {
    /// Stream this frame belongs to, if any.
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Frame::OpenStream { stream_id }
            | Frame::Data { stream_id, .. }
            | Frame::CloseStream { stream_id, .. } => Some(*stream_id),
            Frame::GoAway => None,
        }
    }
}

/// Stream close reasons
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_serialization() {
        let frames = vec![
            Frame::OpenStream { stream_id: 7 },
            Frame::CloseStream {
                stream_id: 7,
                reason: CloseReason::Normal,
            },
            Frame::CloseStream {
                stream_id: 9,
                reason: CloseReason::Error("local service unreachable".into()),
            },
            Frame::GoAway,
        ];

        let config = bincode::config::standard();
        for frame in frames {
            let encoded = bincode::serde::encode_to_vec(&frame, config).unwrap();
            let (decoded, _): (Frame, usize) =
                bincode::serde::decode_from_slice(&encoded, config).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_stream_id_accessor() {
        assert_eq!(Frame::OpenStream { stream_id: 3 }.stream_id(), Some(3));
        assert_eq!(Frame::GoAway.stream_id(), None);
    }
}
