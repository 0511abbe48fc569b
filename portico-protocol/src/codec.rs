//! Codec for encoding and decoding multiplexer frames.
//!
//! Frames are length-prefixed with a 4-byte big-endian length field,
//! followed by a 1-byte frame type:
//!
//! ```text
//! ┌─────────────┬───────────┬──────────────┐
//! │ Length (u32)│ Type (u8) │ Payload      │
//! │ 4 bytes     │ 1 byte    │ N bytes      │
//! └─────────────┴───────────┴──────────────┘
//! ```
//!
//! Payload format depends on Type:
//! - Control (0x00): `bincode(Frame)` (excluding `Frame::Data`)
//! - Data (0x01): `[StreamID(u32)][Flags(u8)][Raw Bytes...]`

use crate::frame::Frame;
use bytes::{Buf, BufMut, BytesMut};
use portico_common::constants::MAX_FRAME_SIZE;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

const FRAME_TYPE_CONTROL: u8 = 0x00;
const FRAME_TYPE_DATA: u8 = 0x01;
const FLAG_EOS: u8 = 0x01;

/// Multiplexer frame codec
#[derive(Debug, Clone, Copy)]
pub struct MuxCodec {
    max_frame_size: usize,
}

impl Default for MuxCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl MuxCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for MuxCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let frame_length = u32::from_be_bytes(length_bytes) as usize;

        if frame_length > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Frame too large: {frame_length} bytes (max: {})",
                    self.max_frame_size
                ),
            ));
        }

        if src.len() < 4 + frame_length {
            src.reserve(4 + frame_length - src.len());
            return Ok(None);
        }

        src.advance(4);

        if frame_length < 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Frame too short (missing type byte)",
            ));
        }

        let frame_type = src[0];
        src.advance(1);
        let payload_len = frame_length - 1;

        match frame_type {
            FRAME_TYPE_DATA => {
                // Fast path: [StreamID: 4][Flags: 1][Data: N]
                if payload_len < 5 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Data frame header truncated",
                    ));
                }

                let stream_id = src.get_u32();
                let flags = src.get_u8();
                let end_of_stream = (flags & FLAG_EOS) != 0;
                let data = src.split_to(payload_len - 5).freeze();

                Ok(Some(Frame::Data {
                    stream_id,
                    data,
                    end_of_stream,
                }))
            }
            FRAME_TYPE_CONTROL => {
                let frame_bytes = src.split_to(payload_len);
                let config = bincode::config::standard().with_limit::<MAX_FRAME_SIZE>();
                let (frame, _) = bincode::serde::decode_from_slice(&frame_bytes, config)
                    .map_err(|e| {
                        io::Error::new(io::ErrorKind::InvalidData, format!("Decode error: {e}"))
                    })?;
                Ok(Some(frame))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown frame type: {frame_type}"),
            )),
        }
    }
}

impl Encoder<Frame> for MuxCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match frame {
            Frame::Data {
                stream_id,
                data,
                end_of_stream,
            } => {
                // Payload: [Type(1)][StreamID(4)][Flags(1)][Data(N)]
                let payload_len = 1 + 4 + 1 + data.len();
                if payload_len > self.max_frame_size {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "Frame too large: {payload_len} bytes (max: {})",
                            self.max_frame_size
                        ),
                    ));
                }

                dst.reserve(4 + payload_len);
                #[allow(clippy::cast_possible_truncation)]
                dst.put_u32(payload_len as u32);
                dst.put_u8(FRAME_TYPE_DATA);
                dst.put_u32(stream_id);
                dst.put_u8(if end_of_stream { FLAG_EOS } else { 0 });
                dst.put_slice(&data);
                Ok(())
            }
            control_frame => {
                let config = bincode::config::standard();
                let payload =
                    bincode::serde::encode_to_vec(&control_frame, config).map_err(|e| {
                        io::Error::new(io::ErrorKind::InvalidData, format!("Encode error: {e}"))
                    })?;

                let total_len = 1 + payload.len();
                if total_len > self.max_frame_size {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "Frame too large: {total_len} bytes (max: {})",
                            self.max_frame_size
                        ),
                    ));
                }

                dst.reserve(4 + total_len);
                #[allow(clippy::cast_possible_truncation)]
                dst.put_u32(total_len as u32);
                dst.put_u8(FRAME_TYPE_CONTROL);
                dst.put_slice(&payload);
                Ok(())
            }
        }
    }
}
