//! Wire framing for request/reply pipes.
//!
//! Every message travels as one frame:
//!
//! ```text
//! +----------------+----------------+------------------+
//! | length (u32BE) | req id (u32BE) | body (length - 4) |
//! +----------------+----------------+------------------+
//! ```
//!
//! `length` counts the request id and the body. Request ids always have the
//! top bit set, which lets a peer reject garbage early.

use bytes::{Buf, BufMut, BytesMut};

/// Largest accepted frame (request id + body).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Bytes of the length prefix.
const LENGTH_LEN: usize = 4;

/// Bytes of the request id.
const ID_LEN: usize = 4;

/// Bit set in every request id.
pub const REQUEST_ID_FLAG: u32 = 0x8000_0000;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub request_id: u32,
    pub body: BytesMut,
}

impl Frame {
    /// Encode a frame to bytes
    pub fn encode(request_id: u32, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(LENGTH_LEN + ID_LEN + body.len());
        Self::encode_into(request_id, body, &mut buf);
        buf
    }

    /// Encode a frame into an existing buffer
    pub fn encode_into(request_id: u32, body: &[u8], buf: &mut BytesMut) {
        buf.put_u32((ID_LEN + body.len()) as u32);
        buf.put_u32(request_id);
        buf.extend_from_slice(body);
    }
}

/// Framing errors. Any of these closes the pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {0} below minimum")]
    TooShort(usize),
    #[error("frame length {0} exceeds limit of {}", MAX_FRAME_SIZE)]
    TooLarge(usize),
    #[error("request id {0:#010x} missing flag bit")]
    BadRequestId(u32),
}

/// Parse result
#[derive(Debug)]
pub enum ParseResult {
    /// A full frame was split off the front of the buffer.
    Complete(Frame),
    /// Need more data.
    Incomplete,
    /// Protocol error.
    Error(FrameError),
}

/// Parse one frame from the front of `buffer`.
///
/// On `Complete` the frame's bytes are removed from `buffer`; otherwise
/// `buffer` is unchanged.
pub fn parse(buffer: &mut BytesMut) -> ParseResult {
    if buffer.len() < LENGTH_LEN {
        return ParseResult::Incomplete;
    }

    let length = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if length < ID_LEN {
        return ParseResult::Error(FrameError::TooShort(length));
    }
    if length > MAX_FRAME_SIZE {
        return ParseResult::Error(FrameError::TooLarge(length));
    }

    if buffer.len() < LENGTH_LEN + length {
        buffer.reserve(LENGTH_LEN + length - buffer.len());
        return ParseResult::Incomplete;
    }

    let request_id = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
    if request_id & REQUEST_ID_FLAG == 0 {
        return ParseResult::Error(FrameError::BadRequestId(request_id));
    }

    let mut frame = buffer.split_to(LENGTH_LEN + length);
    frame.advance(LENGTH_LEN + ID_LEN);

    ParseResult::Complete(Frame {
        request_id,
        body: frame,
    })
}
