//! Load-test request protocol.
//!
//! A request body carries exactly one big-endian u32 at offset 0: the delay,
//! in milliseconds, the server must wait before replying. The reply echoes
//! whatever followed that field, which for requests built here is nothing.

use crate::message::Message;
use rand::Rng;

/// Size of the delay field in bytes.
pub const DELAY_FIELD_LEN: usize = 4;

/// Errors decoding a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Body too short to hold the delay field.
    #[error("malformed message: {len} bytes, need at least {}", DELAY_FIELD_LEN)]
    MalformedMessage { len: usize },
}

/// Prefix `message` with the delay field.
pub fn encode_delay(message: &mut Message, delay_ms: u32) {
    message.insert_u32(delay_ms);
}

/// Remove and return the leading delay field.
///
/// On failure the message is left as it was; the caller decides whether to
/// drop it.
pub fn decode_delay(message: &mut Message) -> Result<u32, CodecError> {
    message.trim_u32().ok_or(CodecError::MalformedMessage {
        len: message.len(),
    })
}

/// Per-request delay selection for client workers.
///
/// Delays are drawn from the upper half of the configured range,
/// `[max / 2, max)`, so pacing stays close to the configured maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayPolicy {
    max_delay_ms: u32,
}

impl DelayPolicy {
    pub fn new(max_delay_ms: u32) -> Self {
        Self { max_delay_ms }
    }

    /// Pick the delay for the next request.
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        if self.max_delay_ms == 0 {
            return 0;
        }
        let low = self.max_delay_ms / 2;
        rng.gen_range(low..self.max_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_delay_round_trip() {
        for delay in [0, 1, 50, 1000, 0x8000_0000, u32::MAX] {
            let mut msg = Message::new();
            encode_delay(&mut msg, delay);
            assert_eq!(msg.len(), DELAY_FIELD_LEN);

            assert_eq!(decode_delay(&mut msg), Ok(delay));
            assert!(msg.is_empty());
        }
    }

    #[test]
    fn test_decode_keeps_trailing_payload() {
        let mut msg = Message::new();
        msg.append_u32(0xDEAD_BEEF);
        encode_delay(&mut msg, 25);

        assert_eq!(decode_delay(&mut msg), Ok(25));
        assert_eq!(msg.body(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_decode_malformed() {
        for len in 0..DELAY_FIELD_LEN {
            let mut short = short_message(len);
            let before = short.body().to_vec();

            assert_eq!(
                decode_delay(&mut short),
                Err(CodecError::MalformedMessage { len })
            );
            assert_eq!(short.body(), &before[..]);
        }
    }

    fn short_message(len: usize) -> Message {
        let body = bytes::BytesMut::from(&[7u8, 8, 9][..len]);
        Message::from_wire(body, None)
    }

    #[test]
    fn test_zero_max_delay_is_zero() {
        let policy = DelayPolicy::new(0);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(policy.choose(&mut rng), 0);
        }
    }

    #[test]
    fn test_delay_within_upper_half() {
        let mut rng = StdRng::seed_from_u64(42);
        for max in [1, 2, 3, 100, 1001, u32::MAX] {
            let policy = DelayPolicy::new(max);
            for _ in 0..1000 {
                let delay = policy.choose(&mut rng);
                assert!(delay >= max / 2, "delay {delay} below {}", max / 2);
                assert!(delay < max, "delay {delay} not below {max}");
            }
        }
    }

    #[test]
    fn test_max_delay_one_always_zero() {
        let policy = DelayPolicy::new(1);
        let mut rng = StdRng::seed_from_u64(9);
        assert!((0..100).all(|_| policy.choose(&mut rng) == 0));
    }
}
