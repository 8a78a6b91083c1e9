//! Byte messages exchanged over request/reply sockets.
//!
//! A `Message` is an owned body buffer plus, for messages received on a
//! reply socket, the route needed to send the answer back to the requester.
//! Dropping a message frees it; handing it to an `Aio` moves it.

use crate::runtime::PipeId;
use bytes::{Buf, BufMut, BytesMut};

/// Where a received request came from.
///
/// Attached by the reply socket on receive and consumed on send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Pipe (connection) the request arrived on.
    pub pipe_id: PipeId,
    /// Request id chosen by the requester.
    pub request_id: u32,
}

/// An owned message.
#[derive(Debug, Default)]
pub struct Message {
    body: BytesMut,
    route: Option<Route>,
}

impl Message {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message from a received body.
    pub(crate) fn from_wire(body: BytesMut, route: Option<Route>) -> Self {
        Self { body, route }
    }

    /// Message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body length in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Check if the body is empty.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Append a big-endian u32 to the end of the body.
    #[cfg(test)]
    pub fn append_u32(&mut self, value: u32) {
        self.body.put_u32(value);
    }

    /// Insert a big-endian u32 at the front of the body.
    pub fn insert_u32(&mut self, value: u32) {
        let mut body = BytesMut::with_capacity(self.body.len() + 4);
        body.put_u32(value);
        body.extend_from_slice(&self.body);
        self.body = body;
    }

    /// Remove a big-endian u32 from the front of the body.
    ///
    /// Returns `None` and leaves the body untouched if fewer than 4 bytes
    /// are present.
    pub fn trim_u32(&mut self) -> Option<u32> {
        if self.body.len() < 4 {
            return None;
        }
        Some(self.body.get_u32())
    }

    pub(crate) fn take_route(&mut self) -> Option<Route> {
        self.route.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_insert_order() {
        let mut msg = Message::new();
        msg.append_u32(2);
        msg.insert_u32(1);
        msg.append_u32(3);

        assert_eq!(msg.len(), 12);
        assert_eq!(msg.trim_u32(), Some(1));
        assert_eq!(msg.trim_u32(), Some(2));
        assert_eq!(msg.trim_u32(), Some(3));
        assert!(msg.is_empty());
    }

    #[test]
    fn test_trim_short_leaves_body() {
        let mut msg = Message::from_wire(BytesMut::from(&[0xAA, 0xBB, 0xCC][..]), None);

        assert_eq!(msg.trim_u32(), None);
        assert_eq!(msg.body(), &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_big_endian_layout() {
        let mut msg = Message::new();
        msg.insert_u32(0x0102_0304);
        assert_eq!(msg.body(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_route_taken_once() {
        let route = Route {
            pipe_id: PipeId::new(3, 9),
            request_id: 0x8000_0007,
        };
        let mut msg = Message::from_wire(BytesMut::new(), Some(route));

        assert_eq!(msg.take_route(), Some(route));
        assert_eq!(msg.take_route(), None);
    }
}
