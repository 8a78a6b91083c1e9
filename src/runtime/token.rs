//! Request id tracking for reply correlation.
//!
//! Each request sent by a client context gets an id that identifies the
//! waiting context when the reply frame arrives. Ids come from a running
//! 31-bit sequence with the frame flag bit set, so an id is not handed out
//! again until the sequence wraps.

use crate::runtime::frame::REQUEST_ID_FLAG;
use crate::runtime::pipe::PipeId;
use bytes::BytesMut;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// A request awaiting its reply.
#[derive(Debug)]
struct PendingRequest {
    /// Pipe the request was written to.
    pipe_id: PipeId,
    /// Completion for the waiting context.
    reply: oneshot::Sender<BytesMut>,
}

/// Table of in-flight requests with O(1) lookup.
#[derive(Debug, Default)]
pub struct RequestTable {
    pending: HashMap<u32, PendingRequest>,
    next_seq: u32,
}

impl RequestTable {
    /// Register a request sent on `pipe_id`.
    ///
    /// Returns the request id to put on the wire and the receiver that
    /// completes when the reply arrives.
    pub fn register(&mut self, pipe_id: PipeId) -> (u32, oneshot::Receiver<BytesMut>) {
        let request_id = self.next_free_id();
        let (reply, rx) = oneshot::channel();
        self.pending
            .insert(request_id, PendingRequest { pipe_id, reply });
        (request_id, rx)
    }

    /// Deliver a reply body that arrived on `pipe_id` to the request with id
    /// `request_id`.
    ///
    /// Returns false if no such request is pending on that pipe (late,
    /// unknown or misrouted reply).
    pub fn complete(&mut self, pipe_id: PipeId, request_id: u32, body: BytesMut) -> bool {
        match self.pending.get(&request_id) {
            Some(request) if request.pipe_id == pipe_id => {}
            _ => return false,
        }
        match self.pending.remove(&request_id) {
            Some(request) => request.reply.send(body).is_ok(),
            None => false,
        }
    }

    /// Forget a request without delivering anything.
    pub fn cancel(&mut self, request_id: u32) {
        self.pending.remove(&request_id);
    }

    /// Drop every request waiting on `pipe_id`; their receivers observe
    /// the pipe as closed.
    ///
    /// Returns the number of failed requests.
    pub fn fail_pipe(&mut self, pipe_id: PipeId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, request| request.pipe_id != pipe_id);
        before - self.pending.len()
    }

    /// Number of in-flight requests.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if no requests are in flight.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn next_free_id(&mut self) -> u32 {
        loop {
            let request_id = self.next_seq | REQUEST_ID_FLAG;
            self.next_seq = self.next_seq.wrapping_add(1) & !REQUEST_ID_FLAG;
            if !self.pending.contains_key(&request_id) {
                return request_id;
            }
        }
    }
}
