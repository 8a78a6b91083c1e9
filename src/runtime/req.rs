//! Request-role socket.
//!
//! Every `dial` adds one pipe. Contexts are spread over the pipes
//! round-robin in the order they are opened, so dialing once per context
//! gives each context a connection of its own. A context has at most one
//! request in flight; its reply is matched by request id.

use crate::message::Message;
use crate::runtime::aio::{Aio, AioError, OpKind};
use crate::runtime::endpoint::Endpoint;
use crate::runtime::frame::Frame;
use crate::runtime::pipe::{self, PipeHandler, PipeId, PipeRegistry, MAX_PIPES};
use crate::runtime::token::RequestTable;
use crate::runtime::{resolve, TransportError};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::debug;

pub(crate) struct ReqCore {
    pipes: Mutex<PipeRegistry>,
    requests: Mutex<RequestTable>,
    next_slot: AtomicUsize,
}

impl PipeHandler for ReqCore {
    fn pipes(&self) -> &Mutex<PipeRegistry> {
        &self.pipes
    }

    fn on_frame(&self, pipe_id: PipeId, frame: Frame) {
        let request_id = frame.request_id;
        if !self.requests.lock().complete(pipe_id, request_id, frame.body) {
            debug!(%pipe_id, request_id, "Unmatched reply dropped");
        }
    }

    fn on_close(&self, pipe_id: PipeId) {
        let failed = self.requests.lock().fail_pipe(pipe_id);
        debug!(%pipe_id, failed, "Request pipe removed");
    }
}

/// Request socket.
pub struct ReqSocket {
    core: Arc<ReqCore>,
}

impl ReqSocket {
    pub fn new() -> Self {
        Self {
            core: Arc::new(ReqCore {
                pipes: Mutex::new(PipeRegistry::new(MAX_PIPES)),
                requests: Mutex::new(RequestTable::default()),
                next_slot: AtomicUsize::new(0),
            }),
        }
    }

    /// Connect one new pipe to `endpoint`, returning its id.
    pub async fn dial(&self, endpoint: &Endpoint) -> Result<PipeId, TransportError> {
        let addr = resolve(endpoint).await?;
        let stream = TcpStream::connect(addr).await?;
        pipe::attach(stream, Arc::clone(&self.core)).ok_or(TransportError::PipeLimit)
    }

    /// Open a new logical connection on this socket.
    pub fn context(&self) -> ReqContext {
        ReqContext {
            core: Arc::clone(&self.core),
            slot: self.core.next_slot.fetch_add(1, Ordering::Relaxed),
            pending: None,
        }
    }

    /// Number of connected pipes.
    #[cfg(test)]
    pub fn pipe_count(&self) -> usize {
        self.core.pipes.lock().len()
    }
}

impl Default for ReqSocket {
    fn default() -> Self {
        Self::new()
    }
}

/// Logical request connection.
pub struct ReqContext {
    core: Arc<ReqCore>,
    /// Position used to pick a pipe among the live ones.
    slot: usize,
    /// Request id and reply receiver of the request in flight.
    pending: Option<(u32, oneshot::Receiver<BytesMut>)>,
}

impl ReqContext {
    /// Submit a send of the message held by `aio` as a new request.
    ///
    /// A request still awaiting its reply is abandoned.
    pub fn send(&mut self, aio: &mut Aio) -> Result<(), AioError> {
        let outcome = self.start_request(aio.take_msg());
        aio.submit(OpKind::Send, Box::pin(future::ready(outcome)))
    }

    /// Submit a receive of the reply to the last request sent.
    pub fn recv(&mut self, aio: &mut Aio) -> Result<(), AioError> {
        match self.pending.take() {
            Some((_, reply)) => aio.submit(
                OpKind::Recv,
                Box::pin(async move {
                    let body = reply.await.map_err(|_| TransportError::Closed)?;
                    Ok(Some(Message::from_wire(body, None)))
                }),
            ),
            None => aio.submit(
                OpKind::Recv,
                Box::pin(future::ready(Err(TransportError::State(
                    "no request pending",
                )))),
            ),
        }
    }

    fn start_request(&mut self, msg: Option<Message>) -> Result<Option<Message>, TransportError> {
        let msg = msg.ok_or(TransportError::NoMessage)?;

        if let Some((abandoned, _)) = self.pending.take() {
            self.core.requests.lock().cancel(abandoned);
        }

        // Hold the registry while registering so a concurrent close of the
        // chosen pipe either precedes the lookup or fails this request.
        let pipes = self.core.pipes.lock();
        let pipe_id = pipes.nth_id(self.slot).ok_or(TransportError::Closed)?;
        let pipe = pipes.get(pipe_id).ok_or(TransportError::Closed)?;

        let (request_id, reply) = self.core.requests.lock().register(pipe_id);
        if !pipe.send(Frame::encode(request_id, msg.body())) {
            self.core.requests.lock().cancel(request_id);
            return Err(TransportError::Closed);
        }

        self.pending = Some((request_id, reply));
        Ok(None)
    }
}
