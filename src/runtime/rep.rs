//! Reply-role socket.
//!
//! One listener accepts any number of pipes. Requests from every pipe land
//! in a single queue; each `RepContext` takes the next request from it, so
//! contexts share the incoming load. A received message remembers its route,
//! and sending it back on any context delivers the reply to the requester.

use crate::message::{Message, Route};
use crate::runtime::aio::{Aio, AioError, OpKind};
use crate::runtime::endpoint::Endpoint;
use crate::runtime::frame::Frame;
use crate::runtime::pipe::{self, PipeHandler, PipeId, PipeRegistry, MAX_PIPES};
use crate::runtime::{resolve, TransportError};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Listen backlog
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// A request waiting for a context.
struct Request {
    route: Route,
    body: BytesMut,
}

pub(crate) struct RepCore {
    pipes: Mutex<PipeRegistry>,
    incoming: mpsc::UnboundedSender<Request>,
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<Request>>,
}

impl PipeHandler for RepCore {
    fn pipes(&self) -> &Mutex<PipeRegistry> {
        &self.pipes
    }

    fn on_frame(&self, pipe_id: PipeId, frame: Frame) {
        let route = Route {
            pipe_id,
            request_id: frame.request_id,
        };
        // The core holds the receiver, so the queue outlives every pipe.
        let _ = self.incoming.send(Request {
            route,
            body: frame.body,
        });
    }

    fn on_close(&self, pipe_id: PipeId) {
        debug!(%pipe_id, "Reply pipe removed");
    }
}

/// Reply socket bound to one listening endpoint.
pub struct RepSocket {
    core: Arc<RepCore>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl RepSocket {
    /// Bind `endpoint` and start accepting pipes.
    pub async fn listen(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let addr = resolve(endpoint).await?;
        let listener = TcpListener::from_std(create_listener(addr)?)?;
        let local_addr = listener.local_addr()?;

        let (incoming, queue) = mpsc::unbounded_channel();
        let core = Arc::new(RepCore {
            pipes: Mutex::new(PipeRegistry::new(MAX_PIPES)),
            incoming,
            queue: tokio::sync::Mutex::new(queue),
        });

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&core)));
        info!(address = %local_addr, "Reply socket listening");

        Ok(Self {
            core,
            local_addr,
            accept_task,
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open a new logical connection on this socket.
    pub fn context(&self) -> RepContext {
        RepContext {
            core: Arc::clone(&self.core),
        }
    }

    /// Number of connected pipes.
    #[cfg(test)]
    pub fn pipe_count(&self) -> usize {
        self.core.pipes.lock().len()
    }
}

impl Drop for RepSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Logical reply connection.
pub struct RepContext {
    core: Arc<RepCore>,
}

impl RepContext {
    /// Submit a receive; completes with the next request in the `Aio`.
    pub fn recv(&mut self, aio: &mut Aio) -> Result<(), AioError> {
        let core = Arc::clone(&self.core);
        aio.submit(
            OpKind::Recv,
            Box::pin(async move {
                let request = core
                    .queue
                    .lock()
                    .await
                    .recv()
                    .await
                    .ok_or(TransportError::Closed)?;
                Ok(Some(Message::from_wire(request.body, Some(request.route))))
            }),
        )
    }

    /// Submit a send of the message held by `aio` back to its requester.
    pub fn send(&mut self, aio: &mut Aio) -> Result<(), AioError> {
        let outcome = self.reply(aio.take_msg());
        aio.submit(OpKind::Send, Box::pin(future::ready(outcome)))
    }

    fn reply(&self, msg: Option<Message>) -> Result<Option<Message>, TransportError> {
        let mut msg = msg.ok_or(TransportError::NoMessage)?;
        let route = msg
            .take_route()
            .ok_or(TransportError::State("no request to reply to"))?;

        let frame = Frame::encode(route.request_id, msg.body());
        let pipes = self.core.pipes.lock();
        match pipes.get(route.pipe_id) {
            Some(pipe) if pipe.send(frame) => {}
            _ => debug!(pipe_id = %route.pipe_id, "Requester gone, reply dropped"),
        }
        Ok(None)
    }
}

async fn accept_loop(listener: TcpListener, core: Arc<RepCore>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                pipe::attach(stream, Arc::clone(&core));
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
