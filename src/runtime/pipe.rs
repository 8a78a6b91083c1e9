//! Pipes: the TCP connections underneath a socket.
//!
//! Each pipe has a reader task that decodes frames and hands them to the
//! owning socket, and a writer task that drains an unbounded queue of
//! encoded frames. Writes are queued, so a send completes as soon as its
//! frame is handed to the pipe.

use crate::runtime::frame::{self, Frame, FrameError, ParseResult};
use bytes::BytesMut;
use parking_lot::Mutex;
use slab::Slab;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Maximum number of pipes per socket.
pub const MAX_PIPES: usize = 64 * 1024;

/// Read buffer size
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Identity of one pipe for its whole life.
///
/// Registry slots are reused once a pipe closes; the generation tells a
/// closed pipe apart from a later pipe in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeId {
    key: usize,
    generation: u64,
}

#[cfg(test)]
impl PipeId {
    pub(crate) fn new(key: usize, generation: u64) -> Self {
        Self { key, generation }
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.key, self.generation)
    }
}

/// A live pipe.
#[derive(Debug)]
pub struct Pipe {
    generation: u64,
    /// Queue feeding the writer task.
    tx: mpsc::UnboundedSender<BytesMut>,
}

impl Pipe {
    /// Queue an encoded frame for writing.
    ///
    /// Returns false if the writer has already stopped.
    pub fn send(&self, frame: BytesMut) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// Registry of live pipes using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. Lookups by a stale
/// `PipeId` miss even when its slot has been reused.
pub struct PipeRegistry {
    pipes: Slab<Pipe>,
    max_pipes: usize,
    next_generation: u64,
}

impl PipeRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_pipes: usize) -> Self {
        Self {
            pipes: Slab::new(),
            max_pipes,
            next_generation: 0,
        }
    }

    /// Insert a new pipe fed by `tx`.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, tx: mpsc::UnboundedSender<BytesMut>) -> Option<PipeId> {
        if self.pipes.len() >= self.max_pipes {
            return None;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let key = self.pipes.insert(Pipe { generation, tx });
        Some(PipeId { key, generation })
    }

    /// Get a reference to a pipe.
    pub fn get(&self, id: PipeId) -> Option<&Pipe> {
        self.pipes
            .get(id.key)
            .filter(|pipe| pipe.generation == id.generation)
    }

    /// Remove a pipe from the registry.
    pub fn remove(&mut self, id: PipeId) -> Option<Pipe> {
        self.get(id)?;
        self.pipes.try_remove(id.key)
    }

    /// Check if a pipe exists.
    #[cfg(test)]
    pub fn contains(&self, id: PipeId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live pipes.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    /// Check if there are no pipes.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }

    /// Id of the `n`-th live pipe, wrapping around.
    pub fn nth_id(&self, n: usize) -> Option<PipeId> {
        if self.pipes.is_empty() {
            return None;
        }
        self.pipes
            .iter()
            .nth(n % self.pipes.len())
            .map(|(key, pipe)| PipeId {
                key,
                generation: pipe.generation,
            })
    }
}

/// Socket-side hooks invoked by pipe tasks.
pub trait PipeHandler: Send + Sync + 'static {
    /// Registry the pipes of this socket live in.
    fn pipes(&self) -> &Mutex<PipeRegistry>;

    /// A frame arrived on `pipe_id`.
    fn on_frame(&self, pipe_id: PipeId, frame: Frame);

    /// `pipe_id` has closed and left the registry.
    fn on_close(&self, pipe_id: PipeId);
}

/// Errors that end a pipe.
#[derive(Debug, thiserror::Error)]
enum PipeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Register `stream` as a new pipe and start its I/O tasks.
///
/// Returns the pipe id, or `None` if the socket is at its pipe limit (the
/// stream is dropped).
pub fn attach<H: PipeHandler>(stream: TcpStream, handler: Arc<H>) -> Option<PipeId> {
    let peer = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            debug!(error = %e, "Pipe without peer address");
            return None;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let pipe_id = match handler.pipes().lock().insert(tx) {
        Some(id) => id,
        None => {
            warn!(peer = %peer, "Pipe limit reached, closing");
            return None;
        }
    };

    let (reader, writer) = stream.into_split();
    tokio::spawn(write_loop(pipe_id, writer, rx));
    tokio::spawn(async move {
        match read_loop(pipe_id, reader, &*handler).await {
            Ok(()) => debug!(%pipe_id, peer = %peer, "Pipe closed by peer"),
            Err(e) => debug!(%pipe_id, peer = %peer, error = %e, "Pipe failed"),
        }
        // Dropping the registry entry drops the queue sender, which stops
        // the writer once it has drained.
        handler.pipes().lock().remove(pipe_id);
        handler.on_close(pipe_id);
    });

    debug!(%pipe_id, peer = %peer, "Pipe attached");
    Some(pipe_id)
}

async fn read_loop<H: PipeHandler>(
    pipe_id: PipeId,
    mut reader: OwnedReadHalf,
    handler: &H,
) -> Result<(), PipeError> {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        loop {
            match frame::parse(&mut buf) {
                ParseResult::Complete(frame) => handler.on_frame(pipe_id, frame),
                ParseResult::Incomplete => break,
                ParseResult::Error(e) => return Err(e.into()),
            }
        }

        if reader.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
    }
}

async fn write_loop(
    pipe_id: PipeId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<BytesMut>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(%pipe_id, error = %e, "Pipe write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
