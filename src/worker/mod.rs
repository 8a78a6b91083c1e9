//! Load-test workers.
//!
//! A worker is one independently sequenced participant bound to one logical
//! connection. It owns a phase, its context, one reusable `Aio` and at most
//! one pending message. `step` performs the action for the current phase,
//! which always ends by submitting exactly one operation; `drive` waits for
//! that operation and calls `step` again, forever.

pub mod client;
pub mod server;

pub use client::ClientWorker;
pub use server::ServerWorker;

use crate::runtime::{Aio, AioError, OpKind, TransportError};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Failure of a single worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// An operation completed with a transport error.
    #[error("{op}: {source}")]
    Transport {
        op: OpKind,
        #[source]
        source: TransportError,
    },
    /// A receive completed without a message.
    #[error("{0}: completed without a message")]
    MissingMessage(OpKind),
    /// The state machine broke the one-operation rule.
    #[error(transparent)]
    Aio(#[from] AioError),
    /// A step returned without submitting an operation.
    #[error("worker {0} stalled with no operation outstanding")]
    Stalled(usize),
}

impl WorkerError {
    pub(crate) fn transport(op: OpKind, source: TransportError) -> Self {
        Self::Transport { op, source }
    }
}

/// A continuation state machine.
pub trait Worker: Send + 'static {
    /// Worker index within its batch.
    fn id(&self) -> usize;

    /// The worker's operation handle.
    fn aio(&mut self) -> &mut Aio;

    /// Perform the action for the current phase.
    ///
    /// Called once to start the worker and then once per completion.
    fn step(&mut self) -> Result<(), WorkerError>;
}

/// Run `worker` until it fails.
///
/// Starts the worker with one `step`, then feeds it every completion.
pub async fn drive<W: Worker>(mut worker: W) -> Result<(), WorkerError> {
    worker.step()?;
    loop {
        let Some(op) = worker.aio().wait().await else {
            return Err(WorkerError::Stalled(worker.id()));
        };
        trace!(worker = worker.id(), op = %op, "Completion");
        worker.step()?;
    }
}

/// Round-trip liveness signal.
pub trait Progress: Send + Sync + 'static {
    /// One round trip completed.
    fn tick(&self);
}

/// Prints one `.` per round trip on stdout, flushed immediately.
#[derive(Debug, Default)]
pub struct DotProgress;

impl Progress for DotProgress {
    fn tick(&self) {
        write_dot(&mut std::io::stdout().lock());
    }
}

fn write_dot<W: Write>(out: &mut W) {
    if let Err(e) = out.write_all(b".").and_then(|()| out.flush()) {
        trace!(error = %e, "Progress write failed");
    }
}

/// Counters shared by all workers of a role.
#[derive(Debug, Default)]
pub struct Counters {
    /// Client: replies received. Server: replies sent.
    round_trips: AtomicU64,
    /// Server only: requests dropped for a missing delay field.
    malformed: AtomicU64,
}

impl Counters {
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_round_trip(&self) {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }
}
