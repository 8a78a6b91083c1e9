//! Server worker: receive a request, sleep for the delay it names, reply.
//!
//! ```text
//! Start ──► Receiving ──► Sleeping ──► Sending ─┐
//!              ▲   │ malformed: drop, recv again │
//!              └───┴─────────────────────────────┘
//! ```

use crate::message::Message;
use crate::protocol::decode_delay;
use crate::runtime::{Aio, OpKind, RepContext};
use crate::worker::{Counters, Worker, WorkerError};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Next action of a server worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    /// Not started; the first step submits a receive.
    Start,
    /// Waiting for a request.
    Receiving,
    /// Holding a decoded request while the delay runs.
    Sleeping,
    /// Waiting for the reply send to complete.
    Sending,
}

pub struct ServerWorker {
    id: usize,
    phase: ServerPhase,
    ctx: RepContext,
    aio: Aio,
    /// Request body (minus the delay field) waiting to be echoed.
    pending: Option<Message>,
    counters: Arc<Counters>,
}

impl ServerWorker {
    pub fn new(id: usize, ctx: RepContext, counters: Arc<Counters>) -> Self {
        Self {
            id,
            phase: ServerPhase::Start,
            ctx,
            aio: Aio::new(),
            pending: None,
            counters,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> ServerPhase {
        self.phase
    }

    fn start_recv(&mut self) -> Result<(), WorkerError> {
        self.phase = ServerPhase::Receiving;
        self.ctx.recv(&mut self.aio)?;
        Ok(())
    }
}

impl Worker for ServerWorker {
    fn id(&self) -> usize {
        self.id
    }

    fn aio(&mut self) -> &mut Aio {
        &mut self.aio
    }

    fn step(&mut self) -> Result<(), WorkerError> {
        match self.phase {
            ServerPhase::Start => self.start_recv(),

            ServerPhase::Receiving => {
                self.aio
                    .result()
                    .map_err(|e| WorkerError::transport(OpKind::Recv, e))?;
                let mut msg = self
                    .aio
                    .take_msg()
                    .ok_or(WorkerError::MissingMessage(OpKind::Recv))?;

                match decode_delay(&mut msg) {
                    Ok(delay) => {
                        self.pending = Some(msg);
                        self.phase = ServerPhase::Sleeping;
                        self.aio.sleep(Duration::from_millis(u64::from(delay)))?;
                        Ok(())
                    }
                    Err(e) => {
                        debug!(worker = self.id, error = %e, "Dropping request");
                        self.counters.record_malformed();
                        drop(msg);
                        self.start_recv()
                    }
                }
            }

            ServerPhase::Sleeping => {
                let msg = self
                    .pending
                    .take()
                    .ok_or(WorkerError::MissingMessage(OpKind::Sleep))?;
                self.phase = ServerPhase::Sending;
                self.aio.set_msg(msg);
                self.ctx.send(&mut self.aio)?;
                Ok(())
            }

            ServerPhase::Sending => {
                self.aio
                    .result()
                    .map_err(|e| WorkerError::transport(OpKind::Send, e))?;
                self.counters.record_round_trip();
                self.start_recv()
            }
        }
    }
}
