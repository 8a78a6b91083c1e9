//! Asynchronous operation handles.
//!
//! An `Aio` carries at most one outstanding operation (receive, send or
//! sleep). Submitting never blocks: the operation is stored as a future and
//! makes progress only when the owner calls `wait`, which resolves it and
//! records the outcome. The owner then reads the outcome with `result` and
//! any received message with `take_msg`, mirroring a completion callback.
//!
//! One handle is meant to be reused for the whole life of a worker.

use crate::message::Message;
use crate::runtime::TransportError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Future backing an outstanding operation.
///
/// Resolves to the received message, if the operation produces one.
pub(crate) type OpFuture =
    Pin<Box<dyn Future<Output = Result<Option<Message>, TransportError>> + Send>>;

/// Kind of operation in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Recv,
    Send,
    Sleep,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Recv => "recv",
            OpKind::Send => "send",
            OpKind::Sleep => "sleep",
        };
        f.write_str(name)
    }
}

/// Misuse of an `Aio`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AioError {
    /// An operation was submitted while another was still outstanding.
    #[error("{submitted} submitted while {outstanding} is outstanding")]
    Busy {
        outstanding: OpKind,
        submitted: OpKind,
    },
}

/// Submit/complete counters for one `Aio`.
#[derive(Debug, Default)]
pub struct AioStats {
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl AioStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Operations submitted but not yet completed.
    ///
    /// Reads `submitted` before `completed`, so a concurrent reader never
    /// sees more in flight than there actually were.
    pub fn outstanding(&self) -> u64 {
        let submitted = self.submitted();
        submitted.saturating_sub(self.completed())
    }
}

/// Asynchronous operation handle.
pub struct Aio {
    /// Outstanding operation, if any.
    op: Option<(OpKind, OpFuture)>,
    /// Outcome of the last completed operation.
    outcome: Option<Result<(), TransportError>>,
    /// Message slot: input for sends, output for receives.
    msg: Option<Message>,
    stats: Arc<AioStats>,
}

impl Aio {
    pub fn new() -> Self {
        Self {
            op: None,
            outcome: None,
            msg: None,
            stats: Arc::new(AioStats::default()),
        }
    }

    /// Shared handle to this operation's counters.
    pub fn stats(&self) -> Arc<AioStats> {
        Arc::clone(&self.stats)
    }

    /// Check if an operation is outstanding.
    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.op.is_some()
    }

    /// Kind of the outstanding operation.
    pub fn outstanding(&self) -> Option<OpKind> {
        self.op.as_ref().map(|(kind, _)| *kind)
    }

    /// Put a message in the slot, replacing (and freeing) any previous one.
    pub fn set_msg(&mut self, msg: Message) {
        self.msg = Some(msg);
    }

    /// Take the message out of the slot.
    pub fn take_msg(&mut self) -> Option<Message> {
        self.msg.take()
    }

    /// Outcome of the last completed operation.
    ///
    /// Consumes the recorded outcome; a second call reports success.
    pub fn result(&mut self) -> Result<(), TransportError> {
        self.outcome.take().unwrap_or(Ok(()))
    }

    /// Start a timer that completes after `duration`. Sleeps never fail.
    pub fn sleep(&mut self, duration: Duration) -> Result<(), AioError> {
        self.submit(
            OpKind::Sleep,
            Box::pin(async move {
                tokio::time::sleep(duration).await;
                Ok(None)
            }),
        )
    }

    /// Make `future` the outstanding operation.
    pub(crate) fn submit(&mut self, kind: OpKind, future: OpFuture) -> Result<(), AioError> {
        if let Some(outstanding) = self.outstanding() {
            return Err(AioError::Busy {
                outstanding,
                submitted: kind,
            });
        }
        self.outcome = None;
        self.op = Some((kind, future));
        self.stats.submitted.fetch_add(1, Ordering::AcqRel);
        trace!(op = %kind, "Operation submitted");
        Ok(())
    }

    /// Drive the outstanding operation to completion.
    ///
    /// Returns the kind of the completed operation, or `None` if nothing
    /// was outstanding.
    pub async fn wait(&mut self) -> Option<OpKind> {
        let (kind, future) = self.op.take()?;
        let outcome = future.await;
        self.stats.completed.fetch_add(1, Ordering::AcqRel);

        self.outcome = Some(match outcome {
            Ok(Some(msg)) => {
                self.msg = Some(msg);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        });
        trace!(op = %kind, "Operation completed");
        Some(kind)
    }
}

impl Default for Aio {
    fn default() -> Self {
        Self::new()
    }
}
