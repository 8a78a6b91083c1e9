//! Request/reply transport runtime.
//!
//! Built on tokio, exposing a completion-style interface to workers:
//! - `Aio`: one reusable asynchronous operation handle
//! - `RepSocket` / `RepContext`: reply role (server side)
//! - `ReqSocket` / `ReqContext`: request role (client side)
//!
//! Sockets own a set of pipes (TCP connections, see `pipe`). Contexts are
//! independent logical connections multiplexed over a socket's pipes.

pub mod aio;
pub mod endpoint;
mod frame;
mod pipe;
pub mod rep;
pub mod req;
mod token;

pub use aio::{Aio, AioError, AioStats, OpKind};
pub use endpoint::Endpoint;
pub(crate) use pipe::PipeId;
pub use rep::{RepContext, RepSocket};
pub use req::{ReqContext, ReqSocket};

use std::io;
use std::net::SocketAddr;

/// Transport failures reported by socket setup and by operation completions.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The pipe or socket behind the operation has closed.
    #[error("connection closed")]
    Closed,
    /// Operation not valid in the context's current state.
    #[error("incorrect state: {0}")]
    State(&'static str),
    /// Send submitted without a message in the `Aio`.
    #[error("no message to send")]
    NoMessage,
    /// Endpoint host did not resolve to any address.
    #[error("no address found for {0}")]
    Unresolved(String),
    /// The socket is at its pipe limit.
    #[error("too many pipes")]
    PipeLimit,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Resolve an endpoint to its first socket address.
pub(crate) async fn resolve(endpoint: &Endpoint) -> Result<SocketAddr, TransportError> {
    tokio::net::lookup_host(endpoint.authority())
        .await?
        .next()
        .ok_or_else(|| TransportError::Unresolved(endpoint.to_string()))
}
