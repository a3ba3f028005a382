use std::io;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the engine. Only setup failures and writes to dead
/// connections propagate; per-connection I/O faults are contained by the
/// owning reactor (the connection is terminated, the loop keeps running)
/// and transient accept failures are logged inside the accept loop.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The listener could not be created or bound. Fatal for startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },

    /// `bind` was called while a listener is already active.
    #[error("listener is already bound")]
    AlreadyBound,

    /// `open` was called on a reactor whose multiplexer already exists.
    #[error("reactor multiplexer is already open")]
    AlreadyOpen,

    /// Creating the readiness multiplexer or registering a socket with it
    /// failed.
    #[error("readiness multiplexer error: {0}")]
    Poll(#[source] io::Error),

    /// Write attempted on a connection that has been terminated.
    #[error("connection is closed")]
    ConnectionClosed,

    #[error("invalid configuration: {0}")]
    Config(&'static str),
}
