//! The boundary between the engine and protocol code.
//!
//! The engine knows nothing about message grammar. It hands raw byte
//! batches to a [`ConnectionHandler`] and gives the handler two ways to
//! send: [`ConnContext::write`] on the dispatching reactor thread (tries
//! the socket immediately, queues on pushback) and a cloneable
//! [`WriteHandle`] usable from any thread (stages bytes and wakes the
//! owning reactor).

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::buffer::BufferPool;
use crate::conn::{ConnShared, Outbound};
use crate::error::{EngineError, Result};
use crate::reactor::{ReactorShared, WriteAction};
use crate::registry::ConnId;

/// Protocol callbacks invoked by the owning reactor.
///
/// Every callback runs on the reactor thread that owns the connection, so
/// implementations need no internal locking for per-connection state.
/// Returning `false` from any callback terminates the connection.
pub trait ConnectionHandler: Send {
    /// Called once after the connection is registered with its reactor.
    /// Return false to refuse and close it.
    fn on_connected(&mut self, _ctx: &mut ConnContext<'_>) -> bool {
        true
    }

    /// Called with each batch of freshly read bytes. The engine imposes no
    /// framing; partial and coalesced protocol messages are the handler's
    /// concern. Return false to close the connection.
    fn on_readable(&mut self, buf: &[u8], ctx: &mut ConnContext<'_>) -> bool;

    /// Called on every heartbeat sweep. Return false to close the
    /// connection; other connections in the sweep are unaffected.
    fn on_heartbeat(&mut self, _ctx: &mut ConnContext<'_>) -> bool {
        true
    }

    /// Called after the connection has been deregistered, with its buffers
    /// recycled, just before the socket drops.
    fn on_closed(&mut self, _id: ConnId) {}
}

/// Creates a [`ConnectionHandler`] per accepted connection. Returning
/// `None` refuses the connection; the socket is dropped without ever
/// reaching a reactor.
///
/// Implemented for `FnMut(SocketAddr) -> Option<Box<dyn ConnectionHandler>>`
/// closures.
pub trait HandlerFactory: Send {
    fn create(&mut self, peer: SocketAddr) -> Option<Box<dyn ConnectionHandler>>;
}

impl<F> HandlerFactory for F
where
    F: FnMut(SocketAddr) -> Option<Box<dyn ConnectionHandler>> + Send,
{
    fn create(&mut self, peer: SocketAddr) -> Option<Box<dyn ConnectionHandler>> {
        (self)(peer)
    }
}

/// Result of [`ConnContext::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// All bytes reached the socket.
    Sent,
    /// Some or all bytes are queued; the reactor flushes them on the next
    /// writable event.
    Queued,
    /// The socket failed; the connection will be terminated after this
    /// dispatch.
    Closed,
}

/// Dispatch context handed to [`ConnectionHandler`] callbacks.
pub struct ConnContext<'a> {
    pub(crate) id: ConnId,
    pub(crate) peer: SocketAddr,
    pub(crate) sock: &'a mut TcpStream,
    pub(crate) outbound: &'a mut Outbound,
    pub(crate) conn: &'a Arc<ConnShared>,
    pub(crate) reactor: &'a Arc<ReactorShared>,
    pub(crate) now_millis: i64,
}

impl ConnContext<'_> {
    pub fn conn_id(&self) -> ConnId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Wall clock of the current loop iteration, epoch millis. Cached: every
    /// dispatch in one iteration sees the same value.
    pub fn now_millis(&self) -> i64 {
        self.now_millis
    }

    /// Unsent bytes currently queued for this connection.
    pub fn queued_bytes(&self) -> usize {
        self.outbound.queued_bytes()
    }

    /// Send bytes on the dispatching reactor thread. Tries the socket
    /// immediately when the queue is empty and queues whatever the kernel
    /// does not take; the reactor arms write interest after the dispatch
    /// returns.
    pub fn write(&mut self, bytes: &[u8]) -> SendStatus {
        if self.outbound.failed {
            return SendStatus::Closed;
        }
        if bytes.is_empty() {
            return SendStatus::Sent;
        }
        let pool = &self.reactor.pool;
        // bytes staged by writer handles were queued first; keep FIFO.
        self.outbound.absorb(&self.conn.staging);
        if !self.outbound.is_empty() {
            self.outbound.push_chunked(bytes, pool);
            return SendStatus::Queued;
        }
        let mut written = 0;
        while written < bytes.len() {
            match self.sock.write(&bytes[written..]) {
                Ok(0) => {
                    warn!(conn = %self.id, "wrote 0 bytes, closing");
                    self.outbound.failed = true;
                    return SendStatus::Closed;
                }
                Ok(n) => written += n,
                Err(err) => match err.kind() {
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => break,
                    std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe => {
                        debug!(conn = %self.id, "peer reset during write");
                        self.outbound.failed = true;
                        return SendStatus::Closed;
                    }
                    _ => {
                        warn!(conn = %self.id, error = %err, "write failed");
                        self.outbound.failed = true;
                        return SendStatus::Closed;
                    }
                },
            }
        }
        if written == bytes.len() {
            return SendStatus::Sent;
        }
        self.outbound.push_chunked(&bytes[written..], pool);
        SendStatus::Queued
    }

    /// A cloneable handle for writing to this connection from any thread.
    pub fn writer(&self) -> WriteHandle {
        WriteHandle {
            id: self.id,
            conn: Arc::clone(self.conn),
            reactor: Arc::clone(self.reactor),
        }
    }
}

/// Thread-safe writer for one connection.
///
/// Bytes are copied into pooled buffers, staged on the connection, and the
/// owning reactor is woken to flush them, so wake latency does not depend
/// on the reactor's poll timeout. Order among concurrent writers is
/// unspecified; bytes of a single `write` stay contiguous.
#[derive(Clone)]
pub struct WriteHandle {
    pub(crate) id: ConnId,
    pub(crate) conn: Arc<ConnShared>,
    pub(crate) reactor: Arc<ReactorShared>,
}

impl WriteHandle {
    pub fn conn_id(&self) -> ConnId {
        self.id
    }

    /// True once the connection has been terminated. A racing `write` may
    /// still succeed vacuously; its bytes are dropped with the connection.
    pub fn is_closed(&self) -> bool {
        self.conn.closed.load(Ordering::Acquire)
    }

    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::ConnectionClosed);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let pool: &BufferPool = &self.reactor.pool;
        for chunk in bytes.chunks(pool.buf_capacity()) {
            let mut buf = pool.acquire();
            buf.extend_from_slice(chunk);
            self.conn.staging.push(buf);
        }
        self.reactor.submit_action(WriteAction { conn: self.id });
        Ok(())
    }
}
