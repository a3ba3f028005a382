//! Per-connection state owned by a reactor.
//!
//! A connection's outbound side is a FIFO of pooled buffers plus a resume
//! cursor into the front buffer, so a partially written buffer picks up
//! exactly where the kernel stopped. Bytes written from other threads land
//! in the lock-free staging queue of [`ConnShared`] and are absorbed into
//! the owned queue by the reactor before flushing, which keeps the hot
//! write path single-threaded.

use crossbeam::queue::SegQueue;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::buffer::{BufferPool, PooledBuf};
use crate::handler::{ConnContext, ConnectionHandler};
use crate::reactor::ReactorShared;
use crate::registry::ConnId;

/// An accepted, configured connection on its way from the acceptor to the
/// reactor chosen by the distributor.
pub struct NewConnection {
    pub(crate) stream: TcpStream,
    pub(crate) peer: SocketAddr,
    pub(crate) handler: Box<dyn ConnectionHandler>,
}

impl NewConnection {
    /// `stream` must already be non-blocking; the acceptor configures
    /// sockets before handing them over.
    pub fn new(stream: TcpStream, peer: SocketAddr, handler: Box<dyn ConnectionHandler>) -> Self {
        Self {
            stream,
            peer,
            handler,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

/// Connection state reachable from other threads: the write staging queue
/// and the closed flag checked by [`crate::WriteHandle`].
pub(crate) struct ConnShared {
    pub(crate) staging: SegQueue<PooledBuf>,
    pub(crate) closed: AtomicBool,
}

impl ConnShared {
    pub(crate) fn new() -> Self {
        Self {
            staging: SegQueue::new(),
            closed: AtomicBool::new(false),
        }
    }
}

//====================================================================================
//            Outbound
//====================================================================================

/// Result of one flush attempt against a non-blocking socket.
#[derive(PartialEq, Eq, Debug)]
pub(crate) enum FlushResult {
    /// Queue fully drained.
    Flushed,
    /// Socket would block with bytes still queued; write interest needed.
    Partial,
    /// Write error; terminate the connection.
    Closed,
}

/// FIFO write queue of pooled buffers with a resume cursor into the front
/// buffer. Buffers are recycled into the pool the moment they are fully
/// written.
pub(crate) struct Outbound {
    queue: std::collections::VecDeque<PooledBuf>,
    cursor: usize,       // bytes of queue.front() already written
    queued_bytes: usize, // unsent bytes across all queued buffers
    pub(crate) failed: bool,
}

impl Outbound {
    pub(crate) fn new() -> Self {
        Self {
            queue: std::collections::VecDeque::new(),
            cursor: 0,
            queued_bytes: 0,
            failed: false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub(crate) fn push(&mut self, buf: PooledBuf) {
        self.queued_bytes += buf.len();
        self.queue.push_back(buf);
    }

    /// Copy `bytes` into pool buffers appended to the queue.
    pub(crate) fn push_chunked(&mut self, bytes: &[u8], pool: &BufferPool) {
        for chunk in bytes.chunks(pool.buf_capacity()) {
            let mut buf = pool.acquire();
            buf.extend_from_slice(chunk);
            self.push(buf);
        }
    }

    /// Move everything staged by other threads into the owned queue,
    /// preserving arrival order.
    pub(crate) fn absorb(&mut self, staging: &SegQueue<PooledBuf>) {
        while let Some(buf) = staging.pop() {
            self.push(buf);
        }
    }

    /// Write queued buffers until drained or the socket pushes back.
    pub(crate) fn flush(&mut self, sock: &mut TcpStream, pool: &BufferPool) -> FlushResult {
        while let Some(front) = self.queue.front() {
            let pending = front.len() - self.cursor;
            let n = match sock.write(&front.as_slice()[self.cursor..]) {
                Ok(0) => {
                    warn!(sock = ?sock, "wrote 0 bytes, closing");
                    self.failed = true;
                    return FlushResult::Closed;
                }
                Ok(n) => n,
                Err(err) => {
                    return match err.kind() {
                        std::io::ErrorKind::WouldBlock => FlushResult::Partial,
                        // not an error; retry on the next writable event.
                        std::io::ErrorKind::Interrupted => FlushResult::Partial,
                        std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::BrokenPipe => {
                            debug!(sock = ?sock, "peer reset during flush");
                            self.failed = true;
                            FlushResult::Closed
                        }
                        _ => {
                            warn!(sock = ?sock, error = %err, "write failed");
                            self.failed = true;
                            FlushResult::Closed
                        }
                    };
                }
            };
            self.queued_bytes -= n;
            self.cursor += n;
            if n < pending {
                continue; // front buffer partially taken, try again
            }
            self.cursor = 0;
            if let Some(done) = self.queue.pop_front() {
                pool.release(done);
            }
        }
        FlushResult::Flushed
    }

    /// Hand every queued buffer back to the pool.
    pub(crate) fn recycle_into(&mut self, pool: &BufferPool) {
        self.cursor = 0;
        self.queued_bytes = 0;
        while let Some(buf) = self.queue.pop_front() {
            pool.release(buf);
        }
    }
}

//====================================================================================
//            ManagedConn
//====================================================================================

/// A registered connection: socket, protocol handler and write queue, kept
/// as separate fields so dispatch can borrow the handler and the I/O state
/// at the same time.
pub(crate) struct ManagedConn {
    pub(crate) sock: TcpStream,
    pub(crate) peer: SocketAddr,
    pub(crate) handler: Box<dyn ConnectionHandler>,
    pub(crate) outbound: Outbound,
    pub(crate) shared: Arc<ConnShared>,
    pub(crate) interested_writable: bool,
}

impl ManagedConn {
    pub(crate) fn new(
        sock: TcpStream,
        peer: SocketAddr,
        handler: Box<dyn ConnectionHandler>,
    ) -> Self {
        Self {
            sock,
            peer,
            handler,
            outbound: Outbound::new(),
            shared: Arc::new(ConnShared::new()),
            interested_writable: false,
        }
    }

    /// Absorb staged buffers and flush the owned queue.
    pub(crate) fn pump_writes(&mut self, pool: &BufferPool) -> FlushResult {
        self.outbound.absorb(&self.shared.staging);
        self.outbound.flush(&mut self.sock, pool)
    }

    /// Recycle every queued buffer at termination time. Buffers staged
    /// after this point drop with the last writer handle instead of
    /// returning to the pool.
    pub(crate) fn recycle_buffers(&mut self, pool: &BufferPool) {
        self.outbound.absorb(&self.shared.staging);
        self.outbound.recycle_into(pool);
    }

    pub(crate) fn dispatch_connected(
        &mut self,
        id: ConnId,
        reactor: &Arc<ReactorShared>,
        now: i64,
    ) -> bool {
        let Self {
            sock,
            peer,
            handler,
            outbound,
            shared,
            ..
        } = self;
        let mut ctx = ConnContext {
            id,
            peer: *peer,
            sock: &mut *sock,
            outbound: &mut *outbound,
            conn: &*shared,
            reactor,
            now_millis: now,
        };
        let keep = handler.on_connected(&mut ctx);
        keep && !outbound.failed
    }

    pub(crate) fn dispatch_heartbeat(
        &mut self,
        id: ConnId,
        reactor: &Arc<ReactorShared>,
        now: i64,
    ) -> bool {
        let Self {
            sock,
            peer,
            handler,
            outbound,
            shared,
            ..
        } = self;
        let mut ctx = ConnContext {
            id,
            peer: *peer,
            sock: &mut *sock,
            outbound: &mut *outbound,
            conn: &*shared,
            reactor,
            now_millis: now,
        };
        let keep = handler.on_heartbeat(&mut ctx);
        keep && !outbound.failed
    }

    /// Read until the socket would block (or a short read suggests the
    /// kernel buffer is drained), dispatching each batch of bytes to the
    /// handler. Returns false when the connection must terminate.
    pub(crate) fn drain_readable(
        &mut self,
        id: ConnId,
        read_buf: &mut [u8],
        reactor: &Arc<ReactorShared>,
        now: i64,
    ) -> bool {
        let Self {
            sock,
            peer,
            handler,
            outbound,
            shared,
            ..
        } = self;
        loop {
            match sock.read(read_buf) {
                Ok(0) => {
                    debug!(conn = %id, peer = %peer, "peer closed");
                    return false;
                }
                Ok(n) => {
                    let short_read = n < read_buf.len();
                    let mut ctx = ConnContext {
                        id,
                        peer: *peer,
                        sock: &mut *sock,
                        outbound: &mut *outbound,
                        conn: &*shared,
                        reactor,
                        now_millis: now,
                    };
                    if !handler.on_readable(&read_buf[..n], &mut ctx) {
                        debug!(conn = %id, "handler closed connection");
                        return false;
                    }
                    if outbound.failed {
                        return false;
                    }
                    if short_read {
                        return true; // kernel drained, wait for next readable.
                    }
                }
                Err(err) => {
                    return match err.kind() {
                        std::io::ErrorKind::WouldBlock => true,
                        // not an error; the next readable event retries.
                        std::io::ErrorKind::Interrupted => true,
                        std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted => {
                            debug!(conn = %id, peer = %peer, "peer reset");
                            false
                        }
                        _ => {
                            warn!(conn = %id, error = %err, "read failed");
                            false
                        }
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sock_pair() -> (TcpStream, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    pub fn test_flush_chunks_in_order_and_recycles() {
        let pool = BufferPool::new(4);
        let (mut server, mut client) = sock_pair();
        server.set_nonblocking(true).unwrap();

        let mut outbound = Outbound::new();
        outbound.push_chunked(b"hello world", &pool); // 3 buffers of <= 4 bytes
        assert_eq!(outbound.queued_bytes(), 11);
        assert_eq!(pool.allocated(), 3);

        loop {
            match outbound.flush(&mut server, &pool) {
                FlushResult::Flushed => break,
                FlushResult::Partial => continue,
                FlushResult::Closed => panic!("unexpected close"),
            }
        }
        assert!(outbound.is_empty());
        assert_eq!(outbound.queued_bytes(), 0);
        // all buffers back on the free list.
        assert_eq!(pool.idle(), 3);

        let mut got = [0u8; 11];
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"hello world");
    }

    #[test]
    pub fn test_absorb_preserves_arrival_order() {
        let pool = BufferPool::new(8);
        let staging = SegQueue::new();
        let mut first = pool.acquire();
        first.extend_from_slice(b"first-");
        staging.push(first);
        let mut second = pool.acquire();
        second.extend_from_slice(b"second");
        staging.push(second);

        let (mut server, mut client) = sock_pair();
        server.set_nonblocking(true).unwrap();

        let mut outbound = Outbound::new();
        outbound.push_chunked(b"zero-", &pool);
        outbound.absorb(&staging);
        assert_eq!(outbound.queued_bytes(), 17);

        loop {
            match outbound.flush(&mut server, &pool) {
                FlushResult::Flushed => break,
                FlushResult::Partial => continue,
                FlushResult::Closed => panic!("unexpected close"),
            }
        }
        let mut got = [0u8; 17];
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"zero-first-second");
    }

    #[test]
    pub fn test_flush_to_dead_peer_reports_closed() {
        let pool = BufferPool::new(64);
        let (mut server, client) = sock_pair();
        server.set_nonblocking(true).unwrap();
        drop(client);

        let mut outbound = Outbound::new();
        // a dead peer surfaces as an error after at most a few attempts.
        let mut result = FlushResult::Flushed;
        for _ in 0..50 {
            outbound.push_chunked(&[0u8; 64], &pool);
            match outbound.flush(&mut server, &pool) {
                FlushResult::Closed => {
                    result = FlushResult::Closed;
                    break;
                }
                _ => std::thread::sleep(std::time::Duration::from_millis(2)),
            }
        }
        assert_eq!(result, FlushResult::Closed);
        assert!(outbound.failed);
    }
}
