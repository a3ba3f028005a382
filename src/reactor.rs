//! The per-thread event loop at the center of the engine.
//!
//! A [`Reactor`] owns a set of connections and multiplexes readiness over
//! all of them with one `polling` poller. It is driven from outside: the
//! owner calls [`Reactor::run_cycle`] in a loop (usually on a dedicated
//! thread, see [`crate::ThreadedEngine`]) until it reports
//! [`CycleOutcome::Complete`]. Each cycle adopts newly assigned
//! connections, flushes cross-thread write wakes, polls for socket events,
//! dispatches them, and runs the heartbeat sweep when its interval
//! elapses.
//!
//! Everything mutable lives on the loop thread. Other threads interact
//! only through [`ReactorShared`]: two lock-free queues (inbound
//! connections and write wakes) plus `Poller::notify` to interrupt a
//! sleeping `wait`.

use arc_swap::ArcSwapOption;
use crossbeam::queue::SegQueue;
use polling::{Event, Events, PollMode, Poller};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::buffer::BufferPool;
use crate::config::EngineConfig;
use crate::conn::{FlushResult, ManagedConn, NewConnection};
use crate::error::{EngineError, Result};
use crate::registry::{ConnId, Registry};
use crate::utils::{self, CachedClock};

/// Outcome of one [`Reactor::run_cycle`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// More cycles expected; keep driving the loop.
    Continue,
    /// The reactor has shut down and released its poller. Stop the loop.
    Complete,
}

/// Lifecycle of a reactor, observable from any thread via
/// [`ReactorHandle::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    /// Created but not opened yet.
    Idle,
    /// Accepting assigned connections and dispatching events.
    Running,
    /// Close requested; tearing down connections.
    Draining,
    /// Fully stopped.
    Closed,
}

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_DRAINING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// A cross-thread wake telling the reactor that bytes were staged for a
/// connection and should be flushed.
pub(crate) struct WriteAction {
    pub(crate) conn: ConnId,
}

//====================================================================================
//            ReactorShared
//====================================================================================

/// The face a reactor presents to other threads. The acceptor pushes
/// arrivals into `inbound`, writer handles push [`WriteAction`]s, and both
/// call [`ReactorShared::wake`] so a sleeping loop picks the work up
/// before its poll timeout.
pub(crate) struct ReactorShared {
    pub(crate) index: usize,
    state: AtomicU8,
    inbound: SegQueue<NewConnection>,
    actions: SegQueue<WriteAction>,
    poller: ArcSwapOption<Poller>,
    pub(crate) pool: Arc<BufferPool>,
    conn_count: AtomicUsize,
}

impl ReactorShared {
    pub(crate) fn new(index: usize, pool: Arc<BufferPool>) -> Self {
        Self {
            index,
            state: AtomicU8::new(STATE_IDLE),
            inbound: SegQueue::new(),
            actions: SegQueue::new(),
            poller: ArcSwapOption::empty(),
            pool,
            conn_count: AtomicUsize::new(0),
        }
    }

    /// Create the poller and move `Idle -> Running`. Handles may submit
    /// connections as soon as this returns.
    pub(crate) fn open(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::AlreadyOpen);
        }
        match Poller::new() {
            Ok(poller) => {
                self.poller.store(Some(Arc::new(poller)));
                Ok(())
            }
            Err(err) => {
                self.state.store(STATE_IDLE, Ordering::Release);
                Err(EngineError::Poll(err))
            }
        }
    }

    /// Ask the loop to shut down. `Running` moves to `Draining`; the loop
    /// finishes the teardown. A never-opened reactor closes on the spot.
    pub(crate) fn request_close(&self) {
        let _ = self.state.compare_exchange(
            STATE_IDLE,
            STATE_CLOSED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_DRAINING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.wake();
        }
    }

    pub(crate) fn state(&self) -> ReactorState {
        match self.state.load(Ordering::Acquire) {
            STATE_IDLE => ReactorState::Idle,
            STATE_RUNNING => ReactorState::Running,
            STATE_DRAINING => ReactorState::Draining,
            _ => ReactorState::Closed,
        }
    }

    /// Interrupt a sleeping `wait`. No-op once the poller is released.
    pub(crate) fn wake(&self) {
        if let Some(poller) = self.poller.load_full() {
            if let Err(err) = poller.notify() {
                debug!(reactor = self.index, error = %err, "wake failed");
            }
        }
    }

    pub(crate) fn submit_action(&self, action: WriteAction) {
        self.actions.push(action);
        self.wake();
    }

    #[cfg(test)]
    pub(crate) fn pending_actions(&self) -> usize {
        self.actions.len()
    }
}

//====================================================================================
//            Reactor
//====================================================================================

/// A single-threaded connection event loop.
///
/// `Reactor` itself is `Send` but not `Sync`: build it anywhere, then move
/// it to the thread that drives [`run_cycle`](Self::run_cycle). Clone a
/// [`ReactorHandle`] first for cross-thread control.
pub struct Reactor {
    core: Core,
    // polled events live outside Core so dispatch can iterate them while
    // mutating connection state.
    events: Events,
}

impl Reactor {
    pub fn new(index: usize, pool: Arc<BufferPool>, config: &EngineConfig) -> Self {
        // never sleep past a heartbeat deadline.
        let poll_timeout = config.poll_timeout.min(config.heartbeat_interval);
        Self {
            core: Core {
                shared: Arc::new(ReactorShared::new(index, pool)),
                conns: Registry::new(),
                poller: None,
                read_buf: vec![0u8; config.read_buffer_size],
                clock: CachedClock::new(),
                last_heartbeat: utils::now_millis(),
                heartbeat_interval: config.heartbeat_interval.as_millis() as i64,
                poll_timeout,
            },
            events: Events::new(),
        }
    }

    /// Create the readiness multiplexer and move to `Running`.
    /// [`ThreadedEngine`](crate::ThreadedEngine) does this through the
    /// distributor; call it yourself only when driving the loop manually.
    pub fn open(&mut self) -> Result<()> {
        self.core.shared.open()?;
        self.core.poller = self.core.shared.poller.load_full();
        Ok(())
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: Arc::clone(&self.core.shared),
        }
    }

    pub fn index(&self) -> usize {
        self.core.shared.index
    }

    /// Connections currently registered with this reactor.
    pub fn connection_count(&self) -> usize {
        self.core.conns.len()
    }

    /// Run one loop iteration: adopt arrivals, flush write wakes, poll,
    /// dispatch, heartbeat. Returns [`CycleOutcome::Complete`] once the
    /// reactor has fully shut down.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        let core = &mut self.core;
        if core.poller.is_none() {
            core.poller = core.shared.poller.load_full();
            if core.poller.is_none() {
                // not opened yet, or already torn down.
                return match core.shared.state() {
                    ReactorState::Closed => CycleOutcome::Complete,
                    _ => CycleOutcome::Continue,
                };
            }
        }

        core.adopt_inbound();
        core.drain_actions();

        match core.shared.state() {
            ReactorState::Closed => return CycleOutcome::Complete,
            ReactorState::Draining => {
                if core.conns.is_empty() {
                    core.close_multiplexer();
                    return CycleOutcome::Complete;
                }
                core.force_drain();
                return CycleOutcome::Continue;
            }
            _ => {}
        }

        core.clock.invalidate();
        self.events.clear();
        if let Some(poller) = core.poller.as_ref() {
            if let Err(err) = poller.wait(&mut self.events, Some(core.poll_timeout)) {
                if err.kind() != std::io::ErrorKind::Interrupted {
                    warn!(reactor = core.shared.index, error = %err, "poll failed");
                }
            }
        }
        for ev in self.events.iter() {
            core.dispatch_event(ev);
        }

        let now = core.clock.now_millis();
        if now - core.last_heartbeat >= core.heartbeat_interval {
            core.heartbeat_sweep();
        }
        CycleOutcome::Continue
    }

    /// Force a heartbeat sweep now instead of waiting for the interval.
    pub fn do_heartbeat(&mut self) {
        self.core.heartbeat_sweep();
    }
}

//====================================================================================
//            Core
//====================================================================================

/// Loop-thread state. Split from [`Reactor`] so event dispatch can borrow
/// the polled events and the connection table at the same time.
struct Core {
    shared: Arc<ReactorShared>,
    conns: Registry<ManagedConn>,
    poller: Option<Arc<Poller>>,
    read_buf: Vec<u8>,
    clock: CachedClock,
    last_heartbeat: i64,
    heartbeat_interval: i64, // millis
    poll_timeout: Duration,
}

impl Core {
    /// Move queued arrivals into the connection table. Bounded by the queue
    /// length observed on entry so a busy acceptor cannot starve the loop.
    fn adopt_inbound(&mut self) {
        let n = self.shared.inbound.len();
        if n == 0 {
            return;
        }
        let state = self.shared.state.load(Ordering::Acquire);
        self.clock.invalidate();
        for _ in 0..n {
            let Some(nc) = self.shared.inbound.pop() else {
                break;
            };
            if state != STATE_RUNNING {
                debug!(reactor = self.shared.index, peer = %nc.peer_addr(), "dropping arrival during shutdown");
                continue;
            }
            self.register(nc);
        }
    }

    fn register(&mut self, nc: NewConnection) {
        let Some(poller) = self.poller.clone() else {
            return;
        };
        let peer = nc.peer;
        let now = self.clock.now_millis();
        let id = self.conns.insert(ManagedConn::new(nc.stream, peer, nc.handler));
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        // SAFETY: terminate() deletes the socket from the poller before
        // dropping it.
        let added = unsafe {
            poller.add_with_mode(&conn.sock, Event::readable(id.to_key()), PollMode::Level)
        };
        if let Err(err) = added {
            warn!(conn = %id, peer = %peer, error = %err, "failed to watch socket");
            self.conns.remove(id);
            return;
        }
        self.shared.conn_count.fetch_add(1, Ordering::Relaxed);
        debug!(reactor = self.shared.index, conn = %id, peer = %peer, "connection up");
        if conn.dispatch_connected(id, &self.shared, now) {
            self.rearm(id);
        } else {
            self.terminate(id, "refused in on_connected");
        }
    }

    /// Flush connections named by queued write wakes. Wakes for already
    /// terminated connections are skipped; the generation check makes a
    /// recycled slot safe.
    fn drain_actions(&mut self) {
        let n = self.shared.actions.len();
        for _ in 0..n {
            let Some(action) = self.shared.actions.pop() else {
                break;
            };
            let id = action.conn;
            let Some(conn) = self.conns.get_mut(id) else {
                continue;
            };
            if conn.pump_writes(&self.shared.pool) == FlushResult::Closed {
                self.terminate(id, "write failed");
            } else {
                self.rearm(id);
            }
        }
    }

    fn dispatch_event(&mut self, ev: Event) {
        let id = ConnId::from_key(ev.key);
        let faulted = ev.is_err().unwrap_or(false) || ev.is_interrupt();
        let now = self.clock.now_millis();
        let Some(conn) = self.conns.get_mut(id) else {
            trace!(key = ev.key, "event for stale connection");
            return;
        };
        let mut reason = None;
        if faulted {
            reason = Some("socket error event");
        }
        if reason.is_none()
            && ev.writable
            && conn.pump_writes(&self.shared.pool) == FlushResult::Closed
        {
            reason = Some("write failed");
        }
        if reason.is_none()
            && ev.readable
            && !conn.drain_readable(id, &mut self.read_buf, &self.shared, now)
        {
            reason = Some("read side closed");
        }
        match reason {
            None => self.rearm(id),
            Some(why) => self.terminate(id, why),
        }
    }

    /// Sync poller interest with the write queue: read-only while the
    /// queue is empty, read+write while bytes are pending.
    fn rearm(&mut self, id: ConnId) {
        let Some(poller) = self.poller.clone() else {
            return;
        };
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        let want_write = !conn.outbound.is_empty();
        if want_write == conn.interested_writable {
            return;
        }
        let interest = if want_write {
            Event::all(id.to_key())
        } else {
            Event::readable(id.to_key())
        };
        if let Err(err) = poller.modify_with_mode(&conn.sock, interest, PollMode::Level) {
            warn!(conn = %id, error = %err, "failed to update interest");
            self.terminate(id, "poller rejected interest update");
            return;
        }
        conn.interested_writable = want_write;
    }

    /// Deregister and drop one connection. Idempotent: a stale id is a
    /// no-op. Queued buffers go back to the pool and the handler gets its
    /// final `on_closed`.
    fn terminate(&mut self, id: ConnId, reason: &str) {
        let Some(mut conn) = self.conns.remove(id) else {
            return;
        };
        self.shared.conn_count.fetch_sub(1, Ordering::Relaxed);
        conn.shared.closed.store(true, Ordering::Release);
        if let Some(poller) = self.poller.as_ref() {
            if let Err(err) = poller.delete(&conn.sock) {
                debug!(conn = %id, error = %err, "poller delete failed");
            }
        }
        conn.recycle_buffers(&self.shared.pool);
        debug!(reactor = self.shared.index, conn = %id, peer = %conn.peer, reason, "connection closed");
        conn.handler.on_closed(id);
    }

    /// Give every connection an `on_heartbeat` and terminate the refusers.
    fn heartbeat_sweep(&mut self) {
        self.clock.invalidate();
        let now = self.clock.now_millis();
        self.last_heartbeat = now;
        if self.conns.is_empty() {
            return;
        }
        trace!(reactor = self.shared.index, conns = self.conns.len(), "heartbeat sweep");
        for id in self.conns.ids() {
            let Some(conn) = self.conns.get_mut(id) else {
                continue;
            };
            if conn.dispatch_heartbeat(id, &self.shared, now) {
                self.rearm(id);
            } else {
                self.terminate(id, "closed in on_heartbeat");
            }
        }
    }

    fn force_drain(&mut self) {
        for id in self.conns.ids() {
            self.terminate(id, "reactor shutdown");
        }
    }

    fn close_multiplexer(&mut self) {
        self.shared.poller.store(None);
        self.poller = None;
        self.shared.state.store(STATE_CLOSED, Ordering::Release);
        debug!(reactor = self.shared.index, "reactor closed");
    }
}

//====================================================================================
//            ReactorHandle
//====================================================================================

/// Cloneable cross-thread control for one reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<ReactorShared>,
}

impl ReactorHandle {
    /// Hand an accepted connection to this reactor. The loop registers it
    /// on its next cycle; a sleeping loop is woken.
    pub(crate) fn submit(&self, nc: NewConnection) {
        self.shared.inbound.push(nc);
        self.shared.wake();
    }

    pub(crate) fn open(&self) -> Result<()> {
        self.shared.open()
    }

    /// Ask the reactor to drain and stop. Returns immediately; watch
    /// [`state`](Self::state) or the driving loop's [`CycleOutcome`] for
    /// completion.
    pub fn request_close(&self) {
        self.shared.request_close();
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn state(&self) -> ReactorState {
        self.shared.state()
    }

    /// Registered connections, tracked relaxed; exact once the loop is
    /// quiescent.
    pub fn connection_count(&self) -> usize {
        self.shared.conn_count.load(Ordering::Relaxed)
    }

    /// Assigned connections the loop has not adopted yet.
    pub fn queued_connections(&self) -> usize {
        self.shared.inbound.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::handler::{ConnContext, ConnectionHandler};
    use crate::utils::Timer;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    struct CountingHandler {
        reads: Arc<AtomicUsize>,
        beats: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl ConnectionHandler for CountingHandler {
        fn on_readable(&mut self, buf: &[u8], ctx: &mut ConnContext<'_>) -> bool {
            self.reads.fetch_add(buf.len(), Ordering::Relaxed);
            ctx.write(buf); // echo
            true
        }

        fn on_heartbeat(&mut self, _ctx: &mut ConnContext<'_>) -> bool {
            self.beats.fetch_add(1, Ordering::Relaxed);
            true
        }

        fn on_closed(&mut self, _id: ConnId) {
            self.closes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn counting(
        reads: &Arc<AtomicUsize>,
        beats: &Arc<AtomicUsize>,
        closes: &Arc<AtomicUsize>,
    ) -> Box<CountingHandler> {
        Box::new(CountingHandler {
            reads: Arc::clone(reads),
            beats: Arc::clone(beats),
            closes: Arc::clone(closes),
        })
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.poll_timeout = Duration::from_millis(10);
        config.heartbeat_interval = Duration::from_millis(500);
        config
    }

    fn accept_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (server, client)
    }

    #[test]
    pub fn test_open_twice_fails() {
        let pool = Arc::new(BufferPool::new(64));
        let mut reactor = Reactor::new(0, pool, &test_config());
        reactor.open().unwrap();
        assert!(matches!(reactor.open(), Err(EngineError::AlreadyOpen)));
    }

    #[test]
    pub fn test_echo_read_close_lifecycle() {
        let pool = Arc::new(BufferPool::new(1024));
        let mut reactor = Reactor::new(0, pool, &test_config());
        reactor.open().unwrap();
        let handle = reactor.handle();
        assert_eq!(handle.state(), ReactorState::Running);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (server, mut client) = accept_pair(&listener);
        let peer = server.peer_addr().unwrap();

        let reads = Arc::new(AtomicUsize::new(0));
        let beats = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        handle.submit(NewConnection::new(
            server,
            peer,
            counting(&reads, &beats, &closes),
        ));

        assert_eq!(reactor.run_cycle(), CycleOutcome::Continue);
        assert_eq!(reactor.connection_count(), 1);
        assert_eq!(handle.connection_count(), 1);

        client.write_all(b"ping").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut got = [0u8; 4];
        let timer = Timer::new_millis(5_000);
        loop {
            reactor.run_cycle();
            match client.read_exact(&mut got) {
                Ok(()) => break,
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    assert!(!timer.expired(), "no echo within deadline");
                }
                Err(err) => panic!("read failed: {err}"),
            }
        }
        assert_eq!(&got, b"ping");
        assert_eq!(reads.load(Ordering::Relaxed), 4);

        drop(client);
        let timer = Timer::new_millis(5_000);
        while reactor.connection_count() > 0 && !timer.expired() {
            reactor.run_cycle();
        }
        assert_eq!(reactor.connection_count(), 0);
        assert_eq!(closes.load(Ordering::Relaxed), 1);

        handle.request_close();
        let timer = Timer::new_millis(5_000);
        loop {
            if reactor.run_cycle() == CycleOutcome::Complete {
                break;
            }
            assert!(!timer.expired(), "reactor did not stop");
        }
        assert_eq!(handle.state(), ReactorState::Closed);
    }

    #[test]
    pub fn test_heartbeat_sweep_cadence() {
        let pool = Arc::new(BufferPool::new(64));
        let mut config = test_config();
        config.heartbeat_interval = Duration::from_millis(20);
        config.poll_timeout = Duration::from_millis(5);
        let mut reactor = Reactor::new(3, pool, &config);
        reactor.open().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (server, _client) = accept_pair(&listener);
        let peer = server.peer_addr().unwrap();

        let reads = Arc::new(AtomicUsize::new(0));
        let beats = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        reactor
            .handle()
            .submit(NewConnection::new(server, peer, counting(&reads, &beats, &closes)));

        let timer = Timer::new_millis(5_000);
        while beats.load(Ordering::Relaxed) < 2 && !timer.expired() {
            reactor.run_cycle();
        }
        assert!(beats.load(Ordering::Relaxed) >= 2, "heartbeats did not fire");
    }

    #[test]
    pub fn test_close_drops_pending_arrivals() {
        let pool = Arc::new(BufferPool::new(64));
        let mut reactor = Reactor::new(1, pool, &test_config());
        reactor.open().unwrap();
        let handle = reactor.handle();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (server, _client) = accept_pair(&listener);
        let peer = server.peer_addr().unwrap();

        let reads = Arc::new(AtomicUsize::new(0));
        let beats = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        handle.submit(NewConnection::new(server, peer, counting(&reads, &beats, &closes)));
        handle.request_close();

        let timer = Timer::new_millis(5_000);
        loop {
            if reactor.run_cycle() == CycleOutcome::Complete {
                break;
            }
            assert!(!timer.expired(), "reactor did not stop");
        }
        // the arrival never registered, so no on_closed either.
        assert_eq!(reactor.connection_count(), 0);
        assert_eq!(closes.load(Ordering::Relaxed), 0);
    }

    #[test]
    pub fn test_refused_connection_closes_immediately() {
        struct Refuser {
            closes: Arc<AtomicUsize>,
        }
        impl ConnectionHandler for Refuser {
            fn on_connected(&mut self, _ctx: &mut ConnContext<'_>) -> bool {
                false
            }
            fn on_readable(&mut self, _buf: &[u8], _ctx: &mut ConnContext<'_>) -> bool {
                true
            }
            fn on_closed(&mut self, _id: ConnId) {
                self.closes.fetch_add(1, Ordering::Relaxed);
            }
        }

        let pool = Arc::new(BufferPool::new(64));
        let mut reactor = Reactor::new(0, pool, &test_config());
        reactor.open().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (server, mut client) = accept_pair(&listener);
        let peer = server.peer_addr().unwrap();

        let closes = Arc::new(AtomicUsize::new(0));
        reactor.handle().submit(NewConnection::new(
            server,
            peer,
            Box::new(Refuser {
                closes: Arc::clone(&closes),
            }),
        ));

        reactor.run_cycle();
        assert_eq!(reactor.connection_count(), 0);
        assert_eq!(closes.load(Ordering::Relaxed), 1);

        // the peer sees EOF.
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
