//! The accept loop: one listener socket, polled on its own poller,
//! feeding accepted connections through the distributor.
//!
//! Like the reactor, the acceptor is step-driven:
//! [`Acceptor::run_cycle`] waits for the listener to become readable,
//! drains every pending `accept`, and hands each configured socket to the
//! [`Distributor`]. [`AcceptorHandle::unbind`] closes the listener from
//! any thread and stops the loop without touching established
//! connections.

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use polling::{Event, Events, PollMode, Poller};
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::conn::NewConnection;
use crate::distributor::Distributor;
use crate::error::{EngineError, Result};
use crate::handler::HandlerFactory;

// the listener is the only source on the accept poller.
const LISTENER_KEY: usize = 0;

struct AcceptorIo {
    poller: Arc<Poller>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

/// State shared with [`AcceptorHandle`]s. `wake` doubles as the bound
/// flag: the loop keeps running while it holds a poller.
pub(crate) struct AcceptorShared {
    wake: ArcSwapOption<Poller>,
    io: Mutex<Option<AcceptorIo>>,
}

impl AcceptorShared {
    /// Close the listener and wake the loop so it notices. Idempotent.
    pub(crate) fn unbind(&self) {
        let Some(poller) = self.wake.swap(None) else {
            return;
        };
        if let Err(err) = poller.notify() {
            debug!(error = %err, "unbind wake failed");
        }
        if let Some(io) = self.io.lock().take() {
            if let Err(err) = io.poller.delete(&io.listener) {
                debug!(error = %err, "listener deregister failed");
            }
            info!(local_addr = %io.local_addr, "listener closed");
        }
    }
}

/// Outcome of one [`Acceptor::run_cycle`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptCycle {
    /// Keep driving the loop.
    Continue,
    /// The listener is gone; stop the loop.
    Stopped,
}

//====================================================================================
//            Acceptor
//====================================================================================

/// Owns the listener socket and the handler factory. Driven from outside
/// like a [`Reactor`](crate::Reactor): bind once, then call
/// [`run_cycle`](Self::run_cycle) until it reports [`AcceptCycle::Stopped`].
pub struct Acceptor {
    config: EngineConfig,
    factory: Box<dyn HandlerFactory>,
    distributor: Arc<Distributor>,
    shared: Arc<AcceptorShared>,
    events: Events,
}

impl Acceptor {
    pub fn new(
        config: EngineConfig,
        factory: Box<dyn HandlerFactory>,
        distributor: Arc<Distributor>,
    ) -> Self {
        Self {
            config,
            factory,
            distributor,
            shared: Arc::new(AcceptorShared {
                wake: ArcSwapOption::empty(),
                io: Mutex::new(None),
            }),
            events: Events::new(),
        }
    }

    /// Create, bind and start listening on the configured address.
    /// Returns the bound address, which differs from the configured one
    /// when port 0 asked the kernel to pick.
    pub fn bind(&mut self) -> Result<SocketAddr> {
        let mut guard = self.shared.io.lock();
        if guard.is_some() {
            return Err(EngineError::AlreadyBound);
        }
        let addr = self.config.listen_addr();
        let bind_err = |source| EngineError::Bind { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.bind(&SockAddr::from(addr)).map_err(bind_err)?;
        socket
            .listen(self.config.listen_backlog as i32)
            .map_err(bind_err)?;
        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let poller = Poller::new().map_err(EngineError::Poll)?;
        // SAFETY: unbind() deregisters the listener before dropping it.
        unsafe {
            poller
                .add_with_mode(&listener, Event::readable(LISTENER_KEY), PollMode::Level)
                .map_err(EngineError::Poll)?;
        }
        let poller = Arc::new(poller);
        self.shared.wake.store(Some(Arc::clone(&poller)));
        *guard = Some(AcceptorIo {
            poller,
            listener,
            local_addr,
        });
        info!(%local_addr, backlog = self.config.listen_backlog, "listening");
        Ok(local_addr)
    }

    /// Wait for the listener to become readable and drain every pending
    /// accept. Each accepted socket is configured, offered to the factory
    /// and, unless refused, assigned to a reactor.
    pub fn run_cycle(&mut self) -> AcceptCycle {
        let Some(poller) = self.shared.wake.load_full() else {
            return AcceptCycle::Stopped;
        };
        self.events.clear();
        if let Err(err) = poller.wait(&mut self.events, Some(self.config.accept_poll_timeout)) {
            if err.kind() != std::io::ErrorKind::Interrupted {
                warn!(error = %err, "accept poll failed");
            }
            return AcceptCycle::Continue;
        }
        if self.events.is_empty() {
            return AcceptCycle::Continue;
        }
        let guard = self.shared.io.lock();
        let Some(io) = guard.as_ref() else {
            return AcceptCycle::Stopped;
        };
        Self::accept_pass(
            self.factory.as_mut(),
            &self.distributor,
            &self.config,
            &io.listener,
        );
        AcceptCycle::Continue
    }

    fn accept_pass(
        factory: &mut dyn HandlerFactory,
        distributor: &Distributor,
        config: &EngineConfig,
        listener: &TcpListener,
    ) {
        loop {
            let (stream, peer) = match listener.accept() {
                Ok(pair) => pair,
                Err(err) => match err.kind() {
                    std::io::ErrorKind::WouldBlock => break,
                    std::io::ErrorKind::Interrupted => continue,
                    // peer vanished between the event and the accept.
                    std::io::ErrorKind::ConnectionAborted => continue,
                    _ => {
                        warn!(error = %err, "accept failed");
                        break;
                    }
                },
            };
            if let Err(err) = Self::configure_stream(&stream, config) {
                warn!(%peer, error = %err, "failed to configure socket");
                continue;
            }
            let Some(handler) = factory.create(peer) else {
                debug!(%peer, "connection refused by factory");
                continue;
            };
            debug!(%peer, "accepted");
            distributor.assign(NewConnection::new(stream, peer, handler));
        }
    }

    fn configure_stream(stream: &TcpStream, config: &EngineConfig) -> std::io::Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(config.nodelay)?;
        let sock = SockRef::from(stream);
        if config.socket_send_buffer > 0 {
            sock.set_send_buffer_size(config.socket_send_buffer)?;
        }
        if config.socket_recv_buffer > 0 {
            sock.set_recv_buffer_size(config.socket_recv_buffer)?;
        }
        Ok(())
    }

    /// Close the listener. The loop reports [`AcceptCycle::Stopped`] on
    /// its next cycle.
    pub fn unbind(&self) {
        self.shared.unbind();
    }

    pub fn is_bound(&self) -> bool {
        self.shared.io.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.io.lock().as_ref().map(|io| io.local_addr)
    }

    pub fn handle(&self) -> AcceptorHandle {
        AcceptorHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Cloneable cross-thread control for the accept loop.
#[derive(Clone)]
pub struct AcceptorHandle {
    shared: Arc<AcceptorShared>,
}

impl AcceptorHandle {
    /// Close the listener and stop the accept loop. Established
    /// connections are unaffected.
    pub fn unbind(&self) {
        self.shared.unbind();
    }

    pub fn is_bound(&self) -> bool {
        self.shared.io.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.io.lock().as_ref().map(|io| io.local_addr)
    }
}
