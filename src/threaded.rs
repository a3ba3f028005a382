//! Turnkey engine: reactors and the acceptor on dedicated threads.
//!
//! [`ThreadedEngine::start`] wires the whole stack together from an
//! [`EngineConfig`]: a shared [`BufferPool`], a fixed pool of reactors
//! each driven on its own thread, a [`Distributor`] over their handles,
//! and the accept loop on one more thread. Dropping the engine shuts
//! everything down and joins the workers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info};

use crate::acceptor::{AcceptCycle, Acceptor, AcceptorHandle};
use crate::buffer::BufferPool;
use crate::config::EngineConfig;
use crate::distributor::Distributor;
use crate::error::{EngineError, Result};
use crate::handler::HandlerFactory;
use crate::reactor::{CycleOutcome, Reactor};

/// A running engine. Shut down explicitly with
/// [`shutdown`](Self::shutdown) or implicitly on drop.
pub struct ThreadedEngine {
    distributor: Arc<Distributor>,
    acceptor_handle: AcceptorHandle,
    local_addr: SocketAddr,
    accept_thread: Option<JoinHandle<()>>,
    reactor_threads: Vec<JoinHandle<()>>,
}

impl ThreadedEngine {
    /// Validate the config, bind the listener and spawn one thread per
    /// reactor plus the accept thread. Connections are served as soon as
    /// this returns.
    pub fn start(config: EngineConfig, factory: impl HandlerFactory + 'static) -> Result<Self> {
        config.validate().map_err(EngineError::Config)?;

        let pool = Arc::new(BufferPool::new(config.write_buffer_capacity));
        let reactor_count = config.effective_reactor_count();
        let reactors: Vec<Reactor> = (0..reactor_count)
            .map(|i| Reactor::new(i, Arc::clone(&pool), &config))
            .collect();
        let distributor = Arc::new(Distributor::new(
            reactors.iter().map(|r| r.handle()).collect(),
        ));
        distributor.open_all()?;

        let mut acceptor = Acceptor::new(config, Box::new(factory), Arc::clone(&distributor));
        let acceptor_handle = acceptor.handle();
        let local_addr = acceptor.bind()?;

        let reactor_threads = reactors
            .into_iter()
            .map(|mut reactor| {
                std::thread::Builder::new()
                    .name(format!("netcycle-reactor-{}", reactor.index()))
                    .spawn(move || while let CycleOutcome::Continue = reactor.run_cycle() {})
                    .expect("failed to spawn reactor worker")
            })
            .collect();
        let accept_thread = std::thread::Builder::new()
            .name("netcycle-accept".to_owned())
            .spawn(move || while let AcceptCycle::Continue = acceptor.run_cycle() {})
            .expect("failed to spawn accept worker");

        info!(%local_addr, reactors = reactor_count, "engine started");
        Ok(Self {
            distributor,
            acceptor_handle,
            local_addr,
            accept_thread: Some(accept_thread),
            reactor_threads,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn distributor(&self) -> &Arc<Distributor> {
        &self.distributor
    }

    pub fn acceptor(&self) -> &AcceptorHandle {
        &self.acceptor_handle
    }

    /// Connections currently registered across all reactors.
    pub fn connection_count(&self) -> usize {
        self.distributor.connection_count()
    }

    /// Stop accepting, drain every reactor and join all worker threads.
    /// Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.acceptor_handle.unbind();
        if let Some(worker) = self.accept_thread.take() {
            if worker.join().is_err() {
                error!("accept worker panicked");
            }
        }
        self.distributor.close_all();
        for worker in self.reactor_threads.drain(..) {
            if worker.join().is_err() {
                error!("reactor worker panicked");
            }
        }
        info!("engine stopped");
    }
}

impl Drop for ThreadedEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
