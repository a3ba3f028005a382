//! Round-robin placement of accepted connections onto reactors.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

use crate::conn::NewConnection;
use crate::error::Result;
use crate::reactor::ReactorHandle;

/// Spreads accepted connections over a fixed set of reactors with an
/// atomic round-robin counter. Placement ignores load; over time each
/// reactor receives the same share of arrivals.
pub struct Distributor {
    reactors: Vec<ReactorHandle>,
    next: AtomicUsize,
}

impl Distributor {
    /// Panics if `reactors` is empty.
    pub fn new(reactors: Vec<ReactorHandle>) -> Self {
        assert!(!reactors.is_empty(), "distributor needs at least one reactor");
        Self {
            reactors,
            next: AtomicUsize::new(0),
        }
    }

    /// Hand a connection to the next reactor in rotation. Lock-free and
    /// callable from any thread, though the acceptor is the usual caller.
    pub fn assign(&self, nc: NewConnection) {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        trace!(reactor = slot, peer = %nc.peer_addr(), "assigning connection");
        self.reactors[slot].submit(nc);
    }

    /// Open every reactor. Fails on the first reactor that cannot create
    /// its multiplexer; already opened ones keep running.
    pub fn open_all(&self) -> Result<()> {
        for handle in &self.reactors {
            handle.open()?;
        }
        Ok(())
    }

    /// Request a drain-and-stop on every reactor. Returns immediately.
    pub fn close_all(&self) {
        for handle in &self.reactors {
            handle.request_close();
        }
    }

    pub fn len(&self) -> usize {
        self.reactors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.is_empty()
    }

    pub fn handles(&self) -> &[ReactorHandle] {
        &self.reactors
    }

    /// Connections registered across all reactors.
    pub fn connection_count(&self) -> usize {
        self.reactors.iter().map(|h| h.connection_count()).sum()
    }
}
