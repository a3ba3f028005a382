//! # netcycle - a nonblocking TCP connection engine.
//!
//! netcycle owns the socket plumbing of a TCP server so protocol code does
//! not have to: an accept loop, a fixed pool of reactor event loops, a
//! round-robin distributor placing accepted connections onto reactors, and
//! a shared pool of reusable write buffers. Protocol behavior plugs in
//! through the [`ConnectionHandler`] trait; the engine imposes no message
//! framing and never inspects payload bytes.
//!
//! Each reactor multiplexes readiness over its connections with one
//! `polling` poller and owns them completely, so handlers run without
//! locks. Every loop is step-driven: `run_cycle` does one iteration and
//! the caller decides the driving thread. [`ThreadedEngine`] is the
//! batteries-included arrangement with one thread per loop.
//!
//! Supported platforms: Linux, macOS, Windows (via the `polling` backend).
//!
//! ## Example
//!
//! An echo server:
//!
//! ```rust,no_run
//! use netcycle::{ConnContext, ConnectionHandler, EngineConfig, ThreadedEngine};
//! use std::net::SocketAddr;
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_readable(&mut self, buf: &[u8], ctx: &mut ConnContext<'_>) -> bool {
//!         ctx.write(buf);
//!         true
//!     }
//! }
//!
//! fn main() -> netcycle::Result<()> {
//!     let config = EngineConfig::default().with_port(7000).with_reactors(4);
//!     let factory = |_peer: SocketAddr| -> Option<Box<dyn ConnectionHandler>> {
//!         Some(Box::new(Echo))
//!     };
//!     let engine = ThreadedEngine::start(config, factory)?;
//!     println!("echo server on {}", engine.local_addr());
//!     loop {
//!         std::thread::sleep(std::time::Duration::from_secs(1));
//!     }
//! }
//! ```
//!
//! For a single-threaded or externally scheduled setup, build
//! [`Reactor`]s, a [`Distributor`] and an [`Acceptor`] directly and call
//! their `run_cycle` methods from wherever fits.

mod acceptor;
mod buffer;
mod config;
mod conn;
mod distributor;
mod error;
mod handler;
mod reactor;
mod registry;
mod threaded;
pub mod utils;

pub use acceptor::{AcceptCycle, Acceptor, AcceptorHandle};
pub use buffer::{BufferPool, PooledBuf};
pub use config::EngineConfig;
pub use conn::NewConnection;
pub use distributor::Distributor;
pub use error::{EngineError, Result};
pub use handler::{ConnContext, ConnectionHandler, HandlerFactory, SendStatus, WriteHandle};
pub use reactor::{CycleOutcome, Reactor, ReactorHandle, ReactorState};
pub use registry::ConnId;
pub use threaded::ThreadedEngine;
