//! A minimal echo server on the engine.
//!
//! Usage: cargo run --example echo_server [port]
//! Pair it with the echo_client demo or `nc`.

use netcycle::{ConnContext, ConnectionHandler, EngineConfig, ThreadedEngine};
use std::net::SocketAddr;

struct Echo;

impl ConnectionHandler for Echo {
    fn on_readable(&mut self, buf: &[u8], ctx: &mut ConnContext<'_>) -> bool {
        ctx.write(buf);
        true
    }
}

pub fn main() -> netcycle::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(7777);
    let config = EngineConfig::default().with_port(port);
    let factory =
        |_peer: SocketAddr| -> Option<Box<dyn ConnectionHandler>> { Some(Box::new(Echo)) };

    let engine = ThreadedEngine::start(config, factory)?;
    println!("echo server listening on {}", engine.local_addr());
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}
