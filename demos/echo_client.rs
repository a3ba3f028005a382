//! Blocking round-trip client for the echo_server demo.
//!
//! Usage: cargo run --example echo_client [addr] [count]

use std::io::{Read, Write};
use std::net::TcpStream;

pub fn main() -> std::io::Result<()> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7777".to_owned());
    let count: usize = std::env::args()
        .nth(2)
        .and_then(|c| c.parse().ok())
        .unwrap_or(1000);

    let mut sock = TcpStream::connect(&addr)?;
    sock.set_nodelay(true)?;

    let msg = b"netcycle-echo-roundtrip-payload!";
    let mut echo = [0u8; 32];
    let start = std::time::Instant::now();
    for _ in 0..count {
        sock.write_all(msg)?;
        sock.read_exact(&mut echo)?;
        assert_eq!(&echo, msg);
    }
    let elapsed = start.elapsed();
    println!(
        "{count} round trips in {elapsed:?} ({:.1} us each)",
        elapsed.as_micros() as f64 / count as f64
    );
    Ok(())
}
