use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Engine configuration.
///
/// Zero means "pick for me" where a sentinel makes sense: port 0 binds an
/// ephemeral port, `reactor_count` 0 uses the available parallelism, socket
/// buffer 0 keeps the OS default.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    // === Listener ===
    /// TCP listen port (0 = ephemeral port assigned by OS)
    pub listen_port: u16,

    /// Address to bind for listening (None = all interfaces)
    pub listen_address: Option<IpAddr>,

    /// TCP listen backlog (pending connection queue size)
    pub listen_backlog: u32,

    // === Reactor pool ===
    /// Number of reactor event loops (0 = available parallelism)
    pub reactor_count: usize,

    /// Upper bound for one blocking wait of a reactor multiplexer
    pub poll_timeout: Duration,

    /// Upper bound for one blocking wait of the accept loop
    pub accept_poll_timeout: Duration,

    /// Interval between heartbeat sweeps over registered connections
    pub heartbeat_interval: Duration,

    // === Sockets ===
    /// Enable TCP_NODELAY on accepted sockets
    pub nodelay: bool,

    /// SO_SNDBUF socket option (0 = OS default)
    pub socket_send_buffer: usize,

    /// SO_RCVBUF socket option (0 = OS default)
    pub socket_recv_buffer: usize,

    // === Buffers ===
    /// Reusable per-reactor read scratch buffer size
    pub read_buffer_size: usize,

    /// Capacity of each pooled write buffer
    pub write_buffer_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,       // Ephemeral
            listen_address: None, // All interfaces
            listen_backlog: 25_000,

            reactor_count: 0, // Available parallelism
            poll_timeout: Duration::from_millis(1000),
            accept_poll_timeout: Duration::from_millis(10_000),
            heartbeat_interval: Duration::from_millis(10_000),

            nodelay: true,
            socket_send_buffer: 0, // OS default
            socket_recv_buffer: 0, // OS default

            read_buffer_size: 64 * 1024,
            write_buffer_capacity: 16 * 1024,
        }
    }
}

impl EngineConfig {
    /// Builder: set listen port
    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    /// Builder: set listen address
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.listen_address = Some(address);
        self
    }

    /// Builder: set reactor count
    pub fn with_reactors(mut self, count: usize) -> Self {
        self.reactor_count = count;
        self
    }

    /// Builder: set poll timeout
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Builder: set heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// The address the listener binds, with `None` resolved to all
    /// interfaces.
    pub fn listen_addr(&self) -> SocketAddr {
        let ip = self
            .listen_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.listen_port)
    }

    /// `reactor_count` with the 0 sentinel resolved.
    pub fn effective_reactor_count(&self) -> usize {
        if self.reactor_count > 0 {
            return self.reactor_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Validate configuration, returning error message if invalid.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.listen_backlog == 0 {
            return Err("listen_backlog must be > 0");
        }
        if self.poll_timeout.is_zero() {
            return Err("poll_timeout must be > 0");
        }
        if self.accept_poll_timeout.is_zero() {
            return Err("accept_poll_timeout must be > 0");
        }
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must be > 0");
        }
        if self.read_buffer_size == 0 {
            return Err("read_buffer_size must be > 0");
        }
        if self.write_buffer_capacity == 0 {
            return Err("write_buffer_capacity must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.listen_port, 0);
        assert_eq!(config.listen_backlog, 25_000);
        assert_eq!(config.poll_timeout, Duration::from_millis(1000));
        assert_eq!(config.accept_poll_timeout, Duration::from_millis(10_000));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(10_000));
        assert!(config.nodelay);
        assert!(config.validate().is_ok());
        assert!(config.effective_reactor_count() >= 1);
    }

    #[test]
    pub fn test_listen_addr_sentinels() {
        let config = EngineConfig::default().with_port(7410);
        assert_eq!(config.listen_addr().port(), 7410);
        assert!(config.listen_addr().ip().is_unspecified());

        let config = config.with_address(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(config.listen_addr().ip().is_loopback());
    }

    #[test]
    pub fn test_validation_errors() {
        let config = EngineConfig {
            read_buffer_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            poll_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            write_buffer_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    pub fn test_explicit_reactor_count() {
        let config = EngineConfig::default().with_reactors(3);
        assert_eq!(config.effective_reactor_count(), 3);
    }
}
