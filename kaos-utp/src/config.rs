//! Socket and connection tuning.

use crate::registry::Registry;
use std::time::Duration;

/// Pending SYNs kept for `accept`.
pub const BACKLOG_LEN: usize = 50;

/// Bytes a Conn buffers before advertising a zero window.
pub const RECV_WINDOW: usize = 256 * 1024;

pub const MAX_UNACKED_INBOUND: usize = 256;

pub const MAX_UNACKED_SENDS: usize = 256;

/// Latency assumed before the first RTT sample.
pub const INITIAL_LATENCY: Duration = Duration::from_millis(400);

/// A send unacknowledged this long destroys its Conn.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// A Conn that receives nothing for this long is destroyed.
pub const PACKET_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Kernel send/receive buffer requested at bind (2MB).
pub const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub backlog: usize,
    pub recv_window: usize,
    pub max_unacked_inbound: usize,
    pub max_unacked_sends: usize,
    pub initial_latency: Duration,
    pub write_timeout: Duration,
    pub packet_read_timeout: Duration,
    pub socket_buffer_size: usize,
    pub registry: Option<Registry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backlog: BACKLOG_LEN,
            recv_window: RECV_WINDOW,
            max_unacked_inbound: MAX_UNACKED_INBOUND,
            max_unacked_sends: MAX_UNACKED_SENDS,
            initial_latency: INITIAL_LATENCY,
            write_timeout: WRITE_TIMEOUT,
            packet_read_timeout: PACKET_READ_TIMEOUT,
            socket_buffer_size: SOCKET_BUFFER_SIZE,
            registry: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog.max(1);
        self
    }

    pub fn with_recv_window(mut self, bytes: usize) -> Self {
        self.recv_window = bytes;
        self
    }

    pub fn with_max_unacked_inbound(mut self, n: usize) -> Self {
        self.max_unacked_inbound = n.max(1);
        self
    }

    pub fn with_max_unacked_sends(mut self, n: usize) -> Self {
        self.max_unacked_sends = n.max(1);
        self
    }

    pub fn with_initial_latency(mut self, latency: Duration) -> Self {
        self.initial_latency = latency;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_packet_read_timeout(mut self, timeout: Duration) -> Self {
        self.packet_read_timeout = timeout;
        self
    }

    pub fn with_socket_buffer_size(mut self, bytes: usize) -> Self {
        self.socket_buffer_size = bytes;
        self
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.backlog, 50);
        assert_eq!(config.recv_window, 0x40000);
        assert_eq!(config.max_unacked_inbound, 256);
        assert_eq!(config.max_unacked_sends, 256);
        assert_eq!(config.initial_latency, Duration::from_millis(400));
        assert_eq!(config.write_timeout, Duration::from_secs(15));
        assert_eq!(config.packet_read_timeout, Duration::from_secs(120));
        assert!(config.registry.is_none());
    }

    #[test]
    fn builders_clamp_counts() {
        let config = Config::new()
            .with_backlog(0)
            .with_max_unacked_sends(0)
            .with_write_timeout(Duration::from_secs(2));
        assert_eq!(config.backlog, 1);
        assert_eq!(config.max_unacked_sends, 1);
        assert_eq!(config.write_timeout, Duration::from_secs(2));
    }
}
