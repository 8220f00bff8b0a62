//! # kaos-utp
//!
//! Micro transport protocol: reliable, ordered byte streams multiplexed over
//! one UDP socket.
//!
//! ## Features
//!
//! - **Multiplexed**: any number of connections share one endpoint, keyed by
//!   remote address and connection id
//! - **Reliable**: per-packet resend timers plus selective-ack fast resend
//! - **Flow controlled**: receive window advertised in every packet,
//!   congestion window halved on loss
//! - **Shareable**: datagrams that are not protocol traffic surface through
//!   [`Socket::recv_from`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kaos_utp::Socket;
//!
//! let server = Socket::bind("127.0.0.1:0").unwrap();
//! let addr = server.local_addr();
//! std::thread::spawn(move || {
//!     let conn = server.accept().unwrap();
//!     let mut buf = [0u8; 64];
//!     let n = conn.read(&mut buf).unwrap();
//!     conn.write(&buf[..n]).unwrap();
//! });
//!
//! let conn = kaos_utp::dial(addr).unwrap();
//! conn.write(b"ping").unwrap();
//! ```
//!
//! ## Protocol
//!
//! - 20-byte header, optional selective-ack extension
//! - 16-bit wrapping sequence numbers, one per DATA/FIN/SYN packet
//! - SYN / STATE handshake, FIN in both directions to close
//! - RESET for traffic that matches no connection

// Tracing macros - no-op when feature disabled
#[cfg(feature = "tracing")]
macro_rules! trace_debug { ($($arg:tt)*) => { tracing::debug!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_debug { ($($arg:tt)*) => {} }

#[cfg(feature = "tracing")]
macro_rules! trace_warn { ($($arg:tt)*) => { tracing::warn!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_warn { ($($arg:tt)*) => {} }

#[cfg(feature = "tracing")]
macro_rules! trace_trace { ($($arg:tt)*) => { tracing::trace!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_trace { ($($arg:tt)*) => {} }

pub mod config;
pub mod congestion;
mod conn;
mod error;
pub mod header;
mod pool;
mod registry;
pub mod seq;
mod socket;
mod stats;
mod timer;
mod transport;
mod window;

pub use config::Config;
pub use conn::{Conn, MAX_PAYLOAD};
pub use error::{Result, UtpError};
pub use header::{Header, PacketType, SelectiveAck};
pub use pool::MTU;
pub use registry::Registry;
pub use socket::Socket;
pub use stats::Stats;
pub use transport::PacketConn;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Binds a listening socket on `addr`.
pub fn listen(addr: impl ToSocketAddrs) -> Result<Socket> {
    Socket::bind(addr)
}

/// Connects to `addr` over a private socket.
///
/// The socket stops accepting immediately and is released once the
/// returned Conn closes.
pub fn dial(addr: impl ToSocketAddrs) -> Result<Conn> {
    dial_with(addr, None)
}

/// [`dial`] that gives up with [`UtpError::Timeout`] after `timeout`.
pub fn dial_timeout(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Conn> {
    dial_with(addr, Some(timeout))
}

fn dial_with(addr: impl ToSocketAddrs, timeout: Option<Duration>) -> Result<Conn> {
    let remote = addr
        .to_socket_addrs()
        .map_err(|e| UtpError::invalid_addr(e.to_string()))?
        .next()
        .ok_or_else(|| UtpError::invalid_addr("no addresses resolved"))?;
    let local: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = Socket::bind(local)?;
    let conn = match timeout {
        Some(timeout) => socket.dial_timeout(remote, timeout),
        None => socket.dial(remote),
    };
    socket.close();
    conn
}
