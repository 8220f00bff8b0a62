//! Datagram transport trait
//!
//! A [`Socket`](crate::Socket) runs over anything that can send and receive
//! addressed datagrams. `UdpSocket` is the production implementation; tests
//! wrap it to inject loss and duplication.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Best-effort, unordered, addressed datagrams.
pub trait PacketConn: Send + Sync + 'static {
    /// Receives one datagram. Returns `WouldBlock` or `TimedOut` when the read
    /// timeout elapses without traffic.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Bounds how long `recv_from` may block so the reader can notice
    /// teardown.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl PacketConn for UdpSocket {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UdpSocket::set_read_timeout(self, timeout)
    }
}

/// Errors the reader treats as "nothing arrived yet".
pub(crate) fn is_poll_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Binds a UDP socket with enlarged kernel buffers.
pub(crate) fn bind_udp(addr: SocketAddr, buffer_size: usize) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if buffer_size > 0 {
        // Best effort: the kernel may clamp or refuse large buffers.
        let _ = socket.set_recv_buffer_size(buffer_size);
        let _ = socket.set_send_buffer_size(buffer_size);
    }
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
