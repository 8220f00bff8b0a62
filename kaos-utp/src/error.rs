//! Error types for kaos-utp.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, UtpError>;

#[derive(Error, Debug)]
pub enum UtpError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    /// A read/write deadline passed, or a dial did not complete in time.
    #[error("i/o timeout")]
    Timeout,

    #[error("timed out waiting for ack")]
    AckTimeout,

    #[error("no packet read timeout")]
    IdleTimeout,

    #[error("peer reset")]
    PeerReset,

    #[error("use of closed connection")]
    Closed,

    #[error("socket closed")]
    SocketClosed,

    #[error("couldn't register new connection: {0}")]
    Registration(String),

    #[error("invalid address: {0}")]
    InvalidAddr(String),
}

impl UtpError {
    pub fn invalid_addr(addr: impl Into<String>) -> Self {
        Self::InvalidAddr(addr.into())
    }

    /// True for every flavour of timeout: deadlines, ack and idle timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            UtpError::Timeout | UtpError::AckTimeout | UtpError::IdleTimeout
        )
    }

    fn kind(&self) -> io::ErrorKind {
        match self {
            UtpError::Io(e) => e.kind(),
            UtpError::MalformedHeader(_) => io::ErrorKind::InvalidData,
            UtpError::Timeout | UtpError::AckTimeout | UtpError::IdleTimeout => {
                io::ErrorKind::TimedOut
            }
            UtpError::PeerReset => io::ErrorKind::ConnectionReset,
            UtpError::Closed => io::ErrorKind::BrokenPipe,
            UtpError::SocketClosed => io::ErrorKind::NotConnected,
            UtpError::Registration(_) => io::ErrorKind::AddrInUse,
            UtpError::InvalidAddr(_) => io::ErrorKind::InvalidInput,
        }
    }
}

// A connection records its terminal error once and hands a copy to every
// caller that observes it afterwards.
impl Clone for UtpError {
    fn clone(&self) -> Self {
        match self {
            UtpError::Io(e) => UtpError::Io(io::Error::new(e.kind(), e.to_string())),
            UtpError::MalformedHeader(msg) => UtpError::MalformedHeader(msg),
            UtpError::Timeout => UtpError::Timeout,
            UtpError::AckTimeout => UtpError::AckTimeout,
            UtpError::IdleTimeout => UtpError::IdleTimeout,
            UtpError::PeerReset => UtpError::PeerReset,
            UtpError::Closed => UtpError::Closed,
            UtpError::SocketClosed => UtpError::SocketClosed,
            UtpError::Registration(msg) => UtpError::Registration(msg.clone()),
            UtpError::InvalidAddr(msg) => UtpError::InvalidAddr(msg.clone()),
        }
    }
}

impl From<UtpError> for io::Error {
    fn from(err: UtpError) -> Self {
        match err {
            UtpError::Io(e) => e,
            other => io::Error::new(other.kind(), other),
        }
    }
}
