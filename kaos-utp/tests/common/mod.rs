//! Shared fixtures for kaos-utp integration tests.

#![allow(dead_code)]

use kaos_test_support::{ChaosMonkey, DropDecision, Fate, LossGate, LossGenerator};
use kaos_utp::{Config, PacketConn, Socket};
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Config with short timers so loss recovery runs in test time.
pub fn fast_config() -> Config {
    Config::default()
        .with_initial_latency(Duration::from_millis(20))
        .with_write_timeout(Duration::from_secs(5))
}

/// UDP transport that filters outbound datagrams through a loss generator
/// and a chaos monkey.
pub struct LossyConn {
    udp: UdpSocket,
    faults: Mutex<Faults>,
}

struct Faults {
    loss: LossGenerator,
    chaos: ChaosMonkey,
    sent: u64,
}

impl LossyConn {
    pub fn bind(loss: LossGenerator, chaos: ChaosMonkey) -> io::Result<Self> {
        Ok(Self {
            udp: UdpSocket::bind("127.0.0.1:0")?,
            faults: Mutex::new(Faults {
                loss,
                chaos,
                sent: 0,
            }),
        })
    }

    /// Transport that drops everything while `gate` is closed.
    pub fn gated(gate: LossGate) -> io::Result<Self> {
        Self::bind(LossGenerator::gated(gate), ChaosMonkey::new())
    }
}

impl PacketConn for LossyConn {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.udp.recv_from(buf)
    }

    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let fate = {
            let mut faults = self.faults.lock();
            let index = faults.sent;
            faults.sent += 1;
            if faults.loss.should_drop(index) == DropDecision::Drop {
                Fate::Drop
            } else {
                faults.chaos.decide()
            }
        };
        match fate {
            // Dropped datagrams still count as written.
            Fate::Drop => Ok(buf.len()),
            Fate::Duplicate => {
                self.udp.send_to(buf, addr)?;
                self.udp.send_to(buf, addr)
            }
            Fate::Pass => self.udp.send_to(buf, addr),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.udp.set_read_timeout(timeout)
    }
}

pub fn socket() -> Socket {
    Socket::bind_with_config("127.0.0.1:0", fast_config()).unwrap()
}

pub fn lossy_socket(loss: LossGenerator, chaos: ChaosMonkey) -> Socket {
    Socket::from_packet_conn(LossyConn::bind(loss, chaos).unwrap(), fast_config()).unwrap()
}

/// Reads until EOF or `limit` bytes, whichever comes first.
pub fn read_to_end(conn: &kaos_utp::Conn, limit: usize) -> kaos_utp::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    while out.len() < limit {
        let n = conn.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}
