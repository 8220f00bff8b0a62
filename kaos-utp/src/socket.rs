//! Datagram demultiplexer.
//!
//! One reader thread pulls datagrams off the transport into a bounded queue;
//! one dispatcher thread parses them and routes each to its Conn's delivery
//! queue, to the SYN backlog, or to the unused-reads queue that serves
//! [`Socket::recv_from`]. Routing holds the socket lock only to look up the
//! Conn and never takes a Conn's lock.

use crate::config::Config;
use crate::conn::{Conn, ConnInner, Delivery, DELIVERY_QUEUE};
use crate::error::{Result, UtpError};
use crate::header::{now_timestamp, Header, PacketType};
use crate::pool::{BufferPool, PooledBuf, MAX_DATAGRAM};
use crate::stats::{bump, Counters, Stats};
use crate::timer::{TimerHandle, TimerService};
use crate::transport::{bind_udp, is_poll_timeout, PacketConn};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Datagrams queued between the reader and the dispatcher.
const READ_QUEUE: usize = 100;

/// Foreign datagrams held for `recv_from`; more are dropped.
const UNUSED_READS: usize = 100;

/// How often blocked transport reads wake to check for teardown.
const READER_POLL: Duration = Duration::from_millis(100);

/// Random picks tried before connection id allocation scans.
const CONN_ID_TRIES: usize = 64;

/// Identifies a Conn inside one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    remote: SocketAddr,
    id: u16,
}

struct ConnEntry {
    conn: Arc<ConnInner>,
    /// Dropping this ends the Conn's delivery loop.
    tx: flume::Sender<Delivery>,
}

/// A SYN waiting for `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Syn {
    seq_nr: u16,
    conn_id: u16,
    addr: SocketAddr,
}

#[derive(Default)]
struct SocketState {
    conns: HashMap<ConnKey, ConnEntry>,
    backlog: HashSet<Syn>,
    closing: bool,
    read_err: Option<UtpError>,
}

struct Datagram {
    packet: PooledBuf,
    from: SocketAddr,
}

pub(crate) struct SocketInner {
    transport: Box<dyn PacketConn>,
    local_addr: SocketAddr,
    pub(crate) config: Config,
    state: Mutex<SocketState>,
    event: Condvar,
    pub(crate) pool: BufferPool,
    pub(crate) timers: TimerHandle,
    timer_service: Mutex<Option<TimerService>>,
    pub(crate) stats: Counters,
    unused_tx: flume::Sender<Datagram>,
    unused_rx: flume::Receiver<Datagram>,
    read_deadline: Mutex<Option<Instant>>,
    destroyed: AtomicBool,
}

impl SocketInner {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn write_to(&self, packet: &[u8], addr: SocketAddr) -> io::Result<()> {
        let n = self.transport.send_to(packet, addr)?;
        bump(&self.stats.packets_sent);
        if n != packet.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short datagram write"));
        }
        Ok(())
    }

    /// Sends a bare RESET, as a reply to traffic that has no Conn.
    fn reset(&self, addr: SocketAddr, ack_nr: u16, conn_id: u16) {
        let mut header = Header::new(PacketType::Reset, conn_id, 0, ack_nr);
        header.timestamp = now_timestamp();
        let mut packet = self.pool.get(header.encoded_len());
        let sent = header
            .marshal_into(&mut packet)
            .and_then(|_| self.write_to(&packet, addr).map_err(UtpError::from));
        match sent {
            Ok(()) => bump(&self.stats.resets_sent),
            Err(_err) => trace_warn!(remote = %addr, error = %_err, "failed to send reset"),
        }
    }

    fn read_loop(&self, tx: flume::Sender<Datagram>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while !self.destroyed.load(Ordering::Acquire) {
            match self.transport.recv_from(&mut buf) {
                Ok((n, from)) => {
                    bump(&self.stats.packets_read);
                    let datagram = Datagram {
                        packet: self.pool.copy_from(&buf[..n]),
                        from,
                    };
                    if tx.send(datagram).is_err() {
                        return;
                    }
                }
                Err(e) if is_poll_timeout(&e) => continue,
                // Some platforms report ICMP unreachables on unconnected sockets.
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    // Conns already established run on until their own
                    // timeouts fire.
                    trace_warn!(local = %self.local_addr, error = %e, "socket read failed, reader stopping");
                    self.state.lock().read_err = Some(UtpError::Io(e));
                    self.event.notify_all();
                    return;
                }
            }
        }
    }

    fn dispatch_loop(&self, rx: flume::Receiver<Datagram>) {
        for datagram in rx.iter() {
            self.dispatch(datagram);
        }
    }

    fn dispatch(&self, datagram: Datagram) {
        let Datagram { packet, from } = datagram;
        let (header, offset) = match Header::unmarshal(&packet) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.unused_read(Datagram { packet, from });
                return;
            }
        };

        // A SYN carries the dialer's recv_id; ours is one above it.
        let id = if header.packet_type == PacketType::Syn {
            header.conn_id.wrapping_add(1)
        } else {
            header.conn_id
        };
        let key = ConnKey { remote: from, id };

        let mut state = self.state.lock();
        if let Some(entry) = state.conns.get(&key) {
            if header.packet_type == PacketType::Syn && header.conn_id != entry.conn.send_id {
                // The id belongs to a Conn we dialed out, not one the peer
                // can be opening.
                drop(state);
                trace_debug!(remote = %from, conn_id = header.conn_id, "resetting conflicting syn");
                self.reset(from, header.seq_nr, header.conn_id);
                return;
            }
            let tx = entry.tx.clone();
            drop(state);
            // Fails only once the Conn has detached.
            let _ = tx.send(Delivery::new(header, packet, offset));
            return;
        }

        match header.packet_type {
            PacketType::Syn => {
                let syn = Syn {
                    seq_nr: header.seq_nr,
                    conn_id: header.conn_id,
                    addr: from,
                };
                if state.closing {
                    drop(state);
                    self.reset(from, syn.seq_nr, syn.conn_id);
                } else {
                    self.push_backlog(&mut state, syn);
                }
            }
            // Late traffic for a Conn that is already gone.
            PacketType::Reset => {
                drop(state);
                self.unused_read(Datagram { packet, from });
            }
            _ => {
                drop(state);
                trace_trace!(remote = %from, conn_id = header.conn_id, "resetting unexpected packet");
                // Either side of the id pair may be the one that is gone.
                self.reset(from, header.seq_nr, header.conn_id);
                self.reset(from, header.seq_nr, header.conn_id.wrapping_sub(1));
                self.reset(from, header.seq_nr, header.conn_id.wrapping_add(1));
                self.unused_read(Datagram { packet, from });
            }
        }
    }

    fn push_backlog(&self, state: &mut SocketState, syn: Syn) {
        if state.backlog.contains(&syn) {
            return;
        }
        let mut rng = rand::thread_rng();
        while state.backlog.len() >= self.config.backlog {
            let pick = rng.gen_range(0..state.backlog.len());
            let Some(victim) = state.backlog.iter().nth(pick).copied() else {
                break;
            };
            state.backlog.remove(&victim);
            trace_debug!(remote = %victim.addr, conn_id = victim.conn_id, "backlog full, evicting syn");
            // SYNs are sent on the peer's recv_id, so that is where it listens.
            self.reset(victim.addr, victim.seq_nr, victim.conn_id);
        }
        state.backlog.insert(syn);
        self.event.notify_all();
    }

    fn unused_read(&self, datagram: Datagram) {
        match self.unused_tx.try_send(datagram) {
            Ok(()) => bump(&self.stats.unused_reads),
            Err(_) => {
                bump(&self.stats.unused_reads_dropped);
                trace_trace!(local = %self.local_addr, "dropped unused read");
            }
        }
    }

    fn new_conn_id(&self, state: &SocketState, remote: SocketAddr) -> Option<u16> {
        pick_conn_id(|id| state.conns.contains_key(&ConnKey { remote, id }))
    }

    /// Adds `conn` to the table and starts its delivery loop and detacher.
    fn register(self: &Arc<Self>, state: &mut SocketState, conn: Arc<ConnInner>) -> Result<()> {
        let key = ConnKey {
            remote: conn.remote,
            id: conn.recv_id,
        };
        if state.conns.contains_key(&key) {
            return Err(UtpError::Registration(format!(
                "id {} already in use for {}",
                key.id, key.remote
            )));
        }

        let (tx, rx) = flume::bounded(DELIVERY_QUEUE);
        let delivery = conn.clone();
        thread::Builder::new()
            .name(format!("utp-deliver-{}", key.id))
            .spawn(move || delivery.run_delivery(rx))?;
        let detacher = conn.clone();
        let socket = self.clone();
        thread::Builder::new()
            .name(format!("utp-detach-{}", key.id))
            .spawn(move || {
                detacher.wait_closed();
                socket.detach(key);
            })?;

        state.conns.insert(key, ConnEntry { conn, tx });
        Ok(())
    }

    fn detach(&self, key: ConnKey) {
        let mut state = self.state.lock();
        state.conns.remove(&key);
        trace_debug!(remote = %key.remote, id = key.id, "conn detached");
        self.lazy_destroy(&mut state);
    }

    /// Releases the transport once the socket is closing and empty.
    fn lazy_destroy(&self, state: &mut SocketState) {
        if !state.closing || !state.conns.is_empty() {
            return;
        }
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.timer_service.lock().take();
        if let Some(registry) = &self.config.registry {
            registry.unregister(self);
        }
        trace_debug!(local = %self.local_addr, "socket destroyed");
        self.event.notify_all();
    }

    pub(crate) fn write_status(&self, w: &mut impl io::Write) -> io::Result<()> {
        let state = self.state.lock();
        writeln!(
            w,
            "socket {}: {} conns, {} pending syns{}",
            self.local_addr,
            state.conns.len(),
            state.backlog.len(),
            if state.closing { " (closing)" } else { "" }
        )?;
        for entry in state.conns.values() {
            entry.conn.write_status(w)?;
        }
        Ok(())
    }
}

/// An id such that neither it nor its neighbours is `used`.
fn pick_conn_id(used: impl Fn(u16) -> bool) -> Option<u16> {
    let free = |id: u16| {
        [id.wrapping_sub(1), id, id.wrapping_add(1)]
            .into_iter()
            .all(|id| !used(id))
    };
    let mut rng = rand::thread_rng();
    for _ in 0..CONN_ID_TRIES {
        let id: u16 = rng.gen();
        if free(id) {
            return Some(id);
        }
    }
    let start: u16 = rng.gen();
    (0..=u16::MAX)
        .map(|i| start.wrapping_add(i))
        .find(|&id| free(id))
}

fn resolve(addr: impl ToSocketAddrs) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| UtpError::invalid_addr(e.to_string()))?
        .next()
        .ok_or_else(|| UtpError::invalid_addr("no addresses resolved"))
}

fn take_datagram(datagram: Datagram, buf: &mut [u8]) -> (usize, SocketAddr) {
    let n = buf.len().min(datagram.packet.len());
    buf[..n].copy_from_slice(&datagram.packet[..n]);
    (n, datagram.from)
}

/// Hosts any number of [`Conn`]s over one datagram endpoint.
///
/// Datagrams that do not parse as protocol traffic are kept for
/// [`Socket::recv_from`], so another protocol can share the endpoint.
/// Dropping the Socket closes it; the endpoint is released once every Conn
/// has detached.
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    /// Binds a UDP socket with the default [`Config`].
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::bind_with_config(addr, Config::default())
    }

    pub fn bind_with_config(addr: impl ToSocketAddrs, config: Config) -> Result<Self> {
        let addr = resolve(addr)?;
        let udp = bind_udp(addr, config.socket_buffer_size)?;
        Self::from_packet_conn(udp, config)
    }

    /// Runs the protocol over an existing datagram transport.
    pub fn from_packet_conn<P: PacketConn>(transport: P, config: Config) -> Result<Self> {
        let local_addr = transport.local_addr()?;
        transport.set_read_timeout(Some(READER_POLL))?;
        let timer_service = TimerService::spawn("utp-timer")?;
        let (unused_tx, unused_rx) = flume::bounded(UNUSED_READS);
        let inner = Arc::new(SocketInner {
            transport: Box::new(transport),
            local_addr,
            config,
            state: Mutex::new(SocketState::default()),
            event: Condvar::new(),
            pool: BufferPool::new(),
            timers: timer_service.handle(),
            timer_service: Mutex::new(Some(timer_service)),
            stats: Counters::default(),
            unused_tx,
            unused_rx,
            read_deadline: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        let (tx, rx) = flume::bounded(READ_QUEUE);
        let spawned = {
            let reader = inner.clone();
            thread::Builder::new()
                .name("utp-reader".into())
                .spawn(move || reader.read_loop(tx))
        }
        .and_then(|_| {
            let dispatcher = inner.clone();
            thread::Builder::new()
                .name("utp-dispatch".into())
                .spawn(move || dispatcher.dispatch_loop(rx))
        });
        if let Err(e) = spawned {
            inner.destroyed.store(true, Ordering::Release);
            return Err(e.into());
        }

        if let Some(registry) = &inner.config.registry {
            registry.register(&inner);
        }
        trace_debug!(local = %local_addr, "socket bound");
        Ok(Self { inner })
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<SocketInner> {
        &self.inner
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Blocks until a peer's SYN is waiting, then answers it.
    pub fn accept(&self) -> Result<Conn> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        loop {
            if state.closing {
                return Err(UtpError::SocketClosed);
            }
            let Some(syn) = state.backlog.iter().next().copied() else {
                inner.event.wait(&mut state);
                continue;
            };
            state.backlog.remove(&syn);

            let key = ConnKey {
                remote: syn.addr,
                id: syn.conn_id.wrapping_add(1),
            };
            if let Some(existing) = state.conns.get(&key).map(|e| e.conn.clone()) {
                if existing.send_id == syn.conn_id {
                    // A resent SYN for a Conn already accepted.
                    existing.send_state();
                } else {
                    inner.reset(syn.addr, syn.seq_nr, syn.conn_id);
                }
                continue;
            }

            let conn = ConnInner::accepting(inner, syn.addr, syn.conn_id, syn.seq_nr);
            inner.register(&mut state, conn.clone())?;
            conn.send_state();
            trace_debug!(conn = %conn, "accepted");
            return Ok(Conn::new(conn));
        }
    }

    /// Connects to `addr`, waiting as long as the SYN keeps being resent.
    pub fn dial(&self, addr: impl ToSocketAddrs) -> Result<Conn> {
        self.dial_deadline(resolve(addr)?, None)
    }

    /// Connects to `addr`, failing with [`UtpError::Timeout`] if the
    /// handshake has not completed within `timeout`.
    pub fn dial_timeout(&self, addr: impl ToSocketAddrs, timeout: Duration) -> Result<Conn> {
        self.dial_deadline(resolve(addr)?, Some(Instant::now() + timeout))
    }

    fn dial_deadline(&self, remote: SocketAddr, deadline: Option<Instant>) -> Result<Conn> {
        let inner = &self.inner;
        let conn = {
            let mut state = inner.state.lock();
            if state.closing {
                return Err(UtpError::SocketClosed);
            }
            let recv_id = inner
                .new_conn_id(&state, remote)
                .ok_or_else(|| UtpError::Registration(format!("no free connection id for {remote}")))?;
            let conn = ConnInner::dialing(inner, remote, recv_id);
            inner.register(&mut state, conn.clone())?;
            conn
        };
        trace_debug!(conn = %conn, "dialing");
        conn.connect(deadline)?;
        Ok(Conn::new(conn))
    }

    /// Stops accepting. Pending SYNs are reset and blocked `accept` and
    /// `recv_from` calls return. Live Conns keep running; the endpoint is
    /// released after the last one detaches.
    pub fn close(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.closing {
            return;
        }
        state.closing = true;
        for syn in std::mem::take(&mut state.backlog) {
            inner.reset(syn.addr, syn.seq_nr, syn.conn_id);
        }
        trace_debug!(local = %inner.local_addr, conns = state.conns.len(), "socket closing");
        inner.event.notify_all();
        inner.lazy_destroy(&mut state);
    }

    /// Receives the next datagram that did not parse as protocol traffic.
    /// Bytes beyond `buf` are discarded.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let inner = &self.inner;
        loop {
            if let Ok(datagram) = inner.unused_rx.try_recv() {
                return Ok(take_datagram(datagram, buf));
            }
            {
                let state = inner.state.lock();
                if state.closing {
                    return Err(UtpError::SocketClosed);
                }
                if let Some(err) = &state.read_err {
                    return Err(err.clone());
                }
            }
            let now = Instant::now();
            let wait = match *inner.read_deadline.lock() {
                Some(at) if at <= now => return Err(UtpError::Timeout),
                Some(at) => (at - now).min(READER_POLL),
                None => READER_POLL,
            };
            if let Ok(datagram) = inner.unused_rx.recv_timeout(wait) {
                return Ok(take_datagram(datagram, buf));
            }
        }
    }

    /// Writes a raw datagram through the shared endpoint.
    pub fn send_to(&self, buf: &[u8], addr: impl ToSocketAddrs) -> Result<usize> {
        let addr = resolve(addr)?;
        Ok(self.inner.transport.send_to(buf, addr)?)
    }

    /// Deadline for [`Socket::recv_from`]. `None` blocks indefinitely.
    pub fn set_read_deadline(&self, at: Option<Instant>) {
        *self.inner.read_deadline.lock() = at;
    }

    pub fn stats(&self) -> Stats {
        self.inner.stats.snapshot()
    }

    /// The error that stopped the reader, if one did.
    pub fn read_error(&self) -> Option<UtpError> {
        self.inner.state.lock().read_err.clone()
    }

    pub fn write_status(&self, w: &mut impl io::Write) -> io::Result<()> {
        self.inner.write_status(w)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("local", &self.inner.local_addr)
            .finish()
    }
}
