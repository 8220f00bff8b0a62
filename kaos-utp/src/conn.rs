//! Per-connection reliability state machine.
//!
//! All mutable state sits behind one lock per Conn. Three kinds of threads
//! touch it: the Conn's delivery loop (inbound packets), the socket's timer
//! thread (resends and deadlines) and callers of the blocking API. Every state
//! change is followed by a broadcast on the Conn's condvar; blocked callers
//! re-check their conditions on wake.

use crate::congestion::CongestionController;
use crate::error::{Result, UtpError};
use crate::header::{now_timestamp, Header, PacketType, SelectiveAck, MAX_HEADER_SIZE};
use crate::pool::{PooledBuf, MTU};
use crate::seq::{seq_diff, seq_less};
use crate::socket::SocketInner;
use crate::stats::bump;
use crate::timer::{jitter, Timer};
use crate::window::{InboundSegment, InboundWindow, Insert};
use bytes::{Buf, BytesMut};
use flume::RecvTimeoutError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Largest payload carried by one DATA packet.
pub const MAX_PAYLOAD: usize = MTU - MAX_HEADER_SIZE;

/// Packets queued from the dispatcher to one Conn.
pub(crate) const DELIVERY_QUEUE: usize = 100;

/// How long the delivery loop keeps draining back-to-back packets before it
/// decides whether a bare ack is still owed.
const DELIVERY_BATCH: Duration = Duration::from_micros(500);

/// Selective-ack skip counts that trigger an immediate resend.
const FAST_RESEND_SKIPS: [u32; 2] = [3, 60];

/// A parsed packet routed to a Conn. `packet` still holds the header bytes;
/// the payload starts at `offset`.
pub(crate) struct Delivery {
    header: Header,
    packet: PooledBuf,
    offset: usize,
}

impl Delivery {
    pub(crate) fn new(header: Header, packet: PooledBuf, offset: usize) -> Self {
        Self {
            header,
            packet,
            offset,
        }
    }
}

/// One outstanding outbound packet.
struct UnackedSend {
    kind: PacketType,
    payload: Option<PooledBuf>,
    size: usize,
    started: Instant,
    acked: bool,
    timer: Timer,
    num_resends: u32,
    acks_skipped: u32,
}

struct ConnState {
    /// Next outbound sequence number
    seq_nr: u16,
    /// Last inbound sequence number consumed in order
    ack_nr: u16,
    /// Every send up to and including this one is acknowledged
    last_ack: u16,
    last_time_diff: u32,
    peer_wnd_size: usize,
    /// Payload bytes in flight
    cur_window: usize,
    /// Sends `last_ack + 1 ..` in order; trimmed only from the front
    unacked: VecDeque<UnackedSend>,
    inbound: InboundWindow,
    read_buf: BytesMut,
    congestion: CongestionController,

    sent_syn: bool,
    syn_acked: bool,
    got_fin: bool,
    wrote_fin: bool,
    closed: bool,
    closing: bool,
    destroyed: bool,
    /// A bare STATE is owed to the peer
    pending_send_state: bool,
    err: Option<UtpError>,

    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl ConnState {
    /// Position in `unacked` of the send carrying `seq`.
    fn unacked_index(&self, seq: u16) -> Option<usize> {
        if !seq_less(self.last_ack, seq) {
            return None;
        }
        let i = seq_diff(seq, self.last_ack) - 1;
        (i < self.unacked.len()).then_some(i)
    }

    fn terminal_error(&self) -> UtpError {
        self.err.clone().unwrap_or(UtpError::Closed)
    }
}

fn passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|at| at <= Instant::now())
}

fn arm(timer: &Timer, at: Option<Instant>) {
    match at {
        Some(at) => timer.reset(at.saturating_duration_since(Instant::now())),
        None => {
            timer.stop();
        }
    }
}

/// Deadline timers only wake waiters; the waiters decide what passed.
fn waker(conn: Weak<ConnInner>) -> impl Fn() + Send + Sync + 'static {
    move || {
        if let Some(conn) = conn.upgrade() {
            let _state = conn.state.lock();
            conn.event.notify_all();
        }
    }
}

pub(crate) struct ConnInner {
    pub(crate) recv_id: u16,
    pub(crate) send_id: u16,
    pub(crate) remote: SocketAddr,
    socket: Arc<SocketInner>,
    state: Mutex<ConnState>,
    event: Condvar,
    read_timer: Timer,
    write_timer: Timer,
    created: Instant,
}

impl ConnInner {
    fn new(
        socket: &Arc<SocketInner>,
        remote: SocketAddr,
        recv_id: u16,
        send_id: u16,
        seq_nr: u16,
        ack_nr: u16,
        syn_acked: bool,
    ) -> Arc<Self> {
        let config = &socket.config;
        let state = ConnState {
            seq_nr,
            ack_nr,
            last_ack: seq_nr.wrapping_sub(1),
            last_time_diff: 0,
            peer_wnd_size: 0,
            cur_window: 0,
            unacked: VecDeque::new(),
            inbound: InboundWindow::new(config.max_unacked_inbound),
            read_buf: BytesMut::new(),
            congestion: CongestionController::new(
                MAX_PAYLOAD,
                config.max_unacked_sends * MAX_PAYLOAD,
                config.initial_latency,
            ),
            sent_syn: syn_acked,
            syn_acked,
            got_fin: false,
            wrote_fin: false,
            closed: false,
            closing: false,
            destroyed: false,
            pending_send_state: false,
            err: None,
            read_deadline: None,
            write_deadline: None,
        };
        Arc::new_cyclic(|weak| ConnInner {
            recv_id,
            send_id,
            remote,
            socket: socket.clone(),
            state: Mutex::new(state),
            event: Condvar::new(),
            read_timer: socket.timers.timer(waker(weak.clone())),
            write_timer: socket.timers.timer(waker(weak.clone())),
            created: Instant::now(),
        })
    }

    /// A Conn about to send a SYN from `recv_id`.
    pub(crate) fn dialing(socket: &Arc<SocketInner>, remote: SocketAddr, recv_id: u16) -> Arc<Self> {
        Self::new(socket, remote, recv_id, recv_id.wrapping_add(1), 1, 0, false)
    }

    /// A Conn answering the SYN `(conn_id, seq_nr)`. The SYN itself proves
    /// the handshake started, so it begins established.
    pub(crate) fn accepting(
        socket: &Arc<SocketInner>,
        remote: SocketAddr,
        syn_conn_id: u16,
        syn_seq_nr: u16,
    ) -> Arc<Self> {
        Self::new(
            socket,
            remote,
            syn_conn_id.wrapping_add(1),
            syn_conn_id,
            rand::random(),
            syn_seq_nr,
            true,
        )
    }

    fn conn_id_for(&self, kind: PacketType) -> u16 {
        // A SYN advertises the id the peer must answer on.
        if kind == PacketType::Syn {
            self.recv_id
        } else {
            self.send_id
        }
    }

    fn wnd_size(&self, st: &ConnState) -> usize {
        let config = &self.socket.config;
        if st.inbound.len() > config.max_unacked_inbound / 2 {
            return 0;
        }
        let buffered = st.read_buf.len() + st.inbound.buffered();
        config.recv_window.saturating_sub(buffered)
    }

    fn resend_timeout(&self, st: &ConnState) -> Duration {
        let l = st.congestion.latency();
        jitter(3 * l, l)
    }

    /// Builds and transmits one packet carrying the current ack state.
    fn send_packet(
        &self,
        st: &mut ConnState,
        kind: PacketType,
        conn_id: u16,
        seq_nr: u16,
        payload: &[u8],
    ) -> Result<()> {
        let mut header = Header::new(kind, conn_id, seq_nr, st.ack_nr);
        header.timestamp = now_timestamp();
        header.timestamp_diff = st.last_time_diff;
        header.wnd_size = self.wnd_size(st).min(u32::MAX as usize) as u32;
        header
            .extensions
            .push(st.inbound.selective_ack().into_extension());

        let mut packet = self.socket.pool.get(header.encoded_len() + payload.len());
        let n = header.marshal_into(&mut packet)?;
        packet[n..].copy_from_slice(payload);
        self.socket.write_to(&packet, self.remote)?;

        let stats = &self.socket.stats;
        match kind {
            PacketType::State => bump(&stats.states_sent),
            PacketType::Reset => bump(&stats.resets_sent),
            _ if st.pending_send_state => bump(&stats.states_suppressed),
            _ => {}
        }
        // Every packet carries ack_nr, so any send settles an owed ack.
        st.pending_send_state = false;
        Ok(())
    }

    /// Sends a sequenced packet and tracks it until acknowledged. Payload
    /// beyond [`MAX_PAYLOAD`] is left for the caller's next write.
    fn write(self: &Arc<Self>, st: &mut ConnState, kind: PacketType, payload: &[u8]) -> Result<usize> {
        let payload = &payload[..payload.len().min(MAX_PAYLOAD)];
        let seq_nr = st.seq_nr;
        if let Err(err) = self.send_packet(st, kind, self.conn_id_for(kind), seq_nr, payload) {
            self.destroy(st, err.clone());
            return Err(err);
        }

        let conn = Arc::downgrade(self);
        let timer = self.socket.timers.timer(move || {
            if let Some(conn) = conn.upgrade() {
                conn.timeout_resend(seq_nr);
            }
        });
        timer.reset(self.resend_timeout(st));
        st.unacked.push_back(UnackedSend {
            kind,
            payload: (!payload.is_empty()).then(|| self.socket.pool.copy_from(payload)),
            size: payload.len(),
            started: Instant::now(),
            acked: false,
            timer,
            num_resends: 0,
            acks_skipped: 0,
        });
        st.cur_window += payload.len();
        st.seq_nr = seq_nr.wrapping_add(1);
        Ok(payload.len())
    }

    fn resend(&self, st: &mut ConnState, index: usize) -> Result<()> {
        let kind = st.unacked[index].kind;
        let seq_nr = st.last_ack.wrapping_add(1).wrapping_add(index as u16);
        let payload = st.unacked[index].payload.take();
        let result = self.send_packet(
            st,
            kind,
            self.conn_id_for(kind),
            seq_nr,
            payload.as_deref().unwrap_or(&[]),
        );
        st.unacked[index].payload = payload;
        result
    }

    fn timeout_resend(&self, seq_nr: u16) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.destroyed {
            return;
        }
        let Some(index) = st.unacked_index(seq_nr) else {
            return;
        };
        if st.unacked[index].acked {
            return;
        }
        if st.unacked[index].started.elapsed() >= self.socket.config.write_timeout {
            trace_debug!(conn = %self, seq_nr, "send timed out waiting for ack");
            self.destroy(st, UtpError::AckTimeout);
            return;
        }

        let rt = self.resend_timeout(st);
        if let Err(_err) = self.resend(st, index) {
            trace_warn!(conn = %self, seq_nr, error = %_err, "resend failed");
        }
        bump(&self.socket.stats.timeout_resends);
        trace_trace!(conn = %self, seq_nr, "timeout resend");
        st.congestion.on_loss();
        let send = &mut st.unacked[index];
        send.num_resends += 1;
        send.timer.reset(rt * send.num_resends);
    }

    /// Marks one send acknowledged, then trims acknowledged sends off the
    /// front.
    fn ack(&self, st: &mut ConnState, seq_nr: u16) {
        let Some(index) = st.unacked_index(seq_nr) else {
            return;
        };
        let send = &mut st.unacked[index];
        if !send.acked {
            send.acked = true;
            send.timer.stop();
            send.payload = None;
            let size = send.size;
            // Samples from resent packets are ambiguous.
            let latency = (send.num_resends == 0).then(|| send.started.elapsed());
            st.cur_window -= size;
            st.congestion.on_ack(size);
            if let Some(latency) = latency {
                st.congestion.record_latency(latency);
            }
        }
        while st.unacked.front().is_some_and(|s| s.acked) {
            st.unacked.pop_front();
            st.last_ack = st.last_ack.wrapping_add(1);
        }
    }

    /// Cumulative ack of everything up to and including `nr`.
    fn ack_to(&self, st: &mut ConnState, nr: u16) {
        if !seq_less(nr, st.seq_nr) {
            // Acks something never sent.
            return;
        }
        while seq_less(st.last_ack, nr) {
            let before = st.last_ack;
            self.ack(st, before.wrapping_add(1));
            if st.last_ack == before {
                break;
            }
        }
    }

    fn ack_skipped(&self, st: &mut ConnState, seq_nr: u16) {
        let Some(index) = st.unacked_index(seq_nr) else {
            return;
        };
        let send = &mut st.unacked[index];
        if send.acked {
            return;
        }
        send.acks_skipped += 1;
        if !FAST_RESEND_SKIPS.contains(&send.acks_skipped) {
            return;
        }
        let backoff = send.num_resends.max(1);
        trace_debug!(conn = %self, seq_nr, skipped = send.acks_skipped, "fast resend");
        bump(&self.socket.stats.fast_resends);
        if let Err(_err) = self.resend(st, index) {
            trace_warn!(conn = %self, seq_nr, error = %_err, "fast resend failed");
        }
        st.congestion.on_loss();
        let rt = self.resend_timeout(st);
        st.unacked[index].timer.reset(rt * backoff);
    }

    fn apply_acks(&self, st: &mut ConnState, h: &Header) {
        self.ack_to(st, h.ack_nr);
        let Some(sack) = h.selective_ack() else {
            return;
        };
        self.ack_skipped(st, h.ack_nr.wrapping_add(1));
        for i in 0..sack.bit_len() {
            let seq_nr = h.ack_nr.wrapping_add(2).wrapping_add(i as u16);
            if sack.is_set(i) {
                self.ack(st, seq_nr);
            } else {
                self.ack_skipped(st, seq_nr);
            }
        }
    }

    /// Moves the in-order prefix of the inbound window into the read buffer.
    fn process_inbound(&self, st: &mut ConnState) {
        let limit = self.socket.config.recv_window;
        while !st.got_fin && st.read_buf.len() < limit {
            let Some(segment) = st.inbound.pop_ready() else {
                break;
            };
            st.ack_nr = st.ack_nr.wrapping_add(1);
            st.read_buf.extend_from_slice(segment.payload());
            if segment.kind == PacketType::Fin {
                st.got_fin = true;
            }
        }
    }

    fn process_delivery(&self, st: &mut ConnState, delivery: Delivery) {
        let stats = &self.socket.stats;
        bump(&stats.deliveries);
        let Delivery {
            header: h,
            packet,
            offset,
        } = delivery;

        st.peer_wnd_size = h.wnd_size as usize;
        if st.destroyed {
            // Answered with a RESET once the batch ends.
            if h.packet_type != PacketType::Reset {
                st.pending_send_state = true;
            }
            return;
        }
        // A resent SYN carries no ack state.
        if h.packet_type != PacketType::Syn {
            self.apply_acks(st, &h);
        }
        st.last_time_diff = if h.timestamp == 0 {
            0
        } else {
            now_timestamp().wrapping_sub(h.timestamp)
        };

        match h.packet_type {
            PacketType::Reset => {
                self.destroy(st, UtpError::PeerReset);
                return;
            }
            PacketType::State if !st.syn_acked => {
                st.syn_acked = true;
                st.ack_nr = h.seq_nr.wrapping_sub(1);
                trace_debug!(conn = %self, "connected");
                return;
            }
            // Only the SYN's ack completes a handshake.
            _ if !st.syn_acked => return,
            PacketType::State => return,
            _ => {}
        }

        st.pending_send_state = true;
        if !seq_less(st.ack_nr, h.seq_nr) {
            bump(&stats.duplicates);
            return;
        }
        let index = seq_diff(h.seq_nr, st.ack_nr) - 1;
        match st
            .inbound
            .insert(index, InboundSegment::new(h.packet_type, packet, offset))
        {
            Insert::Stored => self.process_inbound(st),
            Insert::Duplicate => bump(&stats.duplicates),
            Insert::TooFarAhead => {
                bump(&stats.too_far_ahead);
                trace_trace!(conn = %self, index, seq_nr = h.seq_nr, "dropped packet too far ahead");
            }
        }
    }

    fn update_states(&self, st: &mut ConnState) {
        if !st.closed && st.wrote_fin && st.got_fin && st.unacked.len() <= 1 {
            st.closed = true;
            trace_debug!(conn = %self, "closed");
        }
    }

    fn handle_delivery(&self, delivery: Delivery) {
        let mut st = self.state.lock();
        self.process_delivery(&mut st, delivery);
        self.update_states(&mut st);
        self.event.notify_all();
    }

    fn send_pending_state(&self, st: &mut ConnState) {
        if !st.pending_send_state {
            return;
        }
        let kind = if st.destroyed {
            PacketType::Reset
        } else {
            PacketType::State
        };
        let seq_nr = st.seq_nr;
        if let Err(_err) = self.send_packet(st, kind, self.send_id, seq_nr, &[]) {
            trace_warn!(conn = %self, error = %_err, "failed to send ack");
        }
    }

    /// Sends a bare STATE now, owed or not.
    pub(crate) fn send_state(&self) {
        let mut st = self.state.lock();
        let seq_nr = st.seq_nr;
        if let Err(_err) = self.send_packet(&mut st, PacketType::State, self.send_id, seq_nr, &[]) {
            trace_warn!(conn = %self, error = %_err, "failed to send state");
        }
    }

    /// Consumes packets routed by the socket until the socket drops this
    /// Conn's queue.
    pub(crate) fn run_delivery(self: Arc<Self>, rx: flume::Receiver<Delivery>) {
        let idle = self.socket.config.packet_read_timeout;
        loop {
            match rx.recv_timeout(idle) {
                Ok(delivery) => {
                    self.handle_delivery(delivery);
                    let batch_end = Instant::now() + DELIVERY_BATCH;
                    while let Ok(delivery) = rx.recv_deadline(batch_end) {
                        self.handle_delivery(delivery);
                    }
                    let mut st = self.state.lock();
                    self.send_pending_state(&mut st);
                }
                Err(RecvTimeoutError::Timeout) => {
                    let mut st = self.state.lock();
                    self.destroy(&mut st, UtpError::IdleTimeout);
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Blocks until the Conn reaches the closed state.
    pub(crate) fn wait_closed(&self) {
        let mut st = self.state.lock();
        while !st.closed {
            self.event.wait(&mut st);
        }
    }

    /// Terminates the Conn with `err`. The first cause is the one reported.
    fn destroy(&self, st: &mut ConnState, err: UtpError) {
        if st.destroyed {
            return;
        }
        trace_debug!(conn = %self, reason = %err, "conn destroyed");
        st.destroyed = true;
        st.closed = true;
        st.err = Some(err);
        for send in &st.unacked {
            send.timer.stop();
        }
        // Gaps can no longer fill; already ordered bytes stay readable.
        st.inbound.clear();
        self.read_timer.stop();
        self.write_timer.stop();
        self.event.notify_all();
    }

    /// Sends the SYN and waits for its ack.
    pub(crate) fn connect(self: &Arc<Self>, deadline: Option<Instant>) -> Result<()> {
        let mut st = self.state.lock();
        self.write(&mut st, PacketType::Syn, &[])?;
        st.sent_syn = true;
        loop {
            if st.destroyed {
                return Err(st.terminal_error());
            }
            if st.syn_acked {
                return Ok(());
            }
            match deadline {
                Some(at) if at <= Instant::now() => {
                    self.destroy(&mut st, UtpError::Timeout);
                    return Err(UtpError::Timeout);
                }
                Some(at) => {
                    self.event.wait_until(&mut st, at);
                }
                None => self.event.wait(&mut st),
            }
        }
    }

    fn write_fin(self: &Arc<Self>, st: &mut ConnState) {
        if st.wrote_fin || st.destroyed {
            return;
        }
        if self.write(st, PacketType::Fin, &[]).is_ok() {
            st.wrote_fin = true;
            self.event.notify_all();
        }
    }

    pub(crate) fn write_status(&self, w: &mut impl io::Write) -> io::Result<()> {
        let st = self.state.lock();
        let flags: Vec<&str> = [
            (st.sent_syn, "sent_syn"),
            (st.syn_acked, "syn_acked"),
            (st.got_fin, "got_fin"),
            (st.wrote_fin, "wrote_fin"),
            (st.closing, "closing"),
            (st.closed, "closed"),
            (st.destroyed, "destroyed"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        writeln!(
            w,
            "  {}: age={:?} seq={} ack={} last_ack={} unacked={} cur_window={} cwnd={} peer_wnd={} inbound={} read_buf={} [{}]",
            self,
            self.created.elapsed(),
            st.seq_nr,
            st.ack_nr,
            st.last_ack,
            st.unacked.len(),
            st.cur_window,
            st.congestion.window_size(),
            st.peer_wnd_size,
            st.inbound.len(),
            st.read_buf.len(),
            flags.join(" "),
        )
    }
}

impl fmt::Display for ConnInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.recv_id, self.send_id, self.remote)
    }
}

/// A reliable, ordered byte stream to one peer.
///
/// Obtained from [`Socket::dial`](crate::Socket::dial),
/// [`Socket::accept`](crate::Socket::accept) or the crate-level
/// [`dial`](crate::dial). Dropping a Conn without calling [`Conn::close`]
/// still sends a FIN, without waiting for its ack.
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl Conn {
    pub(crate) fn new(inner: Arc<ConnInner>) -> Self {
        Self { inner }
    }

    /// Reads buffered in-order bytes, blocking until some arrive. Returns
    /// `Ok(0)` once the peer's FIN has been reached.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let inner = &self.inner;
        let mut st = inner.state.lock();
        loop {
            if !st.read_buf.is_empty() {
                break;
            }
            if st.got_fin {
                return Ok(0);
            }
            if st.destroyed {
                return Err(st.terminal_error());
            }
            if passed(st.read_deadline) {
                return Err(UtpError::Timeout);
            }
            inner.event.wait(&mut st);
        }

        let was_shut = inner.wnd_size(&st) == 0;
        let ack_before = st.ack_nr;
        let n = buf.len().min(st.read_buf.len());
        buf[..n].copy_from_slice(&st.read_buf[..n]);
        st.read_buf.advance(n);

        // Segments held back by a full read buffer can move up now.
        inner.process_inbound(&mut st);
        if (was_shut && inner.wnd_size(&st) > 0) || st.ack_nr != ack_before {
            let seq_nr = st.seq_nr;
            if let Err(_err) = inner.send_packet(&mut st, PacketType::State, inner.send_id, seq_nr, &[]) {
                trace_warn!(conn = %inner, error = %_err, "failed to send window update");
            }
        }
        inner.update_states(&mut st);
        Ok(n)
    }

    /// Writes all of `buf`, blocking while the send window is full. If an
    /// error interrupts a write that already sent bytes, the count sent so
    /// far is returned instead.
    pub fn write(&self, mut buf: &[u8]) -> Result<usize> {
        let inner = &self.inner;
        let config = &inner.socket.config;
        let mut st = inner.state.lock();
        let mut written = 0;
        while !buf.is_empty() {
            let blocked = if st.destroyed {
                Some(st.terminal_error())
            } else if st.wrote_fin || st.got_fin {
                Some(UtpError::Closed)
            } else if passed(st.write_deadline) {
                Some(UtpError::Timeout)
            } else {
                None
            };
            if let Some(err) = blocked {
                return if written > 0 { Ok(written) } else { Err(err) };
            }

            // A zero peer window still admits one packet so it can reopen.
            if st.syn_acked
                && st.unacked.len() < config.max_unacked_sends
                && st.congestion.can_send(st.cur_window, st.peer_wnd_size)
            {
                match inner.write(&mut st, PacketType::Data, buf) {
                    Ok(n) => {
                        written += n;
                        buf = &buf[n..];
                    }
                    Err(err) if written == 0 => return Err(err),
                    Err(_) => return Ok(written),
                }
                continue;
            }
            inner.event.wait(&mut st);
        }
        Ok(written)
    }

    /// Sends FIN and waits until it is the only unacknowledged packet, or
    /// the Conn fails.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        st.closing = true;
        inner.event.notify_all();
        inner.write_fin(&mut st);
        loop {
            if st.wrote_fin && st.unacked.len() <= 1 {
                return Ok(());
            }
            if st.destroyed {
                return Err(st.terminal_error());
            }
            inner.event.wait(&mut st);
        }
    }

    /// Sets both deadlines. `None` clears them.
    pub fn set_deadline(&self, at: Option<Instant>) {
        self.set_read_deadline(at);
        self.set_write_deadline(at);
    }

    /// Reads still blocked at `at` fail with [`UtpError::Timeout`]; the Conn
    /// stays usable.
    pub fn set_read_deadline(&self, at: Option<Instant>) {
        let mut st = self.inner.state.lock();
        st.read_deadline = at;
        arm(&self.inner.read_timer, at);
        self.inner.event.notify_all();
    }

    pub fn set_write_deadline(&self, at: Option<Instant>) {
        let mut st = self.inner.state.lock();
        st.write_deadline = at;
        arm(&self.inner.write_timer, at);
        self.inner.event.notify_all();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.socket.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.remote
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        let mut st = self.inner.state.lock();
        if !st.closing {
            st.closing = true;
            self.inner.write_fin(&mut st);
        }
    }
}

impl fmt::Display for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "utp {} -> {} ({}/{})",
            self.local_addr(),
            self.inner.remote,
            self.inner.recv_id,
            self.inner.send_id
        )
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("local", &self.local_addr())
            .field("remote", &self.inner.remote)
            .field("recv_id", &self.inner.recv_id)
            .field("send_id", &self.inner.send_id)
            .finish()
    }
}

impl io::Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Conn::read(self, buf).map_err(Into::into)
    }
}

impl io::Read for &Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Conn::read(self, buf).map_err(Into::into)
    }
}

impl io::Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Conn::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for &Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Conn::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_UNACKED_INBOUND, RECV_WINDOW};
    use crate::Socket;
    use std::net::UdpSocket;

    struct Harness {
        socket: Socket,
        sink: UdpSocket,
        conn: Arc<ConnInner>,
    }

    /// A dialed Conn, not registered with its socket, whose peer is a plain
    /// UDP socket the test reads from.
    fn harness() -> Harness {
        let socket = Socket::bind("127.0.0.1:0").unwrap();
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        sink.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let conn = ConnInner::dialing(socket.inner(), sink.local_addr().unwrap(), 100);
        {
            let mut st = conn.state.lock();
            st.syn_acked = true;
            st.peer_wnd_size = 1 << 20;
        }
        Harness { socket, sink, conn }
    }

    fn recv_header(sink: &UdpSocket) -> Header {
        let mut buf = [0u8; 2048];
        let (n, _) = sink.recv_from(&mut buf).unwrap();
        Header::unmarshal(&buf[..n]).unwrap().0
    }

    fn ack_header(ack_nr: u16, sack_bits: &[usize]) -> Header {
        let mut h = Header::new(PacketType::State, 100, 9, ack_nr);
        let mut sack = SelectiveAck::default();
        for &bit in sack_bits {
            sack.set(bit);
        }
        h.extensions.push(sack.into_extension());
        h
    }

    fn delivery(conn: &ConnInner, header: Header, payload: &[u8]) -> Delivery {
        let mut bytes = header.to_bytes().unwrap();
        let offset = bytes.len();
        bytes.extend_from_slice(payload);
        Delivery::new(header, conn.socket.pool.copy_from(&bytes), offset)
    }

    fn data(seq_nr: u16) -> Header {
        Header::new(PacketType::Data, 100, seq_nr, 0)
    }

    fn contiguous(st: &ConnState) -> bool {
        st.last_ack.wrapping_add(1).wrapping_add(st.unacked.len() as u16) == st.seq_nr
    }

    #[test]
    fn selective_ack_fast_retransmit() {
        let h = harness();
        let mut st = h.conn.state.lock();
        for _ in 0..5 {
            h.conn.write(&mut st, PacketType::Data, b"x").unwrap();
        }
        let sent: Vec<u16> = (0..5).map(|_| recv_header(&h.sink).seq_nr).collect();
        assert_eq!(sent, vec![1, 2, 3, 4, 5]);

        // ack 1, with 3 and 5 seen: 2 and 4 are skipped
        let ack = ack_header(1, &[0, 2]);
        h.conn.apply_acks(&mut st, &ack);
        assert_eq!(st.last_ack, 1);
        let acked: Vec<bool> = st.unacked.iter().map(|s| s.acked).collect();
        assert_eq!(acked, vec![false, true, false, true]);
        assert_eq!(st.unacked[0].acks_skipped, 1);
        assert_eq!(st.unacked[2].acks_skipped, 1);
        assert!(contiguous(&st));

        h.conn.apply_acks(&mut st, &ack);
        assert_eq!(h.socket.stats().fast_resends, 0);
        h.conn.apply_acks(&mut st, &ack);
        assert_eq!(st.unacked[2].acks_skipped, 3);
        assert_eq!(h.socket.stats().fast_resends, 2);

        let mut resent: Vec<u16> = (0..2).map(|_| recv_header(&h.sink).seq_nr).collect();
        resent.sort_unstable();
        assert_eq!(resent, vec![2, 4]);
        assert_eq!(st.cur_window, 2);
    }

    #[test]
    fn short_selective_ack_skips_only_reported_range() {
        let h = harness();
        let mut st = h.conn.state.lock();
        for _ in 0..40 {
            h.conn.write(&mut st, PacketType::Data, b"x").unwrap();
        }
        // 4-byte mask: 3..=34 seen, nothing said about 35..=40
        let mut ack = Header::new(PacketType::State, 100, 9, 1);
        ack.extensions.push(SelectiveAck::from_bytes(&[0xff; 4]).into_extension());
        for _ in 0..3 {
            h.conn.apply_acks(&mut st, &ack);
        }
        assert_eq!(st.last_ack, 1);
        assert_eq!(st.unacked[0].acks_skipped, 3);
        assert!(st.unacked.iter().skip(1).take(32).all(|s| s.acked));
        assert!(st
            .unacked
            .iter()
            .skip(33)
            .all(|s| !s.acked && s.acks_skipped == 0));
        assert_eq!(h.socket.stats().fast_resends, 1);
    }

    #[test]
    fn resent_syn_leaves_outbound_acks_alone() {
        let socket = Socket::bind("127.0.0.1:0").unwrap();
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        let conn = ConnInner::accepting(socket.inner(), sink.local_addr().unwrap(), 300, 41);
        let mut st = conn.state.lock();
        st.peer_wnd_size = 1 << 20;
        // starting just below the wrap, so 0 lies ahead of last_ack
        st.seq_nr = u16::MAX - 1;
        st.last_ack = st.seq_nr.wrapping_sub(1);
        for _ in 0..4 {
            conn.write(&mut st, PacketType::Data, b"y").unwrap();
        }
        assert_eq!(st.seq_nr, 2);

        let syn = Header::new(PacketType::Syn, 300, 41, 0);
        conn.process_delivery(&mut st, delivery(&conn, syn, b""));
        assert_eq!(st.unacked.len(), 4);
        assert!(st.unacked.iter().all(|s| !s.acked));
        assert_eq!(st.cur_window, 4);
        // still owes the peer a STATE for its duplicate
        assert!(st.pending_send_state);
        assert_eq!(socket.stats().duplicates, 1);
    }

    #[test]
    fn ack_trimming_keeps_run_contiguous() {
        let h = harness();
        let mut st = h.conn.state.lock();
        for _ in 0..20 {
            h.conn.write(&mut st, PacketType::Data, b"abc").unwrap();
        }
        let mut last_len = st.unacked.len();
        for nr in [0u16, 3, 3, 7, 12, 20, 25] {
            h.conn.ack_to(&mut st, nr);
            assert!(st.unacked.len() <= last_len);
            assert!(contiguous(&st));
            last_len = st.unacked.len();
        }
        // 25 was never sent, so 20 is the last honoured ack
        assert_eq!(st.last_ack, 20);
        assert!(st.unacked.is_empty());
        assert_eq!(st.cur_window, 0);
    }

    #[test]
    fn handshake_state_sets_ack_nr() {
        let socket = Socket::bind("127.0.0.1:0").unwrap();
        let conn = ConnInner::dialing(socket.inner(), "127.0.0.1:9".parse().unwrap(), 7);
        let mut st = conn.state.lock();
        // data before the handshake completes is ignored
        conn.process_delivery(&mut st, delivery(&conn, data(500), b"early"));
        assert!(!st.syn_acked);
        let state = Header::new(PacketType::State, 7, 500, 0);
        conn.process_delivery(&mut st, delivery(&conn, state, b""));
        assert!(st.syn_acked);
        assert_eq!(st.ack_nr, 499);
        assert!(st.read_buf.is_empty());
    }

    #[test]
    fn reassembles_out_of_order_and_fin() {
        let h = harness();
        let conn = &h.conn;
        let mut st = conn.state.lock();
        st.ack_nr = 10;
        conn.process_delivery(&mut st, delivery(conn, data(13), b"!"));
        conn.process_delivery(&mut st, delivery(conn, data(12), b"world"));
        assert!(st.read_buf.is_empty());
        assert_eq!(st.inbound.selective_ack().as_bytes()[0], 0b11);

        conn.process_delivery(&mut st, delivery(conn, data(11), b"hello "));
        assert_eq!(&st.read_buf[..], b"hello world!");
        assert_eq!(st.ack_nr, 13);
        assert!(st.pending_send_state);

        // duplicate of something already consumed
        conn.process_delivery(&mut st, delivery(conn, data(12), b"world"));
        assert_eq!(h.socket.stats().duplicates, 1);

        let fin = Header::new(PacketType::Fin, 100, 14, 0);
        conn.process_delivery(&mut st, delivery(conn, fin, b""));
        assert!(st.got_fin);
        assert_eq!(st.ack_nr, 14);
    }

    #[test]
    fn too_far_ahead_dropped() {
        let h = harness();
        let mut st = h.conn.state.lock();
        st.ack_nr = 0;
        let far = MAX_UNACKED_INBOUND as u16 + 1;
        h.conn
            .process_delivery(&mut st, delivery(&h.conn, data(far), b"x"));
        assert_eq!(st.inbound.len(), 0);
        assert_eq!(h.socket.stats().too_far_ahead, 1);
    }

    #[test]
    fn window_closes_under_backpressure() {
        let h = harness();
        let mut st = h.conn.state.lock();
        assert_eq!(h.conn.wnd_size(&st), RECV_WINDOW);
        st.read_buf.extend_from_slice(&vec![0u8; RECV_WINDOW]);
        assert_eq!(h.conn.wnd_size(&st), 0);
        st.read_buf.clear();
        // out-of-order slots beyond half the inbound cap
        st.ack_nr = 0;
        let far = (MAX_UNACKED_INBOUND / 2 + 2) as u16;
        h.conn
            .process_delivery(&mut st, delivery(&h.conn, data(far), b"x"));
        assert_eq!(h.conn.wnd_size(&st), 0);
    }

    #[test]
    fn reset_destroys_with_peer_reset() {
        let h = harness();
        let mut st = h.conn.state.lock();
        let reset = Header::new(PacketType::Reset, 100, 0, 0);
        h.conn
            .process_delivery(&mut st, delivery(&h.conn, reset, b""));
        assert!(st.destroyed && st.closed);
        assert!(matches!(st.terminal_error(), UtpError::PeerReset));
        // a later cause does not replace the first
        h.conn.destroy(&mut st, UtpError::IdleTimeout);
        assert!(matches!(st.err, Some(UtpError::PeerReset)));
    }

    #[test]
    fn write_truncates_to_max_payload() {
        let h = harness();
        let mut st = h.conn.state.lock();
        let big = vec![7u8; MAX_PAYLOAD * 2];
        assert_eq!(h.conn.write(&mut st, PacketType::Data, &big).unwrap(), MAX_PAYLOAD);
        let mut buf = [0u8; 2048];
        let (n, _) = h.sink.recv_from(&mut buf).unwrap();
        assert_eq!(n, MTU);
    }
}
