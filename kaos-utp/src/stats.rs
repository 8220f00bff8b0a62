//! Per-socket packet counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub packets_read: AtomicU64,
    pub packets_sent: AtomicU64,
    pub unused_reads: AtomicU64,
    pub unused_reads_dropped: AtomicU64,
    pub resets_sent: AtomicU64,
    pub states_sent: AtomicU64,
    pub states_suppressed: AtomicU64,
    pub timeout_resends: AtomicU64,
    pub fast_resends: AtomicU64,
    pub deliveries: AtomicU64,
    pub duplicates: AtomicU64,
    pub too_far_ahead: AtomicU64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    pub(crate) fn snapshot(&self) -> Stats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Stats {
            packets_read: get(&self.packets_read),
            packets_sent: get(&self.packets_sent),
            unused_reads: get(&self.unused_reads),
            unused_reads_dropped: get(&self.unused_reads_dropped),
            resets_sent: get(&self.resets_sent),
            states_sent: get(&self.states_sent),
            states_suppressed: get(&self.states_suppressed),
            timeout_resends: get(&self.timeout_resends),
            fast_resends: get(&self.fast_resends),
            deliveries: get(&self.deliveries),
            duplicates: get(&self.duplicates),
            too_far_ahead: get(&self.too_far_ahead),
        }
    }
}

/// Point-in-time copy of a socket's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Datagrams pulled off the transport
    pub packets_read: u64,
    /// Protocol packets written, resends and resets included
    pub packets_sent: u64,
    /// Datagrams handed to `Socket::recv_from`
    pub unused_reads: u64,
    /// Foreign datagrams dropped because nobody was reading them
    pub unused_reads_dropped: u64,
    pub resets_sent: u64,
    pub states_sent: u64,
    /// Owed acks that rode on a data packet instead of a bare STATE
    pub states_suppressed: u64,
    pub timeout_resends: u64,
    /// Resends triggered by selective-ack skips
    pub fast_resends: u64,
    pub deliveries: u64,
    pub duplicates: u64,
    pub too_far_ahead: u64,
}
