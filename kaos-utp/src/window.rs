//! Receive window for out-of-order inbound segments.
//!
//! Slot `i` holds the segment with sequence number `ack_nr + 1 + i`. Slots
//! only ever leave from the front, once every earlier segment has arrived.

use crate::header::{PacketType, SelectiveAck};
use crate::pool::PooledBuf;
use std::collections::VecDeque;

/// A received DATA or FIN packet waiting for reassembly.
pub(crate) struct InboundSegment {
    pub kind: PacketType,
    packet: PooledBuf,
    offset: usize,
}

impl InboundSegment {
    pub(crate) fn new(kind: PacketType, packet: PooledBuf, offset: usize) -> Self {
        Self {
            kind,
            packet,
            offset,
        }
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.packet[self.offset..]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Insert {
    Stored,
    Duplicate,
    TooFarAhead,
}

pub(crate) struct InboundWindow {
    slots: VecDeque<Option<InboundSegment>>,
    max_slots: usize,
    /// Payload bytes held in slots
    bytes: usize,
}

impl InboundWindow {
    pub(crate) fn new(max_slots: usize) -> Self {
        Self {
            slots: VecDeque::new(),
            max_slots,
            bytes: 0,
        }
    }

    pub(crate) fn insert(&mut self, index: usize, segment: InboundSegment) -> Insert {
        if matches!(self.slots.get(index), Some(Some(_))) {
            return Insert::Duplicate;
        }
        if index >= self.max_slots {
            return Insert::TooFarAhead;
        }
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        self.bytes += segment.payload().len();
        self.slots[index] = Some(segment);
        Insert::Stored
    }

    /// Whether the next in-order segment has arrived.
    pub(crate) fn front_ready(&self) -> bool {
        matches!(self.slots.front(), Some(Some(_)))
    }

    /// Removes the next in-order segment if it has arrived.
    pub(crate) fn pop_ready(&mut self) -> Option<InboundSegment> {
        if !self.front_ready() {
            return None;
        }
        let segment = self.slots.pop_front().flatten()?;
        self.bytes -= segment.payload().len();
        Some(segment)
    }

    /// Bitmask of segments held beyond the first gap. Bit `i` covers slot
    /// `i + 1`.
    pub(crate) fn selective_ack(&self) -> SelectiveAck {
        let mut sack = SelectiveAck::default();
        for (i, slot) in self.slots.iter().enumerate().skip(1).take(SelectiveAck::BITS) {
            if slot.is_some() {
                sack.set(i - 1);
            }
        }
        sack
    }

    /// Slots tracked, including gaps.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn buffered(&self) -> usize {
        self.bytes
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    fn segment(pool: &BufferPool, payload: &[u8]) -> InboundSegment {
        let mut packet = vec![0u8; 4];
        packet.extend_from_slice(payload);
        InboundSegment::new(PacketType::Data, pool.copy_from(&packet), 4)
    }

    #[test]
    fn out_of_order_then_fill_gap() {
        let pool = BufferPool::new();
        let mut w = InboundWindow::new(8);
        assert_eq!(w.insert(2, segment(&pool, b"c")), Insert::Stored);
        assert_eq!(w.insert(1, segment(&pool, b"b")), Insert::Stored);
        assert!(w.pop_ready().is_none());
        assert_eq!(w.len(), 3);
        assert_eq!(w.buffered(), 2);

        assert_eq!(w.insert(0, segment(&pool, b"a")), Insert::Stored);
        let got: Vec<u8> = std::iter::from_fn(|| w.pop_ready())
            .flat_map(|s| s.payload().to_vec())
            .collect();
        assert_eq!(got, b"abc");
        assert_eq!(w.len(), 0);
        assert_eq!(w.buffered(), 0);
    }

    #[test]
    fn duplicates_and_too_far() {
        let pool = BufferPool::new();
        let mut w = InboundWindow::new(4);
        assert_eq!(w.insert(1, segment(&pool, b"x")), Insert::Stored);
        assert_eq!(w.insert(1, segment(&pool, b"x")), Insert::Duplicate);
        assert_eq!(w.insert(4, segment(&pool, b"y")), Insert::TooFarAhead);
        assert_eq!(w.buffered(), 1);
    }

    #[test]
    fn selective_ack_skips_front_slot() {
        let pool = BufferPool::new();
        let mut w = InboundWindow::new(256);
        w.insert(1, segment(&pool, b"1"));
        w.insert(3, segment(&pool, b"3"));
        w.insert(100, segment(&pool, b"far"));
        let sack = w.selective_ack();
        assert!(sack.is_set(0));
        assert!(!sack.is_set(1));
        assert!(sack.is_set(2));
        // slot 100 is past the 64-bit mask
        assert_eq!(sack.as_bytes(), &[0b101, 0, 0, 0, 0, 0, 0, 0]);
    }
}
