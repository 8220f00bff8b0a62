//! Congestion Control (AIMD)
//!
//! Additive Increase Multiplicative Decrease over bytes in flight. Write
//! consults [`CongestionController::can_send`] alongside the peer's advertised
//! window; the controller also keeps the RTT samples that drive resend timing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// RTT samples kept for the resend timeout mean.
pub const MAX_LATENCIES: usize = 10;

/// AIMD congestion controller
#[derive(Debug)]
pub struct CongestionController {
    /// Current window size (bytes)
    window: usize,
    /// Never shrink below this, so at least two segments can fly
    min_window: usize,
    max_window: usize,
    /// Slow start threshold
    ssthresh: usize,
    segment: usize,
    last_loss: Option<Instant>,
    initial_latency: Duration,
    latencies: VecDeque<Duration>,
}

impl CongestionController {
    pub fn new(segment: usize, max_window: usize, initial_latency: Duration) -> Self {
        let min_window = segment * 2;
        let max_window = max_window.max(min_window);
        Self {
            window: (segment * 4).min(max_window),
            min_window,
            max_window,
            ssthresh: max_window / 2,
            segment,
            last_loss: None,
            initial_latency,
            latencies: VecDeque::with_capacity(MAX_LATENCIES),
        }
    }

    /// Another segment may go out when what is already in flight fits under
    /// both our window and the peer's advertised window.
    #[inline]
    pub fn can_send(&self, in_flight: usize, peer_window: usize) -> bool {
        in_flight <= peer_window.min(self.window)
    }

    /// Bytes acknowledged (additive increase)
    pub fn on_ack(&mut self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let grow = if self.window < self.ssthresh {
            // Slow start
            bytes
        } else {
            // Congestion avoidance: about one segment per window's worth
            (self.segment * bytes / self.window).max(1)
        };
        self.window = (self.window + grow).min(self.max_window);
    }

    /// A send needed retransmitting (multiplicative decrease), at most once
    /// per mean RTT.
    pub fn on_loss(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_loss {
            if now.duration_since(last) < self.latency() {
                return;
            }
        }
        self.ssthresh = (self.window / 2).max(self.min_window);
        self.window = self.ssthresh;
        self.last_loss = Some(now);
    }

    pub fn record_latency(&mut self, sample: Duration) {
        if self.latencies.len() == MAX_LATENCIES {
            self.latencies.pop_front();
        }
        self.latencies.push_back(sample);
    }

    /// Ceiling mean of the recorded samples, or the initial estimate.
    pub fn latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return self.initial_latency;
        }
        let total: u128 = self.latencies.iter().map(Duration::as_nanos).sum();
        let n = self.latencies.len() as u128;
        Duration::from_nanos(total.div_ceil(n) as u64)
    }

    pub fn window_size(&self) -> usize {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEG: usize = 1000;

    fn controller() -> CongestionController {
        CongestionController::new(SEG, 100 * SEG, Duration::from_millis(400))
    }

    #[test]
    fn test_aimd() {
        let mut cc = controller();
        let start = cc.window_size();
        for _ in 0..5 {
            cc.on_ack(SEG);
        }
        assert!(cc.window_size() > start);

        let before = cc.window_size();
        cc.on_loss();
        assert!(cc.window_size() < before);
    }

    #[test]
    fn test_window_bounded_by_max() {
        let mut cc = CongestionController::new(SEG, 20 * SEG, Duration::from_millis(1));
        for _ in 0..1000 {
            cc.on_ack(SEG);
        }
        assert_eq!(cc.window_size(), 20 * SEG);
    }

    #[test]
    fn test_loss_backoff_floor() {
        let mut cc = CongestionController::new(SEG, 20 * SEG, Duration::ZERO);
        for _ in 0..20 {
            cc.on_loss();
        }
        assert_eq!(cc.window_size(), 2 * SEG);
        assert!(cc.can_send(2 * SEG, usize::MAX));
    }

    #[test]
    fn test_loss_throttled_per_rtt() {
        let mut cc = controller();
        cc.on_loss();
        let after_first = cc.window_size();
        cc.on_loss();
        assert_eq!(cc.window_size(), after_first);
    }

    #[test]
    fn test_can_send_respects_peer_window() {
        let cc = controller();
        assert!(cc.can_send(0, 0));
        assert!(!cc.can_send(1, 0));
        assert!(cc.can_send(SEG, 2 * SEG));
        assert!(!cc.can_send(cc.window_size() + 1, usize::MAX));
    }

    #[test]
    fn test_latency_mean() {
        let mut cc = controller();
        assert_eq!(cc.latency(), Duration::from_millis(400));
        cc.record_latency(Duration::from_nanos(1));
        cc.record_latency(Duration::from_nanos(2));
        // ceil(3 / 2)
        assert_eq!(cc.latency(), Duration::from_nanos(2));
        for _ in 0..MAX_LATENCIES {
            cc.record_latency(Duration::from_millis(10));
        }
        assert_eq!(cc.latency(), Duration::from_millis(10));
    }
}
