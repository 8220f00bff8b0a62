//! Byte-stream verification for testing reassembly correctness.

use std::sync::atomic::{AtomicU64, Ordering};

/// Byte at `offset` of the deterministic test stream.
///
/// Period is 251 (prime), so misplaced segments of any MTU-ish size show up
/// as mismatches instead of aliasing onto identical bytes.
#[inline]
pub fn pattern_byte(offset: u64) -> u8 {
    (offset % 251) as u8 ^ ((offset / 251) as u8).rotate_left(3)
}

/// The first `len` bytes of the test stream.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len as u64).map(pattern_byte).collect()
}

/// Checks a reassembled stream chunk by chunk, however the reader splits it.
///
/// # Example
///
/// ```
/// use kaos_test_support::verify::{pattern, StreamVerifier, VerifyResult};
///
/// let data = pattern(1000);
/// let verifier = StreamVerifier::new(1000);
/// assert_eq!(verifier.feed(&data[..300]), VerifyResult::Ok);
/// assert_eq!(verifier.feed(&data[300..]), VerifyResult::Ok);
/// assert!(verifier.is_complete());
/// ```
pub struct StreamVerifier {
    expected_len: u64,
    received: AtomicU64,
    mismatches: AtomicU64,
    /// Offset of the first bad byte, `u64::MAX` when none
    first_mismatch: AtomicU64,
    chunks: AtomicU64,
}

impl StreamVerifier {
    pub fn new(expected_len: usize) -> Self {
        Self {
            expected_len: expected_len as u64,
            received: AtomicU64::new(0),
            mismatches: AtomicU64::new(0),
            first_mismatch: AtomicU64::new(u64::MAX),
            chunks: AtomicU64::new(0),
        }
    }

    /// Verify the next chunk of the stream
    pub fn feed(&self, chunk: &[u8]) -> VerifyResult {
        let start = self.received.fetch_add(chunk.len() as u64, Ordering::SeqCst);
        self.chunks.fetch_add(1, Ordering::Relaxed);

        if start + chunk.len() as u64 > self.expected_len {
            self.mismatches.fetch_add(1, Ordering::Relaxed);
            return VerifyResult::Overrun {
                offset: self.expected_len.max(start),
            };
        }

        let bad = chunk
            .iter()
            .zip(start..)
            .find(|&(&byte, offset)| byte != pattern_byte(offset));
        match bad {
            None => VerifyResult::Ok,
            Some((&actual, offset)) => {
                self.mismatches.fetch_add(1, Ordering::Relaxed);
                let _ = self.first_mismatch.compare_exchange(
                    u64::MAX,
                    offset,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                VerifyResult::Mismatch {
                    offset,
                    expected: pattern_byte(offset),
                    actual,
                }
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received.load(Ordering::SeqCst) == self.expected_len && !self.has_errors()
    }

    pub fn has_errors(&self) -> bool {
        self.mismatches.load(Ordering::Relaxed) > 0
    }

    /// Get verification statistics
    pub fn stats(&self) -> VerifyStats {
        let first = self.first_mismatch.load(Ordering::SeqCst);
        VerifyStats {
            expected_len: self.expected_len,
            received: self.received.load(Ordering::SeqCst),
            chunks: self.chunks.load(Ordering::Relaxed),
            mismatches: self.mismatches.load(Ordering::Relaxed),
            first_mismatch: (first != u64::MAX).then_some(first),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Ok,
    Mismatch { offset: u64, expected: u8, actual: u8 },
    /// More bytes than the stream should hold
    Overrun { offset: u64 },
}

#[derive(Debug, Clone)]
pub struct VerifyStats {
    pub expected_len: u64,
    pub received: u64,
    pub chunks: u64,
    pub mismatches: u64,
    pub first_mismatch: Option<u64>,
}

impl VerifyStats {
    pub fn delivery_rate(&self) -> f64 {
        if self.expected_len > 0 {
            (self.received as f64) / (self.expected_len as f64)
        } else {
            1.0
        }
    }
}
