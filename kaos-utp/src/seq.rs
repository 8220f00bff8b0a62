//! 16-bit sequence number arithmetic.

/// Modular "a comes before b". Holds when `b` is 1..=0x8000 steps ahead of
/// `a`; at exactly 0x8000 apart both directions compare true.
#[inline]
pub fn seq_less(a: u16, b: u16) -> bool {
    let d = b.wrapping_sub(a);
    d != 0 && d <= 0x8000
}

/// Distance from `from` forward to `to`.
#[inline]
pub fn seq_diff(to: u16, from: u16) -> usize {
    to.wrapping_sub(from) as usize
}
