//! Size-classed datagram buffer pool.
//!
//! A [`PooledBuf`] is owned by exactly one holder (a pending send, an inbound
//! segment, or a packet on its way to the transport) and goes back to its
//! class free list when dropped.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Path MTU the protocol sizes packets for.
pub const MTU: usize = 1232;

/// Largest datagram the reader accepts (foreign traffic included).
pub const MAX_DATAGRAM: usize = 0x10000;

const SIZE_CLASSES: [usize; 2] = [MTU, MAX_DATAGRAM];

/// Free buffers kept per class; extras are released to the allocator.
const RETAIN_PER_CLASS: usize = 512;

struct PoolShared {
    classes: [Mutex<Vec<Vec<u8>>>; SIZE_CLASSES.len()],
}

#[derive(Clone)]
pub(crate) struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                classes: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            }),
        }
    }

    /// Borrows a zeroed buffer of exactly `len` bytes.
    pub(crate) fn get(&self, len: usize) -> PooledBuf {
        let class = SIZE_CLASSES.iter().position(|&size| len <= size);
        let mut buf = match class {
            Some(idx) => self.shared.classes[idx]
                .lock()
                .pop()
                .unwrap_or_else(|| Vec::with_capacity(SIZE_CLASSES[idx])),
            None => Vec::with_capacity(len),
        };
        buf.resize(len, 0);
        PooledBuf {
            buf,
            class,
            pool: self.shared.clone(),
        }
    }

    pub(crate) fn copy_from(&self, data: &[u8]) -> PooledBuf {
        let mut buf = self.get(data.len());
        buf.copy_from_slice(data);
        buf
    }

    #[cfg(test)]
    fn free_len(&self, class: usize) -> usize {
        self.shared.classes[class].lock().len()
    }
}

pub(crate) struct PooledBuf {
    buf: Vec<u8>,
    class: Option<usize>,
    pool: Arc<PoolShared>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let Some(class) = self.class else { return };
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let mut free = self.pool.classes[class].lock();
        if free.len() < RETAIN_PER_CLASS {
            free.push(buf);
        }
    }
}
