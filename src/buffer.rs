//! Pooled write buffers.
//!
//! Outbound bytes travel in fixed-capacity buffers checked out of a shared
//! [`BufferPool`]. The checkout handle [`PooledBuf`] is move-only: a buffer
//! lives in exactly one place (a write queue, or in flight back to the
//! pool), and [`BufferPool::release`] consumes the handle, so writing after
//! release or releasing twice does not compile.

use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A fixed-capacity byte buffer on loan from a [`BufferPool`].
///
/// Deliberately neither `Clone` nor `Copy`.
pub struct PooledBuf {
    data: Vec<u8>,
}

impl PooledBuf {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }
    pub fn remaining_capacity(&self) -> usize {
        self.data.capacity() - self.data.len()
    }
    /// Append bytes. Callers chunk by `remaining_capacity`; growing past the
    /// pooled capacity would defeat the fixed sizing.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        debug_assert!(
            bytes.len() <= self.remaining_capacity(),
            "pooled buffer overflow: {} > {}",
            bytes.len(),
            self.remaining_capacity()
        );
        self.data.extend_from_slice(bytes);
    }
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Lock-free pool of write buffers shared by all reactors and writer
/// handles.
///
/// `acquire` pops the free list or allocates a fresh buffer; it never
/// blocks and never fails. The pool holds no upper bound on the free list;
/// `allocated` exposes the high-water count so a host can watch growth.
pub struct BufferPool {
    free: SegQueue<Vec<u8>>,
    buf_capacity: usize,
    allocated: AtomicUsize,
}

impl BufferPool {
    pub fn new(buf_capacity: usize) -> Self {
        assert!(buf_capacity > 0, "buffer capacity must be > 0");
        Self {
            free: SegQueue::new(),
            buf_capacity,
            allocated: AtomicUsize::new(0),
        }
    }

    /// Check a buffer out of the pool. The buffer starts empty with the
    /// pool's fixed capacity.
    pub fn acquire(&self) -> PooledBuf {
        let data = match self.free.pop() {
            Some(mut data) => {
                data.clear();
                data
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.buf_capacity)
            }
        };
        PooledBuf { data }
    }

    /// Return a buffer to the pool. Consumes the handle.
    pub fn release(&self, buf: PooledBuf) {
        self.free.push(buf.data);
    }

    /// Capacity of each pooled buffer.
    pub fn buf_capacity(&self) -> usize {
        self.buf_capacity
    }

    /// Total buffers ever allocated. While every checkout is released back
    /// this equals the high-water mark of buffers simultaneously live;
    /// buffers dropped instead of released stay counted.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Buffers currently resting on the free list.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_acquire_allocates_once() {
        let pool = BufferPool::new(64);
        let buf = pool.acquire();
        assert_eq!(buf.capacity(), 64);
        assert!(buf.is_empty());
        assert_eq!(pool.allocated(), 1);

        pool.release(buf);
        assert_eq!(pool.idle(), 1);

        // recycled, not reallocated.
        let buf = pool.acquire();
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.idle(), 0);
        pool.release(buf);
    }

    #[test]
    pub fn test_recycled_buffer_is_cleared() {
        let pool = BufferPool::new(16);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"stale bytes");
        pool.release(buf);

        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 16);
    }

    #[test]
    pub fn test_fill_and_remaining() {
        let pool = BufferPool::new(8);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"abc");
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.remaining_capacity(), 5);
        assert_eq!(buf.as_slice(), b"abc");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.remaining_capacity(), 8);
    }
}
