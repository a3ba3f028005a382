//! Property tests for the write-buffer pool.

use netcycle::{BufferPool, PooledBuf};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// The pool allocates a fresh buffer only when no idle one exists, so
    /// the allocation counter equals the high-water mark of live buffers
    /// however acquires and releases interleave.
    #[test]
    fn prop_pool_allocates_only_at_high_water(
        capacity in 1usize..64,
        ops in proptest::collection::vec(any::<bool>(), 1..256),
    ) {
        let pool = BufferPool::new(capacity);
        let mut live: Vec<PooledBuf> = Vec::new();
        let mut high_water = 0usize;
        for acquire in ops {
            if acquire || live.is_empty() {
                let buf = pool.acquire();
                prop_assert!(buf.is_empty());
                prop_assert_eq!(buf.capacity(), capacity);
                live.push(buf);
                high_water = high_water.max(live.len());
            } else {
                let buf = live.pop().unwrap();
                pool.release(buf);
            }
            prop_assert_eq!(pool.allocated(), high_water);
            prop_assert_eq!(pool.idle(), pool.allocated() - live.len());
        }
        for buf in live.drain(..) {
            pool.release(buf);
        }
        prop_assert_eq!(pool.idle(), pool.allocated());
    }

    /// A released buffer always comes back empty, whatever was written
    /// into it before.
    #[test]
    fn prop_recycled_buffers_come_back_empty(
        chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..32),
            1..64,
        ),
    ) {
        let pool = BufferPool::new(32);
        for chunk in &chunks {
            let mut buf = pool.acquire();
            prop_assert!(buf.is_empty());
            prop_assert_eq!(buf.remaining_capacity(), 32);
            buf.extend_from_slice(chunk);
            prop_assert_eq!(buf.len(), chunk.len());
            prop_assert_eq!(buf.as_slice(), chunk.as_slice());
            pool.release(buf);
        }
        // one buffer kept cycling the whole time.
        prop_assert_eq!(pool.allocated(), 1);
        prop_assert_eq!(pool.idle(), 1);
    }
}
