//! Buddy sub-allocator over one fixed-size buffer.
//!
//! The buffer spans `min_block_size << level` bytes. A block of order `k`
//! is `min_block_size << k` bytes and always starts at a multiple of its own
//! size, so its buddy is found by flipping one bit of its block index.

use crate::error::{GpuError, Result};
use castor3d_core::math::ceil_log2;
use hashbrown::HashMap;
use std::collections::BTreeSet;

/// Block allocator handing out byte offsets into one buffer.
#[derive(Debug, Clone)]
pub struct GpuBufferAllocator {
    level: u32,
    min_block_size: u64,
    /// Free block offsets, indexed by order.
    free: Vec<BTreeSet<u64>>,
    /// Live allocations: offset to order.
    allocated: HashMap<u64, u32>,
    allocated_bytes: u64,
}

impl GpuBufferAllocator {
    /// Create an allocator for `2^level` blocks of `min_block_size` bytes.
    pub fn new(level: u32, min_block_size: u64) -> Self {
        let min_block_size = min_block_size.max(1);
        let mut free = vec![BTreeSet::new(); level as usize + 1];
        free[level as usize].insert(0);

        Self {
            level,
            min_block_size,
            free,
            allocated: HashMap::new(),
            allocated_bytes: 0,
        }
    }

    /// Total bytes managed.
    pub const fn capacity(&self) -> u64 {
        self.min_block_size << self.level
    }

    pub const fn level(&self) -> u32 {
        self.level
    }

    pub const fn min_block_size(&self) -> u64 {
        self.min_block_size
    }

    /// Bytes held by live allocations, rounded to their block sizes.
    pub const fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    pub fn live_allocations(&self) -> usize {
        self.allocated.len()
    }

    /// Size of the block backing the allocation at `offset`.
    pub fn block_size_at(&self, offset: u64) -> Option<u64> {
        self.allocated
            .get(&offset)
            .map(|&order| self.block_size(order))
    }

    const fn block_size(&self, order: u32) -> u64 {
        self.min_block_size << order
    }

    fn order_for(&self, size: u64) -> Option<u32> {
        let blocks = size.max(1).div_ceil(self.min_block_size);
        let order = ceil_log2(blocks);
        (order <= self.level).then_some(order)
    }

    /// Whether `allocate(size)` would succeed.
    pub fn has_available(&self, size: u64) -> bool {
        self.order_for(size).is_some_and(|order| {
            self.free[order as usize..]
                .iter()
                .any(|blocks| !blocks.is_empty())
        })
    }

    /// Reserve a block of at least `size` bytes.
    ///
    /// The lowest free offset of the smallest fitting order is used, splitting
    /// a larger block when needed. Returns `None` when no block fits.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        let order = self.order_for(size)?;
        let found = (order..=self.level).find(|&k| !self.free[k as usize].is_empty())?;
        let offset = self.free[found as usize].pop_first()?;

        let mut k = found;
        while k > order {
            k -= 1;
            let buddy = offset + self.block_size(k);
            self.free[k as usize].insert(buddy);
        }

        self.allocated.insert(offset, order);
        self.allocated_bytes += self.block_size(order);
        Some(offset)
    }

    /// Release the block at `offset`, merging it with free buddies.
    ///
    /// Offsets that are not live (never allocated, or already freed) are
    /// rejected without touching the free lists.
    pub fn deallocate(&mut self, offset: u64) -> Result<()> {
        let Some(mut order) = self.allocated.remove(&offset) else {
            tracing::error!(offset, "Rejected deallocation of an offset that is not allocated");
            return Err(GpuError::InvalidHandle(format!(
                "buffer offset {offset} is not allocated"
            )));
        };
        self.allocated_bytes -= self.block_size(order);

        let mut offset = offset;
        while order < self.level {
            let size = self.block_size(order);
            let buddy = if (offset / size) % 2 == 0 {
                offset + size
            } else {
                offset - size
            };
            if !self.free[order as usize].remove(&buddy) {
                break;
            }
            offset = offset.min(buddy);
            order += 1;
        }
        self.free[order as usize].insert(offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn sizes_round_up_to_blocks() {
        let mut allocator = GpuBufferAllocator::new(4, 64);
        assert_eq!(allocator.capacity(), 1024);

        let a = allocator.allocate(1).unwrap();
        assert_eq!(allocator.block_size_at(a), Some(64));
        let b = allocator.allocate(65).unwrap();
        assert_eq!(allocator.block_size_at(b), Some(128));
        assert_eq!(b % 128, 0);
        let c = allocator.allocate(0).unwrap();
        assert_eq!(allocator.block_size_at(c), Some(64));
        assert_eq!(allocator.allocated_bytes(), 256);
    }

    #[test]
    fn lowest_offsets_first() {
        let mut allocator = GpuBufferAllocator::new(3, 16);
        let offsets: Vec<_> = (0..8).map(|_| allocator.allocate(16).unwrap()).collect();
        assert_eq!(offsets, vec![0, 16, 32, 48, 64, 80, 96, 112]);
        assert!(allocator.allocate(16).is_none());
        assert!(!allocator.has_available(1));
    }

    #[test]
    fn oversized_request_fails() {
        let mut allocator = GpuBufferAllocator::new(2, 32);
        assert!(!allocator.has_available(129));
        assert!(allocator.allocate(129).is_none());
        assert!(allocator.has_available(128));
        assert_eq!(allocator.allocate(128), Some(0));
        assert!(!allocator.has_available(1));
    }

    #[test]
    fn buddies_merge_back() {
        let mut allocator = GpuBufferAllocator::new(3, 16);
        let offsets: Vec<_> = (0..8).map(|_| allocator.allocate(16).unwrap()).collect();
        for offset in offsets.iter().rev() {
            allocator.deallocate(*offset).unwrap();
        }
        assert_eq!(allocator.allocated_bytes(), 0);
        assert_eq!(allocator.allocate(128), Some(0));
    }

    #[test]
    fn freed_block_is_reused() {
        let mut allocator = GpuBufferAllocator::new(3, 16);
        let a = allocator.allocate(16).unwrap();
        let b = allocator.allocate(16).unwrap();
        let _c = allocator.allocate(16).unwrap();
        allocator.deallocate(b).unwrap();
        assert_eq!(allocator.allocate(16), Some(b));
        allocator.deallocate(a).unwrap();
        assert_eq!(allocator.allocate(8), Some(a));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut allocator = GpuBufferAllocator::new(2, 16);
        let a = allocator.allocate(16).unwrap();
        let b = allocator.allocate(16).unwrap();
        allocator.deallocate(a).unwrap();
        assert!(matches!(
            allocator.deallocate(a),
            Err(GpuError::InvalidHandle(_))
        ));
        assert!(allocator.deallocate(7).is_err());

        // The free lists are intact: exactly three blocks remain available.
        assert_eq!(allocator.live_allocations(), 1);
        let mut again = Vec::new();
        while let Some(offset) = allocator.allocate(16) {
            again.push(offset);
        }
        again.sort_unstable();
        assert_eq!(again, vec![0, 32, 48]);
        assert!(!again.contains(&b));
    }

    #[test]
    fn random_churn_never_overlaps() {
        let mut allocator = GpuBufferAllocator::new(8, 32);
        let mut rng = StdRng::seed_from_u64(0x00c0_ffee);
        let mut live: Vec<(u64, u64)> = Vec::new();

        for _ in 0..4000 {
            if live.is_empty() || rng.gen_ratio(2, 3) {
                let size = rng.gen_range(1..=512);
                if let Some(offset) = allocator.allocate(size) {
                    let block = allocator.block_size_at(offset).unwrap();
                    assert_eq!(offset % block, 0, "block alignment");
                    assert!(offset + block <= allocator.capacity());
                    for &(other, other_size) in &live {
                        assert!(
                            offset + block <= other || other + other_size <= offset,
                            "overlap between {offset}+{block} and {other}+{other_size}"
                        );
                    }
                    live.push((offset, block));
                } else {
                    assert!(!allocator.has_available(size));
                }
            } else {
                let index = rng.gen_range(0..live.len());
                let (offset, _) = live.swap_remove(index);
                allocator.deallocate(offset).unwrap();
            }
            let total: u64 = live.iter().map(|&(_, size)| size).sum();
            assert_eq!(total, allocator.allocated_bytes());
        }

        for (offset, _) in live.drain(..) {
            allocator.deallocate(offset).unwrap();
        }
        assert!(allocator.has_available(allocator.capacity()));
    }
}
