use super::HeapRegion;
use crate::util::Address;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// All regions of the heap, indexed by address.
pub struct RegionTable {
    regions: Box<[HeapRegion]>,
    start: Address,
    end: Address,
    log_region_size: usize,
}

impl RegionTable {
    pub fn new(start: Address, region_size: usize, count: usize) -> Self {
        debug_assert!(region_size.is_power_of_two());
        debug_assert!(start.is_aligned_to(region_size));
        let regions = (0..count)
            .map(|i| HeapRegion::new(i, start + i * region_size, region_size))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        RegionTable {
            regions,
            start,
            end: start + count * region_size,
            log_region_size: region_size.trailing_zeros() as usize,
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn region_size(&self) -> usize {
        1 << self.log_region_size
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn end(&self) -> Address {
        self.end
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn get(&self, index: usize) -> &HeapRegion {
        &self.regions[index]
    }

    pub fn index_of(&self, addr: Address) -> usize {
        debug_assert!(self.contains(addr), "{} is not in the heap", addr);
        (addr - self.start) >> self.log_region_size
    }

    pub fn region_containing(&self, addr: Address) -> &HeapRegion {
        self.get(self.index_of(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeapRegion> {
        self.regions.iter()
    }

    /// The number of regions a humongous object of `bytes` bytes occupies.
    pub fn required_regions(&self, bytes: usize) -> usize {
        (bytes + self.region_size() - 1) >> self.log_region_size
    }
}

/// Hands out disjoint ranges of region indices to workers.
pub struct ParallelRegionIterator {
    cursor: AtomicUsize,
    limit: AtomicUsize,
    stride: usize,
}

impl ParallelRegionIterator {
    pub fn new(stride: usize) -> Self {
        ParallelRegionIterator {
            cursor: AtomicUsize::new(0),
            limit: AtomicUsize::new(0),
            stride: stride.max(1),
        }
    }

    /// Start a new pass over `count` regions.
    pub fn reset(&self, count: usize) {
        self.limit.store(count, Ordering::Relaxed);
        self.cursor.store(0, Ordering::Release);
    }

    pub fn claim_next(&self) -> Option<Range<usize>> {
        let limit = self.limit.load(Ordering::Relaxed);
        let start = self.cursor.fetch_add(self.stride, Ordering::AcqRel);
        if start >= limit {
            None
        } else {
            Some(start..(start + self.stride).min(limit))
        }
    }
}
