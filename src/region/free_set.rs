use super::{HeapRegion, RegionTable};
use crate::util::constants::MIN_OBJECT_SIZE;
use crate::util::log::{debug, trace};
use crate::util::Address;

/// A region with less free space than this is taken out of the free set.
const MIN_RETAINED_FREE: usize = 256;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocRequestKind {
    /// A single object for a mutator, outside of any LAB.
    SharedMutator,
    /// A thread-local allocation buffer for a mutator.
    Tlab,
    /// A GC local allocation buffer for an evacuating thread.
    Gclab,
    /// A single evacuated object that does not fit in a GCLAB.
    SharedGc,
}

impl AllocRequestKind {
    pub fn is_mutator_alloc(self) -> bool {
        matches!(self, AllocRequestKind::SharedMutator | AllocRequestKind::Tlab)
    }

    pub fn is_lab_alloc(self) -> bool {
        matches!(self, AllocRequestKind::Tlab | AllocRequestKind::Gclab)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct AllocRequest {
    /// Requested size in bytes.
    pub size: usize,
    /// LAB requests accept anything between `min_size` and `size`.
    pub min_size: usize,
    pub kind: AllocRequestKind,
}

impl AllocRequest {
    pub fn shared(size: usize, kind: AllocRequestKind) -> Self {
        debug_assert!(!kind.is_lab_alloc());
        AllocRequest {
            size,
            min_size: size,
            kind,
        }
    }

    pub fn lab(size: usize, min_size: usize, kind: AllocRequestKind) -> Self {
        debug_assert!(kind.is_lab_alloc());
        AllocRequest {
            size,
            min_size,
            kind,
        }
    }
}

/// One side of the free set: a membership map plus the leftmost and rightmost members.
struct Partition {
    members: Vec<bool>,
    leftmost: usize,
    rightmost: usize,
    count: usize,
}

impl Partition {
    fn new(len: usize) -> Self {
        Partition {
            members: vec![false; len],
            leftmost: len,
            rightmost: 0,
            count: 0,
        }
    }

    fn clear(&mut self) {
        self.members.iter_mut().for_each(|m| *m = false);
        self.leftmost = self.members.len();
        self.rightmost = 0;
        self.count = 0;
    }

    fn contains(&self, index: usize) -> bool {
        self.members[index]
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn add(&mut self, index: usize) {
        debug_assert!(!self.members[index]);
        self.members[index] = true;
        self.count += 1;
        self.leftmost = self.leftmost.min(index);
        self.rightmost = self.rightmost.max(index);
    }

    fn remove(&mut self, index: usize) {
        debug_assert!(self.members[index]);
        self.members[index] = false;
        self.count -= 1;
        if self.count == 0 {
            self.leftmost = self.members.len();
            self.rightmost = 0;
            return;
        }
        if index == self.leftmost {
            while !self.members[self.leftmost] {
                self.leftmost += 1;
            }
        }
        if index == self.rightmost {
            while !self.members[self.rightmost] {
                self.rightmost -= 1;
            }
        }
    }

    /// Member indices from left to right.
    fn iter(&self) -> impl DoubleEndedIterator<Item = usize> + '_ {
        let range = if self.is_empty() {
            0..0
        } else {
            self.leftmost..self.rightmost + 1
        };
        range.filter(move |i| self.members[*i])
    }
}

/// The regions available for allocation, split into a mutator partition that allocates from
/// the left and a collector reserve that allocates from the right.
///
/// The free set lives behind the heap lock. Region state transitions caused by allocation
/// happen under that lock, too.
pub struct FreeSet {
    mutator: Partition,
    collector: Partition,
    evac_reserve_overflow: bool,
}

impl FreeSet {
    pub fn new(regions: usize, evac_reserve_overflow: bool) -> Self {
        FreeSet {
            mutator: Partition::new(regions),
            collector: Partition::new(regions),
            evac_reserve_overflow,
        }
    }

    pub fn clear(&mut self) {
        self.mutator.clear();
        self.collector.clear();
    }

    pub fn is_mutator_free(&self, index: usize) -> bool {
        self.mutator.contains(index)
    }

    pub fn is_collector_free(&self, index: usize) -> bool {
        self.collector.contains(index)
    }

    pub fn contains(&self, index: usize) -> bool {
        self.is_mutator_free(index) || self.is_collector_free(index)
    }

    pub fn mutator_count(&self) -> usize {
        self.mutator.count
    }

    pub fn collector_count(&self) -> usize {
        self.collector.count
    }

    fn alloc_capacity(region: &HeapRegion) -> usize {
        if region.is_trash() {
            region.region_size()
        } else {
            region.free()
        }
    }

    fn is_completely_free(region: &HeapRegion) -> bool {
        region.is_trash() || (region.is_empty() && region.used() == 0)
    }

    /// Bytes the mutators can still allocate.
    pub fn available(&self, regions: &RegionTable) -> usize {
        self.mutator
            .iter()
            .map(|i| Self::alloc_capacity(regions.get(i)))
            .sum()
    }

    /// Bytes reserved for evacuation.
    pub fn collector_available(&self, regions: &RegionTable) -> usize {
        self.collector
            .iter()
            .map(|i| Self::alloc_capacity(regions.get(i)))
            .sum()
    }

    /// Recompute both partitions from the region states. Completely free regions on the right
    /// are moved to the collector reserve until it holds `reserve_bytes`.
    pub fn rebuild(&mut self, regions: &RegionTable, reserve_bytes: usize) {
        self.clear();
        for region in regions.iter() {
            if (region.is_alloc_allowed() || region.is_trash())
                && Self::alloc_capacity(region) >= MIN_RETAINED_FREE
            {
                self.mutator.add(region.index());
            }
        }

        let mut reserved = 0;
        let candidates: Vec<usize> = self.mutator.iter().rev().collect();
        for index in candidates {
            if reserved >= reserve_bytes {
                break;
            }
            let region = regions.get(index);
            if Self::is_completely_free(region) {
                self.mutator.remove(index);
                self.collector.add(index);
                reserved += region.region_size();
            }
        }
        debug!(
            "Free set rebuilt: {} mutator regions, {} collector regions ({} bytes reserved)",
            self.mutator.count, self.collector.count, reserved
        );
    }

    /// Allocate for `req`. Trash regions met on the way are recycled through `recycle`.
    /// Returns the start address and the size actually allocated.
    pub fn allocate(
        &mut self,
        req: AllocRequest,
        regions: &RegionTable,
        alloc_seq: u64,
        recycle: &mut dyn FnMut(&HeapRegion),
    ) -> Option<(Address, usize)> {
        debug_assert!(req.size >= MIN_OBJECT_SIZE);
        if req.kind.is_mutator_alloc() {
            if req.size > regions.region_size() {
                debug_assert_eq!(req.kind, AllocRequestKind::SharedMutator);
                return self
                    .allocate_contiguous(req.size, regions, alloc_seq, recycle)
                    .map(|addr| (addr, req.size));
            }
            let candidates: Vec<usize> = self.mutator.iter().collect();
            for index in candidates {
                if let Some(result) = self.try_allocate_in(index, req, regions, alloc_seq, recycle)
                {
                    return Some(result);
                }
            }
            None
        } else {
            let candidates: Vec<usize> = self.collector.iter().rev().collect();
            for index in candidates {
                if let Some(result) = self.try_allocate_in(index, req, regions, alloc_seq, recycle)
                {
                    return Some(result);
                }
            }
            if self.evac_reserve_overflow {
                // Steal a completely free region from the mutator side.
                let flippable = self
                    .mutator
                    .iter()
                    .rev()
                    .find(|i| Self::is_completely_free(regions.get(*i)));
                if let Some(index) = flippable {
                    trace!("Flipping region {} to the collector reserve", index);
                    self.mutator.remove(index);
                    self.collector.add(index);
                    return self.try_allocate_in(index, req, regions, alloc_seq, recycle);
                }
            }
            None
        }
    }

    fn try_allocate_in(
        &mut self,
        index: usize,
        req: AllocRequest,
        regions: &RegionTable,
        alloc_seq: u64,
        recycle: &mut dyn FnMut(&HeapRegion),
    ) -> Option<(Address, usize)> {
        let region = regions.get(index);
        if region.is_trash() {
            recycle(region);
        }
        if !region.is_alloc_allowed() {
            self.remove(index);
            return None;
        }
        let free = region.free();
        let size = if req.kind.is_lab_alloc() {
            if free < req.min_size {
                None
            } else {
                Some(req.size.min(free))
            }
        } else if free >= req.size {
            Some(req.size)
        } else {
            None
        };
        let result = size.and_then(|size| {
            region.make_regular_allocation();
            region.allocate(size, alloc_seq).map(|addr| (addr, size))
        });
        if region.free() < MIN_RETAINED_FREE {
            self.remove(index);
        }
        result
    }

    fn remove(&mut self, index: usize) {
        if self.mutator.contains(index) {
            self.mutator.remove(index);
        } else if self.collector.contains(index) {
            self.collector.remove(index);
        }
    }

    /// Allocate a humongous object across a run of completely free mutator regions.
    fn allocate_contiguous(
        &mut self,
        size: usize,
        regions: &RegionTable,
        alloc_seq: u64,
        recycle: &mut dyn FnMut(&HeapRegion),
    ) -> Option<Address> {
        let needed = regions.required_regions(size);
        if self.mutator.is_empty() {
            return None;
        }
        let mut start = self.mutator.leftmost;
        let mut run = 0;
        let mut found = None;
        for index in self.mutator.leftmost..=self.mutator.rightmost {
            if self.mutator.contains(index) && Self::is_completely_free(regions.get(index)) {
                if run == 0 {
                    start = index;
                }
                run += 1;
                if run == needed {
                    found = Some(start);
                    break;
                }
            } else {
                run = 0;
            }
        }
        let start = found?;
        let region_size = regions.region_size();
        for (n, index) in (start..start + needed).enumerate() {
            let region = regions.get(index);
            if region.is_trash() {
                recycle(region);
            }
            if n == 0 {
                region.make_humongous_start();
            } else {
                region.make_humongous_cont();
            }
            let used = if n + 1 == needed {
                size - n * region_size
            } else {
                region_size
            };
            region.set_top(region.bottom() + used);
            region.reset_alloc_metadata();
            region.record_alloc_seq(alloc_seq);
            self.mutator.remove(index);
        }
        debug!(
            "Humongous allocation of {} bytes in regions {}..{}",
            size,
            start,
            start + needed
        );
        Some(regions.get(start).bottom())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Address;

    const REGION: usize = 0x1_0000;

    fn table(count: usize) -> RegionTable {
        RegionTable::new(unsafe { Address::from_usize(0x40_0000_0000) }, REGION, count)
    }

    fn no_recycle() -> impl FnMut(&HeapRegion) {
        |r: &HeapRegion| {
            panic!("unexpected recycle of region {}", r.index());
        }
    }

    #[test]
    fn rebuild_reserves_from_the_right() {
        let regions = table(10);
        let mut fs = FreeSet::new(10, false);
        fs.rebuild(&regions, 2 * REGION);
        assert_eq!(fs.mutator_count(), 8);
        assert_eq!(fs.collector_count(), 2);
        assert!(fs.is_collector_free(9));
        assert!(fs.is_collector_free(8));
        assert!(fs.is_mutator_free(0));
        assert_eq!(fs.available(&regions), 8 * REGION);
    }

    #[test]
    fn mutator_allocates_left_collector_right() {
        let regions = table(10);
        let mut fs = FreeSet::new(10, false);
        fs.rebuild(&regions, 2 * REGION);
        let (m, _) = fs
            .allocate(
                AllocRequest::shared(64, AllocRequestKind::SharedMutator),
                &regions,
                1,
                &mut no_recycle(),
            )
            .unwrap();
        assert_eq!(regions.index_of(m), 0);
        let (c, _) = fs
            .allocate(
                AllocRequest::shared(64, AllocRequestKind::SharedGc),
                &regions,
                2,
                &mut no_recycle(),
            )
            .unwrap();
        assert_eq!(regions.index_of(c), 9);
        assert!(regions.get(0).is_regular());
    }

    #[test]
    fn lab_shrinks_to_fit() {
        let regions = table(4);
        let mut fs = FreeSet::new(4, false);
        fs.rebuild(&regions, 0);
        fs.allocate(
            AllocRequest::shared(REGION - 1024, AllocRequestKind::SharedMutator),
            &regions,
            1,
            &mut no_recycle(),
        )
        .unwrap();
        let (addr, size) = fs
            .allocate(
                AllocRequest::lab(4096, 512, AllocRequestKind::Tlab),
                &regions,
                2,
                &mut no_recycle(),
            )
            .unwrap();
        assert_eq!(regions.index_of(addr), 0);
        assert_eq!(size, 1024);
        assert!(!fs.is_mutator_free(0));
    }

    #[test]
    fn reserve_overflow_flips_regions() {
        let regions = table(4);
        let mut fs = FreeSet::new(4, true);
        fs.rebuild(&regions, 0);
        assert_eq!(fs.collector_count(), 0);
        let (addr, _) = fs
            .allocate(
                AllocRequest::shared(64, AllocRequestKind::SharedGc),
                &regions,
                1,
                &mut no_recycle(),
            )
            .unwrap();
        assert_eq!(regions.index_of(addr), 3);
        assert!(fs.is_collector_free(3));

        let mut strict = FreeSet::new(4, false);
        strict.rebuild(&regions, 0);
        assert!(strict
            .allocate(
                AllocRequest::shared(64, AllocRequestKind::SharedGc),
                &regions,
                1,
                &mut no_recycle()
            )
            .is_none());
    }

    #[test]
    fn humongous_needs_contiguous_free_regions() {
        let regions = table(6);
        let mut fs = FreeSet::new(6, false);
        fs.rebuild(&regions, 0);
        // Occupy region 1 so that the first run of three free regions starts at 2.
        regions.get(1).make_regular_allocation();
        regions.get(1).allocate(64, 1);
        let addr = fs
            .allocate(
                AllocRequest::shared(2 * REGION + 16, AllocRequestKind::SharedMutator),
                &regions,
                2,
                &mut no_recycle(),
            )
            .unwrap()
            .0;
        assert_eq!(regions.index_of(addr), 2);
        assert!(regions.get(2).is_humongous_start());
        assert!(regions.get(3).is_humongous_continuation());
        assert!(regions.get(4).is_humongous_continuation());
        assert_eq!(regions.get(4).used(), 16);
        assert!(!fs.is_mutator_free(3));
        assert!(fs
            .allocate(
                AllocRequest::shared(2 * REGION, AllocRequestKind::SharedMutator),
                &regions,
                3,
                &mut no_recycle()
            )
            .is_none());
    }

    #[test]
    fn trash_is_recycled_on_allocation() {
        let regions = table(2);
        regions.get(0).make_regular_allocation();
        regions.get(0).allocate(128, 1);
        regions.get(0).make_trash();
        let mut fs = FreeSet::new(2, false);
        fs.rebuild(&regions, 0);
        assert_eq!(fs.available(&regions), 2 * REGION);
        let mut recycled = vec![];
        let (addr, _) = fs
            .allocate(
                AllocRequest::shared(64, AllocRequestKind::SharedMutator),
                &regions,
                2,
                &mut |r: &HeapRegion| {
                    recycled.push(r.index());
                    r.make_empty();
                },
            )
            .unwrap();
        assert_eq!(recycled, vec![0]);
        assert_eq!(addr, regions.get(0).bottom());
    }
}
