use super::{HeapRegion, RegionTable};
use crate::util::Address;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

/// The regions selected for evacuation in the current cycle.
///
/// The set is built inside the final-mark pause and does not change until the regions are
/// trashed at final-update-refs. Membership queries are a single load from a per-region map.
pub struct CollectionSet {
    map: Box<[AtomicBool]>,
    regions: RwLock<Vec<usize>>,
    /// Claim cursor into `regions` for parallel evacuation.
    current_index: AtomicUsize,
    garbage: AtomicUsize,
    live_data: AtomicUsize,
    used: AtomicUsize,
}

impl CollectionSet {
    pub fn new(region_count: usize) -> Self {
        CollectionSet {
            map: (0..region_count).map(|_| AtomicBool::new(false)).collect(),
            regions: RwLock::new(Vec::new()),
            current_index: AtomicUsize::new(0),
            garbage: AtomicUsize::new(0),
            live_data: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
        }
    }

    /// Add a region and make it a cset region.
    pub fn add_region(&self, region: &HeapRegion) {
        debug_assert!(!self.is_in(region.index()));
        region.make_cset();
        self.map[region.index()].store(true, Ordering::Release);
        self.regions.write().unwrap().push(region.index());
        self.garbage.fetch_add(region.garbage(), Ordering::Relaxed);
        self.live_data
            .fetch_add(region.live_data_bytes(), Ordering::Relaxed);
        self.used.fetch_add(region.used(), Ordering::Relaxed);
    }

    pub fn clear(&self) {
        let mut regions = self.regions.write().unwrap();
        for index in regions.drain(..) {
            self.map[index].store(false, Ordering::Release);
        }
        self.current_index.store(0, Ordering::Relaxed);
        self.garbage.store(0, Ordering::Relaxed);
        self.live_data.store(0, Ordering::Relaxed);
        self.used.store(0, Ordering::Relaxed);
    }

    pub fn is_in(&self, index: usize) -> bool {
        self.map[index].load(Ordering::Acquire)
    }

    pub fn is_in_addr(&self, table: &RegionTable, addr: Address) -> bool {
        table.contains(addr) && self.is_in(table.index_of(addr))
    }

    pub fn count(&self) -> usize {
        self.regions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn regions(&self) -> Vec<usize> {
        self.regions.read().unwrap().clone()
    }

    pub fn garbage(&self) -> usize {
        self.garbage.load(Ordering::Relaxed)
    }

    pub fn live_data(&self) -> usize {
        self.live_data.load(Ordering::Relaxed)
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Start a new round of claims.
    pub fn clear_current_index(&self) {
        self.current_index.store(0, Ordering::Release);
    }

    /// Claim the next region for evacuation. Each region is handed out once per round.
    pub fn claim_next(&self) -> Option<usize> {
        let regions = self.regions.read().unwrap();
        let index = self.current_index.fetch_add(1, Ordering::AcqRel);
        regions.get(index).copied()
    }
}
