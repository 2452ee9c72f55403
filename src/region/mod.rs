//! Heap regions.
//!
//! The heap is an array of equally sized regions. Each region moves through a small state
//! machine; a transition that is not listed in [`HeapRegion`]'s `make_*` methods is a fatal error.

mod collection_set;
mod free_set;
mod table;

pub use collection_set::CollectionSet;
pub use free_set::{AllocRequest, AllocRequestKind, FreeSet};
pub use table::{ParallelRegionIterator, RegionTable};

use crate::object::ObjectReference;
use crate::util::constants::LOG_BYTES_IN_WORD;
use crate::util::log::trace;
use crate::util::Address;
use atomic::Atomic;
use bytemuck::NoUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit)]
pub enum RegionState {
    /// No objects. The region can be allocated into.
    Empty,
    /// Holds ordinary objects.
    Regular,
    /// The first region of a humongous object.
    HumongousStart,
    /// A region covered by the humongous object that starts in an earlier region.
    HumongousCont,
    /// Selected for evacuation in the current cycle.
    CSet,
    /// A regular region that holds pinned objects. It is never evacuated.
    Pinned,
    /// All objects are dead. The region becomes empty when it is recycled.
    Trash,
}

pub struct HeapRegion {
    index: usize,
    bottom: Address,
    end: Address,
    top: AtomicUsize,
    state: Atomic<RegionState>,
    /// Words marked live by the last marking of this region.
    live_data: AtomicUsize,
    /// Allocation sequence numbers of the first and last allocation since the region was reset.
    first_alloc_seq: AtomicU64,
    last_alloc_seq: AtomicU64,
    critical_pins: AtomicUsize,
    /// `top` at init-update-refs. Objects above it need no update.
    update_watermark: AtomicUsize,
}

impl HeapRegion {
    pub(crate) fn new(index: usize, bottom: Address, size: usize) -> Self {
        HeapRegion {
            index,
            bottom,
            end: bottom + size,
            top: AtomicUsize::new(bottom.as_usize()),
            state: Atomic::new(RegionState::Empty),
            live_data: AtomicUsize::new(0),
            first_alloc_seq: AtomicU64::new(0),
            last_alloc_seq: AtomicU64::new(0),
            critical_pins: AtomicUsize::new(0),
            update_watermark: AtomicUsize::new(bottom.as_usize()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bottom(&self) -> Address {
        self.bottom
    }

    pub fn end(&self) -> Address {
        self.end
    }

    pub fn top(&self) -> Address {
        unsafe { Address::from_usize(self.top.load(Ordering::Acquire)) }
    }

    pub(crate) fn set_top(&self, top: Address) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top.store(top.as_usize(), Ordering::Release);
    }

    /// The object that starts at `bottom`, such as a humongous object.
    pub fn bottom_object(&self) -> ObjectReference {
        debug_assert!(self.used() > 0, "region {} is empty", self.index);
        unsafe { ObjectReference::from_raw_address_unchecked(self.bottom) }
    }

    pub fn region_size(&self) -> usize {
        self.end - self.bottom
    }

    pub fn used(&self) -> usize {
        self.top() - self.bottom
    }

    pub fn free(&self) -> usize {
        self.end - self.top()
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.bottom && addr < self.end
    }

    pub fn state(&self) -> RegionState {
        self.state.load(Ordering::Acquire)
    }

    fn set_state(&self, state: RegionState) {
        trace!(
            "Region {} state {:?} -> {:?}",
            self.index,
            self.state(),
            state
        );
        self.state.store(state, Ordering::Release);
    }

    fn report_illegal_transition(&self, method: &str) -> ! {
        panic!(
            "Illegal region state transition: region {} is {:?}, cannot {}",
            self.index,
            self.state(),
            method
        )
    }

    pub fn is_empty(&self) -> bool {
        self.state() == RegionState::Empty
    }

    pub fn is_trash(&self) -> bool {
        self.state() == RegionState::Trash
    }

    pub fn is_regular(&self) -> bool {
        self.state() == RegionState::Regular
    }

    pub fn is_humongous(&self) -> bool {
        matches!(
            self.state(),
            RegionState::HumongousStart | RegionState::HumongousCont
        )
    }

    pub fn is_humongous_start(&self) -> bool {
        self.state() == RegionState::HumongousStart
    }

    pub fn is_humongous_continuation(&self) -> bool {
        self.state() == RegionState::HumongousCont
    }

    pub fn is_cset(&self) -> bool {
        self.state() == RegionState::CSet
    }

    pub fn is_pinned(&self) -> bool {
        self.state() == RegionState::Pinned
    }

    /// Holds objects that may be live.
    pub fn is_active(&self) -> bool {
        !matches!(self.state(), RegionState::Empty | RegionState::Trash)
    }

    /// Mutators and evacuation may allocate into the region.
    pub fn is_alloc_allowed(&self) -> bool {
        matches!(
            self.state(),
            RegionState::Empty | RegionState::Regular | RegionState::Pinned
        )
    }

    /// Empty, or reclaimable without moving anything.
    pub fn is_empty_or_trash(&self) -> bool {
        matches!(self.state(), RegionState::Empty | RegionState::Trash)
    }

    pub fn make_regular_allocation(&self) {
        match self.state() {
            RegionState::Empty => self.set_state(RegionState::Regular),
            RegionState::Regular | RegionState::Pinned => {}
            _ => self.report_illegal_transition("regular allocation"),
        }
    }

    /// Make the region regular regardless of its state. Used by full GC, which rebuilds every
    /// region from scratch.
    pub(crate) fn make_regular_bypass(&self) {
        match self.state() {
            RegionState::Empty
            | RegionState::Regular
            | RegionState::CSet
            | RegionState::Trash
            | RegionState::HumongousStart
            | RegionState::HumongousCont => self.set_state(RegionState::Regular),
            RegionState::Pinned => {}
        }
    }

    pub fn make_humongous_start(&self) {
        match self.state() {
            RegionState::Empty => self.set_state(RegionState::HumongousStart),
            _ => self.report_illegal_transition("humongous start allocation"),
        }
    }

    pub fn make_humongous_cont(&self) {
        match self.state() {
            RegionState::Empty => self.set_state(RegionState::HumongousCont),
            _ => self.report_illegal_transition("humongous continuation allocation"),
        }
    }

    pub fn make_pinned(&self) {
        match self.state() {
            RegionState::Regular => {
                debug_assert!(self.pin_count() > 0);
                self.set_state(RegionState::Pinned)
            }
            RegionState::Pinned | RegionState::HumongousStart | RegionState::HumongousCont => {}
            _ => self.report_illegal_transition("pin"),
        }
    }

    pub fn make_unpinned(&self) {
        match self.state() {
            RegionState::Pinned => {
                debug_assert_eq!(self.pin_count(), 0);
                self.set_state(RegionState::Regular)
            }
            RegionState::Regular | RegionState::HumongousStart | RegionState::HumongousCont => {}
            _ => self.report_illegal_transition("unpin"),
        }
    }

    pub fn make_cset(&self) {
        match self.state() {
            RegionState::Regular => self.set_state(RegionState::CSet),
            _ => self.report_illegal_transition("cset"),
        }
    }

    pub fn make_trash(&self) {
        match self.state() {
            RegionState::CSet
            | RegionState::Regular
            | RegionState::HumongousStart
            | RegionState::HumongousCont => self.set_state(RegionState::Trash),
            _ => self.report_illegal_transition("trash"),
        }
    }

    /// Recycle a trash region. Everything about its previous contents is forgotten.
    pub fn make_empty(&self) {
        match self.state() {
            RegionState::Trash => {
                self.set_top(self.bottom);
                self.clear_live_data();
                self.reset_alloc_metadata();
                self.update_watermark
                    .store(self.bottom.as_usize(), Ordering::Relaxed);
                self.set_state(RegionState::Empty)
            }
            _ => self.report_illegal_transition("empty"),
        }
    }

    /// Bump-allocate `size` bytes. Callers hold the heap lock.
    pub(crate) fn allocate(&self, size: usize, alloc_seq: u64) -> Option<Address> {
        debug_assert!(self.is_alloc_allowed());
        let top = self.top();
        let new_top = top + size;
        if new_top > self.end {
            return None;
        }
        self.set_top(new_top);
        self.record_alloc_seq(alloc_seq);
        Some(top)
    }

    pub(crate) fn record_alloc_seq(&self, seq: u64) {
        if self.first_alloc_seq.load(Ordering::Relaxed) == 0 {
            self.first_alloc_seq.store(seq, Ordering::Relaxed);
        }
        self.last_alloc_seq.store(seq, Ordering::Relaxed);
    }

    pub(crate) fn reset_alloc_metadata(&self) {
        self.first_alloc_seq.store(0, Ordering::Relaxed);
        self.last_alloc_seq.store(0, Ordering::Relaxed);
    }

    pub fn first_alloc_seq(&self) -> u64 {
        self.first_alloc_seq.load(Ordering::Relaxed)
    }

    pub fn last_alloc_seq(&self) -> u64 {
        self.last_alloc_seq.load(Ordering::Relaxed)
    }

    pub fn clear_live_data(&self) {
        self.live_data.store(0, Ordering::Relaxed);
    }

    pub fn increase_live_data_words(&self, words: usize) {
        self.live_data.fetch_add(words, Ordering::Relaxed);
    }

    pub fn increase_live_data_bytes(&self, bytes: usize) {
        self.increase_live_data_words(bytes >> LOG_BYTES_IN_WORD);
    }

    pub fn live_data_words(&self) -> usize {
        self.live_data.load(Ordering::Relaxed)
    }

    pub fn live_data_bytes(&self) -> usize {
        self.live_data_words() << LOG_BYTES_IN_WORD
    }

    pub fn has_live(&self) -> bool {
        self.live_data_words() != 0
    }

    pub fn garbage(&self) -> usize {
        self.used().saturating_sub(self.live_data_bytes())
    }

    pub fn record_pin(&self) {
        self.critical_pins.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_unpin(&self) {
        let old = self.critical_pins.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "region {} unpinned more often than pinned", self.index);
    }

    pub fn pin_count(&self) -> usize {
        self.critical_pins.load(Ordering::Acquire)
    }

    pub fn update_watermark(&self) -> Address {
        unsafe { Address::from_usize(self.update_watermark.load(Ordering::Acquire)) }
    }

    pub(crate) fn capture_update_watermark(&self) {
        self.update_watermark
            .store(self.top().as_usize(), Ordering::Release);
    }
}

impl std::fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Region {} [{}, {}) top {} {:?} live {}B pins {}",
            self.index,
            self.bottom,
            self.end,
            self.top(),
            self.state(),
            self.live_data_bytes(),
            self.pin_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> HeapRegion {
        HeapRegion::new(3, unsafe { Address::from_usize(0x10_0000) }, 0x1_0000)
    }

    #[test]
    fn regular_lifecycle() {
        let r = region();
        assert!(r.is_empty());
        r.make_regular_allocation();
        let a = r.allocate(64, 7).unwrap();
        assert_eq!(a, r.bottom());
        assert_eq!(r.used(), 64);
        assert_eq!(r.first_alloc_seq(), 7);
        r.allocate(32, 9).unwrap();
        assert_eq!(r.first_alloc_seq(), 7);
        assert_eq!(r.last_alloc_seq(), 9);

        r.increase_live_data_bytes(32);
        assert_eq!(r.garbage(), 64);

        r.make_cset();
        r.make_trash();
        r.make_empty();
        assert!(r.is_empty());
        assert_eq!(r.used(), 0);
        assert_eq!(r.live_data_words(), 0);
        assert_eq!(r.first_alloc_seq(), 0);
    }

    #[test]
    fn allocate_respects_end() {
        let r = region();
        r.make_regular_allocation();
        assert!(r.allocate(0x1_0000, 1).is_some());
        assert!(r.allocate(16, 2).is_none());
    }

    #[test]
    #[should_panic(expected = "Illegal region state transition")]
    fn empty_cannot_enter_cset() {
        region().make_cset();
    }

    #[test]
    #[should_panic(expected = "Illegal region state transition")]
    fn only_trash_becomes_empty() {
        let r = region();
        r.make_regular_allocation();
        r.make_empty();
    }

    #[test]
    fn pinning() {
        let r = region();
        r.make_regular_allocation();
        r.record_pin();
        r.make_pinned();
        assert!(r.is_pinned());
        assert!(r.is_alloc_allowed());
        r.record_unpin();
        r.make_unpinned();
        assert!(r.is_regular());
    }
}
