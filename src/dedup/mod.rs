//! String deduplication.
//!
//! Strings are objects with one reference field pointing at a byte array. The table maps array
//! contents to one canonical array. Deduplicating a string points it at the canonical array, so
//! the duplicate becomes garbage. Table entries are weak: an entry whose array did not survive
//! marking is unlinked in the final-mark pause.
//!
//! Marking feeds strings it visits to a candidate queue, which the control thread processes
//! after final-mark. Mutators may also deduplicate strings directly.

mod table;

pub use table::{StringDedupTable, MAX_TABLE_SIZE, MIN_TABLE_SIZE};

use crate::barrier::BarrierSet;
use crate::forwarding::{get_forwardee_raw, resolve};
use crate::heap::Heap;
use crate::object::{ObjectKind, ObjectReference};
use crate::scheduler::{GCWork, GCWorker};
use crate::util::log::{debug, trace};
use crossbeam::queue::SegQueue;
use std::collections::hash_map::RandomState;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

pub struct StringDedup {
    enabled: bool,
    table: RwLock<Arc<StringDedupTable>>,
    candidates: SegQueue<ObjectReference>,
    deduplicated: AtomicUsize,
}

impl StringDedup {
    pub fn new(enabled: bool) -> Self {
        StringDedup {
            enabled,
            table: RwLock::new(Arc::new(StringDedupTable::new(
                MIN_TABLE_SIZE,
                RandomState::new(),
            ))),
            candidates: SegQueue::new(),
            deduplicated: AtomicUsize::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn table(&self) -> Arc<StringDedupTable> {
        self.table.read().unwrap().clone()
    }

    /// Number of canonical arrays.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn table_size(&self) -> usize {
        self.table().size()
    }

    /// How many strings were pointed at a canonical array.
    pub fn deduplicated(&self) -> usize {
        self.deduplicated.load(Ordering::Relaxed)
    }

    pub(crate) fn enqueue_candidate(&self, string: ObjectReference) {
        self.candidates.push(string);
    }

    pub(crate) fn clear_candidates(&self) {
        while self.candidates.pop().is_some() {}
    }

    /// Deduplicate the strings marking found. Stops early if the cycle is cancelled.
    pub(crate) fn process_candidates(&self, heap: &Heap, barriers: &mut BarrierSet) -> usize {
        let mut processed = 0;
        while let Some(string) = self.candidates.pop() {
            if heap.cancelled_gc() {
                self.clear_candidates();
                break;
            }
            self.deduplicate(barriers, string);
            processed += 1;
        }
        processed
    }

    /// Point `string` at the canonical array with the same contents. Returns true if the string
    /// now shares a canonical array it did not hold before. If there is no canonical array
    /// yet, the string's own array becomes canonical.
    pub fn deduplicate(&self, barriers: &mut BarrierSet, string: ObjectReference) -> bool {
        if !self.enabled {
            return false;
        }
        let string = barriers.read_barrier(string);
        debug_assert_eq!(string.kind(), ObjectKind::String);
        let Some(array) = barriers.load(string, 0) else {
            return false;
        };
        let bytes = unsafe { array.byte_array_bytes() };
        let table = self.table();
        let hash = table.hash(bytes);
        let canonical = table.lookup_or_add(array, hash, bytes);
        if barriers.same_object(Some(canonical), Some(array)) {
            return false;
        }
        let canonical = barriers.read_barrier(canonical);
        barriers.keep_alive_barrier(Some(canonical));
        barriers.store(string, 0, Some(canonical));
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
        trace!("Deduplicated {}: {} -> {}", string, array, canonical);
        true
    }

    fn run(&self, heap: &Heap, op: TableOp) {
        if !self.enabled {
            return;
        }
        let table = self.table();
        heap.workers()
            .run_task(heap, DedupTableTask::new(table, op, heap.workers().active_workers()));
    }

    /// Drop entries whose array did not survive the last marking, then resize or rehash if
    /// needed. Only called in pauses, with the complete marking context up to date.
    pub(crate) fn clean_table(&self, heap: &Heap) {
        if !self.enabled {
            return;
        }
        let before = self.len();
        self.run(heap, TableOp::Unlink);
        debug!(
            "String dedup table: {} entries, {} unlinked",
            self.len(),
            before - self.len()
        );
        let table = self.table();
        if let Some((successor, rehash)) = table.successor() {
            let successor = Arc::new(successor);
            self.run(heap, TableOp::Transfer(successor.clone(), rehash));
            *self.table.write().unwrap() = successor;
        }
    }

    /// Point entries at the copies of evacuated arrays. Only called in pauses.
    pub(crate) fn update_references(&self, heap: &Heap) {
        self.run(heap, TableOp::Update);
    }

    /// Point entries at the new addresses full GC computed. Only called in pauses.
    pub(crate) fn adjust_references(&self, heap: &Heap) {
        self.run(heap, TableOp::Adjust);
    }
}

#[derive(Clone)]
enum TableOp {
    Unlink,
    Transfer(Arc<StringDedupTable>, bool),
    Update,
    Adjust,
}

/// One pass over the table. Workers claim partitions of buckets with an atomic cursor.
struct DedupTableTask {
    table: Arc<StringDedupTable>,
    op: TableOp,
    cursor: AtomicUsize,
    partition: usize,
}

impl DedupTableTask {
    fn new(table: Arc<StringDedupTable>, op: TableOp, workers: usize) -> Self {
        let partition = (table.size() / (workers.max(1) * 4)).max(1);
        DedupTableTask {
            table,
            op,
            cursor: AtomicUsize::new(0),
            partition,
        }
    }

    fn claim(&self) -> Option<Range<usize>> {
        let size = self.table.size();
        let start = self.cursor.fetch_add(self.partition, Ordering::Relaxed);
        if start >= size {
            None
        } else {
            Some(start..(start + self.partition).min(size))
        }
    }
}

impl GCWork for DedupTableTask {
    fn do_work(&self, _worker: &mut GCWorker, heap: &Heap) {
        while let Some(buckets) = self.claim() {
            match &self.op {
                TableOp::Unlink => {
                    let ctx = heap.complete_marking_context();
                    self.table.unlink(buckets, |array| ctx.is_marked(array));
                }
                TableOp::Transfer(target, rehash) => self.table.transfer(buckets, target, *rehash),
                TableOp::Update => self.table.update(buckets, resolve),
                TableOp::Adjust => self.table.update(buckets, get_forwardee_raw),
            }
        }
    }
}
