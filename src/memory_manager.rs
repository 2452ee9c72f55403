//! The runtime-facing API.
//!
//! A runtime embeds the collector in these steps:
//!
//! 1. Build [`Options`], from the environment with [`Options::default`] or programmatically.
//! 2. Create the heap with [`ccgc_init`]. This also tries to install the built-in logger.
//! 3. Start the collector threads with [`initialize_collection`] once the runtime can spawn
//!    threads. Until then, collections run on the thread that requests them.
//! 4. Give every thread that touches the heap a [`Mutator`] with [`bind_mutator`]. All heap
//!    accesses go through the mutator, which applies the barriers.
//! 5. Drop the mutators and call [`Heap::shutdown`] when done.

use crate::error::{AllocationError, HeapError};
use crate::gc_state::GCCause;
use crate::heap::Heap;
use crate::mutator::Mutator;
use crate::object::ObjectReference;
use crate::util::log::debug;
use crate::util::options::Options;
use std::sync::Arc;

/// Create a heap. Attempts to initialize the built-in logger first. A runtime that wants its own
/// logger should install it before calling this.
pub fn ccgc_init(options: Options) -> Result<Arc<Heap>, HeapError> {
    match crate::util::logger::try_init() {
        Ok(_) => debug!("ccgc initialized the logger."),
        Err(_) => debug!("ccgc failed to initialize the logger. Possibly a logger has been initialized by user."),
    }
    Heap::new(options)
}

/// Start the GC workers and the control thread.
pub fn initialize_collection(heap: &Arc<Heap>) -> Result<(), HeapError> {
    heap.initialize_collection()
}

/// Register the current thread as a mutator.
pub fn bind_mutator(heap: &Arc<Heap>) -> Mutator {
    heap.bind_mutator()
}

/// Deregister a mutator. Its roots are dropped and its buffers handed to the collector.
pub fn destroy_mutator(mutator: Mutator) {
    drop(mutator)
}

/// Allocate an object with `refs` reference fields and `payload_words` words of payload.
pub fn alloc(
    mutator: &Mutator,
    refs: usize,
    payload_words: usize,
) -> Result<ObjectReference, AllocationError> {
    mutator.alloc_plain(refs, payload_words)
}

/// An explicit collection request from the runtime. Blocks until the collection is done.
/// Whether the collection is concurrent depends on `explicit_gc_invokes_concurrent`.
pub fn handle_user_collection_request(mutator: &Mutator) {
    mutator.collect()
}

/// Run a full collection regardless of the heuristics.
pub fn handle_full_collection_request(mutator: &Mutator) {
    mutator.enter_safe_region(|| mutator.heap().request_full_gc(GCCause::ExplicitGC))
}

/// Ask for a concurrent cycle and wait for it.
pub fn request_concurrent_cycle(mutator: &Mutator) {
    mutator.request_concurrent_cycle()
}

pub fn used_bytes(heap: &Heap) -> usize {
    heap.used()
}

pub fn free_bytes(heap: &Heap) -> usize {
    heap.free_bytes()
}

pub fn total_bytes(heap: &Heap) -> usize {
    heap.capacity()
}
