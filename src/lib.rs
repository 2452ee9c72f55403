//! ccgc is a concurrent, region-based, mark-evacuate garbage collector for managed runtimes.
//!
//! The heap is split into equal-sized regions. A collection cycle marks the live objects
//! concurrently with the mutators under a snapshot-at-the-beginning barrier, picks the regions
//! with the most garbage as the collection set, evacuates their live objects concurrently and
//! then concurrently rewrites every reference to the evacuated copies. Each object carries a
//! forwarding slot, so mutators always reach the current copy through the read barrier. The
//! pauses in between only flip the phase state and scan the roots.
//!
//! When mutators run out of memory during a cycle, the cycle is cancelled and finished in a
//! single degenerated pause. If that does not free enough memory, a full stop-the-world
//! mark-compact runs instead.
//!
//! A runtime embeds the collector through [`memory_manager`]: it creates a [`Heap`] from
//! [`Options`](util::options::Options), binds one [`Mutator`] per thread and performs every
//! heap access through it.

#[cfg(test)]
#[macro_use]
extern crate lazy_static;

/// Mutator allocation through thread-local allocation buffers.
pub mod alloc;
/// Read, write, storeval and keep-alive barriers.
pub mod barrier;
mod collector;
/// The control thread and the collection cycle state machine.
pub mod control;
/// String deduplication.
pub mod dedup;
/// Errors reported to the runtime.
pub mod error;
/// Evacuation of collection set objects.
pub mod evacuation;
/// Forwarding slot access.
pub mod forwarding;
/// The global phase state shared with the mutators.
pub mod gc_state;
/// The heap.
pub mod heap;
/// Collection triggers and collection set selection.
pub mod heuristics;
/// Concurrent marking.
pub mod marking;
pub mod memory_manager;
/// The mutator handle.
pub mod mutator;
/// The object model.
pub mod object;
/// Allocation pacing.
pub mod pacer;
/// Heap regions, the free set and the collection set.
pub mod region;
/// Mutator synchronization for pauses.
pub mod safepoint;
/// The GC worker gang.
pub mod scheduler;
/// The concurrent update-references phase.
pub mod update_refs;
pub mod util;
/// Heap verification.
pub mod verifier;

pub use crate::error::{AllocationError, HeapError};
pub use crate::heap::Heap;
pub use crate::mutator::Mutator;
pub use crate::object::{ObjectHeader, ObjectKind, ObjectReference};
pub use crate::util::options::Options;
