//! Concurrent marking.
//!
//! Marking computes reachability from the roots with a snapshot-at-the-beginning guarantee: every
//! object reachable when marking starts, or logged by the SATB barrier while it runs, ends up
//! marked. Two marking contexts alternate between cycles. The "next" context is written by the
//! running marking, while the "complete" context holds the result of the previous one.

mod bitmap;
mod concurrent_mark;
mod context;
mod satb;
mod terminator;

pub use bitmap::MarkBitmap;
pub use concurrent_mark::{ConcurrentMark, ConcurrentMarkingTask, MarkMode};
pub use context::MarkingContext;
pub use satb::{SATBMarkQueue, SATBMarkQueueSet};
pub use terminator::TaskTerminator;

use crate::region::RegionTable;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The pair of marking contexts.
pub struct MarkingContexts {
    contexts: [MarkingContext; 2],
    next: AtomicUsize,
}

impl MarkingContexts {
    pub fn new(regions: &RegionTable) -> Self {
        MarkingContexts {
            contexts: [MarkingContext::new(regions), MarkingContext::new(regions)],
            next: AtomicUsize::new(0),
        }
    }

    pub fn next(&self) -> &MarkingContext {
        &self.contexts[self.next.load(Ordering::Acquire)]
    }

    pub fn complete(&self) -> &MarkingContext {
        &self.contexts[1 - self.next.load(Ordering::Acquire)]
    }

    /// Make the finished "next" context the complete one. Only called in a pause.
    pub(crate) fn swap(&self) {
        self.next.fetch_xor(1, Ordering::AcqRel);
    }

    pub fn both(&self) -> impl Iterator<Item = &MarkingContext> {
        self.contexts.iter()
    }
}
