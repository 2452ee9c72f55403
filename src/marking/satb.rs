//! Snapshot-at-the-beginning queues.
//!
//! While marking runs, every reference that a mutator overwrites is logged to the mutator's
//! local queue. Full queues are filtered and then handed to the shared set of completed buffers,
//! where marking workers pick them up.

use crate::object::ObjectReference;
use crate::util::constants::SATB_ENQUEUEING_THRESHOLD_PERCENT;
use crate::util::log::trace;
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A per-thread SATB buffer.
pub struct SATBMarkQueue {
    buf: Vec<ObjectReference>,
    capacity: usize,
}

impl SATBMarkQueue {
    pub fn new(capacity: usize) -> Self {
        SATBMarkQueue {
            buf: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Log `object`. `retain` tells which logged entries still need marking when the buffer
    /// fills up.
    pub fn enqueue<F: Fn(ObjectReference) -> bool>(
        &mut self,
        object: ObjectReference,
        qset: &SATBMarkQueueSet,
        retain: F,
    ) {
        if self.buf.len() >= self.capacity {
            self.handle_full_buffer(qset, retain);
        }
        if self.buf.capacity() == 0 {
            self.buf.reserve_exact(self.capacity);
        }
        self.buf.push(object);
    }

    fn handle_full_buffer<F: Fn(ObjectReference) -> bool>(
        &mut self,
        qset: &SATBMarkQueueSet,
        retain: F,
    ) {
        let before = self.buf.len();
        self.buf.retain(|o| retain(*o));
        trace!("SATB buffer filtered from {} to {}", before, self.buf.len());
        // Keep filling the buffer if enough entries were filtered out.
        if self.buf.len() * 100 > self.capacity * SATB_ENQUEUEING_THRESHOLD_PERCENT {
            let full = std::mem::replace(&mut self.buf, Vec::with_capacity(self.capacity));
            qset.enqueue_completed(full);
        }
    }

    /// Hand a partially filled buffer to the completed set.
    pub fn flush(&mut self, qset: &SATBMarkQueueSet) {
        if !self.buf.is_empty() {
            let partial = std::mem::take(&mut self.buf);
            qset.enqueue_completed(partial);
        }
    }

    /// Drop all logged entries.
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

/// The completed SATB buffers of all threads.
pub struct SATBMarkQueueSet {
    completed: SegQueue<Vec<ObjectReference>>,
    completed_count: AtomicUsize,
    active: AtomicBool,
    buffer_size: usize,
    /// Bumped to ask mutators to flush their partial buffers at the next yieldpoint.
    flush_epoch: AtomicUsize,
}

impl SATBMarkQueueSet {
    pub fn new(buffer_size: usize) -> Self {
        SATBMarkQueueSet {
            completed: SegQueue::new(),
            completed_count: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            buffer_size,
            flush_epoch: AtomicUsize::new(0),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn enqueue_completed(&self, buffer: Vec<ObjectReference>) {
        self.completed_count.fetch_add(1, Ordering::AcqRel);
        self.completed.push(buffer);
    }

    pub fn pop_completed(&self) -> Option<Vec<ObjectReference>> {
        let buffer = self.completed.pop();
        if buffer.is_some() {
            self.completed_count.fetch_sub(1, Ordering::AcqRel);
        }
        buffer
    }

    pub fn completed_buffers_num(&self) -> usize {
        self.completed_count.load(Ordering::Acquire)
    }

    /// Drop every completed buffer.
    pub fn abandon_completed(&self) {
        while self.pop_completed().is_some() {}
    }

    pub fn request_flush(&self) {
        self.flush_epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub fn flush_epoch(&self) -> usize {
        self.flush_epoch.load(Ordering::Acquire)
    }
}
