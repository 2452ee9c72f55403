//! Local allocation buffers.
//!
//! Mutators allocate small objects from a thread-local allocation buffer (TLAB) and evacuating
//! threads copy objects into a GC local allocation buffer (GCLAB). Both are plain bump pointers
//! over a chunk handed out by the free set.

use crate::object::write_filler;
use crate::util::constants::MIN_OBJECT_SIZE;
use crate::util::log::trace;
use crate::util::Address;

#[derive(Debug, Default)]
pub struct LocalAllocBuffer {
    cursor: Address,
    limit: Address,
}

impl LocalAllocBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start allocating from `[start, start + size)`. The current buffer must have been retired.
    pub fn set(&mut self, start: Address, size: usize) {
        debug_assert!(self.is_empty(), "LAB replaced without being retired");
        self.cursor = start;
        self.limit = start + size;
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.cursor
    }

    /// Bump-allocate `size` bytes. `size` is a multiple of the object alignment.
    #[inline(always)]
    pub fn alloc(&mut self, size: usize) -> Option<Address> {
        let result = self.cursor;
        let new_cursor = result + size;
        if new_cursor > self.limit {
            None
        } else {
            self.cursor = new_cursor;
            Some(result)
        }
    }

    /// Undo the allocation `[start, start + size)` if it was the most recent one.
    pub fn rollback(&mut self, start: Address, size: usize) -> bool {
        if start + size == self.cursor {
            self.cursor = start;
            true
        } else {
            false
        }
    }

    /// Make the unused tail parsable and give up the buffer.
    pub fn retire(&mut self) {
        let remaining = self.remaining();
        if remaining > 0 {
            debug_assert!(remaining >= MIN_OBJECT_SIZE);
            trace!("Retire LAB tail [{}, {})", self.cursor, self.limit);
            unsafe { write_filler(self.cursor, remaining) };
        }
        self.cursor = Address::ZERO;
        self.limit = Address::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{walk_objects, ObjectKind};
    use crate::util::memory::ReservedMemory;

    #[test]
    fn bump_until_full() {
        let mem = ReservedMemory::reserve(1 << 16, 1 << 16).unwrap();
        let mut lab = LocalAllocBuffer::new();
        assert!(lab.alloc(16).is_none());
        lab.set(mem.start(), 64);
        assert_eq!(lab.alloc(32), Some(mem.start()));
        assert_eq!(lab.alloc(32), Some(mem.start() + 32usize));
        assert!(lab.alloc(16).is_none());
        assert!(lab.is_empty());
    }

    #[test]
    fn retire_fills_the_tail() {
        let mem = ReservedMemory::reserve(1 << 16, 1 << 16).unwrap();
        let mut lab = LocalAllocBuffer::new();
        lab.set(mem.start(), 256);
        let a = lab.alloc(32).unwrap();
        unsafe {
            crate::object::initialize_object(
                a,
                crate::object::ObjectHeader::new(ObjectKind::Plain, 1, 1),
            )
        };
        lab.retire();
        assert!(lab.is_empty());
        let mut kinds = vec![];
        walk_objects(mem.start(), mem.start() + 256usize, |o| kinds.push(o.kind()));
        assert_eq!(kinds, vec![ObjectKind::Plain, ObjectKind::Filler]);
    }

    #[test]
    fn rollback_only_the_last_allocation() {
        let mem = ReservedMemory::reserve(1 << 16, 1 << 16).unwrap();
        let mut lab = LocalAllocBuffer::new();
        lab.set(mem.start(), 256);
        let a = lab.alloc(32).unwrap();
        let b = lab.alloc(32).unwrap();
        assert!(!lab.rollback(a, 32));
        assert!(lab.rollback(b, 32));
        assert_eq!(lab.remaining(), 224);
    }
}
