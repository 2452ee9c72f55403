//! The forwarding indirection.
//!
//! Word 0 of every object is its forwarding slot. It holds the object's own address until the
//! object is evacuated. Evacuation installs the address of the copy with a single CAS, so the
//! slot changes at most once per cycle and always names the one surviving copy.

use crate::object::ObjectReference;
use crate::util::Address;
use std::sync::atomic::{AtomicUsize, Ordering};

fn load_forwarding_word(object: ObjectReference) -> usize {
    unsafe {
        object
            .forwarding_slot()
            .atomic_load::<AtomicUsize>(Ordering::Acquire)
    }
}

/// The object the forwarding slot points to. This is the object itself unless it was evacuated.
pub fn get_forwardee_raw(object: ObjectReference) -> ObjectReference {
    let word = load_forwarding_word(object);
    debug_assert_ne!(word, 0, "object {} has an empty forwarding slot", object);
    unsafe { ObjectReference::from_raw_address_unchecked(Address::from_usize(word)) }
}

/// The copy of an evacuated object, or `None` if the object was not evacuated.
pub fn get_forwardee(object: ObjectReference) -> Option<ObjectReference> {
    let forwardee = get_forwardee_raw(object);
    if forwardee == object {
        None
    } else {
        Some(forwardee)
    }
}

pub fn is_forwarded(object: ObjectReference) -> bool {
    get_forwardee(object).is_some()
}

/// Follow the forwarding slot. Resolving twice gives the same result as resolving once.
pub fn resolve(object: ObjectReference) -> ObjectReference {
    let forwardee = get_forwardee_raw(object);
    debug_assert!(
        forwardee == object || get_forwardee_raw(forwardee) == forwardee,
        "{} forwards to {}, which is not a canonical copy",
        object,
        forwardee
    );
    forwardee
}

/// Resolve a nullable reference.
pub fn resolve_nullable(object: Option<ObjectReference>) -> Option<ObjectReference> {
    object.map(resolve)
}

/// Try to install `copy` as the forwardee of `object`. Returns the winning copy: `copy` if this
/// thread won the race, or the copy installed by another thread.
pub fn try_update_forwardee(object: ObjectReference, copy: ObjectReference) -> ObjectReference {
    let result = unsafe {
        object.forwarding_slot().compare_exchange::<AtomicUsize>(
            object.value(),
            copy.value(),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
    };
    match result {
        Ok(_) => copy,
        Err(winner) => {
            assert_ne!(
                winner,
                object.value(),
                "forwarding CAS of {} failed spuriously",
                object
            );
            unsafe { ObjectReference::from_raw_address_unchecked(Address::from_usize(winner)) }
        }
    }
}

/// Store a forwarding address without a race check. Only used while the world is stopped.
pub(crate) fn set_forwarding_address(object: ObjectReference, to: Address) {
    unsafe {
        object
            .forwarding_slot()
            .atomic_store::<AtomicUsize>(to.as_usize(), Ordering::Relaxed)
    }
}

/// Reset the slot so that the object forwards to itself.
pub(crate) fn clear_forwarding(object: ObjectReference) {
    set_forwarding_address(object, object.to_raw_address())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{copy_object, initialize_object, ObjectHeader, ObjectKind};
    use crate::util::memory::ReservedMemory;
    use std::sync::Arc;

    #[test]
    fn fresh_object_is_not_forwarded() {
        let mem = ReservedMemory::reserve(1 << 16, 1 << 16).unwrap();
        let a = unsafe { initialize_object(mem.start(), ObjectHeader::new(ObjectKind::Plain, 0, 2)) };
        assert!(!is_forwarded(a));
        assert_eq!(resolve(a), a);
        assert_eq!(get_forwardee(a), None);
    }

    #[test]
    fn resolve_is_idempotent() {
        let mem = ReservedMemory::reserve(1 << 16, 1 << 16).unwrap();
        let a = unsafe { initialize_object(mem.start(), ObjectHeader::new(ObjectKind::Plain, 0, 2)) };
        let copy = unsafe { copy_object(a, mem.start() + 1024usize) };
        assert_eq!(try_update_forwardee(a, copy), copy);
        assert_eq!(resolve(a), copy);
        assert_eq!(resolve(resolve(a)), resolve(a));
        assert_eq!(resolve(copy), copy);
    }

    #[test]
    fn only_one_copy_wins() {
        let mem = Arc::new(ReservedMemory::reserve(1 << 20, 1 << 16).unwrap());
        let a = unsafe { initialize_object(mem.start(), ObjectHeader::new(ObjectKind::Plain, 0, 2)) };
        let threads = 8;
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let mem = mem.clone();
                std::thread::spawn(move || {
                    let copy = unsafe { copy_object(a, mem.start() + (i + 1) * 4096) };
                    (copy, try_update_forwardee(a, copy))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winner = resolve(a);
        assert_eq!(
            results.iter().filter(|(copy, won)| copy == won).count(),
            1,
            "exactly one thread installs its copy"
        );
        assert!(results.iter().all(|(_, won)| *won == winner));
    }

    #[test]
    fn clear_restores_self_forwarding() {
        let mem = ReservedMemory::reserve(1 << 16, 1 << 16).unwrap();
        let a = unsafe { initialize_object(mem.start(), ObjectHeader::new(ObjectKind::Plain, 0, 0)) };
        set_forwarding_address(a, mem.start() + 256usize);
        assert!(is_forwarded(a));
        clear_forwarding(a);
        assert!(!is_forwarded(a));
    }
}
