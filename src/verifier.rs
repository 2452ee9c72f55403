//! Heap verification.
//!
//! The verifier walks the object graph from the roots and checks the properties that must hold
//! at a given point of the cycle. It runs inside pauses. The heap runs it at every point when
//! the `verify` option or the `extreme_assertions` feature is on, and panics on any error.

use crate::forwarding::get_forwardee_raw;
use crate::heap::Heap;
use crate::object::{walk_objects, ObjectReference};
use crate::region::RegionState;
use crate::util::constants::MIN_OBJECT_SIZE;
use crate::util::log::debug;
use crate::util::Address;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VerifyPoint {
    BeforeMark,
    AfterMark,
    BeforeEvac,
    AfterEvac,
    BeforeUpdateRefs,
    AfterUpdateRefs,
    AfterDegenerated,
    AfterFull,
    AfterTraversal,
    /// Between cycles.
    Idle,
}

fn referrer(from: &Option<ObjectReference>) -> String {
    match from {
        Some(object) => object.to_string(),
        None => "a root".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("{object} referenced from {} is outside the heap", referrer(.from))]
    OutsideHeap {
        object: ObjectReference,
        from: Option<ObjectReference>,
    },
    #[error("{object} referenced from {} is in region {region} which is {state:?}", referrer(.from))]
    DeadRegion {
        object: ObjectReference,
        from: Option<ObjectReference>,
        region: usize,
        state: RegionState,
    },
    #[error("{object} referenced from {} points into the collection set", referrer(.from))]
    CSetReference {
        object: ObjectReference,
        from: Option<ObjectReference>,
    },
    #[error("{object} referenced from {} is forwarded to {forwardee}", referrer(.from))]
    Forwarded {
        object: ObjectReference,
        from: Option<ObjectReference>,
        forwardee: ObjectReference,
    },
    #[error("{object} forwards to {forwardee}, which is not a canonical copy")]
    NonCanonicalForwardee {
        object: ObjectReference,
        forwardee: ObjectReference,
    },
    #[error("live collection set object {object} was not evacuated")]
    NotEvacuated { object: ObjectReference },
    #[error("reachable object {object} is not marked")]
    Unmarked { object: ObjectReference },
    #[error("region {region} has {reachable} reachable bytes but records {recorded} live bytes")]
    LiveDataTooLow {
        region: usize,
        reachable: usize,
        recorded: usize,
    },
    #[error("region {region} uses {used} bytes but records {live} live bytes")]
    LiveDataMismatch {
        region: usize,
        used: usize,
        live: usize,
    },
    #[error("region {region} is not parsable at {at}")]
    Unparsable { region: usize, at: Address },
    #[error("collection set region {region} is in the free set")]
    CSetInFreeSet { region: usize },
    #[error("region {region} disagrees with the collection set about its membership")]
    CSetMismatch { region: usize },
}

/// What reachable objects may look like with respect to forwarding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Forwarding {
    /// No reachable object is forwarded.
    None,
    /// Objects may be forwarded. The walk continues with the forwardee.
    Any,
    /// Evacuation is finished: every reachable cset object is forwarded.
    Complete,
}

#[derive(Copy, Clone, Debug)]
struct Checks {
    parsable: bool,
    forwarding: Forwarding,
    cset_refs_allowed: bool,
    marked: bool,
    live_data_bounds_reachable: bool,
    live_data_is_used: bool,
}

impl Checks {
    fn at(point: VerifyPoint, heap: &Heap) -> Self {
        let forwarded = heap.gc_state().has_forwarded_objects();
        let stable = Checks {
            parsable: false,
            forwarding: Forwarding::None,
            cset_refs_allowed: false,
            marked: false,
            live_data_bounds_reachable: false,
            live_data_is_used: false,
        };
        match point {
            VerifyPoint::BeforeMark => Checks {
                parsable: true,
                forwarding: if forwarded {
                    Forwarding::Any
                } else {
                    Forwarding::None
                },
                cset_refs_allowed: forwarded,
                ..stable
            },
            VerifyPoint::AfterMark => Checks {
                parsable: true,
                forwarding: if forwarded {
                    Forwarding::Any
                } else {
                    Forwarding::None
                },
                cset_refs_allowed: forwarded,
                marked: true,
                live_data_bounds_reachable: true,
                ..stable
            },
            VerifyPoint::BeforeEvac => Checks {
                forwarding: Forwarding::Any,
                cset_refs_allowed: true,
                marked: true,
                ..stable
            },
            VerifyPoint::AfterEvac | VerifyPoint::BeforeUpdateRefs => Checks {
                forwarding: if heap.evac_failed.load(Ordering::Acquire) {
                    Forwarding::Any
                } else {
                    Forwarding::Complete
                },
                cset_refs_allowed: true,
                ..stable
            },
            VerifyPoint::AfterTraversal => Checks {
                marked: true,
                ..stable
            },
            VerifyPoint::AfterFull => Checks {
                parsable: true,
                marked: true,
                live_data_is_used: true,
                ..stable
            },
            VerifyPoint::AfterUpdateRefs | VerifyPoint::AfterDegenerated | VerifyPoint::Idle => {
                stable
            }
        }
    }
}

/// Check the heap at `point`. Must be called while the world is stopped.
pub fn verify(heap: &Heap, point: VerifyPoint) -> Result<(), VerifyError> {
    let checks = Checks::at(point, heap);
    debug!("Verifying heap at {:?}", point);
    verify_regions(heap)?;
    if checks.parsable {
        verify_parsable(heap)?;
    }
    let reachable = verify_reachable(heap, &checks)?;
    if checks.live_data_bounds_reachable {
        for region in heap.regions().iter() {
            let recorded = region.live_data_bytes();
            let reachable = reachable[region.index()];
            if region.is_active() && !region.is_humongous() && reachable > recorded {
                return Err(VerifyError::LiveDataTooLow {
                    region: region.index(),
                    reachable,
                    recorded,
                });
            }
        }
    }
    if checks.live_data_is_used {
        for region in heap.regions().iter().filter(|r| r.is_active()) {
            if region.live_data_bytes() != region.used() {
                return Err(VerifyError::LiveDataMismatch {
                    region: region.index(),
                    used: region.used(),
                    live: region.live_data_bytes(),
                });
            }
        }
    }
    Ok(())
}

fn verify_regions(heap: &Heap) -> Result<(), VerifyError> {
    let free_set = heap.lock_free_set();
    let cset = heap.collection_set();
    for region in heap.regions().iter() {
        let index = region.index();
        if region.is_cset() != cset.is_in(index) {
            return Err(VerifyError::CSetMismatch { region: index });
        }
        if cset.is_in(index) && free_set.contains(index) {
            return Err(VerifyError::CSetInFreeSet { region: index });
        }
    }
    Ok(())
}

/// Every regular region must be a sequence of well-formed objects up to its top.
fn verify_parsable(heap: &Heap) -> Result<(), VerifyError> {
    for region in heap.regions().iter() {
        if !(region.is_regular() || region.is_pinned() || region.is_cset()) {
            continue;
        }
        let mut cursor = region.bottom();
        while cursor < region.top() {
            let object = unsafe { ObjectReference::from_raw_address_unchecked(cursor) };
            let size = object.size_bytes();
            let forwarding = unsafe { object.forwarding_slot().load::<usize>() };
            if forwarding == 0
                || size < MIN_OBJECT_SIZE
                || cursor + size > region.top()
            {
                return Err(VerifyError::Unparsable {
                    region: region.index(),
                    at: cursor,
                });
            }
            cursor += size;
        }
    }
    Ok(())
}

struct ReachabilityWalk<'a> {
    heap: &'a Heap,
    checks: &'a Checks,
    visited: HashSet<ObjectReference>,
    stack: Vec<ObjectReference>,
    reachable_bytes: Vec<usize>,
}

impl<'a> ReachabilityWalk<'a> {
    /// Check the reference `object` found in `from` and return the object the walk continues
    /// with.
    fn check_reference(
        &self,
        object: ObjectReference,
        from: Option<ObjectReference>,
    ) -> Result<ObjectReference, VerifyError> {
        self.check_location(object, from)?;
        let in_cset = self.heap.in_collection_set_obj(object);
        if in_cset && !self.checks.cset_refs_allowed {
            return Err(VerifyError::CSetReference { object, from });
        }
        let forwardee = get_forwardee_raw(object);
        if forwardee == object {
            if in_cset && self.checks.forwarding == Forwarding::Complete {
                return Err(VerifyError::NotEvacuated { object });
            }
            return Ok(object);
        }
        if self.checks.forwarding == Forwarding::None {
            return Err(VerifyError::Forwarded {
                object,
                from,
                forwardee,
            });
        }
        self.check_location(forwardee, Some(object))?;
        if get_forwardee_raw(forwardee) != forwardee || self.heap.in_collection_set_obj(forwardee)
        {
            return Err(VerifyError::NonCanonicalForwardee { object, forwardee });
        }
        Ok(forwardee)
    }

    fn check_location(
        &self,
        object: ObjectReference,
        from: Option<ObjectReference>,
    ) -> Result<(), VerifyError> {
        let regions = self.heap.regions();
        if !regions.contains(object.to_raw_address()) {
            return Err(VerifyError::OutsideHeap { object, from });
        }
        let region = regions.region_containing(object.to_raw_address());
        if !region.is_active() || region.is_humongous_continuation() {
            return Err(VerifyError::DeadRegion {
                object,
                from,
                region: region.index(),
                state: region.state(),
            });
        }
        Ok(())
    }

    fn visit(
        &mut self,
        object: ObjectReference,
        from: Option<ObjectReference>,
    ) -> Result<(), VerifyError> {
        let target = self.check_reference(object, from)?;
        if !self.visited.insert(target) {
            return Ok(());
        }
        if self.checks.marked && !self.heap.complete_marking_context().is_marked(target) {
            return Err(VerifyError::Unmarked { object: target });
        }
        let index = self.heap.regions().index_of(target.to_raw_address());
        self.reachable_bytes[index] += target.size_bytes();
        self.stack.push(target);
        Ok(())
    }
}

/// Walk everything reachable from the roots. Returns the reachable bytes of each region.
fn verify_reachable(heap: &Heap, checks: &Checks) -> Result<Vec<usize>, VerifyError> {
    let mut walk = ReachabilityWalk {
        heap,
        checks,
        visited: HashSet::new(),
        stack: Vec::new(),
        reachable_bytes: vec![0; heap.regions().len()],
    };
    let mut roots = Vec::new();
    heap.roots_do(|slot| roots.extend(*slot));
    for root in roots {
        walk.visit(root, None)?;
    }
    while let Some(object) = walk.stack.pop() {
        let mut fields = Vec::with_capacity(object.ref_count());
        for index in 0..object.ref_count() {
            fields.extend(object.load_ref(index));
        }
        for field in fields {
            walk.visit(field, Some(object))?;
        }
    }
    Ok(walk.reachable_bytes)
}

/// Bytes of all objects reachable from the roots. Must be called while the world is stopped.
pub fn reachable_bytes(heap: &Heap) -> usize {
    let checks = Checks {
        parsable: false,
        forwarding: Forwarding::Any,
        cset_refs_allowed: true,
        marked: false,
        live_data_bounds_reachable: false,
        live_data_is_used: false,
    };
    match verify_reachable(heap, &checks) {
        Ok(bytes) => bytes.iter().sum(),
        Err(e) => panic!("Heap is corrupt: {}", e),
    }
}

/// Walk the objects of every regular region. Used by tests to check that pauses leave the heap
/// parsable.
pub fn object_count(heap: &Heap) -> usize {
    let mut count = 0;
    heap.heap_region_iterate(|region| {
        if region.is_regular() || region.is_pinned() {
            walk_objects(region.bottom(), region.top(), |_| count += 1);
        }
    });
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::set_forwarding_address;
    use crate::util::test_util::small_heap_options;

    #[test]
    fn clean_heap_verifies() {
        let heap = Heap::new(small_heap_options()).unwrap();
        let mutator = heap.bind_mutator();
        let a = mutator.alloc_plain(2, 1).unwrap();
        let root = mutator.push_root(Some(a));
        let b = mutator.alloc_plain(0, 3).unwrap();
        mutator.store(mutator.root(root).unwrap(), 0, Some(b));
        mutator.enter_safe_region(|| {
            heap.with_world_stopped(|heap| {
                heap.retire_all_labs();
                verify(heap, VerifyPoint::BeforeMark).unwrap();
                verify(heap, VerifyPoint::Idle).unwrap();
                assert!(reachable_bytes(heap) >= a.size_bytes() + b.size_bytes());
            })
        });
        drop(mutator);
        heap.shutdown();
    }

    #[test]
    fn stray_forwarding_is_reported() {
        let heap = Heap::new(small_heap_options()).unwrap();
        let mutator = heap.bind_mutator();
        let a = mutator.alloc_plain(1, 0).unwrap();
        mutator.push_root(Some(a));
        let b = mutator.alloc_plain(0, 1).unwrap();
        mutator.store(a, 0, Some(b));
        let c = mutator.alloc_plain(0, 1).unwrap();
        set_forwarding_address(b, c.to_raw_address());
        mutator.enter_safe_region(|| {
            heap.with_world_stopped(|heap| {
                let error = verify(heap, VerifyPoint::Idle).unwrap_err();
                assert!(matches!(error, VerifyError::Forwarded { object, .. } if object == b));
            })
        });
        drop(mutator);
        heap.shutdown();
    }
}
