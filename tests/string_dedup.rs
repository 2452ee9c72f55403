mod common;

use ccgc::memory_manager;
use ccgc::util::options::HeuristicsMode;
use common::*;

fn dedup_options(heuristics: HeuristicsMode) -> ccgc::Options {
    let mut options = options(heuristics);
    options.string_dedup = true;
    options
}

#[test]
fn marking_deduplicates_equal_strings() {
    let heap = heap(dedup_options(HeuristicsMode::Aggressive));
    let mutator = heap.bind_mutator();
    let a = mutator.alloc_string(b"hello, world").unwrap();
    let a = mutator.push_root(Some(a));
    let b = mutator.alloc_string(b"hello, world").unwrap();
    let b = mutator.push_root(Some(b));
    let c = mutator.alloc_string(b"something else").unwrap();
    let c = mutator.push_root(Some(c));
    let array_of = |root| mutator.load(mutator.root(root).unwrap(), 0);
    assert!(!mutator.same_object(array_of(a), array_of(b)));

    mutator.request_concurrent_cycle();
    assert!(mutator.same_object(array_of(a), array_of(b)));
    assert!(!mutator.same_object(array_of(a), array_of(c)));
    assert_eq!(mutator.string_bytes(mutator.root(b).unwrap()), b"hello, world");
    assert_eq!(mutator.string_bytes(mutator.root(c).unwrap()), b"something else");
    assert!(heap.string_dedup().deduplicated() >= 1);
    verify_idle(&heap, &mutator);
}

#[test]
fn mutator_can_deduplicate_directly() {
    let heap = heap(dedup_options(HeuristicsMode::Passive));
    let mutator = heap.bind_mutator();
    let a = mutator.alloc_string(b"interned").unwrap();
    let a = mutator.push_root(Some(a));
    let b = mutator.alloc_string(b"interned").unwrap();
    let b = mutator.push_root(Some(b));
    // The first string becomes canonical, the second one shares its array.
    assert!(!mutator.deduplicate_string(mutator.root(a).unwrap()));
    assert!(mutator.deduplicate_string(mutator.root(b).unwrap()));
    let array_of = |root| mutator.load(mutator.root(root).unwrap(), 0);
    assert!(mutator.same_object(array_of(a), array_of(b)));
}

#[test]
fn dead_canonical_arrays_leave_the_table() {
    let heap = heap(dedup_options(HeuristicsMode::Passive));
    let mutator = heap.bind_mutator();
    let s = mutator.alloc_string(b"short lived").unwrap();
    let root = mutator.push_root(Some(s));
    mutator.deduplicate_string(mutator.root(root).unwrap());
    assert_eq!(heap.string_dedup().len(), 1);

    mutator.pop_root(root);
    memory_manager::handle_full_collection_request(&mutator);
    assert_eq!(heap.string_dedup().len(), 0);

    // An equal string does not get the dead array back. It becomes the new canonical one.
    let t = mutator.alloc_string(b"short lived").unwrap();
    let t = mutator.push_root(Some(t));
    let own_array = mutator.load(mutator.root(t).unwrap(), 0);
    assert!(!mutator.deduplicate_string(mutator.root(t).unwrap()));
    assert!(mutator.same_object(own_array, mutator.load(mutator.root(t).unwrap(), 0)));
    assert_eq!(heap.string_dedup().len(), 1);
    assert_eq!(mutator.string_bytes(mutator.root(t).unwrap()), b"short lived");

    let u = mutator.alloc_string(b"short lived").unwrap();
    let u = mutator.push_root(Some(u));
    assert!(mutator.deduplicate_string(mutator.root(u).unwrap()));
    assert!(mutator.same_object(own_array, mutator.load(mutator.root(u).unwrap(), 0)));
}

#[test]
fn table_follows_compaction() {
    let heap = heap(dedup_options(HeuristicsMode::Passive));
    let mutator = heap.bind_mutator();
    build_list(&mutator, 200, 4);
    let scratch = mutator.root_count() - 1;
    mutator.pop_root(scratch);
    let s = mutator.alloc_string(b"moves during compaction").unwrap();
    let root = mutator.push_root(Some(s));
    mutator.deduplicate_string(mutator.root(root).unwrap());
    memory_manager::handle_full_collection_request(&mutator);

    // A new equal string must find the moved canonical array.
    let t = mutator.alloc_string(b"moves during compaction").unwrap();
    let t = mutator.push_root(Some(t));
    assert!(mutator.deduplicate_string(mutator.root(t).unwrap()));
    let canonical = mutator.load(mutator.root(root).unwrap(), 0);
    assert!(mutator.same_object(canonical, mutator.load(mutator.root(t).unwrap(), 0)));
    assert_eq!(heap.string_dedup().len(), 1);
}
