mod common;

use ccgc::forwarding;
use ccgc::util::options::HeuristicsMode;
use common::*;
use std::collections::HashSet;

#[test]
fn cycle_preserves_reachable_graph() {
    let heap = heap(options(HeuristicsMode::Aggressive));
    let mutator = heap.bind_mutator();
    let root = build_list(&mutator, 2000, 3);
    mutator.request_concurrent_cycle();
    assert_eq!(heap.stats().concurrent_cycles(), 1);
    assert!(heap.gc_state().is_stable());
    check_list(&mutator, root, 2000);
    verify_idle(&heap, &mutator);
}

#[test]
fn cycle_reclaims_garbage() {
    let heap = heap(options(HeuristicsMode::Aggressive));
    let mutator = heap.bind_mutator();
    let root = build_list(&mutator, 1000, 8);
    let used_before = heap.used();
    mutator.request_concurrent_cycle();
    assert!(
        heap.used() < used_before,
        "used {} before, {} after",
        used_before,
        heap.used()
    );
    assert!(heap.stats().bytes_reclaimed() > 0);
    check_list(&mutator, root, 1000);
}

#[test]
fn evacuated_objects_have_a_single_copy() {
    let heap = heap(options(HeuristicsMode::Aggressive));
    let mutator = heap.bind_mutator();
    let root = build_list(&mutator, 1500, 2);
    let before: HashSet<_> = list_nodes(&mutator, root).into_iter().collect();
    mutator.request_concurrent_cycle();
    let after = list_nodes(&mutator, root);
    assert_eq!(after.len(), 1500);
    let unique: HashSet<_> = after.iter().copied().collect();
    assert_eq!(unique.len(), after.len());
    for &node in &after {
        // The cycle is over, so every reachable object is its own canonical copy.
        assert!(!forwarding::is_forwarded(node));
        assert_eq!(forwarding::resolve(node), node);
        assert!(!heap.in_collection_set_obj(node));
    }
    assert!(
        after.iter().any(|node| !before.contains(node)),
        "nothing was evacuated"
    );
}

#[test]
fn collection_set_and_free_set_are_empty_after_cycle() {
    let heap = heap(options(HeuristicsMode::Aggressive));
    let mutator = heap.bind_mutator();
    build_list(&mutator, 500, 4);
    mutator.request_concurrent_cycle();
    assert!(heap.collection_set().is_empty());
    assert!(heap.regions().iter().all(|r| !r.is_cset() && !r.is_trash()));
    assert!(heap.free_bytes() > 0);
}

#[test]
fn back_to_back_cycles() {
    let heap = heap(options(HeuristicsMode::Aggressive));
    let mutator = heap.bind_mutator();
    let root = build_list(&mutator, 800, 2);
    for _ in 0..3 {
        build_list(&mutator, 200, 4);
        let scratch = mutator.root_count() - 1;
        mutator.pop_root(scratch);
        mutator.request_concurrent_cycle();
        check_list(&mutator, root, 800);
    }
    assert_eq!(heap.stats().concurrent_cycles(), 3);
    verify_idle(&heap, &mutator);
}

#[test]
fn explicit_gc_runs_full_by_default() {
    let heap = heap(options(HeuristicsMode::Adaptive));
    let mutator = heap.bind_mutator();
    let root = build_list(&mutator, 500, 4);
    ccgc::memory_manager::handle_user_collection_request(&mutator);
    assert_eq!(heap.stats().full_gcs(), 1);
    assert_eq!(heap.stats().concurrent_cycles(), 0);
    check_list(&mutator, root, 500);
}

#[test]
fn explicit_gc_can_run_concurrent() {
    let mut options = options(HeuristicsMode::Adaptive);
    options.explicit_gc_invokes_concurrent = true;
    let heap = heap(options);
    let mutator = heap.bind_mutator();
    let root = build_list(&mutator, 500, 4);
    ccgc::memory_manager::handle_user_collection_request(&mutator);
    assert_eq!(heap.stats().full_gcs(), 0);
    assert_eq!(heap.stats().concurrent_cycles(), 1);
    check_list(&mutator, root, 500);
}
