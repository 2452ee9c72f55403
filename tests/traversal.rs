mod common;

use ccgc::util::options::HeuristicsMode;
use common::*;
use std::collections::HashSet;

#[test]
fn traversal_cycles_preserve_graph() {
    let heap = heap(options(HeuristicsMode::Traversal));
    let mutator = heap.bind_mutator();
    let root = build_list(&mutator, 1500, 4);
    mutator.request_concurrent_cycle();
    check_list(&mutator, root, 1500);
    assert_eq!(heap.stats().traversal_cycles(), 1);
    assert_eq!(heap.stats().concurrent_cycles(), 0);
    verify_idle(&heap, &mutator);
}

#[test]
fn second_traversal_evacuates_with_previous_liveness() {
    let heap = heap(options(HeuristicsMode::Traversal));
    let mutator = heap.bind_mutator();
    let root = build_list(&mutator, 1500, 4);
    // The first traversal only learns the liveness of the regions.
    mutator.request_concurrent_cycle();
    let before: HashSet<_> = list_nodes(&mutator, root).into_iter().collect();
    mutator.request_concurrent_cycle();
    let after = list_nodes(&mutator, root);
    assert_eq!(heap.stats().traversal_cycles(), 2);
    assert!(
        after.iter().any(|node| !before.contains(node)),
        "nothing was evacuated"
    );
    assert!(heap.gc_state().is_stable());
    assert!(heap.collection_set().is_empty());
    check_list(&mutator, root, 1500);
    verify_idle(&heap, &mutator);
}

#[test]
fn traversal_reclaims_dead_regions() {
    let heap = heap(options(HeuristicsMode::Traversal));
    let mutator = heap.bind_mutator();
    let root = build_list(&mutator, 100, 0);
    // Whole regions of garbage.
    for _ in 0..(heap.regions().region_size() * 4 / 40) {
        mutator.alloc_plain(1, 2).unwrap();
    }
    let used_before = heap.used();
    mutator.request_concurrent_cycle();
    assert!(heap.used() + 3 * heap.regions().region_size() <= used_before);
    check_list(&mutator, root, 100);
}
