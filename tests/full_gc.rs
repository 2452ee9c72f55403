mod common;

use ccgc::error::AllocationError;
use ccgc::memory_manager;
use ccgc::util::options::HeuristicsMode;
use common::*;

#[test]
fn full_gc_compacts_to_reachable_size() {
    let heap = heap(options(HeuristicsMode::Passive));
    let mutator = heap.bind_mutator();
    let root = build_list(&mutator, 2000, 5);
    memory_manager::handle_full_collection_request(&mutator);
    assert_eq!(heap.stats().full_gcs(), 1);
    assert_eq!(heap.used(), reachable_bytes(&heap, &mutator));
    check_list(&mutator, root, 2000);
    verify_idle(&heap, &mutator);
}

#[test]
fn compaction_can_fill_a_region_past_its_old_top() {
    let heap = heap(options(HeuristicsMode::Passive));
    let mutator = heap.bind_mutator();
    // Every object is a shared allocation of 2112 bytes, except one dead object of 42416 bytes
    // that leaves a 2000 byte hole at the end of region 0. Compaction packs 31 nodes into
    // region 0, well past its old top.
    let node_bytes = 2112;
    let root = mutator.push_root(None);
    for i in 0..60 {
        if i == 1 {
            mutator.alloc_plain(0, 5300).unwrap();
        }
        let node = mutator.alloc_plain(1, 261).unwrap();
        mutator.write_word(node, 0, i);
        mutator.store(node, 0, mutator.root(root));
        mutator.set_root(root, Some(node));
    }
    let region_size = heap.regions().region_size();
    let old_top = heap.regions().get(0).top();
    assert_eq!(old_top - heap.regions().get(0).bottom(), region_size - 2000);
    let used_before = heap.used();

    memory_manager::handle_full_collection_request(&mutator);
    let region0 = heap.regions().get(0);
    assert!(region0.top() > old_top);
    assert_eq!(region0.used(), (region_size / node_bytes) * node_bytes);
    assert_eq!(heap.used(), 60 * node_bytes);
    assert_eq!(heap.stats().bytes_reclaimed(), used_before - heap.used());
    check_list(&mutator, root, 60);
    verify_idle(&heap, &mutator);
}

#[test]
fn full_gc_slides_objects_in_allocation_order() {
    let heap = heap(options(HeuristicsMode::Passive));
    let mutator = heap.bind_mutator();
    let root = build_list(&mutator, 300, 3);
    memory_manager::handle_full_collection_request(&mutator);
    let nodes = list_nodes(&mutator, root);
    // The list head was allocated last, so it ends up at the highest address.
    assert!(nodes.windows(2).all(|pair| pair[0] > pair[1]));
    let heap_start = heap.regions().start();
    assert!(nodes.iter().all(|n| n.to_raw_address() >= heap_start));
    assert_eq!(
        heap.regions().get(0).bottom(),
        nodes.last().unwrap().to_raw_address()
    );
}

#[test]
fn pinned_objects_do_not_move() {
    let heap = heap(options(HeuristicsMode::Passive));
    let mutator = heap.bind_mutator();
    let root = build_list(&mutator, 1000, 4);
    let pinned = mutator.pin_object(mutator.root(root).unwrap());
    memory_manager::handle_full_collection_request(&mutator);
    assert_eq!(mutator.root(root), Some(pinned));
    assert!(heap
        .regions()
        .region_containing(pinned.to_raw_address())
        .is_pinned());
    check_list(&mutator, root, 1000);

    mutator.unpin_object(pinned);
    memory_manager::handle_full_collection_request(&mutator);
    assert!(heap.regions().iter().all(|r| !r.is_pinned()));
    check_list(&mutator, root, 1000);
}

#[test]
fn humongous_objects_survive_and_dead_ones_are_reclaimed() {
    let heap = heap(options(HeuristicsMode::Passive));
    let mutator = heap.bind_mutator();
    let words = 3 * heap.regions().region_size() / 16;
    let live = mutator.alloc_plain(1, words).unwrap();
    mutator.write_word(live, words - 1, 42);
    let root = mutator.push_root(Some(live));
    mutator.alloc_plain(0, words).unwrap();
    let humongous_regions = || heap.regions().iter().filter(|r| r.is_humongous()).count();
    let before = humongous_regions();
    memory_manager::handle_full_collection_request(&mutator);
    assert_eq!(humongous_regions(), before / 2);
    let live = mutator.root(root).unwrap();
    assert!(heap
        .regions()
        .region_containing(live.to_raw_address())
        .is_humongous_start());
    assert_eq!(mutator.read_word(live, words - 1), 42);
}

#[test]
fn allocation_failure_without_degeneration_runs_full_gc() {
    let heap = heap(options(HeuristicsMode::Passive));
    let mutator = heap.bind_mutator();
    let root = build_list(&mutator, 200, 0);
    // Several times the heap capacity of garbage.
    let objects = 4 * heap.capacity() / 40;
    for _ in 0..objects {
        mutator.alloc_plain(1, 2).unwrap();
    }
    assert!(heap.stats().full_gcs() >= 1);
    assert!(heap.stats().alloc_failures() >= 1);
    assert_eq!(heap.stats().degenerated_cycles(), 0);
    check_list(&mutator, root, 200);
}

#[test]
fn live_heap_exhaustion_reports_out_of_memory() {
    let heap = heap(options(HeuristicsMode::Passive));
    let mutator = heap.bind_mutator();
    let root = mutator.push_root(None);
    let result = loop {
        match mutator.alloc_plain(1, 60) {
            Ok(node) => {
                mutator.store(node, 0, mutator.root(root));
                mutator.set_root(root, Some(node));
            }
            Err(e) => break e,
        }
    };
    assert!(matches!(result, AllocationError::OutOfMemory { .. }));
    assert!(heap.stats().full_gcs() >= 1);
    // Dropping the only root makes everything reclaimable again.
    mutator.set_root(root, None);
    assert!(mutator.alloc_plain(1, 60).is_ok());
}

#[test]
fn oversized_request_is_rejected() {
    let heap = heap(options(HeuristicsMode::Passive));
    let mutator = heap.bind_mutator();
    let result = mutator.alloc_plain(0, heap.capacity() / 8 + 1);
    assert!(matches!(result, Err(AllocationError::TooLarge { .. })));
    assert_eq!(heap.stats().full_gcs(), 0);
}
