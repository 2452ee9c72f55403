#![allow(dead_code)]

use ccgc::memory_manager;
use ccgc::util::constants::BYTES_IN_KBYTE;
use ccgc::util::options::{HeuristicsMode, Options};
use ccgc::verifier::{self, VerifyPoint};
use ccgc::{Heap, Mutator, ObjectReference};
use std::sync::Arc;

/// A 4 MiB heap of 64 KiB regions with verification on. Collections run on the requesting
/// thread unless the test starts the collector threads.
pub fn options(heuristics: HeuristicsMode) -> Options {
    let mut options = Options::without_env();
    options.heap_size = 4 * 1024 * BYTES_IN_KBYTE;
    options.region_size = 64 * BYTES_IN_KBYTE;
    options.threads = 2;
    options.heuristics = heuristics;
    options.tlab_size = 4 * BYTES_IN_KBYTE;
    options.gclab_size = 4 * BYTES_IN_KBYTE;
    options.pacing = false;
    options.verify = true;
    options.guaranteed_gc_interval = 0;
    options
}

pub fn heap(options: Options) -> Arc<Heap> {
    memory_manager::ccgc_init(options).unwrap()
}

/// Push a list of `len` nodes onto a new root, interleaved with `garbage_per_node` unreachable
/// objects. Node `i` carries `i` in its payload. Returns the root index.
pub fn build_list(mutator: &Mutator, len: usize, garbage_per_node: usize) -> usize {
    let root = mutator.push_root(None);
    for i in 0..len {
        for _ in 0..garbage_per_node {
            mutator.alloc_plain(1, 2).unwrap();
        }
        let node = mutator.alloc_plain(1, 1).unwrap();
        mutator.write_word(node, 0, i);
        mutator.store(node, 0, mutator.root(root));
        mutator.set_root(root, Some(node));
    }
    root
}

/// Walk the list at `root` and check every node is still there, in order.
pub fn check_list(mutator: &Mutator, root: usize, len: usize) {
    let mut node = mutator.root(root);
    for i in (0..len).rev() {
        let current = node.unwrap_or_else(|| panic!("list ends early, node {} missing", i));
        assert_eq!(mutator.read_word(current, 0), i);
        node = mutator.load(current, 0);
    }
    assert!(node.is_none(), "list is longer than {}", len);
}

/// Every object on the list at `root`.
pub fn list_nodes(mutator: &Mutator, root: usize) -> Vec<ObjectReference> {
    let mut nodes = vec![];
    let mut node = mutator.root(root);
    while let Some(current) = node {
        nodes.push(current);
        node = mutator.load(current, 0);
    }
    nodes
}

/// Run the verifier in a pause.
pub fn verify_idle(heap: &Heap, mutator: &Mutator) {
    mutator.enter_safe_region(|| {
        heap.with_world_stopped(|heap| verifier::verify(heap, VerifyPoint::Idle))
    })
    .unwrap();
}

pub fn reachable_bytes(heap: &Heap, mutator: &Mutator) -> usize {
    mutator.enter_safe_region(|| heap.with_world_stopped(verifier::reachable_bytes))
}
