use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;

use ccgc::memory_manager;
use ccgc::util::constants::BYTES_IN_KBYTE;
use ccgc::util::options::{HeuristicsMode, Options};
use ccgc::{Heap, Mutator};
use std::sync::Arc;

fn options(heuristics: HeuristicsMode) -> Options {
    let mut options = Options::without_env();
    options.heap_size = 32 * 1024 * BYTES_IN_KBYTE;
    options.region_size = 256 * BYTES_IN_KBYTE;
    options.threads = 2;
    options.heuristics = heuristics;
    options.guaranteed_gc_interval = 0;
    options
}

fn setup(heuristics: HeuristicsMode) -> (Arc<Heap>, Mutator) {
    let heap = memory_manager::ccgc_init(options(heuristics)).unwrap();
    let mutator = memory_manager::bind_mutator(&heap);
    (heap, mutator)
}

/// A list of `len` nodes with `garbage` dead objects between consecutive nodes.
fn build_list(mutator: &Mutator, len: usize, garbage: usize) {
    let root = mutator.push_root(None);
    for _ in 0..len {
        for _ in 0..garbage {
            mutator.alloc_plain(1, 2).unwrap();
        }
        let node = mutator.alloc_plain(1, 1).unwrap();
        mutator.store(node, 0, mutator.root(root));
        mutator.set_root(root, Some(node));
    }
}

fn bench_alloc(c: &mut Criterion) {
    let (_heap, mutator) = setup(HeuristicsMode::Passive);
    c.bench_function("alloc_plain", |b| {
        b.iter(|| mutator.alloc_plain(2, 2).unwrap());
    });
}

fn bench_barriers(c: &mut Criterion) {
    let (_heap, mutator) = setup(HeuristicsMode::Passive);
    let a = mutator.alloc_plain(1, 0).unwrap();
    let root = mutator.push_root(Some(a));
    let b = mutator.alloc_plain(0, 1).unwrap();
    mutator.push_root(Some(b));
    c.bench_function("store_and_load", |bench| {
        bench.iter(|| {
            let a = mutator.root(root).unwrap();
            mutator.store(a, 0, mutator.root(root + 1));
            mutator.load(a, 0)
        });
    });
}

fn bench_cycles(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle");
    group.sample_size(10);
    group.bench_function("concurrent", |b| {
        let (_heap, mutator) = setup(HeuristicsMode::Aggressive);
        build_list(&mutator, 20_000, 2);
        b.iter(|| mutator.request_concurrent_cycle());
    });
    group.bench_function("full", |b| {
        let (_heap, mutator) = setup(HeuristicsMode::Passive);
        build_list(&mutator, 20_000, 2);
        b.iter(|| memory_manager::handle_full_collection_request(&mutator));
    });
    group.finish();
}

pub fn bench_main(c: &mut Criterion) {
    bench_alloc(c);
    bench_barriers(c);
    bench_cycles(c);
}

criterion_group!(benches, bench_main);
criterion_main!(benches);
