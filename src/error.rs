//! Errors reported to the embedding runtime.

use thiserror::Error;

/// An allocation request that could not be satisfied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// The heap is exhausted even after a full GC.
    #[error("out of memory: {requested} bytes requested after a full GC")]
    OutOfMemory { requested: usize },
    /// The object can never fit in this heap.
    #[error("object of {requested} bytes exceeds the heap capacity of {capacity} bytes")]
    TooLarge { requested: usize, capacity: usize },
    /// The heap is shutting down and no longer serves allocations.
    #[error("the heap is shutting down")]
    ShuttingDown,
}

/// A heap that could not be constructed.
#[derive(Debug, Error)]
pub enum HeapError {
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("failed to reserve heap memory")]
    Mmap(#[source] std::io::Error),
    #[error("failed to start a collector thread")]
    ThreadSpawn(#[source] std::io::Error),
}
