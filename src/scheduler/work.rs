use super::worker::GCWorker;
use crate::heap::Heap;

/// A unit of parallel GC work. The work gang runs the same task on every active worker, and
/// workers split the work among themselves through shared claim cursors.
pub trait GCWork: 'static + Send + Sync {
    fn do_work(&self, worker: &mut GCWorker, heap: &Heap);
}
