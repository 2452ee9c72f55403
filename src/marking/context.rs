use super::bitmap::MarkBitmap;
use crate::object::ObjectReference;
use crate::region::{HeapRegion, RegionTable};
use crate::util::Address;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A mark bitmap together with the top-at-mark-start of every region.
///
/// Objects at or above their region's TAMS were allocated after marking started and are
/// implicitly live in this context.
pub struct MarkingContext {
    bitmap: MarkBitmap,
    top_at_mark_starts: Box<[AtomicUsize]>,
    region_start: Address,
    log_region_size: usize,
}

impl MarkingContext {
    pub fn new(regions: &RegionTable) -> Self {
        MarkingContext {
            bitmap: MarkBitmap::new(regions.start(), regions.end() - regions.start()),
            top_at_mark_starts: regions
                .iter()
                .map(|r| AtomicUsize::new(r.bottom().as_usize()))
                .collect(),
            region_start: regions.start(),
            log_region_size: regions.region_size().trailing_zeros() as usize,
        }
    }

    pub fn bitmap(&self) -> &MarkBitmap {
        &self.bitmap
    }

    fn region_index(&self, addr: Address) -> usize {
        (addr - self.region_start) >> self.log_region_size
    }

    pub fn top_at_mark_start(&self, region: &HeapRegion) -> Address {
        self.tams_of(region.index())
    }

    pub fn tams_of(&self, index: usize) -> Address {
        unsafe { Address::from_usize(self.top_at_mark_starts[index].load(Ordering::Acquire)) }
    }

    pub fn capture_top_at_mark_start(&self, region: &HeapRegion) {
        self.top_at_mark_starts[region.index()].store(region.top().as_usize(), Ordering::Release);
    }

    pub fn set_top_at_mark_start(&self, region: &HeapRegion, tams: Address) {
        debug_assert!(tams >= region.bottom() && tams <= region.end());
        self.top_at_mark_starts[region.index()].store(tams.as_usize(), Ordering::Release);
    }

    pub fn reset_top_at_mark_start(&self, region: &HeapRegion) {
        self.set_top_at_mark_start(region, region.bottom());
    }

    pub fn allocated_after_mark_start(&self, addr: Address) -> bool {
        addr >= self.tams_of(self.region_index(addr))
    }

    /// Mark `object`. Returns true if this call marked it. Objects above TAMS are never
    /// marked, because they are live already.
    #[inline(always)]
    pub fn mark(&self, object: ObjectReference) -> bool {
        let addr = object.to_raw_address();
        !self.allocated_after_mark_start(addr) && self.bitmap.mark(addr)
    }

    /// Mark `object` regardless of TAMS. Returns true if this call marked it.
    pub fn mark_ignoring_tams(&self, object: ObjectReference) -> bool {
        self.bitmap.mark(object.to_raw_address())
    }

    #[inline(always)]
    pub fn is_marked(&self, object: ObjectReference) -> bool {
        let addr = object.to_raw_address();
        self.allocated_after_mark_start(addr) || self.bitmap.is_marked(addr)
    }

    /// Clear the bitmap slice of a region.
    pub fn clear_region(&self, region: &HeapRegion) {
        self.bitmap.clear_range(region.bottom(), region.end());
    }

    pub fn is_region_clear(&self, region: &HeapRegion) -> bool {
        self.bitmap.is_clear_range(region.bottom(), region.end())
    }

    /// Visit every live object of a region below its TAMS.
    pub fn for_each_marked_object<F: FnMut(ObjectReference)>(&self, region: &HeapRegion, mut f: F) {
        let limit = self.top_at_mark_start(region).min(region.top());
        let mut cursor = region.bottom();
        while cursor < limit {
            cursor = self.bitmap.next_marked(cursor, limit);
            if cursor >= limit {
                break;
            }
            let object = unsafe { ObjectReference::from_raw_address_unchecked(cursor) };
            let size = object.size_bytes();
            f(object);
            cursor += size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{initialize_object, ObjectHeader, ObjectKind};
    use crate::util::memory::ReservedMemory;

    #[test]
    fn tams_makes_new_objects_live() {
        let mem = ReservedMemory::reserve(4 << 16, 1 << 16).unwrap();
        let regions = RegionTable::new(mem.start(), 1 << 16, 4);
        let ctx = MarkingContext::new(&regions);
        let r = regions.get(1);
        r.make_regular_allocation();
        let a = r.allocate(32, 1).unwrap();
        let a = unsafe { initialize_object(a, ObjectHeader::new(ObjectKind::Plain, 1, 1)) };
        ctx.capture_top_at_mark_start(r);
        let b = r.allocate(32, 2).unwrap();
        let b = unsafe { initialize_object(b, ObjectHeader::new(ObjectKind::Plain, 1, 1)) };

        assert!(!ctx.is_marked(a));
        assert!(ctx.is_marked(b));
        assert!(!ctx.mark(b));
        assert!(ctx.mark(a));
        assert!(!ctx.mark(a));
        assert!(ctx.is_marked(a));

        let mut seen = vec![];
        ctx.for_each_marked_object(r, |o| seen.push(o));
        assert_eq!(seen, vec![a]);

        ctx.clear_region(r);
        assert!(ctx.is_region_clear(r));
        ctx.reset_top_at_mark_start(r);
        assert!(ctx.is_marked(a));
    }
}
