use crate::forwarding::resolve;
use crate::object::ObjectReference;
use crate::util::log::{debug, trace};
use crate::util::Address;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::ops::Range;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

pub const MIN_TABLE_SIZE: usize = 1 << 10;
pub const MAX_TABLE_SIZE: usize = 1 << 24;
const GROW_LOAD_FACTOR: f64 = 2.0;
const SHRINK_LOAD_FACTOR: f64 = GROW_LOAD_FACTOR / 3.0;
/// A chain longer than this asks for a rehash with a new seed.
const REHASH_CHAIN_LENGTH: usize = 60 * 2;

/// One canonical byte array.
struct DedupEntry {
    hash: u64,
    array: AtomicUsize,
    next: AtomicPtr<DedupEntry>,
}

impl DedupEntry {
    fn new(hash: u64, array: ObjectReference) -> Self {
        DedupEntry {
            hash,
            array: AtomicUsize::new(array.value()),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn array(&self) -> ObjectReference {
        let value = self.array.load(Ordering::Acquire);
        unsafe { ObjectReference::from_raw_address_unchecked(Address::from_usize(value)) }
    }

    fn set_array(&self, array: ObjectReference) {
        self.array.store(array.value(), Ordering::Release);
    }
}

fn same_bytes(array: ObjectReference, bytes: &[u8]) -> bool {
    let array = resolve(array);
    array.byte_array_len() == bytes.len() && unsafe { array.byte_array_bytes() } == bytes
}

/// A chained hash table of canonical byte arrays.
///
/// Lookups and insertions are lock-free: a new entry is published with a CAS on a null link at
/// the end of its chain. Entries are only removed or moved inside pauses, partition by
/// partition, when no lookup can be running.
pub struct StringDedupTable {
    buckets: Box<[AtomicPtr<DedupEntry>]>,
    mask: usize,
    hasher: RandomState,
    entries: AtomicUsize,
    rehash_needed: AtomicBool,
}

impl StringDedupTable {
    pub fn new(size: usize, hasher: RandomState) -> Self {
        debug_assert!(size.is_power_of_two());
        let size = size.clamp(MIN_TABLE_SIZE, MAX_TABLE_SIZE);
        StringDedupTable {
            buckets: (0..size).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            mask: size - 1,
            hasher,
            entries: AtomicUsize::new(0),
            rehash_needed: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hash(&self, bytes: &[u8]) -> u64 {
        self.hasher.hash_one(bytes)
    }

    fn bucket(&self, hash: u64) -> &AtomicPtr<DedupEntry> {
        &self.buckets[hash as usize & self.mask]
    }

    /// Return the canonical array equal to `bytes`. If there is none, `array` becomes the
    /// canonical one and is returned.
    pub fn lookup_or_add(&self, array: ObjectReference, hash: u64, bytes: &[u8]) -> ObjectReference {
        let mut new: *mut DedupEntry = ptr::null_mut();
        let mut link = self.bucket(hash);
        let mut chain = 0;
        loop {
            let current = link.load(Ordering::Acquire);
            if current.is_null() {
                if new.is_null() {
                    new = Box::into_raw(Box::new(DedupEntry::new(hash, array)));
                }
                if link
                    .compare_exchange(ptr::null_mut(), new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.entries.fetch_add(1, Ordering::Relaxed);
                    if chain > REHASH_CHAIN_LENGTH {
                        self.rehash_needed.store(true, Ordering::Relaxed);
                    }
                    return array;
                }
                // Somebody appended first. Look at their entry.
                continue;
            }
            let entry = unsafe { &*current };
            if entry.hash == hash && same_bytes(entry.array(), bytes) {
                if !new.is_null() {
                    drop(unsafe { Box::from_raw(new) });
                }
                return entry.array();
            }
            link = &entry.next;
            chain += 1;
        }
    }

    /// The canonical array equal to `bytes`, if there is one.
    pub fn lookup(&self, hash: u64, bytes: &[u8]) -> Option<ObjectReference> {
        let mut current = self.bucket(hash).load(Ordering::Acquire);
        while !current.is_null() {
            let entry = unsafe { &*current };
            if entry.hash == hash && same_bytes(entry.array(), bytes) {
                return Some(entry.array());
            }
            current = entry.next.load(Ordering::Acquire);
        }
        None
    }

    /// Remove the entries of `buckets` whose array is not live. Returns how many were removed.
    /// Only called in pauses.
    pub(crate) fn unlink(&self, buckets: Range<usize>, is_live: impl Fn(ObjectReference) -> bool) -> usize {
        let mut removed = 0;
        for index in buckets {
            let mut link = &self.buckets[index];
            loop {
                let current = link.load(Ordering::Relaxed);
                if current.is_null() {
                    break;
                }
                let entry = unsafe { &*current };
                if is_live(entry.array()) {
                    link = &entry.next;
                } else {
                    link.store(entry.next.load(Ordering::Relaxed), Ordering::Relaxed);
                    drop(unsafe { Box::from_raw(current) });
                    removed += 1;
                }
            }
        }
        self.entries.fetch_sub(removed, Ordering::Relaxed);
        removed
    }

    /// Replace every array of `buckets` with `f(array)`. Only called in pauses.
    pub(crate) fn update(&self, buckets: Range<usize>, f: impl Fn(ObjectReference) -> ObjectReference) {
        for index in buckets {
            let mut current = self.buckets[index].load(Ordering::Relaxed);
            while !current.is_null() {
                let entry = unsafe { &*current };
                entry.set_array(f(entry.array()));
                current = entry.next.load(Ordering::Relaxed);
            }
        }
    }

    /// Move the entries of `buckets` into `target`. With `rehash`, hashes are recomputed with
    /// the target's seed. Only called in pauses.
    pub(crate) fn transfer(&self, buckets: Range<usize>, target: &StringDedupTable, rehash: bool) {
        for index in buckets {
            let mut current = self.buckets[index].swap(ptr::null_mut(), Ordering::AcqRel);
            while !current.is_null() {
                let entry = unsafe { &mut *current };
                let next = entry.next.load(Ordering::Relaxed);
                if rehash {
                    let array = resolve(entry.array());
                    entry.hash = target.hash(unsafe { array.byte_array_bytes() });
                }
                self.entries.fetch_sub(1, Ordering::Relaxed);
                target.push(current);
                current = next;
            }
        }
    }

    /// Push an entry at the head of its bucket.
    fn push(&self, entry: *mut DedupEntry) {
        let bucket = self.bucket(unsafe { (*entry).hash });
        let mut head = bucket.load(Ordering::Acquire);
        loop {
            unsafe { (*entry).next.store(head, Ordering::Relaxed) };
            match bucket.compare_exchange(head, entry, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    /// The size the table should have for its entry count, if that differs from its size.
    pub(crate) fn resize_target(&self) -> Option<usize> {
        let size = self.size();
        let entries = self.len() as f64;
        if entries > size as f64 * GROW_LOAD_FACTOR && size < MAX_TABLE_SIZE {
            Some(size * 2)
        } else if entries < size as f64 * SHRINK_LOAD_FACTOR && size > MIN_TABLE_SIZE {
            Some(size / 2)
        } else {
            None
        }
    }

    pub(crate) fn is_rehash_needed(&self) -> bool {
        self.rehash_needed.load(Ordering::Relaxed)
    }

    /// A new empty table for the entries of this one.
    pub(crate) fn successor(&self) -> Option<(StringDedupTable, bool)> {
        let rehash = self.is_rehash_needed();
        let size = match (self.resize_target(), rehash) {
            (Some(size), _) => size,
            (None, true) => self.size(),
            (None, false) => return None,
        };
        let hasher = if rehash {
            RandomState::new()
        } else {
            self.hasher.clone()
        };
        debug!(
            "String dedup table {} from {} to {} buckets",
            if rehash { "rehashed" } else { "resized" },
            self.size(),
            size
        );
        Some((StringDedupTable::new(size, hasher), rehash))
    }

    /// The longest chain, for diagnostics.
    pub fn max_chain_length(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| {
                let mut length = 0;
                let mut current = bucket.load(Ordering::Acquire);
                while !current.is_null() {
                    length += 1;
                    current = unsafe { (*current).next.load(Ordering::Acquire) };
                }
                length
            })
            .max()
            .unwrap_or(0)
    }
}

impl Drop for StringDedupTable {
    fn drop(&mut self) {
        let mut freed = 0;
        for bucket in self.buckets.iter() {
            let mut current = bucket.swap(ptr::null_mut(), Ordering::AcqRel);
            while !current.is_null() {
                let entry = unsafe { Box::from_raw(current) };
                current = entry.next.load(Ordering::Relaxed);
                freed += 1;
            }
        }
        trace!("Freed {} string dedup entries", freed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{byte_array_payload_words, initialize_object, ObjectHeader, ObjectKind};
    use crate::util::memory::ReservedMemory;

    /// Byte arrays formatted into an anonymous mapping.
    struct Arrays {
        memory: ReservedMemory,
        cursor: Address,
    }

    impl Arrays {
        fn new() -> Self {
            let memory = ReservedMemory::reserve(1 << 20, 1 << 16).unwrap();
            let cursor = memory.start();
            Arrays { memory, cursor }
        }

        fn alloc(&mut self, bytes: &[u8]) -> ObjectReference {
            let header = ObjectHeader::new(
                ObjectKind::ByteArray,
                0,
                byte_array_payload_words(bytes.len()),
            );
            assert!(self.cursor + header.size_bytes() <= self.memory.end());
            let array = unsafe { initialize_object(self.cursor, header) };
            self.cursor += header.size_bytes();
            array.store_word(0, bytes.len());
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    array.byte_array_data().to_mut_ptr::<u8>(),
                    bytes.len(),
                );
            }
            array
        }
    }

    fn add(table: &StringDedupTable, array: ObjectReference) -> ObjectReference {
        let bytes = array.byte_array_to_vec();
        table.lookup_or_add(array, table.hash(&bytes), &bytes)
    }

    #[test]
    fn first_array_becomes_canonical() {
        let mut arrays = Arrays::new();
        let table = StringDedupTable::new(MIN_TABLE_SIZE, RandomState::new());
        let a = arrays.alloc(b"hello");
        let b = arrays.alloc(b"hello");
        let c = arrays.alloc(b"world");
        assert_eq!(add(&table, a), a);
        assert_eq!(add(&table, b), a);
        assert_eq!(add(&table, c), c);
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(table.hash(b"hello"), b"hello"), Some(a));
        assert_eq!(table.lookup(table.hash(b"other"), b"other"), None);
    }

    #[test]
    fn unlink_drops_dead_arrays() {
        let mut arrays = Arrays::new();
        let table = StringDedupTable::new(MIN_TABLE_SIZE, RandomState::new());
        let live = arrays.alloc(b"live");
        let dead = arrays.alloc(b"dead");
        add(&table, live);
        add(&table, dead);
        let removed = table.unlink(0..table.size(), |array| array == live);
        assert_eq!(removed, 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(table.hash(b"dead"), b"dead"), None);
        let again = arrays.alloc(b"dead");
        assert_eq!(add(&table, again), again);
    }

    #[test]
    fn grows_and_keeps_entries() {
        let mut arrays = Arrays::new();
        let table = StringDedupTable::new(MIN_TABLE_SIZE, RandomState::new());
        let strings: Vec<Vec<u8>> = (0..MIN_TABLE_SIZE * 2 + 1)
            .map(|i| format!("s{}", i).into_bytes())
            .collect();
        let canonical: Vec<ObjectReference> = strings
            .iter()
            .map(|s| add(&table, arrays.alloc(s)))
            .collect();
        assert_eq!(table.resize_target(), Some(MIN_TABLE_SIZE * 2));
        let (target, rehash) = table.successor().unwrap();
        assert!(!rehash);
        // Two partitions, as two workers would claim them.
        let half = table.size() / 2;
        table.transfer(0..half, &target, false);
        table.transfer(half..table.size(), &target, false);
        assert!(table.is_empty());
        assert_eq!(target.len(), strings.len());
        for (s, array) in strings.iter().zip(canonical) {
            assert_eq!(target.lookup(target.hash(s), s), Some(array));
        }
    }

    #[test]
    fn rehash_uses_new_seed() {
        let mut arrays = Arrays::new();
        let table = StringDedupTable::new(MIN_TABLE_SIZE, RandomState::new());
        let a = arrays.alloc(b"abc");
        add(&table, a);
        table.rehash_needed.store(true, Ordering::Relaxed);
        let (target, rehash) = table.successor().unwrap();
        assert!(rehash);
        assert_eq!(target.size(), MIN_TABLE_SIZE);
        table.transfer(0..table.size(), &target, true);
        assert_eq!(target.lookup(target.hash(b"abc"), b"abc"), Some(a));
    }
}
