//! The object model.
//!
//! Every object starts at a 16-byte aligned address and has this layout, in words:
//!
//! | word              | content                                                        |
//! |-------------------|----------------------------------------------------------------|
//! | 0                 | the forwarding slot; holds the object's own address unless forwarded |
//! | 1                 | the header: size in words, number of reference fields, kind    |
//! | 2 .. 2 + refs     | reference fields; 0 is null                                    |
//! | 2 + refs ..       | payload words                                                  |
//!
//! The size is rounded up to an even number of words so that the next object is aligned, too.

use crate::util::constants::*;
use crate::util::conversions::raw_align_up;
use crate::util::Address;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Index of the forwarding word.
pub const FORWARDING_WORD: usize = 0;
/// Index of the header word.
pub const HEADER_WORD: usize = 1;
/// Number of words before the first reference field.
pub const OBJECT_HEADER_WORDS: usize = 2;
/// Number of bytes before the first reference field.
pub const OBJECT_HEADER_BYTES: usize = OBJECT_HEADER_WORDS * BYTES_IN_WORD;

/// The largest number of reference fields an object may have.
pub const MAX_REF_FIELDS: usize = u16::MAX as usize;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Reference fields followed by untyped payload words.
    Plain = 0,
    /// One reference field that points at a `ByteArray` with the characters.
    String = 1,
    /// Payload word 0 is the length in bytes, and the bytes follow.
    ByteArray = 2,
    /// Dead space. Fillers are never reachable.
    Filler = 3,
}

impl ObjectKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ObjectKind::Plain),
            1 => Some(ObjectKind::String),
            2 => Some(ObjectKind::ByteArray),
            3 => Some(ObjectKind::Filler),
            _ => None,
        }
    }
}

const SIZE_MASK: usize = u32::MAX as usize;
const REF_COUNT_SHIFT: usize = 32;
const REF_COUNT_MASK: usize = u16::MAX as usize;
const KIND_SHIFT: usize = 48;

/// The decoded header word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ObjectHeader {
    pub size_words: usize,
    pub ref_count: usize,
    pub kind: ObjectKind,
}

impl ObjectHeader {
    pub fn new(kind: ObjectKind, ref_count: usize, payload_words: usize) -> Self {
        debug_assert!(ref_count <= MAX_REF_FIELDS);
        ObjectHeader {
            size_words: object_size_words(ref_count, payload_words),
            ref_count,
            kind,
        }
    }

    /// A filler that covers exactly `bytes` bytes.
    pub fn filler(bytes: usize) -> Self {
        debug_assert!(bytes >= MIN_OBJECT_SIZE && bytes % MIN_OBJECT_ALIGNMENT == 0);
        ObjectHeader {
            size_words: bytes >> LOG_BYTES_IN_WORD,
            ref_count: 0,
            kind: ObjectKind::Filler,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.size_words << LOG_BYTES_IN_WORD
    }

    pub fn encode(&self) -> usize {
        debug_assert!(self.size_words <= SIZE_MASK);
        self.size_words | (self.ref_count << REF_COUNT_SHIFT) | ((self.kind as usize) << KIND_SHIFT)
    }

    pub fn decode(word: usize) -> Self {
        let kind = ObjectKind::from_u8((word >> KIND_SHIFT) as u8)
            .unwrap_or_else(|| panic!("corrupt object header {:#x}", word));
        ObjectHeader {
            size_words: word & SIZE_MASK,
            ref_count: (word >> REF_COUNT_SHIFT) & REF_COUNT_MASK,
            kind,
        }
    }
}

/// The size in words of an object with the given number of fields, rounded up to the alignment.
pub const fn object_size_words(ref_count: usize, payload_words: usize) -> usize {
    raw_align_up(OBJECT_HEADER_WORDS + ref_count + payload_words, WORDS_IN_GRANULE)
}

/// The size in bytes of an object with the given number of fields.
pub const fn object_size_bytes(ref_count: usize, payload_words: usize) -> usize {
    object_size_words(ref_count, payload_words) << LOG_BYTES_IN_WORD
}

/// Payload words needed by a byte array holding `len` bytes.
pub const fn byte_array_payload_words(len: usize) -> usize {
    1 + raw_align_up(len, BYTES_IN_WORD) / BYTES_IN_WORD
}

/// A reference to a heap object. It is never null; `Option<ObjectReference>` is the nullable
/// reference and has the same size.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq)]
pub struct ObjectReference(NonZeroUsize);

impl ObjectReference {
    pub fn from_raw_address(addr: Address) -> Option<ObjectReference> {
        NonZeroUsize::new(addr.as_usize()).map(ObjectReference)
    }

    /// # Safety
    /// `addr` must not be zero.
    pub unsafe fn from_raw_address_unchecked(addr: Address) -> ObjectReference {
        debug_assert!(!addr.is_zero());
        ObjectReference(NonZeroUsize::new_unchecked(addr.as_usize()))
    }

    pub fn to_raw_address(self) -> Address {
        unsafe { Address::from_usize(self.0.get()) }
    }

    pub fn value(self) -> usize {
        self.0.get()
    }

    pub(crate) fn from_slot_value(value: usize) -> Option<ObjectReference> {
        NonZeroUsize::new(value).map(ObjectReference)
    }

    fn word(self, index: usize) -> Address {
        self.to_raw_address() + (index << LOG_BYTES_IN_WORD)
    }

    pub fn forwarding_slot(self) -> Address {
        self.word(FORWARDING_WORD)
    }

    pub fn header(self) -> ObjectHeader {
        ObjectHeader::decode(unsafe { self.word(HEADER_WORD).atomic_load::<AtomicUsize>(Ordering::Relaxed) })
    }

    pub fn kind(self) -> ObjectKind {
        self.header().kind
    }

    pub fn ref_count(self) -> usize {
        self.header().ref_count
    }

    pub fn size_bytes(self) -> usize {
        self.header().size_bytes()
    }

    /// The address right after the object.
    pub fn end(self) -> Address {
        self.to_raw_address() + self.size_bytes()
    }

    /// The address of reference field `index`.
    pub fn ref_slot(self, index: usize) -> Address {
        assert!(
            index < self.ref_count(),
            "{} has no reference field {}",
            self,
            index
        );
        self.word(OBJECT_HEADER_WORDS + index)
    }

    /// The address of payload word `index`.
    pub fn payload_slot(self, index: usize) -> Address {
        let header = self.header();
        let payload_words = header.size_words - OBJECT_HEADER_WORDS - header.ref_count;
        assert!(
            index < payload_words,
            "{} has no payload word {}",
            self,
            index
        );
        self.word(OBJECT_HEADER_WORDS + header.ref_count + index)
    }

    /// The first byte of a byte array's contents, right after its length word.
    pub(crate) fn byte_array_data(self) -> Address {
        debug_assert_eq!(self.kind(), ObjectKind::ByteArray);
        self.word(OBJECT_HEADER_WORDS + 1)
    }

    /// Visit the address of every reference field.
    pub fn for_each_ref_slot<F: FnMut(Address)>(self, mut f: F) {
        let header = self.header();
        for i in 0..header.ref_count {
            f(self.word(OBJECT_HEADER_WORDS + i));
        }
    }

    /// Load a reference field without any barrier.
    pub fn load_ref(self, index: usize) -> Option<ObjectReference> {
        slot_load(self.ref_slot(index))
    }

    /// Store a reference field without any barrier.
    pub fn store_ref(self, index: usize, value: Option<ObjectReference>) {
        slot_store(self.ref_slot(index), value)
    }

    pub fn load_word(self, index: usize) -> usize {
        unsafe { self.payload_slot(index).atomic_load::<AtomicUsize>(Ordering::Relaxed) }
    }

    pub fn store_word(self, index: usize, value: usize) {
        unsafe {
            self.payload_slot(index)
                .atomic_store::<AtomicUsize>(value, Ordering::Relaxed)
        }
    }

    /// The length of a byte array.
    pub fn byte_array_len(self) -> usize {
        debug_assert_eq!(self.kind(), ObjectKind::ByteArray);
        self.load_word(0)
    }

    /// The bytes of a byte array.
    ///
    /// # Safety
    /// The object must be a byte array that stays in place for `'a`.
    pub unsafe fn byte_array_bytes<'a>(self) -> &'a [u8] {
        let len = self.byte_array_len();
        std::slice::from_raw_parts(self.byte_array_data().to_ptr::<u8>(), len)
    }

    /// Copy the bytes of a byte array.
    pub fn byte_array_to_vec(self) -> Vec<u8> {
        unsafe { self.byte_array_bytes() }.to_vec()
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

static_assertions::assert_eq_size!(Option<ObjectReference>, usize);

pub(crate) fn encode_ref(value: Option<ObjectReference>) -> usize {
    value.map_or(0, |o| o.value())
}

/// Load a reference slot.
pub(crate) fn slot_load(slot: Address) -> Option<ObjectReference> {
    ObjectReference::from_slot_value(unsafe { slot.atomic_load::<AtomicUsize>(Ordering::Acquire) })
}

/// Store a reference slot.
pub(crate) fn slot_store(slot: Address, value: Option<ObjectReference>) {
    unsafe { slot.atomic_store::<AtomicUsize>(encode_ref(value), Ordering::Release) }
}

/// Compare and exchange a reference slot. Returns the previous value either way.
pub(crate) fn slot_compare_exchange(
    slot: Address,
    old: Option<ObjectReference>,
    new: Option<ObjectReference>,
) -> Result<Option<ObjectReference>, Option<ObjectReference>> {
    unsafe {
        slot.compare_exchange::<AtomicUsize>(
            encode_ref(old),
            encode_ref(new),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
    }
    .map(ObjectReference::from_slot_value)
    .map_err(ObjectReference::from_slot_value)
}

/// Swap a reference slot.
pub(crate) fn slot_swap(slot: Address, new: Option<ObjectReference>) -> Option<ObjectReference> {
    ObjectReference::from_slot_value(unsafe {
        slot.atomic_swap::<AtomicUsize>(encode_ref(new), Ordering::AcqRel)
    })
}

/// Format fresh memory as an object. Reference fields and payload are zeroed and the forwarding
/// slot points to the object itself.
///
/// # Safety
/// `addr` must be the start of `header.size_bytes()` bytes that no other thread accesses.
pub(crate) unsafe fn initialize_object(addr: Address, header: ObjectHeader) -> ObjectReference {
    debug_assert!(addr.is_aligned_to(MIN_OBJECT_ALIGNMENT));
    let body = addr + OBJECT_HEADER_BYTES;
    crate::util::memory::zero(body, header.size_bytes() - OBJECT_HEADER_BYTES);
    (addr + BYTES_IN_WORD).store::<usize>(header.encode());
    addr.atomic_store::<AtomicUsize>(addr.as_usize(), Ordering::Release);
    ObjectReference::from_raw_address_unchecked(addr)
}

/// Turn `bytes` bytes at `addr` into a filler object. Does nothing if `bytes` is zero.
///
/// # Safety
/// The range must be inside a region and must not hold any object that is still reachable.
pub(crate) unsafe fn write_filler(addr: Address, bytes: usize) {
    if bytes == 0 {
        return;
    }
    let header = ObjectHeader::filler(bytes);
    (addr + BYTES_IN_WORD).atomic_store::<AtomicUsize>(header.encode(), Ordering::Relaxed);
    addr.atomic_store::<AtomicUsize>(addr.as_usize(), Ordering::Release);
}

/// Copy `from` to `to` and make the copy's forwarding slot point to itself.
/// The ranges may overlap.
///
/// # Safety
/// `to` must have room for the object.
pub(crate) unsafe fn copy_object(from: ObjectReference, to: Address) -> ObjectReference {
    let bytes = from.size_bytes();
    std::ptr::copy(
        from.to_raw_address().to_ptr::<u8>(),
        to.to_mut_ptr::<u8>(),
        bytes,
    );
    to.atomic_store::<AtomicUsize>(to.as_usize(), Ordering::Release);
    ObjectReference::from_raw_address_unchecked(to)
}

/// Visit every object in a parsable range `[start, end)`, fillers included.
pub(crate) fn walk_objects<F: FnMut(ObjectReference)>(start: Address, end: Address, mut f: F) {
    let mut cursor = start;
    while cursor < end {
        let object = unsafe { ObjectReference::from_raw_address_unchecked(cursor) };
        let size = object.size_bytes();
        debug_assert!(size >= MIN_OBJECT_SIZE, "zero sized object at {}", cursor);
        f(object);
        cursor += size;
    }
    debug_assert_eq!(cursor, end, "object walk overran the range end");
}
