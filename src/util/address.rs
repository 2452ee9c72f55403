use atomic_traits::Atomic;
use bytemuck::NoUninit;

use std::fmt;
use std::ops::*;
use std::sync::atomic::Ordering;

/// A length in bytes.
pub type ByteSize = usize;

/// A raw machine address, usually a heap word: a region boundary, a bump
/// pointer, an object start or one of its slots.
///
/// Offsetting and comparing addresses is safe. Every access through one is
/// `unsafe` and requires the address to point into mapped heap memory.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit, Default)]
pub struct Address(usize);

impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, bytes: ByteSize) -> Address {
        Address(self.0 + bytes)
    }
}

impl AddAssign<ByteSize> for Address {
    fn add_assign(&mut self, bytes: ByteSize) {
        self.0 += bytes;
    }
}

impl Sub<ByteSize> for Address {
    type Output = Address;
    fn sub(self, bytes: ByteSize) -> Address {
        Address(self.0 - bytes)
    }
}

/// Distance between two addresses. The left side must not be below the right.
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, lower: Address) -> ByteSize {
        debug_assert!(self.0 >= lower.0, "{} is below {}", self, lower);
        self.0 - lower.0
    }
}

impl Address {
    /// Marks an empty bump-pointer range.
    pub const ZERO: Self = Address(0);

    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    /// # Safety
    /// The caller vouches that `raw` is either never accessed or points into
    /// mapped heap memory.
    pub const unsafe fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    /// Plain read of a word that no other thread writes concurrently.
    ///
    /// # Safety
    /// The address must be mapped and aligned for `T`.
    pub unsafe fn load<T: Copy>(self) -> T {
        *(self.0 as *const T)
    }

    /// Plain write, used while an object is still private to its allocator.
    ///
    /// # Safety
    /// The address must be mapped and aligned for `T`.
    pub unsafe fn store<T>(self, value: T) {
        // write() so that the old bits are never dropped as a T
        (self.0 as *mut T).write(value);
    }

    /// # Safety
    /// The address must be mapped and aligned for `T`.
    pub unsafe fn atomic_load<T: Atomic>(self, order: Ordering) -> T::Type {
        (*(self.0 as *const T)).load(order)
    }

    /// # Safety
    /// The address must be mapped and aligned for `T`.
    pub unsafe fn atomic_store<T: Atomic>(self, value: T::Type, order: Ordering) {
        (*(self.0 as *const T)).store(value, order)
    }

    /// CAS on a heap word. Forwarding installation and reference slot
    /// exchanges go through here.
    ///
    /// # Safety
    /// The address must be mapped and aligned for `T`.
    pub unsafe fn compare_exchange<T: Atomic>(
        self,
        expected: T::Type,
        new: T::Type,
        success: Ordering,
        failure: Ordering,
    ) -> Result<T::Type, T::Type> {
        (*(self.0 as *const T)).compare_exchange(expected, new, success, failure)
    }

    /// # Safety
    /// The address must be mapped and aligned for `T`.
    pub unsafe fn atomic_swap<T: Atomic>(self, value: T::Type, order: Ordering) -> T::Type {
        (*(self.0 as *const T)).swap(value, order)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn align_up(self, align: ByteSize) -> Address {
        Address(crate::util::conversions::raw_align_up(self.0, align))
    }

    pub const fn is_aligned_to(self, align: ByteSize) -> bool {
        crate::util::conversions::raw_is_aligned(self.0, align)
    }

    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use crate::util::Address;

    fn at(raw: usize) -> Address {
        unsafe { Address::from_usize(raw) }
    }

    #[test]
    fn bump_pointer_alignment() {
        assert_eq!(at(0x1010).align_up(0x10), at(0x1010));
        assert_eq!(at(0x1018).align_up(0x10), at(0x1020));
        assert!(at(0x4000_0000).is_aligned_to(1 << 20));
        assert!(!at(0x4000_0008).is_aligned_to(0x10));
    }

    #[test]
    fn offsets_within_a_region() {
        let bottom = at(0x4000_0000);
        let mut top = bottom;
        top += 0x40;
        assert_eq!(top - bottom, 0x40);
        assert_eq!(top - 0x40usize, bottom);
        assert_eq!(format!("{}", top), "0x40000040");
    }
}
