use crate::util::conversions::raw_align_up;
use crate::util::log::warn;
use crate::util::Address;
use std::io::Result;

/// An anonymous memory reservation whose usable range is aligned to a requested alignment.
/// The mapping is released when this is dropped.
pub struct ReservedMemory {
    mapping_start: Address,
    mapping_size: usize,
    start: Address,
    size: usize,
}

// The reservation is only an address range. Access goes through `Address`.
unsafe impl Send for ReservedMemory {}
unsafe impl Sync for ReservedMemory {}

impl ReservedMemory {
    /// Reserve `size` bytes aligned to `align`. The memory is demand-zero and uses no swap
    /// reservation.
    pub fn reserve(size: usize, align: usize) -> Result<Self> {
        debug_assert!(align.is_power_of_two());
        let mapping_size = size + align;
        let mapping_start = mmap_noreserve_anywhere(mapping_size)?;
        let start = mapping_start.align_up(align);
        debug_assert!(start + size <= mapping_start + mapping_size);
        Ok(ReservedMemory {
            mapping_start,
            mapping_size,
            start,
            size,
        })
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn end(&self) -> Address {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for ReservedMemory {
    fn drop(&mut self) {
        if let Err(e) = munmap(self.mapping_start, self.mapping_size) {
            warn!(
                "Failed to unmap heap reservation at {}: {}",
                self.mapping_start, e
            );
        }
    }
}

pub fn zero(start: Address, len: usize) {
    unsafe { std::ptr::write_bytes(start.to_mut_ptr::<u8>(), 0, len) }
}

fn mmap_noreserve_anywhere(size: usize) -> Result<Address> {
    let size = raw_align_up(size, crate::util::constants::BYTES_IN_PAGE);
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE;
    let ret = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
    if ret == libc::MAP_FAILED {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(Address::from_mut_ptr(ret))
    }
}

fn munmap(start: Address, size: usize) -> Result<()> {
    let size = raw_align_up(size, crate::util::constants::BYTES_IN_PAGE);
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
