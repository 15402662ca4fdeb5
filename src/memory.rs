//! Memory-mapped ring regions shared with the kernel.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};

/// An owned mapping of one of the ring regions (SQ ring, CQ ring, or the SQE
/// array), unmapped on drop. The kernel reads and writes through the same
/// pages, so all accesses to shared counters must go through atomics.
pub(crate) struct MappedRegion {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

// The region itself is plain shared memory; synchronization is the accessors'
// problem, not the mapping's.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes of the ring fd at one of the `IORING_OFF_*` offsets.
    pub(crate) fn map(fd: RawFd, len: usize, offset: libc::off_t) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len,
        })
    }

    /// Private anonymous mapping, used by the ring view unit tests to stand
    /// in for kernel-provided pages.
    #[cfg(test)]
    pub(crate) fn anonymous(len: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len,
        })
    }

    /// Pointer to a `T` at `byte_offset` into the region.
    ///
    /// # Safety
    ///
    /// `byte_offset + size_of::<T>()` must lie within the region and the
    /// offset must be suitably aligned for `T`.
    pub(crate) unsafe fn offset_as<T>(&self, byte_offset: u32) -> *mut T {
        self.ptr.as_ptr().cast::<u8>().add(byte_offset as usize).cast()
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::munmap(self.ptr.as_ptr(), self.len);
        }
    }
}
