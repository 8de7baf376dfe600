//! Host allocation backing guest RAM.

use std::sync::atomic::{AtomicU16, AtomicU32};

use crate::error::{Error, Result};

/// Anonymous, page-aligned, zero-initialized host memory.
///
/// Host threads and guest vCPUs access the mapping concurrently; the ring
/// protocol (one writer per field, ordered with barriers) is what keeps those
/// accesses coherent, so the mapping hands out raw pointers rather than
/// slices.
pub(crate) struct HostMapping {
    /// Pointer to the allocated memory
    ptr: *mut u8,
    /// Size of the allocation in bytes
    size: usize,
}

// Safety: HostMapping owns its allocation; concurrent access goes through
// raw pointers and atomics, never through Rust references to the bytes.
unsafe impl Send for HostMapping {}
unsafe impl Sync for HostMapping {}

impl HostMapping {
    /// Allocate a new mapping of at least `size` bytes.
    pub(crate) fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::MemoryAllocationFailed(
                "Size must be greater than 0".to_string(),
            ));
        }

        // Round up to page size
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page_size > 0 { page_size as usize } else { 4096 };
        let aligned_size = size
            .checked_add(page_size - 1)
            .map(|s| s & !(page_size - 1))
            .ok_or_else(|| Error::MemoryAllocationFailed(format!("size {} overflows", size)))?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::MemoryAllocationFailed(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size: aligned_size,
        })
    }

    /// Get the size of the mapping in bytes.
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Copy bytes out of the mapping. The caller has bounds-checked `offset`.
    pub(crate) fn read(&self, offset: usize, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    /// Copy bytes into the mapping. The caller has bounds-checked `offset`.
    pub(crate) fn write(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len());
        }
    }

    /// Fill a range with one byte value.
    pub(crate) fn fill(&self, offset: usize, len: usize, value: u8) {
        debug_assert!(offset + len <= self.size);
        unsafe {
            std::ptr::write_bytes(self.ptr.add(offset), value, len);
        }
    }

    /// View a naturally aligned 16-bit field as an atomic.
    pub(crate) fn atomic_u16(&self, offset: usize) -> &AtomicU16 {
        debug_assert!(offset + 2 <= self.size && offset % 2 == 0);
        // Safety: in bounds, aligned (the mapping base is page aligned), and
        // the mapping outlives the returned reference.
        unsafe { &*(self.ptr.add(offset) as *const AtomicU16) }
    }

    /// View a naturally aligned 32-bit field as an atomic.
    pub(crate) fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset + 4 <= self.size && offset % 4 == 0);
        unsafe { &*(self.ptr.add(offset) as *const AtomicU32) }
    }
}

impl Drop for HostMapping {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}
