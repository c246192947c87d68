//! Executable memory management for the code cache.
//!
//! This module provides:
//! - Platform-specific executable memory allocation (mmap/VirtualAlloc)
//! - Write-then-execute (W^X) protection toggling for patch operations
//!
//! # Safety
//! All memory management is inherently unsafe. This module encapsulates
//! the unsafety behind safe APIs where possible; callers interact with the
//! region through the code cache, which serializes all mutation.

use std::ptr::NonNull;

use kestrel_core::{JitError, JitResult};

// =============================================================================
// Platform-specific primitives
// =============================================================================

#[cfg(unix)]
mod platform {
    use std::ptr;

    pub const PAGE_SIZE: usize = 4096;

    /// Allocate memory with read-write permissions.
    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    /// Free allocated memory.
    pub unsafe fn free(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }

    /// Make memory executable (and non-writable).
    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_EXEC) == 0 }
    }

    /// Make memory writable (remove execute permission).
    pub unsafe fn make_writable(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
    }
}

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READWRITE, VirtualAlloc,
        VirtualFree, VirtualProtect,
    };

    pub const PAGE_SIZE: usize = 4096;

    /// Allocate memory with read-write permissions.
    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) as *mut u8
        }
    }

    /// Free allocated memory.
    pub unsafe fn free(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }

    /// Make memory executable (and non-writable).
    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        let mut old_protect = 0;
        unsafe { VirtualProtect(ptr as *mut _, size, PAGE_EXECUTE_READ, &mut old_protect) != 0 }
    }

    /// Make memory writable (remove execute permission).
    pub unsafe fn make_writable(ptr: *mut u8, size: usize) -> bool {
        let mut old_protect = 0;
        unsafe { VirtualProtect(ptr as *mut _, size, PAGE_READWRITE, &mut old_protect) != 0 }
    }
}

pub use platform::PAGE_SIZE;

// =============================================================================
// Executable Region
// =============================================================================

/// A fixed-capacity region of memory that can be flipped between writable
/// and executable.
///
/// The region follows a W^X model:
/// 1. Allocated writable; translations are copied in while writable
/// 2. Flipped executable (and non-writable) for normal execution
/// 3. Flipped writable again, briefly, for patch operations
///
/// The region itself performs no allocation bookkeeping; the code cache
/// bump-allocates offsets into it.
pub struct ExecutableRegion {
    /// Pointer to the allocated memory.
    ptr: NonNull<u8>,
    /// Total allocated size (page-aligned).
    capacity: usize,
}

impl ExecutableRegion {
    /// Allocate a region of at least `min_capacity` bytes.
    ///
    /// The actual capacity is rounded up to the nearest page boundary.
    /// The region starts out writable.
    pub fn new(min_capacity: usize) -> JitResult<Self> {
        let capacity = align_to_page(min_capacity.max(PAGE_SIZE));

        // SAFETY: size is non-zero and page-aligned.
        let ptr = unsafe { platform::alloc_rw(capacity) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            JitError::Memory(format!("failed to map {capacity} bytes of code memory"))
        })?;

        Ok(ExecutableRegion { ptr, capacity })
    }

    /// Base address of the region.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check whether `addr` falls inside this region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.ptr.as_ptr() as usize;
        addr >= base && addr < base + self.capacity
    }

    /// Make the whole region writable (removing execute permission).
    pub fn make_writable(&self) -> JitResult<()> {
        // SAFETY: ptr/capacity describe a live mapping owned by self.
        let ok = unsafe { platform::make_writable(self.ptr.as_ptr(), self.capacity) };
        if ok {
            Ok(())
        } else {
            Err(JitError::Memory("mprotect(rw) failed".into()))
        }
    }

    /// Make the whole region executable (removing write permission).
    pub fn make_executable(&self) -> JitResult<()> {
        // SAFETY: ptr/capacity describe a live mapping owned by self.
        let ok = unsafe { platform::make_executable(self.ptr.as_ptr(), self.capacity) };
        if ok {
            Ok(())
        } else {
            Err(JitError::Memory("mprotect(rx) failed".into()))
        }
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/capacity came from platform::alloc_rw and have not
        // been freed.
        unsafe { platform::free(self.ptr.as_ptr(), self.capacity) };
    }
}

// SAFETY: The region is a raw memory range; all mutation is serialized by
// the code cache lock, and reads of installed code/cells are position-fixed.
unsafe impl Send for ExecutableRegion {}
unsafe impl Sync for ExecutableRegion {}

/// Round `size` up to a page boundary.
#[inline]
pub fn align_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to_page() {
        assert_eq!(align_to_page(1), PAGE_SIZE);
        assert_eq!(align_to_page(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_to_page(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_region_alloc_and_contains() {
        let region = ExecutableRegion::new(100).unwrap();
        assert_eq!(region.capacity(), PAGE_SIZE);

        let base = region.base() as usize;
        assert!(region.contains(base));
        assert!(region.contains(base + PAGE_SIZE - 1));
        assert!(!region.contains(base + PAGE_SIZE));
    }

    #[test]
    fn test_region_write_then_protect() {
        let region = ExecutableRegion::new(PAGE_SIZE).unwrap();

        // Starts writable.
        unsafe { region.base().write(0xAB) };
        region.make_executable().unwrap();

        // Still readable after protection.
        assert_eq!(unsafe { region.base().read() }, 0xAB);

        // Back to writable for patching.
        region.make_writable().unwrap();
        unsafe { region.base().write(0xCD) };
        assert_eq!(unsafe { region.base().read() }, 0xCD);
    }
}
