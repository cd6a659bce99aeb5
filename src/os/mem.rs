use std::{fmt, io, ptr};

use libc::{
    mmap, munmap, EACCES, EAGAIN, EBADF, EINVAL, ENFILE, ENOMEM, MAP_ANONYMOUS, MAP_FAILED,
    MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE,
};
use log::trace;
use once_cell::sync::Lazy;

use crate::util::num::round_up;

static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// The OS page size, queried once
pub fn page_size() -> usize {
    *PAGE_SIZE
}

#[derive(Debug)]
pub struct MapError {
    pub size: usize,
    pub errno: i32,
}

impl MapError {
    fn errno_name(&self) -> &'static str {
        match self.errno {
            ENOMEM => "ENOMEM", // It's basically just this one
            EACCES => "EACCES",
            EAGAIN => "EAGAIN",
            EBADF => "EBADF",
            EINVAL => "EINVAL",
            ENFILE => "ENFILE",
            _ => "unknown",
        }
    }
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mmap() of {} bytes failed with {}",
            self.size,
            self.errno_name()
        )
    }
}

impl std::error::Error for MapError {}

/// A read/write, page-aligned, zero-filled anonymous mapping. Unmapped on
/// drop.
pub struct MmapRegion {
    ptr: *mut u8,
    size: usize,
}

impl MmapRegion {
    /// Map at least `size` bytes (rounded up to whole pages) without reserving
    /// swap for them.
    ///
    /// # Panics
    /// - If `size` is 0
    pub fn map_noreserve(size: usize) -> Result<MmapRegion, MapError> {
        assert_ne!(size, 0, "attempted to mmap() 0 bytes");
        let size = round_up(size, page_size());
        // SAFETY: an anonymous private mapping at a kernel-chosen address
        // cannot alias anything we own.
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(MapError {
                size,
                errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
            });
        }
        trace!("mapped {size} bytes at {:#x}", ptr as usize);
        Ok(MmapRegion {
            ptr: ptr as *mut u8,
            size,
        })
    }

    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn start(&self) -> usize {
        self.ptr as usize
    }

    pub const fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - `self.ptr` came from `mmap()`, so it is page aligned
        // - We mapped exactly `self.size` bytes and never unmapped any of them
        unsafe {
            munmap(self.ptr as _, self.size);
        }
    }
}
