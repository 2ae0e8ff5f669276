//! Scratch memory for workers.
//!
//! Each worker owns one [`ScratchBuffer`] for its whole life. Buffers are
//! mapped from huge pages when the OS has them to give, otherwise taken from
//! the heap with page alignment. Falling back is not an error, only a
//! recorded degradation that shows up in the summary and status report.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Heap fallback alignment.
const HEAP_ALIGN: usize = 4096;

/// Default huge page size when the system doesn't report one.
pub const DEFAULT_HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug)]
enum Backing {
    HugePages { mapped: usize },
    Heap(Layout),
}

/// A worker's private, aligned scratch region.
///
/// Freed exactly once, on drop.
pub struct ScratchBuffer {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
    stats: Arc<Counters>,
}

// The buffer is uniquely owned; moving it to the worker thread is the only
// cross-thread use.
unsafe impl Send for ScratchBuffer {}

impl ScratchBuffer {
    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the buffer is backed by huge pages.
    pub fn huge_pages(&self) -> bool {
        matches!(self.backing, Backing::HugePages { .. })
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes for as long as self lives, the
        // region was zero-initialised, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl std::fmt::Debug for ScratchBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchBuffer")
            .field("len", &self.len)
            .field("huge_pages", &self.huge_pages())
            .finish()
    }
}

impl Drop for ScratchBuffer {
    fn drop(&mut self) {
        match self.backing {
            Backing::HugePages { mapped } => {
                // SAFETY: ptr/mapped came from a successful map_huge call and
                // are unmapped only here.
                unsafe { unmap_huge(self.ptr, mapped) };
                self.stats.huge.fetch_sub(1, Ordering::Relaxed);
            }
            Backing::Heap(layout) => {
                // SAFETY: ptr was returned by alloc_zeroed with this layout.
                unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
            }
        }
        self.stats.buffers.fetch_sub(1, Ordering::Relaxed);
        self.stats.bytes.fetch_sub(self.len, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct Counters {
    buffers: AtomicUsize,
    huge: AtomicUsize,
    bytes: AtomicUsize,
}

/// Live scratch memory, for the summary and status report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    /// Buffers currently allocated
    pub buffers: usize,

    /// Of those, how many are backed by huge pages
    pub huge_page_buffers: usize,

    /// Total usable bytes
    pub bytes: usize,
}

impl MemoryUsage {
    /// Some buffers fell back to the heap.
    pub fn degraded(&self) -> bool {
        self.huge_page_buffers < self.buffers
    }
}

/// Hands out scratch buffers and tracks what is live.
#[derive(Debug, Clone)]
pub struct MemoryManager {
    prefer_huge: bool,
    huge_page_size: usize,
    stats: Arc<Counters>,
}

impl MemoryManager {
    pub fn new(prefer_huge: bool, huge_page_size: Option<usize>) -> Self {
        Self {
            prefer_huge,
            huge_page_size: huge_page_size
                .filter(|size| size.is_power_of_two())
                .unwrap_or(DEFAULT_HUGE_PAGE_SIZE),
            stats: Arc::new(Counters::default()),
        }
    }

    /// Allocate a zeroed buffer of `size` bytes.
    ///
    /// Huge pages are tried first when preferred (the mapping is rounded up
    /// to huge page granularity); the heap is the fallback. Only a failed
    /// heap allocation is an error.
    pub fn allocate(&self, size: usize) -> Result<ScratchBuffer> {
        if size == 0 {
            return Err(Error::Allocation("zero-sized scratch buffer".to_string()));
        }

        if self.prefer_huge {
            let mapped = size.div_ceil(self.huge_page_size) * self.huge_page_size;
            if let Some(ptr) = map_huge(mapped) {
                self.stats.huge.fetch_add(1, Ordering::Relaxed);
                return Ok(self.track(ptr, size, Backing::HugePages { mapped }));
            }
            debug!(size, "Huge page mapping failed, using regular memory");
        }

        let layout = Layout::from_size_align(size, HEAP_ALIGN)
            .map_err(|e| Error::Allocation(e.to_string()))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| Error::Allocation(format!("out of memory allocating {} bytes", size)))?;

        Ok(self.track(ptr, size, Backing::Heap(layout)))
    }

    fn track(&self, ptr: NonNull<u8>, len: usize, backing: Backing) -> ScratchBuffer {
        self.stats.buffers.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes.fetch_add(len, Ordering::Relaxed);
        ScratchBuffer {
            ptr,
            len,
            backing,
            stats: self.stats.clone(),
        }
    }

    pub fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            buffers: self.stats.buffers.load(Ordering::Relaxed),
            huge_page_buffers: self.stats.huge.load(Ordering::Relaxed),
            bytes: self.stats.bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(target_os = "linux")]
fn map_huge(len: usize) -> Option<NonNull<u8>> {
    use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};
    use std::num::NonZeroUsize;

    let length = NonZeroUsize::new(len)?;
    // SAFETY: a fresh private anonymous mapping aliases nothing.
    let ptr = unsafe {
        mmap_anonymous(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_HUGETLB | MapFlags::MAP_POPULATE,
        )
    }
    .ok()?;
    Some(ptr.cast())
}

#[cfg(target_os = "linux")]
unsafe fn unmap_huge(ptr: NonNull<u8>, len: usize) {
    if let Err(e) = nix::sys::mman::munmap(ptr.cast(), len) {
        warn!(error = %e, "munmap of scratch buffer failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn map_huge(_len: usize) -> Option<NonNull<u8>> {
    None
}

#[cfg(not(target_os = "linux"))]
unsafe fn unmap_huge(_ptr: NonNull<u8>, _len: usize) {}
