//! Paired host/accelerator memory.
//!
//! A `MappedRegion` is one physical allocation visible through two address
//! spaces: the host (CPU) and the accelerator (GPU/DLA). Writing through the
//! host pointer makes the bytes visible at the accelerator address without an
//! explicit copy.
//!
//! `PairedAllocator` is the seam for platform allocators (for example a CUDA
//! mapped-memory allocator). `HostAllocator` covers unified-memory platforms
//! where both views share one address.

use anyhow::{anyhow, bail, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Alignment used for host regions; wide enough for vectorised loads.
const REGION_ALIGN: usize = 64;

/// Address of a region as seen by the accelerator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccelPtr(pub usize);

impl fmt::Display for AccelPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One physical memory region addressable from host and accelerator.
///
/// # Safety
///
/// Implementations must keep `host_ptr()..host_ptr()+len()` valid, initialised
/// and writable for as long as the region is alive, and must not write to it
/// themselves. Captured frames read those bytes without further checks.
pub unsafe trait MappedRegion: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host-visible start of the region.
    fn host_ptr(&self) -> NonNull<u8>;

    /// Accelerator-visible start of the region.
    fn accel_ptr(&self) -> AccelPtr;
}

/// Allocates paired host/accelerator regions.
pub trait PairedAllocator {
    /// Allocator identifier for logs.
    fn name(&self) -> &'static str;

    /// Allocate one region of `size` bytes.
    fn allocate_paired(&self, size: usize) -> Result<Arc<dyn MappedRegion>>;
}

/// Unified-memory allocator: host and accelerator addresses coincide.
///
/// An optional byte budget makes allocation failure reproducible.
#[derive(Debug, Default)]
pub struct HostAllocator {
    limit: Option<usize>,
    allocated: Arc<AtomicUsize>,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse allocations once `limit` live bytes are outstanding.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            allocated: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bytes currently held by live regions from this allocator.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    fn reserve(&self, size: usize) -> Result<()> {
        let Some(limit) = self.limit else {
            self.allocated.fetch_add(size, Ordering::SeqCst);
            return Ok(());
        };
        self.allocated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_add(size).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|current| {
                anyhow!(
                    "host allocator budget exhausted ({} of {} bytes in use, {} requested)",
                    current,
                    limit,
                    size
                )
            })
    }
}

impl PairedAllocator for HostAllocator {
    fn name(&self) -> &'static str {
        "host"
    }

    fn allocate_paired(&self, size: usize) -> Result<Arc<dyn MappedRegion>> {
        if size == 0 {
            bail!("cannot allocate a zero-sized paired region");
        }
        let layout = Layout::from_size_align(size, REGION_ALIGN)
            .map_err(|e| anyhow!("invalid region layout for {} bytes: {}", size, e))?;
        self.reserve(size)?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            self.allocated.fetch_sub(size, Ordering::SeqCst);
            bail!("host allocator could not satisfy {} bytes", size);
        };

        Ok(Arc::new(HostRegion {
            ptr,
            layout,
            allocated: self.allocated.clone(),
        }))
    }
}

struct HostRegion {
    ptr: NonNull<u8>,
    layout: Layout,
    allocated: Arc<AtomicUsize>,
}

// SAFETY: the region owns its allocation; concurrent access is coordinated by
// the ring that holds it.
unsafe impl Send for HostRegion {}
unsafe impl Sync for HostRegion {}

// SAFETY: the allocation is zeroed, sized by `layout` and freed only on drop.
unsafe impl MappedRegion for HostRegion {
    fn len(&self) -> usize {
        self.layout.size()
    }

    fn host_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn accel_ptr(&self) -> AccelPtr {
        AccelPtr(self.ptr.as_ptr() as usize)
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout in `allocate_paired`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        self.allocated.fetch_sub(self.layout.size(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_region_views_share_address() -> Result<()> {
        let allocator = HostAllocator::new();
        let region = allocator.allocate_paired(4096)?;

        assert_eq!(region.len(), 4096);
        assert_eq!(region.accel_ptr().0, region.host_ptr().as_ptr() as usize);
        assert_eq!(region.host_ptr().as_ptr() as usize % REGION_ALIGN, 0);
        Ok(())
    }

    #[test]
    fn zero_sized_region_is_rejected() {
        assert!(HostAllocator::new().allocate_paired(0).is_err());
    }

    #[test]
    fn budget_refuses_excess_and_recovers_on_drop() -> Result<()> {
        let allocator = HostAllocator::with_limit(1024);
        let first = allocator.allocate_paired(768)?;
        assert!(allocator.allocate_paired(512).is_err());
        assert_eq!(allocator.allocated_bytes(), 768);

        drop(first);
        assert_eq!(allocator.allocated_bytes(), 0);
        allocator.allocate_paired(512)?;
        Ok(())
    }
}
