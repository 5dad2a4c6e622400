//! Kernel heap facade
//!
//! One global lock over the hole-coalescing [`Pool`] plus a row of
//! per-size-class [`SlabCache`]s in front of it. Rust allocation traffic
//! (`GlobalAlloc` on bare metal) is routed through the size classes with
//! the pool as fallback; the C-flavoured `kmem_alloc`/`kmem_free` entry
//! points go straight to the pool, and `kmem_map`/`kmem_unmap` window
//! physical ranges into kernel space through the page mapper, rolling back
//! partially completed mappings on failure.
//!
//! Heap allocation is forbidden from interrupt handlers: the facade lock is
//! a sleeping mutex in the model and is never taken from ISR context.

use core::ptr::NonNull;

use bitflags::bitflags;
use spin::Mutex;

use super::{
    mapper::PageMapper,
    pool::{Pool, PoolStats},
    slab::{SlabCache, SlabFlags},
    PageFlags, VirtualAddress, PAGE_SIZE,
};
use crate::error::{KernelResult, MmError};

/// Size classes served by slab caches (in bytes); larger requests fall
/// through to the pool.
const SIZE_CLASSES: [usize; 9] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048];

const CLASS_NAMES: [&str; 9] = [
    "kmalloc-8",
    "kmalloc-16",
    "kmalloc-32",
    "kmalloc-64",
    "kmalloc-128",
    "kmalloc-256",
    "kmalloc-512",
    "kmalloc-1024",
    "kmalloc-2048",
];

bitflags! {
    /// Allocation behaviour flags for `kmem_alloc`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Return a page-aligned address
        const ALIGN = 1 << 0;
    }
}

struct HeapInner<'a> {
    pool: Pool<'a>,
    caches: [SlabCache; SIZE_CLASSES.len()],
    mapper: &'a dyn PageMapper,
}

/// Combined census of the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Census of the backing pool
    pub pool: PoolStats,
    /// Free objects parked in the size-class caches
    pub cached_objects: usize,
}

/// The kernel heap: a locked pool with slab size classes in front.
pub struct KernelHeap<'a> {
    inner: Mutex<Option<HeapInner<'a>>>,
}

impl<'a> KernelHeap<'a> {
    /// Create an uninitialized heap; allocation returns `None` until
    /// [`KernelHeap::init`] runs.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Install the backing pool and mapper. Called once at boot, after the
    /// MMU has mapped the pool's initial range.
    pub fn init(&self, pool: Pool<'a>, mapper: &'a dyn PageMapper) {
        let mut inner = self.inner.lock();
        assert!(inner.is_none(), "kernel heap initialized twice");
        let mut i = 0;
        let caches = SIZE_CLASSES.map(|size| {
            let cache = SlabCache::new(CLASS_NAMES[i], size, None, None, SlabFlags::empty());
            i += 1;
            cache
        });
        *inner = Some(HeapInner {
            pool,
            caches,
            mapper,
        });
        log::info!("kernel heap online");
    }

    fn class_for(size: usize, align: usize) -> Option<usize> {
        if align > 8 {
            return None;
        }
        SIZE_CLASSES.iter().position(|&c| c >= size)
    }

    /// Allocate `size` bytes with `align` (a power of two up to a page).
    pub fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if align > PAGE_SIZE {
            return None;
        }
        let mut guard = self.inner.lock();
        let inner = guard.as_mut()?;
        match Self::class_for(size, align) {
            Some(class) => {
                let HeapInner { pool, caches, .. } = inner;
                caches[class].alloc(pool)
            }
            None => inner.pool.alloc(size, align > 8),
        }
    }

    /// Free an allocation made with the same `size`/`align` pair.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`KernelHeap::allocate`] on this heap with the
    /// same size and alignment, and must not have been freed since.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().expect("kernel heap not initialized");
        match Self::class_for(size, align) {
            Some(class) => {
                let HeapInner { pool, caches, .. } = inner;
                // SAFETY: routed by the same (size, align) key used at
                // allocation time, so `ptr` belongs to this cache.
                unsafe { caches[class].free(pool, ptr) }
            }
            // SAFETY: non-class allocations came straight from the pool.
            None => unsafe { inner.pool.free(ptr) },
        }
    }

    /// Pool allocation without the slab front end (`kmem_alloc`).
    pub fn kmem_alloc(&self, size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut()?;
        inner.pool.alloc(size, flags.contains(AllocFlags::ALIGN))
    }

    /// Free a `kmem_alloc` allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`KernelHeap::kmem_alloc`] on this heap and not
    /// have been freed since.
    pub unsafe fn kmem_free(&self, ptr: NonNull<u8>) {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().expect("kernel heap not initialized");
        // SAFETY: forwarded under the caller's contract.
        unsafe { inner.pool.free(ptr) }
    }

    /// Map the physical range `[phys, phys + size)` at `virt`.
    ///
    /// Page-for-page; a failure rolls back the pages mapped so far and
    /// reports the error, leaving no partial window behind.
    pub fn kmem_map(
        &self,
        virt: VirtualAddress,
        phys: u64,
        size: usize,
        flags: PageFlags,
    ) -> KernelResult<()> {
        assert_eq!(virt.as_usize() % PAGE_SIZE, 0);
        assert_eq!(size % PAGE_SIZE, 0);
        let guard = self.inner.lock();
        let inner = guard.as_ref().ok_or(MmError::OutOfMemory)?;

        let mut offset = 0;
        while offset < size {
            let page = VirtualAddress::new(virt.as_usize() + offset);
            if let Err(e) = inner.mapper.map_frame(page, phys + offset as u64, flags) {
                while offset > 0 {
                    offset -= PAGE_SIZE;
                    let _ = inner
                        .mapper
                        .unmap_page(VirtualAddress::new(virt.as_usize() + offset));
                }
                log::debug!("kmem_map rollback at {:#x}: {}", page.as_usize(), e);
                return Err(e.into());
            }
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    /// Tear down a window created by [`KernelHeap::kmem_map`].
    pub fn kmem_unmap(&self, virt: VirtualAddress, size: usize) -> KernelResult<()> {
        assert_eq!(virt.as_usize() % PAGE_SIZE, 0);
        assert_eq!(size % PAGE_SIZE, 0);
        let guard = self.inner.lock();
        let inner = guard.as_ref().ok_or(MmError::OutOfMemory)?;
        let mut offset = 0;
        while offset < size {
            inner
                .mapper
                .unmap_page(VirtualAddress::new(virt.as_usize() + offset))?;
            offset += PAGE_SIZE;
        }
        Ok(())
    }

    /// Census across the pool and the size-class caches.
    pub fn stats(&self) -> Option<HeapStats> {
        let guard = self.inner.lock();
        let inner = guard.as_ref()?;
        Some(HeapStats {
            pool: inner.pool.stats(),
            cached_objects: inner.caches.iter().map(|c| c.free_objects()).sum(),
        })
    }
}

impl Default for KernelHeap<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel-wide heap instance (bare-metal global allocator).
pub static KERNEL_HEAP: KernelHeap<'static> = KernelHeap::new();

#[cfg(target_os = "none")]
mod global {
    use core::alloc::{GlobalAlloc, Layout};

    use super::KERNEL_HEAP;

    struct GlobalHeap;

    // SAFETY: allocate/deallocate are routed by the same (size, align) key,
    // the facade lock serializes all mutation, and a failed allocation
    // reports null as the trait requires.
    unsafe impl GlobalAlloc for GlobalHeap {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            KERNEL_HEAP
                .allocate(layout.size(), layout.align())
                .map_or(core::ptr::null_mut(), |p| p.as_ptr())
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            if let Some(ptr) = core::ptr::NonNull::new(ptr) {
                // SAFETY: `ptr` came from `alloc` with this same layout.
                unsafe { KERNEL_HEAP.deallocate(ptr, layout.size(), layout.align()) }
            }
        }
    }

    #[global_allocator]
    static GLOBAL: GlobalHeap = GlobalHeap;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::mapper::MockMapper;

    fn with_heap(f: impl FnOnce(&KernelHeap<'_>, &MockMapper)) {
        let mapper = MockMapper::new(0x100000);
        mapper.premap(0x10000);
        let base = mapper.base();
        // SAFETY: arena premaps the initial range and reserves the rest.
        let pool =
            unsafe { Pool::create(base, base + 0x10000, base + 0x100000, true, false, &mapper) };
        let heap = KernelHeap::new();
        heap.init(pool, &mapper);
        f(&heap, &mapper);
    }

    #[test]
    fn test_small_allocations_use_size_classes() {
        with_heap(|heap, _| {
            let p = heap.allocate(24, 8).unwrap();
            let stats = heap.stats().unwrap();
            assert!(stats.cached_objects > 0, "slab class should be populated");
            // SAFETY: allocated above with the same key.
            unsafe { heap.deallocate(p, 24, 8) };
        });
    }

    #[test]
    fn test_large_allocation_falls_through_to_pool() {
        with_heap(|heap, _| {
            let before = heap.stats().unwrap();
            let p = heap.allocate(8192, 8).unwrap();
            let mid = heap.stats().unwrap();
            assert_eq!(mid.pool.live_blocks, before.pool.live_blocks + 1);
            // SAFETY: allocated above with the same key.
            unsafe { heap.deallocate(p, 8192, 8) };
            assert_eq!(heap.stats().unwrap().pool, before.pool);
        });
    }

    #[test]
    fn test_page_aligned_via_kmem_alloc() {
        with_heap(|heap, _| {
            let before = heap.stats().unwrap();
            let p = heap.kmem_alloc(200, AllocFlags::ALIGN).unwrap();
            assert_eq!(p.as_ptr() as usize % PAGE_SIZE, 0);
            // SAFETY: allocated above via kmem_alloc.
            unsafe { heap.kmem_free(p) };
            assert_eq!(heap.stats().unwrap(), before);
        });
    }

    #[test]
    fn test_kmem_map_rolls_back_on_failure() {
        with_heap(|heap, mapper| {
            let pages_before = mapper.mapped_pages();
            // A window straddling the arena limit fails partway through.
            let virt = VirtualAddress::new(mapper.base() + 0xFE000);
            let r = heap.kmem_map(virt, 0, 4 * PAGE_SIZE, PageFlags::WRITE);
            assert!(r.is_err());
            assert_eq!(mapper.mapped_pages(), pages_before, "rollback must unmap");
        });
    }

    #[test]
    fn test_kmem_map_unmap_round_trip() {
        with_heap(|heap, mapper| {
            let pages_before = mapper.mapped_pages();
            let virt = VirtualAddress::new(mapper.base() + 0x80000);
            heap.kmem_map(virt, 0x1000, 2 * PAGE_SIZE, PageFlags::WRITE)
                .unwrap();
            assert_eq!(mapper.mapped_pages(), pages_before + 2);
            heap.kmem_unmap(virt, 2 * PAGE_SIZE).unwrap();
            assert_eq!(mapper.mapped_pages(), pages_before);
        });
    }

    #[test]
    fn test_allocate_before_init_returns_none() {
        let heap = KernelHeap::new();
        assert!(heap.allocate(64, 8).is_none());
    }
}
