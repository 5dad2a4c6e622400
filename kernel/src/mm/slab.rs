//! Fixed-size object caches over the heap pool
//!
//! A [`SlabCache`] carves page-aligned pool allocations ("slabs") into
//! objects of one size, threaded on an embedded free list. Object
//! constructors run once when a slab is created, destructors when a slab is
//! destroyed; a slab whose objects are all free is returned to the pool.
//! The caches keep no heap-allocated bookkeeping of their own (the slab
//! descriptor lives at the head of each slab), so the kernel-heap facade
//! can route `GlobalAlloc` traffic through them without re-entering the
//! allocator.

use core::ptr::NonNull;

use bitflags::bitflags;

use super::{align_up, pool::Pool, PAGE_SIZE};

/// Magic stamped into every slab descriptor.
const SLAB_MAGIC: u32 = 0x51AB_0C0D;

/// Target number of objects carved from one slab.
const OBJECTS_PER_SLAB: usize = 8;

bitflags! {
    /// Cache behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlabFlags: u32 {
        /// Zero each object on allocation
        const ZERO = 1 << 0;
    }
}

/// Object constructor/destructor hook.
pub type ObjectHook = fn(NonNull<u8>);

/// Descriptor at the head of every slab.
#[repr(C)]
struct SlabHeader {
    magic: u32,
    in_use: u32,
    free_head: *mut FreeObject,
    next: *mut SlabHeader,
}

/// Free object in a slab's embedded free list.
#[repr(C)]
struct FreeObject {
    next: *mut FreeObject,
}

const SLAB_HEADER_SIZE: usize = core::mem::size_of::<SlabHeader>();

/// A cache of fixed-size objects backed by the heap pool.
pub struct SlabCache {
    name: &'static str,
    object_size: usize,
    slab_bytes: usize,
    objects_per_slab: usize,
    flags: SlabFlags,
    ctor: Option<ObjectHook>,
    dtor: Option<ObjectHook>,
    slabs: *mut SlabHeader,
    free_objects: usize,
    total_objects: usize,
}

// SAFETY: the cache exclusively owns its slab pages (obtained from the pool
// and never shared); the raw list pointers are only reachable through
// `&mut self`.
unsafe impl Send for SlabCache {}

impl SlabCache {
    /// Create a cache for objects of `object_size` bytes.
    ///
    /// The size is rounded up so every object can hold a free-list link and
    /// keeps 8-byte alignment.
    pub const fn new(
        name: &'static str,
        object_size: usize,
        ctor: Option<ObjectHook>,
        dtor: Option<ObjectHook>,
        flags: SlabFlags,
    ) -> Self {
        let object_size = align_up(
            if object_size < 8 { 8 } else { object_size },
            8,
        );
        let slab_bytes = align_up(
            SLAB_HEADER_SIZE + object_size * OBJECTS_PER_SLAB,
            PAGE_SIZE,
        );
        Self {
            name,
            object_size,
            slab_bytes,
            objects_per_slab: (slab_bytes - SLAB_HEADER_SIZE) / object_size,
            flags,
            ctor,
            dtor,
            slabs: core::ptr::null_mut(),
            free_objects: 0,
            total_objects: 0,
        }
    }

    /// Cache name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Rounded object size served by this cache.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Number of free objects across all slabs.
    pub fn free_objects(&self) -> usize {
        self.free_objects
    }

    /// Number of slabs currently held.
    pub fn slab_count(&self) -> usize {
        let mut n = 0;
        let mut slab = self.slabs;
        while !slab.is_null() {
            n += 1;
            // SAFETY: `slab` is a live descriptor in this cache's list.
            slab = unsafe { (*slab).next };
        }
        n
    }

    /// Carve a new slab out of the pool and thread its free list.
    fn grow(&mut self, pool: &mut Pool<'_>) -> Option<NonNull<SlabHeader>> {
        let base = pool.alloc(self.slab_bytes, true)?;
        let header = base.as_ptr() as *mut SlabHeader;
        let objects = base.as_ptr() as usize + SLAB_HEADER_SIZE;

        // SAFETY: the pool handed us `slab_bytes` of exclusively owned,
        // page-aligned memory; the descriptor and every object below fit
        // inside it.
        unsafe {
            (*header).magic = SLAB_MAGIC;
            (*header).in_use = 0;
            (*header).free_head = core::ptr::null_mut();
            (*header).next = self.slabs;

            for i in (0..self.objects_per_slab).rev() {
                let obj = (objects + i * self.object_size) as *mut FreeObject;
                if let Some(ctor) = self.ctor {
                    ctor(NonNull::new_unchecked(obj as *mut u8));
                }
                (*obj).next = (*header).free_head;
                (*header).free_head = obj;
            }
        }

        self.slabs = header;
        self.free_objects += self.objects_per_slab;
        self.total_objects += self.objects_per_slab;
        log::trace!("slab cache {}: grew by {} objects", self.name, self.objects_per_slab);
        NonNull::new(header)
    }

    /// Allocate one object, growing the cache from `pool` if every slab is
    /// full. Returns `None` only when the pool itself is exhausted.
    pub fn alloc(&mut self, pool: &mut Pool<'_>) -> Option<NonNull<u8>> {
        let mut slab = self.slabs;
        while !slab.is_null() {
            // SAFETY: `slab` is a live descriptor in this cache's list.
            unsafe {
                if !(*slab).free_head.is_null() {
                    break;
                }
                slab = (*slab).next;
            }
        }
        if slab.is_null() {
            slab = self.grow(pool)?.as_ptr();
        }

        // SAFETY: `slab` has a non-empty free list; popping its head yields
        // an object inside the slab's exclusively owned pages.
        let obj = unsafe {
            let obj = (*slab).free_head;
            (*slab).free_head = (*obj).next;
            (*slab).in_use += 1;
            if self.flags.contains(SlabFlags::ZERO) {
                core::ptr::write_bytes(obj as *mut u8, 0, self.object_size);
            }
            NonNull::new_unchecked(obj as *mut u8)
        };
        self.free_objects -= 1;
        Some(obj)
    }

    /// Return `obj` to its slab; a slab left wholly free goes back to the
    /// pool (running destructors for its objects).
    ///
    /// # Safety
    ///
    /// `obj` must have been returned by [`SlabCache::alloc`] on this cache
    /// and not freed since.
    pub unsafe fn free(&mut self, pool: &mut Pool<'_>, obj: NonNull<u8>) {
        let addr = obj.as_ptr() as usize;
        let mut prev: *mut SlabHeader = core::ptr::null_mut();
        let mut slab = self.slabs;
        while !slab.is_null() {
            let base = slab as usize;
            if addr > base && addr < base + self.slab_bytes {
                break;
            }
            prev = slab;
            // SAFETY: `slab` is a live descriptor in this cache's list.
            slab = unsafe { (*slab).next };
        }
        assert!(!slab.is_null(), "slab cache {}: foreign object freed", self.name);

        // SAFETY: `obj` lies inside `slab`'s pages per the range check and
        // the caller's contract; pushing it back onto the free list only
        // touches memory this cache owns.
        unsafe {
            let free = obj.as_ptr() as *mut FreeObject;
            (*free).next = (*slab).free_head;
            (*slab).free_head = free;
            (*slab).in_use -= 1;
            self.free_objects += 1;

            if (*slab).in_use == 0 {
                if prev.is_null() {
                    self.slabs = (*slab).next;
                } else {
                    (*prev).next = (*slab).next;
                }
                self.release_slab(pool, slab);
            }
        }
    }

    /// Hand a wholly free slab back to the pool.
    ///
    /// # Safety
    ///
    /// `slab` must be unlinked from the list and have `in_use == 0`.
    unsafe fn release_slab(&mut self, pool: &mut Pool<'_>, slab: *mut SlabHeader) {
        // SAFETY: caller guarantees the slab is live, unlinked and free.
        unsafe {
            debug_assert_eq!((*slab).magic, SLAB_MAGIC);
            debug_assert_eq!((*slab).in_use, 0);
            if let Some(dtor) = self.dtor {
                let objects = slab as usize + SLAB_HEADER_SIZE;
                for i in 0..self.objects_per_slab {
                    dtor(NonNull::new_unchecked(
                        (objects + i * self.object_size) as *mut u8,
                    ));
                }
            }
            self.free_objects -= self.objects_per_slab;
            self.total_objects -= self.objects_per_slab;
            pool.free(NonNull::new_unchecked(slab as *mut u8));
        }
        log::trace!("slab cache {}: released a slab", self.name);
    }

    /// Destroy the cache, returning every slab to the pool.
    ///
    /// Panics if any object is still allocated.
    pub fn destroy(&mut self, pool: &mut Pool<'_>) {
        assert_eq!(
            self.free_objects, self.total_objects,
            "slab cache {}: destroyed with live objects",
            self.name
        );
        while !self.slabs.is_null() {
            let slab = self.slabs;
            // SAFETY: `slab` heads the list, is live and wholly free per the
            // assertion above.
            unsafe {
                self.slabs = (*slab).next;
                self.release_slab(pool, slab);
            }
        }
    }
}
