//! Page-mapper collaborator interface
//!
//! The heap pool's growth and contraction paths are the only consumers: the
//! platform's MMU layer implements [`PageMapper`] and the pool asks it to
//! back or release one page at a time. Hosted tests use [`MockMapper`],
//! which hands out pages from a preallocated arena and keeps the
//! bookkeeping the property tests assert on.

use bitflags::bitflags;

use super::{VirtualAddress, PAGE_SIZE};
use crate::error::MmError;

bitflags! {
    /// Mapping attributes forwarded to the platform MMU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Page is writable
        const WRITE = 1 << 0;
        /// Page is executable
        const EXEC = 1 << 1;
        /// Page is reachable from user mode
        const USER = 1 << 2;
    }
}

/// Platform page-mapping service consumed by the pool.
pub trait PageMapper: Send + Sync {
    /// Back `virt` with a freshly allocated frame.
    ///
    /// Equivalent of the original `mmu_get_page(ctx, virt, alloc=true)`
    /// followed by `page_alloc`: after a successful return the page is
    /// readable and writable according to `flags`.
    fn map_page(&self, virt: VirtualAddress, flags: PageFlags) -> Result<(), MmError>;

    /// Map `virt` to the specific frame `phys`.
    ///
    /// Used by the kernel-heap facade to window physical ranges (device
    /// memory, boot modules) into kernel space.
    fn map_frame(&self, virt: VirtualAddress, phys: u64, flags: PageFlags)
        -> Result<(), MmError>;

    /// Release the frame backing `virt` and remove the mapping.
    fn unmap_page(&self, virt: VirtualAddress) -> Result<(), MmError>;
}

/// Arena-backed mapper for hosted tests.
///
/// Reserves `max` bytes up front so pool addresses stay stable, then tracks
/// which pages the pool believes are mapped. The arena base is page-aligned
/// so page-alignment assertions hold on real host addresses.
#[cfg(not(target_os = "none"))]
pub struct MockMapper {
    arena: alloc::vec::Vec<u8>,
    base: usize,
    limit: usize,
    mapped: spin::Mutex<alloc::collections::BTreeSet<usize>>,
}

#[cfg(not(target_os = "none"))]
impl MockMapper {
    /// Reserve an arena able to back `max` bytes of pool address space.
    pub fn new(max: usize) -> Self {
        let arena = alloc::vec![0u8; max + PAGE_SIZE];
        let base = super::align_up(arena.as_ptr() as usize, PAGE_SIZE);
        Self {
            arena,
            base,
            limit: max,
            mapped: spin::Mutex::new(alloc::collections::BTreeSet::new()),
        }
    }

    /// Page-aligned base address of the arena.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Number of pages currently mapped through this mapper.
    pub fn mapped_pages(&self) -> usize {
        self.mapped.lock().len()
    }

    /// Mark the initial pool range `[base, base + len)` as premapped, the
    /// way the platform maps the kernel heap before pool creation.
    pub fn premap(&self, len: usize) {
        let mut mapped = self.mapped.lock();
        let mut addr = self.base;
        while addr < self.base + len {
            mapped.insert(addr);
            addr += PAGE_SIZE;
        }
    }

    fn in_range(&self, addr: usize) -> bool {
        addr >= self.base && addr + PAGE_SIZE <= self.base + self.limit + PAGE_SIZE
    }
}

#[cfg(not(target_os = "none"))]
impl PageMapper for MockMapper {
    fn map_page(&self, virt: VirtualAddress, _flags: PageFlags) -> Result<(), MmError> {
        let addr = virt.as_usize();
        if addr % PAGE_SIZE != 0 || !self.in_range(addr) {
            return Err(MmError::MapFailed);
        }
        self.mapped.lock().insert(addr);
        // Arena memory backs the whole range already; zero it like a fresh
        // frame so stale block headers never leak into a regrown region.
        let offset = addr - self.arena.as_ptr() as usize;
        // SAFETY: `in_range` proved [addr, addr + PAGE_SIZE) lies inside the
        // arena allocation, and the mapper is the only writer at map time.
        unsafe {
            core::ptr::write_bytes(self.arena.as_ptr().add(offset) as *mut u8, 0, PAGE_SIZE);
        }
        Ok(())
    }

    fn map_frame(
        &self,
        virt: VirtualAddress,
        _phys: u64,
        flags: PageFlags,
    ) -> Result<(), MmError> {
        let addr = virt.as_usize();
        if addr % PAGE_SIZE != 0 || !self.in_range(addr) {
            return Err(MmError::MapFailed);
        }
        if !self.mapped.lock().insert(addr) {
            return Err(MmError::MapFailed);
        }
        let _ = flags;
        Ok(())
    }

    fn unmap_page(&self, virt: VirtualAddress) -> Result<(), MmError> {
        if self.mapped.lock().remove(&virt.as_usize()) {
            Ok(())
        } else {
            Err(MmError::NotMapped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_mapper_tracks_pages() {
        let mapper = MockMapper::new(4 * PAGE_SIZE);
        let base = mapper.base();
        assert_eq!(base % PAGE_SIZE, 0);

        mapper
            .map_page(VirtualAddress::new(base), PageFlags::WRITE)
            .unwrap();
        assert_eq!(mapper.mapped_pages(), 1);

        mapper.unmap_page(VirtualAddress::new(base)).unwrap();
        assert_eq!(mapper.mapped_pages(), 0);
        assert_eq!(
            mapper.unmap_page(VirtualAddress::new(base)),
            Err(MmError::NotMapped)
        );
    }

    #[test]
    fn test_mock_mapper_rejects_unaligned() {
        let mapper = MockMapper::new(4 * PAGE_SIZE);
        let r = mapper.map_page(VirtualAddress::new(mapper.base() + 7), PageFlags::WRITE);
        assert_eq!(r, Err(MmError::MapFailed));
    }
}
