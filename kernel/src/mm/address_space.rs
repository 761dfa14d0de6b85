//! Process address spaces.
//!
//! An [`AddressSpace`] wraps a [`PageMap`] with an ordered list of mapped
//! regions. Each region binds a range of user addresses to exactly one
//! [`VmObject`] and carries its own reader/writer lock; the fault handler
//! receives a region with the write side already held and releases it on
//! every exit path.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::ke::{RwSpinLock, SpinLock};
use crate::mm::page_map::{
    check_region, create_page_map, destroy_page_map, virtual_to_physical_in, PageMap,
};
use crate::mm::pte::{pd_index, pdpt_index, pt_index, ENTRIES_PER_TABLE, PAGE_SIZE_4K};
use crate::mm::pte::pte_flags::PRESENT;
use crate::mm::vm_object::VmObject;

/// Lowest address handed out when the caller does not ask for a base
const USER_MAP_BASE: u64 = 0x10_0000;

/// A contiguous user range bound to one backing object
pub struct MappedRegion {
    base: u64,
    size: u64,
    /// Held for writing while the fault handler mutates the region
    pub lock: RwSpinLock,
    vm_object: SpinLock<Option<Arc<VmObject>>>,
}

impl MappedRegion {
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    /// The backing object, if one is still attached.
    pub fn vm_object(&self) -> Option<Arc<VmObject>> {
        self.vm_object.lock().clone()
    }

    /// Swap in a new backing object (copy-on-write divergence).
    pub fn set_vm_object(&self, vm_object: Arc<VmObject>) {
        *self.vm_object.lock() = Some(vm_object);
    }
}

/// Find the index of the region containing `addr`, over `(base, size)` pairs
/// sorted by base.
fn region_covering(regions: &[(u64, u64)], addr: u64) -> Option<usize> {
    regions
        .iter()
        .position(|&(base, size)| addr >= base && addr < base + size)
}

/// First gap of `size` bytes at or above `from`, over sorted `(base, size)`
/// pairs.
fn find_free_range(regions: &[(u64, u64)], from: u64, size: u64) -> u64 {
    let mut candidate = from;
    for &(base, region_size) in regions {
        if base + region_size <= candidate {
            continue;
        }
        if base >= candidate + size {
            break;
        }
        candidate = base + region_size;
    }
    candidate
}

/// A process's virtual address space: page tables plus region bookkeeping
pub struct AddressSpace {
    page_map: PageMap,
    regions: SpinLock<Vec<Arc<MappedRegion>>>,
}

impl AddressSpace {
    /// Create an empty address space with a fresh page map.
    pub fn new() -> Self {
        Self {
            page_map: unsafe { create_page_map() },
            regions: SpinLock::new(Vec::new()),
        }
    }

    pub fn page_map(&self) -> &PageMap {
        &self.page_map
    }

    /// Physical address of the root table, for loading into CR3.
    pub fn pml4_phys(&self) -> u64 {
        self.page_map.pml4_phys
    }

    /// Bind `vm_object` to a user range and install its already-allocated
    /// pages. `base` 0 picks the first free range; a nonzero `base` must be
    /// page-aligned and free. Returns the region base.
    pub fn map_vm_object(&self, vm_object: Arc<VmObject>, base: u64) -> u64 {
        let size = vm_object.size();
        let mut regions = self.regions.lock();

        let spans: Vec<(u64, u64)> = regions.iter().map(|r| (r.base, r.size)).collect();
        let base = if base == 0 {
            find_free_range(&spans, USER_MAP_BASE, size)
        } else {
            assert_eq!(base % PAGE_SIZE_4K, 0);
            assert!(
                region_covering(&spans, base).is_none()
                    && region_covering(&spans, base + size - 1).is_none(),
                "mapping collides with an existing region at {:#x}",
                base
            );
            base
        };

        let region = Arc::new(MappedRegion {
            base,
            size,
            lock: RwSpinLock::new(),
            vm_object: SpinLock::new(Some(vm_object.clone())),
        });

        let insert_at = regions.partition_point(|r| r.base < base);
        regions.insert(insert_at, region);
        drop(regions);

        vm_object.map_allocated_blocks(base, &self.page_map);
        base
    }

    /// Find the region containing `addr` and return it with its write lock
    /// held. The caller owns the release on every path.
    pub fn address_to_region_write_lock(&self, addr: u64) -> Option<Arc<MappedRegion>> {
        let region = {
            let regions = self.regions.lock();
            let spans: Vec<(u64, u64)> = regions.iter().map(|r| (r.base, r.size)).collect();
            region_covering(&spans, addr).map(|index| regions[index].clone())
        };

        // Acquire outside the list lock; the Arc keeps the region alive
        region.map(|region| {
            region.lock.acquire_write();
            region
        })
    }

    /// Whether `addr..addr + len` lies entirely inside one mapped region.
    pub fn range_in_region(&self, addr: u64, len: u64) -> bool {
        let regions = self.regions.lock();
        regions
            .iter()
            .any(|region| addr >= region.base && addr + len <= region.end())
    }

    /// Coarse PDPT-level check of a user range (see [`check_region`]).
    pub fn check_region(&self, addr: u64, len: u64) -> bool {
        check_region(addr, len, &self.page_map)
    }

    /// Translate through this address space.
    pub fn virtual_to_physical(&self, addr: u64) -> u64 {
        virtual_to_physical_in(addr, &self.page_map)
    }

    /// Remove the region based at `base`, dropping its backing reference and
    /// its page-table entries.
    pub fn unmap_region(&self, base: u64) -> bool {
        let region = {
            let mut regions = self.regions.lock();
            match regions.iter().position(|r| r.base == base) {
                Some(index) => regions.remove(index),
                None => return false,
            }
        };

        region.lock.acquire_write();
        if let Some(vm_object) = region.vm_object.lock().take() {
            vm_object.release_ref();
        }
        unsafe {
            unmap_pages(region.base, region.size / PAGE_SIZE_4K, &self.page_map);
        }
        region.lock.release_write();
        true
    }

    /// Clone this address space for a fork: regions are shared by reference,
    /// and private writable backings are marked copy-on-write in both parent
    /// and child so the first write diverges.
    pub fn fork(&self) -> AddressSpace {
        let child = AddressSpace::new();
        let regions = self.regions.lock();

        let mut child_regions = child.regions.lock();
        for region in regions.iter() {
            region.lock.acquire_write();

            if let Some(vm_object) = region.vm_object() {
                vm_object.add_ref();
                if !vm_object.is_shared() {
                    vm_object.set_copy_on_write(true);
                    // Downgrade the parent's existing mappings to read-only
                    vm_object.map_allocated_blocks(region.base, &self.page_map);
                }
                vm_object.map_allocated_blocks(region.base, &child.page_map);

                child_regions.push(Arc::new(MappedRegion {
                    base: region.base,
                    size: region.size,
                    lock: RwSpinLock::new(),
                    vm_object: SpinLock::new(Some(vm_object)),
                }));
            }

            region.lock.release_write();
        }
        drop(child_regions);

        child
    }

    /// Log every mapped region; the fault handler's fatal dump.
    pub fn dump_regions(&self) {
        let regions = self.regions.lock();
        for region in regions.iter() {
            let (refs, cow) = match region.vm_object() {
                Some(vm_object) => (vm_object.ref_count(), vm_object.is_copy_on_write()),
                None => (0, false),
            };
            log::info!(
                "  region {:#x}..{:#x} refs={} cow={}",
                region.base,
                region.end(),
                refs,
                cow
            );
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let regions = core::mem::take(&mut *self.regions.lock());
        for region in regions {
            if let Some(vm_object) = region.vm_object.lock().take() {
                vm_object.release_ref();
            }
        }
        unsafe {
            destroy_page_map(&mut self.page_map);
        }
    }
}

/// Clear the PT entries of a user range. Entries whose page table was never
/// created are already unmapped.
unsafe fn unmap_pages(base: u64, pages: u64, page_map: &PageMap) {
    let mut virt = base;
    for _ in 0..pages {
        let pdpt_slot = pdpt_index(virt);
        let pd_slot = pd_index(virt);
        let dir_entry = *page_map
            .page_dirs
            .add(pdpt_slot * ENTRIES_PER_TABLE + pd_slot);
        if dir_entry & PRESENT != 0 {
            let table = (*(*page_map.page_tables)[pdpt_slot])[pd_slot];
            if !table.is_null() {
                table.add(pt_index(virt)).write(0);
                crate::mm::pte::invlpg(virt);
            }
        }
        virt += PAGE_SIZE_4K;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_covering() {
        let regions = [(0x10_0000, 0x4000), (0x20_0000, 0x1000)];

        assert_eq!(region_covering(&regions, 0x10_0000), Some(0));
        assert_eq!(region_covering(&regions, 0x10_3FFF), Some(0));
        assert_eq!(region_covering(&regions, 0x10_4000), None);
        assert_eq!(region_covering(&regions, 0x20_0FFF), Some(1));
        assert_eq!(region_covering(&regions, 0x0), None);
    }

    #[test]
    fn test_find_free_range() {
        let regions = [(0x10_0000, 0x4000), (0x10_8000, 0x1000)];

        // Fits in the gap between the regions
        assert_eq!(find_free_range(&regions, 0x10_0000, 0x4000), 0x10_4000);
        // Too big for the gap, lands after the last region
        assert_eq!(find_free_range(&regions, 0x10_0000, 0x8000), 0x10_9000);
        // Empty list: first candidate wins
        assert_eq!(find_free_range(&[], 0x10_0000, 0x1000), 0x10_0000);
    }
}
