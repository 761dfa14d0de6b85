//! Per-process page tables.
//!
//! A [`PageMap`] is the hardware half of an address space: a private PML4
//! whose slot 0 covers the low 512 GiB user region and whose slot 511 is the
//! shared kernel half, copied verbatim from the kernel PML4.
//!
//! The user region is fully scaffolded at creation: the PDPT and all 512
//! page directories exist from the start, while page tables are created
//! lazily per (PDPT, PD) slot on first mapping. Every structure is tracked
//! by both its kernel virtual address (for the walk) and its physical
//! address (for the hardware).

use alloc::boxed::Box;
use core::ptr;

use crate::mm::kspace::{
    kernel_allocate_4k_pages, kernel_free_4k_pages, kernel_map_virtual_memory_4k, kernel_pml4_ptr,
    virtual_to_physical, MAX_PDPT_INDEX, PDPT_SIZE,
};
use crate::mm::physical::{
    allocate_physical_memory_block, free_physical_memory_block, PHYSALLOC_BLOCK_SIZE,
};
use crate::mm::pte::pte_flags::{PRESENT, USER, WRITABLE};
use crate::mm::pte::{
    get_page_frame, invlpg, pd_index, pdpt_index, pml4_index, pt_index, set_page_frame, PageTable,
    ENTRIES_PER_TABLE, PAGE_FRAME_MASK, PAGE_SIZE_4K,
};

/// Virtual addresses of the page tables under one PDPT slot, one per PD slot
type PageTablePointers = [*mut u64; ENTRIES_PER_TABLE];

/// The paging structures of one user address space
pub struct PageMap {
    /// Root table; slot 511 is the shared kernel half
    pub pml4: *mut PageTable,
    pub pml4_phys: u64,
    /// PDPT covering the low 512 GiB user region, installed in PML4 slot 0
    pub pdpt: *mut u64,
    pub pdpt_phys: u64,
    /// Virtual handles to the 512 page directories
    pub page_dir_pointers: *mut [*mut u64; ENTRIES_PER_TABLE],
    /// Physical frames backing the 512 page directories
    pub page_dir_pointers_phys: *mut [u64; ENTRIES_PER_TABLE],
    /// Contiguous storage for all PD entries (512 directories of 512)
    pub page_dirs: *mut u64,
    /// Lazily created page tables per (PDPT, PD) slot
    pub page_tables: *mut [*mut PageTablePointers; ENTRIES_PER_TABLE],
}

unsafe impl Send for PageMap {}

/// A page table's two addresses
struct TableHandle {
    virt: *mut u64,
    phys: u64,
}

/// Allocate one backed, zeroed kernel page.
unsafe fn allocate_kernel_page() -> TableHandle {
    let virt = kernel_allocate_4k_pages(1) as *mut u64;
    let phys = allocate_physical_memory_block();
    kernel_map_virtual_memory_4k(phys, virt as u64, 1, PRESENT | WRITABLE);
    ptr::write_bytes(virt, 0, ENTRIES_PER_TABLE);
    TableHandle { virt, phys }
}

/// Release a page obtained from [`allocate_kernel_page`].
unsafe fn free_kernel_page(virt: u64) {
    let phys = virtual_to_physical(virt);
    if phys >= PHYSALLOC_BLOCK_SIZE {
        free_physical_memory_block(phys);
    }
    kernel_free_4k_pages(virt, 1);
}

/// Build the paging structures for a fresh user address space.
///
/// # Safety
/// Requires a working kernel heap; the result must be torn down with
/// [`destroy_page_map`] exactly once.
pub unsafe fn create_page_map() -> PageMap {
    let pdpt = allocate_kernel_page();

    let page_dir_pointers =
        allocate_kernel_page().virt as *mut [*mut u64; ENTRIES_PER_TABLE];
    let page_dir_pointers_phys = allocate_kernel_page().virt as *mut [u64; ENTRIES_PER_TABLE];
    let page_tables =
        allocate_kernel_page().virt as *mut [*mut PageTablePointers; ENTRIES_PER_TABLE];

    // The PML4 starts as a copy of the kernel's, inheriting the kernel half
    let pml4 = kernel_allocate_4k_pages(1) as *mut PageTable;
    let pml4_phys = allocate_physical_memory_block();
    kernel_map_virtual_memory_4k(pml4_phys, pml4 as u64, 1, PRESENT | WRITABLE);
    ptr::copy_nonoverlapping(kernel_pml4_ptr(), pml4, 1);

    // All 512 page directories, contiguous in kernel virtual space
    let page_dirs = kernel_allocate_4k_pages(ENTRIES_PER_TABLE as u64) as *mut u64;

    for i in 0..ENTRIES_PER_TABLE {
        let dir = page_dirs.add(ENTRIES_PER_TABLE * i);
        let dir_phys = allocate_physical_memory_block();

        (*page_dir_pointers)[i] = dir;
        (*page_dir_pointers_phys)[i] = dir_phys;
        kernel_map_virtual_memory_4k(dir_phys, dir as u64, 1, PRESENT | WRITABLE);
        ptr::write_bytes(dir, 0, ENTRIES_PER_TABLE);

        (*page_tables)[i] =
            Box::into_raw(Box::new([ptr::null_mut::<u64>(); ENTRIES_PER_TABLE]));

        let entry = &mut *pdpt.virt.add(i);
        *entry = 0;
        set_page_frame(entry, dir_phys);
        *entry |= PRESENT | WRITABLE | USER;
    }

    // User PDPT into PML4 slot 0
    (*pml4).entries[0] = pdpt.phys | PRESENT | WRITABLE | USER;

    PageMap {
        pml4,
        pml4_phys,
        pdpt: pdpt.virt,
        pdpt_phys: pdpt.phys,
        page_dir_pointers,
        page_dir_pointers_phys,
        page_dirs,
        page_tables,
    }
}

/// Tear down a page map, returning every frame it owns to the physical
/// allocator. Frames in reserved low memory are never freed.
///
/// # Safety
/// No CPU may have the map loaded in CR3, and no region may still reference
/// it. Call exactly once.
pub unsafe fn destroy_page_map(page_map: &mut PageMap) {
    for i in 0..ENTRIES_PER_TABLE {
        if (*page_map.page_dir_pointers)[i].is_null() {
            continue;
        }
        if (*page_map.page_dir_pointers_phys)[i] < PHYSALLOC_BLOCK_SIZE {
            continue;
        }

        for j in 0..ENTRIES_PER_TABLE {
            let dir_entry = *page_map.page_dirs.add(i * ENTRIES_PER_TABLE + j);
            if dir_entry & PRESENT != 0 {
                let phys = get_page_frame(dir_entry) << 12;
                if phys >= PHYSALLOC_BLOCK_SIZE {
                    free_physical_memory_block(phys);
                    let table = (*(*page_map.page_tables)[i])[j];
                    if !table.is_null() {
                        kernel_free_4k_pages(table as u64, 1);
                    }
                }
            }
            (*page_map.page_dir_pointers)[i].add(j).write(0);
        }

        drop(Box::from_raw((*page_map.page_tables)[i]));
        *page_map.pdpt.add(i) = 0;
        free_physical_memory_block((*page_map.page_dir_pointers_phys)[i]);
        (*page_map.page_dir_pointers)[i] = ptr::null_mut();
    }

    kernel_free_4k_pages(page_map.page_dirs as u64, ENTRIES_PER_TABLE as u64);
    free_physical_memory_block(page_map.pdpt_phys);
    kernel_free_4k_pages(page_map.pdpt as u64, 1);

    free_physical_memory_block(page_map.pml4_phys);
    kernel_free_4k_pages(page_map.pml4 as u64, 1);
    free_kernel_page(page_map.page_dir_pointers as u64);
    free_kernel_page(page_map.page_dir_pointers_phys as u64);
    free_kernel_page(page_map.page_tables as u64);
}

/// Create the page table for slot (`pdpt_slot`, `pd_slot`) and install it in
/// the page directory with `PRESENT|WRITABLE|USER`.
unsafe fn create_page_table(pdpt_slot: usize, pd_slot: usize, page_map: &PageMap) {
    let table = allocate_kernel_page();

    let entry = &mut *page_map
        .page_dirs
        .add(pdpt_slot * ENTRIES_PER_TABLE + pd_slot);
    set_page_frame(entry, table.phys);
    *entry |= PRESENT | WRITABLE | USER;

    (*(*page_map.page_tables)[pdpt_slot])[pd_slot] = table.virt;
}

/// Map `amount` pages of `phys` at `virt` in a user address space.
///
/// Panics if the range leaves the low 512 GiB user region; a caller asking
/// for that is a kernel bug, not a recoverable error.
///
/// # Safety
/// The caller must own the page map (region write lock or creation-time
/// exclusivity).
pub unsafe fn map_virtual_memory_4k(phys: u64, virt: u64, amount: u64, flags: u64, page_map: &PageMap) {
    let (mut phys, mut virt) = (phys, virt);
    for _ in 0..amount {
        let pdpt_slot = pdpt_index(virt);
        let pd_slot = pd_index(virt);

        if pml4_index(virt) != 0 || pdpt_slot > MAX_PDPT_INDEX {
            panic!("user mapping outside the low 512 GiB region: {:#x}", virt);
        }

        assert!(!(*page_map.page_dir_pointers)[pdpt_slot].is_null());
        if *page_map
            .page_dirs
            .add(pdpt_slot * ENTRIES_PER_TABLE + pd_slot)
            & PRESENT
            == 0
        {
            create_page_table(pdpt_slot, pd_slot, page_map);
        }

        let table = (*(*page_map.page_tables)[pdpt_slot])[pd_slot];
        assert!(!table.is_null());
        table.add(pt_index(virt)).write((phys & PAGE_FRAME_MASK) | flags);

        invlpg(virt);

        phys += PAGE_SIZE_4K;
        virt += PAGE_SIZE_4K;
    }
}

/// Translate a virtual address through a specific address space.
///
/// User addresses walk the process tables; kernel addresses fall through to
/// the shared kernel walk. Returns the physical page base, or 0 when any
/// level is not present.
pub fn virtual_to_physical_in(addr: u64, page_map: &PageMap) -> u64 {
    if pml4_index(addr) != 0 {
        return virtual_to_physical(addr);
    }

    let pdpt_slot = pdpt_index(addr);
    let pd_slot = pd_index(addr);

    unsafe {
        let dir_entry = *page_map
            .page_dirs
            .add(pdpt_slot * ENTRIES_PER_TABLE + pd_slot);
        let table = (*(*page_map.page_tables)[pdpt_slot])[pd_slot];
        if dir_entry & PRESENT != 0 && !table.is_null() {
            *table.add(pt_index(addr)) & PAGE_FRAME_MASK
        } else {
            0
        }
    }
}

/// Coarse user-range check: both endpoints must sit below the 512 GiB user
/// boundary and in PDPT slots marked `USER`.
///
/// This is a PDPT-granular gate only; it does not inspect interior entries.
/// `AddressSpace::range_in_region` is the fine-grained complement.
pub fn check_region(addr: u64, len: u64, page_map: &PageMap) -> bool {
    if addr >= PDPT_SIZE || addr + len >= PDPT_SIZE {
        return false;
    }

    unsafe {
        *page_map.pdpt.add(pdpt_index(addr)) & USER != 0
            && *page_map.pdpt.add(pdpt_index(addr + len)) & USER != 0
    }
}
