//! Kernel address space.
//!
//! Owns the kernel's static paging structures and everything mapped above
//! the canonical split:
//!
//! - the kernel image, 2 MiB-mapped at [`KERNEL_VIRTUAL_BASE`]
//! - a 4 GiB identity window for MMIO at [`IO_VIRTUAL_BASE`], cache-disabled
//! - the kernel heap window at PDPT slot 511, where 4 KiB virtual pages are
//!   handed out by [`kernel_allocate_4k_pages`]
//!
//! Heap-window allocation is split from physical backing on purpose: a
//! reserved page table entry holds `PRESENT|WRITABLE` with a zero frame until
//! [`kernel_map_virtual_memory_4k`] attaches one. Device drivers exploit this
//! to map MMIO without consuming physical blocks.
//!
//! All mutation of the heap directory and its page tables happens under
//! the heap directory spinlock, taken with interrupts disabled.

use crate::arch::x86_64::idt::{self, vector};
use crate::ke::debug;
use crate::ke::SpinLock;
use crate::mm::pte::{
    self, get_page_frame, invlpg, pd_index, pdpt_index, pml4_index, pt_index, set_page_frame,
    PageTable, ENTRIES_PER_TABLE, PAGE_SIZE_1G, PAGE_SIZE_2M, PAGE_SIZE_4K,
};
use crate::mm::pte::pte_flags::{CACHE_DISABLED, LARGE, PRESENT, WRITABLE};
use crate::mm::{fault, physical, trap, user};

// ============================================================================
// Address space layout
// ============================================================================

/// Virtual base of the kernel image (PML4 index 511, PDPT index 510)
pub const KERNEL_VIRTUAL_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// Virtual base of the 4 GiB identity-mapped MMIO window
pub const IO_VIRTUAL_BASE: u64 = KERNEL_VIRTUAL_BASE - 0x1_0000_0000;

/// PML4 slot holding the kernel half
pub const KERNEL_HEAP_PML4_INDEX: usize = 511;

/// PDPT slot holding the kernel heap window
pub const KERNEL_HEAP_PDPT_INDEX: usize = 511;

/// Bytes of address space covered by one PML4 entry (one full PDPT)
pub const PDPT_SIZE: u64 = 0x80_0000_0000;

/// Upper bound on user PDPT indices: user mappings live in PML4 slot 0 only
pub const MAX_PDPT_INDEX: usize = 511;

/// Sentinel returned by [`get_io_mapping`] for physical addresses above 4 GiB
pub const IO_MAPPING_FAILED: u64 = 0xFFFF_FFFF;

/// Value of a heap-window PT entry that is reserved but has no frame attached
const RESERVED_ENTRY: u64 = PRESENT | WRITABLE;

// ============================================================================
// Static paging structures
// ============================================================================

static mut KERNEL_PML4: PageTable = PageTable::new();
static mut KERNEL_PDPT: PageTable = PageTable::new();
/// Maps the kernel image: 512 x 2 MiB covering [0, 1 GiB)
static mut KERNEL_DIR: PageTable = PageTable::new();
/// Page directory of the kernel heap window
static mut KERNEL_HEAP_DIR: PageTable = PageTable::new();
/// Backing page tables for every heap-window PD slot, preallocated so
/// installing a PD entry never needs a physical block
static mut KERNEL_HEAP_DIR_TABLES: [PageTable; ENTRIES_PER_TABLE] =
    [const { PageTable::new() }; ENTRIES_PER_TABLE];
/// Four page directories identity-mapping [0, 4 GiB) of MMIO
static mut IO_DIRS: [PageTable; 4] = [const { PageTable::new() }; 4];

/// Physical address of [`KERNEL_PML4`], loaded into CR3 by every address space
static mut KERNEL_PML4_PHYS: u64 = 0;

/// Guards all heap-window PD/PT mutation
pub static KERNEL_HEAP_DIR_LOCK: SpinLock<()> = SpinLock::new(());

/// Physical address of a static linked into the kernel image.
#[inline]
fn kernel_static_phys<T>(ptr: *const T) -> u64 {
    ptr as u64 - KERNEL_VIRTUAL_BASE
}

/// Physical address of the kernel PML4.
pub fn kernel_pml4_phys() -> u64 {
    unsafe { KERNEL_PML4_PHYS }
}

/// The kernel PML4, for address spaces that inherit its kernel half.
///
/// # Safety
/// Read-only use after `initialize_virtual_memory`; the kernel half never
/// changes afterwards.
pub unsafe fn kernel_pml4_ptr() -> *const PageTable {
    core::ptr::addr_of!(KERNEL_PML4)
}

// ============================================================================
// Bootstrap
// ============================================================================

/// Build the fixed kernel mapping and switch onto it.
///
/// Runs once on the boot CPU with interrupts disabled, before any allocation.
/// The order is contractual: fault handlers first (so a bug here traps
/// usefully), then tables, then CR0.WP, then CR3.
pub unsafe fn initialize_virtual_memory() {
    idt::register_interrupt_handler(vector::GENERAL_PROTECTION, fault::general_protection_handler);
    idt::register_interrupt_handler(vector::PAGE_FAULT, fault::page_fault_handler);

    KERNEL_PML4.zero();
    KERNEL_PDPT.zero();
    KERNEL_HEAP_DIR.zero();
    for table in KERNEL_HEAP_DIR_TABLES.iter_mut() {
        table.zero();
    }

    // Kernel half of the PML4, mirrored at slot 0 so the APs can run on this
    // table while still executing from identity-mapped low memory
    let kernel_slot = pml4_index(KERNEL_VIRTUAL_BASE);
    set_page_frame(
        &mut KERNEL_PML4.entries[kernel_slot],
        kernel_static_phys(core::ptr::addr_of!(KERNEL_PDPT)),
    );
    KERNEL_PML4.entries[kernel_slot] |= PRESENT | WRITABLE;
    KERNEL_PML4.entries[0] = KERNEL_PML4.entries[kernel_slot];

    // Kernel image: 512 x 2 MiB large pages covering the first gigabyte
    KERNEL_PDPT.entries[pdpt_index(KERNEL_VIRTUAL_BASE)] =
        kernel_static_phys(core::ptr::addr_of!(KERNEL_DIR)) | PRESENT | WRITABLE;
    for j in 0..ENTRIES_PER_TABLE {
        KERNEL_DIR.entries[j] = (PAGE_SIZE_2M * j as u64) | LARGE | WRITABLE | PRESENT;
    }

    // Kernel heap window
    KERNEL_PDPT.entries[KERNEL_HEAP_PDPT_INDEX] = PRESENT | WRITABLE;
    set_page_frame(
        &mut KERNEL_PDPT.entries[KERNEL_HEAP_PDPT_INDEX],
        kernel_static_phys(core::ptr::addr_of!(KERNEL_HEAP_DIR)),
    );

    // 4 GiB of identity-mapped MMIO, cache-disabled
    for i in 0..IO_DIRS.len() {
        KERNEL_PDPT.entries[pdpt_index(IO_VIRTUAL_BASE) + i] =
            kernel_static_phys(core::ptr::addr_of!(IO_DIRS[i])) | PRESENT | WRITABLE;
        for j in 0..ENTRIES_PER_TABLE {
            IO_DIRS[i].entries[j] = (PAGE_SIZE_1G * i as u64 + PAGE_SIZE_2M * j as u64)
                | (LARGE | WRITABLE | PRESENT | CACHE_DISABLED);
        }
    }

    // Identity-map low memory through the same PDPT for AP bringup
    KERNEL_PDPT.entries[0] = KERNEL_PDPT.entries[pdpt_index(KERNEL_VIRTUAL_BASE)];

    // From here on read-only really means read-only, even in ring 0
    pte::enable_write_protect();

    KERNEL_PML4_PHYS = kernel_static_phys(core::ptr::addr_of!(KERNEL_PML4));
    pte::set_cr3(KERNEL_PML4_PHYS);
}

/// Second init phase, run once the pool allocator works: create the fault
/// trap registry and register the user-memory primitives.
pub unsafe fn late_initialize_virtual_memory() {
    trap::initialize_page_fault_traps();
    user::register_user_memory_traps();
}

/// Drop the low-memory identity mirrors once every AP runs on high addresses.
pub unsafe fn teardown_low_identity_map() {
    KERNEL_PML4.entries[0] = 0;
    KERNEL_PDPT.entries[0] = 0;
    super::tlb::tlb_shootdown_all();
}

// ============================================================================
// Heap window allocation
// ============================================================================

/// Virtual address of page `page` in directory `dir` of the heap window.
fn heap_window_address(dir: usize, page: usize) -> u64 {
    let address = (KERNEL_HEAP_PML4_INDEX as u64 * PDPT_SIZE)
        + (KERNEL_HEAP_PDPT_INDEX as u64 * PAGE_SIZE_1G)
        + (dir as u64 * PAGE_SIZE_2M)
        + (page as u64 * PAGE_SIZE_4K);
    address | 0xFFFF_0000_0000_0000
}

/// First-fit scan over heap directories that already have page tables.
///
/// Returns the (directory, page) where a run of `amount` consecutive
/// non-present entries begins. A run may span adjacent present directories.
fn scan_present_tables(dir: &[u64; ENTRIES_PER_TABLE], tables: &[PageTable], amount: u64) -> Option<(usize, usize)> {
    let mut run_dir = 0usize;
    let mut run_page = 0usize;
    let mut counter = 0u64;

    for i in 0..ENTRIES_PER_TABLE {
        if dir[i] & PRESENT != 0 && dir[i] & LARGE == 0 {
            for j in 0..ENTRIES_PER_TABLE {
                if tables[i].entries[j] & PRESENT != 0 {
                    run_dir = i;
                    run_page = j + 1;
                    counter = 0;
                    continue;
                }
                counter += 1;
                if counter >= amount {
                    return Some((run_dir, run_page));
                }
            }
        } else {
            run_dir = i + 1;
            run_page = 0;
            counter = 0;
        }
    }
    None
}

/// First-fit scan over heap directories with no page table yet. Each free
/// directory contributes 512 pages; runs must use consecutive free slots.
fn scan_unmapped_dirs(dir: &[u64; ENTRIES_PER_TABLE], amount: u64) -> Option<(usize, usize)> {
    let mut run_dir = 0usize;
    let mut counter = 0u64;

    for i in 0..ENTRIES_PER_TABLE {
        if dir[i] & PRESENT == 0 {
            counter += ENTRIES_PER_TABLE as u64;
            if counter >= amount {
                return Some((run_dir, 0));
            }
        } else {
            run_dir = i + 1;
            counter = 0;
        }
    }
    None
}

/// Install the statically preallocated page table backing heap directory
/// slot `dir`. Idempotent: the frame for a given slot never changes.
unsafe fn install_heap_page_table(dir: usize) {
    let entry = &mut KERNEL_HEAP_DIR.entries[dir];
    set_page_frame(
        entry,
        kernel_static_phys(core::ptr::addr_of!(KERNEL_HEAP_DIR_TABLES[dir])),
    );
    *entry |= PRESENT | WRITABLE;
}

/// Reserve `amount` consecutive 4 KiB virtual pages in the kernel heap
/// window and return the first address.
///
/// The returned range has its PT entries marked `PRESENT|WRITABLE` with no
/// physical frame attached; follow with [`kernel_map_virtual_memory_4k`] to
/// back it. Panics when the window is exhausted.
pub fn kernel_allocate_4k_pages(amount: u64) -> u64 {
    debug_assert!(amount > 0);
    let guard = KERNEL_HEAP_DIR_LOCK.lock();

    unsafe {
        // Pass 1: holes in page tables that already exist
        if let Some((dir, page)) =
            scan_present_tables(&KERNEL_HEAP_DIR.entries, &KERNEL_HEAP_DIR_TABLES, amount)
        {
            let address = heap_window_address(dir, page);
            let (mut dir, mut page) = (dir, page);
            for _ in 0..amount {
                if page >= ENTRIES_PER_TABLE {
                    dir += 1;
                    page = 0;
                }
                KERNEL_HEAP_DIR_TABLES[dir].entries[page] = RESERVED_ENTRY;
                page += 1;
            }
            return address;
        }

        // Pass 2: bring fresh page tables online
        if let Some((dir, page)) = scan_unmapped_dirs(&KERNEL_HEAP_DIR.entries, amount) {
            let address = heap_window_address(dir, page);
            let (mut dir, mut page) = (dir, page);
            install_heap_page_table(dir);
            for _ in 0..amount {
                if page >= ENTRIES_PER_TABLE {
                    dir += 1;
                    page = 0;
                    install_heap_page_table(dir);
                }
                KERNEL_HEAP_DIR_TABLES[dir].entries[page] = RESERVED_ENTRY;
                page += 1;
            }
            return address;
        }
    }

    drop(guard);
    crate::arch::disable_interrupts();
    log::error!(
        "out of virtual memory, used physical memory: {} KB",
        physical::used_physical_blocks() * 4
    );
    debug::print_stack_trace(debug::current_frame_pointer());
    panic!("Out of Virtual Memory");
}

/// Release `amount` pages starting at `addr`: clears the PT entries and
/// invalidates each page on this CPU.
pub fn kernel_free_4k_pages(addr: u64, amount: u64) {
    let _guard = KERNEL_HEAP_DIR_LOCK.lock();

    let mut virt = addr;
    for _ in 0..amount {
        unsafe {
            KERNEL_HEAP_DIR_TABLES[pd_index(virt)].entries[pt_index(virt)] = 0;
        }
        invlpg(virt);
        virt += PAGE_SIZE_4K;
    }
}

/// Attach physical frames to `amount` reserved heap-window pages.
pub fn kernel_map_virtual_memory_4k(phys: u64, virt: u64, amount: u64, flags: u64) {
    let _guard = KERNEL_HEAP_DIR_LOCK.lock();

    let (mut phys, mut virt) = (phys, virt);
    for _ in 0..amount {
        unsafe {
            let entry = &mut KERNEL_HEAP_DIR_TABLES[pd_index(virt)].entries[pt_index(virt)];
            *entry = flags;
            set_page_frame(entry, phys);
        }
        invlpg(virt);
        phys += PAGE_SIZE_4K;
        virt += PAGE_SIZE_4K;
    }
}

/// Map `amount` 2 MiB large pages into the heap window's page directory.
pub fn kernel_map_virtual_memory_2m(phys: u64, virt: u64, amount: u64) {
    let _guard = KERNEL_HEAP_DIR_LOCK.lock();

    let mut dir = pd_index(virt);
    let mut phys = phys;
    for _ in 0..amount {
        unsafe {
            let entry = &mut KERNEL_HEAP_DIR.entries[dir];
            *entry = LARGE | WRITABLE | PRESENT;
            set_page_frame(entry, phys);
        }
        dir += 1;
        phys += PAGE_SIZE_2M;
    }
}

// ============================================================================
// Translation and checks
// ============================================================================

/// Translate a kernel virtual address to the physical base of its page.
///
/// Returns 0 for any user-half address without indicating an error; callers
/// translating user ranges must use the page-map form instead.
pub fn virtual_to_physical(addr: u64) -> u64 {
    if pml4_index(addr) != KERNEL_HEAP_PML4_INDEX {
        return 0;
    }

    unsafe {
        match pdpt_index(addr) {
            KERNEL_HEAP_PDPT_INDEX => {
                let dir_entry = KERNEL_HEAP_DIR.entries[pd_index(addr)];
                if dir_entry & LARGE != 0 {
                    get_page_frame(dir_entry) << 12
                } else {
                    get_page_frame(KERNEL_HEAP_DIR_TABLES[pd_index(addr)].entries[pt_index(addr)])
                        << 12
                }
            }
            i if i == pdpt_index(KERNEL_VIRTUAL_BASE) => {
                get_page_frame(KERNEL_DIR.entries[pd_index(addr)]) << 12
            }
            _ => 0,
        }
    }
}

/// Verify that `addr..addr + len` maps through the kernel tables: PML4 and
/// PDPT present, PD present, and the PT entry present unless the PD maps a
/// 2 MiB page.
pub fn check_kernel_pointer(addr: u64, len: u64) -> bool {
    let _guard = KERNEL_HEAP_DIR_LOCK.lock();

    let check_one = |addr: u64| -> bool {
        if pml4_index(addr) != pml4_index(KERNEL_VIRTUAL_BASE) {
            return false;
        }

        unsafe {
            if KERNEL_PDPT.entries[pdpt_index(addr)] & PRESENT == 0 {
                return false;
            }

            if pdpt_index(addr) == KERNEL_HEAP_PDPT_INDEX {
                let dir_entry = KERNEL_HEAP_DIR.entries[pd_index(addr)];
                if dir_entry & PRESENT == 0 {
                    return false;
                }
                if dir_entry & LARGE == 0
                    && KERNEL_HEAP_DIR_TABLES[pd_index(addr)].entries[pt_index(addr)] & PRESENT
                        == 0
                {
                    return false;
                }
                true
            } else if pdpt_index(addr) == pdpt_index(KERNEL_VIRTUAL_BASE) {
                KERNEL_DIR.entries[pd_index(addr)] & PRESENT != 0
            } else {
                false
            }
        }
    };

    check_one(addr) && check_one(addr + len.saturating_sub(1))
}

/// Virtual address of an identity-mapped MMIO range.
///
/// Returns [`IO_MAPPING_FAILED`] for physical addresses above 4 GiB; the
/// caller must check.
pub fn get_io_mapping(phys: u64) -> u64 {
    if phys > 0xFFFF_FFFF {
        log::error!("MMIO above 4 GiB is unsupported ({:#x})", phys);
        return IO_MAPPING_FAILED;
    }

    phys + IO_VIRTUAL_BASE
}

/// Map a physical block at a scratch kernel address for the duration of `f`.
///
/// Used to zero or copy frames that are not otherwise kernel-visible.
pub fn with_mapped_block<R>(phys: u64, f: impl FnOnce(*mut u8) -> R) -> R {
    let virt = kernel_allocate_4k_pages(1);
    kernel_map_virtual_memory_4k(phys, virt, 1, PRESENT | WRITABLE);
    let result = f(virt as *mut u8);
    kernel_free_4k_pages(virt, 1);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_tables() -> alloc::vec::Vec<PageTable> {
        (0..ENTRIES_PER_TABLE).map(|_| PageTable::new()).collect()
    }

    #[test]
    fn test_heap_window_address() {
        assert_eq!(heap_window_address(0, 0), 0xFFFF_FFFF_C000_0000);
        assert_eq!(heap_window_address(0, 1), 0xFFFF_FFFF_C000_1000);
        assert_eq!(heap_window_address(1, 0), 0xFFFF_FFFF_C020_0000);
    }

    #[test]
    fn test_scan_present_tables_finds_earliest_hole() {
        let mut dir = [0u64; ENTRIES_PER_TABLE];
        let mut tables = empty_tables();

        dir[0] = PRESENT | WRITABLE;
        tables[0].entries[0] = RESERVED_ENTRY;
        tables[0].entries[1] = RESERVED_ENTRY;
        // Entries 2.. are free

        assert_eq!(scan_present_tables(&dir, &tables, 1), Some((0, 2)));
        assert_eq!(scan_present_tables(&dir, &tables, 510), Some((0, 2)));
        // Run longer than one table with only one present directory fails
        assert_eq!(scan_present_tables(&dir, &tables, 511), None);
    }

    #[test]
    fn test_scan_present_tables_spans_adjacent_dirs() {
        let mut dir = [0u64; ENTRIES_PER_TABLE];
        let mut tables = empty_tables();

        dir[3] = PRESENT | WRITABLE;
        dir[4] = PRESENT | WRITABLE;
        tables[3].entries[510] = RESERVED_ENTRY;
        // 1 free at the end of dir 3, 512 in dir 4

        assert_eq!(scan_present_tables(&dir, &tables, 513), Some((3, 511)));
        assert_eq!(scan_present_tables(&dir, &tables, 514), None);
    }

    #[test]
    fn test_scan_present_tables_skips_large_mappings() {
        let mut dir = [0u64; ENTRIES_PER_TABLE];
        let tables = empty_tables();

        dir[0] = PRESENT | WRITABLE | LARGE;
        assert_eq!(scan_present_tables(&dir, &tables, 1), None);
    }

    #[test]
    fn test_scan_unmapped_dirs() {
        let mut dir = [0u64; ENTRIES_PER_TABLE];
        assert_eq!(scan_unmapped_dirs(&dir, 1), Some((0, 0)));
        assert_eq!(scan_unmapped_dirs(&dir, 512 * 512), Some((0, 0)));

        dir[0] = PRESENT;
        assert_eq!(scan_unmapped_dirs(&dir, 1), Some((1, 0)));

        // A present directory in the middle splits runs
        dir[2] = PRESENT;
        assert_eq!(scan_unmapped_dirs(&dir, 513), Some((3, 0)));
    }
}
