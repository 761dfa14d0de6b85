//! Memory manager (mm)
//!
//! The virtual memory core:
//!
//! - **pte**: page-table entries, index arithmetic, TLB/CR plumbing
//! - **physical**: 4 KiB physical block allocator (bitmap)
//! - **kspace**: kernel mapping bootstrap and the kernel heap window's
//!   4 KiB virtual allocator
//! - **pool**: byte-granular kernel heap above the page allocator, the
//!   global allocator
//! - **page_map**: per-process four-level paging structures
//! - **vm_object** / **address_space**: region bookkeeping and the backing
//!   objects behind user mappings
//! - **fault**: #PF/#GP handling, copy-on-write resolution
//! - **trap**: recovery points for kernel code probing user memory
//! - **user**: the probing primitives themselves
//! - **tlb**: cross-CPU shootdown
//!
//! # Address space layout
//!
//! ```text
//! 0x0000_0000_0000_0000 .. 0x0000_007F_FFFF_FFFF   user region (512 GiB, PML4 slot 0)
//! 0xFFFF_FFFE_8000_0000 .. 0xFFFF_FFFF_7FFF_FFFF   identity-mapped MMIO window (4 GiB)
//! 0xFFFF_FFFF_8000_0000 .. 0xFFFF_FFFF_BFFF_FFFF   kernel image (2 MiB pages)
//! 0xFFFF_FFFF_C000_0000 .. 0xFFFF_FFFF_FFFF_FFFF   kernel heap window (4 KiB pages)
//! ```
//!
//! Initialization is two-phase: [`init`] builds the physical allocator and
//! the kernel mapping with nothing but statics; [`late_init`] wires up the
//! parts that need the pool allocator.

pub mod address_space;
pub mod fault;
pub mod kspace;
pub mod page_map;
pub mod physical;
pub mod pool;
pub mod pte;
pub mod tlb;
pub mod trap;
pub mod user;
pub mod vm_object;

pub use address_space::{AddressSpace, MappedRegion};
pub use kspace::{
    check_kernel_pointer, get_io_mapping, kernel_allocate_4k_pages, kernel_free_4k_pages,
    kernel_map_virtual_memory_2m, kernel_map_virtual_memory_4k, teardown_low_identity_map,
    virtual_to_physical, IO_MAPPING_FAILED, IO_VIRTUAL_BASE, KERNEL_HEAP_PDPT_INDEX,
    KERNEL_HEAP_PML4_INDEX, KERNEL_VIRTUAL_BASE, MAX_PDPT_INDEX, PDPT_SIZE,
};
pub use page_map::{
    check_region, create_page_map, destroy_page_map, map_virtual_memory_4k,
    virtual_to_physical_in, PageMap,
};
pub use physical::{
    allocate_physical_memory_block, free_physical_memory_block, PHYSALLOC_BLOCK_SIZE,
};
pub use pte::{PAGE_SIZE_1G, PAGE_SIZE_2M, PAGE_SIZE_4K};
pub use trap::{register_page_fault_trap, PageFaultTrap};
pub use user::{check_usermode_pointer, user_memcpy, user_memset, user_strlen};
pub use vm_object::VmObject;

/// Phase 0: physical allocator, kernel mapping, fault handlers. Single
/// threaded, interrupts disabled, no heap.
///
/// # Safety
/// Call exactly once on the boot CPU before interrupts are enabled.
pub unsafe fn init(boot_info: &crate::BootInfo) {
    physical::initialize_physical_allocator(boot_info);
    kspace::initialize_virtual_memory();
    log::info!("virtual memory initialized, CR3 {:#x}", kspace::kernel_pml4_phys());
}

/// Phase 1: everything needing a working heap (the fault-trap registry and
/// the user-memory primitives' recovery points).
///
/// # Safety
/// Call exactly once, after [`init`].
pub unsafe fn late_init() {
    kspace::late_initialize_virtual_memory();
    log::info!("fault traps registered");
}
