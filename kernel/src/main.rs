//! Vermilion OS kernel.
//!
//! The kernel is organized around its virtual memory core:
//!
//! - **mm** - memory manager: paging, address spaces, fault handling
//! - **ke** - kernel support: locks, bug check, stack traces
//! - **ps** - process/thread model consumed by the fault path
//! - **arch** - CPU structures (IDT, interrupt plumbing)
//! - **hal** - local APIC for IPIs
//!
//! # Initialization
//!
//! Two phases, mirrored in `mm`:
//!
//! - **Phase 0**: single-threaded, interrupts off. Serial, IDT, physical
//!   allocator, kernel page tables; ends with CR3 pointing at the kernel
//!   PML4.
//! - **Phase 1**: the pool allocator is live (it only needs phase 0), so
//!   the fault-trap registry and process bookkeeping come up.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![feature(abi_x86_interrupt)]
#![allow(static_mut_refs)]
#![allow(dead_code)]
// Kernel-specific lint configuration:
// - missing_safety_doc: ambient unsafety is the baseline here
// - not_unsafe_ptr_arg_deref: page-map operations take raw table pointers
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(clippy::new_without_default)]
#![allow(clippy::result_unit_err)]
#![allow(clippy::too_many_arguments)]

extern crate alloc;

pub mod arch;
pub mod hal;
pub mod ke;
pub mod mm;
pub mod ps;

mod logger;
pub mod serial;

/// Expected value of [`BootInfo::magic`]
pub const BOOT_MAGIC: u64 = 0x5645_524D_4F53_0001;

/// One entry of the bootloader's physical memory map
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// Physical start address (4 KiB aligned)
    pub base: u64,
    /// Length in 4 KiB pages
    pub page_count: u64,
    /// Whether the region is free for allocation
    pub usable: bool,
}

/// Boot information handed over by the loader.
/// Must match the bootloader's layout exactly.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    /// Magic number for validation
    pub magic: u64,
    /// Physical memory map
    pub memory_map: *const MemoryRegion,
    pub memory_map_entries: u64,
}

impl BootInfo {
    pub fn memory_regions(&self) -> &[MemoryRegion] {
        unsafe { core::slice::from_raw_parts(self.memory_map, self.memory_map_entries as usize) }
    }
}

/// Kernel entry point, called by the bootloader with paging still on its
/// identity/high double mapping.
#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn kernel_main(boot_info: *const BootInfo) -> ! {
    serial::init();
    logger::init();

    serial_println!();
    serial_println!("Vermilion OS");

    let boot_info = unsafe { &*boot_info };
    if boot_info.magic != BOOT_MAGIC {
        panic!("bad boot magic {:#x}", boot_info.magic);
    }

    // Phase 0
    arch::x86_64::idt::init();
    unsafe {
        mm::init(boot_info);
    }

    // Phase 1
    hal::apic::init();
    unsafe {
        mm::late_init();
    }
    ps::init();

    log::info!("kernel up, {} MB physical in use",
        mm::physical::used_physical_blocks() * 4 / 1024);

    arch::enable_interrupts();
    loop {
        arch::halt();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    arch::disable_interrupts();

    serial_println!();
    serial_println!("!!! KERNEL PANIC !!!");
    serial_println!("{}", info);

    hal::apic::halt_other_cpus();
    ke::debug::print_stack_trace(ke::debug::current_frame_pointer());

    loop {
        arch::halt();
    }
}
