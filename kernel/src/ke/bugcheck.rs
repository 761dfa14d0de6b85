//! Kernel bug check.
//!
//! The terminal path for unrecoverable kernel errors. Interrupts go off,
//! every other CPU is halted by IPI, the error and a stack trace go to
//! serial, and the CPU parks. Output uses `serial_println!` directly: by the
//! time we are here, nothing above the serial port can be trusted.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::hal::apic;
use crate::ke::debug;
use crate::serial_println;

/// Stop codes
pub const PAGE_FAULT_IN_NONPAGED_AREA: u32 = 0x50;
pub const UNEXPECTED_KERNEL_MODE_TRAP: u32 = 0x7F;
pub const KERNEL_MODE_EXCEPTION_NOT_HANDLED: u32 = 0x8E;

/// Set once the first bug check begins; a second entry halts immediately
/// instead of recursing through the dump path.
static BUGCHECK_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Saved for post-mortem inspection from a debugger
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct BugCheckData {
    pub code: u32,
    pub parameter1: u64,
    pub parameter2: u64,
    pub parameter3: u64,
    pub parameter4: u64,
}

pub static mut BUGCHECK_DATA: BugCheckData = BugCheckData {
    code: 0,
    parameter1: 0,
    parameter2: 0,
    parameter3: 0,
    parameter4: 0,
};

/// Stop the system.
pub fn bugcheck(code: u32, parameter1: u64, parameter2: u64, parameter3: u64, parameter4: u64) -> ! {
    crate::arch::disable_interrupts();

    if BUGCHECK_ACTIVE.swap(true, Ordering::SeqCst) {
        loop {
            crate::arch::halt();
        }
    }

    unsafe {
        BUGCHECK_DATA = BugCheckData {
            code,
            parameter1,
            parameter2,
            parameter3,
            parameter4,
        };
    }

    apic::halt_other_cpus();

    serial_println!();
    serial_println!("*** STOP: {:#010x} ({:#x}, {:#x}, {:#x}, {:#x})",
        code, parameter1, parameter2, parameter3, parameter4);

    serial_println!("Stack trace:");
    debug::print_stack_trace(debug::current_frame_pointer());
    serial_println!("End stack trace.");

    loop {
        crate::arch::halt();
    }
}
