//! x86_64 CPU support.

pub mod idt;

use x86_64::instructions::{hlt, interrupts};

/// Halt the CPU until the next interrupt.
#[inline]
pub fn halt() {
    hlt();
}

/// Enable interrupts.
#[inline]
pub fn enable_interrupts() {
    interrupts::enable();
}

/// Disable interrupts.
#[inline]
pub fn disable_interrupts() {
    interrupts::disable();
}

/// Whether interrupts are currently enabled.
#[inline]
pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

/// The faulting linear address of the most recent page fault.
#[inline]
pub fn read_cr2() -> u64 {
    use x86_64::registers::control::Cr2;
    Cr2::read_raw()
}
