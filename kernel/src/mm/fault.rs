//! Page-fault and general-protection handling.
//!
//! The decision tree, in order:
//!
//! 1. Kernel-mode faults recover only through the fault-trap registry: a
//!    registered `rip` is redirected to its handler, anything else is a
//!    kernel panic (other CPUs halted first).
//! 2. User-mode faults resolve against the process's mapped regions: lazy
//!    backing via `VmObject::hit`, copy-on-write privatization or cloning
//!    on write faults. A user fault no region can explain kills the process
//!    after a diagnostic dump.
//!
//! Interrupt discipline: interrupts are enabled around region lookup and
//! VM-object work (both may spin on the region lock for a while) and
//! disabled around page-table mutation. Every path that test-acquired the
//! thread's `kernel_lock` releases it before returning.

use alloc::sync::Arc;
use bitflags::bitflags;

use crate::arch;
use crate::arch::x86_64::idt::{self, TrapFrame};
use crate::hal::apic;
use crate::ke::{bugcheck, debug};
use crate::mm::address_space::{AddressSpace, MappedRegion};
use crate::mm::trap::lookup_page_fault_trap;
use crate::mm::vm_object::VmObject;
use crate::ps::{self, Process, Thread, ThreadState};

bitflags! {
    /// #PF error code pushed by the CPU
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultError: u64 {
        /// Set: protection violation. Clear: page not present.
        const PROTECTION = 1 << 0;
        /// The access was a write
        const WRITE = 1 << 1;
        /// The CPU was in user mode
        const USER = 1 << 2;
        /// Reserved bits were set in a paging structure
        const RESERVED = 1 << 3;
        /// The access was an instruction fetch
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// #PF entry point, registered on vector 14 at VM init.
pub fn page_fault_handler(regs: &mut TrapFrame) {
    let fault_address = arch::x86_64::read_cr2();
    let error = PageFaultError::from_bits_truncate(regs.error_code);
    let is_write = error.contains(PageFaultError::WRITE);

    // Kernel-mode faults either hit a registered recovery point or the
    // kernel is done
    if !regs.is_user_mode() {
        if let Some(trap) = lookup_page_fault_trap(regs.rip) {
            regs.rip = trap.handler;
            return;
        }
        fatal_kernel_fault(regs, fault_address, error);
    }

    let thread = ps::current_thread();
    let process = ps::current_process();

    if let Some(thread) = thread {
        // A zombie's fault means nothing; park without touching any lock
        if thread.state() == ThreadState::Zombie {
            log::info!("zombie thread page fault");
            arch::enable_interrupts();
            loop {
                ps::yield_now();
            }
        }

        // Failure to take the lifecycle lock means the thread is being torn
        // down under us
        if !thread.kernel_lock.acquire_test() {
            dump_fault_information(regs, fault_address, error, process);
            if let Some(process) = process {
                log::info!("Stack trace:");
                debug::print_user_stack_trace(regs.frame_pointer, &process.address_space);
                log::info!("End stack trace.");
            }
            panic!("page fault on a thread mid-teardown");
        }
    }

    if let Some(process) = process {
        let address_space = &process.address_space;

        // Region lookup blocks on the region's write lock
        arch::enable_interrupts();
        let region = address_space.address_to_region_write_lock(fault_address);
        arch::disable_interrupts();

        match region {
            Some(region) => {
                if let Some(vm_object) = region.vm_object() {
                    if vm_object.is_copy_on_write() && is_write {
                        resolve_copy_on_write(&region, vm_object, fault_address, address_space);
                        region.lock.release_write();
                        release_thread_lock(thread);
                        return;
                    }

                    arch::enable_interrupts();
                    let status = vm_object.hit(
                        region.base(),
                        fault_address - region.base(),
                        address_space.page_map(),
                    );
                    region.lock.release_write();

                    if status.is_ok() {
                        release_thread_lock(thread);
                        return;
                    }
                    arch::disable_interrupts();
                } else {
                    region.lock.release_write();
                }
            }
            None => {
                // No region: kernel code on this thread may have faulted on
                // a bad user pointer at a registered probe site
                if let Some(trap) = lookup_page_fault_trap(regs.rip) {
                    regs.rip = trap.handler;
                    release_thread_lock(thread);
                    return;
                }
            }
        }
    }

    fatal_user_fault(regs, fault_address, error);
}

/// #GP entry point, registered on vector 13 at VM init. Kernel-mode faults
/// get the same trap-redirect chance as #PF; everything else is fatal.
pub fn general_protection_handler(regs: &mut TrapFrame) {
    if !regs.is_user_mode() {
        if let Some(trap) = lookup_page_fault_trap(regs.rip) {
            regs.rip = trap.handler;
            return;
        }
    }

    idt::handle_fatal_interrupt(idt::vector::GENERAL_PROTECTION, regs);
}

/// Resolve a write fault on a copy-on-write object. Runs under the region
/// write lock; the caller releases it.
fn resolve_copy_on_write(
    region: &Arc<MappedRegion>,
    vm_object: Arc<VmObject>,
    fault_address: u64,
    address_space: &AddressSpace,
) {
    let base = region.base();
    let offset = fault_address - base;
    let page_map = address_space.page_map();

    if vm_object.ref_count() <= 1 {
        // Sole owner: privatize in place and remap everything writable
        vm_object.set_copy_on_write(false);
        vm_object.map_allocated_blocks(base, page_map);

        // The faulted page may never have been allocated at all
        arch::enable_interrupts();
        let _ = vm_object.hit(base, offset, page_map);
        arch::disable_interrupts();
    } else {
        // Shared: diverge onto a private copy, leaving the original for the
        // other holders
        arch::enable_interrupts();
        let clone = Arc::new(vm_object.clone_object());
        vm_object.release_ref();
        region.set_vm_object(clone.clone());
        arch::disable_interrupts();

        clone.map_allocated_blocks(base, page_map);
        let _ = clone.hit(base, offset, page_map);
    }
}

fn release_thread_lock(thread: Option<&Thread>) {
    if let Some(thread) = thread {
        thread.kernel_lock.release();
    }
}

/// Diagnostic dump shared by the fatal paths.
fn dump_fault_information(
    regs: &TrapFrame,
    fault_address: u64,
    error: PageFaultError,
    process: Option<&Process>,
) {
    log::info!("Page Fault");
    log::info!(
        "rip: {:#x}, rsp: {:#x}, rflags: {:#x}, cs: {:#x}, ss: {:#x}, err: {:#x}",
        regs.rip,
        regs.rsp,
        regs.rflags,
        regs.cs,
        regs.ss,
        regs.error_code
    );
    log::info!("Fault address: {:#x}", fault_address);

    if !error.contains(PageFaultError::PROTECTION) {
        log::info!("Page not present");
    }
    if error.contains(PageFaultError::WRITE) {
        log::info!("Write to read-only page");
    }
    if error.contains(PageFaultError::USER) {
        log::info!("User-mode access to kernel memory");
    }
    if error.contains(PageFaultError::RESERVED) {
        log::info!("Reserved bits overwritten");
    }
    if error.contains(PageFaultError::INSTRUCTION_FETCH) {
        log::info!("Instruction fetch");
    }

    if let Some(process) = process {
        log::info!("Process mapped memory:");
        process.address_space.dump_regions();
    }
}

/// A user fault nothing resolved: dump, trace, terminate the process.
fn fatal_user_fault(regs: &mut TrapFrame, fault_address: u64, error: PageFaultError) -> ! {
    let process = ps::current_process();

    if let Some(process) = process {
        log::info!("process {} (pid {:#x}) page fault", process.name, process.pid);
        dump_fault_information(regs, fault_address, error, Some(process));

        log::info!("Stack trace:");
        debug::print_user_stack_trace(regs.frame_pointer, &process.address_space);
        log::info!("End stack trace.");

        process.die();
    }

    // A user-mode fault without a current process is a scheduler invariant
    // broken somewhere below us
    fatal_kernel_fault(regs, fault_address, error);
}

/// A kernel fault no trap claimed: halt the other CPUs and stop.
fn fatal_kernel_fault(regs: &mut TrapFrame, fault_address: u64, error: PageFaultError) -> ! {
    arch::disable_interrupts();
    dump_fault_information(regs, fault_address, error, ps::current_process());

    // Keep the other CPUs from running on whatever state caused this
    apic::halt_other_cpus();

    log::info!("Stack trace:");
    debug::print_stack_trace(regs.frame_pointer);
    log::info!("End stack trace.");

    bugcheck::bugcheck(
        bugcheck::PAGE_FAULT_IN_NONPAGED_AREA,
        fault_address,
        regs.rip,
        regs.error_code,
        0,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_classification() {
        // Write to a not-present user page
        let error = PageFaultError::from_bits_truncate(0x6);
        assert!(!error.contains(PageFaultError::PROTECTION));
        assert!(error.contains(PageFaultError::WRITE));
        assert!(error.contains(PageFaultError::USER));

        // Kernel read protection violation
        let error = PageFaultError::from_bits_truncate(0x1);
        assert!(error.contains(PageFaultError::PROTECTION));
        assert!(!error.contains(PageFaultError::WRITE));
        assert!(!error.contains(PageFaultError::USER));

        // Unknown high bits do not alias known flags
        let error = PageFaultError::from_bits_truncate(0x20);
        assert!(error.is_empty());
    }
}
