//! Processes.

use alloc::string::String;
use core::sync::atomic::Ordering;

use crate::mm::address_space::AddressSpace;
use crate::ps::thread::ThreadState;

/// A process: a pid, a name for diagnostics, and an address space
pub struct Process {
    pub pid: u64,
    pub name: String,
    pub address_space: AddressSpace,
}

impl Process {
    pub fn new(pid: u64, name: String) -> Self {
        Self {
            pid,
            name,
            address_space: AddressSpace::new(),
        }
    }

    /// Terminate the current process after an unrecoverable fault.
    ///
    /// Marks the executing thread zombie and parks it; the reaper above this
    /// layer reclaims the process (and with it the address space) later.
    pub fn die(&self) -> ! {
        log::info!("process {} (pid {}) terminated", self.name, self.pid);

        if let Some(thread) = super::current_thread() {
            thread.set_state(ThreadState::Zombie);
        }

        crate::arch::enable_interrupts();
        loop {
            super::yield_now();
        }
    }
}

/// The process owning the thread on this CPU, if any.
pub fn current_process() -> Option<&'static Process> {
    let ptr = super::CURRENT_PROCESS.load(Ordering::Acquire);
    unsafe { ptr.as_ref() }
}

/// Install the running process. Scheduler interface.
///
/// # Safety
/// `process` must outlive its tenure as current.
pub unsafe fn set_current_process(process: *mut Process) {
    super::CURRENT_PROCESS.store(process, Ordering::Release);
}
