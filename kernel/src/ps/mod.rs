//! Process and thread model.
//!
//! The slice of a process manager the VM core needs: a current thread with a
//! lifecycle lock and a zombie state, and a current process owning an
//! address space. Scheduling policy lives above this layer; [`yield_now`]
//! is the only scheduling primitive consumed here.

pub mod process;
pub mod thread;

pub use process::{current_process, set_current_process, Process};
pub use thread::{current_thread, set_current_thread, Thread, ThreadState};

use core::sync::atomic::{AtomicPtr, Ordering};

static BOOT_THREAD: Thread = Thread::new(0);

static CURRENT_THREAD: AtomicPtr<Thread> = AtomicPtr::new(core::ptr::null_mut());
static CURRENT_PROCESS: AtomicPtr<Process> = AtomicPtr::new(core::ptr::null_mut());

/// Install the boot thread as current. Phase-0 init.
pub fn init() {
    CURRENT_THREAD.store(
        &BOOT_THREAD as *const Thread as *mut Thread,
        Ordering::SeqCst,
    );
}

/// Give up the CPU. Without a scheduler below us this just waits for the
/// next interrupt, which is all the zombie spin and `Process::die` need.
pub fn yield_now() {
    crate::arch::halt();
}
