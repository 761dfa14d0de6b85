//! Kernel threads.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::ke::RawSpinLock;

/// Thread lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadState {
    Running = 0,
    Ready = 1,
    Blocked = 2,
    /// Terminated but not yet reaped; a zombie thread that faults must not
    /// touch its own locks
    Zombie = 3,
}

/// A thread of execution
pub struct Thread {
    pub id: u64,
    state: AtomicU32,
    /// Held while the thread's lifecycle is being changed. The fault handler
    /// test-acquires this: failure means the thread is mid-teardown.
    pub kernel_lock: RawSpinLock,
}

impl Thread {
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            state: AtomicU32::new(ThreadState::Running as u32),
            kernel_lock: RawSpinLock::new(),
        }
    }

    pub fn state(&self) -> ThreadState {
        match self.state.load(Ordering::Acquire) {
            0 => ThreadState::Running,
            1 => ThreadState::Ready,
            2 => ThreadState::Blocked,
            _ => ThreadState::Zombie,
        }
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u32, Ordering::Release);
    }
}

/// The thread running on this CPU, if the scheduler has installed one.
pub fn current_thread() -> Option<&'static Thread> {
    let ptr = super::CURRENT_THREAD.load(Ordering::Acquire);
    unsafe { ptr.as_ref() }
}

/// Install the running thread. Scheduler interface.
///
/// # Safety
/// `thread` must outlive its tenure as current.
pub unsafe fn set_current_thread(thread: *mut Thread) {
    super::CURRENT_THREAD.store(thread, Ordering::Release);
}
