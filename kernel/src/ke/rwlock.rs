//! Reader/writer spinlock with explicit release.
//!
//! Mapped regions hand out their lock across function boundaries (the fault
//! handler receives a region with the write side already held), so this lock
//! is guard-less: every acquire has a matching named release.
//!
//! State is a single word: bit 0 is the writer bit, the remaining bits count
//! readers. Writers wait for the reader count to drain; readers wait for the
//! writer bit to clear.

use core::sync::atomic::{AtomicUsize, Ordering};

const WRITER: usize = 0x1;
const READER_UNIT: usize = 0x2;

/// Guard-less reader/writer spinlock
pub struct RwSpinLock {
    state: AtomicUsize,
}

impl RwSpinLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
        }
    }

    /// Acquire the shared (read) side.
    pub fn acquire_read(&self) {
        loop {
            let current = self.state.load(Ordering::Relaxed);
            if current & WRITER == 0 {
                if self
                    .state
                    .compare_exchange_weak(
                        current,
                        current + READER_UNIT,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return;
                }
            }
            core::hint::spin_loop();
        }
    }

    /// Release the shared side.
    pub fn release_read(&self) {
        self.state.fetch_sub(READER_UNIT, Ordering::Release);
    }

    /// Acquire the exclusive (write) side. Blocks new readers while waiting.
    pub fn acquire_write(&self) {
        // Claim the writer bit first so readers stop entering
        loop {
            let current = self.state.load(Ordering::Relaxed);
            if current & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(
                        current,
                        current | WRITER,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                break;
            }
            core::hint::spin_loop();
        }

        // Wait for in-flight readers to drain
        while self.state.load(Ordering::Acquire) != WRITER {
            core::hint::spin_loop();
        }
    }

    /// Try to take the write side without spinning.
    pub fn try_acquire_write(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the exclusive side.
    pub fn release_write(&self) {
        self.state.fetch_and(!WRITER, Ordering::Release);
    }

    /// Whether any holder (reader or writer) is present.
    pub fn is_held(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }
}

impl Default for RwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_exclusion() {
        let lock = RwSpinLock::new();

        lock.acquire_read();
        lock.acquire_read();
        assert!(!lock.try_acquire_write());
        lock.release_read();
        lock.release_read();

        assert!(lock.try_acquire_write());
        assert!(!lock.try_acquire_write());
        lock.release_write();
        assert!(!lock.is_held());
    }
}
