//! Kernel spinlocks.
//!
//! Spinlocks provide mutual exclusion for short critical sections. The
//! guarded form disables interrupts while held, so it is safe to take from
//! interrupt handlers; the raw form has explicit acquire/release and a
//! non-blocking test acquire for code whose lock lifetime does not nest
//! in a single scope (the fault handler's thread lock, for one).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spinlock protecting a value of type `T`
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, returning a guard that releases on drop.
    ///
    /// Interrupts are disabled for the lifetime of the guard so an interrupt
    /// handler on this CPU cannot deadlock against us.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let interrupts_were_enabled = disable_interrupts();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        SpinLockGuard {
            lock: self,
            interrupts_were_enabled,
        }
    }

    /// Try to acquire the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let interrupts_were_enabled = disable_interrupts();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard {
                lock: self,
                interrupts_were_enabled,
            })
        } else {
            if interrupts_were_enabled {
                enable_interrupts();
            }
            None
        }
    }

    /// Check whether the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// RAII guard for [`SpinLock`]
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    interrupts_were_enabled: bool,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        if self.interrupts_were_enabled {
            enable_interrupts();
        }
    }
}

/// A guard-less spinlock with explicit acquire/release.
///
/// Does not touch the interrupt flag; callers manage their own interrupt
/// discipline. Release must happen on every path that acquired.
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Spin until the lock is acquired.
    #[inline]
    pub fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Single acquisition attempt. Returns `true` if the lock was taken.
    #[inline]
    pub fn acquire_test(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release a held lock.
    #[inline]
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Disable interrupts, returning whether they were enabled.
#[cfg(not(test))]
#[inline]
fn disable_interrupts() -> bool {
    let flags: u64;
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {0}",
            "cli",
            out(reg) flags,
            options(nomem, preserves_flags)
        );
    }
    // IF is bit 9 of RFLAGS
    (flags & (1 << 9)) != 0
}

#[cfg(not(test))]
#[inline]
fn enable_interrupts() {
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

// The interrupt flag is privileged state; host-side tests run the lock
// protocol without touching it.
#[cfg(test)]
#[inline]
fn disable_interrupts() -> bool {
    false
}

#[cfg(test)]
#[inline]
fn enable_interrupts() {}
