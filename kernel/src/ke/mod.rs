//! Kernel support: synchronization primitives and fatal-error machinery.

pub mod bugcheck;
pub mod debug;
pub mod rwlock;
pub mod spinlock;

pub use rwlock::RwSpinLock;
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
