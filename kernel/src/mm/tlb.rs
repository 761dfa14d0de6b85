//! Cross-CPU TLB invalidation.
//!
//! When one CPU rewrites a page-table entry, other CPUs may keep stale
//! translations until their next CR3 reload. Shootdown closes that window:
//!
//! 1. The initiator serializes on the initiator lock and publishes a request.
//! 2. It invalidates its own TLB, then broadcasts the shootdown IPI.
//! 3. Each target performs the invalidation and increments the ack counter.
//! 4. The initiator spins until every target acknowledged (bounded).
//!
//! The request is published through atomics, never a lock: the initiator
//! holds the initiator lock while it waits, and the IPI handler must be able
//! to read the request and ack without acquiring anything.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::hal::apic;
use crate::ke::SpinLock;
use crate::mm::pte::{self, PAGE_SIZE_4K};

pub use crate::arch::x86_64::idt::vector::TLB_SHOOTDOWN as TLB_SHOOTDOWN_VECTOR;

/// Ranges longer than this are collapsed into a full flush
const FULL_FLUSH_THRESHOLD_PAGES: u64 = 256;

/// How long the initiator spins for acknowledgements before giving up
const ACK_TIMEOUT_SPINS: u32 = 1_000_000;

/// Kind of invalidation requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TlbInvalidationType {
    SinglePage = 0,
    Range = 1,
    Full = 2,
}

/// Published shootdown request, read lock-free from the IPI handler
struct ShootdownRequest {
    invalidation_type: AtomicU64,
    address: AtomicU64,
    end_address: AtomicU64,
    ack_count: AtomicU32,
}

static REQUEST: ShootdownRequest = ShootdownRequest {
    invalidation_type: AtomicU64::new(TlbInvalidationType::Full as u64),
    address: AtomicU64::new(0),
    end_address: AtomicU64::new(0),
    ack_count: AtomicU32::new(0),
};

/// Serializes initiators; never taken from interrupt context
static INITIATOR_LOCK: SpinLock<()> = SpinLock::new(());

static SHOOTDOWN_COUNT: AtomicU64 = AtomicU64::new(0);

fn invalidate_local(invalidation_type: TlbInvalidationType, address: u64, end_address: u64) {
    match invalidation_type {
        TlbInvalidationType::SinglePage => pte::invlpg(address),
        TlbInvalidationType::Range => {
            let mut addr = address;
            while addr < end_address {
                pte::invlpg(addr);
                addr += PAGE_SIZE_4K;
            }
        }
        TlbInvalidationType::Full => pte::flush_tlb_local(),
    }
}

fn broadcast(invalidation_type: TlbInvalidationType, address: u64, end_address: u64) {
    if apic::active_cpu_count() <= 1 {
        invalidate_local(invalidation_type, address, end_address);
        return;
    }

    let guard = INITIATOR_LOCK.lock();

    REQUEST
        .invalidation_type
        .store(invalidation_type as u64, Ordering::Relaxed);
    REQUEST.address.store(address, Ordering::Relaxed);
    REQUEST.end_address.store(end_address, Ordering::Relaxed);
    REQUEST.ack_count.store(0, Ordering::Release);

    invalidate_local(invalidation_type, address, end_address);

    let targets = apic::active_cpu_count() - 1;
    apic::broadcast_ipi(TLB_SHOOTDOWN_VECTOR);

    let mut spins = 0u32;
    while REQUEST.ack_count.load(Ordering::Acquire) < targets {
        core::hint::spin_loop();
        spins += 1;
        if spins >= ACK_TIMEOUT_SPINS {
            log::error!(
                "TLB shootdown timeout: {} of {} acks",
                REQUEST.ack_count.load(Ordering::Acquire),
                targets
            );
            break;
        }
    }

    SHOOTDOWN_COUNT.fetch_add(1, Ordering::Relaxed);
    drop(guard);
}

/// Invalidate one page on every CPU.
pub fn tlb_shootdown_single_page(virt: u64) {
    broadcast(TlbInvalidationType::SinglePage, virt, virt + PAGE_SIZE_4K);
}

/// Invalidate a page range on every CPU. Long ranges become a full flush.
pub fn tlb_shootdown_range(start: u64, end: u64) {
    let pages = (end.saturating_sub(start)) / PAGE_SIZE_4K;
    if pages > FULL_FLUSH_THRESHOLD_PAGES {
        tlb_shootdown_all();
    } else {
        broadcast(TlbInvalidationType::Range, start, end);
    }
}

/// Flush the whole TLB on every CPU.
pub fn tlb_shootdown_all() {
    broadcast(TlbInvalidationType::Full, 0, 0);
}

/// IPI handler body: perform the published invalidation and acknowledge.
///
/// Runs in interrupt context; reads the request lock-free.
pub fn tlb_shootdown_handler() {
    let invalidation_type = match REQUEST.invalidation_type.load(Ordering::Relaxed) {
        0 => TlbInvalidationType::SinglePage,
        1 => TlbInvalidationType::Range,
        _ => TlbInvalidationType::Full,
    };
    let address = REQUEST.address.load(Ordering::Relaxed);
    let end_address = REQUEST.end_address.load(Ordering::Relaxed);

    invalidate_local(invalidation_type, address, end_address);

    REQUEST.ack_count.fetch_add(1, Ordering::Release);
    apic::eoi();
}

/// Completed shootdown operations since boot.
pub fn shootdown_count() -> u64 {
    SHOOTDOWN_COUNT.load(Ordering::Relaxed)
}
