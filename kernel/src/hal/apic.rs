//! Local APIC.
//!
//! Just enough of the local APIC for the VM core: end-of-interrupt, and
//! fixed-delivery IPIs for TLB shootdown and halt-on-panic. The register
//! block is reached through the identity-mapped MMIO window, so this must
//! initialize after `initialize_virtual_memory`.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::x86_64::idt::vector;
use crate::mm::kspace;

/// Physical base of the local APIC register block
const APIC_BASE_PHYS: u64 = 0xFEE0_0000;

/// Register offsets
mod reg {
    pub const ID: u64 = 0x20;
    pub const EOI: u64 = 0xB0;
    pub const SPURIOUS: u64 = 0xF0;
    pub const ICR_LOW: u64 = 0x300;
    pub const ICR_HIGH: u64 = 0x310;
}

/// ICR delivery modes
#[derive(Debug, Clone, Copy)]
#[repr(u32)]
pub enum IpiDeliveryMode {
    Fixed = 0,
    Nmi = 4,
    Init = 5,
    Startup = 6,
}

/// ICR destination shorthands
#[derive(Debug, Clone, Copy)]
#[repr(u32)]
pub enum IpiDestination {
    Targeted = 0,
    SelfOnly = 1,
    AllIncludingSelf = 2,
    AllExcludingSelf = 3,
}

/// Local APIC accessor
pub struct LocalApic {
    base: u64,
}

impl LocalApic {
    fn read(&self, offset: u64) -> u32 {
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&self, offset: u64, value: u32) {
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    /// APIC ID of the executing CPU.
    pub fn id(&self) -> u32 {
        self.read(reg::ID) >> 24
    }

    /// Signal end-of-interrupt.
    pub fn eoi(&self) {
        self.write(reg::EOI, 0);
    }

    /// Software-enable the APIC and route spurious interrupts.
    fn enable(&self) {
        self.write(reg::SPURIOUS, 0x100 | vector::SPURIOUS as u32);
    }

    /// Send an IPI.
    pub fn send_ipi(
        &self,
        dest_apic_id: u8,
        vector: u8,
        delivery_mode: IpiDeliveryMode,
        dest_shorthand: IpiDestination,
    ) {
        // vector | delivery mode | assert | shorthand; writing the low half
        // triggers delivery
        let icr_low: u32 = (vector as u32)
            | ((delivery_mode as u32) << 8)
            | (1 << 14)
            | ((dest_shorthand as u32) << 18);
        let icr_high: u32 = (dest_apic_id as u32) << 24;

        self.write(reg::ICR_HIGH, icr_high);
        self.write(reg::ICR_LOW, icr_low);
    }

    /// Fixed IPI to every CPU but this one.
    pub fn broadcast_ipi(&self, vector: u8) {
        self.send_ipi(0, vector, IpiDeliveryMode::Fixed, IpiDestination::AllExcludingSelf);
    }
}

static mut LOCAL_APIC: Option<LocalApic> = None;

/// CPUs known to be running (boot CPU included)
static ACTIVE_CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Map and enable the boot CPU's local APIC.
pub fn init() {
    let base = kspace::get_io_mapping(APIC_BASE_PHYS);
    let apic = LocalApic { base };
    apic.enable();

    log::info!("local APIC at {:#x}, id {}", base, apic.id());

    unsafe {
        LOCAL_APIC = Some(apic);
    }
}

fn get() -> Option<&'static LocalApic> {
    unsafe { LOCAL_APIC.as_ref() }
}

/// Signal end-of-interrupt on the executing CPU.
pub fn eoi() {
    if let Some(apic) = get() {
        apic.eoi();
    }
}

/// APIC ID of the executing CPU (0 before init).
pub fn current_cpu_id() -> u32 {
    get().map(|apic| apic.id()).unwrap_or(0)
}

/// Fixed IPI to every CPU but this one.
pub fn broadcast_ipi(vector: u8) {
    if let Some(apic) = get() {
        apic.broadcast_ipi(vector);
    }
}

/// Stop every other CPU; used on the way into a kernel panic.
pub fn halt_other_cpus() {
    if active_cpu_count() > 1 {
        broadcast_ipi(vector::IPI_HALT);
    }
}

/// Record an application processor coming online.
pub fn register_application_processor() {
    ACTIVE_CPU_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// Number of CPUs currently online.
pub fn active_cpu_count() -> u32 {
    ACTIVE_CPU_COUNT.load(Ordering::SeqCst)
}
