//! Interrupt Descriptor Table and exception dispatch.
//!
//! Exceptions the VM core cares about (#GP, #PF) are routed through a
//! registration table so `mm` can install its handlers at init without this
//! module knowing about paging. A registered handler receives a mutable
//! [`TrapFrame`]; if it rewrites `rip` the change is written back to the real
//! interrupt frame, which is how fault traps redirect execution.
//!
//! Everything unhandled funnels into [`handle_fatal_interrupt`].

use spin::Lazy;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::VirtAddr;

use crate::ke::bugcheck;

/// Interrupt vector numbers
pub mod vector {
    pub const GENERAL_PROTECTION: u8 = 13;
    pub const PAGE_FAULT: u8 = 14;
    // SMP IPIs (high vectors)
    pub const IPI_HALT: u8 = 0xFC;
    pub const TLB_SHOOTDOWN: u8 = 0xFE;
    pub const SPURIOUS: u8 = 0xFF;
}

/// Snapshot of the interrupted context handed to registered handlers.
///
/// `rip` is read/write: rewriting it redirects the interrupted CPU on return.
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub error_code: u64,
    /// RBP at handler entry, the root of a frame-pointer walk
    pub frame_pointer: u64,
}

impl TrapFrame {
    /// Whether the fault came from ring 3.
    #[inline]
    pub fn is_user_mode(&self) -> bool {
        self.cs & 0x3 != 0
    }
}

/// A registered exception handler
pub type InterruptHandler = fn(&mut TrapFrame);

/// Handler registration table. Written only during single-threaded phase-0
/// init, read from interrupt context afterwards.
static mut HANDLERS: [Option<InterruptHandler>; 256] = [None; 256];

/// Install a handler for `vector`. Phase-0 init only.
pub fn register_interrupt_handler(vector: u8, handler: InterruptHandler) {
    unsafe {
        HANDLERS[vector as usize] = Some(handler);
    }
}

static IDT: Lazy<InterruptDescriptorTable> = Lazy::new(|| {
    let mut idt = InterruptDescriptorTable::new();

    idt.divide_error.set_handler_fn(divide_error_handler);
    idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
    idt.double_fault.set_handler_fn(double_fault_handler);
    idt.general_protection_fault
        .set_handler_fn(general_protection_fault_handler);
    idt.page_fault.set_handler_fn(page_fault_handler);

    idt[vector::IPI_HALT].set_handler_fn(ipi_halt_handler);
    idt[vector::TLB_SHOOTDOWN].set_handler_fn(tlb_shootdown_ipi_handler);
    idt[vector::SPURIOUS].set_handler_fn(spurious_interrupt_handler);

    idt
});

/// Load the IDT on the calling CPU.
pub fn init() {
    IDT.load();
}

/// Terminal path for interrupts nothing claimed.
pub fn handle_fatal_interrupt(vector: u8, frame: &TrapFrame) -> ! {
    log::error!(
        "fatal interrupt {} ({}) rip={:#x} cs={:#x} rflags={:#x} rsp={:#x} err={:#x}",
        vector,
        vector_name(vector),
        frame.rip,
        frame.cs,
        frame.rflags,
        frame.rsp,
        frame.error_code
    );
    bugcheck::bugcheck(
        bugcheck::UNEXPECTED_KERNEL_MODE_TRAP,
        vector as u64,
        frame.rip,
        frame.error_code,
        0,
    );
}

fn vector_name(vector: u8) -> &'static str {
    match vector {
        0 => "divide error",
        6 => "invalid opcode",
        8 => "double fault",
        13 => "general protection fault",
        14 => "page fault",
        _ => "unknown",
    }
}

/// RBP of the current frame.
#[inline(always)]
fn frame_pointer() -> u64 {
    let rbp: u64;
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack, preserves_flags));
    }
    rbp
}

/// Build a [`TrapFrame`], run the registered handler, and write any `rip`
/// redirect back into the hardware frame.
fn dispatch(stack_frame: &mut InterruptStackFrame, vector: u8, error_code: u64) {
    let mut frame = TrapFrame {
        rip: stack_frame.instruction_pointer.as_u64(),
        cs: stack_frame.code_segment.0 as u64,
        rflags: stack_frame.cpu_flags.bits(),
        rsp: stack_frame.stack_pointer.as_u64(),
        ss: stack_frame.stack_segment.0 as u64,
        error_code,
        frame_pointer: frame_pointer(),
    };
    let entry_rip = frame.rip;

    let handler = unsafe { HANDLERS[vector as usize] };
    match handler {
        Some(handler) => {
            handler(&mut frame);
            if frame.rip != entry_rip {
                unsafe {
                    stack_frame.as_mut().update(|value| {
                        value.instruction_pointer = VirtAddr::new(frame.rip);
                    });
                }
            }
        }
        None => handle_fatal_interrupt(vector, &frame),
    }
}

// Exception handlers

extern "x86-interrupt" fn divide_error_handler(mut stack_frame: InterruptStackFrame) {
    dispatch(&mut stack_frame, 0, 0);
}

extern "x86-interrupt" fn invalid_opcode_handler(mut stack_frame: InterruptStackFrame) {
    dispatch(&mut stack_frame, 6, 0);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    let frame = TrapFrame {
        rip: stack_frame.instruction_pointer.as_u64(),
        cs: stack_frame.code_segment.0 as u64,
        rflags: stack_frame.cpu_flags.bits(),
        rsp: stack_frame.stack_pointer.as_u64(),
        ss: stack_frame.stack_segment.0 as u64,
        error_code,
        frame_pointer: frame_pointer(),
    };
    handle_fatal_interrupt(8, &frame)
}

extern "x86-interrupt" fn general_protection_fault_handler(
    mut stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    dispatch(&mut stack_frame, vector::GENERAL_PROTECTION, error_code);
}

extern "x86-interrupt" fn page_fault_handler(
    mut stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    dispatch(&mut stack_frame, vector::PAGE_FAULT, error_code.bits());
}

// IPI handlers

extern "x86-interrupt" fn ipi_halt_handler(_stack_frame: InterruptStackFrame) {
    // Another CPU is going down with a panic; stop quietly
    crate::arch::disable_interrupts();
    loop {
        crate::arch::halt();
    }
}

extern "x86-interrupt" fn tlb_shootdown_ipi_handler(_stack_frame: InterruptStackFrame) {
    crate::mm::tlb::tlb_shootdown_handler();
}

extern "x86-interrupt" fn spurious_interrupt_handler(_stack_frame: InterruptStackFrame) {}
