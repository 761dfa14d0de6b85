//! User memory primitives.
//!
//! Kernel code must assume every user pointer can fault. These routines put
//! the single instruction that touches user memory at an exported label and
//! pair it with a recovery label; `late_initialize_virtual_memory` registers
//! the pairs in the fault-trap registry. When the touch faults, the #PF
//! handler rewrites `rip` to the recovery label, which makes the routine
//! return its failure value instead of taking the kernel down.
//!
//! The loop in `user_strlen` jumps back through its trap label so every
//! probe executes at the registered address.

use crate::mm::address_space::AddressSpace;
use crate::mm::trap::{register_page_fault_trap, PageFaultTrap};

core::arch::global_asm!(
    r#"
.section .text

.global user_memcpy_raw
.global user_memcpy_trap
.global user_memcpy_trap_handler
user_memcpy_raw:
    mov rcx, rdx
user_memcpy_trap:
    rep movsb
    xor eax, eax
    ret
user_memcpy_trap_handler:
    mov eax, 1
    ret

.global user_strlen_raw
.global user_strlen_trap
.global user_strlen_trap_handler
user_strlen_raw:
    xor eax, eax
user_strlen_trap:
    cmp byte ptr [rdi + rax], 0
    je 2f
    inc rax
    jmp user_strlen_trap
2:
    ret
user_strlen_trap_handler:
    mov rax, -1
    ret

.global user_memset_raw
.global user_memset_trap
.global user_memset_trap_handler
user_memset_raw:
    mov rcx, rdx
    mov eax, esi
user_memset_trap:
    rep stosb
    xor eax, eax
    ret
user_memset_trap_handler:
    mov eax, 1
    ret
"#
);

extern "C" {
    fn user_memcpy_raw(dest: *mut u8, src: *const u8, count: usize) -> u64;
    fn user_strlen_raw(ptr: *const u8) -> i64;
    fn user_memset_raw(dest: *mut u8, value: u32, count: usize) -> u64;

    static user_memcpy_trap: [u8; 0];
    static user_memcpy_trap_handler: [u8; 0];
    static user_strlen_trap: [u8; 0];
    static user_strlen_trap_handler: [u8; 0];
    static user_memset_trap: [u8; 0];
    static user_memset_trap_handler: [u8; 0];
}

/// Copy between kernel and user memory.
///
/// `Err` means a page of the transfer faulted unrecoverably; a prefix of
/// the copy may have been written.
///
/// # Safety
/// `dest` and `src` must be valid for the kernel sides of the transfer; the
/// user side is what the trap protects.
pub unsafe fn user_memcpy(dest: *mut u8, src: *const u8, count: usize) -> Result<(), ()> {
    if user_memcpy_raw(dest, src, count) == 0 {
        Ok(())
    } else {
        Err(())
    }
}

/// Length of a NUL-terminated user string, or `None` if the scan faulted.
///
/// # Safety
/// `ptr` is probed byte by byte; no requirements beyond being a user pointer.
pub unsafe fn user_strlen(ptr: *const u8) -> Option<usize> {
    match user_strlen_raw(ptr) {
        len if len >= 0 => Some(len as usize),
        _ => None,
    }
}

/// Fill user memory with `value`.
///
/// # Safety
/// See [`user_memcpy`].
pub unsafe fn user_memset(dest: *mut u8, value: u8, count: usize) -> Result<(), ()> {
    if user_memset_raw(dest, value as u32, count) == 0 {
        Ok(())
    } else {
        Err(())
    }
}

/// Fine-grained user-range check: the range must lie inside a mapped region
/// of the address space.
pub fn check_usermode_pointer(addr: u64, len: u64, address_space: &AddressSpace) -> bool {
    address_space.range_in_region(addr, len)
}

/// Register the three primitives' recovery points. Part of late VM init.
pub fn register_user_memory_traps() {
    let traps = unsafe {
        [
            (user_memcpy_trap.as_ptr(), user_memcpy_trap_handler.as_ptr()),
            (user_strlen_trap.as_ptr(), user_strlen_trap_handler.as_ptr()),
            (user_memset_trap.as_ptr(), user_memset_trap_handler.as_ptr()),
        ]
    };

    for (instruction, handler) in traps {
        register_page_fault_trap(PageFaultTrap {
            instruction_pointer: instruction as u64,
            handler: handler as u64,
        });
    }
}
