//! Page-fault trap registry.
//!
//! A fault trap is a pre-registered recovery point: an instruction that is
//! allowed to fault while probing user memory, paired with the handler the
//! faulting CPU should resume at. The #PF and #GP handlers consult this map
//! before declaring a kernel fault fatal.
//!
//! The registry is created by `late_initialize_virtual_memory` because the
//! map needs the pool allocator.

use alloc::collections::BTreeMap;

use crate::ke::SpinLock;

/// A recovery point for a faulting kernel instruction
#[derive(Debug, Clone, Copy)]
pub struct PageFaultTrap {
    /// Address of the instruction that may fault
    pub instruction_pointer: u64,
    /// Address execution resumes at when it does
    pub handler: u64,
}

static PAGE_FAULT_TRAPS: SpinLock<Option<BTreeMap<u64, PageFaultTrap>>> = SpinLock::new(None);

/// Create the registry. Called once, after the pool allocator works.
pub fn initialize_page_fault_traps() {
    let mut traps = PAGE_FAULT_TRAPS.lock();
    if traps.is_none() {
        *traps = Some(BTreeMap::new());
    }
}

/// Register a recovery point.
pub fn register_page_fault_trap(trap: PageFaultTrap) {
    let mut traps = PAGE_FAULT_TRAPS.lock();
    match traps.as_mut() {
        Some(map) => {
            map.insert(trap.instruction_pointer, trap);
        }
        None => panic!("page fault trap registered before late VM init"),
    }
}

/// Look up the trap registered at `ip`, if any.
pub fn lookup_page_fault_trap(ip: u64) -> Option<PageFaultTrap> {
    let traps = PAGE_FAULT_TRAPS.lock();
    traps.as_ref().and_then(|map| map.get(&ip).copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_deterministic() {
        initialize_page_fault_traps();

        register_page_fault_trap(PageFaultTrap {
            instruction_pointer: 0x1000,
            handler: 0x2000,
        });

        let trap = lookup_page_fault_trap(0x1000).unwrap();
        assert_eq!(trap.handler, 0x2000);
        assert!(lookup_page_fault_trap(0x1001).is_none());

        // Re-registering the same instruction replaces the handler
        register_page_fault_trap(PageFaultTrap {
            instruction_pointer: 0x1000,
            handler: 0x3000,
        });
        assert_eq!(lookup_page_fault_trap(0x1000).unwrap().handler, 0x3000);
    }
}
