//! Kernel pool allocator.
//!
//! Byte-granular allocation layered strictly above the 4 KiB virtual page
//! allocator: slabs are carved out of `kernel_allocate_4k_pages` ranges with
//! physical blocks attached, then split into power-of-two size classes with
//! intrusive free lists. Requests too big for a class fall through to whole
//! mapped pages.
//!
//! Installed as the `#[global_allocator]`, which makes `alloc` collections
//! usable once `initialize_virtual_memory` has run. Nothing here may be
//! called before that.
//!
//! Lock order: the pool lock may be held while taking the kernel heap
//! directory lock, never the other way around.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::ke::SpinLock;
use crate::mm::kspace::{
    kernel_allocate_4k_pages, kernel_free_4k_pages, kernel_map_virtual_memory_4k,
    virtual_to_physical,
};
use crate::mm::physical::{allocate_physical_memory_block, free_physical_memory_block};
use crate::mm::pte::pte_flags::{PRESENT, WRITABLE};
use crate::mm::pte::PAGE_SIZE_4K;

/// Block sizes served from slabs; anything larger gets whole pages
const SIZE_CLASSES: [usize; 7] = [32, 64, 128, 256, 512, 1024, 2048];

/// Pages added to a class when its free list runs dry
const SLAB_PAGES: u64 = 4;

struct FreeBlock {
    next: *mut FreeBlock,
}

struct SizeClass {
    head: *mut FreeBlock,
    total_blocks: u64,
    free_blocks: u64,
}

impl SizeClass {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            total_blocks: 0,
            free_blocks: 0,
        }
    }
}

struct Pool {
    classes: [SizeClass; SIZE_CLASSES.len()],
}

unsafe impl Send for Pool {}

static POOL: SpinLock<Pool> = SpinLock::new(Pool {
    classes: [const { SizeClass::new() }; SIZE_CLASSES.len()],
});

/// Smallest class able to hold `layout`, if any.
///
/// Blocks are carved at class-size offsets from page-aligned slabs, so a
/// block's alignment equals its class size; picking the class covering both
/// size and alignment satisfies the layout.
fn class_for(layout: Layout) -> Option<usize> {
    let needed = layout.size().max(layout.align());
    SIZE_CLASSES.iter().position(|&size| size >= needed)
}

/// Allocate backed kernel pages: reserve the window, attach fresh frames.
fn allocate_mapped_pages(pages: u64) -> u64 {
    let virt = kernel_allocate_4k_pages(pages);
    for i in 0..pages {
        let phys = allocate_physical_memory_block();
        kernel_map_virtual_memory_4k(phys, virt + i * PAGE_SIZE_4K, 1, PRESENT | WRITABLE);
    }
    virt
}

/// Release pages obtained from [`allocate_mapped_pages`].
fn free_mapped_pages(virt: u64, pages: u64) {
    for i in 0..pages {
        let phys = virtual_to_physical(virt + i * PAGE_SIZE_4K);
        if phys != 0 {
            free_physical_memory_block(phys);
        }
    }
    kernel_free_4k_pages(virt, pages);
}

/// Carve a fresh slab into blocks of `class` and thread them onto its list.
unsafe fn grow_class(pool: &mut Pool, class: usize) {
    let block_size = SIZE_CLASSES[class];
    let slab = allocate_mapped_pages(SLAB_PAGES);
    let count = (SLAB_PAGES * PAGE_SIZE_4K) as usize / block_size;

    let entry = &mut pool.classes[class];
    for i in 0..count {
        let block = (slab as usize + i * block_size) as *mut FreeBlock;
        (*block).next = entry.head;
        entry.head = block;
    }
    entry.total_blocks += count as u64;
    entry.free_blocks += count as u64;
}

unsafe fn pool_allocate(layout: Layout) -> *mut u8 {
    match class_for(layout) {
        Some(class) => {
            let mut pool = POOL.lock();
            if pool.classes[class].head.is_null() {
                grow_class(&mut pool, class);
            }

            let entry = &mut pool.classes[class];
            let block = entry.head;
            entry.head = (*block).next;
            entry.free_blocks -= 1;
            block as *mut u8
        }
        None => {
            if layout.align() as u64 > PAGE_SIZE_4K {
                return ptr::null_mut();
            }
            let pages = (layout.size() as u64).div_ceil(PAGE_SIZE_4K);
            allocate_mapped_pages(pages) as *mut u8
        }
    }
}

unsafe fn pool_free(ptr: *mut u8, layout: Layout) {
    match class_for(layout) {
        Some(class) => {
            let mut pool = POOL.lock();
            let entry = &mut pool.classes[class];
            let block = ptr as *mut FreeBlock;
            (*block).next = entry.head;
            entry.head = block;
            entry.free_blocks += 1;
        }
        None => {
            let pages = (layout.size() as u64).div_ceil(PAGE_SIZE_4K);
            free_mapped_pages(ptr as u64, pages);
        }
    }
}

struct KernelPool;

unsafe impl GlobalAlloc for KernelPool {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        pool_allocate(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        pool_free(ptr, layout)
    }
}

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: KernelPool = KernelPool;

/// Pool usage snapshot
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub block_size: usize,
    pub total_blocks: u64,
    pub free_blocks: u64,
}

/// Usage of one size class.
pub fn pool_stats(class: usize) -> Option<PoolStats> {
    if class >= SIZE_CLASSES.len() {
        return None;
    }
    let pool = POOL.lock();
    Some(PoolStats {
        block_size: SIZE_CLASSES[class],
        total_blocks: pool.classes[class].total_blocks,
        free_blocks: pool.classes[class].free_blocks,
    })
}

/// Number of size classes.
pub fn pool_class_count() -> usize {
    SIZE_CLASSES.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_selection() {
        let layout = |size, align| Layout::from_size_align(size, align).unwrap();

        assert_eq!(class_for(layout(1, 1)), Some(0));
        assert_eq!(class_for(layout(32, 8)), Some(0));
        assert_eq!(class_for(layout(33, 8)), Some(1));
        assert_eq!(class_for(layout(2048, 8)), Some(6));
        assert_eq!(class_for(layout(2049, 8)), None);

        // Alignment can push a small request into a bigger class
        assert_eq!(class_for(layout(16, 256)), Some(3));
    }
}
