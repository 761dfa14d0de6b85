//! Virtual memory objects.
//!
//! A [`VmObject`] is the source of physical backing for a mapped region.
//! Regions hold them by reference; the `ref_count` says how many address
//! spaces can currently reach the object and is what the copy-on-write
//! fault path consults to decide between privatizing and cloning.
//!
//! Backings:
//! - **Anonymous**: zero-fill pages allocated lazily on first touch. The
//!   only backing that participates in copy-on-write.
//! - **Physical**: a fixed physical range (device memory), mapped
//!   cache-disabled and never copied.
//!
//! Mutation happens under the owning region's write lock; the interior lock
//! on the block list is the last line of defense, not the protocol.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::ke::SpinLock;
use crate::mm::kspace::with_mapped_block;
use crate::mm::page_map::{map_virtual_memory_4k, PageMap};
use crate::mm::physical::{allocate_physical_memory_block, free_physical_memory_block};
use crate::mm::pte::pte_flags::{CACHE_DISABLED, PRESENT, USER, WRITABLE};
use crate::mm::pte::PAGE_SIZE_4K;

enum VmObjectBacking {
    /// Lazily allocated zero-fill pages; 0 means not yet allocated
    Anonymous { blocks: Vec<u64> },
    /// Fixed physical range, typically MMIO
    Physical { base: u64 },
}

/// Reference-counted backing object for a mapped region
pub struct VmObject {
    size: u64,
    /// Writes fault and privatize/clone while set
    copy_on_write: AtomicBool,
    /// May be shared across forks without copy-on-write
    shared: bool,
    /// Address spaces able to reach this object
    pub ref_count: AtomicU32,
    backing: SpinLock<VmObjectBacking>,
}

impl VmObject {
    /// Anonymous zero-fill memory of `size` bytes (rounded up to pages).
    pub fn new_anonymous(size: u64) -> Self {
        let pages = size.div_ceil(PAGE_SIZE_4K) as usize;
        Self {
            size: pages as u64 * PAGE_SIZE_4K,
            copy_on_write: AtomicBool::new(false),
            shared: false,
            ref_count: AtomicU32::new(1),
            backing: SpinLock::new(VmObjectBacking::Anonymous {
                blocks: vec![0; pages],
            }),
        }
    }

    /// Anonymous memory shared across forks (no copy-on-write marking).
    pub fn new_shared(size: u64) -> Self {
        let mut object = Self::new_anonymous(size);
        object.shared = true;
        object
    }

    /// A fixed physical range of `size` bytes at `base`.
    pub fn new_physical(base: u64, size: u64) -> Self {
        Self {
            size: size.div_ceil(PAGE_SIZE_4K) * PAGE_SIZE_4K,
            copy_on_write: AtomicBool::new(false),
            shared: true,
            ref_count: AtomicU32::new(1),
            backing: SpinLock::new(VmObjectBacking::Physical { base }),
        }
    }

    /// Size in bytes (page-granular).
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_copy_on_write(&self) -> bool {
        self.copy_on_write.load(Ordering::Acquire)
    }

    pub fn set_copy_on_write(&self, value: bool) {
        self.copy_on_write.store(value, Ordering::Release);
    }

    /// Whether forks share this object instead of marking it copy-on-write.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release_ref(&self) -> u32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// PT entry flags for this object's pages in its current state.
    fn mapping_flags(&self) -> u64 {
        let mut flags = PRESENT | USER;
        if !self.is_copy_on_write() {
            flags |= WRITABLE;
        }
        if matches!(&*self.backing.lock(), VmObjectBacking::Physical { .. }) {
            flags |= CACHE_DISABLED;
        }
        flags
    }

    /// Ensure the page containing `offset` is backed and mapped at
    /// `base + offset`'s page in `page_map`.
    ///
    /// Called from the fault path under the region write lock. `Err` means
    /// the offset is outside the object, which the fault handler treats as
    /// fatal.
    pub fn hit(&self, base: u64, offset: u64, page_map: &PageMap) -> Result<(), ()> {
        if offset >= self.size {
            return Err(());
        }

        let page = (offset / PAGE_SIZE_4K) as usize;
        let flags = self.mapping_flags();
        let mut backing = self.backing.lock();

        let phys = match &mut *backing {
            VmObjectBacking::Anonymous { blocks } => {
                if blocks[page] == 0 {
                    let phys = allocate_physical_memory_block();
                    with_mapped_block(phys, |block| unsafe {
                        core::ptr::write_bytes(block, 0, PAGE_SIZE_4K as usize);
                    });
                    blocks[page] = phys;
                }
                blocks[page]
            }
            VmObjectBacking::Physical { base } => *base + page as u64 * PAGE_SIZE_4K,
        };

        unsafe {
            map_virtual_memory_4k(phys, base + page as u64 * PAGE_SIZE_4K, 1, flags, page_map);
        }
        Ok(())
    }

    /// Install every already-allocated page into `page_map` at `base`, with
    /// flags matching the current copy-on-write state. Used after a fork
    /// (read-only) and after privatization (writable again).
    pub fn map_allocated_blocks(&self, base: u64, page_map: &PageMap) {
        let flags = self.mapping_flags();
        let backing = self.backing.lock();

        match &*backing {
            VmObjectBacking::Anonymous { blocks } => {
                for (page, &phys) in blocks.iter().enumerate() {
                    if phys != 0 {
                        unsafe {
                            map_virtual_memory_4k(
                                phys,
                                base + page as u64 * PAGE_SIZE_4K,
                                1,
                                flags,
                                page_map,
                            );
                        }
                    }
                }
            }
            VmObjectBacking::Physical { base: phys_base } => unsafe {
                map_virtual_memory_4k(
                    *phys_base,
                    base,
                    self.size / PAGE_SIZE_4K,
                    flags,
                    page_map,
                );
            },
        }
    }

    /// Produce a private copy for a diverging copy-on-write region.
    ///
    /// Anonymous backings are deep-copied page by page; physical backings
    /// reference the same range (device memory has no private copy to make).
    /// The clone starts with one reference and copy-on-write clear.
    pub fn clone_object(&self) -> VmObject {
        let backing = self.backing.lock();

        let new_backing = match &*backing {
            VmObjectBacking::Anonymous { blocks } => {
                let mut new_blocks = vec![0u64; blocks.len()];
                for (page, &phys) in blocks.iter().enumerate() {
                    if phys == 0 {
                        continue;
                    }
                    let copy = allocate_physical_memory_block();
                    with_mapped_block(phys, |src| {
                        with_mapped_block(copy, |dst| unsafe {
                            core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE_4K as usize);
                        });
                    });
                    new_blocks[page] = copy;
                }
                VmObjectBacking::Anonymous { blocks: new_blocks }
            }
            VmObjectBacking::Physical { base } => VmObjectBacking::Physical { base: *base },
        };

        VmObject {
            size: self.size,
            copy_on_write: AtomicBool::new(false),
            shared: self.shared,
            ref_count: AtomicU32::new(1),
            backing: SpinLock::new(new_backing),
        }
    }

    /// Return every private page to the physical allocator. Called when the
    /// last reference goes away.
    fn release_blocks(&self) {
        let mut backing = self.backing.lock();
        if let VmObjectBacking::Anonymous { blocks } = &mut *backing {
            for phys in blocks.iter_mut() {
                if *phys != 0 {
                    free_physical_memory_block(*phys);
                    *phys = 0;
                }
            }
        }
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        self.release_blocks();
    }
}
