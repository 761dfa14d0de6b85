//! Physical memory block allocator.
//!
//! A bitmap allocator handing out 4 KiB blocks. One bit per block, set when
//! the block is in use. The map is seeded from the bootloader's memory map;
//! everything starts reserved and only regions reported usable are released.
//!
//! Block 0 is never handed out: a zero physical address doubles as "no frame"
//! in page-map bookkeeping, and the low 64 KiB hold firmware structures the
//! SMP trampoline still needs.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::ke::SpinLock;
use crate::BootInfo;

/// Size of one physical block
pub const PHYSALLOC_BLOCK_SIZE: u64 = 4096;

/// Maximum physical memory tracked by the bitmap (16 GiB)
const MAX_PHYSICAL_MEMORY: u64 = 16 * 1024 * 1024 * 1024;

/// Number of tracked blocks
const BLOCK_COUNT: usize = (MAX_PHYSICAL_MEMORY / PHYSALLOC_BLOCK_SIZE) as usize;

/// Bitmap words (64 blocks per word)
const BITMAP_WORDS: usize = BLOCK_COUNT / 64;

struct BlockBitmap {
    words: [u64; BITMAP_WORDS],
    /// Scan start hint: no free block exists below this index
    first_free_hint: usize,
}

static BITMAP: SpinLock<BlockBitmap> = SpinLock::new(BlockBitmap {
    words: [u64::MAX; BITMAP_WORDS],
    first_free_hint: 0,
});

static USED_BLOCKS: AtomicU64 = AtomicU64::new(0);
static TOTAL_BLOCKS: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// Bitmap primitives
// ============================================================================

#[inline]
fn bit_set(words: &mut [u64], index: usize) {
    words[index / 64] |= 1 << (index % 64);
}

#[inline]
fn bit_clear(words: &mut [u64], index: usize) {
    words[index / 64] &= !(1 << (index % 64));
}

#[inline]
fn bit_test(words: &[u64], index: usize) -> bool {
    (words[index / 64] & (1 << (index % 64))) != 0
}

/// First clear bit at or after `start`, or `None` if the map is full.
fn find_first_free(words: &[u64], start: usize) -> Option<usize> {
    if start >= words.len() * 64 {
        return None;
    }

    let mut word_index = start / 64;
    // Bits below `start` in the first word count as used
    let mut word = words[word_index] | ((1u64 << (start % 64)) - 1);
    loop {
        if word != u64::MAX {
            return Some(word_index * 64 + (!word).trailing_zeros() as usize);
        }
        word_index += 1;
        if word_index >= words.len() {
            return None;
        }
        word = words[word_index];
    }
}

// ============================================================================
// Public interface
// ============================================================================

/// Seed the bitmap from the boot memory map.
pub fn initialize_physical_allocator(boot_info: &BootInfo) {
    let mut bitmap = BITMAP.lock();
    let mut total = 0u64;

    for region in boot_info.memory_regions() {
        if !region.usable {
            continue;
        }
        let first = region.base / PHYSALLOC_BLOCK_SIZE;
        let count = region.page_count;
        for block in first..first + count {
            if block as usize >= BLOCK_COUNT {
                break;
            }
            // Keep the reserved low block out of circulation
            if block * PHYSALLOC_BLOCK_SIZE < PHYSALLOC_BLOCK_SIZE {
                continue;
            }
            bit_clear(&mut bitmap.words, block as usize);
            total += 1;
        }
    }

    bitmap.first_free_hint = 0;
    TOTAL_BLOCKS.store(total, Ordering::Relaxed);
    USED_BLOCKS.store(0, Ordering::Relaxed);

    log::info!(
        "physical memory: {} MB usable",
        total * PHYSALLOC_BLOCK_SIZE / (1024 * 1024)
    );
}

/// Allocate one 4 KiB physical block.
///
/// Panics when physical memory is exhausted; the VM core has no path for
/// reporting allocation failure upward.
pub fn allocate_physical_memory_block() -> u64 {
    let mut bitmap = BITMAP.lock();

    let hint = bitmap.first_free_hint;
    let index = match find_first_free(&bitmap.words, hint) {
        Some(index) => index,
        None => {
            drop(bitmap);
            panic!(
                "Out of physical memory ({} KB in use)",
                USED_BLOCKS.load(Ordering::Relaxed) * 4
            );
        }
    };

    bit_set(&mut bitmap.words, index);
    bitmap.first_free_hint = index + 1;
    USED_BLOCKS.fetch_add(1, Ordering::Relaxed);

    index as u64 * PHYSALLOC_BLOCK_SIZE
}

/// Return a block to the allocator.
pub fn free_physical_memory_block(phys: u64) {
    // Reserved low memory never re-enters circulation
    if phys < PHYSALLOC_BLOCK_SIZE {
        return;
    }

    let index = (phys / PHYSALLOC_BLOCK_SIZE) as usize;
    if index >= BLOCK_COUNT {
        return;
    }

    let mut bitmap = BITMAP.lock();
    if !bit_test(&bitmap.words, index) {
        log::error!("double free of physical block {:#x}", phys);
        return;
    }

    bit_clear(&mut bitmap.words, index);
    if index < bitmap.first_free_hint {
        bitmap.first_free_hint = index;
    }
    USED_BLOCKS.fetch_sub(1, Ordering::Relaxed);
}

/// Blocks currently allocated.
pub fn used_physical_blocks() -> u64 {
    USED_BLOCKS.load(Ordering::Relaxed)
}

/// Usable blocks reported at boot.
pub fn total_physical_blocks() -> u64 {
    TOTAL_BLOCKS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_primitives() {
        let mut words = [0u64; 4];
        bit_set(&mut words, 0);
        bit_set(&mut words, 63);
        bit_set(&mut words, 64);
        assert!(bit_test(&words, 0));
        assert!(bit_test(&words, 63));
        assert!(bit_test(&words, 64));
        assert!(!bit_test(&words, 1));

        bit_clear(&mut words, 63);
        assert!(!bit_test(&words, 63));
    }

    #[test]
    fn test_find_first_free() {
        let mut words = [u64::MAX; 4];
        assert_eq!(find_first_free(&words, 0), None);

        bit_clear(&mut words, 130);
        assert_eq!(find_first_free(&words, 0), Some(130));
        assert_eq!(find_first_free(&words, 130), Some(130));
        assert_eq!(find_first_free(&words, 131), None);

        bit_clear(&mut words, 10);
        assert_eq!(find_first_free(&words, 0), Some(10));
        // A hint past an early hole skips it
        assert_eq!(find_first_free(&words, 11), Some(130));
    }
}
