/*
 * Memory Management
 *
 * Ties together:
 *  - Kernel heap, a bump arena (heap)
 *  - Physical frame allocator over a size-ordered region tree (phys)
 *  - Page-set engine for 4-level paging (paging, phy_lin_map)
 */

pub mod heap;
pub mod paging;
pub mod phy_lin_map;
pub mod phys;

use crate::multiboot::MultibootInfo;

/// Top-level memory initialization:
///  1. Early heap over the static boot buffer
///  2. Frame allocator from the loader memory map
///  3. Kernel page set from the boot page tables
///  4. Growable large heap
pub fn init(info: &MultibootInfo) {
    log::info!("initializing memory management");

    heap::init();
    phys::init(info);
    paging::init();
    heap::enable_large_heap();

    log::info!("memory management ready, {} pages free", phys::total_free());
}

/// Fill `size` bytes at `pointer` with `value`.
///
/// # Safety
/// `pointer` must be valid for `size` bytes of writes.
#[inline]
pub unsafe fn set(pointer: *mut u8, value: u8, size: usize) {
    unsafe { core::ptr::write_bytes(pointer, value, size) }
}

/// Copy `size` bytes from `src` to `dest`. The ranges must not overlap.
///
/// # Safety
/// `src` must be valid for `size` bytes of reads and `dest` for writes.
#[inline]
pub unsafe fn copy(src: *const u8, dest: *mut u8, size: usize) {
    unsafe { core::ptr::copy_nonoverlapping(src, dest, size) }
}

/// Byte-wise comparison, identical to C `memcmp`.
///
/// # Safety
/// Both pointers must be valid for `size` bytes of reads.
#[inline]
pub unsafe fn compare(s1: *const u8, s2: *const u8, size: usize) -> i32 {
    unsafe {
        for i in 0..size {
            let a = *s1.add(i);
            let b = *s2.add(i);

            if a < b {
                return -1;
            }
            if a > b {
                return 1;
            }
        }
    }

    0
}
