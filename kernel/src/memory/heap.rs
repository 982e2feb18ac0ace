/*
 * Kernel Heap (bump arena)
 *
 * Dynamic allocation for kernel data structures. The heap is a bump
 * allocator: `alloc` advances a cursor, `free` is deliberately a no-op.
 * Long-running reclamation workloads are out of scope for this kernel; the
 * arena keeps every other subsystem free of allocator bookkeeping.
 *
 * Two phases:
 * - Early boot runs out of a static 128 KiB buffer inside the kernel image,
 *   so allocation works before paging is initialized.
 * - Once paging is up, `enable_large_heap` relocates the cursor to a high
 *   virtual region that can grow: when an allocation would cross the mapped
 *   end, frame runs are acquired and mapped right after it (non-user,
 *   writable, no-execute). A buffer zone stays mapped ahead of the cursor so
 *   that the page tables needed for growing can themselves be allocated
 *   without triggering another grow; the `grow_enabled` flag catches
 *   recursive growth as a hard error instead of looping.
 *
 * The same arena backs Rust's `alloc` crate via `GlobalAlloc`, so `Box`,
 * `Vec` and `String` all draw from it.
 *
 * Single CPU, mutated with interrupts disabled. The state lives in a
 * `static mut` reached only through raw pointers, never through long-lived
 * references.
 */

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::config::{HEAP_BUFZONE, LARGE_HEAP_START, PAGE_SIZE};
use crate::memory::paging::{self, MapFlags};
use crate::memory::phys;

const INITIAL_HEAP_SIZE: usize = 128 * 1024;

#[repr(align(16))]
struct InitialHeap([u8; INITIAL_HEAP_SIZE]);

static mut INITIAL_HEAP: InitialHeap = InitialHeap([0; INITIAL_HEAP_SIZE]);

struct HeapState {
    start: u64,
    end: u64,
    length: u64,
    large_enabled: bool,
    grow_enabled: bool,
}

static mut HEAP: HeapState = HeapState {
    start: 0,
    end: 0,
    length: 0,
    large_enabled: false,
    grow_enabled: false,
};

unsafe fn heap_state() -> *mut HeapState {
    &raw mut HEAP
}

/// Point the cursor at the static early-boot buffer. Runs before paging.
pub fn init() {
    unsafe {
        let state = &mut *heap_state();

        state.start = (&raw const INITIAL_HEAP) as u64;
        state.end = state.start + INITIAL_HEAP_SIZE as u64;
        state.length = 0;
    }

    log::info!(
        "initial heap at {:#x} ({} KiB)",
        unsafe { (*heap_state()).start },
        INITIAL_HEAP_SIZE / 1024
    );
}

/// Relocate the heap to its growable high-virtual region. Requires the frame
/// allocator and the kernel page set.
pub fn enable_large_heap() {
    unsafe {
        let state = heap_state();

        if (*state).large_enabled {
            return;
        }

        let bufzone_pages = HEAP_BUFZONE / PAGE_SIZE;
        let (base, granted) = phys::acquire(bufzone_pages);
        assert!(granted == bufzone_pages, "no frames for the heap buffer zone");

        // Mapping the buffer zone allocates page tables out of the initial
        // heap, which is why this happens before the cursor moves.
        let mapped = paging::map_kernel(LARGE_HEAP_START, base, granted, MapFlags::empty());
        assert!(mapped == granted, "failed to map the heap buffer zone");

        (*state).start = LARGE_HEAP_START;
        (*state).end = LARGE_HEAP_START + HEAP_BUFZONE;
        (*state).length = 0;

        (*state).large_enabled = true;
        (*state).grow_enabled = true;
    }

    log::info!(
        "large heap enabled at {:#x} (bufzone {} KiB)",
        LARGE_HEAP_START,
        HEAP_BUFZONE / 1024
    );
}

/// Bump-allocate `size` bytes. Returns a null pointer when the initial heap
/// is exhausted before the large heap exists, when physical memory runs out,
/// or on recursive growth.
///
/// All state access goes through the raw pointer: growing the heap maps
/// pages, which allocates page tables, which re-enters this function, so no
/// unique reference to the state may live across those calls.
pub fn alloc(size: usize) -> *mut u8 {
    unsafe {
        let state = heap_state();

        let result = ((*state).start + (*state).length) as *mut u8;

        (*state).length += size as u64;

        // Grow until the cursor fits below the mapped end, keeping the
        // buffer zone ahead of it while growth is allowed.
        while (*state).start + (*state).length
            > (*state).end - if (*state).grow_enabled { HEAP_BUFZONE } else { 0 }
        {
            if !((*state).large_enabled && (*state).grow_enabled) {
                if !(*state).large_enabled {
                    log::error!("ran out of initial heap ({} + {})", (*state).length, size);
                } else {
                    log::error!("tried to grow the heap recursively");
                }
                return ptr::null_mut();
            }

            let grow = (*state).length + HEAP_BUFZONE - ((*state).end - (*state).start);
            let mut pages = grow / PAGE_SIZE;
            if grow % PAGE_SIZE != 0 {
                pages += 1;
            }

            // Nested allocations while mapping must come from the buffer
            // zone rather than re-entering this path.
            (*state).grow_enabled = false;

            while pages > 0 {
                let (base, granted) = phys::acquire(pages);

                if granted == 0 {
                    log::error!("out of memory growing kernel heap");
                    (*state).grow_enabled = true;
                    return ptr::null_mut();
                }

                let mapped =
                    paging::map_kernel((*state).end, base, granted, MapFlags::empty());
                if mapped != granted {
                    log::error!("failed to map heap growth");
                    (*state).grow_enabled = true;
                    return ptr::null_mut();
                }

                (*state).end += granted * PAGE_SIZE;
                pages -= granted;
            }

            (*state).grow_enabled = true;
        }

        result
    }
}

/// Bump-allocate with alignment by padding the cursor up first.
pub fn alloc_aligned(size: usize, alignment: usize) -> *mut u8 {
    unsafe {
        let state = heap_state();

        let pointer_value = (*state).start + (*state).length;

        if pointer_value as usize % alignment != 0 {
            (*state).length += (alignment - (pointer_value as usize % alignment)) as u64;
        }
    }

    alloc(size)
}

/// No-op by design. The arena never reclaims.
pub fn free(_pointer: *mut u8) {}

struct BumpAllocator;

unsafe impl GlobalAlloc for BumpAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        x86_64::instructions::interrupts::without_interrupts(|| {
            alloc_aligned(layout.size(), layout.align())
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr);
    }
}

#[global_allocator]
static ALLOCATOR: BumpAllocator = BumpAllocator;

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("kernel heap allocation failed: {:?}", layout);
}
