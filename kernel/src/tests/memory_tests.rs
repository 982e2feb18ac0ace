/*
 * Frame Allocator and Heap Tests
 *
 * The acquire/release round-trip properties: grants are page-aligned and
 * subtract exactly from total_free, a released region is found again by the
 * next same-sized acquire, and multi-run acquisition adds up. Plus basic
 * bump-heap behaviour through the Rust allocation APIs.
 */

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::memory::{heap, phys};
use crate::tests::check;

pub fn run() -> (usize, usize) {
    let mut passed = 0;
    let mut failed = 0;

    // acquire(16) hands out 16 fresh, aligned pages.
    let total_free_1 = phys::total_free();

    let (base, granted) = phys::acquire(16);

    check(granted == 16, "acquire(16) grants 16 pages", &mut passed, &mut failed);
    check(base % 4096 == 0, "granted base is 4 KiB aligned", &mut passed, &mut failed);
    check(
        phys::total_free() == total_free_1 - 16,
        "total_free drops by exactly 16",
        &mut passed,
        &mut failed,
    );

    // Releasing restores the counter...
    phys::release(base, granted);

    check(
        phys::total_free() == total_free_1,
        "release restores total_free",
        &mut passed,
        &mut failed,
    );

    // ...and the same region is the best fit for the next same-size ask.
    let (base_again, granted_again) = phys::acquire(16);

    check(granted_again == 16, "re-acquire grants 16 pages", &mut passed, &mut failed);
    check(base_again == base, "re-acquire returns the same base", &mut passed, &mut failed);

    phys::release(base_again, granted_again);

    // Acquiring in several runs still adds up and releases cleanly.
    let before = phys::total_free();
    let mut runs: Vec<(u64, u64)> = Vec::new();
    let mut remaining = 40u64;

    while remaining > 0 {
        let (run_base, run_granted) = phys::acquire(remaining);

        if run_granted == 0 {
            break;
        }

        runs.push((run_base, run_granted));
        remaining -= run_granted;
    }

    check(remaining == 0, "40 pages acquired across runs", &mut passed, &mut failed);
    check(
        phys::total_free() == before - 40,
        "multi-run acquire accounts exactly",
        &mut passed,
        &mut failed,
    );

    for (run_base, run_granted) in runs {
        phys::release(run_base, run_granted);
    }

    check(
        phys::total_free() == before,
        "multi-run release restores total_free",
        &mut passed,
        &mut failed,
    );

    // Bump heap: alignment is honoured and Rust containers work.
    let aligned = heap::alloc_aligned(64, 256);
    check(
        !aligned.is_null() && aligned as usize % 256 == 0,
        "alloc_aligned honours alignment",
        &mut passed,
        &mut failed,
    );

    let boxed = Box::new(0xdead_beefu64);
    check(*boxed == 0xdead_beef, "Box round-trips through the arena", &mut passed, &mut failed);

    let mut vec = Vec::new();
    for i in 0..1024u32 {
        vec.push(i);
    }
    check(
        vec.len() == 1024 && vec[1023] == 1023,
        "Vec grows through the arena",
        &mut passed,
        &mut failed,
    );

    (passed, failed)
}
