/*
 * Page-Set Tests
 *
 * A fresh user page set must resolve exactly what was mapped into it,
 * refuse double maps, count absent ranges as unmapped, reroute kernel-space
 * queries to the kernel set, and tear down to an empty table map.
 */

use crate::memory::paging::{self, MapFlags};
use crate::memory::phys;
use crate::tests::check;

pub fn run() -> (usize, usize) {
    let mut passed = 0;
    let mut failed = 0;

    let mut pageset = match paging::create_pageset() {
        Ok(pageset) => pageset,
        Err(error) => {
            log::error!("create_pageset failed: {}", error);
            return (passed, failed + 1);
        }
    };

    let ps = &raw mut pageset;

    let linear = 0x4000_0000u64;
    let (frame, granted) = phys::acquire(1);

    check(granted == 1, "frame available for mapping", &mut passed, &mut failed);

    unsafe {
        // create -> map -> resolve round-trips the physical address.
        let mapped = paging::map(ps, linear, frame, 1, MapFlags::USER);
        check(mapped == 1, "map reports one page mapped", &mut passed, &mut failed);

        check(
            paging::resolve(ps, linear) == Some(frame),
            "resolve returns the mapped frame",
            &mut passed,
            &mut failed,
        );

        check(
            paging::resolve(ps, linear + 0x123) == Some(frame + 0x123),
            "resolve carries the page offset",
            &mut passed,
            &mut failed,
        );

        // Double-mapping the same leaf is refused.
        let remapped = paging::map(ps, linear, frame, 1, MapFlags::USER);
        check(remapped == 0, "double map is refused", &mut passed, &mut failed);

        // Read-only mappings land like any other.
        let ro_linear = linear + 0x1000;
        let (ro_frame, ro_granted) = phys::acquire(1);
        check(ro_granted == 1, "frame available for RO mapping", &mut passed, &mut failed);

        let ro_mapped = paging::map(ps, ro_linear, ro_frame, 1, MapFlags::USER | MapFlags::READONLY);
        check(
            ro_mapped == 1 && paging::resolve(ps, ro_linear) == Some(ro_frame),
            "read-only map resolves",
            &mut passed,
            &mut failed,
        );

        // Kernel-space queries reroute to the kernel page set.
        let kernel_linear = crate::config::LARGE_HEAP_START;
        check(
            paging::resolve(ps, kernel_linear) == paging::resolve_kernel(kernel_linear),
            "higher-half resolve reroutes to the kernel set",
            &mut passed,
            &mut failed,
        );

        // Unmapping an absent range reports the requested count untouched.
        let absent = 0x5000_0000u64;
        check(
            paging::unmap(ps, absent, 8) == 8,
            "unmap of an absent range reports the request",
            &mut passed,
            &mut failed,
        );

        // Unmapping the live pages works and resolve goes dark.
        check(paging::unmap(ps, linear, 2) == 2, "unmap removes both pages", &mut passed, &mut failed);
        check(
            paging::resolve(ps, linear).is_none(),
            "resolve fails after unmap",
            &mut passed,
            &mut failed,
        );

        phys::release(frame, 1);
        phys::release(ro_frame, 1);

        // Destroy clears the table map and lets go of the PML4.
        check(
            paging::destroy_pageset(ps).is_ok(),
            "destroy accepts a user page set",
            &mut passed,
            &mut failed,
        );
        check(
            (*ps).table_map.is_empty(),
            "destroy clears the table map",
            &mut passed,
            &mut failed,
        );

        // The kernel page set must never be destroyable.
        check(
            paging::destroy_pageset(paging::kernel_pageset()).is_err(),
            "destroy refuses the kernel page set",
            &mut passed,
            &mut failed,
        );
    }

    (passed, failed)
}
