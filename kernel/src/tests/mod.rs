/*
 * In-Kernel Test Suite
 *
 * Runs when the kernel command line selects `selftest` instead of an
 * initial program. Each module exercises one core subsystem against its
 * documented properties and returns (passed, failed) counters; the runner
 * prints a summary to the terminal and the log.
 */

pub mod archive_tests;
pub mod memory_tests;
pub mod paging_tests;
pub mod rbtree_tests;
pub mod scheduler_tests;

use crate::println;

/// Record one check, logging failures loudly.
pub fn check(condition: bool, name: &str, passed: &mut usize, failed: &mut usize) {
    if condition {
        *passed += 1;
    } else {
        *failed += 1;
        log::error!("FAILED: {}", name);
        println!("  FAILED: {}", name);
    }
}

pub fn run_all() -> (usize, usize) {
    let mut passed = 0;
    let mut failed = 0;

    println!("\nKestrel self test");

    for (name, run) in [
        ("rbtree", rbtree_tests::run as fn() -> (usize, usize)),
        ("frame allocator / heap", memory_tests::run),
        ("page sets", paging_tests::run),
        ("processes / scheduler", scheduler_tests::run),
        ("archive / elf", archive_tests::run),
    ] {
        println!("[ {} ]", name);

        let (p, f) = run();

        println!("  {} passed, {} failed", p, f);

        passed += p;
        failed += f;
    }

    if failed == 0 {
        println!("\x1b[92mall {} checks passed\x1b[0m", passed);
    } else {
        println!("\x1b[91m{} of {} checks failed\x1b[0m", failed, passed + failed);
    }

    log::info!("self test: {} passed, {} failed", passed, failed);

    (passed, failed)
}
