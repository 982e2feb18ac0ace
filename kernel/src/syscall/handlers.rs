/*
 * System Call Handlers
 *
 * Thin translation layer between raw user-supplied register values and the
 * kernel subsystems. User pointers are dereferenced directly: the caller's
 * address space is the current one, and the kernel trusts the calling
 * process with its own memory (a bad pointer faults the kernel, a known
 * limitation of this design).
 */

use alloc::vec::Vec;

use crate::config::ARCHIVE_USER_BASE;
use crate::drivers::{keyboard, vga};
use crate::fs::archive;
use crate::loaders::elf;
use crate::memory::{paging, phys};
use crate::scheduler::{self, ProcessId, process};

/// Longest C string accepted from user space.
const USER_STRING_MAX: usize = 4096;

/// Read a NUL-terminated user string.
unsafe fn user_cstr(pointer: u64) -> Option<&'static str> {
    if pointer == 0 {
        return None;
    }

    unsafe {
        let base = pointer as *const u8;
        let mut length = 0usize;

        while *base.add(length) != 0 {
            length += 1;

            if length > USER_STRING_MAX {
                return None;
            }
        }

        core::str::from_utf8(core::slice::from_raw_parts(base, length)).ok()
    }
}

/// exit(status) -> never returns
pub fn exit(status: i32) -> i64 {
    scheduler::exit_current(status);
}

/// twrite(length, buffer) -> 0
pub fn twrite(length: u64, buffer: u64) -> i64 {
    if buffer == 0 {
        return -1;
    }

    let bytes = unsafe { core::slice::from_raw_parts(buffer as *const u8, length as usize) };

    vga::write_bytes(bytes);

    0
}

/// key_get(&event) -> 0; blocks until a key event arrives
pub fn key_get(event_pointer: u64) -> i64 {
    if event_pointer == 0 {
        return -1;
    }

    let event = keyboard::wait_dequeue();

    unsafe {
        core::ptr::write(event_pointer as *mut keyboard::KeyEvent, event);
    }

    0
}

/// yield() -> 0
pub fn yield_cpu() -> i64 {
    scheduler::yield_now();
    0
}

/// sleep() -> 0 once woken
pub fn sleep() -> i64 {
    scheduler::sleep();
    0
}

/// spawn(file, argc, argv) -> pid, or:
///   -1  archive entry not found
///   -2  image failed verification
///   -3  process creation failed
///   -4  image load failed
///   -5  bad arguments
pub fn spawn(file: u64, argc: u64, argv: u64) -> i64 {
    let Some(file) = (unsafe { user_cstr(file) }) else {
        return -5;
    };

    if argc as i64 > 64 || (argc as i64) < 0 {
        return -5;
    }

    let mut args: Vec<&str> = Vec::with_capacity(argc as usize);

    if argc > 0 {
        if argv == 0 {
            return -5;
        }

        let pointers =
            unsafe { core::slice::from_raw_parts(argv as *const u64, argc as usize) };

        for &pointer in pointers {
            match unsafe { user_cstr(pointer) } {
                Some(arg) => args.push(arg),
                None => return -5,
            }
        }
    }

    match elf::spawn(file, &args) {
        Ok(id) => id.0 as i64,
        Err(code) => code,
    }
}

/// wait_process(pid, &status) -> 0, negative on a bad id
pub fn wait_process(pid: u64, status_pointer: u64) -> i64 {
    let Ok(pid) = u16::try_from(pid) else {
        return -1;
    };

    match scheduler::wait_process(ProcessId(pid)) {
        Ok(status) => {
            if status_pointer != 0 {
                unsafe {
                    core::ptr::write(status_pointer as *mut i32, status);
                }
            }

            0
        }
        Err(_) => -1,
    }
}

/// adjust_heap(amount) -> new end of heap, 0 on failure
pub fn adjust_heap(amount: i64) -> i64 {
    let current = scheduler::current();

    match process::adjust_heap(current, amount) {
        Ok(end) => end as i64,
        Err(error) => {
            log::warn!("adjust_heap({}) failed: {}", amount, error);
            0
        }
    }
}

/// mmap_archive() -> user-visible archive base, -1 on failure
pub fn mmap_archive() -> i64 {
    let Some((physical_base, pages, page_offset)) = archive::physical_extent() else {
        return -1;
    };

    let current = scheduler::current();
    let pageset = unsafe { &raw mut (*current).pageset };

    // A second call finds the window already populated and reports the same
    // base instead of a conflict.
    if unsafe { paging::resolve(pageset, ARCHIVE_USER_BASE) }.is_some() {
        return (ARCHIVE_USER_BASE + page_offset) as i64;
    }

    let mapped = unsafe {
        paging::map(
            pageset,
            ARCHIVE_USER_BASE,
            physical_base,
            pages,
            paging::MapFlags::READONLY | paging::MapFlags::USER,
        )
    };

    if mapped != pages {
        log::error!("mmap_archive mapped {}/{} pages", mapped, pages);
        return -1;
    }

    (ARCHIVE_USER_BASE + page_offset) as i64
}

/// debug(operation, argument) -> 0, -1 for unknown operations
pub fn debug(operation: u64, argument: u64) -> i64 {
    match operation {
        // Memory statistics.
        0 => {
            let pages = phys::total_free();
            log::info!("free: {} pages ({} MiB)", pages, pages / 256);
            0
        }
        // Process table dump.
        1 => {
            for id in process::ids() {
                if let Some(p) = process::get(id) {
                    unsafe {
                        log::info!(
                            "  process {:>3} {:?} heap={} name={}",
                            id.0,
                            (*p).state,
                            (*p).heap_length,
                            (*p).name
                        );
                    }
                }
            }
            0
        }
        _ => {
            log::warn!("unknown debug operation {} ({})", operation, argument);
            -1
        }
    }
}
