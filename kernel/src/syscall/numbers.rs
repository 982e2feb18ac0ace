/*
 * System Call Numbers
 *
 * Stable ABI indices. Arguments travel in rdi, rsi, rdx (r10 would carry a
 * fourth, but no call needs one); the return value comes back in rax as a
 * signed 64-bit integer. There is no errno: each syscall owns its own
 * negative number space.
 */

/// Terminate the calling process. `(status: i32) -> !`
pub const SYSCALL_EXIT: u64 = 0x0;

/// Write bytes to the text terminal. `(length, buffer) -> 0`
pub const SYSCALL_TWRITE: u64 = 0x1;

/// Block for the next keyboard event. `(&mut KeyEvent) -> 0`
pub const SYSCALL_KEY_GET: u64 = 0x2;

/// Give up the CPU. `() -> 0`
pub const SYSCALL_YIELD: u64 = 0x3;

/// Sleep until explicitly woken. `() -> 0`
pub const SYSCALL_SLEEP: u64 = 0x4;

/// Load a program from the archive and run it.
/// `(file, argc, argv) -> pid | -1..-5`
pub const SYSCALL_SPAWN: u64 = 0x5;

/// Block until a process exits. `(pid, &mut status) -> 0 | negative`
pub const SYSCALL_WAIT_PROCESS: u64 = 0x6;

/// Grow or shrink the process heap. `(amount: i64) -> new end | 0`
pub const SYSCALL_ADJUST_HEAP: u64 = 0x7;

/// Map the system archive read-only. `() -> base | negative`
pub const SYSCALL_MMAP_ARCHIVE: u64 = 0x8;

/// Kernel diagnostics. `(operation, argument) -> 0 | -1`
pub const SYSCALL_DEBUG: u64 = 0x9;

pub const SYSCALL_COUNT: u64 = 10;
