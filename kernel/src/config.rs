/*
 * Kernel Configuration Constants
 *
 * Central location for the fixed layout of the kernel and user address
 * spaces. Everything here is a compile-time constant; runtime configuration
 * (the initial program) comes from the Multiboot command line.
 */

/// Virtual offset at which the loader maps the kernel image and the low
/// physical memory it needs during early boot.
pub const KERNEL_OFFSET: u64 = 0xffff_ffff_8000_0000;

/// Size of one page frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Physical memory below this boundary is never handed to the frame
/// allocator: it holds the kernel image and the loader's early page tables.
pub const RESERVED_LOW: u64 = 0x40_0000; // 4 MiB

/// Start of the growable kernel heap once paging is up.
pub const LARGE_HEAP_START: u64 = 0xffff_ffff_8100_0000;

/// Slack kept mapped ahead of the heap cursor so that growing the heap does
/// not itself run out of heap.
pub const HEAP_BUFZONE: u64 = 4 * PAGE_SIZE;

/// Kernel-side window where the system archive module is mapped read-only.
pub const ARCHIVE_OFFSET: u64 = 0xffff_ffff_8280_0000;

/// High-half window shared between the kernel page set and every user page
/// set (its PDPT is forced into existence before the first user set is
/// cloned). Used to alias user frames while the kernel prepares them.
pub const KERNEL_ALIAS_BASE: u64 = 0xffff_8888_0000_0000;

/// Top of a user process's stack. The stack pointer starts here and the
/// stack pages sit immediately below.
pub const USER_STACK_TOP: u64 = 0x7fff_ffff_f000;

/// Size of the initial user stack in bytes.
pub const USER_STACK_SIZE: u64 = 8192;

/// Size of a per-process kernel stack in bytes.
pub const KERNEL_STACK_SIZE: u64 = 2048;

/// Bottom of the per-process user heap grown by `adjust_heap`.
pub const PROCESS_HEAP_BASE: u64 = 0x0000_0001_0000_0000;

/// Upper bound below which argv data is staged in a new process.
pub const PROCESS_ARGS_TOP: u64 = 0x7fee_ffff_ffff;

/// User-side window where `mmap_archive` maps the system archive.
pub const ARCHIVE_USER_BASE: u64 = 0x0000_7fd0_0000_0000;

/// Module command line that identifies the system archive.
pub const ARCHIVE_SYSTEM_NAME: &str = "system.kit";

/// Program started when the command line does not name one.
pub const DEFAULT_INIT: &str = "bin/init";
