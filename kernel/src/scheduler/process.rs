/*
 * Process Subsystem
 *
 * A process owns a user page set, a register save area, a small kernel
 * stack and a run-queue link. Records are allocated from the kernel heap
 * and live in an RB-tree keyed by id; ids count up from 1 and are never
 * reused (running out of the 16-bit space is a fatal assertion).
 *
 * Dead processes keep their records: the kernel performs no memory
 * reclamation by design, and `wait_process` reads exit status out of the
 * record after the fact.
 */

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::{
    KERNEL_ALIAS_BASE, KERNEL_STACK_SIZE, PAGE_SIZE, PROCESS_ARGS_TOP, PROCESS_HEAP_BASE,
    USER_STACK_SIZE, USER_STACK_TOP,
};
use crate::error::KernelError;
use crate::memory::paging::{self, MapFlags, PageSet};
use crate::memory::{heap, phys};
use crate::rbtree::{self, RbNode, RbTree};
use crate::scheduler::context::{self, Registers, USER_EFLAGS};

/// Unique process identifier, assigned from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Being built; not schedulable yet.
    Loading,
    /// Current or queued to run.
    Running,
    /// Off the run queue until an explicit wake.
    Sleeping,
    /// Exited; record retained for waiters.
    Dead,
}

/// Scheduler-owned fields threaded through the process record.
#[derive(Debug)]
pub struct SchedFields {
    /// Set while the process idles inside the scheduler's halt window.
    pub waiting: bool,
    /// Intrusive run-queue link.
    pub run_queue_next: Option<ProcessId>,
}

/// Fields the syscall entry stub reaches by constant offset come first.
#[repr(C)]
pub struct Process {
    /// Saved kernel stack pointer while switched out.
    pub kernel_stack_pointer: u64,
    /// Base (lowest address) of the kernel stack allocation.
    pub kernel_stack_base: *mut u8,

    pub id: ProcessId,
    pub name: String,
    pub state: ProcessState,
    pub pageset: PageSet,
    pub registers: Registers,
    pub exit_status: i32,
    /// Processes sleeping in `wait_process` on this one.
    pub waiters: Vec<ProcessId>,
    pub sched: SchedFields,
    /// Current heap size above PROCESS_HEAP_BASE, in bytes.
    pub heap_length: u64,
}

/// Process table node; link head first.
#[repr(C)]
struct ProcessNode {
    node: RbNode,
    process: Process,
}

struct ProcessTable {
    tree: RbTree,
    next_id: u16,
}

static PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable {
    tree: RbTree::new(),
    next_id: 1,
});

pub fn init() {
    log::info!("process table ready");
}

/// Look up a process record by id.
pub fn get(id: ProcessId) -> Option<*mut Process> {
    let table = PROCESS_TABLE.lock();

    let mut node = table.tree.root as *mut ProcessNode;

    unsafe {
        while !node.is_null() {
            let current = (*node).process.id;

            if current == id {
                return Some(&raw mut (*node).process);
            }

            if current < id {
                node = (*node).node.right as *mut ProcessNode;
            } else {
                node = (*node).node.left as *mut ProcessNode;
            }
        }
    }

    None
}

/// Iterate over every process id currently in the table.
pub fn ids() -> Vec<ProcessId> {
    let table = PROCESS_TABLE.lock();

    let mut result = Vec::new();
    let mut node = table.tree.first() as *mut ProcessNode;

    unsafe {
        while !node.is_null() {
            result.push((*node).process.id);
            node = rbtree::next(node as *mut RbNode) as *mut ProcessNode;
        }
    }

    result
}

fn insert(table: &mut ProcessTable, node: *mut ProcessNode) {
    unsafe {
        let id = (*node).process.id;

        let mut parent: *mut ProcessNode = core::ptr::null_mut();
        let mut current = table.tree.root as *mut ProcessNode;

        while !current.is_null() {
            parent = current;

            if (*current).process.id < id {
                current = (*current).node.right as *mut ProcessNode;
            } else {
                current = (*current).node.left as *mut ProcessNode;
            }
        }

        (*node).node.parent = parent as *mut RbNode;

        if parent.is_null() {
            table.tree.root = node as *mut RbNode;
        } else {
            if id < (*parent).process.id {
                (*parent).node.left = node as *mut RbNode;
            } else {
                (*parent).node.right = node as *mut RbNode;
            }

            rbtree::balance_insert(&mut table.tree, node as *mut RbNode);
        }
    }
}

/// Create a process in the Loading state: fresh page set, prepared kernel
/// stack, user stack mapped at the top of user space, id assigned and the
/// record inserted into the table.
pub fn create(name: &str) -> Result<*mut Process, KernelError> {
    if name.len() > 255 {
        return Err(KernelError::BadArg);
    }

    let pageset = paging::create_pageset()?;

    let kernel_stack = heap::alloc_aligned(KERNEL_STACK_SIZE as usize, 16);
    if kernel_stack.is_null() {
        return Err(KernelError::OutOfMemory);
    }

    let kernel_stack_pointer =
        unsafe { context::prepare(kernel_stack as u64 + KERNEL_STACK_SIZE) };

    let mut registers = Registers::default();
    registers.rsp = USER_STACK_TOP;
    registers.eflags = USER_EFLAGS;

    let id = {
        let mut table = PROCESS_TABLE.lock();

        // Never recycled; the 16-bit space running out is a kernel bug.
        assert!(table.next_id < u16::MAX, "process ids exhausted");

        let id = ProcessId(table.next_id);
        table.next_id += 1;
        id
    };

    let node = Box::into_raw(Box::new(ProcessNode {
        node: RbNode::new(),
        process: Process {
            kernel_stack_pointer,
            kernel_stack_base: kernel_stack,
            id,
            name: String::from(name),
            state: ProcessState::Loading,
            pageset,
            registers,
            exit_status: 0,
            waiters: Vec::new(),
            sched: SchedFields {
                waiting: false,
                run_queue_next: None,
            },
            heap_length: 0,
        },
    }));

    let process = unsafe { &raw mut (*node).process };

    unsafe {
        alloc_in(
            process,
            USER_STACK_TOP - USER_STACK_SIZE,
            USER_STACK_SIZE,
            MapFlags::empty(),
        )?;
    }

    let mut table = PROCESS_TABLE.lock();
    insert(&mut table, node);

    Ok(process)
}

/// Allocate and map `length` bytes of user memory at `address` (aligned
/// down to a page). Multiple contiguous runs are acquired as needed; the
/// USER flag is always forced on. Returns the aligned address.
///
/// A mid-way failure leaves earlier runs mapped (known looseness; the
/// caller treats it as out-of-memory and the process is torn down).
///
/// # Safety
/// `process` must point at a live process record.
pub unsafe fn alloc_in(
    process: *mut Process,
    address: u64,
    length: u64,
    flags: MapFlags,
) -> Result<u64, KernelError> {
    let padded_address = address & !(PAGE_SIZE - 1);
    let length = length + (address & (PAGE_SIZE - 1));

    let mut pages = (length >> 12) + if length & 0xfff != 0 { 1 } else { 0 };

    if pages == 0 {
        return Err(KernelError::BadArg);
    }

    let flags = flags | MapFlags::USER;

    let mut current = padded_address;

    while pages > 0 {
        let (base, granted) = phys::acquire(pages);

        if granted == 0 {
            log::error!("out of memory allocating {} pages in process", pages);
            return Err(KernelError::OutOfMemory);
        }

        let mapped = unsafe {
            paging::map(&raw mut (*process).pageset, current, base, granted, flags)
        };

        if mapped != granted {
            log::error!("process mapping conflict at {:#x}", current);
            return Err(KernelError::MapConflict);
        }

        current += granted << 12;
        pages -= granted;
    }

    Ok(padded_address)
}

/// Like `alloc_in`, but the same frames are also mapped (without USER) at
/// `kernel_address` in the kernel page set, so the kernel can fill user
/// memory from its own address space. The caller unmaps the alias when
/// done.
///
/// # Safety
/// As `alloc_in`; `kernel_address` must lie in the shared alias window.
pub unsafe fn alloc_with_kernel(
    process: *mut Process,
    user_address: u64,
    kernel_address: u64,
    length: u64,
    flags: MapFlags,
) -> Result<(), KernelError> {
    assert!(user_address % PAGE_SIZE == kernel_address % PAGE_SIZE);

    let user_base = user_address & !(PAGE_SIZE - 1);
    let kernel_base = kernel_address & !(PAGE_SIZE - 1);
    let length = length + (user_address & (PAGE_SIZE - 1));

    let mut pages = (length >> 12) + if length & 0xfff != 0 { 1 } else { 0 };

    if pages == 0 {
        return Err(KernelError::BadArg);
    }

    let mut user_current = user_base;
    let mut kernel_current = kernel_base;

    while pages > 0 {
        let (base, granted) = phys::acquire(pages);

        if granted == 0 {
            return Err(KernelError::OutOfMemory);
        }

        let user_mapped = unsafe {
            paging::map(
                &raw mut (*process).pageset,
                user_current,
                base,
                granted,
                flags | MapFlags::USER,
            )
        };

        let kernel_mapped = paging::map_kernel(kernel_current, base, granted, flags);

        if user_mapped != granted || kernel_mapped != granted {
            return Err(KernelError::MapConflict);
        }

        user_current += granted << 12;
        kernel_current += granted << 12;
        pages -= granted;
    }

    Ok(())
}

/// Stage argc/argv in the process: a pointer array followed by the
/// concatenated NUL-terminated strings, written through the kernel alias
/// window, with `rdi`/`rsi` set per the calling convention.
pub fn set_args(process: *mut Process, argv: &[&str]) -> Result<(), KernelError> {
    let argc = argv.len();

    unsafe {
        if argc == 0 {
            (*process).registers.rdi = 0;
            (*process).registers.rsi = 0;
            return Ok(());
        }

        let mut total_bytes = 0u64;

        for arg in argv {
            total_bytes += core::mem::size_of::<u64>() as u64 + arg.len() as u64 + 1;
        }

        let user_base = (PROCESS_ARGS_TOP - total_bytes) & !(PAGE_SIZE - 1);
        let alias_base = KERNEL_ALIAS_BASE;

        alloc_with_kernel(process, user_base, alias_base, total_bytes, MapFlags::empty())?;

        // Pointer array first, string data right behind it. The stored
        // pointers are user-space values: alias addresses adjusted by the
        // base delta.
        let pointer_array = alias_base as *mut u64;
        let mut data = alias_base + (argc as u64) * 8;

        for (i, arg) in argv.iter().enumerate() {
            *pointer_array.add(i) = user_base + (data - alias_base);

            crate::memory::copy(arg.as_ptr(), data as *mut u8, arg.len());
            *((data + arg.len() as u64) as *mut u8) = 0;

            data += arg.len() as u64 + 1;
        }

        (*process).registers.rdi = argc as u64;
        (*process).registers.rsi = user_base;

        // The frames stay mapped in the process; only the alias goes away.
        let alias_pages =
            (total_bytes >> 12) + if total_bytes & 0xfff != 0 { 1 } else { 0 };
        let unmapped = paging::unmap_kernel(KERNEL_ALIAS_BASE, alias_pages);
        assert!(unmapped == alias_pages);

        Ok(())
    }
}

/// Record the entry point of a process still being loaded.
pub fn set_entry_point(process: *mut Process, instruction: u64) {
    unsafe {
        assert!((*process).state == ProcessState::Loading);

        (*process).registers.rip = instruction;
    }
}

/// Transition Loading -> Running and hand the process to the scheduler.
pub fn run(process: *mut Process) {
    unsafe {
        assert!((*process).state == ProcessState::Loading);

        (*process).state = ProcessState::Running;

        crate::scheduler::enqueue_run(process);
    }
}

/// Grow or shrink the process heap by `amount` bytes, acquiring or
/// releasing whole pages as the boundary moves. Returns the new end of
/// heap. A failed growth is undone before returning.
pub fn adjust_heap(process: *mut Process, amount: i64) -> Result<u64, KernelError> {
    unsafe {
        let old_length = (*process).heap_length;

        let new_length = if amount >= 0 {
            old_length
                .checked_add(amount as u64)
                .ok_or(KernelError::BadArg)?
        } else {
            old_length
                .checked_sub((-amount) as u64)
                .ok_or(KernelError::BadArg)?
        };

        let old_pages = old_length.div_ceil(PAGE_SIZE);
        let new_pages = new_length.div_ceil(PAGE_SIZE);

        if new_pages > old_pages {
            let grow_base = PROCESS_HEAP_BASE + old_pages * PAGE_SIZE;
            let grow_bytes = (new_pages - old_pages) * PAGE_SIZE;

            alloc_in(process, grow_base, grow_bytes, MapFlags::empty())?;
        } else if new_pages < old_pages {
            // Resolve each page before unmapping so the frame can go back
            // to the allocator.
            let pageset = &raw mut (*process).pageset;

            for page in new_pages..old_pages {
                let linear = PROCESS_HEAP_BASE + page * PAGE_SIZE;

                if let Some(physical) = paging::resolve(pageset, linear) {
                    let unmapped = paging::unmap(pageset, linear, 1);
                    assert!(unmapped == 1);

                    phys::release(physical & !(PAGE_SIZE - 1), 1);
                }
            }
        }

        (*process).heap_length = new_length;

        Ok(PROCESS_HEAP_BASE + new_length)
    }
}
