/*
 * Scheduler
 *
 * FIFO run queue threaded through the process records, cooperative yield,
 * sleep/wake, and an idle halt that waits for an interrupt with nothing
 * else to do. Single CPU; every entry point runs with interrupts disabled,
 * and the only window where they are re-enabled inside the kernel is the
 * sti/hlt pair in the idle loop.
 *
 * The tick contract:
 *  1. If the current process is Running and not idling, try to dequeue; an
 *     empty queue means there is nothing better to do, keep running.
 *  2. If the current process cannot continue (Sleeping or Dead), loop:
 *     dequeue, and while the queue stays empty, halt with interrupts
 *     enabled until an IRQ hands us something.
 *  3. A different process coming off the queue is switched to; a current
 *     process still Running goes to the back of the queue first.
 *
 * Anything along the return path out of tick() must tolerate arbitrary
 * amounts of time having passed, because many other processes may have run
 * in between.
 */

pub mod context;
pub mod process;

use core::ptr;

use x86_64::VirtAddr;
use x86_64::instructions::{hlt, interrupts};

use crate::arch::x86_64::gdt;
use crate::config::KERNEL_STACK_SIZE;
use crate::error::KernelError;
use crate::memory::paging;

pub use process::{Process, ProcessId, ProcessState};

/// The process whose kernel stack we are on. Read by the syscall entry
/// stub, so it must stay a plain pointer-sized static.
pub(crate) static mut PROCESS_CURRENT: *mut Process = ptr::null_mut();

static mut RUN_QUEUE_FRONT: *mut Process = ptr::null_mut();
static mut RUN_QUEUE_BACK: *mut Process = ptr::null_mut();

/// Save slot for the boot context's stack pointer; the boot context is
/// abandoned at the first switch and never resumed.
static mut BOOT_STACK_POINTER: u64 = 0;

pub fn init() {
    process::init();

    crate::syscall::init();
}

/// Currently running process, or null before the first switch.
pub fn current() -> *mut Process {
    unsafe { *(&raw const PROCESS_CURRENT) }
}

/// Id of the current process. Only valid once scheduling has started.
pub fn current_id() -> ProcessId {
    let current = current();

    assert!(!current.is_null());

    unsafe { (*current).id }
}

/// Append to the back of the run queue. Interrupts must be disabled.
pub fn enqueue_run(process: *mut Process) {
    unsafe {
        let back = *(&raw const RUN_QUEUE_BACK);

        (*process).sched.run_queue_next = None;

        if back.is_null() {
            *(&raw mut RUN_QUEUE_FRONT) = process;
            *(&raw mut RUN_QUEUE_BACK) = process;
        } else {
            (*back).sched.run_queue_next = Some((*process).id);
            *(&raw mut RUN_QUEUE_BACK) = process;
        }
    }
}

/// Pop the front of the run queue, or null when it is empty.
pub(crate) fn dequeue_run() -> *mut Process {
    unsafe {
        let front = *(&raw const RUN_QUEUE_FRONT);

        if front.is_null() {
            return ptr::null_mut();
        }

        match (*front).sched.run_queue_next.take() {
            Some(next_id) => {
                let next = process::get(next_id).expect("run queue link to missing process");
                *(&raw mut RUN_QUEUE_FRONT) = next;
            }
            None => {
                *(&raw mut RUN_QUEUE_FRONT) = ptr::null_mut();
                *(&raw mut RUN_QUEUE_BACK) = ptr::null_mut();
            }
        }

        front
    }
}

/// One scheduling decision. Called from the timer IRQ, from `yield`, and
/// after sleep/wake transitions.
pub fn tick() {
    unsafe {
        let current = current();

        if current.is_null() {
            let next = dequeue_run();
            assert!(!next.is_null(), "tick with no current and an empty queue");
            process_switch(next);
            return;
        }

        // Re-entered from the idle halt below (via the timer IRQ); the
        // outer tick is already making the decision.
        if (*current).sched.waiting {
            return;
        }

        let mut next;

        loop {
            next = dequeue_run();

            if !next.is_null() {
                break;
            }

            if (*current).state == ProcessState::Running {
                // Nothing else to do; keep running.
                return;
            }

            // Idle: wait for an interrupt to produce a runnable process.
            // enable_and_hlt keeps sti and hlt adjacent so a wake cannot
            // slip in between and leave us halted with a non-empty queue.
            (*current).sched.waiting = true;

            interrupts::enable_and_hlt();
            interrupts::disable();

            (*current).sched.waiting = false;
        }

        if next != current {
            if (*current).state == ProcessState::Running {
                enqueue_run(current);
            }

            process_switch(next);
        }
    }
}

/// Voluntarily give up the CPU.
pub fn yield_now() {
    tick();
}

/// Put the current process to sleep until an explicit wake.
pub fn sleep() {
    unsafe {
        let current = current();

        assert!(!current.is_null());
        assert!((*current).state == ProcessState::Running);

        (*current).state = ProcessState::Sleeping;
    }

    tick();
}

/// Wake a sleeping process: back to Running and onto the queue. Returns
/// whether the process was actually sleeping.
pub fn wake(id: ProcessId) -> bool {
    let Some(process) = process::get(id) else {
        return false;
    };

    unsafe {
        if (*process).state == ProcessState::Sleeping {
            (*process).state = ProcessState::Running;
            enqueue_run(process);

            true
        } else {
            false
        }
    }
}

/// Switch to `next`: rebind the address space and the ring 0 stack, then
/// swap kernel stacks. Returns whenever this process is switched back to.
unsafe fn process_switch(next: *mut Process) {
    unsafe {
        let old = current();

        paging::set_current_pageset(&raw mut (*next).pageset);
        gdt::set_kernel_stack(VirtAddr::new(
            (*next).kernel_stack_base as u64 + KERNEL_STACK_SIZE,
        ));

        *(&raw mut PROCESS_CURRENT) = next;

        let old_rsp = if old.is_null() {
            &raw mut BOOT_STACK_POINTER
        } else {
            &raw mut (*old).kernel_stack_pointer
        };

        context::switch(old_rsp, (*next).kernel_stack_pointer);
    }
}

/// Hand the CPU to the first queued process. The boot context is parked
/// here and never scheduled again.
pub fn enter() -> ! {
    log::info!("entering scheduler");

    unsafe {
        let next = dequeue_run();
        assert!(!next.is_null(), "no initial process to run");

        process_switch(next);
    }

    loop {
        hlt();
    }
}

/// Terminate the current process: record the status, wake every waiter and
/// switch away for good.
pub fn exit_current(status: i32) -> ! {
    unsafe {
        let current = current();

        assert!(!current.is_null());

        (*current).state = ProcessState::Dead;
        (*current).exit_status = status;

        let waiters = core::mem::take(&mut (*current).waiters);

        for waiter in waiters {
            wake(waiter);
        }

        log::info!(
            "process {} ({}) exited with status {}",
            (*current).id.0,
            (*current).name,
            status
        );
    }

    tick();

    unreachable!("dead process was scheduled");
}

/// Block until `id` exits, returning its recorded status. A process that is
/// already Dead reports immediately.
pub fn wait_process(id: ProcessId) -> Result<i32, KernelError> {
    let target = process::get(id).ok_or(KernelError::NotFound)?;

    unsafe {
        if (*target).state != ProcessState::Dead {
            (*target).waiters.push(current_id());

            // Tolerate unrelated wakes (e.g. a keyboard event meant for
            // another wait) by re-checking the state.
            while (*target).state != ProcessState::Dead {
                sleep();
            }
        }

        Ok((*target).exit_status)
    }
}
