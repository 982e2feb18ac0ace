/*
 * System Call Entry (SYSCALL/SYSRET fast path)
 *
 * MSR setup:
 *   EFER.SCE   enables the instruction pair.
 *   STAR       kernel selector base in [47:32], user base in [63:48]; the
 *              CPU derives CS/SS from these by fixed offsets (see gdt.rs).
 *   LSTAR      the assembly entry stub below.
 *   FMASK      EFLAGS bits cleared on entry. Everything relevant and
 *              non-reserved is masked, so the kernel always enters with
 *              interrupts, direction and traps off.
 *
 * On `syscall`, the CPU stashes the user rip in rcx and EFLAGS in r11, but
 * leaves rsp alone: the stub's first job is to park the user stack pointer
 * and adopt the current process's kernel stack, located by constant offset
 * into the process record. User rsp/rcx/r11 ride on the kernel stack across
 * the dispatch (the dispatched call may switch processes and come back much
 * later), then `sysretq` restores ring 3.
 *
 * Arguments follow the AMD64 convention (rdi, rsi, rdx; r10 would stand in
 * for rcx if a fourth were needed). The stub shuffles the syscall number in
 * rax ahead of them and calls the dispatcher, whose match is the dispatch
 * table; rax carries the return value back.
 */

pub mod handlers;
pub mod numbers;

use core::arch::naked_asm;
use core::mem::offset_of;

use x86::msr::{IA32_EFER, IA32_FMASK, IA32_LSTAR, IA32_STAR, rdmsr, wrmsr};

use crate::arch::x86_64::gdt;
use crate::config::KERNEL_STACK_SIZE;
use crate::scheduler::Process;

use numbers::*;

/// IA32_EFER.SCE (SysCall Enable), bit 0.
const EFER_SCE: u64 = 0x1;

/// Clear all non-reserved, relevant EFLAGS bits when entering the kernel.
const SYSCALL_FLAG_MASK: u64 = 0x003f_4fd5;

/// Stash for the user stack pointer between entry and the first push.
/// Safe because FMASK keeps interrupts off across that window and the
/// value is moved onto the kernel stack immediately.
static mut SYSCALL_USER_RSP: u64 = 0;

/// Enable and wire up the syscall instruction. Requires the GDT.
pub fn init() {
    unsafe {
        wrmsr(IA32_EFER, rdmsr(IA32_EFER) | EFER_SCE);

        let star = ((gdt::STAR_USER_BASE as u64) << 48) | ((gdt::STAR_KERNEL_BASE as u64) << 32);
        wrmsr(IA32_STAR, star);

        wrmsr(IA32_LSTAR, syscall_entry as usize as u64);

        wrmsr(IA32_FMASK, SYSCALL_FLAG_MASK);
    }

    log::info!("syscall entry at {:#x}", syscall_entry as usize as u64);
}

#[unsafe(naked)]
unsafe extern "C" fn syscall_entry() -> ! {
    naked_asm!(
        // Park the user stack and climb onto the process kernel stack.
        "mov [rip + {user_rsp}], rsp",
        "mov rsp, [rip + {current}]",
        "mov rsp, [rsp + {off_kernel_stack_base}]",
        "add rsp, {kernel_stack_size}",
        // User state that must survive the dispatch.
        "push qword ptr [rip + {user_rsp}]",
        "push rcx", // user rip
        "push r11", // user rflags
        "push rax", // number (also keeps the call aligned)
        // (number, arg1, arg2, arg3) into the C calling convention.
        "mov rcx, rdx",
        "mov rdx, rsi",
        "mov rsi, rdi",
        "mov rdi, rax",
        "call {dispatch}",
        "add rsp, 8",
        "pop r11",
        "pop rcx",
        "pop rsp",
        "sysretq",
        user_rsp = sym SYSCALL_USER_RSP,
        current = sym crate::scheduler::PROCESS_CURRENT,
        off_kernel_stack_base = const offset_of!(Process, kernel_stack_base),
        kernel_stack_size = const KERNEL_STACK_SIZE,
        dispatch = sym dispatch,
    )
}

/// Dispatch over the stable syscall numbers. Unknown numbers report -1 in
/// their own number space, as every syscall defines its own errors.
extern "C" fn dispatch(number: u64, arg1: u64, arg2: u64, arg3: u64) -> i64 {
    match number {
        SYSCALL_EXIT => handlers::exit(arg1 as i32),
        SYSCALL_TWRITE => handlers::twrite(arg1, arg2),
        SYSCALL_KEY_GET => handlers::key_get(arg1),
        SYSCALL_YIELD => handlers::yield_cpu(),
        SYSCALL_SLEEP => handlers::sleep(),
        SYSCALL_SPAWN => handlers::spawn(arg1, arg2, arg3),
        SYSCALL_WAIT_PROCESS => handlers::wait_process(arg1, arg2),
        SYSCALL_ADJUST_HEAP => handlers::adjust_heap(arg1 as i64),
        SYSCALL_MMAP_ARCHIVE => handlers::mmap_archive(),
        SYSCALL_DEBUG => handlers::debug(arg1, arg2),
        _ => -1,
    }
}
