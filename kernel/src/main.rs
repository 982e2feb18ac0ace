/*
 * Kestrel Kernel Entry Point
 *
 * Boot contract: a Multiboot-compliant loader (plus its long-mode shim) has
 * switched the CPU into 64-bit mode with the kernel image mapped at
 * KERNEL_OFFSET and the low 2 MiB identity mapped, and jumps to `_start`
 * with the physical address of the Multiboot information structure in rdi.
 *
 * Initialization order matters:
 *  - serial + logger first, so everything later can speak
 *  - GDT and IDT before any fault can happen
 *  - EFER.NXE before the first no-execute page-table entry is written
 *  - memory management before anything that allocates beyond the early heap
 *  - the archive, the syscall MSRs and the first process last
 *
 * The command line selects the initial program (second token, default
 * bin/init); the literal token `selftest` runs the in-kernel test suite
 * instead of entering user space.
 */

#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]
#![allow(dead_code)]

extern crate alloc;
extern crate rlibc;

use core::arch::naked_asm;
use core::panic::PanicInfo;

mod arch;
mod config;
mod drivers;
mod error;
mod fs;
mod loaders;
mod logger;
mod memory;
mod multiboot;
mod rbtree;
mod scheduler;
mod syscall;
mod tests;

use multiboot::MultibootInfo;

#[repr(C, align(16))]
pub struct AlignedBootStack([u8; 64 * 1024]);

#[unsafe(no_mangle)]
pub static mut BOOT_STACK: AlignedBootStack = AlignedBootStack([0; 64 * 1024]);

/// First instruction of the kernel proper. Adopts a real stack and carries
/// the loader's info pointer (rdi) into Rust.
#[unsafe(naked)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _start() -> ! {
    naked_asm!(
        "lea rax, [rip + BOOT_STACK]",
        "add rax, {stack_size}",
        "mov rsp, rax",
        "jmp kmain",
        stack_size = const 64 * 1024,
    );
}

#[unsafe(no_mangle)]
pub extern "C" fn kmain(multiboot_physical: u64) -> ! {
    drivers::serial::init();
    logger::init();
    log::info!("Kestrel kernel starting");

    arch::x86_64::gdt::init();
    arch::x86_64::idt::init();
    arch::x86_64::enable_nxe();

    let info = unsafe { MultibootInfo::from_physical(multiboot_physical) };

    drivers::vga::init();

    // Copy the packed fields before formatting them.
    let mem_lower = info.mem_lower;
    let mem_upper = info.mem_upper;

    println!("Kestrel kernel");
    println!("memory: {} KiB lower, {} KiB upper", mem_lower, mem_upper);

    memory::init(info);

    arch::x86_64::interrupts::init();
    drivers::keyboard::init();

    if let Err(error) = fs::archive::init(info) {
        panic!("system archive unavailable: {}", error);
    }

    scheduler::init();

    let program = info
        .cmdline()
        .and_then(|cmdline| cmdline.split_whitespace().nth(1))
        .unwrap_or(config::DEFAULT_INIT);

    if program == "selftest" {
        tests::run_all();

        log::info!("selftest complete, halting");
        loop {
            x86_64::instructions::hlt();
        }
    }

    log::info!("starting initial program '{}'", program);

    match loaders::elf::spawn(program, &[program]) {
        Ok(id) => log::info!("initial process is {}", id.0),
        Err(code) => panic!("failed to spawn '{}' (code {})", program, code),
    }

    scheduler::enter();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();

    if let Some(location) = info.location() {
        log::error!(
            "PANIC at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        log::error!("PANIC: {}", info.message());
    }

    println!("\x1b[91mkernel panic: {}\x1b[0m", info.message());

    loop {
        x86_64::instructions::hlt();
    }
}
