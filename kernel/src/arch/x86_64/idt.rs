/*
 * Interrupt Descriptor Table
 *
 * Exception gates plus the two remapped hardware interrupts the kernel
 * uses (PIT timer and PS/2 keyboard). Faults in kernel context are fatal by
 * design; a user-mode page fault currently brings the kernel down too, a
 * known limitation.
 */

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::arch::x86_64::gdt;
use crate::arch::x86_64::interrupts::{IRQ_KEYBOARD, IRQ_TIMER, keyboard_interrupt, timer_interrupt};

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);

        idt[IRQ_TIMER].set_handler_fn(timer_interrupt);
        idt[IRQ_KEYBOARD].set_handler_fn(keyboard_interrupt);

        idt
    };
}

pub fn init() {
    IDT.load();
    log::info!("IDT loaded");
}

extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    panic!("divide error at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    panic!("invalid opcode at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::warn!("breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, _error: u64) -> ! {
    panic!("double fault at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn general_protection_fault_handler(frame: InterruptStackFrame, error: u64) {
    panic!(
        "general protection fault (error {:#x}) at {:#x}",
        error,
        frame.instruction_pointer.as_u64()
    );
}

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    error: PageFaultErrorCode,
) {
    let address = x86_64::registers::control::Cr2::read_raw();

    // No demand paging and no recovery: every page fault is a bug, whether
    // it came from the kernel or from user space.
    panic!(
        "page fault: address {:#x}, error {:?}, rip {:#x}",
        address,
        error,
        frame.instruction_pointer.as_u64()
    );
}
