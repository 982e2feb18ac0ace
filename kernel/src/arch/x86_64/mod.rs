/*
 * x86_64 Processor Setup
 *
 * Segmentation, interrupt tables and the hardware interrupt plumbing.
 */

pub mod gdt;
pub mod idt;
pub mod interrupts;

use x86::msr::{IA32_EFER, rdmsr, wrmsr};

const EFER_NXE: u64 = 1 << 11;

/// Enable no-execute support before the first NX page-table entry is
/// written; with NXE clear, bit 63 is reserved and every access would fault.
pub fn enable_nxe() {
    unsafe {
        wrmsr(IA32_EFER, rdmsr(IA32_EFER) | EFER_NXE);
    }

    log::info!("EFER.NXE enabled");
}
