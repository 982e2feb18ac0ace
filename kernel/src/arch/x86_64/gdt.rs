/*
 * Global Descriptor Table
 *
 * Flat segments plus a TSS. The descriptor order is load-bearing for the
 * syscall fast path: STAR takes the kernel and user selector bases, and the
 * CPU derives the rest by fixed offsets.
 *
 *   0x08 kernel code   (SYSCALL loads CS from STAR[47:32])
 *   0x10 kernel data   (SYSCALL loads SS = kernel base + 8)
 *   0x18 TSS           (two slots)
 *   0x28 user data     (SYSRET loads SS = user base + 8)
 *   0x30 user code     (SYSRET loads CS = user base + 16)
 *
 * so STAR carries kernel base 0x08 and user base 0x20.
 *
 * TSS.rsp0 is the stack the CPU switches to when an interrupt arrives in
 * ring 3; the scheduler rebinds it to the incoming process's kernel stack
 * on every switch.
 */

use lazy_static::lazy_static;
use x86_64::VirtAddr;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// STAR selector bases, fixed by the descriptor order above.
pub const STAR_KERNEL_BASE: u16 = 0x08;
pub const STAR_USER_BASE: u16 = 0x20;

/// Ring 3 selectors with RPL set, as pushed in iretq frames.
pub const USER_CS: u16 = 0x33;
pub const USER_SS: u16 = 0x2b;

static mut TSS: TaskStateSegment = TaskStateSegment::new();

fn tss_ref() -> &'static TaskStateSegment {
    unsafe { &*(&raw const TSS) }
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        unsafe {
            let tss = &mut *(&raw mut TSS);

            tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
                const STACK_SIZE: usize = 4096;
                static mut STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];

                VirtAddr::from_ptr(&raw const STACK) + STACK_SIZE as u64
            };
        }

        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(tss_ref()));
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());

        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                tss_selector,
                user_data,
                user_code,
            },
        )
    };
}

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    tss_selector: SegmentSelector,
    user_data: SegmentSelector,
    user_code: SegmentSelector,
}

/// Load the GDT, reload every segment register and load the TSS.
pub fn init() {
    use x86_64::instructions::segmentation::{CS, DS, ES, FS, GS, SS, Segment};
    use x86_64::instructions::tables::load_tss;

    GDT.0.load();

    unsafe {
        CS::set_reg(GDT.1.kernel_code);

        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        FS::set_reg(GDT.1.kernel_data);
        GS::set_reg(GDT.1.kernel_data);

        load_tss(GDT.1.tss_selector);
    }

    assert!(GDT.1.kernel_code.0 == STAR_KERNEL_BASE);
    assert!(GDT.1.user_code.0 == USER_CS);
    assert!(GDT.1.user_data.0 == USER_SS);

    log::info!("GDT and TSS loaded");
}

/// Ring 3 code selector (RPL already set).
pub fn user_code_selector() -> SegmentSelector {
    GDT.1.user_code
}

/// Ring 3 data selector (RPL already set).
pub fn user_data_selector() -> SegmentSelector {
    GDT.1.user_data
}

/// Rebind the ring 0 stack used when an interrupt arrives from user mode.
/// Called by the scheduler on every process switch.
pub fn set_kernel_stack(top: VirtAddr) {
    unsafe {
        (*(&raw mut TSS)).privilege_stack_table[0] = top;
    }
}
