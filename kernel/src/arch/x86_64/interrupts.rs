/*
 * Hardware Interrupt Plumbing
 *
 * Remaps the two 8259 PICs away from the exception range, programs the PIT
 * for a periodic tick and hosts the IRQ handlers. The timer drives the
 * scheduler; the keyboard feeds the event queue.
 *
 * IRQs only ever arrive while user code runs or while the scheduler idles
 * in its sti/hlt window, so the handlers may call into the scheduler
 * without further locking.
 */

use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::instructions::port::Port;
use x86_64::structures::idt::InterruptStackFrame;

use crate::drivers::keyboard;
use crate::scheduler;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub const IRQ_TIMER: u8 = PIC_1_OFFSET;
pub const IRQ_KEYBOARD: u8 = PIC_1_OFFSET + 1;

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Timer ticks since boot.
static mut TICKS: u64 = 0;

/// Remap the PICs, unmask timer and keyboard, program the PIT. Interrupts
/// stay disabled until the first process enters user space.
pub fn init() {
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();

        // Only IRQ0 (timer) and IRQ1 (keyboard) are in use.
        pics.write_masks(0xfc, 0xff);
    }

    init_pit(100);

    log::info!("PIC remapped to {}..{}", PIC_1_OFFSET, PIC_2_OFFSET + 8);
}

/// Program PIT channel 0 for a periodic interrupt at `frequency_hz`.
fn init_pit(frequency_hz: u32) {
    const PIT_BASE_HZ: u32 = 1_193_182;

    let divisor = (PIT_BASE_HZ / frequency_hz) as u16;

    unsafe {
        let mut command = Port::<u8>::new(0x43);
        let mut channel0 = Port::<u8>::new(0x40);

        // Channel 0, lo/hi access, mode 3 (square wave), binary.
        command.write(0x36);
        channel0.write((divisor & 0xff) as u8);
        channel0.write((divisor >> 8) as u8);
    }

    log::info!("PIT configured for {} Hz", frequency_hz);
}

pub fn ticks() -> u64 {
    unsafe { *(&raw const TICKS) }
}

pub(super) extern "x86-interrupt" fn timer_interrupt(_frame: InterruptStackFrame) {
    unsafe {
        *(&raw mut TICKS) += 1;

        // EOI before the tick: the scheduler may switch away and not come
        // back here for a long time.
        PICS.lock().notify_end_of_interrupt(IRQ_TIMER);
    }

    scheduler::tick();
}

pub(super) extern "x86-interrupt" fn keyboard_interrupt(_frame: InterruptStackFrame) {
    let scancode: u8 = unsafe { Port::new(0x60).read() };

    keyboard::handle_scancode(scancode);

    unsafe {
        PICS.lock().notify_end_of_interrupt(IRQ_KEYBOARD);
    }
}
