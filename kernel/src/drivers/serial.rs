/*
 * Serial Port Driver (COM1)
 *
 * Minimal 16550 UART driver used for kernel log output. The terminal on the
 * VGA text buffer is user-facing; everything the kernel says about itself
 * goes out over the serial line where it can be captured.
 */

use core::fmt;
use spin::Mutex;
use x86_64::instructions::port::Port;

const COM1: u16 = 0x3f8;

pub struct SerialPort {
    data: Port<u8>,
    int_enable: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        SerialPort {
            data: Port::new(base),
            int_enable: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_status: Port::new(base + 5),
        }
    }

    fn init(&mut self) {
        unsafe {
            self.int_enable.write(0x00); // no interrupts, we poll
            self.line_ctrl.write(0x80); // DLAB on
            self.data.write(0x03); // divisor low: 38400 baud
            self.int_enable.write(0x00); // divisor high
            self.line_ctrl.write(0x03); // 8n1, DLAB off
            self.fifo_ctrl.write(0xc7); // FIFO on, cleared, 14-byte threshold
            self.modem_ctrl.write(0x0b); // DTR + RTS + OUT2
        }
    }

    fn write_byte(&mut self, byte: u8) {
        unsafe {
            // Wait until the transmit holding register is empty.
            while self.line_status.read() & 0x20 == 0 {
                core::hint::spin_loop();
            }
            self.data.write(byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

static SERIAL: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));

/// Bring up COM1. Must run before the logger is installed.
pub fn init() {
    SERIAL.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    // Logging can happen anywhere, including the idle loop; take the lock
    // with interrupts masked so an IRQ handler cannot deadlock against us.
    x86_64::instructions::interrupts::without_interrupts(|| {
        let _ = SERIAL.lock().write_fmt(args);
    });
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::drivers::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => { $crate::serial_print!("\n") };
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}
