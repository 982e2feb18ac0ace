/*
 * VGA Text Terminal
 *
 * 80x25 text mode at physical 0xB8000, reached through the kernel-offset
 * alias. Each cell is an ASCII byte plus a colour byte (foreground low
 * nibble, background high nibble, 16 colours).
 *
 * The writer understands a small subset of ANSI CSI sequences, enough for
 * coloured output from user programs: `\x1b[...m` with parameters 0 (reset),
 * 1 (bright), 30-37 / 90-97 (foreground) and 40-47 / 100-107 (background).
 * Unknown sequences are consumed and dropped.
 */

use core::fmt;
use core::ptr::{read_volatile, write_volatile};

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::config::KERNEL_OFFSET;

const BUFFER_WIDTH: usize = 80;
const BUFFER_HEIGHT: usize = 25;
const VGA_BUFFER: u64 = 0xb8000 + KERNEL_OFFSET;

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

/// ANSI colour index (0-7) to VGA colour number.
const ANSI_TO_VGA: [u8; 8] = [0, 4, 2, 6, 1, 5, 3, 7];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct ColorCode(u8);

impl ColorCode {
    const fn new(foreground: Color, background: Color) -> ColorCode {
        ColorCode((background as u8) << 4 | foreground as u8)
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct ScreenChar {
    ascii: u8,
    color: ColorCode,
}

const DEFAULT_COLOR: ColorCode = ColorCode::new(Color::LightGray, Color::Black);

enum AnsiState {
    Normal,
    Escape,
    Csi { params: [u16; 4], count: usize },
}

pub struct Terminal {
    row: usize,
    column: usize,
    color: ColorCode,
    ansi: AnsiState,
}

impl Terminal {
    const fn new() -> Terminal {
        Terminal {
            row: 0,
            column: 0,
            color: DEFAULT_COLOR,
            ansi: AnsiState::Normal,
        }
    }

    fn cell(row: usize, column: usize) -> *mut ScreenChar {
        (VGA_BUFFER as *mut ScreenChar).wrapping_add(row * BUFFER_WIDTH + column)
    }

    pub fn clear(&mut self) {
        let blank = ScreenChar {
            ascii: b' ',
            color: self.color,
        };

        for row in 0..BUFFER_HEIGHT {
            for column in 0..BUFFER_WIDTH {
                unsafe { write_volatile(Terminal::cell(row, column), blank) };
            }
        }

        self.row = 0;
        self.column = 0;
        self.update_cursor();
    }

    pub fn write_byte(&mut self, byte: u8) {
        match self.ansi {
            AnsiState::Normal => match byte {
                0x1b => self.ansi = AnsiState::Escape,
                b'\n' => self.newline(),
                b'\r' => self.column = 0,
                0x08 => {
                    // Backspace: erase the previous cell on this line.
                    if self.column > 0 {
                        self.column -= 1;
                        let blank = ScreenChar {
                            ascii: b' ',
                            color: self.color,
                        };
                        unsafe { write_volatile(Terminal::cell(self.row, self.column), blank) };
                    }
                }
                byte => {
                    if self.column >= BUFFER_WIDTH {
                        self.newline();
                    }

                    let cell = ScreenChar {
                        ascii: byte,
                        color: self.color,
                    };
                    unsafe { write_volatile(Terminal::cell(self.row, self.column), cell) };

                    self.column += 1;
                }
            },

            AnsiState::Escape => {
                if byte == b'[' {
                    self.ansi = AnsiState::Csi {
                        params: [0; 4],
                        count: 0,
                    };
                } else {
                    self.ansi = AnsiState::Normal;
                }
            }

            AnsiState::Csi {
                ref mut params,
                ref mut count,
            } => match byte {
                b'0'..=b'9' => {
                    let index = (*count).min(params.len() - 1);
                    params[index] = params[index].saturating_mul(10) + (byte - b'0') as u16;
                }
                b';' => {
                    if *count < params.len() {
                        *count += 1;
                    }
                }
                b'm' => {
                    let n = (*count + 1).min(params.len());
                    let params = *params;
                    self.apply_sgr(&params[..n]);
                    self.ansi = AnsiState::Normal;
                }
                _ => {
                    // Any other final byte ends a sequence we don't handle.
                    self.ansi = AnsiState::Normal;
                }
            },
        }

        self.update_cursor();
    }

    fn apply_sgr(&mut self, params: &[u16]) {
        for &param in params {
            let fg = self.color.0 & 0x0f;
            let bg = self.color.0 >> 4;

            match param {
                0 => self.color = DEFAULT_COLOR,
                1 => self.color = ColorCode(bg << 4 | fg | 0x08),
                30..=37 => {
                    self.color = ColorCode(bg << 4 | ANSI_TO_VGA[(param - 30) as usize]);
                }
                90..=97 => {
                    self.color = ColorCode(bg << 4 | ANSI_TO_VGA[(param - 90) as usize] | 0x08);
                }
                40..=47 => {
                    self.color = ColorCode(ANSI_TO_VGA[(param - 40) as usize] << 4 | fg);
                }
                100..=107 => {
                    self.color =
                        ColorCode((ANSI_TO_VGA[(param - 100) as usize] | 0x08) << 4 | fg);
                }
                _ => {}
            }
        }
    }

    fn newline(&mut self) {
        self.column = 0;

        if self.row + 1 < BUFFER_HEIGHT {
            self.row += 1;
            return;
        }

        // Scroll everything up one line and blank the last row.
        for row in 1..BUFFER_HEIGHT {
            for column in 0..BUFFER_WIDTH {
                let cell = unsafe { read_volatile(Terminal::cell(row, column)) };
                unsafe { write_volatile(Terminal::cell(row - 1, column), cell) };
            }
        }

        let blank = ScreenChar {
            ascii: b' ',
            color: self.color,
        };

        for column in 0..BUFFER_WIDTH {
            unsafe { write_volatile(Terminal::cell(BUFFER_HEIGHT - 1, column), blank) };
        }
    }

    fn update_cursor(&self) {
        let position = (self.row * BUFFER_WIDTH + self.column) as u16;

        unsafe {
            let mut index = Port::<u8>::new(0x3d4);
            let mut data = Port::<u8>::new(0x3d5);

            index.write(0x0f);
            data.write((position & 0xff) as u8);
            index.write(0x0e);
            data.write((position >> 8) as u8);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.write_byte(byte);
        }
    }
}

impl fmt::Write for Terminal {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

lazy_static! {
    pub static ref TERMINAL: Mutex<Terminal> = Mutex::new(Terminal::new());
}

/// Clear the screen and print the boot banner line.
pub fn init() {
    TERMINAL.lock().clear();
}

/// Write raw bytes from the `twrite` syscall.
pub fn write_bytes(bytes: &[u8]) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        TERMINAL.lock().write_bytes(bytes);
    });
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    x86_64::instructions::interrupts::without_interrupts(|| {
        let _ = TERMINAL.lock().write_fmt(args);
    });
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::drivers::vga::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}
