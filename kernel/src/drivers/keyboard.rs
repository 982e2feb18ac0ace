/*
 * Keyboard Event Queue
 *
 * The IRQ path decodes scancodes (set 1, US layout, via pc_keyboard) into
 * events and enqueues them into a fixed 1024-entry ring; `key_get` drains
 * the ring, sleeping while it is empty. Each enqueue wakes the registered
 * waiter, so a blocked reader returns within one scheduler tick of the
 * keystroke.
 *
 * The event layout is user-visible ABI (the `key_get` syscall copies it out
 * verbatim).
 */

use heapless::Deque;
use pc_keyboard::{DecodedKey, HandleControl, KeyState, Keyboard, ScancodeSet1, layouts};
use spin::Mutex;

use crate::scheduler::{self, ProcessId};

pub const EVENT_PRESSED: u8 = 1 << 0;
pub const EVENT_CTRL: u8 = 1 << 1;
pub const EVENT_ALT: u8 = 1 << 2;
pub const EVENT_SHIFT: u8 = 1 << 3;

/// One keyboard event as delivered to user space.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyEvent {
    /// Decoder key code.
    pub keycode: u8,
    /// Translated character, 0 when the key has none.
    pub keychar: u8,
    /// EVENT_* bits.
    pub flags: u8,
}

const QUEUE_SIZE: usize = 1024;

struct KeyboardState {
    decoder: Keyboard<layouts::Us104Key, ScancodeSet1>,
    queue: Deque<KeyEvent, QUEUE_SIZE>,
    waiter: Option<ProcessId>,
    ctrl_down: bool,
    alt_down: bool,
    shift_down: bool,
}

static KEYBOARD: Mutex<Option<KeyboardState>> = Mutex::new(None);

pub fn init() {
    *KEYBOARD.lock() = Some(KeyboardState {
        decoder: Keyboard::new(ScancodeSet1::new(), layouts::Us104Key, HandleControl::Ignore),
        queue: Deque::new(),
        waiter: None,
        ctrl_down: false,
        alt_down: false,
        shift_down: false,
    });

    log::info!("keyboard queue ready ({} entries)", QUEUE_SIZE);
}

/// Decode one scancode byte and enqueue the resulting event. Runs in IRQ
/// context; interrupts are already disabled.
pub fn handle_scancode(scancode: u8) {
    let mut guard = KEYBOARD.lock();
    let Some(state) = guard.as_mut() else {
        return;
    };

    // Track modifiers off the raw set 1 codes (bit 7 is the release bit)
    // before the decoder consumes the byte.
    let make = scancode & 0x80 == 0;
    match scancode & 0x7f {
        0x1d => state.ctrl_down = make,
        0x2a | 0x36 => state.shift_down = make,
        0x38 => state.alt_down = make,
        _ => {}
    }

    let Ok(Some(key_event)) = state.decoder.add_byte(scancode) else {
        return;
    };

    let pressed = key_event.state != KeyState::Up;

    let keychar = match state.decoder.process_keyevent(key_event) {
        Some(DecodedKey::Unicode(character)) if character.is_ascii() => character as u8,
        _ => 0,
    };

    let mut flags = 0;
    if pressed {
        flags |= EVENT_PRESSED;
    }
    if state.ctrl_down {
        flags |= EVENT_CTRL;
    }
    if state.alt_down {
        flags |= EVENT_ALT;
    }
    if state.shift_down {
        flags |= EVENT_SHIFT;
    }

    let event = KeyEvent {
        keycode: scancode & 0x7f,
        keychar,
        flags,
    };

    if state.queue.push_back(event).is_err() {
        log::warn!("dropping key event, queue full ({} entries)", QUEUE_SIZE);
        return;
    }

    let waiter = state.waiter.take();

    // Wake outside the lock; the waiter will re-lock to dequeue.
    drop(guard);

    if let Some(pid) = waiter {
        scheduler::wake(pid);
    }
}

/// Non-blocking dequeue.
pub fn dequeue() -> Option<KeyEvent> {
    let mut guard = KEYBOARD.lock();

    guard.as_mut().and_then(|state| state.queue.pop_front())
}

/// Blocking dequeue on behalf of the current process: registers it as the
/// waiter and sleeps until an enqueue wakes it.
pub fn wait_dequeue() -> KeyEvent {
    loop {
        if let Some(event) = dequeue() {
            return event;
        }

        {
            let mut guard = KEYBOARD.lock();

            if let Some(state) = guard.as_mut() {
                state.waiter = Some(scheduler::current_id());
            }
        }

        scheduler::sleep();
    }
}
