//! PC keyboard controller
//!
//! Host key events are translated to scan code set 1 make/break sequences
//! and queued. The controller moves one byte into its output buffer every
//! millisecond, sets the output-buffer-full status bit and raises INT 09h.
//! Reading the data port clears the status bit and arms the next transfer.
//!
//! Ports (relative to 0x60): 0 data, 4 status.

use std::collections::{HashSet, VecDeque};
use xtemu_core::logging::{log, LogCategory, LogLevel};
use xtemu_core::{Device, NEVER};

/// Controller clock in MHz
pub const KEYBOARD_FREQUENCY_MHZ: f64 = 20.0;

/// Interrupt vector raised when a byte lands in the output buffer
pub const KEYBOARD_VECTOR: u8 = 0x09;

/// Status register bit 0
pub const STATUS_OUTPUT_BUFFER_FULL: u8 = 0x01;

/// Cycles between two bytes delivered to the output buffer (1 ms)
const TRANSFER_CYCLES: u64 = 1000 * KEYBOARD_FREQUENCY_MHZ as u64;

/// Keys of a 101-key keyboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Escape,
    Num1,
    Num2,
    Num3,
    Num4,
    Num5,
    Num6,
    Num7,
    Num8,
    Num9,
    Num0,
    Minus,
    Equals,
    Backspace,
    Tab,
    Q,
    W,
    E,
    R,
    T,
    Y,
    U,
    I,
    O,
    P,
    LeftBracket,
    RightBracket,
    Enter,
    LeftCtrl,
    A,
    S,
    D,
    F,
    G,
    H,
    J,
    K,
    L,
    Semicolon,
    Apostrophe,
    Backtick,
    LeftShift,
    Backslash,
    Z,
    X,
    C,
    V,
    B,
    N,
    M,
    Comma,
    Period,
    Slash,
    RightShift,
    KeypadMultiply,
    LeftAlt,
    Space,
    CapsLock,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    F8,
    F9,
    F10,
    NumLock,
    ScrollLock,
    Keypad7,
    Keypad8,
    Keypad9,
    KeypadMinus,
    Keypad4,
    Keypad5,
    Keypad6,
    KeypadPlus,
    Keypad1,
    Keypad2,
    Keypad3,
    Keypad0,
    KeypadPeriod,
    F11,
    F12,
    KeypadEnter,
    RightCtrl,
    KeypadDivide,
    RightAlt,
    Home,
    Up,
    PageUp,
    Left,
    Right,
    End,
    Down,
    PageDown,
    Insert,
    Delete,
    LeftSuper,
    RightSuper,
    Menu,
    PrintScreen,
    Pause,
}

impl Key {
    /// Set 1 scan code, and whether it carries the `E0` prefix.
    fn code(self) -> (u8, bool) {
        use Key::*;
        match self {
            Escape => (0x01, false),
            Num1 => (0x02, false),
            Num2 => (0x03, false),
            Num3 => (0x04, false),
            Num4 => (0x05, false),
            Num5 => (0x06, false),
            Num6 => (0x07, false),
            Num7 => (0x08, false),
            Num8 => (0x09, false),
            Num9 => (0x0A, false),
            Num0 => (0x0B, false),
            Minus => (0x0C, false),
            Equals => (0x0D, false),
            Backspace => (0x0E, false),
            Tab => (0x0F, false),
            Q => (0x10, false),
            W => (0x11, false),
            E => (0x12, false),
            R => (0x13, false),
            T => (0x14, false),
            Y => (0x15, false),
            U => (0x16, false),
            I => (0x17, false),
            O => (0x18, false),
            P => (0x19, false),
            LeftBracket => (0x1A, false),
            RightBracket => (0x1B, false),
            Enter => (0x1C, false),
            LeftCtrl => (0x1D, false),
            A => (0x1E, false),
            S => (0x1F, false),
            D => (0x20, false),
            F => (0x21, false),
            G => (0x22, false),
            H => (0x23, false),
            J => (0x24, false),
            K => (0x25, false),
            L => (0x26, false),
            Semicolon => (0x27, false),
            Apostrophe => (0x28, false),
            Backtick => (0x29, false),
            LeftShift => (0x2A, false),
            Backslash => (0x2B, false),
            Z => (0x2C, false),
            X => (0x2D, false),
            C => (0x2E, false),
            V => (0x2F, false),
            B => (0x30, false),
            N => (0x31, false),
            M => (0x32, false),
            Comma => (0x33, false),
            Period => (0x34, false),
            Slash => (0x35, false),
            RightShift => (0x36, false),
            KeypadMultiply => (0x37, false),
            LeftAlt => (0x38, false),
            Space => (0x39, false),
            CapsLock => (0x3A, false),
            F1 => (0x3B, false),
            F2 => (0x3C, false),
            F3 => (0x3D, false),
            F4 => (0x3E, false),
            F5 => (0x3F, false),
            F6 => (0x40, false),
            F7 => (0x41, false),
            F8 => (0x42, false),
            F9 => (0x43, false),
            F10 => (0x44, false),
            NumLock => (0x45, false),
            ScrollLock => (0x46, false),
            Keypad7 => (0x47, false),
            Keypad8 => (0x48, false),
            Keypad9 => (0x49, false),
            KeypadMinus => (0x4A, false),
            Keypad4 => (0x4B, false),
            Keypad5 => (0x4C, false),
            Keypad6 => (0x4D, false),
            KeypadPlus => (0x4E, false),
            Keypad1 => (0x4F, false),
            Keypad2 => (0x50, false),
            Keypad3 => (0x51, false),
            Keypad0 => (0x52, false),
            KeypadPeriod => (0x53, false),
            F11 => (0x57, false),
            F12 => (0x58, false),
            KeypadEnter => (0x1C, true),
            RightCtrl => (0x1D, true),
            KeypadDivide => (0x35, true),
            RightAlt => (0x38, true),
            Home => (0x47, true),
            Up => (0x48, true),
            PageUp => (0x49, true),
            Left => (0x4B, true),
            Right => (0x4D, true),
            End => (0x4F, true),
            Down => (0x50, true),
            PageDown => (0x51, true),
            Insert => (0x52, true),
            Delete => (0x53, true),
            LeftSuper => (0x5B, true),
            RightSuper => (0x5C, true),
            Menu => (0x5D, true),
            PrintScreen => (0x37, true),
            Pause => (0x45, true),
        }
    }

    /// Bytes sent when the key goes down.
    pub fn make_sequence(self) -> Vec<u8> {
        match self {
            Key::PrintScreen => vec![0xE0, 0x2A, 0xE0, 0x37],
            Key::Pause => vec![0xE1, 0x1D, 0x45, 0xE1, 0x9D, 0xC5],
            _ => match self.code() {
                (code, true) => vec![0xE0, code],
                (code, false) => vec![code],
            },
        }
    }

    /// Bytes sent when the key is released. Pause has none.
    pub fn break_sequence(self) -> Vec<u8> {
        match self {
            Key::PrintScreen => vec![0xE0, 0xB7, 0xE0, 0xAA],
            Key::Pause => Vec::new(),
            _ => match self.code() {
                (code, true) => vec![0xE0, code | 0x80],
                (code, false) => vec![code | 0x80],
            },
        }
    }
}

/// PC keyboard controller
pub struct Keyboard {
    /// Scan code bytes waiting for the output buffer
    buffer: VecDeque<u8>,
    held: HashSet<Key>,
    data_output_buffer: u8,
    status: u8,
    /// Cycles until the next byte moves to the output buffer
    next_event: Option<u64>,
    pending_irq: bool,
}

impl Keyboard {
    /// Create a new keyboard controller
    pub fn new() -> Self {
        Self {
            buffer: VecDeque::with_capacity(16),
            held: HashSet::new(),
            data_output_buffer: 0,
            status: 0,
            next_event: None,
            pending_irq: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Queue the make sequence of `key`. Ignored while the key is held.
    pub fn key_down(&mut self, key: Key) {
        if !self.held.insert(key) {
            return;
        }
        self.enqueue(&key.make_sequence());
    }

    /// Queue the break sequence of `key`. Ignored if the key is not held.
    pub fn key_up(&mut self, key: Key) {
        if !self.held.remove(&key) {
            return;
        }
        self.enqueue(&key.break_sequence());
    }

    fn enqueue(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes.iter().copied());
        if self.next_event.is_none() && self.status & STATUS_OUTPUT_BUFFER_FULL == 0 {
            self.next_event = Some(TRANSFER_CYCLES);
        }
    }

    /// Read a controller port (`addr` relative to 0x60).
    pub fn read(&mut self, addr: u16) -> u8 {
        match addr {
            0 => {
                if self.status & STATUS_OUTPUT_BUFFER_FULL != 0 {
                    self.status &= !STATUS_OUTPUT_BUFFER_FULL;
                    if !self.buffer.is_empty() {
                        self.next_event = Some(TRANSFER_CYCLES);
                    }
                }
                self.data_output_buffer
            }
            4 => self.status,
            _ => {
                log(LogCategory::Devices, LogLevel::Debug, || {
                    format!("keyboard: unhandled read @ {:02X}", addr)
                });
                0
            }
        }
    }

    /// Write a controller port. The controller accepts no commands.
    pub fn write(&mut self, addr: u16, value: u8) {
        log(LogCategory::Devices, LogLevel::Debug, || {
            format!("keyboard: unhandled write @ {:02X} <- {:02X}", addr, value)
        });
    }

    /// Take the pending keyboard interrupt, if any.
    pub fn take_irq(&mut self) -> bool {
        std::mem::take(&mut self.pending_irq)
    }

    /// Bytes still waiting behind the output buffer.
    pub fn queued(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Keyboard {
    fn frequency_in_mhz(&self) -> f64 {
        KEYBOARD_FREQUENCY_MHZ
    }

    fn next_cycles(&mut self) -> u64 {
        self.next_event.unwrap_or(NEVER)
    }

    fn run_cycles(&mut self, cycles: u64) -> u64 {
        let Some(remaining) = self.next_event else {
            return cycles;
        };

        let used = cycles.min(remaining);
        if used < remaining {
            self.next_event = Some(remaining - used);
            return used;
        }

        self.next_event = None;
        if let Some(byte) = self.buffer.pop_front() {
            self.data_output_buffer = byte;
            self.status |= STATUS_OUTPUT_BUFFER_FULL;
            self.pending_irq = true;
        }
        used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyboard_creation() {
        let mut kb = Keyboard::new();
        assert_eq!(kb.next_cycles(), NEVER);
        assert_eq!(kb.read(4), 0);
    }

    #[test]
    fn test_make_and_break_sequences() {
        assert_eq!(Key::A.make_sequence(), vec![0x1E]);
        assert_eq!(Key::A.break_sequence(), vec![0x9E]);
        assert_eq!(Key::I.break_sequence(), vec![0x97]);
        assert_eq!(Key::Home.make_sequence(), vec![0xE0, 0x47]);
        assert_eq!(Key::Home.break_sequence(), vec![0xE0, 0xC7]);
        assert_eq!(Key::RightCtrl.break_sequence(), vec![0xE0, 0x9D]);
        assert!(Key::Pause.break_sequence().is_empty());
    }

    #[test]
    fn test_byte_delivered_after_one_millisecond() {
        let mut kb = Keyboard::new();
        kb.key_down(Key::Escape);
        assert_eq!(kb.next_cycles(), 20_000);

        assert_eq!(kb.run_cycles(19_999), 19_999);
        assert_eq!(kb.read(4) & STATUS_OUTPUT_BUFFER_FULL, 0);
        assert!(!kb.take_irq());

        assert_eq!(kb.run_cycles(5), 1);
        assert!(kb.take_irq());
        assert_eq!(kb.read(4) & STATUS_OUTPUT_BUFFER_FULL, 1);
        assert_eq!(kb.read(0), 0x01);
        assert_eq!(kb.read(4) & STATUS_OUTPUT_BUFFER_FULL, 0);
        // queue drained
        assert_eq!(kb.next_cycles(), NEVER);
    }

    #[test]
    fn test_held_key_is_not_repeated() {
        let mut kb = Keyboard::new();
        kb.key_down(Key::A);
        kb.key_down(Key::A);
        assert_eq!(kb.queued(), 1);
        kb.key_up(Key::A);
        kb.key_up(Key::A);
        assert_eq!(kb.queued(), 2);
    }

    #[test]
    fn test_extended_key_takes_two_transfers() {
        let mut kb = Keyboard::new();
        kb.key_down(Key::Up);
        kb.run_cycles(TRANSFER_CYCLES);
        assert_eq!(kb.read(0), 0xE0);
        // reading the data port arms the next byte
        assert_eq!(kb.next_cycles(), TRANSFER_CYCLES);
        kb.run_cycles(TRANSFER_CYCLES);
        assert_eq!(kb.read(0), 0x48);
    }

    #[test]
    fn test_output_buffer_holds_until_read() {
        let mut kb = Keyboard::new();
        kb.key_down(Key::B);
        kb.run_cycles(TRANSFER_CYCLES);
        kb.key_up(Key::B);
        // output buffer still full, so nothing is scheduled
        assert_eq!(kb.next_cycles(), NEVER);
        assert_eq!(kb.read(0), 0x30);
        kb.run_cycles(TRANSFER_CYCLES);
        assert_eq!(kb.read(0), 0xB0);
    }
}
