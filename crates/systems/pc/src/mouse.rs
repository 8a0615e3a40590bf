//! Microsoft Mouse Driver (INT 33h)
//!
//! The host feeds absolute positions and button state through
//! [`Mouse::set_state`]; programs poll them through INT 33h. Only the
//! polling interface is provided, there is no user event handler and no
//! cursor drawing.

use crate::machine::Machine;
use crate::PcError;
use xtemu_core::logging::{log, LogCategory, LogLevel};

pub const MOUSE_VECTOR: u8 = 0x33;
const BUTTON_COUNT: usize = 3;

/// Per-button press or release bookkeeping for functions 05h/06h
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ButtonEvents {
    count: u16,
    x: u16,
    y: u16,
}

impl ButtonEvents {
    fn record(&mut self, x: u16, y: u16) {
        self.count = self.count.saturating_add(1);
        self.x = x;
        self.y = y;
    }

    /// Return and clear the count.
    fn take(&mut self) -> ButtonEvents {
        let events = *self;
        self.count = 0;
        events
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mouse {
    x: u16,
    y: u16,
    /// Bit 0 left, bit 1 right, bit 2 middle
    buttons: u16,
    /// Cursor shown when zero; starts hidden at -1
    visibility: i16,
    min_x: u16,
    max_x: u16,
    min_y: u16,
    max_y: u16,
    /// Mickeys per 8 pixels
    mickey_ratio: (u16, u16),
    presses: [ButtonEvents; BUTTON_COUNT],
    releases: [ButtonEvents; BUTTON_COUNT],
}

impl Mouse {
    pub fn new() -> Self {
        Self {
            x: 0,
            y: 0,
            buttons: 0,
            visibility: -1,
            min_x: 0,
            max_x: 639,
            min_y: 0,
            max_y: 199,
            mickey_ratio: (8, 16),
            presses: [ButtonEvents::default(); BUTTON_COUNT],
            releases: [ButtonEvents::default(); BUTTON_COUNT],
        }
    }

    /// Function 00h: driver defaults with the cursor centred and hidden.
    pub fn reset(&mut self) {
        *self = Self::new();
        self.x = (self.min_x + self.max_x) / 2 + 1;
        self.y = (self.min_y + self.max_y) / 2 + 1;
    }

    pub fn position(&self) -> (u16, u16) {
        (self.x, self.y)
    }

    pub fn buttons(&self) -> u16 {
        self.buttons
    }

    pub fn is_cursor_visible(&self) -> bool {
        self.visibility >= 0
    }

    pub fn mickey_ratio(&self) -> (u16, u16) {
        self.mickey_ratio
    }

    /// Host input: absolute position plus the button bits.
    pub fn set_state(&mut self, x: u16, y: u16, buttons: u16) {
        self.set_position(x, y);
        for i in 0..BUTTON_COUNT {
            let mask = 1 << i;
            let was = self.buttons & mask != 0;
            let now = buttons & mask != 0;
            if now && !was {
                self.presses[i].record(self.x, self.y);
            } else if was && !now {
                self.releases[i].record(self.x, self.y);
            }
        }
        self.buttons = buttons & 0x07;
    }

    fn set_position(&mut self, x: u16, y: u16) {
        self.x = x.clamp(self.min_x, self.max_x);
        self.y = y.clamp(self.min_y, self.max_y);
    }

    fn set_horizontal_range(&mut self, a: u16, b: u16) {
        self.min_x = a.min(b);
        self.max_x = a.max(b);
        self.x = self.x.clamp(self.min_x, self.max_x);
    }

    fn set_vertical_range(&mut self, a: u16, b: u16) {
        self.min_y = a.min(b);
        self.max_y = a.max(b);
        self.y = self.y.clamp(self.min_y, self.max_y);
    }
}

impl Default for Mouse {
    fn default() -> Self {
        Self::new()
    }
}

pub fn install(m: &mut Machine) {
    m.install_callback(MOUSE_VECTOR, "INT 33h", int33);
}

fn int33(m: &mut Machine) -> Result<(), PcError> {
    let function = m.cpu.ax;
    log(LogCategory::Bios, LogLevel::Trace, || {
        format!("INT 33h AX={:04X}", function)
    });

    let mouse = &mut m.mouse;
    let cpu = &mut m.cpu;
    match function {
        0x0000 => {
            mouse.reset();
            cpu.ax = 0xFFFF;
            cpu.bx = BUTTON_COUNT as u16;
        }
        0x0001 => {
            if mouse.visibility < 0 {
                mouse.visibility += 1;
            }
        }
        0x0002 => mouse.visibility -= 1,
        0x0003 => {
            cpu.bx = mouse.buttons;
            // the 640 pixel virtual screen has no odd columns
            cpu.cx = mouse.x & !1;
            cpu.dx = mouse.y;
        }
        0x0004 => mouse.set_position(cpu.cx, cpu.dx),
        0x0005 | 0x0006 => {
            let button = cpu.bx as usize;
            let events = if button >= BUTTON_COUNT {
                ButtonEvents::default()
            } else if function == 0x0005 {
                mouse.presses[button].take()
            } else {
                mouse.releases[button].take()
            };
            cpu.ax = mouse.buttons;
            cpu.bx = events.count;
            cpu.cx = events.x;
            cpu.dx = events.y;
        }
        0x0007 => mouse.set_horizontal_range(cpu.cx, cpu.dx),
        0x0008 => mouse.set_vertical_range(cpu.cx, cpu.dx),
        0x000F => mouse.mickey_ratio = (cpu.cx, cpu.dx),
        _ => {
            return Err(PcError::Unimplemented(format!(
                "INT 33h AX={:04X}",
                function
            )))
        }
    }

    m.cpu.iret();
    Ok(())
}
