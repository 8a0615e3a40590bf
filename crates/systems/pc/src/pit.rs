//! Intel 8253/8254 Programmable Interval Timer (PIT)
//!
//! Three counters clocked at 1.193182 MHz. Counter 0 drives the system
//! timer interrupt (INT 08h) and is armed with the maximum count at power-on,
//! giving the familiar ~18.2 Hz tick. Counters 1 and 2 count but have no
//! outputs wired up.
//!
//! Ports (relative to 0x40): 0-2 counter data, 3 control word.

use xtemu_core::logging::{log, LogCategory, LogLevel};
use xtemu_core::{Device, NEVER};

/// PIT input clock in MHz
pub const PIT_FREQUENCY_MHZ: f64 = 1.193_181_818_181_818_1;

/// Interrupt vector raised when counter 0 reaches terminal count
pub const TIMER_VECTOR: u8 = 0x08;

/// How the counter's 16-bit registers are transferred over the 8-bit port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    LowByte,
    HighByte,
    /// Low byte then high byte, as two separate transfers
    LowHigh,
}

impl AccessMode {
    /// Decode the RW field of a control word. `0` is the latch command and
    /// has no access mode.
    fn from_rw(rw: u8) -> Option<Self> {
        match rw {
            1 => Some(AccessMode::LowByte),
            2 => Some(AccessMode::HighByte),
            3 => Some(AccessMode::LowHigh),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Counter {
    activated: bool,
    /// Running count. Zero written to the count register counts as 65536.
    counting_element: u32,
    count_register: u16,
    output_latch: u16,
    access: AccessMode,
    /// Next transfer of a low/high pair is the high byte
    write_high_next: bool,
    read_high_next: bool,
    mode: u8,
    bcd: bool,
}

impl Counter {
    fn new() -> Self {
        Self {
            activated: false,
            counting_element: 0,
            count_register: 0,
            output_latch: 0,
            access: AccessMode::LowHigh,
            write_high_next: false,
            read_high_next: false,
            mode: 0,
            bcd: false,
        }
    }

    fn reload_value(&self) -> u32 {
        if self.count_register == 0 {
            0x10000
        } else {
            self.count_register as u32
        }
    }

    fn activate(&mut self) {
        self.counting_element = self.reload_value();
        self.activated = true;
    }

    fn configure(&mut self, access: AccessMode, mode: u8, bcd: bool) {
        self.access = access;
        self.mode = mode;
        self.bcd = bcd;
        self.write_high_next = false;
        self.read_high_next = false;
    }

    fn latch(&mut self) {
        // the latch holds at most 16 bits; 65536 reads back as 0
        self.output_latch = self.counting_element as u16;
        self.read_high_next = false;
    }

    fn write(&mut self, value: u8) {
        match self.access {
            AccessMode::LowByte => {
                self.count_register = value as u16;
                self.activate();
            }
            AccessMode::HighByte => {
                self.count_register = (value as u16) << 8;
                self.activate();
            }
            AccessMode::LowHigh => {
                if self.write_high_next {
                    self.count_register = (self.count_register & 0x00FF) | ((value as u16) << 8);
                    self.write_high_next = false;
                    self.activate();
                } else {
                    self.count_register = (self.count_register & 0xFF00) | value as u16;
                    self.write_high_next = true;
                }
            }
        }
    }

    fn read(&mut self) -> u8 {
        match self.access {
            AccessMode::LowByte => self.output_latch as u8,
            AccessMode::HighByte => (self.output_latch >> 8) as u8,
            AccessMode::LowHigh => {
                let value = if self.read_high_next {
                    (self.output_latch >> 8) as u8
                } else {
                    self.output_latch as u8
                };
                self.read_high_next = !self.read_high_next;
                value
            }
        }
    }
}

/// Intel 8253/8254 Programmable Interval Timer
pub struct Pit {
    counters: [Counter; 3],
    /// Timer interrupts raised since the owner last collected them
    pending_irq: bool,
}

impl Pit {
    /// Create a PIT in its power-on state.
    pub fn new() -> Self {
        let mut pit = Self {
            counters: [Counter::new(), Counter::new(), Counter::new()],
            pending_irq: false,
        };
        pit.reset();
        pit
    }

    /// Reset all counters; counter 0 is re-armed with the maximum count.
    pub fn reset(&mut self) {
        self.counters = [Counter::new(), Counter::new(), Counter::new()];
        self.counters[0].activate();
        self.pending_irq = false;
    }

    /// Read a PIT port (`addr` relative to 0x40).
    pub fn read(&mut self, addr: u16) -> u8 {
        match addr & 3 {
            3 => 0xFF,
            n => self.counters[n as usize].read(),
        }
    }

    /// Write a PIT port (`addr` relative to 0x40).
    pub fn write(&mut self, addr: u16, value: u8) {
        match addr & 3 {
            3 => self.write_control(value),
            n => self.counters[n as usize].write(value),
        }
    }

    fn write_control(&mut self, value: u8) {
        let sc = value >> 6;
        if sc == 3 {
            log(LogCategory::Devices, LogLevel::Debug, || {
                format!("PIT read-back command {:02X} ignored", value)
            });
            return;
        }

        let counter = &mut self.counters[sc as usize];
        let rw = (value >> 4) & 3;
        let Some(access) = AccessMode::from_rw(rw) else {
            counter.latch();
            return;
        };

        let mut mode = (value >> 1) & 7;
        if mode & 2 != 0 {
            // modes 6 and 7 alias 2 and 3
            mode &= 3;
        }
        counter.configure(access, mode, value & 1 != 0);

        log(LogCategory::Devices, LogLevel::Debug, || {
            format!("PIT counter {} mode {} access {:?}", sc, mode, access)
        });
    }

    /// Take the pending timer interrupt, if any.
    pub fn take_irq(&mut self) -> bool {
        std::mem::take(&mut self.pending_irq)
    }

    /// Current count of a counter, for inspection.
    pub fn count(&self, counter: usize) -> u32 {
        self.counters[counter].counting_element
    }

    /// Counter 0 interrupt rate in Hz.
    pub fn system_timer_frequency(&self) -> f64 {
        PIT_FREQUENCY_MHZ * 1_000_000.0 / self.counters[0].reload_value() as f64
    }
}

impl Default for Pit {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Pit {
    fn frequency_in_mhz(&self) -> f64 {
        PIT_FREQUENCY_MHZ
    }

    fn next_cycles(&mut self) -> u64 {
        self.counters
            .iter()
            .filter(|c| c.activated)
            .map(|c| c.counting_element as u64)
            .min()
            .unwrap_or(NEVER)
    }

    fn run_cycles(&mut self, cycles: u64) -> u64 {
        let cycles = cycles.min(self.next_cycles());
        if cycles == NEVER {
            return 0;
        }

        let elapsed = cycles as u32;
        for (index, counter) in self.counters.iter_mut().enumerate() {
            if !counter.activated {
                continue;
            }
            counter.counting_element -= elapsed;
            if counter.counting_element == 0 {
                counter.counting_element = counter.reload_value();
                if index == 0 {
                    self.pending_irq = true;
                }
            }
        }

        cycles
    }
}
