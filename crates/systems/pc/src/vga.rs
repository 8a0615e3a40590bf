//! VGA timing, DAC and mode 13h framebuffer
//!
//! Only what programs poll or program directly is emulated: the 640x400
//! 70 Hz timing (for the vertical retrace bit at 0x3DA), the 256-entry DAC
//! palette behind ports 0x3C7-0x3C9, and rendering of the linear 320x200
//! 256-color framebuffer at A000:0000.
//!
//! The device counts pixel clocks. A frame starts with vertical retrace, so
//! the first `V_SYNC_PELS` of every frame report retrace.

use xtemu_core::logging::{log, LogCategory, LogLevel};
use xtemu_core::types::Frame;
use xtemu_core::Device;

/// Pixel clock in MHz
pub const VGA_FREQUENCY_MHZ: f64 = 25.175;

const H_VISIBLE: u32 = 640;
const H_FRONT_PORCH: u32 = 16;
const H_SYNC: u32 = 96;
const H_BACK_PORCH: u32 = 48;
const V_VISIBLE: u32 = 400;
const V_FRONT_PORCH: u32 = 12;
const V_SYNC: u32 = 2;
const V_BACK_PORCH: u32 = 35;

pub const H_TOTAL: u32 = H_VISIBLE + H_FRONT_PORCH + H_SYNC + H_BACK_PORCH;
pub const V_TOTAL: u32 = V_VISIBLE + V_FRONT_PORCH + V_SYNC + V_BACK_PORCH;
/// Pixel clocks per frame
pub const TOTAL_PELS: u32 = H_TOTAL * V_TOTAL;
/// Pixel clocks of vertical retrace at the start of each frame
pub const V_SYNC_PELS: u32 = H_TOTAL * V_SYNC;

/// Physical address of the mode 13h framebuffer
pub const MODE13_BASE: usize = 0xA0000;
pub const MODE13_WIDTH: u32 = 320;
pub const MODE13_HEIGHT: u32 = 200;

/// Input status #1 bit 3
const STATUS_VERTICAL_RETRACE: u8 = 0b0000_1000;

/// One DAC entry (6 bits per component)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VgaColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl VgaColor {
    /// Widen a 6-bit component to 8 bits, replicating the top bits.
    fn expand(c: u8) -> u32 {
        (((c << 2) | (c >> 4)) as u32) & 0xFF
    }

    /// Convert to ARGB8888 format
    pub fn to_argb(self) -> u32 {
        0xFF00_0000 | (Self::expand(self.r) << 16) | (Self::expand(self.g) << 8) | Self::expand(self.b)
    }
}

/// The 16 colors of the CGA/EGA text palette
const BASE_COLORS: [(u8, u8, u8); 16] = [
    (0, 0, 0),
    (0, 0, 42),
    (0, 42, 0),
    (0, 42, 42),
    (42, 0, 0),
    (42, 0, 42),
    (42, 21, 0),
    (42, 42, 42),
    (21, 21, 21),
    (21, 21, 63),
    (21, 63, 21),
    (21, 63, 63),
    (63, 21, 21),
    (63, 21, 63),
    (63, 63, 21),
    (63, 63, 63),
];

pub struct Vga {
    current_pel: u32,
    dac_state: u8,
    /// Byte index into `dac_ram`, always below 0x300
    dac_address: u16,
    dac_ram: [u8; 0x300],
    frame_count: u64,
    frame_ready: bool,
}

impl Vga {
    pub fn new() -> Self {
        Self {
            current_pel: 0,
            dac_state: 0,
            dac_address: 0,
            dac_ram: [0; 0x300],
            frame_count: 0,
            frame_ready: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Load the BIOS default palette: the 16 text colors followed by a
    /// 16-step gray ramp.
    pub fn load_default_palette(&mut self) {
        self.dac_ram = [0; 0x300];
        for (i, &(r, g, b)) in BASE_COLORS.iter().enumerate() {
            self.dac_ram[3 * i..3 * i + 3].copy_from_slice(&[r, g, b]);
        }
        for i in 0..16 {
            let level = (i * 63 / 15) as u8;
            let entry = 16 + i;
            self.dac_ram[3 * entry..3 * entry + 3].copy_from_slice(&[level, level, level]);
        }
    }

    pub fn palette_entry(&self, index: u8) -> VgaColor {
        let i = 3 * index as usize;
        VgaColor {
            r: self.dac_ram[i],
            g: self.dac_ram[i + 1],
            b: self.dac_ram[i + 2],
        }
    }

    pub fn set_palette_entry(&mut self, index: u8, color: VgaColor) {
        let i = 3 * index as usize;
        self.dac_ram[i] = color.r & 0x3F;
        self.dac_ram[i + 1] = color.g & 0x3F;
        self.dac_ram[i + 2] = color.b & 0x3F;
    }

    pub fn in_vertical_retrace(&self) -> bool {
        self.current_pel < V_SYNC_PELS
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// True once per frame, when retrace begins.
    pub fn take_frame_ready(&mut self) -> bool {
        std::mem::take(&mut self.frame_ready)
    }

    /// Read a register (`port` is the full IO address).
    pub fn read(&mut self, port: u16) -> u8 {
        match port {
            0x3C7 => self.dac_state,
            0x3C8 => (self.dac_address / 3) as u8,
            0x3C9 => {
                let value = self.dac_ram[self.dac_address as usize];
                self.advance_dac();
                value
            }
            0x3DA => {
                if self.in_vertical_retrace() {
                    STATUS_VERTICAL_RETRACE
                } else {
                    0
                }
            }
            _ => {
                log(LogCategory::Devices, LogLevel::Trace, || {
                    format!("VGA: unhandled read @ {:03X}", port)
                });
                0
            }
        }
    }

    /// Write a register (`port` is the full IO address).
    pub fn write(&mut self, port: u16, value: u8) {
        match port {
            0x3C7 => {
                self.dac_address = 3 * value as u16;
                self.dac_state = 0b00;
            }
            0x3C8 => {
                self.dac_address = 3 * value as u16;
                self.dac_state = 0b11;
            }
            0x3C9 => {
                self.dac_ram[self.dac_address as usize] = value & 0x3F;
                self.advance_dac();
            }
            _ => {
                log(LogCategory::Devices, LogLevel::Trace, || {
                    format!("VGA: unhandled write @ {:03X} <- {:02X}", port, value)
                });
            }
        }
    }

    fn advance_dac(&mut self) {
        self.dac_address = (self.dac_address + 1) % 0x300;
    }

    /// Render the mode 13h framebuffer from `memory` (the full 1 MiB
    /// address space) through the DAC.
    pub fn render_mode13(&self, memory: &[u8]) -> Frame {
        let mut frame = Frame::new(MODE13_WIDTH, MODE13_HEIGHT);
        let len = frame.pixels.len();
        let vram = &memory[MODE13_BASE..MODE13_BASE + len];
        for (pixel, &index) in frame.pixels.iter_mut().zip(vram) {
            *pixel = self.palette_entry(index).to_argb();
        }
        frame
    }
}

impl Default for Vga {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for Vga {
    fn frequency_in_mhz(&self) -> f64 {
        VGA_FREQUENCY_MHZ
    }

    /// Pixel clocks to the end of retrace, or to the start of the next frame.
    fn next_cycles(&mut self) -> u64 {
        if self.current_pel < V_SYNC_PELS {
            (V_SYNC_PELS - self.current_pel) as u64
        } else {
            (TOTAL_PELS - self.current_pel) as u64
        }
    }

    fn run_cycles(&mut self, cycles: u64) -> u64 {
        let cycles = cycles.min(self.next_cycles());
        self.current_pel += cycles as u32;
        if self.current_pel >= TOTAL_PELS {
            self.current_pel -= TOTAL_PELS;
            self.frame_count += 1;
            self.frame_ready = true;
        }
        cycles
    }
}
