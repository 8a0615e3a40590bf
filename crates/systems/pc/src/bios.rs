//! BIOS services
//!
//! There is no ROM image. Every interrupt vector starts out pointing at a
//! lone IRET at F000:0000, and the services programs actually use are
//! host callbacks:
//!
//! - INT 08h: timer tick, chains to INT 1Ch
//! - INT 10h: video mode, cursor, teletype output and DAC access
//! - INT 11h/12h: equipment list and memory size
//! - INT 1Ah: tick counter
//!
//! State lives in the BIOS data area at segment 0x40 so programs that
//! read it directly see the same values.

use crate::bus::{linear, PcBus};
use crate::dos::set_caller_carry;
use crate::machine::Machine;
use crate::vga::{VgaColor, MODE13_BASE, MODE13_HEIGHT, MODE13_WIDTH};
use crate::PcError;
use xtemu_core::logging::{log, LogCategory, LogLevel};

pub const BIOS_SEGMENT: u16 = 0xF000;
const IRET: u8 = 0xCF;

/// BIOS data area
pub const BDA_SEGMENT: u16 = 0x0040;
const BDA_EQUIPMENT: u16 = 0x10;
const BDA_MEMORY_KB: u16 = 0x13;
const BDA_VIDEO_MODE: u16 = 0x49;
const BDA_SCREEN_COLUMNS: u16 = 0x4A;
const BDA_CURSOR_POS: u16 = 0x50;
const BDA_CURSOR_SHAPE: u16 = 0x60;
const BDA_CRTC_BASE: u16 = 0x63;
const BDA_TICKS: u16 = 0x6C;
const BDA_MIDNIGHT: u16 = 0x70;
const BDA_SCREEN_ROWS: u16 = 0x84;

/// Ticks in 24 hours at 18.2 Hz
pub const TICKS_PER_DAY: u32 = 0x1800B0;

pub const MODE_TEXT_80X25: u8 = 0x03;
pub const MODE_VGA_256: u8 = 0x13;

const TEXT_BASE: u32 = 0xB8000;
const TEXT_ROWS: u16 = 25;
/// Light gray on black
const TEXT_ATTRIBUTE: u8 = 0x07;
const DEFAULT_CURSOR_SHAPE: u16 = 0x0607;

/// Program the vector table, the data area and the BIOS callbacks.
pub fn install(m: &mut Machine) {
    let bus = &mut m.cpu.bus;
    bus.write_u8(linear(BIOS_SEGMENT, 0), IRET);
    for vector in 0..=255u8 {
        let slot = 4 * vector as u32;
        bus.write_u16(slot, 0x0000);
        bus.write_u16(slot + 2, BIOS_SEGMENT);
    }

    // one floppy, 80x25 color
    bda_write_u16(bus, BDA_EQUIPMENT, 0x0021);
    bda_write_u16(bus, BDA_MEMORY_KB, 640);
    bda_write_u16(bus, BDA_CRTC_BASE, 0x03D4);
    bda_write_u16(bus, BDA_CURSOR_SHAPE, DEFAULT_CURSOR_SHAPE);
    bda_write_u32(bus, BDA_TICKS, 0);
    bus.write_u8(linear(BDA_SEGMENT, BDA_MIDNIGHT), 0);
    set_text_mode(bus, MODE_TEXT_80X25, false);

    m.install_callback(0x08, "INT 08h", int08);
    m.install_callback(0x10, "INT 10h", int10);
    m.install_callback(0x11, "INT 11h", int11);
    m.install_callback(0x12, "INT 12h", int12);
    m.install_callback(0x1A, "INT 1Ah", int1a);
}

fn bda_read_u16(bus: &PcBus, offset: u16) -> u16 {
    bus.read_u16(linear(BDA_SEGMENT, offset))
}

fn bda_write_u16(bus: &mut PcBus, offset: u16, value: u16) {
    bus.write_u16(linear(BDA_SEGMENT, offset), value);
}

fn bda_read_u32(bus: &PcBus, offset: u16) -> u32 {
    bda_read_u16(bus, offset) as u32 | (bda_read_u16(bus, offset + 2) as u32) << 16
}

fn bda_write_u32(bus: &mut PcBus, offset: u16, value: u32) {
    bda_write_u16(bus, offset, value as u16);
    bda_write_u16(bus, offset + 2, (value >> 16) as u16);
}

/// Current video mode from the data area.
pub fn video_mode(bus: &PcBus) -> u8 {
    bus.read_u8(linear(BDA_SEGMENT, BDA_VIDEO_MODE))
}

/// Timer ticks since midnight.
pub fn ticks(bus: &PcBus) -> u32 {
    bda_read_u32(bus, BDA_TICKS)
}

fn set_text_mode(bus: &mut PcBus, mode: u8, keep_memory: bool) {
    let columns: u16 = if mode < 2 { 40 } else { 80 };
    bus.write_u8(linear(BDA_SEGMENT, BDA_VIDEO_MODE), mode);
    bda_write_u16(bus, BDA_SCREEN_COLUMNS, columns);
    bus.write_u8(linear(BDA_SEGMENT, BDA_SCREEN_ROWS), (TEXT_ROWS - 1) as u8);
    bda_write_u16(bus, BDA_CURSOR_POS, 0);
    if !keep_memory {
        for cell in 0..(columns * TEXT_ROWS) as u32 {
            bus.write_u8(TEXT_BASE + 2 * cell, b' ');
            bus.write_u8(TEXT_BASE + 2 * cell + 1, TEXT_ATTRIBUTE);
        }
    }
}

fn set_vga_256_mode(m: &mut Machine, keep_memory: bool) {
    let bus = &mut m.cpu.bus;
    bus.write_u8(linear(BDA_SEGMENT, BDA_VIDEO_MODE), MODE_VGA_256);
    bda_write_u16(bus, BDA_SCREEN_COLUMNS, 40);
    bda_write_u16(bus, BDA_CURSOR_POS, 0);
    bus.vga.load_default_palette();
    if !keep_memory {
        let len = (MODE13_WIDTH * MODE13_HEIGHT) as usize;
        bus.write_bytes(MODE13_BASE as u32, &vec![0; len]);
    }
}

/// INT 08h: count the tick, then continue into the INT 1Ch handler with
/// the same interrupt frame.
fn int08(m: &mut Machine) -> Result<(), PcError> {
    let bus = &mut m.cpu.bus;
    let mut ticks = bda_read_u32(bus, BDA_TICKS) + 1;
    if ticks >= TICKS_PER_DAY {
        ticks = 0;
        bus.write_u8(linear(BDA_SEGMENT, BDA_MIDNIGHT), 1);
    }
    bda_write_u32(bus, BDA_TICKS, ticks);

    let (seg, ofs) = m.vector(0x1C);
    m.cpu.cs = seg;
    m.cpu.ip = ofs;
    Ok(())
}

/// INT 10h: video services
fn int10(m: &mut Machine) -> Result<(), PcError> {
    let ah = (m.cpu.ax >> 8) as u8;
    let al = m.cpu.ax as u8;
    log(LogCategory::Bios, LogLevel::Trace, || {
        format!("INT 10h AX={:04X} BX={:04X}", m.cpu.ax, m.cpu.bx)
    });

    match ah {
        0x00 => {
            let mode = al & 0x7F;
            let keep_memory = al & 0x80 != 0;
            match mode {
                0x00..=0x07 => set_text_mode(&mut m.cpu.bus, mode, keep_memory),
                MODE_VGA_256 => set_vga_256_mode(m, keep_memory),
                _ => {
                    return Err(PcError::Unimplemented(format!(
                        "INT 10h video mode {:02X}",
                        mode
                    )))
                }
            }
            log(LogCategory::Bios, LogLevel::Info, || {
                format!("video mode {:02X}", mode)
            });
        }
        0x01 => bda_write_u16(&mut m.cpu.bus, BDA_CURSOR_SHAPE, m.cpu.cx),
        0x02 => {
            let page = (m.cpu.bx >> 8) & 0x07;
            bda_write_u16(&mut m.cpu.bus, BDA_CURSOR_POS + 2 * page, m.cpu.dx);
        }
        0x03 => {
            let page = (m.cpu.bx >> 8) & 0x07;
            m.cpu.dx = bda_read_u16(&m.cpu.bus, BDA_CURSOR_POS + 2 * page);
            m.cpu.cx = bda_read_u16(&m.cpu.bus, BDA_CURSOR_SHAPE);
        }
        0x0E => teletype(m, al),
        0x0F => {
            let columns = bda_read_u16(&m.cpu.bus, BDA_SCREEN_COLUMNS);
            m.cpu.ax = (columns << 8) | video_mode(&m.cpu.bus) as u16;
            m.cpu.bx &= 0x00FF;
        }
        0x10 => dac_function(m, al)?,
        0x1A if al == 0x00 => {
            // VGA with color display
            m.cpu.ax = (m.cpu.ax & 0xFF00) | 0x1A;
            m.cpu.bx = 0x0008;
        }
        _ => {
            return Err(PcError::Unimplemented(format!(
                "INT 10h AH={:02X} AL={:02X}",
                ah, al
            )))
        }
    }

    m.cpu.iret();
    Ok(())
}

/// AH=10h: DAC palette access
fn dac_function(m: &mut Machine, al: u8) -> Result<(), PcError> {
    let cpu = &mut m.cpu;
    match al {
        0x10 => {
            let color = VgaColor {
                r: (cpu.dx >> 8) as u8,
                g: (cpu.cx >> 8) as u8,
                b: cpu.cx as u8,
            };
            cpu.bus.vga.set_palette_entry(cpu.bx as u8, color);
        }
        0x12 => {
            let table = linear(cpu.es, cpu.dx);
            for i in 0..cpu.cx as u32 {
                let rgb = cpu.bus.read_bytes(table + 3 * i, 3);
                let index = cpu.bx.wrapping_add(i as u16) as u8;
                let color = VgaColor {
                    r: rgb[0],
                    g: rgb[1],
                    b: rgb[2],
                };
                cpu.bus.vga.set_palette_entry(index, color);
            }
        }
        0x15 => {
            let color = cpu.bus.vga.palette_entry(cpu.bx as u8);
            cpu.dx = (cpu.dx & 0x00FF) | (color.r as u16) << 8;
            cpu.cx = (color.g as u16) << 8 | color.b as u16;
        }
        0x17 => {
            let table = linear(cpu.es, cpu.dx);
            for i in 0..cpu.cx as u32 {
                let color = cpu.bus.vga.palette_entry(cpu.bx.wrapping_add(i as u16) as u8);
                cpu.bus.write_bytes(table + 3 * i, &[color.r, color.g, color.b]);
            }
        }
        _ => {
            return Err(PcError::Unimplemented(format!(
                "INT 10h AX=10{:02X}",
                al
            )))
        }
    }
    Ok(())
}

/// AH=0Eh: write a character at the cursor and advance it. The character
/// also goes to the machine's console output.
fn teletype(m: &mut Machine, c: u8) {
    m.console_write(&[c]);

    let bus = &mut m.cpu.bus;
    if video_mode(bus) > 0x07 {
        return;
    }
    let columns = bda_read_u16(bus, BDA_SCREEN_COLUMNS).max(1);
    let pos = bda_read_u16(bus, BDA_CURSOR_POS);
    let (mut row, mut col) = (pos >> 8, pos & 0xFF);

    match c {
        b'\r' => col = 0,
        b'\n' => row += 1,
        0x08 => col = col.saturating_sub(1),
        0x07 => {}
        _ => {
            let cell = TEXT_BASE + 2 * (row * columns + col) as u32;
            bus.write_u8(cell, c);
            col += 1;
            if col >= columns {
                col = 0;
                row += 1;
            }
        }
    }

    if row >= TEXT_ROWS {
        scroll_up(bus, columns);
        row = TEXT_ROWS - 1;
    }
    bda_write_u16(bus, BDA_CURSOR_POS, (row << 8) | col);
}

fn scroll_up(bus: &mut PcBus, columns: u16) {
    let row_bytes = 2 * columns as u32;
    let screen = row_bytes * TEXT_ROWS as u32;
    for i in 0..screen - row_bytes {
        let b = bus.read_u8(TEXT_BASE + row_bytes + i);
        bus.write_u8(TEXT_BASE + i, b);
    }
    for cell in 0..columns as u32 {
        bus.write_u8(TEXT_BASE + screen - row_bytes + 2 * cell, b' ');
        bus.write_u8(TEXT_BASE + screen - row_bytes + 2 * cell + 1, TEXT_ATTRIBUTE);
    }
}

/// INT 11h: equipment list
fn int11(m: &mut Machine) -> Result<(), PcError> {
    m.cpu.ax = bda_read_u16(&m.cpu.bus, BDA_EQUIPMENT);
    m.cpu.iret();
    Ok(())
}

/// INT 12h: conventional memory size in KiB
fn int12(m: &mut Machine) -> Result<(), PcError> {
    m.cpu.ax = bda_read_u16(&m.cpu.bus, BDA_MEMORY_KB);
    m.cpu.iret();
    Ok(())
}

/// INT 1Ah: time of day
fn int1a(m: &mut Machine) -> Result<(), PcError> {
    let ah = (m.cpu.ax >> 8) as u8;
    match ah {
        0x00 => {
            let bus = &mut m.cpu.bus;
            let ticks = bda_read_u32(bus, BDA_TICKS);
            let midnight = bus.read_u8(linear(BDA_SEGMENT, BDA_MIDNIGHT));
            bus.write_u8(linear(BDA_SEGMENT, BDA_MIDNIGHT), 0);
            m.cpu.cx = (ticks >> 16) as u16;
            m.cpu.dx = ticks as u16;
            m.cpu.ax = (m.cpu.ax & 0xFF00) | midnight as u16;
        }
        0x01 => {
            let ticks = (m.cpu.cx as u32) << 16 | m.cpu.dx as u32;
            let bus = &mut m.cpu.bus;
            bda_write_u32(bus, BDA_TICKS, ticks % TICKS_PER_DAY);
            bus.write_u8(linear(BDA_SEGMENT, BDA_MIDNIGHT), 0);
        }
        // the XT has no real-time clock
        0x02..=0x07 => set_caller_carry(&mut m.cpu, true),
        _ => {
            return Err(PcError::Unimplemented(format!(
                "INT 1Ah AH={:02X}",
                ah
            )))
        }
    }
    m.cpu.iret();
    Ok(())
}
