//! PC memory and IO bus
//!
//! Memory is a flat 1 MiB; the BIOS stubs at F000 are ordinary RAM.
//!
//! IO map:
//! - 0x040-0x05F: PIT (mirrored every four ports)
//! - 0x060-0x064: keyboard controller
//! - 0x3C0-0x3DF: VGA
//!
//! Unmapped ports read 0 and ignore writes.
//!
//! Devices do not talk to the CPU directly. Their interrupt requests are
//! collected here and handed to the CPU one at a time by the machine.

use crate::keyboard::{Keyboard, KEYBOARD_VECTOR};
use crate::pit::{Pit, TIMER_VECTOR};
use crate::vga::Vga;
use std::collections::VecDeque;
use xtemu_core::cpu_8086::{AddressSpace, Bus8086, Width};
use xtemu_core::logging::{log, LogCategory, LogLevel};

/// Size of the physical address space
pub const MEMORY_SIZE: usize = 0x100000;

/// Physical address of `segment:offset`.
#[inline]
pub fn linear(segment: u16, offset: u16) -> u32 {
    (((segment as u32) << 4) + offset as u32) & 0xFFFFF
}

/// PC memory bus
pub struct PcBus {
    ram: Vec<u8>,
    pub pit: Pit,
    pub keyboard: Keyboard,
    pub vga: Vga,
    /// Interrupt vectors requested by devices and not yet delivered
    pending_irqs: VecDeque<u8>,
}

impl PcBus {
    pub fn new() -> Self {
        Self {
            ram: vec![0; MEMORY_SIZE],
            pit: Pit::new(),
            keyboard: Keyboard::new(),
            vga: Vga::new(),
            pending_irqs: VecDeque::new(),
        }
    }

    /// Clear memory and reset every device.
    pub fn reset(&mut self) {
        self.ram.fill(0);
        self.pit.reset();
        self.keyboard.reset();
        self.vga.reset();
        self.pending_irqs.clear();
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        self.ram[(addr as usize) & (MEMORY_SIZE - 1)]
    }

    pub fn write_u8(&mut self, addr: u32, val: u8) {
        self.ram[(addr as usize) & (MEMORY_SIZE - 1)] = val;
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        self.read_u8(addr) as u16 | (self.read_u8(addr.wrapping_add(1)) as u16) << 8
    }

    pub fn write_u16(&mut self, addr: u32, val: u16) {
        self.write_u8(addr, val as u8);
        self.write_u8(addr.wrapping_add(1), (val >> 8) as u8);
    }

    pub fn read_bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.read_u8(addr.wrapping_add(i as u32)))
            .collect()
    }

    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), byte);
        }
    }

    pub fn memory(&self) -> &[u8] {
        &self.ram
    }

    /// Collect interrupt requests raised by devices since the last poll.
    /// A vector already waiting is not queued twice.
    pub fn poll_devices(&mut self) {
        if self.pit.take_irq() {
            self.request_irq(TIMER_VECTOR);
        }
        if self.keyboard.take_irq() {
            self.request_irq(KEYBOARD_VECTOR);
        }
    }

    pub fn request_irq(&mut self, vector: u8) {
        if !self.pending_irqs.contains(&vector) {
            self.pending_irqs.push_back(vector);
        }
    }

    /// Oldest undelivered interrupt request.
    pub fn next_irq(&mut self) -> Option<u8> {
        self.pending_irqs.pop_front()
    }

    fn io_read_u8(&mut self, port: u16) -> u8 {
        match port {
            0x40..=0x5F => self.pit.read((port - 0x40) & 3),
            0x60..=0x64 => self.keyboard.read(port - 0x60),
            0x3C0..=0x3DF => self.vga.read(port),
            _ => {
                log(LogCategory::Bus, LogLevel::Debug, || {
                    format!("unmapped IO read @ {:04X}", port)
                });
                0
            }
        }
    }

    fn io_write_u8(&mut self, port: u16, value: u8) {
        match port {
            0x40..=0x5F => self.pit.write((port - 0x40) & 3, value),
            0x60..=0x64 => self.keyboard.write(port - 0x60, value),
            0x3C0..=0x3DF => self.vga.write(port, value),
            _ => {
                log(LogCategory::Bus, LogLevel::Debug, || {
                    format!("unmapped IO write @ {:04X} <- {:02X}", port, value)
                });
            }
        }
    }
}

impl Default for PcBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus8086 for PcBus {
    fn read(&mut self, space: AddressSpace, addr: u32, width: Width) -> u16 {
        match (space, width) {
            (AddressSpace::Memory, Width::Byte) => self.read_u8(addr) as u16,
            (AddressSpace::Memory, Width::Word) => self.read_u16(addr),
            (AddressSpace::Io, Width::Byte) => self.io_read_u8(addr as u16) as u16,
            (AddressSpace::Io, Width::Word) => {
                let port = addr as u16;
                let lo = self.io_read_u8(port) as u16;
                let hi = self.io_read_u8(port.wrapping_add(1)) as u16;
                lo | hi << 8
            }
        }
    }

    fn write(&mut self, space: AddressSpace, addr: u32, width: Width, value: u16) {
        match (space, width) {
            (AddressSpace::Memory, Width::Byte) => self.write_u8(addr, value as u8),
            (AddressSpace::Memory, Width::Word) => self.write_u16(addr, value),
            (AddressSpace::Io, Width::Byte) => self.io_write_u8(addr as u16, value as u8),
            (AddressSpace::Io, Width::Word) => {
                let port = addr as u16;
                self.io_write_u8(port, value as u8);
                self.io_write_u8(port.wrapping_add(1), (value >> 8) as u8);
            }
        }
    }
}
