//! IBM 5160 machine
//!
//! Ties the CPU, the bus devices and the BIOS/DOS services together and
//! drives them with the slice scheduler from `xtemu_core::scheduler`.
//!
//! BIOS and DOS services are host functions. Each one is reached through a
//! four byte trap stub (`FE 38 id16`) placed in the BIOS segment, with the
//! interrupt vector pointing at the stub. When the CPU executes a stub it
//! stops and the machine runs the registered function, which finishes by
//! returning from the interrupt (or by redirecting CS:IP itself).

use crate::bios;
use crate::bus::{linear, PcBus};
use crate::config::MachineConfig;
use crate::dos::{self, Dos};
use crate::keyboard::Key;
use crate::loader;
use crate::mouse::{self, Mouse};
use crate::vga::{MODE13_HEIGHT, MODE13_WIDTH};
use crate::PcError;
use serde::{Deserialize, Serialize};
use xtemu_core::cpu_8086::{Cpu8086, Registers, CPU_FREQUENCY_MHZ, TRAP_MODRM};
use xtemu_core::logging::{log, LogCategory, LogLevel};
use xtemu_core::scheduler::{ClockDomain, Scheduler};
use xtemu_core::types::Frame;
use xtemu_core::Device;

/// Segment holding the trap stubs, right after the shared IRET at F000:0000
pub const CALLBACK_SEGMENT: u16 = 0xF001;

/// Host function behind a trap stub
pub type Callback = fn(&mut Machine) -> Result<(), PcError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    Running,
    /// The program terminated with an exit code
    Exited { code: u8 },
    /// Emulation stopped on an unrecoverable condition
    Faulted { reason: String },
}

struct CallbackEntry {
    name: &'static str,
    handler: Callback,
}

/// Registered host callbacks, indexed by trap id
struct CallbackTable {
    entries: Vec<CallbackEntry>,
    next_seg: u16,
    next_ofs: u16,
}

impl CallbackTable {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_seg: CALLBACK_SEGMENT,
            next_ofs: 0,
        }
    }

    /// Reserve the next stub address.
    fn next_address(&mut self) -> (u16, u16) {
        let address = (self.next_seg, self.next_ofs);
        self.next_ofs = self.next_ofs.wrapping_add(4);
        if self.next_ofs == 0 {
            self.next_seg = self.next_seg.wrapping_add(0x1000);
        }
        address
    }
}

/// Cycle converters for each clock domain
struct Clocks {
    cpu: ClockDomain,
    pit: ClockDomain,
    keyboard: ClockDomain,
    vga: ClockDomain,
}

impl Clocks {
    fn new(bus: &PcBus) -> Self {
        Self {
            cpu: ClockDomain::new(CPU_FREQUENCY_MHZ),
            pit: ClockDomain::new(bus.pit.frequency_in_mhz()),
            keyboard: ClockDomain::new(bus.keyboard.frequency_in_mhz()),
            vga: ClockDomain::new(bus.vga.frequency_in_mhz()),
        }
    }
}

pub struct Machine {
    pub cpu: Cpu8086<PcBus>,
    pub(crate) dos: Dos,
    pub(crate) mouse: Mouse,
    callbacks: CallbackTable,
    scheduler: Scheduler,
    clocks: Clocks,
    state: MachineState,
    /// Text written by the program through DOS and BIOS output calls
    console: Vec<u8>,
    config: MachineConfig,
}

impl Machine {
    /// Power on: BIOS, DOS and mouse driver installed, no program loaded.
    pub fn new(config: MachineConfig) -> Result<Self, PcError> {
        let bus = PcBus::new();
        let clocks = Clocks::new(&bus);
        let mut cpu = Cpu8086::new(bus);
        cpu.set_strict(config.cpu_strict);
        if config.trace_calls {
            cpu.enable_call_trace(256);
        }

        let mut machine = Self {
            cpu,
            dos: Dos::new(&config),
            mouse: Mouse::new(),
            callbacks: CallbackTable::new(),
            scheduler: Scheduler::new(config.max_slice_us),
            clocks,
            state: MachineState::Running,
            console: Vec::new(),
            config,
        };

        bios::install(&mut machine);
        dos::install(&mut machine)?;
        mouse::install(&mut machine);

        Ok(machine)
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Point `vector` at a new trap stub that runs `handler`. Returns the
    /// trap id.
    pub fn install_callback(&mut self, vector: u8, name: &'static str, handler: Callback) -> u16 {
        let id = self.callbacks.entries.len() as u16;
        let (seg, ofs) = self.callbacks.next_address();

        let stub = [0xFE, TRAP_MODRM, id as u8, (id >> 8) as u8];
        self.cpu.bus.write_bytes(linear(seg, ofs), &stub);
        self.set_vector(vector, seg, ofs);
        self.callbacks.entries.push(CallbackEntry { name, handler });

        log(LogCategory::Bios, LogLevel::Debug, || {
            format!("callback {} ({}) for INT {:02X} at {:04X}:{:04X}", id, name, vector, seg, ofs)
        });
        id
    }

    pub fn set_vector(&mut self, vector: u8, seg: u16, ofs: u16) {
        let slot = 4 * vector as u32;
        self.cpu.bus.write_u16(slot, ofs);
        self.cpu.bus.write_u16(slot + 2, seg);
    }

    /// `(segment, offset)` stored in the vector table.
    pub fn vector(&self, vector: u8) -> (u16, u16) {
        let slot = 4 * vector as u32;
        (self.cpu.bus.read_u16(slot + 2), self.cpu.bus.read_u16(slot))
    }

    /// Load a `.COM` or MZ `.EXE` image and point the CPU at its entry.
    pub fn load_program(&mut self, data: &[u8], name: &str) -> Result<(), PcError> {
        loader::load_program(self, data, name)?;
        self.state = MachineState::Running;
        Ok(())
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == MachineState::Running
    }

    /// Stop with the program's exit code.
    pub fn terminate(&mut self, code: u8) {
        log(LogCategory::Dos, LogLevel::Info, || {
            format!("program terminated with exit code {}", code)
        });
        self.state = MachineState::Exited { code };
    }

    /// Stop on an unrecoverable condition, logging the full CPU context.
    pub fn fault(&mut self, reason: String) {
        log(LogCategory::CPU, LogLevel::Error, || {
            let mut dump = format!("machine fault: {}\n{}", reason, self.cpu.dump_state());
            if let Some(trace) = self.cpu.call_trace() {
                dump.push_str("\ncall trace:\n");
                dump.push_str(&trace.format());
            }
            dump
        });
        self.state = MachineState::Faulted { reason };
    }

    fn dispatch_trap(&mut self, id: u16) {
        let Some(entry) = self.callbacks.entries.get(id as usize) else {
            self.fault(format!("trap with unknown callback id {}", id));
            return;
        };
        let (name, handler) = (entry.name, entry.handler);

        log(LogCategory::Stubs, LogLevel::Trace, || {
            format!("callback {} AX={:04X}", name, self.cpu.ax)
        });

        if let Err(err) = handler(self) {
            self.fault(format!("{}: {}", name, err));
        }
    }

    /// Hand the oldest device interrupt to the CPU once its line is free.
    fn deliver_interrupts(&mut self) {
        if !self.cpu.has_pending_interrupt() {
            if let Some(vector) = self.cpu.bus.next_irq() {
                self.cpu.raise_intr(vector);
            }
        }
    }

    /// Execute one instruction (or take one interrupt) and run any host
    /// callback it triggered.
    pub fn step(&mut self) {
        if !self.is_running() {
            return;
        }
        self.deliver_interrupts();
        self.cpu.step();
        if let Some(id) = self.cpu.take_trap() {
            self.dispatch_trap(id);
        }
    }

    /// Step up to `count` instructions without advancing the devices.
    /// Returns how many were executed.
    pub fn run_for_instructions(&mut self, count: usize) -> usize {
        let mut executed = 0;
        while executed < count && self.is_running() {
            self.step();
            executed += 1;
        }
        executed
    }

    /// Run one scheduler slice: the CPU and every device advance by the time
    /// until the nearest device event. Returns the simulated microseconds.
    pub fn run_slice(&mut self) -> f64 {
        if !self.is_running() {
            return 0.0;
        }
        self.deliver_interrupts();

        let slice = {
            let bus = &mut self.cpu.bus;
            let mut devices: [&mut dyn Device; 3] = [&mut bus.pit, &mut bus.keyboard, &mut bus.vga];
            self.scheduler.plan(&mut devices)
        };

        let budget = self.clocks.cpu.cycles_for(slice);
        let mut used = 0;
        while used < budget && self.is_running() {
            used += self.cpu.run_cycles(budget - used);
            if let Some(id) = self.cpu.take_trap() {
                self.dispatch_trap(id);
            }
            self.deliver_interrupts();
        }

        let bus = &mut self.cpu.bus;
        advance(&mut bus.pit, self.clocks.pit.cycles_for(slice));
        advance(&mut bus.keyboard, self.clocks.keyboard.cycles_for(slice));
        advance(&mut bus.vga, self.clocks.vga.cycles_for(slice));
        bus.poll_devices();
        self.deliver_interrupts();

        self.scheduler.advance(slice);
        slice
    }

    /// Run slices until `micros` of simulated time have passed or the
    /// program stops.
    pub fn run_for(&mut self, micros: f64) {
        let end = self.scheduler.elapsed_us() + micros;
        while self.is_running() && self.scheduler.elapsed_us() < end {
            self.run_slice();
        }
    }

    /// Simulated time since power-on.
    pub fn elapsed_us(&self) -> f64 {
        self.scheduler.elapsed_us()
    }

    pub fn registers(&self) -> Registers {
        self.cpu.registers()
    }

    pub fn key_down(&mut self, key: Key) {
        self.cpu.bus.keyboard.key_down(key);
    }

    pub fn key_up(&mut self, key: Key) {
        self.cpu.bus.keyboard.key_up(key);
    }

    /// Update the mouse driver's position and button state.
    pub fn set_mouse(&mut self, x: u16, y: u16, buttons: u16) {
        self.mouse.set_state(x, y, buttons);
    }

    pub(crate) fn console_write(&mut self, bytes: &[u8]) {
        self.console.extend_from_slice(bytes);
    }

    /// Drain the text written by the program so far.
    pub fn take_console_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.console)
    }

    /// True once per display frame.
    pub fn take_frame_ready(&mut self) -> bool {
        self.cpu.bus.vga.take_frame_ready()
    }

    /// Current screen contents. Only mode 13h has a picture; other modes
    /// produce a black frame.
    pub fn frame(&self) -> Frame {
        if bios::video_mode(&self.cpu.bus) == bios::MODE_VGA_256 {
            self.cpu.bus.vga.render_mode13(self.cpu.bus.memory())
        } else {
            let mut frame = Frame::new(MODE13_WIDTH, MODE13_HEIGHT);
            frame.pixels.fill(0xFF00_0000);
            frame
        }
    }
}

/// Feed `cycles` to `device`, one event at a time.
fn advance(device: &mut dyn Device, mut cycles: u64) {
    while cycles > 0 {
        let used = device.run_cycles(cycles);
        if used == 0 {
            break;
        }
        cycles -= used.min(cycles);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> Machine {
        Machine::new(MachineConfig::default()).expect("machine")
    }

    /// Place `code` at 1000:0100 and start executing there.
    fn with_code(code: &[u8]) -> Machine {
        let mut m = machine();
        m.cpu.bus.write_bytes(linear(0x1000, 0x100), code);
        m.cpu.cs = 0x1000;
        m.cpu.ds = 0x1000;
        m.cpu.es = 0x1000;
        m.cpu.ss = 0x2000;
        m.cpu.sp = 0xFFFE;
        m.cpu.ip = 0x100;
        m
    }

    #[test]
    fn test_default_vectors_point_at_iret() {
        let m = machine();
        assert_eq!(m.vector(0x00), (0xF000, 0x0000));
        assert_eq!(m.cpu.bus.read_u8(0xF0000), 0xCF);
    }

    #[test]
    fn test_callback_stub_layout() {
        let mut m = machine();
        fn noop(m: &mut Machine) -> Result<(), PcError> {
            m.cpu.iret();
            Ok(())
        }
        let id = m.install_callback(0x66, "noop", noop);
        let (seg, ofs) = m.vector(0x66);
        assert_eq!(seg, CALLBACK_SEGMENT);
        let stub = m.cpu.bus.read_bytes(linear(seg, ofs), 4);
        assert_eq!(stub, vec![0xFE, 0x38, id as u8, (id >> 8) as u8]);
    }

    #[test]
    fn test_callback_runs_and_returns() {
        fn set_bx(m: &mut Machine) -> Result<(), PcError> {
            m.cpu.bx = 0xBEEF;
            m.cpu.iret();
            Ok(())
        }
        // INT 66h; MOV CX,1; HLT
        let mut m = with_code(&[0xCD, 0x66, 0xB9, 0x01, 0x00, 0xF4]);
        m.install_callback(0x66, "set_bx", set_bx);
        m.run_for_instructions(3);
        assert_eq!(m.cpu.bx, 0xBEEF);
        assert_eq!(m.cpu.cx, 1);
        assert_eq!(m.cpu.sp, 0xFFFE);
    }

    #[test]
    fn test_failing_callback_faults_machine() {
        fn broken(_: &mut Machine) -> Result<(), PcError> {
            Err(PcError::Unimplemented("INT 66h".to_string()))
        }
        let mut m = with_code(&[0xCD, 0x66, 0x90]);
        m.install_callback(0x66, "broken", broken);
        m.run_for_instructions(10);
        assert!(matches!(m.state(), MachineState::Faulted { reason } if reason.contains("INT 66h")));
        // nothing runs once faulted
        assert_eq!(m.run_for_instructions(5), 0);
        assert_eq!(m.run_slice(), 0.0);
    }

    #[test]
    fn test_unknown_trap_id_faults() {
        // trap opcode with an id nobody registered
        let mut m = with_code(&[0xFE, 0x38, 0x34, 0x12]);
        m.step();
        assert!(matches!(m.state(), MachineState::Faulted { .. }));
    }

    #[test]
    fn test_slice_is_bounded_by_next_device_event() {
        // JMP $
        let mut m = with_code(&[0xEB, 0xFE]);
        let slice = m.run_slice();
        assert!(slice > 0.0 && slice <= 1000.0);
        // the VGA retrace ends after 1600 pixel clocks
        assert!((slice - 1600.0 / 25.175).abs() < 1e-6);
    }

    #[test]
    fn test_timer_interrupt_advances_tick_count() {
        // STI; JMP $
        let mut m = with_code(&[0xFB, 0xEB, 0xFE]);
        m.run_for(60_000.0);
        let ticks = m.cpu.bus.read_u16(linear(0x40, 0x6C));
        assert_eq!(ticks, 1);
        assert!(m.is_running());
    }

    #[test]
    fn test_masked_timer_interrupt_stays_pending() {
        // CLI; JMP $
        let mut m = with_code(&[0xFA, 0xEB, 0xFE]);
        m.run_for(60_000.0);
        assert_eq!(m.cpu.bus.read_u16(linear(0x40, 0x6C)), 0);
        assert!(m.cpu.has_pending_interrupt());
    }

    #[test]
    fn test_keyboard_interrupt_reaches_handler() {
        // STI; JMP $
        let mut m = with_code(&[0xFB, 0xEB, 0xFE]);
        // handler at 0000:0600: IN AL,60h; MOV [0700],AL; IRET
        m.cpu.bus.write_bytes(0x600, &[0xE4, 0x60, 0xA2, 0x00, 0x07, 0xCF]);
        m.set_vector(0x09, 0x0000, 0x0600);
        m.key_down(Key::Q);
        m.run_for(3_000.0);
        assert_eq!(m.cpu.bus.read_u8(linear(0x1000, 0x700)), 0x10);
    }

    #[test]
    fn test_frame_ready_once_per_frame() {
        let mut m = with_code(&[0xEB, 0xFE]);
        let mut frames = 0;
        while m.elapsed_us() < 30_000.0 {
            m.run_slice();
            if m.take_frame_ready() {
                frames += 1;
            }
        }
        // 70 Hz: a frame every ~14.27 ms
        assert_eq!(frames, 2);
    }

    #[test]
    fn test_text_mode_frame_is_black() {
        let m = machine();
        let frame = m.frame();
        assert_eq!(frame.width, 320);
        assert!(frame.pixels.iter().all(|&p| p == 0xFF00_0000));
    }
}
