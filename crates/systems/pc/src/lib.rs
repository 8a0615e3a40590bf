//! IBM PC/XT system implementation
//!
//! An IBM 5160 with an 8086, an 8254 timer, the keyboard controller and a
//! VGA, running DOS programs (.COM and .EXE) on top of host-implemented
//! BIOS and DOS services.

#![allow(clippy::upper_case_acronyms)]

mod bios;
mod bus;
pub mod config;
pub mod dos;
mod keyboard;
mod loader;
mod machine;
mod mouse;
mod pit;
mod runner;
mod vga;

use serde_json::Value;
use thiserror::Error;
use xtemu_core::cpu_8086::Registers;
use xtemu_core::logging::{log, LogCategory, LogLevel};
use xtemu_core::{types::Frame, MountPointInfo, System};

pub use bus::{linear, PcBus};
pub use config::{AllocStrategy, MachineConfig};
pub use dos::DosError;
pub use keyboard::{Key, Keyboard};
pub use loader::MzHeader;
pub use machine::{Callback, Machine, MachineState};
pub use mouse::Mouse;
pub use pit::Pit;
pub use runner::{MachineRunner, RunState};
pub use vga::{Vga, VgaColor};

#[derive(Debug, Error)]
pub enum PcError {
    #[error("No executable loaded")]
    NoExecutable,
    #[error("Invalid executable: {0}")]
    InvalidExecutable(String),
    #[error("Invalid mount point: {0}")]
    InvalidMountPoint(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Unimplemented: {0}")]
    Unimplemented(String),
    #[error("DOS error: {0}")]
    Dos(#[from] DosError),
    #[error("Machine faulted: {0}")]
    Faulted(String),
}

const PROGRAM_MOUNT: &str = "Program";

struct Program {
    name: String,
    data: Vec<u8>,
}

/// PC system driven frame by frame through the [`System`] trait
pub struct PcSystem {
    machine: Machine,
    config: MachineConfig,
    program: Option<Program>,
}

impl PcSystem {
    pub fn new(config: MachineConfig) -> Result<Self, PcError> {
        Ok(Self {
            machine: Machine::new(config.clone())?,
            config,
            program: None,
        })
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    /// Hand the machine over, for example to a [`MachineRunner`].
    pub fn into_machine(self) -> Machine {
        self.machine
    }

    /// Load a program on a freshly powered-on machine. `name` becomes the
    /// program path in its environment.
    pub fn load_program(&mut self, name: &str, data: &[u8]) -> Result<(), PcError> {
        let mut machine = Machine::new(self.config.clone())?;
        machine.load_program(data, name)?;
        self.machine = machine;
        self.program = Some(Program {
            name: name.to_string(),
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Power cycle and load the mounted program again, if any.
    fn restart(&mut self) -> Result<(), PcError> {
        self.machine = Machine::new(self.config.clone())?;
        if let Some(program) = &self.program {
            self.machine.load_program(&program.data, &program.name)?;
        }
        Ok(())
    }
}

impl System for PcSystem {
    type Error = PcError;

    fn reset(&mut self) {
        if let Err(err) = self.restart() {
            log(LogCategory::Dos, LogLevel::Error, || {
                format!("reset failed: {}", err)
            });
        }
    }

    fn step_frame(&mut self) -> Result<Frame, Self::Error> {
        if self.program.is_none() {
            return Err(PcError::NoExecutable);
        }

        while self.machine.is_running() {
            self.machine.run_slice();
            if self.machine.take_frame_ready() {
                break;
            }
        }

        if let MachineState::Faulted { reason } = self.machine.state() {
            return Err(PcError::Faulted(reason.clone()));
        }
        Ok(self.machine.frame())
    }

    fn save_state(&self) -> Value {
        serde_json::json!({
            "version": 1,
            "system": "pc",
            "registers": self.machine.registers(),
            "elapsed_us": self.machine.elapsed_us(),
            "state": self.machine.state(),
        })
    }

    fn load_state(&mut self, state: &Value) -> Result<(), serde_json::Error> {
        if let Some(regs) = state.get("registers") {
            let regs: Registers = serde_json::from_value(regs.clone())?;
            self.machine.cpu.set_registers(&regs);
        }
        Ok(())
    }

    fn supports_save_states(&self) -> bool {
        true
    }

    fn mount_points(&self) -> Vec<MountPointInfo> {
        vec![MountPointInfo {
            id: PROGRAM_MOUNT.to_string(),
            name: "DOS Program".to_string(),
            extensions: vec!["com".to_string(), "exe".to_string()],
            required: true,
        }]
    }

    fn mount(&mut self, mount_point_id: &str, data: &[u8]) -> Result<(), Self::Error> {
        match mount_point_id {
            PROGRAM_MOUNT => {
                let name = if data.starts_with(b"MZ") {
                    "PROGRAM.EXE"
                } else {
                    "PROGRAM.COM"
                };
                self.load_program(name, data)
            }
            _ => Err(PcError::InvalidMountPoint(mount_point_id.to_string())),
        }
    }

    fn unmount(&mut self, mount_point_id: &str) -> Result<(), Self::Error> {
        match mount_point_id {
            PROGRAM_MOUNT => {
                self.program = None;
                self.restart()
            }
            _ => Err(PcError::InvalidMountPoint(mount_point_id.to_string())),
        }
    }

    fn is_mounted(&self, mount_point_id: &str) -> bool {
        mount_point_id == PROGRAM_MOUNT && self.program.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // MOV AX,1234h; HLT; JMP back to the HLT
    const HALT_LOOP: [u8; 6] = [0xB8, 0x34, 0x12, 0xF4, 0xEB, 0xFD];

    fn system() -> PcSystem {
        PcSystem::new(MachineConfig::default()).unwrap()
    }

    #[test]
    fn test_mount_points() {
        let sys = system();
        let points = sys.mount_points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].id, "Program");
        assert!(points[0].required);
        assert!(!sys.is_mounted("Program"));
    }

    #[test]
    fn test_invalid_mount_point() {
        let mut sys = system();
        assert!(matches!(
            sys.mount("FloppyA", &[0x90]),
            Err(PcError::InvalidMountPoint(_))
        ));
        assert!(matches!(sys.unmount("FloppyA"), Err(PcError::InvalidMountPoint(_))));
    }

    #[test]
    fn test_step_frame_needs_program() {
        let mut sys = system();
        assert!(matches!(sys.step_frame(), Err(PcError::NoExecutable)));
    }

    #[test]
    fn test_step_frame_renders_mode13() {
        // MOV AX,13h; INT 10h; MOV AX,A000h; MOV ES,AX; MOV BYTE [ES:0],0Fh; JMP $
        let program = [
            0xB8, 0x13, 0x00, 0xCD, 0x10, 0xB8, 0x00, 0xA0, 0x8E, 0xC0, 0x26, 0xC6, 0x06, 0x00,
            0x00, 0x0F, 0xEB, 0xFE,
        ];
        let mut sys = system();
        sys.mount("Program", &program).unwrap();
        assert!(sys.is_mounted("Program"));

        let frame = sys.step_frame().unwrap();
        assert_eq!((frame.width, frame.height), (320, 200));
        assert_eq!(frame.pixels[0], 0xFFFF_FFFF);
        assert_eq!(frame.pixels[1], 0xFF00_0000);
    }

    #[test]
    fn test_fault_is_reported() {
        // MOV AH,6Ch; INT 21h
        let mut sys = system();
        sys.mount("Program", &[0xB4, 0x6C, 0xCD, 0x21]).unwrap();
        assert!(matches!(sys.step_frame(), Err(PcError::Faulted(_))));
    }

    #[test]
    fn test_reset_reloads_program() {
        let mut sys = system();
        sys.mount("Program", &HALT_LOOP).unwrap();
        sys.step_frame().unwrap();
        assert_eq!(sys.machine().cpu.ax, 0x1234);

        sys.reset();
        assert_eq!(sys.machine().cpu.ip, 0x100);
        assert_eq!(sys.machine().cpu.ax, 0);

        sys.unmount("Program").unwrap();
        assert!(!sys.is_mounted("Program"));
    }

    #[test]
    fn test_save_load_state() {
        let mut sys = system();
        sys.mount("Program", &HALT_LOOP).unwrap();
        sys.step_frame().unwrap();

        let state = sys.save_state();
        assert_eq!(state["system"], "pc");
        assert_eq!(state["version"], 1);
        assert_eq!(state["registers"]["ax"], 0x1234);
        assert_eq!(state["state"], "Running");

        let mut other = system();
        other.load_state(&state).unwrap();
        assert_eq!(other.machine().cpu.ax, 0x1234);
    }
}
