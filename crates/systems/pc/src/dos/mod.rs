//! DOS kernel services
//!
//! INT 20h and INT 21h run as host callbacks. The guest's registers are
//! captured into a [`UserState`] on entry, the function works on that
//! copy, and the copy is written back before returning to the caller.
//! Functions that report errors the DOS way clear or set the carry flag in
//! the FLAGS image on the caller's stack and put the error code in AX.

pub mod env;
pub mod files;
mod int21;
pub mod mcb;

use crate::bus::{linear, PcBus};
use crate::config::{AllocStrategy, MachineConfig};
use crate::machine::Machine;
use crate::PcError;
use env::Environment;
use files::FileTable;
use mcb::{McbChain, MEMORY_TOP, SYSTEM_OWNER};
use thiserror::Error;
use xtemu_core::cpu_8086::Cpu8086;
use xtemu_core::logging::{log, LogCategory, LogLevel};

/// Reported by INT 21h AH=30h
pub const DOS_VERSION: (u8, u8) = (5, 0);

/// Longest path accepted from the guest, including the terminator
const MAX_PATH: usize = 128;

/// Paragraphs in the environment block DOS sets up at boot
pub const BOOT_ENV_PARAS: u16 = 10;
/// Contents of the boot environment, inherited by every program
pub const BOOT_ENVIRONMENT: [&str; 2] = ["COMSPEC=C:\\COMMAND.COM", "PATH=C:\\DOS"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DosError {
    #[error("invalid function")]
    InvalidFunction,
    #[error("file not found")]
    FileNotFound,
    #[error("path not found")]
    PathNotFound,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("memory control blocks destroyed")]
    McbDestroyed,
    #[error("insufficient memory (largest block {largest} paragraphs)")]
    InsufficientMemory { largest: u16 },
    #[error("invalid memory block address")]
    InvalidBlock,
    #[error("invalid environment")]
    InvalidEnvironment,
    #[error("invalid format")]
    InvalidFormat,
    #[error("invalid data")]
    InvalidData,
    #[error("seek error")]
    SeekError,
    #[error("environment block full")]
    InsufficientEnvironment,
}

impl DosError {
    /// Error code returned to the guest in AX.
    pub fn code(&self) -> u16 {
        match self {
            DosError::InvalidFunction => 0x01,
            DosError::FileNotFound => 0x02,
            DosError::PathNotFound => 0x03,
            DosError::TooManyOpenFiles => 0x04,
            DosError::AccessDenied => 0x05,
            DosError::InvalidHandle => 0x06,
            DosError::McbDestroyed => 0x07,
            DosError::InsufficientMemory { .. } => 0x08,
            DosError::InvalidBlock => 0x09,
            DosError::InvalidEnvironment => 0x0A,
            DosError::InvalidFormat => 0x0B,
            DosError::InvalidData => 0x0D,
            DosError::SeekError => 0x19,
            DosError::InsufficientEnvironment => 0x08,
        }
    }
}

/// Snapshot of the guest registers a DOS call may read or change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserState {
    pub ax: u16,
    pub bx: u16,
    pub cx: u16,
    pub dx: u16,
    pub si: u16,
    pub di: u16,
    pub bp: u16,
    pub ds: u16,
    pub es: u16,
}

impl UserState {
    pub fn capture(cpu: &Cpu8086<PcBus>) -> Self {
        Self {
            ax: cpu.ax,
            bx: cpu.bx,
            cx: cpu.cx,
            dx: cpu.dx,
            si: cpu.si,
            di: cpu.di,
            bp: cpu.bp,
            ds: cpu.ds,
            es: cpu.es,
        }
    }

    pub fn restore(&self, cpu: &mut Cpu8086<PcBus>) {
        cpu.ax = self.ax;
        cpu.bx = self.bx;
        cpu.cx = self.cx;
        cpu.dx = self.dx;
        cpu.si = self.si;
        cpu.di = self.di;
        cpu.bp = self.bp;
        cpu.ds = self.ds;
        cpu.es = self.es;
    }

    pub fn ah(&self) -> u8 {
        (self.ax >> 8) as u8
    }

    pub fn al(&self) -> u8 {
        self.ax as u8
    }

    pub fn dl(&self) -> u8 {
        self.dx as u8
    }

    pub fn set_al(&mut self, value: u8) {
        self.ax = (self.ax & 0xFF00) | value as u16;
    }

    pub fn set_dl(&mut self, value: u8) {
        self.dx = (self.dx & 0xFF00) | value as u16;
    }
}

/// Kernel state outside guest memory
pub struct Dos {
    pub(crate) chain: McbChain,
    pub(crate) strategy: AllocStrategy,
    /// Segment of the running program's PSP
    pub(crate) current_psp: u16,
    /// Disk transfer area as (segment, offset)
    pub(crate) dta: (u16, u16),
    /// Exit code in AL and termination type in AH, for AH=4Dh
    pub(crate) return_code: u16,
    pub(crate) break_check: bool,
    pub(crate) files: FileTable,
    /// Data segment of the boot environment block
    pub(crate) boot_environment: u16,
    /// Entries added to every program environment
    pub(crate) environment: Vec<String>,
}

impl Dos {
    pub fn new(config: &MachineConfig) -> Self {
        Self {
            chain: McbChain::default(),
            strategy: config.alloc_strategy,
            current_psp: 0,
            dta: (0, 0x80),
            return_code: 0,
            break_check: false,
            files: FileTable::new(config.drive_root.clone()),
            boot_environment: 0,
            environment: config.environment.clone(),
        }
    }

    pub fn current_psp(&self) -> u16 {
        self.current_psp
    }

    pub fn return_code(&self) -> u16 {
        self.return_code
    }

    pub fn chain(&self) -> McbChain {
        self.chain
    }

    pub fn strategy(&self) -> AllocStrategy {
        self.strategy
    }

    pub fn boot_environment(&self) -> u16 {
        self.boot_environment
    }
}

/// Lay out conventional memory and hook the DOS interrupts.
pub fn install(m: &mut Machine) -> Result<(), PcError> {
    let chain = m.dos.chain;
    let bus = &mut m.cpu.bus;
    chain.init(bus, MEMORY_TOP);

    // the first block holds the default environment
    let env_seg = chain.allocate(bus, BOOT_ENV_PARAS, AllocStrategy::FirstFit, SYSTEM_OWNER)?;
    let mut env = Environment::create_in_seg(bus, env_seg, BOOT_ENV_PARAS as usize * 16)?;
    for entry in BOOT_ENVIRONMENT {
        env.set(bus, entry)?;
    }
    chain.validate(bus)?;
    m.dos.boot_environment = env_seg;

    m.install_callback(0x20, "INT 20h", int20);
    m.install_callback(0x21, "INT 21h", int21::dispatch);

    log(LogCategory::Dos, LogLevel::Info, || {
        format!(
            "DOS {}.{:02} installed, {} KiB conventional memory free",
            DOS_VERSION.0,
            DOS_VERSION.1,
            (MEMORY_TOP - chain.base()) as u32 * 16 / 1024
        )
    });
    Ok(())
}

/// INT 20h: terminate with exit code 0
fn int20(m: &mut Machine) -> Result<(), PcError> {
    terminate_process(m, 0)
}

/// Release the program's memory and files and stop the machine.
pub(crate) fn terminate_process(m: &mut Machine, code: u8) -> Result<(), PcError> {
    let psp = m.dos.current_psp;
    let chain = m.dos.chain;
    chain.free_owned_by(&mut m.cpu.bus, psp)?;
    m.dos.files.close_all();
    m.dos.return_code = code as u16;
    m.terminate(code);
    Ok(())
}

/// Set or clear CF in the FLAGS word the INT instruction pushed.
pub(crate) fn set_caller_carry(cpu: &mut Cpu8086<PcBus>, carry: bool) {
    let addr = linear(cpu.ss, cpu.sp.wrapping_add(4));
    let flags = cpu.bus.read_u16(addr);
    let flags = if carry { flags | 0x0001 } else { flags & !0x0001 };
    cpu.bus.write_u16(addr, flags);
}

/// NUL-terminated string at `seg:off`.
pub(crate) fn read_asciz(bus: &PcBus, seg: u16, off: u16) -> Result<String, DosError> {
    let mut bytes = Vec::new();
    for i in 0..MAX_PATH as u16 {
        match bus.read_u8(linear(seg, off.wrapping_add(i))) {
            0 => return Ok(String::from_utf8_lossy(&bytes).into_owned()),
            b => bytes.push(b),
        }
    }
    Err(DosError::PathNotFound)
}
