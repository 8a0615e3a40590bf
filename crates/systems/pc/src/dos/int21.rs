//! INT 21h function dispatcher

use super::files::{AccessMode, FileTable, STDERR, STDOUT};
use super::{read_asciz, set_caller_carry, terminate_process, DosError, UserState, DOS_VERSION};
use crate::bus::linear;
use crate::config::AllocStrategy;
use crate::machine::Machine;
use crate::PcError;
use xtemu_core::logging::{log, LogCategory, LogLevel};

/// Longest '$'-terminated string printed by AH=09h
const MAX_STRING: u16 = 0xFFFF;
/// Drive C:
const DEFAULT_DRIVE: u8 = 2;

/// Functions that report success or failure through the carry flag
fn reports_carry(ah: u8) -> bool {
    matches!(ah, 0x3C..=0x42 | 0x48..=0x4A | 0x58)
}

pub(super) fn dispatch(m: &mut Machine) -> Result<(), PcError> {
    let mut regs = UserState::capture(&m.cpu);
    let ah = regs.ah();

    log(LogCategory::Dos, LogLevel::Debug, || {
        format!(
            "INT 21h AH={:02X} AL={:02X} BX={:04X} CX={:04X} DX={:04X} DS={:04X} ES={:04X}",
            ah,
            regs.al(),
            regs.bx,
            regs.cx,
            regs.dx,
            regs.ds,
            regs.es
        )
    });

    let result = call(m, ah, &mut regs);
    if !m.is_running() {
        return result;
    }

    match result {
        Ok(()) => {
            regs.restore(&mut m.cpu);
            if reports_carry(ah) {
                set_caller_carry(&mut m.cpu, false);
            }
        }
        Err(PcError::Dos(err)) if err != DosError::McbDestroyed && reports_carry(ah) => {
            log(LogCategory::Dos, LogLevel::Debug, || {
                format!("INT 21h AH={:02X} failed: {}", ah, err)
            });
            regs.ax = err.code();
            if let DosError::InsufficientMemory { largest } = err {
                regs.bx = largest;
            }
            regs.restore(&mut m.cpu);
            set_caller_carry(&mut m.cpu, true);
        }
        Err(err) => return Err(err),
    }

    m.cpu.iret();
    Ok(())
}

fn call(m: &mut Machine, ah: u8, regs: &mut UserState) -> Result<(), PcError> {
    match ah {
        0x00 => terminate_process(m, 0),
        0x02 => {
            let c = regs.dl();
            m.console_write(&[c]);
            regs.set_al(c);
            Ok(())
        }
        0x09 => print_string(m, regs),
        0x0C => Ok(()),
        0x19 => {
            regs.set_al(DEFAULT_DRIVE);
            Ok(())
        }
        0x1A => {
            m.dos.dta = (regs.ds, regs.dx);
            Ok(())
        }
        0x25 => {
            m.set_vector(regs.al(), regs.ds, regs.dx);
            Ok(())
        }
        0x2F => {
            let (seg, off) = m.dos.dta;
            regs.es = seg;
            regs.bx = off;
            Ok(())
        }
        0x30 => {
            regs.ax = (DOS_VERSION.1 as u16) << 8 | DOS_VERSION.0 as u16;
            regs.bx = 0xFF00;
            regs.cx = 0;
            Ok(())
        }
        0x33 => {
            match regs.al() {
                0x00 => regs.set_dl(m.dos.break_check as u8),
                0x01 => m.dos.break_check = regs.dl() & 1 != 0,
                0x05 => regs.set_dl(DEFAULT_DRIVE + 1),
                _ => regs.set_al(0xFF),
            }
            Ok(())
        }
        0x35 => {
            let (seg, off) = m.vector(regs.al());
            regs.es = seg;
            regs.bx = off;
            Ok(())
        }
        0x3C => {
            let path = read_asciz(&m.cpu.bus, regs.ds, regs.dx)?;
            regs.ax = m.dos.files.create(&path)?;
            Ok(())
        }
        0x3D => {
            let path = read_asciz(&m.cpu.bus, regs.ds, regs.dx)?;
            let mode = AccessMode::from_code(regs.al())?;
            regs.ax = m.dos.files.open(&path, mode)?;
            Ok(())
        }
        0x3E => {
            m.dos.files.close(regs.bx)?;
            Ok(())
        }
        0x3F => {
            let data = m.dos.files.read(regs.bx, regs.cx as usize)?;
            for (i, &b) in data.iter().enumerate() {
                m.cpu.bus.write_u8(linear(regs.ds, regs.dx.wrapping_add(i as u16)), b);
            }
            regs.ax = data.len() as u16;
            Ok(())
        }
        0x40 => write_handle(m, regs),
        0x42 => {
            let offset = ((regs.cx as u32) << 16 | regs.dx as u32) as i32;
            let pos = m.dos.files.seek(regs.bx, regs.al(), offset)?;
            regs.ax = pos as u16;
            regs.dx = (pos >> 16) as u16;
            Ok(())
        }
        0x48 => {
            let chain = m.dos.chain;
            let seg = chain.allocate(&mut m.cpu.bus, regs.bx, m.dos.strategy, m.dos.current_psp)?;
            regs.ax = seg;
            Ok(())
        }
        0x49 => {
            let chain = m.dos.chain;
            chain.free(&mut m.cpu.bus, regs.es)?;
            Ok(())
        }
        0x4A => {
            let chain = m.dos.chain;
            chain.resize(&mut m.cpu.bus, regs.es, regs.bx)?;
            Ok(())
        }
        0x4C => terminate_process(m, regs.al()),
        0x4D => {
            regs.ax = m.dos.return_code;
            Ok(())
        }
        0x50 => {
            m.dos.current_psp = regs.bx;
            Ok(())
        }
        0x51 | 0x62 => {
            regs.bx = m.dos.current_psp;
            Ok(())
        }
        0x58 => memory_strategy(m, regs),
        _ => Err(PcError::Unimplemented(format!(
            "INT 21h AH={:02X} AL={:02X}",
            ah,
            regs.al()
        ))),
    }
}

/// AH=09h: print the '$'-terminated string at DS:DX
fn print_string(m: &mut Machine, regs: &mut UserState) -> Result<(), PcError> {
    let mut text = Vec::new();
    for i in 0..MAX_STRING {
        match m.cpu.bus.read_u8(linear(regs.ds, regs.dx.wrapping_add(i))) {
            b'$' => break,
            c => text.push(c),
        }
    }
    m.console_write(&text);
    regs.set_al(b'$');
    Ok(())
}

/// AH=40h: write CX bytes from DS:DX. Zero bytes truncates the file.
fn write_handle(m: &mut Machine, regs: &mut UserState) -> Result<(), PcError> {
    let handle = regs.bx;
    if regs.cx == 0 {
        m.dos.files.truncate(handle)?;
        regs.ax = 0;
        return Ok(());
    }

    let data = m.cpu.bus.read_bytes(linear(regs.ds, regs.dx), regs.cx as usize);
    let written = if handle == STDOUT || handle == STDERR {
        m.console_write(&data);
        data.len()
    } else if FileTable::is_device(handle) {
        data.len()
    } else {
        m.dos.files.write(handle, &data)?
    };
    regs.ax = written as u16;
    Ok(())
}

/// AH=58h: get/set allocation strategy and upper memory link
fn memory_strategy(m: &mut Machine, regs: &mut UserState) -> Result<(), PcError> {
    match regs.al() {
        0x00 => regs.ax = m.dos.strategy.code(),
        0x01 => {
            m.dos.strategy = AllocStrategy::from_code(regs.bx).ok_or(DosError::InvalidFunction)?;
        }
        // there is no upper memory to link
        0x02 => regs.set_al(0),
        0x03 if regs.bx == 0 => {}
        _ => return Err(DosError::InvalidFunction.into()),
    }
    Ok(())
}
