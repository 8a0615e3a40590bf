//! Program loader for `.COM` and MZ `.EXE` images
//!
//! Both formats get an environment block and a program segment prefix
//! (PSP) from the DOS allocator. A `.COM` image is copied to PSP:0100 and
//! runs with all segment registers on the PSP. An MZ image is copied to the
//! paragraph after the PSP, relocated, and started at the entry point from
//! its header.

use crate::bus::{linear, PcBus};
use crate::dos::env::Environment;
use crate::dos::mcb::{Mcb, MEMORY_TOP, SYSTEM_OWNER};
use crate::dos::DosError;
use crate::machine::Machine;
use crate::PcError;
use xtemu_core::logging::{log, LogCategory, LogLevel};

/// Paragraphs in a PSP
pub const PSP_PARAS: u16 = 0x10;
/// Paragraphs given to each program's environment
const ENV_PARAS: u16 = 0x40;
/// Largest `.COM` image: a 64 KiB segment minus the PSP and a stack word
const MAX_COM_SIZE: usize = 0xFF00;
const MZ_HEADER_SIZE: usize = 0x1C;
const MZ_PAGE_SIZE: usize = 512;
const JFT_SIZE: usize = 20;

/// Variables added on top of the inherited boot environment
const PROGRAM_ENVIRONMENT: [&str; 2] = ["PROMPT=$P$G", "BLASTER=A220 I7 D1 H5 P330 T6"];

/// The fixed part of an MZ header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MzHeader {
    pub bytes_in_last_page: u16,
    pub pages: u16,
    pub relocations: u16,
    pub header_paras: u16,
    pub min_alloc: u16,
    pub max_alloc: u16,
    pub ss: u16,
    pub sp: u16,
    pub checksum: u16,
    pub ip: u16,
    pub cs: u16,
    pub relocation_offset: u16,
}

impl MzHeader {
    pub fn parse(data: &[u8]) -> Result<Self, PcError> {
        if data.len() < MZ_HEADER_SIZE || !is_mz(data) {
            return Err(PcError::InvalidExecutable("missing MZ header".to_string()));
        }
        let word = |i: usize| u16::from_le_bytes([data[2 * i], data[2 * i + 1]]);
        Ok(Self {
            bytes_in_last_page: word(1),
            pages: word(2),
            relocations: word(3),
            header_paras: word(4),
            min_alloc: word(5),
            max_alloc: word(6),
            ss: word(7),
            sp: word(8),
            checksum: word(9),
            ip: word(10),
            cs: word(11),
            relocation_offset: word(12),
        })
    }

    /// Byte offset of the load image in the file.
    pub fn image_start(&self) -> usize {
        self.header_paras as usize * 16
    }

    /// Bytes of load image following the header.
    pub fn image_size(&self) -> usize {
        let mut total = self.pages as usize * MZ_PAGE_SIZE;
        if self.bytes_in_last_page != 0 && total >= MZ_PAGE_SIZE {
            total -= MZ_PAGE_SIZE - (self.bytes_in_last_page as usize & (MZ_PAGE_SIZE - 1));
        }
        total.saturating_sub(self.image_start())
    }
}

fn is_mz(data: &[u8]) -> bool {
    matches!(data, [b'M', b'Z', ..] | [b'Z', b'M', ..])
}

/// Load `data` as a program named `name` and set up the CPU to run it.
pub fn load_program(m: &mut Machine, data: &[u8], name: &str) -> Result<(), PcError> {
    if data.is_empty() {
        return Err(PcError::NoExecutable);
    }
    let path = program_path(name);
    let env_seg = create_environment(m, &path)?;

    let loaded = if is_mz(data) {
        load_exe(m, data, env_seg)
    } else {
        load_com(m, data, env_seg)
    };
    let psp = match loaded {
        Ok(psp) => psp,
        Err(err) => {
            let chain = m.dos.chain;
            chain.free(&mut m.cpu.bus, env_seg)?;
            return Err(err);
        }
    };

    // the environment belongs to the program from now on
    Mcb::for_data(env_seg).set_owner(&mut m.cpu.bus, psp);
    m.dos.current_psp = psp;
    m.dos.dta = (psp, 0x80);
    m.cpu.set_halted(false);

    log(LogCategory::Dos, LogLevel::Info, || {
        format!(
            "loaded {} ({} bytes): PSP {:04X}, entry {:04X}:{:04X}, stack {:04X}:{:04X}",
            path,
            data.len(),
            psp,
            m.cpu.cs,
            m.cpu.ip,
            m.cpu.ss,
            m.cpu.sp
        )
    });
    Ok(())
}

/// `C:\NAME.EXT` for a host file name.
fn program_path(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    format!("C:\\{}", base.to_ascii_uppercase())
}

fn create_environment(m: &mut Machine, path: &str) -> Result<u16, PcError> {
    let chain = m.dos.chain;
    let strategy = m.dos.strategy;
    let bus = &mut m.cpu.bus;

    let inherited = Environment::from_seg(bus, m.dos.boot_environment)?.entries(bus);
    let seg = chain.allocate(bus, ENV_PARAS, strategy, SYSTEM_OWNER)?;
    let mut env = Environment::create_in_seg(bus, seg, ENV_PARAS as usize * 16)?;
    for entry in &inherited {
        env.set(bus, entry)?;
    }
    for entry in PROGRAM_ENVIRONMENT {
        env.set(bus, entry)?;
    }
    for entry in &m.dos.environment {
        env.set(bus, entry).map_err(|err| {
            PcError::InvalidConfig(format!("environment entry {:?}: {}", entry, err))
        })?;
    }
    env.set_program_path(bus, path)?;
    Ok(seg)
}

/// Allocate a block of `wanted` paragraphs (at least `required`) and make
/// it its own owner, as a PSP block is.
fn allocate_program_block(m: &mut Machine, required: u16, wanted: u16) -> Result<u16, PcError> {
    let chain = m.dos.chain;
    let strategy = m.dos.strategy;
    let bus = &mut m.cpu.bus;

    let largest = match chain.allocate(bus, 0xFFFF, strategy, SYSTEM_OWNER) {
        Ok(seg) => {
            // the whole 0xFFFF fitted; give it back and size from there
            chain.free(bus, seg)?;
            0xFFFF
        }
        Err(DosError::InsufficientMemory { largest }) => largest,
        Err(err) => return Err(err.into()),
    };
    if largest < required {
        return Err(DosError::InsufficientMemory { largest }.into());
    }

    let psp = chain.allocate(bus, wanted.clamp(required, largest), strategy, SYSTEM_OWNER)?;
    Mcb::for_data(psp).set_owner(bus, psp);
    Ok(psp)
}

fn load_com(m: &mut Machine, data: &[u8], env_seg: u16) -> Result<u16, PcError> {
    if data.len() > MAX_COM_SIZE {
        return Err(PcError::InvalidExecutable(format!(
            "COM image of {} bytes does not fit in a segment",
            data.len()
        )));
    }

    // a full 64 KiB segment, or whatever is left
    let psp = allocate_program_block(m, 0x1000, 0xFFFF)?;
    let block_size = Mcb::for_data(psp).size(&m.cpu.bus);
    write_psp(&mut m.cpu.bus, psp, block_size, env_seg);
    m.cpu.bus.write_bytes(linear(psp, 0x100), data);

    set_initial_registers(m, psp);
    m.cpu.cs = psp;
    m.cpu.ip = 0x100;
    m.cpu.ss = psp;
    // a RET from the program lands on INT 20h at PSP:0000
    m.cpu.sp = 0;
    m.cpu.push(0);
    Ok(psp)
}

fn load_exe(m: &mut Machine, data: &[u8], env_seg: u16) -> Result<u16, PcError> {
    let header = MzHeader::parse(data)?;
    let start = header.image_start();
    let size = header.image_size();
    if start > data.len() || start + size > data.len() {
        return Err(PcError::InvalidExecutable(format!(
            "image of {} bytes at {:#x} runs past the end of the file",
            size, start
        )));
    }

    let image_paras = size.div_ceil(16) as u16;
    let required = PSP_PARAS
        .saturating_add(image_paras)
        .saturating_add(header.min_alloc);
    let wanted = if header.max_alloc == 0 {
        0xFFFF
    } else {
        (PSP_PARAS + image_paras).saturating_add(header.max_alloc)
    };

    let psp = allocate_program_block(m, required, wanted)?;
    let block_size = Mcb::for_data(psp).size(&m.cpu.bus);
    let exe_seg = psp + PSP_PARAS;

    let bus = &mut m.cpu.bus;
    write_psp(bus, psp, block_size, env_seg);
    bus.write_bytes(linear(exe_seg, 0), &data[start..start + size]);
    apply_relocations(bus, data, &header, exe_seg)?;

    set_initial_registers(m, psp);
    m.cpu.cs = header.cs.wrapping_add(exe_seg);
    m.cpu.ip = header.ip;
    m.cpu.ss = header.ss.wrapping_add(exe_seg);
    m.cpu.sp = header.sp;
    Ok(psp)
}

fn apply_relocations(
    bus: &mut PcBus,
    data: &[u8],
    header: &MzHeader,
    exe_seg: u16,
) -> Result<(), PcError> {
    let table = header.relocation_offset as usize;
    let count = header.relocations as usize;
    let entries = data.get(table..table + 4 * count).ok_or_else(|| {
        PcError::InvalidExecutable("relocation table runs past the end of the file".to_string())
    })?;

    for entry in entries.chunks_exact(4) {
        let offset = u16::from_le_bytes([entry[0], entry[1]]);
        let segment = u16::from_le_bytes([entry[2], entry[3]]);
        let addr = linear(segment.wrapping_add(exe_seg), offset);
        let value = bus.read_u16(addr);
        bus.write_u16(addr, value.wrapping_add(exe_seg));
    }
    log(LogCategory::Dos, LogLevel::Debug, || {
        format!("applied {} relocations at segment {:04X}", count, exe_seg)
    });
    Ok(())
}

fn write_psp(bus: &mut PcBus, psp: u16, block_size: u16, env_seg: u16) {
    for i in 0..0x100 {
        bus.write_u8(linear(psp, i), 0);
    }
    // INT 20h
    bus.write_bytes(linear(psp, 0x00), &[0xCD, 0x20]);
    let top = psp.wrapping_add(block_size).min(MEMORY_TOP);
    bus.write_u16(linear(psp, 0x02), top);

    // INT 22h-24h as they were when the program started
    for (i, vector) in (0x22..=0x24u32).enumerate() {
        let saved = bus.read_u16(4 * vector) as u32 | (bus.read_u16(4 * vector + 2) as u32) << 16;
        let at = linear(psp, 0x0A + 4 * i as u16);
        bus.write_u16(at, saved as u16);
        bus.write_u16(at + 2, (saved >> 16) as u16);
    }
    // parent PSP
    bus.write_u16(linear(psp, 0x16), psp);

    // job file table: stdin/stdout/stderr on CON, then AUX and PRN
    let mut jft = [0xFFu8; JFT_SIZE];
    jft[..5].copy_from_slice(&[1, 1, 1, 0, 2]);
    bus.write_bytes(linear(psp, 0x18), &jft);
    bus.write_u16(linear(psp, 0x2C), env_seg);
    bus.write_u16(linear(psp, 0x32), JFT_SIZE as u16);
    bus.write_u16(linear(psp, 0x34), 0x18);
    bus.write_u16(linear(psp, 0x36), psp);

    // INT 21h; RETF
    bus.write_bytes(linear(psp, 0x50), &[0xCD, 0x21, 0xCB]);
    // empty command tail
    bus.write_bytes(linear(psp, 0x80), &[0x00, 0x0D]);
}

/// Register values DOS leaves behind when starting a program.
fn set_initial_registers(m: &mut Machine, psp: u16) {
    let cpu = &mut m.cpu;
    cpu.ax = 0;
    cpu.bx = 0;
    cpu.cx = 0x00FF;
    cpu.dx = 0x0810;
    cpu.si = 0x0012;
    cpu.di = 0x1F40;
    cpu.bp = 0x091C;
    cpu.ds = psp;
    cpu.es = psp;
    cpu.flags.if_ = true;
    cpu.flags.df = false;
}
