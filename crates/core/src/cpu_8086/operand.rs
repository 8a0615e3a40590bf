//! Per-instruction decode state and operand descriptors.

use super::Width;

/// Segment register, numbered as in the ModRM `reg` field of `8C`/`8E`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegReg {
    ES = 0,
    CS = 1,
    SS = 2,
    DS = 3,
}

impl SegReg {
    /// Only the low two bits select a register on the 8086.
    pub fn from_index(index: u8) -> Self {
        match index & 3 {
            0 => SegReg::ES,
            1 => SegReg::CS,
            2 => SegReg::SS,
            _ => SegReg::DS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepeatMode {
    #[default]
    None,
    /// `F3`: REP for MOVS/STOS/LODS, REPE for CMPS/SCAS
    Rep,
    /// `F2`
    Repne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub mode: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            mode: byte >> 6,
            reg: (byte >> 3) & 7,
            rm: byte & 7,
        }
    }

    pub fn is_register(&self) -> bool {
        self.mode == 0b11
    }
}

/// A resolved operand: either a register or a memory location whose
/// segment and effective offset have already been computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register { index: u8, width: Width },
    Memory { segment: u16, offset: u16, width: Width },
}

impl Operand {
    pub fn width(&self) -> Width {
        match *self {
            Operand::Register { width, .. } | Operand::Memory { width, .. } => width,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Operand::Memory { .. })
    }
}

/// Everything decoded while executing one instruction. Created fresh at the
/// top of every `step` and dropped at its end.
#[derive(Debug, Clone, Copy)]
pub struct DecodeCtx {
    pub opcode: u8,
    pub modrm: Option<ModRm>,
    pub seg_override: Option<SegReg>,
    pub rep: RepeatMode,
    pub lock: bool,
    /// IP of the first prefix byte; repeated string instructions resume here.
    pub start_ip: u16,
}

impl DecodeCtx {
    pub fn new(start_ip: u16) -> Self {
        Self {
            opcode: 0,
            modrm: None,
            seg_override: None,
            rep: RepeatMode::None,
            lock: false,
            start_ip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modrm_fields() {
        let m = ModRm::from_byte(0b10_011_110);
        assert_eq!((m.mode, m.reg, m.rm), (0b10, 0b011, 0b110));
        assert!(!m.is_register());
        assert!(ModRm::from_byte(0xC0).is_register());
    }

    #[test]
    fn segreg_ignores_high_bit() {
        assert_eq!(SegReg::from_index(4), SegReg::ES);
        assert_eq!(SegReg::from_index(7), SegReg::DS);
    }
}
