//! The 8086 FLAGS register.
//!
//! The nine architectural flags are kept as named booleans so the hot ALU
//! paths never mask and shift. Every other bit of the 16-bit register is
//! kept verbatim in `reserved`, which makes `from_bits(x).bits() == x` hold
//! for every `x` (programs that detect the CPU type with PUSHF/POPF rely on
//! the upper nibble surviving).

use serde::{Deserialize, Serialize};

use super::Width;

pub const FLAG_CF: u16 = 0x0001; // Carry
pub const FLAG_PF: u16 = 0x0004; // Parity
pub const FLAG_AF: u16 = 0x0010; // Auxiliary carry
pub const FLAG_ZF: u16 = 0x0040; // Zero
pub const FLAG_SF: u16 = 0x0080; // Sign
pub const FLAG_TF: u16 = 0x0100; // Trap
pub const FLAG_IF: u16 = 0x0200; // Interrupt enable
pub const FLAG_DF: u16 = 0x0400; // Direction
pub const FLAG_OF: u16 = 0x0800; // Overflow

const NAMED_MASK: u16 =
    FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_TF | FLAG_IF | FLAG_DF | FLAG_OF;

/// Power-on value: bit 1 and the upper nibble read as set on an 8086.
pub const FLAGS_RESET: u16 = 0xF002;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags {
    pub cf: bool,
    pub pf: bool,
    pub af: bool,
    pub zf: bool,
    pub sf: bool,
    pub tf: bool,
    #[serde(rename = "if")]
    pub if_: bool,
    pub df: bool,
    pub of: bool,
    reserved: u16,
}

impl Flags {
    pub fn from_bits(bits: u16) -> Self {
        Self {
            cf: bits & FLAG_CF != 0,
            pf: bits & FLAG_PF != 0,
            af: bits & FLAG_AF != 0,
            zf: bits & FLAG_ZF != 0,
            sf: bits & FLAG_SF != 0,
            tf: bits & FLAG_TF != 0,
            if_: bits & FLAG_IF != 0,
            df: bits & FLAG_DF != 0,
            of: bits & FLAG_OF != 0,
            reserved: bits & !NAMED_MASK,
        }
    }

    pub fn bits(&self) -> u16 {
        let mut bits = self.reserved;
        for (set, mask) in [
            (self.cf, FLAG_CF),
            (self.pf, FLAG_PF),
            (self.af, FLAG_AF),
            (self.zf, FLAG_ZF),
            (self.sf, FLAG_SF),
            (self.tf, FLAG_TF),
            (self.if_, FLAG_IF),
            (self.df, FLAG_DF),
            (self.of, FLAG_OF),
        ] {
            if set {
                bits |= mask;
            }
        }
        bits
    }

    /// Read a single flag by its `FLAG_*` mask.
    pub fn get(&self, mask: u16) -> bool {
        self.bits() & mask != 0
    }

    /// Write a single flag by its `FLAG_*` mask. Reserved bits are untouched.
    pub fn set(&mut self, mask: u16, value: bool) {
        match mask {
            FLAG_CF => self.cf = value,
            FLAG_PF => self.pf = value,
            FLAG_AF => self.af = value,
            FLAG_ZF => self.zf = value,
            FLAG_SF => self.sf = value,
            FLAG_TF => self.tf = value,
            FLAG_IF => self.if_ = value,
            FLAG_DF => self.df = value,
            FLAG_OF => self.of = value,
            _ => {
                let bits = if value { self.bits() | mask } else { self.bits() & !mask };
                *self = Self::from_bits(bits);
            }
        }
    }

    /// SF, ZF and PF from a result of the given width. PF always looks at
    /// the low byte only.
    #[inline]
    pub fn set_szp(&mut self, result: u16, width: Width) {
        let result = result & width.mask();
        self.zf = result == 0;
        self.sf = result & width.sign_bit() != 0;
        self.pf = parity(result as u8);
    }

    /// LAHF view: SF ZF - AF - PF - CF.
    pub fn low_byte(&self) -> u8 {
        (self.bits() & 0x00FF) as u8
    }

    /// SAHF: replaces SF, ZF, AF, PF and CF from `ah`.
    pub fn set_low_byte(&mut self, ah: u8) {
        let ah = ah as u16;
        self.sf = ah & FLAG_SF != 0;
        self.zf = ah & FLAG_ZF != 0;
        self.af = ah & FLAG_AF != 0;
        self.pf = ah & FLAG_PF != 0;
        self.cf = ah & FLAG_CF != 0;
    }
}

#[inline]
pub fn parity(val: u8) -> bool {
    val.count_ones() % 2 == 0
}
