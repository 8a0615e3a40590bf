//! Arithmetic, logic and shift primitives shared by every opcode form.
//!
//! All functions take and return values zero-extended to `u16`; the
//! `Width` argument decides where the sign bit and carry-out live.

use super::flags::Flags;
use super::Width;

/// The eight binary operations selected by bits 3..5 of `00..3F` opcodes
/// and by the ModRM `reg` field of group 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    pub fn from_index(index: u8) -> Self {
        match index & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }

    pub fn writes_result(self) -> bool {
        self != AluOp::Cmp
    }
}

pub fn binary(op: AluOp, dst: u16, src: u16, width: Width, flags: &mut Flags) -> u16 {
    match op {
        AluOp::Add => add(dst, src, false, width, flags),
        AluOp::Adc => {
            let carry = flags.cf;
            add(dst, src, carry, width, flags)
        }
        AluOp::Sub | AluOp::Cmp => sub(dst, src, false, width, flags),
        AluOp::Sbb => {
            let borrow = flags.cf;
            sub(dst, src, borrow, width, flags)
        }
        AluOp::Or => logic(dst | src, width, flags),
        AluOp::And => logic(dst & src, width, flags),
        AluOp::Xor => logic(dst ^ src, width, flags),
    }
}

pub fn add(dst: u16, src: u16, carry_in: bool, width: Width, flags: &mut Flags) -> u16 {
    let mask = width.mask();
    let (dst, src) = (dst & mask, src & mask);
    let wide = dst as u32 + src as u32 + carry_in as u32;
    let res = (wide as u16) & mask;

    flags.cf = wide > mask as u32;
    flags.of = (res ^ src) & (res ^ dst) & width.sign_bit() != 0;
    flags.af = (res ^ src ^ dst) & 0x10 != 0;
    flags.set_szp(res, width);
    res
}

pub fn sub(dst: u16, src: u16, borrow_in: bool, width: Width, flags: &mut Flags) -> u16 {
    let mask = width.mask();
    let (dst, src) = (dst & mask, src & mask);
    let res = dst.wrapping_sub(src).wrapping_sub(borrow_in as u16) & mask;

    flags.cf = (dst as u32) < src as u32 + borrow_in as u32;
    flags.of = (src ^ dst) & (res ^ dst) & width.sign_bit() != 0;
    flags.af = (res ^ src ^ dst) & 0x10 != 0;
    flags.set_szp(res, width);
    res
}

/// OR/AND/XOR/TEST: CF, OF and AF are cleared. AF is architecturally
/// undefined here; clearing it matches what DOS-era emulators report.
pub fn logic(res: u16, width: Width, flags: &mut Flags) -> u16 {
    let res = res & width.mask();
    flags.cf = false;
    flags.of = false;
    flags.af = false;
    flags.set_szp(res, width);
    res
}

/// INC leaves CF alone.
pub fn inc(val: u16, width: Width, flags: &mut Flags) -> u16 {
    let cf = flags.cf;
    let res = add(val, 1, false, width, flags);
    flags.cf = cf;
    res
}

/// DEC leaves CF alone.
pub fn dec(val: u16, width: Width, flags: &mut Flags) -> u16 {
    let cf = flags.cf;
    let res = sub(val, 1, false, width, flags);
    flags.cf = cf;
    res
}

pub fn neg(val: u16, width: Width, flags: &mut Flags) -> u16 {
    sub(0, val, false, width, flags)
}

/// Group 2 operation selected by the ModRM `reg` field:
/// ROL ROR RCL RCR SHL SHR SAL SAR.
///
/// The count is not masked (the 8086 shifts up to 255 times). A zero count
/// leaves the operand and all flags untouched. Rotates only update CF and
/// OF; shifts also set SF, ZF and PF. OF reports whether the sign bit of the
/// result differs from the original operand.
pub fn shift(func: u8, val: u16, count: u8, width: Width, flags: &mut Flags) -> u16 {
    let mask = width.mask();
    let sign = width.sign_bit();
    let original = val & mask;
    if count == 0 {
        return original;
    }

    let mut v = original;
    let mut cf = flags.cf;
    for _ in 0..count {
        match func & 7 {
            // ROL
            0 => {
                cf = v & sign != 0;
                v = ((v << 1) | cf as u16) & mask;
            }
            // ROR
            1 => {
                cf = v & 1 != 0;
                v = (v >> 1) | if cf { sign } else { 0 };
            }
            // RCL
            2 => {
                let out = v & sign != 0;
                v = ((v << 1) | cf as u16) & mask;
                cf = out;
            }
            // RCR
            3 => {
                let out = v & 1 != 0;
                v = (v >> 1) | if cf { sign } else { 0 };
                cf = out;
            }
            // SHL, SAL
            4 | 6 => {
                cf = v & sign != 0;
                v = (v << 1) & mask;
            }
            // SHR
            5 => {
                cf = v & 1 != 0;
                v >>= 1;
            }
            // SAR
            _ => {
                cf = v & 1 != 0;
                v = (v >> 1) | (v & sign);
            }
        }
    }

    flags.cf = cf;
    flags.of = (v ^ original) & sign != 0;
    if func & 4 != 0 {
        flags.set_szp(v, width);
    }
    v
}
