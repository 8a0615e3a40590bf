//! Tests for the Intel 8086 CPU core
//!
//! - `tests_8bit` / `tests_16bit`: ALU and data movement by operand size
//! - `tests_flags`: flag derivation boundaries and PUSHF/POPF
//! - `tests_jumps`: jumps, calls, returns and loops
//! - `tests_strings`: string instructions and repeat resumption
//! - `tests_interrupts`: INT/IRET, hardware interrupts, faults, traps
//! - `tests_shifts`: group 2
//! - `tests_addressing`: ModRM forms and segment overrides
//! - `tests_bcd`: DAA DAS AAA AAS AAM AAD
//! - `tests_misc`: HLT, IO, device contract, decode errors

mod tests_bcd;
mod tests_flags;
mod tests_jumps;
mod tests_misc;
mod tests_shifts;

use super::{ArrayBus, Cpu8086};

pub(super) const CODE_SEG: u16 = 0x1000;
pub(super) const CODE_OFF: u16 = 0x0100;
pub(super) const STACK_SEG: u16 = 0x2000;

/// CPU with `program` at 1000:0100, DS=ES=3000 and a stack at 2000:FFFE.
pub(super) fn cpu_with(program: &[u8]) -> Cpu8086<ArrayBus> {
    let mut bus = ArrayBus::new();
    bus.load_program(phys(CODE_SEG, CODE_OFF), program);
    let mut cpu = Cpu8086::new(bus);
    cpu.cs = CODE_SEG;
    cpu.ip = CODE_OFF;
    cpu.ss = STACK_SEG;
    cpu.sp = 0xFFFE;
    cpu.ds = 0x3000;
    cpu.es = 0x3000;
    cpu
}

pub(super) fn phys(segment: u16, offset: u16) -> u32 {
    ((segment as u32) << 4) + offset as u32
}

/// Point interrupt `vector` at `segment:offset`.
pub(super) fn set_vector(cpu: &mut Cpu8086<ArrayBus>, vector: u8, segment: u16, offset: u16) {
    let slot = vector as u32 * 4;
    cpu.bus.write_u16(slot, offset);
    cpu.bus.write_u16(slot + 2, segment);
}
