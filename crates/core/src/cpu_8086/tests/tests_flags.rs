//! Flag derivation at width boundaries and the FLAGS register image

use super::{cpu_with, phys, STACK_SEG};
use crate::cpu_8086::{
    Flags, Width, FLAGS_RESET, FLAG_AF, FLAG_CF, FLAG_DF, FLAG_IF, FLAG_OF, FLAG_PF, FLAG_SF,
    FLAG_TF, FLAG_ZF,
};

#[test]
fn test_reset_flags_image() {
    let cpu = cpu_with(&[]);
    assert_eq!(cpu.flags.bits(), FLAGS_RESET);
    assert!(!cpu.get_flag(FLAG_IF));
}

#[test]
fn test_parity_counts_low_byte_only() {
    // ADD AX, 0x0100 -> 0x0103; low byte 0x03 has two bits set
    let mut cpu = cpu_with(&[0x05, 0x00, 0x01]);
    cpu.ax = 0x0003;
    cpu.step();
    assert!(cpu.get_flag(FLAG_PF));

    let mut cpu = cpu_with(&[0x05, 0x00, 0x01]);
    cpu.ax = 0x0001;
    cpu.step();
    assert!(!cpu.get_flag(FLAG_PF));
}

#[test]
fn test_aux_carry_from_low_nibble() {
    let mut cpu = cpu_with(&[0x04, 0x01]); // ADD AL, 1
    cpu.ax = 0x000F;
    cpu.step();
    assert!(cpu.get_flag(FLAG_AF));

    let mut cpu = cpu_with(&[0x2C, 0x01]); // SUB AL, 1
    cpu.ax = 0x0010;
    cpu.step();
    assert!(cpu.get_flag(FLAG_AF), "borrow out of bit 4");
}

#[test]
fn test_word_subtract_boundaries() {
    // SUB AX, 1 with AX=0x8000 -> 0x7FFF: overflow, no carry
    let mut cpu = cpu_with(&[0x2D, 0x01, 0x00]);
    cpu.ax = 0x8000;
    cpu.step();
    assert_eq!(cpu.ax, 0x7FFF);
    assert!(cpu.get_flag(FLAG_OF));
    assert!(!cpu.get_flag(FLAG_CF));
    assert!(!cpu.get_flag(FLAG_SF));

    // CMP AX, 1 with AX=0 -> borrow
    let mut cpu = cpu_with(&[0x3D, 0x01, 0x00]);
    cpu.ax = 0x0000;
    cpu.step();
    assert!(cpu.get_flag(FLAG_CF));
    assert!(cpu.get_flag(FLAG_SF));
    assert!(!cpu.get_flag(FLAG_OF));
}

#[test]
fn test_neg_zero_clears_carry() {
    let mut cpu = cpu_with(&[0xF7, 0xD8]); // NEG AX
    cpu.ax = 0;
    cpu.set_flag(FLAG_CF, true);
    cpu.step();
    assert!(!cpu.get_flag(FLAG_CF));
    assert!(cpu.get_flag(FLAG_ZF));
}

#[test]
fn test_neg_most_negative_overflows() {
    let mut cpu = cpu_with(&[0xF6, 0xD8]); // NEG AL
    cpu.ax = 0x0080;
    cpu.step();
    assert_eq!(cpu.ax & 0xFF, 0x80);
    assert!(cpu.get_flag(FLAG_OF));
    assert!(cpu.get_flag(FLAG_CF));
}

#[test]
fn test_inc_dec_overflow_boundaries() {
    let mut cpu = cpu_with(&[0x40, 0x48]); // INC AX ; DEC AX
    cpu.ax = 0x7FFF;
    cpu.step();
    assert!(cpu.get_flag(FLAG_OF));
    assert_eq!(cpu.ax, 0x8000);
    cpu.step();
    assert!(cpu.get_flag(FLAG_OF));
    assert_eq!(cpu.ax, 0x7FFF);
}

#[test]
fn test_pushf_popf_roundtrip_keeps_reserved_bits() {
    // PUSHF ; POPF
    let mut cpu = cpu_with(&[0x9C, 0x9D]);
    let image = 0xF000 | FLAG_CF | FLAG_ZF | FLAG_DF | FLAG_OF | 0x0002;
    cpu.flags = Flags::from_bits(image);
    cpu.step();
    assert_eq!(cpu.bus.read_u16(phys(STACK_SEG, 0xFFFC)), image);

    // scramble, then restore from the stack
    cpu.flags = Flags::from_bits(0);
    cpu.step();
    assert_eq!(cpu.flags.bits(), image);
    assert_eq!(cpu.sp, 0xFFFE);
}

#[test]
fn test_popf_loads_every_named_flag() {
    let mut cpu = cpu_with(&[0x9D]);
    let all = FLAG_CF
        | FLAG_PF
        | FLAG_AF
        | FLAG_ZF
        | FLAG_SF
        | FLAG_TF
        | FLAG_IF
        | FLAG_DF
        | FLAG_OF;
    cpu.sp = 0xFFFC;
    cpu.bus.write_u16(phys(STACK_SEG, 0xFFFC), all);
    cpu.step();
    for flag in [
        FLAG_CF, FLAG_PF, FLAG_AF, FLAG_ZF, FLAG_SF, FLAG_TF, FLAG_IF, FLAG_DF, FLAG_OF,
    ] {
        assert!(cpu.get_flag(flag), "flag {:04X}", flag);
    }
}

#[test]
fn test_flag_instructions() {
    // STC CMC CLC STD CLD STI CLI
    let mut cpu = cpu_with(&[0xF9, 0xF5, 0xF8, 0xFD, 0xFC, 0xFB, 0xFA]);
    cpu.step();
    assert!(cpu.get_flag(FLAG_CF));
    cpu.step();
    assert!(!cpu.get_flag(FLAG_CF));
    cpu.step();
    assert!(!cpu.get_flag(FLAG_CF));
    cpu.step();
    assert!(cpu.get_flag(FLAG_DF));
    cpu.step();
    assert!(!cpu.get_flag(FLAG_DF));
    cpu.step();
    assert!(cpu.get_flag(FLAG_IF));
    cpu.step();
    assert!(!cpu.get_flag(FLAG_IF));
}

#[test]
fn test_set_szp_word_and_byte() {
    let mut flags = Flags::default();
    flags.set_szp(0x0080, Width::Byte);
    assert!(flags.sf);
    flags.set_szp(0x0080, Width::Word);
    assert!(!flags.sf);
    flags.set_szp(0x0100, Width::Byte);
    assert!(flags.zf);
}
