use super::cpu_with;
use crate::cpu_8086::{FLAG_CF, FLAG_OF, FLAG_ZF};

#[test]
fn test_shl_by_one_sets_carry_and_overflow() {
    let mut cpu = cpu_with(&[0xD0, 0xE0]); // SHL AL, 1
    cpu.ax = 0x0040;
    cpu.step();
    assert_eq!(cpu.ax & 0xFF, 0x80);
    assert!(!cpu.get_flag(FLAG_CF));
    assert!(cpu.get_flag(FLAG_OF), "sign changed");

    let mut cpu = cpu_with(&[0xD0, 0xE0]);
    cpu.ax = 0x0080;
    cpu.step();
    assert_eq!(cpu.ax & 0xFF, 0x00);
    assert!(cpu.get_flag(FLAG_CF));
    assert!(cpu.get_flag(FLAG_ZF));
}

#[test]
fn test_shr_word_by_cl() {
    let mut cpu = cpu_with(&[0xD3, 0xE8]); // SHR AX, CL
    cpu.ax = 0x8001;
    cpu.cx = 4;
    cpu.step();
    assert_eq!(cpu.ax, 0x0800);
    assert!(!cpu.get_flag(FLAG_CF));
}

#[test]
fn test_sar_keeps_sign() {
    let mut cpu = cpu_with(&[0xD1, 0xF8]); // SAR AX, 1
    cpu.ax = 0x8003;
    cpu.step();
    assert_eq!(cpu.ax, 0xC001);
    assert!(cpu.get_flag(FLAG_CF));
}

#[test]
fn test_rol_ror_byte() {
    let mut cpu = cpu_with(&[0xD0, 0xC0, 0xD0, 0xC8]); // ROL AL,1 ; ROR AL,1
    cpu.ax = 0x0081;
    cpu.step();
    assert_eq!(cpu.ax & 0xFF, 0x03);
    assert!(cpu.get_flag(FLAG_CF));
    cpu.step();
    assert_eq!(cpu.ax & 0xFF, 0x81);
    assert!(cpu.get_flag(FLAG_CF));
}

#[test]
fn test_rcl_rcr_through_carry() {
    let mut cpu = cpu_with(&[0xD0, 0xD0, 0xD0, 0xD8]); // RCL AL,1 ; RCR AL,1
    cpu.ax = 0x0080;
    cpu.set_flag(FLAG_CF, true);
    cpu.step();
    assert_eq!(cpu.ax & 0xFF, 0x01);
    assert!(cpu.get_flag(FLAG_CF));
    cpu.step();
    assert_eq!(cpu.ax & 0xFF, 0x80);
    assert!(cpu.get_flag(FLAG_CF));
}

#[test]
fn test_shift_count_zero_leaves_flags() {
    let mut cpu = cpu_with(&[0xD2, 0xE0]); // SHL AL, CL
    cpu.ax = 0x0055;
    cpu.cx = 0;
    cpu.set_flag(FLAG_CF, true);
    cpu.step();
    assert_eq!(cpu.ax, 0x0055);
    assert!(cpu.get_flag(FLAG_CF));
}

#[test]
fn test_rotate_does_not_touch_zero_flag() {
    let mut cpu = cpu_with(&[0xD0, 0xC0]); // ROL AL, 1
    cpu.ax = 0;
    cpu.set_flag(FLAG_ZF, false);
    cpu.step();
    assert!(!cpu.get_flag(FLAG_ZF));
}

#[test]
fn test_shift_memory_operand() {
    use super::phys;
    let mut cpu = cpu_with(&[0xD1, 0x26, 0x10, 0x00]); // SHL WORD [0x0010], 1
    cpu.bus.write_u16(phys(0x3000, 0x0010), 0x4001);
    cpu.step();
    assert_eq!(cpu.bus.read_u16(phys(0x3000, 0x0010)), 0x8002);
}
