use super::cpu_with;
use crate::cpu_8086::{FLAG_AF, FLAG_CF, FLAG_ZF};

#[test]
fn test_daa_after_add() {
    // ADD AL, 0x27 ; DAA  (0x15 + 0x27 = 0x42 BCD)
    let mut cpu = cpu_with(&[0x04, 0x27, 0x27]);
    cpu.ax = 0x0015;
    cpu.step();
    cpu.step();
    assert_eq!(cpu.ax & 0xFF, 0x42);
    assert!(!cpu.get_flag(FLAG_CF));
}

#[test]
fn test_daa_decimal_carry() {
    // 0x99 + 0x01 = 0x9A -> 0x00 with carry
    let mut cpu = cpu_with(&[0x04, 0x01, 0x27]);
    cpu.ax = 0x0099;
    cpu.step();
    cpu.step();
    assert_eq!(cpu.ax & 0xFF, 0x00);
    assert!(cpu.get_flag(FLAG_CF));
    assert!(cpu.get_flag(FLAG_ZF));
}

#[test]
fn test_daa_threshold_uses_original_al() {
    // AL=0x9A, AF=0, CF=0: both adjustments apply
    let mut cpu = cpu_with(&[0x27]);
    cpu.ax = 0x009A;
    cpu.step();
    assert_eq!(cpu.ax & 0xFF, 0x00);
    assert!(cpu.get_flag(FLAG_CF));
    assert!(cpu.get_flag(FLAG_AF));
}

#[test]
fn test_das_after_sub() {
    // SUB AL, 0x19 ; DAS  (0x42 - 0x19 = 0x23 BCD)
    let mut cpu = cpu_with(&[0x2C, 0x19, 0x2F]);
    cpu.ax = 0x0042;
    cpu.step();
    cpu.step();
    assert_eq!(cpu.ax & 0xFF, 0x23);
    assert!(!cpu.get_flag(FLAG_CF));
}

#[test]
fn test_aaa_carries_into_ah() {
    // ADD AL, 5 ; AAA  ('8' + 5)
    let mut cpu = cpu_with(&[0x04, 0x05, 0x37]);
    cpu.ax = 0x0038;
    cpu.step();
    cpu.step();
    assert_eq!(cpu.ax, 0x0103);
    assert!(cpu.get_flag(FLAG_CF));
    assert!(cpu.get_flag(FLAG_AF));
}

#[test]
fn test_aas_borrows_from_ah() {
    let mut cpu = cpu_with(&[0x3F]);
    cpu.ax = 0x020B;
    cpu.step();
    assert_eq!(cpu.ax, 0x0105);
    assert!(cpu.get_flag(FLAG_CF));
}

#[test]
fn test_aaa_no_adjust_masks_high_nibble() {
    let mut cpu = cpu_with(&[0x37]);
    cpu.ax = 0x0035;
    cpu.step();
    assert_eq!(cpu.ax, 0x0005);
    assert!(!cpu.get_flag(FLAG_CF));
}

#[test]
fn test_aam_aad() {
    // AAM ; AAD
    let mut cpu = cpu_with(&[0xD4, 0x0A, 0xD5, 0x0A]);
    cpu.ax = 63;
    cpu.step();
    assert_eq!(cpu.ax, 0x0603);
    cpu.step();
    assert_eq!(cpu.ax, 63);
}

#[test]
fn test_aam_other_base() {
    let mut cpu = cpu_with(&[0xD4, 0x10]);
    cpu.ax = 0x00AB;
    cpu.step();
    assert_eq!(cpu.ax, 0x0A0B);
}
