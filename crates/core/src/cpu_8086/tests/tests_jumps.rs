//! Jumps, calls, returns and loops

use super::{cpu_with, phys, CODE_SEG, STACK_SEG};
use crate::cpu_8086::{FLAG_CF, FLAG_OF, FLAG_SF, FLAG_ZF};

#[test]
fn test_jmp_short_forward_and_back() {
    // JMP +2 ; (skipped 2 bytes) ; JMP -6
    let mut cpu = cpu_with(&[0xEB, 0x02, 0x90, 0x90, 0xEB, 0xFA]);
    cpu.step();
    assert_eq!(cpu.ip, 0x0104);
    cpu.step();
    assert_eq!(cpu.ip, 0x0100);
}

#[test]
fn test_jmp_near_wraps_within_segment() {
    let mut cpu = cpu_with(&[0xE9, 0x00, 0xFF]); // JMP -0x100
    cpu.step();
    assert_eq!(cpu.ip, 0x0003);
    assert_eq!(cpu.cs, CODE_SEG);
}

#[test]
fn test_jmp_far_direct() {
    let mut cpu = cpu_with(&[0xEA, 0x34, 0x12, 0x00, 0x50]);
    cpu.step();
    assert_eq!((cpu.cs, cpu.ip), (0x5000, 0x1234));
}

#[test]
fn test_conditional_jumps_follow_flags() {
    // (opcode, flags to set, expect taken)
    let cases: &[(u8, &[u16], bool)] = &[
        (0x74, &[FLAG_ZF], true),  // JZ
        (0x75, &[FLAG_ZF], false), // JNZ
        (0x72, &[FLAG_CF], true),  // JC
        (0x73, &[], true),         // JNC
        (0x76, &[FLAG_ZF], true),  // JBE
        (0x77, &[FLAG_CF], false), // JA
        (0x78, &[FLAG_SF], true),  // JS
        (0x70, &[FLAG_OF], true),  // JO
        (0x7C, &[FLAG_SF], true),  // JL: SF != OF
        (0x7C, &[FLAG_SF, FLAG_OF], false),
        (0x7D, &[FLAG_SF, FLAG_OF], true), // JGE
        (0x7E, &[FLAG_ZF], true),          // JLE
        (0x7F, &[], true),                 // JG
    ];
    for &(opcode, set, taken) in cases {
        let mut cpu = cpu_with(&[opcode, 0x10]);
        for &flag in set {
            cpu.set_flag(flag, true);
        }
        cpu.step();
        let expected = if taken { 0x0112 } else { 0x0102 };
        assert_eq!(cpu.ip, expected, "opcode {:02X}", opcode);
    }
}

#[test]
fn test_call_ret_near() {
    // CALL +3 ; HLT ; ... ; RET at 0x106
    let mut cpu = cpu_with(&[0xE8, 0x03, 0x00, 0xF4, 0x90, 0x90, 0xC3]);
    cpu.step();
    assert_eq!(cpu.ip, 0x0106);
    assert_eq!(cpu.bus.read_u16(phys(STACK_SEG, 0xFFFC)), 0x0103);
    cpu.step();
    assert_eq!(cpu.ip, 0x0103);
    assert_eq!(cpu.sp, 0xFFFE);
}

#[test]
fn test_ret_imm_releases_arguments() {
    let mut cpu = cpu_with(&[0xC2, 0x04, 0x00]); // RET 4
    cpu.sp = 0xFFF8;
    cpu.bus.write_u16(phys(STACK_SEG, 0xFFF8), 0x0200);
    cpu.step();
    assert_eq!(cpu.ip, 0x0200);
    assert_eq!(cpu.sp, 0xFFFE);
}

#[test]
fn test_call_far_and_retf() {
    // CALL 4000:0010
    let mut cpu = cpu_with(&[0x9A, 0x10, 0x00, 0x00, 0x40]);
    cpu.bus.write_u8(phys(0x4000, 0x0010), 0xCB); // RETF
    cpu.step();
    assert_eq!((cpu.cs, cpu.ip), (0x4000, 0x0010));
    assert_eq!(cpu.bus.read_u16(phys(STACK_SEG, 0xFFFC)), CODE_SEG);
    assert_eq!(cpu.bus.read_u16(phys(STACK_SEG, 0xFFFA)), 0x0105);
    cpu.step();
    assert_eq!((cpu.cs, cpu.ip), (CODE_SEG, 0x0105));
    assert_eq!(cpu.sp, 0xFFFE);
}

#[test]
fn test_call_indirect_register_and_memory() {
    // CALL BX ; at target: CALL [0x0040]
    let mut cpu = cpu_with(&[0xFF, 0xD3]);
    cpu.bx = 0x0200;
    cpu.bus
        .load_program(phys(CODE_SEG, 0x0200), &[0xFF, 0x16, 0x40, 0x00]);
    cpu.bus.write_u16(phys(0x3000, 0x0040), 0x0300);
    cpu.step();
    assert_eq!(cpu.ip, 0x0200);
    cpu.step();
    assert_eq!(cpu.ip, 0x0300);
    assert_eq!(cpu.bus.read_u16(phys(STACK_SEG, 0xFFFA)), 0x0204);
}

#[test]
fn test_jmp_far_indirect() {
    // JMP FAR [0x0050]
    let mut cpu = cpu_with(&[0xFF, 0x2E, 0x50, 0x00]);
    cpu.bus.write_u16(phys(0x3000, 0x0050), 0x0123);
    cpu.bus.write_u16(phys(0x3000, 0x0052), 0x6000);
    cpu.step();
    assert_eq!((cpu.cs, cpu.ip), (0x6000, 0x0123));
}

#[test]
fn test_loop_counts_down() {
    // INC AX ; LOOP -3
    let mut cpu = cpu_with(&[0x40, 0xE2, 0xFD]);
    cpu.cx = 3;
    for _ in 0..6 {
        cpu.step();
    }
    assert_eq!(cpu.ax, 3);
    assert_eq!(cpu.cx, 0);
    assert_eq!(cpu.ip, 0x0103);
}

#[test]
fn test_loope_loopne() {
    let mut cpu = cpu_with(&[0xE1, 0x10]); // LOOPE
    cpu.cx = 2;
    cpu.set_flag(FLAG_ZF, false);
    cpu.step();
    assert_eq!(cpu.ip, 0x0102, "ZF clear ends LOOPE");
    assert_eq!(cpu.cx, 1);

    let mut cpu = cpu_with(&[0xE0, 0x10]); // LOOPNE
    cpu.cx = 2;
    cpu.step();
    assert_eq!(cpu.ip, 0x0112);
}

#[test]
fn test_jcxz() {
    let mut cpu = cpu_with(&[0xE3, 0x05]);
    cpu.cx = 0;
    cpu.step();
    assert_eq!(cpu.ip, 0x0107);

    let mut cpu = cpu_with(&[0xE3, 0x05]);
    cpu.cx = 1;
    cpu.step();
    assert_eq!(cpu.ip, 0x0102);
    assert_eq!(cpu.cx, 1, "JCXZ does not decrement");
}

#[test]
fn test_call_trace_follows_calls() {
    let mut cpu = cpu_with(&[0xE8, 0x03, 0x00, 0xF4, 0x90, 0x90, 0xC3]);
    cpu.enable_call_trace(16);
    cpu.step();
    assert_eq!(cpu.call_trace().map(|t| t.depth()), Some(1));
    assert!(cpu.dump_state().contains("call stack"));
    cpu.step();
    assert_eq!(cpu.call_trace().map(|t| t.depth()), Some(0));
}
