//! HLT, port IO, register snapshots and the device contract

use super::{cpu_with, phys, CODE_OFF};
use crate::cpu_8086::{Registers, CPU_FREQUENCY_MHZ, FLAGS_RESET};
use crate::{Cpu, Device, NEVER};

#[test]
fn test_mov_then_halt() {
    // MOV AX, 0x1234 ; MOV BX, AX ; HLT
    let mut cpu = cpu_with(&[0xB8, 0x34, 0x12, 0x89, 0xC3, 0xF4]);
    cpu.step();
    cpu.step();
    cpu.step();
    assert_eq!(cpu.ax, 0x1234);
    assert_eq!(cpu.bx, 0x1234);
    assert!(cpu.is_halted());
    assert_eq!(cpu.ip, CODE_OFF + 6);
}

#[test]
fn test_in_out_immediate_port() {
    // IN AL, 0x60 ; OUT 0x61, AL
    let mut cpu = cpu_with(&[0xE4, 0x60, 0xE6, 0x61]);
    cpu.bus.set_port(0x60, 0x1E);
    cpu.step();
    assert_eq!(cpu.ax & 0xFF, 0x1E);
    cpu.step();
    assert_eq!(cpu.bus.io_writes, vec![(0x61, 0x1E)]);
}

#[test]
fn test_in_out_dx_word() {
    // IN AX, DX ; OUT DX, AX
    let mut cpu = cpu_with(&[0xED, 0xEF]);
    cpu.dx = 0x3C8;
    cpu.bus.set_port(0x3C8, 0x34);
    cpu.bus.set_port(0x3C9, 0x12);
    cpu.step();
    assert_eq!(cpu.ax, 0x1234);
    cpu.step();
    assert_eq!(cpu.bus.io_writes, vec![(0x3C8, 0x34), (0x3C9, 0x12)]);
}

#[test]
fn test_lock_and_wait_are_harmless() {
    // LOCK INC AX ; WAIT
    let mut cpu = cpu_with(&[0xF0, 0x40, 0x9B]);
    cpu.step();
    assert_eq!(cpu.ax, 1);
    cpu.step();
    assert_eq!(cpu.ip, CODE_OFF + 3);
}

#[test]
fn test_esc_skips_memory_operand() {
    // ESC with [0x1234] ; NOP
    let mut cpu = cpu_with(&[0xD9, 0x06, 0x34, 0x12, 0x90]);
    cpu.step();
    assert_eq!(cpu.ip, CODE_OFF + 4);
}

#[test]
fn test_registers_snapshot_roundtrip() {
    let mut cpu = cpu_with(&[]);
    let regs = Registers {
        ax: 1,
        bx: 2,
        cx: 3,
        dx: 4,
        si: 5,
        di: 6,
        bp: 7,
        sp: 8,
        cs: 9,
        ds: 10,
        es: 11,
        ss: 12,
        ip: 13,
        flags: 0xF0C3,
    };
    cpu.set_registers(&regs);
    assert_eq!(cpu.registers(), regs);

    let json = serde_json::to_string(&regs).unwrap();
    let back: Registers = serde_json::from_str(&json).unwrap();
    assert_eq!(back, regs);
}

#[test]
fn test_reset_restores_power_on_state() {
    let mut cpu = cpu_with(&[0xF4]);
    cpu.step();
    cpu.raise_intr(8);
    Cpu::reset(&mut cpu);
    assert_eq!((cpu.cs, cpu.ip), (0xFFFF, 0x0000));
    assert_eq!(cpu.flags.bits(), FLAGS_RESET);
    assert!(!cpu.is_halted());
    assert!(!cpu.has_pending_interrupt());
    assert_eq!(cpu.cycles, 0);
}

#[test]
fn test_reset_keeps_memory() {
    let mut cpu = cpu_with(&[0x90]);
    cpu.reset();
    assert_eq!(cpu.bus.read_u8(phys(0x1000, 0x0100)), 0x90);
}

#[test]
fn test_device_contract() {
    let mut cpu = cpu_with(&[0x90; 64]);
    assert_eq!(cpu.frequency_in_mhz(), CPU_FREQUENCY_MHZ);
    assert_eq!(cpu.next_cycles(), NEVER);
    let used = cpu.run_cycles(30);
    assert!(used >= 30);
    assert!(cpu.ip > CODE_OFF);
}

#[test]
fn test_run_cycles_while_halted_burns_budget() {
    let mut cpu = cpu_with(&[0xF4]);
    cpu.step();
    assert_eq!(cpu.run_cycles(1000), 1000);
    assert!(cpu.is_halted());
}

#[test]
fn test_run_cycles_returns_early_on_trap() {
    // NOP ; trap 7 ; NOP...
    let mut program = vec![0x90, 0xFE, 0x38, 0x07, 0x00];
    program.extend([0x90; 32]);
    let mut cpu = cpu_with(&program);
    let used = cpu.run_cycles(10_000);
    assert!(used < 10_000);
    assert_eq!(cpu.take_trap(), Some(7));
    assert_eq!(cpu.ip, CODE_OFF + 5);
}

#[test]
fn test_pop_cs_is_executed() {
    let mut cpu = cpu_with(&[0x0F]);
    cpu.sp = 0xFFFC;
    cpu.bus.write_u16(phys(0x2000, 0xFFFC), 0x4000);
    cpu.step();
    assert_eq!(cpu.cs, 0x4000);
}
