//! Intel 8086 CPU core implementation
//!
//! A real-mode 8086 interpreter that talks to the outside world only through
//! the [`Bus8086`] trait. One call to [`Cpu8086::step`] services a pending
//! interrupt or executes exactly one instruction (including its prefixes).
//!
//! Repeated string instructions run one iteration per step and rewind IP to
//! their first prefix byte while iterations remain, so hardware interrupts
//! are taken between iterations and the instruction resumes after IRET.
//!
//! Host code hooks into guest control flow through the trap opcode
//! `FE 38 id_lo id_hi`: executing it records `id` (see [`Cpu8086::take_trap`])
//! and ends the current `run_cycles` slice so the owner can dispatch it.

mod alu;
pub mod flags;
pub mod operand;
mod string_ops;
pub mod trace;

#[cfg(test)]
mod tests;

pub use alu::AluOp;
pub use flags::{
    Flags, FLAGS_RESET, FLAG_AF, FLAG_CF, FLAG_DF, FLAG_IF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_TF,
    FLAG_ZF,
};
pub use operand::{DecodeCtx, ModRm, Operand, RepeatMode, SegReg};
pub use trace::{CallFrame, CallTrace};

use serde::{Deserialize, Serialize};

use crate::logging::{log, LogCategory, LogLevel};
use crate::{Cpu, Device, NEVER};

/// IBM 5150/5160 CPU clock.
pub const CPU_FREQUENCY_MHZ: f64 = 4.772727;

/// ModRM byte that, after `FE`, marks a host trap.
pub const TRAP_MODRM: u8 = 0x38;

/// Operand size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Width {
    Byte,
    Word,
}

impl Width {
    /// Bit 0 of most ALU/MOV opcodes selects word operands.
    #[inline]
    pub fn from_w_bit(opcode: u8) -> Self {
        if opcode & 1 == 0 {
            Width::Byte
        } else {
            Width::Word
        }
    }

    #[inline]
    pub fn mask(self) -> u16 {
        match self {
            Width::Byte => 0x00FF,
            Width::Word => 0xFFFF,
        }
    }

    #[inline]
    pub fn sign_bit(self) -> u16 {
        match self {
            Width::Byte => 0x0080,
            Width::Word => 0x8000,
        }
    }

    #[inline]
    pub fn size(self) -> u16 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    /// 20-bit physical memory addresses
    Memory,
    /// 16-bit port numbers
    Io,
}

/// Memory and IO interface for the 8086.
///
/// Word memory accesses are little-endian: the low byte lives at `addr`, the
/// high byte at `addr + 1`. Word IO accesses hit `port` then `port + 1`.
pub trait Bus8086 {
    fn read(&mut self, space: AddressSpace, addr: u32, width: Width) -> u16;
    fn write(&mut self, space: AddressSpace, addr: u32, width: Width, value: u16);
}

/// Serializable view of the register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Registers {
    pub ax: u16,
    pub bx: u16,
    pub cx: u16,
    pub dx: u16,
    pub si: u16,
    pub di: u16,
    pub bp: u16,
    pub sp: u16,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub ss: u16,
    pub ip: u16,
    pub flags: u16,
}

#[derive(Debug, Clone, Copy, Default)]
struct PendingInterrupts {
    nmi: bool,
    intr: bool,
    vector: u8,
    /// Suppresses delivery for the instruction following MOV/POP to a
    /// segment register, STI and IRET.
    delay: bool,
}

/// Intel 8086 CPU state and execution engine
#[derive(Debug)]
pub struct Cpu8086<B: Bus8086> {
    /// AX register (accumulator) - can be accessed as AH:AL
    pub ax: u16,
    /// BX register (base) - can be accessed as BH:BL
    pub bx: u16,
    /// CX register (count) - can be accessed as CH:CL
    pub cx: u16,
    /// DX register (data) - can be accessed as DH:DL
    pub dx: u16,
    pub si: u16,
    pub di: u16,
    pub bp: u16,
    pub sp: u16,

    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub ss: u16,

    pub ip: u16,
    pub flags: Flags,

    /// Total cycles executed. Only used to pace the device scheduler.
    pub cycles: u64,

    /// Memory and IO bus
    pub bus: B,

    halted: bool,
    pending: PendingInterrupts,
    trap: Option<u16>,
    trace: Option<CallTrace>,
    /// Panic on undefined opcodes instead of raising INT 6.
    strict: bool,
}

impl<B: Bus8086> Cpu8086<B> {
    pub fn new(bus: B) -> Self {
        Self {
            ax: 0,
            bx: 0,
            cx: 0,
            dx: 0,
            si: 0,
            di: 0,
            bp: 0,
            sp: 0,
            cs: 0xFFFF,
            ds: 0,
            es: 0,
            ss: 0,
            ip: 0,
            flags: Flags::from_bits(FLAGS_RESET),
            cycles: 0,
            bus,
            halted: false,
            pending: PendingInterrupts::default(),
            trap: None,
            trace: None,
            strict: false,
        }
    }

    /// Power-on register state. Memory, strict mode and tracing survive.
    pub fn reset(&mut self) {
        self.set_registers(&Registers {
            cs: 0xFFFF,
            flags: FLAGS_RESET,
            ..Registers::default()
        });
        self.cycles = 0;
        self.halted = false;
        self.pending = PendingInterrupts::default();
        self.trap = None;
        if let Some(trace) = self.trace.as_mut() {
            trace.clear();
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
    }

    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn enable_call_trace(&mut self, max_depth: usize) {
        self.trace = Some(CallTrace::new(max_depth));
    }

    pub fn disable_call_trace(&mut self) {
        self.trace = None;
    }

    pub fn call_trace(&self) -> Option<&CallTrace> {
        self.trace.as_ref()
    }

    pub fn get_flag(&self, flag: u16) -> bool {
        self.flags.get(flag)
    }

    pub fn set_flag(&mut self, flag: u16, value: bool) {
        self.flags.set(flag, value);
    }

    pub fn registers(&self) -> Registers {
        Registers {
            ax: self.ax,
            bx: self.bx,
            cx: self.cx,
            dx: self.dx,
            si: self.si,
            di: self.di,
            bp: self.bp,
            sp: self.sp,
            cs: self.cs,
            ds: self.ds,
            es: self.es,
            ss: self.ss,
            ip: self.ip,
            flags: self.flags.bits(),
        }
    }

    pub fn set_registers(&mut self, regs: &Registers) {
        self.ax = regs.ax;
        self.bx = regs.bx;
        self.cx = regs.cx;
        self.dx = regs.dx;
        self.si = regs.si;
        self.di = regs.di;
        self.bp = regs.bp;
        self.sp = regs.sp;
        self.cs = regs.cs;
        self.ds = regs.ds;
        self.es = regs.es;
        self.ss = regs.ss;
        self.ip = regs.ip;
        self.flags = Flags::from_bits(regs.flags);
    }

    /// Multi-line register dump for fault reports.
    pub fn dump_state(&self) -> String {
        let f = &self.flags;
        let mut out = format!(
            "AX={:04X} BX={:04X} CX={:04X} DX={:04X} SP={:04X} BP={:04X} SI={:04X} DI={:04X}\n\
             DS={:04X} ES={:04X} SS={:04X} CS={:04X} IP={:04X} FLAGS={:04X} [{}{}{}{}{}{}{}{}{}]",
            self.ax,
            self.bx,
            self.cx,
            self.dx,
            self.sp,
            self.bp,
            self.si,
            self.di,
            self.ds,
            self.es,
            self.ss,
            self.cs,
            self.ip,
            f.bits(),
            if f.of { 'O' } else { '-' },
            if f.df { 'D' } else { '-' },
            if f.if_ { 'I' } else { '-' },
            if f.tf { 'T' } else { '-' },
            if f.sf { 'S' } else { '-' },
            if f.zf { 'Z' } else { '-' },
            if f.af { 'A' } else { '-' },
            if f.pf { 'P' } else { '-' },
            if f.cf { 'C' } else { '-' },
        );
        if let Some(trace) = self.trace.as_ref().filter(|t| t.depth() > 0) {
            out.push_str("\ncall stack:\n");
            out.push_str(&trace.format());
        }
        out
    }

    // ---------------------------------------------------------------------
    // Interrupt lines

    pub fn raise_nmi(&mut self) {
        self.pending.nmi = true;
    }

    /// Latch a maskable interrupt request. Delivered at the next instruction
    /// boundary where IF=1 and no interrupt delay is in effect.
    pub fn raise_intr(&mut self, vector: u8) {
        self.pending.intr = true;
        self.pending.vector = vector;
    }

    pub fn has_pending_interrupt(&self) -> bool {
        self.pending.nmi || self.pending.intr
    }

    fn interrupt_deliverable(&self) -> bool {
        !self.pending.delay && (self.pending.nmi || (self.pending.intr && self.flags.if_))
    }

    /// Id of the trap opcode executed since the last call, if any.
    pub fn take_trap(&mut self) -> Option<u16> {
        self.trap.take()
    }

    pub fn has_trap(&self) -> bool {
        self.trap.is_some()
    }

    // ---------------------------------------------------------------------
    // Memory helpers

    #[inline]
    pub fn physical_address(segment: u16, offset: u16) -> u32 {
        (((segment as u32) << 4) + offset as u32) & 0xFFFFF
    }

    pub fn read_u8(&mut self, segment: u16, offset: u16) -> u8 {
        let addr = Self::physical_address(segment, offset);
        self.bus.read(AddressSpace::Memory, addr, Width::Byte) as u8
    }

    pub fn write_u8(&mut self, segment: u16, offset: u16, val: u8) {
        let addr = Self::physical_address(segment, offset);
        self.bus.write(AddressSpace::Memory, addr, Width::Byte, val as u16);
    }

    pub fn read_u16(&mut self, segment: u16, offset: u16) -> u16 {
        let addr = Self::physical_address(segment, offset);
        if addr & 1 != 0 {
            self.cycles += 4;
        }
        self.bus.read(AddressSpace::Memory, addr, Width::Word)
    }

    pub fn write_u16(&mut self, segment: u16, offset: u16, val: u16) {
        let addr = Self::physical_address(segment, offset);
        if addr & 1 != 0 {
            self.cycles += 4;
        }
        self.bus.write(AddressSpace::Memory, addr, Width::Word, val);
    }

    #[inline]
    fn read_mem(&mut self, segment: u16, offset: u16, width: Width) -> u16 {
        match width {
            Width::Byte => self.read_u8(segment, offset) as u16,
            Width::Word => self.read_u16(segment, offset),
        }
    }

    #[inline]
    fn write_mem(&mut self, segment: u16, offset: u16, width: Width, val: u16) {
        match width {
            Width::Byte => self.write_u8(segment, offset, val as u8),
            Width::Word => self.write_u16(segment, offset, val),
        }
    }

    #[inline]
    fn fetch_u8(&mut self) -> u8 {
        let val = self.read_u8(self.cs, self.ip);
        self.ip = self.ip.wrapping_add(1);
        val
    }

    #[inline]
    fn fetch_u16(&mut self) -> u16 {
        let lo = self.fetch_u8() as u16;
        let hi = self.fetch_u8() as u16;
        (hi << 8) | lo
    }

    #[inline]
    fn fetch_imm(&mut self, width: Width) -> u16 {
        match width {
            Width::Byte => self.fetch_u8() as u16,
            Width::Word => self.fetch_u16(),
        }
    }

    pub fn push(&mut self, val: u16) {
        self.sp = self.sp.wrapping_sub(2);
        self.write_u16(self.ss, self.sp, val);
    }

    pub fn pop(&mut self) -> u16 {
        let val = self.read_u16(self.ss, self.sp);
        self.sp = self.sp.wrapping_add(2);
        val
    }

    fn io_read(&mut self, port: u16, width: Width) -> u16 {
        self.bus.read(AddressSpace::Io, port as u32, width)
    }

    fn io_write(&mut self, port: u16, width: Width, val: u16) {
        self.bus.write(AddressSpace::Io, port as u32, width, val);
    }

    // ---------------------------------------------------------------------
    // Register file

    pub fn get_reg16(&self, index: u8) -> u16 {
        match index & 7 {
            0 => self.ax,
            1 => self.cx,
            2 => self.dx,
            3 => self.bx,
            4 => self.sp,
            5 => self.bp,
            6 => self.si,
            _ => self.di,
        }
    }

    pub fn set_reg16(&mut self, index: u8, val: u16) {
        match index & 7 {
            0 => self.ax = val,
            1 => self.cx = val,
            2 => self.dx = val,
            3 => self.bx = val,
            4 => self.sp = val,
            5 => self.bp = val,
            6 => self.si = val,
            _ => self.di = val,
        }
    }

    /// AL CL DL BL AH CH DH BH
    pub fn get_reg8(&self, index: u8) -> u8 {
        let word = self.get_reg16(index & 3);
        if index & 4 == 0 {
            word as u8
        } else {
            (word >> 8) as u8
        }
    }

    pub fn set_reg8(&mut self, index: u8, val: u8) {
        let word = self.get_reg16(index & 3);
        let word = if index & 4 == 0 {
            (word & 0xFF00) | val as u16
        } else {
            (word & 0x00FF) | ((val as u16) << 8)
        };
        self.set_reg16(index & 3, word);
    }

    #[inline]
    fn read_reg(&self, index: u8, width: Width) -> u16 {
        match width {
            Width::Byte => self.get_reg8(index) as u16,
            Width::Word => self.get_reg16(index),
        }
    }

    #[inline]
    fn write_reg(&mut self, index: u8, width: Width, val: u16) {
        match width {
            Width::Byte => self.set_reg8(index, val as u8),
            Width::Word => self.set_reg16(index, val),
        }
    }

    pub fn get_seg(&self, seg: SegReg) -> u16 {
        match seg {
            SegReg::ES => self.es,
            SegReg::CS => self.cs,
            SegReg::SS => self.ss,
            SegReg::DS => self.ds,
        }
    }

    pub fn set_seg(&mut self, seg: SegReg, val: u16) {
        match seg {
            SegReg::ES => self.es = val,
            SegReg::CS => self.cs = val,
            SegReg::SS => self.ss = val,
            SegReg::DS => self.ds = val,
        }
    }

    /// DS unless a segment override prefix is active.
    #[inline]
    fn data_segment(&self, ctx: &DecodeCtx) -> u16 {
        self.get_seg(ctx.seg_override.unwrap_or(SegReg::DS))
    }

    // ---------------------------------------------------------------------
    // ModRM decoding

    fn decode_modrm(&mut self, ctx: &mut DecodeCtx) -> ModRm {
        let modrm = ModRm::from_byte(self.fetch_u8());
        ctx.modrm = Some(modrm);
        modrm
    }

    /// Segment and offset of a memory ModRM operand. Fetches the
    /// displacement; BP-based forms default to SS.
    fn effective_address(&mut self, ctx: &DecodeCtx, modrm: ModRm) -> (u16, u16) {
        let (base, uses_bp, ea_cycles) = match modrm.rm {
            0b000 => (self.bx.wrapping_add(self.si), false, 7),
            0b001 => (self.bx.wrapping_add(self.di), false, 8),
            0b010 => (self.bp.wrapping_add(self.si), true, 8),
            0b011 => (self.bp.wrapping_add(self.di), true, 7),
            0b100 => (self.si, false, 5),
            0b101 => (self.di, false, 5),
            // mod=00 rm=110 is a direct address, not [BP]
            0b110 if modrm.mode == 0b00 => (0, false, 6),
            0b110 => (self.bp, true, 5),
            _ => (self.bx, false, 5),
        };

        let disp = match modrm.mode {
            0b00 if modrm.rm == 0b110 => self.fetch_u16(),
            0b00 => 0,
            0b01 => self.fetch_u8() as i8 as i16 as u16,
            _ => self.fetch_u16(),
        };
        self.cycles += ea_cycles + if modrm.mode == 0b00 { 0 } else { 4 };

        let default = if uses_bp { SegReg::SS } else { SegReg::DS };
        let segment = self.get_seg(ctx.seg_override.unwrap_or(default));
        (segment, base.wrapping_add(disp))
    }

    fn rm_operand(&mut self, ctx: &DecodeCtx, modrm: ModRm, width: Width) -> Operand {
        if modrm.is_register() {
            Operand::Register {
                index: modrm.rm,
                width,
            }
        } else {
            let (segment, offset) = self.effective_address(ctx, modrm);
            Operand::Memory {
                segment,
                offset,
                width,
            }
        }
    }

    fn read_operand(&mut self, op: Operand) -> u16 {
        match op {
            Operand::Register { index, width } => self.read_reg(index, width),
            Operand::Memory {
                segment,
                offset,
                width,
            } => self.read_mem(segment, offset, width),
        }
    }

    fn write_operand(&mut self, op: Operand, val: u16) {
        match op {
            Operand::Register { index, width } => self.write_reg(index, width, val),
            Operand::Memory {
                segment,
                offset,
                width,
            } => self.write_mem(segment, offset, width, val),
        }
    }

    /// offset:segment pair stored at a memory operand (LES, LDS, far CALL/JMP).
    fn read_far_pointer(&mut self, op: Operand) -> Option<(u16, u16)> {
        match op {
            Operand::Memory {
                segment, offset, ..
            } => {
                let off = self.read_u16(segment, offset);
                let seg = self.read_u16(segment, offset.wrapping_add(2));
                Some((off, seg))
            }
            Operand::Register { .. } => None,
        }
    }

    // ---------------------------------------------------------------------
    // Control transfer

    fn trace_call(&mut self, to_cs: u16, to_ip: u16, is_interrupt: bool) {
        if self.trace.is_some() {
            let frame = CallFrame {
                from: Self::physical_address(self.cs, self.ip),
                to: Self::physical_address(to_cs, to_ip),
                is_interrupt,
            };
            if let Some(trace) = self.trace.as_mut() {
                trace.push(frame);
            }
        }
    }

    /// Interrupt-call primitive shared by INT n, INT3, INTO, divide errors,
    /// NMI and INTR: push FLAGS, CS, IP; clear IF and TF; load CS:IP from
    /// the vector table at `4 * vector`.
    pub fn call_int(&mut self, vector: u8) {
        let slot = (vector as u16) * 4;
        let new_ip = self.read_u16(0, slot);
        let new_cs = self.read_u16(0, slot + 2);

        log(LogCategory::Interrupts, LogLevel::Trace, || {
            format!(
                "INT {:02X} from {:04X}:{:04X} -> {:04X}:{:04X}",
                vector, self.cs, self.ip, new_cs, new_ip
            )
        });

        self.trace_call(new_cs, new_ip, true);
        self.push(self.flags.bits());
        self.push(self.cs);
        self.push(self.ip);
        self.flags.if_ = false;
        self.flags.tf = false;
        self.cs = new_cs;
        self.ip = new_ip;
    }

    /// Pop IP, CS and FLAGS. Interrupts stay blocked for one more instruction.
    pub fn iret(&mut self) {
        self.ip = self.pop();
        self.cs = self.pop();
        let flags = self.pop();
        self.flags = Flags::from_bits(flags);
        self.pending.delay = true;
        if let Some(trace) = self.trace.as_mut() {
            trace.pop_interrupt();
        }
    }

    fn near_call(&mut self, target: u16) {
        self.trace_call(self.cs, target, false);
        self.push(self.ip);
        self.ip = target;
    }

    fn far_call(&mut self, segment: u16, offset: u16) {
        self.trace_call(segment, offset, false);
        self.push(self.cs);
        self.push(self.ip);
        self.cs = segment;
        self.ip = offset;
    }

    fn near_return(&mut self, release: u16) {
        self.ip = self.pop();
        self.sp = self.sp.wrapping_add(release);
        if let Some(trace) = self.trace.as_mut() {
            trace.pop_call();
        }
    }

    fn far_return(&mut self, release: u16) {
        self.ip = self.pop();
        self.cs = self.pop();
        self.sp = self.sp.wrapping_add(release);
        if let Some(trace) = self.trace.as_mut() {
            trace.pop_call();
        }
    }

    #[inline]
    fn jump_relative(&mut self, disp: u16) {
        self.ip = self.ip.wrapping_add(disp);
    }

    fn condition(&self, cc: u8) -> bool {
        let f = &self.flags;
        let taken = match cc >> 1 {
            0 => f.of,
            1 => f.cf,
            2 => f.zf,
            3 => f.cf || f.zf,
            4 => f.sf,
            5 => f.pf,
            6 => f.sf != f.of,
            _ => f.zf || (f.sf != f.of),
        };
        // odd condition codes are the negation of the even one below them
        taken != (cc & 1 != 0)
    }

    fn undefined_opcode(&mut self, ctx: &DecodeCtx) -> u32 {
        let describe = || {
            let modrm = ctx
                .modrm
                .map(|m| format!(" /{}", m.reg))
                .unwrap_or_default();
            format!(
                "undefined opcode {:02X}{} at {:04X}:{:04X}",
                ctx.opcode, modrm, self.cs, ctx.start_ip
            )
        };

        if self.strict {
            let msg = describe();
            log(LogCategory::CPU, LogLevel::Error, || {
                format!("{}\n{}", msg, self.dump_state())
            });
            panic!("{}", msg);
        }

        log(LogCategory::CPU, LogLevel::Warn, describe);
        self.ip = ctx.start_ip;
        self.call_int(6);
        51
    }

    // ---------------------------------------------------------------------
    // Execution

    /// Service a pending interrupt or execute one instruction. Returns the
    /// cycle estimate for what was done.
    pub fn step(&mut self) -> u32 {
        let start_cycles = self.cycles;

        if !self.pending.delay {
            if self.pending.nmi {
                self.pending.nmi = false;
                self.halted = false;
                self.call_int(2);
                self.cycles += 50;
                return (self.cycles - start_cycles) as u32;
            }
            if self.pending.intr && self.flags.if_ {
                self.pending.intr = false;
                self.halted = false;
                self.call_int(self.pending.vector);
                self.cycles += 61;
                return (self.cycles - start_cycles) as u32;
            }
        }
        self.pending.delay = false;

        if self.halted {
            self.cycles += 2;
            return 2;
        }

        let single_step = self.flags.tf;
        let mut ctx = DecodeCtx::new(self.ip);
        let mut prefix_cycles = 0;
        let opcode = loop {
            let byte = self.fetch_u8();
            match byte {
                0x26 => ctx.seg_override = Some(SegReg::ES),
                0x2E => ctx.seg_override = Some(SegReg::CS),
                0x36 => ctx.seg_override = Some(SegReg::SS),
                0x3E => ctx.seg_override = Some(SegReg::DS),
                0xF0 => ctx.lock = true,
                0xF2 => ctx.rep = RepeatMode::Repne,
                0xF3 => ctx.rep = RepeatMode::Rep,
                _ => break byte,
            }
            prefix_cycles += 2;
        };
        ctx.opcode = opcode;

        log(LogCategory::CPU, LogLevel::Trace, || {
            format!("{:04X}:{:04X} {:02X}", self.cs, ctx.start_ip, opcode)
        });

        let cycles = self.execute(&mut ctx) + prefix_cycles;
        self.cycles += cycles as u64;

        if single_step && !self.has_trap() {
            self.call_int(1);
        }

        (self.cycles - start_cycles) as u32
    }

    fn execute(&mut self, ctx: &mut DecodeCtx) -> u32 {
        let opcode = ctx.opcode;
        match opcode {
            // ADD OR ADC SBB AND SUB XOR CMP in their six encodings each
            op if op < 0x40 && op & 7 < 6 => self.exec_alu(ctx),

            // PUSH ES/CS/SS/DS
            0x06 | 0x0E | 0x16 | 0x1E => {
                let val = self.get_seg(SegReg::from_index(opcode >> 3));
                self.push(val);
                10
            }
            // POP ES/CS/SS/DS (POP CS is legal on the 8086)
            0x07 | 0x0F | 0x17 | 0x1F => {
                let val = self.pop();
                self.set_seg(SegReg::from_index(opcode >> 3), val);
                self.pending.delay = true;
                8
            }

            // DAA
            0x27 => {
                self.decimal_adjust(false);
                4
            }
            // DAS
            0x2F => {
                self.decimal_adjust(true);
                4
            }
            // AAA
            0x37 => {
                self.ascii_adjust(false);
                8
            }
            // AAS
            0x3F => {
                self.ascii_adjust(true);
                8
            }

            // INC r16
            0x40..=0x47 => {
                let idx = opcode & 7;
                let val = alu::inc(self.get_reg16(idx), Width::Word, &mut self.flags);
                self.set_reg16(idx, val);
                3
            }
            // DEC r16
            0x48..=0x4F => {
                let idx = opcode & 7;
                let val = alu::dec(self.get_reg16(idx), Width::Word, &mut self.flags);
                self.set_reg16(idx, val);
                3
            }
            // PUSH r16 (PUSH SP stores the decremented SP)
            0x50..=0x57 => {
                let idx = opcode & 7;
                let val = if idx == 4 {
                    self.sp.wrapping_sub(2)
                } else {
                    self.get_reg16(idx)
                };
                self.push(val);
                11
            }
            // POP r16
            0x58..=0x5F => {
                let val = self.pop();
                self.set_reg16(opcode & 7, val);
                8
            }

            // Jcc rel8
            0x70..=0x7F => {
                let disp = self.fetch_u8() as i8 as u16;
                if self.condition(opcode & 0x0F) {
                    self.jump_relative(disp);
                    16
                } else {
                    4
                }
            }

            // Group 1: ALU r/m, imm
            0x80..=0x83 => self.exec_group1(ctx),

            // TEST r/m, reg
            0x84 | 0x85 => {
                let width = Width::from_w_bit(opcode);
                let modrm = self.decode_modrm(ctx);
                let rm = self.rm_operand(ctx, modrm, width);
                let a = self.read_operand(rm);
                let b = self.read_reg(modrm.reg, width);
                alu::logic(a & b, width, &mut self.flags);
                if rm.is_memory() {
                    9
                } else {
                    3
                }
            }
            // XCHG r/m, reg
            0x86 | 0x87 => {
                let width = Width::from_w_bit(opcode);
                let modrm = self.decode_modrm(ctx);
                let rm = self.rm_operand(ctx, modrm, width);
                let a = self.read_operand(rm);
                let b = self.read_reg(modrm.reg, width);
                self.write_operand(rm, b);
                self.write_reg(modrm.reg, width, a);
                if rm.is_memory() {
                    17
                } else {
                    4
                }
            }
            // MOV r/m, reg / MOV reg, r/m
            0x88..=0x8B => {
                let width = Width::from_w_bit(opcode);
                let modrm = self.decode_modrm(ctx);
                let rm = self.rm_operand(ctx, modrm, width);
                if opcode & 2 == 0 {
                    let val = self.read_reg(modrm.reg, width);
                    self.write_operand(rm, val);
                } else {
                    let val = self.read_operand(rm);
                    self.write_reg(modrm.reg, width, val);
                }
                if rm.is_memory() {
                    9
                } else {
                    2
                }
            }
            // MOV r/m16, sreg
            0x8C => {
                let modrm = self.decode_modrm(ctx);
                let rm = self.rm_operand(ctx, modrm, Width::Word);
                let val = self.get_seg(SegReg::from_index(modrm.reg));
                self.write_operand(rm, val);
                if rm.is_memory() {
                    9
                } else {
                    2
                }
            }
            // LEA reg16, m
            0x8D => {
                let modrm = self.decode_modrm(ctx);
                if modrm.is_register() {
                    return self.undefined_opcode(ctx);
                }
                let (_, offset) = self.effective_address(ctx, modrm);
                self.set_reg16(modrm.reg, offset);
                2
            }
            // MOV sreg, r/m16
            0x8E => {
                let modrm = self.decode_modrm(ctx);
                let rm = self.rm_operand(ctx, modrm, Width::Word);
                let val = self.read_operand(rm);
                self.set_seg(SegReg::from_index(modrm.reg), val);
                self.pending.delay = true;
                if rm.is_memory() {
                    8
                } else {
                    2
                }
            }
            // POP r/m16
            0x8F => {
                let modrm = self.decode_modrm(ctx);
                let rm = self.rm_operand(ctx, modrm, Width::Word);
                let val = self.pop();
                self.write_operand(rm, val);
                17
            }

            // XCHG AX, r16 (90 is NOP)
            0x90..=0x97 => {
                let idx = opcode & 7;
                let val = self.get_reg16(idx);
                self.set_reg16(idx, self.ax);
                self.ax = val;
                3
            }
            // CBW
            0x98 => {
                self.ax = self.ax as u8 as i8 as i16 as u16;
                2
            }
            // CWD
            0x99 => {
                self.dx = if self.ax & 0x8000 != 0 { 0xFFFF } else { 0 };
                5
            }
            // CALL far ptr16:16
            0x9A => {
                let offset = self.fetch_u16();
                let segment = self.fetch_u16();
                self.far_call(segment, offset);
                28
            }
            // WAIT
            0x9B => 4,
            // PUSHF
            0x9C => {
                self.push(self.flags.bits());
                10
            }
            // POPF
            0x9D => {
                let val = self.pop();
                self.flags = Flags::from_bits(val);
                8
            }
            // SAHF
            0x9E => {
                let ah = (self.ax >> 8) as u8;
                self.flags.set_low_byte(ah);
                4
            }
            // LAHF
            0x9F => {
                let low = self.flags.low_byte();
                self.set_reg8(4, low);
                4
            }

            // MOV AL/AX, [moffs]
            0xA0 | 0xA1 => {
                let width = Width::from_w_bit(opcode);
                let offset = self.fetch_u16();
                let segment = self.data_segment(ctx);
                let val = self.read_mem(segment, offset, width);
                self.write_reg(0, width, val);
                10
            }
            // MOV [moffs], AL/AX
            0xA2 | 0xA3 => {
                let width = Width::from_w_bit(opcode);
                let offset = self.fetch_u16();
                let segment = self.data_segment(ctx);
                let val = self.read_reg(0, width);
                self.write_mem(segment, offset, width, val);
                10
            }
            // MOVS CMPS STOS LODS SCAS
            0xA4..=0xA7 | 0xAA..=0xAF => self.string_instruction(ctx),
            // TEST AL/AX, imm
            0xA8 | 0xA9 => {
                let width = Width::from_w_bit(opcode);
                let imm = self.fetch_imm(width);
                let a = self.read_reg(0, width);
                alu::logic(a & imm, width, &mut self.flags);
                4
            }

            // MOV r8, imm8
            0xB0..=0xB7 => {
                let imm = self.fetch_u8();
                self.set_reg8(opcode & 7, imm);
                4
            }
            // MOV r16, imm16
            0xB8..=0xBF => {
                let imm = self.fetch_u16();
                self.set_reg16(opcode & 7, imm);
                4
            }

            // RET imm16
            0xC2 => {
                let release = self.fetch_u16();
                self.near_return(release);
                20
            }
            // RET
            0xC3 => {
                self.near_return(0);
                16
            }
            // LES / LDS reg16, m16:16
            0xC4 | 0xC5 => {
                let modrm = self.decode_modrm(ctx);
                let rm = self.rm_operand(ctx, modrm, Width::Word);
                let Some((offset, segment)) = self.read_far_pointer(rm) else {
                    return self.undefined_opcode(ctx);
                };
                self.set_reg16(modrm.reg, offset);
                if opcode == 0xC4 {
                    self.es = segment;
                } else {
                    self.ds = segment;
                }
                16
            }
            // MOV r/m, imm
            0xC6 | 0xC7 => {
                let width = Width::from_w_bit(opcode);
                let modrm = self.decode_modrm(ctx);
                let rm = self.rm_operand(ctx, modrm, width);
                let imm = self.fetch_imm(width);
                self.write_operand(rm, imm);
                if rm.is_memory() {
                    10
                } else {
                    4
                }
            }
            // RETF imm16
            0xCA => {
                let release = self.fetch_u16();
                self.far_return(release);
                25
            }
            // RETF
            0xCB => {
                self.far_return(0);
                26
            }
            // INT3
            0xCC => {
                self.call_int(3);
                52
            }
            // INT imm8
            0xCD => {
                let vector = self.fetch_u8();
                self.call_int(vector);
                51
            }
            // INTO
            0xCE => {
                if self.flags.of {
                    self.call_int(4);
                    53
                } else {
                    4
                }
            }
            // IRET
            0xCF => {
                self.iret();
                32
            }

            // Group 2: shifts and rotates
            0xD0..=0xD3 => self.exec_group2(ctx),
            // AAM imm8
            0xD4 => {
                let base = self.fetch_u8();
                if base == 0 {
                    self.call_int(0);
                    return 83;
                }
                let al = self.ax as u8;
                self.ax = (((al / base) as u16) << 8) | (al % base) as u16;
                self.flags.set_szp(self.ax, Width::Byte);
                83
            }
            // AAD imm8
            0xD5 => {
                let base = self.fetch_u8();
                let al = self.ax as u8;
                let ah = (self.ax >> 8) as u8;
                let al = al.wrapping_add(ah.wrapping_mul(base));
                self.ax = al as u16;
                self.flags.set_szp(self.ax, Width::Byte);
                60
            }
            // XLAT
            0xD7 => {
                let segment = self.data_segment(ctx);
                let offset = self.bx.wrapping_add(self.ax & 0xFF);
                let val = self.read_u8(segment, offset);
                self.set_reg8(0, val);
                11
            }
            // ESC: coprocessor escape, operand is decoded and ignored
            0xD8..=0xDF => {
                let modrm = self.decode_modrm(ctx);
                if !modrm.is_register() {
                    self.effective_address(ctx, modrm);
                }
                2
            }

            // LOOPNE / LOOPE / LOOP
            0xE0..=0xE2 => {
                let disp = self.fetch_u8() as i8 as u16;
                self.cx = self.cx.wrapping_sub(1);
                let taken = self.cx != 0
                    && match opcode {
                        0xE0 => !self.flags.zf,
                        0xE1 => self.flags.zf,
                        _ => true,
                    };
                if taken {
                    self.jump_relative(disp);
                    18
                } else {
                    6
                }
            }
            // JCXZ
            0xE3 => {
                let disp = self.fetch_u8() as i8 as u16;
                if self.cx == 0 {
                    self.jump_relative(disp);
                    18
                } else {
                    6
                }
            }
            // IN AL/AX, imm8
            0xE4 | 0xE5 => {
                let width = Width::from_w_bit(opcode);
                let port = self.fetch_u8() as u16;
                let val = self.io_read(port, width);
                self.write_reg(0, width, val);
                10
            }
            // OUT imm8, AL/AX
            0xE6 | 0xE7 => {
                let width = Width::from_w_bit(opcode);
                let port = self.fetch_u8() as u16;
                let val = self.read_reg(0, width);
                self.io_write(port, width, val);
                10
            }
            // CALL rel16
            0xE8 => {
                let disp = self.fetch_u16();
                let target = self.ip.wrapping_add(disp);
                self.near_call(target);
                19
            }
            // JMP rel16
            0xE9 => {
                let disp = self.fetch_u16();
                self.jump_relative(disp);
                15
            }
            // JMP far ptr16:16
            0xEA => {
                let offset = self.fetch_u16();
                let segment = self.fetch_u16();
                self.cs = segment;
                self.ip = offset;
                15
            }
            // JMP rel8
            0xEB => {
                let disp = self.fetch_u8() as i8 as u16;
                self.jump_relative(disp);
                15
            }
            // IN AL/AX, DX
            0xEC | 0xED => {
                let width = Width::from_w_bit(opcode);
                let val = self.io_read(self.dx, width);
                self.write_reg(0, width, val);
                8
            }
            // OUT DX, AL/AX
            0xEE | 0xEF => {
                let width = Width::from_w_bit(opcode);
                let val = self.read_reg(0, width);
                self.io_write(self.dx, width, val);
                8
            }

            // HLT
            0xF4 => {
                self.halted = true;
                2
            }
            // CMC
            0xF5 => {
                self.flags.cf = !self.flags.cf;
                2
            }
            // Group 3: TEST NOT NEG MUL IMUL DIV IDIV
            0xF6 | 0xF7 => self.exec_group3(ctx),
            // CLC STC CLI STI CLD STD
            0xF8 => {
                self.flags.cf = false;
                2
            }
            0xF9 => {
                self.flags.cf = true;
                2
            }
            0xFA => {
                self.flags.if_ = false;
                2
            }
            0xFB => {
                self.flags.if_ = true;
                self.pending.delay = true;
                2
            }
            0xFC => {
                self.flags.df = false;
                2
            }
            0xFD => {
                self.flags.df = true;
                2
            }
            // Group 4: INC/DEC r/m8, host trap
            0xFE => self.exec_group4(ctx),
            // Group 5: INC DEC CALL CALLF JMP JMPF PUSH
            0xFF => self.exec_group5(ctx),

            // 60-6F, C0, C1, C8, C9, D6, F1
            _ => self.undefined_opcode(ctx),
        }
    }

    fn exec_alu(&mut self, ctx: &mut DecodeCtx) -> u32 {
        let op = AluOp::from_index(ctx.opcode >> 3);
        let width = Width::from_w_bit(ctx.opcode);

        if ctx.opcode & 4 != 0 {
            // AL/AX, imm
            let imm = self.fetch_imm(width);
            let a = self.read_reg(0, width);
            let res = alu::binary(op, a, imm, width, &mut self.flags);
            if op.writes_result() {
                self.write_reg(0, width, res);
            }
            return 4;
        }

        let modrm = self.decode_modrm(ctx);
        let rm = self.rm_operand(ctx, modrm, width);
        let reg = Operand::Register {
            index: modrm.reg,
            width,
        };
        let (dst, src) = if ctx.opcode & 2 == 0 {
            (rm, reg)
        } else {
            (reg, rm)
        };

        let a = self.read_operand(dst);
        let b = self.read_operand(src);
        let res = alu::binary(op, a, b, width, &mut self.flags);
        if op.writes_result() {
            self.write_operand(dst, res);
        }

        match (dst.is_memory(), src.is_memory()) {
            (true, _) if op.writes_result() => 16,
            (true, _) | (_, true) => 9,
            _ => 3,
        }
    }

    fn exec_group1(&mut self, ctx: &mut DecodeCtx) -> u32 {
        let width = Width::from_w_bit(ctx.opcode);
        let modrm = self.decode_modrm(ctx);
        let dst = self.rm_operand(ctx, modrm, width);
        let imm = match ctx.opcode {
            0x81 => self.fetch_u16(),
            0x83 => self.fetch_u8() as i8 as u16,
            _ => self.fetch_u8() as u16,
        };

        let op = AluOp::from_index(modrm.reg);
        let a = self.read_operand(dst);
        let res = alu::binary(op, a, imm, width, &mut self.flags);
        if op.writes_result() {
            self.write_operand(dst, res);
        }

        match (dst.is_memory(), op.writes_result()) {
            (true, true) => 17,
            (true, false) => 10,
            _ => 4,
        }
    }

    fn exec_group2(&mut self, ctx: &mut DecodeCtx) -> u32 {
        let width = Width::from_w_bit(ctx.opcode);
        let modrm = self.decode_modrm(ctx);
        let dst = self.rm_operand(ctx, modrm, width);
        let count = if ctx.opcode & 2 == 0 { 1 } else { self.cx as u8 };

        let val = self.read_operand(dst);
        let res = alu::shift(modrm.reg, val, count, width, &mut self.flags);
        self.write_operand(dst, res);

        let base = match (dst.is_memory(), ctx.opcode & 2 != 0) {
            (false, false) => 2,
            (true, false) => 15,
            (false, true) => 8,
            (true, true) => 20,
        };
        base + if ctx.opcode & 2 != 0 { 4 * count as u32 } else { 0 }
    }

    fn exec_group3(&mut self, ctx: &mut DecodeCtx) -> u32 {
        let width = Width::from_w_bit(ctx.opcode);
        let modrm = self.decode_modrm(ctx);
        let rm = self.rm_operand(ctx, modrm, width);
        let mem_cycles = if rm.is_memory() { 6 } else { 0 };

        match modrm.reg {
            // TEST r/m, imm (/1 is an alias)
            0 | 1 => {
                let imm = self.fetch_imm(width);
                let a = self.read_operand(rm);
                alu::logic(a & imm, width, &mut self.flags);
                5 + mem_cycles
            }
            // NOT
            2 => {
                let a = self.read_operand(rm);
                self.write_operand(rm, !a & width.mask());
                3 + mem_cycles * 2
            }
            // NEG
            3 => {
                let a = self.read_operand(rm);
                let res = alu::neg(a, width, &mut self.flags);
                self.write_operand(rm, res);
                3 + mem_cycles * 2
            }
            // MUL
            4 => {
                let src = self.read_operand(rm);
                match width {
                    Width::Byte => {
                        self.ax = (self.ax & 0xFF) * src;
                        let high = self.ax & 0xFF00 != 0;
                        self.flags.cf = high;
                        self.flags.of = high;
                        self.flags.zf = self.ax == 0;
                        70 + mem_cycles
                    }
                    Width::Word => {
                        let product = self.ax as u32 * src as u32;
                        self.ax = product as u16;
                        self.dx = (product >> 16) as u16;
                        self.flags.cf = self.dx != 0;
                        self.flags.of = self.dx != 0;
                        self.flags.zf = self.ax == 0;
                        118 + mem_cycles
                    }
                }
            }
            // IMUL
            5 => {
                let src = self.read_operand(rm);
                match width {
                    Width::Byte => {
                        let product = (self.ax as u8 as i8 as i16) * (src as u8 as i8 as i16);
                        self.ax = product as u16;
                        let overflow = product != product as i8 as i16;
                        self.flags.cf = overflow;
                        self.flags.of = overflow;
                        80 + mem_cycles
                    }
                    Width::Word => {
                        let product = (self.ax as i16 as i32) * (src as i16 as i32);
                        self.ax = product as u16;
                        self.dx = (product >> 16) as u16;
                        let overflow = product != product as i16 as i32;
                        self.flags.cf = overflow;
                        self.flags.of = overflow;
                        128 + mem_cycles
                    }
                }
            }
            // DIV
            6 => {
                let src = self.read_operand(rm);
                if !self.divide(src, width, false) {
                    self.call_int(0);
                }
                match width {
                    Width::Byte => 80 + mem_cycles,
                    Width::Word => 144 + mem_cycles,
                }
            }
            // IDIV
            _ => {
                let src = self.read_operand(rm);
                if !self.divide(src, width, true) {
                    self.call_int(0);
                }
                match width {
                    Width::Byte => 101 + mem_cycles,
                    Width::Word => 165 + mem_cycles,
                }
            }
        }
    }

    /// DIV/IDIV core. Returns false (leaving registers untouched) on a zero
    /// divisor or a quotient that does not fit the destination.
    fn divide(&mut self, divisor: u16, width: Width, signed: bool) -> bool {
        if divisor & width.mask() == 0 {
            return false;
        }
        match (width, signed) {
            (Width::Byte, false) => {
                let dividend = self.ax as u32;
                let quotient = dividend / divisor as u32;
                if quotient > 0xFF {
                    return false;
                }
                let remainder = dividend % divisor as u32;
                self.ax = ((remainder as u16) << 8) | quotient as u16;
            }
            (Width::Word, false) => {
                let dividend = ((self.dx as u32) << 16) | self.ax as u32;
                let quotient = dividend / divisor as u32;
                if quotient > 0xFFFF {
                    return false;
                }
                self.ax = quotient as u16;
                self.dx = (dividend % divisor as u32) as u16;
            }
            (Width::Byte, true) => {
                let dividend = self.ax as i16 as i32;
                let divisor = divisor as u8 as i8 as i32;
                let quotient = dividend / divisor;
                if !(i8::MIN as i32..=i8::MAX as i32).contains(&quotient) {
                    return false;
                }
                let remainder = dividend % divisor;
                self.ax = ((remainder as u8 as u16) << 8) | quotient as u8 as u16;
            }
            (Width::Word, true) => {
                let dividend = ((((self.dx as u32) << 16) | self.ax as u32) as i32) as i64;
                let divisor = divisor as i16 as i64;
                let quotient = dividend / divisor;
                if !(i16::MIN as i64..=i16::MAX as i64).contains(&quotient) {
                    return false;
                }
                self.ax = quotient as u16;
                self.dx = (dividend % divisor) as u16;
            }
        }
        true
    }

    fn exec_group4(&mut self, ctx: &mut DecodeCtx) -> u32 {
        let modrm = self.decode_modrm(ctx);
        match modrm.reg {
            0 | 1 => {
                let rm = self.rm_operand(ctx, modrm, Width::Byte);
                let val = self.read_operand(rm);
                let res = if modrm.reg == 0 {
                    alu::inc(val, Width::Byte, &mut self.flags)
                } else {
                    alu::dec(val, Width::Byte, &mut self.flags)
                };
                self.write_operand(rm, res);
                if rm.is_memory() {
                    15
                } else {
                    3
                }
            }
            7 if modrm.mode == 0 && modrm.rm == 0 => {
                let id = self.fetch_u16();
                log(LogCategory::CPU, LogLevel::Trace, || {
                    format!("trap {:04X} at {:04X}:{:04X}", id, self.cs, ctx.start_ip)
                });
                self.trap = Some(id);
                2
            }
            _ => self.undefined_opcode(ctx),
        }
    }

    fn exec_group5(&mut self, ctx: &mut DecodeCtx) -> u32 {
        let modrm = self.decode_modrm(ctx);
        if modrm.reg == 7 {
            return self.undefined_opcode(ctx);
        }
        let rm = self.rm_operand(ctx, modrm, Width::Word);

        match modrm.reg {
            0 | 1 => {
                let val = self.read_operand(rm);
                let res = if modrm.reg == 0 {
                    alu::inc(val, Width::Word, &mut self.flags)
                } else {
                    alu::dec(val, Width::Word, &mut self.flags)
                };
                self.write_operand(rm, res);
                if rm.is_memory() {
                    15
                } else {
                    3
                }
            }
            // CALL near r/m16
            2 => {
                let target = self.read_operand(rm);
                self.near_call(target);
                21
            }
            // CALL far m16:16
            3 => match self.read_far_pointer(rm) {
                Some((offset, segment)) => {
                    self.far_call(segment, offset);
                    37
                }
                None => self.undefined_opcode(ctx),
            },
            // JMP near r/m16
            4 => {
                self.ip = self.read_operand(rm);
                11
            }
            // JMP far m16:16
            5 => match self.read_far_pointer(rm) {
                Some((offset, segment)) => {
                    self.cs = segment;
                    self.ip = offset;
                    24
                }
                None => self.undefined_opcode(ctx),
            },
            // PUSH r/m16
            _ => {
                let val = match rm {
                    Operand::Register { index: 4, .. } => self.sp.wrapping_sub(2),
                    _ => self.read_operand(rm),
                };
                self.push(val);
                16
            }
        }
    }

    /// DAA/DAS.
    fn decimal_adjust(&mut self, subtract: bool) {
        let old_al = self.ax as u8;
        let old_cf = self.flags.cf;
        let mut al = old_al;

        if old_al & 0x0F > 9 || self.flags.af {
            al = if subtract {
                al.wrapping_sub(6)
            } else {
                al.wrapping_add(6)
            };
            self.flags.af = true;
        } else {
            self.flags.af = false;
        }

        // compared against the value before the low-nibble adjust
        if old_al > 0x99 || old_cf {
            al = if subtract {
                al.wrapping_sub(0x60)
            } else {
                al.wrapping_add(0x60)
            };
            self.flags.cf = true;
        } else {
            self.flags.cf = false;
        }

        self.set_reg8(0, al);
        self.flags.set_szp(al as u16, Width::Byte);
    }

    /// AAA/AAS.
    fn ascii_adjust(&mut self, subtract: bool) {
        if self.ax & 0x0F > 9 || self.flags.af {
            if subtract {
                let al = (self.ax as u8).wrapping_sub(6);
                let ah = ((self.ax >> 8) as u8).wrapping_sub(1);
                self.ax = ((ah as u16) << 8) | al as u16;
            } else {
                self.ax = self.ax.wrapping_add(0x106);
            }
            self.flags.af = true;
            self.flags.cf = true;
        } else {
            self.flags.af = false;
            self.flags.cf = false;
        }
        self.ax &= 0xFF0F;
    }
}

impl<B: Bus8086> Cpu for Cpu8086<B> {
    fn reset(&mut self) {
        Cpu8086::reset(self);
    }

    fn step(&mut self) -> u32 {
        Cpu8086::step(self)
    }
}

impl<B: Bus8086> Device for Cpu8086<B> {
    fn frequency_in_mhz(&self) -> f64 {
        CPU_FREQUENCY_MHZ
    }

    /// The CPU never schedules its own events.
    fn next_cycles(&mut self) -> u64 {
        NEVER
    }

    /// Step until `cycles` are used up. Returns early after a trap so the
    /// owner can run the host callback before the next instruction.
    fn run_cycles(&mut self, cycles: u64) -> u64 {
        let start = self.cycles;
        while self.cycles - start < cycles {
            if self.halted && !self.interrupt_deliverable() {
                self.cycles = start + cycles;
                break;
            }
            self.step();
            if self.trap.is_some() {
                break;
            }
        }
        self.cycles - start
    }
}

/// Flat 1 MiB bus with a port latch array, for tests and benchmarks.
pub struct ArrayBus {
    data: Vec<u8>,
    ports: Vec<u8>,
    /// Every `(port, value)` byte written to IO space, in order
    pub io_writes: Vec<(u16, u8)>,
}

impl ArrayBus {
    pub fn new() -> Self {
        Self {
            data: vec![0; 0x100000],
            ports: vec![0; 0x10000],
            io_writes: Vec::new(),
        }
    }

    /// Load a program at a specific physical address
    pub fn load_program(&mut self, addr: u32, program: &[u8]) {
        for (i, byte) in program.iter().enumerate() {
            self.data[(addr as usize + i) & 0xFFFFF] = *byte;
        }
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        self.data[(addr & 0xFFFFF) as usize]
    }

    pub fn write_u8(&mut self, addr: u32, val: u8) {
        self.data[(addr & 0xFFFFF) as usize] = val;
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        (self.read_u8(addr + 1) as u16) << 8 | self.read_u8(addr) as u16
    }

    pub fn write_u16(&mut self, addr: u32, val: u16) {
        self.write_u8(addr, val as u8);
        self.write_u8(addr + 1, (val >> 8) as u8);
    }

    /// Value returned by IN from `port`.
    pub fn set_port(&mut self, port: u16, val: u8) {
        self.ports[port as usize] = val;
    }

    pub fn memory(&self) -> &[u8] {
        &self.data
    }
}

impl Default for ArrayBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus8086 for ArrayBus {
    fn read(&mut self, space: AddressSpace, addr: u32, width: Width) -> u16 {
        match (space, width) {
            (AddressSpace::Memory, Width::Byte) => self.read_u8(addr) as u16,
            (AddressSpace::Memory, Width::Word) => ArrayBus::read_u16(self, addr),
            (AddressSpace::Io, Width::Byte) => self.ports[(addr & 0xFFFF) as usize] as u16,
            (AddressSpace::Io, Width::Word) => {
                let lo = self.ports[(addr & 0xFFFF) as usize] as u16;
                let hi = self.ports[((addr + 1) & 0xFFFF) as usize] as u16;
                (hi << 8) | lo
            }
        }
    }

    fn write(&mut self, space: AddressSpace, addr: u32, width: Width, value: u16) {
        match (space, width) {
            (AddressSpace::Memory, Width::Byte) => self.write_u8(addr, value as u8),
            (AddressSpace::Memory, Width::Word) => ArrayBus::write_u16(self, addr, value),
            (AddressSpace::Io, _) => {
                let port = (addr & 0xFFFF) as u16;
                self.io_writes.push((port, value as u8));
                if width == Width::Word {
                    self.io_writes.push((port.wrapping_add(1), (value >> 8) as u8));
                }
            }
        }
    }
}
