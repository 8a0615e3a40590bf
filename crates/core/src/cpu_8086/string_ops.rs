//! MOVS, CMPS, STOS, LODS and SCAS.
//!
//! With a repeat prefix each `step` performs at most one iteration. While
//! the loop condition still holds, IP is rewound to the first prefix byte so
//! the next step re-decodes the same instruction; an interrupt taken in
//! between pushes that IP and the loop resumes after IRET.

use super::operand::{DecodeCtx, RepeatMode};
use super::{alu, Bus8086, Cpu8086, Width};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
}

impl StringOp {
    fn from_opcode(opcode: u8) -> Self {
        match opcode & 0xFE {
            0xA4 => StringOp::Movs,
            0xA6 => StringOp::Cmps,
            0xAA => StringOp::Stos,
            0xAC => StringOp::Lods,
            _ => StringOp::Scas,
        }
    }

    fn compares(self) -> bool {
        matches!(self, StringOp::Cmps | StringOp::Scas)
    }
}

impl<B: Bus8086> Cpu8086<B> {
    pub(super) fn string_instruction(&mut self, ctx: &DecodeCtx) -> u32 {
        let op = StringOp::from_opcode(ctx.opcode);
        let width = Width::from_w_bit(ctx.opcode);
        let repeated = ctx.rep != RepeatMode::None;

        if repeated {
            if self.cx == 0 {
                return 9;
            }
            self.cx = self.cx.wrapping_sub(1);
        }

        let cycles = self.string_iteration(op, width, ctx);

        if repeated && self.cx != 0 {
            let again = !op.compares()
                || match ctx.rep {
                    RepeatMode::Rep => self.flags.zf,
                    RepeatMode::Repne => !self.flags.zf,
                    RepeatMode::None => false,
                };
            if again {
                self.ip = ctx.start_ip;
            }
        }

        cycles
    }

    fn string_iteration(&mut self, op: StringOp, width: Width, ctx: &DecodeCtx) -> u32 {
        let delta = if self.flags.df {
            width.size().wrapping_neg()
        } else {
            width.size()
        };
        // ES:DI can never be overridden; DS:SI can
        let src_seg = self.data_segment(ctx);

        match op {
            StringOp::Movs => {
                let val = self.read_mem(src_seg, self.si, width);
                self.write_mem(self.es, self.di, width, val);
                self.si = self.si.wrapping_add(delta);
                self.di = self.di.wrapping_add(delta);
                18
            }
            StringOp::Cmps => {
                let a = self.read_mem(src_seg, self.si, width);
                let b = self.read_mem(self.es, self.di, width);
                alu::sub(a, b, false, width, &mut self.flags);
                self.si = self.si.wrapping_add(delta);
                self.di = self.di.wrapping_add(delta);
                22
            }
            StringOp::Stos => {
                let val = self.read_reg(0, width);
                self.write_mem(self.es, self.di, width, val);
                self.di = self.di.wrapping_add(delta);
                11
            }
            StringOp::Lods => {
                let val = self.read_mem(src_seg, self.si, width);
                self.write_reg(0, width, val);
                self.si = self.si.wrapping_add(delta);
                12
            }
            StringOp::Scas => {
                let a = self.read_reg(0, width);
                let b = self.read_mem(self.es, self.di, width);
                alu::sub(a, b, false, width, &mut self.flags);
                self.di = self.di.wrapping_add(delta);
                15
            }
        }
    }
}
