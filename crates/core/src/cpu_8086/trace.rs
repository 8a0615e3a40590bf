//! Optional call-stack trace used for crash dumps.

use std::collections::VecDeque;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrame {
    /// Physical address of the CALL/INT instruction's successor
    pub from: u32,
    /// Physical address of the target
    pub to: u32,
    pub is_interrupt: bool,
}

/// Shadow stack of CALL/INT frames, popped by RET/IRET.
///
/// Bounded: once `max_depth` frames are held the oldest are discarded, so a
/// program that never returns (or longjmps around) cannot grow it forever.
#[derive(Debug, Clone)]
pub struct CallTrace {
    frames: VecDeque<CallFrame>,
    max_depth: usize,
}

impl Default for CallTrace {
    fn default() -> Self {
        Self::new(256)
    }
}

impl CallTrace {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(max_depth.min(256)),
            max_depth: max_depth.max(1),
        }
    }

    pub fn push(&mut self, frame: CallFrame) {
        if self.frames.len() == self.max_depth {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// RET: drop the innermost near/far call frame.
    pub fn pop_call(&mut self) -> Option<CallFrame> {
        match self.frames.back() {
            Some(f) if !f.is_interrupt => self.frames.pop_back(),
            _ => None,
        }
    }

    /// IRET: unwind to and including the innermost interrupt frame.
    pub fn pop_interrupt(&mut self) -> Option<CallFrame> {
        while let Some(frame) = self.frames.pop_back() {
            if frame.is_interrupt {
                return Some(frame);
            }
        }
        None
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> impl Iterator<Item = &CallFrame> {
        self.frames.iter()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Innermost frame first.
    pub fn format(&self) -> String {
        let mut out = String::new();
        for (depth, frame) in self.frames.iter().rev().enumerate() {
            let _ = writeln!(
                out,
                "#{:<3} {:05X} -> {:05X}{}",
                depth,
                frame.from,
                frame.to,
                if frame.is_interrupt { " (int)" } else { "" }
            );
        }
        out
    }
}
