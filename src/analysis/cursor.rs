//! InstructionCursor: a bounded linear decode over one byte window.
//!
//! The cursor yields instructions in address order and stops after a
//! return, a trap, an unconditional branch (unless configured otherwise),
//! the end of its window, or the first decode failure. It never reads a byte
//! outside the window it was given.

use crate::core::decoder::{DecodeError, InstructionDecoder};
use crate::core::instruction::{DecodedInstruction, FlowKind};

/// Linear instruction iterator over `window`, which starts at mapped
/// address `start`.
pub struct InstructionCursor<'a, D: InstructionDecoder + ?Sized> {
    decoder: &'a D,
    window: &'a [u8],
    start: u64,
    offset: usize,
    max_len: usize,
    stop_at_unconditional_branch: bool,
    done: bool,
}

impl<'a, D: InstructionDecoder + ?Sized> InstructionCursor<'a, D> {
    pub fn new(decoder: &'a D, window: &'a [u8], start: u64) -> Self {
        Self {
            decoder,
            window,
            start,
            offset: 0,
            max_len: decoder.max_instruction_length().max(1),
            stop_at_unconditional_branch: true,
            done: false,
        }
    }

    /// Keep decoding linearly past unconditional branches.
    pub fn follow_past_branches(mut self) -> Self {
        self.stop_at_unconditional_branch = false;
        self
    }

    pub fn stop_at_unconditional_branch(mut self, stop: bool) -> Self {
        self.stop_at_unconditional_branch = stop;
        self
    }

    /// Mapped address of the next instruction to decode.
    pub fn position(&self) -> u64 {
        self.start.wrapping_add(self.offset as u64)
    }

}

impl<'a, D: InstructionDecoder + ?Sized> Iterator for InstructionCursor<'a, D> {
    type Item = Result<DecodedInstruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.window.len() {
            self.done = true;
            return None;
        }

        // The decoder sees at most one instruction's worth of bytes.
        let end = self.window.len().min(self.offset + self.max_len);
        let ins = match self
            .decoder
            .decode(InstructionCursor::position(self), &self.window[self.offset..end])
        {
            Ok(ins) => ins,
            Err(e) => {
                self.done = true;
                return if e.is_end_of_input() { None } else { Some(Err(e)) };
            }
        };

        if ins.length == 0 {
            self.done = true;
            return Some(Err(DecodeError::InvalidInstruction {
                address: ins.address,
            }));
        }
        self.offset += ins.length as usize;

        let terminal = ins.flow.ends_stream()
            || (self.stop_at_unconditional_branch && ins.flow == FlowKind::UnconditionalBranch);
        if terminal {
            self.done = true;
        }
        Some(Ok(ins))
    }
}
