//! Metadata-registration correlation.
//!
//! Ahead-of-time compiled methods that touch runtime metadata start with a
//! guard: load a 32-bit metadata token from a global into the first argument
//! register, call the registration routine, then set a one-byte "initialised"
//! flag. Finding those two globals ties a method to its metadata token.

use serde::{Deserialize, Serialize};

use crate::analysis::cursor::InstructionCursor;
use crate::core::decoder::{Architecture, InstructionDecoder};
use crate::core::instruction::{DataAccess, DecodedInstruction, FlowKind};

/// Register that carries the first 32-bit argument.
fn token_register(arch: Architecture) -> &'static str {
    match arch {
        Architecture::X86_64 => "ecx",
        Architecture::Arm64 => "w0",
    }
}

fn calls(ins: &DecodedInstruction, target: u64) -> bool {
    ins.flow == FlowKind::Call && ins.direct_target() == Some(target)
}

/// Address of the last IP-relative 32-bit load into the first argument
/// register before a direct call to `call_target`.
///
/// Returns `None` when the call is never reached. Unconditional jumps do not
/// end the search; returns, traps and malformed bytes do.
pub fn find_last_ecx_read_before_call<D: InstructionDecoder + ?Sized>(
    decoder: &D,
    window: &[u8],
    start: u64,
    call_target: u64,
) -> Option<u64> {
    let register = token_register(decoder.architecture());
    let mut last_read = None;

    for ins in InstructionCursor::new(decoder, window, start).follow_past_branches() {
        let ins = ins.ok()?;
        if calls(&ins, call_target) {
            return last_read;
        }
        if let Some(op) = ins.pc_relative_load(4) {
            if op.register.as_deref() == Some(register) {
                last_read = Some(op.address);
            }
        }
    }
    None
}

/// Address of the first IP-relative byte store after a direct call to
/// `call_target`.
pub fn find_byte_write_after_call<D: InstructionDecoder + ?Sized>(
    decoder: &D,
    window: &[u8],
    start: u64,
    call_target: u64,
) -> Option<u64> {
    let mut seen_call = false;

    for ins in InstructionCursor::new(decoder, window, start).follow_past_branches() {
        let ins = ins.ok()?;
        if calls(&ins, call_target) {
            seen_call = true;
            continue;
        }
        if !seen_call {
            continue;
        }
        if let Some(op) = &ins.pc_relative {
            if op.access == DataAccess::Store && op.width == 1 {
                return Some(op.address);
            }
        }
    }
    None
}

/// Metadata globals of one method, as RVAs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataInitRefs {
    /// Global holding the metadata token.
    pub token_rva: Option<u64>,
    /// One-byte flag set once the metadata is registered.
    pub flag_rva: Option<u64>,
}

impl MetadataInitRefs {
    /// Scan one method window. `init_routine` and the window start are mapped
    /// addresses; `to_rva` maps results back.
    pub fn find<D, F>(
        decoder: &D,
        window: &[u8],
        start: u64,
        init_routine: u64,
        to_rva: F,
    ) -> Self
    where
        D: InstructionDecoder + ?Sized,
        F: Fn(u64) -> u64,
    {
        Self {
            token_rva: find_last_ecx_read_before_call(decoder, window, start, init_routine)
                .map(&to_rva),
            flag_rva: find_byte_write_after_call(decoder, window, start, init_routine).map(&to_rva),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.token_rva.is_none() && self.flag_rva.is_none()
    }
}
