//! Instruction decoder capability and decode errors.
//!
//! The xref extractor is written once against [`InstructionDecoder`]; the
//! concrete back-end (iced-x86 or capstone) is chosen when a session is
//! constructed, see [`crate::disasm::registry`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core::instruction::DecodedInstruction;

/// Errors that can occur while decoding a single instruction.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DecodeError {
    /// Malformed byte sequence at `address`
    #[error("invalid instruction at {address:#x}")]
    InvalidInstruction { address: u64 },
    /// The byte source ran out before a complete instruction
    #[error("insufficient bytes")]
    InsufficientBytes,
    /// The back-end cannot decode this architecture
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(Architecture),
    /// Internal back-end failure with message
    #[error("decoder backend error: {0}")]
    Backend(String),
}

impl DecodeError {
    /// Running out of bytes ends a stream; it is not a malformed method.
    pub fn is_end_of_input(&self) -> bool {
        matches!(self, DecodeError::InsufficientBytes)
    }
}

/// Result type for decoding operations
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Instruction set families the engine can scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Architecture {
    /// x86-64
    #[default]
    X86_64,
    /// ARM64/AArch64
    Arm64,
}

impl Architecture {
    /// Width of a pointer on this architecture, in bytes.
    pub fn pointer_size(&self) -> u8 {
        match self {
            Architecture::X86_64 | Architecture::Arm64 => 8,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::Arm64 => write!(f, "arm64"),
        }
    }
}

/// Decodes one instruction at a time from a byte slice.
pub trait InstructionDecoder {
    /// Decode the instruction whose first byte is `bytes[0]`, located at
    /// mapped address `address`. Implementations must not read past `bytes`.
    fn decode(&self, address: u64, bytes: &[u8]) -> DecodeResult<DecodedInstruction>;

    /// Maximum encoded instruction length for this architecture in bytes
    fn max_instruction_length(&self) -> usize;

    /// Architecture this decoder supports
    fn architecture(&self) -> Architecture;

    /// Human-readable back-end name
    fn name(&self) -> &str {
        "generic decoder"
    }
}
