//! Decoded instruction summary.
//!
//! Only the facts the xref engine needs survive decoding: byte length,
//! control-flow class, a statically encoded branch target, and any
//! instruction-pointer-relative memory operand.

use serde::{Deserialize, Serialize};

/// Control-flow class of a decoded instruction.
///
/// Conditional branches are reported as `Fallthrough` with a branch target:
/// the linear scan continues past them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowKind {
    Fallthrough,
    Return,
    UnconditionalBranch,
    Call,
    /// Interrupt, breakpoint, or undefined-instruction trap
    Trap,
}

impl FlowKind {
    /// Whether the linear instruction stream ends after this instruction.
    pub fn ends_stream(&self) -> bool {
        matches!(self, FlowKind::Return | FlowKind::Trap)
    }
}

/// Destination of a branch or call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchTarget {
    /// Absolute target encoded in the instruction (mapped-pointer space)
    Direct(u64),
    /// Register- or memory-derived target; never guessed
    Indirect,
}

impl BranchTarget {
    /// The static target, if any. A zero target is treated as absent.
    pub fn direct(&self) -> Option<u64> {
        match self {
            BranchTarget::Direct(t) if *t != 0 => Some(*t),
            _ => None,
        }
    }
}

/// How an IP-relative memory operand is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataAccess {
    /// `mov reg, [rip+disp]` / `ldr reg, =literal`
    Load,
    /// `mov [rip+disp], src`
    Store,
    /// `lea reg, [rip+disp]` / `adr`/`adrp`
    AddressOf,
}

/// An operand addressed relative to the current instruction pointer,
/// already resolved to an absolute mapped address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PcRelativeOperand {
    pub access: DataAccess,
    /// Resolved absolute address (mapped-pointer space)
    pub address: u64,
    /// Declared operand width in bytes (0 for address-of)
    pub width: u8,
    /// Destination register for loads and address-of, lowercase
    pub register: Option<String>,
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedInstruction {
    /// Mapped address of the first byte
    pub address: u64,
    /// Encoded length in bytes
    pub length: u16,
    /// Lowercase mnemonic, for diagnostics
    pub mnemonic: String,
    pub flow: FlowKind,
    /// Set for calls and branches (conditional or not)
    pub branch: Option<BranchTarget>,
    pub pc_relative: Option<PcRelativeOperand>,
}

impl DecodedInstruction {
    /// A plain fallthrough instruction with no interesting operands.
    pub fn simple(address: u64, length: u16, mnemonic: impl Into<String>) -> Self {
        Self {
            address,
            length,
            mnemonic: mnemonic.into(),
            flow: FlowKind::Fallthrough,
            branch: None,
            pc_relative: None,
        }
    }

    /// Address of the next instruction in linear order.
    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(self.length as u64)
    }

    /// Static target of a call or unconditional branch.
    pub fn direct_target(&self) -> Option<u64> {
        self.branch.and_then(|b| b.direct())
    }

    /// IP-relative load of exactly `width` bytes, if this is one.
    pub fn pc_relative_load(&self, width: u8) -> Option<&PcRelativeOperand> {
        self.pc_relative
            .as_ref()
            .filter(|op| op.access == DataAccess::Load && op.width == width)
    }
}
