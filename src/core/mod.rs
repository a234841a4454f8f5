//! Core data types for the xref engine.
//!
//! These are plain values shared by the decoder back-ends, the extractor and
//! the graph: tagged addresses, decoded instruction summaries, xref records,
//! method descriptors and the call graph itself.

pub mod address;
pub mod call_graph;
pub mod decoder;
pub mod instruction;
pub mod method;
pub mod reference;

pub use address::{AddressKind, CodeAddress};
pub use call_graph::{CallGraph, CallSite};
pub use decoder::{Architecture, DecodeError, InstructionDecoder};
pub use instruction::{BranchTarget, DataAccess, DecodedInstruction, FlowKind, PcRelativeOperand};
pub use method::{MethodKey, MethodNode, MethodSource, ObfuscationPolicy};
pub use reference::{XrefKind, XrefRecord};
