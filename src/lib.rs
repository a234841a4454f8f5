//! Method-level call graph recovery and dead-code classification for
//! ahead-of-time compiled managed binaries.
//!
//! The engine decodes each method body linearly, records direct call and
//! jump targets plus class-bearing global loads, merges them into a
//! [`CallGraph`], and marks everything reachable from the seed methods.
//! Dead candidates are hints: anything reached only through indirect calls
//! is invisible to the graph.

/// Core data types module
pub mod core;

pub mod analysis;
pub mod cancel;
pub mod disasm;
pub mod error;
pub mod logging;

pub use crate::analysis::{
    run_pass, BinaryImage, ClassSentinels, LiveSet, Liveness, ScanConfig, ScanOutcome,
    ScanSession,
};
pub use crate::cancel::CancelToken;
pub use crate::core::{
    AddressKind, Architecture, CallGraph, CallSite, CodeAddress, DecodeError, MethodKey,
    MethodNode, MethodSource, XrefKind, XrefRecord,
};
pub use crate::error::{Result, ScanError};
