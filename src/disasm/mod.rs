//! Instruction decoder back-ends and registry.
//!
//! - iced-x86 for x86-64
//! - capstone for ARM64

pub mod capstone;
pub mod iced;
pub mod registry;

pub use registry::{for_arch, Backend};
