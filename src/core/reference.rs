//! Cross-reference records.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::{AddressKind, CodeAddress};
use crate::error::Result;

/// What an xref points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XrefKind {
    /// Call or jump target: a control edge between methods
    Method,
    /// Address-taking load of a class-identity-bearing global
    Global,
}

/// "Instruction at `found_at` references `target`." Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XrefRecord {
    pub kind: XrefKind,
    pub target: CodeAddress,
    pub found_at: CodeAddress,
}

impl XrefRecord {
    pub fn new(kind: XrefKind, target: CodeAddress, found_at: CodeAddress) -> Self {
        Self {
            kind,
            target,
            found_at,
        }
    }

    pub fn method(target: CodeAddress, found_at: CodeAddress) -> Self {
        Self::new(XrefKind::Method, target, found_at)
    }

    pub fn global(target: CodeAddress, found_at: CodeAddress) -> Self {
        Self::new(XrefKind::Global, target, found_at)
    }

    /// Re-express a mapped-space record as RVAs by subtracting `base`
    /// (itself a mapped address) from both ends.
    pub fn relative_to_base(&self, base: CodeAddress) -> Result<Self> {
        let base = base.expect_kind(AddressKind::Mapped)?;
        let target = self.target.expect_kind(AddressKind::Mapped)?;
        let found_at = self.found_at.expect_kind(AddressKind::Mapped)?;
        Ok(Self {
            kind: self.kind,
            target: CodeAddress::rva(target.wrapping_sub(base)),
            found_at: CodeAddress::rva(found_at.wrapping_sub(base)),
        })
    }
}

impl fmt::Display for XrefRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} -> {}", self.kind, self.found_at, self.target)
    }
}
