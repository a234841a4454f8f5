//! Translation between file offsets, RVAs and mapped pointers.
//!
//! A session holds exactly one base fact: the mapped address of file offset
//! zero. RVAs are reached through the per-method delta between a method's
//! file offset and its RVA, which is constant within the section holding it.

use crate::core::address::{AddressKind, CodeAddress};
use crate::core::method::MethodNode;
use crate::error::{Result, ScanError};

/// Pure address arithmetic around one session base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressTranslator {
    base: u64,
}

impl AddressTranslator {
    pub fn new(base: u64) -> Self {
        Self { base }
    }

    /// The session base as a mapped address.
    pub fn base(&self) -> CodeAddress {
        CodeAddress::mapped(self.base)
    }

    /// `base + offset` for a file offset or RVA.
    pub fn to_mapped(&self, addr: CodeAddress) -> Result<CodeAddress> {
        match addr.kind {
            AddressKind::FileOffset | AddressKind::Rva => {
                Ok(CodeAddress::mapped(self.base.wrapping_add(addr.value)))
            }
            AddressKind::Mapped => Err(ScanError::InconsistentAddressSpace {
                expected: AddressKind::FileOffset,
                found: AddressKind::Mapped,
            }),
        }
    }

    /// `mapped - base`. Returns `None` when the pointer lies below the base.
    pub fn relative_to_base(&self, mapped: CodeAddress) -> Result<Option<u64>> {
        mapped.offset_from(&self.base())
    }

    /// Mapped address `m` such that `pointer - m` is an RVA for anything in
    /// the same section as `method`: `base + file_offset - rva`.
    pub fn method_base(&self, method: &MethodNode) -> CodeAddress {
        CodeAddress::mapped(
            self.base
                .wrapping_add(method.file_offset)
                .wrapping_sub(method.entry_rva),
        )
    }

    /// Mapped entry point of a method.
    pub fn method_entry(&self, method: &MethodNode) -> Result<CodeAddress> {
        self.to_mapped(method.offset())
    }

    /// RVA of a mapped pointer found while scanning `method`.
    pub fn mapped_to_rva(&self, mapped: CodeAddress, method: &MethodNode) -> Result<CodeAddress> {
        let m = mapped.expect_kind(AddressKind::Mapped)?;
        Ok(CodeAddress::rva(
            m.wrapping_sub(self.method_base(method).value),
        ))
    }

    /// Mapped pointer of an RVA in the same section as `method`.
    pub fn rva_to_mapped(&self, rva: CodeAddress, method: &MethodNode) -> Result<CodeAddress> {
        let r = rva.expect_kind(AddressKind::Rva)?;
        Ok(CodeAddress::mapped(
            r.wrapping_add(self.method_base(method).value),
        ))
    }
}
