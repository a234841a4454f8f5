//! Address types tagged with their coordinate space.
//!
//! A binary location can be expressed three ways during a scan: as an offset
//! into the file, as an RVA relative to the module's load base, or as a
//! pointer into the mapped view the decoder reads from. Arithmetic is only
//! meaningful within one space; crossing spaces goes through
//! [`crate::analysis::translate::AddressTranslator`].

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

use crate::error::{Result, ScanError};

/// The coordinate space an address lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum AddressKind {
    /// Offset within the file on disk
    FileOffset,
    /// Relative Virtual Address (offset from the module load base)
    Rva,
    /// Pointer into the mapped view of the image for the current session
    Mapped,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressKind::FileOffset => write!(f, "FO"),
            AddressKind::Rva => write!(f, "RVA"),
            AddressKind::Mapped => write!(f, "PTR"),
        }
    }
}

/// A 64-bit code or data location tagged with its [`AddressKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeAddress {
    pub kind: AddressKind,
    pub value: u64,
}

impl CodeAddress {
    pub const fn new(kind: AddressKind, value: u64) -> Self {
        Self { kind, value }
    }

    pub const fn file_offset(value: u64) -> Self {
        Self::new(AddressKind::FileOffset, value)
    }

    pub const fn rva(value: u64) -> Self {
        Self::new(AddressKind::Rva, value)
    }

    pub const fn mapped(value: u64) -> Self {
        Self::new(AddressKind::Mapped, value)
    }

    /// Zero means "no native body" for method entries.
    pub fn is_null(&self) -> bool {
        self.value == 0
    }

    /// Unwrap the raw value, checking the coordinate space. A mismatch is a
    /// programming error and is logged as such.
    pub fn expect_kind(&self, kind: AddressKind) -> Result<u64> {
        if self.kind != kind {
            error!(expected = ?kind, found = ?self.kind, value = self.value, "address space mismatch");
            return Err(ScanError::InconsistentAddressSpace {
                expected: kind,
                found: self.kind,
            });
        }
        Ok(self.value)
    }

    /// Add a byte offset, staying in the same space.
    pub fn add(&self, offset: u64) -> Option<Self> {
        self.value
            .checked_add(offset)
            .map(|value| Self::new(self.kind, value))
    }

    /// Distance from `origin` to `self`. Both must share a space and
    /// `origin` must not lie above `self`.
    pub fn offset_from(&self, origin: &CodeAddress) -> Result<Option<u64>> {
        if self.kind != origin.kind {
            return Err(ScanError::InconsistentAddressSpace {
                expected: origin.kind,
                found: self.kind,
            });
        }
        Ok(self.value.checked_sub(origin.value))
    }
}

impl fmt::Display for CodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.kind, self.value)
    }
}
