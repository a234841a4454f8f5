//! MemoryView: bounded reads in mapped-pointer space.
//!
//! The class-identity filter dereferences pointers found in code; those
//! reads go through this trait so they are bounds-checked against the image
//! rather than touching arbitrary memory.

use crate::analysis::image::BinaryImage;
use crate::analysis::translate::AddressTranslator;
use crate::core::address::{AddressKind, CodeAddress};

/// Errors that can occur during memory reads.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("unsupported address kind: {0:?}")]
    Unsupported(AddressKind),
    #[error("address out of range: {0}")]
    OutOfRange(String),
}

/// Bounded little-endian reads by mapped address.
pub trait MemoryView {
    /// Borrow `len` bytes starting at `addr`.
    fn read_bytes(&self, addr: CodeAddress, len: usize) -> Result<&[u8], MemoryError>;

    fn read_u64(&self, addr: CodeAddress) -> Result<u64, MemoryError> {
        let b = self.read_bytes(addr, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a pointer-sized value stored at mapped address `addr`.
    fn read_pointer(&self, addr: u64) -> Result<u64, MemoryError> {
        self.read_u64(CodeAddress::mapped(addr))
    }
}

/// The session image viewed at the session base.
pub struct ImageMemory<'a> {
    image: &'a BinaryImage,
    translator: AddressTranslator,
}

impl<'a> ImageMemory<'a> {
    pub fn new(image: &'a BinaryImage, translator: AddressTranslator) -> Self {
        Self { image, translator }
    }
}

impl<'a> MemoryView for ImageMemory<'a> {
    fn read_bytes(&self, addr: CodeAddress, len: usize) -> Result<&[u8], MemoryError> {
        if addr.kind != AddressKind::Mapped {
            return Err(MemoryError::Unsupported(addr.kind));
        }
        let offset = self
            .translator
            .relative_to_base(addr)
            .ok()
            .flatten()
            .ok_or_else(|| MemoryError::OutOfRange(format!("{addr} below image base")))?;
        let window = self.image.window(offset, len);
        if window.len() != len {
            return Err(MemoryError::OutOfRange(format!(
                "{addr} (len={len}) not within image of {:#x} bytes",
                self.image.len()
            )));
        }
        Ok(window)
    }
}
