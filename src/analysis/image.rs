//! Read-only view of the native image.
//!
//! The image is memory-mapped once per session and shared by every worker;
//! nothing ever writes through it.

use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Result, ScanError};

enum Storage {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

/// The compiled native module under analysis.
pub struct BinaryImage {
    path: Option<PathBuf>,
    // memmap cannot map empty files; those become an empty owned buffer.
    storage: Storage,
}

impl BinaryImage {
    /// Memory-map `path` read-only. Any failure is fatal to the session.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let missing = |source: std::io::Error| ScanError::MissingBaseImage {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(missing)?;
        let size = file.metadata().map_err(missing)?.len();

        let storage = if size == 0 {
            warn!(path = %path.display(), "native image is empty");
            Storage::Owned(Vec::new())
        } else {
            // Safety: read-only map of a regular file; the session never writes through it.
            Storage::Mapped(unsafe { Mmap::map(&file) }.map_err(missing)?)
        };
        debug!(path = %path.display(), size, "mapped native image");

        Ok(Self {
            path: Some(path.to_path_buf()),
            storage,
        })
    }

    /// Wrap bytes already in memory (tests, or images extracted elsewhere).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            path: None,
            storage: Storage::Owned(bytes),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Mapped(m) => &m[..],
            Storage::Owned(v) => &v[..],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    /// Up to `max_len` bytes starting at file offset `offset`, cut short at
    /// end of file. Offsets past the end yield an empty window.
    pub fn window(&self, offset: u64, max_len: usize) -> &[u8] {
        let data = self.bytes();
        let start = match usize::try_from(offset) {
            Ok(s) if s < data.len() => s,
            _ => return &[],
        };
        let end = start.saturating_add(max_len).min(data.len());
        &data[start..end]
    }
}

impl std::fmt::Debug for BinaryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryImage")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn open_maps_file() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&[0x90, 0x90, 0xC3]).unwrap();
        let img = BinaryImage::open(f.path()).unwrap();
        assert_eq!(img.len(), 3);
        assert_eq!(img.bytes(), &[0x90, 0x90, 0xC3]);
        assert_eq!(img.path(), Some(f.path()));
    }

    #[test]
    fn open_empty_file() {
        let f = NamedTempFile::new().unwrap();
        let img = BinaryImage::open(f.path()).unwrap();
        assert!(img.is_empty());
        assert!(img.window(0, 16).is_empty());
    }

    #[test]
    fn missing_file_is_missing_base_image() {
        let err = BinaryImage::open("/definitely/not/here.dll").unwrap_err();
        assert!(matches!(err, ScanError::MissingBaseImage { .. }));
    }

    #[test]
    fn window_is_bounded() {
        let img = BinaryImage::from_bytes((0u8..32).collect());
        assert_eq!(img.window(4, 4), &[4, 5, 6, 7]);
        assert_eq!(img.window(30, 16), &[30, 31]);
        assert!(img.window(32, 16).is_empty());
        assert!(img.window(u64::MAX, 16).is_empty());
    }
}
