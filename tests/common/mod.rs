//! Common test utilities and helpers.
//!
//! Integration tests synthesise small x86-64 images by hand instead of
//! relying on sample binaries: code is placed at chosen file offsets and the
//! rest of the image is filled with `int3`.

#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use xrefscan::{BinaryImage, MethodNode};

/// Mapped base used throughout the integration tests.
pub const BASE: u64 = 0x1_8000_0000;

/// Byte image under construction.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    bytes: Vec<u8>,
}

impl ImageBuilder {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0xCC; len],
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Copy raw bytes to `offset`.
    pub fn put(&mut self, offset: usize, code: &[u8]) -> &mut Self {
        self.bytes[offset..offset + code.len()].copy_from_slice(code);
        self
    }

    pub fn put_u64(&mut self, offset: usize, value: u64) -> &mut Self {
        self.put(offset, &value.to_le_bytes())
    }

    /// `call rel32` at `at` targeting file offset `to`; returns the next offset.
    pub fn call(&mut self, at: usize, to: usize) -> usize {
        self.put(at, &call_rel32(at as u64, to as u64));
        at + 5
    }

    /// `jmp rel32` at `at` targeting `to`; returns the next offset.
    pub fn jmp(&mut self, at: usize, to: usize) -> usize {
        let rel = (to as i64 - (at as i64 + 5)) as i32;
        self.put(at, &[0xE9]);
        self.put(at + 1, &rel.to_le_bytes());
        at + 5
    }

    /// `mov rax, qword [rip+disp]` at `at` loading from `from`; returns the next offset.
    pub fn load_qword(&mut self, at: usize, from: usize) -> usize {
        let rel = (from as i64 - (at as i64 + 7)) as i32;
        self.put(at, &[0x48, 0x8B, 0x05]);
        self.put(at + 3, &rel.to_le_bytes());
        at + 7
    }

    pub fn ret(&mut self, at: usize) -> usize {
        self.put(at, &[0xC3]);
        at + 1
    }

    pub fn nops(&mut self, at: usize, n: usize) -> usize {
        for i in 0..n {
            self.bytes[at + i] = 0x90;
        }
        at + n
    }

    pub fn build(&self) -> BinaryImage {
        BinaryImage::from_bytes(self.bytes.clone())
    }

    /// Write the image to a temporary file; keep the handle alive while in use.
    pub fn to_file(&self) -> NamedTempFile {
        let mut f = NamedTempFile::new().expect("create temp image");
        f.write_all(&self.bytes).expect("write temp image");
        f.flush().expect("flush temp image");
        f
    }
}

/// Encoded `call rel32` placed at `from`.
pub fn call_rel32(from: u64, to: u64) -> [u8; 5] {
    let rel = (to as i64 - (from as i64 + 5)) as i32;
    let mut b = [0xE8, 0, 0, 0, 0];
    b[1..].copy_from_slice(&rel.to_le_bytes());
    b
}

/// Method whose RVA equals its file offset.
pub fn method(key: &str, offset: u64) -> MethodNode {
    MethodNode::new(key, key, offset, offset)
}

/// Method with an obfuscated name.
pub fn obfuscated(key: &str, offset: u64) -> MethodNode {
    MethodNode::new(key, "\u{1}\u{2}", offset, offset).obfuscated(true)
}

/// The three-method chain A -> B -> C at 0x100/0x200/0x300.
pub fn chain_image() -> ImageBuilder {
    let mut img = ImageBuilder::new(0x400);
    let next = img.call(0x100, 0x200);
    img.ret(next);
    let next = img.call(0x200, 0x300);
    img.ret(next);
    img.ret(0x300);
    img
}

pub fn temp_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let path = dir.path().join(name);
    (dir, path)
}
