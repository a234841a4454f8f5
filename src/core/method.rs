//! Method descriptors supplied by the metadata collaborator.
//!
//! The engine never decides which methods exist; it receives [`MethodNode`]s
//! from a [`MethodSource`] and treats them as read-only input.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::CodeAddress;
use crate::error::{Result, ScanError};

/// Stable identity of a method across runs (e.g. `Assembly::Namespace.Type::Name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodKey(pub String);

impl MethodKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One compiled method as described by the metadata collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodNode {
    pub key: MethodKey,
    /// Declared name, for diagnostics
    pub name: String,
    /// Entry point relative to the module load base
    pub entry_rva: u64,
    /// Entry point as a file offset; zero means no native body
    pub file_offset: u64,
    pub is_obfuscated_name: bool,
    pub is_virtual: bool,
}

impl MethodNode {
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        entry_rva: u64,
        file_offset: u64,
    ) -> Self {
        Self {
            key: MethodKey::new(key),
            name: name.into(),
            entry_rva,
            file_offset,
            is_obfuscated_name: false,
            is_virtual: false,
        }
    }

    pub fn obfuscated(mut self, yes: bool) -> Self {
        self.is_obfuscated_name = yes;
        self
    }

    pub fn virtual_method(mut self, yes: bool) -> Self {
        self.is_virtual = yes;
        self
    }

    /// Methods without a native body (abstract, elided) have no file offset.
    pub fn has_body(&self) -> bool {
        self.file_offset != 0
    }

    pub fn rva(&self) -> CodeAddress {
        CodeAddress::rva(self.entry_rva)
    }

    pub fn offset(&self) -> CodeAddress {
        CodeAddress::file_offset(self.file_offset)
    }

    /// Presumed alive without graph evidence: it has a body and either its
    /// name looks meaningful or it can be reached through virtual dispatch.
    pub fn is_seed(&self) -> bool {
        self.has_body() && (!self.is_obfuscated_name || self.is_virtual)
    }
}

/// Enumerates methods for a scan pass.
pub trait MethodSource {
    /// Every method of every type of every assembly under analysis.
    fn methods(&self) -> Vec<MethodNode>;
}

impl MethodSource for Vec<MethodNode> {
    fn methods(&self) -> Vec<MethodNode> {
        self.clone()
    }
}

impl MethodSource for [MethodNode] {
    fn methods(&self) -> Vec<MethodNode> {
        self.to_vec()
    }
}

/// Characters a compiler-emitted managed name is made of. Any other
/// character marks the name as obfuscated; position does not matter.
static PLAIN_IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_`.<>]*$").expect("static identifier regex")
});

/// Naming policy used by metadata readers to flag obfuscated names.
#[derive(Debug, Clone, Default)]
pub struct ObfuscationPolicy {
    pattern: Option<Regex>,
}

impl ObfuscationPolicy {
    /// Use `pattern` instead of the identifier heuristic: names matching it
    /// are obfuscated.
    pub fn with_pattern(pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern)
            .map_err(|e| ScanError::Config(format!("obfuscated name regex: {e}")))?;
        Ok(Self { pattern: Some(re) })
    }

    pub fn is_obfuscated(&self, name: &str) -> bool {
        match &self.pattern {
            Some(re) => re.is_match(name),
            None => !PLAIN_IDENTIFIER.is_match(name),
        }
    }
}
