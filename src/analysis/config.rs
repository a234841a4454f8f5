//! Configuration for scan sessions.
//!
//! Every field has a default, so partial JSON documents are accepted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::decoder::Architecture;
use crate::core::method::ObfuscationPolicy;
use crate::disasm::registry::BackendKind;
use crate::error::{Result, ScanError};

/// Default mapped base: the usual preferred load address of a 64-bit PE image.
pub const DEFAULT_BASE_ADDRESS: u64 = 0x1_8000_0000;

/// Default per-method byte window.
pub const DEFAULT_WINDOW_LEN: usize = 0x1000;

/// Master configuration for a scan session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Native binary to scan; `None` skips the pass entirely.
    pub image_path: Option<PathBuf>,
    /// Mapped base address the image is viewed at.
    pub base_address: u64,
    /// Instruction set of the image.
    pub architecture: Architecture,
    /// Decoder back-end; `None` picks the default for `architecture`.
    pub backend: Option<BackendKind>,
    /// Maximum bytes decoded per method.
    pub window_len: usize,
    /// Emit every IP-relative 64-bit load as a `Global` xref without the
    /// class-identity check.
    pub skip_class_check: bool,
    /// End a method's linear scan at its first unconditional branch.
    pub stop_at_unconditional_branch: bool,
    /// Worker pool size; `None` uses available hardware parallelism.
    pub max_workers: Option<usize>,
    /// Consult and populate the scan cache.
    pub use_cache: bool,
    /// Regex overriding the default obfuscated-name heuristic.
    pub obfuscated_names_regex: Option<String>,
    /// RVA of the metadata-registration routine, for token correlation.
    pub metadata_init_rva: Option<u64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            image_path: None,
            base_address: DEFAULT_BASE_ADDRESS,
            architecture: Architecture::X86_64,
            backend: None,
            window_len: DEFAULT_WINDOW_LEN,
            skip_class_check: true,
            stop_at_unconditional_branch: true,
            max_workers: None,
            use_cache: true,
            obfuscated_names_regex: None,
            metadata_init_rva: None,
        }
    }
}

impl ScanConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_path = Some(path.into());
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject settings that cannot produce a meaningful scan.
    pub fn validate(&self) -> Result<()> {
        if self.window_len == 0 {
            return Err(ScanError::Config("window_len must be non-zero".into()));
        }
        if self.max_workers == Some(0) {
            return Err(ScanError::Config("max_workers must be non-zero".into()));
        }
        self.obfuscation_policy()?;
        if let Some(kind) = self.backend.filter(|k| !k.supports(self.architecture)) {
            return Err(ScanError::Config(format!(
                "backend {kind:?} cannot decode {}",
                self.architecture
            )));
        }
        Ok(())
    }

    /// Naming policy derived from `obfuscated_names_regex`.
    pub fn obfuscation_policy(&self) -> Result<ObfuscationPolicy> {
        match &self.obfuscated_names_regex {
            Some(re) => ObfuscationPolicy::with_pattern(re),
            None => Ok(ObfuscationPolicy::default()),
        }
    }
}
