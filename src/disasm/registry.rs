use serde::{Deserialize, Serialize};

use crate::core::decoder::{
    Architecture, DecodeError, DecodeResult, InstructionDecoder,
};
use crate::core::instruction::DecodedInstruction;

/// The decoder back-end chosen for a session.
pub enum Backend {
    Iced(super::iced::IcedDecoder),
    Cap(super::capstone::CapstoneDecoder),
}

impl InstructionDecoder for Backend {
    fn decode(&self, address: u64, bytes: &[u8]) -> DecodeResult<DecodedInstruction> {
        match self {
            Backend::Iced(d) => d.decode(address, bytes),
            Backend::Cap(d) => d.decode(address, bytes),
        }
    }

    fn max_instruction_length(&self) -> usize {
        match self {
            Backend::Iced(d) => d.max_instruction_length(),
            Backend::Cap(d) => d.max_instruction_length(),
        }
    }

    fn architecture(&self) -> Architecture {
        match self {
            Backend::Iced(d) => d.architecture(),
            Backend::Cap(d) => d.architecture(),
        }
    }

    fn name(&self) -> &str {
        match self {
            Backend::Iced(d) => d.name(),
            Backend::Cap(d) => d.name(),
        }
    }
}

/// Select a decoder backend for the given architecture.
pub fn for_arch(arch: Architecture) -> Option<Backend> {
    match arch {
        Architecture::X86_64 => Some(Backend::Iced(super::iced::IcedDecoder::new())),
        Architecture::Arm64 => super::capstone::CapstoneDecoder::new().map(Backend::Cap),
    }
}

/// Back-end pinned by `ScanConfig::backend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    Iced,
    Capstone,
}

impl BackendKind {
    pub fn supports(&self, arch: Architecture) -> bool {
        matches!(
            (self, arch),
            (BackendKind::Iced, Architecture::X86_64) | (BackendKind::Capstone, Architecture::Arm64)
        )
    }
}

/// Decoder for a session: `prefer` pins the back-end, `None` picks the
/// default for `arch`. A back-end that cannot decode `arch` is an error.
pub fn for_arch_with(
    arch: Architecture,
    prefer: Option<BackendKind>,
) -> Result<Backend, DecodeError> {
    match prefer {
        Some(kind) if !kind.supports(arch) => Err(DecodeError::UnsupportedArchitecture(arch)),
        _ => for_arch(arch).ok_or(DecodeError::UnsupportedArchitecture(arch)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_backend_by_arch() {
        let x86 = for_arch(Architecture::X86_64).expect("iced");
        assert_eq!(x86.name(), "iced-x86");
        assert_eq!(x86.architecture(), Architecture::X86_64);
        assert_eq!(x86.max_instruction_length(), 15);

        let arm = for_arch(Architecture::Arm64).expect("capstone");
        assert_eq!(arm.name(), "capstone");
        assert_eq!(arm.architecture(), Architecture::Arm64);
    }

    #[test]
    fn explicit_mismatch_is_rejected() {
        assert!(for_arch_with(Architecture::Arm64, Some(BackendKind::Iced)).is_err());
        assert!(for_arch_with(Architecture::X86_64, Some(BackendKind::Capstone)).is_err());
        assert!(for_arch_with(Architecture::X86_64, None).is_ok());
    }
}
