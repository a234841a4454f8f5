use capstone::arch::arm64::Arm64OperandType;
use capstone::prelude::*;
use capstone::{Arch, Capstone, Endian, Mode, NO_EXTRA_MODE};

use crate::core::decoder::{Architecture, DecodeError, DecodeResult, InstructionDecoder};
use crate::core::instruction::{
    BranchTarget, DataAccess, DecodedInstruction, FlowKind, PcRelativeOperand,
};

/// ARM64 decoder backed by capstone. Not `Sync`; build one per worker.
pub struct CapstoneDecoder {
    cs: Capstone,
}

const INSN_LEN: usize = 4;

impl CapstoneDecoder {
    pub fn new() -> Option<Self> {
        let mut cs =
            Capstone::new_raw(Arch::ARM64, Mode::Arm, NO_EXTRA_MODE, Some(Endian::Little)).ok()?;
        // Details carry the resolved branch and literal addresses
        let _ = cs.set_detail(true);
        Some(Self { cs })
    }

    fn classify(mnemonic: &str, imm: Option<i64>) -> (FlowKind, Option<BranchTarget>) {
        let direct = imm
            .map(|v| BranchTarget::Direct(v as u64))
            .unwrap_or(BranchTarget::Indirect);
        match mnemonic {
            "ret" | "retaa" | "retab" | "eret" | "eretaa" | "eretab" | "drps" => {
                (FlowKind::Return, None)
            }
            "brk" | "svc" | "hvc" | "smc" | "hlt" | "udf" => (FlowKind::Trap, None),
            "bl" => (FlowKind::Call, Some(direct)),
            m if m.starts_with("blr") => (FlowKind::Call, Some(BranchTarget::Indirect)),
            "b" => (FlowKind::UnconditionalBranch, Some(direct)),
            m if m.starts_with("br") => {
                (FlowKind::UnconditionalBranch, Some(BranchTarget::Indirect))
            }
            m if m.starts_with("b.") || matches!(m, "cbz" | "cbnz" | "tbz" | "tbnz") => {
                (FlowKind::Fallthrough, Some(direct))
            }
            _ => (FlowKind::Fallthrough, None),
        }
    }

    fn pc_relative(
        mnemonic: &str,
        imm: Option<i64>,
        register: Option<String>,
    ) -> Option<PcRelativeOperand> {
        let address = imm? as u64;
        match mnemonic {
            "ldr" | "ldrsw" => {
                let width = match register.as_deref() {
                    Some(r) if r.starts_with('x') && mnemonic == "ldr" => 8,
                    _ => 4,
                };
                Some(PcRelativeOperand {
                    access: DataAccess::Load,
                    address,
                    width,
                    register,
                })
            }
            "adr" | "adrp" => Some(PcRelativeOperand {
                access: DataAccess::AddressOf,
                address,
                width: 0,
                register,
            }),
            _ => None,
        }
    }
}

impl InstructionDecoder for CapstoneDecoder {
    fn decode(&self, address: u64, bytes: &[u8]) -> DecodeResult<DecodedInstruction> {
        if bytes.len() < INSN_LEN {
            return Err(DecodeError::InsufficientBytes);
        }
        let insns = self
            .cs
            .disasm_count(&bytes[..INSN_LEN], address, 1)
            .map_err(|e| DecodeError::Backend(e.to_string()))?;
        let insn = insns
            .iter()
            .next()
            .ok_or(DecodeError::InvalidInstruction { address })?;
        let mnemonic = insn.mnemonic().unwrap_or("").to_ascii_lowercase();

        let mut imm: Option<i64> = None;
        let mut first_reg: Option<String> = None;
        let mut has_memory = false;
        if let Ok(detail) = self.cs.insn_detail(&insn) {
            if let Some(ad) = detail.arch_detail().arm64() {
                for op in ad.operands() {
                    match op.op_type {
                        Arm64OperandType::Reg(r) if first_reg.is_none() => {
                            first_reg = self.cs.reg_name(r).map(|n| n.to_ascii_lowercase());
                        }
                        Arm64OperandType::Imm(i) => imm = Some(i),
                        Arm64OperandType::Mem(_) => has_memory = true,
                        _ => {}
                    }
                }
            }
        }

        let (flow, branch) = Self::classify(&mnemonic, imm);
        // Register-based addressing: only literal forms are PC-relative
        let pc_relative = if branch.is_none() && !has_memory {
            Self::pc_relative(&mnemonic, imm, first_reg)
        } else {
            None
        };
        Ok(DecodedInstruction {
            address,
            length: insn.bytes().len() as u16,
            mnemonic,
            flow,
            branch,
            pc_relative,
        })
    }

    fn max_instruction_length(&self) -> usize {
        INSN_LEN
    }

    fn architecture(&self) -> Architecture {
        Architecture::Arm64
    }

    fn name(&self) -> &str {
        "capstone"
    }
}
