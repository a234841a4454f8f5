use iced_x86::{
    Decoder, DecoderError, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind, Register,
};

use crate::core::decoder::{Architecture, DecodeError, DecodeResult, InstructionDecoder};
use crate::core::instruction::{
    BranchTarget, DataAccess, DecodedInstruction, FlowKind, PcRelativeOperand,
};

/// x86-64 decoder backed by iced-x86.
#[derive(Debug, Clone, Default)]
pub struct IcedDecoder;

impl IcedDecoder {
    const BITNESS: u32 = 64;

    pub fn new() -> Self {
        Self
    }

    fn register_name(reg: Register) -> Option<String> {
        if reg == Register::None {
            None
        } else {
            Some(format!("{:?}", reg).to_ascii_lowercase())
        }
    }

    fn branch_target(instr: &Instruction) -> BranchTarget {
        match instr.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                BranchTarget::Direct(instr.near_branch_target())
            }
            OpKind::FarBranch16 => BranchTarget::Direct(instr.far_branch16() as u64),
            OpKind::FarBranch32 => BranchTarget::Direct(instr.far_branch32() as u64),
            _ => BranchTarget::Indirect,
        }
    }

    fn flow(instr: &Instruction) -> (FlowKind, Option<BranchTarget>) {
        match instr.flow_control() {
            FlowControl::Next | FlowControl::XbeginXabortXend => (FlowKind::Fallthrough, None),
            FlowControl::ConditionalBranch => {
                (FlowKind::Fallthrough, Some(Self::branch_target(instr)))
            }
            FlowControl::UnconditionalBranch => (
                FlowKind::UnconditionalBranch,
                Some(Self::branch_target(instr)),
            ),
            FlowControl::IndirectBranch => {
                (FlowKind::UnconditionalBranch, Some(BranchTarget::Indirect))
            }
            FlowControl::Call => (FlowKind::Call, Some(Self::branch_target(instr))),
            FlowControl::IndirectCall => (FlowKind::Call, Some(BranchTarget::Indirect)),
            FlowControl::Return => (FlowKind::Return, None),
            FlowControl::Interrupt | FlowControl::Exception => (FlowKind::Trap, None),
        }
    }

    fn pc_relative(instr: &Instruction) -> Option<PcRelativeOperand> {
        if !instr.is_ip_rel_memory_operand() {
            return None;
        }
        let address = instr.ip_rel_memory_address();
        let width = instr.memory_size().size() as u8;
        match instr.mnemonic() {
            Mnemonic::Mov if instr.op_count() == 2 && instr.op1_kind() == OpKind::Memory => {
                Some(PcRelativeOperand {
                    access: DataAccess::Load,
                    address,
                    width,
                    register: Self::register_name(instr.op0_register()),
                })
            }
            Mnemonic::Mov if instr.op0_kind() == OpKind::Memory => Some(PcRelativeOperand {
                access: DataAccess::Store,
                address,
                width,
                register: None,
            }),
            Mnemonic::Lea => Some(PcRelativeOperand {
                access: DataAccess::AddressOf,
                address,
                width: 0,
                register: Self::register_name(instr.op0_register()),
            }),
            _ => None,
        }
    }
}

impl InstructionDecoder for IcedDecoder {
    fn decode(&self, address: u64, bytes: &[u8]) -> DecodeResult<DecodedInstruction> {
        if bytes.is_empty() {
            return Err(DecodeError::InsufficientBytes);
        }
        let mut decoder = Decoder::with_ip(Self::BITNESS, bytes, address, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(match decoder.last_error() {
                DecoderError::NoMoreBytes => DecodeError::InsufficientBytes,
                _ => DecodeError::InvalidInstruction { address },
            });
        }

        let (flow, branch) = Self::flow(&instr);
        Ok(DecodedInstruction {
            address,
            length: instr.len() as u16,
            mnemonic: format!("{:?}", instr.mnemonic()).to_ascii_lowercase(),
            flow,
            branch,
            pc_relative: Self::pc_relative(&instr),
        })
    }

    fn max_instruction_length(&self) -> usize {
        15
    }

    fn architecture(&self) -> Architecture {
        Architecture::X86_64
    }

    fn name(&self) -> &str {
        "iced-x86"
    }
}
