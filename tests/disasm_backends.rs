mod common;

use common::{method, ImageBuilder, BASE};
use xrefscan::analysis::cursor::InstructionCursor;
use xrefscan::analysis::ClassSentinels;
use xrefscan::core::decoder::InstructionDecoder;
use xrefscan::core::instruction::{BranchTarget, FlowKind};
use xrefscan::disasm::registry::{for_arch, for_arch_with, BackendKind};
use xrefscan::{
    Architecture, CodeAddress, MethodNode, ScanConfig, ScanError, ScanSession, XrefRecord,
};

const STRING_CLASS: u64 = BASE + 0x3C0;
const TYPE_CLASS: u64 = BASE + 0x3D0;

fn bl(from: u64, to: u64) -> [u8; 4] {
    let imm26 = (((to as i64 - from as i64) >> 2) as u32) & 0x03FF_FFFF;
    (0x9400_0000u32 | imm26).to_le_bytes()
}

/// `ldr x<rt>, <to>` (64-bit literal load).
fn ldr_x_literal(from: u64, to: u64, rt: u32) -> [u8; 4] {
    let imm19 = (((to as i64 - from as i64) >> 2) as u32) & 0x7_FFFF;
    (0x5800_0000u32 | (imm19 << 5) | rt).to_le_bytes()
}

/// `ldr w<rt>, <to>` (32-bit literal load).
fn ldr_w_literal(from: u64, to: u64, rt: u32) -> [u8; 4] {
    let imm19 = (((to as i64 - from as i64) >> 2) as u32) & 0x7_FFFF;
    (0x1800_0000u32 | (imm19 << 5) | rt).to_le_bytes()
}

/// `adr x<rd>, <to>`.
fn adr(from: u64, to: u64, rd: u32) -> [u8; 4] {
    let off = (to as i64 - from as i64) as u32;
    let immlo = off & 0x3;
    let immhi = (off >> 2) & 0x7_FFFF;
    (0x1000_0000u32 | (immlo << 29) | (immhi << 5) | rd).to_le_bytes()
}

const RET: [u8; 4] = [0xC0, 0x03, 0x5F, 0xD6];

fn arm64_config() -> ScanConfig {
    ScanConfig {
        architecture: Architecture::Arm64,
        backend: Some(BackendKind::Capstone),
        ..ScanConfig::default()
    }
}

/// A at 0x100 loads the literal at 0x200, which points at an object at
/// 0x300 whose class pointer is `class`.
fn arm64_literal_image(class: u64) -> ImageBuilder {
    let mut img = ImageBuilder::new(0x400);
    img.put(0x100, &ldr_x_literal(0x100, 0x200, 0));
    img.put(0x104, &RET);
    img.put_u64(0x200, BASE + 0x300);
    img.put_u64(0x300, class);
    img
}

fn arm64_filtered(img: &ImageBuilder) -> ScanSession {
    let cfg = ScanConfig {
        skip_class_check: false,
        ..arm64_config()
    };
    ScanSession::from_image(cfg, img.build())
        .unwrap()
        .with_sentinels(ClassSentinels::new(STRING_CLASS, TYPE_CLASS))
}

#[test]
fn x86_64_backend_classifies_flow() {
    let d = for_arch(Architecture::X86_64).expect("x86-64 backend");
    assert_eq!(d.architecture(), Architecture::X86_64);
    // call +0; jmp rax; ret
    let code = [0xE8, 0, 0, 0, 0, 0xFF, 0xE0, 0xC3];
    let kinds: Vec<_> = InstructionCursor::new(&d, &code, 0x1000)
        .follow_past_branches()
        .map(|i| i.unwrap())
        .map(|i| (i.flow, i.branch))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (FlowKind::Call, Some(BranchTarget::Direct(0x1005))),
            (FlowKind::UnconditionalBranch, Some(BranchTarget::Indirect)),
            (FlowKind::Return, None),
        ]
    );
}

#[test]
fn arm64_backend_resolves_bl() {
    let d = for_arch(Architecture::Arm64).expect("arm64 backend");
    let mut code = bl(0x1000, 0x2000).to_vec();
    code.extend_from_slice(&RET);
    let out: Vec<_> = InstructionCursor::new(&d, &code, 0x1000)
        .map(|i| i.unwrap())
        .collect();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].flow, FlowKind::Call);
    assert_eq!(out[0].direct_target(), Some(0x2000));
    assert_eq!(out[1].flow, FlowKind::Return);
}

#[test]
fn explicit_backend_selection() {
    assert!(for_arch_with(Architecture::X86_64, Some(BackendKind::Iced)).is_ok());
    assert!(for_arch_with(Architecture::Arm64, Some(BackendKind::Capstone)).is_ok());
    assert!(for_arch_with(Architecture::Arm64, Some(BackendKind::Iced)).is_err());
    assert!(for_arch_with(Architecture::X86_64, Some(BackendKind::Capstone)).is_err());

    let mismatched = ScanConfig {
        backend: Some(BackendKind::Iced),
        ..arm64_config()
    };
    assert!(matches!(
        ScanSession::from_image(mismatched, ImageBuilder::new(0x10).build()),
        Err(ScanError::Config(_))
    ));
}

#[test]
fn arm64_literal_load_of_sentinel_is_global() {
    let img = arm64_literal_image(STRING_CLASS);
    let records = arm64_filtered(&img).scan_method(&method("A", 0x100)).unwrap();
    assert_eq!(
        records,
        vec![XrefRecord::global(CodeAddress::rva(0x200), CodeAddress::rva(0x100))]
    );

    let img = arm64_literal_image(TYPE_CLASS);
    assert_eq!(arm64_filtered(&img).scan_method(&method("A", 0x100)).unwrap().len(), 1);
}

#[test]
fn arm64_literal_load_elsewhere_is_filtered() {
    let img = arm64_literal_image(BASE + 0x3E0);
    assert!(arm64_filtered(&img)
        .scan_method(&method("A", 0x100))
        .unwrap()
        .is_empty());

    // A 32-bit literal cannot hold a pointer.
    let mut img = arm64_literal_image(STRING_CLASS);
    img.put(0x100, &ldr_w_literal(0x100, 0x200, 0));
    assert!(arm64_filtered(&img)
        .scan_method(&method("A", 0x100))
        .unwrap()
        .is_empty());
}

#[test]
fn arm64_adr_is_an_address_of_target() {
    let mut img = ImageBuilder::new(0x400);
    img.put(0x100, &bl(0x100, 0x300));
    img.put(0x104, &adr(0x104, 0x380, 1));
    img.put(0x108, &RET);
    img.put(0x300, &RET);

    let session = ScanSession::from_image(arm64_config(), img.build()).unwrap();
    let a = method("A", 0x100);
    assert_eq!(session.call_and_indirect_targets(&a).unwrap(), vec![0x300, 0x380]);
    // Taking an address is not a load: only the call is an xref.
    let records = session.scan_method(&a).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].target, CodeAddress::rva(0x300));
}

#[test]
fn arm64_session_builds_the_same_graph() {
    let mut img = ImageBuilder::new(0x400);
    img.put(0x100, &bl(0x100, 0x200));
    img.put(0x104, &RET);
    img.put(0x200, &bl(0x200, 0x300));
    img.put(0x204, &RET);
    img.put(0x300, &RET);

    let cfg = ScanConfig {
        architecture: Architecture::Arm64,
        ..ScanConfig::default()
    };
    let session = ScanSession::from_image(cfg, img.build()).unwrap();
    let methods = vec![
        MethodNode::new("A", "Main", 0x100, 0x100),
        MethodNode::new("B", "\u{1}", 0x200, 0x200).obfuscated(true),
        MethodNode::new("C", "\u{2}", 0x300, 0x300).obfuscated(true),
    ];
    let outcome = session.run(&methods).unwrap();

    assert_eq!(outcome.graph.callees_of(0x100).collect::<Vec<_>>(), vec![0x200]);
    assert_eq!(outcome.graph.callees_of(0x200).collect::<Vec<_>>(), vec![0x300]);
    assert_eq!(outcome.live.len(), 3);
    assert_eq!(
        outcome.callers_of(0x300)[0].record.found_at,
        CodeAddress::rva(0x200)
    );
}
