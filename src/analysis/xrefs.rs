//! Cross-reference extraction for one method body.
//!
//! [`XrefExtractor`] sits on top of an [`InstructionCursor`] and turns the
//! instruction stream into [`XrefRecord`]s, in instruction order. Direct call
//! and jump targets become `Method` records. IP-relative pointer-width loads
//! become `Global` records when they pass the class-identity filter.
//!
//! All addresses produced here are in mapped-pointer space; callers convert
//! them to RVAs with [`XrefRecord::relative_to_base`].

use tracing::trace;

use crate::analysis::cursor::InstructionCursor;
use crate::analysis::memory::MemoryView;
use crate::core::address::{AddressKind, CodeAddress};
use crate::core::decoder::{DecodeError, DecodeResult, InstructionDecoder};
use crate::core::instruction::{DataAccess, DecodedInstruction, FlowKind};
use crate::core::reference::XrefRecord;
use crate::error::Result;

/// Mapped addresses of the managed class-identity objects a `Global` load
/// must resolve to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassSentinels {
    /// Class of managed strings.
    pub string_class: Option<u64>,
    /// Class of runtime type handles.
    pub type_class: Option<u64>,
}

impl ClassSentinels {
    pub fn new(string_class: u64, type_class: u64) -> Self {
        Self {
            string_class: Some(string_class).filter(|&a| a != 0),
            type_class: Some(type_class).filter(|&a| a != 0),
        }
    }

    /// At least one sentinel was resolved.
    pub fn is_resolved(&self) -> bool {
        self.string_class.is_some() || self.type_class.is_some()
    }

    pub fn matches(&self, class: u64) -> bool {
        class != 0 && (self.string_class == Some(class) || self.type_class == Some(class))
    }
}

/// Decides whether an IP-relative data load is worth a `Global` record.
#[derive(Clone, Copy)]
pub enum ClassFilter<'a> {
    /// Every 64-bit IP-relative load is emitted.
    Skip,
    /// Emit only loads whose target, dereferenced twice, is a sentinel class.
    Check {
        memory: &'a (dyn MemoryView + Sync),
        sentinels: ClassSentinels,
    },
}

impl<'a> ClassFilter<'a> {
    pub fn check(memory: &'a (dyn MemoryView + Sync), sentinels: ClassSentinels) -> Self {
        ClassFilter::Check { memory, sentinels }
    }

    /// `target` holds a pointer to an object whose first field is a class
    /// pointer; accept when that class is a sentinel. Unreadable memory and
    /// missing sentinels reject.
    pub fn accepts(&self, target: u64) -> bool {
        match self {
            ClassFilter::Skip => true,
            ClassFilter::Check { memory, sentinels } => {
                if !sentinels.is_resolved() {
                    return false;
                }
                let class = memory
                    .read_pointer(target)
                    .and_then(|object| memory.read_pointer(object));
                matches!(class, Ok(class) if sentinels.matches(class))
            }
        }
    }
}

impl std::fmt::Debug for ClassFilter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassFilter::Skip => f.write_str("ClassFilter::Skip"),
            ClassFilter::Check { sentinels, .. } => f
                .debug_struct("ClassFilter::Check")
                .field("sentinels", sentinels)
                .finish(),
        }
    }
}

/// Lazy sequence of xrefs for one method window.
///
/// Yields `Err` at most once, for the first malformed instruction, and ends
/// there; a caller collecting into `Result<Vec<_>, _>` therefore fails the
/// whole method, which is the intended per-method policy.
pub struct XrefExtractor<'a, D: InstructionDecoder + ?Sized> {
    cursor: InstructionCursor<'a, D>,
    filter: ClassFilter<'a>,
    pointer_width: u8,
}

impl<'a, D: InstructionDecoder + ?Sized> XrefExtractor<'a, D> {
    /// `start` is the mapped address of `window[0]`. A null start means the
    /// method has no native body and produces nothing.
    pub fn new(
        decoder: &'a D,
        window: &'a [u8],
        start: CodeAddress,
        filter: ClassFilter<'a>,
    ) -> Result<Self> {
        let start = start.expect_kind(AddressKind::Mapped)?;
        let window = if start == 0 { &[][..] } else { window };
        Ok(Self {
            cursor: InstructionCursor::new(decoder, window, start),
            filter,
            pointer_width: decoder.architecture().pointer_size(),
        })
    }

    pub fn stop_at_unconditional_branch(mut self, stop: bool) -> Self {
        self.cursor = self.cursor.stop_at_unconditional_branch(stop);
        self
    }

    fn record_for(&self, ins: &DecodedInstruction) -> Option<XrefRecord> {
        let found_at = CodeAddress::mapped(ins.address);
        match ins.flow {
            FlowKind::Call | FlowKind::UnconditionalBranch => ins
                .direct_target()
                .map(|t| XrefRecord::method(CodeAddress::mapped(t), found_at)),
            _ => {
                let op = ins.pc_relative_load(self.pointer_width)?;
                if op.address == 0 || !self.filter.accepts(op.address) {
                    return None;
                }
                Some(XrefRecord::global(CodeAddress::mapped(op.address), found_at))
            }
        }
    }
}

impl<'a, D: InstructionDecoder + ?Sized> Iterator for XrefExtractor<'a, D> {
    type Item = DecodeResult<XrefRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let ins = match self.cursor.next()? {
                Ok(ins) => ins,
                Err(e) => return Some(Err(e)),
            };
            if let Some(record) = self.record_for(&ins) {
                trace!(%record, "xref");
                return Some(Ok(record));
            }
        }
    }
}

/// Decode `window` into a list of direct targets accepted by `pick`, ending
/// quietly at the first malformed instruction.
fn collect_targets<D, F>(cursor: InstructionCursor<'_, D>, mut pick: F) -> Vec<u64>
where
    D: InstructionDecoder + ?Sized,
    F: FnMut(&DecodedInstruction) -> Option<u64>,
{
    cursor
        .map_while(|item| item.ok())
        .filter_map(|ins| pick(&ins))
        .filter(|&t| t != 0)
        .collect()
}

/// Targets of calls and unconditional jumps, ending at the first
/// unconditional jump. Indirect targets are left out.
pub fn jump_targets<D: InstructionDecoder + ?Sized>(
    decoder: &D,
    window: &[u8],
    start: u64,
) -> Vec<u64> {
    let cursor = InstructionCursor::new(decoder, window, start);
    collect_targets(cursor, |ins| match ins.flow {
        FlowKind::Call | FlowKind::UnconditionalBranch => ins.direct_target(),
        _ => None,
    })
}

/// Call and jump targets plus addresses taken IP-relatively (`lea`, `adr`),
/// decoding linearly past unconditional jumps.
pub fn call_and_indirect_targets<D: InstructionDecoder + ?Sized>(
    decoder: &D,
    window: &[u8],
    start: u64,
) -> Vec<u64> {
    let cursor = InstructionCursor::new(decoder, window, start).follow_past_branches();
    collect_targets(cursor, |ins| match ins.flow {
        FlowKind::Call | FlowKind::UnconditionalBranch => ins.direct_target(),
        _ => ins
            .pc_relative
            .as_ref()
            .filter(|op| op.access == DataAccess::AddressOf)
            .map(|op| op.address),
    })
}

/// Run an extractor to completion. A decode failure anywhere fails the method.
pub fn scan_window<D: InstructionDecoder + ?Sized>(
    decoder: &D,
    window: &[u8],
    start: CodeAddress,
    filter: ClassFilter<'_>,
    stop_at_unconditional_branch: bool,
) -> Result<std::result::Result<Vec<XrefRecord>, DecodeError>> {
    Ok(XrefExtractor::new(decoder, window, start, filter)?
        .stop_at_unconditional_branch(stop_at_unconditional_branch)
        .collect())
}
