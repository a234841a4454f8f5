//! CallGraph: the two adjacency maps recovered by a scan.
//!
//! `callers` answers "which instructions reference this address" and
//! `callees` answers "what does this method call". Both are keyed by RVA and
//! are only ever written together through [`CallGraph::insert`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::core::address::{AddressKind, CodeAddress};
use crate::core::reference::{XrefKind, XrefRecord};
use crate::error::{Result, ScanError};

/// One reference into a target: the method it came from plus the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSite {
    /// Entry RVA of the calling method
    pub caller: u64,
    /// The RVA-space record; `record.target` is the callee
    pub record: XrefRecord,
}

/// Call graph keyed by RVA.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallGraph {
    callers: HashMap<u64, Vec<CallSite>>,
    callees: HashMap<u64, BTreeSet<u64>>,
}

impl CallGraph {
    /// Create a new empty call graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a method-kind xref found while scanning `caller`.
    /// Inserts into both maps so they never disagree.
    pub fn insert(&mut self, caller: CodeAddress, record: XrefRecord) -> Result<()> {
        let caller = caller.expect_kind(AddressKind::Rva)?;
        if record.kind != XrefKind::Method {
            return Err(ScanError::Internal(format!(
                "only method xrefs form call edges, got {record}"
            )));
        }
        let target = record.target.expect_kind(AddressKind::Rva)?;
        self.callers
            .entry(target)
            .or_default()
            .push(CallSite { caller, record });
        self.callees.entry(caller).or_default().insert(target);
        Ok(())
    }

    /// Every call site that targets `rva`. Order is unspecified.
    pub fn callers_of(&self, rva: u64) -> &[CallSite] {
        self.callers.get(&rva).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Distinct targets called from the method at `rva`.
    pub fn callees_of(&self, rva: u64) -> impl Iterator<Item = u64> + '_ {
        self.callees.get(&rva).into_iter().flatten().copied()
    }

    pub fn has_callees(&self, rva: u64) -> bool {
        self.callees.get(&rva).is_some_and(|s| !s.is_empty())
    }

    /// Number of distinct caller→callee edges.
    pub fn edge_count(&self) -> usize {
        self.callees.values().map(|s| s.len()).sum()
    }

    /// Number of call sites (an edge can have several).
    pub fn call_site_count(&self) -> usize {
        self.callers.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.callees.is_empty()
    }

    /// Read-only view of the callers map for downstream passes.
    pub fn callers(&self) -> &HashMap<u64, Vec<CallSite>> {
        &self.callers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(from: u64, to: u64, at: u64) -> (CodeAddress, XrefRecord) {
        (
            CodeAddress::rva(from),
            XrefRecord::method(CodeAddress::rva(to), CodeAddress::rva(at)),
        )
    }

    #[test]
    fn insert_mirrors_both_maps() {
        let mut cg = CallGraph::new();
        let (caller, rec) = call(0x100, 0x200, 0x104);
        cg.insert(caller, rec).unwrap();

        assert_eq!(cg.callers_of(0x200).len(), 1);
        assert_eq!(cg.callers_of(0x200)[0].caller, 0x100);
        assert_eq!(cg.callers_of(0x200)[0].record, rec);
        assert_eq!(cg.callees_of(0x100).collect::<Vec<_>>(), vec![0x200]);
        assert!(cg.callers_of(0x100).is_empty());
        assert_eq!(cg.edge_count(), 1);
        assert_eq!(cg.callers().keys().copied().collect::<Vec<_>>(), vec![0x200]);
    }

    #[test]
    fn repeated_calls_keep_sites_but_one_edge() {
        let mut cg = CallGraph::new();
        for at in [0x104, 0x110, 0x120] {
            let (caller, rec) = call(0x100, 0x200, at);
            cg.insert(caller, rec).unwrap();
        }
        assert_eq!(cg.edge_count(), 1);
        assert_eq!(cg.call_site_count(), 3);
    }

    #[test]
    fn rejects_global_records() {
        let mut cg = CallGraph::new();
        let rec = XrefRecord::global(CodeAddress::rva(0x900), CodeAddress::rva(0x104));
        assert!(cg.insert(CodeAddress::rva(0x100), rec).is_err());
        assert!(cg.is_empty());
    }
}
