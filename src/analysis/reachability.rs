//! Mark-and-propagate reachability over the `callees` map.
//!
//! Seeds are methods with a body whose name looks hand-written or which
//! are virtual. Everything reachable from a seed is live. The result is an
//! under-approximation: indirect calls, virtual dispatch and reflection are
//! invisible to the graph, so a dead candidate is a hint and nothing more.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::core::call_graph::CallGraph;
use crate::core::method::MethodNode;

/// Per-method verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Liveness {
    Live,
    DeadCandidate,
    /// No native code; never part of the graph.
    NoBody,
}

/// Addresses (RVAs) reached from any seed. Only grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSet {
    live: HashSet<u64>,
}

impl LiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `root` and everything it transitively calls. Stops at addresses
    /// already live, so cycles terminate.
    pub fn mark(&mut self, graph: &CallGraph, root: u64) {
        let mut stack = vec![root];
        while let Some(rva) = stack.pop() {
            if !self.live.insert(rva) {
                continue;
            }
            stack.extend(graph.callees_of(rva).filter(|t| !self.live.contains(t)));
        }
    }

    pub fn contains(&self, rva: u64) -> bool {
        self.live.contains(&rva)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.live.iter().copied()
    }

    pub fn verdict(&self, method: &MethodNode) -> Liveness {
        if !method.has_body() {
            Liveness::NoBody
        } else if self.contains(method.entry_rva) {
            Liveness::Live
        } else {
            Liveness::DeadCandidate
        }
    }
}

/// Classify a complete graph. Must only run after every method was merged.
pub fn classify(graph: &CallGraph, methods: &[MethodNode]) -> LiveSet {
    let mut live = LiveSet::new();
    for m in methods.iter().filter(|m| m.is_seed()) {
        live.mark(graph, m.entry_rva);
    }
    live
}
